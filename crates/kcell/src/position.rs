//! Positions in editor buffers and the text-anchor capability the host provides.
//!
//! A [`Position`] is a static snapshot `(buffer, line, column)`. An [`Anchor`] is
//! a handle to a host-side mark that follows edits; reading it yields the
//! current [`Position`]. Lines and columns are zero-based.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Host identifier of an editor buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BufferId(pub u32);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Host identifier of a text anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AnchorId(pub u64);

/// Which way an anchor moves when text is inserted exactly at its position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Gravity {
    /// Stays before the inserted text.
    #[default]
    Left,
    /// Moves past the inserted text.
    Right,
}

/// A location in a buffer.
///
/// Positions in different buffers are unordered: `partial_cmp` returns `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Position {
    pub buffer: BufferId,
    pub line: usize,
    pub column: usize,
}

impl Position {
    pub fn new(buffer: BufferId, line: usize, column: usize) -> Self {
        Self {
            buffer,
            line,
            column,
        }
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.buffer != other.buffer {
            return None;
        }
        Some((self.line, self.column).cmp(&(other.line, other.column)))
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.buffer, self.line + 1, self.column)
    }
}

/// A dynamic position: a host anchor living in a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Anchor {
    pub buffer: BufferId,
    pub id: AnchorId,
}

/// Text capability of the host editor.
///
/// Anchors follow edits made to their buffer. Creating an anchor past the end
/// of a line or buffer clamps it to the nearest valid location.
pub trait TextHost {
    fn create_anchor(
        &mut self,
        buffer: BufferId,
        line: usize,
        column: usize,
        gravity: Gravity,
    ) -> Anchor;

    /// Current location of an anchor, `None` once it was disposed.
    fn anchor_position(&self, anchor: &Anchor) -> Option<Position>;

    fn dispose_anchor(&mut self, anchor: &Anchor);

    /// All lines of a buffer, without trailing newlines.
    fn buffer_lines(&self, buffer: BufferId) -> Vec<String>;

    /// File name backing the buffer, `None` for scratch buffers.
    fn buffer_name(&self, buffer: BufferId) -> Option<String>;

    fn current_buffer(&self) -> BufferId;

    fn cursor(&self) -> Position;

    fn set_cursor(&mut self, position: Position);
}
