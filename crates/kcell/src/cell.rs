//! Code cells: regions of a buffer bound to one kernel.
//!
//! A [`Cell`] is identified by its two anchors, so it stays a stable map key
//! while the text around it is edited. Geometry questions are answered on a
//! resolved [`Span`].

use std::hash::{Hash, Hasher};

use crate::error::CellError;
use crate::position::{Anchor, BufferId, Position, TextHost};

/// Snapshot of a cell's extent. `begin` is inclusive, `end` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub begin: Position,
    pub end: Position,
}

impl Span {
    pub fn buffer(&self) -> BufferId {
        self.begin.buffer
    }

    pub fn contains(&self, pos: &Position) -> bool {
        self.begin.buffer == pos.buffer && self.begin <= *pos && *pos < self.end
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.begin.buffer == other.begin.buffer
            && self.begin < other.end
            && other.begin < self.end
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.begin
    }

    /// Text covered by the span, lines joined with `\n`.
    pub fn text(&self, lines: &[String]) -> String {
        let first = self.begin.line;
        let last = self.end.line;
        if first >= lines.len() || last < first {
            return String::new();
        }
        let last = last.min(lines.len() - 1);
        if first == last {
            let line = &lines[first];
            return slice_columns(line, self.begin.column, self.end.column).to_string();
        }
        let mut parts = Vec::with_capacity(last - first + 1);
        parts.push(slice_columns(&lines[first], self.begin.column, usize::MAX));
        for line in &lines[first + 1..last] {
            parts.push(line.as_str());
        }
        parts.push(slice_columns(&lines[last], 0, self.end.column));
        parts.join("\n")
    }
}

/// Byte-column slice clamped to the line and to char boundaries.
fn slice_columns(line: &str, start: usize, end: usize) -> &str {
    let clamp = |mut idx: usize| {
        idx = idx.min(line.len());
        while !line.is_char_boundary(idx) {
            idx -= 1;
        }
        idx
    };
    let (start, end) = (clamp(start), clamp(end));
    if start >= end {
        ""
    } else {
        &line[start..end]
    }
}

/// A region of source text owned by one kernel coordinator.
#[derive(Debug, Clone)]
pub struct Cell {
    pub begin: Anchor,
    pub end: Anchor,
    pub kernel_id: String,
}

impl Cell {
    pub fn new(begin: Anchor, end: Anchor, kernel_id: impl Into<String>) -> Result<Self, CellError> {
        if begin.buffer != end.buffer {
            return Err(CellError::BufferMismatch {
                begin: begin.buffer,
                end: end.buffer,
            });
        }
        Ok(Self {
            begin,
            end,
            kernel_id: kernel_id.into(),
        })
    }

    pub fn buffer(&self) -> BufferId {
        self.begin.buffer
    }

    /// Resolve the anchors. A cell whose anchors are gone has no span.
    pub fn span<T: TextHost + ?Sized>(&self, text: &T) -> Option<Span> {
        Some(Span {
            begin: text.anchor_position(&self.begin)?,
            end: text.anchor_position(&self.end)?,
        })
    }

    pub fn contains<T: TextHost + ?Sized>(&self, text: &T, pos: &Position) -> bool {
        self.span(text).is_some_and(|span| span.contains(pos))
    }

    pub fn overlaps<T: TextHost + ?Sized>(&self, text: &T, other: &Span) -> bool {
        self.span(text).is_some_and(|span| span.overlaps(other))
    }

    pub fn is_empty<T: TextHost + ?Sized>(&self, text: &T) -> bool {
        self.span(text).is_none_or(|span| span.is_empty())
    }

    pub fn text<T: TextHost + ?Sized>(&self, text: &T) -> String {
        match self.span(text) {
            Some(span) => span.text(&text.buffer_lines(self.buffer())),
            None => String::new(),
        }
    }

    /// Release the host anchors. The cell must not be resolved afterwards.
    pub fn dispose<T: TextHost + ?Sized>(&self, text: &mut T) {
        text.dispose_anchor(&self.begin);
        text.dispose_anchor(&self.end);
    }
}

impl PartialEq for Cell {
    fn eq(&self, other: &Self) -> bool {
        self.begin == other.begin && self.end == other.end
    }
}

impl Eq for Cell {}

impl Hash for Cell {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.begin.hash(state);
        self.end.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::AnchorId;

    fn span(b: (usize, usize), e: (usize, usize)) -> Span {
        Span {
            begin: Position::new(BufferId(1), b.0, b.1),
            end: Position::new(BufferId(1), e.0, e.1),
        }
    }

    #[test]
    fn test_contains_is_half_open() {
        let s = span((1, 0), (3, 4));
        assert!(s.contains(&Position::new(BufferId(1), 1, 0)));
        assert!(s.contains(&Position::new(BufferId(1), 3, 3)));
        assert!(!s.contains(&Position::new(BufferId(1), 3, 4)));
        assert!(!s.contains(&Position::new(BufferId(1), 0, 9)));
        assert!(!s.contains(&Position::new(BufferId(2), 2, 0)));
    }

    #[test]
    fn test_overlaps() {
        let a = span((0, 0), (2, 0));
        let b = span((1, 5), (4, 0));
        let c = span((2, 0), (3, 0));
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c));
        assert!(b.overlaps(&c));
    }

    #[test]
    fn test_overlap_requires_same_buffer() {
        let a = span((0, 0), (2, 0));
        let mut b = span((0, 0), (2, 0));
        b.begin.buffer = BufferId(2);
        b.end.buffer = BufferId(2);
        assert!(!a.overlaps(&b));
    }

    #[test]
    fn test_empty_span() {
        assert!(span((0, 0), (0, 0)).is_empty());
        assert!(span((2, 0), (1, 4)).is_empty());
        assert!(!span((0, 0), (0, 1)).is_empty());
    }

    #[test]
    fn test_span_text_single_and_multi_line() {
        let lines: Vec<String> = ["x = 1", "y = 2", "print(x + y)"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(span((0, 4), (0, 5)).text(&lines), "1");
        assert_eq!(span((0, 0), (2, 12)).text(&lines), "x = 1\ny = 2\nprint(x + y)");
        assert_eq!(span((1, 4), (2, 5)).text(&lines), "2\nprint");
        assert_eq!(span((1, 0), (1, 100)).text(&lines), "y = 2");
    }

    #[test]
    fn test_cell_rejects_mismatched_buffers() {
        let begin = Anchor {
            buffer: BufferId(1),
            id: AnchorId(1),
        };
        let end = Anchor {
            buffer: BufferId(2),
            id: AnchorId(2),
        };
        let err = Cell::new(begin, end, "python3").unwrap_err();
        assert_eq!(
            err,
            CellError::BufferMismatch {
                begin: BufferId(1),
                end: BufferId(2)
            }
        );
    }

    #[test]
    fn test_cell_identity_ignores_kernel_label() {
        let begin = Anchor {
            buffer: BufferId(1),
            id: AnchorId(1),
        };
        let end = Anchor {
            buffer: BufferId(1),
            id: AnchorId(2),
        };
        let a = Cell::new(begin, end, "python3").unwrap();
        let b = Cell::new(begin, end, "other").unwrap();
        assert_eq!(a, b);
    }
}
