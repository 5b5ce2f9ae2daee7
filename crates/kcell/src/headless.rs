//! In-memory host for running without an editor.
//!
//! Buffers are plain line vectors. Anchors are translated through every edit
//! made with [`HeadlessHost::insert_text`] and [`HeadlessHost::delete_text`],
//! and all presentation calls are recorded so they can be inspected.

use std::collections::{BTreeMap, HashMap};

use crate::position::{Anchor, AnchorId, BufferId, Gravity, Position, TextHost};
use crate::surface::{
    HighlightRange, Level, PanelId, PanelSpec, Surface, VirtualLinesId, WindowGeometry,
};

#[derive(Debug, Clone)]
struct Buffer {
    name: Option<String>,
    lines: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
struct Mark {
    buffer: BufferId,
    line: usize,
    column: usize,
    gravity: Gravity,
}

/// A floating panel as last drawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanelState {
    pub spec: PanelSpec,
    pub lines: Vec<String>,
    pub focused: bool,
}

/// Virtual lines as last drawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualLines {
    pub buffer: BufferId,
    pub line: usize,
    pub lines: Vec<String>,
}

/// A recorded highlight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Highlight {
    pub owner: String,
    pub range: HighlightRange,
    pub group: String,
}

pub struct HeadlessHost {
    buffers: BTreeMap<BufferId, Buffer>,
    marks: HashMap<AnchorId, Mark>,
    next_buffer: u32,
    next_id: u64,
    current: BufferId,
    cursor: Position,
    window: WindowGeometry,
    panels: BTreeMap<u64, PanelState>,
    virtual_lines: BTreeMap<u64, VirtualLines>,
    highlights: BTreeMap<BufferId, Vec<Highlight>>,
    notifications: Vec<(Level, String)>,
    prompts: Vec<(String, String)>,
    clipboard: Option<String>,
}

impl Default for HeadlessHost {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessHost {
    pub fn new() -> Self {
        Self {
            buffers: BTreeMap::new(),
            marks: HashMap::new(),
            next_buffer: 1,
            next_id: 1,
            current: BufferId(0),
            cursor: Position::new(BufferId(0), 0, 0),
            window: WindowGeometry {
                width: 100,
                height: 40,
                text_offset: 0,
                top_line: 0,
            },
            panels: BTreeMap::new(),
            virtual_lines: BTreeMap::new(),
            highlights: BTreeMap::new(),
            notifications: Vec::new(),
            prompts: Vec::new(),
            clipboard: None,
        }
    }

    /// Add a buffer holding `text` and make it current.
    pub fn open_buffer(&mut self, name: Option<&str>, text: &str) -> BufferId {
        let id = BufferId(self.next_buffer);
        self.next_buffer += 1;
        let mut lines: Vec<String> = text.split('\n').map(str::to_string).collect();
        if text.ends_with('\n') {
            lines.pop();
        }
        if lines.is_empty() {
            lines.push(String::new());
        }
        self.buffers.insert(
            id,
            Buffer {
                name: name.map(str::to_string),
                lines,
            },
        );
        self.set_current_buffer(id);
        id
    }

    pub fn set_current_buffer(&mut self, buffer: BufferId) {
        self.current = buffer;
        self.cursor = Position::new(buffer, 0, 0);
    }

    pub fn close_buffer(&mut self, buffer: BufferId) {
        self.buffers.remove(&buffer);
        self.marks.retain(|_, mark| mark.buffer != buffer);
        self.highlights.remove(&buffer);
    }

    pub fn set_window(&mut self, window: WindowGeometry) {
        self.window = window;
    }

    /// Insert `text` at a position, moving anchors the way the editor would.
    pub fn insert_text(&mut self, buffer: BufferId, line: usize, column: usize, text: &str) {
        let Some(buf) = self.buffers.get_mut(&buffer) else {
            return;
        };
        let line = line.min(buf.lines.len() - 1);
        let column = clamp_column(&buf.lines[line], column);

        let tail = buf.lines[line].split_off(column);
        let mut pieces = text.split('\n');
        if let Some(first) = pieces.next() {
            buf.lines[line].push_str(first);
        }
        let rest: Vec<String> = pieces.map(str::to_string).collect();
        let added = rest.len();
        let last_len = if added == 0 {
            column + text.len()
        } else {
            rest[added - 1].len()
        };
        for (i, piece) in rest.into_iter().enumerate() {
            buf.lines.insert(line + 1 + i, piece);
        }
        buf.lines[line + added].push_str(&tail);

        for mark in self.marks.values_mut().filter(|m| m.buffer == buffer) {
            let before = (mark.line, mark.column) < (line, column);
            let stays = (mark.line, mark.column) == (line, column) && mark.gravity == Gravity::Left;
            if before || stays {
                continue;
            }
            if mark.line == line {
                mark.column = last_len + (mark.column - column);
            }
            mark.line += added;
        }
    }

    /// Delete the text between two positions (end exclusive).
    pub fn delete_text(&mut self, buffer: BufferId, begin: (usize, usize), end: (usize, usize)) {
        let Some(buf) = self.buffers.get_mut(&buffer) else {
            return;
        };
        if end <= begin {
            return;
        }
        let last = buf.lines.len() - 1;
        let (bl, el) = (begin.0.min(last), end.0.min(last));
        let bc = clamp_column(&buf.lines[bl], begin.1);
        let ec = clamp_column(&buf.lines[el], end.1);

        let tail = buf.lines[el][ec..].to_string();
        buf.lines[bl].truncate(bc);
        buf.lines[bl].push_str(&tail);
        buf.lines.drain(bl + 1..=el);

        for mark in self.marks.values_mut().filter(|m| m.buffer == buffer) {
            let pos = (mark.line, mark.column);
            if pos <= (bl, bc) {
                continue;
            }
            if pos < (el, ec) {
                mark.line = bl;
                mark.column = bc;
            } else if mark.line == el {
                mark.line = bl;
                mark.column = bc + (mark.column - ec);
            } else {
                mark.line -= el - bl;
            }
        }
    }

    pub fn notifications(&self) -> &[(Level, String)] {
        &self.notifications
    }

    pub fn clear_notifications(&mut self) {
        self.notifications.clear();
    }

    pub fn prompts(&self) -> &[(String, String)] {
        &self.prompts
    }

    pub fn clipboard(&self) -> Option<&str> {
        self.clipboard.as_deref()
    }

    pub fn panels(&self) -> impl Iterator<Item = &PanelState> {
        self.panels.values()
    }

    pub fn virtual_lines(&self, buffer: BufferId) -> Vec<&VirtualLines> {
        self.virtual_lines
            .values()
            .filter(|v| v.buffer == buffer)
            .collect()
    }

    pub fn highlights(&self, buffer: BufferId) -> &[Highlight] {
        self.highlights.get(&buffer).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn live_anchors(&self) -> usize {
        self.marks.len()
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

fn clamp_column(line: &str, column: usize) -> usize {
    let mut column = column.min(line.len());
    while !line.is_char_boundary(column) {
        column -= 1;
    }
    column
}

impl TextHost for HeadlessHost {
    fn create_anchor(
        &mut self,
        buffer: BufferId,
        line: usize,
        column: usize,
        gravity: Gravity,
    ) -> Anchor {
        let (line, column) = match self.buffers.get(&buffer) {
            Some(buf) => {
                let last = buf.lines.len() - 1;
                if line > last {
                    (last, buf.lines[last].len())
                } else {
                    (line, clamp_column(&buf.lines[line], column))
                }
            }
            None => (line, column),
        };
        let id = AnchorId(self.next_id());
        self.marks.insert(
            id,
            Mark {
                buffer,
                line,
                column,
                gravity,
            },
        );
        Anchor { buffer, id }
    }

    fn anchor_position(&self, anchor: &Anchor) -> Option<Position> {
        self.marks
            .get(&anchor.id)
            .map(|mark| Position::new(mark.buffer, mark.line, mark.column))
    }

    fn dispose_anchor(&mut self, anchor: &Anchor) {
        self.marks.remove(&anchor.id);
    }

    fn buffer_lines(&self, buffer: BufferId) -> Vec<String> {
        self.buffers
            .get(&buffer)
            .map(|buf| buf.lines.clone())
            .unwrap_or_default()
    }

    fn buffer_name(&self, buffer: BufferId) -> Option<String> {
        self.buffers.get(&buffer).and_then(|buf| buf.name.clone())
    }

    fn current_buffer(&self) -> BufferId {
        self.current
    }

    fn cursor(&self) -> Position {
        self.cursor
    }

    fn set_cursor(&mut self, position: Position) {
        self.current = position.buffer;
        self.cursor = position;
    }
}

impl Surface for HeadlessHost {
    fn window(&self) -> WindowGeometry {
        self.window
    }

    fn open_panel(&mut self, spec: &PanelSpec, lines: &[String]) -> PanelId {
        let id = self.next_id();
        self.panels.insert(
            id,
            PanelState {
                spec: spec.clone(),
                lines: lines.to_vec(),
                focused: false,
            },
        );
        PanelId(id)
    }

    fn update_panel(&mut self, panel: PanelId, spec: &PanelSpec, lines: &[String]) -> bool {
        match self.panels.get_mut(&panel.0) {
            Some(state) => {
                state.spec = spec.clone();
                state.lines = lines.to_vec();
                true
            }
            None => false,
        }
    }

    fn close_panel(&mut self, panel: PanelId) {
        self.panels.remove(&panel.0);
    }

    fn focus_panel(&mut self, panel: PanelId) {
        for (id, state) in self.panels.iter_mut() {
            state.focused = *id == panel.0;
        }
    }

    fn set_virtual_lines(
        &mut self,
        buffer: BufferId,
        line: usize,
        lines: &[String],
    ) -> VirtualLinesId {
        let id = self.next_id();
        self.virtual_lines.insert(
            id,
            VirtualLines {
                buffer,
                line,
                lines: lines.to_vec(),
            },
        );
        VirtualLinesId(id)
    }

    fn clear_virtual_lines(&mut self, _buffer: BufferId, id: VirtualLinesId) {
        self.virtual_lines.remove(&id.0);
    }

    fn add_highlight(&mut self, buffer: BufferId, owner: &str, range: HighlightRange, group: &str) {
        self.highlights.entry(buffer).or_default().push(Highlight {
            owner: owner.to_string(),
            range,
            group: group.to_string(),
        });
    }

    fn clear_highlights(&mut self, buffer: BufferId, owner: &str) {
        if let Some(highlights) = self.highlights.get_mut(&buffer) {
            highlights.retain(|h| h.owner != owner);
        }
    }

    fn notify(&mut self, level: Level, message: &str) {
        match level {
            Level::Info => log::info!("{message}"),
            Level::Warn => log::warn!("{message}"),
            Level::Error => log::error!("{message}"),
        }
        self.notifications.push((level, message.to_string()));
    }

    fn prompt_input(&mut self, kernel_id: &str, prompt: &str, _password: bool) {
        self.prompts.push((kernel_id.to_string(), prompt.to_string()));
    }

    fn copy_to_clipboard(&mut self, text: &str) {
        self.clipboard = Some(text.to_string());
    }
}
