//! Execution history per cell.

use std::collections::HashMap;

use chrono::Local;

use crate::cell::Cell;
use crate::output::{clean_up_text, ChunkKind, Output};

#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub code: String,
    pub output: Output,
}

#[derive(Debug, Default)]
pub struct History {
    entries: HashMap<Cell, Vec<HistoryEntry>>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, cell: &Cell, code: &str, output: &Output) {
        self.entries.entry(cell.clone()).or_default().push(HistoryEntry {
            code: code.to_string(),
            output: output.clone(),
        });
    }

    pub fn remove(&mut self, cell: &Cell) {
        self.entries.remove(cell);
    }

    pub fn get(&self, cell: &Cell) -> Option<&[HistoryEntry]> {
        self.entries.get(cell).map(Vec::as_slice)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Markdown-like listing of every run of `cell`, oldest first.
    pub fn render(&self, cell: &Cell, language: &str, show_exec_time: bool) -> Option<Vec<String>> {
        let entries = self.entries.get(cell)?;
        let now = Local::now();
        let mut lines = Vec::new();
        for entry in entries {
            lines.push("━".repeat(80));
            lines.push(format!("```{language}"));
            lines.extend(entry.code.split('\n').map(str::to_string));
            lines.push("```".to_string());
            lines.push(entry.output.header_text(show_exec_time, now));
            for chunk in &entry.output.chunks {
                let text = match &chunk.kind {
                    ChunkKind::Image(path) => format!("[image: {}]", path.display()),
                    _ => clean_up_text(&chunk.raw_text()),
                };
                lines.extend(text.trim_end_matches('\n').split('\n').map(str::to_string));
            }
        }
        Some(lines)
    }
}
