//! The output model: one execution's result, built incrementally from kernel
//! messages.

use std::path::PathBuf;
use std::sync::OnceLock;

use chrono::{DateTime, Local};
use regex::Regex;
use serde_json::{Map, Value};

use crate::surface::{Canvas, ImageId, ImagePlacement};
use crate::position::BufferId;

/// Execution status of an output. Ordinals are persisted in save files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputStatus {
    Hold,
    Running,
    Done,
    New,
}

impl OutputStatus {
    pub fn ordinal(self) -> i64 {
        match self {
            OutputStatus::Hold => 0,
            OutputStatus::Running => 1,
            OutputStatus::Done => 2,
            OutputStatus::New => 3,
        }
    }

    pub fn from_ordinal(value: i64) -> Option<Self> {
        match value {
            0 => Some(OutputStatus::Hold),
            1 => Some(OutputStatus::Running),
            2 => Some(OutputStatus::Done),
            3 => Some(OutputStatus::New),
            _ => None,
        }
    }
}

impl std::fmt::Display for OutputStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputStatus::Hold => write!(f, "hold"),
            OutputStatus::Running => write!(f, "running"),
            OutputStatus::Done => write!(f, "done"),
            OutputStatus::New => write!(f, "new"),
        }
    }
}

/// Stream a chunk was printed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamName {
    Stdout,
    Stderr,
}

impl StreamName {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamName::Stdout => "stdout",
            StreamName::Stderr => "stderr",
        }
    }
}

/// Which kind of protocol output a chunk came from, used for notebook export.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputType {
    Stream(StreamName),
    DisplayData,
    ExecuteResult { execution_count: Option<u32> },
    Error,
    /// Synthetic chunks with no notebook counterpart.
    Synthetic,
}

/// Renderable content of a chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkKind {
    Text(String),
    Image(PathBuf),
    Error {
        name: String,
        message: String,
        traceback: Vec<String>,
    },
    /// Mimetypes of a received bundle, shown when debugging is enabled.
    Debug(Vec<String>),
    /// A bundle without any usable mimetype.
    Unrenderable(Vec<String>),
}

/// One piece of an output.
///
/// `data`/`metadata` keep the protocol payload the chunk was built from so it
/// can be saved or exported losslessly.
#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub kind: ChunkKind,
    pub output_type: OutputType,
    pub data: Option<Map<String, Value>>,
    pub metadata: Option<Map<String, Value>>,
    image: Option<ImageId>,
}

/// Where and how a chunk is being rendered.
pub struct RenderTarget<'a> {
    pub buffer: BufferId,
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub wrap: bool,
    pub canvas: &'a mut dyn Canvas,
}

impl OutputChunk {
    pub fn new(kind: ChunkKind, output_type: OutputType) -> Self {
        Self {
            kind,
            output_type,
            data: None,
            metadata: None,
            image: None,
        }
    }

    pub fn with_payload(mut self, data: Map<String, Value>, metadata: Map<String, Value>) -> Self {
        self.data = Some(data);
        self.metadata = Some(metadata);
        self
    }

    /// Plain text followed by a newline, the form used for mimetype bundles.
    pub fn text_line(text: &str, output_type: OutputType) -> Self {
        Self::new(ChunkKind::Text(format!("{text}\n")), output_type)
    }

    pub fn debug(mimetypes: Vec<String>) -> Self {
        Self::new(ChunkKind::Debug(mimetypes), OutputType::Synthetic)
    }

    pub fn error(name: &str, message: &str, traceback: Vec<String>) -> Self {
        Self::new(
            ChunkKind::Error {
                name: name.to_string(),
                message: message.to_string(),
                traceback,
            },
            OutputType::Error,
        )
    }

    pub fn is_text(&self) -> bool {
        matches!(self.kind, ChunkKind::Text(_))
    }

    pub fn image_id(&self) -> Option<&ImageId> {
        self.image.as_ref()
    }

    /// Raw text of the chunk before cleanup.
    pub fn raw_text(&self) -> String {
        match &self.kind {
            ChunkKind::Text(text) => text.clone(),
            ChunkKind::Image(_) => String::new(),
            ChunkKind::Error {
                name,
                message,
                traceback,
            } => {
                let mut lines = vec![format!("[Error] {name}: {message}"), "Traceback:".to_string()];
                lines.extend(traceback.iter().cloned());
                format!("{}\n", lines.join("\n"))
            }
            ChunkKind::Debug(mimetypes) => {
                format!("[DEBUG] Received mimetypes: {}\n", repr_list(mimetypes))
            }
            ChunkKind::Unrenderable(mimetypes) => format!(
                "<No usable MIMEtype! Received mimetypes {}>\n",
                repr_list(mimetypes)
            ),
        }
    }

    /// Render the chunk, returning its text and the number of extra screen
    /// lines it occupies beyond that text (wrapping, images).
    pub fn render(&mut self, target: &mut RenderTarget<'_>) -> (String, usize) {
        if let ChunkKind::Image(path) = &self.kind {
            let id = target.canvas.add_image(
                path,
                ImagePlacement {
                    buffer: target.buffer,
                    x: target.x,
                    y: target.y + 1,
                },
            );
            let height = target.canvas.image_size(&id).height;
            self.image = Some(id);
            return (String::new(), height);
        }

        let text = clean_up_text(&self.raw_text());
        let mut extra_lines = 0;
        if target.wrap && target.width > 0 {
            for line in text.split('\n') {
                let len = line.chars().count();
                if len > target.width {
                    extra_lines += len / target.width;
                }
            }
        }
        (text, extra_lines)
    }
}

fn ansi_code_regex() -> &'static Regex {
    static ANSI: OnceLock<Regex> = OnceLock::new();
    ANSI.get_or_init(|| {
        Regex::new(r"\x1B(?:[@-Z\\-_]|\[[0-?]*[ -/]*[@-~])").expect("ANSI pattern is valid")
    })
}

/// Strip ANSI escape sequences and normalise line endings.
pub fn clean_up_text(text: &str) -> String {
    ansi_code_regex().replace_all(text, "").replace("\r\n", "\n")
}

/// Keep only what follows the last carriage return on each line.
pub fn collapse_carriage_returns(text: &str) -> String {
    text.replace("\r\n", "\n")
        .split('\n')
        .map(|line| line.rsplit('\r').next().unwrap_or(""))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Format a list of strings like `['a', 'b']`.
pub(crate) fn repr_list(items: &[String]) -> String {
    let quoted: Vec<String> = items.iter().map(|s| format!("'{s}'")).collect();
    format!("[{}]", quoted.join(", "))
}

/// Result of one execution.
#[derive(Debug, Clone)]
pub struct Output {
    pub execution_count: Option<u32>,
    pub status: OutputStatus,
    pub success: bool,
    pub chunks: Vec<OutputChunk>,
    pub start_time: Option<DateTime<Local>>,
    pub end_time: Option<DateTime<Local>>,
    /// Restored from disk or a notebook rather than computed in this session.
    pub old: bool,
    /// Wipe `chunks` before the next chunk is appended.
    pub should_clear: bool,
}

impl Default for Output {
    fn default() -> Self {
        Self::new(None)
    }
}

impl Output {
    pub fn new(execution_count: Option<u32>) -> Self {
        Self {
            execution_count,
            status: OutputStatus::Hold,
            success: true,
            chunks: Vec::new(),
            start_time: None,
            end_time: None,
            old: false,
            should_clear: false,
        }
    }

    /// An output for a cell that was defined but never run.
    pub fn never_run() -> Self {
        Self {
            status: OutputStatus::New,
            ..Self::new(None)
        }
    }

    pub fn mark_running(&mut self) {
        self.status = OutputStatus::Running;
        self.start_time = Some(Local::now());
    }

    pub fn mark_done(&mut self) {
        if self.status != OutputStatus::Done {
            self.status = OutputStatus::Done;
            self.end_time = Some(Local::now());
        }
    }

    /// Merge the last text chunk into the text chunk before it, collapsing
    /// carriage-return rewrites.
    pub fn merge_text_chunks(&mut self) {
        let len = self.chunks.len();
        if len < 2 || !self.chunks[len - 1].is_text() || !self.chunks[len - 2].is_text() {
            return;
        }
        let Some(last) = self.chunks.pop() else {
            return;
        };
        let Some(previous) = self.chunks.last_mut() else {
            return;
        };
        let (ChunkKind::Text(prev_text), ChunkKind::Text(next_text)) =
            (&previous.kind, &last.kind)
        else {
            return;
        };
        let merged = collapse_carriage_returns(&format!("{prev_text}{next_text}"));
        if let Some(data) = previous.data.as_mut() {
            data.insert("text/plain".to_string(), Value::String(merged.clone()));
        }
        previous.kind = ChunkKind::Text(merged);
    }

    /// Header line shown above the output.
    pub fn header_text(&self, show_exec_time: bool, now: DateTime<Local>) -> String {
        if self.status == OutputStatus::New {
            return "Out[_]: Never Run".to_string();
        }
        let execution_count = match self.execution_count {
            Some(count) => count.to_string(),
            None => "...".to_string(),
        };
        let status = match self.status {
            OutputStatus::Hold => "* On Hold",
            OutputStatus::Done if self.success => "✓ Done",
            OutputStatus::Done => "✗ Failed",
            OutputStatus::Running => "... Running",
            OutputStatus::New => "",
        };
        let old = if self.old { "[OLD] " } else { "" };
        let time = match self.start_time {
            Some(start) if !self.old && show_exec_time => {
                format_duration(self.end_time.unwrap_or(now) - start)
            }
            _ => String::new(),
        };
        format!("{old}Out[{execution_count}]: {status} {time}")
            .trim_end()
            .to_string()
    }
}

fn format_duration(diff: chrono::Duration) -> String {
    let total_ms = diff.num_milliseconds().max(0);
    let total_secs = total_ms / 1000;
    let centis = (total_ms % 1000 + 5) / 10;
    let (total_secs, centis) = if centis == 100 {
        (total_secs + 1, 0)
    } else {
        (total_secs, centis)
    };
    let days = total_secs / 86_400;
    let hours = (total_secs % 86_400) / 3_600;
    let minutes = (total_secs % 3_600) / 60;
    let seconds = total_secs % 60;

    let mut time = String::new();
    if days > 0 {
        time.push_str(&format!("{days}d "));
    }
    if hours > 0 {
        time.push_str(&format!("{hours}hr "));
    }
    if minutes > 0 {
        time.push_str(&format!("{minutes}m "));
    }
    time.push_str(&format!("{seconds}.{centis:02}s"));
    time
}
