//! Kernel messages as seen by the runtime.
//!
//! Protocol messages are narrowed to the kinds the output state machine
//! reacts to. Everything else becomes [`KernelMessage::Other`] and is ignored.

use jupyter_protocol::{ExecutionState, JupyterMessageContent, Media, Stdio};
use serde_json::{Map, Value};

use crate::output::StreamName;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelStatus {
    Busy,
    Idle,
    /// Starting, restarting and shutdown states.
    Other,
}

/// A message read from the iopub channel.
#[derive(Debug, Clone, PartialEq)]
pub enum KernelMessage {
    Status(KernelStatus),
    ExecuteInput {
        execution_count: u32,
    },
    ExecuteResult {
        execution_count: u32,
        data: Map<String, Value>,
        metadata: Map<String, Value>,
    },
    DisplayData {
        data: Map<String, Value>,
        metadata: Map<String, Value>,
    },
    UpdateDisplayData,
    Error {
        ename: String,
        evalue: String,
        traceback: Vec<String>,
    },
    Stream {
        name: StreamName,
        text: String,
    },
    ClearOutput {
        wait: bool,
    },
    ExecuteReply,
    /// Any other message type, by name.
    Other(String),
}

/// A message read from the stdin channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StdinRequest {
    Input { prompt: String, password: bool },
    Other(String),
}

fn media_to_map(media: &Media) -> Map<String, Value> {
    match serde_json::to_value(media) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

fn count(value: usize) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

impl From<&JupyterMessageContent> for KernelMessage {
    fn from(content: &JupyterMessageContent) -> Self {
        match content {
            JupyterMessageContent::Status(status) => {
                KernelMessage::Status(match status.execution_state {
                    ExecutionState::Busy => KernelStatus::Busy,
                    ExecutionState::Idle => KernelStatus::Idle,
                    _ => KernelStatus::Other,
                })
            }
            JupyterMessageContent::ExecuteInput(input) => KernelMessage::ExecuteInput {
                execution_count: count(input.execution_count.0),
            },
            JupyterMessageContent::ExecuteResult(result) => KernelMessage::ExecuteResult {
                execution_count: count(result.execution_count.0),
                data: media_to_map(&result.data),
                metadata: result.metadata.clone(),
            },
            JupyterMessageContent::DisplayData(display) => KernelMessage::DisplayData {
                data: media_to_map(&display.data),
                metadata: display.metadata.clone(),
            },
            JupyterMessageContent::UpdateDisplayData(_) => KernelMessage::UpdateDisplayData,
            JupyterMessageContent::ErrorOutput(error) => KernelMessage::Error {
                ename: error.ename.clone(),
                evalue: error.evalue.clone(),
                traceback: error.traceback.clone(),
            },
            JupyterMessageContent::StreamContent(stream) => KernelMessage::Stream {
                name: match stream.name {
                    Stdio::Stdout => StreamName::Stdout,
                    Stdio::Stderr => StreamName::Stderr,
                },
                text: stream.text.clone(),
            },
            JupyterMessageContent::ClearOutput(clear) => {
                KernelMessage::ClearOutput { wait: clear.wait }
            }
            JupyterMessageContent::ExecuteReply(_) => KernelMessage::ExecuteReply,
            other => KernelMessage::Other(other.message_type().to_string()),
        }
    }
}

impl From<&JupyterMessageContent> for StdinRequest {
    fn from(content: &JupyterMessageContent) -> Self {
        match content {
            JupyterMessageContent::InputRequest(request) => StdinRequest::Input {
                prompt: request.prompt.clone(),
                password: request.password,
            },
            other => StdinRequest::Other(other.message_type().to_string()),
        }
    }
}
