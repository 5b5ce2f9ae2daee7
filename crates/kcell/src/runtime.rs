//! Kernel session: drives one kernel's message stream into an [`Output`].

use anyhow::Result;
use log::{debug, error, info, warn};
use serde_json::{Map, Value};

use crate::error::ProtocolError;
use crate::message::{KernelMessage, KernelStatus, StdinRequest};
use crate::mimetype::{to_output_chunk, FileAllocator};
use crate::config::Options;
use crate::output::{
    clean_up_text, ChunkKind, Output, OutputChunk, OutputStatus, OutputType, StreamName,
};
use crate::surface::Ui;
use crate::transport::{KernelTransport, TransportKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Starting,
    Idle,
    Running,
}

pub struct JupyterRuntime {
    state: RuntimeState,
    kernel_name: String,
    kernel_id: String,
    transport: Box<dyn KernelTransport>,
    files: FileAllocator,
    awaiting_input: bool,
    /// Startup failed; the session stays in `Starting` and stops probing.
    failed: bool,
}

impl JupyterRuntime {
    pub fn new(kernel_name: &str, kernel_id: &str, transport: Box<dyn KernelTransport>) -> Self {
        Self {
            state: RuntimeState::Starting,
            kernel_name: kernel_name.to_string(),
            kernel_id: kernel_id.to_string(),
            transport,
            files: FileAllocator::new(),
            awaiting_input: false,
            failed: false,
        }
    }

    pub fn state(&self) -> RuntimeState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state != RuntimeState::Starting
    }

    pub fn kernel_name(&self) -> &str {
        &self.kernel_name
    }

    pub fn kernel_id(&self) -> &str {
        &self.kernel_id
    }

    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub fn language(&self) -> Option<String> {
        self.transport.language()
    }

    pub fn awaiting_input(&self) -> bool {
        self.awaiting_input
    }

    pub fn allocated_files(&self) -> &[std::path::PathBuf] {
        self.files.files()
    }

    /// Rebuild a chunk from a stored mimetype bundle. Image files it needs
    /// are owned by this runtime.
    pub fn restore_chunk(
        &mut self,
        data: Map<String, Value>,
        metadata: Map<String, Value>,
        output_type: OutputType,
        options: &Options,
    ) -> OutputChunk {
        to_output_chunk(data, metadata, output_type, options, &mut self.files)
    }

    pub fn run_code(&mut self, code: &str) -> Result<()> {
        debug!("[runtime] {}: executing {} bytes", self.kernel_id, code.len());
        self.transport.execute(code)
    }

    pub fn interrupt(&mut self) -> Result<()> {
        self.transport.interrupt()
    }

    pub fn restart(&mut self) -> Result<()> {
        self.state = RuntimeState::Starting;
        self.awaiting_input = false;
        self.failed = false;
        self.transport.restart()
    }

    pub fn send_input(&mut self, value: &str) -> Result<()> {
        self.awaiting_input = false;
        self.transport.send_input(value)
    }

    /// Delete allocated files and shut the kernel down.
    pub fn deinit(&mut self) {
        self.files.cleanup();
        if let Err(e) = self.transport.shutdown() {
            warn!("[runtime] {}: shutdown failed: {e}", self.kernel_id);
        }
    }

    /// Poll readiness and drain pending messages into `output`. Returns
    /// whether anything changed. Never blocks.
    pub fn tick(&mut self, output: Option<&mut Output>, ui: &mut Ui<'_>) -> bool {
        let mut did_stuff = false;

        if !self.is_ready() {
            if self.failed {
                return false;
            }
            match self.transport.poll_ready() {
                Ok(true) => {
                    info!("[runtime] {}: kernel ready", self.kernel_id);
                    self.state = RuntimeState::Idle;
                    did_stuff = true;
                }
                Ok(false) => return false,
                Err(e) => {
                    error!("[runtime] {}: kernel failed to start: {e:#}", self.kernel_id);
                    ui.notify_error(&format!("Kernel '{}' failed to start: {e}", self.kernel_id));
                    self.failed = true;
                    return false;
                }
            }
        }

        if self.awaiting_input {
            return did_stuff;
        }
        let Some(output) = output else {
            return did_stuff;
        };

        while let Some(message) = self.transport.try_iopub() {
            match self.tick_one(output, message, ui) {
                Ok(changed) => did_stuff |= changed,
                Err(e) => {
                    error!("[runtime] {}: {e}", self.kernel_id);
                    ui.notify_error(&e.to_string());
                }
            }
            if output.status == OutputStatus::Done {
                break;
            }
        }
        did_stuff
    }

    /// Forward a pending stdin request to the host prompt.
    pub fn tick_input(&mut self, ui: &mut Ui<'_>) {
        if !self.is_ready() {
            return;
        }
        match self.transport.try_stdin() {
            Some(StdinRequest::Input { prompt, password }) => {
                self.awaiting_input = true;
                ui.host.prompt_input(&self.kernel_id, &prompt, password);
            }
            Some(StdinRequest::Other(kind)) => {
                debug!("[runtime] {}: ignoring stdin message {kind}", self.kernel_id);
            }
            None => {}
        }
    }

    fn tick_one(
        &mut self,
        output: &mut Output,
        message: KernelMessage,
        ui: &mut Ui<'_>,
    ) -> Result<bool, ProtocolError> {
        if output.should_clear {
            output.chunks.clear();
            output.should_clear = false;
        }

        match message {
            KernelMessage::ExecuteInput { execution_count } => {
                output.execution_count = Some(execution_count);
                if self.transport.kind() != TransportKind::External {
                    match output.status {
                        OutputStatus::Done => return Ok(false),
                        OutputStatus::Hold => output.mark_running(),
                        OutputStatus::Running => output.mark_done(),
                        OutputStatus::New => {
                            return Err(ProtocolError::UnexpectedStatus(
                                output.status.to_string(),
                            ))
                        }
                    }
                }
                Ok(true)
            }
            KernelMessage::Status(KernelStatus::Idle) => {
                self.state = RuntimeState::Idle;
                output.mark_done();
                Ok(true)
            }
            KernelMessage::Status(KernelStatus::Busy) => {
                self.state = RuntimeState::Running;
                Ok(true)
            }
            KernelMessage::Status(KernelStatus::Other) => Ok(false),
            KernelMessage::ExecuteReply | KernelMessage::UpdateDisplayData => Ok(false),
            KernelMessage::ExecuteResult {
                execution_count,
                data,
                metadata,
            } => {
                let text = data.get("text/plain").and_then(Value::as_str).map(str::to_string);
                self.append_chunk(
                    output,
                    data,
                    metadata,
                    OutputType::ExecuteResult {
                        execution_count: Some(execution_count),
                    },
                    ui,
                );
                if let Some(text) = text {
                    copy_on_demand(ui, &text);
                }
                Ok(true)
            }
            KernelMessage::DisplayData { data, metadata } => {
                self.append_chunk(output, data, metadata, OutputType::DisplayData, ui);
                Ok(true)
            }
            KernelMessage::Error {
                ename,
                evalue,
                traceback,
            } => {
                output.success = false;
                let cleaned: Vec<String> = traceback.iter().map(|l| clean_up_text(l)).collect();
                output
                    .chunks
                    .push(OutputChunk::error(&ename, &evalue, traceback));
                copy_on_demand(ui, &cleaned.join("\n\n"));
                Ok(true)
            }
            KernelMessage::Stream { name, text } => {
                copy_on_demand(ui, &text);
                self.append_stream(output, name, text, ui);
                Ok(true)
            }
            KernelMessage::ClearOutput { wait } => {
                if wait {
                    output.should_clear = true;
                } else {
                    output.chunks.clear();
                }
                Ok(true)
            }
            KernelMessage::Other(kind) => {
                debug!("[runtime] {}: ignoring {kind}", self.kernel_id);
                Ok(false)
            }
        }
    }

    fn append_chunk(
        &mut self,
        output: &mut Output,
        data: Map<String, Value>,
        metadata: Map<String, Value>,
        output_type: OutputType,
        ui: &mut Ui<'_>,
    ) {
        if ui.options.show_mimetype_debug {
            output
                .chunks
                .push(OutputChunk::debug(data.keys().cloned().collect()));
        }
        if output.success {
            let chunk = to_output_chunk(data, metadata, output_type, ui.options, &mut self.files);
            output.chunks.push(chunk);
        }
    }

    fn append_stream(
        &mut self,
        output: &mut Output,
        name: StreamName,
        text: String,
        ui: &mut Ui<'_>,
    ) {
        if ui.options.show_mimetype_debug {
            output.chunks.push(OutputChunk::debug(vec!["text/plain".into()]));
        }
        if !output.success {
            return;
        }
        let continues_line = output.chunks.last().is_some_and(|chunk| {
            matches!(&chunk.kind, ChunkKind::Text(prev) if prev.ends_with('\r'))
        });
        let starts_with_cr = text.starts_with('\r');

        let mut data = Map::new();
        data.insert("text/plain".to_string(), Value::String(text.clone()));
        output.chunks.push(
            OutputChunk::new(ChunkKind::Text(text), OutputType::Stream(name))
                .with_payload(data, Map::new()),
        );
        if starts_with_cr || continues_line {
            output.merge_text_chunks();
        }
    }
}

fn copy_on_demand(ui: &mut Ui<'_>, text: &str) {
    if ui.options.copy_output {
        ui.host.copy_to_clipboard(text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessHost;
    use crate::surface::NoCanvas;
    use crate::test_support::ScriptedTransport;
    use serde_json::json;

    fn bundle(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    struct Fixture {
        host: HeadlessHost,
        canvas: NoCanvas,
        options: Options,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                host: HeadlessHost::new(),
                canvas: NoCanvas,
                options: Options::default(),
            }
        }

        fn ui(&mut self) -> Ui<'_> {
            Ui {
                host: &mut self.host,
                canvas: &mut self.canvas,
                options: &self.options,
            }
        }
    }

    fn ready_runtime() -> (JupyterRuntime, ScriptedTransport) {
        let script = ScriptedTransport::new(TransportKind::Local);
        script.set_ready(true);
        let runtime = JupyterRuntime::new("python3", "python3", Box::new(script.clone()));
        (runtime, script)
    }

    #[test]
    fn test_tick_waits_for_ready() {
        let mut fx = Fixture::new();
        let script = ScriptedTransport::new(TransportKind::Local);
        let mut runtime = JupyterRuntime::new("python3", "python3", Box::new(script.clone()));

        assert!(!runtime.tick(None, &mut fx.ui()));
        assert_eq!(runtime.state(), RuntimeState::Starting);

        script.set_ready(true);
        assert!(runtime.tick(None, &mut fx.ui()));
        assert!(runtime.is_ready());
    }

    #[test]
    fn test_failed_start_is_reported_once() {
        let mut fx = Fixture::new();
        let script = ScriptedTransport::new(TransportKind::Local);
        script.fail_start("no such kernel");
        let mut runtime = JupyterRuntime::new("nope", "nope", Box::new(script));

        assert!(!runtime.tick(None, &mut fx.ui()));
        assert!(!runtime.tick(None, &mut fx.ui()));
        assert_eq!(fx.host.notifications().len(), 1);
        assert!(!runtime.is_ready());
    }

    #[test]
    fn test_execution_lifecycle() {
        let mut fx = Fixture::new();
        let (mut runtime, script) = ready_runtime();
        let mut output = Output::new(None);

        script.push_iopub(KernelMessage::Status(KernelStatus::Busy));
        script.push_iopub(KernelMessage::ExecuteInput { execution_count: 4 });
        script.push_iopub(KernelMessage::ExecuteResult {
            execution_count: 4,
            data: bundle(json!({"text/plain": "42"})),
            metadata: Map::new(),
        });
        script.push_iopub(KernelMessage::Status(KernelStatus::Idle));

        assert!(runtime.tick(Some(&mut output), &mut fx.ui()));
        assert_eq!(output.status, OutputStatus::Done);
        assert_eq!(output.execution_count, Some(4));
        assert!(output.start_time.is_some());
        assert_eq!(output.chunks.len(), 1);
        assert_eq!(output.chunks[0].kind, ChunkKind::Text("42\n".into()));
        assert_eq!(runtime.state(), RuntimeState::Idle);
    }

    #[test]
    fn test_tick_stops_once_done() {
        let mut fx = Fixture::new();
        let (mut runtime, script) = ready_runtime();
        let mut first = Output::new(None);
        first.mark_running();

        script.push_iopub(KernelMessage::Status(KernelStatus::Idle));
        script.push_iopub(KernelMessage::ExecuteInput { execution_count: 2 });

        runtime.tick(Some(&mut first), &mut fx.ui());
        assert_eq!(first.status, OutputStatus::Done);

        let mut second = Output::new(None);
        runtime.tick(Some(&mut second), &mut fx.ui());
        assert_eq!(second.status, OutputStatus::Running);
        assert_eq!(second.execution_count, Some(2));
    }

    #[test]
    fn test_execute_input_on_never_run_output_is_an_error() {
        let mut fx = Fixture::new();
        let (mut runtime, script) = ready_runtime();
        let mut output = Output::never_run();
        script.push_iopub(KernelMessage::ExecuteInput { execution_count: 1 });

        runtime.tick(Some(&mut output), &mut fx.ui());
        assert_eq!(output.status, OutputStatus::New);
        assert_eq!(fx.host.notifications().len(), 1);
    }

    #[test]
    fn test_external_kernel_does_not_advance_on_execute_input() {
        let mut fx = Fixture::new();
        let script = ScriptedTransport::new(TransportKind::External);
        script.set_ready(true);
        let mut runtime = JupyterRuntime::new("k.json", "k.json", Box::new(script.clone()));
        let mut output = Output::new(None);

        script.push_iopub(KernelMessage::ExecuteInput { execution_count: 9 });
        runtime.tick(Some(&mut output), &mut fx.ui());
        assert_eq!(output.status, OutputStatus::Hold);
        assert_eq!(output.execution_count, Some(9));
    }

    #[test]
    fn test_error_marks_output_failed() {
        let mut fx = Fixture::new();
        fx.options.copy_output = true;
        let (mut runtime, script) = ready_runtime();
        let mut output = Output::new(None);
        output.mark_running();

        script.push_iopub(KernelMessage::Error {
            ename: "NameError".into(),
            evalue: "name 'x' is not defined".into(),
            traceback: vec!["\x1b[31mNameError\x1b[0m".into(), "line 1".into()],
        });
        runtime.tick(Some(&mut output), &mut fx.ui());

        assert!(!output.success);
        assert_eq!(output.chunks.len(), 1);
        assert!(matches!(output.chunks[0].kind, ChunkKind::Error { .. }));
        assert_eq!(fx.host.clipboard(), Some("NameError\n\nline 1"));

        // Streams after the error still reach the clipboard but not the output.
        script.push_iopub(KernelMessage::Stream {
            name: StreamName::Stdout,
            text: "after failure".into(),
        });
        runtime.tick(Some(&mut output), &mut fx.ui());
        assert_eq!(output.chunks.len(), 1);
        assert_eq!(fx.host.clipboard(), Some("after failure"));
    }

    #[test]
    fn test_progress_bar_stream_merge() {
        let mut fx = Fixture::new();
        let (mut runtime, script) = ready_runtime();
        let mut output = Output::new(None);
        output.mark_running();

        script.push_iopub(KernelMessage::Stream {
            name: StreamName::Stdout,
            text: "50%\r".into(),
        });
        script.push_iopub(KernelMessage::Stream {
            name: StreamName::Stdout,
            text: "100%\rDone\n".into(),
        });
        runtime.tick(Some(&mut output), &mut fx.ui());

        assert_eq!(output.chunks.len(), 1);
        assert_eq!(output.chunks[0].kind, ChunkKind::Text("Done\n".into()));
    }

    #[test]
    fn test_clear_output_wait_defers() {
        let mut fx = Fixture::new();
        let (mut runtime, script) = ready_runtime();
        let mut output = Output::new(None);
        output.mark_running();

        script.push_iopub(KernelMessage::Stream {
            name: StreamName::Stdout,
            text: "first\n".into(),
        });
        script.push_iopub(KernelMessage::ClearOutput { wait: true });
        runtime.tick(Some(&mut output), &mut fx.ui());
        assert_eq!(output.chunks.len(), 1);
        assert!(output.should_clear);

        script.push_iopub(KernelMessage::Stream {
            name: StreamName::Stdout,
            text: "second\n".into(),
        });
        runtime.tick(Some(&mut output), &mut fx.ui());
        assert_eq!(output.chunks.len(), 1);
        assert_eq!(output.chunks[0].kind, ChunkKind::Text("second\n".into()));

        script.push_iopub(KernelMessage::ClearOutput { wait: false });
        runtime.tick(Some(&mut output), &mut fx.ui());
        assert!(output.chunks.is_empty());
    }

    #[test]
    fn test_mimetype_debug_chunk() {
        let mut fx = Fixture::new();
        fx.options.show_mimetype_debug = true;
        let (mut runtime, script) = ready_runtime();
        let mut output = Output::new(None);
        output.mark_running();

        script.push_iopub(KernelMessage::DisplayData {
            data: bundle(json!({"text/plain": "x", "text/html": "<b>x</b>"})),
            metadata: Map::new(),
        });
        runtime.tick(Some(&mut output), &mut fx.ui());
        assert_eq!(output.chunks.len(), 2);
        assert!(matches!(output.chunks[0].kind, ChunkKind::Debug(_)));
    }

    #[test]
    fn test_input_request_suspends_ticking() {
        let mut fx = Fixture::new();
        let (mut runtime, script) = ready_runtime();
        let mut output = Output::new(None);
        output.mark_running();
        runtime.tick_input(&mut fx.ui());
        assert!(!runtime.awaiting_input());
        runtime.tick(None, &mut fx.ui());
        assert!(runtime.is_ready());

        script.push_stdin(StdinRequest::Input {
            prompt: "Name: ".into(),
            password: false,
        });
        runtime.tick_input(&mut fx.ui());
        assert!(runtime.awaiting_input());
        assert_eq!(fx.host.prompts(), &[("python3".to_string(), "Name: ".to_string())]);

        script.push_iopub(KernelMessage::Status(KernelStatus::Idle));
        runtime.tick(Some(&mut output), &mut fx.ui());
        assert_eq!(output.status, OutputStatus::Running);

        runtime.send_input("Ada").unwrap();
        assert_eq!(script.inputs(), vec!["Ada".to_string()]);
        runtime.tick(Some(&mut output), &mut fx.ui());
        assert_eq!(output.status, OutputStatus::Done);
    }

    #[test]
    fn test_restart_returns_to_starting() {
        let mut fx = Fixture::new();
        let (mut runtime, script) = ready_runtime();
        runtime.tick(None, &mut fx.ui());
        assert!(runtime.is_ready());

        runtime.restart().unwrap();
        assert_eq!(runtime.state(), RuntimeState::Starting);
        assert_eq!(script.restarts(), 1);
    }
}
