//! Shared fixtures: a kernel whose iopub messages are pushed by the test.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use serde_json::{json, Map, Value};

use kcell::config::Options;
use kcell::headless::HeadlessHost;
use kcell::message::{KernelMessage, KernelStatus, StdinRequest};
use kcell::position::BufferId;
use kcell::surface::NoCanvas;
use kcell::transport::{KernelLauncher, KernelSpecSummary, KernelTransport, TransportKind};
use kcell::Session;

#[derive(Default)]
struct Script {
    iopub: VecDeque<KernelMessage>,
    executed: Vec<String>,
}

#[derive(Clone, Default)]
pub struct FakeKernel {
    script: Arc<Mutex<Script>>,
}

impl FakeKernel {
    pub fn push(&self, message: KernelMessage) {
        self.script.lock().unwrap().iopub.push_back(message);
    }

    pub fn executed(&self) -> Vec<String> {
        self.script.lock().unwrap().executed.clone()
    }

    /// Queue the messages of one execution that returns `text/plain`.
    pub fn complete(&self, count: u32, text: &str) {
        self.complete_with(count, plain(text));
    }

    pub fn complete_with(&self, count: u32, data: Map<String, Value>) {
        self.push(KernelMessage::Status(KernelStatus::Busy));
        self.push(KernelMessage::ExecuteInput {
            execution_count: count,
        });
        self.push(KernelMessage::ExecuteResult {
            execution_count: count,
            data,
            metadata: Map::new(),
        });
        self.push(KernelMessage::Status(KernelStatus::Idle));
    }
}

pub fn plain(text: &str) -> Map<String, Value> {
    let mut data = Map::new();
    data.insert("text/plain".into(), json!(text));
    data
}

impl KernelTransport for FakeKernel {
    fn kind(&self) -> TransportKind {
        TransportKind::Local
    }

    fn poll_ready(&mut self) -> Result<bool> {
        Ok(true)
    }

    fn try_iopub(&mut self) -> Option<KernelMessage> {
        self.script.lock().unwrap().iopub.pop_front()
    }

    fn try_stdin(&mut self) -> Option<StdinRequest> {
        None
    }

    fn execute(&mut self, code: &str) -> Result<()> {
        self.script.lock().unwrap().executed.push(code.to_string());
        Ok(())
    }

    fn send_input(&mut self, _value: &str) -> Result<()> {
        Ok(())
    }

    fn interrupt(&mut self) -> Result<()> {
        Ok(())
    }

    fn restart(&mut self) -> Result<()> {
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }

    fn language(&self) -> Option<String> {
        Some("python".to_string())
    }
}

#[derive(Clone, Default)]
pub struct FakeLauncher {
    kernels: Arc<Mutex<Vec<FakeKernel>>>,
}

impl FakeLauncher {
    pub fn kernel(&self, n: usize) -> FakeKernel {
        self.kernels.lock().unwrap()[n].clone()
    }
}

impl KernelLauncher for FakeLauncher {
    fn launch(&mut self, _kernel_name: &str) -> Result<Box<dyn KernelTransport>> {
        let kernel = FakeKernel::default();
        self.kernels.lock().unwrap().push(kernel.clone());
        Ok(Box::new(kernel))
    }

    fn available_kernels(&mut self) -> Vec<KernelSpecSummary> {
        vec![KernelSpecSummary {
            name: "python3".to_string(),
            display_name: "Python 3".to_string(),
            language: "python".to_string(),
            argv: vec!["python3".to_string()],
            resource_dir: PathBuf::from("/usr/share/jupyter/kernels/python3"),
        }]
    }
}

pub fn session_with(
    name: &str,
    text: &str,
    options: Options,
) -> (Session<HeadlessHost>, FakeLauncher, BufferId) {
    let mut host = HeadlessHost::new();
    let buffer = host.open_buffer(Some(name), text);
    let launcher = FakeLauncher::default();
    let session = Session::new(host, Box::new(NoCanvas), Box::new(launcher.clone()), options);
    (session, launcher, buffer)
}

/// Spans of a kernel's cells as ((line, col), (line, col)), in document order.
pub fn spans(session: &Session<HeadlessHost>, kernel: &str) -> Vec<((usize, usize), (usize, usize))> {
    let Some(coordinator) = session.coordinator(kernel) else {
        return Vec::new();
    };
    coordinator
        .sorted_cells(session.host())
        .into_iter()
        .map(|(_, s)| ((s.begin.line, s.begin.column), (s.end.line, s.end.column)))
        .collect()
}
