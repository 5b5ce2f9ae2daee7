//! Scripted kernel transport for unit tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Result};

use crate::message::{KernelMessage, StdinRequest};
use crate::transport::{KernelLauncher, KernelSpecSummary, KernelTransport, TransportKind};

#[derive(Default)]
struct ScriptState {
    ready: bool,
    start_error: Option<String>,
    iopub: VecDeque<KernelMessage>,
    stdin: VecDeque<StdinRequest>,
    executed: Vec<String>,
    inputs: Vec<String>,
    interrupts: usize,
    restarts: usize,
    shutdowns: usize,
}

/// Transport whose messages are pushed by the test.
#[derive(Clone)]
pub struct ScriptedTransport {
    kind: TransportKind,
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedTransport {
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            state: Arc::default(),
        }
    }

    fn state(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap()
    }

    pub fn set_ready(&self, ready: bool) {
        self.state().ready = ready;
    }

    pub fn fail_start(&self, message: &str) {
        self.state().start_error = Some(message.to_string());
    }

    pub fn push_iopub(&self, message: KernelMessage) {
        self.state().iopub.push_back(message);
    }

    pub fn push_stdin(&self, request: StdinRequest) {
        self.state().stdin.push_back(request);
    }

    pub fn executed(&self) -> Vec<String> {
        self.state().executed.clone()
    }

    pub fn inputs(&self) -> Vec<String> {
        self.state().inputs.clone()
    }

    pub fn interrupts(&self) -> usize {
        self.state().interrupts
    }

    pub fn restarts(&self) -> usize {
        self.state().restarts
    }

    pub fn shutdowns(&self) -> usize {
        self.state().shutdowns
    }
}

impl KernelTransport for ScriptedTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn poll_ready(&mut self) -> Result<bool> {
        let state = self.state();
        match &state.start_error {
            Some(message) => Err(anyhow!("{message}")),
            None => Ok(state.ready),
        }
    }

    fn try_iopub(&mut self) -> Option<KernelMessage> {
        self.state().iopub.pop_front()
    }

    fn try_stdin(&mut self) -> Option<StdinRequest> {
        self.state().stdin.pop_front()
    }

    fn execute(&mut self, code: &str) -> Result<()> {
        self.state().executed.push(code.to_string());
        Ok(())
    }

    fn send_input(&mut self, value: &str) -> Result<()> {
        self.state().inputs.push(value.to_string());
        Ok(())
    }

    fn interrupt(&mut self) -> Result<()> {
        self.state().interrupts += 1;
        Ok(())
    }

    fn restart(&mut self) -> Result<()> {
        self.state().restarts += 1;
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        self.state().shutdowns += 1;
        Ok(())
    }

    fn language(&self) -> Option<String> {
        Some("python".to_string())
    }
}

/// Launcher handing out scripted transports, all immediately ready.
#[derive(Clone, Default)]
pub struct ScriptedLauncher {
    launched: Arc<Mutex<Vec<(String, ScriptedTransport)>>>,
}

impl ScriptedLauncher {
    /// Transport of the `n`th launch.
    pub fn transport(&self, n: usize) -> ScriptedTransport {
        self.launched.lock().unwrap()[n].1.clone()
    }

    pub fn launches(&self) -> Vec<String> {
        self.launched
            .lock()
            .unwrap()
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }
}

impl KernelLauncher for ScriptedLauncher {
    fn launch(&mut self, kernel_name: &str) -> Result<Box<dyn KernelTransport>> {
        if kernel_name == "missing" {
            return Err(anyhow!("No such kernel: {kernel_name}"));
        }
        let transport = ScriptedTransport::new(TransportKind::for_kernel_name(kernel_name));
        transport.set_ready(true);
        self.launched
            .lock()
            .unwrap()
            .push((kernel_name.to_string(), transport.clone()));
        Ok(Box::new(transport))
    }

    fn available_kernels(&mut self) -> Vec<KernelSpecSummary> {
        ["julia-1.10", "python3"]
            .iter()
            .map(|name| KernelSpecSummary {
                name: name.to_string(),
                display_name: name.to_string(),
                language: if name.starts_with("julia") { "julia" } else { "python" }.to_string(),
                argv: vec![name.to_string()],
                resource_dir: std::path::PathBuf::from("/usr/share/jupyter/kernels").join(name),
            })
            .collect()
    }
}
