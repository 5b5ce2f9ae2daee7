//! Kernel transports and the launcher that creates them.
//!
//! A transport owns the connection to one kernel. Background tasks on the
//! launcher's tokio runtime read the protocol channels and feed unbounded
//! queues; the synchronous side only ever does `try_recv`, so polling a
//! transport never blocks the caller.

mod gateway;
mod zmq;

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, oneshot};

use crate::message::{KernelMessage, StdinRequest};

pub use gateway::GatewayUrl;

/// How a kernel is reached, derived from the shape of its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// A kernelspec name: spawn a new local kernel process.
    Local,
    /// A connection file of an already running kernel.
    External,
    /// An `http(s)://` Kernel Gateway URL.
    Gateway,
}

impl TransportKind {
    pub fn for_kernel_name(name: &str) -> Self {
        if name.starts_with("http://") || name.starts_with("https://") {
            TransportKind::Gateway
        } else if name.contains(".json") {
            TransportKind::External
        } else {
            TransportKind::Local
        }
    }
}

/// Connection to one kernel.
pub trait KernelTransport: Send {
    fn kind(&self) -> TransportKind;

    /// Non-blocking readiness probe. `Ok(false)` means "not yet".
    fn poll_ready(&mut self) -> Result<bool>;

    /// Next pending iopub message, if any.
    fn try_iopub(&mut self) -> Option<KernelMessage>;

    /// Next pending stdin request, if any.
    fn try_stdin(&mut self) -> Option<StdinRequest>;

    /// Send an execute request. Does not wait for a reply.
    fn execute(&mut self, code: &str) -> Result<()>;

    /// Answer the pending stdin request.
    fn send_input(&mut self, value: &str) -> Result<()>;

    fn interrupt(&mut self) -> Result<()>;

    /// Restart the kernel. The transport is not ready again until
    /// `poll_ready` says so.
    fn restart(&mut self) -> Result<()>;

    fn shutdown(&mut self) -> Result<()>;

    /// Kernel language, known once the kernel is ready.
    fn language(&self) -> Option<String>;
}

/// An installed kernelspec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSpecSummary {
    pub name: String,
    pub display_name: String,
    pub language: String,
    pub argv: Vec<String>,
    pub resource_dir: PathBuf,
}

/// Creates kernel transports and lists installed kernels.
pub trait KernelLauncher {
    fn launch(&mut self, kernel_name: &str) -> Result<Box<dyn KernelTransport>>;

    fn available_kernels(&mut self) -> Vec<KernelSpecSummary>;
}

/// Launcher for real Jupyter kernels: local kernelspecs, connection files and
/// Kernel Gateway URLs.
pub struct JupyterLauncher {
    runtime: tokio::runtime::Runtime,
}

impl JupyterLauncher {
    pub fn new() -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("kcell-kernel")
            .enable_all()
            .build()?;
        Ok(Self { runtime })
    }
}

impl KernelLauncher for JupyterLauncher {
    fn launch(&mut self, kernel_name: &str) -> Result<Box<dyn KernelTransport>> {
        let handle = self.runtime.handle().clone();
        match TransportKind::for_kernel_name(kernel_name) {
            TransportKind::Local => Ok(Box::new(zmq::ZmqKernel::launch(handle, kernel_name)?)),
            TransportKind::External => {
                Ok(Box::new(zmq::ZmqKernel::attach(handle, kernel_name)?))
            }
            TransportKind::Gateway => Ok(Box::new(gateway::GatewayKernel::start(
                handle,
                kernel_name,
            )?)),
        }
    }

    fn available_kernels(&mut self) -> Vec<KernelSpecSummary> {
        let mut specs: Vec<KernelSpecSummary> = self
            .runtime
            .block_on(runtimelib::list_kernelspecs())
            .into_iter()
            .map(|spec| KernelSpecSummary {
                name: spec.kernel_name,
                display_name: spec.kernelspec.display_name,
                language: spec.kernelspec.language,
                argv: spec.kernelspec.argv,
                resource_dir: spec.path,
            })
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs.dedup_by(|a, b| a.name == b.name);
        specs
    }
}

/// Requests forwarded to a channel task.
#[derive(Debug)]
pub(crate) enum ChannelCommand {
    Execute(String),
    Input(String),
    Interrupt,
}

/// Synchronous end of a channel task.
///
/// Commands sent before the kernel is ready wait in the queue; the task
/// starts reading them once its handshake is done.
pub(crate) struct ChannelHandle {
    ready: bool,
    ready_rx: oneshot::Receiver<Result<Option<String>>>,
    language: Option<String>,
    iopub_rx: mpsc::UnboundedReceiver<KernelMessage>,
    stdin_rx: mpsc::UnboundedReceiver<StdinRequest>,
    cmd_tx: mpsc::UnboundedSender<ChannelCommand>,
    task: tokio::task::JoinHandle<()>,
}

/// Task end of a channel task.
pub(crate) struct ChannelTaskEnd {
    pub ready_tx: oneshot::Sender<Result<Option<String>>>,
    pub iopub_tx: mpsc::UnboundedSender<KernelMessage>,
    pub stdin_tx: mpsc::UnboundedSender<StdinRequest>,
    pub cmd_rx: mpsc::UnboundedReceiver<ChannelCommand>,
}

impl ChannelHandle {
    /// Spawn `task` on `handle`, wiring its queues to a new handle.
    pub fn spawn<F, Fut>(handle: &tokio::runtime::Handle, task: F) -> Self
    where
        F: FnOnce(ChannelTaskEnd) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (iopub_tx, iopub_rx) = mpsc::unbounded_channel();
        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let task = handle.spawn(task(ChannelTaskEnd {
            ready_tx,
            iopub_tx,
            stdin_tx,
            cmd_rx,
        }));
        Self {
            ready: false,
            ready_rx,
            language: None,
            iopub_rx,
            stdin_rx,
            cmd_tx,
            task,
        }
    }

    pub fn poll_ready(&mut self) -> Result<bool> {
        if self.ready {
            return Ok(true);
        }
        match self.ready_rx.try_recv() {
            Ok(Ok(language)) => {
                self.ready = true;
                self.language = language;
                Ok(true)
            }
            Ok(Err(e)) => Err(e),
            Err(oneshot::error::TryRecvError::Empty) => Ok(false),
            Err(oneshot::error::TryRecvError::Closed) => {
                Err(anyhow!("kernel connection closed before it became ready"))
            }
        }
    }

    pub fn try_iopub(&mut self) -> Option<KernelMessage> {
        self.iopub_rx.try_recv().ok()
    }

    pub fn try_stdin(&mut self) -> Option<StdinRequest> {
        self.stdin_rx.try_recv().ok()
    }

    pub fn send(&self, command: ChannelCommand) -> Result<()> {
        self.cmd_tx
            .send(command)
            .map_err(|_| anyhow!("kernel connection is closed"))
    }

    pub fn language(&self) -> Option<String> {
        self.language.clone()
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
