//! ZeroMQ transports: kernels spawned from a kernelspec and kernels attached
//! through an existing connection file.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use jupyter_protocol::{
    ConnectionInfo, ExecuteRequest, InputReply, InterruptRequest, JupyterMessage,
    JupyterMessageContent, KernelInfoRequest, ReplyStatus, ShutdownRequest,
};
use log::{debug, error, info, warn};
use runtimelib::KernelspecDir;
use tokio::runtime::Handle;
use uuid::Uuid;

use super::{ChannelCommand, ChannelHandle, ChannelTaskEnd, KernelTransport, TransportKind};
use crate::message::{KernelMessage, StdinRequest};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const STARTUP_FLUSH: Duration = Duration::from_millis(200);
const SPAWN_GRACE: Duration = Duration::from_millis(500);

pub(crate) struct ZmqKernel {
    kind: TransportKind,
    handle: Handle,
    connection_info: ConnectionInfo,
    /// Owned connection file, removed on shutdown. `None` for attached kernels.
    connection_file: Option<PathBuf>,
    kernelspec: Option<KernelspecDir>,
    process: Option<tokio::process::Child>,
    process_group_id: Option<i32>,
    session_id: String,
    channels: ChannelHandle,
}

impl ZmqKernel {
    /// Spawn a new kernel from the named kernelspec.
    pub fn launch(handle: Handle, kernel_name: &str) -> Result<Self> {
        let (kernelspec, connection_info, connection_file) = handle.block_on(async {
            let kernelspec = runtimelib::find_kernelspec(kernel_name).await?;

            let ip = std::net::IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
            let ports = runtimelib::peek_ports(ip, 5).await?;
            let connection_info = ConnectionInfo {
                transport: jupyter_protocol::connection_info::Transport::TCP,
                ip: ip.to_string(),
                stdin_port: ports[0],
                control_port: ports[1],
                hb_port: ports[2],
                shell_port: ports[3],
                iopub_port: ports[4],
                signature_scheme: "hmac-sha256".to_string(),
                key: Uuid::new_v4().to_string(),
                kernel_name: Some(kernel_name.to_string()),
            };

            let runtime_dir = runtimelib::dirs::runtime_dir();
            tokio::fs::create_dir_all(&runtime_dir).await?;
            let file_id: String =
                petname::petname(2, "-").unwrap_or_else(|| Uuid::new_v4().to_string());
            let connection_file = runtime_dir.join(format!("kcell-kernel-{file_id}.json"));
            tokio::fs::write(
                &connection_file,
                serde_json::to_string_pretty(&connection_info)?,
            )
            .await?;
            anyhow::Ok((kernelspec, connection_info, connection_file))
        })?;

        info!(
            "[zmq] Starting {} kernel with connection file {:?}",
            kernel_name, connection_file
        );
        let (process, process_group_id) = handle.block_on(spawn_kernel(
            kernelspec.clone(),
            &connection_file,
        ))?;

        let session_id = Uuid::new_v4().to_string();
        let channels = spawn_channels(&handle, connection_info.clone(), session_id.clone(), true);
        Ok(Self {
            kind: TransportKind::Local,
            handle,
            connection_info,
            connection_file: Some(connection_file),
            kernelspec: Some(kernelspec),
            process: Some(process),
            process_group_id,
            session_id,
            channels,
        })
    }

    /// Attach to a running kernel through its connection file.
    pub fn attach(handle: Handle, connection_file: &str) -> Result<Self> {
        let path = Path::new(connection_file);
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Could not find kernel file at path: {connection_file}"))?;
        let connection_info: ConnectionInfo = serde_json::from_str(&content)
            .with_context(|| format!("Malformed kernel connection file: {connection_file}"))?;

        info!("[zmq] Attaching to kernel at {connection_file}");
        let session_id = Uuid::new_v4().to_string();
        let channels = spawn_channels(&handle, connection_info.clone(), session_id.clone(), false);
        Ok(Self {
            kind: TransportKind::External,
            handle,
            connection_info,
            connection_file: None,
            kernelspec: None,
            process: None,
            process_group_id: None,
            session_id,
            channels,
        })
    }

    fn kill_process(&mut self) {
        #[cfg(unix)]
        if let Some(pgid) = self.process_group_id.take() {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;
            if let Err(e) = killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
                if e != nix::errno::Errno::ESRCH {
                    error!("[zmq] Failed to kill process group {}: {}", pgid, e);
                }
            }
        }
        self.process = None;
    }
}

async fn spawn_kernel(
    kernelspec: KernelspecDir,
    connection_file: &Path,
) -> Result<(tokio::process::Child, Option<i32>)> {
    let mut cmd = kernelspec.command(connection_file, Some(Stdio::null()), Some(Stdio::null()))?;

    #[cfg(unix)]
    cmd.process_group(0);

    let process = cmd.kill_on_drop(true).spawn()?;
    #[cfg(unix)]
    let process_group_id = process.id().map(|pid| pid as i32);
    #[cfg(not(unix))]
    let process_group_id = None;
    Ok((process, process_group_id))
}

fn spawn_channels(
    handle: &Handle,
    connection_info: ConnectionInfo,
    session_id: String,
    freshly_spawned: bool,
) -> ChannelHandle {
    ChannelHandle::spawn(handle, move |end| {
        run_channels(connection_info, session_id, freshly_spawned, end)
    })
}

async fn run_channels(
    connection_info: ConnectionInfo,
    session_id: String,
    freshly_spawned: bool,
    end: ChannelTaskEnd,
) {
    let ChannelTaskEnd {
        ready_tx,
        iopub_tx,
        stdin_tx,
        mut cmd_rx,
    } = end;

    if freshly_spawned {
        tokio::time::sleep(SPAWN_GRACE).await;
    }

    let connected = async {
        let iopub =
            runtimelib::create_client_iopub_connection(&connection_info, "", &session_id).await?;

        let identity = runtimelib::peer_identity_for_session(&session_id)?;
        let mut shell = runtimelib::create_client_shell_connection_with_identity(
            &connection_info,
            &session_id,
            identity.clone(),
        )
        .await?;
        let stdin = runtimelib::create_client_stdin_connection_with_identity(
            &connection_info,
            &session_id,
            identity,
        )
        .await?;

        let request: JupyterMessage = KernelInfoRequest::default().into();
        shell.send(request).await?;
        let reply = tokio::time::timeout(HANDSHAKE_TIMEOUT, shell.read())
            .await
            .map_err(|_| anyhow!("Kernel did not respond within 30s"))?
            .map_err(|e| anyhow!("Kernel did not respond: {e}"))?;
        info!("[zmq] Kernel alive: got {} reply", reply.header.msg_type);

        let language = match &reply.content {
            JupyterMessageContent::KernelInfoReply(info) => Some(info.language_info.name.clone()),
            _ => None,
        };
        let (shell_writer, shell_reader) = shell.split();
        anyhow::Ok((iopub, shell_writer, shell_reader, stdin, language))
    }
    .await;

    let (mut iopub, mut shell_writer, mut shell_reader, mut stdin, language) = match connected {
        Ok(conns) => conns,
        Err(e) => {
            error!("[zmq] Failed to connect to kernel: {e}");
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    // Startup chatter (the kernel_info status pair) must not reach the first cell.
    let deadline = tokio::time::Instant::now() + STARTUP_FLUSH;
    while let Ok(Ok(message)) = tokio::time::timeout_at(deadline, iopub.read()).await {
        debug!("[zmq] Discarding startup {}", message.header.msg_type);
    }
    if ready_tx.send(Ok(language)).is_err() {
        return;
    }

    let mut pending_input: Option<JupyterMessage> = None;
    loop {
        tokio::select! {
            result = iopub.read() => {
                match result {
                    Ok(message) => {
                        debug!("[zmq] iopub: type={}", message.header.msg_type);
                        if iopub_tx.send(KernelMessage::from(&message.content)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!("[zmq] iopub read error: {e}");
                        break;
                    }
                }
            }
            result = stdin.read() => {
                match result {
                    Ok(message) => {
                        let request = StdinRequest::from(&message.content);
                        if matches!(request, StdinRequest::Input { .. }) {
                            pending_input = Some(message);
                        }
                        if stdin_tx.send(request).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!("[zmq] stdin read error: {e}");
                        break;
                    }
                }
            }
            result = shell_reader.read() => {
                match result {
                    Ok(message) => debug!("[zmq] shell reply: type={}", message.header.msg_type),
                    Err(e) => {
                        error!("[zmq] shell read error: {e}");
                        break;
                    }
                }
            }
            command = cmd_rx.recv() => {
                let result: Result<()> = match command {
                    None => break,
                    Some(ChannelCommand::Execute(code)) => {
                        let mut request = ExecuteRequest::new(code);
                        request.allow_stdin = true;
                        let message: JupyterMessage = request.into();
                        debug!("[zmq] Sending execute_request {}", message.header.msg_id);
                        shell_writer.send(message).await.map_err(anyhow::Error::from)
                    }
                    Some(ChannelCommand::Input(value)) => match pending_input.take() {
                        Some(request) => {
                            let reply = InputReply {
                                value,
                                status: ReplyStatus::Ok,
                                error: None,
                            };
                            stdin.send(reply.as_child_of(&request)).await.map_err(anyhow::Error::from)
                        }
                        None => {
                            warn!("[zmq] Input supplied but the kernel did not ask for any");
                            Ok(())
                        }
                    },
                    Some(ChannelCommand::Interrupt) => {
                        send_interrupt(&connection_info, &session_id).await
                    }
                };
                if let Err(e) = result {
                    error!("[zmq] Command failed: {e}");
                }
            }
        }
    }
    debug!("[zmq] Channel task finished");
}

async fn send_interrupt(connection_info: &ConnectionInfo, session_id: &str) -> Result<()> {
    let mut control =
        runtimelib::create_client_control_connection(connection_info, session_id).await?;
    let request: JupyterMessage = InterruptRequest {}.into();
    control.send(request).await?;
    info!("[zmq] Sent interrupt_request");
    Ok(())
}

impl KernelTransport for ZmqKernel {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn poll_ready(&mut self) -> Result<bool> {
        self.channels.poll_ready()
    }

    fn try_iopub(&mut self) -> Option<KernelMessage> {
        self.channels.try_iopub()
    }

    fn try_stdin(&mut self) -> Option<StdinRequest> {
        self.channels.try_stdin()
    }

    fn execute(&mut self, code: &str) -> Result<()> {
        self.channels.send(ChannelCommand::Execute(code.to_string()))
    }

    fn send_input(&mut self, value: &str) -> Result<()> {
        self.channels.send(ChannelCommand::Input(value.to_string()))
    }

    fn interrupt(&mut self) -> Result<()> {
        self.channels.send(ChannelCommand::Interrupt)
    }

    fn restart(&mut self) -> Result<()> {
        let (Some(kernelspec), Some(connection_file)) =
            (self.kernelspec.clone(), self.connection_file.clone())
        else {
            return Err(anyhow!("Restarting an attached kernel is not supported"));
        };

        info!("[zmq] Restarting kernel");
        self.channels.abort();
        self.kill_process();
        let (process, process_group_id) = self
            .handle
            .block_on(spawn_kernel(kernelspec, &connection_file))?;
        self.process = Some(process);
        self.process_group_id = process_group_id;
        self.session_id = Uuid::new_v4().to_string();
        self.channels = spawn_channels(
            &self.handle,
            self.connection_info.clone(),
            self.session_id.clone(),
            true,
        );
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        self.channels.abort();
        if self.kind == TransportKind::External {
            info!("[zmq] Detached from external kernel");
            return Ok(());
        }

        info!("[zmq] Shutting down kernel");
        let connection_info = self.connection_info.clone();
        let session_id = self.session_id.clone();
        let graceful = self.handle.block_on(async move {
            let mut control =
                runtimelib::create_client_control_connection(&connection_info, &session_id)
                    .await?;
            let request: JupyterMessage = ShutdownRequest { restart: false }.into();
            tokio::time::timeout(Duration::from_secs(2), control.send(request))
                .await
                .map_err(|_| anyhow!("timed out sending shutdown_request"))??;
            anyhow::Ok(())
        });
        if let Err(e) = graceful {
            warn!("[zmq] Graceful shutdown failed: {e}");
        }

        self.kill_process();
        if let Some(path) = self.connection_file.take() {
            let _ = std::fs::remove_file(path);
        }
        Ok(())
    }

    fn language(&self) -> Option<String> {
        self.channels.language()
    }
}

impl Drop for ZmqKernel {
    fn drop(&mut self) {
        self.channels.abort();
        self.kill_process();
        if let Some(ref path) = self.connection_file {
            let _ = std::fs::remove_file(path);
        }
    }
}
