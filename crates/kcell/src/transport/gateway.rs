//! Remote kernels behind a Jupyter Server / Kernel Gateway REST API.
//!
//! The kernel is created with `POST /api/kernels` and all channels share one
//! WebSocket at `/api/kernels/{id}/channels`; frames are routed by their
//! `channel` field.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use futures::{SinkExt, StreamExt};
use jupyter_protocol::{
    Channel, ExecuteRequest, Header, InputReply, JupyterMessage, JupyterMessageContent,
    ReplyStatus,
};
use log::{debug, error, info, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::runtime::Handle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use super::{ChannelCommand, ChannelHandle, ChannelTaskEnd, KernelTransport, TransportKind};
use crate::message::{KernelMessage, StdinRequest};

const READY_POLL: Duration = Duration::from_millis(250);
const READY_TIMEOUT: Duration = Duration::from_secs(60);
const STARTUP_FLUSH: Duration = Duration::from_millis(200);

/// A parsed gateway kernel name: `http(s)://host[:port][/kernel_name][?token=T]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayUrl {
    pub base: Url,
    pub token: Option<String>,
    pub kernel_name: Option<String>,
}

impl GatewayUrl {
    pub fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw).with_context(|| format!("Invalid gateway URL: {raw}"))?;
        if url.host_str().is_none() {
            bail!("Gateway URL has no host: {raw}");
        }
        let token = url
            .query_pairs()
            .find(|(key, _)| key == "token")
            .map(|(_, value)| value.into_owned());
        let kernel_name = url
            .path_segments()
            .and_then(|mut segments| segments.find(|s| !s.is_empty()))
            .map(str::to_string);

        let mut base = url.clone();
        base.set_path("");
        base.set_query(None);
        base.set_fragment(None);
        Ok(Self {
            base,
            token,
            kernel_name,
        })
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base.as_str().trim_end_matches('/'), path)
    }

    /// WebSocket URL of a kernel's channels.
    pub fn channels_url(&self, kernel_id: &str) -> Result<String> {
        let mut ws = self.base.clone();
        let scheme = if self.base.scheme() == "https" {
            "wss"
        } else {
            "ws"
        };
        ws.set_scheme(scheme)
            .map_err(|_| anyhow!("Cannot derive WebSocket URL from {}", self.base))?;
        ws.set_path(&format!("/api/kernels/{kernel_id}/channels"));
        Ok(ws.to_string())
    }

    fn authorization(&self) -> Option<String> {
        self.token.as_ref().map(|token| format!("token {token}"))
    }
}

#[derive(Debug, Deserialize)]
struct KernelModel {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    execution_state: Option<String>,
}

/// A WebSocket frame as sent by the server.
#[derive(Debug, Deserialize)]
struct GatewayFrame {
    header: Header,
    #[serde(
        default,
        deserialize_with = "jupyter_protocol::deserialize_parent_header"
    )]
    parent_header: Option<Header>,
    #[serde(default)]
    metadata: Value,
    #[serde(default)]
    content: Value,
    #[serde(default)]
    channel: Option<Channel>,
}

impl TryFrom<GatewayFrame> for JupyterMessage {
    type Error = anyhow::Error;

    fn try_from(frame: GatewayFrame) -> Result<Self> {
        let content =
            JupyterMessageContent::from_type_and_content(&frame.header.msg_type, frame.content)?;
        Ok(JupyterMessage {
            zmq_identities: Vec::new(),
            header: frame.header,
            parent_header: frame.parent_header,
            metadata: frame.metadata,
            content,
            buffers: Vec::new(),
            channel: frame.channel,
        })
    }
}

fn to_frame(message: &JupyterMessage, channel: &str) -> Result<String> {
    let parent_header = match &message.parent_header {
        Some(header) => serde_json::to_value(header)?,
        None => json!({}),
    };
    Ok(serde_json::to_string(&json!({
        "header": message.header,
        "parent_header": parent_header,
        "metadata": message.metadata,
        "content": message.content,
        "channel": channel,
        "buffers": [],
    }))?)
}

#[derive(Clone)]
struct RestClient {
    http: reqwest::Client,
    url: GatewayUrl,
}

impl RestClient {
    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, self.url.endpoint(path));
        match self.url.authorization() {
            Some(auth) => builder.header(reqwest::header::AUTHORIZATION, auth),
            None => builder,
        }
    }

    async fn create_kernel(&self) -> Result<KernelModel> {
        let body = match &self.url.kernel_name {
            Some(name) => json!({ "name": name }),
            None => json!({}),
        };
        let response = self
            .request(reqwest::Method::POST, "/api/kernels")
            .json(&body)
            .send()
            .await?
            .error_for_status()
            .context("Could not connect to Jupyter Server API. The URL specified may be incorrect.")?;
        Ok(response.json().await?)
    }

    async fn kernel(&self, kernel_id: &str) -> Result<KernelModel> {
        Ok(self
            .request(reqwest::Method::GET, &format!("/api/kernels/{kernel_id}"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    async fn post(&self, kernel_id: &str, action: &str) -> Result<()> {
        self.request(
            reqwest::Method::POST,
            &format!("/api/kernels/{kernel_id}/{action}"),
        )
        .send()
        .await?
        .error_for_status()?;
        Ok(())
    }

    async fn delete(&self, kernel_id: &str) -> Result<()> {
        self.request(reqwest::Method::DELETE, &format!("/api/kernels/{kernel_id}"))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn language(&self, kernel_name: &str) -> Option<String> {
        let spec: Value = self
            .request(
                reqwest::Method::GET,
                &format!("/api/kernelspecs/{kernel_name}"),
            )
            .send()
            .await
            .ok()?
            .json()
            .await
            .ok()?;
        spec.pointer("/spec/language")
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

pub(crate) struct GatewayKernel {
    handle: Handle,
    rest: RestClient,
    kernel_id: String,
    kernel_name: Option<String>,
    channels: ChannelHandle,
}

impl GatewayKernel {
    pub fn start(handle: Handle, raw_url: &str) -> Result<Self> {
        let url = GatewayUrl::parse(raw_url)?;
        let rest = RestClient {
            http: reqwest::Client::new(),
            url,
        };
        let model = handle.block_on(rest.create_kernel())?;
        info!("[gateway] Created kernel {} at {}", model.id, rest.url.base);

        let kernel_name = model.name.clone().or_else(|| rest.url.kernel_name.clone());
        let channels = spawn_channels(&handle, rest.clone(), model.id.clone(), kernel_name.clone());
        Ok(Self {
            handle,
            rest,
            kernel_id: model.id,
            kernel_name,
            channels,
        })
    }
}

fn spawn_channels(
    handle: &Handle,
    rest: RestClient,
    kernel_id: String,
    kernel_name: Option<String>,
) -> ChannelHandle {
    ChannelHandle::spawn(handle, move |end| {
        run_channels(rest, kernel_id, kernel_name, end)
    })
}

async fn wait_for_idle(rest: &RestClient, kernel_id: &str) -> Result<()> {
    let deadline = tokio::time::Instant::now() + READY_TIMEOUT;
    loop {
        let model = rest.kernel(kernel_id).await?;
        if model.execution_state.as_deref() == Some("idle") {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("Kernel {kernel_id} did not become idle within 60s");
        }
        tokio::time::sleep(READY_POLL).await;
    }
}

async fn run_channels(
    rest: RestClient,
    kernel_id: String,
    kernel_name: Option<String>,
    end: ChannelTaskEnd,
) {
    let ChannelTaskEnd {
        ready_tx,
        iopub_tx,
        stdin_tx,
        mut cmd_rx,
    } = end;

    let connected = async {
        let mut request = rest.url.channels_url(&kernel_id)?.into_client_request()?;
        if let Some(auth) = rest.url.authorization() {
            request
                .headers_mut()
                .insert("Authorization", HeaderValue::from_str(&auth)?);
        }
        let (ws_stream, _) = connect_async(request).await?;
        wait_for_idle(&rest, &kernel_id).await?;
        anyhow::Ok(ws_stream)
    }
    .await;

    let ws_stream = match connected {
        Ok(ws_stream) => ws_stream,
        Err(e) => {
            error!("[gateway] Failed to connect to kernel {kernel_id}: {e}");
            let _ = ready_tx.send(Err(e));
            return;
        }
    };
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let deadline = tokio::time::Instant::now() + STARTUP_FLUSH;
    while let Ok(Some(_)) = tokio::time::timeout_at(deadline, ws_receiver.next()).await {
        debug!("[gateway] Discarding startup frame");
    }

    let language = match &kernel_name {
        Some(name) => rest.language(name).await,
        None => None,
    };
    if ready_tx.send(Ok(language)).is_err() {
        return;
    }

    let mut pending_input: Option<JupyterMessage> = None;
    loop {
        tokio::select! {
            frame = ws_receiver.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(_))) => {
                        debug!("[gateway] Ignoring binary frame");
                        continue;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("[gateway] WebSocket closed");
                        break;
                    }
                    Some(Err(e)) => {
                        error!("[gateway] WebSocket error: {e}");
                        break;
                    }
                    Some(Ok(_)) => continue,
                };
                let message = match serde_json::from_str::<GatewayFrame>(&text)
                    .map_err(anyhow::Error::from)
                    .and_then(JupyterMessage::try_from)
                {
                    Ok(message) => message,
                    Err(e) => {
                        warn!("[gateway] Dropping malformed frame: {e}");
                        continue;
                    }
                };
                match message.channel {
                    Some(Channel::IOPub) => {
                        if iopub_tx.send(KernelMessage::from(&message.content)).is_err() {
                            break;
                        }
                    }
                    Some(Channel::Stdin) => {
                        let request = StdinRequest::from(&message.content);
                        if matches!(request, StdinRequest::Input { .. }) {
                            pending_input = Some(message);
                        }
                        if stdin_tx.send(request).is_err() {
                            break;
                        }
                    }
                    _ => debug!("[gateway] {} reply", message.header.msg_type),
                }
            }
            command = cmd_rx.recv() => {
                let result = match command {
                    None => break,
                    Some(ChannelCommand::Execute(code)) => {
                        let mut request = ExecuteRequest::new(code);
                        request.allow_stdin = true;
                        let message: JupyterMessage = request.into();
                        match to_frame(&message, "shell") {
                            Ok(frame) => ws_sender
                                .send(Message::Text(frame))
                                .await
                                .map_err(anyhow::Error::from),
                            Err(e) => Err(e),
                        }
                    }
                    Some(ChannelCommand::Input(value)) => match pending_input.take() {
                        Some(request) => {
                            let reply = InputReply {
                                value,
                                status: ReplyStatus::Ok,
                                error: None,
                            };
                            match to_frame(&reply.as_child_of(&request), "stdin") {
                                Ok(frame) => ws_sender
                                    .send(Message::Text(frame))
                                    .await
                                    .map_err(anyhow::Error::from),
                                Err(e) => Err(e),
                            }
                        }
                        None => {
                            warn!("[gateway] Input supplied but the kernel did not ask for any");
                            Ok(())
                        }
                    },
                    Some(ChannelCommand::Interrupt) => rest.post(&kernel_id, "interrupt").await,
                };
                if let Err(e) = result {
                    error!("[gateway] Command failed: {e}");
                }
            }
        }
    }
    debug!("[gateway] Channel task finished");
}

impl KernelTransport for GatewayKernel {
    fn kind(&self) -> TransportKind {
        TransportKind::Gateway
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
        info!("[gateway] Restarting kernel {}", self.kernel_id);
        self.channels.abort();
        self.handle.block_on(self.rest.post(&self.kernel_id, "restart"))?;
        self.channels = spawn_channels(
            &self.handle,
            self.rest.clone(),
            self.kernel_id.clone(),
            self.kernel_name.clone(),
        );
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        self.channels.abort();
        info!("[gateway] Deleting kernel {}", self.kernel_id);
        self.handle.block_on(self.rest.delete(&self.kernel_id))
    }

    fn language(&self) -> Option<String> {
        self.channels.language()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_gateway_url_with_token_and_kernel() {
        let url = GatewayUrl::parse("http://localhost:8888/python3?token=abc123").unwrap();
        assert_eq!(url.token.as_deref(), Some("abc123"));
        assert_eq!(url.kernel_name.as_deref(), Some("python3"));
        assert_eq!(url.endpoint("/api/kernels"), "http://localhost:8888/api/kernels");
        assert_eq!(url.authorization().as_deref(), Some("token abc123"));
    }

    #[test]
    fn test_parse_gateway_url_without_token() {
        let url = GatewayUrl::parse("https://hub.example.com").unwrap();
        assert_eq!(url.token, None);
        assert_eq!(url.kernel_name, None);
        assert_eq!(
            url.channels_url("k-1").unwrap(),
            "wss://hub.example.com/api/kernels/k-1/channels"
        );
    }

    #[test]
    fn test_invalid_gateway_url() {
        assert!(GatewayUrl::parse("http://").is_err());
    }

    #[test]
    fn test_frame_routing_fields() {
        let text = r#"{
            "header": {
                "date": "2025-05-14T14:32:23.490Z",
                "msg_id": "m1",
                "msg_type": "stream",
                "session": "s1",
                "username": "",
                "version": "5.3"
            },
            "parent_header": {},
            "metadata": {},
            "content": {"name": "stdout", "text": "hi\n"},
            "channel": "iopub"
        }"#;
        let frame: GatewayFrame = serde_json::from_str(text).unwrap();
        let message = JupyterMessage::try_from(frame).unwrap();
        assert!(matches!(message.channel, Some(Channel::IOPub)));
        assert!(matches!(
            KernelMessage::from(&message.content),
            KernelMessage::Stream { ref text, .. } if text == "hi\n"
        ));
    }

    #[test]
    fn test_execute_frame_shape() {
        let message: JupyterMessage = ExecuteRequest::new("1 + 1".into()).into();
        let frame: Value = serde_json::from_str(&to_frame(&message, "shell").unwrap()).unwrap();
        assert_eq!(frame["channel"], "shell");
        assert_eq!(frame["header"]["msg_type"], "execute_request");
        assert_eq!(frame["content"]["code"], "1 + 1");
        assert_eq!(frame["parent_header"], json!({}));
    }
}
