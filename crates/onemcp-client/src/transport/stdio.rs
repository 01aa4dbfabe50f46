//! Stdio transport: a child process speaking newline-delimited JSON-RPC on
//! stdin/stdout, stderr forwarded to tracing.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, warn};

use onemcp_protocol::{JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

use crate::error::{ClientResult, TransportError};
use crate::transport::{
    await_response, dispatch_incoming, drain_pending, register_pending, EventReceiver, PendingMap,
    Transport, TransportEvent, TransportKind,
};

/// Spawn configuration for a stdio server.
#[derive(Debug, Clone)]
pub struct StdioConfig {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub request_timeout: Duration,
}

impl StdioConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            request_timeout: Duration::from_secs(60),
        }
    }
}

/// Transport over a child process.
pub struct StdioTransport {
    config: StdioConfig,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    pending: PendingMap,
    connected: Arc<AtomicBool>,
    events: Option<EventReceiver>,
    reader_task: Option<tokio::task::JoinHandle<()>>,
    stderr_task: Option<tokio::task::JoinHandle<()>>,
}

impl StdioTransport {
    pub fn new(config: StdioConfig) -> Self {
        Self {
            config,
            child: None,
            stdin: None,
            pending: PendingMap::default(),
            connected: Arc::new(AtomicBool::new(false)),
            events: None,
            reader_task: None,
            stderr_task: None,
        }
    }

    async fn write_message(&mut self, message: &impl serde::Serialize) -> ClientResult<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or(TransportError::NotStarted)?;
        let mut line = serde_json::to_string(message)?;
        line.push('\n');
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| TransportError::Stdio(format!("write failed: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| TransportError::Stdio(format!("flush failed: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    async fn start(&mut self) -> ClientResult<()> {
        let mut command = Command::new(&self.config.command);
        command
            .args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.config.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|e| {
            TransportError::ConnectionFailed(format!(
                "failed to spawn '{}': {e}",
                self.config.command
            ))
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Stdio("child stdout unavailable".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TransportError::Stdio("child stderr unavailable".into()))?;
        self.stdin = Some(
            child
                .stdin
                .take()
                .ok_or_else(|| TransportError::Stdio("child stdin unavailable".into()))?,
        );

        let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
        self.events = Some(events_rx);
        self.connected.store(true, Ordering::SeqCst);

        let command_name = self.config.command.clone();
        self.stderr_task = Some(tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(command = %command_name, "stderr: {line}");
            }
        }));

        let pending = self.pending.clone();
        let connected = self.connected.clone();
        self.reader_task = Some(tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match JsonRpcMessage::from_str(&line) {
                            Ok(message) => dispatch_incoming(message, &pending, &events_tx),
                            Err(e) => warn!("discarding unparseable line from server: {e}"),
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = events_tx.send(TransportEvent::Error(e.to_string()));
                        break;
                    }
                }
            }
            connected.store(false, Ordering::SeqCst);
            drain_pending(&pending);
            let _ = events_tx.send(TransportEvent::Closed);
        }));

        self.child = Some(child);
        Ok(())
    }

    async fn send_request(&mut self, request: JsonRpcRequest) -> ClientResult<JsonRpcResponse> {
        let rx = register_pending(&self.pending, request.id.clone());
        if let Err(e) = self.write_message(&request).await {
            self.pending
                .lock()
                .expect("pending map lock poisoned")
                .remove(&request.id);
            return Err(e);
        }
        await_response(rx).await
    }

    async fn send_notification(&mut self, notification: JsonRpcNotification) -> ClientResult<()> {
        self.write_message(&notification).await
    }

    async fn send_response(&mut self, response: JsonRpcResponse) -> ClientResult<()> {
        self.write_message(&response).await
    }

    async fn close(&mut self) -> ClientResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
        drain_pending(&self.pending);
        self.stdin = None;
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                warn!(command = %self.config.command, "failed to kill child: {e}");
            }
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn request_timeout(&self) -> Duration {
        self.config.request_timeout
    }

    fn take_event_receiver(&mut self) -> Option<EventReceiver> {
        self.events.take()
    }
}
