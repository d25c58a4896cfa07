use std::collections::HashMap;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use nanobot_mcp_core::Message;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use super::WireHandler;
use crate::error::{Error, Result};

type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;
type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Newline-delimited JSON over a pipe pair, usually a child process's stdin/stdout.
#[derive(Clone)]
pub struct StdioWire {
    inner: Arc<StdioInner>,
}

struct StdioInner {
    name: String,
    writer: tokio::sync::Mutex<BoxedWriter>,
    reader: Mutex<Option<BoxedReader>>,
    child: Mutex<Option<Child>>,
    closed: CancellationToken,
}

impl StdioWire {
    pub fn new<R, W>(name: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + 'static,
        W: AsyncWrite + Send + 'static,
    {
        Self {
            inner: Arc::new(StdioInner {
                name: name.into(),
                writer: tokio::sync::Mutex::new(Box::pin(writer)),
                reader: Mutex::new(Some(Box::pin(reader))),
                child: Mutex::new(None),
                closed: CancellationToken::new(),
            }),
        }
    }

    /// Launches `command` and speaks to it over its stdin/stdout. Stderr goes to the log.
    pub fn spawn(
        name: impl Into<String>,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<Self> {
        let name = name.into();
        let mut child = Command::new(command)
            .args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::transport(format!("failed to start {command}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::transport("child stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::transport("child stdout unavailable"))?;
        if let Some(stderr) = child.stderr.take() {
            let server = name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target = "stdio", server = %server, line = %line, "stderr");
                }
            });
        }
        tracing::info!(target = "stdio", server = %name, command = %command, pid = ?child.id(), "process_started");

        let wire = Self::new(name, stdout, stdin);
        if let Ok(mut slot) = wire.inner.child.lock() {
            *slot = Some(child);
        }
        Ok(wire)
    }

    pub async fn start(&self, handler: WireHandler) -> Result<()> {
        let reader = self
            .inner
            .reader
            .lock()
            .ok()
            .and_then(|mut r| r.take())
            .ok_or_else(|| Error::transport("stdio wire already started"))?;
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.read_loop(reader, handler).await });
        Ok(())
    }

    pub async fn send(&self, msg: Message) -> Result<()> {
        if self.inner.closed.is_cancelled() {
            return Err(Error::SessionClosed);
        }
        let mut line = serde_json::to_vec(&msg)?;
        line.push(b'\n');
        let mut writer = self.inner.writer.lock().await;
        writer.write_all(&line).await?;
        writer.flush().await?;
        Ok(())
    }

    pub fn close(&self) {
        self.inner.closed.cancel();
        if let Ok(mut child) = self.inner.child.lock()
            && let Some(child) = child.as_mut()
        {
            let _ = child.start_kill();
        }
    }

    pub async fn wait(&self) {
        self.inner.closed.cancelled().await
    }
}

impl StdioInner {
    async fn read_loop(&self, reader: BoxedReader, handler: WireHandler) {
        let mut lines = BufReader::new(reader).lines();
        loop {
            let line = tokio::select! {
                _ = self.closed.cancelled() => break,
                line = lines.next_line() => line,
            };
            match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Message>(line) {
                        Ok(msg) => {
                            tokio::spawn(handler(msg));
                        }
                        Err(e) => {
                            tracing::warn!(target = "stdio", server = %self.name, error = %e, "invalid_message");
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(target = "stdio", server = %self.name, error = %e, "read_failed");
                    break;
                }
            }
        }
        tracing::debug!(target = "stdio", server = %self.name, "reader_stopped");
        self.closed.cancel();
    }
}
