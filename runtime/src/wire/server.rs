use std::sync::{Arc, OnceLock};

use nanobot_mcp_core::{Message, PendingRequests, RequestId, Waited};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use super::WireHandler;
use crate::error::{Error, Result};

const READ_QUEUE_DEPTH: usize = 64;

/// In-process bridge to a handler living in the same process.
///
/// Requests go in through [`ServerWire::exchange`]; replies from the handler resolve the
/// exchange, and anything else the handler sends is queued for [`ServerWire::read`].
#[derive(Clone)]
pub struct ServerWire {
    inner: Arc<ServerWireInner>,
}

struct ServerWireInner {
    session_id: String,
    pending: PendingRequests,
    handler: OnceLock<WireHandler>,
    read_tx: mpsc::Sender<Message>,
    read_rx: Mutex<mpsc::Receiver<Message>>,
    closed: CancellationToken,
}

struct CloseSlot {
    pending: PendingRequests,
    id: RequestId,
}

impl Drop for CloseSlot {
    fn drop(&mut self) {
        self.pending.close(&self.id);
    }
}

impl ServerWire {
    pub fn new(session_id: impl Into<String>) -> Self {
        let (read_tx, read_rx) = mpsc::channel(READ_QUEUE_DEPTH);
        Self {
            inner: Arc::new(ServerWireInner {
                session_id: session_id.into(),
                pending: PendingRequests::new(),
                handler: OnceLock::new(),
                read_tx,
                read_rx: Mutex::new(read_rx),
                closed: CancellationToken::new(),
            }),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub async fn start(&self, handler: WireHandler) -> Result<()> {
        self.inner
            .handler
            .set(handler)
            .map_err(|_| Error::transport("server wire already started"))
    }

    fn handler(&self) -> Result<WireHandler> {
        self.inner
            .handler
            .get()
            .cloned()
            .ok_or(Error::NotInitialized)
    }

    /// Runs `msg` through the handler and returns its reply, or [`Error::NoResponse`] when
    /// the handler finished without one.
    pub async fn exchange(&self, msg: Message) -> Result<Message> {
        let handler = self.handler()?;
        if self.inner.closed.is_cancelled() {
            return Err(Error::SessionClosed);
        }
        let Some(id) = msg.id.clone() else {
            handler(msg).await;
            return Err(Error::NoResponse);
        };

        let waiter = self.inner.pending.wait_for(id.clone())?;
        let close = CloseSlot {
            pending: self.inner.pending.clone(),
            id,
        };
        tokio::spawn(async move {
            let _close = close;
            handler(msg).await;
        });

        tokio::select! {
            waited = waiter.recv() => match waited {
                Waited::Response(resp) => Ok(resp),
                Waited::Closed => Err(Error::NoResponse),
            },
            _ = self.inner.closed.cancelled() => Err(Error::SessionClosed),
        }
    }

    /// Hands `msg` to the handler without waiting for it to finish.
    pub fn deliver(&self, msg: Message) -> Result<()> {
        let handler = self.handler()?;
        tokio::spawn(handler(msg));
        Ok(())
    }

    /// Outbound path: resolves a pending exchange or queues the message for `read`.
    pub async fn send(&self, msg: Message) -> Result<()> {
        if msg.is_response()
            && let Some(id) = &msg.id
            && self.inner.pending.contains(id)
            && self.inner.pending.notify(msg.clone())
        {
            return Ok(());
        }
        tokio::select! {
            sent = self.inner.read_tx.send(msg) => sent.map_err(|_| Error::SessionClosed),
            _ = self.inner.closed.cancelled() => Err(Error::SessionClosed),
        }
    }

    /// Next queued server-initiated message, or `None` once the wire is closed.
    pub async fn read(&self) -> Option<Message> {
        let mut rx = self.inner.read_rx.lock().await;
        tokio::select! {
            msg = rx.recv() => msg,
            _ = self.inner.closed.cancelled() => None,
        }
    }

    pub fn close(&self) {
        self.inner.closed.cancel();
        self.inner.pending.close_all();
    }

    pub async fn wait(&self) {
        self.inner.closed.cancelled().await
    }
}
