//! Transports that move [`Message`]s between a session and its peer.

mod http;
mod server;
mod stdio;

use std::sync::Arc;

use futures::future::BoxFuture;
use nanobot_mcp_core::Message;

use crate::error::Result;

pub use http::{
    EVENT_STREAM_MIME_TYPE, HEADER_LAST_EVENT_ID, HEADER_SESSION_ID, HttpClientOptions, HttpClientWire,
    JSON_MIME_TYPE,
};
pub use server::ServerWire;
pub use stdio::StdioWire;

/// Inbound delivery callback. The returned future completes once the message is handled.
pub type WireHandler = Arc<dyn Fn(Message) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Clone)]
pub enum Wire {
    Stdio(StdioWire),
    Http(HttpClientWire),
    Server(ServerWire),
}

impl Wire {
    pub async fn start(&self, handler: WireHandler) -> Result<()> {
        match self {
            Wire::Stdio(w) => w.start(handler).await,
            Wire::Http(w) => w.start(handler).await,
            Wire::Server(w) => w.start(handler).await,
        }
    }

    pub async fn send(&self, msg: Message) -> Result<()> {
        match self {
            Wire::Stdio(w) => w.send(msg).await,
            Wire::Http(w) => w.send(msg).await,
            Wire::Server(w) => w.send(msg).await,
        }
    }

    pub fn close(&self) {
        match self {
            Wire::Stdio(w) => w.close(),
            Wire::Http(w) => w.close(),
            Wire::Server(w) => w.close(),
        }
    }

    pub async fn wait(&self) {
        match self {
            Wire::Stdio(w) => w.wait().await,
            Wire::Http(w) => w.wait().await,
            Wire::Server(w) => w.wait().await,
        }
    }

    pub fn session_id(&self) -> Option<String> {
        match self {
            Wire::Stdio(_) => None,
            Wire::Http(w) => w.session_id(),
            Wire::Server(w) => Some(w.session_id().to_string()),
        }
    }
}

impl From<StdioWire> for Wire {
    fn from(value: StdioWire) -> Self {
        Wire::Stdio(value)
    }
}

impl From<HttpClientWire> for Wire {
    fn from(value: HttpClientWire) -> Self {
        Wire::Http(value)
    }
}

impl From<ServerWire> for Wire {
    fn from(value: ServerWire) -> Self {
        Wire::Server(value)
    }
}
