use std::sync::Arc;

use nanobot_mcp_core::types::{InitializeRequest, InitializeResult};
use nanobot_mcp_core::{Message, SessionState};

use crate::error::Result;
use crate::session::{MessageHandler, Session, SessionOptions};
use crate::wire::{ServerWire, Wire};

/// Server side of a session whose peer talks to us through an outer adapter (HTTP or
/// stdio) rather than a wire we own.
#[derive(Clone)]
pub struct ServerSession {
    session: Arc<Session>,
    wire: ServerWire,
}

impl ServerSession {
    pub async fn new(handler: Arc<dyn MessageHandler>, opts: SessionOptions) -> Result<Self> {
        Self::from_state(
            SessionState {
                id: uuid::Uuid::new_v4().to_string(),
                ..Default::default()
            },
            handler,
            opts,
        )
        .await
    }

    /// Rebuilds a session from a persisted snapshot, keeping its id.
    pub async fn from_state(
        state: SessionState,
        handler: Arc<dyn MessageHandler>,
        mut opts: SessionOptions,
    ) -> Result<Self> {
        let wire = ServerWire::new(state.id.clone());
        opts.state = Some(state);
        let session = Session::start(Wire::Server(wire.clone()), handler, opts).await?;
        Ok(Self { session, wire })
    }

    pub fn id(&self) -> String {
        self.session.id()
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Feeds a client message to the handler and waits for its reply.
    ///
    /// Returns [`crate::Error::NoResponse`] for notifications and for requests the handler
    /// left unanswered.
    pub async fn exchange(&self, msg: Message) -> Result<Message> {
        let is_initialize = msg.method == "initialize" && msg.is_request();
        if is_initialize && let Ok(req) = msg.params_as::<InitializeRequest>() {
            self.session.set_initialize_request(req);
        }
        let resp = self.wire.exchange(msg).await?;
        if is_initialize
            && resp.error.is_none()
            && let Some(result) = &resp.result
            && let Ok(result) = serde_json::from_value::<InitializeResult>(result.clone())
        {
            self.session.set_initialize_result(result);
        }
        Ok(resp)
    }

    /// Hands a client message to the handler without waiting for the outcome.
    pub fn deliver(&self, msg: Message) -> Result<()> {
        self.wire.deliver(msg)
    }

    /// Next server-initiated message for the client, or `None` once closed.
    pub async fn read(&self) -> Option<Message> {
        self.wire.read().await
    }

    pub fn close(&self) {
        self.session.close();
    }

    pub async fn wait(&self) {
        self.session.wait().await
    }
}
