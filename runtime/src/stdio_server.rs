use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use nanobot_mcp_core::Message;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;
use crate::server_session::ServerSession;
use crate::session::{MessageHandler, SessionOptions};
use crate::wire::{StdioWire, WireHandler};

/// Serves one [`ServerSession`] over a line-delimited pipe pair.
pub struct StdioServer {
    session: ServerSession,
    wire: StdioWire,
}

impl StdioServer {
    /// Starts reading `reader` and answering on `writer`. Server-initiated messages from the
    /// handler are written to `writer` as they are produced.
    pub async fn start<R, W>(
        env: HashMap<String, String>,
        handler: Arc<dyn MessageHandler>,
        opts: SessionOptions,
        reader: R,
        writer: W,
    ) -> Result<Self>
    where
        R: AsyncRead + Send + 'static,
        W: AsyncWrite + Send + 'static,
    {
        let session = ServerSession::new(handler, opts).await?;
        session.session().merge_env(env);
        let wire = StdioWire::new("stdio", reader, writer);

        let inbound = {
            let session = session.clone();
            let wire = wire.clone();
            let handler: WireHandler = Arc::new(move |msg: Message| -> BoxFuture<'static, ()> {
                let session = session.clone();
                let wire = wire.clone();
                Box::pin(async move { dispatch(&session, &wire, msg).await })
            });
            handler
        };
        wire.start(inbound).await?;

        let outbound_session = session.clone();
        let outbound_wire = wire.clone();
        tokio::spawn(async move {
            while let Some(msg) = outbound_session.read().await {
                if let Err(e) = outbound_wire.send(msg).await {
                    tracing::warn!(target = "stdio_server", error = %e, "write_failed");
                    break;
                }
            }
        });

        let closing_session = session.clone();
        let closing_wire = wire.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = closing_wire.wait() => {}
                _ = closing_session.wait() => {}
            }
            closing_wire.close();
            closing_session.close();
            tracing::debug!(target = "stdio_server", session_id = %closing_session.id(), "stopped");
        });

        tracing::info!(target = "stdio_server", session_id = %session.id(), "started");
        Ok(Self { session, wire })
    }

    /// Serves the process's own stdin/stdout until stdin closes.
    pub async fn serve(
        env: HashMap<String, String>,
        handler: Arc<dyn MessageHandler>,
        opts: SessionOptions,
    ) -> Result<()> {
        let server = Self::start(env, handler, opts, tokio::io::stdin(), tokio::io::stdout()).await?;
        server.wait().await;
        Ok(())
    }

    pub fn session(&self) -> &ServerSession {
        &self.session
    }

    pub fn close(&self) {
        self.wire.close();
        self.session.close();
    }

    pub async fn wait(&self) {
        self.wire.wait().await
    }
}

async fn dispatch(session: &ServerSession, wire: &StdioWire, msg: Message) {
    if !msg.is_request() {
        if let Err(e) = session.deliver(msg) {
            tracing::debug!(target = "stdio_server", error = %e, "deliver_failed");
        }
        return;
    }

    let id = msg.id.clone();
    let method = msg.method.clone();
    let reply = match session.exchange(msg).await {
        Ok(resp) => resp,
        Err(e) if e.is_no_response() => return,
        Err(e) => {
            tracing::debug!(target = "stdio_server", method = %method, error = %e, "exchange_failed");
            Message::error_response(id, e.to_rpc_error())
        }
    };
    if let Err(e) = wire.send(reply).await {
        tracing::warn!(target = "stdio_server", method = %method, error = %e, "write_failed");
    }
}
