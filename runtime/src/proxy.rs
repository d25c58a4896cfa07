use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use nanobot_mcp_core::logging::RpcEventPublisher;
use nanobot_mcp_core::types::{
    CreateMessageRequest, ElicitRequest, ElicitResult, Empty, InitializeRequest, ListRootsResult, Root,
};
use nanobot_mcp_core::Message;
use serde_json::Value as JsonValue;
use tokio::sync::{Mutex, OnceCell};

use crate::client::{
    Client, ClientOptions, ElicitCallback, MessageCallback, RootsCallback, SamplingCallback,
};
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::session::{ExchangeOptions, MessageHandler, Session};

/// Serves every downstream session by relaying it to its own upstream [`Client`].
///
/// The upstream client is a child of the downstream session: requests and notifications
/// flow up, server-initiated traffic flows back down.
pub struct ProxyHandler {
    upstream_name: String,
    upstream: ServerConfig,
    publisher: Option<Arc<dyn RpcEventPublisher>>,
    /// One cell per downstream session; the lock is never held while connecting.
    clients: Mutex<HashMap<String, Arc<OnceCell<Client>>>>,
}

impl ProxyHandler {
    pub fn new(upstream_name: impl Into<String>, upstream: ServerConfig) -> Self {
        Self {
            upstream_name: upstream_name.into(),
            upstream,
            publisher: None,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn RpcEventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Upstream clients that finished connecting.
    pub async fn upstream_count(&self) -> usize {
        self.clients
            .lock()
            .await
            .values()
            .filter(|cell| cell.initialized())
            .count()
    }

    async fn client(self: &Arc<Self>, downstream: &Arc<Session>) -> Result<Client> {
        let id = downstream.id();
        let cell = self.clients.lock().await.entry(id.clone()).or_default().clone();

        let connected = cell
            .get_or_try_init(|| async {
                let client =
                    Client::connect(&self.upstream_name, &self.upstream, self.client_options(downstream)).await?;
                self.close_with(downstream, id.clone());
                Ok::<_, Error>(client)
            })
            .await;
        match connected {
            Ok(client) => Ok(client.clone()),
            Err(e) => {
                let mut clients = self.clients.lock().await;
                if clients.get(&id).is_some_and(|c| Arc::ptr_eq(c, &cell) && !c.initialized()) {
                    clients.remove(&id);
                }
                Err(e)
            }
        }
    }

    /// Drops and closes the upstream client once the downstream session ends.
    fn close_with(self: &Arc<Self>, downstream: &Arc<Session>, id: String) {
        let this = self.clone();
        let lifetime = downstream.lifetime().clone();
        tokio::spawn(async move {
            lifetime.cancelled().await;
            let cell = this.clients.lock().await.remove(&id);
            if let Some(client) = cell.as_ref().and_then(|c| c.get()) {
                client.close(true).await;
            }
            tracing::debug!(target = "proxy", session_id = %id, "upstream_closed");
        });
    }

    fn client_options(&self, downstream: &Arc<Session>) -> ClientOptions {
        let init = downstream.initialize_request().unwrap_or_default();
        let caps = &init.capabilities;
        let mut opts = ClientOptions {
            client_name: (!init.client_info.name.is_empty()).then(|| init.client_info.name.clone()),
            client_version: Some(init.client_info.version.clone()),
            env: downstream.env(),
            parent: Some(downstream.clone()),
            publisher: self.publisher.clone(),
            cancel: Some(downstream.lifetime().child_token()),
            on_notify: Some(forward_down(downstream)),
            on_message: Some(forward_down(downstream)),
            ..Default::default()
        };
        if caps.sampling.is_some() {
            opts.on_sampling = Some(sampling_down(downstream));
        }
        if caps.elicitation.is_some() {
            opts.on_elicit = Some(elicit_down(downstream));
        }
        if caps.roots.is_some() {
            opts.on_roots = Some(roots_down(downstream));
        }
        opts
    }

    async fn handle(self: &Arc<Self>, downstream: &Arc<Session>, msg: Message) -> Result<()> {
        match msg.method.as_str() {
            "initialize" => {
                if let Ok(req) = msg.params_as::<InitializeRequest>() {
                    downstream.set_initialize_request(req);
                }
                let client = self.client(downstream).await?;
                let result = client
                    .session()
                    .initialize_result()
                    .ok_or_else(|| Error::Other("upstream did not complete initialize".into()))?;
                downstream.reply(&msg, result).await
            }
            "ping" => downstream.reply(&msg, Empty {}).await,
            "notifications/initialized" => Ok(()),
            _ if msg.is_request() => {
                let client = self.client(downstream).await?;
                let mut upstream = msg.clone();
                upstream.id = None;
                let resp = client
                    .session()
                    .exchange_message(upstream, ExchangeOptions::default())
                    .await?;
                let mut reply = resp;
                reply.id = msg.id.clone();
                downstream.send(reply).await
            }
            _ if msg.is_notification() => {
                let client = self.client(downstream).await?;
                client.session().send(msg).await
            }
            _ => {
                tracing::debug!(target = "proxy", session_id = %downstream.id(), id = ?msg.id, "unmatched_response");
                Ok(())
            }
        }
    }
}

/// Handler entry point; needs the shared handle to register cleanup tasks.
pub struct Proxy(pub Arc<ProxyHandler>);

impl Proxy {
    pub fn new(handler: ProxyHandler) -> Arc<Self> {
        Arc::new(Self(Arc::new(handler)))
    }
}

#[async_trait]
impl MessageHandler for Proxy {
    async fn on_message(&self, session: &Arc<Session>, msg: Message) {
        let reply_to = msg.is_request().then(|| msg.clone());
        if let Err(e) = self.0.handle(session, msg).await {
            tracing::warn!(target = "proxy", session_id = %session.id(), error = %e, "forward_failed");
            if let Some(req) = reply_to {
                let _ = session.send_error(&req, e.to_rpc_error()).await;
            }
        }
    }
}

/// Relays upstream notifications to the downstream peer and answers upstream requests
/// with the downstream reply. Responses nobody waits for stop here.
fn forward_down(downstream: &Arc<Session>) -> MessageCallback {
    let downstream = Arc::downgrade(downstream);
    Arc::new(move |upstream: Arc<Session>, msg: Message| -> BoxFuture<'static, Result<()>> {
        let downstream = downstream.clone();
        Box::pin(async move {
            let downstream = downstream.upgrade().ok_or(Error::SessionClosed)?;
            if msg.is_notification() {
                return downstream.send(msg).await;
            }
            if !msg.is_request() {
                // late or replayed replies carry upstream ids the downstream never issued
                tracing::debug!(target = "proxy", session_id = %downstream.id(), id = ?msg.id, "unmatched_upstream_response_dropped");
                return Ok(());
            }
            tokio::spawn(async move {
                let mut down = msg.clone();
                down.id = None;
                let sent = match downstream.exchange_message(down, ExchangeOptions::default()).await {
                    Ok(mut resp) => {
                        resp.id = msg.id.clone();
                        upstream.send(resp).await
                    }
                    Err(e) => upstream.send_error(&msg, e.to_rpc_error()).await,
                };
                if let Err(e) = sent {
                    tracing::warn!(target = "proxy", method = %msg.method, error = %e, "reply_up_failed");
                }
            });
            Ok(())
        })
    })
}

fn sampling_down(downstream: &Arc<Session>) -> SamplingCallback {
    let downstream = Arc::downgrade(downstream);
    Arc::new(move |req: CreateMessageRequest| -> BoxFuture<'static, Result<JsonValue>> {
        let downstream = downstream.clone();
        Box::pin(async move {
            let downstream = downstream.upgrade().ok_or(Error::SessionClosed)?;
            downstream
                .exchange("sampling/createMessage", &req, ExchangeOptions::default())
                .await
        })
    })
}

fn elicit_down(downstream: &Arc<Session>) -> ElicitCallback {
    let downstream = Arc::downgrade(downstream);
    Arc::new(move |_msg: Message, req: ElicitRequest| -> BoxFuture<'static, Result<ElicitResult>> {
        let downstream = downstream.clone();
        Box::pin(async move {
            let downstream = downstream.upgrade().ok_or(Error::SessionClosed)?;
            downstream
                .exchange("elicitation/create", &req, ExchangeOptions::default())
                .await
        })
    })
}

fn roots_down(downstream: &Arc<Session>) -> RootsCallback {
    let downstream = Arc::downgrade(downstream);
    Arc::new(move || -> BoxFuture<'static, Result<Vec<Root>>> {
        let downstream = downstream.clone();
        Box::pin(async move {
            let downstream = downstream.upgrade().ok_or(Error::SessionClosed)?;
            let result: ListRootsResult = downstream
                .exchange("roots/list", &Empty {}, ExchangeOptions::default())
                .await?;
            Ok(result.roots)
        })
    })
}
