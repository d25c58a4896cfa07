use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use nanobot_mcp_core::logging::RpcEventPublisher;
use nanobot_mcp_core::message::NOTIFICATION_PREFIX;
use nanobot_mcp_core::types::{
    CallToolRequest, CallToolResult, ClientCapabilities, CreateMessageRequest, ElicitRequest,
    ElicitResult, Empty, GetPromptRequest, GetPromptResult, Implementation, InitializeRequest,
    InitializeResult, LATEST_PROTOCOL_VERSION, ListPromptsResult, ListResourceTemplatesResult,
    ListResourcesResult, ListRootsResult, ListToolsResult, LoggingMessage, ReadResourceResult,
    ResourceRequest, Root, SetLogLevelRequest,
};
use nanobot_mcp_core::{Message, RpcError, SessionState};
use serde_json::{Map, Value as JsonValue, json};
use tokio_util::sync::CancellationToken;

use crate::config::{ServerConfig, ToolOverride, expand_env, expand_env_map};
use crate::error::{Error, Result};
use crate::hooks::HookChain;
use crate::session::{ExchangeOptions, MessageHandler, Session, SessionOptions};
use crate::wire::{HttpClientOptions, HttpClientWire, StdioWire, Wire};

pub type SamplingCallback =
    Arc<dyn Fn(CreateMessageRequest) -> BoxFuture<'static, Result<JsonValue>> + Send + Sync>;
pub type ElicitCallback =
    Arc<dyn Fn(Message, ElicitRequest) -> BoxFuture<'static, Result<ElicitResult>> + Send + Sync>;
pub type RootsCallback = Arc<dyn Fn() -> BoxFuture<'static, Result<Vec<Root>>> + Send + Sync>;
pub type LoggingCallback =
    Arc<dyn Fn(LoggingMessage) -> BoxFuture<'static, Result<()>> + Send + Sync>;
/// Receives the client's own session alongside the message.
pub type MessageCallback =
    Arc<dyn Fn(Arc<Session>, Message) -> BoxFuture<'static, Result<()>> + Send + Sync>;

#[derive(Clone, Default)]
pub struct ClientOptions {
    pub client_name: Option<String>,
    pub client_version: Option<String>,
    /// Substituted into `${NAME}` placeholders of the server config and stored on the session.
    pub env: HashMap<String, String>,
    pub parent: Option<Arc<Session>>,
    /// Resume from a snapshot instead of running the handshake.
    pub session_state: Option<SessionState>,
    pub hooks: HookChain,
    pub publisher: Option<Arc<dyn RpcEventPublisher>>,
    pub cancel: Option<CancellationToken>,
    pub on_sampling: Option<SamplingCallback>,
    pub on_elicit: Option<ElicitCallback>,
    pub on_roots: Option<RootsCallback>,
    pub on_logging: Option<LoggingCallback>,
    pub on_notify: Option<MessageCallback>,
    pub on_message: Option<MessageCallback>,
}

impl ClientOptions {
    fn client_info(&self) -> Implementation {
        let version = env!("CARGO_PKG_VERSION");
        match &self.client_name {
            Some(name) if !name.is_empty() => Implementation {
                name: format!("{name} (via nanobot {version})"),
                version: self.client_version.clone().unwrap_or_default(),
                title: None,
            },
            _ => Implementation {
                name: "nanobot".to_string(),
                version: version.to_string(),
                title: None,
            },
        }
    }

    fn capabilities(&self) -> ClientCapabilities {
        ClientCapabilities {
            sampling: self.on_sampling.as_ref().map(|_| json!({"context": {}, "tools": {}})),
            roots: self.on_roots.as_ref().map(|_| json!({})),
            elicitation: self.on_elicit.as_ref().map(|_| json!({})),
            experimental: None,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct CallOptions {
    pub progress_token: Option<JsonValue>,
    pub meta: Option<Map<String, JsonValue>>,
    pub exchange: ExchangeOptions,
}

/// Typed MCP client over a [`Session`].
#[derive(Clone)]
pub struct Client {
    session: Arc<Session>,
    tool_overrides: BTreeMap<String, ToolOverride>,
}

impl Client {
    /// Connects to `config` (HTTP when `url` is set, else a spawned `command`) and runs the
    /// handshake unless resuming from `opts.session_state`.
    pub async fn connect(name: &str, config: &ServerConfig, opts: ClientOptions) -> Result<Self> {
        let wire = open_wire(name, config, &opts)?;
        let session = Session::start(
            wire,
            Arc::new(ClientDispatch::from(&opts)),
            SessionOptions {
                name: name.to_string(),
                parent: opts.parent.clone(),
                state: opts.session_state.clone(),
                hooks: opts.hooks.clone(),
                publisher: opts.publisher.clone(),
                cancel: opts.cancel.clone(),
            },
        )
        .await?;
        if !opts.env.is_empty() {
            session.merge_env(opts.env.clone());
        }

        let client = Self {
            session,
            tool_overrides: config.tool_overrides.clone(),
        };
        if opts.session_state.is_none() {
            let req = InitializeRequest {
                protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
                capabilities: opts.capabilities(),
                client_info: opts.client_info(),
            };
            if let Err(e) = client.initialize(req).await {
                client.session.close();
                return Err(e);
            }
        }
        tracing::info!(target = "client", server = %name, session_id = %client.session.id(), "client_connected");
        Ok(client)
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub async fn initialize(&self, req: InitializeRequest) -> Result<InitializeResult> {
        let result: InitializeResult = self
            .session
            .exchange("initialize", &req, ExchangeOptions::default())
            .await?;
        self.session
            .send(Message::notification("notifications/initialized", None))
            .await?;
        Ok(result)
    }

    fn server_has(&self, capability: impl Fn(&InitializeResult) -> bool) -> bool {
        self.session
            .initialize_result()
            .as_ref()
            .is_some_and(capability)
    }

    pub async fn ping(&self) -> Result<()> {
        let _: Empty = self
            .session
            .exchange("ping", &Empty {}, ExchangeOptions::default())
            .await?;
        Ok(())
    }

    /// Lists tools with overrides applied. With any override configured, tools not named
    /// in the overrides are hidden.
    pub async fn list_tools(&self) -> Result<ListToolsResult> {
        if !self.server_has(|r| r.capabilities.tools.is_some()) {
            return Ok(ListToolsResult::default());
        }
        let mut result: ListToolsResult = self
            .session
            .exchange("tools/list", &Empty {}, ExchangeOptions::default())
            .await?;
        if !self.tool_overrides.is_empty() {
            result.tools = result
                .tools
                .into_iter()
                .filter_map(|mut tool| {
                    let o = self.tool_overrides.get(&tool.name)?;
                    if let Some(name) = o.name.as_ref().filter(|n| !n.is_empty()) {
                        tool.name = name.clone();
                    }
                    if let Some(desc) = o.description.as_ref().filter(|d| !d.is_empty()) {
                        tool.description = desc.clone();
                    }
                    if let Some(schema) = &o.input_schema {
                        tool.input_schema = schema.clone();
                    }
                    Some(tool)
                })
                .collect();
        }
        Ok(result)
    }

    /// Calls `tool`, translating an overridden name back to the upstream one.
    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: Option<JsonValue>,
        opts: CallOptions,
    ) -> Result<CallToolResult> {
        let name = self
            .tool_overrides
            .iter()
            .find(|(_, o)| o.name.as_deref() == Some(tool))
            .map(|(upstream, _)| upstream.clone())
            .unwrap_or_else(|| tool.to_string());
        let mut exchange = opts.exchange;
        if let Some(token) = opts.progress_token {
            exchange.progress_token = Some(token);
        }
        let req = CallToolRequest {
            name,
            arguments,
            meta: opts.meta.filter(|m| !m.is_empty()),
        };
        self.session.exchange("tools/call", &req, exchange).await
    }

    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult> {
        self.session
            .exchange(
                "resources/read",
                &ResourceRequest { uri: uri.to_string() },
                ExchangeOptions::default(),
            )
            .await
    }

    pub async fn list_resources(&self) -> Result<ListResourcesResult> {
        if !self.server_has(|r| r.capabilities.resources.is_some()) {
            return Ok(ListResourcesResult::default());
        }
        self.session
            .exchange("resources/list", &Empty {}, ExchangeOptions::default())
            .await
    }

    pub async fn list_resource_templates(&self) -> Result<ListResourceTemplatesResult> {
        if !self.server_has(|r| r.capabilities.resources.is_some()) {
            return Ok(ListResourceTemplatesResult::default());
        }
        self.session
            .exchange("resources/templates/list", &Empty {}, ExchangeOptions::default())
            .await
    }

    pub async fn subscribe_resource(&self, uri: &str) -> Result<()> {
        let _: Empty = self
            .session
            .exchange(
                "resources/subscribe",
                &ResourceRequest { uri: uri.to_string() },
                ExchangeOptions::default(),
            )
            .await?;
        Ok(())
    }

    pub async fn unsubscribe_resource(&self, uri: &str) -> Result<()> {
        let _: Empty = self
            .session
            .exchange(
                "resources/unsubscribe",
                &ResourceRequest { uri: uri.to_string() },
                ExchangeOptions::default(),
            )
            .await?;
        Ok(())
    }

    pub async fn list_prompts(&self) -> Result<ListPromptsResult> {
        if !self.server_has(|r| r.capabilities.prompts.is_some()) {
            return Ok(ListPromptsResult::default());
        }
        self.session
            .exchange("prompts/list", &Empty {}, ExchangeOptions::default())
            .await
    }

    pub async fn get_prompt(&self, name: &str, arguments: BTreeMap<String, String>) -> Result<GetPromptResult> {
        let req = GetPromptRequest {
            name: name.to_string(),
            arguments,
        };
        self.session
            .exchange("prompts/get", &req, ExchangeOptions::default())
            .await
    }

    /// No-op against servers without the logging capability.
    pub async fn set_log_level(&self, level: &str) -> Result<()> {
        if !self.server_has(|r| r.capabilities.logging.is_some()) {
            return Ok(());
        }
        let _: Empty = self
            .session
            .exchange(
                "logging/setLevel",
                &SetLogLevelRequest { level: level.to_string() },
                ExchangeOptions::default(),
            )
            .await?;
        Ok(())
    }

    /// Closes the session; with `delete_session` an HTTP server is also told to drop it.
    pub async fn close(&self, delete_session: bool) {
        if delete_session
            && let Some(Wire::Http(wire)) = self.session.wire()
            && let Err(e) = wire.terminate().await
        {
            tracing::warn!(target = "client", server = %self.session.name(), error = %e, "delete_session_failed");
        }
        self.session.close();
    }
}

fn open_wire(name: &str, config: &ServerConfig, opts: &ClientOptions) -> Result<Wire> {
    if !config.url.is_empty() {
        let session_id = opts
            .session_state
            .as_ref()
            .map(|s| s.id.clone())
            .filter(|id| !id.is_empty());
        let wire = HttpClientWire::new(
            name,
            &expand_env(&config.url, &opts.env),
            HttpClientOptions {
                headers: expand_env_map(&config.headers, &opts.env),
                session_id,
            },
        )?;
        return Ok(wire.into());
    }
    if !config.command.is_empty() {
        let args: Vec<String> = config.args.iter().map(|a| expand_env(a, &opts.env)).collect();
        let wire = StdioWire::spawn(
            name,
            &expand_env(&config.command, &opts.env),
            &args,
            &expand_env_map(&config.env, &opts.env),
        )?;
        return Ok(wire.into());
    }
    Err(Error::Other(format!(
        "no command or url provided for server {name}"
    )))
}

/// Routes server-initiated traffic to the configured callbacks.
struct ClientDispatch {
    on_sampling: Option<SamplingCallback>,
    on_elicit: Option<ElicitCallback>,
    on_roots: Option<RootsCallback>,
    on_logging: Option<LoggingCallback>,
    on_notify: Option<MessageCallback>,
    on_message: Option<MessageCallback>,
}

impl From<&ClientOptions> for ClientDispatch {
    fn from(opts: &ClientOptions) -> Self {
        Self {
            on_sampling: opts.on_sampling.clone(),
            on_elicit: opts.on_elicit.clone(),
            on_roots: opts.on_roots.clone(),
            on_logging: opts.on_logging.clone(),
            on_notify: opts.on_notify.clone(),
            on_message: opts.on_message.clone(),
        }
    }
}

fn callback_error(method: &str, err: Error) -> RpcError {
    match err {
        Error::Rpc(e) => e,
        other => RpcError::internal(format!("failed to handle {method}: {other}")),
    }
}

async fn reply_or_log(session: &Session, msg: &Message, result: Result<JsonValue>) {
    let sent = match result {
        Ok(value) => session.reply(msg, value).await,
        Err(e) => session.send_error(msg, callback_error(&msg.method, e)).await,
    };
    if let Err(e) = sent {
        tracing::warn!(target = "client", method = %msg.method, error = %e, "reply_failed");
    }
}

#[async_trait]
impl MessageHandler for ClientDispatch {
    async fn on_message(&self, session: &Arc<Session>, msg: Message) {
        match msg.method.as_str() {
            "sampling/createMessage" if self.on_sampling.is_some() => {
                let Some(cb) = self.on_sampling.clone() else { return };
                let req: CreateMessageRequest = match msg.params_as() {
                    Ok(req) => req,
                    Err(e) => {
                        let _ = session
                            .send_error(&msg, RpcError::invalid_params(format!("failed to decode {}: {e}", msg.method)))
                            .await;
                        return;
                    }
                };
                let session = session.clone();
                tokio::spawn(async move {
                    let result = cb(req).await;
                    reply_or_log(&session, &msg, result).await;
                });
            }
            "elicitation/create" if self.on_elicit.is_some() => {
                let Some(cb) = self.on_elicit.clone() else { return };
                let req: ElicitRequest = match msg.params_as() {
                    Ok(req) => req,
                    Err(e) => {
                        let _ = session
                            .send_error(&msg, RpcError::invalid_params(format!("failed to decode {}: {e}", msg.method)))
                            .await;
                        return;
                    }
                };
                let session = session.clone();
                tokio::spawn(async move {
                    match cb(msg.clone(), req).await {
                        // answered out of band
                        Ok(result) if result.action == ElicitResult::HANDLED => {}
                        Ok(result) => {
                            reply_or_log(&session, &msg, serde_json::to_value(result).map_err(Error::from)).await
                        }
                        Err(e) => reply_or_log(&session, &msg, Err(e)).await,
                    }
                });
            }
            "roots/list" if self.on_roots.is_some() => {
                let Some(cb) = self.on_roots.clone() else { return };
                let session = session.clone();
                tokio::spawn(async move {
                    let result = cb()
                        .await
                        .and_then(|roots| Ok(serde_json::to_value(ListRootsResult { roots })?));
                    reply_or_log(&session, &msg, result).await;
                });
            }
            "notifications/message" if self.on_logging.is_some() => {
                let Some(cb) = &self.on_logging else { return };
                match msg.params_as::<LoggingMessage>() {
                    Ok(log) => {
                        if let Err(e) = cb(log).await {
                            tracing::warn!(target = "client", server = %session.name(), error = %e, "logging_callback_failed");
                        }
                    }
                    Err(e) => {
                        tracing::debug!(target = "client", server = %session.name(), error = %e, "invalid_log_message");
                    }
                }
            }
            method if method.starts_with(NOTIFICATION_PREFIX) && self.on_notify.is_some() => {
                let Some(cb) = &self.on_notify else { return };
                if let Err(e) = cb(session.clone(), msg).await {
                    tracing::warn!(target = "client", server = %session.name(), error = %e, "notify_callback_failed");
                }
            }
            _ => {
                if let Some(cb) = &self.on_message {
                    if let Err(e) = cb(session.clone(), msg).await {
                        tracing::warn!(target = "client", server = %session.name(), error = %e, "message_callback_failed");
                    }
                } else if msg.is_request() {
                    let _ = session
                        .send_error(&msg, RpcError::method_not_found(&msg.method))
                        .await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_info_marks_embedding() {
        let opts = ClientOptions::default();
        assert_eq!(opts.client_info().name, "nanobot");
        let opts = ClientOptions {
            client_name: Some("agent".into()),
            client_version: Some("2.0".into()),
            ..Default::default()
        };
        let info = opts.client_info();
        assert!(info.name.starts_with("agent (via nanobot "));
        assert_eq!(info.version, "2.0");
    }

    #[test]
    fn capabilities_follow_callbacks() {
        let opts = ClientOptions::default();
        assert_eq!(opts.capabilities(), ClientCapabilities::default());
        let roots: RootsCallback = Arc::new(|| -> BoxFuture<'static, Result<Vec<Root>>> {
            Box::pin(async { Ok(vec![]) })
        });
        let opts = ClientOptions {
            on_roots: Some(roots),
            ..Default::default()
        };
        let caps = opts.capabilities();
        assert!(caps.roots.is_some());
        assert!(caps.sampling.is_none());
    }

    #[test]
    fn config_without_endpoint_is_rejected() {
        let err = open_wire("x", &ServerConfig::default(), &ClientOptions::default())
            .err()
            .unwrap();
        assert!(err.to_string().contains("no command or url"));
    }
}
