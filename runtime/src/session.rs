use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use nanobot_mcp_core::logging::{Event, RpcEventPublisher, TracingPublisher};
use nanobot_mcp_core::state::ENV_ATTRIBUTE;
use nanobot_mcp_core::types::{InitializeRequest, InitializeResult, ProgressNotification};
use nanobot_mcp_core::{Direction, Message, PendingRequests, RequestId, RpcError, SessionState, Waited, Waiter};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value as JsonValue};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::hooks::HookChain;
use crate::wire::{Wire, WireHandler};

pub const PROGRESS_NOTIFICATION: &str = "notifications/progress";

/// Receives messages the session did not itself ask for: peer requests, notifications and
/// responses nobody is waiting on.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_message(&self, session: &Arc<Session>, msg: Message);
}

struct HandlerFn<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for HandlerFn<F>
where
    F: Fn(Arc<Session>, Message) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn on_message(&self, session: &Arc<Session>, msg: Message) {
        (self.0)(session.clone(), msg).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Arc<Session>, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(HandlerFn(f))
}

/// Answers every request with method-not-found and drops everything else.
#[derive(Clone, Default)]
pub struct MethodNotFound;

#[async_trait]
impl MessageHandler for MethodNotFound {
    async fn on_message(&self, session: &Arc<Session>, msg: Message) {
        if msg.is_request()
            && let Err(e) = session
                .send_error(&msg, RpcError::method_not_found(&msg.method))
                .await
        {
            tracing::debug!(target = "session", method = %msg.method, error = %e, "reply_failed");
        }
    }
}

#[derive(Clone, Default)]
pub struct SessionOptions {
    /// Server name reported to hooks and event logs.
    pub name: String,
    pub parent: Option<Arc<Session>>,
    pub state: Option<SessionState>,
    pub hooks: HookChain,
    pub publisher: Option<Arc<dyn RpcEventPublisher>>,
    /// The session lifetime becomes a child of this token.
    pub cancel: Option<CancellationToken>,
}

#[derive(Clone, Debug, Default)]
pub struct ExchangeOptions {
    pub progress_token: Option<JsonValue>,
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl ExchangeOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_progress_token(mut self, token: impl Into<JsonValue>) -> Self {
        self.progress_token = Some(token.into());
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

struct Attribute {
    value: Box<dyn Any + Send + Sync>,
    encode: fn(&(dyn Any + Send + Sync)) -> Option<JsonValue>,
}

impl Attribute {
    fn new<T: Serialize + Send + Sync + 'static>(value: T) -> Self {
        Self {
            value: Box::new(value),
            encode: encode_as::<T>,
        }
    }

    fn to_json(&self) -> Option<JsonValue> {
        (self.encode)(self.value.as_ref())
    }
}

fn encode_as<T: Serialize + 'static>(value: &(dyn Any + Send + Sync)) -> Option<JsonValue> {
    value
        .downcast_ref::<T>()
        .and_then(|v| serde_json::to_value(v).ok())
}

type Attributes = HashMap<String, Attribute>;

fn coerce_attribute<T>(attrs: &mut Attributes, key: &str) -> Option<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    let attr = attrs.get(key)?;
    if let Some(v) = attr.value.downcast_ref::<T>() {
        return Some(v.clone());
    }
    let coerced = attr.to_json().and_then(|json| {
        serde_json::from_value::<T>(json.clone())
            .ok()
            .or_else(|| json.as_str().and_then(|s| serde_json::from_str::<T>(s).ok()))
    });
    match coerced {
        Some(out) => {
            attrs.insert(key.to_string(), Attribute::new(out.clone()));
            Some(out)
        }
        None => {
            attrs.remove(key);
            None
        }
    }
}

#[derive(Default)]
struct Handshake {
    request: Option<InitializeRequest>,
    result: Option<InitializeResult>,
}

/// Protocol engine on top of a [`Wire`].
pub struct Session {
    local_id: String,
    name: String,
    wire: Option<Wire>,
    handler: Arc<dyn MessageHandler>,
    pending: PendingRequests,
    attributes: Mutex<Attributes>,
    handshake: RwLock<Handshake>,
    parent: Option<Weak<Session>>,
    lifetime: CancellationToken,
    hooks: HookChain,
    publisher: Arc<dyn RpcEventPublisher>,
}

impl Session {
    fn build(wire: Option<Wire>, handler: Arc<dyn MessageHandler>, opts: SessionOptions) -> Self {
        let lifetime = match &opts.cancel {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        let session = Self {
            local_id: uuid::Uuid::new_v4().to_string(),
            name: opts.name,
            wire,
            handler,
            pending: PendingRequests::new(),
            attributes: Mutex::new(HashMap::new()),
            handshake: RwLock::new(Handshake::default()),
            parent: opts.parent.as_ref().map(Arc::downgrade),
            lifetime,
            hooks: opts.hooks,
            publisher: opts
                .publisher
                .unwrap_or_else(|| Arc::new(TracingPublisher)),
        };
        if let Some(state) = opts.state {
            session.restore(state);
        }
        session
    }

    /// Starts `wire` and returns a session reading from it.
    pub async fn start(wire: Wire, handler: Arc<dyn MessageHandler>, opts: SessionOptions) -> Result<Arc<Session>> {
        let session = Arc::new(Self::build(Some(wire.clone()), handler, opts));

        let weak = Arc::downgrade(&session);
        let on_wire: WireHandler = Arc::new(move |msg: Message| -> BoxFuture<'static, ()> {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(session) = weak.upgrade() {
                    session.on_wire(msg).await;
                }
            })
        });
        wire.start(on_wire).await?;

        let lifetime = session.lifetime.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = wire.wait() => lifetime.cancel(),
                // a parent token may end the lifetime without `close`
                _ = lifetime.cancelled() => wire.close(),
            }
        });

        tracing::debug!(target = "session", session_id = %session.id(), server = %session.name, "session_started");
        Ok(session)
    }

    /// A session with no wire. Sends fail with [`Error::NotInitialized`].
    pub fn empty(name: impl Into<String>) -> Arc<Session> {
        Arc::new(Self::build(
            None,
            Arc::new(MethodNotFound),
            SessionOptions {
                name: name.into(),
                ..Default::default()
            },
        ))
    }

    pub fn id(&self) -> String {
        self.wire
            .as_ref()
            .and_then(|w| w.session_id())
            .unwrap_or_else(|| self.local_id.clone())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn wire(&self) -> Option<&Wire> {
        self.wire.as_ref()
    }

    pub fn parent(&self) -> Option<Arc<Session>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    /// Walks parent links up to the outermost live session.
    pub fn root(self: &Arc<Self>) -> Arc<Session> {
        let mut current = self.clone();
        while let Some(parent) = current.parent() {
            current = parent;
        }
        current
    }

    pub fn lifetime(&self) -> &CancellationToken {
        &self.lifetime
    }

    pub fn is_closed(&self) -> bool {
        self.lifetime.is_cancelled()
    }

    pub(crate) async fn on_wire(self: &Arc<Self>, msg: Message) {
        self.publish(Direction::In, &msg);
        let msg = match self.hooks.run(self, Direction::In, msg.clone()).await {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(target = "session", session_id = %self.id(), method = %msg.method, error = %e, "inbound_hook_failed");
                if msg.is_request() {
                    let _ = self.send_error(&msg, e.to_rpc_error()).await;
                }
                return;
            }
        };

        if msg.is_response()
            && let Some(id) = &msg.id
            && self.pending.contains(id)
        {
            if !self.pending.notify(msg) {
                tracing::debug!(target = "session", session_id = %self.id(), "late_response_dropped");
            }
            return;
        }

        self.handler.on_message(self, msg).await;
    }

    /// Sends without waiting for a reply.
    pub async fn send(&self, mut msg: Message) -> Result<()> {
        let Some(wire) = &self.wire else {
            return Err(Error::NotInitialized);
        };
        if self.lifetime.is_cancelled() {
            return Err(Error::SessionClosed);
        }
        msg.jsonrpc = nanobot_mcp_core::message::JSONRPC_VERSION.to_string();
        if msg.method == PROGRESS_NOTIFICATION {
            self.normalize_progress(&mut msg);
        }
        if msg.method == "initialize"
            && msg.is_request()
            && let Ok(req) = msg.params_as::<InitializeRequest>()
        {
            self.set_initialize_request(req);
        }
        let msg = self.hooks.run(self, Direction::Out, msg).await?;
        self.publish(Direction::Out, &msg);
        wire.send(msg).await
    }

    pub async fn reply<T: Serialize>(&self, msg: &Message, result: T) -> Result<()> {
        let result = serde_json::to_value(result)?;
        self.send(Message::response(msg.id.clone(), result)).await
    }

    pub async fn send_error(&self, msg: &Message, err: RpcError) -> Result<()> {
        self.send(Message::error_response(msg.id.clone(), err)).await
    }

    /// Sends `params` as a `method` request and decodes the result.
    pub async fn exchange<I, O>(&self, method: &str, params: &I, opts: ExchangeOptions) -> Result<O>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        let params = serde_json::to_value(params)?;
        let params = (!params.is_null()).then_some(params);
        let resp = self
            .exchange_message(Message::request(RequestId::new_uuid(), method, params), opts)
            .await?;
        if let Some(err) = resp.error {
            return Err(Error::Rpc(err));
        }
        match resp.result {
            Some(result) if !result.is_null() => Ok(serde_json::from_value(result)?),
            // a bare `{"id":..}` acknowledgement decodes like an empty object
            _ => serde_json::from_value(JsonValue::Null)
                .or_else(|_| serde_json::from_value(JsonValue::Object(Map::new())))
                .map_err(Error::from),
        }
    }

    /// Sends a full request and returns the correlated response verbatim.
    pub async fn exchange_message(&self, mut msg: Message, opts: ExchangeOptions) -> Result<Message> {
        let id = msg.id.get_or_insert_with(RequestId::new_uuid).clone();
        if let Some(token) = opts.progress_token.clone() {
            msg.set_progress_token(token);
        }
        let is_initialize = msg.method == "initialize";

        let waiter = self.pending.wait_for(id)?;
        self.send(msg).await?;
        let resp = self.wait_response(waiter, &opts).await?;

        if is_initialize
            && resp.error.is_none()
            && let Some(result) = &resp.result
            && let Ok(result) = serde_json::from_value::<InitializeResult>(result.clone())
        {
            self.set_initialize_result(result);
        }
        Ok(resp)
    }

    async fn wait_response(&self, waiter: Waiter, opts: &ExchangeOptions) -> Result<Message> {
        let deadline = async {
            match opts.timeout {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending().await,
            }
        };
        let cancelled = async {
            match &opts.cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            waited = waiter.recv() => match waited {
                Waited::Response(msg) => Ok(msg),
                Waited::Closed => Err(Error::SessionClosed),
            },
            _ = self.lifetime.cancelled() => Err(Error::SessionClosed),
            _ = cancelled => Err(Error::Cancelled),
            _ = deadline => Err(Error::DeadlineExceeded),
        }
    }

    fn normalize_progress(&self, msg: &mut Message) {
        let Ok(progress) = msg.params_as::<ProgressNotification>() else {
            return;
        };
        let key = format!("progress-token:{}", token_key(&progress.progress_token));
        let value = {
            let mut attrs = self.attrs();
            let mut value = progress.progress;
            if let Some(last) = coerce_attribute::<f64>(&mut attrs, &key)
                && value <= last
            {
                value = if progress.total.is_some() { last + 0.01 } else { last + 1.0 };
            }
            attrs.insert(key, Attribute::new(value));
            value
        };
        if value != progress.progress
            && let Some(params) = msg.params.as_mut().and_then(|p| p.as_object_mut())
        {
            params.insert("progress".to_string(), JsonValue::from(value));
        }
    }

    fn attrs(&self) -> MutexGuard<'_, Attributes> {
        self.attributes.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set<T: Serialize + Send + Sync + 'static>(&self, key: impl Into<String>, value: T) {
        self.attrs().insert(key.into(), Attribute::new(value));
    }

    /// Reads `key` as `T`, coercing through JSON when stored under another type. A value
    /// that cannot be coerced is evicted.
    pub fn get<T>(&self, key: &str) -> Option<T>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        coerce_attribute(&mut self.attrs(), key)
    }

    pub fn delete(&self, key: &str) {
        self.attrs().remove(key);
    }

    pub fn attributes(&self) -> Map<String, JsonValue> {
        self.attrs()
            .iter()
            .filter_map(|(k, attr)| attr.to_json().map(|v| (k.clone(), v)))
            .collect()
    }

    pub fn env(&self) -> HashMap<String, String> {
        self.get(ENV_ATTRIBUTE).unwrap_or_default()
    }

    pub fn merge_env(&self, env: HashMap<String, String>) {
        let mut attrs = self.attrs();
        let mut current: HashMap<String, String> =
            coerce_attribute(&mut attrs, ENV_ATTRIBUTE).unwrap_or_default();
        current.extend(env);
        attrs.insert(ENV_ATTRIBUTE.to_string(), Attribute::new(current));
    }

    pub fn initialize_request(&self) -> Option<InitializeRequest> {
        self.handshake.read().ok()?.request.clone()
    }

    pub fn initialize_result(&self) -> Option<InitializeResult> {
        self.handshake.read().ok()?.result.clone()
    }

    pub(crate) fn set_initialize_request(&self, req: InitializeRequest) {
        if let Ok(mut hs) = self.handshake.write() {
            hs.request = Some(req);
        }
    }

    pub(crate) fn set_initialize_result(&self, result: InitializeResult) {
        if let Ok(mut hs) = self.handshake.write() {
            hs.result = Some(result);
        }
    }

    pub fn state(&self) -> SessionState {
        SessionState {
            id: self.id(),
            initialize_request: self.initialize_request(),
            initialize_result: self.initialize_result(),
            attributes: self.attributes(),
        }
    }

    fn restore(&self, state: SessionState) {
        if let Ok(mut hs) = self.handshake.write() {
            hs.request = state.initialize_request;
            hs.result = state.initialize_result;
        }
        let mut attrs = self.attrs();
        for (k, v) in state.attributes {
            attrs.insert(k, Attribute::new(v));
        }
    }

    fn publish(&self, direction: Direction, msg: &Message) {
        self.publisher
            .log(Event::from_message(direction, &self.id(), msg).with_server_name(&self.name));
    }

    /// Cancels the session lifetime and closes the wire.
    pub fn close(&self) {
        if self.lifetime.is_cancelled() {
            return;
        }
        tracing::debug!(target = "session", session_id = %self.id(), server = %self.name, "session_closed");
        self.lifetime.cancel();
        self.pending.close_all();
        if let Some(wire) = &self.wire {
            wire.close();
        }
    }

    /// Resolves once the wire has shut down or the session was closed.
    pub async fn wait(&self) {
        self.lifetime.cancelled().await
    }
}

fn token_key(token: &JsonValue) -> String {
    match token {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Cached {
        server: String,
        tools: Vec<String>,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Other {
        count: u32,
    }

    #[test]
    fn attribute_direct_hit() {
        let s = Session::empty("t");
        s.set("n", 42u32);
        assert_eq!(s.get::<u32>("n"), Some(42));
    }

    #[test]
    fn attribute_coerces_compatible_shapes() {
        let s = Session::empty("t");
        s.set("cache", json!({"server":"fs","tools":["read"]}));
        let got: Cached = s.get("cache").unwrap();
        assert_eq!(got.tools, vec!["read".to_string()]);
        // stored value now has the requested type
        assert_eq!(s.get::<Cached>("cache"), Some(got));
    }

    #[test]
    fn attribute_parses_json_strings() {
        let s = Session::empty("t");
        s.set("raw", r#"{"count":3}"#.to_string());
        assert_eq!(s.get::<Other>("raw"), Some(Other { count: 3 }));
    }

    #[test]
    fn attribute_incompatible_evicts() {
        let s = Session::empty("t");
        s.set("cache", Cached { server: "fs".into(), tools: vec![] });
        assert_eq!(s.get::<Other>("cache"), None);
        assert_eq!(s.get::<Other>("cache"), None);
        assert_eq!(s.get::<Cached>("cache"), None);
    }

    #[test]
    fn attribute_delete_and_snapshot() {
        let s = Session::empty("t");
        s.set("a", 1u8);
        s.set("b", "x".to_string());
        s.delete("a");
        let snap = s.attributes();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap["b"], json!("x"));
    }

    #[test]
    fn progress_is_strictly_increasing() {
        let s = Session::empty("t");
        let mut last = f64::MIN;
        for (progress, total) in [(5.0, None), (3.0, None), (3.0, None), (10.0, None), (10.0, Some(100.0)), (1.0, Some(100.0))] {
            let mut params = json!({"progressToken":"tok","progress":progress});
            if let Some(total) = total {
                params["total"] = json!(total);
            }
            let mut msg = Message::notification(PROGRESS_NOTIFICATION, Some(params));
            s.normalize_progress(&mut msg);
            let sent = msg.params.unwrap()["progress"].as_f64().unwrap();
            assert!(sent > last, "{sent} should exceed {last}");
            last = sent;
        }
        assert_eq!(s.get::<f64>("progress-token:tok"), Some(last));
    }

    #[test]
    fn progress_bumps_by_fraction_with_total() {
        let s = Session::empty("t");
        let mut first = Message::notification(
            PROGRESS_NOTIFICATION,
            Some(json!({"progressToken":1,"progress":50,"total":100})),
        );
        s.normalize_progress(&mut first);
        let mut repeat = first.clone();
        s.normalize_progress(&mut repeat);
        let v = repeat.params.unwrap()["progress"].as_f64().unwrap();
        assert!((v - 50.01).abs() < 1e-9);
    }

    #[test]
    fn progress_tokens_are_independent() {
        let s = Session::empty("t");
        let mut a = Message::notification(PROGRESS_NOTIFICATION, Some(json!({"progressToken":"a","progress":5})));
        let mut b = Message::notification(PROGRESS_NOTIFICATION, Some(json!({"progressToken":"b","progress":1})));
        s.normalize_progress(&mut a);
        s.normalize_progress(&mut b);
        assert_eq!(b.params.unwrap()["progress"], json!(1));
    }

    #[test]
    fn root_walks_parents() {
        let root = Session::empty("root");
        let mid = Arc::new(Session::build(
            None,
            Arc::new(MethodNotFound),
            SessionOptions { name: "mid".into(), parent: Some(root.clone()), ..Default::default() },
        ));
        let leaf = Arc::new(Session::build(
            None,
            Arc::new(MethodNotFound),
            SessionOptions { name: "leaf".into(), parent: Some(mid.clone()), ..Default::default() },
        ));
        assert_eq!(leaf.parent().unwrap().name(), "mid");
        assert_eq!(leaf.root().name(), "root");
        assert_eq!(root.root().name(), "root");
    }

    #[test]
    fn env_merge_and_state_projection() {
        let s = Session::empty("t");
        s.merge_env(HashMap::from([("A".to_string(), "1".to_string())]));
        s.merge_env(HashMap::from([("B".to_string(), "2".to_string())]));
        assert_eq!(s.env().len(), 2);
        let state = s.state();
        assert_eq!(state.attributes["env"]["B"], json!("2"));
    }

    #[test]
    fn restore_rebuilds_handshake_and_attributes() {
        let mut state = SessionState {
            id: "x".into(),
            initialize_result: Some(InitializeResult {
                protocol_version: "2025-11-25".into(),
                ..Default::default()
            }),
            ..Default::default()
        };
        state.attributes.insert("ui".into(), json!({"count": 2}));
        let s = Session::build(
            None,
            Arc::new(MethodNotFound),
            SessionOptions { state: Some(state), ..Default::default() },
        );
        assert_eq!(s.initialize_result().unwrap().protocol_version, "2025-11-25");
        assert_eq!(s.get::<Other>("ui"), Some(Other { count: 2 }));
    }

    #[tokio::test]
    async fn send_without_wire_fails() {
        let s = Session::empty("t");
        let err = s.send(Message::notification("ping", None)).await.err().unwrap();
        assert!(matches!(err, Error::NotInitialized));
    }
}
