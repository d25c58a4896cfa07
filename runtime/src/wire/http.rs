use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;

use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use nanobot_mcp_core::{Message, RequestId};
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, Response, StatusCode, Url};
use sse_stream::{Sse, SseStream};
use tokio_util::sync::CancellationToken;

use super::WireHandler;
use crate::error::{Error, Result};

pub const HEADER_SESSION_ID: &str = "Mcp-Session-Id";
pub const HEADER_LAST_EVENT_ID: &str = "Last-Event-ID";
pub const EVENT_STREAM_MIME_TYPE: &str = "text/event-stream";
pub const JSON_MIME_TYPE: &str = "application/json";
const POST_ACCEPT: &str = "application/json, text/event-stream";
const RECONNECT_DELAY: Duration = Duration::from_millis(250);

type EventStream = BoxStream<'static, std::result::Result<Sse, sse_stream::Error>>;

#[derive(Clone, Debug, Default)]
pub struct HttpClientOptions {
    /// Extra headers sent with every request.
    pub headers: HashMap<String, String>,
    /// Resume an existing server session instead of initializing a new one.
    pub session_id: Option<String>,
}

/// Streamable HTTP client wire with fallback to the older dual-endpoint SSE transport.
#[derive(Clone)]
pub struct HttpClientWire {
    inner: Arc<HttpInner>,
}

struct StreamState {
    /// The GET stream still has to be (re)established.
    need_sse: bool,
    /// Server only speaks the GET + `endpoint` event protocol.
    legacy: bool,
    message_url: Url,
    /// Initialize request replayed on every legacy reconnect.
    initial: Option<Message>,
}

struct HttpInner {
    name: String,
    http: reqwest::Client,
    base_url: Url,
    headers: HeaderMap,
    session_id: RwLock<Option<String>>,
    initialized: AtomicBool,
    stream: tokio::sync::RwLock<StreamState>,
    handler: OnceLock<WireHandler>,
    closed: CancellationToken,
}

impl HttpClientWire {
    pub fn new(name: impl Into<String>, base_url: &str, opts: HttpClientOptions) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| Error::transport(format!("invalid server url {base_url}: {e}")))?;

        let mut session_id = opts.session_id;
        let mut headers = HeaderMap::new();
        for (k, v) in &opts.headers {
            if k.eq_ignore_ascii_case(HEADER_SESSION_ID) {
                session_id.get_or_insert_with(|| v.clone());
                continue;
            }
            let name = HeaderName::from_bytes(k.as_bytes())
                .map_err(|e| Error::transport(format!("invalid header name {k}: {e}")))?;
            let value = HeaderValue::from_str(v)
                .map_err(|e| Error::transport(format!("invalid value for header {k}: {e}")))?;
            headers.insert(name, value);
        }
        let http = reqwest::Client::builder()
            .build()
            .map_err(Error::Http)?;

        Ok(Self {
            inner: Arc::new(HttpInner {
                name: name.into(),
                http,
                initialized: AtomicBool::new(session_id.is_some()),
                session_id: RwLock::new(session_id),
                headers,
                stream: tokio::sync::RwLock::new(StreamState {
                    need_sse: true,
                    legacy: false,
                    message_url: base_url.clone(),
                    initial: None,
                }),
                base_url,
                handler: OnceLock::new(),
                closed: CancellationToken::new(),
            }),
        })
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.session_id()
    }

    pub async fn start(&self, handler: WireHandler) -> Result<()> {
        self.inner
            .handler
            .set(handler)
            .map_err(|_| Error::transport("http wire already started"))?;
        if self.inner.initialized.load(Ordering::Acquire)
            && let Err(e) = self.inner.ensure_sse(None).await
        {
            tracing::warn!(target = "http_client", server = %self.inner.name, error = %e, "resume_stream_failed");
        }
        Ok(())
    }

    pub async fn send(&self, msg: Message) -> Result<()> {
        if self.inner.closed.is_cancelled() {
            return Err(Error::SessionClosed);
        }
        if !self.inner.initialized.load(Ordering::Acquire) {
            if msg.method != "initialize" {
                return Err(Error::NotInitialized);
            }
            return self.inner.initialize(msg).await;
        }
        self.inner.post(msg).await
    }

    pub fn close(&self) {
        self.inner.closed.cancel();
    }

    pub async fn wait(&self) {
        self.inner.closed.cancelled().await
    }

    /// Ends the server-side session with a DELETE, then closes the wire.
    pub async fn terminate(&self) -> Result<()> {
        let result = match self.session_id() {
            Some(_) => {
                let resp = self
                    .inner
                    .request(Method::DELETE, self.inner.base_url.clone())
                    .send()
                    .await;
                match resp {
                    Ok(resp)
                        if resp.status().is_success()
                            || resp.status() == StatusCode::METHOD_NOT_ALLOWED
                            || resp.status() == StatusCode::NOT_FOUND =>
                    {
                        Ok(())
                    }
                    Ok(resp) => Err(Error::transport(format!(
                        "failed to delete session: {}",
                        resp.status()
                    ))),
                    Err(e) => Err(e.into()),
                }
            }
            None => Ok(()),
        };
        self.close();
        result
    }
}

impl HttpInner {
    fn session_id(&self) -> Option<String> {
        self.session_id.read().ok().and_then(|s| s.clone())
    }

    fn capture_session_id(&self, resp: &Response) {
        if let Some(id) = resp
            .headers()
            .get(HEADER_SESSION_ID)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            && let Ok(mut slot) = self.session_id.write()
        {
            *slot = Some(id.to_string());
        }
    }

    fn handler(&self) -> Result<WireHandler> {
        self.handler.get().cloned().ok_or(Error::NotInitialized)
    }

    fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        let accept = if method == Method::GET {
            EVENT_STREAM_MIME_TYPE
        } else {
            POST_ACCEPT
        };
        let mut req = self
            .http
            .request(method, url)
            .headers(self.headers.clone())
            .header(ACCEPT, accept);
        if let Some(id) = self.session_id() {
            req = req.header(HEADER_SESSION_ID, id);
        }
        req
    }

    async fn post_to(&self, url: Url, msg: &Message) -> Result<Response> {
        let body = serde_json::to_vec(msg)?;
        Ok(self
            .request(Method::POST, url)
            .header(CONTENT_TYPE, JSON_MIME_TYPE)
            .body(body)
            .send()
            .await?)
    }

    fn deliver(&self, handler: &WireHandler, msg: Message) {
        tokio::spawn(handler(msg));
    }

    async fn initialize(self: &Arc<Self>, msg: Message) -> Result<()> {
        let resp = self.post_to(self.base_url.clone(), &msg).await?;
        let status = resp.status();

        if status != StatusCode::OK {
            let body = resp.text().await.unwrap_or_default();
            tracing::info!(target = "http_client", server = %self.name, status = %status, "falling_back_to_sse");
            {
                let mut state = self.stream.write().await;
                state.legacy = true;
                state.need_sse = true;
                state.initial = Some(msg);
            }
            if let Err(e) = self.ensure_sse(None).await {
                return Err(Error::transport(format!(
                    "failed to initialize streamable http client: {status}: {body}; sse fallback: {e}"
                )));
            }
            self.initialized.store(true, Ordering::Release);
            return Ok(());
        }

        self.capture_session_id(&resp);
        let handler = self.handler()?;
        if self.read_response(&handler, resp).await? == 0 {
            return Err(Error::transport(
                "no response from server, expected an initialize response",
            ));
        }
        self.initialized.store(true, Ordering::Release);

        if let Err(e) = self.ensure_sse(None).await {
            tracing::warn!(target = "http_client", server = %self.name, error = %e, "event_stream_unavailable");
            self.stream.write().await.need_sse = false;
        }
        Ok(())
    }

    async fn post(self: &Arc<Self>, msg: Message) -> Result<()> {
        self.ensure_sse(None)
            .await
            .map_err(|e| Error::transport(format!("failed to restart event stream: {e}")))?;

        let (url, legacy) = {
            let state = self.stream.read().await;
            (state.message_url.clone(), state.legacy)
        };
        let resp = self.post_to(url, &msg).await?;
        let status = resp.status();
        if status == StatusCode::ACCEPTED || status == StatusCode::NO_CONTENT {
            return Ok(());
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::transport(format!(
                "failed to send message: {status}: {body}"
            )));
        }
        if legacy {
            return Ok(());
        }

        let handler = self.handler()?;
        if is_event_stream(&resp) {
            let inner = self.clone();
            tokio::spawn(async move {
                if let Err(e) = inner.read_response(&handler, resp).await {
                    tracing::warn!(target = "http_client", server = %inner.name, error = %e, "response_stream_failed");
                }
            });
            return Ok(());
        }
        self.read_response(&handler, resp).await.map(|_| ())
    }

    /// Delivers every message in a POST response body. Returns how many were seen.
    async fn read_response(&self, handler: &WireHandler, resp: Response) -> Result<usize> {
        if is_event_stream(&resp) {
            let mut events: EventStream = SseStream::from_bytes_stream(resp.bytes_stream()).boxed();
            let mut seen = 0;
            while let Some(event) = events.next().await {
                let event = event.map_err(|e| Error::transport(format!("invalid event stream: {e}")))?;
                if !is_message_event(&event) {
                    continue;
                }
                let Some(data) = event.data.as_deref() else {
                    continue;
                };
                let msg: Message = serde_json::from_str(data)?;
                seen += 1;
                self.deliver(handler, msg);
            }
            return Ok(seen);
        }

        let body = resp.bytes().await?;
        let text = std::str::from_utf8(&body)
            .map_err(|e| Error::transport(format!("response is not utf-8: {e}")))?
            .trim();
        if text.is_empty() {
            return Ok(0);
        }
        if !text.starts_with('{') {
            return Err(Error::transport(format!(
                "invalid response format, expected JSON object, got: {text}"
            )));
        }
        let msg: Message = serde_json::from_str(text)?;
        self.deliver(handler, msg);
        Ok(1)
    }

    /// Establishes the GET event stream when one is still needed.
    ///
    /// Concurrent callers collapse onto a single attempt: the fast path only takes the read
    /// lock, and the slow path re-checks under the write lock.
    fn ensure_sse(self: &Arc<Self>, last_event_id: Option<String>) -> BoxFuture<'static, Result<()>> {
        let this = self.clone();
        Box::pin(async move {
            if !this.stream.read().await.need_sse {
                return Ok(());
            }
            let mut state = this.stream.write().await;
            if !state.need_sse {
                return Ok(());
            }
            if this.closed.is_cancelled() {
                return Err(Error::SessionClosed);
            }

            let mut req = this.request(Method::GET, this.base_url.clone());
            if let Some(id) = &last_event_id {
                req = req.header(HEADER_LAST_EVENT_ID, id);
            }
            let resp = req.send().await?;
            let status = resp.status();
            if status == StatusCode::METHOD_NOT_ALLOWED && !state.legacy {
                tracing::debug!(target = "http_client", server = %this.name, "event_stream_not_supported");
                state.need_sse = false;
                return Ok(());
            }
            if status != StatusCode::OK && status != StatusCode::ACCEPTED {
                return Err(Error::transport(format!(
                    "failed to connect to event stream: {status}"
                )));
            }
            this.capture_session_id(&resp);

            let mut events: EventStream = SseStream::from_bytes_stream(resp.bytes_stream()).boxed();
            if state.legacy {
                let endpoint = next_data(&mut events).await?;
                let url = this
                    .base_url
                    .join(endpoint.trim())
                    .map_err(|e| Error::transport(format!("invalid endpoint {endpoint}: {e}")))?;
                state.message_url = url.clone();

                if let Some(initial) = state.initial.as_mut() {
                    // Replays get a fresh id so the answer is not mistaken for the original.
                    if this.initialized.load(Ordering::Acquire) {
                        initial.id = Some(RequestId::new_uuid());
                    }
                    let resp = this.post_to(url, initial).await?;
                    let status = resp.status();
                    if status != StatusCode::OK && status != StatusCode::ACCEPTED {
                        let body = resp.text().await.unwrap_or_default();
                        return Err(Error::transport(format!(
                            "failed to post initialize message: {status}: {body}"
                        )));
                    }
                }
            } else {
                state.message_url = this.base_url.clone();
            }

            state.need_sse = false;
            drop(state);

            tracing::debug!(target = "http_client", server = %this.name, resumed = last_event_id.is_some(), "event_stream_connected");
            let reader = this.clone();
            tokio::spawn(async move { reader.read_stream(events, last_event_id).await });
            Ok(())
        })
    }

    async fn read_stream(self: Arc<Self>, mut events: EventStream, mut last_event_id: Option<String>) {
        let Ok(handler) = self.handler() else {
            return;
        };
        loop {
            let event = tokio::select! {
                _ = self.closed.cancelled() => return,
                event = events.next() => event,
            };
            let event = match event {
                Some(Ok(event)) => event,
                Some(Err(e)) => {
                    tracing::warn!(target = "http_client", server = %self.name, error = %e, "event_stream_failed");
                    break;
                }
                None => break,
            };
            if !is_message_event(&event) {
                continue;
            }
            let Some(data) = event.data.as_deref() else {
                continue;
            };
            let mut msg: Message = match serde_json::from_str(data) {
                Ok(msg) => msg,
                Err(_) => continue,
            };
            match (&event.id, &msg.id) {
                (Some(id), _) if !id.is_empty() => last_event_id = Some(id.clone()),
                (_, Some(id)) => last_event_id = Some(id.to_string()),
                _ => {}
            }
            if msg.id.is_none() {
                msg.id = Some(RequestId::new_uuid());
            }
            self.deliver(&handler, msg);
        }

        if self.closed.is_cancelled() {
            return;
        }
        self.stream.write().await.need_sse = true;
        tokio::select! {
            _ = self.closed.cancelled() => return,
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
        tracing::debug!(target = "http_client", server = %self.name, last_event_id = ?last_event_id, "event_stream_reconnecting");
        if let Err(e) = self.ensure_sse(last_event_id).await {
            tracing::warn!(target = "http_client", server = %self.name, error = %e, "event_stream_reconnect_failed");
        }
    }
}

fn is_event_stream(resp: &Response) -> bool {
    resp.headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with(EVENT_STREAM_MIME_TYPE))
}

fn is_message_event(event: &Sse) -> bool {
    matches!(event.event.as_deref(), None | Some("") | Some("message"))
}

async fn next_data(events: &mut EventStream) -> Result<String> {
    while let Some(event) = events.next().await {
        let event = event.map_err(|e| Error::transport(format!("invalid event stream: {e}")))?;
        if matches!(event.event.as_deref(), None | Some("") | Some("message") | Some("endpoint"))
            && let Some(data) = event.data
        {
            return Ok(data);
        }
    }
    Err(Error::transport("event stream ended before endpoint was announced"))
}
