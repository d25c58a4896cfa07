use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderName, StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use nanobot_mcp_core::{Message, RequestId, RpcError};
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::error::{Error, Result};
use crate::server_session::ServerSession;
use crate::session::{MessageHandler, SessionOptions};
use crate::session_store::{InMemorySessionStore, RequestContext, SessionStore};

pub const ENV_HEADER_PREFIX: &str = "x-nanobot-env-";
pub const BEARER_TOKEN_ENV: &str = "http:bearer-token";
const SESSION_ID_HEADER: HeaderName = HeaderName::from_static("mcp-session-id");

#[derive(Clone, Default)]
pub struct HttpServerOptions {
    /// Defaults to an [`InMemorySessionStore`].
    pub session_store: Option<Arc<dyn SessionStore>>,
    /// Template for every session the server creates.
    pub session: SessionOptions,
}

/// Serves MCP over HTTP: streamable POSTs, a GET event stream per session, and the
/// legacy `?id=` POST form.
#[derive(Clone)]
pub struct HttpServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    env: HashMap<String, String>,
    handler: Arc<dyn MessageHandler>,
    sessions: Arc<dyn SessionStore>,
    session_opts: SessionOptions,
}

#[derive(Debug, Default, Deserialize)]
struct SessionQuery {
    id: Option<String>,
}

impl HttpServer {
    pub fn new(env: HashMap<String, String>, handler: Arc<dyn MessageHandler>, opts: HttpServerOptions) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                env,
                handler,
                sessions: opts
                    .session_store
                    .unwrap_or_else(|| Arc::new(InMemorySessionStore::new())),
                session_opts: opts.session,
            }),
        }
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.inner.sessions
    }

    /// Routes GET/POST/DELETE on `base_path`; other methods get 405.
    pub fn router(&self, base_path: &str) -> Router {
        let path = if base_path.is_empty() { "/" } else { base_path };
        Router::new()
            .route(path, get(stream_events).post(post_message).delete(delete_session))
            .with_state(self.clone())
    }

    /// Base env plus whatever the request carries: a bearer token and `X-Nanobot-Env-*`
    /// headers. Env header names are upper-cased.
    pub fn request_env(&self, headers: &HeaderMap) -> HashMap<String, String> {
        let mut env = self.inner.env.clone();
        if let Some(token) = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
        {
            env.insert(BEARER_TOKEN_ENV.to_string(), token.to_string());
        }
        for name in headers.keys() {
            let Some(key) = name.as_str().strip_prefix(ENV_HEADER_PREFIX) else {
                continue;
            };
            let values: Vec<&str> = headers
                .get_all(name)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .collect();
            env.insert(key.to_ascii_uppercase(), values.join(", "));
        }
        env
    }

    fn context(&self, headers: &HeaderMap) -> RequestContext {
        RequestContext {
            env: self.request_env(headers),
        }
    }

    async fn acquire(&self, headers: &HeaderMap, id: &str) -> Result<Option<ServerSession>> {
        self.inner
            .sessions
            .acquire(&self.context(headers), self.inner.handler.clone(), id)
            .await
    }

    async fn release(&self, session: &ServerSession) {
        if let Err(e) = self.inner.sessions.release(session).await {
            tracing::warn!(target = "http_server", session_id = %session.id(), error = %e, "session_release_failed");
        }
    }
}

fn session_id(server: &HttpServer, headers: &HeaderMap, query: &SessionQuery) -> Option<String> {
    server
        .inner
        .sessions
        .extract_id(headers)
        .or_else(|| query.id.clone().filter(|id| !id.is_empty()))
}

fn error(status: StatusCode, msg: impl Into<String>) -> Response {
    (status, msg.into()).into_response()
}

fn json_response(status: StatusCode, msg: &Message) -> Response {
    (status, axum::Json(msg)).into_response()
}

/// Session held by an open event stream. Released when the stream ends or the client
/// goes away.
struct StreamLease {
    server: HttpServer,
    session: ServerSession,
}

impl Drop for StreamLease {
    fn drop(&mut self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let server = self.server.clone();
        let session = self.session.clone();
        runtime.spawn(async move {
            tracing::debug!(target = "http_server", session_id = %session.id(), "event_stream_closed");
            server.release(&session).await;
        });
    }
}

async fn stream_events(
    State(server): State<HttpServer>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
) -> Response {
    let Some(id) = session_id(&server, &headers, &query) else {
        return error(StatusCode::BAD_REQUEST, "Session ID is required");
    };
    let session = match server.acquire(&headers, &id).await {
        Ok(Some(session)) => session,
        Ok(None) => return error(StatusCode::NOT_FOUND, "Session not found"),
        Err(e) => {
            return error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to load session: {e}"),
            );
        }
    };
    tracing::debug!(target = "http_server", session_id = %id, "event_stream_opened");

    let lease = StreamLease { server, session };
    let events = futures::stream::unfold(lease, |lease| async move {
        loop {
            let msg = lease.session.read().await?;
            match serde_json::to_string(&msg) {
                Ok(data) => {
                    let event = Event::default().data(data);
                    return Some((Ok::<_, Infallible>(event), lease));
                }
                Err(e) => {
                    tracing::warn!(target = "http_server", session_id = %lease.session.id(), error = %e, "event_encode_failed");
                }
            }
        }
    });
    (
        [(header::CACHE_CONTROL, "no-cache")],
        Sse::new(events).keep_alive(KeepAlive::default()),
    )
        .into_response()
}

async fn delete_session(
    State(server): State<HttpServer>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
) -> Response {
    let Some(id) = session_id(&server, &headers, &query) else {
        return error(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed");
    };
    let found = server
        .inner
        .sessions
        .load_and_delete(&server.context(&headers), server.inner.handler.clone(), &id)
        .await;
    match found {
        Ok(Some(session)) => {
            session.close();
            tracing::info!(target = "http_server", session_id = %id, "session_deleted");
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(None) => error(StatusCode::NOT_FOUND, "Session not found"),
        Err(e) => error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to delete session: {e}"),
        ),
    }
}

async fn post_message(
    State(server): State<HttpServer>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let msg: Message = match serde_json::from_slice(&body) {
        Ok(msg) => msg,
        Err(e) => {
            return error(
                StatusCode::BAD_REQUEST,
                format!("Failed to decode message: {e}"),
            );
        }
    };

    if let Some(id) = server.inner.sessions.extract_id(&headers) {
        return exchange_in_session(&server, &headers, &id, msg).await;
    }
    if let Some(id) = query.id.filter(|id| !id.is_empty()) {
        return deliver_to_session(&server, &headers, &id, msg).await;
    }
    if msg.method != "initialize" {
        return error(
            StatusCode::METHOD_NOT_ALLOWED,
            format!("Method {} not allowed", msg.method),
        );
    }
    initialize_session(&server, &headers, msg).await
}

async fn exchange_in_session(server: &HttpServer, headers: &HeaderMap, id: &str, mut msg: Message) -> Response {
    let session = match server.acquire(headers, id).await {
        Ok(Some(session)) => session,
        Ok(None) => return error(StatusCode::NOT_FOUND, "Session not found"),
        Err(e) => {
            return error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to load session: {e}"),
            );
        }
    };

    let manufactured = msg.id.is_none();
    if manufactured {
        msg.id = Some(RequestId::new_uuid());
    }
    let method = msg.method.clone();
    let reply_id = if manufactured { None } else { msg.id.clone() };

    let result = session.exchange(msg).await;
    server.release(&session).await;

    let response = match result {
        Ok(mut resp) => {
            if manufactured {
                resp.id = None;
            }
            resp
        }
        Err(Error::NoResponse) => return StatusCode::ACCEPTED.into_response(),
        Err(e) => {
            tracing::debug!(target = "http_server", session_id = %id, method = %method, error = %e, "exchange_failed");
            Message::error_response(reply_id, RpcError::internal(e.to_string()))
        }
    };

    let status = if response.error.is_none() && is_empty_result(&response.result) && method != "ping" {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    json_response(status, &response)
}

async fn deliver_to_session(server: &HttpServer, headers: &HeaderMap, id: &str, msg: Message) -> Response {
    let session = match server.acquire(headers, id).await {
        Ok(Some(session)) => session,
        Ok(None) => return error(StatusCode::NOT_FOUND, "Session not found"),
        Err(e) => {
            return error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to load session: {e}"),
            );
        }
    };
    let delivered = session.deliver(msg);
    server.release(&session).await;
    match delivered {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to handle message: {e}"),
        ),
    }
}

async fn initialize_session(server: &HttpServer, headers: &HeaderMap, msg: Message) -> Response {
    let session = match ServerSession::new(server.inner.handler.clone(), server.inner.session_opts.clone()).await {
        Ok(session) => session,
        Err(e) => {
            return error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to create session: {e}"),
            );
        }
    };
    session.session().merge_env(server.request_env(headers));
    if let Err(e) = server.inner.sessions.store(&session).await {
        return error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to store session: {e}"),
        );
    }
    tracing::info!(target = "http_server", session_id = %session.id(), "session_created");

    let resp = match session.exchange(msg).await {
        Ok(resp) => resp,
        Err(e) => {
            session.close();
            if let Err(cleanup) = server
                .inner
                .sessions
                .load_and_delete(&server.context(headers), server.inner.handler.clone(), &session.id())
                .await
            {
                tracing::warn!(target = "http_server", session_id = %session.id(), error = %cleanup, "session_delete_failed");
            }
            tracing::info!(target = "http_server", session_id = %session.id(), error = %e, "initialize_failed");
            return error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to handle message: {e}"),
            );
        }
    };
    server.release(&session).await;

    let mut response = json_response(StatusCode::OK, &resp);
    if let Ok(value) = session.id().parse() {
        response.headers_mut().insert(SESSION_ID_HEADER, value);
    }
    response
}

fn is_empty_result(result: &Option<JsonValue>) -> bool {
    match result {
        None | Some(JsonValue::Null) => true,
        Some(JsonValue::Object(map)) => map.is_empty(),
        Some(_) => false,
    }
}

/// Binds `addr` and serves `server` on `base_path` in a background task.
pub async fn start_http_server(
    server: HttpServer,
    base_path: &str,
    addr: SocketAddr,
) -> Result<(tokio::task::JoinHandle<()>, SocketAddr)> {
    let router = server.router(base_path);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    tracing::info!(target = "http_server", addr = %local, base_path = %base_path, "listening");
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(target = "http_server", error = %e, "server_failed");
        }
    });
    Ok((handle, local))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MethodNotFound;

    #[test]
    fn env_comes_from_bearer_and_prefixed_headers() {
        let server = HttpServer::new(
            HashMap::from([("BASE".to_string(), "1".to_string())]),
            Arc::new(MethodNotFound),
            HttpServerOptions::default(),
        );
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer abc".parse().unwrap());
        headers.append("x-nanobot-env-region", "eu".parse().unwrap());
        headers.append("x-nanobot-env-region", "us".parse().unwrap());
        let env = server.request_env(&headers);
        assert_eq!(env["BASE"], "1");
        assert_eq!(env[BEARER_TOKEN_ENV], "abc");
        assert_eq!(env["REGION"], "eu, us");
    }

    #[test]
    fn empty_results_are_detected() {
        assert!(is_empty_result(&None));
        assert!(is_empty_result(&Some(serde_json::json!({}))));
        assert!(!is_empty_result(&Some(serde_json::json!({"tools": []}))));
    }
}
