#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use nanobot_mcp::config::ConfigProvider;
use nanobot_mcp::{HttpServer, HttpServerOptions, Message, MessageHandler, Session, handler_fn};
use serde_json::json;

#[derive(Clone)]
pub struct TestProvider {
    base: PathBuf,
}

impl TestProvider {
    pub fn new() -> Self {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let tid = format!("{:?}", std::thread::current().id());
        let dir = std::env::temp_dir().join(format!(
            "nanobot-mcp-tests-{}-{}-{}",
            std::process::id(),
            tid.replace(['(', ')'], ""),
            stamp
        ));
        fs::create_dir_all(&dir).unwrap();
        Self { base: dir }
    }
}

impl Default for TestProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigProvider for TestProvider {
    fn base_dir(&self) -> PathBuf {
        self.base.clone()
    }
}

/// Minimal MCP server: handshake, ping, and an `echo` tool that also reports the
/// session env value named by its `env` argument. Calling it as `notify` first pushes a
/// log notification; as `stray` it first pushes a response to a request nobody sent.
pub fn echo_server() -> Arc<dyn MessageHandler> {
    handler_fn(|session: Arc<Session>, msg: Message| async move {
        let result = match msg.method.as_str() {
            "initialize" => json!({
                "protocolVersion": "2025-11-25",
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "echo", "version": "0.0.1"}
            }),
            "ping" => json!({}),
            "tools/list" => json!({
                "tools": [
                    {"name": "echo", "description": "echo", "inputSchema": {"type": "object"}},
                    {"name": "hidden", "inputSchema": {"type": "object"}}
                ]
            }),
            "tools/call" => {
                let params = msg.params.clone().unwrap_or_default();
                let text = params["arguments"]["message"].as_str().unwrap_or_default().to_string();
                let env_key = params["arguments"]["env"].as_str().unwrap_or_default();
                let env_value = session.env().get(env_key).cloned().unwrap_or_default();
                if params["name"] == "stray" {
                    let _ = session
                        .send(Message::response(Some("upstream-only".into()), json!({})))
                        .await;
                }
                if params["name"] == "notify" {
                    let _ = session
                        .send(Message::notification(
                            "notifications/message",
                            Some(json!({"level": "info", "data": text})),
                        ))
                        .await;
                }
                json!({
                    "content": [{"type": "text", "text": text}],
                    "structuredContent": {"tool": params["name"], "env": env_value}
                })
            }
            _ if msg.is_request() => {
                let _ = session
                    .send_error(&msg, nanobot_mcp::RpcError::method_not_found(&msg.method))
                    .await;
                return;
            }
            _ => return,
        };
        let _ = session.reply(&msg, result).await;
    })
}

/// Binds an ephemeral port, or `None` when the sandbox forbids sockets.
pub async fn serve(server: HttpServer, test_name: &str) -> Option<SocketAddr> {
    match nanobot_mcp::start_http_server(server, "/mcp", SocketAddr::from(([127, 0, 0, 1], 0))).await {
        Ok((_, addr)) => Some(addr),
        Err(nanobot_mcp::Error::Io(err)) if err.kind() == std::io::ErrorKind::PermissionDenied => {
            eprintln!("skipping {test_name}: {err}");
            None
        }
        Err(err) => panic!("failed to bind test server: {err}"),
    }
}

/// Serves a hand-written router on an ephemeral port, or `None` when sockets are forbidden.
pub async fn serve_router(router: axum::Router, test_name: &str) -> Option<SocketAddr> {
    let listener = match tokio::net::TcpListener::bind("127.0.0.1:0").await {
        Ok(l) => l,
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
            eprintln!("skipping {test_name}: {err}");
            return None;
        }
        Err(err) => panic!("failed to bind listener: {err}"),
    };
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    Some(addr)
}

pub async fn serve_echo(test_name: &str) -> Option<SocketAddr> {
    let server = HttpServer::new(HashMap::new(), echo_server(), HttpServerOptions::default());
    serve(server, test_name).await
}

pub fn mcp_url(addr: SocketAddr) -> String {
    format!("http://{addr}/mcp")
}
