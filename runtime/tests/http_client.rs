mod common;

use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use futures::future::BoxFuture;
use nanobot_mcp::client::LoggingCallback;
use nanobot_mcp::config::{ServerConfig, ToolOverride};
use nanobot_mcp::wire::{HEADER_LAST_EVENT_ID, HEADER_SESSION_ID};
use nanobot_mcp::{CallOptions, Client, ClientOptions, Message};
use nanobot_mcp_core::types::LoggingMessage;
use serde_json::{Value as JsonValue, json};
use tokio::sync::mpsc;

use common::{mcp_url, serve_echo, serve_router};

fn stub_result(msg: &Message, headers: &HeaderMap) -> JsonValue {
    match msg.method.as_str() {
        "initialize" => json!({
            "protocolVersion": "2025-11-25",
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "stub", "version": "0.0.1"}
        }),
        "tools/list" => json!({"tools": [{"name": "whoami", "inputSchema": {"type": "object"}}]}),
        "tools/call" => {
            let seen = headers
                .get("x-test")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("none");
            json!({"content": [{"type": "text", "text": seen}]})
        }
        _ => json!({}),
    }
}

#[tokio::test]
async fn client_round_trip_over_streamable_http() {
    let Some(addr) = serve_echo("client_round_trip_over_streamable_http").await else {
        return;
    };

    let (log_tx, mut log_rx) = mpsc::unbounded_channel::<LoggingMessage>();
    let on_logging: LoggingCallback = Arc::new(move |msg: LoggingMessage| -> BoxFuture<'static, nanobot_mcp::Result<()>> {
        let log_tx = log_tx.clone();
        Box::pin(async move {
            let _ = log_tx.send(msg);
            Ok(())
        })
    });

    let config = ServerConfig {
        url: mcp_url(addr),
        tool_overrides: BTreeMap::from([(
            "echo".to_string(),
            ToolOverride {
                name: Some("say".into()),
                description: Some("repeat a message".into()),
                input_schema: None,
            },
        )]),
        ..Default::default()
    };
    let client = Client::connect(
        "echo",
        &config,
        ClientOptions {
            on_logging: Some(on_logging),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let info = client.session().initialize_result().unwrap();
    assert_eq!(info.server_info.name, "echo");
    let session_id = client.session().wire().and_then(|w| w.session_id()).unwrap();

    client.ping().await.unwrap();

    let tools = client.list_tools().await.unwrap();
    let names: Vec<_> = tools.tools.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["say"]);
    assert_eq!(tools.tools[0].description, "repeat a message");

    let result = client
        .call_tool("say", Some(json!({"message": "hello"})), CallOptions::default())
        .await
        .unwrap();
    assert_eq!(result.content[0]["text"], json!("hello"));
    assert_eq!(result.structured_content.unwrap()["tool"], json!("echo"));

    client
        .call_tool("notify", Some(json!({"message": "over the stream"})), CallOptions::default())
        .await
        .unwrap();
    let log = tokio::time::timeout(Duration::from_secs(5), log_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(log.data, json!("over the stream"));

    client.close(true).await;
    let resp = reqwest::Client::new()
        .delete(mcp_url(addr))
        .header(HEADER_SESSION_ID, session_id)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn event_stream_is_optional() {
    async fn handle(headers: HeaderMap, axum::Json(msg): axum::Json<Message>) -> Response {
        if !msg.is_request() {
            return StatusCode::ACCEPTED.into_response();
        }
        let resp = Message::response(msg.id.clone(), stub_result(&msg, &headers));
        ([(HEADER_SESSION_ID, "stub-session")], axum::Json(resp)).into_response()
    }
    // GET falls through to 405
    let Some(addr) = serve_router(Router::new().route("/mcp", post(handle)), "event_stream_is_optional").await else {
        return;
    };

    let config = ServerConfig {
        url: mcp_url(addr),
        headers: HashMap::from([("X-Test".to_string(), "${TOKEN}".to_string())]),
        ..Default::default()
    };
    let client = Client::connect(
        "stub",
        &config,
        ClientOptions {
            env: HashMap::from([("TOKEN".to_string(), "abc".to_string())]),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(
        client.session().wire().and_then(|w| w.session_id()).as_deref(),
        Some("stub-session")
    );
    client.ping().await.unwrap();
    let result = client
        .call_tool("whoami", None, CallOptions::default())
        .await
        .unwrap();
    assert_eq!(result.content[0]["text"], json!("abc"));
    client.close(false).await;
}

#[derive(Clone)]
struct LegacyStub {
    tx: mpsc::UnboundedSender<String>,
    rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<String>>>>,
}

async fn legacy_events(State(stub): State<LegacyStub>) -> Response {
    let Some(rx) = stub.rx.lock().unwrap().take() else {
        return StatusCode::CONFLICT.into_response();
    };
    let endpoint = futures::stream::once(async {
        Ok::<_, Infallible>(Event::default().event("endpoint").data("/messages?id=legacy"))
    });
    let messages = futures::stream::unfold(rx, |mut rx| async move {
        let data = rx.recv().await?;
        Some((Ok::<_, Infallible>(Event::default().data(data)), rx))
    });
    Sse::new(futures::StreamExt::chain(endpoint, messages)).into_response()
}

async fn legacy_post(
    State(stub): State<LegacyStub>,
    headers: HeaderMap,
    axum::Json(msg): axum::Json<Message>,
) -> StatusCode {
    if msg.is_request() {
        let resp = Message::response(msg.id.clone(), stub_result(&msg, &headers));
        let _ = stub.tx.send(serde_json::to_string(&resp).unwrap());
    }
    StatusCode::ACCEPTED
}

#[tokio::test]
async fn falls_back_to_legacy_sse() {
    let (tx, rx) = mpsc::unbounded_channel();
    let stub = LegacyStub {
        tx,
        rx: Arc::new(Mutex::new(Some(rx))),
    };
    let router = Router::new()
        .route("/sse", get(legacy_events))
        .route("/messages", post(legacy_post))
        .with_state(stub);
    let Some(addr) = serve_router(router, "falls_back_to_legacy_sse").await else {
        return;
    };

    let config = ServerConfig {
        url: format!("http://{addr}/sse"),
        ..Default::default()
    };
    let client = tokio::time::timeout(
        Duration::from_secs(5),
        Client::connect("legacy", &config, ClientOptions::default()),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(client.session().initialize_result().unwrap().server_info.name, "stub");

    let tools = client.list_tools().await.unwrap();
    assert_eq!(tools.tools.len(), 1);
    assert_eq!(tools.tools[0].name, "whoami");
    client.close(false).await;
}

#[derive(Clone, Default)]
struct ResumeStub {
    gets: Arc<AtomicUsize>,
    resumed_from: Arc<Mutex<Option<String>>>,
}

fn log_event(text: &str) -> Event {
    let msg = Message::notification("notifications/message", Some(json!({"level": "info", "data": text})));
    Event::default().data(serde_json::to_string(&msg).unwrap())
}

async fn resume_post(headers: HeaderMap, axum::Json(msg): axum::Json<Message>) -> Response {
    if !msg.is_request() {
        return StatusCode::ACCEPTED.into_response();
    }
    let resp = Message::response(msg.id.clone(), stub_result(&msg, &headers));
    ([(HEADER_SESSION_ID, "resume-session")], axum::Json(resp)).into_response()
}

async fn resume_events(State(stub): State<ResumeStub>, headers: HeaderMap) -> Response {
    if stub.gets.fetch_add(1, Ordering::SeqCst) == 0 {
        // one event, then the stream ends
        let first = futures::stream::once(async { Ok::<_, Infallible>(log_event("first").id("e1")) });
        return Sse::new(first).into_response();
    }
    *stub.resumed_from.lock().unwrap() = headers
        .get(HEADER_LAST_EVENT_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let second = futures::stream::once(async { Ok::<_, Infallible>(log_event("second")) });
    Sse::new(futures::StreamExt::chain(second, futures::stream::pending())).into_response()
}

#[tokio::test]
async fn dropped_event_stream_resumes_from_last_event_id() {
    let stub = ResumeStub::default();
    let router = Router::new()
        .route("/mcp", post(resume_post).get(resume_events))
        .with_state(stub.clone());
    let Some(addr) = serve_router(router, "dropped_event_stream_resumes_from_last_event_id").await else {
        return;
    };

    let (log_tx, mut log_rx) = mpsc::unbounded_channel::<LoggingMessage>();
    let on_logging: LoggingCallback = Arc::new(move |msg: LoggingMessage| -> BoxFuture<'static, nanobot_mcp::Result<()>> {
        let log_tx = log_tx.clone();
        Box::pin(async move {
            let _ = log_tx.send(msg);
            Ok(())
        })
    });
    let config = ServerConfig {
        url: mcp_url(addr),
        ..Default::default()
    };
    let client = Client::connect(
        "resume",
        &config,
        ClientOptions {
            on_logging: Some(on_logging),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    for expected in ["first", "second"] {
        let log = tokio::time::timeout(Duration::from_secs(5), log_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(log.data, json!(expected));
    }
    assert_eq!(stub.gets.load(Ordering::SeqCst), 2);
    assert_eq!(stub.resumed_from.lock().unwrap().as_deref(), Some("e1"));
    client.close(false).await;
}
