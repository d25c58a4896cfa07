mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use nanobot_mcp::wire::{HEADER_SESSION_ID, JSON_MIME_TYPE};
use nanobot_mcp::{
    HttpServer, HttpServerOptions, InMemorySessionStore, MemoryStateStore, Message, PersistentSessionStore,
    RequestContext, Session, SessionOptions, SessionStore, StateStore, handler_fn,
};
use serde_json::{Value as JsonValue, json};

use common::{echo_server, mcp_url, serve, serve_echo};

fn initialize_body(id: &str) -> JsonValue {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "initialize",
        "params": {
            "protocolVersion": "2025-11-25",
            "capabilities": {},
            "clientInfo": {"name": "raw", "version": "1"}
        }
    })
}

async fn initialize(http: &reqwest::Client, url: &str) -> String {
    let resp = http
        .post(url)
        .header(reqwest::header::ACCEPT, "application/json, text/event-stream")
        .json(&initialize_body("1"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let id = resp
        .headers()
        .get(HEADER_SESSION_ID)
        .and_then(|v| v.to_str().ok())
        .unwrap()
        .to_string();
    let body: JsonValue = resp.json().await.unwrap();
    assert_eq!(body["id"], json!("1"));
    assert_eq!(body["result"]["serverInfo"]["name"], json!("echo"));
    id
}

#[tokio::test]
async fn delete_unknown_session_is_not_found() {
    let Some(addr) = serve_echo("delete_unknown_session_is_not_found").await else {
        return;
    };
    let resp = reqwest::Client::new()
        .delete(mcp_url(addr))
        .header(HEADER_SESSION_ID, "does-not-exist")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn post_without_session_requires_initialize() {
    let Some(addr) = serve_echo("post_without_session_requires_initialize").await else {
        return;
    };
    let http = reqwest::Client::new();
    let resp = http
        .post(mcp_url(addr))
        .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 405);

    let resp = http
        .post(mcp_url(addr))
        .header(reqwest::header::CONTENT_TYPE, JSON_MIME_TYPE)
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn every_initialize_gets_a_fresh_session() {
    let Some(addr) = serve_echo("every_initialize_gets_a_fresh_session").await else {
        return;
    };
    let http = reqwest::Client::new();
    let url = mcp_url(addr);
    let first = initialize(&http, &url).await;
    let second = initialize(&http, &url).await;
    assert!(!first.is_empty());
    assert_ne!(first, second);
}

#[tokio::test]
async fn session_requests_and_notifications() {
    let Some(addr) = serve_echo("session_requests_and_notifications").await else {
        return;
    };
    let http = reqwest::Client::new();
    let url = mcp_url(addr);
    let id = initialize(&http, &url).await;

    let resp = http
        .post(&url)
        .header(HEADER_SESSION_ID, &id)
        .header("X-Nanobot-Env-Region", "eu")
        .json(&json!({
            "jsonrpc": "2.0",
            "id": 2,
            "method": "tools/call",
            "params": {"name": "echo", "arguments": {"message": "hi", "env": "REGION"}}
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: JsonValue = resp.json().await.unwrap();
    assert_eq!(body["id"], json!(2));
    assert_eq!(body["result"]["content"][0]["text"], json!("hi"));
    assert_eq!(body["result"]["structuredContent"]["env"], json!("eu"));

    let resp = http
        .post(&url)
        .header(HEADER_SESSION_ID, &id)
        .json(&json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);

    let resp = http
        .post(&url)
        .header(HEADER_SESSION_ID, &id)
        .json(&json!({"jsonrpc": "2.0", "id": 3, "method": "nope"}))
        .send()
        .await
        .unwrap();
    let body: JsonValue = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], json!(-32601));

    let resp = http
        .delete(&url)
        .header(HEADER_SESSION_ID, &id)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);

    let resp = http
        .post(&url)
        .header(HEADER_SESSION_ID, &id)
        .json(&json!({"jsonrpc": "2.0", "id": 4, "method": "ping"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn event_stream_carries_server_messages() {
    let Some(addr) = serve_echo("event_stream_carries_server_messages").await else {
        return;
    };
    let http = reqwest::Client::new();
    let url = mcp_url(addr);

    let resp = http.get(&url).send().await.unwrap();
    assert_eq!(resp.status(), 400);

    let id = initialize(&http, &url).await;
    let stream = http
        .get(&url)
        .header(HEADER_SESSION_ID, &id)
        .header(reqwest::header::ACCEPT, "text/event-stream")
        .send()
        .await
        .unwrap();
    assert_eq!(stream.status(), 200);
    let mut body = stream.bytes_stream();

    let resp = http
        .post(&url)
        .header(HEADER_SESSION_ID, &id)
        .json(&json!({
            "jsonrpc": "2.0",
            "id": 5,
            "method": "tools/call",
            "params": {"name": "notify", "arguments": {"message": "pushed"}}
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let mut seen = String::new();
    let found = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(chunk) = body.next().await {
            seen.push_str(&String::from_utf8_lossy(&chunk.unwrap()));
            if seen.contains("notifications/message") {
                return true;
            }
        }
        false
    })
    .await
    .unwrap_or(false);
    assert!(found, "stream did not deliver the notification: {seen}");
    assert!(seen.contains("pushed"));
}

#[tokio::test]
async fn failed_initialize_leaves_no_session_behind() {
    let store = Arc::new(InMemorySessionStore::new());
    let shared: Arc<dyn SessionStore> = store.clone();
    // never answers, so initialize has no reply
    let silent = handler_fn(|_session: Arc<Session>, _msg: Message| async {});
    let server = HttpServer::new(
        HashMap::new(),
        silent,
        HttpServerOptions {
            session_store: Some(shared),
            ..Default::default()
        },
    );
    let Some(addr) = serve(server, "failed_initialize_leaves_no_session_behind").await else {
        return;
    };

    let resp = reqwest::Client::new()
        .post(mcp_url(addr))
        .json(&initialize_body("1"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 500);
    assert!(resp.headers().get(HEADER_SESSION_ID).is_none());
    assert_eq!(store.len(), 0);
}

#[tokio::test]
async fn disconnected_event_stream_releases_the_session() {
    let states = MemoryStateStore::new();
    let store = Arc::new(PersistentSessionStore::new(states.clone(), SessionOptions::default()));
    let shared: Arc<dyn SessionStore> = store.clone();
    let server = HttpServer::new(
        HashMap::new(),
        echo_server(),
        HttpServerOptions {
            session_store: Some(shared),
            ..Default::default()
        },
    );
    let Some(addr) = serve(server, "disconnected_event_stream_releases_the_session").await else {
        return;
    };
    let http = reqwest::Client::new();
    let url = mcp_url(addr);
    let id = initialize(&http, &url).await;

    let stream = http
        .get(&url)
        .header(HEADER_SESSION_ID, &id)
        .header(reqwest::header::ACCEPT, "text/event-stream")
        .send()
        .await
        .unwrap();
    assert_eq!(stream.status(), 200);

    // changed outside any request, so only the stream's release can persist it
    let live = store
        .acquire(&RequestContext::default(), echo_server(), &id)
        .await
        .unwrap()
        .unwrap();
    live.session().set("theme", "dark".to_string());
    let before = states.get(&id).await.unwrap().unwrap();
    assert!(!before.attributes.contains_key("theme"));

    drop(stream);
    // wakes the stream so a closed connection is noticed
    live.session()
        .send(Message::notification("notifications/message", Some(json!({"level": "info", "data": "gone"}))))
        .await
        .unwrap();

    let persisted = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(state) = states.get(&id).await.unwrap()
                && state.attributes.contains_key("theme")
            {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("event stream never released the session");
    assert_eq!(persisted.attributes["theme"], json!("dark"));
}
