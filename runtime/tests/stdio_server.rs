mod common;

use std::collections::HashMap;
use std::time::Duration;

use nanobot_mcp::{Message, SessionOptions, StdioServer};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf};

use common::echo_server;

async fn next(lines: &mut Lines<BufReader<ReadHalf<DuplexStream>>>) -> Message {
    let line = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    serde_json::from_str(&line).unwrap()
}

#[tokio::test]
async fn serves_requests_and_pushes_over_pipes() {
    let (local, remote) = tokio::io::duplex(64 * 1024);
    let (r, w) = tokio::io::split(local);
    let server = StdioServer::start(
        HashMap::from([("REGION".to_string(), "us".to_string())]),
        echo_server(),
        SessionOptions::default(),
        r,
        w,
    )
    .await
    .unwrap();

    let (pr, mut pw) = tokio::io::split(remote);
    let mut lines = BufReader::new(pr).lines();

    let frames = [
        json!({"jsonrpc": "2.0", "id": "1", "method": "initialize", "params": {
            "protocolVersion": "2025-11-25", "capabilities": {},
            "clientInfo": {"name": "pipe", "version": "1"}
        }}),
        json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
        json!({"jsonrpc": "2.0", "id": 2, "method": "tools/call", "params": {
            "name": "echo", "arguments": {"message": "hi", "env": "REGION"}
        }}),
    ];
    for frame in &frames {
        pw.write_all(format!("{frame}\n").as_bytes()).await.unwrap();
    }

    // requests are handled concurrently, so replies may arrive in either order
    let mut replies = vec![next(&mut lines).await, next(&mut lines).await];
    replies.sort_by_key(|m| m.id.as_ref().map(|id| id.to_string()));
    let call = replies.pop().unwrap();
    let init = replies.pop().unwrap();
    assert_eq!(init.id, Some("1".into()));
    assert_eq!(init.result.unwrap()["serverInfo"]["name"], json!("echo"));
    assert_eq!(call.id, Some(2.into()));
    assert_eq!(call.result.unwrap()["structuredContent"]["env"], json!("us"));
    assert_eq!(
        server.session().session().initialize_request().unwrap().client_info.name,
        "pipe"
    );

    pw.write_all(
        format!(
            "{}\n",
            json!({"jsonrpc": "2.0", "id": 3, "method": "tools/call", "params": {
                "name": "notify", "arguments": {"message": "pushed"}
            }})
        )
        .as_bytes(),
    )
    .await
    .unwrap();
    let mut got = vec![next(&mut lines).await, next(&mut lines).await];
    got.sort_by_key(|m| m.is_response());
    assert_eq!(got[0].method, "notifications/message");
    assert_eq!(got[1].id, Some(3.into()));

    pw.write_all(format!("{}\n", json!({"jsonrpc": "2.0", "id": 4, "method": "nope"})).as_bytes())
        .await
        .unwrap();
    let err = next(&mut lines).await;
    assert_eq!(err.error.unwrap().code, -32601);

    drop(pw);
    drop(lines);
    tokio::time::timeout(Duration::from_secs(5), server.wait())
        .await
        .unwrap();
}
