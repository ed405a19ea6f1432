// Wire-level tests for the MCP client over an in-memory stdio pair.
// A scripted server task answers the handshake and tool calls exactly the
// way a newline-delimited JSON-RPC 2.0 server would.

use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

use minder_mcp::{McpClient, McpError};

/// Drive the server side of a duplex pipe with canned behavior.
async fn scripted_server(io: DuplexStream, tool_reply: Value) {
    let (read, mut write) = tokio::io::split(io);
    let mut lines = BufReader::new(read).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let msg: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(_) => continue,
        };
        let id = msg.get("id").cloned();
        let method = msg.get("method").and_then(|m| m.as_str()).unwrap_or("");

        let result = match method {
            "initialize" => json!({
                "protocolVersion": "2025-06-18",
                "capabilities": { "tools": {} },
                "serverInfo": { "name": "scripted", "version": "0.0.1" }
            }),
            "notifications/initialized" => continue,
            "tools/list" => json!({
                "tools": [
                    { "name": "t1", "description": "first tool",
                      "inputSchema": { "type": "object", "properties": { "a": { "type": "integer" } } } },
                    { "name": "t2", "description": "second tool",
                      "inputSchema": { "type": "object" } }
                ]
            }),
            "tools/call" => tool_reply.clone(),
            _ => continue,
        };

        let Some(id) = id else { continue };
        let response = json!({ "jsonrpc": "2.0", "id": id, "result": result });
        let mut out = serde_json::to_string(&response).unwrap();
        out.push('\n');
        if write.write_all(out.as_bytes()).await.is_err() {
            break;
        }
    }
}

fn client_with_server(tool_reply: Value) -> std::sync::Arc<McpClient> {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    tokio::spawn(scripted_server(server_io, tool_reply));
    let (read, write) = tokio::io::split(client_io);
    McpClient::connect("test-skill", read, write, Duration::from_secs(5))
}

#[tokio::test]
async fn handshake_discovers_two_tools() {
    let client = client_with_server(json!({ "content": [] }));
    let tools = client.handshake(Duration::from_secs(5)).await.unwrap();
    assert_eq!(tools.len(), 2);
    assert_eq!(tools[0].name, "t1");
    assert_eq!(tools[1].name, "t2");
    // The catalog is cached on the client.
    assert_eq!(client.tools().len(), 2);
}

#[tokio::test]
async fn call_tool_returns_joined_text() {
    let client = client_with_server(json!({
        "content": [ { "type": "text", "text": "ok" } ],
        "isError": false
    }));
    client.handshake(Duration::from_secs(5)).await.unwrap();

    let output = client.call_tool("t1", json!({ "a": 1 })).await.unwrap();
    assert!(output.success);
    assert_eq!(output.text, "ok");
}

#[tokio::test]
async fn error_reply_with_empty_content_uses_default_message() {
    let client = client_with_server(json!({ "content": [], "isError": true }));
    client.handshake(Duration::from_secs(5)).await.unwrap();

    let output = client.call_tool("t1", json!({})).await.unwrap();
    assert!(!output.success);
    assert_eq!(output.text, "MCP tool error");
}

#[tokio::test]
async fn success_reply_with_empty_content_reads_no_output() {
    let client = client_with_server(json!({ "content": [] }));
    client.handshake(Duration::from_secs(5)).await.unwrap();

    let output = client.call_tool("t1", json!({})).await.unwrap();
    assert!(output.success);
    assert_eq!(output.text, "(no output)");
}

#[tokio::test]
async fn multiple_text_items_join_with_lf() {
    let client = client_with_server(json!({
        "content": [
            { "type": "text", "text": "line 1" },
            { "type": "text", "text": "line 2" }
        ]
    }));
    client.handshake(Duration::from_secs(5)).await.unwrap();

    let output = client.call_tool("t1", json!({})).await.unwrap();
    assert_eq!(output.text, "line 1\nline 2");
}

#[tokio::test]
async fn server_eof_fails_pending_and_subsequent_calls() {
    let (client_io, server_io) = tokio::io::duplex(1024);
    let (read, write) = tokio::io::split(client_io);
    let client = McpClient::connect("dead-skill", read, write, Duration::from_secs(5));

    // Close the server end immediately: the reader sees EOF.
    drop(server_io);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(!client.is_alive());
    let err = client.request("tools/list", None).await.unwrap_err();
    assert!(matches!(err, McpError::Closed));
}

#[tokio::test]
async fn non_json_lines_are_skipped() {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let (read, mut write) = tokio::io::split(server_io);
    let mut lines = BufReader::new(read).lines();

    // Server: emit garbage before every real response.
    tokio::spawn(async move {
        while let Ok(Some(line)) = lines.next_line().await {
            let msg: Value = match serde_json::from_str(&line) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if msg.get("method").and_then(|m| m.as_str()) == Some("ping") {
                let id = msg.get("id").cloned().unwrap();
                let _ = write.write_all(b"log: starting up\n").await;
                let _ = write.write_all(b"{\"not\":\"a response\"}\n").await;
                let response = json!({ "jsonrpc": "2.0", "id": id, "result": { "pong": true } });
                let mut out = serde_json::to_string(&response).unwrap();
                out.push('\n');
                let _ = write.write_all(out.as_bytes()).await;
            }
        }
    });

    let (read, write) = tokio::io::split(client_io);
    let client = McpClient::connect("noisy-skill", read, write, Duration::from_secs(5));
    let result = client.request("ping", None).await.unwrap();
    assert_eq!(result, json!({ "pong": true }));
}
