// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Cache-server tests over a real socket.

use std::time::Duration;

use mardb::server::{DbServer, LoadMode, ServerConfig};
use mardb::{MarDb, Value};
use serde_json::{json, Value as JsonValue};
use tempfile::{tempdir, TempDir};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

struct TestServer {
    _dir: TempDir,
    db_path: String,
    addr: std::net::SocketAddr,
    task: JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn spawn_server(sync_interval: Duration) -> TestServer {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("u.marm").display().to_string();
    let server = DbServer::bind(ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        sync_interval,
        load_mode: LoadMode::Fast,
    })
    .await
    .unwrap();
    let addr = server.local_addr().unwrap();
    let task = tokio::spawn(async move {
        let _ = server.run().await;
    });
    TestServer {
        _dir: dir,
        db_path,
        addr,
        task,
    }
}

struct Client {
    stream: TcpStream,
}

impl Client {
    async fn connect(server: &TestServer) -> Self {
        Self {
            stream: TcpStream::connect(server.addr).await.unwrap(),
        }
    }

    async fn call(&mut self, command: &str, args: JsonValue) -> JsonValue {
        let body = serde_json::to_vec(&json!({ "command": command, "args": args })).unwrap();
        self.stream
            .write_all(&(body.len() as u32).to_be_bytes())
            .await
            .unwrap();
        self.stream.write_all(&body).await.unwrap();

        let mut len = [0u8; 4];
        self.stream.read_exact(&mut len).await.unwrap();
        let mut frame = vec![0u8; u32::from_be_bytes(len) as usize];
        self.stream.read_exact(&mut frame).await.unwrap();
        serde_json::from_slice(&frame).unwrap()
    }

    async fn ok(&mut self, command: &str, args: JsonValue) -> JsonValue {
        let response = self.call(command, args).await;
        assert_eq!(response["status"], "success", "{command}: {response}");
        response.get("data").cloned().unwrap_or(JsonValue::Null)
    }
}

async fn seed(client: &mut Client, db_path: &str) {
    client.ok("create_database", json!({ "db_name": db_path })).await;
    client
        .ok(
            "create_table",
            json!({ "db_name": db_path, "table_name": "u", "axes": ["id"] }),
        )
        .await;
}

#[tokio::test]
async fn background_flush_reaches_disk() {
    let server = spawn_server(Duration::from_secs(1)).await;
    let mut client = Client::connect(&server).await;
    seed(&mut client, &server.db_path).await;

    let inserted = client
        .ok(
            "insert_into_table",
            json!({ "db_name": server.db_path, "table_name": "u", "cords": [7], "data": "hi" }),
        )
        .await;
    assert_eq!(inserted, json!(true));

    tokio::time::sleep(Duration::from_secs(2)).await;

    // bypass the server: the record must be on disk
    let engine = MarDb::open(&server.db_path).unwrap();
    let record = engine.find("u", &[7]).unwrap().unwrap();
    assert_eq!(record.value, Value::Str("hi".into()));
}

#[tokio::test]
async fn reads_come_from_cache_then_disk() {
    let server = spawn_server(Duration::from_secs(1)).await;
    let mut client = Client::connect(&server).await;
    seed(&mut client, &server.db_path).await;

    client
        .ok(
            "insert_into_table",
            json!({ "db_name": server.db_path, "table_name": "u", "cords": [1], "data": 42 }),
        )
        .await;

    // served from cache before any flush
    let found = client
        .ok(
            "find_in_table",
            json!({ "db_name": server.db_path, "table_name": "u", "cords": [1] }),
        )
        .await;
    assert_eq!(found["value"], json!(42));
    assert_eq!(found["type"], json!("int"));

    tokio::time::sleep(Duration::from_secs(2)).await;
    client
        .ok("unload_database", json!({ "db_name": server.db_path }))
        .await;

    // fresh lazy load: the value must come back from disk
    let found = client
        .ok(
            "find_in_table",
            json!({ "db_name": server.db_path, "table_name": "u", "cords": [1] }),
        )
        .await;
    assert_eq!(found["value"], json!(42));
}

#[tokio::test]
async fn unload_flushes_pending_writes() {
    let server = spawn_server(Duration::from_secs(3600)).await;
    let mut client = Client::connect(&server).await;
    seed(&mut client, &server.db_path).await;

    client
        .ok(
            "insert_into_table",
            json!({ "db_name": server.db_path, "table_name": "u", "cords": [3], "data": "kept" }),
        )
        .await;
    client
        .ok("unload_database", json!({ "db_name": server.db_path }))
        .await;

    let engine = MarDb::open(&server.db_path).unwrap();
    assert_eq!(
        engine.find("u", &[3]).unwrap().unwrap().value,
        Value::Str("kept".into())
    );
}

#[tokio::test]
async fn unknown_command_leaves_the_server_healthy() {
    let server = spawn_server(Duration::from_secs(3600)).await;
    let mut client = Client::connect(&server).await;
    seed(&mut client, &server.db_path).await;

    let response = client
        .call("explode", json!({ "db_name": server.db_path }))
        .await;
    assert_eq!(response["status"], "error");
    assert!(response["message"].as_str().unwrap().contains("unknown command"));

    // same connection still serves requests
    let tables = client
        .ok("get_tables", json!({ "db_name": server.db_path }))
        .await;
    assert_eq!(tables["1"]["name"], json!("u"));
    assert_eq!(tables["1"]["axes"], json!(["id"]));
}

#[tokio::test]
async fn errors_are_reported_in_the_envelope() {
    let server = spawn_server(Duration::from_secs(3600)).await;
    let mut client = Client::connect(&server).await;
    seed(&mut client, &server.db_path).await;

    // arity mismatch is rejected before it can reach the cache
    let response = client
        .call(
            "insert_into_table",
            json!({ "db_name": server.db_path, "table_name": "u", "cords": [1, 2], "data": "x" }),
        )
        .await;
    assert_eq!(response["status"], "error");
    assert!(response["message"].as_str().unwrap().contains("arity"));

    // missing argument
    let response = client.call("find_in_table", json!({ "db_name": server.db_path })).await;
    assert_eq!(response["status"], "error");

    // unloaded database
    let response = client
        .call("unload_database", json!({ "db_name": "ghost.marm" }))
        .await;
    assert_eq!(response["status"], "error");
}

#[tokio::test]
async fn select_returns_cached_rows_once_any_exist() {
    let server = spawn_server(Duration::from_secs(3600)).await;
    let mut client = Client::connect(&server).await;
    seed(&mut client, &server.db_path).await;

    // two rows on disk
    let engine = MarDb::open(&server.db_path).unwrap();
    engine.insert("u", &[1], &Value::Str("one".into())).unwrap();
    engine.insert("u", &[2], &Value::Str("two".into())).unwrap();

    // cache one row, then select: only the cached row is returned
    client
        .ok(
            "insert_into_table",
            json!({ "db_name": server.db_path, "table_name": "u", "cords": [9], "data": "nine" }),
        )
        .await;
    let rows = client
        .ok(
            "select_from_table",
            json!({ "db_name": server.db_path, "table_name": "u" }),
        )
        .await;
    assert_eq!(rows.as_array().unwrap().len(), 1);

    // cold cache sees the whole table
    client
        .ok("unload_database", json!({ "db_name": server.db_path }))
        .await;
    let rows = client
        .ok(
            "select_from_table",
            json!({ "db_name": server.db_path, "table_name": "u" }),
        )
        .await;
    assert_eq!(rows.as_array().unwrap().len(), 3);
}
