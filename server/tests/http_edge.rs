// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

//! Edge smoke tests: routing, error mapping and the SSE handshake against
//! a fully wired AppState.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::Value as JsonValue;

use upanel_server::config::ServerEntry;
use upanel_server::context::CancelToken;
use upanel_server::control::ControlManager;
use upanel_server::history::{HistoryStore, MemoryStore};
use upanel_server::http::{start_http, AppState};
use upanel_server::hub::EventHub;
use upanel_server::logsessions;
use upanel_server::manager::{Instance, ServerManager};
use upanel_server::recording::{LogBackend, Manager as RecordingManager};

struct TestServer {
    base: String,
    root: CancelToken,
    hub: Arc<EventHub>,
    _recording_dir: tempfile::TempDir,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn start_test_server(tokens: &[&str]) -> TestServer {
    let storage: Arc<dyn HistoryStore> = Arc::new(MemoryStore::new());
    let hub = Arc::new(EventHub::new());

    let control = {
        let hub = Arc::clone(&hub);
        let tokens: Vec<String> = tokens.iter().map(|t| t.to_string()).collect();
        ControlManager::new(
            &tokens,
            Duration::from_secs(60),
            Box::new(move |status: &upanel_server::control::ControlStatus| {
                hub.broadcast_control_status(status)
            }),
        )
    };

    let recording_dir = tempfile::tempdir().expect("tempdir");
    let recording = Arc::new(RecordingManager::new(
        Box::new(LogBackend::new(recording_dir.path())),
        1000,
    ));

    // one instance pointing at an unserved upstream; transport errors are
    // expected and must surface as 502, never crash
    let instance = Instance::new(
        ServerEntry {
            id: String::new(),
            name: "Primary".into(),
            url: format!("http://127.0.0.1:{}", free_port()),
        },
        Arc::clone(&storage),
        Duration::from_secs(5),
        Duration::from_secs(3600),
        Arc::new(|_, _, _, _| {}),
        Arc::new(|_, _, _| {}),
        Arc::new(|_, _, _| {}),
    );
    let manager = Arc::new(ServerManager::new(vec![instance]));
    let log_sessions = logsessions::Manager::new(Arc::clone(&hub));

    let root = CancelToken::new();
    log_sessions.start(&root);

    let state = Arc::new(AppState {
        poll_interval: Duration::from_secs(5),
        manager,
        storage,
        hub: Arc::clone(&hub),
        control,
        log_sessions,
        recording,
        catalog: None,
    });

    let port = free_port();
    start_http(format!("127.0.0.1:{port}"), state, root.clone()).expect("start http");
    // give the accept loop a moment
    thread::sleep(Duration::from_millis(100));

    TestServer {
        base: format!("http://127.0.0.1:{port}"),
        root,
        hub,
        _recording_dir: recording_dir,
    }
}

fn get_json(url: &str) -> (u16, JsonValue) {
    match ureq::get(url).call() {
        Ok(resp) => {
            let status = resp.status();
            let body: JsonValue = resp.into_json().unwrap_or(JsonValue::Null);
            (status, body)
        }
        Err(ureq::Error::Status(status, resp)) => {
            let body: JsonValue = resp.into_json().unwrap_or(JsonValue::Null);
            (status, body)
        }
        Err(err) => panic!("request {url} failed: {err}"),
    }
}

fn post_json(url: &str, body: JsonValue) -> (u16, JsonValue) {
    match ureq::post(url).send_json(body) {
        Ok(resp) => {
            let status = resp.status();
            let body: JsonValue = resp.into_json().unwrap_or(JsonValue::Null);
            (status, body)
        }
        Err(ureq::Error::Status(status, resp)) => {
            let body: JsonValue = resp.into_json().unwrap_or(JsonValue::Null);
            (status, body)
        }
        Err(err) => panic!("request {url} failed: {err}"),
    }
}

#[test]
fn routing_and_error_mapping() {
    let server = start_test_server(&["T1"]);

    let (status, _) = get_json(&format!("{}/healthz", server.base));
    assert_eq!(status, 200);

    let (status, body) = get_json(&format!("{}/api/servers", server.base));
    assert_eq!(status, 200);
    assert_eq!(body["servers"][0]["name"], "Primary");
    assert_eq!(body["servers"][0]["id"], "default");

    // unknown server id
    let (status, body) = get_json(&format!("{}/api/servers/ghost/objects", server.base));
    assert_eq!(status, 404);
    assert!(body["error"].as_str().unwrap().contains("ghost"));

    // upstream down: object list maps to 502
    let (status, _) = get_json(&format!("{}/api/servers/default/objects", server.base));
    assert_eq!(status, 502);

    // no catalog configured
    let (status, _) = get_json(&format!("{}/api/sensors", server.base));
    assert_eq!(status, 503);

    // unknown route
    let (status, _) = get_json(&format!("{}/api/nope", server.base));
    assert_eq!(status, 404);
}

#[test]
fn control_endpoints() {
    let server = start_test_server(&["T1", "T2"]);

    let (status, body) = get_json(&format!("{}/api/control/status?token=T1", server.base));
    assert_eq!(status, 200);
    assert_eq!(body["enabled"], JsonValue::Bool(true));
    assert_eq!(body["hasController"], JsonValue::Bool(false));

    let (status, body) = post_json(
        &format!("{}/api/control/take", server.base),
        serde_json::json!({"token": "T1"}),
    );
    assert_eq!(status, 200);
    assert_eq!(body["isController"], JsonValue::Bool(true));

    // the other token is refused with a conflict
    let (status, _) = post_json(
        &format!("{}/api/control/take", server.base),
        serde_json::json!({"token": "T2"}),
    );
    assert_eq!(status, 409);

    // a bogus token is a validation error
    let (status, _) = post_json(
        &format!("{}/api/control/take", server.base),
        serde_json::json!({"token": "bogus"}),
    );
    assert_eq!(status, 400);

    // controller-gated endpoint refuses non-controllers
    let (status, _) = post_json(
        &format!("{}/api/recording/start", server.base),
        serde_json::json!({"token": "T2"}),
    );
    assert_eq!(status, 409);

    // and accepts the controller
    let (status, _) = post_json(
        &format!("{}/api/recording/start", server.base),
        serde_json::json!({"token": "T1"}),
    );
    assert_eq!(status, 200);
    let (status, body) = get_json(&format!("{}/api/recording/status", server.base));
    assert_eq!(status, 200);
    assert_eq!(body["isRecording"], JsonValue::Bool(true));

    let (status, _) = post_json(
        &format!("{}/api/control/release", server.base),
        serde_json::json!({"token": "T1"}),
    );
    assert_eq!(status, 200);
}

#[test]
fn history_endpoint_reads_the_store() {
    let server = start_test_server(&[]);

    // no data yet: empty history, not an error
    let (status, body) = get_json(&format!(
        "{}/api/servers/default/objects/X/history/var1?count=10",
        server.base
    ));
    assert_eq!(status, 200);
    assert_eq!(body["points"].as_array().unwrap().len(), 0);
    assert_eq!(body["server_id"], "default");
}

#[test]
fn sse_stream_handshake_and_control_status() {
    let server = start_test_server(&["T1"]);

    let addr = server.base.trim_start_matches("http://").to_string();
    let mut stream = TcpStream::connect(&addr).expect("connect sse");
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    write!(
        stream,
        "GET /api/events?object=X&token=T1 HTTP/1.1\r\nHost: {addr}\r\nAccept: text/event-stream\r\n\r\n"
    )
    .unwrap();

    // wait for the handshake frame
    let mut collected = String::new();
    let mut buf = [0u8; 4096];
    while !collected.contains("event: connected") {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => collected.push_str(&String::from_utf8_lossy(&buf[..n])),
            Err(_) => break,
        }
    }
    assert!(collected.contains("HTTP/1.1 200 OK"));
    assert!(collected.contains("Content-Type: text/event-stream"));
    assert!(collected.contains("event: connected"));
    assert!(collected.contains("\"pollInterval\":5"));

    // a control broadcast reaches the filtered subscriber
    server.hub.broadcast_control_status(&upanel_server::control::ControlStatus {
        enabled: true,
        has_controller: true,
        is_controller: false,
        timeout_sec: 60,
    });

    let mut got_status = false;
    for _ in 0..10 {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                collected.push_str(&String::from_utf8_lossy(&buf[..n]));
                if collected.contains("event: control_status") {
                    got_status = true;
                    break;
                }
            }
            Err(_) => break,
        }
    }
    assert!(got_status, "control_status not delivered over SSE: {collected}");
}
