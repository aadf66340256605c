// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

//! HTTP edge: request routing and SSE framing over tiny_http.
//!
//! Handlers are thin; they validate input, call into the managers and map
//! the error taxonomy onto status codes. SSE connections take over the raw
//! stream and run on their own thread.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde_json::{json, Map, Value as JsonValue};
use tiny_http::{Header, Method, Response, Server, StatusCode};
use tracing::{error, info, warn};
use url::Url;

use crate::context::CancelToken;
use crate::control::ControlManager;
use crate::error::{Error, Result};
use crate::history::HistoryStore;
use crate::hub::{EventHub, EventKind, SseEvent};
use crate::logserver::level;
use crate::logsessions;
use crate::manager::ServerManager;
use crate::recording::{self, ExportFilter};
use crate::sensorcfg::SensorCatalog;

const SSE_RECV_TIMEOUT: Duration = Duration::from_secs(5);
const SSE_HEARTBEAT: Duration = Duration::from_secs(20);

type HttpResponse = (u16, Response<std::io::Cursor<Vec<u8>>>);

/// Everything the edge needs, shared across request threads.
pub struct AppState {
    pub poll_interval: Duration,
    pub manager: Arc<ServerManager>,
    pub storage: Arc<dyn HistoryStore>,
    pub hub: Arc<EventHub>,
    pub control: Arc<ControlManager>,
    pub log_sessions: Arc<logsessions::Manager>,
    pub recording: Arc<recording::Manager>,
    pub catalog: Option<Arc<SensorCatalog>>,
}

pub fn start_http(
    bind_addr: String,
    state: Arc<AppState>,
    token: CancelToken,
) -> Result<JoinHandle<()>> {
    let server = Server::http(&bind_addr)
        .map_err(|e| Error::Internal(format!("http bind error: {e}")))?;
    info!(addr = %bind_addr, "http server listening");

    let handle = thread::spawn(move || {
        loop {
            if token.done() {
                return;
            }
            match server.recv_timeout(Duration::from_millis(100)) {
                Ok(Some(request)) => {
                    let state = Arc::clone(&state);
                    let token = token.clone();
                    thread::spawn(move || {
                        if let Err(err) = handle_request(request, &state, &token) {
                            error!(error = %err, "http error");
                        }
                    });
                }
                Ok(None) => {}
                Err(err) => {
                    error!(error = %err, "http accept error");
                }
            }
        }
    });
    Ok(handle)
}

fn handle_request(
    mut request: tiny_http::Request,
    state: &Arc<AppState>,
    root: &CancelToken,
) -> Result<()> {
    let url_str = format!("http://localhost{}", request.url());
    let url = match Url::parse(&url_str) {
        Ok(url) => url,
        Err(_) => {
            return respond_error(request, &Error::InvalidInput("invalid url".into()));
        }
    };
    let segments: Vec<String> = url
        .path_segments()
        .map(|c| c.filter(|s| !s.is_empty()).map(|s| s.to_string()).collect())
        .unwrap_or_default();
    let segments_ref: Vec<&str> = segments.iter().map(|s| s.as_str()).collect();
    let params = parse_query(url.query().unwrap_or(""));

    // SSE endpoints take over the raw stream and never return a Response.
    if request.method() == &Method::Get {
        match segments_ref.as_slice() {
            ["api", "events"] => {
                return handle_sse_events(request, state, &params, root);
            }
            ["api", "servers", server_id, "objects", object_name, "logs"] => {
                let server_id = server_id.to_string();
                let object_name = object_name.to_string();
                return handle_log_stream(request, state, &server_id, &object_name, &params, root);
            }
            _ => {}
        }
    }

    let method = request.method().clone();
    let result: Result<HttpResponse> = (|| {
        match (method, segments_ref.as_slice()) {
            (Method::Get, ["healthz"]) => Ok((200, text_response(200, "ok"))),

            (Method::Get, ["api", "servers"]) => {
                json_ok(&json!({ "servers": state.manager.statuses() }))
            }

            (Method::Get, ["api", "sensors"]) => {
                let catalog = state
                    .catalog
                    .as_ref()
                    .ok_or_else(|| Error::Unavailable("no sensor catalog configured".into()))?;
                json_ok(&json!({
                    "sensors": catalog.all_info(),
                    "count": catalog.count(),
                }))
            }

            (Method::Get, ["api", "control", "status"]) => {
                let token = params.get("token").cloned().unwrap_or_default();
                json_ok(&serde_json::to_value(state.control.status(&token))?)
            }
            (Method::Post, ["api", "control", "take"]) => {
                let body = parse_json_body(&mut request)?;
                let token = get_required_string(&body, "token")?;
                state.control.take(&token).map_err(Error::from)?;
                json_ok(&serde_json::to_value(state.control.status(&token))?)
            }
            (Method::Post, ["api", "control", "release"]) => {
                let body = parse_json_body(&mut request)?;
                let token = get_required_string(&body, "token")?;
                state.control.release(&token).map_err(Error::from)?;
                json_ok(&serde_json::to_value(state.control.status(&token))?)
            }
            (Method::Post, ["api", "control", "touch"]) => {
                let body = parse_json_body(&mut request)?;
                let token = get_required_string(&body, "token")?;
                state.control.touch(&token);
                json_ok(&json!({"status": "ok"}))
            }

            (Method::Get, ["api", "servers", server_id, "objects"]) => {
                let instance = state.manager.get(server_id)?;
                let objects = instance.object_list()?;
                json_ok(&json!({ "objects": objects }))
            }

            (Method::Get, ["api", "servers", server_id, "objects", object_name]) => {
                let instance = state.manager.get(server_id)?;
                match instance.object_data(object_name) {
                    Ok(data) => json_ok(&serde_json::to_value(&data)?),
                    Err(err) => {
                        // best-effort freshness: serve the last good snapshot
                        match instance.object_poller.last_data(object_name) {
                            Some(data) => json_ok(&serde_json::to_value(data.as_ref())?),
                            None => Err(err),
                        }
                    }
                }
            }

            (Method::Post, ["api", "servers", server_id, "objects", object_name, "watch"]) => {
                let instance = state.manager.get(server_id)?;
                instance.object_poller.watch(object_name);
                json_ok(&json!({"status": "watching", "object": object_name}))
            }
            (Method::Delete, ["api", "servers", server_id, "objects", object_name, "watch"]) => {
                let instance = state.manager.get(server_id)?;
                instance.object_poller.unwatch(object_name);
                json_ok(&json!({"status": "unwatched", "object": object_name}))
            }

            (Method::Get, ["api", "servers", server_id, "objects", object_name, "history", variable]) => {
                state.manager.get(server_id)?;
                let count = params
                    .get("count")
                    .and_then(|v| v.parse::<usize>().ok())
                    .filter(|&c| c > 0)
                    .unwrap_or(100);
                let history = state.storage.latest(server_id, object_name, variable, count)?;
                json_ok(&serde_json::to_value(&history)?)
            }
            (Method::Get, ["api", "servers", server_id, "objects", object_name, "history", variable, "range"]) => {
                state.manager.get(server_id)?;
                let to = params
                    .get("to")
                    .and_then(|v| chrono::DateTime::parse_from_rfc3339(v).ok())
                    .map(|t| t.with_timezone(&chrono::Utc))
                    .unwrap_or_else(chrono::Utc::now);
                let from = params
                    .get("from")
                    .and_then(|v| chrono::DateTime::parse_from_rfc3339(v).ok())
                    .map(|t| t.with_timezone(&chrono::Utc))
                    .unwrap_or_else(|| to - chrono::TimeDelta::hours(1));
                let history = state.storage.history(server_id, object_name, variable, from, to)?;
                json_ok(&serde_json::to_value(&history)?)
            }

            (Method::Get, ["api", "servers", server_id, "sm", "values"]) => {
                let instance = state.manager.get(server_id)?;
                let sensors: Vec<String> = params
                    .get("sensors")
                    .map(|v| v.split(',').map(|s| s.to_string()).collect())
                    .unwrap_or_default();
                if sensors.is_empty() {
                    return Err(Error::InvalidInput("sensors query parameter required".into()));
                }
                let values = instance.client.sm_values(&sensors)?;
                json_ok(&serde_json::to_value(&values)?)
            }

            (Method::Get, ["api", "servers", server_id, "objects", object_name, "sensors"]) => {
                let instance = state.manager.get(server_id)?;
                let sensors = instance.ws_poller.sensors_for_object(object_name);
                json_ok(&json!({ "sensors": sensors }))
            }
            (Method::Post, ["api", "servers", server_id, "objects", object_name, "sensors", "subscribe"]) => {
                let instance = state.manager.get(server_id)?;
                let body = parse_json_body(&mut request)?;
                let sensors = get_string_list(&body, "sensors")?;
                instance.ws_poller.subscribe(object_name, &sensors)?;
                // sensors known to the catalog are also polled over HTTP so
                // values keep flowing when the gateway is down
                if let Some(catalog) = &state.catalog {
                    let ids: Vec<i64> = sensors
                        .iter()
                        .filter_map(|name| catalog.by_name(name).map(|s| s.id))
                        .collect();
                    if !ids.is_empty() {
                        instance.sensor_poller.subscribe(object_name, &ids);
                    }
                }
                json_ok(&json!({
                    "status": "subscribed",
                    "object": object_name,
                    "sensors": instance.ws_poller.subscriptions(object_name),
                }))
            }
            (Method::Post, ["api", "servers", server_id, "objects", object_name, "sensors", "unsubscribe"]) => {
                let instance = state.manager.get(server_id)?;
                let body = parse_json_body(&mut request)?;
                let sensors = get_string_list(&body, "sensors")?;
                instance.ws_poller.unsubscribe(object_name, &sensors)?;
                if let Some(catalog) = &state.catalog {
                    let ids: Vec<i64> = sensors
                        .iter()
                        .filter_map(|name| catalog.by_name(name).map(|s| s.id))
                        .collect();
                    if !ids.is_empty() {
                        instance.sensor_poller.unsubscribe(object_name, &ids);
                    }
                }
                json_ok(&json!({
                    "status": "unsubscribed",
                    "object": object_name,
                    "sensors": instance.ws_poller.subscriptions(object_name),
                }))
            }

            (Method::Post, ["api", "servers", server_id, "objects", object_name, "logs", "command"]) => {
                let body = parse_json_body(&mut request)?;
                let token = get_optional_string(&body, "token");
                require_controller(state, &token)?;

                let command = get_required_string(&body, "command")?;
                let logname = get_optional_string(&body, "logname");
                match command.as_str() {
                    "setFilter" => {
                        state.log_sessions.set_filter(server_id, object_name, &logname)?
                    }
                    "setLevel" => {
                        let mask = body
                            .get("level")
                            .and_then(JsonValue::as_u64)
                            .map(|v| v as u32)
                            .unwrap_or(level::ANY);
                        state.log_sessions.set_level(server_id, object_name, mask, &logname)?
                    }
                    "rotate" => state.log_sessions.rotate(server_id, object_name, &logname)?,
                    other => {
                        return Err(Error::InvalidInput(format!("unknown log command {other:?}")))
                    }
                }
                json_ok(&json!({"status": "sent", "command": command}))
            }

            (Method::Get, ["api", "servers", server_id, "objects", object_name, "control", op]) => {
                let instance = state.manager.get(server_id)?;
                let value = match *op {
                    "status" => {
                        let resp = instance.client.object_status(object_name)?;
                        json!({"result": resp.result, "status": resp.status})
                    }
                    "getparam" => {
                        let names: Vec<String> = params
                            .get("name")
                            .map(|v| v.split(',').map(|s| s.to_string()).collect())
                            .unwrap_or_default();
                        let resp = instance.client.get_params(object_name, &names)?;
                        json!({"result": resp.result, "params": resp.params})
                    }
                    "sensors" => {
                        let resp = instance.client.remote_sensors(object_name)?;
                        json!({"result": resp.result, "sensors": resp.sensors, "total": resp.total})
                    }
                    "sensor" => {
                        let id = params
                            .get("id")
                            .and_then(|v| v.parse::<i64>().ok())
                            .ok_or_else(|| Error::InvalidInput("sensor id required".into()))?;
                        let resp = instance.client.remote_sensor(object_name, id)?;
                        json!({"result": resp.result, "sensor": resp.sensor})
                    }
                    "diagnostics" => {
                        let resp = instance.client.diagnostics(object_name)?;
                        json!({
                            "result": resp.result,
                            "summary": resp.summary,
                            "lastErrors": resp.last_errors,
                        })
                    }
                    other => return Err(Error::NotFound(format!("unknown control op {other:?}"))),
                };
                json_ok(&value)
            }
            (Method::Post, ["api", "servers", server_id, "objects", object_name, "control", op]) => {
                let instance = state.manager.get(server_id)?;
                let body = parse_json_body(&mut request)?;
                let token = get_optional_string(&body, "token");
                require_controller(state, &token)?;

                let value = match *op {
                    "setparam" => {
                        let params_map = body
                            .get("params")
                            .and_then(JsonValue::as_object)
                            .ok_or_else(|| Error::InvalidInput("params object required".into()))?;
                        let params_map: HashMap<String, String> = params_map
                            .iter()
                            .map(|(k, v)| {
                                let value = match v {
                                    JsonValue::String(s) => s.clone(),
                                    other => other.to_string(),
                                };
                                (k.clone(), value)
                            })
                            .collect();
                        let resp = instance.client.set_params(object_name, &params_map)?;
                        json!({"result": resp.result, "updated": resp.updated})
                    }
                    "takeControl" => {
                        let resp = instance.client.take_control(object_name)?;
                        json!({
                            "result": resp.result,
                            "message": resp.message,
                            "previousMode": resp.previous_mode,
                            "currentMode": resp.current_mode,
                        })
                    }
                    "releaseControl" => {
                        let resp = instance.client.release_control(object_name)?;
                        json!({
                            "result": resp.result,
                            "message": resp.message,
                            "previousMode": resp.previous_mode,
                            "currentMode": resp.current_mode,
                        })
                    }
                    other => return Err(Error::NotFound(format!("unknown control op {other:?}"))),
                };
                json_ok(&value)
            }

            (Method::Get, ["api", "recording", "status"]) => {
                let stats = state.recording.stats()?;
                json_ok(&serde_json::to_value(&stats)?)
            }
            (Method::Post, ["api", "recording", "start"]) => {
                let body = parse_json_body(&mut request)?;
                require_controller(state, &get_optional_string(&body, "token"))?;
                state.recording.start()?;
                for status in state.manager.statuses() {
                    let _ = state.recording.save_server(recording::ServerInfo {
                        server_id: status.id,
                        name: status.name,
                        url: status.url,
                        updated_at: chrono::Utc::now().to_rfc3339(),
                    });
                }
                json_ok(&json!({"status": "recording"}))
            }
            (Method::Post, ["api", "recording", "stop"]) => {
                let body = parse_json_body(&mut request)?;
                require_controller(state, &get_optional_string(&body, "token"))?;
                state.recording.stop()?;
                json_ok(&json!({"status": "stopped"}))
            }
            (Method::Post, ["api", "recording", "clear"]) => {
                let body = parse_json_body(&mut request)?;
                require_controller(state, &get_optional_string(&body, "token"))?;
                state.recording.clear()?;
                json_ok(&json!({"status": "cleared"}))
            }
            (Method::Get, ["api", "recording", "servers"]) => {
                json_ok(&json!({ "servers": state.recording.servers()? }))
            }
            (Method::Get, ["api", "recording", "export"]) => {
                let filter = ExportFilter {
                    from: params
                        .get("from")
                        .and_then(|v| chrono::DateTime::parse_from_rfc3339(v).ok())
                        .map(|t| t.with_timezone(&chrono::Utc)),
                    to: params
                        .get("to")
                        .and_then(|v| chrono::DateTime::parse_from_rfc3339(v).ok())
                        .map(|t| t.with_timezone(&chrono::Utc)),
                    server_id: params.get("server").cloned().unwrap_or_default(),
                    object_name: params.get("object").cloned().unwrap_or_default(),
                };
                let format = params.get("format").map(String::as_str).unwrap_or("json");
                let mut out = Vec::new();
                let content_type = match format {
                    "csv" => {
                        state.recording.export_csv(&filter, &mut out)?;
                        "text/csv"
                    }
                    "raw" => {
                        state.recording.export_raw(&mut out)?;
                        "application/octet-stream"
                    }
                    "json" => {
                        state.recording.export_json(&filter, &mut out)?;
                        "application/json"
                    }
                    other => {
                        return Err(Error::InvalidInput(format!("unknown export format {other:?}")))
                    }
                };
                Ok((
                    200,
                    Response::from_data(out)
                        .with_status_code(StatusCode(200))
                        .with_header(header("Content-Type", content_type)),
                ))
            }

            _ => Err(Error::NotFound("route".into())),
        }
    })();

    match result {
        Ok((_status, response)) => request.respond(response).map_err(Error::Io),
        Err(err) => respond_error(request, &err),
    }
}

fn require_controller(state: &AppState, token: &str) -> Result<()> {
    if state.control.is_controller(token) {
        Ok(())
    } else {
        Err(Error::Conflict("not the controller".into()))
    }
}

/// Main SSE stream: object data, sensor updates, log lines and control
/// status, filtered by the optional `object` query parameter.
fn handle_sse_events(
    request: tiny_http::Request,
    state: &Arc<AppState>,
    params: &HashMap<String, String>,
    root: &CancelToken,
) -> Result<()> {
    let object_filter = params.get("object").cloned().unwrap_or_default();
    let token = params.get("token").cloned().unwrap_or_default();

    let mut writer = request.into_writer();
    if write_sse_headers(&mut writer).is_err() {
        return Ok(()); // client went away during the handshake
    }

    let subscriber = state.hub.add_subscriber(&object_filter, &token);
    state.control.cancel_pending_release(&token);

    let state = Arc::clone(state);
    let root = root.clone();
    thread::spawn(move || {
        let connected = json!({
            "type": "connected",
            "pollInterval": state.poll_interval.as_secs(),
        });
        if write_sse_event(&mut writer, "connected", &connected.to_string()).is_err() {
            finish_sse(&state, subscriber.id, &subscriber.token);
            return;
        }

        let mut last_write = Instant::now();
        loop {
            if root.done() {
                break;
            }
            match subscriber.rx.recv_timeout(SSE_RECV_TIMEOUT) {
                Ok(event) => {
                    let (name, payload) = event.to_sse();
                    if write_sse_event(&mut writer, name, &payload).is_err() {
                        break;
                    }
                    last_write = Instant::now();
                }
                Err(_) => {
                    if last_write.elapsed() >= SSE_HEARTBEAT {
                        if write_sse_heartbeat(&mut writer).is_err() {
                            break;
                        }
                        last_write = Instant::now();
                    }
                }
            }
        }
        finish_sse(&state, subscriber.id, &subscriber.token);
    });

    Ok(())
}

fn finish_sse(state: &AppState, subscriber_id: u64, token: &str) {
    state.hub.remove_subscriber(subscriber_id);
    state.control.release_on_disconnect(token);
}

/// Log viewer stream: ring-buffer catch-up, then live `log_line` events for
/// one target. Failures surface as an SSE `error` event before close.
fn handle_log_stream(
    request: tiny_http::Request,
    state: &Arc<AppState>,
    server_id: &str,
    object_name: &str,
    params: &HashMap<String, String>,
    root: &CancelToken,
) -> Result<()> {
    let mut writer = request.into_writer();
    if write_sse_headers(&mut writer).is_err() {
        return Ok(());
    }

    // resolve the target's log server from the object snapshot
    let log_server = (|| -> Result<crate::upstream::LogServerInfo> {
        let instance = state.manager.get(server_id)?;
        let data = match instance.object_data(object_name) {
            Ok(data) => Arc::new(data),
            Err(err) => instance.object_poller.last_data(object_name).ok_or(err)?,
        };
        data.log_server
            .clone()
            .ok_or_else(|| Error::NotFound(format!("object {object_name} has no log server")))
    })();

    let log_server = match log_server {
        Ok(info) => info,
        Err(err) => {
            let payload = json!({"message": err.to_string()}).to_string();
            let _ = write_sse_event(&mut writer, "error", &payload);
            return Ok(());
        }
    };

    let catchup = match state
        .log_sessions
        .attach(server_id, object_name, &log_server.host, log_server.port)
    {
        Ok(lines) => lines,
        Err(err) => {
            let payload = json!({"message": err.to_string()}).to_string();
            let _ = write_sse_event(&mut writer, "error", &payload);
            return Ok(());
        }
    };

    // optional initial filter/level for the shared session
    if let Some(pattern) = params.get("filter") {
        if let Err(err) = state.log_sessions.set_filter(server_id, object_name, pattern) {
            warn!(error = %err, "initial log filter failed");
        }
    }
    if let Some(mask) = params.get("level").and_then(|v| v.parse::<u32>().ok()) {
        if let Err(err) = state.log_sessions.set_level(server_id, object_name, mask, "") {
            warn!(error = %err, "initial log level failed");
        }
    }

    let subscriber = state.hub.add_subscriber(object_name, "");
    let state = Arc::clone(state);
    let server_id = server_id.to_string();
    let object_name = object_name.to_string();
    let root = root.clone();

    thread::spawn(move || {
        for line in catchup {
            let event = SseEvent {
                kind: EventKind::LogLine,
                object_name: object_name.clone(),
                data: json!({
                    "target": {"serverID": server_id, "objectName": object_name},
                    "line": line,
                }),
                timestamp: chrono::Utc::now(),
            };
            let (name, payload) = event.to_sse();
            if write_sse_event(&mut writer, name, &payload).is_err() {
                state.hub.remove_subscriber(subscriber.id);
                state.log_sessions.detach(&server_id, &object_name);
                return;
            }
        }

        let mut last_write = Instant::now();
        loop {
            if root.done() {
                break;
            }
            match subscriber.rx.recv_timeout(SSE_RECV_TIMEOUT) {
                Ok(event) => {
                    if event.kind != EventKind::LogLine {
                        continue;
                    }
                    let (name, payload) = event.to_sse();
                    if write_sse_event(&mut writer, name, &payload).is_err() {
                        break;
                    }
                    last_write = Instant::now();
                }
                Err(_) => {
                    if last_write.elapsed() >= SSE_HEARTBEAT {
                        if write_sse_heartbeat(&mut writer).is_err() {
                            break;
                        }
                        last_write = Instant::now();
                    }
                }
            }
        }
        state.hub.remove_subscriber(subscriber.id);
        state.log_sessions.detach(&server_id, &object_name);
    });

    Ok(())
}

fn write_sse_headers<W: Write>(writer: &mut W) -> std::io::Result<()> {
    let status_line = "HTTP/1.1 200 OK\r\n";
    let headers = "Content-Type: text/event-stream\r\n\
                   Cache-Control: no-cache\r\n\
                   Connection: keep-alive\r\n\
                   Access-Control-Allow-Origin: *\r\n\
                   Transfer-Encoding: chunked\r\n\r\n";
    writer.write_all(status_line.as_bytes())?;
    writer.write_all(headers.as_bytes())?;
    writer.flush()
}

/// One SSE frame in chunked transfer encoding.
fn write_sse_event<W: Write>(writer: &mut W, event_type: &str, data: &str) -> std::io::Result<()> {
    let message = format!("event: {}\ndata: {}\n\n", event_type, data);
    let chunk = format!("{:x}\r\n{}\r\n", message.len(), message);
    writer.write_all(chunk.as_bytes())?;
    writer.flush()
}

fn write_sse_heartbeat<W: Write>(writer: &mut W) -> std::io::Result<()> {
    let message = ":heartbeat\n\n";
    let chunk = format!("{:x}\r\n{}\r\n", message.len(), message);
    writer.write_all(chunk.as_bytes())?;
    writer.flush()
}

fn header(name: &str, value: &str) -> Header {
    Header::from_bytes(name.as_bytes(), value.as_bytes()).unwrap()
}

fn text_response(status: u16, body: &str) -> Response<std::io::Cursor<Vec<u8>>> {
    Response::from_data(body.as_bytes().to_vec())
        .with_status_code(StatusCode(status))
        .with_header(header("Content-Type", "text/plain"))
}

fn json_ok(value: &JsonValue) -> Result<HttpResponse> {
    let bytes = serde_json::to_vec(value)?;
    Ok((
        200,
        Response::from_data(bytes)
            .with_status_code(StatusCode(200))
            .with_header(header("Content-Type", "application/json")),
    ))
}

fn respond_error(request: tiny_http::Request, err: &Error) -> Result<()> {
    let status = err.http_status();
    let bytes = serde_json::to_vec(&json!({"error": err.to_string()}))
        .unwrap_or_else(|_| b"{\"error\":\"internal\"}".to_vec());
    let response = Response::from_data(bytes)
        .with_status_code(StatusCode(status))
        .with_header(header("Content-Type", "application/json"));
    request.respond(response).map_err(Error::Io)
}

fn parse_query(query: &str) -> HashMap<String, String> {
    url::form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

fn parse_json_body(request: &mut tiny_http::Request) -> Result<JsonValue> {
    let mut body = Vec::new();
    request.as_reader().read_to_end(&mut body)?;
    if body.is_empty() || body.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(JsonValue::Object(Map::new()));
    }
    serde_json::from_slice(&body).map_err(|e| Error::InvalidInput(format!("invalid json: {e}")))
}

fn get_required_string(body: &JsonValue, key: &str) -> Result<String> {
    body.get(key)
        .and_then(JsonValue::as_str)
        .map(|s| s.to_string())
        .ok_or_else(|| Error::InvalidInput(format!("missing required field: {key}")))
}

fn get_optional_string(body: &JsonValue, key: &str) -> String {
    body.get(key)
        .and_then(JsonValue::as_str)
        .unwrap_or_default()
        .to_string()
}

fn get_string_list(body: &JsonValue, key: &str) -> Result<Vec<String>> {
    let list = body
        .get(key)
        .and_then(JsonValue::as_array)
        .ok_or_else(|| Error::InvalidInput(format!("missing required field: {key}")))?;
    list.iter()
        .map(|v| {
            v.as_str()
                .map(|s| s.to_string())
                .ok_or_else(|| Error::InvalidInput(format!("{key} must be a list of strings")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_event_framing_is_chunked() {
        let mut out = Vec::new();
        write_sse_event(&mut out, "object_data", "{\"a\":1}").unwrap();
        let text = String::from_utf8(out).unwrap();
        let message = "event: object_data\ndata: {\"a\":1}\n\n";
        assert_eq!(text, format!("{:x}\r\n{}\r\n", message.len(), message));
    }

    #[test]
    fn heartbeat_is_a_comment() {
        let mut out = Vec::new();
        write_sse_heartbeat(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains(":heartbeat"));
    }

    #[test]
    fn query_parsing() {
        let params = parse_query("object=TestProc&token=T1&count=5");
        assert_eq!(params["object"], "TestProc");
        assert_eq!(params["token"], "T1");
        assert_eq!(params["count"], "5");
    }

    #[test]
    fn body_helpers() {
        let body = json!({"token": "T1", "sensors": ["a", "b"]});
        assert_eq!(get_required_string(&body, "token").unwrap(), "T1");
        assert!(get_required_string(&body, "missing").is_err());
        assert_eq!(get_optional_string(&body, "missing"), "");
        assert_eq!(
            get_string_list(&body, "sensors").unwrap(),
            vec!["a".to_string(), "b".to_string()]
        );
        let bad = json!({"sensors": [1, 2]});
        assert!(get_string_list(&bad, "sensors").is_err());
    }
}
