// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

//! WebSocket client for the UWebSocketGate push feed and the subscription
//! manager built on top of it.
//!
//! The gate speaks a line-oriented textual command grammar (`ask:`, `del:`,
//! `get:`, `set:`) and answers with JSON frames. The client keeps the union
//! of requested subscriptions locally and replays it with a single `ask:`
//! after every reconnect.

mod client;
mod poller;

pub use client::Client;
pub use poller::{RecordFn, SensorUpdate, WsPoller};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// One sensor row from a gateway JSON frame.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SensorData {
    /// "SensorInfo", "ShortSensorInfo" or "Ping".
    #[serde(default, rename = "type")]
    pub kind: String,
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub value: i64,
    /// May arrive as int, float or string; `""` means no error.
    #[serde(default)]
    pub error: JsonValue,
    #[serde(default)]
    pub tv_sec: i64,
    #[serde(default)]
    pub tv_nsec: i64,
    #[serde(default)]
    pub iotype: String,
    #[serde(default)]
    pub node: i64,
    #[serde(default)]
    pub sm_tv_sec: i64,
    #[serde(default)]
    pub sm_tv_nsec: i64,
    #[serde(default)]
    pub supplier_id: i64,
    #[serde(default)]
    pub supplier: String,
}

impl SensorData {
    pub fn has_error(&self) -> bool {
        match &self.error {
            JsonValue::Null => false,
            JsonValue::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
            JsonValue::String(s) => !s.is_empty() && s != "0",
            _ => false,
        }
    }

    pub fn error_code(&self) -> i64 {
        crate::upstream::error_code(&self.error)
    }

    /// Change-detection fingerprint: value and error state only.
    pub fn fingerprint(&self) -> String {
        format!("{}|{}", self.value, self.error_code())
    }
}

/// JSON wrapper around every gateway frame.
#[derive(Debug, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub data: Vec<SensorData>,
}

/// Map an http(s) base URL onto the gateway WebSocket endpoint.
pub fn derive_ws_url(base_url: &str) -> String {
    let mut ws = base_url
        .replacen("https://", "wss://", 1)
        .replacen("http://", "ws://", 1);
    if !ws.ends_with('/') {
        ws.push('/');
    }
    ws.push_str("wsgate/");
    ws
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ws_url_derivation() {
        assert_eq!(derive_ws_url("http://plc1:8081"), "ws://plc1:8081/wsgate/");
        assert_eq!(derive_ws_url("https://plc1:8081/"), "wss://plc1:8081/wsgate/");
    }

    #[test]
    fn error_variants() {
        let mut data = SensorData {
            kind: "SensorInfo".into(),
            id: 1,
            name: "s".into(),
            value: 10,
            error: json!(""),
            tv_sec: 0,
            tv_nsec: 0,
            iotype: "AI".into(),
            node: 0,
            sm_tv_sec: 0,
            sm_tv_nsec: 0,
            supplier_id: 0,
            supplier: String::new(),
        };
        assert!(!data.has_error());
        assert_eq!(data.fingerprint(), "10|0");

        data.error = json!(5);
        assert!(data.has_error());
        assert_eq!(data.error_code(), 5);
        assert_eq!(data.fingerprint(), "10|5");

        data.error = json!(2.0);
        assert!(data.has_error());
        assert_eq!(data.error_code(), 2);

        data.error = json!("0");
        assert!(!data.has_error());
        assert_eq!(data.error_code(), 0);
    }

    #[test]
    fn frame_decoding() {
        let frame = json!({
            "data": [
                {"type": "Ping"},
                {"type": "SensorInfo", "id": 100, "name": "S1", "value": 42,
                 "error": "", "tv_sec": 1, "tv_nsec": 2, "iotype": "AI",
                 "node": 3000, "sm_tv_sec": 1, "sm_tv_nsec": 2,
                 "supplier_id": 5, "supplier": "TestProc"}
            ]
        });
        let resp: Response = serde_json::from_value(frame).unwrap();
        assert_eq!(resp.data.len(), 2);
        assert_eq!(resp.data[0].kind, "Ping");
        assert_eq!(resp.data[1].value, 42);
        assert_eq!(resp.data[1].supplier, "TestProc");
    }
}
