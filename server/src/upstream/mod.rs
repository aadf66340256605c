// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

//! Typed client over the upstream UniSet2 REST surface (`/api/v2/...`).
//!
//! Transport failures never cascade: every error is reported as
//! [`Error::Transport`] with the request URL, and callers decide whether to
//! absorb or surface it.

use std::collections::HashMap;
use std::io::Read;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{Error, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Remote log server endpoint advertised inside an object snapshot.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct LogServerInfo {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub state: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IoEntry {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub value: JsonValue,
    #[serde(default)]
    pub comment: String,
    #[serde(default, rename = "varType")]
    pub var_type: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct IoSection {
    #[serde(default, rename = "in")]
    pub input: HashMap<String, IoEntry>,
    #[serde(default, rename = "out")]
    pub output: HashMap<String, IoEntry>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ObjectDescriptor {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "objectType")]
    pub object_type: String,
    #[serde(default, rename = "msgCount")]
    pub msg_count: i64,
    #[serde(default, rename = "lostMessages")]
    pub lost_messages: i64,
}

/// One decoded object snapshot: the atomic unit of a polling round.
///
/// Fields the service interprets are typed; everything else the upstream
/// returned is preserved verbatim in `extra` and re-emitted on fan-out.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ObjectData {
    #[serde(skip)]
    pub name: String,
    #[serde(rename = "LogServer", skip_serializing_if = "Option::is_none")]
    pub log_server: Option<LogServerInfo>,
    #[serde(rename = "Variables", skip_serializing_if = "Option::is_none")]
    pub variables: Option<HashMap<String, JsonValue>>,
    #[serde(rename = "io", skip_serializing_if = "Option::is_none")]
    pub io: Option<IoSection>,
    #[serde(rename = "object", skip_serializing_if = "Option::is_none")]
    pub object: Option<ObjectDescriptor>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, JsonValue>,
}

/// Sensor row from `GET {object}/get?id=...`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SensorValue {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub value: i64,
    #[serde(default)]
    pub error: JsonValue,
    #[serde(default)]
    pub tv_sec: i64,
    #[serde(default)]
    pub tv_nsec: i64,
}

impl SensorValue {
    /// Error code with the upstream convention that `""` means no error.
    pub fn error_code(&self) -> i64 {
        error_code(&self.error)
    }
}

pub(crate) fn error_code(error: &JsonValue) -> i64 {
    match error {
        JsonValue::Number(n) => n.as_i64().unwrap_or_else(|| n.as_f64().unwrap_or(0.0) as i64),
        JsonValue::String(_) => 0,
        _ => 0,
    }
}

/// Sensor row from the SharedMemory batch endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SmSensorValue {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub value: i64,
    #[serde(default)]
    pub real_value: f64,
    #[serde(default)]
    pub tv_sec: i64,
    #[serde(default)]
    pub tv_nsec: i64,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Deserialize)]
pub struct SmGetResponse {
    #[serde(default)]
    pub object: JsonValue,
    #[serde(default)]
    pub sensors: Vec<SmSensorValue>,
}

// Control-plane envelopes. Every response carries `result`; anything other
// than "ok" is rejected with the upstream error string.

#[derive(Debug, Deserialize)]
pub struct StatusResponse {
    pub result: String,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub status: JsonValue,
}

#[derive(Debug, Deserialize)]
pub struct ParamsResponse {
    pub result: String,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub params: JsonValue,
    #[serde(default)]
    pub updated: JsonValue,
}

#[derive(Debug, Deserialize)]
pub struct SensorsResponse {
    pub result: String,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub sensors: JsonValue,
    #[serde(default)]
    pub total: i64,
}

#[derive(Debug, Deserialize)]
pub struct SensorResponse {
    pub result: String,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub sensor: JsonValue,
}

#[derive(Debug, Deserialize)]
pub struct DiagnosticsResponse {
    pub result: String,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub summary: JsonValue,
    #[serde(default, rename = "lastErrors")]
    pub last_errors: JsonValue,
}

#[derive(Debug, Deserialize)]
pub struct ControlResponse {
    pub result: String,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, rename = "previousMode")]
    pub previous_mode: i64,
    #[serde(default, rename = "currentMode")]
    pub current_mode: i64,
}

fn ensure_result(result: &str, error: &str) -> Result<()> {
    if result == "ok" {
        return Ok(());
    }
    let detail = if error.is_empty() { result } else { error };
    Err(Error::Transport(format!("upstream rejected request: {detail}")))
}

/// Blocking client for one upstream node.
pub struct Client {
    base_url: String,
    agent: ureq::Agent,
}

impl Client {
    pub fn new(base_url: &str) -> Client {
        let agent = ureq::AgentBuilder::new().timeout(REQUEST_TIMEOUT).build();
        Client {
            base_url: base_url.trim_end_matches('/').to_string(),
            agent,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `GET /api/v2/list`. Accepts the bare array-of-strings shape and the
    /// legacy v01 `{objects:[{name},...]}` envelope.
    pub fn object_list(&self) -> Result<Vec<String>> {
        let body = self.do_get("list")?;
        decode_object_list(&body)
    }

    /// `GET /api/v2/{object}` decoded into an [`ObjectData`] snapshot.
    pub fn object_data(&self, object_name: &str) -> Result<ObjectData> {
        let body = self.do_get(object_name)?;
        let mut data: ObjectData = serde_json::from_slice(&body)
            .map_err(|e| Error::Transport(format!("decode object {object_name}: {e}")))?;
        data.name = object_name.to_string();
        Ok(data)
    }

    /// `GET /api/v2/{object}/get?id=<csv>`.
    pub fn sensor_values(&self, object_name: &str, ids: &[i64]) -> Result<Vec<SensorValue>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let csv = ids.iter().map(i64::to_string).collect::<Vec<_>>().join(",");
        let body = self.do_get(&format!("{object_name}/get?id={csv}"))?;
        decode_sensor_values(&body)
    }

    /// `GET /api/v2/SharedMemory/get?<csv>&shortInfo`, keyed by sensor name.
    /// Rows carrying a non-empty error are dropped.
    pub fn sm_values(&self, sensors: &[String]) -> Result<HashMap<String, SmSensorValue>> {
        if sensors.is_empty() {
            return Ok(HashMap::new());
        }
        let csv = sensors.join(",");
        let body = self.do_get(&format!("SharedMemory/get?{csv}&shortInfo"))?;
        let resp: SmGetResponse = serde_json::from_slice(&body)
            .map_err(|e| Error::Transport(format!("decode SharedMemory response: {e}")))?;
        Ok(index_sm_sensors(resp))
    }

    pub fn object_status(&self, object_name: &str) -> Result<StatusResponse> {
        let body = self.do_get(&format!("{object_name}/status"))?;
        let resp: StatusResponse = decode(&body)?;
        ensure_result(&resp.result, &resp.error)?;
        Ok(resp)
    }

    pub fn get_params(&self, object_name: &str, names: &[String]) -> Result<ParamsResponse> {
        if names.is_empty() {
            return Err(Error::InvalidInput("at least one param is required".into()));
        }
        let query: Vec<String> = names
            .iter()
            .map(|n| format!("name={}", urlencode(n)))
            .collect();
        let body = self.do_get(&format!("{object_name}/getparam?{}", query.join("&")))?;
        let resp: ParamsResponse = decode(&body)?;
        ensure_result(&resp.result, &resp.error)?;
        Ok(resp)
    }

    pub fn set_params(
        &self,
        object_name: &str,
        params: &HashMap<String, String>,
    ) -> Result<ParamsResponse> {
        if params.is_empty() {
            return Err(Error::InvalidInput("at least one param is required".into()));
        }
        let query: Vec<String> = params
            .iter()
            .map(|(k, v)| format!("{}={}", urlencode(k), urlencode(v)))
            .collect();
        let body = self.do_get(&format!("{object_name}/setparam?{}", query.join("&")))?;
        let resp: ParamsResponse = decode(&body)?;
        ensure_result(&resp.result, &resp.error)?;
        Ok(resp)
    }

    pub fn remote_sensors(&self, object_name: &str) -> Result<SensorsResponse> {
        let body = self.do_get(&format!("{object_name}/sensors"))?;
        let resp: SensorsResponse = decode(&body)?;
        ensure_result(&resp.result, &resp.error)?;
        Ok(resp)
    }

    pub fn remote_sensor(&self, object_name: &str, id: i64) -> Result<SensorResponse> {
        let body = self.do_get(&format!("{object_name}/sensor?id={id}"))?;
        let resp: SensorResponse = decode(&body)?;
        ensure_result(&resp.result, &resp.error)?;
        Ok(resp)
    }

    pub fn diagnostics(&self, object_name: &str) -> Result<DiagnosticsResponse> {
        let body = self.do_get(&format!("{object_name}/diagnostics"))?;
        let resp: DiagnosticsResponse = decode(&body)?;
        ensure_result(&resp.result, &resp.error)?;
        Ok(resp)
    }

    pub fn take_control(&self, object_name: &str) -> Result<ControlResponse> {
        let body = self.do_get(&format!("{object_name}/takeControl"))?;
        let resp: ControlResponse = decode(&body)?;
        ensure_result(&resp.result, &resp.error)?;
        Ok(resp)
    }

    pub fn release_control(&self, object_name: &str) -> Result<ControlResponse> {
        let body = self.do_get(&format!("{object_name}/releaseControl"))?;
        let resp: ControlResponse = decode(&body)?;
        ensure_result(&resp.result, &resp.error)?;
        Ok(resp)
    }

    fn do_get(&self, path: &str) -> Result<Vec<u8>> {
        let url = format!("{}/api/v2/{}", self.base_url, path);
        let response = match self.agent.get(&url).call() {
            Ok(resp) => resp,
            Err(ureq::Error::Status(code, resp)) => {
                let body = resp.into_string().unwrap_or_default();
                return Err(Error::Transport(format!(
                    "{url}: status {code} ({})",
                    body.trim()
                )));
            }
            Err(ureq::Error::Transport(err)) => {
                return Err(Error::Transport(format!("{url}: {err}")));
            }
        };

        let mut body = Vec::new();
        response
            .into_reader()
            .read_to_end(&mut body)
            .map_err(|e| Error::Transport(format!("{url}: read body: {e}")))?;
        Ok(body)
    }
}

fn decode<T: for<'de> Deserialize<'de>>(body: &[u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| Error::Transport(format!("decode response: {e}")))
}

fn decode_object_list(body: &[u8]) -> Result<Vec<String>> {
    #[derive(Deserialize)]
    struct V01Entry {
        name: String,
    }
    #[derive(Deserialize)]
    struct V01List {
        objects: Vec<V01Entry>,
    }

    if let Ok(names) = serde_json::from_slice::<Vec<String>>(body) {
        return Ok(names);
    }
    let legacy: V01List = serde_json::from_slice(body)
        .map_err(|e| Error::Transport(format!("decode object list: {e}")))?;
    Ok(legacy.objects.into_iter().map(|o| o.name).collect())
}

fn decode_sensor_values(body: &[u8]) -> Result<Vec<SensorValue>> {
    #[derive(Deserialize)]
    struct Envelope {
        sensors: Vec<SensorValue>,
    }

    if let Ok(values) = serde_json::from_slice::<Vec<SensorValue>>(body) {
        return Ok(values);
    }
    let envelope: Envelope = serde_json::from_slice(body)
        .map_err(|e| Error::Transport(format!("decode sensor values: {e}")))?;
    Ok(envelope.sensors)
}

/// Key rows by sensor name, dropping any that carry an error.
fn index_sm_sensors(resp: SmGetResponse) -> HashMap<String, SmSensorValue> {
    let mut values = HashMap::with_capacity(resp.sensors.len());
    for s in resp.sensors {
        if s.error.is_empty() {
            values.insert(s.name.clone(), s);
        }
    }
    values
}

fn urlencode(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn object_list_both_shapes() {
        let bare = br#"["TestProc","SharedMemory"]"#;
        assert_eq!(
            decode_object_list(bare).unwrap(),
            vec!["TestProc".to_string(), "SharedMemory".to_string()]
        );

        let v01 = br#"{"objects":[{"name":"TestProc","id":1},{"name":"SharedMemory"}]}"#;
        assert_eq!(
            decode_object_list(v01).unwrap(),
            vec!["TestProc".to_string(), "SharedMemory".to_string()]
        );
    }

    #[test]
    fn object_data_preserves_unknown_fields() {
        let body = json!({
            "LogServer": {"host": "plc1", "port": 3333, "state": "running"},
            "Variables": {"var1": "100", "flag": true},
            "io": {
                "in": {"input1": {"id": 1, "name": "input1", "value": 5}},
                "out": {}
            },
            "object": {"id": 9000, "name": "TestProc", "objectType": "UniSetObject", "msgCount": 3, "lostMessages": 0},
            "Timers": {"t1": {"msec": 100}}
        });
        let data: ObjectData = serde_json::from_value(body).unwrap();
        assert_eq!(data.log_server.as_ref().unwrap().port, 3333);
        assert_eq!(
            data.variables.as_ref().unwrap().get("var1").unwrap(),
            &json!("100")
        );
        assert_eq!(data.io.as_ref().unwrap().input["input1"].value, json!(5));
        assert_eq!(data.object.as_ref().unwrap().msg_count, 3);
        // Unknown upstream fields ride along opaquely.
        assert!(data.extra.contains_key("Timers"));

        let round = serde_json::to_value(&data).unwrap();
        assert_eq!(round.get("Timers").unwrap(), &json!({"t1": {"msec": 100}}));
    }

    #[test]
    fn sensor_values_both_shapes() {
        let bare = br#"[{"id": 10, "name": "s1", "value": 42, "tv_sec": 1, "tv_nsec": 2}]"#;
        let values = decode_sensor_values(bare).unwrap();
        assert_eq!(values[0].value, 42);

        let envelope = br#"{"sensors":[{"id": 10, "name": "s1", "value": 7}]}"#;
        let values = decode_sensor_values(envelope).unwrap();
        assert_eq!(values[0].value, 7);
    }

    #[test]
    fn error_code_coercion() {
        let mut sv = SensorValue {
            id: 1,
            name: "s".into(),
            value: 0,
            error: json!(3),
            tv_sec: 0,
            tv_nsec: 0,
        };
        assert_eq!(sv.error_code(), 3);
        sv.error = json!("");
        assert_eq!(sv.error_code(), 0);
        sv.error = json!(2.0);
        assert_eq!(sv.error_code(), 2);
        sv.error = JsonValue::Null;
        assert_eq!(sv.error_code(), 0);
    }

    #[test]
    fn sm_rows_with_errors_are_dropped() {
        let body = json!({
            "object": {"name": "SharedMemory"},
            "sensors": [
                {"id": 1, "name": "Good", "value": 10, "real_value": 10.0, "tv_sec": 1, "tv_nsec": 0},
                {"id": 2, "name": "Bad", "value": 0, "error": "Not found"}
            ]
        });
        let resp: SmGetResponse = serde_json::from_value(body).unwrap();
        let values = index_sm_sensors(resp);
        assert_eq!(values.len(), 1);
        assert_eq!(values["Good"].value, 10);
        assert!(!values.contains_key("Bad"));
    }

    #[test]
    fn envelope_rejection() {
        assert!(ensure_result("ok", "").is_ok());
        let err = ensure_result("error", "no such param").unwrap_err();
        assert!(err.to_string().contains("no such param"));
    }
}
