// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use super::{Client, SensorData};
use crate::context::CancelToken;
use crate::error::Result;

/// Sensor change event fanned out to SSE subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct SensorUpdate {
    #[serde(rename = "object")]
    pub object_name: String,
    pub sensor: SensorData,
    pub timestamp: DateTime<Utc>,
}

pub type BatchCallback = Arc<dyn Fn(Vec<SensorUpdate>) + Send + Sync>;

/// Hook invoked for every changed sensor so the recording pipeline can
/// mirror the stream without the poller depending on it.
pub type RecordFn = Arc<dyn Fn(&str, &str, i64, DateTime<Utc>) + Send + Sync>;

struct State {
    // objectName -> set of sensor names
    subscriptions: HashMap<String, HashSet<String>>,
    // sensorName -> "value|errcode"
    last_values: HashMap<String, String>,
    current_values: HashMap<String, SensorData>,
}

/// Subscription manager over the gateway feed: the asynchronous variant of
/// the change-detection engine. Updates arrive pushed rather than polled;
/// everything else (per-object sets, fingerprints, batched emit) matches
/// the scheduled pollers.
pub struct WsPoller {
    client: Arc<Client>,
    state: RwLock<State>,
    callback: BatchCallback,
    record: Mutex<Option<RecordFn>>,
    server_id: String,
}

impl WsPoller {
    pub fn new(base_url: &str, server_id: &str, callback: BatchCallback) -> Arc<WsPoller> {
        let client = Client::new(base_url);
        let poller = Arc::new(WsPoller {
            client: Arc::clone(&client),
            state: RwLock::new(State {
                subscriptions: HashMap::new(),
                last_values: HashMap::new(),
                current_values: HashMap::new(),
            }),
            callback,
            record: Mutex::new(None),
            server_id: server_id.to_string(),
        });

        let hook = Arc::clone(&poller);
        client.set_on_data(Arc::new(move |data| hook.handle_data(data)));
        poller
    }

    pub fn set_record_fn(&self, record: RecordFn) {
        *self.record.lock().unwrap() = Some(record);
    }

    pub fn start(self: &Arc<Self>, token: &CancelToken) -> Result<()> {
        info!(url = self.client.ws_url(), "starting gateway poller");
        self.client.connect(token)
    }

    pub fn stop(&self) {
        info!("stopping gateway poller");
        self.client.close();
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    /// Subscribe an object to sensors by name. Only names this poller has
    /// never seen for any object are forwarded to the gateway.
    pub fn subscribe(&self, object_name: &str, sensor_names: &[String]) -> Result<()> {
        if sensor_names.is_empty() {
            return Ok(());
        }

        let new_sensors: Vec<String> = {
            let mut state = self.state.write().unwrap();
            let subs = state.subscriptions.entry(object_name.to_string()).or_default();
            sensor_names
                .iter()
                .filter(|name| subs.insert((*name).clone()))
                .cloned()
                .collect()
        };

        if new_sensors.is_empty() {
            return Ok(());
        }
        info!(object = object_name, count = new_sensors.len(), "subscribing to gateway sensors");
        self.client.subscribe(&new_sensors)
    }

    /// Unsubscribe an object. A `del:` is only sent for sensors no other
    /// object still references.
    pub fn unsubscribe(&self, object_name: &str, sensor_names: &[String]) -> Result<()> {
        if sensor_names.is_empty() {
            return Ok(());
        }

        let to_remove: Vec<String> = {
            let mut state = self.state.write().unwrap();
            let Some(subs) = state.subscriptions.get_mut(object_name) else {
                return Ok(());
            };

            let mut removed = Vec::new();
            for name in sensor_names {
                if subs.remove(name) {
                    removed.push(name.clone());
                }
            }
            if state
                .subscriptions
                .get(object_name)
                .map(HashSet::is_empty)
                .unwrap_or(false)
            {
                state.subscriptions.remove(object_name);
            }

            let mut orphaned = Vec::new();
            for name in removed {
                let still_referenced = state
                    .subscriptions
                    .values()
                    .any(|subs| subs.contains(&name));
                if !still_referenced {
                    state.last_values.remove(&name);
                    state.current_values.remove(&name);
                    orphaned.push(name);
                }
            }
            orphaned
        };

        if to_remove.is_empty() {
            return Ok(());
        }
        info!(object = object_name, count = to_remove.len(), "unsubscribing from gateway sensors");
        self.client.unsubscribe(&to_remove)
    }

    pub fn unsubscribe_all(&self, object_name: &str) -> Result<()> {
        let names: Vec<String> = {
            let state = self.state.read().unwrap();
            match state.subscriptions.get(object_name) {
                Some(subs) => subs.iter().cloned().collect(),
                None => return Ok(()),
            }
        };
        self.unsubscribe(object_name, &names)
    }

    pub fn subscriptions(&self, object_name: &str) -> Vec<String> {
        let state = self.state.read().unwrap();
        state
            .subscriptions
            .get(object_name)
            .map(|subs| subs.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn all_subscriptions(&self) -> HashMap<String, Vec<String>> {
        let state = self.state.read().unwrap();
        state
            .subscriptions
            .iter()
            .map(|(obj, subs)| (obj.clone(), subs.iter().cloned().collect()))
            .collect()
    }

    pub fn current_value(&self, sensor_name: &str) -> Option<SensorData> {
        let state = self.state.read().unwrap();
        state.current_values.get(sensor_name).cloned()
    }

    pub fn sensors_for_object(&self, object_name: &str) -> Vec<SensorData> {
        let state = self.state.read().unwrap();
        let Some(subs) = state.subscriptions.get(object_name) else {
            return Vec::new();
        };
        subs.iter()
            .filter_map(|name| state.current_values.get(name).cloned())
            .collect()
    }

    fn handle_data(&self, data: Vec<SensorData>) {
        if data.is_empty() {
            return;
        }

        let now = Utc::now();
        let mut updates = Vec::new();
        let mut records = Vec::new();

        {
            let mut state = self.state.write().unwrap();
            for sensor in data {
                state.current_values.insert(sensor.name.clone(), sensor.clone());

                let fingerprint = sensor.fingerprint();
                if state.last_values.get(&sensor.name) == Some(&fingerprint) {
                    continue;
                }
                state.last_values.insert(sensor.name.clone(), fingerprint);

                let mut recorded = false;
                for (object_name, subs) in state.subscriptions.iter() {
                    if !subs.contains(&sensor.name) {
                        continue;
                    }
                    updates.push(SensorUpdate {
                        object_name: object_name.clone(),
                        sensor: sensor.clone(),
                        timestamp: now,
                    });
                    if !recorded {
                        records.push((object_name.clone(), sensor.name.clone(), sensor.value));
                        recorded = true;
                    }
                }
            }
        }

        if !records.is_empty() {
            let record = self.record.lock().unwrap().clone();
            if let Some(record) = record {
                for (object_name, sensor_name, value) in records {
                    record(&object_name, &format!("ws:{sensor_name}"), value, now);
                }
            }
        }

        if !updates.is_empty() {
            (self.callback)(updates);
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    fn sensor(name: &str, value: i64) -> SensorData {
        SensorData {
            kind: "SensorInfo".into(),
            id: crate::sensorcfg::hash32(name) as i64,
            name: name.into(),
            value,
            error: json!(""),
            tv_sec: 0,
            tv_nsec: 0,
            iotype: "AI".into(),
            node: 0,
            sm_tv_sec: 0,
            sm_tv_nsec: 0,
            supplier_id: 0,
            supplier: String::new(),
        }
    }

    fn collecting_poller() -> (Arc<WsPoller>, Arc<StdMutex<Vec<SensorUpdate>>>) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let poller = WsPoller::new(
            "http://localhost:9",
            "default",
            Arc::new(move |updates| sink.lock().unwrap().extend(updates)),
        );
        (poller, seen)
    }

    #[test]
    fn change_detection_filters_repeats() {
        let (poller, seen) = collecting_poller();
        // local bookkeeping only; the client is not connected
        let _ = poller.subscribe("Obj", &["S1".into()]);

        poller.handle_data(vec![sensor("S1", 1)]);
        poller.handle_data(vec![sensor("S1", 1)]);
        poller.handle_data(vec![sensor("S1", 2)]);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].sensor.value, 1);
        assert_eq!(seen[1].sensor.value, 2);
        assert_eq!(seen[0].object_name, "Obj");
    }

    #[test]
    fn updates_fan_to_every_subscribed_object() {
        let (poller, seen) = collecting_poller();
        let _ = poller.subscribe("A", &["S1".into()]);
        let _ = poller.subscribe("B", &["S1".into()]);

        poller.handle_data(vec![sensor("S1", 7)]);

        let seen = seen.lock().unwrap();
        let mut objects: Vec<&str> = seen.iter().map(|u| u.object_name.as_str()).collect();
        objects.sort_unstable();
        assert_eq!(objects, vec!["A", "B"]);
    }

    #[test]
    fn unsubscribe_respects_cross_object_references() {
        let (poller, _) = collecting_poller();
        let _ = poller.subscribe("A", &["S1".into(), "S2".into()]);
        let _ = poller.subscribe("B", &["S1".into()]);

        // S1 still referenced by B, so only local bookkeeping changes.
        let _ = poller.unsubscribe("A", &["S1".into()]);
        assert_eq!(poller.subscriptions("A"), vec!["S2".to_string()]);
        assert_eq!(poller.subscriptions("B"), vec!["S1".to_string()]);

        // Change to S1 must still reach B only.
        poller.handle_data(vec![sensor("S1", 3)]);
        let all = poller.all_subscriptions();
        assert!(all.contains_key("B"));

        let _ = poller.unsubscribe("B", &["S1".into()]);
        assert!(poller.subscriptions("B").is_empty());
        assert!(poller.current_value("S1").is_none());
    }

    #[test]
    fn current_values_cache() {
        let (poller, _) = collecting_poller();
        let _ = poller.subscribe("Obj", &["S1".into(), "S2".into()]);
        poller.handle_data(vec![sensor("S1", 5), sensor("S2", 6)]);

        assert_eq!(poller.current_value("S1").unwrap().value, 5);
        let mut values: Vec<i64> = poller
            .sensors_for_object("Obj")
            .into_iter()
            .map(|s| s.value)
            .collect();
        values.sort_unstable();
        assert_eq!(values, vec![5, 6]);
    }

    #[test]
    fn record_hook_sees_ws_prefixed_variable() {
        let (poller, _) = collecting_poller();
        let recorded = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&recorded);
        poller.set_record_fn(Arc::new(move |object, variable, value, _ts| {
            sink.lock().unwrap().push((object.to_string(), variable.to_string(), value));
        }));

        let _ = poller.subscribe("Obj", &["S1".into()]);
        poller.handle_data(vec![sensor("S1", 11)]);

        let recorded = recorded.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0], ("Obj".to_string(), "ws:S1".to_string(), 11));
    }
}
