// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

//! In-process pub/sub of typed events to SSE subscribers.
//!
//! Broadcast never blocks the producer: every subscriber owns a bounded
//! queue and a full queue drops the event for that subscriber only.
//! Catching up is the subscriber's responsibility.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde_json::{json, Value as JsonValue};
use tracing::debug;

use crate::control::ControlStatus;
use crate::upstream::ObjectData;
use crate::wsgate::SensorUpdate;

/// Default per-subscriber queue capacity.
pub const DEFAULT_QUEUE_CAP: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Connected,
    ObjectData,
    SensorData,
    LogLine,
    ControlStatus,
    Error,
}

impl EventKind {
    /// SSE event-name framing.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Connected => "connected",
            EventKind::ObjectData => "object_data",
            EventKind::SensorData => "sensor_data",
            EventKind::LogLine => "log_line",
            EventKind::ControlStatus => "control_status",
            EventKind::Error => "error",
        }
    }

    /// Global events bypass the per-subscriber object filter.
    fn ignores_filter(&self) -> bool {
        matches!(self, EventKind::ControlStatus | EventKind::Connected)
    }
}

#[derive(Debug, Clone)]
pub struct SseEvent {
    pub kind: EventKind,
    pub object_name: String,
    pub data: JsonValue,
    pub timestamp: DateTime<Utc>,
}

impl SseEvent {
    /// SSE wire form: `(event_name, json_payload)`. The payload shape is
    /// per-kind: snapshots ride under `data`, sensor rows under `sensor`,
    /// log lines carry `target` and `line`, and control status goes out
    /// bare.
    pub fn to_sse(&self) -> (&'static str, String) {
        let payload = match self.kind {
            EventKind::ObjectData => json!({
                "type": self.kind.as_str(),
                "objectName": self.object_name,
                "data": self.data,
                "timestamp": self.timestamp.to_rfc3339(),
            }),
            EventKind::SensorData => json!({
                "type": self.kind.as_str(),
                "objectName": self.object_name,
                "sensor": self.data,
                "timestamp": self.timestamp.to_rfc3339(),
            }),
            EventKind::LogLine => json!({
                "type": self.kind.as_str(),
                "target": self.data.get("target").cloned().unwrap_or(JsonValue::Null),
                "line": self.data.get("line").cloned().unwrap_or(JsonValue::Null),
                "timestamp": self.timestamp.to_rfc3339(),
            }),
            // connected, control_status and error payloads are emitted
            // verbatim
            EventKind::Connected | EventKind::ControlStatus | EventKind::Error => {
                self.data.clone()
            }
        };
        (self.kind.as_str(), payload.to_string())
    }
}

struct Entry {
    object_filter: String,
    tx: Sender<SseEvent>,
    dropped: AtomicU64,
}

/// Handle returned to the owning connection; dropping it (after
/// `remove_subscriber`) releases the queue.
pub struct Subscriber {
    pub id: u64,
    pub object_filter: String,
    pub token: String,
    pub created_at: DateTime<Utc>,
    pub rx: Receiver<SseEvent>,
}

#[derive(Default)]
pub struct EventHub {
    subscribers: RwLock<HashMap<u64, Entry>>,
    next_id: AtomicU64,
    dropped_total: AtomicU64,
}

impl EventHub {
    pub fn new() -> EventHub {
        EventHub::default()
    }

    pub fn add_subscriber(&self, object_filter: &str, token: &str) -> Subscriber {
        self.add_subscriber_with_capacity(object_filter, token, DEFAULT_QUEUE_CAP)
    }

    pub fn add_subscriber_with_capacity(
        &self,
        object_filter: &str,
        token: &str,
        capacity: usize,
    ) -> Subscriber {
        let (tx, rx) = bounded(capacity);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.subscribers.write().unwrap().insert(
            id,
            Entry {
                object_filter: object_filter.to_string(),
                tx,
                dropped: AtomicU64::new(0),
            },
        );
        debug!(id, filter = object_filter, "sse subscriber added");
        Subscriber {
            id,
            object_filter: object_filter.to_string(),
            token: token.to_string(),
            created_at: Utc::now(),
            rx,
        }
    }

    /// Idempotent.
    pub fn remove_subscriber(&self, id: u64) {
        if self.subscribers.write().unwrap().remove(&id).is_some() {
            debug!(id, "sse subscriber removed");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().unwrap().len()
    }

    /// Events dropped for one subscriber because its queue was full.
    pub fn dropped_count(&self, id: u64) -> u64 {
        self.subscribers
            .read()
            .unwrap()
            .get(&id)
            .map(|e| e.dropped.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }

    /// Fan out to every matching subscriber without blocking.
    pub fn broadcast(&self, event: SseEvent) {
        let subscribers = self.subscribers.read().unwrap();
        for entry in subscribers.values() {
            let matches = entry.object_filter.is_empty()
                || entry.object_filter == event.object_name
                || event.kind.ignores_filter();
            if !matches {
                continue;
            }
            match entry.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    entry.dropped.fetch_add(1, Ordering::Relaxed);
                    self.dropped_total.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Disconnected(_)) => {}
            }
        }
    }

    pub fn broadcast_object_data(&self, object_name: &str, data: &ObjectData) {
        let payload = serde_json::to_value(data).unwrap_or(JsonValue::Null);
        self.broadcast(SseEvent {
            kind: EventKind::ObjectData,
            object_name: object_name.to_string(),
            data: payload,
            timestamp: Utc::now(),
        });
    }

    /// One `sensor_data` event per update so object filters stay precise.
    pub fn broadcast_sensor_updates(&self, updates: &[SensorUpdate]) {
        for update in updates {
            let sensor = serde_json::to_value(&update.sensor).unwrap_or(JsonValue::Null);
            self.broadcast(SseEvent {
                kind: EventKind::SensorData,
                object_name: update.object_name.clone(),
                data: sensor,
                timestamp: update.timestamp,
            });
        }
    }

    /// Same event shape as the gateway stream, fed by the scheduled poller.
    pub fn broadcast_sensor_poll_updates(&self, updates: &[crate::poller::SensorPollerUpdate]) {
        for update in updates {
            let sensor = serde_json::to_value(&update.sensor).unwrap_or(JsonValue::Null);
            self.broadcast(SseEvent {
                kind: EventKind::SensorData,
                object_name: update.object_name.clone(),
                data: sensor,
                timestamp: update.timestamp,
            });
        }
    }

    pub fn broadcast_log_line(&self, server_id: &str, object_name: &str, line: &str) {
        self.broadcast(SseEvent {
            kind: EventKind::LogLine,
            object_name: object_name.to_string(),
            data: json!({
                "target": {"serverID": server_id, "objectName": object_name},
                "line": line,
            }),
            timestamp: Utc::now(),
        });
    }

    /// Reaches every subscriber regardless of filter. `isController` is
    /// deliberately absent: each connection recomputes it from its token.
    pub fn broadcast_control_status(&self, status: &ControlStatus) {
        self.broadcast(SseEvent {
            kind: EventKind::ControlStatus,
            object_name: String::new(),
            data: json!({
                "enabled": status.enabled,
                "hasController": status.has_controller,
                "timeoutSec": status.timeout_sec,
            }),
            timestamp: Utc::now(),
        });
    }
}
