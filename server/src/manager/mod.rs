// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

//! One instance bundle per configured upstream, routed by server id.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::config::{ServerEntry, DEFAULT_SERVER_ID};
use crate::context::CancelToken;
use crate::error::{Error, Result};
use crate::history::HistoryStore;
use crate::poller::{ObjectPoller, SensorPoller, SensorPollerUpdate};
use crate::upstream::{Client, ObjectData};
use crate::wsgate::{SensorUpdate, WsPoller};

/// Object snapshot events, tagged with the originating server.
pub type ObjectEventCallback = Arc<dyn Fn(&str, &str, &str, &ObjectData) + Send + Sync>;
/// Batched sensor-by-id poller updates.
pub type SensorEventCallback = Arc<dyn Fn(&str, &str, Vec<SensorPollerUpdate>) + Send + Sync>;
/// Batched gateway (WebSocket) updates.
pub type WsEventCallback = Arc<dyn Fn(&str, &str, Vec<SensorUpdate>) + Send + Sync>;

#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub id: String,
    pub url: String,
    pub name: String,
    pub connected: bool,
    #[serde(rename = "lastPoll", skip_serializing_if = "Option::is_none")]
    pub last_poll: Option<DateTime<Utc>>,
    #[serde(rename = "lastError", skip_serializing_if = "String::is_empty")]
    pub last_error: String,
    #[serde(rename = "objectCount")]
    pub object_count: usize,
}

#[derive(Default)]
struct StatusInner {
    connected: bool,
    last_poll: Option<DateTime<Utc>>,
    last_error: String,
    object_count: usize,
}

/// Everything attached to one upstream: the HTTP client, the three pollers
/// and connection status for the server-status endpoint.
pub struct Instance {
    pub entry: ServerEntry,
    pub client: Arc<Client>,
    pub object_poller: Arc<ObjectPoller>,
    pub sensor_poller: Arc<SensorPoller>,
    pub ws_poller: Arc<WsPoller>,
    status: Arc<RwLock<StatusInner>>,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("entry", &self.entry)
            .finish_non_exhaustive()
    }
}

impl Instance {
    pub fn new(
        entry: ServerEntry,
        storage: Arc<dyn HistoryStore>,
        poll_interval: Duration,
        history_ttl: Duration,
        object_callback: ObjectEventCallback,
        sensor_callback: SensorEventCallback,
        ws_callback: WsEventCallback,
    ) -> Arc<Instance> {
        let server_id = entry.canonical_id().to_string();
        let server_name = entry.display_name().to_string();

        let client = Arc::new(Client::new(&entry.url));
        let status = Arc::new(RwLock::new(StatusInner::default()));

        let object_poller = ObjectPoller::new(
            Arc::clone(&client),
            storage,
            &server_id,
            poll_interval,
            history_ttl,
        );
        {
            let id = server_id.clone();
            let name = server_name.clone();
            object_poller.set_callback(Arc::new(move |object_name: &str, data: &ObjectData| {
                object_callback(&id, &name, object_name, data);
            }));
        }
        {
            let status = Arc::clone(&status);
            object_poller.set_status_hook(Arc::new(move |connected: bool, err: Option<&Error>| {
                let mut inner = status.write().unwrap();
                inner.connected = connected;
                inner.last_poll = Some(Utc::now());
                inner.last_error = err.map(|e| e.to_string()).unwrap_or_default();
            }));
        }

        let sensor_poller = {
            let id = server_id.clone();
            let name = server_name.clone();
            Arc::new(SensorPoller::new(
                Arc::clone(&client),
                poll_interval,
                Box::new(move |updates| sensor_callback(&id, &name, updates)),
            ))
        };

        let ws_poller = {
            let id = server_id.clone();
            let name = server_name;
            WsPoller::new(
                &entry.url,
                &server_id,
                Arc::new(move |updates| ws_callback(&id, &name, updates)),
            )
        };

        Arc::new(Instance {
            entry,
            client,
            object_poller,
            sensor_poller,
            ws_poller,
            status,
        })
    }

    pub fn server_id(&self) -> &str {
        self.entry.canonical_id()
    }

    pub fn start(self: &Arc<Self>, token: &CancelToken) {
        self.object_poller.start(token);
        self.sensor_poller.start(token);
        if let Err(err) = self.ws_poller.start(token) {
            // the gateway may be down; the reconnect loop takes over later
            tracing::warn!(
                server = self.server_id(),
                error = %err,
                "gateway connect failed at startup"
            );
        }
        info!(id = self.server_id(), url = %self.entry.url, "server instance started");
    }

    pub fn stop(&self) {
        self.object_poller.stop();
        self.sensor_poller.stop();
        self.ws_poller.stop();
        info!(id = self.server_id(), "server instance stopped");
    }

    pub fn status(&self) -> Status {
        let inner = self.status.read().unwrap();
        Status {
            id: self.entry.canonical_id().to_string(),
            url: self.entry.url.clone(),
            name: self.entry.display_name().to_string(),
            connected: inner.connected,
            last_poll: inner.last_poll,
            last_error: inner.last_error.clone(),
            object_count: inner.object_count,
        }
    }

    pub fn update_status(&self, connected: bool, err: Option<&Error>) {
        let mut inner = self.status.write().unwrap();
        inner.connected = connected;
        inner.last_poll = Some(Utc::now());
        inner.last_error = err.map(|e| e.to_string()).unwrap_or_default();
    }

    /// Object list with status bookkeeping.
    pub fn object_list(&self) -> Result<Vec<String>> {
        match self.client.object_list() {
            Ok(objects) => {
                self.update_status(true, None);
                self.status.write().unwrap().object_count = objects.len();
                Ok(objects)
            }
            Err(err) => {
                self.update_status(false, Some(&err));
                Err(err)
            }
        }
    }

    /// Live snapshot with status bookkeeping; callers fall back to
    /// [`ObjectPoller::last_data`] on failure.
    pub fn object_data(&self, object_name: &str) -> Result<ObjectData> {
        match self.client.object_data(object_name) {
            Ok(data) => {
                self.update_status(true, None);
                Ok(data)
            }
            Err(err) => {
                self.update_status(false, Some(&err));
                Err(err)
            }
        }
    }
}

/// Routes by canonical server id; owns instance lifecycles.
pub struct ServerManager {
    instances: Vec<Arc<Instance>>,
    by_id: HashMap<String, usize>,
}

impl ServerManager {
    pub fn new(instances: Vec<Arc<Instance>>) -> ServerManager {
        let mut by_id = HashMap::new();
        for (i, instance) in instances.iter().enumerate() {
            by_id.insert(instance.server_id().to_string(), i);
        }
        ServerManager { instances, by_id }
    }

    pub fn get(&self, server_id: &str) -> Result<&Arc<Instance>> {
        let canonical = if server_id.is_empty() {
            DEFAULT_SERVER_ID
        } else {
            server_id
        };
        self.by_id
            .get(canonical)
            .map(|&i| &self.instances[i])
            .ok_or_else(|| Error::NotFound(format!("unknown server {canonical:?}")))
    }

    pub fn instances(&self) -> &[Arc<Instance>] {
        &self.instances
    }

    pub fn statuses(&self) -> Vec<Status> {
        self.instances.iter().map(|i| i.status()).collect()
    }

    pub fn start_all(&self, token: &CancelToken) {
        for instance in &self.instances {
            instance.start(token);
        }
    }

    pub fn stop_all(&self) {
        for instance in &self.instances {
            instance.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::MemoryStore;

    fn entry(id: &str, url: &str) -> ServerEntry {
        ServerEntry {
            id: id.to_string(),
            name: String::new(),
            url: url.to_string(),
        }
    }

    fn make_instance(id: &str) -> Arc<Instance> {
        Instance::new(
            entry(id, "http://localhost:9"),
            Arc::new(MemoryStore::new()),
            Duration::from_secs(5),
            Duration::from_secs(3600),
            Arc::new(|_, _, _, _| {}),
            Arc::new(|_, _, _| {}),
            Arc::new(|_, _, _| {}),
        )
    }

    #[test]
    fn routing_by_canonical_id() {
        let manager = ServerManager::new(vec![make_instance(""), make_instance("plc2")]);

        assert_eq!(manager.get("").unwrap().server_id(), "default");
        assert_eq!(manager.get("default").unwrap().server_id(), "default");
        assert_eq!(manager.get("plc2").unwrap().server_id(), "plc2");

        let err = manager.get("ghost").unwrap_err();
        assert_eq!(err.http_status(), 404);
    }

    #[test]
    fn status_defaults_and_updates() {
        let instance = make_instance("plc1");
        let status = instance.status();
        assert!(!status.connected);
        assert!(status.last_poll.is_none());
        assert_eq!(status.name, "http://localhost:9");

        instance.update_status(false, Some(&Error::Transport("down".into())));
        let status = instance.status();
        assert!(!status.connected);
        assert!(status.last_error.contains("down"));
        assert!(status.last_poll.is_some());

        instance.update_status(true, None);
        assert!(instance.status().last_error.is_empty());
    }
}
