// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{info, warn};

use crate::context::{sleep_with_cancel, CancelToken};
use crate::error::Error;
use crate::history::HistoryStore;
use crate::upstream::{Client, ObjectData};

/// Invoked once per watched object per round with the fresh snapshot.
pub type ObjectCallback = Arc<dyn Fn(&str, &ObjectData) + Send + Sync>;

/// Reports poll outcome so the owning instance can track
/// connected/lastError without the poller knowing about it.
pub type StatusHook = Arc<dyn Fn(bool, Option<&Error>) + Send + Sync>;

const CLEANUP_PERIOD: Duration = Duration::from_secs(60);

struct State {
    watched: HashSet<String>,
    last_data: HashMap<String, Arc<ObjectData>>,
    last_cleanup: Instant,
}

/// Polls whole-object snapshots for every watched object, deposits scalars
/// into the history store and emits one change event per object per round.
pub struct ObjectPoller {
    client: Arc<Client>,
    storage: Arc<dyn HistoryStore>,
    server_id: String,
    interval: Duration,
    ttl: Duration,
    state: RwLock<State>,
    callback: Mutex<Option<ObjectCallback>>,
    status_hook: Mutex<Option<StatusHook>>,
    worker: Mutex<Option<(CancelToken, JoinHandle<()>)>>,
}

impl ObjectPoller {
    pub fn new(
        client: Arc<Client>,
        storage: Arc<dyn HistoryStore>,
        server_id: &str,
        interval: Duration,
        ttl: Duration,
    ) -> Arc<ObjectPoller> {
        Arc::new(ObjectPoller {
            client,
            storage,
            server_id: server_id.to_string(),
            interval,
            ttl,
            state: RwLock::new(State {
                watched: HashSet::new(),
                last_data: HashMap::new(),
                last_cleanup: Instant::now(),
            }),
            callback: Mutex::new(None),
            status_hook: Mutex::new(None),
            worker: Mutex::new(None),
        })
    }

    pub fn set_callback(&self, callback: ObjectCallback) {
        *self.callback.lock().unwrap() = Some(callback);
    }

    pub fn set_status_hook(&self, hook: StatusHook) {
        *self.status_hook.lock().unwrap() = Some(hook);
    }

    pub fn watch(&self, object_name: &str) {
        let mut state = self.state.write().unwrap();
        state.watched.insert(object_name.to_string());
    }

    pub fn unwatch(&self, object_name: &str) {
        let mut state = self.state.write().unwrap();
        state.watched.remove(object_name);
    }

    pub fn watched(&self) -> Vec<String> {
        let state = self.state.read().unwrap();
        state.watched.iter().cloned().collect()
    }

    /// Most recent decoded snapshot, served when a live fetch fails.
    pub fn last_data(&self, object_name: &str) -> Option<Arc<ObjectData>> {
        let state = self.state.read().unwrap();
        state.last_data.get(object_name).cloned()
    }

    /// First round runs immediately, then on every interval tick.
    pub fn start(self: &Arc<Self>, parent: &CancelToken) {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            return;
        }
        let token = parent.child();
        let poller = Arc::clone(self);
        let loop_token = token.clone();
        let handle = thread::spawn(move || {
            poller.poll();
            while sleep_with_cancel(&loop_token, poller.interval) {
                poller.poll();
            }
        });
        *worker = Some((token, handle));
        info!(server = %self.server_id, "object poller started");
    }

    pub fn stop(&self) {
        let taken = self.worker.lock().unwrap().take();
        if let Some((token, handle)) = taken {
            token.cancel();
            let _ = handle.join();
            info!(server = %self.server_id, "object poller stopped");
        }
    }

    pub fn poll(&self) {
        let objects: Vec<String> = {
            let state = self.state.read().unwrap();
            state.watched.iter().cloned().collect()
        };

        let now = Utc::now();

        for object_name in objects {
            let data = match self.client.object_data(&object_name) {
                Ok(data) => Arc::new(data),
                Err(err) => {
                    warn!(
                        server = %self.server_id,
                        object = %object_name,
                        error = %err,
                        "poll failed"
                    );
                    self.report_status(false, Some(&err));
                    continue;
                }
            };
            self.report_status(true, None);

            let callback = {
                let mut state = self.state.write().unwrap();
                state.last_data.insert(object_name.clone(), Arc::clone(&data));
                self.callback.lock().unwrap().clone()
            };
            if let Some(callback) = callback {
                callback(&object_name, &data);
            }

            if let Some(variables) = &data.variables {
                for (var_name, value) in variables {
                    if let Err(err) = self.storage.save(
                        &self.server_id,
                        &object_name,
                        var_name,
                        value.clone(),
                        now,
                    ) {
                        warn!(object = %object_name, var = %var_name, error = %err, "save variable failed");
                    }
                }
            }

            if let Some(io) = &data.io {
                for (key, entry) in &io.input {
                    let var_name = format!("io.in.{key}");
                    if let Err(err) = self.storage.save(
                        &self.server_id,
                        &object_name,
                        &var_name,
                        entry.value.clone(),
                        now,
                    ) {
                        warn!(object = %object_name, var = %var_name, error = %err, "save io input failed");
                    }
                }
                for (key, entry) in &io.output {
                    let var_name = format!("io.out.{key}");
                    if let Err(err) = self.storage.save(
                        &self.server_id,
                        &object_name,
                        &var_name,
                        entry.value.clone(),
                        now,
                    ) {
                        warn!(object = %object_name, var = %var_name, error = %err, "save io output failed");
                    }
                }
            }
        }

        // purge at most once per minute
        let due = {
            let state = self.state.read().unwrap();
            state.last_cleanup.elapsed() > CLEANUP_PERIOD
        };
        if due {
            let cutoff = now
                - chrono::TimeDelta::from_std(self.ttl).unwrap_or(chrono::TimeDelta::seconds(3600));
            if let Err(err) = self.storage.cleanup(cutoff) {
                warn!(error = %err, "history cleanup failed");
            }
            self.state.write().unwrap().last_cleanup = Instant::now();
        }
    }

    fn report_status(&self, connected: bool, err: Option<&Error>) {
        let hook = self.status_hook.lock().unwrap().clone();
        if let Some(hook) = hook {
            hook(connected, err);
        }
    }
}

impl Drop for ObjectPoller {
    fn drop(&mut self) {
        if let Ok(mut worker) = self.worker.lock() {
            if let Some((token, _)) = worker.take() {
                token.cancel();
            }
        }
    }
}
