// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info};

use crate::context::{sleep_with_cancel, CancelToken};
use crate::error::Result;

/// Protocol-specific capability the scheduler is generic over. Implementors
/// fetch a batch of items for one object and expose identity and a
/// change-detection fingerprint per item.
pub trait ItemFetcher<T>: Send + Sync {
    fn fetch_items(&self, object_name: &str, ids: &[i64]) -> Result<Vec<T>>;
    fn item_id(&self, item: &T) -> i64;
    fn value_fingerprint(&self, item: &T) -> String;
}

struct TableState {
    // objectName -> set of item ids
    subscriptions: HashMap<String, HashSet<i64>>,
    // objectName -> id -> fingerprint
    last_values: HashMap<String, HashMap<i64, String>>,
}

struct Shared<T, U> {
    interval: Duration,
    batch_size: usize,
    fetcher: Box<dyn ItemFetcher<T>>,
    make_update: Box<dyn Fn(&str, &T, DateTime<Utc>) -> U + Send + Sync>,
    callback: Box<dyn Fn(Vec<U>) + Send + Sync>,
    log_prefix: &'static str,
    state: RwLock<TableState>,
}

/// Generic scheduled poller: one worker thread, atomic set-algebra on the
/// subscription tables, fingerprint comparison on every arrival, and one
/// batched callback per round.
pub struct BasePoller<T, U> {
    shared: Arc<Shared<T, U>>,
    worker: Mutex<Option<(CancelToken, JoinHandle<()>)>>,
}

impl<T: Send + Sync + 'static, U: Send + 'static> BasePoller<T, U> {
    pub fn new(
        interval: Duration,
        batch_size: usize,
        fetcher: Box<dyn ItemFetcher<T>>,
        make_update: Box<dyn Fn(&str, &T, DateTime<Utc>) -> U + Send + Sync>,
        callback: Box<dyn Fn(Vec<U>) + Send + Sync>,
        log_prefix: &'static str,
    ) -> BasePoller<T, U> {
        BasePoller {
            shared: Arc::new(Shared {
                interval,
                batch_size,
                fetcher,
                make_update,
                callback,
                log_prefix,
                state: RwLock::new(TableState {
                    subscriptions: HashMap::new(),
                    last_values: HashMap::new(),
                }),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Launch the scheduler; idempotent while running.
    pub fn start(&self, parent: &CancelToken) {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            return;
        }
        let token = parent.child();
        let shared = Arc::clone(&self.shared);
        let loop_token = token.clone();
        let handle = thread::spawn(move || {
            while sleep_with_cancel(&loop_token, shared.interval) {
                shared.poll();
            }
        });
        *worker = Some((token, handle));
        info!(
            poller = self.shared.log_prefix,
            interval_ms = self.shared.interval.as_millis() as u64,
            "poller started"
        );
    }

    /// Cancel and await the scheduler; idempotent when stopped.
    pub fn stop(&self) {
        let taken = self.worker.lock().unwrap().take();
        if let Some((token, handle)) = taken {
            token.cancel();
            let _ = handle.join();
            info!(poller = self.shared.log_prefix, "poller stopped");
        }
    }

    pub fn subscribe(&self, object_name: &str, ids: &[i64]) {
        let total = {
            let mut state = self.shared.state.write().unwrap();
            let subs = state.subscriptions.entry(object_name.to_string()).or_default();
            for id in ids {
                subs.insert(*id);
            }
            state.last_values.entry(object_name.to_string()).or_default();
            state.subscriptions.values().map(HashSet::len).sum::<usize>()
        };
        info!(
            poller = self.shared.log_prefix,
            object = object_name,
            count = ids.len(),
            total_subscriptions = total,
            "items subscribed"
        );
    }

    /// Remove ids and their fingerprint rows; the object row is evicted
    /// entirely once its last id is gone.
    pub fn unsubscribe(&self, object_name: &str, ids: &[i64]) {
        let mut state = self.shared.state.write().unwrap();
        if let Some(subs) = state.subscriptions.get_mut(object_name) {
            for id in ids {
                subs.remove(id);
            }
            let empty = subs.is_empty();
            if let Some(values) = state.last_values.get_mut(object_name) {
                for id in ids {
                    values.remove(id);
                }
            }
            if empty {
                state.subscriptions.remove(object_name);
                state.last_values.remove(object_name);
            }
        }
        debug!(
            poller = self.shared.log_prefix,
            object = object_name,
            count = ids.len(),
            "items unsubscribed"
        );
    }

    pub fn unsubscribe_all(&self, object_name: &str) {
        let mut state = self.shared.state.write().unwrap();
        state.subscriptions.remove(object_name);
        state.last_values.remove(object_name);
        debug!(
            poller = self.shared.log_prefix,
            object = object_name,
            "all items unsubscribed"
        );
    }

    pub fn subscriptions(&self, object_name: &str) -> Vec<i64> {
        let state = self.shared.state.read().unwrap();
        state
            .subscriptions
            .get(object_name)
            .map(|subs| subs.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn all_subscriptions(&self) -> HashMap<String, Vec<i64>> {
        let state = self.shared.state.read().unwrap();
        state
            .subscriptions
            .iter()
            .map(|(obj, subs)| (obj.clone(), subs.iter().copied().collect()))
            .collect()
    }

    pub fn subscription_count(&self) -> usize {
        let state = self.shared.state.read().unwrap();
        state.subscriptions.values().map(HashSet::len).sum()
    }

    /// Run exactly one round now. The scheduler calls this on every tick;
    /// tests drive it directly.
    pub fn poll_once(&self) {
        self.shared.poll();
    }
}

impl<T, U> Shared<T, U> {
    fn poll(&self) {
        // copy-then-release so no lock is held across upstream I/O
        let snapshot: Vec<(String, Vec<i64>)> = {
            let state = self.state.read().unwrap();
            state
                .subscriptions
                .iter()
                .map(|(obj, subs)| (obj.clone(), subs.iter().copied().collect()))
                .collect()
        };

        if snapshot.is_empty() {
            return;
        }
        debug!(poller = self.log_prefix, objects = snapshot.len(), "poll started");

        let now = Utc::now();
        let mut batch: Vec<U> = Vec::new();

        for (object_name, ids) in snapshot {
            if ids.is_empty() {
                continue;
            }

            let items = match self.poll_object(&object_name, &ids) {
                Ok(items) => items,
                Err(err) => {
                    error!(
                        poller = self.log_prefix,
                        object = %object_name,
                        error = %err,
                        "poll failed"
                    );
                    continue;
                }
            };

            let mut changed = 0usize;
            for item in &items {
                if self.value_changed(&object_name, item) {
                    batch.push((self.make_update)(&object_name, item, now));
                    changed += 1;
                }
            }
            if changed > 0 {
                debug!(
                    poller = self.log_prefix,
                    object = %object_name,
                    changed,
                    "values changed"
                );
            }
        }

        if !batch.is_empty() {
            debug!(poller = self.log_prefix, updates = batch.len(), "sending batch");
            (self.callback)(batch);
        }
    }

    fn poll_object(&self, object_name: &str, ids: &[i64]) -> Result<Vec<T>> {
        if self.batch_size > 0 && ids.len() > self.batch_size {
            return self.poll_object_chunked(object_name, ids);
        }
        self.fetcher.fetch_items(object_name, ids)
    }

    /// Chunk the id set into consecutive windows and union the results.
    /// The round fails only if every chunk fails.
    fn poll_object_chunked(&self, object_name: &str, ids: &[i64]) -> Result<Vec<T>> {
        let mut all_items = Vec::new();
        let mut last_err = None;

        for (i, chunk) in ids.chunks(self.batch_size).enumerate() {
            match self.fetcher.fetch_items(object_name, chunk) {
                Ok(items) => all_items.extend(items),
                Err(err) => {
                    debug!(
                        poller = self.log_prefix,
                        object = object_name,
                        chunk = i,
                        error = %err,
                        "chunk poll failed"
                    );
                    last_err = Some(err);
                }
            }
        }

        match last_err {
            Some(err) if all_items.is_empty() => Err(err),
            _ => Ok(all_items),
        }
    }

    fn value_changed(&self, object_name: &str, item: &T) -> bool {
        let item_id = self.fetcher.item_id(item);
        let fingerprint = self.fetcher.value_fingerprint(item);

        let mut state = self.state.write().unwrap();
        let values = state.last_values.entry(object_name.to_string()).or_default();
        match values.get(&item_id) {
            Some(last) if *last == fingerprint => false,
            _ => {
                values.insert(item_id, fingerprint);
                true
            }
        }
    }
}

impl<T, U> Drop for BasePoller<T, U> {
    fn drop(&mut self) {
        if let Ok(mut worker) = self.worker.lock() {
            if let Some((token, _)) = worker.take() {
                token.cancel();
            }
        }
    }
}
