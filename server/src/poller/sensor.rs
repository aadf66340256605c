// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::base::{BasePoller, ItemFetcher};
use crate::context::CancelToken;
use crate::error::Result;
use crate::upstream::{Client, SensorValue};

/// Default window for one `get?id=` request.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Change event produced by the sensor-by-id poller.
#[derive(Debug, Clone, Serialize)]
pub struct SensorPollerUpdate {
    #[serde(rename = "object")]
    pub object_name: String,
    pub sensor: SensorValue,
    pub timestamp: DateTime<Utc>,
}

/// Fetches sensor batches through the upstream HTTP client.
pub struct SensorFetcher {
    client: Arc<Client>,
}

impl SensorFetcher {
    pub fn new(client: Arc<Client>) -> SensorFetcher {
        SensorFetcher { client }
    }
}

impl ItemFetcher<SensorValue> for SensorFetcher {
    fn fetch_items(&self, object_name: &str, ids: &[i64]) -> Result<Vec<SensorValue>> {
        self.client.sensor_values(object_name, ids)
    }

    fn item_id(&self, item: &SensorValue) -> i64 {
        item.id
    }

    fn value_fingerprint(&self, item: &SensorValue) -> String {
        format!("{}|{}", item.value, item.error_code())
    }
}

/// Scheduled poller over the sensor-by-id upstream endpoint.
pub struct SensorPoller {
    inner: BasePoller<SensorValue, SensorPollerUpdate>,
}

impl SensorPoller {
    pub fn new(
        client: Arc<Client>,
        interval: Duration,
        callback: Box<dyn Fn(Vec<SensorPollerUpdate>) + Send + Sync>,
    ) -> SensorPoller {
        SensorPoller {
            inner: BasePoller::new(
                interval,
                DEFAULT_BATCH_SIZE,
                Box::new(SensorFetcher::new(client)),
                Box::new(|object_name: &str, sensor: &SensorValue, timestamp| SensorPollerUpdate {
                    object_name: object_name.to_string(),
                    sensor: sensor.clone(),
                    timestamp,
                }),
                callback,
                "sensor",
            ),
        }
    }

    pub fn start(&self, token: &CancelToken) {
        self.inner.start(token);
    }

    pub fn stop(&self) {
        self.inner.stop();
    }

    pub fn subscribe(&self, object_name: &str, ids: &[i64]) {
        self.inner.subscribe(object_name, ids);
    }

    pub fn unsubscribe(&self, object_name: &str, ids: &[i64]) {
        self.inner.unsubscribe(object_name, ids);
    }

    pub fn unsubscribe_all(&self, object_name: &str) {
        self.inner.unsubscribe_all(object_name);
    }

    pub fn subscriptions(&self, object_name: &str) -> Vec<i64> {
        self.inner.subscriptions(object_name)
    }

    pub fn all_subscriptions(&self) -> std::collections::HashMap<String, Vec<i64>> {
        self.inner.all_subscriptions()
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.subscription_count()
    }

    /// Drive one round immediately, outside the scheduler.
    pub fn poll_once(&self) {
        self.inner.poll_once();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fingerprint_uses_value_and_error() {
        let client = Arc::new(Client::new("http://localhost:9"));
        let fetcher = SensorFetcher::new(client);
        let sensor = SensorValue {
            id: 5,
            name: "s".into(),
            value: 42,
            error: json!(""),
            tv_sec: 0,
            tv_nsec: 0,
        };
        assert_eq!(fetcher.item_id(&sensor), 5);
        assert_eq!(fetcher.value_fingerprint(&sensor), "42|0");

        let errored = SensorValue { error: json!(7), ..sensor };
        assert_eq!(fetcher.value_fingerprint(&errored), "42|7");
    }
}
