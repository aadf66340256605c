// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use super::{canonical_server, make_key, DataPoint, HistoryStore, VariableHistory};
use crate::error::Result;

/// Volatile history backend.
#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<HashMap<String, Vec<DataPoint>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HistoryStore for MemoryStore {
    fn save(
        &self,
        server_id: &str,
        object_name: &str,
        variable_name: &str,
        value: JsonValue,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        let key = make_key(server_id, object_name, variable_name);
        let mut data = self.data.write().unwrap();
        data.entry(key).or_default().push(DataPoint { timestamp, value });
        Ok(())
    }

    fn history(
        &self,
        server_id: &str,
        object_name: &str,
        variable_name: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<VariableHistory> {
        let key = make_key(server_id, object_name, variable_name);
        let data = self.data.read().unwrap();
        let points = data
            .get(&key)
            .map(|points| {
                points
                    .iter()
                    .filter(|p| p.timestamp >= from && p.timestamp <= to)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(VariableHistory {
            server_id: canonical_server(server_id).to_string(),
            object_name: object_name.to_string(),
            variable_name: variable_name.to_string(),
            points,
        })
    }

    fn latest(
        &self,
        server_id: &str,
        object_name: &str,
        variable_name: &str,
        count: usize,
    ) -> Result<VariableHistory> {
        let key = make_key(server_id, object_name, variable_name);
        let data = self.data.read().unwrap();
        let points = data
            .get(&key)
            .map(|points| {
                let start = points.len().saturating_sub(count);
                points[start..].to_vec()
            })
            .unwrap_or_default();
        Ok(VariableHistory {
            server_id: canonical_server(server_id).to_string(),
            object_name: object_name.to_string(),
            variable_name: variable_name.to_string(),
            points,
        })
    }

    fn cleanup(&self, older_than: DateTime<Utc>) -> Result<()> {
        let mut data = self.data.write().unwrap();
        data.retain(|_, points| {
            points.retain(|p| p.timestamp > older_than);
            !points.is_empty()
        });
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}
