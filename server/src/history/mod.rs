// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

//! Time-series history keyed by `(server, object, variable)`.
//!
//! Two backends implement the same contract: a volatile in-memory map and a
//! CRC-framed append log that survives restarts. Values round-trip through
//! the store exactly as received (the disk backend serializes them as JSON
//! and parses them back).

mod disk;
mod memory;

pub use disk::DiskStore;
pub use memory::MemoryStore;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::config::DEFAULT_SERVER_ID;
use crate::error::Result;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DataPoint {
    pub timestamp: DateTime<Utc>,
    pub value: JsonValue,
}

#[derive(Debug, Clone, Serialize)]
pub struct VariableHistory {
    #[serde(rename = "server_id")]
    pub server_id: String,
    #[serde(rename = "object_name")]
    pub object_name: String,
    #[serde(rename = "variable_name")]
    pub variable_name: String,
    pub points: Vec<DataPoint>,
}

/// Store contract. Appends are in arrival order; per-key timestamps are
/// non-decreasing because each key has a single writing poller.
pub trait HistoryStore: Send + Sync {
    fn save(
        &self,
        server_id: &str,
        object_name: &str,
        variable_name: &str,
        value: JsonValue,
        timestamp: DateTime<Utc>,
    ) -> Result<()>;

    /// Points within `[from, to]` inclusive.
    fn history(
        &self,
        server_id: &str,
        object_name: &str,
        variable_name: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<VariableHistory>;

    /// The last `count` points in order.
    fn latest(
        &self,
        server_id: &str,
        object_name: &str,
        variable_name: &str,
        count: usize,
    ) -> Result<VariableHistory>;

    /// Drop every point with a timestamp at or before `older_than`.
    fn cleanup(&self, older_than: DateTime<Utc>) -> Result<()>;

    fn close(&self) -> Result<()>;
}

pub(crate) fn canonical_server(server_id: &str) -> &str {
    if server_id.is_empty() {
        DEFAULT_SERVER_ID
    } else {
        server_id
    }
}

pub(crate) fn make_key(server_id: &str, object_name: &str, variable_name: &str) -> String {
    format!("{}:{}:{}", canonical_server(server_id), object_name, variable_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_canonicalizes_empty_server() {
        assert_eq!(make_key("", "Obj", "var"), "default:Obj:var");
        assert_eq!(make_key("plc1", "Obj", "var"), "plc1:Obj:var");
    }
}
