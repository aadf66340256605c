// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

//! Optional durable capture: mirrors every change event into a bounded
//! append log with CSV/JSON/raw export. Pluggable backend so other stores
//! can replace the log file.

mod export;
mod logfile;

pub use export::{export_csv, export_json};
pub use logfile::LogBackend;

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use crate::error::{Error, Result};

/// One captured data point.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DataRecord {
    #[serde(rename = "serverId")]
    pub server_id: String,
    #[serde(rename = "objectName")]
    pub object_name: String,
    #[serde(rename = "variableName")]
    pub variable_name: String,
    pub value: JsonValue,
    pub timestamp: DateTime<Utc>,
}

/// Filter for history reads and exports; `None`/empty means unbounded.
#[derive(Debug, Clone, Default)]
pub struct ExportFilter {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub server_id: String,
    pub object_name: String,
}

impl ExportFilter {
    pub fn matches(&self, record: &DataRecord) -> bool {
        if let Some(from) = self.from {
            if record.timestamp < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if record.timestamp > to {
                return false;
            }
        }
        if !self.server_id.is_empty() && record.server_id != self.server_id {
            return false;
        }
        if !self.object_name.is_empty() && record.object_name != self.object_name {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Stats {
    #[serde(rename = "recordCount")]
    pub record_count: u64,
    #[serde(rename = "sizeBytes")]
    pub size_bytes: u64,
    #[serde(rename = "oldestRecord", skip_serializing_if = "Option::is_none")]
    pub oldest_record: Option<DateTime<Utc>>,
    #[serde(rename = "newestRecord", skip_serializing_if = "Option::is_none")]
    pub newest_record: Option<DateTime<Utc>>,
    #[serde(rename = "isRecording")]
    pub is_recording: bool,
}

/// Server metadata kept alongside the captured data for reference.
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct ServerInfo {
    #[serde(rename = "serverId")]
    pub server_id: String,
    pub name: String,
    pub url: String,
    #[serde(rename = "updatedAt", default, skip_serializing_if = "String::is_empty")]
    pub updated_at: String,
}

/// Storage backend contract for the capture pipeline.
pub trait Backend: Send + Sync {
    fn open(&self) -> Result<()>;
    fn close(&self) -> Result<()>;
    fn save(&self, record: DataRecord) -> Result<()>;
    fn save_batch(&self, records: Vec<DataRecord>) -> Result<()>;
    fn get_history(&self, filter: &ExportFilter) -> Result<Vec<DataRecord>>;
    fn stats(&self) -> Result<Stats>;
    /// Drop oldest records beyond `max_records`.
    fn cleanup(&self, max_records: u64) -> Result<()>;
    fn clear(&self) -> Result<()>;
    /// Raw backend bytes (the log file itself). Backends without a raw
    /// representation return [`Error::Unavailable`].
    fn export_raw(&self, w: &mut dyn Write) -> Result<()>;
    fn save_server(&self, info: ServerInfo) -> Result<()>;
    fn servers(&self) -> Result<Vec<ServerInfo>>;
}

const CLEANUP_PERIOD: std::time::Duration = std::time::Duration::from_secs(60);

/// Gates a backend behind an on/off switch and a periodic size cap.
pub struct Manager {
    backend: Box<dyn Backend>,
    max_records: u64,
    enabled: AtomicBool,
    backend_open: AtomicBool,
    last_cleanup: Mutex<Instant>,
}

impl Manager {
    pub fn new(backend: Box<dyn Backend>, max_records: u64) -> Manager {
        Manager {
            backend,
            max_records,
            enabled: AtomicBool::new(false),
            backend_open: AtomicBool::new(false),
            last_cleanup: Mutex::new(Instant::now()),
        }
    }

    /// Begin recording; idempotent.
    pub fn start(&self) -> Result<()> {
        if self.enabled.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.backend.open()?;
        self.backend_open.store(true, Ordering::SeqCst);
        self.enabled.store(true, Ordering::SeqCst);
        info!("recording started");
        Ok(())
    }

    /// Stop recording; idempotent.
    pub fn stop(&self) -> Result<()> {
        if !self.enabled.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.enabled.store(false, Ordering::SeqCst);
        self.backend_open.store(false, Ordering::SeqCst);
        self.backend.close()?;
        info!("recording stopped");
        Ok(())
    }

    pub fn is_recording(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Capture one point when enabled; silently a no-op otherwise.
    pub fn save(
        &self,
        server_id: &str,
        object_name: &str,
        variable_name: &str,
        value: JsonValue,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        if !self.is_recording() {
            return Ok(());
        }

        self.backend.save(DataRecord {
            server_id: crate::history::canonical_server(server_id).to_string(),
            object_name: object_name.to_string(),
            variable_name: variable_name.to_string(),
            value,
            timestamp,
        })?;

        let due = {
            let mut last = self.last_cleanup.lock().unwrap();
            if last.elapsed() > CLEANUP_PERIOD {
                *last = Instant::now();
                true
            } else {
                false
            }
        };
        if due {
            if let Err(err) = self.backend.cleanup(self.max_records) {
                warn!(error = %err, "recording cleanup failed");
            }
        }
        Ok(())
    }

    pub fn save_batch(&self, records: Vec<DataRecord>) -> Result<()> {
        if !self.is_recording() {
            return Ok(());
        }
        self.backend.save_batch(records)
    }

    pub fn stats(&self) -> Result<Stats> {
        let open = self.backend_open.load(Ordering::SeqCst);
        if !open {
            // open transiently; a missing backend yields empty stats
            if self.backend.open().is_err() {
                return Ok(Stats {
                    is_recording: false,
                    ..Stats::default()
                });
            }
        }
        let result = self.backend.stats();
        if !open {
            let _ = self.backend.close();
        }
        let mut stats = result?;
        stats.is_recording = self.is_recording();
        Ok(stats)
    }

    pub fn get_history(&self, filter: &ExportFilter) -> Result<Vec<DataRecord>> {
        self.with_open(|backend| backend.get_history(filter))
    }

    pub fn clear(&self) -> Result<()> {
        self.with_open(|backend| backend.clear())
    }

    pub fn export_csv(&self, filter: &ExportFilter, w: &mut dyn Write) -> Result<()> {
        let records = self.get_history(filter)?;
        export_csv(w, &records)
    }

    pub fn export_json(&self, filter: &ExportFilter, w: &mut dyn Write) -> Result<()> {
        let records = self.get_history(filter)?;
        export_json(w, &records)
    }

    pub fn export_raw(&self, w: &mut dyn Write) -> Result<()> {
        self.with_open(|backend| backend.export_raw(w))
    }

    pub fn save_server(&self, info: ServerInfo) -> Result<()> {
        self.with_open(|backend| backend.save_server(info))
    }

    pub fn servers(&self) -> Result<Vec<ServerInfo>> {
        self.with_open(|backend| backend.servers())
    }

    pub fn close(&self) -> Result<()> {
        self.stop()
    }

    fn with_open<R>(&self, f: impl FnOnce(&dyn Backend) -> Result<R>) -> Result<R> {
        let open = self.backend_open.load(Ordering::SeqCst);
        if !open {
            self.backend.open()?;
        }
        let result = f(self.backend.as_ref());
        if !open {
            let _ = self.backend.close();
        }
        result
    }
}

/// Raw export marker for backends without a file representation.
pub fn export_not_supported() -> Error {
    Error::Unavailable("raw export not supported by this backend".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn record(variable: &str, value: i64, ts: DateTime<Utc>) -> DataRecord {
        DataRecord {
            server_id: "default".into(),
            object_name: "TestProc".into(),
            variable_name: variable.into(),
            value: json!(value),
            timestamp: ts,
        }
    }

    #[test]
    fn filter_matching() {
        let now = Utc::now();
        let rec = record("v", 1, now);

        assert!(ExportFilter::default().matches(&rec));
        assert!(ExportFilter {
            server_id: "default".into(),
            object_name: "TestProc".into(),
            ..Default::default()
        }
        .matches(&rec));
        assert!(!ExportFilter {
            server_id: "other".into(),
            ..Default::default()
        }
        .matches(&rec));
        assert!(!ExportFilter {
            from: Some(now + chrono::TimeDelta::seconds(1)),
            ..Default::default()
        }
        .matches(&rec));
        assert!(!ExportFilter {
            to: Some(now - chrono::TimeDelta::seconds(1)),
            ..Default::default()
        }
        .matches(&rec));
    }

    #[test]
    fn manager_gates_recording() {
        let dir = tempdir().expect("tempdir");
        let manager = Manager::new(Box::new(LogBackend::new(dir.path())), 100);
        let now = Utc::now();

        // not recording: save is a no-op
        manager.save("", "Obj", "v", json!(1), now).unwrap();
        assert_eq!(manager.stats().unwrap().record_count, 0);

        manager.start().unwrap();
        manager.start().unwrap();
        assert!(manager.is_recording());
        manager.save("", "Obj", "v", json!(2), now).unwrap();
        let stats = manager.stats().unwrap();
        assert_eq!(stats.record_count, 1);
        assert!(stats.is_recording);

        manager.stop().unwrap();
        manager.stop().unwrap();
        assert!(!manager.is_recording());

        // history still readable while stopped
        let records = manager.get_history(&ExportFilter::default()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].server_id, "default");
    }

    #[test]
    fn batch_save_and_filtered_history() {
        let dir = tempdir().expect("tempdir");
        let manager = Manager::new(Box::new(LogBackend::new(dir.path())), 100);
        manager.start().unwrap();

        let base = Utc::now();
        manager
            .save_batch(vec![
                record("a", 1, base),
                record("b", 2, base + chrono::TimeDelta::seconds(10)),
            ])
            .unwrap();

        let all = manager.get_history(&ExportFilter::default()).unwrap();
        assert_eq!(all.len(), 2);

        let late = manager
            .get_history(&ExportFilter {
                from: Some(base + chrono::TimeDelta::seconds(5)),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(late.len(), 1);
        assert_eq!(late[0].variable_name, "b");
    }
}
