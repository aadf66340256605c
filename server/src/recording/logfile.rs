// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::TimeZone;
use crc32fast::Hasher;
use serde_json::Value as JsonValue;

use super::{Backend, DataRecord, ExportFilter, ServerInfo, Stats};
use crate::error::{Error, Result};

const RECORDS_FILE: &str = "records.log";
const SERVERS_FILE: &str = "servers.json";

struct OpenState {
    file: File,
    records: Vec<DataRecord>,
    servers: HashMap<String, ServerInfo>,
}

/// Append-log backend: one CRC-framed record file plus a JSON sidecar for
/// server metadata. The whole log is mirrored in memory while open; the
/// record cap keeps that bounded.
pub struct LogBackend {
    dir: PathBuf,
    state: Mutex<Option<OpenState>>,
}

impl LogBackend {
    pub fn new(dir: &Path) -> LogBackend {
        LogBackend {
            dir: dir.to_path_buf(),
            state: Mutex::new(None),
        }
    }

    fn records_path(&self) -> PathBuf {
        self.dir.join(RECORDS_FILE)
    }

    fn servers_path(&self) -> PathBuf {
        self.dir.join(SERVERS_FILE)
    }

    fn rewrite(file: &mut File, records: &[DataRecord]) -> Result<()> {
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        let mut buf = Vec::new();
        for record in records {
            buf.clear();
            encode_record(&mut buf, record)?;
            file.write_all(&buf)?;
        }
        file.flush()?;
        Ok(())
    }
}

impl Backend for LogBackend {
    fn open(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.is_some() {
            return Ok(());
        }

        std::fs::create_dir_all(&self.dir)?;
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(self.records_path())?;

        let mut records = Vec::new();
        file.seek(SeekFrom::Start(0))?;
        loop {
            let start = file.stream_position()?;
            match read_record(&mut file) {
                Ok(record) => records.push(record),
                Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                    file.set_len(start)?;
                    break;
                }
                Err(Error::Internal(_)) | Err(Error::InvalidInput(_)) => {
                    file.set_len(start)?;
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        file.seek(SeekFrom::End(0))?;

        let servers = match std::fs::read(self.servers_path()) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => HashMap::new(),
        };

        *state = Some(OpenState {
            file,
            records,
            servers,
        });
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(open) = state.take() {
            let mut file = open.file;
            file.flush()?;
        }
        Ok(())
    }

    fn save(&self, record: DataRecord) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let open = state
            .as_mut()
            .ok_or_else(|| Error::Unavailable("recording backend is closed".into()))?;

        let mut buf = Vec::new();
        encode_record(&mut buf, &record)?;
        open.file.write_all(&buf)?;
        open.file.flush()?;
        open.records.push(record);
        Ok(())
    }

    fn save_batch(&self, records: Vec<DataRecord>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let open = state
            .as_mut()
            .ok_or_else(|| Error::Unavailable("recording backend is closed".into()))?;

        let mut buf = Vec::new();
        for record in &records {
            encode_record(&mut buf, record)?;
        }
        open.file.write_all(&buf)?;
        open.file.flush()?;
        open.records.extend(records);
        Ok(())
    }

    fn get_history(&self, filter: &ExportFilter) -> Result<Vec<DataRecord>> {
        let state = self.state.lock().unwrap();
        let open = state
            .as_ref()
            .ok_or_else(|| Error::Unavailable("recording backend is closed".into()))?;
        Ok(open
            .records
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect())
    }

    fn stats(&self) -> Result<Stats> {
        let state = self.state.lock().unwrap();
        let open = state
            .as_ref()
            .ok_or_else(|| Error::Unavailable("recording backend is closed".into()))?;
        let size_bytes = std::fs::metadata(self.records_path())
            .map(|m| m.len())
            .unwrap_or(0);
        Ok(Stats {
            record_count: open.records.len() as u64,
            size_bytes,
            oldest_record: open.records.first().map(|r| r.timestamp),
            newest_record: open.records.last().map(|r| r.timestamp),
            is_recording: false,
        })
    }

    fn cleanup(&self, max_records: u64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let open = state
            .as_mut()
            .ok_or_else(|| Error::Unavailable("recording backend is closed".into()))?;
        let len = open.records.len() as u64;
        if len <= max_records {
            return Ok(());
        }
        let excess = (len - max_records) as usize;
        open.records.drain(..excess);
        let records = std::mem::take(&mut open.records);
        let result = Self::rewrite(&mut open.file, &records);
        open.records = records;
        result
    }

    fn clear(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let open = state
            .as_mut()
            .ok_or_else(|| Error::Unavailable("recording backend is closed".into()))?;
        open.records.clear();
        open.file.set_len(0)?;
        open.file.seek(SeekFrom::Start(0))?;
        Ok(())
    }

    fn export_raw(&self, w: &mut dyn Write) -> Result<()> {
        let state = self.state.lock().unwrap();
        state
            .as_ref()
            .ok_or_else(|| Error::Unavailable("recording backend is closed".into()))?;
        let mut file = File::open(self.records_path())?;
        std::io::copy(&mut file, w)?;
        Ok(())
    }

    fn save_server(&self, info: ServerInfo) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let open = state
            .as_mut()
            .ok_or_else(|| Error::Unavailable("recording backend is closed".into()))?;
        open.servers.insert(info.server_id.clone(), info);
        let bytes = serde_json::to_vec_pretty(&open.servers)?;
        std::fs::write(self.servers_path(), bytes)?;
        Ok(())
    }

    fn servers(&self) -> Result<Vec<ServerInfo>> {
        let state = self.state.lock().unwrap();
        let open = state
            .as_ref()
            .ok_or_else(|| Error::Unavailable("recording backend is closed".into()))?;
        Ok(open.servers.values().cloned().collect())
    }
}

fn encode_record(buf: &mut Vec<u8>, record: &DataRecord) -> Result<()> {
    let start = buf.len();
    let nanos = record
        .timestamp
        .timestamp_nanos_opt()
        .ok_or_else(|| Error::Internal("timestamp out of range".into()))?;
    let value_json = serde_json::to_vec(&record.value)?;

    buf.write_i64::<LittleEndian>(nanos)?;
    write_str(buf, &record.server_id)?;
    write_str(buf, &record.object_name)?;
    write_str(buf, &record.variable_name)?;
    buf.write_u32::<LittleEndian>(value_json.len() as u32)?;
    buf.extend_from_slice(&value_json);

    let mut hasher = Hasher::new();
    hasher.update(&buf[start..]);
    let crc = hasher.finalize();
    buf.write_u32::<LittleEndian>(crc)?;
    Ok(())
}

fn read_record(file: &mut File) -> Result<DataRecord> {
    let mut raw = Vec::new();

    let nanos = file.read_i64::<LittleEndian>()?;
    raw.write_i64::<LittleEndian>(nanos)?;
    let server_id = read_str(file, &mut raw)?;
    let object_name = read_str(file, &mut raw)?;
    let variable_name = read_str(file, &mut raw)?;
    let value_len = file.read_u32::<LittleEndian>()? as usize;
    raw.write_u32::<LittleEndian>(value_len as u32)?;
    let mut value_json = vec![0u8; value_len];
    file.read_exact(&mut value_json)?;
    raw.extend_from_slice(&value_json);
    let crc = file.read_u32::<LittleEndian>()?;

    let mut hasher = Hasher::new();
    hasher.update(&raw);
    if crc != hasher.finalize() {
        return Err(Error::Internal("recording record crc mismatch".into()));
    }

    let value: JsonValue = serde_json::from_slice(&value_json)?;
    Ok(DataRecord {
        server_id,
        object_name,
        variable_name,
        value,
        timestamp: chrono::Utc.timestamp_nanos(nanos),
    })
}

fn write_str(buf: &mut Vec<u8>, s: &str) -> Result<()> {
    if s.len() > u16::MAX as usize {
        return Err(Error::InvalidInput("record field too long".into()));
    }
    buf.write_u16::<LittleEndian>(s.len() as u16)?;
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

fn read_str(file: &mut File, raw: &mut Vec<u8>) -> Result<String> {
    let len = file.read_u16::<LittleEndian>()? as usize;
    raw.write_u16::<LittleEndian>(len as u16)?;
    let mut bytes = vec![0u8; len];
    file.read_exact(&mut bytes)?;
    raw.extend_from_slice(&bytes);
    String::from_utf8(bytes).map_err(|_| Error::Internal("invalid utf8 in record".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, Utc};
    use serde_json::json;
    use tempfile::tempdir;

    fn record(variable: &str, value: i64, ts: chrono::DateTime<Utc>) -> DataRecord {
        DataRecord {
            server_id: "default".into(),
            object_name: "Obj".into(),
            variable_name: variable.into(),
            value: json!(value),
            timestamp: ts,
        }
    }

    #[test]
    fn records_persist_across_reopen() {
        let dir = tempdir().expect("tempdir");
        let base = Utc::now();

        let backend = LogBackend::new(dir.path());
        backend.open().unwrap();
        backend.save(record("a", 1, base)).unwrap();
        backend.save(record("b", 2, base + TimeDelta::seconds(1))).unwrap();
        backend.close().unwrap();

        backend.open().unwrap();
        let records = backend.get_history(&ExportFilter::default()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].variable_name, "a");
        assert_eq!(records[1].value, json!(2));
    }

    #[test]
    fn cleanup_keeps_newest() {
        let dir = tempdir().expect("tempdir");
        let base = Utc::now();
        let backend = LogBackend::new(dir.path());
        backend.open().unwrap();

        for i in 0..10 {
            backend
                .save(record("v", i, base + TimeDelta::seconds(i)))
                .unwrap();
        }
        backend.cleanup(3).unwrap();

        let records = backend.get_history(&ExportFilter::default()).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].value, json!(7));

        // survives a reopen after the rewrite
        backend.close().unwrap();
        backend.open().unwrap();
        assert_eq!(backend.get_history(&ExportFilter::default()).unwrap().len(), 3);
    }

    #[test]
    fn stats_and_clear() {
        let dir = tempdir().expect("tempdir");
        let base = Utc::now();
        let backend = LogBackend::new(dir.path());
        backend.open().unwrap();
        backend.save(record("v", 1, base)).unwrap();

        let stats = backend.stats().unwrap();
        assert_eq!(stats.record_count, 1);
        assert!(stats.size_bytes > 0);
        assert_eq!(stats.oldest_record.unwrap(), base);

        backend.clear().unwrap();
        assert_eq!(backend.stats().unwrap().record_count, 0);
    }

    #[test]
    fn raw_export_is_the_log_bytes() {
        let dir = tempdir().expect("tempdir");
        let backend = LogBackend::new(dir.path());
        backend.open().unwrap();
        backend.save(record("v", 1, Utc::now())).unwrap();

        let mut out = Vec::new();
        backend.export_raw(&mut out).unwrap();
        let on_disk = std::fs::read(dir.path().join(RECORDS_FILE)).unwrap();
        assert_eq!(out, on_disk);
    }

    #[test]
    fn server_metadata_round_trips() {
        let dir = tempdir().expect("tempdir");
        let backend = LogBackend::new(dir.path());
        backend.open().unwrap();
        backend
            .save_server(ServerInfo {
                server_id: "plc1".into(),
                name: "PLC One".into(),
                url: "http://plc1:8080".into(),
                updated_at: String::new(),
            })
            .unwrap();
        backend.close().unwrap();

        backend.open().unwrap();
        let servers = backend.servers().unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].name, "PLC One");
    }

    #[test]
    fn closed_backend_reports_unavailable() {
        let dir = tempdir().expect("tempdir");
        let backend = LogBackend::new(dir.path());
        let err = backend.save(record("v", 1, Utc::now())).unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)));
    }
}
