// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, TimeZone, Utc};
use crc32fast::Hasher;
use serde_json::Value as JsonValue;

use super::{canonical_server, make_key, DataPoint, HistoryStore, VariableHistory};
use crate::error::{Error, Result};

const HISTORY_FILE: &str = "history.log";

/// Disk-backed history: one CRC-framed append log mirrored into memory.
///
/// Record layout, little-endian:
/// `u64 unix-nanos | u16+bytes server | u16+bytes object | u16+bytes variable |
/// u32+bytes value-json | u32 crc32(everything before)`.
/// A partial or corrupt tail is truncated on open so appends stay aligned.
pub struct DiskStore {
    inner: Mutex<Inner>,
}

struct Inner {
    file: File,
    data: HashMap<String, Vec<DataPoint>>,
}

impl DiskStore {
    pub fn open(dir: &Path) -> Result<DiskStore> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(HISTORY_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;

        let mut data: HashMap<String, Vec<DataPoint>> = HashMap::new();
        file.seek(SeekFrom::Start(0))?;
        loop {
            let start = file.stream_position()?;
            match read_record(&mut file) {
                Ok((key, point)) => data.entry(key).or_default().push(point),
                Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                    file.set_len(start)?;
                    break;
                }
                Err(Error::Internal(_)) | Err(Error::InvalidInput(_)) => {
                    // crc mismatch or undecodable value: truncate the tail
                    file.set_len(start)?;
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        file.seek(SeekFrom::End(0))?;

        Ok(DiskStore {
            inner: Mutex::new(Inner { file, data }),
        })
    }

    fn rewrite(inner: &mut Inner) -> Result<()> {
        inner.file.set_len(0)?;
        inner.file.seek(SeekFrom::Start(0))?;
        let mut buf = Vec::new();
        for (key, points) in inner.data.iter() {
            let (server, object, variable) = split_key(key)?;
            for point in points {
                buf.clear();
                encode_record(&mut buf, server, object, variable, point)?;
                inner.file.write_all(&buf)?;
            }
        }
        inner.file.flush()?;
        Ok(())
    }
}

impl HistoryStore for DiskStore {
    fn save(
        &self,
        server_id: &str,
        object_name: &str,
        variable_name: &str,
        value: JsonValue,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        let key = make_key(server_id, object_name, variable_name);
        let point = DataPoint { timestamp, value };

        let mut inner = self.inner.lock().unwrap();
        let mut buf = Vec::new();
        encode_record(
            &mut buf,
            canonical_server(server_id),
            object_name,
            variable_name,
            &point,
        )?;
        inner.file.write_all(&buf)?;
        inner.file.flush()?;
        inner.data.entry(key).or_default().push(point);
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
        let inner = self.inner.lock().unwrap();
        let points = inner
            .data
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
        let inner = self.inner.lock().unwrap();
        let points = inner
            .data
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
        let mut inner = self.inner.lock().unwrap();
        let before: usize = inner.data.values().map(Vec::len).sum();
        inner.data.retain(|_, points| {
            points.retain(|p| p.timestamp > older_than);
            !points.is_empty()
        });
        let after: usize = inner.data.values().map(Vec::len).sum();
        if after != before {
            Self::rewrite(&mut inner)?;
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.file.flush()?;
        Ok(())
    }
}

fn encode_record(
    buf: &mut Vec<u8>,
    server: &str,
    object: &str,
    variable: &str,
    point: &DataPoint,
) -> Result<()> {
    let nanos = point
        .timestamp
        .timestamp_nanos_opt()
        .ok_or_else(|| Error::Internal("timestamp out of range".into()))?;
    let value_json = serde_json::to_vec(&point.value)?;

    buf.write_i64::<LittleEndian>(nanos)?;
    write_str(buf, server)?;
    write_str(buf, object)?;
    write_str(buf, variable)?;
    buf.write_u32::<LittleEndian>(value_json.len() as u32)?;
    buf.extend_from_slice(&value_json);

    let mut hasher = Hasher::new();
    hasher.update(buf);
    let crc = hasher.finalize();
    buf.write_u32::<LittleEndian>(crc)?;
    Ok(())
}

fn read_record(file: &mut File) -> Result<(String, DataPoint)> {
    let mut raw = Vec::new();

    let nanos = file.read_i64::<LittleEndian>()?;
    raw.write_i64::<LittleEndian>(nanos)?;
    let server = read_str(file, &mut raw)?;
    let object = read_str(file, &mut raw)?;
    let variable = read_str(file, &mut raw)?;
    let value_len = file.read_u32::<LittleEndian>()? as usize;
    raw.write_u32::<LittleEndian>(value_len as u32)?;
    let mut value_json = vec![0u8; value_len];
    file.read_exact(&mut value_json)?;
    raw.extend_from_slice(&value_json);
    let crc = file.read_u32::<LittleEndian>()?;

    let mut hasher = Hasher::new();
    hasher.update(&raw);
    if crc != hasher.finalize() {
        return Err(Error::Internal("history record crc mismatch".into()));
    }

    let value: JsonValue = serde_json::from_slice(&value_json)?;
    let timestamp = Utc.timestamp_nanos(nanos);
    Ok((
        make_key(&server, &object, &variable),
        DataPoint { timestamp, value },
    ))
}

fn write_str(buf: &mut Vec<u8>, s: &str) -> Result<()> {
    if s.len() > u16::MAX as usize {
        return Err(Error::InvalidInput("history key component too long".into()));
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
    String::from_utf8(bytes).map_err(|_| Error::Internal("invalid utf8 in history key".into()))
}

fn split_key(key: &str) -> Result<(&str, &str, &str)> {
    let mut parts = key.splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(s), Some(o), Some(v)) => Ok((s, o, v)),
        _ => Err(Error::Internal(format!("malformed history key {key:?}"))),
    }
}
