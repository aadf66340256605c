// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

use std::io::Write;

use chrono::{SecondsFormat, Utc};
use serde_json::json;

use super::DataRecord;
use crate::error::Result;

/// Write records as CSV with a header row. Timestamps are RFC3339 with
/// nanosecond precision.
pub fn export_csv(w: &mut dyn Write, records: &[DataRecord]) -> Result<()> {
    writeln!(w, "timestamp,server_id,object_name,variable_name,value")?;
    for record in records {
        let value = match &record.value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        writeln!(
            w,
            "{},{},{},{},{}",
            csv_field(&record.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true)),
            csv_field(&record.server_id),
            csv_field(&record.object_name),
            csv_field(&record.variable_name),
            csv_field(&value),
        )?;
    }
    Ok(())
}

/// Write records as a JSON document with export metadata.
pub fn export_json(w: &mut dyn Write, records: &[DataRecord]) -> Result<()> {
    let export = json!({
        "exportedAt": Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
        "count": records.len(),
        "records": records,
    });
    serde_json::to_writer_pretty(&mut *w, &export)?;
    writeln!(w)?;
    Ok(())
}

fn csv_field(s: &str) -> String {
    if s.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}
