// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

use crate::error::{Error, Result};

/// Canonical id used wherever a server entry carries no explicit id.
pub const DEFAULT_SERVER_ID: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Memory,
    Disk,
}

impl std::str::FromStr for StorageKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "memory" => Ok(StorageKind::Memory),
            "disk" => Ok(StorageKind::Disk),
            other => Err(format!("unknown storage kind {other:?} (memory|disk)")),
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "upanel-server", about = "UniSet2 aggregation and SSE fan-out service")]
pub struct Args {
    /// Default upstream UniSet2 HTTP API URL
    #[arg(long = "uniset-url", default_value = "http://localhost:8080")]
    pub uniset_url: String,

    /// Web server listen port
    #[arg(long, default_value_t = 8000)]
    pub port: u16,

    /// Base scheduler period, seconds
    #[arg(long = "poll-interval", default_value_t = 5)]
    pub poll_interval_secs: u64,

    /// History storage backend
    #[arg(long, default_value = "memory")]
    pub storage: StorageKind,

    /// Data directory for the disk storage backend
    #[arg(long = "data-dir", default_value = "./data")]
    pub data_dir: PathBuf,

    /// History retention, seconds
    #[arg(long = "history-ttl", default_value_t = 3600)]
    pub history_ttl_secs: u64,

    /// YAML file with the upstream server list (overrides --uniset-url)
    #[arg(long = "servers-file")]
    pub servers_file: Option<PathBuf>,

    /// XML sensor catalog file
    #[arg(long = "sensors-file")]
    pub sensors_file: Option<PathBuf>,

    /// Valid control token (repeatable); empty set disables control
    #[arg(long = "control-token")]
    pub control_tokens: Vec<String>,

    /// Control inactivity timeout, seconds
    #[arg(long = "control-timeout", default_value_t = 60)]
    pub control_timeout_secs: u64,

    /// Log output format
    #[arg(long = "log-format", default_value = "text")]
    pub log_format: String,

    /// Log level filter (error|warn|info|debug|trace)
    #[arg(long = "log-level", default_value = "info")]
    pub log_level: String,

    /// Directory for the recording capture log
    #[arg(long = "recording-dir", default_value = "./recording")]
    pub recording_dir: PathBuf,

    /// Record cap for the recording backend
    #[arg(long = "recording-max-records", default_value_t = 1_000_000)]
    pub recording_max_records: u64,
}

impl Args {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn history_ttl(&self) -> Duration {
        Duration::from_secs(self.history_ttl_secs.max(1))
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_secs(self.control_timeout_secs.max(1))
    }
}

/// One configured upstream. An empty id canonicalizes to [`DEFAULT_SERVER_ID`]
/// everywhere in keying.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerEntry {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub url: String,
}

impl ServerEntry {
    pub fn canonical_id(&self) -> &str {
        if self.id.is_empty() {
            DEFAULT_SERVER_ID
        } else {
            &self.id
        }
    }

    /// Display name falls back to the URL.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.url
        } else {
            &self.name
        }
    }
}

#[derive(Debug, Deserialize)]
struct ServersFile {
    servers: Vec<ServerEntry>,
}

/// Load the upstream list from a YAML file. Every entry must carry a URL.
pub fn load_servers(path: &std::path::Path) -> Result<Vec<ServerEntry>> {
    let data = std::fs::read_to_string(path)?;
    parse_servers(&data)
}

pub fn parse_servers(data: &str) -> Result<Vec<ServerEntry>> {
    let file: ServersFile = serde_yaml::from_str(data)
        .map_err(|e| Error::InvalidInput(format!("parse servers yaml: {e}")))?;
    for (i, srv) in file.servers.iter().enumerate() {
        if srv.url.is_empty() {
            return Err(Error::InvalidInput(format!("server at index {i} has no url")));
        }
    }
    Ok(file.servers)
}
