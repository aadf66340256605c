// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::protocol::{level, Command, Message};
use crate::context::{sleep_with_cancel, CancelToken};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub reconnect_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3333,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(6),
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub host: String,
    pub port: u16,
    #[serde(rename = "lastError", skip_serializing_if = "String::is_empty")]
    pub last_error: String,
    #[serde(rename = "reconnectCount")]
    pub reconnect_count: u64,
}

struct ConnState {
    conn: Option<TcpStream>,
    connected: bool,
    last_error: String,
    reconnect_count: u64,
}

/// TCP client for a remote UniSet2 log collector.
///
/// Commands are 131-byte packed frames; the log stream itself is
/// newline-delimited UTF-8. Read timeouts are absorbed so an idle stream
/// keeps the connection; any other read error closes it.
pub struct Client {
    config: ClientConfig,
    state: Mutex<ConnState>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Client {
        Client {
            config,
            state: Mutex::new(ConnState {
                conn: None,
                connected: false,
                last_error: String::new(),
                reconnect_count: 0,
            }),
        }
    }

    pub fn connect(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.connected && state.conn.is_some() {
            return Ok(());
        }

        let target = format!("{}:{}", self.config.host, self.config.port);
        let addr = target
            .to_socket_addrs()
            .map_err(|e| Error::Transport(format!("resolve {target}: {e}")))?
            .next()
            .ok_or_else(|| Error::Transport(format!("resolve {target}: no address")))?;

        debug!(addr = %target, "connecting to log server");
        let conn = TcpStream::connect_timeout(&addr, self.config.connect_timeout).map_err(|e| {
            state.last_error = e.to_string();
            Error::Transport(format!("connect to {target}: {e}"))
        })?;
        conn.set_read_timeout(Some(self.config.read_timeout))?;
        conn.set_write_timeout(Some(self.config.write_timeout))?;

        state.conn = Some(conn);
        state.connected = true;
        state.last_error.clear();
        info!(addr = %target, "connected to log server");
        Ok(())
    }

    pub fn disconnect(&self) {
        let mut state = self.state.lock().unwrap();
        if let Some(conn) = state.conn.take() {
            let _ = conn.shutdown(std::net::Shutdown::Both);
        }
        state.connected = false;
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }

    pub fn status(&self) -> ConnectionStatus {
        let state = self.state.lock().unwrap();
        ConnectionStatus {
            connected: state.connected,
            host: self.config.host.clone(),
            port: self.config.port,
            last_error: state.last_error.clone(),
            reconnect_count: state.reconnect_count,
        }
    }

    pub fn send_command(&self, cmd: Command, data: u32, logname: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let conn = state
            .conn
            .as_mut()
            .ok_or_else(|| Error::Transport("not connected to log server".into()))?;

        let bytes = Message::new(cmd, data, logname).marshal()?;
        if let Err(err) = conn.write_all(&bytes).and_then(|_| conn.flush()) {
            state.last_error = err.to_string();
            return Err(Error::Transport(format!("write command: {err}")));
        }
        debug!(cmd = cmd.as_str(), data, logname, "sent log server command");
        Ok(())
    }

    /// Stream log lines to `callback` until cancellation or a hard read
    /// error. Timeouts keep the loop alive; EOF and other errors mark the
    /// connection broken and return.
    pub fn read_logs(&self, token: &CancelToken, callback: &dyn Fn(&str)) -> Result<()> {
        let conn = {
            let state = self.state.lock().unwrap();
            match &state.conn {
                Some(conn) if state.connected => conn
                    .try_clone()
                    .map_err(|e| Error::Transport(format!("clone stream: {e}")))?,
                _ => return Err(Error::Transport("not connected to log server".into())),
            }
        };

        let mut reader = BufReader::new(conn);
        let mut line = String::new();
        loop {
            if token.done() {
                return Ok(());
            }

            match reader.read_line(&mut line) {
                Ok(0) => {
                    self.mark_broken("stream closed");
                    return Err(Error::Transport("log stream closed".into()));
                }
                Ok(_) => {
                    let trimmed = line.trim_end_matches(['\r', '\n']);
                    if !trimmed.is_empty() {
                        callback(trimmed);
                    }
                    line.clear();
                }
                Err(err)
                    if err.kind() == std::io::ErrorKind::WouldBlock
                        || err.kind() == std::io::ErrorKind::TimedOut =>
                {
                    // idle stream; keep any partial line and try again
                    continue;
                }
                Err(err) => {
                    if token.done() {
                        return Ok(());
                    }
                    self.mark_broken(&err.to_string());
                    return Err(Error::Transport(format!("read logs: {err}")));
                }
            }
        }
    }

    /// Run the read loop forever, reconnecting with a fixed delay. Exits
    /// promptly on cancellation.
    pub fn start_reading_with_reconnect<F>(
        self: &Arc<Client>,
        token: CancelToken,
        callback: F,
    ) -> JoinHandle<()>
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let client = Arc::clone(self);
        thread::spawn(move || {
            loop {
                if token.done() {
                    info!("stopping log reader");
                    return;
                }

                if !client.is_connected() {
                    if let Err(err) = client.connect() {
                        let count = {
                            let mut state = client.state.lock().unwrap();
                            state.reconnect_count += 1;
                            state.reconnect_count
                        };
                        warn!(error = %err, count, "log server reconnect failed, retrying");
                        if !sleep_with_cancel(&token, client.config.reconnect_delay) {
                            return;
                        }
                        continue;
                    }
                }

                if let Err(err) = client.read_logs(&token, &callback) {
                    if token.done() {
                        return;
                    }
                    warn!(error = %err, "log reading stopped, will reconnect");
                    client.disconnect();
                    if !sleep_with_cancel(&token, client.config.reconnect_delay) {
                        return;
                    }
                }
            }
        })
    }

    fn mark_broken(&self, err: &str) {
        let mut state = self.state.lock().unwrap();
        state.last_error = err.to_string();
        state.connected = false;
    }

    pub fn set_filter(&self, pattern: &str) -> Result<()> {
        self.send_command(Command::FilterMode, 0, pattern)
    }

    pub fn set_log_level(&self, mask: u32, logname: &str) -> Result<()> {
        self.send_command(Command::SetLevel, mask, logname)
    }

    pub fn add_log_level(&self, mask: u32, logname: &str) -> Result<()> {
        self.send_command(Command::AddLevel, mask, logname)
    }

    pub fn del_log_level(&self, mask: u32, logname: &str) -> Result<()> {
        self.send_command(Command::DelLevel, mask, logname)
    }

    pub fn request_list(&self, logname: &str) -> Result<()> {
        self.send_command(Command::List, 0, logname)
    }

    pub fn rotate(&self, logname: &str) -> Result<()> {
        self.send_command(Command::Rotate, 0, logname)
    }

    /// Convenience for viewers that want everything.
    pub fn set_any_level(&self, logname: &str) -> Result<()> {
        self.set_log_level(level::ANY, logname)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(conn) = state.conn.take() {
                let _ = conn.shutdown(std::net::Shutdown::Both);
            }
            state.connected = false;
        }
    }
}
