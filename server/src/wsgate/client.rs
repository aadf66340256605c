// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message as WsMessage, WebSocket};
use url::Url;

use super::{derive_ws_url, Response, SensorData};
use crate::context::{sleep_with_cancel, CancelToken};
use crate::error::{Error, Result};
use tracing::{debug, info, warn};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(30);
// Poll granularity of the read loop; lets writers interleave and
// cancellation land without a read deadline on the protocol itself.
const READ_POLL: Duration = Duration::from_millis(200);

pub type DataCallback = Arc<dyn Fn(Vec<SensorData>) + Send + Sync>;
pub type DisconnectCallback = Arc<dyn Fn(&Error) + Send + Sync>;

type Socket = WebSocket<MaybeTlsStream<TcpStream>>;

struct ConnState {
    socket: Option<Arc<Mutex<Socket>>>,
    connected: bool,
    reconnect_interval: Duration,
}

/// WebSocket client for one gateway endpoint.
pub struct Client {
    base_url: String,
    ws_url: String,
    state: Mutex<ConnState>,
    // Union of everything callers asked for, replayed after reconnect.
    pending_subs: Mutex<BTreeSet<String>>,
    on_data: Mutex<Option<DataCallback>>,
    on_disconnect: Mutex<Option<DisconnectCallback>>,
    token: Mutex<Option<CancelToken>>,
}

impl Client {
    pub fn new(base_url: &str) -> Arc<Client> {
        Arc::new(Client {
            base_url: base_url.to_string(),
            ws_url: derive_ws_url(base_url),
            state: Mutex::new(ConnState {
                socket: None,
                connected: false,
                reconnect_interval: RECONNECT_BASE,
            }),
            pending_subs: Mutex::new(BTreeSet::new()),
            on_data: Mutex::new(None),
            on_disconnect: Mutex::new(None),
            token: Mutex::new(None),
        })
    }

    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn set_on_data(&self, callback: DataCallback) {
        *self.on_data.lock().unwrap() = Some(callback);
    }

    pub fn set_on_disconnect(&self, callback: DisconnectCallback) {
        *self.on_disconnect.lock().unwrap() = Some(callback);
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }

    /// Connect and start the read loop. Idempotent while connected.
    pub fn connect(self: &Arc<Self>, token: &CancelToken) -> Result<()> {
        *self.token.lock().unwrap() = Some(token.child());
        self.establish()
    }

    fn establish(self: &Arc<Self>) -> Result<()> {
        {
            let state = self.state.lock().unwrap();
            if state.connected {
                return Ok(());
            }
        }

        info!(url = %self.ws_url, "connecting to sensor gateway");
        let socket = dial(&self.ws_url)?;
        let socket = Arc::new(Mutex::new(socket));

        {
            let mut state = self.state.lock().unwrap();
            state.socket = Some(Arc::clone(&socket));
            state.connected = true;
            state.reconnect_interval = RECONNECT_BASE;
        }
        info!(url = %self.ws_url, "connected to sensor gateway");

        let read_token = self
            .token
            .lock()
            .unwrap()
            .as_ref()
            .map(|t| t.child())
            .unwrap_or_default();
        let client = Arc::clone(self);
        thread::spawn(move || client.read_loop(socket, read_token));

        self.resubscribe();
        Ok(())
    }

    pub fn close(&self) {
        if let Some(token) = self.token.lock().unwrap().take() {
            token.cancel();
        }
        let mut state = self.state.lock().unwrap();
        state.socket = None;
        state.connected = false;
    }

    /// `ask:` command. Membership is remembered for reconnect replay.
    pub fn subscribe(&self, sensors: &[String]) -> Result<()> {
        if sensors.is_empty() {
            return Ok(());
        }
        {
            let mut subs = self.pending_subs.lock().unwrap();
            for s in sensors {
                subs.insert(s.clone());
            }
        }
        self.send_command(&format!("ask:{}", sensors.join(",")))
    }

    /// `del:` command. Membership shrinks before the send so a replay
    /// after reconnect reflects the correct set.
    pub fn unsubscribe(&self, sensors: &[String]) -> Result<()> {
        if sensors.is_empty() {
            return Ok(());
        }
        {
            let mut subs = self.pending_subs.lock().unwrap();
            for s in sensors {
                subs.remove(s);
            }
        }
        self.send_command(&format!("del:{}", sensors.join(",")))
    }

    /// `get:` command, a one-shot fetch of current values.
    pub fn get(&self, sensors: &[String]) -> Result<()> {
        if sensors.is_empty() {
            return Ok(());
        }
        self.send_command(&format!("get:{}", sensors.join(",")))
    }

    /// `set:` command. The gateway ignores writes to read-only sensors.
    pub fn set(&self, values: &BTreeMap<String, i64>) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        let parts: Vec<String> = values.iter().map(|(k, v)| format!("{k}={v}")).collect();
        self.send_command(&format!("set:{}", parts.join(",")))
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.pending_subs.lock().unwrap().iter().cloned().collect()
    }

    fn send_command(&self, cmd: &str) -> Result<()> {
        let socket = {
            let state = self.state.lock().unwrap();
            match &state.socket {
                Some(socket) if state.connected => Arc::clone(socket),
                _ => return Err(Error::Transport("not connected to sensor gateway".into())),
            }
        };
        debug!(cmd, "sending gateway command");
        let mut socket = socket.lock().unwrap();
        socket
            .send(WsMessage::Text(cmd.to_string()))
            .map_err(|e| Error::Transport(format!("gateway write failed: {e}")))
    }

    fn read_loop(self: Arc<Self>, socket: Arc<Mutex<Socket>>, token: CancelToken) {
        loop {
            if token.done() {
                return;
            }

            let result = {
                let mut socket = socket.lock().unwrap();
                socket.read()
            };

            match result {
                Ok(WsMessage::Text(text)) => self.handle_message(&text),
                Ok(WsMessage::Binary(_)) | Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_))
                | Ok(WsMessage::Frame(_)) => {}
                Ok(WsMessage::Close(_)) => {
                    self.handle_disconnect(Error::Transport("gateway closed connection".into()));
                    return;
                }
                Err(tungstenite::Error::Io(err))
                    if err.kind() == std::io::ErrorKind::WouldBlock
                        || err.kind() == std::io::ErrorKind::TimedOut =>
                {
                    // the read itself paces the loop; yield the socket lock
                    // briefly so writers get a turn
                    thread::sleep(Duration::from_millis(5));
                }
                Err(err) => {
                    if token.done() {
                        return;
                    }
                    self.handle_disconnect(Error::Transport(format!("gateway read failed: {err}")));
                    return;
                }
            }
        }
    }

    fn handle_message(&self, text: &str) {
        let resp: Response = match serde_json::from_str(text) {
            Ok(resp) => resp,
            Err(err) => {
                warn!(error = %err, "failed to parse gateway frame");
                return;
            }
        };

        let data: Vec<SensorData> = resp.data.into_iter().filter(|d| d.kind != "Ping").collect();
        if data.is_empty() {
            return;
        }

        let callback = self.on_data.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(data);
        }
    }

    fn handle_disconnect(self: &Arc<Self>, err: Error) {
        {
            let mut state = self.state.lock().unwrap();
            state.socket = None;
            state.connected = false;
        }
        warn!(error = %err, "disconnected from sensor gateway");

        let callback = self.on_disconnect.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(&err);
        }

        let token = match self.token.lock().unwrap().as_ref() {
            Some(token) if !token.done() => token.child(),
            _ => return,
        };
        let client = Arc::clone(self);
        thread::spawn(move || client.reconnect_loop(token));
    }

    fn reconnect_loop(self: Arc<Self>, token: CancelToken) {
        loop {
            let interval = self.state.lock().unwrap().reconnect_interval;
            if !sleep_with_cancel(&token, interval) {
                return;
            }

            info!(interval_ms = interval.as_millis() as u64, "attempting gateway reconnect");
            match self.establish() {
                Ok(()) => return,
                Err(err) => {
                    warn!(error = %err, "gateway reconnect failed");
                    let mut state = self.state.lock().unwrap();
                    state.reconnect_interval = (state.reconnect_interval * 2).min(RECONNECT_MAX);
                }
            }
        }
    }

    /// Replay the whole subscription union as one `ask:` on a fresh
    /// connection. Callers are not notified.
    fn resubscribe(&self) {
        let sensors = self.subscriptions();
        if sensors.is_empty() {
            return;
        }
        info!(count = sensors.len(), "resubscribing to gateway sensors");
        if let Err(err) = self.send_command(&format!("ask:{}", sensors.join(","))) {
            warn!(error = %err, "gateway resubscribe failed");
        }
    }
}

fn dial(ws_url: &str) -> Result<Socket> {
    let parsed =
        Url::parse(ws_url).map_err(|e| Error::Transport(format!("invalid ws url {ws_url}: {e}")))?;

    let socket = match parsed.scheme() {
        "ws" => {
            let host = parsed
                .host_str()
                .ok_or_else(|| Error::Transport(format!("no host in {ws_url}")))?;
            let port = parsed.port().unwrap_or(80);
            let addr = std::net::ToSocketAddrs::to_socket_addrs(&(host, port))
                .map_err(|e| Error::Transport(format!("resolve {host}:{port}: {e}")))?
                .next()
                .ok_or_else(|| Error::Transport(format!("resolve {host}:{port}: no address")))?;
            let stream = TcpStream::connect_timeout(&addr, HANDSHAKE_TIMEOUT)
                .map_err(|e| Error::Transport(format!("connect {host}:{port}: {e}")))?;
            let (socket, _resp) = tungstenite::client(ws_url, MaybeTlsStream::Plain(stream))
                .map_err(|e| Error::Transport(format!("websocket handshake {ws_url}: {e}")))?;
            socket
        }
        _ => {
            // TLS endpoints go through the crate's own connector.
            let (socket, _resp) = tungstenite::connect(ws_url)
                .map_err(|e| Error::Transport(format!("websocket dial {ws_url}: {e}")))?;
            socket
        }
    };

    // the read loop polls; the protocol itself carries no read deadline
    if let MaybeTlsStream::Plain(stream) = socket.get_ref() {
        stream.set_read_timeout(Some(READ_POLL))?;
    }
    Ok(socket)
}
