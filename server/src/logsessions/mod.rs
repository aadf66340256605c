// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

//! Shares one upstream log-server TCP session per `(server, object)` target
//! across any number of SSE viewers.
//!
//! The first viewer opens the connection and starts the streaming thread;
//! lines flow into a ring buffer (replayed to late joiners) and out through
//! the fan-out hub. When the last viewer detaches the session lingers for a
//! short idle window, then a janitor closes it.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::info;

use crate::context::{sleep_with_cancel, CancelToken};
use crate::error::Result;
use crate::hub::EventHub;
use crate::logserver::{self, ConnectionStatus};

/// Recent lines replayed to a viewer on attach.
pub const RING_CAPACITY: usize = 200;

/// How long a viewerless session stays open.
pub const IDLE_GRACE: Duration = Duration::from_secs(10);

const JANITOR_TICK: Duration = Duration::from_secs(1);

struct ViewerState {
    count: usize,
    idle_since: Option<Instant>,
}

pub struct Session {
    server_id: String,
    object_name: String,
    client: Arc<logserver::Client>,
    token: CancelToken,
    ring: Mutex<VecDeque<String>>,
    viewers: Mutex<ViewerState>,
}

impl Session {
    pub fn status(&self) -> ConnectionStatus {
        self.client.status()
    }

    pub fn recent_lines(&self) -> Vec<String> {
        self.ring.lock().unwrap().iter().cloned().collect()
    }

    fn push_line(&self, line: &str) {
        let mut ring = self.ring.lock().unwrap();
        if ring.len() == RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(line.to_string());
    }

    fn viewer_count(&self) -> usize {
        self.viewers.lock().unwrap().count
    }

    fn idle_for(&self) -> Option<Duration> {
        let viewers = self.viewers.lock().unwrap();
        match viewers.idle_since {
            Some(since) if viewers.count == 0 => Some(since.elapsed()),
            _ => None,
        }
    }

    fn close(&self) {
        self.token.cancel();
        self.client.disconnect();
    }
}

pub struct Manager {
    hub: Arc<EventHub>,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    root: Mutex<Option<CancelToken>>,
    janitor: Mutex<Option<(CancelToken, JoinHandle<()>)>>,
}

impl Manager {
    pub fn new(hub: Arc<EventHub>) -> Arc<Manager> {
        Arc::new(Manager {
            hub,
            sessions: Mutex::new(HashMap::new()),
            root: Mutex::new(None),
            janitor: Mutex::new(None),
        })
    }

    pub fn start(self: &Arc<Self>, parent: &CancelToken) {
        *self.root.lock().unwrap() = Some(parent.child());

        let mut janitor = self.janitor.lock().unwrap();
        if janitor.is_some() {
            return;
        }
        let token = parent.child();
        let manager = Arc::clone(self);
        let loop_token = token.clone();
        let handle = thread::spawn(move || {
            while sleep_with_cancel(&loop_token, JANITOR_TICK) {
                manager.sweep_idle();
            }
        });
        *janitor = Some((token, handle));
    }

    pub fn stop(&self) {
        let taken = self.janitor.lock().unwrap().take();
        if let Some((token, handle)) = taken {
            token.cancel();
            let _ = handle.join();
        }
        let mut sessions = self.sessions.lock().unwrap();
        for session in sessions.values() {
            session.close();
        }
        sessions.clear();
    }

    /// Register a viewer for a target, opening the shared session if this
    /// is its first viewer. Returns the ring buffer for catch-up.
    pub fn attach(
        &self,
        server_id: &str,
        object_name: &str,
        host: &str,
        port: u16,
    ) -> Result<Vec<String>> {
        let key = session_key(server_id, object_name);

        let session = {
            let mut sessions = self.sessions.lock().unwrap();
            match sessions.get(&key) {
                Some(session) => Arc::clone(session),
                None => {
                    let session = self.open_session(server_id, object_name, host, port);
                    sessions.insert(key, Arc::clone(&session));
                    session
                }
            }
        };

        {
            let mut viewers = session.viewers.lock().unwrap();
            viewers.count += 1;
            viewers.idle_since = None;
        }
        Ok(session.recent_lines())
    }

    /// Drop one viewer; the last one opens the idle window.
    pub fn detach(&self, server_id: &str, object_name: &str) {
        let key = session_key(server_id, object_name);
        let sessions = self.sessions.lock().unwrap();
        if let Some(session) = sessions.get(&key) {
            let mut viewers = session.viewers.lock().unwrap();
            viewers.count = viewers.count.saturating_sub(1);
            if viewers.count == 0 {
                viewers.idle_since = Some(Instant::now());
            }
        }
    }

    pub fn session(&self, server_id: &str, object_name: &str) -> Option<Arc<Session>> {
        let sessions = self.sessions.lock().unwrap();
        sessions.get(&session_key(server_id, object_name)).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// Forward a filter change to the shared session. Responses are not
    /// correlated back; the log stream is the observable.
    pub fn set_filter(&self, server_id: &str, object_name: &str, pattern: &str) -> Result<()> {
        match self.session(server_id, object_name) {
            Some(session) => session.client.set_filter(pattern),
            None => Err(no_session(server_id, object_name)),
        }
    }

    pub fn set_level(
        &self,
        server_id: &str,
        object_name: &str,
        mask: u32,
        logname: &str,
    ) -> Result<()> {
        match self.session(server_id, object_name) {
            Some(session) => session.client.set_log_level(mask, logname),
            None => Err(no_session(server_id, object_name)),
        }
    }

    pub fn rotate(&self, server_id: &str, object_name: &str, logname: &str) -> Result<()> {
        match self.session(server_id, object_name) {
            Some(session) => session.client.rotate(logname),
            None => Err(no_session(server_id, object_name)),
        }
    }

    fn open_session(
        &self,
        server_id: &str,
        object_name: &str,
        host: &str,
        port: u16,
    ) -> Arc<Session> {
        let root = self.root.lock().unwrap();
        let token = root.as_ref().map(|t| t.child()).unwrap_or_default();

        let client = Arc::new(logserver::Client::new(logserver::ClientConfig {
            host: host.to_string(),
            port,
            ..logserver::ClientConfig::default()
        }));

        let session = Arc::new(Session {
            server_id: server_id.to_string(),
            object_name: object_name.to_string(),
            client: Arc::clone(&client),
            token: token.clone(),
            ring: Mutex::new(VecDeque::with_capacity(RING_CAPACITY)),
            viewers: Mutex::new(ViewerState {
                count: 0,
                idle_since: None,
            }),
        });

        info!(server = server_id, object = object_name, host, port, "opening log session");

        let hub = Arc::clone(&self.hub);
        let stream_session = Arc::clone(&session);
        let _reader = client.start_reading_with_reconnect(token, move |line| {
            stream_session.push_line(line);
            hub.broadcast_log_line(&stream_session.server_id, &stream_session.object_name, line);
        });

        session
    }

    fn sweep_idle(&self) {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.retain(|_, session| {
            let expired = matches!(session.idle_for(), Some(idle) if idle >= IDLE_GRACE);
            if expired {
                info!(
                    server = %session.server_id,
                    object = %session.object_name,
                    "closing idle log session"
                );
                session.close();
            }
            !expired
        });
    }
}

fn session_key(server_id: &str, object_name: &str) -> String {
    format!(
        "{}|{}",
        crate::history::canonical_server(server_id),
        object_name
    )
}

fn no_session(server_id: &str, object_name: &str) -> crate::error::Error {
    crate::error::Error::NotFound(format!(
        "no log session for {server_id}/{object_name}"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> Arc<Manager> {
        let hub = Arc::new(EventHub::new());
        let mgr = Manager::new(hub);
        *mgr.root.lock().unwrap() = Some(CancelToken::new());
        mgr
    }

    #[test]
    fn attach_shares_one_session_per_target() {
        let mgr = manager();
        // the reader thread will fail to connect and keep retrying; that is
        // fine for bookkeeping checks
        mgr.attach("plc1", "TestProc", "127.0.0.1", 1).unwrap();
        mgr.attach("plc1", "TestProc", "127.0.0.1", 1).unwrap();
        mgr.attach("plc1", "OtherObj", "127.0.0.1", 1).unwrap();

        assert_eq!(mgr.session_count(), 2);
        let session = mgr.session("plc1", "TestProc").unwrap();
        assert_eq!(session.viewer_count(), 2);
        mgr.stop();
    }

    #[test]
    fn detach_opens_idle_window() {
        let mgr = manager();
        mgr.attach("", "Obj", "127.0.0.1", 1).unwrap();
        let session = mgr.session("", "Obj").unwrap();
        assert!(session.idle_for().is_none());

        mgr.detach("", "Obj");
        assert_eq!(session.viewer_count(), 0);
        assert!(session.idle_for().is_some());

        // reattach within the window cancels it
        mgr.attach("", "Obj", "127.0.0.1", 1).unwrap();
        assert!(session.idle_for().is_none());
        mgr.stop();
    }

    #[test]
    fn sweep_closes_only_expired_sessions() {
        let mgr = manager();
        mgr.attach("", "Busy", "127.0.0.1", 1).unwrap();
        mgr.attach("", "Idle", "127.0.0.1", 1).unwrap();
        mgr.detach("", "Idle");

        // not yet expired
        mgr.sweep_idle();
        assert_eq!(mgr.session_count(), 2);

        // force expiry
        {
            let session = mgr.session("", "Idle").unwrap();
            let mut viewers = session.viewers.lock().unwrap();
            viewers.idle_since = Some(Instant::now() - IDLE_GRACE - Duration::from_secs(1));
        }
        mgr.sweep_idle();
        assert_eq!(mgr.session_count(), 1);
        assert!(mgr.session("", "Busy").is_some());
        mgr.stop();
    }

    #[test]
    fn ring_buffer_is_bounded() {
        let mgr = manager();
        mgr.attach("", "Obj", "127.0.0.1", 1).unwrap();
        let session = mgr.session("", "Obj").unwrap();

        for i in 0..(RING_CAPACITY + 50) {
            session.push_line(&format!("line {i}"));
        }
        let lines = session.recent_lines();
        assert_eq!(lines.len(), RING_CAPACITY);
        assert_eq!(lines[0], "line 50");
        mgr.stop();
    }

    #[test]
    fn commands_require_a_session() {
        let mgr = manager();
        assert!(mgr.set_filter("x", "y", "*").is_err());
        assert!(mgr.set_level("x", "y", 1, "").is_err());
        assert!(mgr.rotate("x", "y", "").is_err());
    }
}
