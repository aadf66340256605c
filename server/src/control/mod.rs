// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

//! Cluster-wide single-writer lock: one opaque token holds write control,
//! with an inactivity timeout and a short grace window that tolerates SSE
//! reconnects.

use std::collections::HashSet;
use std::sync::{Mutex, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::info;

use crate::context::{sleep_with_cancel, CancelToken};
use crate::error::Error;

/// Grace window after an SSE disconnect before the token is released.
pub const DISCONNECT_GRACE: Duration = Duration::from_secs(3);

const CHECK_TICK: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlError {
    InvalidToken,
    ControlTaken,
    NotController,
    Disabled,
}

impl std::fmt::Display for ControlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlError::InvalidToken => write!(f, "invalid token"),
            ControlError::ControlTaken => write!(f, "control already taken by another session"),
            ControlError::NotController => write!(f, "not the controller"),
            ControlError::Disabled => write!(f, "control is disabled"),
        }
    }
}

impl std::error::Error for ControlError {}

impl From<ControlError> for Error {
    fn from(err: ControlError) -> Error {
        match err {
            ControlError::InvalidToken => Error::InvalidInput(err.to_string()),
            ControlError::ControlTaken | ControlError::NotController => {
                Error::Conflict(err.to_string())
            }
            ControlError::Disabled => Error::Unavailable(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ControlStatus {
    pub enabled: bool,
    #[serde(rename = "hasController")]
    pub has_controller: bool,
    #[serde(rename = "isController")]
    pub is_controller: bool,
    #[serde(rename = "timeoutSec")]
    pub timeout_sec: u64,
}

/// Receives every status change; wired to the fan-out hub by the caller.
pub type StatusBroadcast = Box<dyn Fn(&ControlStatus) + Send + Sync>;

struct State {
    active_token: String,
    last_activity: Instant,
    pending_release_at: Option<Instant>,
}

pub struct ControlManager {
    tokens: HashSet<String>,
    timeout: Duration,
    state: Mutex<State>,
    notify: StatusBroadcast,
    worker: Mutex<Option<(CancelToken, JoinHandle<()>)>>,
}

impl ControlManager {
    pub fn new(tokens: &[String], timeout: Duration, notify: StatusBroadcast) -> Arc<ControlManager> {
        let tokens: HashSet<String> = tokens.iter().filter(|t| !t.is_empty()).cloned().collect();
        Arc::new(ControlManager {
            tokens,
            timeout,
            state: Mutex::new(State {
                active_token: String::new(),
                last_activity: Instant::now(),
                pending_release_at: None,
            }),
            notify,
            worker: Mutex::new(None),
        })
    }

    /// An empty token set disables the manager: every caller is treated as
    /// a controller and take/release report the disabled state.
    pub fn is_enabled(&self) -> bool {
        !self.tokens.is_empty()
    }

    pub fn is_valid_token(&self, token: &str) -> bool {
        self.is_enabled() && self.tokens.contains(token)
    }

    /// Start the expiry checker. No thread runs when control is disabled.
    pub fn start(self: &Arc<Self>, parent: &CancelToken) {
        if !self.is_enabled() {
            return;
        }
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            return;
        }
        let token = parent.child();
        let manager = Arc::clone(self);
        let loop_token = token.clone();
        let handle = thread::spawn(move || {
            while sleep_with_cancel(&loop_token, CHECK_TICK) {
                manager.check_expirations();
            }
        });
        *worker = Some((token, handle));
    }

    pub fn stop(&self) {
        let taken = self.worker.lock().unwrap().take();
        if let Some((token, handle)) = taken {
            token.cancel();
            let _ = handle.join();
        }
    }

    /// Acquire or refresh control. A different valid token wins only once
    /// the holder's inactivity has reached the timeout.
    pub fn take(&self, token: &str) -> Result<(), ControlError> {
        if !self.is_enabled() {
            return Err(ControlError::Disabled);
        }
        if !self.is_valid_token(token) {
            return Err(ControlError::InvalidToken);
        }

        {
            let mut state = self.state.lock().unwrap();
            state.pending_release_at = None;

            if !state.active_token.is_empty()
                && state.active_token != token
                && state.last_activity.elapsed() < self.timeout
            {
                return Err(ControlError::ControlTaken);
            }

            state.active_token = token.to_string();
            state.last_activity = Instant::now();
        }

        info!("control taken");
        self.broadcast();
        Ok(())
    }

    pub fn release(&self, token: &str) -> Result<(), ControlError> {
        if !self.is_enabled() {
            return Err(ControlError::Disabled);
        }

        {
            let mut state = self.state.lock().unwrap();
            if state.active_token != token {
                return Err(ControlError::NotController);
            }
            state.active_token.clear();
            state.pending_release_at = None;
        }

        info!("control released");
        self.broadcast();
        Ok(())
    }

    /// Refresh the activity clock; only the active token may touch.
    pub fn touch(&self, token: &str) {
        if !self.is_enabled() {
            return;
        }
        let mut state = self.state.lock().unwrap();
        if state.active_token == token {
            state.last_activity = Instant::now();
        }
    }

    /// SSE disconnect: keep the token alive for [`DISCONNECT_GRACE`] so a
    /// reconnecting controller does not lose control. Repeated disconnects
    /// reschedule the window.
    pub fn release_on_disconnect(&self, token: &str) {
        if !self.is_enabled() || token.is_empty() {
            return;
        }
        let mut state = self.state.lock().unwrap();
        if state.active_token != token {
            return;
        }
        state.pending_release_at = Some(Instant::now() + DISCONNECT_GRACE);
    }

    /// SSE reconnect within the grace window.
    pub fn cancel_pending_release(&self, token: &str) {
        if !self.is_enabled() || token.is_empty() {
            return;
        }
        let mut state = self.state.lock().unwrap();
        if state.active_token == token {
            state.pending_release_at = None;
        }
    }

    pub fn is_controller(&self, token: &str) -> bool {
        if !self.is_enabled() {
            return true;
        }
        let state = self.state.lock().unwrap();
        state.active_token == token && !token.is_empty()
    }

    pub fn has_controller(&self) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let state = self.state.lock().unwrap();
        !state.active_token.is_empty()
    }

    pub fn status(&self, token: &str) -> ControlStatus {
        let state = self.state.lock().unwrap();
        ControlStatus {
            enabled: self.is_enabled(),
            has_controller: self.is_enabled() && !state.active_token.is_empty(),
            is_controller: if self.is_enabled() {
                !token.is_empty() && state.active_token == token
            } else {
                true
            },
            timeout_sec: self.timeout.as_secs(),
        }
    }

    /// One checker pass: inactivity timeout and grace expiry. Called from
    /// the worker on every tick; tests drive it directly.
    pub fn check_expirations(&self) {
        let released = {
            let mut state = self.state.lock().unwrap();
            if state.active_token.is_empty() {
                false
            } else if matches!(state.pending_release_at, Some(at) if Instant::now() >= at) {
                state.active_token.clear();
                state.pending_release_at = None;
                info!("control released after disconnect grace");
                true
            } else if state.last_activity.elapsed() >= self.timeout {
                state.active_token.clear();
                state.pending_release_at = None;
                info!("control released after inactivity timeout");
                true
            } else {
                false
            }
        };

        if released {
            self.broadcast();
        }
    }

    // Called with the state lock released.
    fn broadcast(&self) {
        let status = {
            let state = self.state.lock().unwrap();
            ControlStatus {
                enabled: self.is_enabled(),
                has_controller: !state.active_token.is_empty(),
                is_controller: false,
                timeout_sec: self.timeout.as_secs(),
            }
        };
        (self.notify)(&status);
    }
}

impl Drop for ControlManager {
    fn drop(&mut self) {
        if let Ok(mut worker) = self.worker.lock() {
            if let Some((token, _)) = worker.take() {
                token.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager(tokens: &[&str], timeout: Duration) -> (Arc<ControlManager>, Arc<AtomicUsize>) {
        let broadcasts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&broadcasts);
        let tokens: Vec<String> = tokens.iter().map(|t| t.to_string()).collect();
        let mgr = ControlManager::new(
            &tokens,
            timeout,
            Box::new(move |_status: &ControlStatus| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        (mgr, broadcasts)
    }

    #[test]
    fn take_and_release() {
        let (mgr, broadcasts) = manager(&["T1", "T2"], Duration::from_secs(60));

        assert!(!mgr.has_controller());
        mgr.take("T1").unwrap();
        assert!(mgr.has_controller());
        assert!(mgr.is_controller("T1"));
        assert!(!mgr.is_controller("T2"));
        assert_eq!(broadcasts.load(Ordering::SeqCst), 1);

        assert_eq!(mgr.release("T2").unwrap_err(), ControlError::NotController);
        mgr.release("T1").unwrap();
        assert!(!mgr.has_controller());
        assert_eq!(broadcasts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn invalid_token_rejected() {
        let (mgr, _) = manager(&["T1"], Duration::from_secs(60));
        assert_eq!(mgr.take("nope").unwrap_err(), ControlError::InvalidToken);
    }

    #[test]
    fn take_with_active_token_refreshes() {
        let (mgr, _) = manager(&["T1"], Duration::from_millis(300));
        mgr.take("T1").unwrap();
        std::thread::sleep(Duration::from_millis(200));
        // refresh keeps the controller past the original deadline
        mgr.take("T1").unwrap();
        std::thread::sleep(Duration::from_millis(200));
        assert!(mgr.is_controller("T1"));
    }

    #[test]
    fn takeover_requires_elapsed_timeout() {
        let (mgr, _) = manager(&["T1", "T2"], Duration::from_millis(250));
        mgr.take("T1").unwrap();

        assert_eq!(mgr.take("T2").unwrap_err(), ControlError::ControlTaken);
        std::thread::sleep(Duration::from_millis(300));
        mgr.take("T2").unwrap();
        assert!(mgr.is_controller("T2"));
        assert!(!mgr.is_controller("T1"));
    }

    #[test]
    fn inactivity_timeout_frees_control() {
        let (mgr, broadcasts) = manager(&["T1"], Duration::from_millis(100));
        mgr.take("T1").unwrap();
        std::thread::sleep(Duration::from_millis(150));
        mgr.check_expirations();
        assert!(!mgr.has_controller());
        assert_eq!(broadcasts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn touch_defers_timeout() {
        let (mgr, _) = manager(&["T1"], Duration::from_millis(200));
        mgr.take("T1").unwrap();
        std::thread::sleep(Duration::from_millis(120));
        mgr.touch("T1");
        std::thread::sleep(Duration::from_millis(120));
        mgr.check_expirations();
        assert!(mgr.is_controller("T1"));
    }

    #[test]
    fn disconnect_grace_then_release() {
        let (mgr, _) = manager(&["T1"], Duration::from_secs(60));
        mgr.take("T1").unwrap();
        mgr.release_on_disconnect("T1");

        // within the window nothing happens
        mgr.check_expirations();
        assert!(mgr.is_controller("T1"));
    }

    #[test]
    fn reconnect_cancels_pending_release() {
        let (mgr, _) = manager(&["T1"], Duration::from_secs(60));
        mgr.take("T1").unwrap();
        mgr.release_on_disconnect("T1");
        mgr.cancel_pending_release("T1");

        let state = mgr.state.lock().unwrap();
        assert!(state.pending_release_at.is_none());
    }

    #[test]
    fn grace_expiry_frees_control() {
        let (mgr, broadcasts) = manager(&["T1"], Duration::from_secs(60));
        mgr.take("T1").unwrap();
        {
            // shrink the window instead of sleeping out the real 3s
            let mut state = mgr.state.lock().unwrap();
            state.pending_release_at = Some(Instant::now() - Duration::from_millis(1));
        }
        mgr.check_expirations();
        assert!(!mgr.has_controller());
        assert_eq!(broadcasts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn disabled_manager_accepts_everyone() {
        let (mgr, broadcasts) = manager(&[], Duration::from_secs(60));
        assert!(!mgr.is_enabled());
        assert!(mgr.is_controller("anything"));
        assert!(!mgr.has_controller());
        assert_eq!(mgr.take("T1").unwrap_err(), ControlError::Disabled);
        assert_eq!(mgr.release("T1").unwrap_err(), ControlError::Disabled);

        let status = mgr.status("whoever");
        assert!(!status.enabled);
        assert!(status.is_controller);
        assert_eq!(broadcasts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn status_for_token() {
        let (mgr, _) = manager(&["T1", "T2"], Duration::from_secs(42));
        mgr.take("T1").unwrap();

        let s1 = mgr.status("T1");
        assert!(s1.enabled && s1.has_controller && s1.is_controller);
        assert_eq!(s1.timeout_sec, 42);

        let s2 = mgr.status("T2");
        assert!(s2.has_controller);
        assert!(!s2.is_controller);
    }

    #[test]
    fn control_error_http_mapping() {
        let err: Error = ControlError::ControlTaken.into();
        assert_eq!(err.http_status(), 409);
        let err: Error = ControlError::Disabled.into();
        assert_eq!(err.http_status(), 503);
        let err: Error = ControlError::InvalidToken.into();
        assert_eq!(err.http_status(), 400);
    }
}
