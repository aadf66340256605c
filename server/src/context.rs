// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Cooperative cancellation handle shared by every long-running loop.
///
/// Cloning is cheap; cancelling a parent cancels all children derived from
/// it via [`CancelToken::child`]. Loops must observe cancellation within one
/// scheduling tick plus the active read deadline.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

struct Inner {
    cancelled: AtomicBool,
    parent: Option<CancelToken>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                parent: None,
                deadline: None,
            }),
        }
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                parent: None,
                deadline: Some(deadline),
            }),
        }
    }

    /// Derive a token that is cancelled when either it or its parent is.
    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                parent: Some(self.clone()),
                deadline: self.inner.deadline,
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.inner.cancelled.load(Ordering::SeqCst) {
            return true;
        }
        match &self.inner.parent {
            Some(parent) => parent.is_cancelled(),
            None => false,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// True once the token is cancelled or its deadline has passed.
    pub fn done(&self) -> bool {
        if self.is_cancelled() {
            return true;
        }
        matches!(self.inner.deadline, Some(deadline) if Instant::now() >= deadline)
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Sleep in small steps so cancellation is observed promptly.
/// Returns false if the token became done before the delay elapsed.
pub fn sleep_with_cancel(token: &CancelToken, mut delay: Duration) -> bool {
    let step = Duration::from_millis(50);
    while delay > Duration::ZERO {
        if token.done() {
            return false;
        }
        let sleep_for = if delay > step { step } else { delay };
        thread::sleep(sleep_for);
        delay = delay.saturating_sub(sleep_for);
    }
    !token.done()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_propagates_to_children() {
        let root = CancelToken::new();
        let child = root.child();
        assert!(!child.is_cancelled());
        root.cancel();
        assert!(child.is_cancelled());
        assert!(child.done());
    }

    #[test]
    fn child_cancel_leaves_parent_running() {
        let root = CancelToken::new();
        let child = root.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!root.is_cancelled());
    }

    #[test]
    fn sleep_interrupted_by_cancel() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = thread::spawn(move || {
            let start = Instant::now();
            let completed = sleep_with_cancel(&waiter, Duration::from_secs(10));
            (completed, start.elapsed())
        });
        thread::sleep(Duration::from_millis(100));
        token.cancel();
        let (completed, elapsed) = handle.join().unwrap();
        assert!(!completed);
        assert!(elapsed < Duration::from_secs(1));
    }

    #[test]
    fn deadline_marks_done() {
        let token = CancelToken::with_deadline(Instant::now() - Duration::from_millis(1));
        assert!(token.done());
        assert!(!token.is_cancelled());
    }
}
