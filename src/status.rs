//! Completion status objects for asynchronous device operations.
//!
//! `kickoff()` and `complete()` return immediately with a [`Status`]; the
//! caller decides when to wait on it. A status resolves exactly once, either
//! done or failed, and never reverts.
//!
//! # Architecture
//!
//! ```text
//! StatusCompleter ──watch──> Status (clone-able, AND-composable)
//!        ^
//!        └── Flag::set(true) finishes every completer registered
//!            through Flag::when_set() on the false→true edge
//! ```

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::{AppResult, DaqError};

/// Resolution state of a single status.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusState {
    Pending,
    Done,
    Failed(String),
}

impl StatusState {
    pub fn is_pending(&self) -> bool {
        matches!(self, StatusState::Pending)
    }
}

/// Write side of a status. Resolves at most once.
///
/// Dropping a completer that never resolved fails its status, so a worker
/// that dies mid-sequence cannot leave a caller waiting forever.
#[derive(Debug)]
pub struct StatusCompleter {
    tx: watch::Sender<StatusState>,
}

impl StatusCompleter {
    pub fn finish(&self) {
        self.resolve(StatusState::Done);
    }

    pub fn fail(&self, reason: impl Into<String>) {
        self.resolve(StatusState::Failed(reason.into()));
    }

    pub fn is_resolved(&self) -> bool {
        !self.tx.borrow().is_pending()
    }

    /// Another read handle onto the same status.
    pub fn status(&self) -> Status {
        Status {
            parts: vec![self.tx.subscribe()],
        }
    }

    fn resolve(&self, state: StatusState) {
        self.tx.send_if_modified(|current| {
            if current.is_pending() {
                *current = state;
                true
            } else {
                false
            }
        });
    }
}

impl Drop for StatusCompleter {
    fn drop(&mut self) {
        self.fail("status abandoned before completion");
    }
}

/// Read side of one or more AND-composed operations.
#[derive(Debug, Clone)]
pub struct Status {
    parts: Vec<watch::Receiver<StatusState>>,
}

impl Status {
    /// A new pending status and the completer that resolves it.
    pub fn pending() -> (Status, StatusCompleter) {
        let (tx, rx) = watch::channel(StatusState::Pending);
        (Status { parts: vec![rx] }, StatusCompleter { tx })
    }

    /// A status that is already done.
    pub fn finished() -> Status {
        let (status, completer) = Status::pending();
        completer.finish();
        status
    }

    /// A status that has already failed.
    pub fn failed(reason: impl Into<String>) -> Status {
        let (status, completer) = Status::pending();
        completer.fail(reason);
        status
    }

    /// Combined state: failed if any part failed, done once every part is done.
    pub fn state(&self) -> StatusState {
        let mut pending = false;
        for part in &self.parts {
            match &*part.borrow() {
                StatusState::Failed(reason) => return StatusState::Failed(reason.clone()),
                StatusState::Pending => pending = true,
                StatusState::Done => {}
            }
        }
        if pending {
            StatusState::Pending
        } else {
            StatusState::Done
        }
    }

    /// Resolved, successfully or not.
    pub fn done(&self) -> bool {
        !self.state().is_pending()
    }

    pub fn success(&self) -> bool {
        self.state() == StatusState::Done
    }

    /// Failure reason, if any part failed.
    pub fn error(&self) -> Option<String> {
        match self.state() {
            StatusState::Failed(reason) => Some(reason),
            _ => None,
        }
    }

    /// Status that is done only when both `self` and `other` are done.
    pub fn and(mut self, other: Status) -> Status {
        self.parts.extend(other.parts);
        self
    }

    /// Wait until every part resolves. The first failure is returned.
    pub async fn wait(&self) -> AppResult<()> {
        for part in &self.parts {
            let mut rx = part.clone();
            let state = rx
                .wait_for(|state| !state.is_pending())
                .await
                .map(|state| state.clone())
                .map_err(|_| DaqError::StatusFailed("status channel closed".into()))?;
            if let StatusState::Failed(reason) = state {
                return Err(DaqError::StatusFailed(reason));
            }
        }
        Ok(())
    }

    /// Like [`Status::wait`], failing with `ConnectionTimeout` after `timeout`.
    pub async fn wait_timeout(&self, timeout: Duration, what: &str) -> AppResult<()> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| DaqError::ConnectionTimeout {
                device: what.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })?
    }
}

/// Boolean device signal such as "ready to fly" or "flight complete".
#[derive(Debug)]
pub struct Flag {
    name: String,
    value: watch::Sender<bool>,
    waiters: Mutex<Vec<StatusCompleter>>,
}

impl Flag {
    pub fn new(name: impl Into<String>) -> Self {
        let (value, _) = watch::channel(false);
        Self {
            name: name.into(),
            value,
            waiters: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self) -> bool {
        *self.value.borrow()
    }

    /// Write the flag. A false→true edge finishes every pending waiter.
    pub fn set(&self, value: bool) {
        let previous = self.value.send_replace(value);
        if value && !previous {
            for waiter in self.waiters.lock().drain(..) {
                waiter.finish();
            }
        }
    }

    /// Status resolving on the next false→true transition.
    pub fn when_set(&self) -> Status {
        let (status, completer) = Status::pending();
        self.waiters.lock().push(completer);
        status
    }

    /// Fail every pending waiter without touching the value.
    pub fn fail_waiters(&self, reason: &str) {
        for waiter in self.waiters.lock().drain(..) {
            waiter.fail(format!("{}: {}", self.name, reason));
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.value.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_resolves_once() {
        let (status, completer) = Status::pending();
        assert!(!status.done());

        completer.finish();
        completer.fail("too late");
        assert!(status.done());
        assert!(status.success());
        assert_eq!(status.error(), None);
    }

    #[test]
    fn test_dropped_completer_fails_status() {
        let (status, completer) = Status::pending();
        drop(completer);
        assert!(status.done());
        assert!(!status.success());
    }

    #[test]
    fn test_and_composition() {
        let (a, done_a) = Status::pending();
        let (b, done_b) = Status::pending();
        let both = a.and(b);

        done_a.finish();
        assert!(!both.done());
        done_b.finish();
        assert!(both.success());

        let failing = Status::finished().and(Status::failed("stalled"));
        assert_eq!(failing.error().as_deref(), Some("stalled"));
    }

    #[test]
    fn test_wait_pending_until_finished() {
        let (status, completer) = Status::pending();
        let mut wait = tokio_test::task::spawn(status.wait());
        tokio_test::assert_pending!(wait.poll());

        completer.finish();
        assert!(wait.is_woken());
        tokio_test::assert_ready_ok!(wait.poll());
    }

    #[tokio::test]
    async fn test_wait_reports_failure() {
        let (status, completer) = Status::pending();
        let handle = tokio::spawn(async move {
            completer.fail("following error");
        });
        let result = status.wait().await;
        handle.await.unwrap();
        assert!(matches!(result, Err(DaqError::StatusFailed(reason)) if reason == "following error"));
    }

    #[tokio::test]
    async fn test_wait_timeout() {
        let (status, _completer) = Status::pending();
        let result = status
            .wait_timeout(Duration::from_millis(10), "taxi")
            .await;
        assert!(matches!(result, Err(DaqError::ConnectionTimeout { .. })));
    }

    #[test]
    fn test_flag_edge_triggers_waiters() {
        let flag = Flag::new("ready_to_fly");
        let status = flag.when_set();
        assert!(!status.done());

        flag.set(false);
        assert!(!status.done());
        flag.set(true);
        assert!(status.success());

        // Never reverts
        flag.set(false);
        assert!(status.success());
    }

    #[test]
    fn test_flag_fail_waiters() {
        let flag = Flag::new("flight_complete");
        let status = flag.when_set();
        flag.fail_waiters("motor fault");
        assert_eq!(
            status.error().as_deref(),
            Some("flight_complete: motor fault")
        );
        assert!(!flag.get());
    }
}
