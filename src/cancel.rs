//! Cooperative cancellation shared between a caller and every stage worker.
//!
//! A token is observed in two ways: polled with [`CancellationToken::is_cancelled`]
//! or waited on through [`CancellationToken::done`], a receiver that becomes
//! ready (disconnected) once the token fires. The receiver form lets workers
//! race a channel operation against cancellation inside `crossbeam::select!`.
//!
//! Tokens form a tree. Cancelling a parent cancels every child; cancelling a
//! child leaves the parent alone. Each stage run derives its own child so one
//! failing worker can stop its siblings without touching other stages.

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use crossbeam::select;
use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tracing::warn;

/// Why a token fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// `cancel()` was called on this token or an ancestor
    Cancelled,
    /// The token's deadline passed
    DeadlineExceeded,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Cancelled => f.write_str("cancelled"),
            CancelReason::DeadlineExceeded => f.write_str("deadline exceeded"),
        }
    }
}

struct State {
    /// Dropped on cancellation, which disconnects every `done` receiver
    trigger: Option<Sender<()>>,
    reason: Option<CancelReason>,
    children: Vec<Weak<Inner>>,
}

struct Inner {
    state: Mutex<State>,
    done: Receiver<()>,
    deadline: Option<Instant>,
}

impl Inner {
    fn new(deadline: Option<Instant>) -> Self {
        let (trigger, done) = channel::bounded(0);
        Self {
            state: Mutex::new(State {
                trigger: Some(trigger),
                reason: None,
                children: Vec::new(),
            }),
            done,
            deadline,
        }
    }

    fn cancel(&self, reason: CancelReason) {
        let children = {
            let mut state = self.state.lock();
            if state.reason.is_some() {
                return;
            }
            state.reason = Some(reason);
            drop(state.trigger.take());
            std::mem::take(&mut state.children)
        };

        for child in children {
            if let Some(child) = child.upgrade() {
                child.cancel(reason);
            }
        }
    }
}

/// A cloneable, shareable cancellation signal
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    /// Create a root token with no deadline
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner::new(None)),
        }
    }

    /// Derive a token that fires whenever this one does
    pub fn child_token(&self) -> Self {
        self.derive(self.inner.deadline)
    }

    /// Derive a token that also fires once `timeout` has elapsed
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a token that also fires at `deadline`
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let effective = match self.inner.deadline {
            Some(parent) if parent <= deadline => parent,
            _ => deadline,
        };
        let child = self.derive(Some(effective));
        if Some(effective) != self.inner.deadline {
            child.arm(child.spawn_watchdog(effective));
        }
        child
    }

    fn derive(&self, deadline: Option<Instant>) -> Self {
        let child = Arc::new(Inner::new(deadline));
        let inherited = {
            let mut state = self.inner.state.lock();
            match state.reason {
                Some(reason) => Some(reason),
                None => {
                    state.children.retain(|c| c.strong_count() > 0);
                    state.children.push(Arc::downgrade(&child));
                    None
                }
            }
        };
        if let Some(reason) = inherited {
            child.cancel(reason);
        }
        Self { inner: child }
    }

    /// Fires the token at `deadline` unless it is cancelled or dropped first
    fn spawn_watchdog(&self, deadline: Instant) -> io::Result<()> {
        let weak = Arc::downgrade(&self.inner);
        let done = self.inner.done.clone();
        thread::Builder::new()
            .name("cancel-deadline".into())
            .spawn(move || {
                select! {
                    recv(channel::at(deadline)) -> _ => {
                        if let Some(inner) = weak.upgrade() {
                            inner.cancel(CancelReason::DeadlineExceeded);
                        }
                    }
                    recv(done) -> _ => {}
                }
            })
            .map(drop)
    }

    /// Without a watchdog the deadline could never fire, so fire it now
    fn arm(&self, watchdog: io::Result<()>) {
        if let Err(err) = watchdog {
            warn!(error = %err, "failed to spawn deadline watchdog, expiring token early");
            self.inner.cancel(CancelReason::DeadlineExceeded);
        }
    }

    /// Fire the token. Idempotent; the first reason sticks.
    pub fn cancel(&self) {
        self.inner.cancel(CancelReason::Cancelled);
    }

    /// Check whether the token has fired
    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    /// Get the reason the token fired, if it has
    pub fn reason(&self) -> Option<CancelReason> {
        self.inner.state.lock().reason
    }

    /// Get the deadline inherited or set on this token
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Receiver that becomes ready (disconnected) once the token fires.
    /// Nothing is ever sent on it.
    pub fn done(&self) -> Receiver<()> {
        self.inner.done.clone()
    }

    /// Block until the token fires
    pub fn wait(&self) {
        let _ = self.inner.done.recv();
    }

    /// Block until the token fires or `timeout` elapses. Returns true if it fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        matches!(
            self.inner.done.recv_timeout(timeout),
            Err(RecvTimeoutError::Disconnected)
        )
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("reason", &self.reason())
            .field("deadline", &self.inner.deadline)
            .finish()
    }
}
