//! Pause Barrier
//!
//! A gate that tasks await at every suspension point. While released,
//! `wait()` returns immediately; while blocked, waiters park until
//! [`Barrier::release`] or [`Barrier::fail`]. Failure is sticky: once
//! failed, every current and future `wait()` yields the stored error.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::TaskError;

#[derive(Default)]
struct BarrierState {
    blocked: bool,
    failure: Option<TaskError>,
}

/// A cooperative gate. Clones share state.
#[derive(Clone, Default)]
pub struct Barrier {
    state: Arc<Mutex<BarrierState>>,
    notify: Arc<Notify>,
}

impl Barrier {
    /// A released (open) barrier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Close the gate. No-op while already blocked.
    pub fn block(&self) {
        self.state.lock().blocked = true;
    }

    /// Open the gate and wake every waiter. No-op while already released.
    pub fn release(&self) {
        self.state.lock().blocked = false;
        self.notify.notify_waiters();
    }

    /// Fail every current and future waiter. Only lands while blocked, and
    /// only the first failure sticks.
    pub fn fail(&self, err: TaskError) {
        {
            let mut state = self.state.lock();
            if !state.blocked || state.failure.is_some() {
                return;
            }
            state.failure = Some(err);
        }
        self.notify.notify_waiters();
    }

    pub fn is_blocked(&self) -> bool {
        self.state.lock().blocked
    }

    /// Park until released or failed.
    pub async fn wait(&self) -> Result<(), TaskError> {
        loop {
            // Arm the notification before the state check so a release
            // between check and await is never lost.
            let notified = self.notify.notified();
            {
                let state = self.state.lock();
                if let Some(err) = &state.failure {
                    return Err(err.clone());
                }
                if !state.blocked {
                    return Ok(());
                }
            }
            notified.await;
        }
    }
}
