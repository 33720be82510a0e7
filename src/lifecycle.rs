//! Worker lifecycle state machine
//!
//! Starting → Running on first successful entry evaluation, Running →
//! Closing on any close request, Closing → Terminated once the runtime
//! thread releases its resources. Terminated is absorbing. The controller
//! is shared between the owner-side handle and the runtime thread; every
//! close source is idempotent and race-safe against the others because
//! the first requester wins the transition and the rest observe Closing.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::channel::MessageChannel;

/// Lifecycle states, in transition order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecycleState {
    Starting,
    Running,
    Closing,
    Terminated,
}

/// Why a worker is being closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Owner called `terminate()`; pending inbound work is discarded
    Terminate,
    /// The worker scope called `close()`; the in-flight callback finishes
    /// but nothing further queued is dispatched
    WorkerClose,
    /// The owner handle was dropped while the worker was still alive
    HandleDropped,
    /// The entry script failed to load or to evaluate
    StartupFailure,
}

impl CloseReason {
    fn discards_pending(self) -> bool {
        matches!(self, CloseReason::Terminate | CloseReason::HandleDropped)
    }
}

/// State machine governing spawn, running, closing, and terminated states
pub struct LifecycleController {
    state: Mutex<LifecycleState>,
    changed: Condvar,
    /// Owner→worker channel; closing it is what interrupts a runtime
    /// thread blocked on `recv`
    to_worker: Arc<MessageChannel>,
}

impl LifecycleController {
    pub fn new(to_worker: Arc<MessageChannel>) -> Self {
        Self {
            state: Mutex::new(LifecycleState::Starting),
            changed: Condvar::new(),
            to_worker,
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    /// Starting → Running. Fails when a close request already raced ahead
    /// of the startup evaluation.
    pub fn mark_running(&self) -> bool {
        let mut state = self.state.lock();
        if *state != LifecycleState::Starting {
            return false;
        }
        *state = LifecycleState::Running;
        drop(state);
        self.changed.notify_all();
        true
    }

    /// Request the transition into Closing. Returns true only for the
    /// first effective request; later calls (any source) are no-ops.
    pub fn request_close(&self, reason: CloseReason) -> bool {
        {
            let mut state = self.state.lock();
            if *state >= LifecycleState::Closing {
                return false;
            }
            *state = LifecycleState::Closing;
        }
        self.changed.notify_all();
        if reason.discards_pending() {
            self.to_worker.discard();
        } else {
            self.to_worker.close();
        }
        debug!(?reason, "worker entering Closing");
        true
    }

    /// Terminal transition, performed by the runtime thread once native
    /// resources are released
    pub fn mark_terminated(&self) {
        let mut state = self.state.lock();
        if *state == LifecycleState::Terminated {
            return;
        }
        *state = LifecycleState::Terminated;
        drop(state);
        self.changed.notify_all();
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == LifecycleState::Terminated
    }

    /// Bounded wait for the terminal state
    pub fn await_terminated(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while *state != LifecycleState::Terminated {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> LifecycleController {
        LifecycleController::new(Arc::new(MessageChannel::new()))
    }

    #[test]
    fn normal_transition_order() {
        let lifecycle = controller();
        assert_eq!(lifecycle.state(), LifecycleState::Starting);
        assert!(lifecycle.mark_running());
        assert!(lifecycle.request_close(CloseReason::WorkerClose));
        lifecycle.mark_terminated();
        assert!(lifecycle.is_terminated());
    }

    #[test]
    fn close_requests_are_idempotent() {
        let lifecycle = controller();
        assert!(lifecycle.request_close(CloseReason::Terminate));
        assert!(!lifecycle.request_close(CloseReason::Terminate));
        assert!(!lifecycle.request_close(CloseReason::HandleDropped));
        assert!(!lifecycle.request_close(CloseReason::WorkerClose));
    }

    #[test]
    fn running_is_unreachable_after_close() {
        let lifecycle = controller();
        lifecycle.request_close(CloseReason::Terminate);
        assert!(!lifecycle.mark_running());
        assert_eq!(lifecycle.state(), LifecycleState::Closing);
    }

    #[test]
    fn terminated_is_absorbing() {
        let lifecycle = controller();
        lifecycle.mark_terminated();
        assert!(!lifecycle.request_close(CloseReason::Terminate));
        assert!(!lifecycle.mark_running());
        assert_eq!(lifecycle.state(), LifecycleState::Terminated);
    }

    #[test]
    fn terminate_discards_queued_inbound_messages() {
        let to_worker = Arc::new(MessageChannel::new());
        let lifecycle = LifecycleController::new(Arc::clone(&to_worker));
        to_worker.send(crate::channel::Envelope::Data(crate::channel::Message {
            snapshot: crate::codec::encode(&crate::value::Value::Null).unwrap(),
            source: crate::channel::ContextId::Owner,
            seq: 0,
        }));
        lifecycle.request_close(CloseReason::Terminate);
        assert!(to_worker.is_closed());
        assert!(to_worker.is_empty());
    }

    #[test]
    fn await_terminated_times_out() {
        let lifecycle = controller();
        assert!(!lifecycle.await_terminated(Duration::from_millis(20)));
        lifecycle.mark_terminated();
        assert!(lifecycle.await_terminated(Duration::from_millis(20)));
    }
}
