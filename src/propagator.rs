//! Error propagation policy between a worker and its owner
//!
//! An uncaught failure inside the worker scope first consults the
//! worker-side `onerror` slot: a `true` return suppresses propagation, a
//! `false` return or an unregistered slot forwards the error to the
//! owner's `onerror`. Message-phase errors are never fatal to the message
//! loop. Load-phase errors cannot be suppressed (no script ran to install
//! a handler), and close-phase errors are always propagated regardless of
//! the worker's handler, without delaying resource release.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::channel::{Envelope, MessageChannel, WorkerId};
use crate::error::ScriptError;
use crate::runtime::WorkerScope;

/// Where in the worker's lifetime a failure surfaced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPhase {
    /// Entry script could not be resolved or loaded
    Load,
    /// Entry script evaluation failed; fatal to the worker
    Startup,
    /// A message callback failed; the loop continues
    Message,
    /// The `onclose` callback failed during teardown
    Close,
}

/// Error descriptor delivered to `onerror` callbacks
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub worker: WorkerId,
    pub phase: ErrorPhase,
    pub message: String,
}

/// What the propagator decided to do with a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagation {
    /// Worker-side `onerror` returned true
    Suppressed,
    /// Forwarded to the owner's channel
    Delivered,
    /// Owner side already gone; nowhere to report
    Dropped,
}

/// Per-worker propagation state machine
pub struct ErrorPropagator {
    worker: WorkerId,
    to_owner: Arc<MessageChannel>,
}

impl ErrorPropagator {
    pub fn new(worker: WorkerId, to_owner: Arc<MessageChannel>) -> Self {
        Self { worker, to_owner }
    }

    /// Apply the propagation policy to one uncaught failure
    pub fn on_uncaught(
        &self,
        scope: &WorkerScope,
        phase: ErrorPhase,
        error: &ScriptError,
    ) -> Propagation {
        let event = ErrorEvent {
            worker: self.worker,
            phase,
            message: error.message.clone(),
        };

        let suppressible = matches!(phase, ErrorPhase::Startup | ErrorPhase::Message);
        if suppressible {
            if let Some(handler) = scope.error_handler() {
                if handler(scope, &event) {
                    debug!(worker = %self.worker, ?phase, "uncaught error suppressed by worker onerror");
                    return Propagation::Suppressed;
                }
            }
        }

        if self.to_owner.send(Envelope::Error(event)) {
            debug!(worker = %self.worker, ?phase, error = %error, "uncaught error propagated to owner");
            Propagation::Delivered
        } else {
            trace!(worker = %self.worker, ?phase, "uncaught error dropped, owner handle gone");
            Propagation::Dropped
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::LifecycleController;

    fn fixture() -> (WorkerScope, ErrorPropagator, Arc<MessageChannel>) {
        let id = WorkerId::next();
        let to_owner = Arc::new(MessageChannel::new());
        let lifecycle = Arc::new(LifecycleController::new(Arc::new(MessageChannel::new())));
        let scope = WorkerScope::new(id, Arc::clone(&to_owner), lifecycle);
        let propagator = ErrorPropagator::new(id, Arc::clone(&to_owner));
        (scope, propagator, to_owner)
    }

    #[test]
    fn unregistered_handler_propagates() {
        let (scope, propagator, to_owner) = fixture();
        let outcome = propagator.on_uncaught(&scope, ErrorPhase::Message, &ScriptError::new("16"));
        assert_eq!(outcome, Propagation::Delivered);
        assert!(matches!(to_owner.try_recv(), Some(Envelope::Error(e)) if e.message == "16"));
    }

    #[test]
    fn true_return_suppresses() {
        let (scope, propagator, to_owner) = fixture();
        scope.set_onerror(|_, _| true);
        let outcome = propagator.on_uncaught(&scope, ErrorPhase::Message, &ScriptError::new("42"));
        assert_eq!(outcome, Propagation::Suppressed);
        assert!(to_owner.try_recv().is_none());
    }

    #[test]
    fn false_return_propagates() {
        let (scope, propagator, to_owner) = fixture();
        scope.set_onerror(|_, _| false);
        let outcome = propagator.on_uncaught(&scope, ErrorPhase::Message, &ScriptError::new("16"));
        assert_eq!(outcome, Propagation::Delivered);
        assert!(to_owner.try_recv().is_some());
    }

    #[test]
    fn close_phase_cannot_be_suppressed() {
        let (scope, propagator, to_owner) = fixture();
        scope.set_onerror(|_, _| true);
        let outcome =
            propagator.on_uncaught(&scope, ErrorPhase::Close, &ScriptError::new("teardown"));
        assert_eq!(outcome, Propagation::Delivered);
        assert!(matches!(
            to_owner.try_recv(),
            Some(Envelope::Error(e)) if e.phase == ErrorPhase::Close
        ));
    }

    #[test]
    fn dropped_owner_swallows_propagation() {
        let (scope, propagator, to_owner) = fixture();
        to_owner.discard();
        let outcome = propagator.on_uncaught(&scope, ErrorPhase::Message, &ScriptError::new("x"));
        assert_eq!(outcome, Propagation::Dropped);
    }
}
