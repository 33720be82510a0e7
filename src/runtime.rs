//! Worker runtime - isolated execution context and message loop
//!
//! Each worker owns one OS thread and one `WorkerScope`, the explicit
//! context object that stands in for ambient worker globals:
//! - `post_message(value)` - send back to the owner (same arity contract
//!   as the handle side)
//! - `close()` - graceful shutdown: the in-flight callback finishes, no
//!   further queued message is dispatched
//! - `set_onmessage` / `set_onerror` / `set_onclose` - single-slot
//!   callback registration, last writer wins
//!
//! The thread resolves and evaluates the entry script exactly once, then
//! blocks on the owner→worker channel dispatching messages until a close
//! request is observed. Uncaught callback failures flow to the
//! ErrorPropagator and are not fatal to the loop; startup failures are.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, trace};

use crate::channel::{ContextId, Envelope, Message, MessageChannel, WorkerId};
use crate::codec;
use crate::error::{ScriptError, WorkerError, WorkerResult};
use crate::lifecycle::{CloseReason, LifecycleController, LifecycleState};
use crate::loader::ModuleLoader;
use crate::propagator::{ErrorEvent, ErrorPhase, ErrorPropagator};
use crate::value::Value;

/// Worker-scope message callback
pub type MessageHandler = dyn Fn(&WorkerScope, Value) -> Result<(), ScriptError>;
/// Worker-scope error callback; returning true suppresses propagation
pub type ErrorHandler = dyn Fn(&WorkerScope, &ErrorEvent) -> bool;
/// Worker-scope close callback, invoked on the transition into Closing
pub type CloseHandler = dyn Fn(&WorkerScope) -> Result<(), ScriptError>;

/// The worker-side context object passed to the entry point and to every
/// worker-scope callback
pub struct WorkerScope {
    id: WorkerId,
    to_owner: Arc<MessageChannel>,
    lifecycle: Arc<LifecycleController>,
    on_message: RefCell<Option<Rc<MessageHandler>>>,
    on_error: RefCell<Option<Rc<ErrorHandler>>>,
    on_close: RefCell<Option<Rc<CloseHandler>>>,
    close_requested: Cell<bool>,
}

impl WorkerScope {
    pub(crate) fn new(
        id: WorkerId,
        to_owner: Arc<MessageChannel>,
        lifecycle: Arc<LifecycleController>,
    ) -> Self {
        Self {
            id,
            to_owner,
            lifecycle,
            on_message: RefCell::new(None),
            on_error: RefCell::new(None),
            on_close: RefCell::new(None),
            close_requested: Cell::new(false),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Send one value to the owner. Serialization failures surface here,
    /// synchronously; the message is never enqueued.
    pub fn post_message(&self, value: Value) -> WorkerResult<()> {
        self.post_message_args(std::slice::from_ref(&value))
    }

    /// The raw call contract: exactly one argument, checked before any
    /// serialization is attempted
    pub fn post_message_args(&self, args: &[Value]) -> WorkerResult<()> {
        if args.len() != 1 {
            return Err(WorkerError::Arity { got: args.len() });
        }
        let snapshot = codec::encode(&args[0])?;
        let sent = self.to_owner.send(Envelope::Data(Message {
            snapshot,
            source: ContextId::Worker(self.id),
            seq: 0, // stamped by the channel
        }));
        if !sent {
            trace!(worker = %self.id, "message to owner dropped, handle gone");
        }
        Ok(())
    }

    /// Request graceful shutdown from inside the worker
    pub fn close(&self) {
        self.close_requested.set(true);
        self.lifecycle.request_close(CloseReason::WorkerClose);
    }

    pub fn set_onmessage<F>(&self, handler: F)
    where
        F: Fn(&WorkerScope, Value) -> Result<(), ScriptError> + 'static,
    {
        *self.on_message.borrow_mut() = Some(Rc::new(handler));
    }

    pub fn set_onerror<F>(&self, handler: F)
    where
        F: Fn(&WorkerScope, &ErrorEvent) -> bool + 'static,
    {
        *self.on_error.borrow_mut() = Some(Rc::new(handler));
    }

    pub fn set_onclose<F>(&self, handler: F)
    where
        F: Fn(&WorkerScope) -> Result<(), ScriptError> + 'static,
    {
        *self.on_close.borrow_mut() = Some(Rc::new(handler));
    }

    // Handlers are cloned out of their slots before invocation so a
    // callback may reassign its own slot without a borrow conflict.

    pub(crate) fn message_handler(&self) -> Option<Rc<MessageHandler>> {
        self.on_message.borrow().clone()
    }

    pub(crate) fn error_handler(&self) -> Option<Rc<ErrorHandler>> {
        self.on_error.borrow().clone()
    }

    pub(crate) fn close_handler(&self) -> Option<Rc<CloseHandler>> {
        self.on_close.borrow().clone()
    }

    pub(crate) fn close_requested(&self) -> bool {
        self.close_requested.get()
    }
}

/// Spawn the runtime thread for one worker
pub(crate) fn spawn(
    id: WorkerId,
    script_path: String,
    loader: Arc<dyn ModuleLoader>,
    to_worker: Arc<MessageChannel>,
    to_owner: Arc<MessageChannel>,
    lifecycle: Arc<LifecycleController>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("worker-{id}"))
        .spawn(move || run_worker(id, script_path, loader, to_worker, to_owner, lifecycle))
}

fn run_worker(
    id: WorkerId,
    script_path: String,
    loader: Arc<dyn ModuleLoader>,
    to_worker: Arc<MessageChannel>,
    to_owner: Arc<MessageChannel>,
    lifecycle: Arc<LifecycleController>,
) {
    let scope = WorkerScope::new(id, Arc::clone(&to_owner), Arc::clone(&lifecycle));
    let propagator = ErrorPropagator::new(id, Arc::clone(&to_owner));

    if boot(&scope, &propagator, &script_path, loader.as_ref(), &lifecycle) {
        message_loop(&scope, &propagator, &to_worker, &lifecycle);
    }

    shutdown(&scope, &propagator, &to_worker, &to_owner, &lifecycle);
}

/// Resolve and evaluate the entry script exactly once. Returns true when
/// the worker reached Running.
fn boot(
    scope: &WorkerScope,
    propagator: &ErrorPropagator,
    script_path: &str,
    loader: &dyn ModuleLoader,
    lifecycle: &LifecycleController,
) -> bool {
    let unit = match loader.resolve_and_load(script_path) {
        Ok(unit) => unit,
        Err(err) => {
            debug!(worker = %scope.id(), %err, "entry script failed to load");
            propagator.on_uncaught(scope, ErrorPhase::Load, &ScriptError::new(err.to_string()));
            lifecycle.request_close(CloseReason::StartupFailure);
            return false;
        }
    };

    if let Err(err) = unit.into_entry()(scope) {
        propagator.on_uncaught(scope, ErrorPhase::Startup, &err);
        lifecycle.request_close(CloseReason::StartupFailure);
        return false;
    }

    if scope.close_requested() {
        // the entry script closed itself before processing anything
        return false;
    }

    // a terminate may have raced the startup evaluation
    lifecycle.mark_running()
}

fn message_loop(
    scope: &WorkerScope,
    propagator: &ErrorPropagator,
    to_worker: &MessageChannel,
    lifecycle: &LifecycleController,
) {
    while lifecycle.state() == LifecycleState::Running && !scope.close_requested() {
        let Some(envelope) = to_worker.recv() else {
            break; // channel closed by a close request
        };
        let Envelope::Data(message) = envelope else {
            continue; // the owner→worker direction carries data only
        };

        let value = match codec::decode(&message.snapshot) {
            Ok(value) => value,
            Err(err) => {
                propagator.on_uncaught(
                    scope,
                    ErrorPhase::Message,
                    &ScriptError::new(err.to_string()),
                );
                continue;
            }
        };

        trace!(worker = %scope.id(), seq = message.seq, "dispatching message");
        if let Some(handler) = scope.message_handler() {
            if let Err(err) = handler(scope, value) {
                // not fatal: the loop keeps draining subsequent messages
                propagator.on_uncaught(scope, ErrorPhase::Message, &err);
            }
        }
    }
}

/// Teardown is unconditional once Closing is entered: `onclose` runs
/// first, but its failure is propagated rather than allowed to block the
/// release of channels and the terminal transition.
fn shutdown(
    scope: &WorkerScope,
    propagator: &ErrorPropagator,
    to_worker: &MessageChannel,
    to_owner: &MessageChannel,
    lifecycle: &LifecycleController,
) {
    lifecycle.request_close(CloseReason::WorkerClose);

    if let Some(handler) = scope.close_handler() {
        if let Err(err) = handler(scope) {
            propagator.on_uncaught(scope, ErrorPhase::Close, &err);
        }
    }

    to_worker.discard();
    to_owner.close();
    lifecycle.mark_terminated();
    debug!(worker = %scope.id(), "worker terminated");
}
