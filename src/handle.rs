//! Owner-side worker handle
//!
//! `Worker` is the creator-side proxy for one isolated worker:
//! - `Worker::new(loader, path)` - spawns the execution thread and
//!   transitions the worker to Starting
//! - `post_message(value)` - structured-clone send, never blocks
//! - `terminate()` - idempotent, discards pending work, never waits
//! - `set_onmessage` / `set_onerror` - single-slot callbacks, last
//!   writer wins
//! - `poll()` / `poll_wait(timeout)` - drain pending worker→owner
//!   envelopes and invoke the registered callbacks in FIFO order
//!
//! Dropping the handle is the reclamation signal: the worker is asked to
//! terminate and its queued outbound traffic is discarded, so no callback
//! can fire for a collected handle.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::channel::{ContextId, Envelope, Message, MessageChannel, WorkerId};
use crate::codec;
use crate::error::{WorkerError, WorkerResult};
use crate::lifecycle::{CloseReason, LifecycleController, LifecycleState};
use crate::loader::ModuleLoader;
use crate::propagator::{ErrorEvent, ErrorPhase};
use crate::runtime;
use crate::value::Value;

/// Owner-side message callback
pub type OwnerMessageHandler = Box<dyn FnMut(Value)>;
/// Owner-side error callback
pub type OwnerErrorHandler = Box<dyn FnMut(ErrorEvent)>;

/// The owner-side proxy representing one worker
pub struct Worker {
    id: WorkerId,
    script_path: String,
    to_worker: Arc<MessageChannel>,
    from_worker: Arc<MessageChannel>,
    lifecycle: Arc<LifecycleController>,
    on_message: Mutex<Option<OwnerMessageHandler>>,
    on_error: Mutex<Option<OwnerErrorHandler>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    /// Create a worker running the script at `script_path`
    ///
    /// Fails synchronously only on caller-contract violations (empty
    /// path) or if the execution thread cannot be spawned. Script
    /// resolution happens on the worker thread, so a missing or
    /// unparsable script surfaces through `onerror`, not here.
    pub fn new(loader: Arc<dyn ModuleLoader>, script_path: &str) -> WorkerResult<Self> {
        if script_path.is_empty() {
            return Err(WorkerError::Construction(
                "worker script path must be a non-empty string".into(),
            ));
        }

        let id = WorkerId::next();
        let to_worker = Arc::new(MessageChannel::new());
        let from_worker = Arc::new(MessageChannel::new());
        let lifecycle = Arc::new(LifecycleController::new(Arc::clone(&to_worker)));

        let thread = runtime::spawn(
            id,
            script_path.to_string(),
            loader,
            Arc::clone(&to_worker),
            Arc::clone(&from_worker),
            Arc::clone(&lifecycle),
        )
        .map_err(|err| WorkerError::Construction(format!("failed to spawn worker thread: {err}")))?;

        debug!(worker = %id, script = script_path, "worker spawned");
        Ok(Self {
            id,
            script_path: script_path.to_string(),
            to_worker,
            from_worker,
            lifecycle,
            on_message: Mutex::new(None),
            on_error: Mutex::new(None),
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn script_path(&self) -> &str {
        &self.script_path
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    /// Send one value to the worker. Serialization failures surface
    /// synchronously and the message is never enqueued. Sends addressed
    /// to an already-Terminated worker are silently dropped: termination
    /// legitimately races in-flight sends.
    pub fn post_message(&self, value: Value) -> WorkerResult<()> {
        self.post_message_args(std::slice::from_ref(&value))
    }

    /// The raw call contract: exactly one argument, checked before any
    /// serialization is attempted
    pub fn post_message_args(&self, args: &[Value]) -> WorkerResult<()> {
        if args.len() != 1 {
            return Err(WorkerError::Arity { got: args.len() });
        }
        if self.lifecycle.state() == LifecycleState::Terminated {
            trace!(worker = %self.id, "postMessage after termination dropped");
            return Ok(());
        }
        let snapshot = codec::encode(&args[0])?;
        let sent = self.to_worker.send(Envelope::Data(Message {
            snapshot,
            source: ContextId::Owner,
            seq: 0, // stamped by the channel
        }));
        if !sent {
            trace!(worker = %self.id, "postMessage raced a close request, dropped");
        }
        Ok(())
    }

    /// Request immediate termination. Idempotent; pending messages in
    /// both directions are discarded and no further callback fires. Does
    /// not wait for the worker thread to acknowledge.
    pub fn terminate(&self) {
        if self.lifecycle.request_close(CloseReason::Terminate) {
            debug!(worker = %self.id, "terminate requested");
        }
        self.from_worker.discard();
    }

    /// Register the message callback (last writer wins)
    pub fn set_onmessage<F>(&self, handler: F)
    where
        F: FnMut(Value) + 'static,
    {
        *self.on_message.lock() = Some(Box::new(handler));
    }

    /// Register the error callback (last writer wins)
    pub fn set_onerror<F>(&self, handler: F)
    where
        F: FnMut(ErrorEvent) + 'static,
    {
        *self.on_error.lock() = Some(Box::new(handler));
    }

    /// Dispatch every pending worker→owner envelope to the registered
    /// callbacks, in channel order. Returns the number dispatched.
    pub fn poll(&self) -> usize {
        let mut dispatched = 0;
        while let Some(envelope) = self.from_worker.try_recv() {
            self.dispatch(envelope);
            dispatched += 1;
        }
        dispatched
    }

    /// Like `poll`, but blocks up to `timeout` for the first envelope
    pub fn poll_wait(&self, timeout: Duration) -> usize {
        match self.from_worker.recv_timeout(timeout) {
            Some(envelope) => {
                self.dispatch(envelope);
                1 + self.poll()
            }
            None => 0,
        }
    }

    /// Bounded wait for the terminal lifecycle state; reaps the worker
    /// thread once it is observed
    pub fn await_terminated(&self, timeout: Duration) -> bool {
        if !self.lifecycle.await_terminated(timeout) {
            return false;
        }
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
        true
    }

    fn dispatch(&self, envelope: Envelope) {
        match envelope {
            Envelope::Data(message) => match codec::decode(&message.snapshot) {
                Ok(value) => Self::invoke_slot(&self.on_message, value),
                Err(err) => Self::invoke_slot(
                    &self.on_error,
                    ErrorEvent {
                        worker: self.id,
                        phase: ErrorPhase::Message,
                        message: err.to_string(),
                    },
                ),
            },
            Envelope::Error(event) => Self::invoke_slot(&self.on_error, event),
        }
    }

    // The handler is taken out of its slot while it runs so a callback
    // may reassign its own slot without deadlocking; a reassignment made
    // during the call wins over restoring the running handler.
    fn invoke_slot<T>(slot: &Mutex<Option<Box<dyn FnMut(T)>>>, arg: T) {
        let taken = slot.lock().take();
        if let Some(mut handler) = taken {
            handler(arg);
            let mut guard = slot.lock();
            if guard.is_none() {
                *guard = Some(handler);
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        // reclamation is termination source (c): inbound delivery becomes
        // a no-op and the worker is asked to shut down without requiring
        // its cooperation
        self.from_worker.discard();
        if self.lifecycle.request_close(CloseReason::HandleDropped) {
            debug!(worker = %self.id, "handle dropped, worker closing");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::ScriptRegistry;

    #[test]
    fn empty_script_path_is_a_construction_error() {
        let registry = Arc::new(ScriptRegistry::new());
        assert!(matches!(
            Worker::new(registry, ""),
            Err(WorkerError::Construction(_))
        ));
    }

    #[test]
    fn post_message_arity_is_checked_before_anything_else() {
        let registry = Arc::new(ScriptRegistry::new());
        registry.register_fn("./noop.js", |_| Ok(()));
        let worker = Worker::new(registry, "./noop.js").unwrap();

        assert!(matches!(
            worker.post_message_args(&[]),
            Err(WorkerError::Arity { got: 0 })
        ));
        assert!(matches!(
            worker.post_message_args(&[Value::Null, Value::Null]),
            Err(WorkerError::Arity { got: 2 })
        ));
        assert!(worker.to_worker.is_empty());
        worker.terminate();
    }

    #[test]
    fn serialization_failure_never_enqueues() {
        let registry = Arc::new(ScriptRegistry::new());
        registry.register_fn("./noop.js", |_| Ok(()));
        let worker = Worker::new(registry, "./noop.js").unwrap();

        let bad = Value::Callback(crate::value::HostCallback::new(|_| Value::Undefined));
        assert!(matches!(
            worker.post_message(bad),
            Err(WorkerError::Serialization(_))
        ));
        assert!(worker.to_worker.is_empty());
        worker.terminate();
    }
}
