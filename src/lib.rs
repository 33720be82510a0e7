//! isoworker - isolated script workers with value-semantics messaging
//!
//! An embeddable worker subsystem: a host spawns independent execution
//! contexts ("workers"), exchanges messages with them by value, and tears
//! them down deterministically even under races between termination
//! sources.
//!
//! Building blocks:
//! - Structured-clone style codec: values cross threads only as
//!   self-contained snapshots; aliasing and cycles survive within one
//!   message, identity is never shared across messages
//! - Ordered, unbounded SPSC channels in each direction, FIFO per channel
//! - A lifecycle state machine (Starting/Running/Closing/Terminated)
//!   shared by handle and runtime, race-safe across terminate(), scope
//!   close(), and handle drop
//! - An error-propagation policy: worker-scope `onerror` may suppress an
//!   uncaught failure, otherwise it reaches the owner's `onerror`
//!
//! Entry scripts come from a pluggable `ModuleLoader`; the in-memory
//! `ScriptRegistry` maps path names to entry-point closures.

pub mod channel;
pub mod codec;
pub mod error;
pub mod handle;
pub mod lifecycle;
pub mod loader;
pub mod propagator;
pub mod runtime;
pub mod value;

// Re-export commonly used types
pub use channel::{ContextId, Envelope, Message, MessageChannel, WorkerId};
pub use codec::{Snapshot, decode, encode};
pub use error::{ScriptError, WorkerError, WorkerResult};
pub use handle::Worker;
pub use lifecycle::{CloseReason, LifecycleController, LifecycleState};
pub use loader::{EntryPoint, ExecutableUnit, LoadError, ModuleLoader, ScriptRegistry};
pub use propagator::{ErrorEvent, ErrorPhase, ErrorPropagator, Propagation};
pub use runtime::WorkerScope;
pub use value::{HostCallback, HostObject, Value, deep_eq};
