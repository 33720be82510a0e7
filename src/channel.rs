//! Ordered, unbounded, thread-safe delivery queues
//!
//! Two channels exist per worker (owner→worker and worker→owner); each is
//! single-producer single-consumer and independent of the other. `send`
//! never blocks the producer; `recv` blocks the consumer until an envelope
//! arrives or the channel is closed. Data messages are stamped with a
//! monotonic per-channel sequence number, which is what makes FIFO
//! delivery observable.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::codec::Snapshot;
use crate::propagator::ErrorEvent;

/// Unique worker identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(u64);

/// Global worker counter for unique IDs
static WORKER_COUNTER: AtomicU64 = AtomicU64::new(1);

impl WorkerId {
    pub(crate) fn next() -> Self {
        WorkerId(WORKER_COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which execution context produced a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextId {
    Owner,
    Worker(WorkerId),
}

/// An immutable, already-serialized message
#[derive(Debug, Clone)]
pub struct Message {
    /// Codec output; self-contained and context-independent
    pub snapshot: Snapshot,
    /// Source context
    pub source: ContextId,
    /// Per-channel sequence number, stamped at enqueue time
    pub seq: u64,
}

/// Everything a channel can carry
#[derive(Debug, Clone)]
pub enum Envelope {
    Data(Message),
    Error(ErrorEvent),
}

#[derive(Default)]
struct ChannelState {
    queue: VecDeque<Envelope>,
    closed: bool,
}

/// One direction of the owner/worker link
pub struct MessageChannel {
    state: Mutex<ChannelState>,
    available: Condvar,
    seq: AtomicU64,
}

impl MessageChannel {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ChannelState::default()),
            available: Condvar::new(),
            seq: AtomicU64::new(0),
        }
    }

    /// Enqueue an envelope. Never blocks. Returns false when the channel
    /// is closed, in which case the envelope is dropped; that is the
    /// defined fate of traffic addressed to a terminated or collected
    /// destination.
    pub fn send(&self, mut envelope: Envelope) -> bool {
        if let Envelope::Data(message) = &mut envelope {
            // single producer per direction, so stamping outside the
            // queue lock still yields queue order
            message.seq = self.seq.fetch_add(1, Ordering::SeqCst);
        }
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.queue.push_back(envelope);
        drop(state);
        self.available.notify_one();
        true
    }

    /// Block until an envelope is available or the channel closes.
    /// Returns None once the channel is closed and drained.
    pub fn recv(&self) -> Option<Envelope> {
        let mut state = self.state.lock();
        loop {
            if let Some(envelope) = state.queue.pop_front() {
                return Some(envelope);
            }
            if state.closed {
                return None;
            }
            self.available.wait(&mut state);
        }
    }

    /// Non-blocking receive
    pub fn try_recv(&self) -> Option<Envelope> {
        self.state.lock().queue.pop_front()
    }

    /// Blocking receive with a deadline. Returns None on timeout or when
    /// the channel is closed and drained.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Envelope> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(envelope) = state.queue.pop_front() {
                return Some(envelope);
            }
            if state.closed {
                return None;
            }
            if self.available.wait_until(&mut state, deadline).timed_out() {
                return None;
            }
        }
    }

    /// Stop accepting new envelopes; queued ones may still drain
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        drop(state);
        self.available.notify_all();
    }

    /// Close and drop everything still queued (terminate / dead handle)
    pub fn discard(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.queue.clear();
        drop(state);
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().queue.is_empty()
    }
}

impl Default for MessageChannel {
    fn default() -> Self {
        Self::new()
    }
}
