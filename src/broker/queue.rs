//! Bounded outbound queue
//!
//! Every connection owns one queue. Publishers enqueue pre-encoded
//! frames under the queue lock and the connection task drains them in
//! FIFO order. The connection lifecycle state lives inside the same
//! lock, so once the queue is closed no enqueue can slip in behind the
//! teardown.

use std::collections::VecDeque;
use std::fmt;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::config::OverflowPolicy;

/// Lifecycle of a connection's outbound side.
///
/// Transitions are one-way: `Connecting -> Active -> Closing -> Closed`.
/// Frames are accepted only while `Active`. `Closing` still lets the
/// drain loop pop what was already queued; `Closed` returns nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

/// Why an enqueue did not take effect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The queue was full under the reject-newest policy
    BackpressureFull,
    /// The connection was not accepting frames
    ConnectionClosed,
}

impl DropReason {
    /// Metric label for the drop counter
    pub fn as_label(&self) -> &'static str {
        match self {
            DropReason::BackpressureFull => "backpressure_full",
            DropReason::ConnectionClosed => "connection_closed",
        }
    }
}

/// Outcome of a single enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    /// The frame was queued
    Enqueued,
    /// The frame was queued and the oldest queued frame was evicted
    EnqueuedDroppedOldest,
    /// The frame was not queued
    Dropped(DropReason),
}

/// A frame waiting to be written, stamped for latency tracking
#[derive(Debug)]
pub struct OutboundMessage {
    pub frame: Bytes,
    pub enqueued_at: Instant,
}

struct QueueInner {
    messages: VecDeque<OutboundMessage>,
    state: ConnectionState,
}

/// Per-connection outbound queue with a hard capacity.
///
/// Shared between publisher tasks (enqueue) and the owning connection
/// task (drain). All waking goes through a [`Notify`]: an enqueue into
/// an empty queue wakes the drain loop, enqueues into a non-empty queue
/// stay silent because a wakeup is already owed.
pub struct OutboundQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
    policy: OverflowPolicy,
}

impl OutboundQueue {
    /// Create a queue in the `Connecting` state. Frames are rejected
    /// until [`activate`](Self::activate) is called.
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                messages: VecDeque::with_capacity(capacity.min(64)),
                state: ConnectionState::Connecting,
            }),
            notify: Notify::new(),
            capacity,
            policy,
        }
    }

    /// Move `Connecting -> Active`. No-op in any other state.
    pub fn activate(&self) {
        let mut inner = self.inner.lock();
        if inner.state == ConnectionState::Connecting {
            inner.state = ConnectionState::Active;
        }
    }

    /// Append a frame, applying the overflow policy when full.
    ///
    /// `now` is taken by the caller so a fan-out across many queues
    /// reads the clock once.
    pub fn enqueue(&self, frame: Bytes, now: Instant) -> EnqueueResult {
        let mut inner = self.inner.lock();

        if inner.state != ConnectionState::Active {
            return EnqueueResult::Dropped(DropReason::ConnectionClosed);
        }

        let message = OutboundMessage {
            frame,
            enqueued_at: now,
        };

        if inner.messages.len() >= self.capacity {
            match self.policy {
                OverflowPolicy::RejectNewest => {
                    return EnqueueResult::Dropped(DropReason::BackpressureFull);
                }
                OverflowPolicy::DropOldest => {
                    inner.messages.pop_front();
                    inner.messages.push_back(message);
                    // queue was non-empty, a wakeup is already owed
                    return EnqueueResult::EnqueuedDroppedOldest;
                }
            }
        }

        let was_empty = inner.messages.is_empty();
        inner.messages.push_back(message);
        drop(inner);

        // Only notify on the empty -> non-empty edge; this coalesces
        // wakeups during bursts.
        if was_empty {
            self.notify.notify_one();
        }

        EnqueueResult::Enqueued
    }

    /// Pop the oldest queued frame. Returns frames while `Active` or
    /// `Closing`; `Closed` queues return `None`.
    pub fn pop(&self) -> Option<OutboundMessage> {
        let mut inner = self.inner.lock();
        if inner.state == ConnectionState::Closed {
            return None;
        }
        inner.messages.pop_front()
    }

    /// Stop accepting new frames but keep queued ones poppable.
    /// Wakes the drain loop so a final flush can start immediately.
    pub fn begin_close(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            ConnectionState::Connecting | ConnectionState::Active => {
                inner.state = ConnectionState::Closing;
            }
            ConnectionState::Closing | ConnectionState::Closed => return,
        }
        drop(inner);
        self.notify.notify_one();
    }

    /// Terminal transition: discard everything still queued and refuse
    /// all further traffic. Returns how many frames were discarded.
    /// Idempotent; the second call discards nothing.
    pub fn finish_close(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.state = ConnectionState::Closed;
        let discarded = inner.messages.len();
        inner.messages.clear();
        drop(inner);
        self.notify.notify_one();
        discarded
    }

    /// Wait until a publisher signals the queue went non-empty (or the
    /// state changed). Wakeups may be spurious; callers re-check by
    /// popping.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn len(&self) -> usize {
        self.inner.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().messages.is_empty()
    }
}

impl fmt::Debug for OutboundQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("OutboundQueue")
            .field("state", &inner.state)
            .field("len", &inner.messages.len())
            .field("capacity", &self.capacity)
            .field("policy", &self.policy)
            .finish()
    }
}
