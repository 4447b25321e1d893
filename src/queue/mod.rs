//! Per-item message queue.
//!
//! One queue per host, shared by all of its workers. Four disciplines:
//! - **fifo**: dequeue order = enqueue order
//! - **lifo**: dequeue order = reverse enqueue order
//! - **priority**: highest priority first, ties in enqueue order
//! - **unordered**: no ordering contract; entries are popped from whichever
//!   end is cheapest
//!
//! Overflow at capacity follows the item's [`OverflowStrategy`]. All mutation
//! happens under one short `parking_lot` critical section; async waiters are
//! parked on `tokio::sync::Notify`.

use parking_lot::Mutex;
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;

use crate::envelope::{Envelope, Priority};
use crate::types::{Error, OverflowStrategy, QueueKind, QueueSettings, Result};

/// Completion channel for sync-pattern deliveries.
pub type Completion = oneshot::Sender<Result<()>>;

// =============================================================================
// Entries
// =============================================================================

/// An envelope waiting in (or just taken from) a queue.
#[derive(Debug)]
pub struct QueueEntry {
    envelope: Envelope,
    enqueued_at: Instant,
    seq: u64,
    completion: Option<Completion>,
}

impl QueueEntry {
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn enqueued_at(&self) -> Instant {
        self.enqueued_at
    }

    /// Time spent queued so far.
    pub fn wait_time(&self) -> Duration {
        self.enqueued_at.elapsed()
    }

    pub fn has_completion(&self) -> bool {
        self.completion.is_some()
    }

    /// Report the outcome to a waiting sync sender, if any.
    pub fn complete(mut self, result: Result<()>) -> Envelope {
        if let Some(tx) = self.completion.take() {
            // Receiver gone means the sender already timed out.
            let _ = tx.send(result);
        }
        self.envelope
    }

    /// Swap the envelope (retry with incremented count), keeping the
    /// completion and original position.
    pub fn replace_envelope(&mut self, envelope: Envelope) {
        self.envelope = envelope;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct PriorityKey {
    priority: Reverse<Priority>,
    seq: u64,
}

impl PriorityKey {
    fn of(entry: &QueueEntry) -> Self {
        Self {
            priority: Reverse(entry.envelope.priority()),
            seq: entry.seq,
        }
    }
}

// =============================================================================
// Storage
// =============================================================================

#[derive(Debug)]
enum Storage {
    Fifo(VecDeque<QueueEntry>),
    Lifo(Vec<QueueEntry>),
    Priority(BTreeMap<PriorityKey, QueueEntry>),
    Unordered(Vec<QueueEntry>),
}

impl Storage {
    fn new(kind: QueueKind) -> Self {
        match kind {
            QueueKind::Fifo => Storage::Fifo(VecDeque::new()),
            QueueKind::Lifo => Storage::Lifo(Vec::new()),
            QueueKind::Priority => Storage::Priority(BTreeMap::new()),
            QueueKind::Unordered => Storage::Unordered(Vec::new()),
        }
    }

    fn len(&self) -> usize {
        match self {
            Storage::Fifo(q) => q.len(),
            Storage::Lifo(s) | Storage::Unordered(s) => s.len(),
            Storage::Priority(m) => m.len(),
        }
    }

    fn push(&mut self, entry: QueueEntry) {
        match self {
            Storage::Fifo(q) => q.push_back(entry),
            Storage::Lifo(s) | Storage::Unordered(s) => s.push(entry),
            Storage::Priority(m) => {
                m.insert(PriorityKey::of(&entry), entry);
            }
        }
    }

    /// Put a dequeued entry back where it would be dequeued next.
    fn restore(&mut self, entry: QueueEntry) {
        match self {
            Storage::Fifo(q) => q.push_front(entry),
            other => other.push(entry),
        }
    }

    fn pop(&mut self) -> Option<QueueEntry> {
        match self {
            Storage::Fifo(q) => q.pop_front(),
            Storage::Lifo(s) | Storage::Unordered(s) => s.pop(),
            Storage::Priority(m) => m.pop_first().map(|(_, entry)| entry),
        }
    }

    /// Eviction victim for `drop_oldest`.
    ///
    /// Priority queues evict the lowest priority first, earliest enqueued
    /// among equals.
    fn evict(&mut self) -> Option<QueueEntry> {
        match self {
            Storage::Fifo(q) => q.pop_front(),
            Storage::Lifo(s) => (!s.is_empty()).then(|| s.remove(0)),
            Storage::Unordered(s) => {
                let oldest = s
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, entry)| entry.seq)
                    .map(|(idx, _)| idx)?;
                Some(s.swap_remove(oldest))
            }
            Storage::Priority(m) => {
                let lowest = m.last_key_value().map(|(key, _)| key.priority)?;
                let key = *m
                    .range(PriorityKey {
                        priority: lowest,
                        seq: 0,
                    }..)
                    .next()
                    .map(|(key, _)| key)?;
                m.remove(&key)
            }
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

#[derive(Debug, Default)]
struct Counters {
    enqueued: u64,
    dequeued: u64,
    dropped: u64,
    rejected: u64,
    requeued: u64,
    total_wait: Duration,
    max_wait: Duration,
}

/// Queue statistics snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStats {
    pub name: String,
    pub kind: QueueKind,
    pub capacity: usize,
    pub depth: usize,
    pub enqueued: u64,
    pub dequeued: u64,
    pub dropped: u64,
    pub rejected: u64,
    pub requeued: u64,
    pub mean_wait_ms: f64,
    pub max_wait_ms: f64,
    pub closed: bool,
}

// =============================================================================
// Queue
// =============================================================================

#[derive(Debug)]
struct Inner {
    storage: Storage,
    next_seq: u64,
    closed: bool,
    counters: Counters,
}

enum Push {
    Admitted(Option<QueueEntry>),
    Full(Envelope, Option<Completion>),
}

/// Bounded per-item queue.
#[derive(Debug)]
pub struct MessageQueue {
    name: String,
    settings: QueueSettings,
    inner: Mutex<Inner>,
    not_empty: Notify,
    not_full: Notify,
}

impl MessageQueue {
    pub fn new(name: impl Into<String>, settings: QueueSettings) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Inner {
                storage: Storage::new(settings.kind),
                next_seq: 0,
                closed: false,
                counters: Counters::default(),
            }),
            settings,
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    pub fn capacity(&self) -> usize {
        self.settings.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    // =========================================================================
    // Enqueue
    // =========================================================================

    fn try_push(&self, envelope: Envelope, completion: Option<Completion>) -> Result<Push> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(Error::NotAccepting {
                item: self.name.clone(),
                state: "closed".to_string(),
            });
        }

        let mut evicted = None;
        if inner.storage.len() >= self.settings.capacity {
            match self.settings.overflow {
                OverflowStrategy::RejectNew => {
                    inner.counters.rejected += 1;
                    return Err(Error::QueueFull {
                        item: self.name.clone(),
                        capacity: self.settings.capacity,
                    });
                }
                OverflowStrategy::Block => return Ok(Push::Full(envelope, completion)),
                OverflowStrategy::DropOldest => {
                    evicted = inner.storage.evict();
                    inner.counters.dropped += 1;
                }
            }
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.storage.push(QueueEntry {
            envelope,
            enqueued_at: Instant::now(),
            seq,
            completion,
        });
        inner.counters.enqueued += 1;
        Ok(Push::Admitted(evicted))
    }

    fn admitted(&self, evicted: Option<QueueEntry>) {
        self.not_empty.notify_one();
        if let Some(entry) = evicted {
            tracing::debug!(
                item = %self.name,
                message_id = %entry.envelope.message_id(),
                "dropped oldest entry on overflow"
            );
            let reason = format!("evicted from {} on overflow", self.name);
            entry.complete(Err(Error::cancelled(reason)));
        }
    }

    /// Enqueue, applying the overflow strategy.
    ///
    /// Suspends only under `block`, for at most `block_timeout`.
    pub async fn enqueue(&self, envelope: Envelope, completion: Option<Completion>) -> Result<()> {
        let mut pending = (envelope, completion);
        let deadline = Instant::now() + self.settings.block_timeout;
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_push(pending.0, pending.1)? {
                Push::Admitted(evicted) => {
                    self.admitted(evicted);
                    return Ok(());
                }
                Push::Full(envelope, completion) => pending = (envelope, completion),
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                self.inner.lock().counters.rejected += 1;
                return Err(Error::QueueTimeout {
                    item: self.name.clone(),
                    waited: self.settings.block_timeout,
                });
            }
        }
    }

    /// Non-suspending enqueue; a full `block` queue fails with `QueueFull`.
    pub fn try_enqueue(&self, envelope: Envelope) -> Result<()> {
        match self.try_push(envelope, None)? {
            Push::Admitted(evicted) => {
                self.admitted(evicted);
                Ok(())
            }
            Push::Full(_, _) => {
                self.inner.lock().counters.rejected += 1;
                Err(Error::QueueFull {
                    item: self.name.clone(),
                    capacity: self.settings.capacity,
                })
            }
        }
    }

    /// Return a dequeued-but-unacknowledged entry to the queue.
    ///
    /// Bypasses capacity and the closed flag: the entry was already admitted.
    pub fn requeue(&self, entry: QueueEntry) {
        {
            let mut inner = self.inner.lock();
            inner.counters.requeued += 1;
            inner.storage.restore(entry);
        }
        self.not_empty.notify_one();
    }

    /// Re-admit an entry for another attempt, behind what is already queued.
    ///
    /// Like [`requeue`](Self::requeue) this bypasses capacity and the closed
    /// flag; the completion travels with the entry.
    pub fn retry(&self, mut entry: QueueEntry) {
        {
            let mut inner = self.inner.lock();
            entry.seq = inner.next_seq;
            inner.next_seq += 1;
            inner.counters.requeued += 1;
            inner.storage.push(entry);
        }
        self.not_empty.notify_one();
    }

    // =========================================================================
    // Dequeue
    // =========================================================================

    fn take(&self) -> std::result::Result<QueueEntry, bool> {
        let mut inner = self.inner.lock();
        match inner.storage.pop() {
            Some(entry) => {
                let waited = entry.enqueued_at.elapsed();
                inner.counters.dequeued += 1;
                inner.counters.total_wait += waited;
                inner.counters.max_wait = inner.counters.max_wait.max(waited);
                Ok(entry)
            }
            None => Err(inner.closed),
        }
    }

    /// Wait for the next entry. `None` once the queue is closed and empty.
    pub async fn dequeue(&self) -> Option<QueueEntry> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.take() {
                Ok(entry) => {
                    self.not_full.notify_one();
                    return Some(entry);
                }
                Err(true) => return None,
                Err(false) => {}
            }
            notified.await;
        }
    }

    pub fn try_dequeue(&self) -> Option<QueueEntry> {
        let entry = self.take().ok()?;
        self.not_full.notify_one();
        Some(entry)
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Stop admitting; waiting consumers drain what is left, then see `None`.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    /// Remove every remaining entry, in dequeue order.
    pub fn drain_all(&self) -> Vec<QueueEntry> {
        let mut inner = self.inner.lock();
        let mut drained = Vec::with_capacity(inner.storage.len());
        while let Some(entry) = inner.storage.pop() {
            drained.push(entry);
        }
        drop(inner);
        self.not_full.notify_waiters();
        drained
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock();
        let c = &inner.counters;
        let mean_wait_ms = if c.dequeued == 0 {
            0.0
        } else {
            c.total_wait.as_secs_f64() * 1000.0 / c.dequeued as f64
        };
        QueueStats {
            name: self.name.clone(),
            kind: self.settings.kind,
            capacity: self.settings.capacity,
            depth: inner.storage.len(),
            enqueued: c.enqueued,
            dequeued: c.dequeued,
            dropped: c.dropped,
            rejected: c.rejected,
            requeued: c.requeued,
            mean_wait_ms,
            max_wait_ms: c.max_wait.as_secs_f64() * 1000.0,
            closed: inner.closed,
        }
    }
}
