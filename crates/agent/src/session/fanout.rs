//! Session output fan-out.
//!
//! Distributes pty output to independent subscribers without losing any of
//! it. A bounded subscriber applies flow control: when its queue is full the
//! publisher waits for room, which throttles the pty reader the same way a
//! slow local terminal would. An unbounded subscriber never makes the
//! publisher wait. [`OutputFanout::close`] releases a waiting publisher.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use super::OutputChunk;

/// Identifier of a fan-out subscriber, unique within one fan-out.
pub type SubscriberId = u64;

/// Default queue capacity for the live output subscriber.
pub const DEFAULT_LIVE_CAPACITY: usize = 256;

/// Delivery counters for one subscriber.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanoutStats {
    pub delivered: u64,
    /// Publishes that had to wait for this subscriber to make room.
    pub stalls: u64,
}

enum Sink {
    Bounded(mpsc::Sender<OutputChunk>),
    Unbounded(mpsc::UnboundedSender<OutputChunk>),
}

struct Subscriber {
    sink: Sink,
    stats: FanoutStats,
}

/// Outcome of a non-blocking delivery attempt.
enum Delivery {
    Delivered,
    /// The bounded queue is full; the chunk must be sent once there is room.
    Full(mpsc::Sender<OutputChunk>),
    Gone,
}

impl Subscriber {
    fn try_deliver(&mut self, chunk: &OutputChunk) -> Delivery {
        let delivery = match &self.sink {
            Sink::Unbounded(tx) => match tx.send(chunk.clone()) {
                Ok(()) => Delivery::Delivered,
                Err(_) => Delivery::Gone,
            },
            Sink::Bounded(tx) => match tx.try_send(chunk.clone()) {
                Ok(()) => Delivery::Delivered,
                Err(TrySendError::Full(_)) => Delivery::Full(tx.clone()),
                Err(TrySendError::Closed(_)) => Delivery::Gone,
            },
        };
        if matches!(delivery, Delivery::Delivered) {
            self.stats.delivered += 1;
        }
        delivery
    }
}

#[derive(Default)]
struct Inner {
    subscribers: HashMap<SubscriberId, Subscriber>,
    closed: bool,
}

/// Fans one session's output out to its subscribers.
#[derive(Default)]
pub struct OutputFanout {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
    closing: CancellationToken,
}

impl OutputFanout {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe with a bounded queue. A full queue makes [`publish`] wait.
    ///
    /// [`publish`]: OutputFanout::publish
    pub fn subscribe_bounded(&self, capacity: usize) -> (SubscriberId, mpsc::Receiver<OutputChunk>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (self.register(Sink::Bounded(tx)), rx)
    }

    /// Subscribe with an unbounded queue.
    pub fn subscribe_lossless(&self) -> (SubscriberId, mpsc::UnboundedReceiver<OutputChunk>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (self.register(Sink::Unbounded(tx)), rx)
    }

    fn register(&self, sink: Sink) -> SubscriberId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.lock();
        // after close the sink is dropped here, so the receiver ends immediately
        if !inner.closed {
            inner.subscribers.insert(
                id,
                Subscriber {
                    sink,
                    stats: FanoutStats::default(),
                },
            );
        }
        id
    }

    /// Remove a subscriber, returning its final counters.
    pub fn unsubscribe(&self, id: SubscriberId) -> Option<FanoutStats> {
        self.lock().subscribers.remove(&id).map(|s| s.stats)
    }

    /// Deliver a chunk to every subscriber.
    ///
    /// Blocks the calling thread while a bounded subscriber's queue is full,
    /// so it must run on a blocking thread (the pty reader does). Only a
    /// dropped receiver or [`close`] ends the wait; nothing is discarded.
    ///
    /// Returns how many subscribers are still attached afterwards.
    ///
    /// [`close`]: OutputFanout::close
    pub fn publish(&self, chunk: OutputChunk) -> usize {
        let waiting: Vec<(SubscriberId, mpsc::Sender<OutputChunk>)> = {
            let mut inner = self.lock();
            let mut waiting = Vec::new();
            inner
                .subscribers
                .retain(|id, subscriber| match subscriber.try_deliver(&chunk) {
                    Delivery::Delivered => true,
                    Delivery::Full(tx) => {
                        waiting.push((*id, tx));
                        true
                    }
                    Delivery::Gone => false,
                });
            waiting
        };

        // wait outside the lock so the other subscribers keep their chunk
        for (id, tx) in waiting {
            tracing::trace!(subscriber = id, "Subscriber queue full, waiting for room");
            let sent = self.send_when_ready(&tx, chunk.clone());
            let mut inner = self.lock();
            if sent {
                if let Some(subscriber) = inner.subscribers.get_mut(&id) {
                    subscriber.stats.delivered += 1;
                    subscriber.stats.stalls += 1;
                }
            } else if !inner.closed {
                inner.subscribers.remove(&id);
            }
        }

        self.lock().subscribers.len()
    }

    fn send_when_ready(&self, tx: &mpsc::Sender<OutputChunk>, chunk: OutputChunk) -> bool {
        let closing = self.closing.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle.block_on(async move {
                tokio::select! {
                    _ = closing.cancelled() => false,
                    sent = tx.send(chunk) => sent.is_ok(),
                }
            }),
            Err(_) => tx.blocking_send(chunk).is_ok(),
        }
    }

    /// Detach every subscriber and release a publisher waiting for room.
    /// Receivers end once drained.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.subscribers.clear();
        self.closing.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    pub fn stats(&self, id: SubscriberId) -> Option<FanoutStats> {
        self.lock().subscribers.get(&id).map(|s| s.stats.clone())
    }
}
