//! Producer/consumer channels used by the unordered merges.
//!
//! [`SynchronousChannel`] is stop-and-go: producers fill it completely and
//! the consumer only reads after every producer has finished.
//! [`AsynchronousChannel`] is a bounded ring of chunks that the producer and
//! consumer use concurrently.

use std::collections::VecDeque;
use std::sync::Arc;

use common_error::QueryResult;
use common_runtime::{CancellationState, IntValueEvent, Monitor};
use parking_lot::Mutex;

/// Unbounded channel drained only after its producer is done.
#[derive(Debug)]
pub struct SynchronousChannel<T> {
    items: Mutex<Vec<T>>,
}

impl<T> Default for SynchronousChannel<T> {
    fn default() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
        }
    }
}

impl<T> SynchronousChannel<T> {
    /// Create an empty channel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one element.
    pub fn enqueue(&self, item: T) {
        self.items.lock().push(item);
    }

    /// Append every element of a batch.
    pub fn enqueue_all(&self, batch: Vec<T>) {
        let mut items = self.items.lock();
        if items.is_empty() {
            *items = batch;
        } else {
            items.extend(batch);
        }
    }

    /// Number of queued elements.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Take everything queued.
    pub fn take_all(&self) -> Vec<T> {
        std::mem::take(&mut *self.items.lock())
    }
}

// ============================================================================
// Asynchronous channel
// ============================================================================

/// Result of a non-blocking dequeue.
#[derive(Debug)]
pub enum Dequeued<T> {
    /// A chunk of elements.
    Chunk(Vec<T>),
    /// Nothing right now; the producer is still running.
    Empty,
    /// The producer is done and everything has been read.
    Done,
}

#[derive(Debug)]
struct Ring<T> {
    chunks: VecDeque<Vec<T>>,
    done: bool,
    producer_waiting: bool,
    consumer_waiting: bool,
}

/// Bounded single-producer, single-consumer channel of chunks.
///
/// The producer accumulates elements into a private chunk and publishes it
/// when full; it blocks while `capacity` chunks are queued. The consumer
/// never blocks on the channel itself: it arms `consumer_waiting` and sleeps
/// on the shared [`IntValueEvent`], which the producer sets to this channel's
/// index when it publishes.
pub struct AsynchronousChannel<T> {
    index: usize,
    ring: Monitor<Ring<T>>,
    capacity: usize,
    chunk_size: usize,
    pending: Mutex<Vec<T>>,
    consumer_event: IntValueEvent,
    cancellation: CancellationState,
}

impl<T> std::fmt::Debug for AsynchronousChannel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsynchronousChannel")
            .field("index", &self.index)
            .field("capacity", &self.capacity)
            .field("chunk_size", &self.chunk_size)
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> AsynchronousChannel<T> {
    /// Create channel `index` holding up to `capacity` chunks of
    /// `chunk_size` elements.
    pub fn new(
        index: usize,
        capacity: usize,
        chunk_size: usize,
        consumer_event: IntValueEvent,
        cancellation: CancellationState,
    ) -> Self {
        Self {
            index,
            ring: Monitor::new(Ring {
                chunks: VecDeque::new(),
                done: false,
                producer_waiting: false,
                consumer_waiting: false,
            }),
            capacity: capacity.max(1),
            chunk_size: chunk_size.max(1),
            pending: Mutex::new(Vec::new()),
            consumer_event,
            cancellation,
        }
    }

    /// Producer: add one element, publishing the chunk once it is full.
    pub fn enqueue(&self, item: T) -> QueryResult<()> {
        let full_chunk = {
            let mut pending = self.pending.lock();
            pending.push(item);
            if pending.len() >= self.chunk_size {
                Some(std::mem::replace(
                    &mut *pending,
                    Vec::with_capacity(self.chunk_size),
                ))
            } else {
                None
            }
        };
        match full_chunk {
            Some(chunk) => self.publish(chunk),
            None => Ok(()),
        }
    }

    fn publish(&self, chunk: Vec<T>) -> QueryResult<()> {
        let capacity = self.capacity;
        let mut ring = self.ring.lock();
        if ring.chunks.len() >= capacity {
            ring.producer_waiting = true;
            drop(ring);
            ring = self
                .ring
                .wait_until(&self.cancellation, |r| r.chunks.len() < capacity)?;
            ring.producer_waiting = false;
        }
        ring.chunks.push_back(chunk);
        let wake = std::mem::take(&mut ring.consumer_waiting);
        drop(ring);
        if wake {
            self.consumer_event.set(self.index);
        }
        Ok(())
    }

    /// Producer: flush the partial chunk and mark the channel done.
    pub fn set_done(&self) -> QueryResult<()> {
        let rest = std::mem::take(&mut *self.pending.lock());
        if !rest.is_empty() {
            self.publish(rest)?;
        }
        self.mark_done();
        Ok(())
    }

    /// Mark the channel done without flushing, used when the producer fails.
    pub fn abandon(&self) {
        self.pending.lock().clear();
        self.mark_done();
    }

    fn mark_done(&self) {
        let mut ring = self.ring.lock();
        ring.done = true;
        let wake = std::mem::take(&mut ring.consumer_waiting);
        drop(ring);
        if wake {
            self.consumer_event.set(self.index);
        }
    }

    /// Consumer: take the next chunk without blocking.
    pub fn try_dequeue(&self) -> Dequeued<T> {
        let mut ring = self.ring.lock();
        if let Some(chunk) = ring.chunks.pop_front() {
            let wake_producer = ring.producer_waiting;
            drop(ring);
            if wake_producer {
                self.ring.notify_all();
            }
            Dequeued::Chunk(chunk)
        } else if ring.done {
            Dequeued::Done
        } else {
            Dequeued::Empty
        }
    }

    /// Consumer: ask to be signalled on the next publish.
    ///
    /// Returns `false` (without arming) if data or completion is already
    /// visible, so the caller must retry instead of sleeping.
    pub fn arm_consumer_wait(&self) -> bool {
        let mut ring = self.ring.lock();
        if !ring.chunks.is_empty() || ring.done {
            return false;
        }
        ring.consumer_waiting = true;
        true
    }

    /// Index of this channel in its merge.
    pub const fn index(&self) -> usize {
        self.index
    }
}

/// Shared handle to an asynchronous channel.
pub type SharedChannel<T> = Arc<AsynchronousChannel<T>>;
