//! Cancellation-aware synchronization primitives.
//!
//! Every blocking wait in the engine goes through [`Monitor::wait_until`],
//! which registers a wake callback on the query's merged token so a waiting
//! thread returns as soon as the query is cancelled.

use std::sync::Arc;

use common_error::{QueryError, QueryResult};
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::cancellation::CancellationState;

struct MonitorInner<T> {
    lock: Mutex<T>,
    cv: Condvar,
}

/// A mutex paired with a condition variable whose waits can be interrupted
/// by cancellation.
pub struct Monitor<T> {
    inner: Arc<MonitorInner<T>>,
}

impl<T> Clone for Monitor<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Monitor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("value", &*self.inner.lock.lock())
            .finish()
    }
}

impl<T: Send + 'static> Monitor<T> {
    /// Create a monitor guarding `value`.
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                lock: Mutex::new(value),
                cv: Condvar::new(),
            }),
        }
    }

    /// Lock without waiting for any condition.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock.lock()
    }

    /// Wake every waiter so it re-evaluates its condition.
    pub fn notify_all(&self) {
        self.inner.cv.notify_all();
    }

    /// Block until `ready` returns true, or fail if the query is cancelled.
    ///
    /// `ready` is evaluated under the lock; the guard is returned still held.
    pub fn wait_until<F>(
        &self,
        cancellation: &CancellationState,
        mut ready: F,
    ) -> QueryResult<MutexGuard<'_, T>>
    where
        F: FnMut(&mut T) -> bool,
    {
        {
            let mut guard = self.inner.lock.lock();
            if ready(&mut guard) {
                return Ok(guard);
            }
        }

        let waker = Arc::clone(&self.inner);
        let _registration = cancellation.merged_token().register(move || {
            let _guard = waker.lock.lock();
            waker.cv.notify_all();
        });

        let mut guard = self.inner.lock.lock();
        loop {
            if ready(&mut guard) {
                return Ok(guard);
            }
            cancellation.check()?;
            self.inner.cv.wait(&mut guard);
        }
    }
}

// ============================================================================
// Countdown Event
// ============================================================================

/// A barrier that opens once it has been signalled `count` times.
#[derive(Clone, Debug)]
pub struct CountdownEvent {
    remaining: Monitor<usize>,
}

impl CountdownEvent {
    /// Create an event expecting `count` signals.
    pub fn new(count: usize) -> Self {
        Self {
            remaining: Monitor::new(count),
        }
    }

    /// Record one arrival.
    pub fn signal(&self) -> QueryResult<()> {
        let mut remaining = self.remaining.lock();
        if *remaining == 0 {
            return Err(QueryError::contract_violation(
                "countdown event signalled more times than its count",
            ));
        }
        *remaining -= 1;
        let opened = *remaining == 0;
        drop(remaining);
        if opened {
            self.remaining.notify_all();
        }
        Ok(())
    }

    /// Whether every participant has arrived.
    pub fn is_set(&self) -> bool {
        *self.remaining.lock() == 0
    }

    /// Block until every participant has arrived.
    pub fn wait(&self, cancellation: &CancellationState) -> QueryResult<()> {
        self.remaining
            .wait_until(cancellation, |remaining| *remaining == 0)
            .map(drop)
    }

    /// Record an arrival, then wait for the rest.
    pub fn signal_and_wait(&self, cancellation: &CancellationState) -> QueryResult<()> {
        self.signal()?;
        self.wait(cancellation)
    }
}

// ============================================================================
// Int Value Event
// ============================================================================

/// An auto-reset event carrying the index of whoever set it.
///
/// The unordered channel merge uses one of these so its consumer can sleep
/// until any producer has data, and learn which one.
#[derive(Clone, Debug)]
pub struct IntValueEvent {
    slot: Monitor<Option<usize>>,
}

impl Default for IntValueEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl IntValueEvent {
    /// Create an unset event.
    pub fn new() -> Self {
        Self {
            slot: Monitor::new(None),
        }
    }

    /// Set the event to `value` and wake the waiter.
    pub fn set(&self, value: usize) {
        *self.slot.lock() = Some(value);
        self.slot.notify_all();
    }

    /// Clear the event, returning the value it held.
    pub fn reset(&self) -> Option<usize> {
        self.slot.lock().take()
    }

    /// Block until set, then reset and return the value.
    pub fn wait(&self, cancellation: &CancellationState) -> QueryResult<usize> {
        let mut slot = self.slot.wait_until(cancellation, |slot| slot.is_some())?;
        slot.take()
            .ok_or_else(|| QueryError::internal("int value event woke without a value"))
    }
}

// ============================================================================
// Rendezvous
// ============================================================================

/// Single-use handoff of one value from a sender to a receiver.
#[derive(Debug)]
pub struct Rendezvous<T> {
    slot: Monitor<Option<T>>,
}

impl<T: Send + 'static> Default for Rendezvous<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Rendezvous<T> {
    /// Create an empty handoff slot.
    pub fn new() -> Self {
        Self {
            slot: Monitor::new(None),
        }
    }

    /// Publish the value. Each rendezvous carries exactly one value.
    pub fn send(&self, value: T) -> QueryResult<()> {
        let mut slot = self.slot.lock();
        if slot.is_some() {
            return Err(QueryError::contract_violation(
                "rendezvous slot already holds a value",
            ));
        }
        *slot = Some(value);
        drop(slot);
        self.slot.notify_all();
        Ok(())
    }

    /// Block until the value is published and take it.
    pub fn receive(&self, cancellation: &CancellationState) -> QueryResult<T> {
        let mut slot = self.slot.wait_until(cancellation, |slot| slot.is_some())?;
        slot.take()
            .ok_or_else(|| QueryError::internal("rendezvous woke without a value"))
    }
}
