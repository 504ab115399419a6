//! Cooperative cancellation.
//!
//! A [`CancellationHandle`] owns a cancellable flag and hands out
//! [`CancellationToken`]s that observe it. Handles can be linked to other
//! tokens so that cancelling any parent cancels the child; the engine builds
//! its merged query token that way.
//!
//! Blocking waits do not poll: they [`register`](CancellationToken::register)
//! a wake callback that runs the moment the token is cancelled.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use common_error::{CancelSource, QueryError, QueryResult};
use parking_lot::Mutex;

type Callback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct CallbackTable {
    next_id: u64,
    entries: Vec<(u64, Callback)>,
}

#[derive(Default)]
struct TokenInner {
    canceled: AtomicBool,
    callbacks: Mutex<CallbackTable>,
}

impl TokenInner {
    fn cancel(&self) -> bool {
        if self.canceled.swap(true, Ordering::AcqRel) {
            return false;
        }
        let entries = std::mem::take(&mut self.callbacks.lock().entries);
        for (_, callback) in entries {
            callback();
        }
        true
    }
}

/// Observer side of a cancellation flag.
///
/// `CancellationToken::none()` is never cancelled and costs nothing to check.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Option<Arc<TokenInner>>,
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("can_be_canceled", &self.can_be_canceled())
            .field("canceled", &self.is_cancelled())
            .finish()
    }
}

impl CancellationToken {
    /// A token that can never be cancelled.
    pub const fn none() -> Self {
        Self { inner: None }
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner
            .as_ref()
            .is_some_and(|inner| inner.canceled.load(Ordering::Acquire))
    }

    /// Whether this token is backed by a handle at all.
    pub const fn can_be_canceled(&self) -> bool {
        self.inner.is_some()
    }

    /// Run `callback` once when the token is cancelled.
    ///
    /// If the token is already cancelled the callback runs immediately on the
    /// calling thread. Dropping the returned registration unregisters it.
    pub fn register<F>(&self, callback: F) -> CancellationRegistration
    where
        F: Fn() + Send + Sync + 'static,
    {
        let Some(inner) = &self.inner else {
            return CancellationRegistration::empty();
        };

        let callback: Callback = Arc::new(callback);
        {
            let mut table = inner.callbacks.lock();
            if !inner.canceled.load(Ordering::Acquire) {
                let id = table.next_id;
                table.next_id += 1;
                table.entries.push((id, callback));
                return CancellationRegistration {
                    target: Some((Arc::clone(inner), id)),
                };
            }
        }

        callback();
        CancellationRegistration::empty()
    }
}

/// Keeps a cancellation callback registered until dropped.
#[must_use = "dropping the registration unregisters the callback"]
pub struct CancellationRegistration {
    target: Option<(Arc<TokenInner>, u64)>,
}

impl CancellationRegistration {
    const fn empty() -> Self {
        Self { target: None }
    }
}

impl Drop for CancellationRegistration {
    fn drop(&mut self) {
        if let Some((inner, id)) = self.target.take() {
            inner.callbacks.lock().entries.retain(|(entry, _)| *entry != id);
        }
    }
}

/// Handle for cancelling query execution.
///
/// This handle is separate from the execution pipeline and can be used
/// to signal cancellation from outside it.
#[derive(Clone, Default)]
pub struct CancellationHandle {
    inner: Arc<TokenInner>,
    links: Arc<Vec<CancellationRegistration>>,
}

impl std::fmt::Debug for CancellationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationHandle")
            .field("canceled", &self.is_cancelled())
            .field("links", &self.links.len())
            .finish()
    }
}

impl CancellationHandle {
    /// Create a new, uncancelled handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a handle that is cancelled whenever any of `parents` is.
    pub fn linked(parents: &[&CancellationToken]) -> Self {
        let inner = Arc::new(TokenInner::default());
        let links = parents
            .iter()
            .filter(|parent| parent.can_be_canceled())
            .map(|parent| {
                let child = Arc::clone(&inner);
                parent.register(move || {
                    child.cancel();
                })
            })
            .collect();
        Self {
            inner,
            links: Arc::new(links),
        }
    }

    /// A token observing this handle.
    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            inner: Some(Arc::clone(&self.inner)),
        }
    }

    /// Cancel. Returns `true` if this call performed the cancellation.
    pub fn cancel(&self) -> bool {
        self.inner.cancel()
    }

    /// Check if cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.canceled.load(Ordering::Acquire)
    }
}

// ============================================================================
// Cancellation State
// ============================================================================

struct StateInner {
    external: CancellationToken,
    internal: CancellationHandle,
    merged: CancellationHandle,
    disposed: AtomicBool,
    check_mask: usize,
}

/// Cancellation sources of one query.
///
/// Combines the caller's external token with an internal handle the engine
/// cancels on a worker fault or early disposal. Every hot loop and blocking
/// wait observes the merged token, so one check covers both causes.
#[derive(Clone)]
pub struct CancellationState {
    inner: Arc<StateInner>,
}

impl std::fmt::Debug for CancellationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationState")
            .field("external", &self.inner.external.is_cancelled())
            .field("internal", &self.inner.internal.is_cancelled())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl CancellationState {
    /// Create the state for a query polled every `check_interval` elements.
    ///
    /// `check_interval` must be a power of two.
    pub fn new(external: CancellationToken, check_interval: usize) -> Self {
        debug_assert!(check_interval.is_power_of_two());
        let internal = CancellationHandle::new();
        let internal_token = internal.token();
        let merged = CancellationHandle::linked(&[&external, &internal_token]);
        Self {
            inner: Arc::new(StateInner {
                external,
                internal,
                merged,
                disposed: AtomicBool::new(false),
                check_mask: check_interval - 1,
            }),
        }
    }

    /// State with no external token.
    pub fn detached(check_interval: usize) -> Self {
        Self::new(CancellationToken::none(), check_interval)
    }

    /// The token every loop and wait observes.
    pub fn merged_token(&self) -> CancellationToken {
        self.inner.merged.token()
    }

    /// The caller's token.
    pub fn external_token(&self) -> &CancellationToken {
        &self.inner.external
    }

    /// Cancel the query from inside the engine.
    pub fn cancel_internal(&self) -> bool {
        self.inner.internal.cancel()
    }

    /// Whether any source has cancelled the query.
    pub fn is_cancelled(&self) -> bool {
        self.inner.merged.is_cancelled()
    }

    /// Whether the caller's token fired.
    pub fn is_externally_cancelled(&self) -> bool {
        self.inner.external.is_cancelled()
    }

    /// Record that the consumer disposed of the query before it finished.
    pub fn set_disposed(&self) {
        self.inner.disposed.store(true, Ordering::Release);
    }

    /// Whether the consumer disposed of the query early.
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// The mask applied to hot-loop counters.
    pub fn check_mask(&self) -> usize {
        self.inner.check_mask
    }

    /// The error describing the current cancellation.
    pub fn cancellation_error(&self) -> QueryError {
        if self.is_externally_cancelled() {
            QueryError::canceled(CancelSource::External)
        } else {
            QueryError::canceled(CancelSource::Internal)
        }
    }

    /// Fail if the query was cancelled.
    pub fn check(&self) -> QueryResult<()> {
        if self.is_cancelled() {
            Err(self.cancellation_error())
        } else {
            Ok(())
        }
    }

    /// Hot-loop check: observes the token only when `counter & mask == 0`,
    /// then advances the counter.
    #[inline]
    pub fn poll(&self, counter: &mut usize) -> QueryResult<()> {
        let due = *counter & self.inner.check_mask == 0;
        *counter = counter.wrapping_add(1);
        if due { self.check() } else { Ok(()) }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn test_none_token_never_cancels() {
        let token = CancellationToken::none();
        assert!(!token.is_cancelled());
        assert!(!token.can_be_canceled());
        let _registration = token.register(|| panic!("must not run"));
    }

    #[test]
    fn test_cancellation() {
        let handle = CancellationHandle::new();
        let token = handle.token();

        assert!(!token.is_cancelled());
        assert!(handle.cancel());
        assert!(token.is_cancelled());
        assert!(!handle.cancel());
    }

    #[test]
    fn test_callbacks_run_once_and_unregister() {
        let handle = CancellationHandle::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counted = Arc::clone(&hits);
        let kept = handle.token().register(move || {
            counted.fetch_add(1, Ordering::SeqCst);
        });
        let dropped_hits = Arc::clone(&hits);
        drop(handle.token().register(move || {
            dropped_hits.fetch_add(100, Ordering::SeqCst);
        }));

        handle.cancel();
        handle.cancel();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        drop(kept);
    }

    #[test]
    fn test_register_after_cancel_runs_immediately() {
        let handle = CancellationHandle::new();
        handle.cancel();
        let hits = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&hits);
        let _registration = handle.token().register(move || {
            counted.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_linked_handle() {
        let a = CancellationHandle::new();
        let b = CancellationHandle::new();
        let linked = CancellationHandle::linked(&[&a.token(), &b.token()]);

        assert!(!linked.is_cancelled());
        b.cancel();
        assert!(linked.is_cancelled());
        assert!(!a.is_cancelled());
    }

    #[test]
    fn test_state_reports_source() {
        let external = CancellationHandle::new();
        let state = CancellationState::new(external.token(), 64);
        assert!(state.check().is_ok());

        state.cancel_internal();
        assert!(matches!(
            state.check(),
            Err(QueryError::Canceled(CancelSource::Internal))
        ));

        external.cancel();
        assert!(matches!(
            state.check(),
            Err(QueryError::Canceled(CancelSource::External))
        ));
    }

    #[test]
    fn test_poll_granularity() {
        let state = CancellationState::detached(64);
        state.cancel_internal();

        // counter 0 is due, 1..63 are not
        let mut counter = 1;
        for _ in 1..64 {
            assert!(state.poll(&mut counter).is_ok());
        }
        assert_eq!(counter, 64);
        assert!(state.poll(&mut counter).is_err());
    }
}
