//! Query task groups.
//!
//! A [`QueryTaskGroupState`] owns every worker task spawned for one merge
//! execution. Workers run on named OS threads; a failure in any of them
//! cancels the query's internal token at once so sibling partitions stop, and
//! the aggregated outcome is reported exactly once by
//! [`QueryTaskGroupState::query_end`].

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use common_error::{CancelSource, QueryError, QueryResult};
use log::{trace, warn};
use parking_lot::Mutex;

use crate::cancellation::CancellationState;

/// Allocate a process-unique query id.
pub fn next_query_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// Extract a readable message from a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "worker panicked".to_string()
    }
}

/// Run a unit of partition work, converting panics into faults and
/// cancelling the query on any failure other than cancellation itself.
pub fn run_guarded<F>(cancellation: &CancellationState, partition: usize, work: F) -> QueryResult<()>
where
    F: FnOnce() -> QueryResult<()>,
{
    let error = match catch_unwind(AssertUnwindSafe(work)) {
        Ok(Ok(())) => return Ok(()),
        Ok(Err(err)) if err.is_canceled() => return Err(err),
        Ok(Err(err)) => err,
        Err(payload) => QueryError::faulted(panic_message(payload.as_ref())),
    };
    warn!("partition {partition} faulted: {error}");
    cancellation.cancel_internal();
    Err(error)
}

struct WorkerTask {
    partition: usize,
    handle: JoinHandle<QueryResult<()>>,
}

/// State shared by all tasks of one query execution.
pub struct QueryTaskGroupState {
    query_id: u64,
    cancellation: CancellationState,
    tasks: Mutex<Vec<WorkerTask>>,
    inline_errors: Mutex<Vec<QueryError>>,
    ended: AtomicBool,
}

impl std::fmt::Debug for QueryTaskGroupState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryTaskGroupState")
            .field("query_id", &self.query_id)
            .field("tasks", &self.tasks.lock().len())
            .field("ended", &self.is_ended())
            .finish_non_exhaustive()
    }
}

impl QueryTaskGroupState {
    /// Create the task group for a query.
    pub fn new(cancellation: CancellationState, query_id: u64) -> Self {
        Self {
            query_id,
            cancellation,
            tasks: Mutex::new(Vec::new()),
            inline_errors: Mutex::new(Vec::new()),
            ended: AtomicBool::new(false),
        }
    }

    /// Id of the query this group belongs to.
    pub const fn query_id(&self) -> u64 {
        self.query_id
    }

    /// Cancellation state shared by every task in the group.
    pub const fn cancellation(&self) -> &CancellationState {
        &self.cancellation
    }

    /// Whether `query_end` has already run.
    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    /// Spawn `work` for `partition` on a dedicated worker thread.
    pub fn spawn<F>(&self, partition: usize, work: F) -> QueryResult<()>
    where
        F: FnOnce() -> QueryResult<()> + Send + 'static,
    {
        let cancellation = self.cancellation.clone();
        let query_id = self.query_id;
        let handle = thread::Builder::new()
            .name(format!("weft-q{query_id}-p{partition}"))
            .spawn(move || {
                trace!("query {query_id} partition {partition} started");
                let result = run_guarded(&cancellation, partition, work);
                trace!("query {query_id} partition {partition} finished");
                result
            })
            .map_err(|e| {
                self.cancellation.cancel_internal();
                QueryError::internal(format!("failed to spawn worker thread: {e}"))
            })?;

        self.tasks.lock().push(WorkerTask { partition, handle });
        Ok(())
    }

    /// Run `work` for `partition` on the calling thread, recording its
    /// failure like a spawned task's.
    pub fn run_inline<F>(&self, partition: usize, work: F)
    where
        F: FnOnce() -> QueryResult<()>,
    {
        if let Err(err) = run_guarded(&self.cancellation, partition, work) {
            self.inline_errors.lock().push(err);
        }
    }

    /// Join every task and report the query's outcome.
    ///
    /// Idempotent: only the first call joins and reports; later calls return
    /// `Ok(())`. With `user_initiated_dispose` the internal token is cancelled
    /// first so producers still running stop promptly, and the resulting
    /// cancellations are not reported as errors.
    pub fn query_end(&self, user_initiated_dispose: bool) -> QueryResult<()> {
        if self.ended.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if user_initiated_dispose {
            self.cancellation.set_disposed();
            self.cancellation.cancel_internal();
        }

        let tasks = std::mem::take(&mut *self.tasks.lock());
        let mut errors = std::mem::take(&mut *self.inline_errors.lock());
        for task in tasks {
            match task.handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => errors.push(err),
                Err(payload) => {
                    warn!(
                        "query {} partition {} panicked outside its guard",
                        self.query_id, task.partition
                    );
                    errors.push(QueryError::faulted(panic_message(payload.as_ref())));
                }
            }
        }

        self.resolve(errors)
    }

    fn resolve(&self, errors: Vec<QueryError>) -> QueryResult<()> {
        let (cancellations, faults): (Vec<_>, Vec<_>) =
            errors.into_iter().partition(QueryError::is_canceled);

        if !faults.is_empty() {
            let mut flattened = Vec::with_capacity(faults.len());
            for fault in faults {
                match fault {
                    QueryError::Aggregate(inner) => flattened.extend(inner),
                    other => flattened.push(other),
                }
            }
            return Err(QueryError::Aggregate(flattened));
        }

        if self.cancellation.is_externally_cancelled() {
            return Err(QueryError::canceled(CancelSource::External));
        }
        if self.cancellation.is_disposed() {
            return Ok(());
        }
        if !cancellations.is_empty() {
            return Err(QueryError::canceled(CancelSource::Internal));
        }
        Ok(())
    }
}

impl Drop for QueryTaskGroupState {
    fn drop(&mut self) {
        if !self.is_ended() {
            let _ = self.query_end(true);
        }
    }
}
