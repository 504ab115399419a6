//! Caller-facing query context and per-execution settings.

use std::fmt;
use std::sync::Arc;

use common_config::{ExecutionMode, MergeOptions, QueryOptions, TuningConfig};
use common_error::QueryResult;
use common_runtime::{CancellationState, CancellationToken, next_query_id};

use crate::events::{NoopEventSink, QueryEventSink};

/// What a caller supplies to run queries: options, a cancellation token and
/// an event sink. One context can run any number of queries.
#[derive(Clone)]
pub struct QueryContext {
    options: QueryOptions,
    cancellation: CancellationToken,
    events: Arc<dyn QueryEventSink>,
}

impl Default for QueryContext {
    fn default() -> Self {
        Self {
            options: QueryOptions::default(),
            cancellation: CancellationToken::none(),
            events: Arc::new(NoopEventSink),
        }
    }
}

impl fmt::Debug for QueryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryContext")
            .field("options", &self.options)
            .field("cancellation", &self.cancellation)
            .finish_non_exhaustive()
    }
}

impl QueryContext {
    /// Context with default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the options.
    #[must_use]
    pub fn with_options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }

    /// Set the degree of parallelism.
    #[must_use]
    pub fn with_degree_of_parallelism(mut self, dop: usize) -> Self {
        self.options = self.options.with_degree_of_parallelism(dop);
        self
    }

    /// Set the execution mode.
    #[must_use]
    pub fn with_execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.options = self.options.with_execution_mode(mode);
        self
    }

    /// Set the merge options.
    #[must_use]
    pub fn with_merge_options(mut self, merge_options: MergeOptions) -> Self {
        self.options = self.options.with_merge_options(merge_options);
        self
    }

    /// Observe `token`; cancelling it cancels every query run with this context.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Report lifecycle events to `events`.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn QueryEventSink>) -> Self {
        self.events = events;
        self
    }

    /// The options in effect.
    pub const fn options(&self) -> &QueryOptions {
        &self.options
    }

    /// Validate the options and create the settings for one execution.
    pub fn create_settings(&self) -> QueryResult<QuerySettings> {
        self.options.validate()?;
        let tuning = self.options.tuning;
        Ok(QuerySettings {
            query_id: next_query_id(),
            degree_of_parallelism: self.options.effective_degree_of_parallelism(),
            execution_mode: self.options.execution_mode,
            merge_options: self.options.merge_options,
            tuning,
            cancellation: CancellationState::new(
                self.cancellation.clone(),
                tuning.cancellation_check_interval,
            ),
            events: Arc::clone(&self.events),
        })
    }
}

/// Settings of one query execution.
///
/// Created fresh for every execution: the query id and the cancellation
/// state are never shared between two runs.
#[derive(Clone)]
pub struct QuerySettings {
    query_id: u64,
    degree_of_parallelism: usize,
    execution_mode: ExecutionMode,
    merge_options: MergeOptions,
    tuning: TuningConfig,
    cancellation: CancellationState,
    events: Arc<dyn QueryEventSink>,
}

impl fmt::Debug for QuerySettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuerySettings")
            .field("query_id", &self.query_id)
            .field("degree_of_parallelism", &self.degree_of_parallelism)
            .field("execution_mode", &self.execution_mode)
            .field("merge_options", &self.merge_options)
            .field("tuning", &self.tuning)
            .field("cancellation", &self.cancellation)
            .finish_non_exhaustive()
    }
}

impl QuerySettings {
    /// Settings for a detached execution with the given degree of parallelism.
    pub fn for_degree_of_parallelism(dop: usize) -> QueryResult<Self> {
        QueryContext::new()
            .with_degree_of_parallelism(dop)
            .create_settings()
    }

    /// Id of this execution.
    pub const fn query_id(&self) -> u64 {
        self.query_id
    }

    /// Number of partitions.
    pub const fn degree_of_parallelism(&self) -> usize {
        self.degree_of_parallelism
    }

    /// Execution mode.
    pub const fn execution_mode(&self) -> ExecutionMode {
        self.execution_mode
    }

    /// Merge options.
    pub const fn merge_options(&self) -> MergeOptions {
        self.merge_options
    }

    /// Tuning constants.
    pub const fn tuning(&self) -> &TuningConfig {
        &self.tuning
    }

    /// Cancellation state shared by every task of this execution.
    pub const fn cancellation(&self) -> &CancellationState {
        &self.cancellation
    }

    /// Event sink.
    pub fn events(&self) -> &dyn QueryEventSink {
        self.events.as_ref()
    }

    /// Shared handle to the event sink, for tasks that outlive a borrow.
    pub fn event_sink(&self) -> Arc<dyn QueryEventSink> {
        Arc::clone(&self.events)
    }

    /// Same execution, different partition count.
    #[must_use]
    pub fn with_degree_of_parallelism(mut self, dop: usize) -> Self {
        self.degree_of_parallelism = dop;
        self
    }

    /// Same execution, different merge options.
    #[must_use]
    pub fn with_merge_options(mut self, merge_options: MergeOptions) -> Self {
        self.merge_options = merge_options;
        self
    }
}
