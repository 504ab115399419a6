//! Query lifecycle events.
//!
//! The engine reports query and partition boundaries to a [`QueryEventSink`].
//! The default sink does nothing; [`RecordingEventSink`] keeps per-query
//! counts and is what tests use to observe task lifecycles.

#![allow(clippy::significant_drop_tightening)] // Guards are scoped to one statement

use std::collections::HashMap;
use std::fmt::Write;
use std::sync::Arc;

use parking_lot::RwLock;

/// Receiver of query lifecycle events. Every method defaults to a no-op.
pub trait QueryEventSink: Send + Sync {
    /// A query was opened.
    fn query_begin(&self, _query_id: u64) {}

    /// A query finished, faulted or was disposed.
    fn query_end(&self, _query_id: u64) {}

    /// A partition task started.
    fn partition_begin(&self, _query_id: u64, _partition: usize) {}

    /// A partition task finished, whatever its outcome.
    fn partition_end(&self, _query_id: u64, _partition: usize) {}
}

/// Sink that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

impl QueryEventSink for NoopEventSink {}

/// Event counts for one query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryEventCounts {
    /// `query_begin` calls.
    pub begun: u64,
    /// `query_end` calls.
    pub ended: u64,
    /// `partition_begin` calls.
    pub partitions_begun: u64,
    /// `partition_end` calls.
    pub partitions_ended: u64,
}

impl QueryEventCounts {
    /// Whether every started partition also ended and the query ended once.
    pub const fn is_balanced(&self) -> bool {
        self.begun == self.ended && self.partitions_begun == self.partitions_ended
    }
}

/// Sink recording event counts per query id.
#[derive(Debug, Clone, Default)]
pub struct RecordingEventSink {
    events: Arc<RwLock<HashMap<u64, QueryEventCounts>>>,
}

impl RecordingEventSink {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    fn update<F: FnOnce(&mut QueryEventCounts)>(&self, query_id: u64, f: F) {
        let mut guard = self.events.write();
        f(guard.entry(query_id).or_default());
    }

    /// Counts recorded for a query.
    pub fn get(&self, query_id: u64) -> Option<QueryEventCounts> {
        self.events.read().get(&query_id).copied()
    }

    /// Ids of every query seen, ascending.
    pub fn query_ids(&self) -> Vec<u64> {
        let mut ids: Vec<_> = self.events.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Partition tasks started across all queries.
    pub fn total_partitions_begun(&self) -> u64 {
        self.events.read().values().map(|c| c.partitions_begun).sum()
    }

    /// Drop every recorded count.
    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// One line per query, for debugging output.
    pub fn format_summary(&self) -> String {
        let mut output = String::new();
        for id in self.query_ids() {
            if let Some(c) = self.get(id) {
                let _ = writeln!(
                    output,
                    "query {id}: begun={}, ended={}, partitions={}/{}",
                    c.begun, c.ended, c.partitions_ended, c.partitions_begun
                );
            }
        }
        if output.is_empty() {
            output.push_str("No events recorded.\n");
        }
        output
    }
}

impl QueryEventSink for RecordingEventSink {
    fn query_begin(&self, query_id: u64) {
        self.update(query_id, |c| c.begun += 1);
    }

    fn query_end(&self, query_id: u64) {
        self.update(query_id, |c| c.ended += 1);
    }

    fn partition_begin(&self, query_id: u64, _partition: usize) {
        self.update(query_id, |c| c.partitions_begun += 1);
    }

    fn partition_end(&self, query_id: u64, _partition: usize) {
        self.update(query_id, |c| c.partitions_ended += 1);
    }
}
