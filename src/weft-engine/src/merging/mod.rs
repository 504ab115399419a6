//! Merging partitioned output into a single result.
//!
//! | Strategy | Used when |
//! |----------|-----------|
//! | fully buffered ([`buffered`]) | `FullyBuffered`, vector terminals, or ordered output whose keys must be sorted |
//! | indexed ([`materialize_indexed`]) | ordered vector terminals whose results support random access |
//! | pipelined ordered ([`ordered`]) | ordered output with state `Increasing` or better |
//! | channels ([`channel`]) | unordered streaming output |
//!
//! Every partition task reports `partition_begin`/`partition_end` through the
//! query's event sink and runs under the query's task group, so faults are
//! captured and surfaced once when the group ends.

mod buffered;
mod channel;
mod ordered;

use std::sync::Arc;

use common_config::MergeOptions;
use common_error::QueryResult;
use common_runtime::QueryTaskGroupState;
use log::debug;
use parking_lot::Mutex;
use weft_core::{OrderKey, OrdinalIndexState};

use crate::events::QueryEventSink;
use crate::settings::QuerySettings;
use crate::source::{contiguous_stream, partition_bounds};
use crate::stream::{IndexedSource, PartitionedStream};

pub use buffered::fully_buffered;
pub use channel::ChannelMerge;
pub use ordered::OrderedPipelineMerge;

/// Pull cursor over merged output.
pub trait MergeCursor<T>: Send {
    /// Next merged element.
    fn move_next(&mut self) -> QueryResult<Option<T>>;
}

/// Output of a streaming merge.
pub enum MergedOutput<T> {
    /// Everything was produced before the first element was returned.
    Buffered(std::vec::IntoIter<T>),
    /// Elements arrive while the partitions still run.
    Streaming(Box<dyn MergeCursor<T>>),
}

impl<T> std::fmt::Debug for MergedOutput<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buffered(items) => f.debug_tuple("Buffered").field(&items.len()).finish(),
            Self::Streaming(_) => f.write_str("Streaming"),
        }
    }
}

impl<T: Send> MergedOutput<T> {
    /// Next element.
    pub fn move_next(&mut self) -> QueryResult<Option<T>> {
        match self {
            Self::Buffered(items) => Ok(items.next()),
            Self::Streaming(cursor) => cursor.move_next(),
        }
    }
}

/// Pick a streaming strategy for `stream` and start its partition tasks.
pub fn merge<T, K>(
    stream: PartitionedStream<T, K>,
    ordered: bool,
    settings: &QuerySettings,
    group: &Arc<QueryTaskGroupState>,
) -> QueryResult<MergedOutput<T>>
where
    T: Send + 'static,
    K: OrderKey,
{
    let state = stream.ordinal_index_state();
    if settings.merge_options() == MergeOptions::FullyBuffered
        || (ordered && state.is_worse_than(OrdinalIndexState::Increasing))
    {
        debug!(
            "query {}: fully buffered merge (ordered={ordered}, state={state})",
            settings.query_id()
        );
        return Ok(MergedOutput::Buffered(
            fully_buffered(stream, ordered, settings, group)?.into_iter(),
        ));
    }
    if ordered {
        debug!("query {}: pipelined ordered merge", settings.query_id());
        let merge = OrderedPipelineMerge::start(stream, settings, group)?;
        return Ok(MergedOutput::Streaming(Box::new(merge)));
    }
    debug!(
        "query {}: channel merge ({:?})",
        settings.query_id(),
        settings.merge_options()
    );
    let merge = ChannelMerge::start(stream, settings, group)?;
    Ok(MergedOutput::Streaming(Box::new(merge)))
}

/// Run the whole query to completion and return its output as a vector.
///
/// Ends `group`; a worker fault surfaces as the group's error.
pub fn merge_to_vec<T, K>(
    stream: PartitionedStream<T, K>,
    ordered: bool,
    settings: &QuerySettings,
    group: &Arc<QueryTaskGroupState>,
) -> QueryResult<Vec<T>>
where
    T: Send + 'static,
    K: OrderKey,
{
    fully_buffered(stream, ordered, settings, group)
}

/// Materialize a stream mid-query into `Indexable` partitions.
///
/// Used when an operator needs a stronger ordinal state than its input
/// provides. Runs under its own task group sharing the query's cancellation.
pub fn premature_merge<T, K>(
    stream: PartitionedStream<T, K>,
    ordered: bool,
    settings: &QuerySettings,
) -> QueryResult<PartitionedStream<T, usize>>
where
    T: Send + 'static,
    K: OrderKey,
{
    let count = stream.partition_count();
    let items = premature_merge_to_vec(stream, ordered, settings)?;
    Ok(contiguous_stream(items, count, settings.cancellation()))
}

/// Run a stream to completion mid-query and return its elements, in key
/// order when `ordered`.
pub fn premature_merge_to_vec<T, K>(
    stream: PartitionedStream<T, K>,
    ordered: bool,
    settings: &QuerySettings,
) -> QueryResult<Vec<T>>
where
    T: Send + 'static,
    K: OrderKey,
{
    debug!(
        "query {}: premature merge of {} partitions (state={})",
        settings.query_id(),
        stream.partition_count(),
        stream.ordinal_index_state()
    );
    let group = Arc::new(QueryTaskGroupState::new(
        settings.cancellation().clone(),
        settings.query_id(),
    ));
    merge_to_vec(stream, ordered, settings, &group)
}

/// Drain every partition for effect, applying `action` to each element.
/// Ends `group`.
pub fn spool_for_all<T, K, F>(
    stream: PartitionedStream<T, K>,
    action: Arc<F>,
    settings: &QuerySettings,
    group: &Arc<QueryTaskGroupState>,
) -> QueryResult<()>
where
    T: Send + 'static,
    K: OrderKey,
    F: Fn(T) + Send + Sync + 'static,
{
    debug!("query {}: for-all spool", settings.query_id());
    let mut partitions = stream.into_partitions().into_iter().enumerate();
    let first = partitions.next();
    for (partition, mut enumerator) in partitions {
        let action = Arc::clone(&action);
        let task = PartitionTask::new(settings, partition);
        group.spawn(partition, move || {
            let _task = task;
            while let Some((item, _)) = enumerator.move_next()? {
                action(item);
            }
            Ok(())
        })?;
    }
    if let Some((partition, mut enumerator)) = first {
        let _task = PartitionTask::new(settings, partition);
        group.run_inline(partition, || {
            while let Some((item, _)) = enumerator.move_next()? {
                action(item);
            }
            Ok(())
        });
    }
    group.query_end(false)
}

/// Compute every element of an indexed result in parallel ranges.
/// Ends `group`.
pub fn materialize_indexed<T: Send + 'static>(
    source: &Arc<dyn IndexedSource<T>>,
    settings: &QuerySettings,
    group: &Arc<QueryTaskGroupState>,
) -> QueryResult<Vec<T>> {
    let count = settings.degree_of_parallelism();
    let len = source.len();
    debug!(
        "query {}: indexed merge of {len} elements",
        settings.query_id()
    );
    let slots: Arc<Vec<Mutex<Vec<T>>>> =
        Arc::new((0..count).map(|_| Mutex::new(Vec::new())).collect());

    for partition in 1..count {
        let source = Arc::clone(source);
        let slots = Arc::clone(&slots);
        let task_settings = settings.clone();
        let task = PartitionTask::new(settings, partition);
        group.spawn(partition, move || {
            let _task = task;
            fill_range(source.as_ref(), partition, count, &slots, &task_settings)
        })?;
    }
    {
        let _task = PartitionTask::new(settings, 0);
        group.run_inline(0, || fill_range(source.as_ref(), 0, count, &slots, settings));
    }
    group.query_end(false)?;

    let mut items = Vec::with_capacity(len);
    for slot in slots.iter() {
        items.append(&mut slot.lock());
    }
    Ok(items)
}

fn fill_range<T>(
    source: &dyn IndexedSource<T>,
    partition: usize,
    count: usize,
    slots: &[Mutex<Vec<T>>],
    settings: &QuerySettings,
) -> QueryResult<()> {
    let (start, end) = partition_bounds(source.len(), count, partition);
    let mut out = Vec::with_capacity(end - start);
    let mut counter = 0usize;
    for index in start..end {
        settings.cancellation().poll(&mut counter)?;
        out.push(source.get(index));
    }
    *slots[partition].lock() = out;
    Ok(())
}

/// Reports a partition's begin on creation and its end on drop, so the
/// pair stays balanced whether the work succeeds, fails or panics.
pub(crate) struct PartitionTask {
    events: Arc<dyn QueryEventSink>,
    query_id: u64,
    partition: usize,
}

impl PartitionTask {
    pub(crate) fn new(settings: &QuerySettings, partition: usize) -> Self {
        let events = settings.event_sink();
        events.partition_begin(settings.query_id(), partition);
        Self {
            events,
            query_id: settings.query_id(),
            partition,
        }
    }
}

impl Drop for PartitionTask {
    fn drop(&mut self) {
        self.events.partition_end(self.query_id, self.partition);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingEventSink;
    use crate::settings::QueryContext;
    use crate::source::{DataSource, IndexedDataSource, RangeSource};
    use crate::stream::{BoxedEnumerator, BufferedEnumerator};
    use weft_core::KeyComparer;

    fn shuffled_stream(settings: &QuerySettings) -> PartitionedStream<u32, usize> {
        let parts: Vec<Vec<(u32, usize)>> =
            vec![vec![(3, 3), (0, 0)], vec![(4, 4), (1, 1)], vec![(2, 2)]];
        let partitions = parts
            .into_iter()
            .map(|items| {
                Box::new(BufferedEnumerator::new(items, settings.cancellation().clone()))
                    as BoxedEnumerator<u32, usize>
            })
            .collect();
        PartitionedStream::new(partitions, KeyComparer::natural(), OrdinalIndexState::Shuffled)
    }

    fn group_for(settings: &QuerySettings) -> Arc<QueryTaskGroupState> {
        Arc::new(QueryTaskGroupState::new(
            settings.cancellation().clone(),
            settings.query_id(),
        ))
    }

    #[test]
    fn test_premature_merge_restores_order() {
        let settings = QuerySettings::for_degree_of_parallelism(3).unwrap();
        let merged = premature_merge(shuffled_stream(&settings), true, &settings).unwrap();
        assert_eq!(merged.ordinal_index_state(), OrdinalIndexState::Indexable);
        let items: Vec<_> = merged
            .into_partitions()
            .iter_mut()
            .flat_map(|p| crate::stream::drain(p).unwrap())
            .collect();
        assert_eq!(items, vec![(0, 0), (1, 1), (2, 2), (3, 3), (4, 4)]);
    }

    #[test]
    fn test_shuffled_ordered_stream_is_sorted_when_streamed() {
        let settings = QuerySettings::for_degree_of_parallelism(3).unwrap();
        let group = group_for(&settings);
        let mut output = merge(shuffled_stream(&settings), true, &settings, &group).unwrap();
        assert!(matches!(output, MergedOutput::Buffered(_)));
        let mut items = Vec::new();
        while let Some(item) = output.move_next().unwrap() {
            items.push(item);
        }
        assert_eq!(items, vec![0, 1, 2, 3, 4]);
        group.query_end(false).unwrap();
    }

    #[test]
    fn test_indexed_merge_and_events() {
        let sink = Arc::new(RecordingEventSink::new());
        let settings = QueryContext::new()
            .with_degree_of_parallelism(4)
            .with_event_sink(sink.clone())
            .create_settings()
            .unwrap();
        let source: Arc<dyn IndexedSource<i64>> = Arc::new(RangeSource::new(5, 10));
        let items = materialize_indexed(&source, &settings, &group_for(&settings)).unwrap();
        assert_eq!(items, (5..15).collect::<Vec<_>>());
        let counts = sink.get(settings.query_id()).unwrap();
        assert_eq!(counts.partitions_begun, 4);
        assert!(counts.is_balanced());
    }

    #[test]
    fn test_for_all_visits_everything() {
        let settings = QuerySettings::for_degree_of_parallelism(4).unwrap();
        let source = IndexedDataSource::new("range", Arc::new(RangeSource::new(0, 1000)));
        let results = source.partition(&settings, false).unwrap();
        let total = Arc::new(std::sync::atomic::AtomicI64::new(0));
        let sum = Arc::clone(&total);
        let stream = results.into_stream();
        spool_for_all(
            stream,
            Arc::new(move |v: i64| {
                sum.fetch_add(v, std::sync::atomic::Ordering::Relaxed);
            }),
            &settings,
            &group_for(&settings),
        )
        .unwrap();
        assert_eq!(total.load(std::sync::atomic::Ordering::Relaxed), 499_500);
    }
}
