//! Fully buffered merge: N-1 worker tasks plus partition 0 on the calling
//! thread, each draining its partition into a private buffer.

use std::sync::Arc;

use common_error::{QueryError, QueryResult};
use common_runtime::QueryTaskGroupState;
use weft_core::OrderKey;

use super::PartitionTask;
use crate::channels::SynchronousChannel;
use crate::settings::QuerySettings;
use crate::sorting::SortHelper;
use crate::stream::{BoxedEnumerator, PartitionedStream, drain};

/// Produce the complete output of `stream`.
///
/// Ordered output is sorted by key with the cooperative sort; unordered
/// output is the concatenation of the partitions in partition order.
/// Ends `group` before returning.
pub fn fully_buffered<T, K>(
    stream: PartitionedStream<T, K>,
    ordered: bool,
    settings: &QuerySettings,
    group: &Arc<QueryTaskGroupState>,
) -> QueryResult<Vec<T>>
where
    T: Send + 'static,
    K: OrderKey,
{
    let result = if ordered {
        sorted(stream, settings, group)
    } else {
        concatenated(stream, settings, group)
    };
    // A fault elsewhere usually shows up on partition 0 as a cancellation;
    // the group's error is the one to report.
    group.query_end(false)?;
    result
}

fn sorted<T, K>(
    stream: PartitionedStream<T, K>,
    settings: &QuerySettings,
    group: &Arc<QueryTaskGroupState>,
) -> QueryResult<Vec<T>>
where
    T: Send + 'static,
    K: OrderKey,
{
    let (partitions, comparer, _) = stream.into_parts();
    let helper = Arc::new(SortHelper::new(
        partitions.len(),
        comparer,
        settings.cancellation().clone(),
    ));
    let mut partitions = partitions.into_iter().enumerate();
    let first = partitions.next();
    for (partition, mut enumerator) in partitions {
        let helper = Arc::clone(&helper);
        let task = PartitionTask::new(settings, partition);
        group.spawn(partition, move || {
            let _task = task;
            let items = drain(&mut enumerator)?;
            helper.sort(partition, items).map(drop)
        })?;
    }

    let mut output = None;
    if let Some((partition, mut enumerator)) = first {
        let _task = PartitionTask::new(settings, partition);
        group.run_inline(partition, || {
            let items = drain(&mut enumerator)?;
            output = helper.sort(partition, items)?;
            Ok(())
        });
    }
    output
        .map(|items| items.into_iter().map(|(item, _)| item).collect())
        .ok_or_else(|| settings.cancellation().cancellation_error())
}

fn concatenated<T, K>(
    stream: PartitionedStream<T, K>,
    settings: &QuerySettings,
    group: &Arc<QueryTaskGroupState>,
) -> QueryResult<Vec<T>>
where
    T: Send + 'static,
    K: OrderKey,
{
    let partitions = stream.into_partitions();
    let channels: Arc<Vec<SynchronousChannel<T>>> =
        Arc::new((0..partitions.len()).map(|_| SynchronousChannel::new()).collect());

    let mut partitions = partitions.into_iter().enumerate();
    let first = partitions.next();
    for (partition, enumerator) in partitions {
        let channels = Arc::clone(&channels);
        let task = PartitionTask::new(settings, partition);
        group.spawn(partition, move || {
            let _task = task;
            fill(enumerator, &channels[partition])
        })?;
    }
    if let Some((partition, enumerator)) = first {
        let _task = PartitionTask::new(settings, partition);
        group.run_inline(partition, || fill(enumerator, &channels[partition]));
    }
    // Stop-and-go: nothing is read until every producer is done.
    group.query_end(false)?;

    let channels = Arc::try_unwrap(channels).map_err(|_| {
        QueryError::internal("synchronous channels still shared after the task group ended")
    })?;
    let total = channels.iter().map(SynchronousChannel::len).sum();
    let mut items = Vec::with_capacity(total);
    for channel in channels {
        items.append(&mut channel.take_all());
    }
    Ok(items)
}

fn fill<T, K>(mut enumerator: BoxedEnumerator<T, K>, channel: &SynchronousChannel<T>) -> QueryResult<()> {
    let mut batch = Vec::new();
    while let Some((item, _)) = enumerator.move_next()? {
        batch.push(item);
    }
    channel.enqueue_all(batch);
    Ok(())
}

#[cfg(test)]
mod tests {
    use common_runtime::CancellationHandle;
    use weft_core::{KeyComparer, OrdinalIndexState};

    use super::*;
    use crate::settings::QueryContext;
    use crate::stream::{BufferedEnumerator, QueryOperatorEnumerator};

    struct Failing;

    impl QueryOperatorEnumerator<u32, usize> for Failing {
        fn move_next(&mut self) -> QueryResult<Option<(u32, usize)>> {
            panic!("selector blew up")
        }
    }

    fn stream(
        settings: &QuerySettings,
        parts: Vec<Vec<(u32, usize)>>,
    ) -> PartitionedStream<u32, usize> {
        let partitions = parts
            .into_iter()
            .map(|items| {
                Box::new(BufferedEnumerator::new(items, settings.cancellation().clone()))
                    as BoxedEnumerator<u32, usize>
            })
            .collect();
        PartitionedStream::new(partitions, KeyComparer::natural(), OrdinalIndexState::Shuffled)
    }

    fn group(settings: &QuerySettings) -> Arc<QueryTaskGroupState> {
        Arc::new(QueryTaskGroupState::new(
            settings.cancellation().clone(),
            settings.query_id(),
        ))
    }

    #[test]
    fn test_unordered_concatenates_in_partition_order() {
        let settings = QuerySettings::for_degree_of_parallelism(3).unwrap();
        let s = stream(&settings, vec![vec![(1, 9)], vec![(2, 0), (3, 1)], vec![]]);
        assert_eq!(fully_buffered(s, false, &settings, &group(&settings)).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_ordered_sorts_by_key() {
        let settings = QuerySettings::for_degree_of_parallelism(3).unwrap();
        let s = stream(&settings, vec![vec![(1, 9)], vec![(2, 0), (3, 1)], vec![(4, 5)]]);
        assert_eq!(fully_buffered(s, true, &settings, &group(&settings)).unwrap(), vec![2, 3, 4, 1]);
    }

    #[test]
    fn test_worker_panic_is_single_aggregate_fault() {
        let settings = QuerySettings::for_degree_of_parallelism(2).unwrap();
        let partitions: Vec<BoxedEnumerator<u32, usize>> = vec![
            Box::new(BufferedEnumerator::new(vec![(0, 0)], settings.cancellation().clone())),
            Box::new(Failing),
        ];
        let s = PartitionedStream::new(partitions, KeyComparer::natural(), OrdinalIndexState::Shuffled);
        match fully_buffered(s, true, &settings, &group(&settings)) {
            Err(QueryError::Aggregate(inner)) => {
                assert_eq!(inner.len(), 1);
                assert!(inner[0].to_string().contains("selector blew up"));
            }
            other => panic!("expected aggregate fault, got {other:?}"),
        }
    }

    #[test]
    fn test_external_cancel_reported_as_external() {
        let handle = CancellationHandle::new();
        let settings = QueryContext::new()
            .with_degree_of_parallelism(2)
            .with_cancellation(handle.token())
            .create_settings()
            .unwrap();
        handle.cancel();
        let s = stream(&settings, vec![vec![(1, 0)], vec![(2, 1)]]);
        let err = fully_buffered(s, false, &settings, &group(&settings)).unwrap_err();
        assert!(err.is_external_cancel());
    }
}
