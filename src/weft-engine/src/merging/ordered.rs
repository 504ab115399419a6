//! Order-preserving pipelined merge.
//!
//! One producer task per partition pushes `(element, key)` pairs into its own
//! bounded buffer. The consumer keeps the head element of every producer and
//! a heap of their keys, always yielding the smallest. Since every partition
//! yields ascending keys, the smallest head is the next element overall.

use std::collections::VecDeque;
use std::sync::Arc;

use common_error::QueryResult;
use common_runtime::{CancellationState, Monitor, QueryTaskGroupState};
use weft_core::{FixedMaxHeap, KeyComparer, OrderKey};

use super::{MergeCursor, PartitionTask};
use crate::settings::QuerySettings;
use crate::stream::PartitionedStream;

struct ProducerBuffer<T, K> {
    items: VecDeque<(T, K)>,
    done: bool,
    producer_waiting: bool,
    consumer_waiting: bool,
}

#[derive(Clone)]
struct ProducerHead<K> {
    producer: usize,
    key: K,
}

/// Consumer side of the pipelined ordered merge.
pub struct OrderedPipelineMerge<T, K> {
    buffers: Vec<Monitor<ProducerBuffer<T, K>>>,
    // Batches already swapped out of the shared buffers.
    local: Vec<VecDeque<(T, K)>>,
    heads: Vec<Option<T>>,
    heap: FixedMaxHeap<ProducerHead<K>>,
    primed: bool,
    cancellation: CancellationState,
}

impl<T, K> std::fmt::Debug for OrderedPipelineMerge<T, K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderedPipelineMerge")
            .field("producers", &self.buffers.len())
            .field("primed", &self.primed)
            .finish_non_exhaustive()
    }
}

impl<T, K> OrderedPipelineMerge<T, K>
where
    T: Send + 'static,
    K: OrderKey,
{
    /// Spawn one producer per partition and return the consumer.
    pub fn start(
        stream: PartitionedStream<T, K>,
        settings: &QuerySettings,
        group: &Arc<QueryTaskGroupState>,
    ) -> QueryResult<Self> {
        let (partitions, comparer, _) = stream.into_parts();
        let count = partitions.len();
        let limit = settings.tuning().producer_buffer_limit.max(1);
        let buffers: Vec<_> = (0..count)
            .map(|_| {
                Monitor::new(ProducerBuffer {
                    items: VecDeque::new(),
                    done: false,
                    producer_waiting: false,
                    consumer_waiting: false,
                })
            })
            .collect();

        for (partition, mut enumerator) in partitions.into_iter().enumerate() {
            let buffer = buffers[partition].clone();
            let cancellation = settings.cancellation().clone();
            let task = PartitionTask::new(settings, partition);
            group.spawn(partition, move || {
                let _task = task;
                let result = produce(&mut enumerator, &buffer, limit, &cancellation);
                let mut shared = buffer.lock();
                shared.done = true;
                let wake = shared.consumer_waiting;
                drop(shared);
                if wake {
                    buffer.notify_all();
                }
                result
            })?;
        }

        // The heap is a max-heap: reverse the keys so the smallest key sits
        // on top, and let the lower producer index win ties.
        let heap_comparer = KeyComparer::new(move |a: &ProducerHead<K>, b: &ProducerHead<K>| {
            comparer
                .compare(&b.key, &a.key)
                .then(b.producer.cmp(&a.producer))
        });
        Ok(Self {
            buffers,
            local: (0..count).map(|_| VecDeque::new()).collect(),
            heads: (0..count).map(|_| None).collect(),
            heap: FixedMaxHeap::new(count, heap_comparer),
            primed: false,
            cancellation: settings.cancellation().clone(),
        })
    }

    /// Next pair from `producer`, blocking until one is available or the
    /// producer is done.
    fn fetch(&mut self, producer: usize) -> QueryResult<Option<(T, K)>> {
        if self.local[producer].is_empty() {
            let buffer = &self.buffers[producer];
            let mut shared = buffer.wait_until(&self.cancellation, |b| {
                let ready = !b.items.is_empty() || b.done;
                b.consumer_waiting = !ready;
                ready
            })?;
            std::mem::swap(&mut self.local[producer], &mut shared.items);
            let wake = std::mem::take(&mut shared.producer_waiting);
            drop(shared);
            if wake {
                buffer.notify_all();
            }
        }
        Ok(self.local[producer].pop_front())
    }

    fn prime(&mut self) -> QueryResult<()> {
        for producer in 0..self.buffers.len() {
            if let Some((item, key)) = self.fetch(producer)? {
                self.heads[producer] = Some(item);
                self.heap.insert(ProducerHead { producer, key });
            }
        }
        self.primed = true;
        Ok(())
    }
}

impl<T, K> MergeCursor<T> for OrderedPipelineMerge<T, K>
where
    T: Send + 'static,
    K: OrderKey,
{
    fn move_next(&mut self) -> QueryResult<Option<T>> {
        if !self.primed {
            self.prime()?;
        }
        let Some(producer) = self.heap.max_value().map(|head| head.producer) else {
            return Ok(None);
        };
        let item = self.heads[producer].take();
        match self.fetch(producer)? {
            Some((next, key)) => {
                self.heads[producer] = Some(next);
                self.heap.replace_max(ProducerHead { producer, key });
            }
            None => {
                self.heap.remove_max();
            }
        }
        Ok(item)
    }
}

fn produce<T, K>(
    enumerator: &mut crate::stream::BoxedEnumerator<T, K>,
    buffer: &Monitor<ProducerBuffer<T, K>>,
    limit: usize,
    cancellation: &CancellationState,
) -> QueryResult<()>
where
    T: Send + 'static,
    K: OrderKey,
{
    while let Some(pair) = enumerator.move_next()? {
        let mut shared = buffer.lock();
        if shared.items.len() >= limit {
            drop(shared);
            shared = buffer.wait_until(cancellation, |b| {
                let ready = b.items.len() < limit;
                b.producer_waiting = !ready;
                ready
            })?;
        }
        shared.items.push_back(pair);
        let wake = std::mem::take(&mut shared.consumer_waiting);
        drop(shared);
        if wake {
            buffer.notify_all();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use common_config::TuningConfig;
    use weft_core::OrdinalIndexState;

    use super::*;
    use crate::settings::QueryContext;
    use crate::stream::{BoxedEnumerator, BufferedEnumerator};

    fn run(parts: Vec<Vec<(u32, usize)>>, limit: usize) -> Vec<u32> {
        let ctx = QueryContext::new().with_options(
            common_config::QueryOptions::default()
                .with_degree_of_parallelism(parts.len())
                .with_tuning(TuningConfig::default().with_producer_buffer_limit(limit)),
        );
        let settings = ctx.create_settings().unwrap();
        let partitions = parts
            .into_iter()
            .map(|items| {
                Box::new(BufferedEnumerator::new(items, settings.cancellation().clone()))
                    as BoxedEnumerator<u32, usize>
            })
            .collect();
        let stream =
            PartitionedStream::new(partitions, KeyComparer::natural(), OrdinalIndexState::Increasing);
        let group = Arc::new(QueryTaskGroupState::new(
            settings.cancellation().clone(),
            settings.query_id(),
        ));
        let mut merge = OrderedPipelineMerge::start(stream, &settings, &group).unwrap();
        let mut out = Vec::new();
        while let Some(item) = merge.move_next().unwrap() {
            out.push(item);
        }
        group.query_end(false).unwrap();
        out
    }

    #[test]
    fn test_interleaves_by_key() {
        let out = run(
            vec![
                vec![(0, 0), (3, 3), (6, 6)],
                vec![(1, 1), (4, 4)],
                vec![(2, 2), (5, 5), (7, 7), (8, 8)],
            ],
            8192,
        );
        assert_eq!(out, (0..9).collect::<Vec<_>>());
    }

    #[test]
    fn test_small_buffer_limit_blocks_producers() {
        let a: Vec<_> = (0..500).map(|i| (i * 2, (i * 2) as usize)).collect();
        let b: Vec<_> = (0..500).map(|i| (i * 2 + 1, (i * 2 + 1) as usize)).collect();
        let out = run(vec![a, b, vec![]], 2);
        assert_eq!(out, (0..1000).collect::<Vec<_>>());
    }

    #[test]
    fn test_ties_go_to_lower_partition() {
        let out = run(vec![vec![(10, 1)], vec![(20, 1)], vec![(30, 0)]], 8192);
        assert_eq!(out, vec![30, 10, 20]);
    }
}
