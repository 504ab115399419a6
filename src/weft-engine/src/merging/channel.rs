//! Unordered pipelined merge over asynchronous channels.
//!
//! Each producer task writes into its own [`AsynchronousChannel`]; the
//! consumer drains them round-robin. When every live channel is empty it arms
//! their "consumer waiting" flags and sleeps on a shared [`IntValueEvent`],
//! which the first producer to publish sets to its own index.

use std::sync::Arc;

use common_config::MergeOptions;
use common_error::QueryResult;
use common_runtime::{CancellationState, IntValueEvent, QueryTaskGroupState};
use weft_core::OrderKey;

use super::{MergeCursor, PartitionTask};
use crate::channels::{AsynchronousChannel, Dequeued, SharedChannel};
use crate::settings::QuerySettings;
use crate::stream::PartitionedStream;

/// Consumer side of the channel merge.
pub struct ChannelMerge<T> {
    channels: Vec<SharedChannel<T>>,
    done: Vec<bool>,
    remaining: usize,
    next_channel: usize,
    current: std::vec::IntoIter<T>,
    event: IntValueEvent,
    cancellation: CancellationState,
}

impl<T> std::fmt::Debug for ChannelMerge<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelMerge")
            .field("channels", &self.channels.len())
            .field("remaining", &self.remaining)
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> ChannelMerge<T> {
    /// Spawn one producer per partition and return the consumer.
    pub fn start<K: OrderKey>(
        stream: PartitionedStream<T, K>,
        settings: &QuerySettings,
        group: &Arc<QueryTaskGroupState>,
    ) -> QueryResult<Self> {
        let partitions = stream.into_partitions();
        let tuning = settings.tuning();
        let chunk_size = if settings.merge_options() == MergeOptions::NotBuffered {
            1
        } else {
            tuning.chunk_size
        };
        let event = IntValueEvent::new();
        let channels: Vec<SharedChannel<T>> = (0..partitions.len())
            .map(|index| {
                Arc::new(AsynchronousChannel::new(
                    index,
                    tuning.channel_capacity,
                    chunk_size,
                    event.clone(),
                    settings.cancellation().clone(),
                ))
            })
            .collect();

        for (partition, mut enumerator) in partitions.into_iter().enumerate() {
            let channel = Arc::clone(&channels[partition]);
            let task = PartitionTask::new(settings, partition);
            group.spawn(partition, move || {
                let _task = task;
                let produced = (|| {
                    while let Some((item, _)) = enumerator.move_next()? {
                        channel.enqueue(item)?;
                    }
                    channel.set_done()
                })();
                if produced.is_err() {
                    channel.abandon();
                }
                produced
            })?;
        }

        let count = channels.len();
        Ok(Self {
            channels,
            done: vec![false; count],
            remaining: count,
            next_channel: 0,
            current: Vec::new().into_iter(),
            event,
            cancellation: settings.cancellation().clone(),
        })
    }

    /// One round-robin pass; returns a chunk if any channel had one.
    fn scan(&mut self) -> Option<Vec<T>> {
        let count = self.channels.len();
        for _ in 0..count {
            let index = self.next_channel;
            self.next_channel = (self.next_channel + 1) % count;
            if self.done[index] {
                continue;
            }
            match self.channels[index].try_dequeue() {
                Dequeued::Chunk(chunk) => return Some(chunk),
                Dequeued::Done => {
                    self.done[index] = true;
                    self.remaining -= 1;
                }
                Dequeued::Empty => {}
            }
        }
        None
    }

    /// Sleep until a producer publishes. Returns early if any channel turns
    /// out to have data or be done while arming.
    fn wait_for_producer(&mut self) -> QueryResult<()> {
        self.event.reset();
        for (index, channel) in self.channels.iter().enumerate() {
            if !self.done[index] && !channel.arm_consumer_wait() {
                return Ok(());
            }
        }
        self.next_channel = self.event.wait(&self.cancellation)?;
        Ok(())
    }
}

impl<T: Send + 'static> MergeCursor<T> for ChannelMerge<T> {
    fn move_next(&mut self) -> QueryResult<Option<T>> {
        loop {
            if let Some(item) = self.current.next() {
                return Ok(Some(item));
            }
            if self.remaining == 0 {
                return Ok(None);
            }
            if let Some(chunk) = self.scan() {
                self.current = chunk.into_iter();
            } else if self.remaining > 0 {
                self.wait_for_producer()?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use weft_core::{KeyComparer, OrdinalIndexState};

    use super::*;
    use crate::settings::QueryContext;
    use crate::stream::{BoxedEnumerator, BufferedEnumerator};

    fn run(merge_options: MergeOptions, parts: Vec<Vec<u32>>) -> Vec<u32> {
        let settings = QueryContext::new()
            .with_degree_of_parallelism(parts.len())
            .with_merge_options(merge_options)
            .create_settings()
            .unwrap();
        let partitions = parts
            .into_iter()
            .map(|items| {
                let keyed = items.into_iter().map(|v| (v, ())).collect();
                Box::new(BufferedEnumerator::new(keyed, settings.cancellation().clone()))
                    as BoxedEnumerator<u32, ()>
            })
            .collect();
        let stream = PartitionedStream::new(partitions, KeyComparer::unit(), OrdinalIndexState::Shuffled);
        let group = Arc::new(QueryTaskGroupState::new(
            settings.cancellation().clone(),
            settings.query_id(),
        ));
        let mut merge = ChannelMerge::start(stream, &settings, &group).unwrap();
        let mut out = Vec::new();
        while let Some(item) = merge.move_next().unwrap() {
            out.push(item);
        }
        group.query_end(false).unwrap();
        out.sort_unstable();
        out
    }

    #[test]
    fn test_every_element_arrives_once() {
        for options in [MergeOptions::NotBuffered, MergeOptions::AutoBuffered] {
            let out = run(options, vec![(0..300).collect(), vec![], (300..1000).collect()]);
            assert_eq!(out, (0..1000).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_all_empty() {
        assert!(run(MergeOptions::AutoBuffered, vec![vec![], vec![]]).is_empty());
    }
}
