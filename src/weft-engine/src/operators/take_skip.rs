//! Take and Skip.
//!
//! Each partition offers the keys of its leading elements to a shared heap
//! holding the `count` smallest keys seen anywhere, buffering at most `count`
//! elements. Since a partition's keys ascend, it stops offering at the first
//! rejected key. After a barrier the heap's maximum separates the kept
//! elements from the skipped ones.

use std::marker::PhantomData;
use std::sync::Arc;

use common_display::ExplainNode;
use common_error::QueryResult;
use common_runtime::{CancellationState, CountdownEvent};
use parking_lot::Mutex;
use weft_core::{FixedMaxHeap, KeyComparer, OrderKey, OrdinalIndexState};

use super::UnaryOperator;
use crate::merging::premature_merge;
use crate::settings::QuerySettings;
use crate::stream::{
    BoxedEnumerator, EmptyEnumerator, PartitionedStream, PartitionedStreamRecipient,
    QueryOperatorEnumerator,
};

/// Keeps (Take) or drops (Skip) the first `count` elements.
pub struct TakeOrSkipOperator<T> {
    count: usize,
    take: bool,
    _types: PhantomData<fn(T)>,
}

impl<T> std::fmt::Debug for TakeOrSkipOperator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TakeOrSkipOperator")
            .field("count", &self.count)
            .field("take", &self.take)
            .finish()
    }
}

impl<T> TakeOrSkipOperator<T> {
    /// Keep the first `count` elements.
    #[must_use]
    pub const fn take(count: usize) -> Self {
        Self {
            count,
            take: true,
            _types: PhantomData,
        }
    }

    /// Drop the first `count` elements.
    #[must_use]
    pub const fn skip(count: usize) -> Self {
        Self {
            count,
            take: false,
            _types: PhantomData,
        }
    }
}

impl<T: Send + 'static> TakeOrSkipOperator<T> {
    fn wrap_keyed<K, R>(
        &self,
        input: PartitionedStream<T, K>,
        recipient: R,
        settings: &QuerySettings,
    ) -> QueryResult<R::Output>
    where
        K: OrderKey,
        R: PartitionedStreamRecipient<T>,
    {
        let comparer = input.key_comparer().clone();
        let state = self.output_state(input.ordinal_index_state());
        let shared = Arc::new(Shared {
            heap: Mutex::new(FixedMaxHeap::new(self.count, comparer.clone())),
            barrier: CountdownEvent::new(input.partition_count()),
            comparer: comparer.clone(),
            cancellation: settings.cancellation().clone(),
        });
        let (count, take) = (self.count, self.take);
        recipient.receive(input.map_partitions(comparer, state, |_, source| {
            Box::new(TakeOrSkipEnumerator {
                shared: Arc::clone(&shared),
                count,
                take,
                state: Phase::Pending(source),
            })
        }))
    }
}

impl<T: Send + 'static> UnaryOperator for TakeOrSkipOperator<T> {
    type Input = T;
    type Output = T;

    fn name(&self) -> &'static str {
        if self.take { "Take" } else { "Skip" }
    }

    fn output_state(&self, input: OrdinalIndexState) -> OrdinalIndexState {
        let merged = if input.is_worse_than(OrdinalIndexState::Increasing) {
            OrdinalIndexState::Indexable
        } else {
            input
        };
        if self.take {
            merged.worse(OrdinalIndexState::Correct)
        } else {
            merged.worse(OrdinalIndexState::Increasing)
        }
    }

    fn limits_parallelism(&self, input: OrdinalIndexState, _ordered: bool) -> bool {
        input.is_worse_than(OrdinalIndexState::Increasing)
    }

    fn prefer_striping(&self, requested: bool) -> bool {
        requested || self.take
    }

    fn explain_details(&self, node: ExplainNode) -> ExplainNode {
        node.with_detail("count", self.count)
    }

    fn wrap_partitioned_stream<K, R>(
        &self,
        input: PartitionedStream<T, K>,
        recipient: R,
        ordered: bool,
        settings: &QuerySettings,
    ) -> QueryResult<R::Output>
    where
        K: OrderKey,
        R: PartitionedStreamRecipient<T>,
    {
        // Keys must be unique across partitions for the heap to be exact.
        if input
            .ordinal_index_state()
            .is_worse_than(OrdinalIndexState::Increasing)
        {
            let merged = premature_merge(input, ordered, settings)?;
            self.wrap_keyed(merged, recipient, settings)
        } else {
            self.wrap_keyed(input, recipient, settings)
        }
    }
}

struct Shared<K> {
    heap: Mutex<FixedMaxHeap<K>>,
    barrier: CountdownEvent,
    comparer: KeyComparer<K>,
    cancellation: CancellationState,
}

enum Phase<T, K> {
    Pending(BoxedEnumerator<T, K>),
    Yielding {
        buffered: std::vec::IntoIter<(T, K)>,
        max: Option<K>,
        pending: Option<(T, K)>,
        rest: BoxedEnumerator<T, K>,
    },
}

struct TakeOrSkipEnumerator<T, K> {
    shared: Arc<Shared<K>>,
    count: usize,
    take: bool,
    state: Phase<T, K>,
}

impl<T: Send + 'static, K: OrderKey> TakeOrSkipEnumerator<T, K> {
    fn gather(&self, mut source: BoxedEnumerator<T, K>) -> QueryResult<Phase<T, K>> {
        let mut buffered = Vec::new();
        let mut pending = None;
        let mut counter = 0usize;
        while buffered.len() < self.count {
            let Some((item, key)) = source.move_next()? else {
                break;
            };
            self.shared.cancellation.poll(&mut counter)?;
            if self.shared.heap.lock().offer(key.clone()) {
                buffered.push((item, key));
            } else {
                pending = Some((item, key));
                break;
            }
        }
        if self.count == 0 {
            pending = source.move_next()?;
        }
        self.shared
            .barrier
            .signal_and_wait(&self.shared.cancellation)?;
        let max = self.shared.heap.lock().max_value().cloned();
        Ok(Phase::Yielding {
            buffered: buffered.into_iter(),
            max,
            pending,
            rest: source,
        })
    }
}

impl<T: Send + 'static, K: OrderKey> QueryOperatorEnumerator<T, K> for TakeOrSkipEnumerator<T, K> {
    fn move_next(&mut self) -> QueryResult<Option<(T, K)>> {
        if let Phase::Pending(source) = &mut self.state {
            let source = std::mem::replace(source, Box::new(EmptyEnumerator));
            self.state = self.gather(source)?;
        }
        let Phase::Yielding {
            buffered,
            max,
            pending,
            rest,
        } = &mut self.state
        else {
            return Ok(None);
        };
        let comparer = &self.shared.comparer;
        if self.take {
            let Some(max) = max.as_ref() else {
                return Ok(None);
            };
            return Ok(buffered.find(|(_, key)| !comparer.less(max, key)));
        }
        let beyond = |key: &K| max.as_ref().is_none_or(|max| comparer.less(max, key));
        if let Some(found) = buffered.find(|(_, key)| beyond(key)) {
            return Ok(Some(found));
        }
        if let Some(found) = pending.take() {
            return Ok(Some(found));
        }
        rest.move_next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operators::{QueryOperator, UnaryQueryOperator};
    use crate::query::QueryExt;
    use crate::settings::QueryContext;
    use crate::source::{from_iter, range};

    #[test]
    fn test_declared_states() {
        let take = TakeOrSkipOperator::<u8>::take(3);
        let skip = TakeOrSkipOperator::<u8>::skip(3);
        assert_eq!(take.output_state(OrdinalIndexState::Indexable), OrdinalIndexState::Correct);
        assert_eq!(skip.output_state(OrdinalIndexState::Indexable), OrdinalIndexState::Increasing);
        assert_eq!(take.output_state(OrdinalIndexState::Shuffled), OrdinalIndexState::Correct);
        assert_eq!(take.output_state(OrdinalIndexState::Increasing), OrdinalIndexState::Increasing);
        assert!(take.limits_parallelism(OrdinalIndexState::Shuffled, false));
        assert!(take.prefer_striping(false));
        assert!(!skip.prefer_striping(false));
    }

    #[test]
    fn test_take_and_skip_over_range() {
        let ctx = QueryContext::new().with_degree_of_parallelism(4);
        let taken = UnaryQueryOperator::new(range(0, 100), TakeOrSkipOperator::take(7));
        assert_eq!(taken.as_ordered().to_vec(&ctx).unwrap(), (0..7).collect::<Vec<_>>());

        let skipped = UnaryQueryOperator::new(range(0, 100), TakeOrSkipOperator::skip(95));
        assert_eq!(skipped.as_ordered().to_vec(&ctx).unwrap(), (95..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_zero_and_oversized_counts() {
        let ctx = QueryContext::new().with_degree_of_parallelism(3);
        assert!(range(0, 10).take(0).to_vec(&ctx).unwrap().is_empty());
        assert_eq!(range(0, 10).skip(0).count(&ctx).unwrap(), 10);
        assert_eq!(range(0, 10).take(50).count(&ctx).unwrap(), 10);
        assert_eq!(range(0, 10).skip(50).count(&ctx).unwrap(), 0);
    }

    #[test]
    fn test_take_after_filter_over_iterator() {
        let ctx = QueryContext::new().with_degree_of_parallelism(4);
        let query = from_iter(0..1000u32)
            .as_ordered()
            .filter(|x| x % 3 == 0)
            .take(4);
        assert_eq!(query.ordinal_index_state(), OrdinalIndexState::Increasing);
        assert_eq!(query.to_vec(&ctx).unwrap(), vec![0, 3, 6, 9]);
    }
}
