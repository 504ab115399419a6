//! First, Last and ElementAt.
//!
//! First and Last use winner announcement: every partition finds its local
//! candidate, offers it under a shared lock (replacing the current best only
//! if strictly better), and waits at a barrier. Only the partition whose
//! candidate won yields anything.

use std::any::{Any, TypeId};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use common_display::ExplainNode;
use common_error::QueryResult;
use common_runtime::{CancellationState, CountdownEvent};
use parking_lot::Mutex;
use weft_core::{KeyComparer, OrderKey, OrdinalIndexState};

use super::UnaryOperator;
use crate::merging::premature_merge;
use crate::settings::QuerySettings;
use crate::stream::{
    BoxedEnumerator, PartitionedStream, PartitionedStreamRecipient,
    QueryOperatorEnumerator,
};

fn merged_state(input: OrdinalIndexState, required: OrdinalIndexState) -> OrdinalIndexState {
    if input.is_worse_than(required) {
        OrdinalIndexState::Indexable
    } else {
        input
    }
}

/// Selects the element with the smallest (First) or largest (Last) key.
pub struct FirstOrLastOperator<T> {
    last: bool,
    _types: std::marker::PhantomData<fn(T)>,
}

impl<T> std::fmt::Debug for FirstOrLastOperator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FirstOrLastOperator")
            .field("last", &self.last)
            .finish()
    }
}

impl<T> FirstOrLastOperator<T> {
    /// Select the first element.
    #[must_use]
    pub const fn first() -> Self {
        Self {
            last: false,
            _types: std::marker::PhantomData,
        }
    }

    /// Select the last element.
    #[must_use]
    pub const fn last() -> Self {
        Self {
            last: true,
            _types: std::marker::PhantomData,
        }
    }
}

impl<T: Send + 'static> FirstOrLastOperator<T> {
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
        let shared = Arc::new(Announcement {
            best: Mutex::new(None),
            barrier: CountdownEvent::new(input.partition_count()),
            comparer: comparer.clone(),
            last: self.last,
            cancellation: settings.cancellation().clone(),
        });
        recipient.receive(input.map_partitions(comparer, state, |partition, source| {
            Box::new(FirstOrLastEnumerator {
                partition,
                shared: Arc::clone(&shared),
                source: Some(source),
            })
        }))
    }
}

impl<T: Send + 'static> UnaryOperator for FirstOrLastOperator<T> {
    type Input = T;
    type Output = T;

    fn name(&self) -> &'static str {
        if self.last { "Last" } else { "First" }
    }

    fn output_state(&self, input: OrdinalIndexState) -> OrdinalIndexState {
        merged_state(input, OrdinalIndexState::Increasing).worse(OrdinalIndexState::Increasing)
    }

    fn limits_parallelism(&self, input: OrdinalIndexState, _ordered: bool) -> bool {
        input.is_worse_than(OrdinalIndexState::Increasing)
    }

    fn prefer_striping(&self, requested: bool) -> bool {
        requested || !self.last
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

struct Announcement<K> {
    // (winning key, winning partition)
    best: Mutex<Option<(K, usize)>>,
    barrier: CountdownEvent,
    comparer: KeyComparer<K>,
    last: bool,
    cancellation: CancellationState,
}

impl<K: OrderKey> Announcement<K> {
    fn offer(&self, key: &K, partition: usize) {
        let mut best = self.best.lock();
        let better = best.as_ref().is_none_or(|(current, _)| {
            if self.last {
                self.comparer.less(current, key)
            } else {
                self.comparer.less(key, current)
            }
        });
        if better {
            *best = Some((key.clone(), partition));
        }
    }

    fn winner(&self) -> Option<usize> {
        self.best.lock().as_ref().map(|(_, partition)| *partition)
    }
}

struct FirstOrLastEnumerator<T, K> {
    partition: usize,
    shared: Arc<Announcement<K>>,
    source: Option<BoxedEnumerator<T, K>>,
}

impl<T: Send + 'static, K: OrderKey> QueryOperatorEnumerator<T, K> for FirstOrLastEnumerator<T, K> {
    fn move_next(&mut self) -> QueryResult<Option<(T, K)>> {
        let Some(mut source) = self.source.take() else {
            return Ok(None);
        };
        let candidate = if self.shared.last {
            let mut latest = None;
            let mut counter = 0usize;
            while let Some(pair) = source.move_next()? {
                self.shared.cancellation.poll(&mut counter)?;
                latest = Some(pair);
            }
            latest
        } else {
            source.move_next()?
        };
        if let Some((_, key)) = &candidate {
            self.shared.offer(key, self.partition);
        }
        self.shared
            .barrier
            .signal_and_wait(&self.shared.cancellation)?;
        if self.shared.winner() == Some(self.partition) {
            Ok(candidate)
        } else {
            Ok(None)
        }
    }
}

/// Selects the element whose key is exactly `index`.
pub struct ElementAtOperator<T> {
    index: usize,
    _types: std::marker::PhantomData<fn(T)>,
}

impl<T> std::fmt::Debug for ElementAtOperator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElementAtOperator")
            .field("index", &self.index)
            .finish()
    }
}

impl<T> ElementAtOperator<T> {
    /// Select the element at `index`.
    #[must_use]
    pub const fn new(index: usize) -> Self {
        Self {
            index,
            _types: std::marker::PhantomData,
        }
    }
}

impl<T: Send + 'static> ElementAtOperator<T> {
    fn wrap_correct<K, R>(
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
        let found = Arc::new(AtomicBool::new(false));
        let index = self.index;
        recipient.receive(input.map_partitions(comparer, state, |_, source| {
            Box::new(ElementAtEnumerator {
                source: Some(source),
                index,
                found: Arc::clone(&found),
                cancellation: settings.cancellation().clone(),
            })
        }))
    }
}

impl<T: Send + 'static> UnaryOperator for ElementAtOperator<T> {
    type Input = T;
    type Output = T;

    fn name(&self) -> &'static str {
        "ElementAt"
    }

    fn output_state(&self, input: OrdinalIndexState) -> OrdinalIndexState {
        merged_state(input, OrdinalIndexState::Correct).worse(OrdinalIndexState::Increasing)
    }

    fn limits_parallelism(&self, input: OrdinalIndexState, _ordered: bool) -> bool {
        input.is_worse_than(OrdinalIndexState::Correct)
    }

    fn prefer_striping(&self, _requested: bool) -> bool {
        true
    }

    fn explain_details(&self, node: ExplainNode) -> ExplainNode {
        node.with_detail("index", self.index)
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
        if !input
            .ordinal_index_state()
            .is_worse_than(OrdinalIndexState::Correct)
            && TypeId::of::<K>() == TypeId::of::<usize>()
        {
            self.wrap_correct(input, recipient, settings)
        } else {
            let merged = premature_merge(input, ordered, settings)?;
            self.wrap_correct(merged, recipient, settings)
        }
    }
}

/// Position encoded by the key of a stream in `Correct` state.
fn position<K: 'static>(key: &K) -> Option<usize> {
    (key as &dyn Any).downcast_ref::<usize>().copied()
}

struct ElementAtEnumerator<T, K> {
    source: Option<BoxedEnumerator<T, K>>,
    index: usize,
    found: Arc<AtomicBool>,
    cancellation: CancellationState,
}

impl<T: Send + 'static, K: OrderKey> QueryOperatorEnumerator<T, K> for ElementAtEnumerator<T, K> {
    fn move_next(&mut self) -> QueryResult<Option<(T, K)>> {
        let Some(mut source) = self.source.take() else {
            return Ok(None);
        };
        let mut counter = 0usize;
        while !self.found.load(Ordering::Acquire) {
            let Some((item, key)) = source.move_next()? else {
                break;
            };
            self.cancellation.poll(&mut counter)?;
            let Some(position) = position(&key) else {
                break;
            };
            if position == self.index {
                self.found.store(true, Ordering::Release);
                return Ok(Some((item, key)));
            }
            if position > self.index {
                break;
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::QueryExt;
    use crate::settings::QueryContext;
    use crate::source::{from_vec, range};

    #[test]
    fn test_first_and_last_pick_extreme_keys() {
        for dop in [1, 3, 8] {
            let ctx = QueryContext::new().with_degree_of_parallelism(dop);
            let data: Vec<u32> = (10..40).collect();
            assert_eq!(from_vec(data.clone()).as_ordered().first(&ctx).unwrap(), 10);
            assert_eq!(from_vec(data).as_ordered().last(&ctx).unwrap(), 39);
        }
    }

    #[test]
    fn test_first_after_filter() {
        let ctx = QueryContext::new().with_degree_of_parallelism(4);
        let query = range(0, 1000).as_ordered().filter(|x| x % 97 == 96);
        assert_eq!(query.first(&ctx).unwrap(), 96);
        assert_eq!(query.last(&ctx).unwrap(), 969);
    }

    #[test]
    fn test_empty_first_is_invalid_operation() {
        let ctx = QueryContext::new().with_degree_of_parallelism(2);
        let err = range(0, 0).first(&ctx).unwrap_err();
        assert!(matches!(err, common_error::QueryError::InvalidOperation(_)));
    }

    #[test]
    fn test_element_at() {
        let ctx = QueryContext::new().with_degree_of_parallelism(4);
        assert_eq!(range(100, 50).as_ordered().element_at(17, &ctx).unwrap(), 117);
        // Filtering breaks positions, forcing a merge first.
        let odd = range(0, 50).as_ordered().filter(|x| x % 2 == 1);
        assert_eq!(odd.element_at(3, &ctx).unwrap(), 7);
        assert!(range(0, 5).element_at(5, &ctx).is_err());
    }

    #[test]
    fn test_declared_states() {
        let first = FirstOrLastOperator::<u8>::first();
        assert_eq!(
            first.output_state(OrdinalIndexState::Shuffled),
            OrdinalIndexState::Increasing
        );
        assert!(first.limits_parallelism(OrdinalIndexState::Shuffled, true));
        let at = ElementAtOperator::<u8>::new(2);
        assert!(at.limits_parallelism(OrdinalIndexState::Increasing, true));
        assert!(!at.limits_parallelism(OrdinalIndexState::Correct, true));
    }
}
