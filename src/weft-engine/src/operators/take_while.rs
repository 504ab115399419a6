//! TakeWhile and SkipWhile.
//!
//! Partitions share the lowest key whose element failed the predicate. Each
//! partition scans until its own first failure, or until it passes the
//! shared lowest failing key, then waits at a barrier. Afterwards TakeWhile
//! yields the buffered elements below the final lowest failing key and
//! SkipWhile yields everything at or above it.

use std::sync::Arc;

use common_error::QueryResult;
use common_runtime::{CancellationState, CountdownEvent};
use parking_lot::Mutex;
use weft_core::{KeyComparer, OrderKey, OrdinalIndexState};

use super::UnaryOperator;
use crate::merging::premature_merge;
use crate::settings::QuerySettings;
use crate::stream::{
    BoxedEnumerator, EmptyEnumerator, PartitionedStream, PartitionedStreamRecipient,
    QueryOperatorEnumerator,
};

/// Keeps (TakeWhile) or drops (SkipWhile) the leading run of elements that
/// satisfy a predicate.
pub struct TakeOrSkipWhileOperator<T, F> {
    predicate: Arc<F>,
    take: bool,
    _types: std::marker::PhantomData<fn(T)>,
}

impl<T, F> std::fmt::Debug for TakeOrSkipWhileOperator<T, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TakeOrSkipWhileOperator")
            .field("take", &self.take)
            .finish_non_exhaustive()
    }
}

impl<T, F> TakeOrSkipWhileOperator<T, F> {
    /// Keep elements while `predicate` holds.
    #[must_use]
    pub fn take_while(predicate: F) -> Self {
        Self {
            predicate: Arc::new(predicate),
            take: true,
            _types: std::marker::PhantomData,
        }
    }

    /// Drop elements while `predicate` holds.
    #[must_use]
    pub fn skip_while(predicate: F) -> Self {
        Self {
            predicate: Arc::new(predicate),
            take: false,
            _types: std::marker::PhantomData,
        }
    }
}

impl<T, F> TakeOrSkipWhileOperator<T, F>
where
    T: Send + 'static,
    F: Fn(&T) -> bool + Send + Sync + 'static,
{
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
            lowest_failure: Mutex::new(None),
            barrier: CountdownEvent::new(input.partition_count()),
            comparer: comparer.clone(),
            cancellation: settings.cancellation().clone(),
        });
        recipient.receive(input.map_partitions(comparer, state, |_, source| {
            Box::new(WhileEnumerator {
                shared: Arc::clone(&shared),
                predicate: Arc::clone(&self.predicate),
                take: self.take,
                phase: Phase::Pending(source),
            })
        }))
    }
}

impl<T, F> UnaryOperator for TakeOrSkipWhileOperator<T, F>
where
    T: Send + 'static,
    F: Fn(&T) -> bool + Send + Sync + 'static,
{
    type Input = T;
    type Output = T;

    fn name(&self) -> &'static str {
        if self.take { "TakeWhile" } else { "SkipWhile" }
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

struct Shared<K> {
    lowest_failure: Mutex<Option<K>>,
    barrier: CountdownEvent,
    comparer: KeyComparer<K>,
    cancellation: CancellationState,
}

impl<K: OrderKey> Shared<K> {
    fn at_or_past_failure(&self, key: &K) -> bool {
        self.lowest_failure
            .lock()
            .as_ref()
            .is_some_and(|failure| !self.comparer.less(key, failure))
    }

    fn record_failure(&self, key: &K) {
        let mut lowest = self.lowest_failure.lock();
        if lowest
            .as_ref()
            .is_none_or(|current| self.comparer.less(key, current))
        {
            *lowest = Some(key.clone());
        }
    }
}

enum Phase<T, K> {
    Pending(BoxedEnumerator<T, K>),
    Yielding {
        buffered: std::vec::IntoIter<(T, K)>,
        failure: Option<K>,
        pending: Option<(T, K)>,
        rest: BoxedEnumerator<T, K>,
    },
}

struct WhileEnumerator<T, K, F> {
    shared: Arc<Shared<K>>,
    predicate: Arc<F>,
    take: bool,
    phase: Phase<T, K>,
}

impl<T, K, F> WhileEnumerator<T, K, F>
where
    T: Send + 'static,
    K: OrderKey,
    F: Fn(&T) -> bool + Send + Sync,
{
    fn scan(&self, mut source: BoxedEnumerator<T, K>) -> QueryResult<Phase<T, K>> {
        let mut buffered = Vec::new();
        let mut pending = None;
        let mut counter = 0usize;
        while let Some((item, key)) = source.move_next()? {
            self.shared.cancellation.poll(&mut counter)?;
            if self.shared.at_or_past_failure(&key) {
                pending = Some((item, key));
                break;
            }
            if !(self.predicate)(&item) {
                self.shared.record_failure(&key);
                pending = Some((item, key));
                break;
            }
            buffered.push((item, key));
        }
        self.shared
            .barrier
            .signal_and_wait(&self.shared.cancellation)?;
        let failure = self.shared.lowest_failure.lock().clone();
        Ok(Phase::Yielding {
            buffered: buffered.into_iter(),
            failure,
            pending,
            rest: source,
        })
    }
}

impl<T, K, F> QueryOperatorEnumerator<T, K> for WhileEnumerator<T, K, F>
where
    T: Send + 'static,
    K: OrderKey,
    F: Fn(&T) -> bool + Send + Sync,
{
    fn move_next(&mut self) -> QueryResult<Option<(T, K)>> {
        if let Phase::Pending(source) = &mut self.phase {
            let source = std::mem::replace(source, Box::new(EmptyEnumerator));
            self.phase = self.scan(source)?;
        }
        let Phase::Yielding {
            buffered,
            failure,
            pending,
            rest,
        } = &mut self.phase
        else {
            return Ok(None);
        };
        let comparer = &self.shared.comparer;
        let before_failure =
            |key: &K| failure.as_ref().is_none_or(|failure| comparer.less(key, failure));
        if self.take {
            return Ok(buffered.find(|(_, key)| before_failure(key)));
        }
        if let Some(found) = buffered.find(|(_, key)| !before_failure(key)) {
            return Ok(Some(found));
        }
        if failure.is_none() {
            return Ok(None);
        }
        if let Some(found) = pending.take() {
            return Ok(Some(found));
        }
        rest.move_next()
    }
}

#[cfg(test)]
mod tests {
    use crate::query::QueryExt;
    use crate::settings::QueryContext;
    use crate::source::{from_vec, range};

    #[test]
    fn test_take_while_stops_at_first_failure() {
        let ctx = QueryContext::new().with_degree_of_parallelism(4);
        let data = vec![1, 2, 3, 10, 4, 5, 20, 1];
        let taken = from_vec(data.clone()).as_ordered().take_while(|x| *x < 10);
        assert_eq!(taken.to_vec(&ctx).unwrap(), vec![1, 2, 3]);
        let skipped = from_vec(data).as_ordered().skip_while(|x| *x < 10);
        assert_eq!(skipped.to_vec(&ctx).unwrap(), vec![10, 4, 5, 20, 1]);
    }

    #[test]
    fn test_never_failing_predicate() {
        let ctx = QueryContext::new().with_degree_of_parallelism(3);
        assert_eq!(range(0, 50).take_while(|_| true).count(&ctx).unwrap(), 50);
        assert_eq!(range(0, 50).skip_while(|_| true).count(&ctx).unwrap(), 0);
        assert_eq!(range(0, 50).skip_while(|_| false).count(&ctx).unwrap(), 50);
    }
}
