//! DefaultIfEmpty.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use common_error::QueryResult;
use common_runtime::{CancellationState, CountdownEvent};
use weft_core::{OrderKey, OrdinalIndexState};

use super::UnaryOperator;
use crate::settings::QuerySettings;
use crate::stream::{BoxedEnumerator, PartitionedStream, PartitionedStreamRecipient, QueryOperatorEnumerator};

/// Passes the input through, or yields a single default value when the
/// whole input is empty.
///
/// Every partition pulls its first element, records whether it had one and
/// waits at a barrier; partition 0 then yields the default only if no
/// partition had anything.
#[derive(Debug)]
pub struct DefaultIfEmptyOperator<T> {
    default: T,
}

impl<T> DefaultIfEmptyOperator<T> {
    /// Yield `default` for an empty input.
    #[must_use]
    pub const fn new(default: T) -> Self {
        Self { default }
    }
}

impl<T: Clone + Send + Sync + 'static> UnaryOperator for DefaultIfEmptyOperator<T> {
    type Input = T;
    type Output = T;

    fn name(&self) -> &'static str {
        "DefaultIfEmpty"
    }

    // The default value carries the default key, which need not be a
    // valid position.
    fn output_state(&self, input: OrdinalIndexState) -> OrdinalIndexState {
        input.worse(OrdinalIndexState::Correct)
    }

    fn wrap_partitioned_stream<K, R>(
        &self,
        input: PartitionedStream<T, K>,
        recipient: R,
        _ordered: bool,
        settings: &QuerySettings,
    ) -> QueryResult<R::Output>
    where
        K: OrderKey,
        R: PartitionedStreamRecipient<T>,
    {
        let comparer = input.key_comparer().clone();
        let state = self.output_state(input.ordinal_index_state());
        let shared = Arc::new(EmptinessVote {
            non_empty: AtomicUsize::new(0),
            barrier: CountdownEvent::new(input.partition_count()),
            cancellation: settings.cancellation().clone(),
        });
        recipient.receive(input.map_partitions(comparer, state, |partition, source| {
            Box::new(DefaultIfEmptyEnumerator {
                partition,
                source,
                shared: Arc::clone(&shared),
                default: Some(self.default.clone()),
                started: false,
            })
        }))
    }
}

struct EmptinessVote {
    non_empty: AtomicUsize,
    barrier: CountdownEvent,
    cancellation: CancellationState,
}

struct DefaultIfEmptyEnumerator<T, K> {
    partition: usize,
    source: BoxedEnumerator<T, K>,
    shared: Arc<EmptinessVote>,
    default: Option<T>,
    started: bool,
}

impl<T: Send + Sync, K: OrderKey> QueryOperatorEnumerator<T, K> for DefaultIfEmptyEnumerator<T, K> {
    fn move_next(&mut self) -> QueryResult<Option<(T, K)>> {
        if self.started {
            return self.source.move_next();
        }
        self.started = true;
        let first = self.source.move_next()?;
        if first.is_some() {
            self.shared.non_empty.fetch_add(1, Ordering::AcqRel);
        }
        self.shared
            .barrier
            .signal_and_wait(&self.shared.cancellation)?;
        if first.is_some() {
            return Ok(first);
        }
        if self.partition == 0 && self.shared.non_empty.load(Ordering::Acquire) == 0 {
            return Ok(self.default.take().map(|value| (value, K::default())));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use crate::query::QueryExt;
    use crate::settings::QueryContext;
    use crate::source::range;

    #[test]
    fn test_default_only_for_empty_input() {
        let ctx = QueryContext::new().with_degree_of_parallelism(4);
        assert_eq!(range(0, 0).default_if_empty(-1).to_vec(&ctx).unwrap(), vec![-1]);
        let mut some = range(0, 3).default_if_empty(-1).to_vec(&ctx).unwrap();
        some.sort_unstable();
        assert_eq!(some, vec![0, 1, 2]);
    }

    #[test]
    fn test_empty_after_filter() {
        let ctx = QueryContext::new().with_degree_of_parallelism(3);
        let query = range(0, 100).filter(|x| *x > 1000).default_if_empty(7);
        assert_eq!(query.to_vec(&ctx).unwrap(), vec![7]);
    }
}
