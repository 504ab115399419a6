//! Reverse.

use common_error::QueryResult;
use common_runtime::CancellationState;
use weft_core::{OrderKey, OrdinalIndexState};

use super::UnaryOperator;
use crate::settings::QuerySettings;
use crate::stream::{
    BoxedEnumerator, PartitionedStream, PartitionedStreamRecipient, QueryOperatorEnumerator,
};

/// Reverses the order of the output.
///
/// Each partition buffers its elements and yields them back to front, and
/// the key comparer is reversed. Keys stay unique and ascend under the new
/// comparer, but no longer denote positions.
pub struct ReverseOperator<T> {
    _types: std::marker::PhantomData<fn(T)>,
}

impl<T> std::fmt::Debug for ReverseOperator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ReverseOperator")
    }
}

impl<T> Default for ReverseOperator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ReverseOperator<T> {
    /// Create the operator.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            _types: std::marker::PhantomData,
        }
    }
}

impl<T: Send + 'static> UnaryOperator for ReverseOperator<T> {
    type Input = T;
    type Output = T;

    fn name(&self) -> &'static str {
        "Reverse"
    }

    fn output_state(&self, input: OrdinalIndexState) -> OrdinalIndexState {
        input.worse(OrdinalIndexState::Increasing)
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
        let comparer = input.key_comparer().reversed();
        let state = self.output_state(input.ordinal_index_state());
        recipient.receive(input.map_partitions(comparer, state, |_, source| {
            Box::new(ReverseEnumerator {
                source: Some(source),
                buffered: Vec::new(),
                cancellation: settings.cancellation().clone(),
            })
        }))
    }
}

struct ReverseEnumerator<T, K> {
    source: Option<BoxedEnumerator<T, K>>,
    buffered: Vec<(T, K)>,
    cancellation: CancellationState,
}

impl<T: Send, K: OrderKey> QueryOperatorEnumerator<T, K> for ReverseEnumerator<T, K> {
    fn move_next(&mut self) -> QueryResult<Option<(T, K)>> {
        if let Some(mut source) = self.source.take() {
            let mut counter = 0usize;
            while let Some(pair) = source.move_next()? {
                self.cancellation.poll(&mut counter)?;
                self.buffered.push(pair);
            }
        }
        // Popping from the back yields the partition in reverse.
        Ok(self.buffered.pop())
    }
}

#[cfg(test)]
mod tests {
    use crate::query::QueryExt;
    use crate::settings::QueryContext;
    use crate::source::{from_iter, range};

    #[test]
    fn test_reverse_ordered_range() {
        for dop in [1, 2, 5] {
            let ctx = QueryContext::new().with_degree_of_parallelism(dop);
            let reversed = range(0, 40).as_ordered().reverse().to_vec(&ctx).unwrap();
            assert_eq!(reversed, (0..40).rev().collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_reverse_after_order_by() {
        let ctx = QueryContext::new().with_degree_of_parallelism(3);
        let items = from_iter(vec![5, 1, 4, 2, 3]).order_by(|x| *x).reverse().to_vec(&ctx).unwrap();
        assert_eq!(items, vec![5, 4, 3, 2, 1]);
    }
}
