//! AsOrdered and AsUnordered.

use common_error::QueryResult;
use weft_core::{OrderKey, OrdinalIndexState};

use super::UnaryOperator;
use crate::settings::QuerySettings;
use crate::stream::{PartitionedStream, PartitionedStreamRecipient};

/// Marks whether downstream operators and the merge must respect the
/// order keys. The stream passes through untouched.
pub struct OrderingOperator<T> {
    ordered: bool,
    _types: std::marker::PhantomData<fn(T)>,
}

impl<T> std::fmt::Debug for OrderingOperator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderingOperator")
            .field("ordered", &self.ordered)
            .finish()
    }
}

impl<T> OrderingOperator<T> {
    /// Preserve source order from here on.
    #[must_use]
    pub const fn as_ordered() -> Self {
        Self {
            ordered: true,
            _types: std::marker::PhantomData,
        }
    }

    /// Stop preserving order from here on.
    #[must_use]
    pub const fn as_unordered() -> Self {
        Self {
            ordered: false,
            _types: std::marker::PhantomData,
        }
    }
}

impl<T: Send + 'static> UnaryOperator for OrderingOperator<T> {
    type Input = T;
    type Output = T;

    fn name(&self) -> &'static str {
        if self.ordered { "AsOrdered" } else { "AsUnordered" }
    }

    fn output_state(&self, input: OrdinalIndexState) -> OrdinalIndexState {
        input
    }

    fn output_ordered(&self, _input_ordered: bool) -> bool {
        self.ordered
    }

    fn wrap_partitioned_stream<K, R>(
        &self,
        input: PartitionedStream<T, K>,
        recipient: R,
        _ordered: bool,
        _settings: &QuerySettings,
    ) -> QueryResult<R::Output>
    where
        K: OrderKey,
        R: PartitionedStreamRecipient<T>,
    {
        recipient.receive(input)
    }
}

#[cfg(test)]
mod tests {
    use crate::operators::QueryOperator;
    use crate::query::QueryExt;
    use crate::settings::QueryContext;
    use crate::source::range;

    #[test]
    fn test_ordering_flags() {
        let base = range(0, 10);
        assert!(!base.output_ordered());
        let ordered = range(0, 10).as_ordered();
        assert!(ordered.output_ordered());
        assert!(!ordered.as_unordered().output_ordered());
    }

    #[test]
    fn test_unordered_keeps_elements() {
        let ctx = QueryContext::new().with_degree_of_parallelism(4);
        let mut items = range(0, 100).as_ordered().as_unordered().to_vec(&ctx).unwrap();
        items.sort_unstable();
        assert_eq!(items, (0..100).collect::<Vec<_>>());
    }
}
