//! Zip.

use std::sync::Arc;

use common_error::QueryResult;
use weft_core::{OrderKey, OrdinalIndexState};

use super::BinaryOperator;
use crate::merging::premature_merge_to_vec;
use crate::settings::QuerySettings;
use crate::source::contiguous_stream;
use crate::stream::{
    BoxedEnumerator, PartitionedStream, PartitionedStreamRecipient, QueryOperatorEnumerator,
};

/// Pairs the i-th left element with the i-th right element and applies a
/// result selector. The shorter input decides the length.
///
/// Both inputs are merged first; the pairs are then split into contiguous
/// partitions so the selector still runs in parallel.
pub struct ZipOperator<L, R, O> {
    result: Arc<dyn Fn(L, R) -> O + Send + Sync>,
}

impl<L, R, O> std::fmt::Debug for ZipOperator<L, R, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ZipOperator")
    }
}

impl<L, R, O> ZipOperator<L, R, O> {
    /// Combine pairs with `result`.
    pub fn new<F>(result: F) -> Self
    where
        F: Fn(L, R) -> O + Send + Sync + 'static,
    {
        Self {
            result: Arc::new(result),
        }
    }
}

impl<L, R, O> BinaryOperator for ZipOperator<L, R, O>
where
    L: Send + 'static,
    R: Send + 'static,
    O: Send + 'static,
{
    type Left = L;
    type Right = R;
    type Output = O;

    fn name(&self) -> &'static str {
        "Zip"
    }

    fn output_state(
        &self,
        _left: OrdinalIndexState,
        _right: OrdinalIndexState,
    ) -> OrdinalIndexState {
        OrdinalIndexState::Indexable
    }

    fn limits_parallelism(
        &self,
        left: OrdinalIndexState,
        right: OrdinalIndexState,
        _ordered: bool,
    ) -> bool {
        left.is_worse_than(OrdinalIndexState::Indexable)
            || right.is_worse_than(OrdinalIndexState::Indexable)
    }

    fn wrap_partitioned_streams<KL, KR, Rc>(
        &self,
        left: PartitionedStream<L, KL>,
        right: PartitionedStream<R, KR>,
        recipient: Rc,
        ordered: bool,
        settings: &QuerySettings,
    ) -> QueryResult<Rc::Output>
    where
        KL: OrderKey,
        KR: OrderKey,
        Rc: PartitionedStreamRecipient<O>,
    {
        let count = left.partition_count();
        let left = premature_merge_to_vec(left, ordered, settings)?;
        let right = premature_merge_to_vec(right, ordered, settings)?;
        let pairs: Vec<(L, R)> = left.into_iter().zip(right).collect();
        let stream = contiguous_stream(pairs, count, settings.cancellation());
        let comparer = stream.key_comparer().clone();
        recipient.receive(stream.map_partitions(
            comparer,
            OrdinalIndexState::Indexable,
            |_, source| {
                Box::new(ZipEnumerator {
                    source,
                    result: Arc::clone(&self.result),
                })
            },
        ))
    }
}

struct ZipEnumerator<L, R, O> {
    source: BoxedEnumerator<(L, R), usize>,
    result: Arc<dyn Fn(L, R) -> O + Send + Sync>,
}

impl<L: Send, R: Send, O> QueryOperatorEnumerator<O, usize> for ZipEnumerator<L, R, O> {
    fn move_next(&mut self) -> QueryResult<Option<(O, usize)>> {
        Ok(self
            .source
            .move_next()?
            .map(|((left, right), key)| ((self.result)(left, right), key)))
    }
}

#[cfg(test)]
mod tests {
    use crate::query::QueryExt;
    use crate::settings::QueryContext;
    use crate::source::{from_vec, range};

    #[test]
    fn test_zip_pairs_by_position() {
        let ctx = QueryContext::new().with_degree_of_parallelism(4);
        let left = range(0, 10).as_ordered();
        let right = from_vec(vec!["a", "b", "c"]).as_ordered();
        let zipped = left.zip(right, |n, s| format!("{s}{n}")).to_vec(&ctx).unwrap();
        assert_eq!(zipped, vec!["a0", "b1", "c2"]);
    }

    #[test]
    fn test_zip_after_filter_merges_first() {
        let ctx = QueryContext::new().with_degree_of_parallelism(3);
        let evens = range(0, 20).as_ordered().filter(|x| x % 2 == 0);
        let odds = range(0, 20).as_ordered().filter(|x| x % 2 == 1);
        let sums = evens.zip(odds, |a, b| a + b).to_vec(&ctx).unwrap();
        assert_eq!(sums, vec![1, 5, 9, 13, 17, 21, 25, 29, 33, 37]);
    }
}
