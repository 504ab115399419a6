//! Concat.

use common_error::{QueryResult, ensure_contract};
use weft_core::{ConcatKey, KeyComparer, OrderKey, OrdinalIndexState};

use super::BinaryOperator;
use crate::settings::QuerySettings;
use crate::stream::{
    BoxedEnumerator, PartitionedStream, PartitionedStreamRecipient, QueryOperatorEnumerator,
};

/// Every left element, then every right element.
///
/// Partition `i` yields left partition `i` followed by right partition `i`;
/// [`ConcatKey`] orders all left keys before all right keys.
pub struct ConcatOperator<T> {
    _types: std::marker::PhantomData<fn(T)>,
}

impl<T> std::fmt::Debug for ConcatOperator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ConcatOperator")
    }
}

impl<T> Default for ConcatOperator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ConcatOperator<T> {
    /// Create the operator.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            _types: std::marker::PhantomData,
        }
    }
}

impl<T: Send + 'static> BinaryOperator for ConcatOperator<T> {
    type Left = T;
    type Right = T;
    type Output = T;

    fn name(&self) -> &'static str {
        "Concat"
    }

    fn output_state(&self, left: OrdinalIndexState, right: OrdinalIndexState) -> OrdinalIndexState {
        left.worse(right).worse(OrdinalIndexState::Increasing)
    }

    fn wrap_partitioned_streams<KL, KR, R>(
        &self,
        left: PartitionedStream<T, KL>,
        right: PartitionedStream<T, KR>,
        recipient: R,
        _ordered: bool,
        _settings: &QuerySettings,
    ) -> QueryResult<R::Output>
    where
        KL: OrderKey,
        KR: OrderKey,
        R: PartitionedStreamRecipient<T>,
    {
        ensure_contract!(
            left.partition_count() == right.partition_count(),
            "concat inputs have {} and {} partitions",
            left.partition_count(),
            right.partition_count()
        );
        let state = self.output_state(left.ordinal_index_state(), right.ordinal_index_state());
        let comparer = KeyComparer::concat(left.key_comparer().clone(), right.key_comparer().clone());
        let partitions = left
            .into_partitions()
            .into_iter()
            .zip(right.into_partitions())
            .map(|(left, right)| {
                Box::new(ConcatEnumerator {
                    left: Some(left),
                    right,
                }) as BoxedEnumerator<T, ConcatKey<KL, KR>>
            })
            .collect();
        recipient.receive(PartitionedStream::new(partitions, comparer, state))
    }
}

struct ConcatEnumerator<T, KL, KR> {
    left: Option<BoxedEnumerator<T, KL>>,
    right: BoxedEnumerator<T, KR>,
}

impl<T: Send, KL: OrderKey, KR: OrderKey> QueryOperatorEnumerator<T, ConcatKey<KL, KR>>
    for ConcatEnumerator<T, KL, KR>
{
    fn move_next(&mut self) -> QueryResult<Option<(T, ConcatKey<KL, KR>)>> {
        if let Some(left) = self.left.as_mut() {
            if let Some((item, key)) = left.move_next()? {
                return Ok(Some((item, ConcatKey::Left(key))));
            }
            self.left = None;
        }
        Ok(self
            .right
            .move_next()?
            .map(|(item, key)| (item, ConcatKey::Right(key))))
    }
}
