//! Distinct, Union, Intersect and Except.
//!
//! Both inputs are hash-repartitioned with the same router, so equal
//! elements meet in one partition. Each partition then builds a local
//! [`HashLookup`]. When order matters the repartition keeps the order keys
//! and each distinct element keeps the smallest key among its occurrences.

use std::sync::Arc;

use common_error::QueryResult;
use common_runtime::CancellationState;
use weft_core::{
    ConcatKey, HashLookup, KeyComparer, LookupIntoIter, OrderKey, OrdinalIndexState,
    SharedEqualityComparer,
};

use super::{BinaryOperator, UnaryOperator};
use crate::exchange::{Router, hash_repartition, hash_repartition_ordered};
use crate::settings::QuerySettings;
use crate::stream::{
    BoxedEnumerator, PartitionedStream, PartitionedStreamRecipient, QueryOperatorEnumerator,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SetKind {
    Distinct,
    Union,
    Intersect,
    Except,
}

fn router_for<T: 'static>(equality: &SharedEqualityComparer<T>) -> Router<T> {
    let equality = Arc::clone(equality);
    Arc::new(move |item: &T| equality.hash(item))
}

/// Removes duplicate elements.
pub struct DistinctOperator<T> {
    equality: SharedEqualityComparer<T>,
}

impl<T> std::fmt::Debug for DistinctOperator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DistinctOperator")
    }
}

impl<T> DistinctOperator<T> {
    /// Compare elements with `equality`.
    #[must_use]
    pub fn new(equality: SharedEqualityComparer<T>) -> Self {
        Self { equality }
    }
}

impl<T: Send + 'static> UnaryOperator for DistinctOperator<T> {
    type Input = T;
    type Output = T;

    fn name(&self) -> &'static str {
        "Distinct"
    }

    fn output_state(&self, _input: OrdinalIndexState) -> OrdinalIndexState {
        OrdinalIndexState::Shuffled
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
        let router = router_for(&self.equality);
        if ordered {
            let comparer = input.key_comparer().clone();
            let input = hash_repartition_ordered(input, router, settings);
            recipient.receive(build_sets(
                SetKind::Distinct,
                &self.equality,
                input,
                None::<PartitionedStream<T, K>>,
                comparer,
                |k| k,
                |k| k,
                settings,
            ))
        } else {
            let input = hash_repartition(input, router, settings);
            recipient.receive(build_sets(
                SetKind::Distinct,
                &self.equality,
                input,
                None::<PartitionedStream<T, ()>>,
                KeyComparer::unit(),
                |()| (),
                |()| (),
                settings,
            ))
        }
    }
}

/// Union, Intersect or Except of two inputs. Results are distinct.
pub struct SetOperator<T> {
    kind: SetKind,
    equality: SharedEqualityComparer<T>,
}

impl<T> std::fmt::Debug for SetOperator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SetOperator")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl<T> SetOperator<T> {
    /// Elements in either input.
    #[must_use]
    pub fn union(equality: SharedEqualityComparer<T>) -> Self {
        Self {
            kind: SetKind::Union,
            equality,
        }
    }

    /// Elements of the left input also in the right.
    #[must_use]
    pub fn intersect(equality: SharedEqualityComparer<T>) -> Self {
        Self {
            kind: SetKind::Intersect,
            equality,
        }
    }

    /// Elements of the left input not in the right.
    #[must_use]
    pub fn except(equality: SharedEqualityComparer<T>) -> Self {
        Self {
            kind: SetKind::Except,
            equality,
        }
    }
}

impl<T: Send + 'static> BinaryOperator for SetOperator<T> {
    type Left = T;
    type Right = T;
    type Output = T;

    fn name(&self) -> &'static str {
        match self.kind {
            SetKind::Distinct => "Distinct",
            SetKind::Union => "Union",
            SetKind::Intersect => "Intersect",
            SetKind::Except => "Except",
        }
    }

    fn output_state(
        &self,
        _left: OrdinalIndexState,
        _right: OrdinalIndexState,
    ) -> OrdinalIndexState {
        OrdinalIndexState::Shuffled
    }

    fn wrap_partitioned_streams<KL, KR, R>(
        &self,
        left: PartitionedStream<T, KL>,
        right: PartitionedStream<T, KR>,
        recipient: R,
        ordered: bool,
        settings: &QuerySettings,
    ) -> QueryResult<R::Output>
    where
        KL: OrderKey,
        KR: OrderKey,
        R: PartitionedStreamRecipient<T>,
    {
        let router = router_for(&self.equality);
        let (kind, equality) = (self.kind, &self.equality);
        match (kind, ordered) {
            (SetKind::Union, true) => {
                let comparer = KeyComparer::concat(
                    left.key_comparer().clone(),
                    right.key_comparer().clone(),
                );
                let left = hash_repartition_ordered(left, Arc::clone(&router), settings);
                let right = hash_repartition_ordered(right, router, settings);
                recipient.receive(build_sets(
                    kind,
                    equality,
                    left,
                    Some(right),
                    comparer,
                    ConcatKey::Left,
                    ConcatKey::Right,
                    settings,
                ))
            }
            (_, true) => {
                let comparer = left.key_comparer().clone();
                let left = hash_repartition_ordered(left, Arc::clone(&router), settings);
                let right = hash_repartition(right, router, settings);
                recipient.receive(build_sets(
                    kind,
                    equality,
                    left,
                    Some(right),
                    comparer,
                    |k| k,
                    |()| KL::default(),
                    settings,
                ))
            }
            (_, false) => {
                let left = hash_repartition(left, Arc::clone(&router), settings);
                let right = hash_repartition(right, router, settings);
                recipient.receive(build_sets(
                    kind,
                    equality,
                    left,
                    Some(right),
                    KeyComparer::unit(),
                    |()| (),
                    |()| (),
                    settings,
                ))
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn build_sets<T, KL, KR, K>(
    kind: SetKind,
    equality: &SharedEqualityComparer<T>,
    left: PartitionedStream<T, KL>,
    right: Option<PartitionedStream<T, KR>>,
    key_comparer: KeyComparer<K>,
    left_key: fn(KL) -> K,
    right_key: fn(KR) -> K,
    settings: &QuerySettings,
) -> PartitionedStream<T, K>
where
    T: Send + 'static,
    KL: OrderKey,
    KR: OrderKey,
    K: OrderKey,
{
    let mut rights: Vec<Option<BoxedEnumerator<T, KR>>> = match right {
        Some(right) => right.into_partitions().into_iter().map(Some).collect(),
        None => (0..left.partition_count()).map(|_| None).collect(),
    };
    let partitions = left
        .into_partitions()
        .into_iter()
        .zip(rights.iter_mut())
        .map(|(left, right)| {
            Box::new(SetEnumerator {
                kind,
                left,
                right: right.take(),
                equality: Arc::clone(equality),
                key_comparer: key_comparer.clone(),
                left_key,
                right_key,
                output: None,
                cancellation: settings.cancellation().clone(),
            }) as BoxedEnumerator<T, K>
        })
        .collect();
    PartitionedStream::new(partitions, key_comparer, OrdinalIndexState::Shuffled)
}

struct SetEnumerator<T, KL, KR, K> {
    kind: SetKind,
    left: BoxedEnumerator<T, KL>,
    right: Option<BoxedEnumerator<T, KR>>,
    equality: SharedEqualityComparer<T>,
    key_comparer: KeyComparer<K>,
    left_key: fn(KL) -> K,
    right_key: fn(KR) -> K,
    output: Option<LookupIntoIter<T, K>>,
    cancellation: CancellationState,
}

impl<T, KL, KR, K> SetEnumerator<T, KL, KR, K>
where
    T: Send + 'static,
    KL: OrderKey,
    KR: OrderKey,
    K: OrderKey,
{
    /// Insert `item`, keeping the smaller key if it is already present.
    fn insert_min(
        &self,
        lookup: &mut HashLookup<T, K, SharedEqualityComparer<T>>,
        item: T,
        key: K,
    ) {
        match lookup.get_mut(&item) {
            Some(existing) => {
                if self.key_comparer.less(&key, existing) {
                    *existing = key;
                }
            }
            None => {
                lookup.insert(item, key);
            }
        }
    }

    fn build(&mut self) -> QueryResult<LookupIntoIter<T, K>> {
        let mut counter = 0usize;
        let mut result = HashLookup::new(Arc::clone(&self.equality));
        match self.kind {
            SetKind::Distinct | SetKind::Union => {
                while let Some((item, key)) = self.left.move_next()? {
                    self.cancellation.poll(&mut counter)?;
                    let key = (self.left_key)(key);
                    self.insert_min(&mut result, item, key);
                }
                if let Some(mut right) = self.right.take() {
                    while let Some((item, key)) = right.move_next()? {
                        self.cancellation.poll(&mut counter)?;
                        let key = (self.right_key)(key);
                        self.insert_min(&mut result, item, key);
                    }
                }
            }
            SetKind::Intersect | SetKind::Except => {
                let mut right_set = HashLookup::new(Arc::clone(&self.equality));
                if let Some(mut right) = self.right.take() {
                    while let Some((item, _)) = right.move_next()? {
                        self.cancellation.poll(&mut counter)?;
                        right_set.try_add(item, ());
                    }
                }
                let keep_present = self.kind == SetKind::Intersect;
                while let Some((item, key)) = self.left.move_next()? {
                    self.cancellation.poll(&mut counter)?;
                    if right_set.contains_key(&item) == keep_present {
                        let key = (self.left_key)(key);
                        self.insert_min(&mut result, item, key);
                    }
                }
            }
        }
        Ok(result.into_iter())
    }
}

impl<T, KL, KR, K> QueryOperatorEnumerator<T, K> for SetEnumerator<T, KL, KR, K>
where
    T: Send + 'static,
    KL: OrderKey,
    KR: OrderKey,
    K: OrderKey,
{
    fn move_next(&mut self) -> QueryResult<Option<(T, K)>> {
        if self.output.is_none() {
            self.output = Some(self.build()?);
        }
        Ok(self.output.as_mut().and_then(Iterator::next))
    }
}

#[cfg(test)]
mod tests {
    use crate::query::QueryExt;
    use crate::settings::QueryContext;
    use crate::source::{from_vec, range};

    fn sorted<T: Ord>(mut v: Vec<T>) -> Vec<T> {
        v.sort();
        v
    }

    #[test]
    fn test_distinct() {
        let ctx = QueryContext::new().with_degree_of_parallelism(4);
        let data = vec![3, 1, 3, 2, 1, 5, 5, 5];
        assert_eq!(sorted(from_vec(data.clone()).distinct().to_vec(&ctx).unwrap()), vec![1, 2, 3, 5]);
        // Ordered distinct keeps first occurrences in order.
        assert_eq!(from_vec(data).as_ordered().distinct().to_vec(&ctx).unwrap(), vec![3, 1, 2, 5]);
    }

    #[test]
    fn test_union_intersect_except() {
        let ctx = QueryContext::new().with_degree_of_parallelism(3);
        let a = || range(0, 10);
        let b = || range(5, 10);
        assert_eq!(sorted(a().union(b()).to_vec(&ctx).unwrap()), (0..15).collect::<Vec<_>>());
        assert_eq!(sorted(a().intersect(b()).to_vec(&ctx).unwrap()), (5..10).collect::<Vec<_>>());
        assert_eq!(sorted(a().except(b()).to_vec(&ctx).unwrap()), (0..5).collect::<Vec<_>>());
    }

    #[test]
    fn test_ordered_union_puts_left_first() {
        let ctx = QueryContext::new().with_degree_of_parallelism(2);
        let left = from_vec(vec![9, 8, 9]).as_ordered();
        let right = from_vec(vec![1, 8, 2]);
        assert_eq!(left.union(right).to_vec(&ctx).unwrap(), vec![9, 8, 1, 2]);
    }

    #[test]
    fn test_ordered_intersect_follows_left() {
        let ctx = QueryContext::new().with_degree_of_parallelism(4);
        let left = from_vec(vec![7, 3, 5, 3, 1]).as_ordered();
        let right = from_vec(vec![1, 3, 7]);
        assert_eq!(left.intersect(right).to_vec(&ctx).unwrap(), vec![7, 3, 1]);
    }
}
