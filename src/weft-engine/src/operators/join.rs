//! Join and GroupJoin.
//!
//! Both sides are hash-repartitioned on their join keys. Each partition
//! builds a [`HashLookup`] from its share of the right side, then streams its
//! share of the left side through it.

use std::collections::VecDeque;
use std::sync::Arc;

use common_error::{QueryResult, ensure_contract};
use common_runtime::CancellationState;
use weft_core::{
    HashLookup, KeyComparer, OrderKey, OrdinalIndexState, Pair, SharedEqualityComparer,
};

use super::BinaryOperator;
use crate::exchange::{Router, hash_repartition, hash_repartition_ordered};
use crate::settings::QuerySettings;
use crate::stream::{
    BoxedEnumerator, PartitionedStream, PartitionedStreamRecipient, QueryOperatorEnumerator,
};

/// Key selectors and equality shared by both join flavours.
struct JoinKeys<L, R, JK> {
    left_key: Arc<dyn Fn(&L) -> JK + Send + Sync>,
    right_key: Arc<dyn Fn(&R) -> JK + Send + Sync>,
    equality: SharedEqualityComparer<JK>,
}

impl<L, R, JK> Clone for JoinKeys<L, R, JK> {
    fn clone(&self) -> Self {
        Self {
            left_key: Arc::clone(&self.left_key),
            right_key: Arc::clone(&self.right_key),
            equality: Arc::clone(&self.equality),
        }
    }
}

impl<L: 'static, R: 'static, JK: 'static> JoinKeys<L, R, JK> {
    fn left_router(&self) -> Router<L> {
        let (select, equality) = (Arc::clone(&self.left_key), Arc::clone(&self.equality));
        Arc::new(move |item: &L| equality.hash(&select(item)))
    }

    fn right_router(&self) -> Router<R> {
        let (select, equality) = (Arc::clone(&self.right_key), Arc::clone(&self.equality));
        Arc::new(move |item: &R| equality.hash(&select(item)))
    }
}

/// Right side of one partition, grouped by join key.
type RightLookup<R, JK, KR> = HashLookup<JK, Vec<(R, KR)>, SharedEqualityComparer<JK>>;

fn build_lookup<L, R, JK, KR>(
    keys: &JoinKeys<L, R, JK>,
    mut right: BoxedEnumerator<R, KR>,
    cancellation: &CancellationState,
) -> QueryResult<RightLookup<R, JK, KR>> {
    let mut lookup = HashLookup::new(Arc::clone(&keys.equality));
    let mut counter = 0usize;
    while let Some((item, key)) = right.move_next()? {
        cancellation.poll(&mut counter)?;
        let join_key = (keys.right_key)(&item);
        lookup.get_or_insert_with(join_key, Vec::new).push((item, key));
    }
    Ok(lookup)
}

fn repartition_pair<L, R, JK, KL, KR>(
    keys: &JoinKeys<L, R, JK>,
    left: PartitionedStream<L, KL>,
    right: PartitionedStream<R, KR>,
    ordered: bool,
    settings: &QuerySettings,
) -> QueryResult<JoinInputs<L, R, KL, KR>>
where
    L: Send + 'static,
    R: Send + 'static,
    JK: 'static,
    KL: OrderKey,
    KR: OrderKey,
{
    ensure_contract!(
        left.partition_count() == right.partition_count(),
        "join inputs have {} and {} partitions",
        left.partition_count(),
        right.partition_count()
    );
    Ok(if ordered {
        JoinInputs::Ordered(
            hash_repartition_ordered(left, keys.left_router(), settings),
            hash_repartition_ordered(right, keys.right_router(), settings),
        )
    } else {
        JoinInputs::Unordered(
            hash_repartition(left, keys.left_router(), settings),
            hash_repartition(right, keys.right_router(), settings),
        )
    })
}

enum JoinInputs<L, R, KL, KR> {
    Ordered(PartitionedStream<L, KL>, PartitionedStream<R, KR>),
    Unordered(PartitionedStream<L, ()>, PartitionedStream<R, ()>),
}

/// Inner equi-join: one output per matching (left, right) pair.
///
/// Ordered output sorts by left key, then right key.
pub struct JoinOperator<L, R, JK, O> {
    keys: JoinKeys<L, R, JK>,
    result: Arc<dyn Fn(&L, &R) -> O + Send + Sync>,
}

impl<L, R, JK, O> std::fmt::Debug for JoinOperator<L, R, JK, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("JoinOperator")
    }
}

impl<L, R, JK, O> JoinOperator<L, R, JK, O> {
    /// Join on `left_key(l) == right_key(r)` under `equality`.
    pub fn new<FL, FR, FO>(
        left_key: FL,
        right_key: FR,
        result: FO,
        equality: SharedEqualityComparer<JK>,
    ) -> Self
    where
        FL: Fn(&L) -> JK + Send + Sync + 'static,
        FR: Fn(&R) -> JK + Send + Sync + 'static,
        FO: Fn(&L, &R) -> O + Send + Sync + 'static,
    {
        Self {
            keys: JoinKeys {
                left_key: Arc::new(left_key),
                right_key: Arc::new(right_key),
                equality,
            },
            result: Arc::new(result),
        }
    }
}

impl<L, R, JK, O> BinaryOperator for JoinOperator<L, R, JK, O>
where
    L: Send + 'static,
    R: Send + 'static,
    JK: Send + Sync + 'static,
    O: Send + 'static,
{
    type Left = L;
    type Right = R;
    type Output = O;

    fn name(&self) -> &'static str {
        "Join"
    }

    fn output_state(
        &self,
        _left: OrdinalIndexState,
        _right: OrdinalIndexState,
    ) -> OrdinalIndexState {
        OrdinalIndexState::Shuffled
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
        let comparer = KeyComparer::pair(left.key_comparer().clone(), right.key_comparer().clone());
        match repartition_pair(&self.keys, left, right, ordered, settings)? {
            JoinInputs::Ordered(left, right) => {
                recipient.receive(self.build(left, right, comparer, Pair::new, settings))
            }
            JoinInputs::Unordered(left, right) => recipient.receive(self.build(
                left,
                right,
                KeyComparer::unit(),
                |(), ()| (),
                settings,
            )),
        }
    }
}

impl<L, R, JK, O> JoinOperator<L, R, JK, O>
where
    L: Send + 'static,
    R: Send + 'static,
    JK: Send + Sync + 'static,
    O: Send + 'static,
{
    fn build<KL, KR, K>(
        &self,
        left: PartitionedStream<L, KL>,
        right: PartitionedStream<R, KR>,
        comparer: KeyComparer<K>,
        combine: fn(KL, KR) -> K,
        settings: &QuerySettings,
    ) -> PartitionedStream<O, K>
    where
        KL: OrderKey,
        KR: OrderKey,
        K: OrderKey,
    {
        let partitions = left
            .into_partitions()
            .into_iter()
            .zip(right.into_partitions())
            .map(|(left, right)| {
                Box::new(JoinEnumerator {
                    keys: self.keys.clone(),
                    result: Arc::clone(&self.result),
                    left,
                    right: Some(right),
                    lookup: None,
                    pending: VecDeque::new(),
                    combine,
                    cancellation: settings.cancellation().clone(),
                    counter: 0,
                }) as BoxedEnumerator<O, K>
            })
            .collect();
        PartitionedStream::new(partitions, comparer, OrdinalIndexState::Shuffled)
    }
}

struct JoinEnumerator<L, R, JK, O, KL, KR, K> {
    keys: JoinKeys<L, R, JK>,
    result: Arc<dyn Fn(&L, &R) -> O + Send + Sync>,
    left: BoxedEnumerator<L, KL>,
    right: Option<BoxedEnumerator<R, KR>>,
    lookup: Option<RightLookup<R, JK, KR>>,
    pending: VecDeque<(O, K)>,
    combine: fn(KL, KR) -> K,
    cancellation: CancellationState,
    counter: usize,
}

impl<L, R, JK, O, KL, KR, K> QueryOperatorEnumerator<O, K> for JoinEnumerator<L, R, JK, O, KL, KR, K>
where
    L: Send + 'static,
    R: Send + 'static,
    JK: Send + Sync + 'static,
    O: Send + 'static,
    KL: OrderKey,
    KR: OrderKey,
    K: OrderKey,
{
    fn move_next(&mut self) -> QueryResult<Option<(O, K)>> {
        if let Some(right) = self.right.take() {
            self.lookup = Some(build_lookup(&self.keys, right, &self.cancellation)?);
        }
        let Some(lookup) = self.lookup.as_ref() else {
            return Ok(None);
        };
        loop {
            if let Some(next) = self.pending.pop_front() {
                return Ok(Some(next));
            }
            let Some((item, left_key)) = self.left.move_next()? else {
                return Ok(None);
            };
            self.cancellation.poll(&mut self.counter)?;
            let join_key = (self.keys.left_key)(&item);
            if let Some(matches) = lookup.get(&join_key) {
                for (right, right_key) in matches {
                    self.pending.push_back((
                        (self.result)(&item, right),
                        (self.combine)(left_key.clone(), right_key.clone()),
                    ));
                }
            }
        }
    }
}

/// Pairs every left element with all matching right elements.
///
/// Yields exactly one output per left element, with an empty match slice
/// when nothing matched. Ordered output follows the left input and lists
/// matches in right input order.
pub struct GroupJoinOperator<L, R, JK, O> {
    keys: JoinKeys<L, R, JK>,
    result: Arc<dyn Fn(&L, &[R]) -> O + Send + Sync>,
}

impl<L, R, JK, O> std::fmt::Debug for GroupJoinOperator<L, R, JK, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("GroupJoinOperator")
    }
}

impl<L, R, JK, O> GroupJoinOperator<L, R, JK, O> {
    /// Group-join on `left_key(l) == right_key(r)` under `equality`.
    pub fn new<FL, FR, FO>(
        left_key: FL,
        right_key: FR,
        result: FO,
        equality: SharedEqualityComparer<JK>,
    ) -> Self
    where
        FL: Fn(&L) -> JK + Send + Sync + 'static,
        FR: Fn(&R) -> JK + Send + Sync + 'static,
        FO: Fn(&L, &[R]) -> O + Send + Sync + 'static,
    {
        Self {
            keys: JoinKeys {
                left_key: Arc::new(left_key),
                right_key: Arc::new(right_key),
                equality,
            },
            result: Arc::new(result),
        }
    }
}

impl<L, R, JK, O> BinaryOperator for GroupJoinOperator<L, R, JK, O>
where
    L: Send + 'static,
    R: Send + 'static,
    JK: Send + Sync + 'static,
    O: Send + 'static,
{
    type Left = L;
    type Right = R;
    type Output = O;

    fn name(&self) -> &'static str {
        "GroupJoin"
    }

    fn output_state(
        &self,
        _left: OrdinalIndexState,
        _right: OrdinalIndexState,
    ) -> OrdinalIndexState {
        OrdinalIndexState::Shuffled
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
        let left_comparer = left.key_comparer().clone();
        let right_comparer = right.key_comparer().clone();
        match repartition_pair(&self.keys, left, right, ordered, settings)? {
            JoinInputs::Ordered(left, right) => recipient.receive(self.build(
                left,
                right,
                left_comparer,
                right_comparer,
                settings,
            )),
            JoinInputs::Unordered(left, right) => recipient.receive(self.build(
                left,
                right,
                KeyComparer::unit(),
                KeyComparer::unit(),
                settings,
            )),
        }
    }
}

impl<L, R, JK, O> GroupJoinOperator<L, R, JK, O>
where
    L: Send + 'static,
    R: Send + 'static,
    JK: Send + Sync + 'static,
    O: Send + 'static,
{
    fn build<KL, KR>(
        &self,
        left: PartitionedStream<L, KL>,
        right: PartitionedStream<R, KR>,
        left_comparer: KeyComparer<KL>,
        right_comparer: KeyComparer<KR>,
        settings: &QuerySettings,
    ) -> PartitionedStream<O, KL>
    where
        KL: OrderKey,
        KR: OrderKey,
    {
        let partitions = left
            .into_partitions()
            .into_iter()
            .zip(right.into_partitions())
            .map(|(left, right)| {
                Box::new(GroupJoinEnumerator {
                    keys: self.keys.clone(),
                    result: Arc::clone(&self.result),
                    left,
                    right: Some(right),
                    right_comparer: right_comparer.clone(),
                    lookup: None,
                    cancellation: settings.cancellation().clone(),
                    counter: 0,
                }) as BoxedEnumerator<O, KL>
            })
            .collect();
        PartitionedStream::new(partitions, left_comparer, OrdinalIndexState::Shuffled)
    }
}

struct GroupJoinEnumerator<L, R, JK, O, KL, KR> {
    keys: JoinKeys<L, R, JK>,
    result: Arc<dyn Fn(&L, &[R]) -> O + Send + Sync>,
    left: BoxedEnumerator<L, KL>,
    right: Option<BoxedEnumerator<R, KR>>,
    right_comparer: KeyComparer<KR>,
    lookup: Option<HashLookup<JK, Vec<R>, SharedEqualityComparer<JK>>>,
    cancellation: CancellationState,
    counter: usize,
}

impl<L, R, JK, O, KL, KR> GroupJoinEnumerator<L, R, JK, O, KL, KR>
where
    R: Send + 'static,
    JK: Send + Sync + 'static,
    KR: OrderKey,
{
    fn build_groups(
        &self,
        right: BoxedEnumerator<R, KR>,
    ) -> QueryResult<HashLookup<JK, Vec<R>, SharedEqualityComparer<JK>>> {
        let keyed = build_lookup(&self.keys, right, &self.cancellation)?;
        let mut groups = HashLookup::new(Arc::clone(&self.keys.equality));
        for (join_key, mut members) in keyed {
            members.sort_by(|a, b| self.right_comparer.compare(&a.1, &b.1));
            groups.insert(join_key, members.into_iter().map(|(item, _)| item).collect());
        }
        Ok(groups)
    }
}

impl<L, R, JK, O, KL, KR> QueryOperatorEnumerator<O, KL> for GroupJoinEnumerator<L, R, JK, O, KL, KR>
where
    L: Send + 'static,
    R: Send + 'static,
    JK: Send + Sync + 'static,
    O: Send + 'static,
    KL: OrderKey,
    KR: OrderKey,
{
    fn move_next(&mut self) -> QueryResult<Option<(O, KL)>> {
        if let Some(right) = self.right.take() {
            self.lookup = Some(self.build_groups(right)?);
        }
        let Some(lookup) = self.lookup.as_ref() else {
            return Ok(None);
        };
        let Some((item, key)) = self.left.move_next()? else {
            return Ok(None);
        };
        self.cancellation.poll(&mut self.counter)?;
        let join_key = (self.keys.left_key)(&item);
        let matches = lookup.get(&join_key).map_or(&[][..], Vec::as_slice);
        Ok(Some(((self.result)(&item, matches), key)))
    }
}

#[cfg(test)]
mod tests {
    use crate::query::QueryExt;
    use crate::settings::QueryContext;
    use crate::source::{from_vec, range};

    #[test]
    fn test_join_matches_pairs() {
        let ctx = QueryContext::new().with_degree_of_parallelism(4);
        let left = range(0, 20);
        let right = from_vec(vec![(0i64, "zero"), (5, "five"), (5, "cinq"), (99, "none")]);
        let mut joined = left
            .join(right, |x| *x, |r| r.0, |x, r| (*x, r.1))
            .to_vec(&ctx)
            .unwrap();
        joined.sort_unstable();
        assert_eq!(joined, vec![(0, "zero"), (5, "cinq"), (5, "five")]);
    }

    #[test]
    fn test_ordered_join_follows_left_then_right() {
        let ctx = QueryContext::new().with_degree_of_parallelism(3);
        let left = from_vec(vec![3, 1, 2, 1]).as_ordered();
        let right = from_vec(vec![(1, 'a'), (2, 'b'), (1, 'c')]).as_ordered();
        let joined = left
            .join(right, |x| *x, |r| r.0, |x, r| (*x, r.1))
            .to_vec(&ctx)
            .unwrap();
        assert_eq!(joined, vec![(1, 'a'), (1, 'c'), (2, 'b'), (1, 'a'), (1, 'c')]);
    }

    #[test]
    fn test_group_join_yields_every_left_element() {
        let ctx = QueryContext::new().with_degree_of_parallelism(2);
        let left = from_vec(vec![1, 2, 3]).as_ordered();
        let right = from_vec(vec![(1, 10), (3, 30), (1, 11)]).as_ordered();
        let joined = left
            .group_join(right, |x| *x, |r| r.0, |x, rs| (*x, rs.iter().map(|r| r.1).collect::<Vec<_>>()))
            .to_vec(&ctx)
            .unwrap();
        assert_eq!(joined, vec![(1, vec![10, 11]), (2, vec![]), (3, vec![30])]);
    }
}
