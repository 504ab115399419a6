//! GroupBy.

use std::sync::Arc;

use common_error::QueryResult;
use common_runtime::CancellationState;
use weft_core::{HashLookup, KeyComparer, OrderKey, OrdinalIndexState, SharedEqualityComparer};

use super::UnaryOperator;
use crate::exchange::{Router, hash_repartition, hash_repartition_ordered};
use crate::settings::QuerySettings;
use crate::stream::{
    BoxedEnumerator, PartitionedStream, PartitionedStreamRecipient, QueryOperatorEnumerator,
};

/// A key and every element that mapped to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grouping<GK, T> {
    /// Group key.
    pub key: GK,
    /// Members, in input order when the query is ordered.
    pub elements: Vec<T>,
}

impl<GK, T> Grouping<GK, T> {
    /// Number of members.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Whether the group has no members. Never true for query output.
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

/// Groups elements by a projected key.
///
/// Elements are repartitioned on the key hash so every group is built by a
/// single partition. Ordered groups carry the smallest order key of their
/// members and list members in key order.
pub struct GroupByOperator<T, GK, F> {
    key_selector: Arc<F>,
    equality: SharedEqualityComparer<GK>,
    _types: std::marker::PhantomData<fn(T)>,
}

impl<T, GK, F> std::fmt::Debug for GroupByOperator<T, GK, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("GroupByOperator")
    }
}

impl<T, GK, F> GroupByOperator<T, GK, F> {
    /// Group by `key_selector`, comparing keys with `equality`.
    #[must_use]
    pub fn new(key_selector: F, equality: SharedEqualityComparer<GK>) -> Self {
        Self {
            key_selector: Arc::new(key_selector),
            equality,
            _types: std::marker::PhantomData,
        }
    }
}

impl<T, GK, F> UnaryOperator for GroupByOperator<T, GK, F>
where
    T: Send + 'static,
    GK: Send + Sync + 'static,
    F: Fn(&T) -> GK + Send + Sync + 'static,
{
    type Input = T;
    type Output = Grouping<GK, T>;

    fn name(&self) -> &'static str {
        "GroupBy"
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
        R: PartitionedStreamRecipient<Grouping<GK, T>>,
    {
        let router: Router<T> = {
            let selector = Arc::clone(&self.key_selector);
            let equality = Arc::clone(&self.equality);
            Arc::new(move |item: &T| equality.hash(&selector(item)))
        };
        if ordered {
            let comparer = input.key_comparer().clone();
            let input = hash_repartition_ordered(input, router, settings);
            recipient.receive(self.build(input, comparer, settings))
        } else {
            let input = hash_repartition(input, router, settings);
            recipient.receive(self.build(input, KeyComparer::unit(), settings))
        }
    }
}

impl<T, GK, F> GroupByOperator<T, GK, F>
where
    T: Send + 'static,
    GK: Send + Sync + 'static,
    F: Fn(&T) -> GK + Send + Sync + 'static,
{
    fn build<K: OrderKey>(
        &self,
        input: PartitionedStream<T, K>,
        comparer: KeyComparer<K>,
        settings: &QuerySettings,
    ) -> PartitionedStream<Grouping<GK, T>, K> {
        input.map_partitions(
            comparer.clone(),
            OrdinalIndexState::Shuffled,
            |_, source| {
                Box::new(GroupByEnumerator {
                    source: Some(source),
                    key_selector: Arc::clone(&self.key_selector),
                    equality: Arc::clone(&self.equality),
                    comparer: comparer.clone(),
                    output: None,
                    cancellation: settings.cancellation().clone(),
                })
            },
        )
    }
}

struct GroupByEnumerator<T, GK, K, F> {
    source: Option<BoxedEnumerator<T, K>>,
    key_selector: Arc<F>,
    equality: SharedEqualityComparer<GK>,
    comparer: KeyComparer<K>,
    output: Option<std::vec::IntoIter<(Grouping<GK, T>, K)>>,
    cancellation: CancellationState,
}

impl<T, GK, K, F> GroupByEnumerator<T, GK, K, F>
where
    T: Send + 'static,
    GK: Send + Sync + 'static,
    K: OrderKey,
    F: Fn(&T) -> GK + Send + Sync,
{
    fn build(&self, mut source: BoxedEnumerator<T, K>) -> QueryResult<Vec<(Grouping<GK, T>, K)>> {
        let mut lookup: HashLookup<GK, Vec<(T, K)>, _> =
            HashLookup::new(Arc::clone(&self.equality));
        let mut counter = 0usize;
        while let Some((item, key)) = source.move_next()? {
            self.cancellation.poll(&mut counter)?;
            let group_key = (self.key_selector)(&item);
            lookup
                .get_or_insert_with(group_key, Vec::new)
                .push((item, key));
        }

        let mut groups = Vec::new();
        for (group_key, mut members) in lookup {
            self.cancellation.poll(&mut counter)?;
            // Repartitioning interleaves sources, so members need re-sorting.
            members.sort_by(|a, b| self.comparer.compare(&a.1, &b.1));
            let min_key = members.first().map(|(_, key)| key.clone()).unwrap_or_default();
            groups.push((
                Grouping {
                    key: group_key,
                    elements: members.into_iter().map(|(item, _)| item).collect(),
                },
                min_key,
            ));
        }
        Ok(groups)
    }
}

impl<T, GK, K, F> QueryOperatorEnumerator<Grouping<GK, T>, K> for GroupByEnumerator<T, GK, K, F>
where
    T: Send + 'static,
    GK: Send + Sync + 'static,
    K: OrderKey,
    F: Fn(&T) -> GK + Send + Sync,
{
    fn move_next(&mut self) -> QueryResult<Option<(Grouping<GK, T>, K)>> {
        if let Some(source) = self.source.take() {
            self.output = Some(self.build(source)?.into_iter());
        }
        Ok(self.output.as_mut().and_then(Iterator::next))
    }
}

#[cfg(test)]
mod tests {
    use crate::query::QueryExt;
    use crate::settings::QueryContext;
    use crate::source::{from_vec, range};

    #[test]
    fn test_group_by_modulus() {
        let ctx = QueryContext::new().with_degree_of_parallelism(4);
        let mut groups = range(0, 70).group_by(|x| x % 7).to_vec(&ctx).unwrap();
        groups.sort_by_key(|g| g.key);
        assert_eq!(groups.len(), 7);
        for (i, group) in groups.iter().enumerate() {
            assert_eq!(group.key, i as i64);
            assert_eq!(group.len(), 10);
            assert!(group.elements.iter().all(|x| x % 7 == group.key));
        }
    }

    #[test]
    fn test_ordered_groups_follow_first_member() {
        let ctx = QueryContext::new().with_degree_of_parallelism(3);
        let words = vec!["bee", "ant", "bat", "cow", "ape", "cat"];
        let groups = from_vec(words)
            .as_ordered()
            .group_by(|w| w.as_bytes()[0])
            .to_vec(&ctx)
            .unwrap();
        let keys: Vec<u8> = groups.iter().map(|g| g.key).collect();
        assert_eq!(keys, vec![b'b', b'a', b'c']);
        assert_eq!(groups[0].elements, vec!["bee", "bat"]);
        assert_eq!(groups[1].elements, vec!["ant", "ape"]);
    }
}
