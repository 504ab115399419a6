//! OrderBy, OrderByDescending, ThenBy and ThenByDescending.
//!
//! Sorting itself happens in the merge: the operator only re-keys every
//! element with `Pair(sort key, input key)`. The input key breaks ties, so
//! the sort is stable.

use std::sync::Arc;

use common_display::ExplainNode;
use common_error::QueryResult;
use weft_core::{KeyComparer, OrderKey, OrdinalIndexState, Pair};

use super::{QueryOperator, UnaryOperator, UnaryQueryOperator};
use crate::settings::QuerySettings;
use crate::stream::{PartitionedStream, PartitionedStreamRecipient, QueryOperatorEnumerator};

type SortKeySelector<T, SK> = Arc<dyn Fn(&T) -> SK + Send + Sync>;

/// Sorts by a projected key.
pub struct OrderByOperator<T, SK> {
    selector: SortKeySelector<T, SK>,
    comparer: KeyComparer<SK>,
    levels: usize,
    descending: bool,
}

impl<T, SK> std::fmt::Debug for OrderByOperator<T, SK> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderByOperator")
            .field("levels", &self.levels)
            .field("descending", &self.descending)
            .finish_non_exhaustive()
    }
}

impl<T: 'static, SK: 'static> OrderByOperator<T, SK> {
    /// Sort ascending by `selector` under `comparer`.
    pub fn new<F>(selector: F, comparer: KeyComparer<SK>) -> Self
    where
        F: Fn(&T) -> SK + Send + Sync + 'static,
    {
        Self {
            selector: Arc::new(selector),
            comparer,
            levels: 1,
            descending: false,
        }
    }

    /// Sort descending by `selector` under `comparer`.
    pub fn descending<F>(selector: F, comparer: &KeyComparer<SK>) -> Self
    where
        F: Fn(&T) -> SK + Send + Sync + 'static,
    {
        Self {
            descending: true,
            ..Self::new(selector, comparer.reversed())
        }
    }

    /// Break ties with a secondary key.
    fn then<SK2: 'static>(
        &self,
        selector: SortKeySelector<T, SK2>,
        comparer: KeyComparer<SK2>,
    ) -> OrderByOperator<T, Pair<SK, SK2>> {
        let primary = Arc::clone(&self.selector);
        OrderByOperator {
            selector: Arc::new(move |item: &T| Pair::new(primary(item), selector(item))),
            comparer: KeyComparer::pair(self.comparer.clone(), comparer),
            levels: self.levels + 1,
            descending: self.descending,
        }
    }
}

impl<C, T, SK> UnaryQueryOperator<C, OrderByOperator<T, SK>>
where
    C: QueryOperator<Output = T>,
    T: Send + 'static,
    SK: OrderKey,
{
    /// Order elements that compare equal so far by `selector`, ascending.
    pub fn then_by<SK2, F>(self, selector: F) -> UnaryQueryOperator<C, OrderByOperator<T, Pair<SK, SK2>>>
    where
        SK2: OrderKey + Ord,
        F: Fn(&T) -> SK2 + Send + Sync + 'static,
    {
        let logic = self.logic.then(Arc::new(selector), KeyComparer::natural());
        UnaryQueryOperator::new(self.child, logic)
    }

    /// Order elements that compare equal so far by `selector`, descending.
    pub fn then_by_descending<SK2, F>(
        self,
        selector: F,
    ) -> UnaryQueryOperator<C, OrderByOperator<T, Pair<SK, SK2>>>
    where
        SK2: OrderKey + Ord,
        F: Fn(&T) -> SK2 + Send + Sync + 'static,
    {
        let logic = self
            .logic
            .then(Arc::new(selector), KeyComparer::natural().reversed());
        UnaryQueryOperator::new(self.child, logic)
    }
}

impl<T: Send + 'static, SK: OrderKey> UnaryOperator for OrderByOperator<T, SK> {
    type Input = T;
    type Output = T;

    fn name(&self) -> &'static str {
        if self.descending {
            "OrderByDescending"
        } else {
            "OrderBy"
        }
    }

    fn output_state(&self, _input: OrdinalIndexState) -> OrdinalIndexState {
        OrdinalIndexState::Shuffled
    }

    fn output_ordered(&self, _input_ordered: bool) -> bool {
        true
    }

    fn explain_details(&self, node: ExplainNode) -> ExplainNode {
        node.with_detail("keys", self.levels)
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
        let comparer = KeyComparer::pair(self.comparer.clone(), input.key_comparer().clone());
        recipient.receive(input.map_partitions(
            comparer,
            OrdinalIndexState::Shuffled,
            |_, source| {
                Box::new(SortKeyEnumerator {
                    source,
                    selector: Arc::clone(&self.selector),
                })
            },
        ))
    }
}

struct SortKeyEnumerator<T, K, SK> {
    source: crate::stream::BoxedEnumerator<T, K>,
    selector: SortKeySelector<T, SK>,
}

impl<T: Send, K: OrderKey, SK: OrderKey> QueryOperatorEnumerator<T, Pair<SK, K>>
    for SortKeyEnumerator<T, K, SK>
{
    fn move_next(&mut self) -> QueryResult<Option<(T, Pair<SK, K>)>> {
        Ok(self.source.move_next()?.map(|(item, key)| {
            let sort_key = (self.selector)(&item);
            (item, Pair::new(sort_key, key))
        }))
    }
}
