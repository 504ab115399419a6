//! Select and Where.

use std::marker::PhantomData;
use std::sync::Arc;

use common_error::QueryResult;
use weft_core::{OrderKey, OrdinalIndexState};

use super::UnaryOperator;
use crate::settings::QuerySettings;
use crate::stream::{
    BoxedEnumerator, IndexedSource, PartitionedStream, PartitionedStreamRecipient,
    QueryOperatorEnumerator,
};

/// Projects every element through a selector. Keys pass through untouched.
pub struct SelectOperator<T, U, F> {
    selector: Arc<F>,
    _types: PhantomData<fn(T) -> U>,
}

impl<T, U, F> std::fmt::Debug for SelectOperator<T, U, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SelectOperator")
    }
}

impl<T, U, F> SelectOperator<T, U, F> {
    /// Create the operator.
    #[must_use]
    pub fn new(selector: F) -> Self {
        Self {
            selector: Arc::new(selector),
            _types: PhantomData,
        }
    }
}

impl<T, U, F> UnaryOperator for SelectOperator<T, U, F>
where
    T: Send + 'static,
    U: Send + 'static,
    F: Fn(T) -> U + Send + Sync + 'static,
{
    type Input = T;
    type Output = U;

    fn name(&self) -> &'static str {
        "Select"
    }

    fn output_state(&self, input: OrdinalIndexState) -> OrdinalIndexState {
        input
    }

    fn indexed(&self, child: Arc<dyn IndexedSource<T>>) -> Option<Arc<dyn IndexedSource<U>>> {
        Some(Arc::new(SelectIndexed {
            child,
            selector: Arc::clone(&self.selector),
        }))
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
        R: PartitionedStreamRecipient<U>,
    {
        let comparer = input.key_comparer().clone();
        let state = input.ordinal_index_state();
        recipient.receive(input.map_partitions(comparer, state, |_, source| {
            Box::new(SelectEnumerator {
                source,
                selector: Arc::clone(&self.selector),
            })
        }))
    }
}

struct SelectEnumerator<T, K, F> {
    source: BoxedEnumerator<T, K>,
    selector: Arc<F>,
}

impl<T, U, K, F> QueryOperatorEnumerator<U, K> for SelectEnumerator<T, K, F>
where
    T: Send,
    K: Send,
    F: Fn(T) -> U + Send + Sync,
{
    fn move_next(&mut self) -> QueryResult<Option<(U, K)>> {
        Ok(self
            .source
            .move_next()?
            .map(|(item, key)| ((self.selector)(item), key)))
    }
}

struct SelectIndexed<T, F> {
    child: Arc<dyn IndexedSource<T>>,
    selector: Arc<F>,
}

impl<T, U, F> IndexedSource<U> for SelectIndexed<T, F>
where
    F: Fn(T) -> U + Send + Sync,
{
    fn len(&self) -> usize {
        self.child.len()
    }

    fn get(&self, index: usize) -> U {
        (self.selector)(self.child.get(index))
    }
}

/// Keeps the elements matching a predicate.
pub struct WhereOperator<T, F> {
    predicate: Arc<F>,
    _types: PhantomData<fn(T)>,
}

impl<T, F> std::fmt::Debug for WhereOperator<T, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("WhereOperator")
    }
}

impl<T, F> WhereOperator<T, F> {
    /// Create the operator.
    #[must_use]
    pub fn new(predicate: F) -> Self {
        Self {
            predicate: Arc::new(predicate),
            _types: PhantomData,
        }
    }
}

impl<T, F> UnaryOperator for WhereOperator<T, F>
where
    T: Send + 'static,
    F: Fn(&T) -> bool + Send + Sync + 'static,
{
    type Input = T;
    type Output = T;

    fn name(&self) -> &'static str {
        "Where"
    }

    // Filtering leaves gaps in the keys.
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
        let comparer = input.key_comparer().clone();
        let state = self.output_state(input.ordinal_index_state());
        recipient.receive(input.map_partitions(comparer, state, |_, source| {
            Box::new(WhereEnumerator {
                source,
                predicate: Arc::clone(&self.predicate),
                cancellation: settings.cancellation().clone(),
                counter: 0,
            })
        }))
    }
}

struct WhereEnumerator<T, K, F> {
    source: BoxedEnumerator<T, K>,
    predicate: Arc<F>,
    cancellation: common_runtime::CancellationState,
    counter: usize,
}

impl<T, K, F> QueryOperatorEnumerator<T, K> for WhereEnumerator<T, K, F>
where
    T: Send,
    K: Send,
    F: Fn(&T) -> bool + Send + Sync,
{
    fn move_next(&mut self) -> QueryResult<Option<(T, K)>> {
        while let Some((item, key)) = self.source.move_next()? {
            if (self.predicate)(&item) {
                return Ok(Some((item, key)));
            }
            // Long runs of rejected elements never return to the caller.
            self.cancellation.poll(&mut self.counter)?;
        }
        Ok(None)
    }
}
