//! Partitioned streams and the recipient protocol.
//!
//! A query executes as N partitions, each a pull cursor yielding
//! `(element, order key)` pairs. Operators never see the key type of their
//! input as an erased value: results hand their stream to a
//! [`PartitionedStreamRecipient`], whose `receive` method is generic over the
//! key type, so the whole operator chain is monomorphised per key type.
//!
//! # Key invariants
//!
//! - Within one partition, keys are yielded in ascending order whenever the
//!   stream's state is [`OrdinalIndexState::Increasing`] or better.
//! - At `Increasing` or better, keys are unique across all partitions.
//! - At `Correct` or better, the keys are exactly `0..M` for an M-element
//!   logical sequence.

use std::sync::Arc;

use common_error::QueryResult;
use common_runtime::CancellationState;
use weft_core::{KeyComparer, OrderKey, OrdinalIndexState};

/// Per-partition pull cursor.
///
/// Returns `Ok(None)` once exhausted; dropping the enumerator releases it.
pub trait QueryOperatorEnumerator<T, K>: Send {
    /// Advance to the next element.
    fn move_next(&mut self) -> QueryResult<Option<(T, K)>>;
}

/// Boxed partition enumerator.
pub type BoxedEnumerator<T, K> = Box<dyn QueryOperatorEnumerator<T, K>>;

/// N keyed partitions plus their ordering metadata.
pub struct PartitionedStream<T, K> {
    partitions: Vec<BoxedEnumerator<T, K>>,
    key_comparer: KeyComparer<K>,
    ordinal_index_state: OrdinalIndexState,
}

impl<T, K> std::fmt::Debug for PartitionedStream<T, K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionedStream")
            .field("partitions", &self.partitions.len())
            .field("ordinal_index_state", &self.ordinal_index_state)
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static, K: OrderKey> PartitionedStream<T, K> {
    /// Assemble a stream.
    pub fn new(
        partitions: Vec<BoxedEnumerator<T, K>>,
        key_comparer: KeyComparer<K>,
        ordinal_index_state: OrdinalIndexState,
    ) -> Self {
        Self {
            partitions,
            key_comparer,
            ordinal_index_state,
        }
    }

    /// Number of partitions.
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Ordering of the keys.
    pub const fn key_comparer(&self) -> &KeyComparer<K> {
        &self.key_comparer
    }

    /// Positional guarantee of the keys.
    pub const fn ordinal_index_state(&self) -> OrdinalIndexState {
        self.ordinal_index_state
    }

    /// Take the partitions.
    pub fn into_partitions(self) -> Vec<BoxedEnumerator<T, K>> {
        self.partitions
    }

    /// Split into partitions, comparer and state.
    pub fn into_parts(
        self,
    ) -> (
        Vec<BoxedEnumerator<T, K>>,
        KeyComparer<K>,
        OrdinalIndexState,
    ) {
        (self.partitions, self.key_comparer, self.ordinal_index_state)
    }

    /// Wrap every partition, producing a stream with new metadata.
    pub fn map_partitions<U, K2, F>(
        self,
        key_comparer: KeyComparer<K2>,
        ordinal_index_state: OrdinalIndexState,
        mut wrap: F,
    ) -> PartitionedStream<U, K2>
    where
        U: Send + 'static,
        K2: OrderKey,
        F: FnMut(usize, BoxedEnumerator<T, K>) -> BoxedEnumerator<U, K2>,
    {
        let partitions = self
            .partitions
            .into_iter()
            .enumerate()
            .map(|(i, p)| wrap(i, p))
            .collect();
        PartitionedStream::new(partitions, key_comparer, ordinal_index_state)
    }
}

/// Consumer of a partitioned stream whose key type is only known at the
/// call site.
pub trait PartitionedStreamRecipient<T> {
    /// What receiving the stream produces.
    type Output;

    /// Take ownership of the stream.
    fn receive<K: OrderKey>(self, stream: PartitionedStream<T, K>) -> QueryResult<Self::Output>;
}

/// Random access into a query's output, for results that support it.
pub trait IndexedSource<T>: Send + Sync {
    /// Number of elements.
    fn len(&self) -> usize;

    /// Element at `index`; `index < len()`.
    fn get(&self, index: usize) -> T;

    /// Whether there are no elements.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The opened form of an operator tree.
pub trait QueryResults<T> {
    /// Build the partitioned stream and hand it to `recipient`.
    fn give_partitioned_stream<R: PartitionedStreamRecipient<T>>(
        self,
        recipient: R,
    ) -> QueryResult<R::Output>;

    /// Random access to the output, when every element can be computed
    /// independently from its index.
    fn indexed(&self) -> Option<Arc<dyn IndexedSource<T>>> {
        None
    }
}

// ============================================================================
// Common enumerators
// ============================================================================

/// Yields buffered `(element, key)` pairs.
pub struct BufferedEnumerator<T, K> {
    items: std::vec::IntoIter<(T, K)>,
    cancellation: CancellationState,
    counter: usize,
}

impl<T, K> BufferedEnumerator<T, K> {
    /// Enumerate `items` in order.
    pub fn new(items: Vec<(T, K)>, cancellation: CancellationState) -> Self {
        Self {
            items: items.into_iter(),
            cancellation,
            counter: 0,
        }
    }
}

impl<T: Send, K: Send> QueryOperatorEnumerator<T, K> for BufferedEnumerator<T, K> {
    fn move_next(&mut self) -> QueryResult<Option<(T, K)>> {
        self.cancellation.poll(&mut self.counter)?;
        Ok(self.items.next())
    }
}

/// Yields nothing.
pub struct EmptyEnumerator;

impl<T, K> QueryOperatorEnumerator<T, K> for EmptyEnumerator {
    fn move_next(&mut self) -> QueryResult<Option<(T, K)>> {
        Ok(None)
    }
}

/// Discards order keys, replacing them with `()`.
pub struct KeyDroppingEnumerator<T, K> {
    source: BoxedEnumerator<T, K>,
}

impl<T, K> KeyDroppingEnumerator<T, K> {
    /// Wrap `source`.
    pub fn new(source: BoxedEnumerator<T, K>) -> Self {
        Self { source }
    }
}

impl<T: Send, K: Send> QueryOperatorEnumerator<T, ()> for KeyDroppingEnumerator<T, K> {
    fn move_next(&mut self) -> QueryResult<Option<(T, ())>> {
        Ok(self.source.move_next()?.map(|(item, _)| (item, ())))
    }
}

/// Drop the keys of every partition of a stream.
pub fn drop_keys<T: Send + 'static, K: OrderKey>(
    stream: PartitionedStream<T, K>,
) -> PartitionedStream<T, ()> {
    stream.map_partitions(KeyComparer::unit(), OrdinalIndexState::Shuffled, |_, p| {
        Box::new(KeyDroppingEnumerator::new(p))
    })
}

/// Drain an enumerator into a vector.
pub fn drain<T, K>(enumerator: &mut BoxedEnumerator<T, K>) -> QueryResult<Vec<(T, K)>> {
    let mut items = Vec::new();
    while let Some(item) = enumerator.move_next()? {
        items.push(item);
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffered_enumerator() {
        let cancellation = CancellationState::detached(64);
        let mut e: BoxedEnumerator<_, _> = Box::new(BufferedEnumerator::new(
            vec![("a", 0usize), ("b", 1)],
            cancellation,
        ));
        assert_eq!(drain(&mut e).unwrap(), vec![("a", 0), ("b", 1)]);
    }

    #[test]
    fn test_buffered_enumerator_observes_cancellation() {
        let cancellation = CancellationState::detached(64);
        cancellation.cancel_internal();
        let mut e = BufferedEnumerator::new(vec![(1, 0usize)], cancellation);
        assert!(e.move_next().unwrap_err().is_canceled());
    }

    #[test]
    fn test_drop_keys() {
        let cancellation = CancellationState::detached(64);
        let stream = PartitionedStream::new(
            vec![Box::new(BufferedEnumerator::new(vec![(5, 9usize)], cancellation))
                as BoxedEnumerator<i32, usize>],
            KeyComparer::natural(),
            OrdinalIndexState::Correct,
        );
        let stream = drop_keys(stream);
        assert_eq!(stream.ordinal_index_state(), OrdinalIndexState::Shuffled);
        let mut partitions = stream.into_partitions();
        assert_eq!(drain(&mut partitions[0]).unwrap(), vec![(5, ())]);
    }
}
