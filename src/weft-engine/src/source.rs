//! Partitioned data sources.
//!
//! Sources split their input into N keyed partitions:
//!
//! - indexed inputs (slices, ranges) split into contiguous ranges or, when
//!   the consumer prefers it, interleaved fixed-size stripes
//! - a plain iterator is shared behind a lock; partitions claim growing
//!   chunks of consecutive elements
//! - a custom [`Partitioner`] supplies its own partitions

use std::collections::VecDeque;
use std::sync::Arc;

use common_display::ExplainNode;
use common_error::{QueryError, QueryResult, ensure_contract};
use common_runtime::CancellationState;
use log::debug;
use parking_lot::Mutex;
use weft_core::{KeyComparer, OrdinalIndexState};

use crate::operators::QueryOperator;
use crate::settings::QuerySettings;
use crate::stream::{
    BoxedEnumerator, IndexedSource, PartitionedStream, PartitionedStreamRecipient,
    QueryOperatorEnumerator, QueryResults,
};

/// Bounds `[start, end)` of partition `index` when `len` elements are split
/// contiguously over `count` partitions. The first `len % count`
/// partitions receive one extra element.
pub fn partition_bounds(len: usize, count: usize, index: usize) -> (usize, usize) {
    let base = len / count;
    let extra = len % count;
    let start = index * base + index.min(extra);
    let end = start + base + usize::from(index < extra);
    (start, end)
}

/// Something that can be split into keyed partitions.
pub trait DataSource: Send + Sync {
    /// Element type.
    type Item: Send + 'static;

    /// Display name.
    fn name(&self) -> &'static str;

    /// Positional guarantee of the produced keys.
    fn ordinal_index_state(&self) -> OrdinalIndexState;

    /// Split into `settings.degree_of_parallelism()` partitions.
    fn partition(
        &self,
        settings: &QuerySettings,
        prefer_striping: bool,
    ) -> QueryResult<SourceResults<Self::Item>>;

    /// Add source-specific details to the explain node.
    fn explain_details(&self, node: ExplainNode) -> ExplainNode {
        node
    }
}

/// Leaf operator reading a [`DataSource`].
#[derive(Debug)]
pub struct ScanOperator<S> {
    source: S,
}

impl<S> ScanOperator<S> {
    /// Wrap a data source.
    pub const fn new(source: S) -> Self {
        Self { source }
    }
}

impl<S: DataSource> QueryOperator for ScanOperator<S> {
    type Output = S::Item;
    type Results = SourceResults<S::Item>;

    fn open(&self, settings: &QuerySettings, prefer_striping: bool) -> QueryResult<Self::Results> {
        self.source.partition(settings, prefer_striping)
    }

    fn ordinal_index_state(&self) -> OrdinalIndexState {
        self.source.ordinal_index_state()
    }

    fn limits_parallelism(&self) -> bool {
        false
    }

    fn output_ordered(&self) -> bool {
        false
    }

    fn explain(&self) -> ExplainNode {
        let node = ExplainNode::new(self.source.name())
            .with_detail("ordinal", self.source.ordinal_index_state());
        self.source.explain_details(node)
    }
}

/// Opened source: the partitioned stream plus optional random access.
pub struct SourceResults<T> {
    stream: PartitionedStream<T, usize>,
    indexed: Option<Arc<dyn IndexedSource<T>>>,
}

impl<T: Send + 'static> SourceResults<T> {
    /// Results without random access.
    pub const fn new(stream: PartitionedStream<T, usize>) -> Self {
        Self {
            stream,
            indexed: None,
        }
    }

    /// The partitioned stream, dropping random access.
    pub fn into_stream(self) -> PartitionedStream<T, usize> {
        self.stream
    }

    /// Results with random access.
    pub fn with_indexed(stream: PartitionedStream<T, usize>, indexed: Arc<dyn IndexedSource<T>>) -> Self {
        Self {
            stream,
            indexed: Some(indexed),
        }
    }
}

impl<T: Send + 'static> QueryResults<T> for SourceResults<T> {
    fn give_partitioned_stream<R: PartitionedStreamRecipient<T>>(
        self,
        recipient: R,
    ) -> QueryResult<R::Output> {
        recipient.receive(self.stream)
    }

    fn indexed(&self) -> Option<Arc<dyn IndexedSource<T>>> {
        self.indexed.clone()
    }
}

// ============================================================================
// Indexed sources
// ============================================================================

/// Random access over a shared slice.
#[derive(Debug)]
pub struct SliceSource<T> {
    data: Arc<[T]>,
}

impl<T> SliceSource<T> {
    /// Random access over `data`.
    pub const fn new(data: Arc<[T]>) -> Self {
        Self { data }
    }
}

impl<T: Clone + Send + Sync> IndexedSource<T> for SliceSource<T> {
    fn len(&self) -> usize {
        self.data.len()
    }

    fn get(&self, index: usize) -> T {
        self.data[index].clone()
    }
}

/// The integers `start..start + count`.
#[derive(Debug, Clone, Copy)]
pub struct RangeSource {
    start: i64,
    count: usize,
}

impl RangeSource {
    /// The integers `start..start + count`.
    pub const fn new(start: i64, count: usize) -> Self {
        Self { start, count }
    }
}

impl IndexedSource<i64> for RangeSource {
    fn len(&self) -> usize {
        self.count
    }

    #[allow(clippy::cast_possible_wrap)] // count is bounded by memory
    fn get(&self, index: usize) -> i64 {
        self.start + index as i64
    }
}

/// Source over anything with random access.
pub struct IndexedDataSource<T> {
    name: &'static str,
    source: Arc<dyn IndexedSource<T>>,
}

impl<T> std::fmt::Debug for IndexedDataSource<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexedDataSource")
            .field("name", &self.name)
            .field("len", &self.source.len())
            .finish()
    }
}

impl<T: Send + 'static> IndexedDataSource<T> {
    /// Wrap an indexed source.
    pub fn new(name: &'static str, source: Arc<dyn IndexedSource<T>>) -> Self {
        Self { name, source }
    }
}

impl<T: Send + 'static> DataSource for IndexedDataSource<T> {
    type Item = T;

    fn name(&self) -> &'static str {
        self.name
    }

    fn ordinal_index_state(&self) -> OrdinalIndexState {
        OrdinalIndexState::Indexable
    }

    fn partition(
        &self,
        settings: &QuerySettings,
        prefer_striping: bool,
    ) -> QueryResult<SourceResults<T>> {
        let count = settings.degree_of_parallelism();
        let len = self.source.len();
        let cancellation = settings.cancellation();
        let partitions: Vec<BoxedEnumerator<T, usize>> = if prefer_striping {
            let chunk = settings.tuning().chunk_size;
            (0..count)
                .map(|i| {
                    Box::new(StripedEnumerator::new(
                        Arc::clone(&self.source),
                        i,
                        count,
                        chunk,
                        cancellation.clone(),
                    )) as BoxedEnumerator<T, usize>
                })
                .collect()
        } else {
            (0..count)
                .map(|i| {
                    let (start, end) = partition_bounds(len, count, i);
                    Box::new(IndexRangeEnumerator::new(
                        Arc::clone(&self.source),
                        start,
                        end,
                        cancellation.clone(),
                    )) as BoxedEnumerator<T, usize>
                })
                .collect()
        };
        debug!(
            "query {}: {} source of {len} elements over {count} partitions (striped={prefer_striping})",
            settings.query_id(),
            self.name
        );
        let stream = PartitionedStream::new(
            partitions,
            KeyComparer::natural(),
            OrdinalIndexState::Indexable,
        );
        Ok(SourceResults::with_indexed(stream, Arc::clone(&self.source)))
    }

    fn explain_details(&self, node: ExplainNode) -> ExplainNode {
        node.with_detail("len", self.source.len())
    }
}

struct IndexRangeEnumerator<T> {
    source: Arc<dyn IndexedSource<T>>,
    next: usize,
    end: usize,
    cancellation: CancellationState,
    counter: usize,
}

impl<T> IndexRangeEnumerator<T> {
    fn new(
        source: Arc<dyn IndexedSource<T>>,
        start: usize,
        end: usize,
        cancellation: CancellationState,
    ) -> Self {
        Self {
            source,
            next: start,
            end,
            cancellation,
            counter: 0,
        }
    }
}

impl<T: Send> QueryOperatorEnumerator<T, usize> for IndexRangeEnumerator<T> {
    fn move_next(&mut self) -> QueryResult<Option<(T, usize)>> {
        if self.next >= self.end {
            return Ok(None);
        }
        self.cancellation.poll(&mut self.counter)?;
        let index = self.next;
        self.next += 1;
        Ok(Some((self.source.get(index), index)))
    }
}

/// Visits chunks `partition, partition + count, ...` of `chunk` elements each.
struct StripedEnumerator<T> {
    source: Arc<dyn IndexedSource<T>>,
    stride: usize,
    chunk: usize,
    next_chunk: usize,
    next: usize,
    chunk_end: usize,
    cancellation: CancellationState,
    counter: usize,
}

impl<T> StripedEnumerator<T> {
    fn new(
        source: Arc<dyn IndexedSource<T>>,
        partition: usize,
        count: usize,
        chunk: usize,
        cancellation: CancellationState,
    ) -> Self {
        Self {
            source,
            stride: count,
            chunk: chunk.max(1),
            next_chunk: partition,
            next: 0,
            chunk_end: 0,
            cancellation,
            counter: 0,
        }
    }
}

impl<T: Send> QueryOperatorEnumerator<T, usize> for StripedEnumerator<T> {
    fn move_next(&mut self) -> QueryResult<Option<(T, usize)>> {
        if self.next >= self.chunk_end {
            let len = self.source.len();
            let start = self.next_chunk.saturating_mul(self.chunk);
            if start >= len {
                return Ok(None);
            }
            self.next = start;
            self.chunk_end = (start + self.chunk).min(len);
            self.next_chunk += self.stride;
        }
        self.cancellation.poll(&mut self.counter)?;
        let index = self.next;
        self.next += 1;
        Ok(Some((self.source.get(index), index)))
    }
}

// ============================================================================
// Shared iterator source
// ============================================================================

/// Source over a plain iterator, consumed at most once.
pub struct IteratorSource<I> {
    iter: Mutex<Option<I>>,
}

impl<I> std::fmt::Debug for IteratorSource<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IteratorSource")
            .field("consumed", &self.iter.lock().is_none())
            .finish()
    }
}

impl<I> IteratorSource<I> {
    /// Wrap an iterator.
    pub const fn new(iter: I) -> Self {
        Self {
            iter: Mutex::new(Some(iter)),
        }
    }
}

struct SharedIterator<I> {
    iter: I,
    next_index: usize,
    exhausted: bool,
}

impl<I> DataSource for IteratorSource<I>
where
    I: Iterator + Send + 'static,
    I::Item: Send + 'static,
{
    type Item = I::Item;

    fn name(&self) -> &'static str {
        "IteratorSource"
    }

    fn ordinal_index_state(&self) -> OrdinalIndexState {
        OrdinalIndexState::Correct
    }

    fn partition(
        &self,
        settings: &QuerySettings,
        _prefer_striping: bool,
    ) -> QueryResult<SourceResults<I::Item>> {
        let iter = self.iter.lock().take().ok_or_else(|| {
            QueryError::invalid_operation("an iterator source can only be enumerated once")
        })?;
        let shared = Arc::new(Mutex::new(SharedIterator {
            iter,
            next_index: 0,
            exhausted: false,
        }));
        let max_chunk = settings.tuning().chunk_size.max(1);
        let partitions = (0..settings.degree_of_parallelism())
            .map(|_| {
                Box::new(ChunkedIteratorEnumerator {
                    shared: Arc::clone(&shared),
                    buffer: VecDeque::new(),
                    chunk_size: 1,
                    max_chunk,
                    cancellation: settings.cancellation().clone(),
                    counter: 0,
                }) as BoxedEnumerator<I::Item, usize>
            })
            .collect();
        Ok(SourceResults::new(PartitionedStream::new(
            partitions,
            KeyComparer::natural(),
            OrdinalIndexState::Correct,
        )))
    }
}

struct ChunkedIteratorEnumerator<I: Iterator> {
    shared: Arc<Mutex<SharedIterator<I>>>,
    buffer: VecDeque<(I::Item, usize)>,
    chunk_size: usize,
    max_chunk: usize,
    cancellation: CancellationState,
    counter: usize,
}

impl<I> QueryOperatorEnumerator<I::Item, usize> for ChunkedIteratorEnumerator<I>
where
    I: Iterator + Send,
    I::Item: Send,
{
    fn move_next(&mut self) -> QueryResult<Option<(I::Item, usize)>> {
        self.cancellation.poll(&mut self.counter)?;
        if self.buffer.is_empty() {
            let mut shared = self.shared.lock();
            if shared.exhausted {
                return Ok(None);
            }
            for _ in 0..self.chunk_size {
                if let Some(item) = shared.iter.next() {
                    let index = shared.next_index;
                    shared.next_index += 1;
                    self.buffer.push_back((item, index));
                } else {
                    shared.exhausted = true;
                    break;
                }
            }
            drop(shared);
            self.chunk_size = (self.chunk_size * 2).min(self.max_chunk);
        }
        Ok(self.buffer.pop_front())
    }
}

// ============================================================================
// Custom partitioners
// ============================================================================

/// A boxed partition iterator.
pub type PartitionIter<T> = Box<dyn Iterator<Item = T> + Send>;

/// Caller-supplied partitioning.
pub trait Partitioner: Send + Sync {
    /// Element type.
    type Item: Send + 'static;

    /// Produce exactly `count` partitions.
    fn partitions(&self, count: usize) -> Vec<PartitionIter<Self::Item>>;
}

/// Source over a custom [`Partitioner`].
#[derive(Debug)]
pub struct PartitionerSource<P> {
    partitioner: P,
}

impl<P> PartitionerSource<P> {
    /// Wrap a partitioner.
    pub const fn new(partitioner: P) -> Self {
        Self { partitioner }
    }
}

impl<P: Partitioner> DataSource for PartitionerSource<P> {
    type Item = P::Item;

    fn name(&self) -> &'static str {
        "PartitionerSource"
    }

    fn ordinal_index_state(&self) -> OrdinalIndexState {
        OrdinalIndexState::Shuffled
    }

    fn partition(
        &self,
        settings: &QuerySettings,
        _prefer_striping: bool,
    ) -> QueryResult<SourceResults<P::Item>> {
        let count = settings.degree_of_parallelism();
        let iters = self.partitioner.partitions(count);
        ensure_contract!(
            iters.len() == count,
            "partitioner returned {} partitions, expected {count}",
            iters.len()
        );
        let partitions = iters
            .into_iter()
            .map(|iter| {
                Box::new(PartitionIterEnumerator {
                    iter,
                    next_index: 0,
                    cancellation: settings.cancellation().clone(),
                    counter: 0,
                }) as BoxedEnumerator<P::Item, usize>
            })
            .collect();
        Ok(SourceResults::new(PartitionedStream::new(
            partitions,
            KeyComparer::natural(),
            OrdinalIndexState::Shuffled,
        )))
    }
}

struct PartitionIterEnumerator<T> {
    iter: PartitionIter<T>,
    next_index: usize,
    cancellation: CancellationState,
    counter: usize,
}

impl<T: Send> QueryOperatorEnumerator<T, usize> for PartitionIterEnumerator<T> {
    fn move_next(&mut self) -> QueryResult<Option<(T, usize)>> {
        self.cancellation.poll(&mut self.counter)?;
        Ok(self.iter.next().map(|item| {
            let index = self.next_index;
            self.next_index += 1;
            (item, index)
        }))
    }
}

// ============================================================================
// Materialized inputs
// ============================================================================

/// Split an owned vector into `count` contiguous partitions keyed by
/// position. State `Indexable`.
pub fn contiguous_stream<T: Send + 'static>(
    mut items: Vec<T>,
    count: usize,
    cancellation: &CancellationState,
) -> PartitionedStream<T, usize> {
    let len = items.len();
    let mut partitions: Vec<BoxedEnumerator<T, usize>> = Vec::with_capacity(count);
    for i in (0..count).rev() {
        let (start, _) = partition_bounds(len, count, i);
        let tail = items.split_off(start);
        partitions.push(Box::new(OwnedRangeEnumerator {
            items: tail.into_iter(),
            next_key: start,
            cancellation: cancellation.clone(),
            counter: 0,
        }));
    }
    partitions.reverse();
    PartitionedStream::new(
        partitions,
        KeyComparer::natural(),
        OrdinalIndexState::Indexable,
    )
}

struct OwnedRangeEnumerator<T> {
    items: std::vec::IntoIter<T>,
    next_key: usize,
    cancellation: CancellationState,
    counter: usize,
}

impl<T: Send> QueryOperatorEnumerator<T, usize> for OwnedRangeEnumerator<T> {
    fn move_next(&mut self) -> QueryResult<Option<(T, usize)>> {
        self.cancellation.poll(&mut self.counter)?;
        Ok(self.items.next().map(|item| {
            let key = self.next_key;
            self.next_key += 1;
            (item, key)
        }))
    }
}

// ============================================================================
// Constructors
// ============================================================================

/// Query over the elements of a vector.
pub fn from_vec<T>(items: Vec<T>) -> ScanOperator<IndexedDataSource<T>>
where
    T: Clone + Send + Sync + 'static,
{
    from_arc(items.into())
}

/// Query over a shared slice.
pub fn from_arc<T>(data: Arc<[T]>) -> ScanOperator<IndexedDataSource<T>>
where
    T: Clone + Send + Sync + 'static,
{
    ScanOperator::new(IndexedDataSource::new(
        "ArraySource",
        Arc::new(SliceSource::new(data)),
    ))
}

/// Query over `start, start + 1, ..., start + count - 1`.
pub fn range(start: i64, count: usize) -> ScanOperator<IndexedDataSource<i64>> {
    ScanOperator::new(IndexedDataSource::new(
        "RangeSource",
        Arc::new(RangeSource::new(start, count)),
    ))
}

/// Query over a plain iterator. The resulting query runs at most once.
pub fn from_iter<I>(iter: I) -> ScanOperator<IteratorSource<I::IntoIter>>
where
    I: IntoIterator,
    I::IntoIter: Send + 'static,
    I::Item: Send + 'static,
{
    ScanOperator::new(IteratorSource::new(iter.into_iter()))
}

/// Query over a custom partitioner.
pub fn from_partitioner<P: Partitioner>(partitioner: P) -> ScanOperator<PartitionerSource<P>> {
    ScanOperator::new(PartitionerSource::new(partitioner))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::drain;

    fn settings(dop: usize) -> QuerySettings {
        QuerySettings::for_degree_of_parallelism(dop).unwrap()
    }

    fn collect_partitions<T: Send + 'static>(results: SourceResults<T>) -> Vec<Vec<(T, usize)>> {
        results
            .stream
            .into_partitions()
            .iter_mut()
            .map(|p| drain(p).unwrap())
            .collect()
    }

    #[test]
    fn test_partition_bounds_cover_input() {
        // 10 over 4: sizes 3, 3, 2, 2
        let bounds: Vec<_> = (0..4).map(|i| partition_bounds(10, 4, i)).collect();
        assert_eq!(bounds, vec![(0, 3), (3, 6), (6, 8), (8, 10)]);
        assert_eq!(partition_bounds(0, 3, 2), (0, 0));
    }

    #[test]
    fn test_contiguous_array_partitions() {
        let source = from_vec((0..10).collect::<Vec<i32>>());
        let results = source.open(&settings(4), false).unwrap();
        assert!(results.indexed().is_some());
        let parts = collect_partitions(results);
        assert_eq!(parts[0], vec![(0, 0), (1, 1), (2, 2)]);
        assert_eq!(parts[3], vec![(8, 8), (9, 9)]);
    }

    #[test]
    fn test_striped_partitions() {
        let s = settings(2);
        let chunk = s.tuning().chunk_size;
        let len = chunk * 3 + 1;
        let results = range(0, len).open(&s, true).unwrap();
        let parts = collect_partitions(results);
        // partition 0 holds chunks 0 and 2, partition 1 chunks 1 and 3
        assert_eq!(parts[0].len(), chunk * 2);
        assert_eq!(parts[1].len(), chunk + 1);
        assert!(parts.iter().all(|p| p.windows(2).all(|w| w[0].1 < w[1].1)));
        let mut all: Vec<_> = parts.into_iter().flatten().map(|(v, k)| {
            assert_eq!(usize::try_from(v).unwrap(), k);
            k
        }).collect();
        all.sort_unstable();
        assert_eq!(all, (0..len).collect::<Vec<_>>());
    }

    #[test]
    fn test_empty_input_yields_empty_partitions() {
        let results = from_vec(Vec::<u8>::new()).open(&settings(3), false).unwrap();
        let parts = collect_partitions(results);
        assert_eq!(parts.len(), 3);
        assert!(parts.iter().all(Vec::is_empty));
    }

    #[test]
    fn test_iterator_source_chunks_are_contiguous() {
        let source = from_iter(0..1000u32);
        let results = source.open(&settings(3), false).unwrap();
        let parts = collect_partitions(results);
        let mut all: Vec<_> = parts.into_iter().flatten().collect();
        all.sort_unstable_by_key(|p| p.1);
        assert!(all.iter().enumerate().all(|(i, &(v, k))| k == i && v as usize == i));
        assert_eq!(all.len(), 1000);

        let err = source.open(&settings(3), false).err().unwrap();
        assert!(matches!(err, QueryError::InvalidOperation(_)));
    }

    struct FixedPartitioner(usize);

    impl Partitioner for FixedPartitioner {
        type Item = usize;

        fn partitions(&self, _count: usize) -> Vec<PartitionIter<usize>> {
            (0..self.0)
                .map(|i| Box::new(std::iter::once(i)) as PartitionIter<usize>)
                .collect()
        }
    }

    #[test]
    fn test_partitioner_count_is_validated() {
        let ok = from_partitioner(FixedPartitioner(2)).open(&settings(2), false);
        assert!(ok.is_ok());
        let err = from_partitioner(FixedPartitioner(3)).open(&settings(2), false).err().unwrap();
        assert!(matches!(err, QueryError::ContractViolation(_)));
    }

    #[test]
    fn test_contiguous_stream_keys() {
        let cancellation = CancellationState::detached(64);
        let stream = contiguous_stream(vec!['a', 'b', 'c', 'd', 'e'], 2, &cancellation);
        assert_eq!(stream.ordinal_index_state(), OrdinalIndexState::Indexable);
        let mut parts = stream.into_partitions();
        assert_eq!(drain(&mut parts[0]).unwrap(), vec![('a', 0), ('b', 1), ('c', 2)]);
        assert_eq!(drain(&mut parts[1]).unwrap(), vec![('d', 3), ('e', 4)]);
    }
}
