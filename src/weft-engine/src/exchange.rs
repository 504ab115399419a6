//! Hash repartitioning.
//!
//! Every partition drains its input, routing each element to destination
//! `router(element) % N` in a private row of N [`ListChunk`]s. Rows are
//! deposited into an N×N matrix; once all N partitions have arrived at the
//! barrier, each reads back its own column in source-partition order.
//!
//! The unordered exchange drops the order keys; the ordered one carries them
//! through so downstream operators can restore the original order.

use std::sync::Arc;

use common_error::QueryResult;
use common_runtime::{CancellationState, CountdownEvent};
use log::debug;
use parking_lot::Mutex;
use weft_core::{KeyComparer, ListChunk, OrderKey, OrdinalIndexState};

use crate::settings::QuerySettings;
use crate::stream::{BoxedEnumerator, PartitionedStream, QueryOperatorEnumerator, drop_keys};

/// Maps an element to the hash that picks its destination partition.
pub type Router<T> = Arc<dyn Fn(&T) -> u64 + Send + Sync>;

/// Repartition so that equal-hashing elements land in the same partition,
/// discarding order keys. The output state is `Shuffled`.
pub fn hash_repartition<T, K>(
    stream: PartitionedStream<T, K>,
    router: Router<T>,
    settings: &QuerySettings,
) -> PartitionedStream<T, ()>
where
    T: Send + 'static,
    K: OrderKey,
{
    if stream.partition_count() == 1 {
        return drop_keys(stream);
    }
    repartition(stream, router, |_| (), KeyComparer::unit(), settings)
}

/// Repartition like [`hash_repartition`] but keep each element's order key.
pub fn hash_repartition_ordered<T, K>(
    stream: PartitionedStream<T, K>,
    router: Router<T>,
    settings: &QuerySettings,
) -> PartitionedStream<T, K>
where
    T: Send + 'static,
    K: OrderKey,
{
    let comparer = stream.key_comparer().clone();
    if stream.partition_count() == 1 {
        return stream.map_partitions(comparer, OrdinalIndexState::Shuffled, |_, p| p);
    }
    repartition(stream, router, |k| k, comparer, settings)
}

fn repartition<T, K, K2>(
    stream: PartitionedStream<T, K>,
    router: Router<T>,
    project: fn(K) -> K2,
    comparer: KeyComparer<K2>,
    settings: &QuerySettings,
) -> PartitionedStream<T, K2>
where
    T: Send + 'static,
    K: OrderKey,
    K2: OrderKey,
{
    let count = stream.partition_count();
    debug!(
        "query {}: hash exchange over {count} partitions",
        settings.query_id()
    );
    let matrix = Arc::new(ExchangeMatrix {
        count,
        cells: (0..count * count).map(|_| Mutex::new(None)).collect(),
        barrier: CountdownEvent::new(count),
        cancellation: settings.cancellation().clone(),
    });
    stream.map_partitions(comparer, OrdinalIndexState::Shuffled, |partition, source| {
        Box::new(ExchangeEnumerator {
            partition,
            matrix: Arc::clone(&matrix),
            router: Arc::clone(&router),
            project,
            state: ExchangeState::Pending(source),
        })
    })
}

/// Cells are indexed `source * count + destination`.
struct ExchangeMatrix<T, K> {
    count: usize,
    cells: Vec<Mutex<Option<ListChunk<(T, K)>>>>,
    barrier: CountdownEvent,
    cancellation: CancellationState,
}

impl<T, K> ExchangeMatrix<T, K> {
    fn deposit(&self, source: usize, row: Vec<ListChunk<(T, K)>>) {
        for (destination, chunk) in row.into_iter().enumerate() {
            *self.cells[source * self.count + destination].lock() = Some(chunk);
        }
    }

    fn take_column(&self, destination: usize) -> Vec<ListChunk<(T, K)>> {
        (0..self.count)
            .filter_map(|source| self.cells[source * self.count + destination].lock().take())
            .collect()
    }
}

enum ExchangeState<T, K, K2> {
    Pending(BoxedEnumerator<T, K>),
    Reading(std::iter::Flatten<std::vec::IntoIter<ListChunk<(T, K2)>>>),
}

struct ExchangeEnumerator<T, K, K2> {
    partition: usize,
    matrix: Arc<ExchangeMatrix<T, K2>>,
    router: Router<T>,
    project: fn(K) -> K2,
    state: ExchangeState<T, K, K2>,
}

impl<T, K, K2> ExchangeEnumerator<T, K, K2>
where
    T: Send + 'static,
    K: OrderKey,
    K2: OrderKey,
{
    fn exchange(&self, source: &mut BoxedEnumerator<T, K>) -> QueryResult<Vec<ListChunk<(T, K2)>>> {
        let count = self.matrix.count;
        let mut row: Vec<ListChunk<(T, K2)>> = (0..count).map(|_| ListChunk::new()).collect();
        let mut counter = 0usize;
        while let Some((item, key)) = source.move_next()? {
            self.matrix.cancellation.poll(&mut counter)?;
            #[allow(clippy::cast_possible_truncation)] // result is below count
            let destination = ((self.router)(&item) % count as u64) as usize;
            row[destination].push((item, (self.project)(key)));
        }
        self.matrix.deposit(self.partition, row);
        self.matrix
            .barrier
            .signal_and_wait(&self.matrix.cancellation)?;
        Ok(self.matrix.take_column(self.partition))
    }
}

impl<T, K, K2> QueryOperatorEnumerator<T, K2> for ExchangeEnumerator<T, K, K2>
where
    T: Send + 'static,
    K: OrderKey,
    K2: OrderKey,
{
    fn move_next(&mut self) -> QueryResult<Option<(T, K2)>> {
        if let ExchangeState::Pending(source) = &mut self.state {
            let mut source = std::mem::replace(source, Box::new(crate::stream::EmptyEnumerator));
            let column = self.exchange(&mut source)?;
            self.state = ExchangeState::Reading(column.into_iter().flatten());
        }
        match &mut self.state {
            ExchangeState::Reading(items) => Ok(items.next()),
            ExchangeState::Pending(_) => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::thread;

    use super::*;
    use crate::stream::{BufferedEnumerator, drain};

    fn stream_of(parts: Vec<Vec<u64>>, settings: &QuerySettings) -> PartitionedStream<u64, usize> {
        let mut next = 0usize;
        let partitions = parts
            .into_iter()
            .map(|items| {
                let keyed = items
                    .into_iter()
                    .map(|v| {
                        next += 1;
                        (v, next)
                    })
                    .collect();
                Box::new(BufferedEnumerator::new(keyed, settings.cancellation().clone()))
                    as BoxedEnumerator<u64, usize>
            })
            .collect();
        PartitionedStream::new(partitions, KeyComparer::natural(), OrdinalIndexState::Correct)
    }

    fn run_parallel<T: Send + 'static, K: Send + 'static>(
        stream: PartitionedStream<T, K>,
    ) -> Vec<QueryResult<Vec<(T, K)>>>
    where
        K: OrderKey,
    {
        let handles: Vec<_> = stream
            .into_partitions()
            .into_iter()
            .map(|mut p| thread::spawn(move || drain(&mut p)))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn test_equal_hashes_meet() {
        let settings = QuerySettings::for_degree_of_parallelism(3).unwrap();
        let stream = stream_of(vec![vec![1, 2, 3, 4], vec![4, 5, 1], vec![2, 2]], &settings);
        let router: Router<u64> = Arc::new(|v| *v);
        let out = run_parallel(hash_repartition(stream, router, &settings));

        let mut total = 0;
        for (dest, part) in out.into_iter().enumerate() {
            let part = part.unwrap();
            total += part.len();
            assert!(part.iter().all(|(v, ())| *v as usize % 3 == dest));
        }
        assert_eq!(total, 9);
    }

    #[test]
    fn test_ordered_exchange_keeps_keys() {
        let settings = QuerySettings::for_degree_of_parallelism(2).unwrap();
        let stream = stream_of(vec![vec![10, 11, 12], vec![13, 14]], &settings);
        let router: Router<u64> = Arc::new(|v| *v);
        let out = hash_repartition_ordered(stream, router, &settings);
        assert_eq!(out.ordinal_index_state(), OrdinalIndexState::Shuffled);
        let keys: HashSet<usize> = run_parallel(out)
            .into_iter()
            .flat_map(Result::unwrap)
            .map(|(_, k)| k)
            .collect();
        assert_eq!(keys, (1..=5).collect());
    }

    #[test]
    fn test_single_partition_skips_exchange() {
        let settings = QuerySettings::for_degree_of_parallelism(1).unwrap();
        let stream = stream_of(vec![vec![7, 8]], &settings);
        let router: Router<u64> = Arc::new(|_| unreachable!());
        let mut parts = hash_repartition(stream, router, &settings).into_partitions();
        assert_eq!(drain(&mut parts[0]).unwrap(), vec![(7, ()), (8, ())]);
    }

    #[test]
    fn test_cancel_releases_waiting_partition() {
        let settings = QuerySettings::for_degree_of_parallelism(2).unwrap();
        let stream = stream_of(vec![vec![1], vec![2]], &settings);
        let router: Router<u64> = Arc::new(|v| *v);
        let mut parts = hash_repartition(stream, router, &settings).into_partitions();
        let mut first = parts.remove(0);
        let waiter = thread::spawn(move || drain(&mut first));
        thread::sleep(std::time::Duration::from_millis(20));
        settings.cancellation().cancel_internal();
        assert!(waiter.join().unwrap().unwrap_err().is_canceled());
    }
}
