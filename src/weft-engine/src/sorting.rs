//! Cooperative parallel sort.
//!
//! Every partition sorts its own run, then runs are merged pairwise in
//! `ceil(log2 N)` rounds. In round `p`, a partition whose index has bit `2^p`
//! set hands its run to partition `i - 2^p` and stops; the receiver merges
//! the two runs. Partition 0 ends up holding the complete sorted output.
//!
//! A round needs no separate barriers. Each sender and receiver pair meets
//! at one [`Rendezvous`] slot: the receive blocks until the run arrives, and
//! the sender leaves as soon as it has handed its run over. Partitions that
//! take no part in a round go straight on to the next one.

use common_error::QueryResult;
use common_runtime::{CancellationState, Rendezvous};
use weft_core::KeyComparer;

/// Shared state of one cooperative sort across `partition_count` tasks.
pub struct SortHelper<T, K> {
    partition_count: usize,
    comparer: KeyComparer<K>,
    // slots[round][receiver]
    slots: Vec<Vec<Rendezvous<Vec<(T, K)>>>>,
    cancellation: CancellationState,
}

impl<T, K> std::fmt::Debug for SortHelper<T, K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SortHelper")
            .field("partition_count", &self.partition_count)
            .field("rounds", &self.slots.len())
            .finish_non_exhaustive()
    }
}

/// Number of merge rounds for `n` partitions.
pub fn round_count(n: usize) -> usize {
    if n <= 1 {
        0
    } else {
        (usize::BITS - (n - 1).leading_zeros()) as usize
    }
}

impl<T: Send + 'static, K: Send + 'static> SortHelper<T, K> {
    /// Create the helper for `partition_count` partitions.
    pub fn new(
        partition_count: usize,
        comparer: KeyComparer<K>,
        cancellation: CancellationState,
    ) -> Self {
        let slots = (0..round_count(partition_count))
            .map(|_| (0..partition_count).map(|_| Rendezvous::new()).collect())
            .collect();
        Self {
            partition_count,
            comparer,
            slots,
            cancellation,
        }
    }

    /// Run `partition`'s share of the sort.
    ///
    /// Returns the full sorted output on partition 0 and `None` on every
    /// other partition once it has handed off its run.
    pub fn sort(&self, partition: usize, items: Vec<(T, K)>) -> QueryResult<Option<Vec<(T, K)>>> {
        let mut run = self.sort_local(items)?;
        for (round, slots) in self.slots.iter().enumerate() {
            let step = 1usize << round;
            if partition & step != 0 {
                slots[partition - step].send(run)?;
                return Ok(None);
            }
            if partition + step < self.partition_count {
                let other = slots[partition].receive(&self.cancellation)?;
                run = self.merge_runs(run, other)?;
            }
        }
        Ok(Some(run))
    }

    /// Sort one partition's items by key through an index array, moving
    /// each payload exactly once.
    fn sort_local(&self, items: Vec<(T, K)>) -> QueryResult<Vec<(T, K)>> {
        let mut indices: Vec<usize> = (0..items.len()).collect();
        {
            let comparer = &self.comparer;
            // Ties break on position, which keeps the sort stable.
            let less = |a: usize, b: usize| {
                comparer
                    .compare(&items[a].1, &items[b].1)
                    .then(a.cmp(&b))
                    .is_lt()
            };
            quicksort(&mut indices, less, &self.cancellation)?;
        }

        let mut slots: Vec<Option<(T, K)>> = items.into_iter().map(Some).collect();
        Ok(indices.iter().filter_map(|&i| slots[i].take()).collect())
    }

    /// Merge two sorted runs; on equal keys the left run wins.
    fn merge_runs(&self, left: Vec<(T, K)>, right: Vec<(T, K)>) -> QueryResult<Vec<(T, K)>> {
        let mut out = Vec::with_capacity(left.len() + right.len());
        let mut left = left.into_iter().peekable();
        let mut right = right.into_iter().peekable();
        let mut counter = 0usize;
        loop {
            self.cancellation.poll(&mut counter)?;
            let take_right = match (left.peek(), right.peek()) {
                (Some(l), Some(r)) => self.comparer.compare(&r.1, &l.1).is_lt(),
                (Some(_), None) => {
                    out.extend(left);
                    break;
                }
                (None, _) => {
                    out.extend(right);
                    break;
                }
            };
            let next = if take_right { right.next() } else { left.next() };
            out.extend(next);
        }
        Ok(out)
    }
}

/// Iterative quicksort with a middle pivot. `less` must be a strict total order.
fn quicksort<F>(indices: &mut [usize], less: F, cancellation: &CancellationState) -> QueryResult<()>
where
    F: Fn(usize, usize) -> bool,
{
    let mut counter = 0usize;
    let mut stack = vec![(0usize, indices.len())];
    while let Some((lo, hi)) = stack.pop() {
        cancellation.poll(&mut counter)?;
        if hi - lo < 2 {
            continue;
        }
        let mid = lo + (hi - lo) / 2;
        indices.swap(mid, hi - 1);
        let pivot = indices[hi - 1];
        let mut store = lo;
        for k in lo..hi - 1 {
            if less(indices[k], pivot) {
                indices.swap(k, store);
                store += 1;
            }
        }
        indices.swap(store, hi - 1);

        // Push the larger side first so the smaller one is processed next.
        let (a, b) = ((lo, store), (store + 1, hi));
        if a.1 - a.0 > b.1 - b.0 {
            stack.push(a);
            stack.push(b);
        } else {
            stack.push(b);
            stack.push(a);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use proptest::prelude::*;

    use super::*;

    fn run_sort(partitions: Vec<Vec<(u32, i64)>>) -> Vec<(u32, i64)> {
        let n = partitions.len();
        let cancellation = CancellationState::detached(64);
        let helper = Arc::new(SortHelper::new(n, KeyComparer::natural(), cancellation));

        let mut parts = partitions.into_iter().enumerate();
        let (_, first) = parts.next().unwrap();
        let handles: Vec<_> = parts
            .map(|(i, items)| {
                let helper = Arc::clone(&helper);
                thread::spawn(move || helper.sort(i, items).unwrap())
            })
            .collect();
        let result = helper.sort(0, first).unwrap().unwrap();
        for handle in handles {
            assert!(handle.join().unwrap().is_none());
        }
        result
    }

    #[test]
    fn test_round_count() {
        assert_eq!(round_count(1), 0);
        assert_eq!(round_count(2), 1);
        assert_eq!(round_count(3), 2);
        assert_eq!(round_count(8), 3);
        assert_eq!(round_count(9), 4);
    }

    #[test]
    fn test_single_partition() {
        let sorted = run_sort(vec![vec![(1, 3), (2, 1), (3, 2)]]);
        assert_eq!(sorted, vec![(2, 1), (3, 2), (1, 3)]);
    }

    #[test]
    fn test_empty_partitions() {
        let sorted = run_sort(vec![vec![], vec![(7, 0)], vec![], vec![]]);
        assert_eq!(sorted, vec![(7, 0)]);
    }

    #[test]
    fn test_equal_keys_keep_partition_order() {
        let sorted = run_sort(vec![vec![(0, 5), (1, 5)], vec![(2, 5)], vec![(3, 5)]]);
        assert_eq!(sorted.iter().map(|p| p.0).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_cancelled_receiver_returns() {
        let cancellation = CancellationState::detached(64);
        let helper: SortHelper<u32, i64> =
            SortHelper::new(2, KeyComparer::natural(), cancellation.clone());
        cancellation.cancel_internal();
        assert!(helper.sort(0, vec![(1, 1)]).unwrap_err().is_canceled());
    }

    proptest! {
        #[test]
        fn prop_sort_matches_stable_sort(
            partitions in prop::collection::vec(prop::collection::vec(-50i64..50, 0..40), 1..6)
        ) {
            let mut tagged = Vec::new();
            let mut id = 0u32;
            let input: Vec<Vec<(u32, i64)>> = partitions
                .into_iter()
                .map(|keys| keys.into_iter().map(|k| { id += 1; tagged.push((id, k)); (id, k) }).collect())
                .collect();
            tagged.sort_by_key(|&(_, k)| k);
            prop_assert_eq!(run_sort(input), tagged);
        }
    }
}
