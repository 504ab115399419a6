//! Aggregations.
//!
//! An aggregation runs in two steps. [`AggregateOperator`] folds every
//! partition into one partial accumulator; the terminal then combines the
//! partials in partition order and finishes the result on the calling
//! thread. Any, All and Contains use [`AnyOperator`], which lets partitions
//! stop early once some partition has found a match.

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use common_error::{QueryError, QueryResult};
use common_runtime::CancellationState;
use weft_core::{KeyComparer, OrderKey, OrdinalIndexState};

use super::UnaryOperator;
use crate::settings::QuerySettings;
use crate::stream::{
    BoxedEnumerator, PartitionedStream, PartitionedStreamRecipient, QueryOperatorEnumerator,
};

/// A fold that can run per partition and combine its partial results.
pub trait PartialAggregate: Send + Sync + 'static {
    /// Element type consumed.
    type Input: Send + 'static;
    /// Per-partition accumulator.
    type Acc: Send + 'static;
    /// Final result.
    type Output;

    /// Display name.
    fn name(&self) -> &'static str;

    /// Accumulator of an empty partition.
    fn init(&self) -> Self::Acc;

    /// Fold one element in.
    fn accumulate(&self, acc: Self::Acc, item: Self::Input) -> QueryResult<Self::Acc>;

    /// Merge two partials; `left` precedes `right` in partition order.
    fn combine(&self, left: Self::Acc, right: Self::Acc) -> QueryResult<Self::Acc>;

    /// Turn the combined accumulator into the result.
    fn finish(&self, acc: Self::Acc) -> QueryResult<Self::Output>;

    /// Whether a partition that saw no elements still contributes a partial.
    fn emits_empty_partials(&self) -> bool {
        true
    }

    /// Combine partials in order and finish.
    fn complete(&self, partials: Vec<Self::Acc>) -> QueryResult<Self::Output> {
        let mut acc = self.init();
        for partial in partials {
            acc = self.combine(acc, partial)?;
        }
        self.finish(acc)
    }
}

/// Folds each partition into a single partial accumulator.
pub struct AggregateOperator<A> {
    aggregate: Arc<A>,
}

impl<A> std::fmt::Debug for AggregateOperator<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AggregateOperator")
    }
}

impl<A> AggregateOperator<A> {
    /// Run `aggregate` per partition.
    pub const fn new(aggregate: Arc<A>) -> Self {
        Self { aggregate }
    }
}

impl<A: PartialAggregate> UnaryOperator for AggregateOperator<A> {
    type Input = A::Input;
    type Output = A::Acc;

    fn name(&self) -> &'static str {
        self.aggregate.name()
    }

    fn output_state(&self, _input: OrdinalIndexState) -> OrdinalIndexState {
        OrdinalIndexState::Shuffled
    }

    fn output_ordered(&self, _input_ordered: bool) -> bool {
        false
    }

    fn wrap_partitioned_stream<K, R>(
        &self,
        input: PartitionedStream<A::Input, K>,
        recipient: R,
        _ordered: bool,
        settings: &QuerySettings,
    ) -> QueryResult<R::Output>
    where
        K: OrderKey,
        R: PartitionedStreamRecipient<A::Acc>,
    {
        recipient.receive(input.map_partitions(
            KeyComparer::unit(),
            OrdinalIndexState::Shuffled,
            |_, source| {
                Box::new(AggregateEnumerator {
                    source: Some(source),
                    aggregate: Arc::clone(&self.aggregate),
                    cancellation: settings.cancellation().clone(),
                })
            },
        ))
    }
}

struct AggregateEnumerator<A: PartialAggregate, K> {
    source: Option<BoxedEnumerator<A::Input, K>>,
    aggregate: Arc<A>,
    cancellation: CancellationState,
}

impl<A: PartialAggregate, K: OrderKey> QueryOperatorEnumerator<A::Acc, ()>
    for AggregateEnumerator<A, K>
{
    fn move_next(&mut self) -> QueryResult<Option<(A::Acc, ())>> {
        let Some(mut source) = self.source.take() else {
            return Ok(None);
        };
        let mut acc = self.aggregate.init();
        let mut counter = 0usize;
        let mut seen = false;
        while let Some((item, _)) = source.move_next()? {
            self.cancellation.poll(&mut counter)?;
            acc = self.aggregate.accumulate(acc, item)?;
            seen = true;
        }
        if !seen && !self.aggregate.emits_empty_partials() {
            return Ok(None);
        }
        Ok(Some((acc, ())))
    }
}

// ============================================================================
// Numeric helpers
// ============================================================================

/// Types that can be summed and averaged.
pub trait Summable: Copy + Send + Sync + 'static {
    /// Additive identity.
    fn zero() -> Self;

    /// Sum, or `None` on overflow.
    fn checked_sum(self, other: Self) -> Option<Self>;

    /// Value as a float, for averages.
    fn to_f64(self) -> f64;
}

macro_rules! impl_summable_int {
    ($($t:ty),*) => {$(
        impl Summable for $t {
            fn zero() -> Self {
                0
            }

            fn checked_sum(self, other: Self) -> Option<Self> {
                self.checked_add(other)
            }

            #[allow(clippy::cast_precision_loss, clippy::cast_lossless)]
            fn to_f64(self) -> f64 {
                self as f64
            }
        }
    )*};
}

impl_summable_int!(i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize);

impl Summable for f32 {
    fn zero() -> Self {
        0.0
    }

    fn checked_sum(self, other: Self) -> Option<Self> {
        Some(self + other)
    }

    fn to_f64(self) -> f64 {
        f64::from(self)
    }
}

impl Summable for f64 {
    fn zero() -> Self {
        0.0
    }

    fn checked_sum(self, other: Self) -> Option<Self> {
        Some(self + other)
    }

    fn to_f64(self) -> f64 {
        self
    }
}

/// Types with a minimum and maximum. Floats report NaN so Min and Max can
/// treat it specially.
pub trait Comparable: PartialOrd + Send + Sync + 'static {
    /// Whether the value is NaN.
    fn is_nan(&self) -> bool {
        false
    }
}

macro_rules! impl_comparable {
    ($($t:ty),*) => {$(
        impl Comparable for $t {}
    )*};
}

impl_comparable!(
    i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, char, bool, String
);

impl Comparable for f32 {
    fn is_nan(&self) -> bool {
        f32::is_nan(*self)
    }
}

impl Comparable for f64 {
    fn is_nan(&self) -> bool {
        f64::is_nan(*self)
    }
}

// ============================================================================
// Built-in aggregates
// ============================================================================

/// Number of elements.
pub struct Count<T>(PhantomData<fn(T)>);

impl<T> Default for Count<T> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<T: Send + 'static> PartialAggregate for Count<T> {
    type Input = T;
    type Acc = usize;
    type Output = usize;

    fn name(&self) -> &'static str {
        "Count"
    }

    fn init(&self) -> usize {
        0
    }

    fn accumulate(&self, acc: usize, _item: T) -> QueryResult<usize> {
        acc.checked_add(1)
            .ok_or_else(|| QueryError::invalid_operation("count overflowed"))
    }

    fn combine(&self, left: usize, right: usize) -> QueryResult<usize> {
        left.checked_add(right)
            .ok_or_else(|| QueryError::invalid_operation("count overflowed"))
    }

    fn finish(&self, acc: usize) -> QueryResult<usize> {
        Ok(acc)
    }
}

/// Sum of the elements; zero for an empty input. Integer overflow is an
/// `InvalidOperation`.
pub struct Sum<T>(PhantomData<fn(T)>);

impl<T> Default for Sum<T> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<T: Summable> PartialAggregate for Sum<T> {
    type Input = T;
    type Acc = T;
    type Output = T;

    fn name(&self) -> &'static str {
        "Sum"
    }

    fn init(&self) -> T {
        T::zero()
    }

    fn accumulate(&self, acc: T, item: T) -> QueryResult<T> {
        self.combine(acc, item)
    }

    fn combine(&self, left: T, right: T) -> QueryResult<T> {
        left.checked_sum(right)
            .ok_or_else(|| QueryError::invalid_operation("arithmetic overflow in sum"))
    }

    fn finish(&self, acc: T) -> QueryResult<T> {
        Ok(acc)
    }
}

/// Arithmetic mean as `f64`. Empty input is an `InvalidOperation`.
pub struct Average<T>(PhantomData<fn(T)>);

impl<T> Default for Average<T> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<T: Summable> PartialAggregate for Average<T> {
    type Input = T;
    type Acc = (T, u64);
    type Output = f64;

    fn name(&self) -> &'static str {
        "Average"
    }

    fn init(&self) -> (T, u64) {
        (T::zero(), 0)
    }

    fn accumulate(&self, acc: (T, u64), item: T) -> QueryResult<(T, u64)> {
        self.combine(acc, (item, 1))
    }

    fn combine(&self, left: (T, u64), right: (T, u64)) -> QueryResult<(T, u64)> {
        let sum = left
            .0
            .checked_sum(right.0)
            .ok_or_else(|| QueryError::invalid_operation("arithmetic overflow in average"))?;
        Ok((sum, left.1 + right.1))
    }

    #[allow(clippy::cast_precision_loss)]
    fn finish(&self, (sum, count): (T, u64)) -> QueryResult<f64> {
        if count == 0 {
            return Err(QueryError::no_elements());
        }
        Ok(sum.to_f64() / count as f64)
    }
}

/// Smallest element. Any NaN makes the result NaN.
pub struct Min<T>(PhantomData<fn(T)>);

impl<T> Default for Min<T> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<T: Comparable> PartialAggregate for Min<T> {
    type Input = T;
    type Acc = Option<T>;
    type Output = T;

    fn name(&self) -> &'static str {
        "Min"
    }

    fn init(&self) -> Option<T> {
        None
    }

    fn accumulate(&self, acc: Option<T>, item: T) -> QueryResult<Option<T>> {
        self.combine(acc, Some(item))
    }

    fn combine(&self, left: Option<T>, right: Option<T>) -> QueryResult<Option<T>> {
        Ok(match (left, right) {
            (None, other) | (other, None) => other,
            (Some(l), Some(r)) => {
                if l.is_nan() || (!r.is_nan() && l <= r) {
                    Some(l)
                } else {
                    Some(r)
                }
            }
        })
    }

    fn finish(&self, acc: Option<T>) -> QueryResult<T> {
        acc.ok_or_else(QueryError::no_elements)
    }
}

/// Largest element. NaN is ignored unless every element is NaN.
pub struct Max<T>(PhantomData<fn(T)>);

impl<T> Default for Max<T> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<T: Comparable> PartialAggregate for Max<T> {
    type Input = T;
    type Acc = Option<T>;
    type Output = T;

    fn name(&self) -> &'static str {
        "Max"
    }

    fn init(&self) -> Option<T> {
        None
    }

    fn accumulate(&self, acc: Option<T>, item: T) -> QueryResult<Option<T>> {
        self.combine(acc, Some(item))
    }

    fn combine(&self, left: Option<T>, right: Option<T>) -> QueryResult<Option<T>> {
        Ok(match (left, right) {
            (None, other) | (other, None) => other,
            (Some(l), Some(r)) => {
                if r.is_nan() || (!l.is_nan() && l >= r) {
                    Some(l)
                } else {
                    Some(r)
                }
            }
        })
    }

    fn finish(&self, acc: Option<T>) -> QueryResult<T> {
        acc.ok_or_else(QueryError::no_elements)
    }
}

/// User fold with a seed, an element step and a partial combiner.
///
/// Every partition starts from a clone of the seed, so the seed must be an
/// identity of `combine` for the result to match a sequential fold.
pub struct Fold<T, Acc, F, G> {
    seed: Acc,
    fold: F,
    combine: G,
    _types: PhantomData<fn(T)>,
}

impl<T, Acc, F, G> Fold<T, Acc, F, G> {
    /// Build the fold.
    pub const fn new(seed: Acc, fold: F, combine: G) -> Self {
        Self {
            seed,
            fold,
            combine,
            _types: PhantomData,
        }
    }
}

impl<T, Acc, F, G> PartialAggregate for Fold<T, Acc, F, G>
where
    T: Send + 'static,
    Acc: Clone + Send + Sync + 'static,
    F: Fn(Acc, T) -> Acc + Send + Sync + 'static,
    G: Fn(Acc, Acc) -> Acc + Send + Sync + 'static,
{
    type Input = T;
    type Acc = Acc;
    type Output = Acc;

    fn name(&self) -> &'static str {
        "Aggregate"
    }

    fn init(&self) -> Acc {
        self.seed.clone()
    }

    fn accumulate(&self, acc: Acc, item: T) -> QueryResult<Acc> {
        Ok((self.fold)(acc, item))
    }

    fn combine(&self, left: Acc, right: Acc) -> QueryResult<Acc> {
        Ok((self.combine)(left, right))
    }

    fn finish(&self, acc: Acc) -> QueryResult<Acc> {
        Ok(acc)
    }

    // Empty partitions would each add a copy of the seed.
    fn emits_empty_partials(&self) -> bool {
        false
    }

    // The seed already started every non-empty partition; combining
    // partials onto another copy would count it once more.
    fn complete(&self, partials: Vec<Acc>) -> QueryResult<Acc> {
        let mut partials = partials.into_iter();
        let Some(mut acc) = partials.next() else {
            return Ok(self.seed.clone());
        };
        for partial in partials {
            acc = (self.combine)(acc, partial);
        }
        Ok(acc)
    }
}

/// Fold without a seed; empty input is an `InvalidOperation`.
pub struct Reduce<T, F> {
    reduce: F,
    _types: PhantomData<fn(T)>,
}

impl<T, F> Reduce<T, F> {
    /// Build the reduction.
    pub const fn new(reduce: F) -> Self {
        Self {
            reduce,
            _types: PhantomData,
        }
    }
}

impl<T, F> PartialAggregate for Reduce<T, F>
where
    T: Send + 'static,
    F: Fn(T, T) -> T + Send + Sync + 'static,
{
    type Input = T;
    type Acc = Option<T>;
    type Output = T;

    fn name(&self) -> &'static str {
        "Reduce"
    }

    fn init(&self) -> Option<T> {
        None
    }

    fn accumulate(&self, acc: Option<T>, item: T) -> QueryResult<Option<T>> {
        self.combine(acc, Some(item))
    }

    fn combine(&self, left: Option<T>, right: Option<T>) -> QueryResult<Option<T>> {
        Ok(match (left, right) {
            (Some(l), Some(r)) => Some((self.reduce)(l, r)),
            (None, other) | (other, None) => other,
        })
    }

    fn finish(&self, acc: Option<T>) -> QueryResult<T> {
        acc.ok_or_else(QueryError::no_elements)
    }
}

// ============================================================================
// Any / All / Contains
// ============================================================================

/// Whether any element satisfies a predicate. Each partition yields one
/// boolean; partitions stop as soon as any of them has found a match.
pub struct AnyOperator<T, F> {
    predicate: Arc<F>,
    _types: PhantomData<fn(T)>,
}

impl<T, F> std::fmt::Debug for AnyOperator<T, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AnyOperator")
    }
}

impl<T, F> AnyOperator<T, F> {
    /// Test elements with `predicate`.
    pub fn new(predicate: F) -> Self {
        Self {
            predicate: Arc::new(predicate),
            _types: PhantomData,
        }
    }
}

impl<T, F> UnaryOperator for AnyOperator<T, F>
where
    T: Send + 'static,
    F: Fn(&T) -> bool + Send + Sync + 'static,
{
    type Input = T;
    type Output = bool;

    fn name(&self) -> &'static str {
        "Any"
    }

    fn output_state(&self, _input: OrdinalIndexState) -> OrdinalIndexState {
        OrdinalIndexState::Shuffled
    }

    fn output_ordered(&self, _input_ordered: bool) -> bool {
        false
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
        R: PartitionedStreamRecipient<bool>,
    {
        let found = Arc::new(AtomicBool::new(false));
        recipient.receive(input.map_partitions(
            KeyComparer::unit(),
            OrdinalIndexState::Shuffled,
            |_, source| {
                Box::new(AnyEnumerator {
                    source: Some(source),
                    predicate: Arc::clone(&self.predicate),
                    found: Arc::clone(&found),
                    cancellation: settings.cancellation().clone(),
                })
            },
        ))
    }
}

struct AnyEnumerator<T, K, F> {
    source: Option<BoxedEnumerator<T, K>>,
    predicate: Arc<F>,
    found: Arc<AtomicBool>,
    cancellation: CancellationState,
}

impl<T, K, F> QueryOperatorEnumerator<bool, ()> for AnyEnumerator<T, K, F>
where
    T: Send + 'static,
    K: OrderKey,
    F: Fn(&T) -> bool + Send + Sync,
{
    fn move_next(&mut self) -> QueryResult<Option<(bool, ())>> {
        let Some(mut source) = self.source.take() else {
            return Ok(None);
        };
        let mut counter = 0usize;
        while !self.found.load(Ordering::Acquire) {
            let Some((item, _)) = source.move_next()? else {
                return Ok(Some((false, ())));
            };
            self.cancellation.poll(&mut counter)?;
            if (self.predicate)(&item) {
                self.found.store(true, Ordering::Release);
                return Ok(Some((true, ())));
            }
        }
        Ok(Some((false, ())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::QueryExt;
    use crate::settings::QueryContext;
    use crate::source::{from_vec, range};

    #[test]
    fn test_count_sum_average() {
        let ctx = QueryContext::new().with_degree_of_parallelism(4);
        assert_eq!(range(0, 1000).count(&ctx).unwrap(), 1000);
        assert_eq!(range(1, 100).sum(&ctx).unwrap(), 5050);
        assert!((range(1, 4).average(&ctx).unwrap() - 2.5).abs() < f64::EPSILON);
        assert_eq!(range(0, 0).sum(&ctx).unwrap(), 0);
    }

    #[test]
    fn test_sum_overflow_is_invalid_operation() {
        let ctx = QueryContext::new().with_degree_of_parallelism(2);
        let err = from_vec(vec![i32::MAX, 1]).sum(&ctx).unwrap_err();
        assert!(matches!(err, QueryError::InvalidOperation(_)));
    }

    #[test]
    fn test_empty_aggregates_fail() {
        let ctx = QueryContext::new().with_degree_of_parallelism(3);
        assert!(matches!(range(0, 0).min(&ctx), Err(QueryError::InvalidOperation(_))));
        assert!(matches!(range(0, 0).max(&ctx), Err(QueryError::InvalidOperation(_))));
        assert!(matches!(range(0, 0).average(&ctx), Err(QueryError::InvalidOperation(_))));
        assert!(matches!(
            range(0, 0).reduce(|a, b| a + b, &ctx),
            Err(QueryError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_min_max_nan_rules() {
        let min = Min::<f64>::default();
        let max = Max::<f64>::default();
        let fold = |agg: &dyn Fn(Option<f64>, f64) -> Option<f64>, items: &[f64]| {
            items.iter().fold(None, |acc, x| agg(acc, *x))
        };
        let min_step = |acc, x| min.accumulate(acc, x).unwrap();
        let max_step = |acc, x| max.accumulate(acc, x).unwrap();

        assert!(fold(&min_step, &[3.0, f64::NAN, 1.0]).unwrap().is_nan());
        assert!(fold(&min_step, &[f64::NAN, 3.0]).unwrap().is_nan());
        assert_eq!(fold(&min_step, &[3.0, 1.0, 2.0]), Some(1.0));

        assert_eq!(fold(&max_step, &[3.0, f64::NAN, 1.0]), Some(3.0));
        assert_eq!(fold(&max_step, &[f64::NAN, 1.0]), Some(1.0));
        assert!(fold(&max_step, &[f64::NAN, f64::NAN]).unwrap().is_nan());
    }

    #[test]
    fn test_min_max_across_partitions() {
        let ctx = QueryContext::new().with_degree_of_parallelism(4);
        let data = vec![4.0, 8.5, -2.0, f64::NAN, 7.0, 0.5];
        assert!(from_vec(data.clone()).min(&ctx).unwrap().is_nan());
        assert!((from_vec(data).max(&ctx).unwrap() - 8.5).abs() < f64::EPSILON);
        assert_eq!(range(-5, 20).min(&ctx).unwrap(), -5);
    }

    #[test]
    fn test_fold_counts_seed_once() {
        let ctx = QueryContext::new().with_degree_of_parallelism(4);
        let total = range(1, 10).aggregate(100i64, |acc, x| acc + x, |a, b| a + b - 100, &ctx);
        assert_eq!(total.unwrap(), 155);
        let empty = range(0, 0).aggregate(7i64, |acc, x| acc + x, |a, b| a + b, &ctx);
        assert_eq!(empty.unwrap(), 7);
    }

    #[test]
    fn test_seeded_fold_independent_of_partition_count() {
        for dop in 1..=8 {
            let ctx = QueryContext::new().with_degree_of_parallelism(dop);
            let empty = range(0, 0).aggregate(7i64, |acc, x| acc + x, |a, b| a + b, &ctx);
            assert_eq!(empty.unwrap(), 7, "dop {dop}");
            // Fewer elements than partitions leaves some partitions empty.
            let sparse = range(1, 3).aggregate(0i64, |acc, x| acc + x, |a, b| a + b, &ctx);
            assert_eq!(sparse.unwrap(), 6, "dop {dop}");
        }
    }

    #[test]
    fn test_any_all_contains() {
        let ctx = QueryContext::new().with_degree_of_parallelism(4);
        assert!(range(0, 10_000).any(|x| *x == 9_999, &ctx).unwrap());
        assert!(!range(0, 10_000).any(|x| *x < 0, &ctx).unwrap());
        assert!(range(0, 100).all(|x| *x >= 0, &ctx).unwrap());
        assert!(!range(0, 100).all(|x| *x < 50, &ctx).unwrap());
        assert!(range(0, 0).all(|_| false, &ctx).unwrap());
        assert!(range(0, 100).contains(42, &ctx).unwrap());
        assert!(!range(0, 100).contains(420, &ctx).unwrap());
    }
}
