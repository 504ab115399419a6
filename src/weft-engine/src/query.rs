//! Query execution entry points.
//!
//! [`get_opened_enumerator`] opens a query and returns a pull iterator over
//! its merged output; [`execute_and_get_results_as_vec`] runs a query to
//! completion. [`QueryExt`] layers the combinator and terminal API on top of
//! every [`QueryOperator`].
//!
//! Each execution gets fresh [`QuerySettings`], its own task group and a
//! `query_begin`/`query_end` pair on the context's event sink.

use std::hash::Hash;
use std::sync::Arc;

use common_config::ExecutionMode;
use common_error::{QueryError, QueryResult};
use common_runtime::QueryTaskGroupState;
use log::{debug, trace};
use weft_core::{KeyComparer, OrderKey, default_equality_comparer};

use crate::events::QueryEventSink;
use crate::merging::{MergedOutput, materialize_indexed, merge, merge_to_vec, spool_for_all};
use crate::operators::{
    AggregateOperator, AnyOperator, Average, BinaryQueryOperator, Comparable, ConcatOperator,
    Count, DefaultIfEmptyOperator, DistinctOperator, ElementAtOperator, FirstOrLastOperator, Fold,
    GroupByOperator, GroupJoinOperator, JoinOperator, Max, Min, OrderByOperator,
    OrderingOperator, PartialAggregate, QueryOperator, Reduce, ReverseOperator, SelectOperator,
    SetOperator, Sum, Summable, TakeOrSkipOperator, TakeOrSkipWhileOperator, UnaryQueryOperator,
    WhereOperator, ZipOperator,
};
use crate::settings::{QueryContext, QuerySettings};
use crate::stream::{PartitionedStream, PartitionedStreamRecipient, QueryResults};

// ============================================================================
// Execution
// ============================================================================

/// Reports `query_begin` on creation and `query_end` on drop.
struct QueryScope {
    events: Arc<dyn QueryEventSink>,
    query_id: u64,
}

impl QueryScope {
    fn begin(settings: &QuerySettings) -> Self {
        let events = settings.event_sink();
        events.query_begin(settings.query_id());
        Self {
            events,
            query_id: settings.query_id(),
        }
    }
}

impl Drop for QueryScope {
    fn drop(&mut self) {
        self.events.query_end(self.query_id);
    }
}

/// Create settings for one execution of `query`, falling back to a single
/// partition when the tree limits parallelism and the mode allows it.
fn prepare_settings<C: QueryOperator>(query: &C, ctx: &QueryContext) -> QueryResult<QuerySettings> {
    let settings = ctx.create_settings()?;
    if settings.execution_mode() == ExecutionMode::Default
        && settings.degree_of_parallelism() > 1
        && query.limits_parallelism()
    {
        debug!(
            "query {}: operator tree limits parallelism, running on one partition",
            settings.query_id()
        );
        return Ok(settings.with_degree_of_parallelism(1));
    }
    Ok(settings)
}

fn log_open<C: QueryOperator>(query: &C, settings: &QuerySettings) {
    debug!(
        "query {}: opening with {} partitions (ordered={}, merge={:?})",
        settings.query_id(),
        settings.degree_of_parallelism(),
        query.output_ordered(),
        settings.merge_options()
    );
    trace!("query {} plan:\n{}", settings.query_id(), query.explain());
}

fn new_group(settings: &QuerySettings) -> Arc<QueryTaskGroupState> {
    Arc::new(QueryTaskGroupState::new(
        settings.cancellation().clone(),
        settings.query_id(),
    ))
}

/// Pull iterator over a running query's merged output.
///
/// Yields `Err` at most once, then ends. Dropping it before the end cancels
/// the remaining work and joins every partition task.
pub struct QueryEnumerator<T> {
    output: MergedOutput<T>,
    group: Arc<QueryTaskGroupState>,
    finished: bool,
    _scope: QueryScope,
}

impl<T> std::fmt::Debug for QueryEnumerator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryEnumerator")
            .field("query_id", &self.group.query_id())
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl<T: Send> QueryEnumerator<T> {
    /// The error to surface once the consumer failed with `err`.
    fn resolve_failure(&self, err: QueryError) -> QueryError {
        self.group.cancellation().cancel_internal();
        match self.group.query_end(false) {
            Err(fault @ QueryError::Aggregate(_)) => fault,
            Err(outcome) if err.is_canceled() => outcome,
            _ => err,
        }
    }
}

impl<T: Send> Iterator for QueryEnumerator<T> {
    type Item = QueryResult<T>;

    fn next(&mut self) -> Option<QueryResult<T>> {
        if self.finished {
            return None;
        }
        match self.output.move_next() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.finished = true;
                self.group.query_end(false).err().map(Err)
            }
            Err(err) => {
                self.finished = true;
                Some(Err(self.resolve_failure(err)))
            }
        }
    }
}

impl<T> Drop for QueryEnumerator<T> {
    fn drop(&mut self) {
        // Disposal after a fault or a completed run is not a new error.
        let _ = self.group.query_end(true);
    }
}

struct MergeRecipient<'a> {
    ordered: bool,
    settings: &'a QuerySettings,
    group: &'a Arc<QueryTaskGroupState>,
}

impl<T: Send + 'static> PartitionedStreamRecipient<T> for MergeRecipient<'_> {
    type Output = MergedOutput<T>;

    fn receive<K: OrderKey>(self, stream: PartitionedStream<T, K>) -> QueryResult<MergedOutput<T>> {
        merge(stream, self.ordered, self.settings, self.group)
    }
}

struct ToVecRecipient<'a> {
    ordered: bool,
    settings: &'a QuerySettings,
    group: &'a Arc<QueryTaskGroupState>,
}

impl<T: Send + 'static> PartitionedStreamRecipient<T> for ToVecRecipient<'_> {
    type Output = Vec<T>;

    fn receive<K: OrderKey>(self, stream: PartitionedStream<T, K>) -> QueryResult<Vec<T>> {
        merge_to_vec(stream, self.ordered, self.settings, self.group)
    }
}

struct ForAllRecipient<'a, F> {
    action: Arc<F>,
    settings: &'a QuerySettings,
    group: &'a Arc<QueryTaskGroupState>,
}

impl<T, F> PartitionedStreamRecipient<T> for ForAllRecipient<'_, F>
where
    T: Send + 'static,
    F: Fn(T) + Send + Sync + 'static,
{
    type Output = ();

    fn receive<K: OrderKey>(self, stream: PartitionedStream<T, K>) -> QueryResult<()> {
        spool_for_all(stream, self.action, self.settings, self.group)
    }
}

/// Open `query` and start streaming its output.
pub fn get_opened_enumerator<C: QueryOperator>(
    query: &C,
    ctx: &QueryContext,
) -> QueryResult<QueryEnumerator<C::Output>> {
    let settings = prepare_settings(query, ctx)?;
    let scope = QueryScope::begin(&settings);
    log_open(query, &settings);
    let group = new_group(&settings);
    let opened = query.open(&settings, false).and_then(|results| {
        results.give_partitioned_stream(MergeRecipient {
            ordered: query.output_ordered(),
            settings: &settings,
            group: &group,
        })
    });
    match opened {
        Ok(output) => Ok(QueryEnumerator {
            output,
            group,
            finished: false,
            _scope: scope,
        }),
        Err(err) => {
            let _ = group.query_end(true);
            Err(err)
        }
    }
}

/// Run `query` to completion and collect its output.
pub fn execute_and_get_results_as_vec<C: QueryOperator>(
    query: &C,
    ctx: &QueryContext,
) -> QueryResult<Vec<C::Output>> {
    let settings = prepare_settings(query, ctx)?;
    let _scope = QueryScope::begin(&settings);
    log_open(query, &settings);
    let group = new_group(&settings);
    let ordered = query.output_ordered();
    let results = query.open(&settings, false)?;
    if ordered {
        if let Some(indexed) = results.indexed() {
            return materialize_indexed(&indexed, &settings, &group);
        }
    }
    results.give_partitioned_stream(ToVecRecipient {
        ordered,
        settings: &settings,
        group: &group,
    })
}

/// Run `query` for effect, calling `action` on every element from the
/// partition threads.
pub fn for_all<C, F>(query: &C, action: F, ctx: &QueryContext) -> QueryResult<()>
where
    C: QueryOperator,
    F: Fn(C::Output) + Send + Sync + 'static,
{
    let settings = prepare_settings(query, ctx)?;
    let _scope = QueryScope::begin(&settings);
    log_open(query, &settings);
    let group = new_group(&settings);
    query
        .open(&settings, false)?
        .give_partitioned_stream(ForAllRecipient {
            action: Arc::new(action),
            settings: &settings,
            group: &group,
        })
}

/// Run a [`PartialAggregate`] over `query`.
pub fn aggregate_with<C, A>(query: &C, aggregate: A, ctx: &QueryContext) -> QueryResult<A::Output>
where
    C: QueryOperator,
    A: PartialAggregate<Input = C::Output>,
{
    let aggregate = Arc::new(aggregate);
    let partial = UnaryQueryOperator::new(query, AggregateOperator::new(Arc::clone(&aggregate)));
    let partials = execute_and_get_results_as_vec(&partial, ctx)?;
    aggregate.complete(partials)
}

fn any_with<C, F>(query: &C, predicate: F, ctx: &QueryContext) -> QueryResult<bool>
where
    C: QueryOperator,
    F: Fn(&C::Output) -> bool + Send + Sync + 'static,
{
    let any = UnaryQueryOperator::new(query, AnyOperator::new(predicate));
    Ok(execute_and_get_results_as_vec(&any, ctx)?.into_iter().any(|found| found))
}

// ============================================================================
// Combinators and terminals
// ============================================================================

/// Query-building and terminal methods for every operator tree.
///
/// Combinators consume the tree and wrap it in a new node; terminals borrow
/// it, so one tree can be executed any number of times.
pub trait QueryExt: QueryOperator + Sized {
    /// Project every element.
    fn select<U, F>(self, selector: F) -> UnaryQueryOperator<Self, SelectOperator<Self::Output, U, F>>
    where
        U: Send + 'static,
        F: Fn(Self::Output) -> U + Send + Sync + 'static,
    {
        UnaryQueryOperator::new(self, SelectOperator::new(selector))
    }

    /// Keep elements satisfying `predicate`.
    fn filter<F>(self, predicate: F) -> UnaryQueryOperator<Self, WhereOperator<Self::Output, F>>
    where
        F: Fn(&Self::Output) -> bool + Send + Sync + 'static,
    {
        UnaryQueryOperator::new(self, WhereOperator::new(predicate))
    }

    /// Keep the first `count` elements.
    fn take(self, count: usize) -> UnaryQueryOperator<Self, TakeOrSkipOperator<Self::Output>> {
        UnaryQueryOperator::new(self, TakeOrSkipOperator::take(count))
    }

    /// Drop the first `count` elements.
    fn skip(self, count: usize) -> UnaryQueryOperator<Self, TakeOrSkipOperator<Self::Output>> {
        UnaryQueryOperator::new(self, TakeOrSkipOperator::skip(count))
    }

    /// Keep the leading elements satisfying `predicate`.
    fn take_while<F>(
        self,
        predicate: F,
    ) -> UnaryQueryOperator<Self, TakeOrSkipWhileOperator<Self::Output, F>>
    where
        F: Fn(&Self::Output) -> bool + Send + Sync + 'static,
    {
        UnaryQueryOperator::new(self, TakeOrSkipWhileOperator::take_while(predicate))
    }

    /// Drop the leading elements satisfying `predicate`.
    fn skip_while<F>(
        self,
        predicate: F,
    ) -> UnaryQueryOperator<Self, TakeOrSkipWhileOperator<Self::Output, F>>
    where
        F: Fn(&Self::Output) -> bool + Send + Sync + 'static,
    {
        UnaryQueryOperator::new(self, TakeOrSkipWhileOperator::skip_while(predicate))
    }

    /// Yield `default` when the query is empty.
    fn default_if_empty(
        self,
        default: Self::Output,
    ) -> UnaryQueryOperator<Self, DefaultIfEmptyOperator<Self::Output>>
    where
        Self::Output: Clone + Sync,
    {
        UnaryQueryOperator::new(self, DefaultIfEmptyOperator::new(default))
    }

    /// Remove duplicates.
    fn distinct(self) -> UnaryQueryOperator<Self, DistinctOperator<Self::Output>>
    where
        Self::Output: Hash + Eq,
    {
        UnaryQueryOperator::new(self, DistinctOperator::new(default_equality_comparer()))
    }

    /// Distinct elements of both queries.
    fn union<Q>(self, other: Q) -> BinaryQueryOperator<Self, Q, SetOperator<Self::Output>>
    where
        Q: QueryOperator<Output = Self::Output>,
        Self::Output: Hash + Eq,
    {
        BinaryQueryOperator::new(self, other, SetOperator::union(default_equality_comparer()))
    }

    /// Distinct elements also present in `other`.
    fn intersect<Q>(self, other: Q) -> BinaryQueryOperator<Self, Q, SetOperator<Self::Output>>
    where
        Q: QueryOperator<Output = Self::Output>,
        Self::Output: Hash + Eq,
    {
        BinaryQueryOperator::new(self, other, SetOperator::intersect(default_equality_comparer()))
    }

    /// Distinct elements absent from `other`.
    fn except<Q>(self, other: Q) -> BinaryQueryOperator<Self, Q, SetOperator<Self::Output>>
    where
        Q: QueryOperator<Output = Self::Output>,
        Self::Output: Hash + Eq,
    {
        BinaryQueryOperator::new(self, other, SetOperator::except(default_equality_comparer()))
    }

    /// Group elements by a projected key.
    fn group_by<GK, F>(self, key_selector: F) -> UnaryQueryOperator<Self, GroupByOperator<Self::Output, GK, F>>
    where
        GK: Hash + Eq + Send + Sync + 'static,
        F: Fn(&Self::Output) -> GK + Send + Sync + 'static,
    {
        UnaryQueryOperator::new(
            self,
            GroupByOperator::new(key_selector, default_equality_comparer()),
        )
    }

    /// Inner equi-join with `other`.
    fn join<Q, JK, O, FL, FR, FO>(
        self,
        other: Q,
        left_key: FL,
        right_key: FR,
        result: FO,
    ) -> BinaryQueryOperator<Self, Q, JoinOperator<Self::Output, Q::Output, JK, O>>
    where
        Q: QueryOperator,
        JK: Hash + Eq + Send + Sync + 'static,
        O: Send + 'static,
        FL: Fn(&Self::Output) -> JK + Send + Sync + 'static,
        FR: Fn(&Q::Output) -> JK + Send + Sync + 'static,
        FO: Fn(&Self::Output, &Q::Output) -> O + Send + Sync + 'static,
    {
        let logic = JoinOperator::new(left_key, right_key, result, default_equality_comparer());
        BinaryQueryOperator::new(self, other, logic)
    }

    /// Pair every element with all matching elements of `other`.
    fn group_join<Q, JK, O, FL, FR, FO>(
        self,
        other: Q,
        left_key: FL,
        right_key: FR,
        result: FO,
    ) -> BinaryQueryOperator<Self, Q, GroupJoinOperator<Self::Output, Q::Output, JK, O>>
    where
        Q: QueryOperator,
        JK: Hash + Eq + Send + Sync + 'static,
        O: Send + 'static,
        FL: Fn(&Self::Output) -> JK + Send + Sync + 'static,
        FR: Fn(&Q::Output) -> JK + Send + Sync + 'static,
        FO: Fn(&Self::Output, &[Q::Output]) -> O + Send + Sync + 'static,
    {
        let logic = GroupJoinOperator::new(left_key, right_key, result, default_equality_comparer());
        BinaryQueryOperator::new(self, other, logic)
    }

    /// Sort ascending by a projected key.
    fn order_by<SK, F>(self, selector: F) -> UnaryQueryOperator<Self, OrderByOperator<Self::Output, SK>>
    where
        SK: OrderKey + Ord,
        F: Fn(&Self::Output) -> SK + Send + Sync + 'static,
    {
        UnaryQueryOperator::new(self, OrderByOperator::new(selector, KeyComparer::natural()))
    }

    /// Sort descending by a projected key.
    fn order_by_descending<SK, F>(
        self,
        selector: F,
    ) -> UnaryQueryOperator<Self, OrderByOperator<Self::Output, SK>>
    where
        SK: OrderKey + Ord,
        F: Fn(&Self::Output) -> SK + Send + Sync + 'static,
    {
        UnaryQueryOperator::new(
            self,
            OrderByOperator::descending(selector, &KeyComparer::natural()),
        )
    }

    /// Reverse the output order.
    fn reverse(self) -> UnaryQueryOperator<Self, ReverseOperator<Self::Output>> {
        UnaryQueryOperator::new(self, ReverseOperator::new())
    }

    /// Combine elements pairwise by position.
    fn zip<Q, O, F>(self, other: Q, result: F) -> BinaryQueryOperator<Self, Q, ZipOperator<Self::Output, Q::Output, O>>
    where
        Q: QueryOperator,
        O: Send + 'static,
        F: Fn(Self::Output, Q::Output) -> O + Send + Sync + 'static,
    {
        BinaryQueryOperator::new(self, other, ZipOperator::new(result))
    }

    /// Every element of this query, then every element of `other`.
    fn concat<Q>(self, other: Q) -> BinaryQueryOperator<Self, Q, ConcatOperator<Self::Output>>
    where
        Q: QueryOperator<Output = Self::Output>,
    {
        BinaryQueryOperator::new(self, other, ConcatOperator::new())
    }

    /// Preserve source order from here on.
    fn as_ordered(self) -> UnaryQueryOperator<Self, OrderingOperator<Self::Output>> {
        UnaryQueryOperator::new(self, OrderingOperator::as_ordered())
    }

    /// Stop preserving order from here on.
    fn as_unordered(self) -> UnaryQueryOperator<Self, OrderingOperator<Self::Output>> {
        UnaryQueryOperator::new(self, OrderingOperator::as_unordered())
    }

    /// Run the query and collect its output.
    fn to_vec(&self, ctx: &QueryContext) -> QueryResult<Vec<Self::Output>> {
        execute_and_get_results_as_vec(self, ctx)
    }

    /// Run the query, streaming its output.
    fn enumerate(&self, ctx: &QueryContext) -> QueryResult<QueryEnumerator<Self::Output>> {
        get_opened_enumerator(self, ctx)
    }

    /// First element. Empty input is an `InvalidOperation`.
    fn first(&self, ctx: &QueryContext) -> QueryResult<Self::Output> {
        let query = UnaryQueryOperator::new(self, FirstOrLastOperator::first());
        execute_and_get_results_as_vec(&query, ctx)?
            .into_iter()
            .next()
            .ok_or_else(QueryError::no_elements)
    }

    /// Last element. Empty input is an `InvalidOperation`.
    fn last(&self, ctx: &QueryContext) -> QueryResult<Self::Output> {
        let query = UnaryQueryOperator::new(self, FirstOrLastOperator::last());
        execute_and_get_results_as_vec(&query, ctx)?
            .into_iter()
            .next()
            .ok_or_else(QueryError::no_elements)
    }

    /// Element at `index`. An index past the end is an `InvalidParameter`.
    fn element_at(&self, index: usize, ctx: &QueryContext) -> QueryResult<Self::Output> {
        let query = UnaryQueryOperator::new(self, ElementAtOperator::new(index));
        execute_and_get_results_as_vec(&query, ctx)?
            .into_iter()
            .next()
            .ok_or_else(|| QueryError::invalid_parameter(format!("index {index} is out of range")))
    }

    /// Number of elements.
    fn count(&self, ctx: &QueryContext) -> QueryResult<usize> {
        aggregate_with(self, Count::default(), ctx)
    }

    /// Sum of the elements.
    fn sum(&self, ctx: &QueryContext) -> QueryResult<Self::Output>
    where
        Self::Output: Summable,
    {
        aggregate_with(self, Sum::default(), ctx)
    }

    /// Smallest element.
    fn min(&self, ctx: &QueryContext) -> QueryResult<Self::Output>
    where
        Self::Output: Comparable,
    {
        aggregate_with(self, Min::default(), ctx)
    }

    /// Largest element.
    fn max(&self, ctx: &QueryContext) -> QueryResult<Self::Output>
    where
        Self::Output: Comparable,
    {
        aggregate_with(self, Max::default(), ctx)
    }

    /// Arithmetic mean.
    fn average(&self, ctx: &QueryContext) -> QueryResult<f64>
    where
        Self::Output: Summable,
    {
        aggregate_with(self, Average::default(), ctx)
    }

    /// Fold with a seed; `combine` merges partition results.
    fn aggregate<Acc, F, G>(&self, seed: Acc, fold: F, combine: G, ctx: &QueryContext) -> QueryResult<Acc>
    where
        Acc: Clone + Send + Sync + 'static,
        F: Fn(Acc, Self::Output) -> Acc + Send + Sync + 'static,
        G: Fn(Acc, Acc) -> Acc + Send + Sync + 'static,
    {
        aggregate_with(self, Fold::new(seed, fold, combine), ctx)
    }

    /// Fold without a seed using an associative `reduce`.
    fn reduce<F>(&self, reduce: F, ctx: &QueryContext) -> QueryResult<Self::Output>
    where
        F: Fn(Self::Output, Self::Output) -> Self::Output + Send + Sync + 'static,
    {
        aggregate_with(self, Reduce::new(reduce), ctx)
    }

    /// Whether any element satisfies `predicate`.
    fn any<F>(&self, predicate: F, ctx: &QueryContext) -> QueryResult<bool>
    where
        F: Fn(&Self::Output) -> bool + Send + Sync + 'static,
    {
        any_with(self, predicate, ctx)
    }

    /// Whether every element satisfies `predicate`.
    fn all<F>(&self, predicate: F, ctx: &QueryContext) -> QueryResult<bool>
    where
        F: Fn(&Self::Output) -> bool + Send + Sync + 'static,
    {
        Ok(!any_with(self, move |item: &Self::Output| !predicate(item), ctx)?)
    }

    /// Whether some element equals `value`.
    fn contains(&self, value: Self::Output, ctx: &QueryContext) -> QueryResult<bool>
    where
        Self::Output: PartialEq + Sync,
    {
        any_with(self, move |item: &Self::Output| *item == value, ctx)
    }

    /// Call `action` on every element from the partition threads.
    fn for_all<F>(&self, action: F, ctx: &QueryContext) -> QueryResult<()>
    where
        F: Fn(Self::Output) + Send + Sync + 'static,
    {
        for_all(self, action, ctx)
    }
}

impl<C: QueryOperator> QueryExt for C {}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use common_config::MergeOptions;
    use common_runtime::CancellationHandle;

    use super::*;
    use crate::events::RecordingEventSink;
    use crate::source::range;

    #[test]
    fn test_enumerator_streams_in_order() {
        for merge_options in [MergeOptions::NotBuffered, MergeOptions::AutoBuffered, MergeOptions::FullyBuffered] {
            let ctx = QueryContext::new()
                .with_degree_of_parallelism(4)
                .with_merge_options(merge_options);
            let query = range(0, 1000).as_ordered().filter(|x| x % 3 == 0);
            let items: Vec<i64> = query.enumerate(&ctx).unwrap().map(Result::unwrap).collect();
            assert_eq!(items, (0..1000).filter(|x| x % 3 == 0).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_early_drop_balances_events() {
        let sink = Arc::new(RecordingEventSink::new());
        let ctx = QueryContext::new()
            .with_degree_of_parallelism(4)
            .with_event_sink(sink.clone());
        {
            let mut items = range(0, 1_000_000).select(|x| x * 2).enumerate(&ctx).unwrap();
            assert!(items.next().unwrap().is_ok());
        }
        let ids = sink.query_ids();
        assert_eq!(ids.len(), 1);
        let counts = sink.get(ids[0]).unwrap();
        assert_eq!(counts.begun, 1);
        assert!(counts.is_balanced());
    }

    #[test]
    fn test_limits_parallelism_falls_back_to_one_partition() {
        let sink = Arc::new(RecordingEventSink::new());
        let ctx = QueryContext::new()
            .with_degree_of_parallelism(4)
            .with_event_sink(sink.clone());
        let query = range(0, 100).order_by(|x| -x).take(3);
        assert!(query.limits_parallelism());
        assert_eq!(query.to_vec(&ctx).unwrap(), vec![99, 98, 97]);
        let sequential = sink.total_partitions_begun();

        sink.clear();
        let forced = ctx.clone().with_execution_mode(ExecutionMode::ForceParallelism);
        assert_eq!(query.to_vec(&forced).unwrap(), vec![99, 98, 97]);
        assert!(sink.total_partitions_begun() > sequential);
    }

    #[test]
    fn test_external_cancellation() {
        let handle = CancellationHandle::new();
        handle.cancel();
        let ctx = QueryContext::new()
            .with_degree_of_parallelism(3)
            .with_cancellation(handle.token());
        let err = range(0, 10_000).select(|x| x + 1).to_vec(&ctx).unwrap_err();
        assert!(err.is_external_cancel());
    }

    #[test]
    fn test_for_all_visits_everything() {
        let ctx = QueryContext::new().with_degree_of_parallelism(4);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        range(0, 5000)
            .filter(|x| x % 5 == 0)
            .for_all(move |_| { counter.fetch_add(1, Ordering::Relaxed); }, &ctx)
            .unwrap();
        assert_eq!(seen.load(Ordering::Relaxed), 1000);
    }
}
