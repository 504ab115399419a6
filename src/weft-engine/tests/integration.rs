//! Integration tests for the weft-engine crate.
//!
//! These tests run whole queries through the public API:
//! - Source partitioning
//! - Operator trees
//! - Merging and terminal operations
//! - Fault and cancellation reporting
//!
//! ## Test Categories
//!
//! 1. **End-to-end Scenarios**: Small pipelines with exact expected output
//! 2. **Faults and Cancellation**: Errors surfaced to the caller
//! 3. **Aggregates**: Numeric edge cases
//! 4. **Events**: Begin/end balance

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use common_config::{ExecutionMode, MergeOptions};
use common_error::{CancelSource, QueryError};
use common_runtime::CancellationHandle;

use weft_engine::{QueryContext, QueryExt, RecordingEventSink, from_iter, from_vec, range};

fn ctx(dop: usize) -> QueryContext {
    let _ = env_logger::builder().is_test(true).try_init();
    QueryContext::new().with_degree_of_parallelism(dop)
}

// =============================================================================
// End-to-end Scenarios
// =============================================================================

#[test]
fn test_ordered_where_select_fully_buffered() {
    let ctx = ctx(4).with_merge_options(MergeOptions::FullyBuffered);
    let result = range(1, 1000)
        .as_ordered()
        .filter(|x| x % 3 == 0)
        .select(|x| x * 2)
        .to_vec(&ctx)
        .unwrap();

    let expected: Vec<i64> = (1..=1000).filter(|x| x % 3 == 0).map(|x| x * 2).collect();
    assert_eq!(result.first(), Some(&6));
    assert_eq!(result.last(), Some(&1998));
    assert_eq!(result, expected);
}

#[test]
fn test_ordered_where_select_all_merge_options() {
    for merge_options in [
        MergeOptions::NotBuffered,
        MergeOptions::AutoBuffered,
        MergeOptions::FullyBuffered,
    ] {
        let ctx = ctx(4).with_merge_options(merge_options);
        let query = from_vec((1..=1000).collect::<Vec<i64>>())
            .as_ordered()
            .filter(|x| x % 3 == 0)
            .select(|x| x * 2);
        let streamed: Vec<i64> = query.enumerate(&ctx).unwrap().map(Result::unwrap).collect();
        assert_eq!(streamed, query.to_vec(&ctx).unwrap(), "{merge_options:?}");
    }
}

#[test]
fn test_intersect_independent_of_partition_count() {
    for dop in 1..=6 {
        let ctx = ctx(dop);
        let mut result = from_vec(vec![1, 2, 2, 3])
            .intersect(from_vec(vec![2, 3, 4]))
            .to_vec(&ctx)
            .unwrap();
        result.sort_unstable();
        assert_eq!(result, vec![2, 3], "dop {dop}");
    }
}

#[test]
fn test_group_by_mod_seven() {
    let ctx = ctx(8);
    let groups = range(1, 100).group_by(|x| x % 7).to_vec(&ctx).unwrap();

    assert_eq!(groups.len(), 7);
    let keys: HashSet<i64> = groups.iter().map(|g| g.key).collect();
    assert_eq!(keys, (0..7).collect());
    assert_eq!(groups.iter().map(|g| g.len()).sum::<usize>(), 100);

    let mut members: Vec<i64> = groups
        .iter()
        .flat_map(|g| {
            assert!(g.elements.iter().all(|x| x % 7 == g.key));
            g.elements.iter().copied()
        })
        .collect();
    members.sort_unstable();
    assert_eq!(members, (1..=100).collect::<Vec<_>>());
}

#[test]
fn test_take_five_of_ordered_stream() {
    for dop in [1, 2, 8] {
        let ctx = ctx(dop);
        let from_range = range(0, 10_000).as_ordered().take(5).to_vec(&ctx).unwrap();
        assert_eq!(from_range, vec![0, 1, 2, 3, 4], "dop {dop}");

        // Chunked iterator input only offers Correct keys.
        let from_chunks = from_iter(0..10_000)
            .as_ordered()
            .take(5)
            .to_vec(&ctx)
            .unwrap();
        assert_eq!(from_chunks, vec![0, 1, 2, 3, 4], "dop {dop}");
    }
}

#[test]
fn test_order_by_then_by() {
    let ctx = ctx(4);
    let words = vec!["pear", "fig", "apple", "kiwi", "banana", "plum", "date"];
    let sorted = from_vec(words)
        .order_by(|w: &&str| w.len())
        .then_by_descending(|w: &&str| *w)
        .to_vec(&ctx)
        .unwrap();
    assert_eq!(
        sorted,
        vec!["fig", "plum", "pear", "kiwi", "date", "apple", "banana"]
    );
}

#[test]
fn test_join_matches_every_pair() {
    let ctx = ctx(3);
    let people = vec![(1, "ada"), (2, "bo"), (3, "cy")];
    let pets = vec![(1, "cat"), (1, "owl"), (3, "dog"), (4, "eel")];
    let mut pairs = from_vec(people)
        .join(
            from_vec(pets),
            |p: &(i32, &str)| p.0,
            |q: &(i32, &str)| q.0,
            |p, q| format!("{}:{}", p.1, q.1),
        )
        .to_vec(&ctx)
        .unwrap();
    pairs.sort();
    assert_eq!(pairs, vec!["ada:cat", "ada:owl", "cy:dog"]);
}

#[test]
fn test_skip_reverse_concat() {
    let ctx = ctx(4);
    let result = range(0, 10)
        .as_ordered()
        .skip(7)
        .reverse()
        .concat(range(100, 2))
        .to_vec(&ctx)
        .unwrap();
    assert_eq!(result, vec![9, 8, 7, 100, 101]);
}

#[test]
fn test_element_terminals() {
    let ctx = ctx(4);
    let query = range(10, 50).as_ordered();
    assert_eq!(query.first(&ctx).unwrap(), 10);
    assert_eq!(query.last(&ctx).unwrap(), 59);
    assert_eq!(query.element_at(17, &ctx).unwrap(), 27);
    assert!(matches!(
        query.element_at(50, &ctx),
        Err(QueryError::InvalidParameter(_))
    ));
    assert!(matches!(
        from_vec(Vec::<i32>::new()).first(&ctx),
        Err(QueryError::InvalidOperation(_))
    ));
}

// =============================================================================
// Faults and Cancellation
// =============================================================================

#[test]
fn test_throwing_selector_surfaces_single_fault() {
    let ctx = ctx(4);
    let err = range(0, 100_000)
        .select(|x| {
            assert!(x != 4242, "bad element {x}");
            x
        })
        .to_vec(&ctx)
        .unwrap_err();

    let QueryError::Aggregate(inner) = &err else {
        panic!("expected an aggregate, got {err:?}");
    };
    assert_eq!(inner.len(), 1);
    assert!(matches!(&inner[0], QueryError::Faulted(msg) if msg.contains("bad element 4242")));
}

#[test]
fn test_throwing_selector_while_streaming() {
    let ctx = ctx(4).with_merge_options(MergeOptions::NotBuffered);
    let results: Vec<_> = range(0, 10_000)
        .as_ordered()
        .select(|x| {
            assert!(x != 9000, "bad element");
            x
        })
        .enumerate(&ctx)
        .unwrap()
        .collect();

    let last = results.last().unwrap();
    assert!(matches!(last, Err(QueryError::Aggregate(_))));
    assert!(results[..results.len() - 1].iter().all(Result::is_ok));
}

#[test]
fn test_cancellation_latency_is_bounded() {
    let dop = 4;
    let handle = CancellationHandle::new();
    let ctx = ctx(dop).with_cancellation(handle.token());

    let signalled = Arc::new(AtomicBool::new(false));
    let after_signal = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(AtomicUsize::new(0));

    let (flag, late, count, trigger) = (
        Arc::clone(&signalled),
        Arc::clone(&after_signal),
        Arc::clone(&seen),
        handle.clone(),
    );
    let err = from_iter(0u64..)
        .for_all(
            move |_| {
                if flag.load(Ordering::Acquire) {
                    late.fetch_add(1, Ordering::Relaxed);
                } else if count.fetch_add(1, Ordering::Relaxed) == 10_000 {
                    flag.store(true, Ordering::Release);
                    trigger.cancel();
                }
            },
            &ctx,
        )
        .unwrap_err();

    assert!(matches!(err, QueryError::Canceled(CancelSource::External)));
    assert!(after_signal.load(Ordering::Relaxed) <= 64 * dop);
}

#[test]
fn test_cancelled_before_start() {
    let handle = CancellationHandle::new();
    handle.cancel();
    let ctx = ctx(2).with_cancellation(handle.token());
    let err = range(0, 1000).count(&ctx).unwrap_err();
    assert!(err.is_external_cancel());
}

#[test]
fn test_iterator_source_runs_once() {
    let ctx = ctx(2);
    let query = from_iter(vec![1, 2, 3]);
    assert_eq!(query.count(&ctx).unwrap(), 3);
    assert!(matches!(
        query.count(&ctx),
        Err(QueryError::InvalidOperation(_))
    ));
}

// =============================================================================
// Aggregates
// =============================================================================

#[test]
fn test_numeric_aggregates() {
    let ctx = ctx(4);
    let query = range(1, 100);
    assert_eq!(query.count(&ctx).unwrap(), 100);
    assert_eq!(query.sum(&ctx).unwrap(), 5050);
    assert_eq!(query.min(&ctx).unwrap(), 1);
    assert_eq!(query.max(&ctx).unwrap(), 100);
    assert!((query.average(&ctx).unwrap() - 50.5).abs() < f64::EPSILON);
    assert_eq!(query.aggregate(0, |a, x| a + x, |a, b| a + b, &ctx).unwrap(), 5050);
    assert!(query.any(|x| *x == 77, &ctx).unwrap());
    assert!(query.all(|x| *x > 0, &ctx).unwrap());
    assert!(!query.contains(101, &ctx).unwrap());
}

#[test]
fn test_sum_overflow_is_invalid_operation() {
    let ctx = ctx(4);
    let err = from_vec(vec![i32::MAX, 1]).sum(&ctx).unwrap_err();
    assert!(matches!(err, QueryError::InvalidOperation(_)));
}

#[test]
fn test_empty_aggregates() {
    let ctx = ctx(3);
    let empty = from_vec(Vec::<f64>::new());
    assert_eq!(empty.count(&ctx).unwrap(), 0);
    assert!(empty.sum(&ctx).unwrap().abs() < f64::EPSILON);
    assert!(matches!(empty.average(&ctx), Err(QueryError::InvalidOperation(_))));
    assert!(matches!(empty.min(&ctx), Err(QueryError::InvalidOperation(_))));
}

#[test]
fn test_float_min_max_nan() {
    let ctx = ctx(4);
    let with_nan = from_vec(vec![3.0, f64::NAN, -1.0, 8.0]);
    assert!(with_nan.min(&ctx).unwrap().is_nan());
    assert!((with_nan.max(&ctx).unwrap() - 8.0).abs() < f64::EPSILON);

    let all_nan = from_vec(vec![f64::NAN, f64::NAN]);
    assert!(all_nan.max(&ctx).unwrap().is_nan());
}

// =============================================================================
// Events
// =============================================================================

#[test]
fn test_events_balanced_across_terminals() {
    let sink = Arc::new(RecordingEventSink::new());
    let ctx = ctx(4).with_event_sink(sink.clone());

    range(0, 500).select(|x| x + 1).to_vec(&ctx).unwrap();
    range(0, 500).as_ordered().take(3).to_vec(&ctx).unwrap();
    let _ = range(0, 500)
        .select(|x| {
            assert!(x != 250, "boom");
            x
        })
        .count(&ctx);

    let ids = sink.query_ids();
    assert_eq!(ids.len(), 3);
    for id in ids {
        let counts = sink.get(id).unwrap();
        assert_eq!(counts.begun, 1);
        assert!(counts.is_balanced(), "{}", sink.format_summary());
    }
}

#[test]
fn test_forced_parallelism_keeps_results() {
    let ctx = ctx(4);
    let forced = ctx.clone().with_execution_mode(ExecutionMode::ForceParallelism);
    let query = range(0, 300).order_by(|x| x % 10).take(10);
    assert_eq!(query.to_vec(&ctx).unwrap(), query.to_vec(&forced).unwrap());
}
