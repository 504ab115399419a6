//! Partitioned parallel query execution for Weft.
//!
//! A query is a statically typed tree of operators over a partitioned data
//! source. Executing it splits the source into N partitions, runs each
//! partition's enumerator chain on its own worker thread, and merges the
//! partition outputs back into one result.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐ open ┌──────────────┐ give_partitioned_stream ┌───────────┐
//! │ QueryOperator│ ───▶ │ QueryResults │ ──────────────────────▶ │ Recipient │
//! └──────────────┘      └──────────────┘   PartitionedStream<T,K> └───────────┘
//!                                                                       │
//!                                                                       ▼
//!                                                          merge / spool / to_vec
//! ```
//!
//! # Key Components
//!
//! ## Streams ([`stream`])
//!
//! - [`PartitionedStream`]: N `(element, key)` enumerators plus key ordering
//!   and an [`OrdinalIndexState`](weft_core::OrdinalIndexState)
//! - [`PartitionedStreamRecipient`]: visitor generic over the key type
//!
//! ## Sources ([`source`])
//!
//! - [`from_vec`], [`from_arc`], [`range`]: indexed inputs, contiguous or striped
//! - [`from_iter`]: a shared iterator handed out in growing chunks
//! - [`from_partitioner`]: caller-supplied partitions
//!
//! ## Operators ([`operators`])
//!
//! Select, Where, Take/Skip, TakeWhile/SkipWhile, First/Last, ElementAt,
//! DefaultIfEmpty, set operations, GroupBy, Join/GroupJoin, OrderBy/ThenBy,
//! Reverse, Zip, Concat and aggregations.
//!
//! ## Exchange and merge ([`exchange`], [`merging`], [`sorting`])
//!
//! - Hash repartitioning through a cells matrix and a barrier
//! - Fully buffered, indexed, pipelined ordered and channel merges
//! - Cooperative pairwise merge sort across partitions
//!
//! # Example
//!
//! ```
//! use weft_engine::{QueryContext, QueryExt, range};
//!
//! let ctx = QueryContext::new().with_degree_of_parallelism(4);
//! let evens = range(0, 100)
//!     .as_ordered()
//!     .filter(|x| x % 2 == 0)
//!     .select(|x| x * 10)
//!     .take(3)
//!     .to_vec(&ctx)
//!     .unwrap();
//! assert_eq!(evens, vec![0, 20, 40]);
//! ```

#![allow(clippy::missing_const_for_fn)] // Builder patterns often can't be const
#![allow(clippy::return_self_not_must_use)] // Builder patterns don't always need must_use
#![allow(clippy::needless_pass_by_value)] // Streams and recipients are moved through the recipient protocol
#![allow(clippy::type_complexity)] // Enumerator state machines name nested generic types
#![allow(clippy::significant_drop_tightening)] // Guards are scoped to one statement
#![allow(clippy::too_many_arguments)] // Some functions need many arguments
#![allow(
    clippy::cast_possible_wrap,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    clippy::cast_possible_truncation
)] // Ordinal keys and counts cross between usize, u64 and i64
#![allow(clippy::doc_markdown)] // Documentation backticks are sometimes unnecessary
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)] // Every terminal returns QueryResult

pub mod channels;
pub mod events;
pub mod exchange;
pub mod merging;
pub mod operators;
pub mod query;
pub mod settings;
pub mod sorting;
pub mod source;
pub mod stream;

pub use events::{NoopEventSink, QueryEventCounts, QueryEventSink, RecordingEventSink};
pub use operators::{
    BinaryOperator, BinaryQueryOperator, Grouping, QueryOperator, UnaryOperator,
    UnaryQueryOperator,
};
pub use query::{
    QueryEnumerator, QueryExt, aggregate_with, execute_and_get_results_as_vec, for_all,
    get_opened_enumerator,
};
pub use settings::{QueryContext, QuerySettings};
pub use source::{
    DataSource, PartitionIter, Partitioner, from_arc, from_iter, from_partitioner, from_vec, range,
};
pub use stream::{
    BoxedEnumerator, IndexedSource, PartitionedStream, PartitionedStreamRecipient,
    QueryOperatorEnumerator, QueryResults,
};
