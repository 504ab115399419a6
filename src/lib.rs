//! Weft - a partitioned, order-aware parallel query engine
//!
//! Weft runs composable query operators (filter, project, group, join, sort,
//! set operations, aggregation) over in-memory sequences by splitting the
//! input into partitions, processing each partition on its own worker
//! thread, and merging the results back with the original order preserved
//! when the query asks for it.

#![forbid(unsafe_code)]
#![allow(clippy::module_name_repetitions)]

// Re-export core crates
pub use common_config as config;
pub use common_error as error;
pub use common_runtime as runtime;
pub use weft_core as core;
pub use weft_engine as engine;

pub use common_error::{QueryError, QueryResult};
pub use weft_engine::{QueryContext, QueryExt, from_arc, from_iter, from_partitioner, from_vec, range};

/// Weft version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
