//! Error types and result aliases for Weft.
//!
//! Cancellation, worker faults and contract violations all travel as
//! [`QueryError`] values through `Result` returns; nothing in the engine
//! unwinds across a partition boundary.

mod error;

pub use error::{CancelSource, QueryError, QueryResult};
