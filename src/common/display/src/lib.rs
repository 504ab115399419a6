//! Display and visualization utilities for Weft.
//!
//! Provides the tree rendering behind operator `explain()` output.

mod tree;

pub use tree::ExplainNode;
