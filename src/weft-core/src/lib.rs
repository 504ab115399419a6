//! Core data structures for Weft.
//!
//! Partition-local building blocks shared by every operator:
//!
//! - [`OrdinalIndexState`]: how much positional meaning stream keys carry
//! - [`KeyComparer`], [`Pair`], [`ConcatKey`]: ordering keys and their comparers
//! - [`EqualityComparer`]: hashing/equality for lookups and repartitioning
//! - [`FixedMaxHeap`], [`HashLookup`], [`ListChunk`]: bounded heap, chained
//!   hash table and chunked list

mod heap;
mod key;
mod list_chunk;
mod lookup;
mod ordinal;

pub use heap::FixedMaxHeap;
pub use key::{
    ConcatKey, DefaultEqualityComparer, EqualityComparer, KeyComparer, OrderKey, Pair,
    ProjectionEqualityComparer, SharedEqualityComparer, default_equality_comparer,
};
pub use list_chunk::ListChunk;
pub use lookup::{HashLookup, LookupIntoIter};
pub use ordinal::OrdinalIndexState;
