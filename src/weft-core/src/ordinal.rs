//! Ordinal index state.

use std::fmt;

/// How well the keys of a partitioned stream describe positions in the
/// original sequence.
///
/// Variants are ordered from best to worst; the derived `Ord` treats a
/// larger value as a weaker guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OrdinalIndexState {
    /// Keys are exact `0, 1, 2, ...` positions and the source has O(1) random access.
    Indexable,
    /// Keys are exact `0, 1, 2, ...` positions.
    Correct,
    /// Keys strictly increase within each partition; gaps allowed.
    Increasing,
    /// Keys carry no positional meaning.
    Shuffled,
}

impl OrdinalIndexState {
    /// The weaker of two states.
    #[must_use]
    pub fn worse(self, other: Self) -> Self {
        self.max(other)
    }

    /// Whether `self` is a strictly weaker guarantee than `other`.
    pub fn is_worse_than(self, other: Self) -> bool {
        self > other
    }

    /// Whether `self` is no better than `bound`.
    pub fn worse_or_equal(self, bound: Self) -> bool {
        self >= bound
    }
}

impl fmt::Display for OrdinalIndexState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Indexable => write!(f, "Indexable"),
            Self::Correct => write!(f, "Correct"),
            Self::Increasing => write!(f, "Increasing"),
            Self::Shuffled => write!(f, "Shuffled"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::OrdinalIndexState::*;

    #[test]
    fn test_worse_picks_weaker() {
        assert_eq!(Indexable.worse(Correct), Correct);
        assert_eq!(Shuffled.worse(Increasing), Shuffled);
        assert_eq!(Correct.worse(Correct), Correct);
    }

    #[test]
    fn test_is_worse_than() {
        assert!(Shuffled.is_worse_than(Increasing));
        assert!(Increasing.is_worse_than(Correct));
        assert!(!Indexable.is_worse_than(Correct));
        assert!(!Correct.is_worse_than(Correct));
        assert!(Correct.worse_or_equal(Correct));
        assert!(Shuffled.worse_or_equal(Indexable));
    }
}
