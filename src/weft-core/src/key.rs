//! Ordering keys and comparers.
//!
//! Every element of a partitioned stream travels with a key describing its
//! position in the logical output. Keys are compared through a
//! [`KeyComparer`] so operators can reverse or compose orderings without
//! changing the key type.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;

/// Bounds every ordering key satisfies.
pub trait OrderKey: Clone + Default + Send + Sync + 'static {}

impl<T: Clone + Default + Send + Sync + 'static> OrderKey for T {}

/// Two values carried together; used for composite keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pair<A, B> {
    /// Primary component.
    pub first: A,
    /// Secondary component.
    pub second: B,
}

impl<A, B> Pair<A, B> {
    /// Create a pair.
    pub const fn new(first: A, second: B) -> Self {
        Self { first, second }
    }
}

/// Key of a concatenation: every left key orders before every right key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConcatKey<L, R> {
    /// Element came from the left input.
    Left(L),
    /// Element came from the right input.
    Right(R),
}

impl<L: Default, R> Default for ConcatKey<L, R> {
    fn default() -> Self {
        Self::Left(L::default())
    }
}

type CompareFn<K> = dyn Fn(&K, &K) -> Ordering + Send + Sync;

/// Shared, cloneable key ordering.
pub struct KeyComparer<K> {
    compare: Arc<CompareFn<K>>,
}

impl<K> Clone for KeyComparer<K> {
    fn clone(&self) -> Self {
        Self {
            compare: Arc::clone(&self.compare),
        }
    }
}

impl<K> fmt::Debug for KeyComparer<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyComparer")
    }
}

impl<K: 'static> KeyComparer<K> {
    /// Comparer from a closure.
    pub fn new<F>(compare: F) -> Self
    where
        F: Fn(&K, &K) -> Ordering + Send + Sync + 'static,
    {
        Self {
            compare: Arc::new(compare),
        }
    }

    /// The key type's own ordering.
    pub fn natural() -> Self
    where
        K: Ord,
    {
        Self::new(K::cmp)
    }

    /// Compare two keys.
    #[inline]
    pub fn compare(&self, a: &K, b: &K) -> Ordering {
        (self.compare)(a, b)
    }

    /// Whether `a` orders strictly before `b`.
    #[inline]
    pub fn less(&self, a: &K, b: &K) -> bool {
        self.compare(a, b) == Ordering::Less
    }

    /// The opposite ordering.
    #[must_use]
    pub fn reversed(&self) -> Self {
        let inner = self.clone();
        Self::new(move |a, b| inner.compare(b, a))
    }

    /// Ordering on a projection of another type.
    pub fn by<T: 'static, F>(&self, project: F) -> KeyComparer<T>
    where
        F: Fn(&T) -> &K + Send + Sync + 'static,
    {
        let inner = self.clone();
        KeyComparer::new(move |a, b| inner.compare(project(a), project(b)))
    }
}

impl KeyComparer<()> {
    /// Comparer for streams without a meaningful order: every key is equal.
    pub fn unit() -> Self {
        Self::new(|(), ()| Ordering::Equal)
    }
}

impl<A: 'static, B: 'static> KeyComparer<Pair<A, B>> {
    /// Lexicographic ordering: `first` by `primary`, ties by `secondary`.
    pub fn pair(primary: KeyComparer<A>, secondary: KeyComparer<B>) -> Self {
        Self::new(move |a, b| {
            primary
                .compare(&a.first, &b.first)
                .then_with(|| secondary.compare(&a.second, &b.second))
        })
    }
}

impl<L: 'static, R: 'static> KeyComparer<ConcatKey<L, R>> {
    /// Left keys before right keys, each side by its own ordering.
    pub fn concat(left: KeyComparer<L>, right: KeyComparer<R>) -> Self {
        Self::new(move |a, b| match (a, b) {
            (ConcatKey::Left(a), ConcatKey::Left(b)) => left.compare(a, b),
            (ConcatKey::Right(a), ConcatKey::Right(b)) => right.compare(a, b),
            (ConcatKey::Left(_), ConcatKey::Right(_)) => Ordering::Less,
            (ConcatKey::Right(_), ConcatKey::Left(_)) => Ordering::Greater,
        })
    }
}

// ============================================================================
// Equality comparers
// ============================================================================

/// Hashing and equality used by hash lookups and hash repartitioning.
///
/// Equal values must hash equally.
pub trait EqualityComparer<T: ?Sized>: Send + Sync {
    /// Whether two values are equal.
    fn equals(&self, a: &T, b: &T) -> bool;

    /// Hash code of a value.
    fn hash(&self, value: &T) -> u64;
}

/// Equality and hashing from the type's `Eq` and `Hash`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultEqualityComparer;

impl<T: Hash + Eq + ?Sized> EqualityComparer<T> for DefaultEqualityComparer {
    fn equals(&self, a: &T, b: &T) -> bool {
        a == b
    }

    fn hash(&self, value: &T) -> u64 {
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);
        hasher.finish()
    }
}

impl<T: ?Sized, C: EqualityComparer<T> + ?Sized> EqualityComparer<T> for Arc<C> {
    fn equals(&self, a: &T, b: &T) -> bool {
        (**self).equals(a, b)
    }

    fn hash(&self, value: &T) -> u64 {
        (**self).hash(value)
    }
}

/// Equality comparer built from a key projection: values are equal when
/// their projected keys are.
pub struct ProjectionEqualityComparer<F> {
    project: F,
}

impl<F> ProjectionEqualityComparer<F> {
    /// Compare values by `project(value)`.
    pub const fn new(project: F) -> Self {
        Self { project }
    }
}

impl<T: ?Sized, K: Hash + Eq, F> EqualityComparer<T> for ProjectionEqualityComparer<F>
where
    F: Fn(&T) -> K + Send + Sync,
{
    fn equals(&self, a: &T, b: &T) -> bool {
        (self.project)(a) == (self.project)(b)
    }

    fn hash(&self, value: &T) -> u64 {
        DefaultEqualityComparer.hash(&(self.project)(value))
    }
}

/// Shared, type-erased equality comparer as operators store it.
pub type SharedEqualityComparer<T> = Arc<dyn EqualityComparer<T>>;

/// The default comparer for `T`, shared.
pub fn default_equality_comparer<T: Hash + Eq + ?Sized>() -> SharedEqualityComparer<T> {
    Arc::new(DefaultEqualityComparer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_natural_and_reversed() {
        let natural = KeyComparer::<usize>::natural();
        assert_eq!(natural.compare(&1, &2), Ordering::Less);
        assert!(natural.less(&1, &2));

        let reversed = natural.reversed();
        assert_eq!(reversed.compare(&1, &2), Ordering::Greater);
        assert!(!reversed.less(&1, &2));
    }

    #[test]
    fn test_pair_comparer_breaks_ties() {
        let cmp = KeyComparer::pair(
            KeyComparer::<i32>::natural().reversed(),
            KeyComparer::<usize>::natural(),
        );
        assert_eq!(cmp.compare(&Pair::new(5, 1), &Pair::new(3, 0)), Ordering::Less);
        assert_eq!(cmp.compare(&Pair::new(5, 1), &Pair::new(5, 2)), Ordering::Less);
        assert_eq!(cmp.compare(&Pair::new(5, 2), &Pair::new(5, 2)), Ordering::Equal);
    }

    #[test]
    fn test_concat_comparer() {
        let cmp = KeyComparer::concat(
            KeyComparer::<usize>::natural(),
            KeyComparer::<usize>::natural(),
        );
        assert!(cmp.less(&ConcatKey::Left(100), &ConcatKey::Right(0)));
        assert!(cmp.less(&ConcatKey::Right(1), &ConcatKey::Right(2)));
        assert_eq!(ConcatKey::<usize, usize>::default(), ConcatKey::Left(0));
    }

    #[test]
    fn test_unit_comparer() {
        assert_eq!(KeyComparer::unit().compare(&(), &()), Ordering::Equal);
    }

    #[test]
    fn test_projection_equality() {
        let by_len = ProjectionEqualityComparer::new(|s: &str| s.len());
        assert!(by_len.equals("abc", "xyz"));
        assert!(!by_len.equals("ab", "xyz"));
        assert_eq!(by_len.hash("abc"), by_len.hash("xyz"));
    }

    #[test]
    fn test_default_equality_is_deterministic() {
        let comparer = default_equality_comparer::<i64>();
        assert_eq!(comparer.hash(&42), comparer.hash(&42));
        assert!(comparer.equals(&7, &7));
    }
}
