//! Append-only chunked list.

/// Initial capacity of the first chunk.
const INITIAL_CHUNK_CAPACITY: usize = 16;

/// Upper bound on a single chunk's capacity.
const MAX_CHUNK_CAPACITY: usize = 4096;

/// A list built from chunks whose capacity doubles up to a cap, so appending
/// never moves elements already stored.
#[derive(Debug, Clone)]
pub struct ListChunk<T> {
    chunks: Vec<Vec<T>>,
    current_capacity: usize,
    len: usize,
}

impl<T> Default for ListChunk<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ListChunk<T> {
    /// Create an empty list.
    pub const fn new() -> Self {
        Self {
            chunks: Vec::new(),
            current_capacity: 0,
            len: 0,
        }
    }

    /// Append an element.
    pub fn push(&mut self, value: T) {
        let needs_chunk = self
            .chunks
            .last()
            .is_none_or(|chunk| chunk.len() >= self.current_capacity);
        if needs_chunk {
            self.current_capacity = if self.chunks.is_empty() {
                INITIAL_CHUNK_CAPACITY
            } else {
                (self.current_capacity * 2).min(MAX_CHUNK_CAPACITY)
            };
            self.chunks.push(Vec::with_capacity(self.current_capacity));
        }
        if let Some(chunk) = self.chunks.last_mut() {
            chunk.push(value);
            self.len += 1;
        }
    }

    /// Number of elements.
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the list is empty.
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of chunks allocated.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Iterate elements in append order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.chunks.iter().flatten()
    }
}

impl<T> IntoIterator for ListChunk<T> {
    type Item = T;
    type IntoIter = std::iter::Flatten<std::vec::IntoIter<Vec<T>>>;

    fn into_iter(self) -> Self::IntoIter {
        self.chunks.into_iter().flatten()
    }
}

impl<T> Extend<T> for ListChunk<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        for value in iter {
            self.push(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_preserves_order() {
        let mut list = ListChunk::new();
        list.extend(0..1000);
        assert_eq!(list.len(), 1000);
        assert!(list.iter().copied().eq(0..1000));
        assert!(list.into_iter().eq(0..1000));
    }

    #[test]
    fn test_chunks_double() {
        let mut list = ListChunk::new();
        list.extend(0..INITIAL_CHUNK_CAPACITY * 3);
        // 16 + 32 = 48
        assert_eq!(list.chunk_count(), 2);
    }

    #[test]
    fn test_empty() {
        let list: ListChunk<u8> = ListChunk::default();
        assert!(list.is_empty());
        assert_eq!(list.iter().count(), 0);
    }
}
