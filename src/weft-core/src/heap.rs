//! Bounded binary max-heap.

use crate::key::KeyComparer;

/// A max-heap holding at most `size` elements, ordered by a [`KeyComparer`].
///
/// Take/Skip use it to keep the `count` smallest keys seen across all
/// partitions; the ordered merge uses it with a reversed comparer to pick the
/// producer whose next key is smallest.
#[derive(Debug, Clone)]
pub struct FixedMaxHeap<T> {
    elements: Vec<T>,
    size: usize,
    comparer: KeyComparer<T>,
}

impl<T: 'static> FixedMaxHeap<T> {
    /// Create an empty heap with room for `size` elements.
    pub fn new(size: usize, comparer: KeyComparer<T>) -> Self {
        Self {
            elements: Vec::with_capacity(size),
            size,
            comparer,
        }
    }

    /// Number of elements held.
    pub fn count(&self) -> usize {
        self.elements.len()
    }

    /// Maximum number of elements.
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Whether no further element fits.
    pub fn is_full(&self) -> bool {
        self.elements.len() >= self.size
    }

    /// Whether the heap is empty.
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// The largest element, if any.
    pub fn max_value(&self) -> Option<&T> {
        self.elements.first()
    }

    /// Add `value` if there is room; returns `false` when the heap is full.
    pub fn insert(&mut self, value: T) -> bool {
        if self.is_full() {
            return false;
        }
        self.elements.push(value);
        self.sift_up(self.elements.len() - 1);
        true
    }

    /// Replace the largest element with `value` and restore heap order.
    ///
    /// Returns the replaced element, or `None` (and inserts) when empty.
    pub fn replace_max(&mut self, value: T) -> Option<T> {
        if self.elements.is_empty() {
            self.insert(value);
            return None;
        }
        let old = std::mem::replace(&mut self.elements[0], value);
        self.sift_down(0);
        Some(old)
    }

    /// Remove and return the largest element.
    pub fn remove_max(&mut self) -> Option<T> {
        if self.elements.is_empty() {
            return None;
        }
        let last = self.elements.len() - 1;
        self.elements.swap(0, last);
        let max = self.elements.pop();
        if !self.elements.is_empty() {
            self.sift_down(0);
        }
        max
    }

    /// Offer `value` to a heap tracking the `size` smallest elements.
    ///
    /// Inserts while there is room, otherwise replaces the current max if
    /// `value` orders strictly below it. Returns whether `value` was kept.
    pub fn offer(&mut self, value: T) -> bool {
        if !self.is_full() {
            return self.insert(value);
        }
        match self.elements.first() {
            Some(max) if self.comparer.less(&value, max) => {
                self.replace_max(value);
                true
            }
            _ => false,
        }
    }

    /// Drop every element.
    pub fn clear(&mut self) {
        self.elements.clear();
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if self.comparer.less(&self.elements[parent], &self.elements[index]) {
                self.elements.swap(parent, index);
                index = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut index: usize) {
        let len = self.elements.len();
        loop {
            let left = 2 * index + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let mut largest = left;
            if right < len && self.comparer.less(&self.elements[left], &self.elements[right]) {
                largest = right;
            }
            if self.comparer.less(&self.elements[index], &self.elements[largest]) {
                self.elements.swap(index, largest);
                index = largest;
            } else {
                break;
            }
        }
    }
}
