//! STRATA - Merge Heap
//! Small binary heap ordered by a caller-supplied comparison.
//!
//! Both the merge engine and the cross-segment iterator keep one entry per
//! source in this heap, ordered by `(key, source index)`. Sources are
//! numbered newest first, so the tie-break on equal keys surfaces the most
//! recent write before any older copy of the same key.

use std::cmp::Ordering;

/// Binary heap whose top is the minimum under `compare`.
/// A reversed comparison turns it into a max-heap.
pub struct MinHeap<T, F>
where
    F: Fn(&T, &T) -> Ordering,
{
    items: Vec<T>,
    compare: F,
}

impl<T, F> MinHeap<T, F>
where
    F: Fn(&T, &T) -> Ordering,
{
    pub fn with_capacity(capacity: usize, compare: F) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
            compare,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn peek(&self) -> Option<&T> {
        self.items.first()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn push(&mut self, item: T) {
        self.items.push(item);
        self.sift_up(self.items.len() - 1);
    }

    pub fn pop(&mut self) -> Option<T> {
        if self.items.is_empty() {
            return None;
        }
        let last = self.items.len() - 1;
        self.items.swap(0, last);
        let top = self.items.pop();
        if !self.items.is_empty() {
            self.sift_down(0);
        }
        top
    }

    fn less(&self, a: usize, b: usize) -> bool {
        (self.compare)(&self.items[a], &self.items[b]) == Ordering::Less
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if !self.less(index, parent) {
                break;
            }
            self.items.swap(index, parent);
            index = parent;
        }
    }

    fn sift_down(&mut self, mut index: usize) {
        let len = self.items.len();
        loop {
            let left = 2 * index + 1;
            let right = left + 1;
            let mut smallest = index;
            if left < len && self.less(left, smallest) {
                smallest = left;
            }
            if right < len && self.less(right, smallest) {
                smallest = right;
            }
            if smallest == index {
                break;
            }
            self.items.swap(index, smallest);
            index = smallest;
        }
    }
}

/// One heap slot: the current entry of a source.
#[derive(Debug, Clone)]
pub struct HeapEntry<K, V> {
    pub key: K,
    pub value: V,
    pub source: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pops_in_order() {
        let mut heap = MinHeap::with_capacity(8, |a: &i32, b: &i32| a.cmp(b));
        for v in [5, 3, 9, 1, 7, 3] {
            heap.push(v);
        }
        let mut out = vec![];
        while let Some(v) = heap.pop() {
            out.push(v);
        }
        assert_eq!(out, vec![1, 3, 3, 5, 7, 9]);
    }

    #[test]
    fn test_reversed_comparison_is_max_heap() {
        let mut heap = MinHeap::with_capacity(4, |a: &i32, b: &i32| b.cmp(a));
        for v in [2, 8, 4] {
            heap.push(v);
        }
        assert_eq!(heap.peek(), Some(&8));
        assert_eq!(heap.pop(), Some(8));
        assert_eq!(heap.len(), 2);
    }

    #[test]
    fn test_source_tie_break() {
        let mut heap = MinHeap::with_capacity(4, |a: &HeapEntry<i32, &str>, b: &HeapEntry<i32, &str>| {
            a.key.cmp(&b.key).then(a.source.cmp(&b.source))
        });
        heap.push(HeapEntry { key: 1, value: "old", source: 2 });
        heap.push(HeapEntry { key: 1, value: "new", source: 0 });
        heap.push(HeapEntry { key: 0, value: "x", source: 1 });
        assert_eq!(heap.pop().unwrap().value, "x");
        assert_eq!(heap.pop().unwrap().value, "new");
        assert_eq!(heap.pop().unwrap().value, "old");
        assert!(heap.is_empty());
    }
}
