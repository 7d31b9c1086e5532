//! Tier queue with newest-first snapshots.

use parking_lot::Mutex;
use std::collections::VecDeque;

/// FIFO of segments of one tier.
///
/// New segments enter at the newest end. Readers take a point-in-time
/// snapshot, newest first, so a concurrent enqueue never disturbs a scan.
/// Indexes taken by [`SegmentQueue::replace_range`] count from the newest
/// segment (index 0).
#[derive(Debug)]
pub struct SegmentQueue<T> {
    // Back is newest.
    items: Mutex<VecDeque<T>>,
}

impl<T> Default for SegmentQueue<T> {
    fn default() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
        }
    }
}

impl<T: Clone> SegmentQueue<T> {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a queue from items listed newest first.
    #[must_use]
    pub fn from_newest_first(items: Vec<T>) -> Self {
        Self {
            items: Mutex::new(items.into_iter().rev().collect()),
        }
    }

    /// Adds a segment at the newest end.
    pub fn enqueue(&self, item: T) {
        self.items.lock().push_back(item);
    }

    /// Copies the queue, newest first.
    pub fn snapshot(&self) -> Vec<T> {
        self.items.lock().iter().rev().cloned().collect()
    }

    /// Number of queued segments.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Returns true if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Removes every item matching `pred` and returns how many were removed.
    pub fn remove_where(&self, mut pred: impl FnMut(&T) -> bool) -> usize {
        let mut items = self.items.lock();
        let before = items.len();
        items.retain(|item| !pred(item));
        before - items.len()
    }

    /// Replaces the inclusive newest-first range `from..=to` with `item`.
    ///
    /// Returns the replaced items, newest first, or `None` if the range is
    /// out of bounds.
    pub fn replace_range(&self, from: usize, to: usize, item: T) -> Option<Vec<T>> {
        let mut items = self.items.lock();
        let len = items.len();
        if from > to || to >= len {
            return None;
        }

        // Newest-first index i lives at deque index len - 1 - i.
        let start = len - 1 - to;
        let end = len - from;
        let mut replaced: Vec<T> = items.drain(start..end).collect();
        replaced.reverse();
        items.insert(start, item);
        Some(replaced)
    }
}
