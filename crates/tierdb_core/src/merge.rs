//! K-way merge over segment cursors.
//!
//! Every source yields entries in ascending key order. The merge pops the
//! smallest key from a binary heap; for equal keys the entry with the
//! higher operation index wins, then the lower source index (sources are
//! passed newest first). Later entries for an already emitted key are
//! skipped.

use crate::error::CoreResult;
use crate::schema::{compare_keys, Schema};
use crate::types::OpIndex;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::marker::PhantomData;

/// One entry of a segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentEntry<K, V> {
    /// The key.
    pub key: K,
    /// The value, possibly a tombstone.
    pub value: V,
    /// Operation index of the write.
    pub op_index: OpIndex,
}

impl<K, V> SegmentEntry<K, V> {
    /// Creates an entry.
    pub fn new(key: K, value: V, op_index: OpIndex) -> Self {
        Self {
            key,
            value,
            op_index,
        }
    }
}

/// A fallible, ordered stream of segment entries.
pub type SegmentCursor<'a, K, V> =
    Box<dyn Iterator<Item = CoreResult<SegmentEntry<K, V>>> + Send + 'a>;

struct HeapEntry<'a, S: Schema> {
    entry: SegmentEntry<S::Key, S::Value>,
    source: usize,
    cursor: SegmentCursor<'a, S::Key, S::Value>,
}

impl<S: Schema> PartialEq for HeapEntry<'_, S> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<S: Schema> Eq for HeapEntry<'_, S> {}

impl<S: Schema> PartialOrd for HeapEntry<'_, S> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<S: Schema> Ord for HeapEntry<'_, S> {
    // BinaryHeap is a max-heap; "greater" pops first.
    fn cmp(&self, other: &Self) -> Ordering {
        compare_keys::<S>(&self.entry.key, &other.entry.key)
            .reverse()
            .then_with(|| self.entry.op_index.cmp(&other.entry.op_index))
            .then_with(|| self.source.cmp(&other.source).reverse())
    }
}

/// Merges sorted cursors into one sorted, duplicate-free stream.
///
/// Tombstones are passed through; the caller decides whether to keep them.
pub struct MergeIterator<'a, S: Schema> {
    heap: BinaryHeap<HeapEntry<'a, S>>,
    last_key: Option<S::Key>,
    failed: bool,
    _schema: PhantomData<fn() -> S>,
}

impl<'a, S: Schema> MergeIterator<'a, S> {
    /// Seeds the heap with the first entry of every source.
    ///
    /// `sources` must be ordered newest first.
    ///
    /// # Errors
    ///
    /// Returns the first error a source yields while seeding.
    pub fn new(sources: Vec<SegmentCursor<'a, S::Key, S::Value>>) -> CoreResult<Self> {
        let mut heap = BinaryHeap::with_capacity(sources.len());
        for (source, mut cursor) in sources.into_iter().enumerate() {
            if let Some(first) = cursor.next() {
                heap.push(HeapEntry {
                    entry: first?,
                    source,
                    cursor,
                });
            }
        }
        Ok(Self {
            heap,
            last_key: None,
            failed: false,
            _schema: PhantomData,
        })
    }

    fn advance(&mut self, mut cursor: SegmentCursor<'a, S::Key, S::Value>, source: usize) -> CoreResult<()> {
        if let Some(next) = cursor.next() {
            self.heap.push(HeapEntry {
                entry: next?,
                source,
                cursor,
            });
        }
        Ok(())
    }
}

impl<S: Schema> Iterator for MergeIterator<'_, S> {
    type Item = CoreResult<SegmentEntry<S::Key, S::Value>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        while let Some(top) = self.heap.pop() {
            let HeapEntry {
                entry,
                source,
                cursor,
            } = top;

            if let Err(e) = self.advance(cursor, source) {
                self.failed = true;
                return Some(Err(e));
            }

            let duplicate = self
                .last_key
                .as_ref()
                .is_some_and(|last| compare_keys::<S>(last, &entry.key).is_eq());
            if duplicate {
                continue;
            }

            self.last_key = Some(entry.key.clone());
            return Some(Ok(entry));
        }

        None
    }
}

impl<S: Schema> fmt::Debug for MergeIterator<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergeIterator")
            .field("sources", &self.heap.len())
            .field("last_key", &self.last_key)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use crate::schema::{BytesSchema, Deletable};

    type Entry = SegmentEntry<Vec<u8>, Deletable<Vec<u8>>>;

    fn entry(key: &str, value: &str, op: u64) -> Entry {
        SegmentEntry::new(
            key.as_bytes().to_vec(),
            Deletable::new(value.as_bytes().to_vec()),
            OpIndex::new(op),
        )
    }

    fn cursor(entries: Vec<Entry>) -> SegmentCursor<'static, Vec<u8>, Deletable<Vec<u8>>> {
        Box::new(entries.into_iter().map(Ok))
    }

    fn collect(sources: Vec<SegmentCursor<'static, Vec<u8>, Deletable<Vec<u8>>>>) -> Vec<Entry> {
        MergeIterator::<BytesSchema>::new(sources)
            .unwrap()
            .collect::<CoreResult<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn merges_in_key_order() {
        let merged = collect(vec![
            cursor(vec![entry("b", "1", 2), entry("d", "1", 4)]),
            cursor(vec![entry("a", "0", 1), entry("c", "0", 3)]),
        ]);
        let keys: Vec<_> = merged.iter().map(|e| e.key.clone()).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);
    }

    #[test]
    fn higher_op_index_wins() {
        // The older source holds the newer write.
        let merged = collect(vec![
            cursor(vec![entry("k", "old", 1)]),
            cursor(vec![entry("k", "new", 9)]),
        ]);
        assert_eq!(merged, vec![entry("k", "new", 9)]);
    }

    #[test]
    fn equal_op_index_prefers_newest_source() {
        let merged = collect(vec![
            cursor(vec![entry("k", "first", 5)]),
            cursor(vec![entry("k", "second", 5)]),
        ]);
        assert_eq!(merged, vec![entry("k", "first", 5)]);
    }

    #[test]
    fn tombstones_pass_through() {
        let mut tombstone = entry("k", "", 3);
        tombstone.value.deleted = true;
        let merged = collect(vec![
            cursor(vec![tombstone.clone()]),
            cursor(vec![entry("k", "v", 1)]),
        ]);
        assert_eq!(merged, vec![tombstone]);
    }

    #[test]
    fn source_error_stops_iteration() {
        let failing: SegmentCursor<'static, Vec<u8>, Deletable<Vec<u8>>> = Box::new(
            vec![Ok(entry("a", "1", 1)), Err(CoreError::segment_corruption("bad block"))]
                .into_iter(),
        );
        let mut merge = MergeIterator::<BytesSchema>::new(vec![failing]).unwrap();
        assert!(merge.next().unwrap().is_err());
        assert!(merge.next().is_none());
    }

    #[test]
    fn empty_sources() {
        assert!(collect(vec![]).is_empty());
        assert!(collect(vec![cursor(vec![])]).is_empty());
    }
}
