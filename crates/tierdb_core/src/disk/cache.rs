//! Lifetime-bounded circular caches.

use parking_lot::Mutex;
use std::fmt;
use std::time::{Duration, Instant};

struct Slot<T> {
    index: u64,
    value: T,
    last_access: Instant,
}

/// Fixed-capacity cache of decoded records keyed by record index.
///
/// Record `i` lives in slot `i % capacity`; inserting evicts whatever the
/// slot held. Lookups never evict. Entries idle longer than the lifetime
/// are removed only by [`CircularCache::release_expired`].
pub struct CircularCache<T> {
    slots: Mutex<Vec<Option<Slot<T>>>>,
    lifetime: Duration,
}

impl<T: Clone> CircularCache<T> {
    /// Creates a cache with `capacity` slots. A zero capacity disables it.
    #[must_use]
    pub fn new(capacity: usize, lifetime: Duration) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots: Mutex::new(slots),
            lifetime,
        }
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.lock().len()
    }

    fn slot_of(index: u64, capacity: usize) -> usize {
        (index % capacity as u64) as usize
    }

    /// Returns the cached record, refreshing its access time.
    pub fn get(&self, index: u64) -> Option<T> {
        let mut slots = self.slots.lock();
        if slots.is_empty() {
            return None;
        }
        let at = Self::slot_of(index, slots.len());
        match slots[at].as_mut() {
            Some(slot) if slot.index == index => {
                slot.last_access = Instant::now();
                Some(slot.value.clone())
            }
            _ => None,
        }
    }

    /// Stores a record, replacing the slot's previous occupant.
    pub fn insert(&self, index: u64, value: T) {
        let mut slots = self.slots.lock();
        if slots.is_empty() {
            return;
        }
        let at = Self::slot_of(index, slots.len());
        slots[at] = Some(Slot {
            index,
            value,
            last_access: Instant::now(),
        });
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.is_some()).count()
    }

    /// Returns true if no slot is occupied.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes entries idle for longer than the lifetime as of `now`.
    ///
    /// Returns the number of removed entries.
    pub fn release_expired(&self, now: Instant) -> usize {
        let mut released = 0;
        for slot in self.slots.lock().iter_mut() {
            let expired = slot
                .as_ref()
                .is_some_and(|s| now.saturating_duration_since(s.last_access) > self.lifetime);
            if expired {
                *slot = None;
                released += 1;
            }
        }
        released
    }

    /// Empties the cache.
    pub fn clear(&self) {
        for slot in self.slots.lock().iter_mut() {
            *slot = None;
        }
    }
}

impl<T> fmt::Debug for CircularCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircularCache")
            .field("capacity", &self.slots.lock().len())
            .field("lifetime", &self.lifetime)
            .finish()
    }
}
