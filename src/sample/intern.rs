use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};

use super::stack::StableHash;

const EMPTY: u8 = 0;
const RESERVED: u8 = 1;
const OCCUPIED: u8 = 2;
const TOMBSTONE: u8 = 3;

enum ClaimFailed {
    /// Another claim took the slot first.
    Raced,
    /// The map is at capacity.
    Full,
}

struct Slot<K> {
    state: AtomicU8,
    key: UnsafeCell<MaybeUninit<K>>,
    count: AtomicU64,
}

impl<K> Slot<K> {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            key: UnsafeCell::new(MaybeUninit::uninit()),
            count: AtomicU64::new(0),
        }
    }

    // Caller must have observed OCCUPIED with acquire ordering, or hold the
    // RESERVED claim on this slot.
    unsafe fn key(&self) -> &K {
        (*self.key.get()).assume_init_ref()
    }
}

/// Fixed-capacity concurrent counter map with open addressing and linear
/// probing.
///
/// All storage is allocated at construction; no operation allocates, blocks
/// or rehashes afterwards, which makes the map usable from a signal handler
/// that may have interrupted another operation on the same map mid-flight.
/// Slot states are published with release stores of `OCCUPIED` after key and
/// count are written, and read with acquire loads, so an observer that sees
/// an occupied slot sees a coherent key and count.
///
/// Values are `u64` counters held in [`AtomicU64`] cells: every mutation goes
/// through a shared reference, so plain values could not be updated soundly.
///
/// Two caveats of the lock-free claim protocol, both harmless downstream:
/// the size counter is relaxed and approximate, and a signal that lands in
/// the window between claiming a slot and publishing it may intern the same
/// key into a second slot. Duplicate entries aggregate by identity when the
/// trace is decoded.
pub struct InternMap<K> {
    slots: Box<[Slot<K>]>,
    len: AtomicUsize,
}

unsafe impl<K: Send> Send for InternMap<K> {}
unsafe impl<K: Send + Sync> Sync for InternMap<K> {}

impl<K: StableHash + Eq> InternMap<K> {
    /// Allocates a map with room for `capacity` distinct keys.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "intern map capacity must be non-zero");
        let slots = std::iter::repeat_with(Slot::new)
            .take(capacity)
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            len: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Approximate number of occupied slots.
    pub fn size(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn is_full(&self) -> bool {
        self.size() >= self.capacity()
    }

    /// Returns the current count for `key`, if interned.
    pub fn find(&self, key: &K) -> Option<u64> {
        self.find_counter(key).map(|c| c.load(Ordering::Relaxed))
    }

    /// Returns the counter cell for `key` without inserting.
    pub fn find_counter(&self, key: &K) -> Option<&AtomicU64> {
        let cap = self.capacity();
        let start = key.stable_hash() as usize % cap;
        for i in 0..cap {
            let slot = &self.slots[(start + i) % cap];
            match slot.state.load(Ordering::Acquire) {
                EMPTY => return None,
                OCCUPIED => {
                    if unsafe { slot.key() } == key {
                        return Some(&slot.count);
                    }
                }
                // Probe past tombstones and in-flight claims.
                _ => {}
            }
        }
        None
    }

    /// Returns the counter cell for `key`, interning it with a zero count if
    /// new. `None` means the map is full and `key` was not present.
    pub fn counter(&self, key: &K) -> Option<&AtomicU64>
    where
        K: Clone,
    {
        'retry: loop {
            let cap = self.capacity();
            let start = key.stable_hash() as usize % cap;
            let mut tombstone = None;

            for i in 0..cap {
                let idx = (start + i) % cap;
                let slot = &self.slots[idx];
                match slot.state.load(Ordering::Acquire) {
                    OCCUPIED => {
                        if unsafe { slot.key() } == key {
                            return Some(&slot.count);
                        }
                    }
                    TOMBSTONE => {
                        if tombstone.is_none() {
                            tombstone = Some(idx);
                        }
                    }
                    EMPTY => {
                        let target = tombstone.unwrap_or(idx);
                        match self.claim(target, key) {
                            Ok(counter) => return Some(counter),
                            Err(ClaimFailed::Full) => return None,
                            // Lost the race for the slot; the winner may have
                            // interned our key, so probe again from scratch.
                            Err(ClaimFailed::Raced) => continue 'retry,
                        }
                    }
                    _ => {}
                }
            }

            // Full ring traversed: reuse a tombstone if one was seen.
            return match tombstone {
                Some(idx) => match self.claim(idx, key) {
                    Ok(counter) => Some(counter),
                    Err(ClaimFailed::Full) => None,
                    Err(ClaimFailed::Raced) => continue 'retry,
                },
                None => None,
            };
        }
    }

    fn claim<'a>(&'a self, idx: usize, key: &K) -> Result<&'a AtomicU64, ClaimFailed>
    where
        K: Clone,
    {
        let slot = &self.slots[idx];
        let prev = slot.state.load(Ordering::Relaxed);
        if prev != EMPTY && prev != TOMBSTONE {
            return Err(ClaimFailed::Raced);
        }
        if slot
            .state
            .compare_exchange(prev, RESERVED, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return Err(ClaimFailed::Raced);
        }
        // Reserve a length slot before publishing anything so size() can
        // never exceed capacity() even under racing claims.
        if self.len.fetch_add(1, Ordering::Relaxed) >= self.capacity() {
            self.len.fetch_sub(1, Ordering::Relaxed);
            slot.state.store(prev, Ordering::Release);
            return Err(ClaimFailed::Full);
        }
        unsafe {
            let cell = slot.key.get();
            if prev == TOMBSTONE {
                (*cell).assume_init_drop();
            }
            ptr::write(cell, MaybeUninit::new(key.clone()));
        }
        slot.count.store(0, Ordering::Relaxed);
        slot.state.store(OCCUPIED, Ordering::Release);
        Ok(&slot.count)
    }

    /// Adds `delta` to the count for `key`, interning it if new. Returns
    /// `false` when the map is full and `key` was not present.
    #[inline]
    pub fn increment(&self, key: &K, delta: u64) -> bool
    where
        K: Clone,
    {
        match self.counter(key) {
            Some(counter) => {
                counter.fetch_add(delta, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Sets the count for `key`, interning it if new. Returns `false` when
    /// the map is full and `key` was not present.
    pub fn insert(&self, key: &K, count: u64) -> bool
    where
        K: Clone,
    {
        match self.counter(key) {
            Some(counter) => {
                counter.store(count, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Removes `key`, leaving a tombstone. Must not race with readers of the
    /// same key.
    pub fn erase(&self, key: &K) -> bool {
        let cap = self.capacity();
        let start = key.stable_hash() as usize % cap;
        for i in 0..cap {
            let slot = &self.slots[(start + i) % cap];
            match slot.state.load(Ordering::Acquire) {
                EMPTY => return false,
                OCCUPIED => {
                    if unsafe { slot.key() } == key {
                        if slot
                            .state
                            .compare_exchange(
                                OCCUPIED,
                                TOMBSTONE,
                                Ordering::AcqRel,
                                Ordering::Relaxed,
                            )
                            .is_ok()
                        {
                            self.len.fetch_sub(1, Ordering::Relaxed);
                            return true;
                        }
                        return false;
                    }
                }
                _ => {}
            }
        }
        false
    }

    /// Visits every occupied slot in unspecified order.
    pub fn for_each(&self, mut f: impl FnMut(&K, u64)) {
        for slot in self.slots.iter() {
            if slot.state.load(Ordering::Acquire) == OCCUPIED {
                f(unsafe { slot.key() }, slot.count.load(Ordering::Relaxed));
            }
        }
    }

    /// Drops all entries and resets the map to empty.
    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            let state = *slot.state.get_mut();
            if state == OCCUPIED || state == TOMBSTONE {
                unsafe { (*slot.key.get()).assume_init_drop() };
            }
            *slot.state.get_mut() = EMPTY;
            *slot.count.get_mut() = 0;
        }
        *self.len.get_mut() = 0;
    }
}

impl<K> Drop for InternMap<K> {
    fn drop(&mut self) {
        for slot in self.slots.iter_mut() {
            let state = *slot.state.get_mut();
            if state == OCCUPIED || state == TOMBSTONE {
                unsafe { (*slot.key.get()).assume_init_drop() };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::sample::CallStack;

    #[test]
    fn insert_then_find() {
        let map = InternMap::new(16);
        assert!(map.insert(&1u64, 10));
        assert!(map.insert(&2u64, 20));
        assert_eq!(map.find(&1), Some(10));
        assert_eq!(map.find(&2), Some(20));
        assert_eq!(map.find(&3), None);
        assert_eq!(map.size(), 2);
    }

    #[test]
    fn insert_overwrites_existing() {
        let map = InternMap::new(16);
        assert!(map.insert(&7u64, 1));
        assert!(map.insert(&7u64, 9));
        assert_eq!(map.find(&7), Some(9));
        assert_eq!(map.size(), 1);
    }

    #[test]
    fn increment_accumulates() {
        let map = InternMap::new(16);
        assert!(map.increment(&5u64, 1));
        assert!(map.increment(&5u64, 4));
        assert_eq!(map.find(&5), Some(5));
    }

    #[test]
    fn full_map_rejects_new_keys_but_counts_existing() {
        let map = InternMap::new(4);
        for k in 0..4u64 {
            assert!(map.insert(&k, 1));
        }
        assert!(map.is_full());
        assert!(!map.increment(&99, 1));
        assert!(map.increment(&0, 1));
        assert_eq!(map.find(&0), Some(2));
        assert_eq!(map.size(), 4);
    }

    #[test]
    fn erase_leaves_reusable_tombstone() {
        let map = InternMap::new(8);
        for k in 0..8u64 {
            assert!(map.insert(&k, k));
        }
        assert!(map.erase(&3));
        assert!(!map.erase(&3));
        assert_eq!(map.find(&3), None);
        assert_eq!(map.size(), 7);
        // Lookups keep probing past the tombstone.
        for k in (0..8u64).filter(|k| *k != 3) {
            assert_eq!(map.find(&k), Some(k));
        }
        // A new key reclaims the tombstone rather than failing.
        assert!(map.insert(&100, 1));
        assert_eq!(map.find(&100), Some(1));
        assert_eq!(map.size(), 8);
    }

    #[test]
    fn clear_resets_everything() {
        let mut map = InternMap::new(8);
        map.insert(&1u64, 1);
        map.erase(&1);
        map.insert(&2u64, 2);
        map.clear();
        assert!(map.is_empty());
        assert_eq!(map.find(&2), None);
        assert!(map.insert(&2u64, 5));
    }

    #[test]
    fn for_each_visits_occupied_only() {
        let map = InternMap::new(16);
        map.insert(&1u64, 10);
        map.insert(&2u64, 20);
        map.erase(&1);
        let mut seen = Vec::new();
        map.for_each(|k, v| seen.push((*k, v)));
        assert_eq!(seen, vec![(2, 20)]);
    }

    #[test]
    fn call_stack_keys() {
        let map = InternMap::new(64);
        let a = CallStack::from_frames(&[0x1000, 0x2000, 0x3000]);
        let b = CallStack::from_frames(&[0x4000, 0x5000]);
        assert!(map.increment(&a, 100));
        assert!(map.increment(&b, 200));
        assert!(map.increment(&a, 1));
        assert_eq!(map.find(&a), Some(101));
        assert_eq!(map.find(&b), Some(200));
    }

    #[test]
    fn concurrent_writers_and_reader() {
        let map = Arc::new(InternMap::new(256));
        let keys: Vec<u64> = (0..32).collect();

        let mut handles = Vec::new();
        for _ in 0..2 {
            let map = Arc::clone(&map);
            let keys = keys.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    for k in &keys {
                        assert!(map.increment(k, 1));
                    }
                }
            }));
        }
        let reader = {
            let map = Arc::clone(&map);
            std::thread::spawn(move || {
                for _ in 0..100 {
                    map.for_each(|k, _| assert!(*k < 32));
                }
            })
        };
        for h in handles {
            h.join().unwrap();
        }
        reader.join().unwrap();

        let mut total = 0;
        map.for_each(|_, v| total += v);
        assert_eq!(total, 2 * 1000 * 32);
        for k in &keys {
            assert_eq!(map.find(k), Some(2000));
        }
    }
}
