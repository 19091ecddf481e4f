use std::ptr::null_mut;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::utils::{ceil_to_pow2, INVALID_THREAD_ID};

const EMPTY_KEY: usize = 0;

struct HashEntry<V> {
    key: AtomicUsize,
    value: AtomicPtr<V>,
}

struct Generation<V> {
    capacity: usize,
    entries: *mut HashEntry<V>,
    prev: *mut Generation<V>,
}

pub(crate) enum InsertResult<V> {
    Added,
    Got(*mut V),
}

/// Lock-free open-addressed linear-probing map from thread id to producer.
///
/// Keys are immutable once written and values monotonic once published, so
/// lookups need no synchronization beyond acquire loads. The table grows by
/// chaining a new generation of double capacity; lookups walk the chain
/// newest to oldest and no generation is freed before the table drops.
///
/// Insertion assumes the single-writer-per-key discipline of thread ids:
/// only the owning thread registers its own id.
pub(crate) struct IdHashTable<V> {
    current: AtomicPtr<Generation<V>>,
    count: AtomicUsize,
}

unsafe impl<V: Sync> Send for IdHashTable<V> {}
unsafe impl<V: Sync> Sync for IdHashTable<V> {}

// 64-bit avalanche mixer; thread ids are sequential, so the probe start
// must not be.
#[inline]
fn hash_id(mut h: usize) -> usize {
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    h ^= h >> 33;
    h
}

impl<V> IdHashTable<V> {
    pub(crate) fn new(initial_size: usize) -> Self {
        let capacity = ceil_to_pow2(initial_size.max(4));
        IdHashTable {
            current: AtomicPtr::new(Self::new_generation(capacity, null_mut())),
            count: AtomicUsize::new(0),
        }
    }

    fn new_generation(capacity: usize, prev: *mut Generation<V>) -> *mut Generation<V> {
        let entries: Vec<HashEntry<V>> = (0..capacity)
            .map(|_| HashEntry {
                key: AtomicUsize::new(EMPTY_KEY),
                value: AtomicPtr::new(null_mut()),
            })
            .collect();
        Box::into_raw(Box::new(Generation {
            capacity,
            entries: Box::into_raw(entries.into_boxed_slice()) as *mut HashEntry<V>,
            prev,
        }))
    }

    pub(crate) fn get(&self, key: usize) -> *mut V {
        debug_assert_ne!(key, EMPTY_KEY);
        unsafe {
            let mut generation = self.current.load(Ordering::Acquire);
            while !generation.is_null() {
                let g = &*generation;
                let mask = g.capacity - 1;
                let mut slot = hash_id(key) & mask;
                for _ in 0..g.capacity {
                    let entry = &*g.entries.add(slot);
                    let k = entry.key.load(Ordering::Acquire);
                    if k == key {
                        return entry.value.load(Ordering::Acquire);
                    }
                    if k == EMPTY_KEY {
                        break;
                    }
                    slot = (slot + 1) & mask;
                }
                generation = g.prev;
            }
            null_mut()
        }
    }

    /// Registers `value` under `key`, or reports the value already there.
    /// Grows (and retries) when the current generation passes 50% load or
    /// the probe sequence finds no free slot.
    pub(crate) fn get_or_add(&self, key: usize, value: *mut V) -> InsertResult<V> {
        assert!(
            key != EMPTY_KEY && key != INVALID_THREAD_ID,
            "thread id collides with a reserved hash key"
        );
        unsafe {
            loop {
                let generation = self.current.load(Ordering::Acquire);
                let g = &*generation;
                if (self.count.load(Ordering::Relaxed) + 1) * 2 > g.capacity {
                    self.grow(generation);
                    continue;
                }

                let mask = g.capacity - 1;
                let mut slot = hash_id(key) & mask;
                let mut probes = 0;
                loop {
                    if probes == g.capacity {
                        break;
                    }
                    let entry = &*g.entries.add(slot);
                    match entry.key.compare_exchange(
                        EMPTY_KEY,
                        key,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            self.count.fetch_add(1, Ordering::Relaxed);
                            entry.value.store(value, Ordering::Release);
                            return InsertResult::Added;
                        }
                        Err(existing) if existing == key => {
                            let current = entry.value.load(Ordering::Acquire);
                            if current.is_null() {
                                entry.value.store(value, Ordering::Release);
                                return InsertResult::Added;
                            }
                            return InsertResult::Got(current);
                        }
                        Err(_) => {
                            probes += 1;
                            slot = (slot + 1) & mask;
                        }
                    }
                }
                self.grow(generation);
            }
        }
    }

    // Installs a generation of double capacity chained to `seen`; the loser
    // of a concurrent race frees its attempt.
    fn grow(&self, seen: *mut Generation<V>) {
        unsafe {
            let fresh = Self::new_generation((*seen).capacity * 2, seen);
            if self
                .current
                .compare_exchange(seen, fresh, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                    (*fresh).entries,
                    (*fresh).capacity,
                )));
                drop(Box::from_raw(fresh));
            }
        }
    }
}

impl<V> Drop for IdHashTable<V> {
    fn drop(&mut self) {
        unsafe {
            let mut generation = self.current.load(Ordering::Relaxed);
            while !generation.is_null() {
                let prev = (*generation).prev;
                drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                    (*generation).entries,
                    (*generation).capacity,
                )));
                drop(Box::from_raw(generation));
                generation = prev;
            }
        }
    }
}
