use std::cell::UnsafeCell;
use std::mem;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::ptr::{self, null_mut, NonNull};
use std::sync::atomic::{fence, AtomicPtr, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use crate::block::{Block, CounterPolicy};
use crate::block_manager::{AllocMode, BlockManager};
use crate::utils::{ceil_to_pow2, circular_less_than};

pub(crate) type ImplicitBlock<T, const B: usize> = Block<T, B, CounterPolicy<B>>;

// Key 1 can never be a real block base (bases are multiples of B >= 2).
const INVALID_BLOCK_BASE: usize = 1;

// Keyed by the base tail index of the block; the slot is reusable once a
// consumer has released the block and cleared `value`.
struct ImplicitEntry<T, const B: usize> {
    key: AtomicUsize,
    value: AtomicPtr<ImplicitBlock<T, B>>,
}

// Double layout: `entries` owns entry objects, `index` maps slots to
// entries. Growth copies only `index` and appends a fresh `entries` batch at
// the high half, so live entry pointers stay valid across generations.
struct ImplicitIndexArray<T, const B: usize> {
    size: usize,
    tail: AtomicUsize,
    entries: *mut ImplicitEntry<T, B>,
    entries_len: usize,
    index: *mut *mut ImplicitEntry<T, B>,
    prev: *mut ImplicitIndexArray<T, B>,
}

struct ProducerScratch<T, const B: usize> {
    entries_size: usize,
    tail_block: *mut ImplicitBlock<T, B>,
}

/// Slow single-producer / multi-consumer engine for thread-keyed producers.
///
/// Unlike the fast engine there is no block ring: each block is found
/// through its index entry, and the consumer that empties a block (counter
/// transition) clears the entry and returns the block to the manager.
pub(crate) struct ImplicitProducer<T, const B: usize> {
    tail_index: CachePadded<AtomicUsize>,
    head_index: CachePadded<AtomicUsize>,
    dequeue_attempts: AtomicUsize,
    dequeue_failures: AtomicUsize,
    index: AtomicPtr<ImplicitIndexArray<T, B>>,
    scratch: UnsafeCell<ProducerScratch<T, B>>,
    manager: NonNull<BlockManager<T, B, CounterPolicy<B>>>,
}

unsafe impl<T: Send, const B: usize> Send for ImplicitProducer<T, B> {}
unsafe impl<T: Send, const B: usize> Sync for ImplicitProducer<T, B> {}

impl<T, const B: usize> ImplicitProducer<T, B> {
    const LOG2: usize = B.trailing_zeros() as usize;

    pub(crate) fn new(
        initial_size: usize,
        manager: NonNull<BlockManager<T, B, CounterPolicy<B>>>,
    ) -> Self {
        let mut initial = ceil_to_pow2(initial_size) >> 1;
        if initial < 2 {
            initial = 2;
        }
        let producer = ImplicitProducer {
            tail_index: CachePadded::new(AtomicUsize::new(0)),
            head_index: CachePadded::new(AtomicUsize::new(0)),
            dequeue_attempts: AtomicUsize::new(0),
            dequeue_failures: AtomicUsize::new(0),
            index: AtomicPtr::new(null_mut()),
            scratch: UnsafeCell::new(ProducerScratch {
                entries_size: initial,
                tail_block: null_mut(),
            }),
            manager,
        };
        unsafe {
            producer.create_new_index_array(&mut *producer.scratch.get());
        }
        producer
    }

    #[inline]
    fn manager(&self) -> &BlockManager<T, B, CounterPolicy<B>> {
        unsafe { self.manager.as_ref() }
    }

    pub(crate) fn enqueue(&self, mode: AllocMode, value: T) -> Result<(), T> {
        unsafe {
            let s = &mut *self.scratch.get();
            let current_tail = self.tail_index.load(Ordering::Relaxed);
            let inner = current_tail & (B - 1);
            if inner == 0 {
                if !circular_less_than(
                    self.head_index.load(Ordering::Relaxed),
                    current_tail.wrapping_add(B),
                ) {
                    return Err(value);
                }

                // Claim an index slot before touching the manager so a
                // failed requisition publishes nothing.
                let entry = self.insert_block_index_entry(s, mode, current_tail);
                if entry.is_null() {
                    return Err(value);
                }
                let new_block = self.manager().requisition_block(mode);
                if new_block.is_null() {
                    self.rewind_index_tail();
                    (*entry).value.store(null_mut(), Ordering::Relaxed);
                    return Err(value);
                }
                (*new_block).reset();
                (*entry).value.store(new_block, Ordering::Relaxed);
                s.tail_block = new_block;
            }

            ptr::write((*s.tail_block).slot(inner), value);
            self.tail_index
                .store(current_tail.wrapping_add(1), Ordering::Release);
            Ok(())
        }
    }

    /// Bulk enqueue of exactly `count` items. Any failure or iterator panic
    /// rolls back completely: entries cleared, the whole fresh-block chain
    /// returned to the manager, `tail_index` untouched.
    pub(crate) fn enqueue_bulk<I>(&self, mode: AllocMode, mut items: I, count: usize) -> bool
    where
        I: Iterator<Item = T>,
    {
        if count == 0 {
            return true;
        }
        unsafe {
            let s = &mut *self.scratch.get();
            let origin_tail = self.tail_index.load(Ordering::Relaxed);
            let origin_block = s.tail_block;
            let mut first_allocated: *mut ImplicitBlock<T, B> = null_mut();

            let mut need = origin_tail
                .wrapping_add(count)
                .wrapping_sub(1)
                .wrapping_shr(Self::LOG2 as u32)
                .wrapping_sub(((origin_tail.wrapping_sub(1) as isize) >> Self::LOG2) as usize);
            let mut current_base = origin_tail.wrapping_sub(1) & !(B - 1);

            while need > 0 {
                need -= 1;
                current_base = current_base.wrapping_add(B);

                if !circular_less_than(
                    self.head_index.load(Ordering::Relaxed),
                    current_base.wrapping_add(B),
                ) {
                    self.bulk_roll_back(s, origin_tail, origin_block, first_allocated);
                    return false;
                }
                let entry = self.insert_block_index_entry(s, mode, current_base);
                if entry.is_null() {
                    self.bulk_roll_back(s, origin_tail, origin_block, first_allocated);
                    return false;
                }
                let new_block = self.manager().requisition_block(mode);
                if new_block.is_null() {
                    self.rewind_index_tail();
                    (*entry).value.store(null_mut(), Ordering::Relaxed);
                    self.bulk_roll_back(s, origin_tail, origin_block, first_allocated);
                    return false;
                }
                (*new_block).reset();
                (*new_block).next.store(null_mut(), Ordering::Relaxed);
                (*entry).value.store(new_block, Ordering::Relaxed);
                if origin_tail & (B - 1) != 0 || !first_allocated.is_null() {
                    (*s.tail_block).next.store(new_block, Ordering::Relaxed);
                }
                s.tail_block = new_block;
                if first_allocated.is_null() {
                    first_allocated = new_block;
                }
            }

            let start_inner = origin_tail & (B - 1);
            let fill_start_block = if start_inner == 0 && !first_allocated.is_null() {
                first_allocated
            } else {
                origin_block
            };
            let tail_block = s.tail_block;

            let mut written = 0usize;
            let fill = {
                let written = &mut written;
                catch_unwind(AssertUnwindSafe(move || {
                    let mut block = fill_start_block;
                    let mut inner = start_inner;
                    loop {
                        let end_inner = if block == tail_block {
                            (origin_tail.wrapping_add(count).wrapping_sub(1) & (B - 1)) + 1
                        } else {
                            B
                        };
                        while inner < end_inner {
                            let value = match items.next() {
                                Some(value) => value,
                                None => panic!("iterator yielded fewer items than reported"),
                            };
                            ptr::write((*block).slot(inner), value);
                            inner += 1;
                            *written += 1;
                        }
                        if block == tail_block {
                            break;
                        }
                        block = (*block).next.load(Ordering::Relaxed);
                        inner = 0;
                    }
                }))
            };

            if let Err(payload) = fill {
                if mem::needs_drop::<T>() {
                    let mut block = fill_start_block;
                    let mut inner = start_inner;
                    for _ in 0..written {
                        ptr::drop_in_place((*block).slot(inner));
                        inner += 1;
                        if inner == B {
                            inner = 0;
                            block = (*block).next.load(Ordering::Relaxed);
                        }
                    }
                }
                self.bulk_roll_back(s, origin_tail, origin_block, first_allocated);
                resume_unwind(payload);
            }

            self.tail_index
                .store(origin_tail.wrapping_add(count), Ordering::Release);
            true
        }
    }

    pub(crate) fn dequeue(&self) -> Option<T> {
        let failures = self.dequeue_failures.load(Ordering::Relaxed);
        if circular_less_than(
            self.dequeue_attempts
                .load(Ordering::Relaxed)
                .wrapping_sub(failures),
            self.tail_index.load(Ordering::Relaxed),
        ) {
            fence(Ordering::Acquire);

            let attempts = self.dequeue_attempts.fetch_add(1, Ordering::Relaxed);
            if circular_less_than(
                attempts.wrapping_sub(failures),
                self.tail_index.load(Ordering::Acquire),
            ) {
                let index = self.head_index.fetch_add(1, Ordering::Relaxed);
                let inner = index & (B - 1);

                unsafe {
                    let entry = self.entry_for_index(index);
                    let block = (*entry).value.load(Ordering::Relaxed);
                    let value = ptr::read((*block).slot(inner));

                    if (*block).set_empty(inner) {
                        // Last slot drained: release the block. Clearing the
                        // entry first frees its slot for reuse.
                        (*entry).value.store(null_mut(), Ordering::Relaxed);
                        self.manager().return_block(block);
                    }
                    return Some(value);
                }
            }

            self.dequeue_failures.fetch_add(1, Ordering::Release);
        }
        None
    }

    pub(crate) fn dequeue_bulk(&self, dest: &mut Vec<T>, max: usize) -> usize {
        let failures = self.dequeue_failures.load(Ordering::Relaxed);
        let desired = self.tail_index.load(Ordering::Relaxed).wrapping_sub(
            self.dequeue_attempts
                .load(Ordering::Relaxed)
                .wrapping_sub(failures),
        );
        if circular_less_than(0, desired) {
            let desired = desired.min(max);
            fence(Ordering::Acquire);

            let attempts = self.dequeue_attempts.fetch_add(desired, Ordering::Relaxed);
            let actual = self
                .tail_index
                .load(Ordering::Acquire)
                .wrapping_sub(attempts.wrapping_sub(failures));
            if circular_less_than(0, actual) {
                let actual = actual.min(desired);
                if actual < desired {
                    self.dequeue_failures
                        .fetch_add(desired - actual, Ordering::Release);
                }

                let first = self.head_index.fetch_add(actual, Ordering::Relaxed);
                unsafe {
                    let (array, mut slot) = self.index_slot_for(first);
                    let mut start = first & (B - 1);
                    let mut remaining = actual;
                    while remaining != 0 {
                        let entry = *(*array).index.add(slot);
                        let block = (*entry).value.load(Ordering::Relaxed);
                        let end = if remaining > B - start { B } else { start + remaining };
                        for i in start..end {
                            dest.push(ptr::read((*block).slot(i)));
                        }
                        remaining -= end - start;
                        if (*block).set_some_empty(start, end - start) {
                            (*entry).value.store(null_mut(), Ordering::Relaxed);
                            self.manager().return_block(block);
                        }
                        start = 0;
                        slot = (slot + 1) & ((*array).size - 1);
                    }
                }
                return actual;
            }

            self.dequeue_failures.fetch_add(desired, Ordering::Release);
        }
        0
    }

    pub(crate) fn size_approx(&self) -> usize {
        let tail = self.tail_index.load(Ordering::Relaxed);
        let head = self.head_index.load(Ordering::Relaxed);
        if circular_less_than(head, tail) {
            tail.wrapping_sub(head)
        } else {
            0
        }
    }

    // Reserves the slot after the current index tail for a block starting at
    // `block_start`, growing the array if the slot is still occupied.
    unsafe fn insert_block_index_entry(
        &self,
        s: &mut ProducerScratch<T, B>,
        mode: AllocMode,
        block_start: usize,
    ) -> *mut ImplicitEntry<T, B> {
        let array = &*self.index.load(Ordering::Relaxed);
        let new_tail = (array.tail.load(Ordering::Relaxed) + 1) & (array.size - 1);
        let entry = *array.index.add(new_tail);
        if (*entry).key.load(Ordering::Relaxed) == INVALID_BLOCK_BASE
            || (*entry).value.load(Ordering::Relaxed).is_null()
        {
            (*entry).key.store(block_start, Ordering::Relaxed);
            array.tail.store(new_tail, Ordering::Release);
            return entry;
        }

        if mode == AllocMode::CannotAlloc {
            return null_mut();
        }
        self.create_new_index_array(s);
        let array = &*self.index.load(Ordering::Relaxed);
        let new_tail = (array.tail.load(Ordering::Relaxed) + 1) & (array.size - 1);
        let entry = *array.index.add(new_tail);
        (*entry).key.store(block_start, Ordering::Relaxed);
        array.tail.store(new_tail, Ordering::Release);
        entry
    }

    fn rewind_index_tail(&self) {
        unsafe {
            let array = &*self.index.load(Ordering::Relaxed);
            array.tail.store(
                array.tail.load(Ordering::Relaxed).wrapping_sub(1) & (array.size - 1),
                Ordering::Relaxed,
            );
        }
    }

    unsafe fn index_slot_for(&self, index: usize) -> (*mut ImplicitIndexArray<T, B>, usize) {
        let array = self.index.load(Ordering::Acquire);
        let a = &*array;
        let tail = a.tail.load(Ordering::Acquire);
        let tail_base = (**a.index.add(tail)).key.load(Ordering::Relaxed);
        let offset = (index & !(B - 1)).wrapping_sub(tail_base) >> Self::LOG2;
        (array, tail.wrapping_add(offset) & (a.size - 1))
    }

    unsafe fn entry_for_index(&self, index: usize) -> *mut ImplicitEntry<T, B> {
        let (array, slot) = self.index_slot_for(index);
        *(*array).index.add(slot)
    }

    // Undo a partially set-up bulk enqueue: clear every entry inserted for
    // the fresh chain (rewinding the tail each time) and hand the chain back
    // to the manager.
    unsafe fn bulk_roll_back(
        &self,
        s: &mut ProducerScratch<T, B>,
        origin_tail: usize,
        origin_block: *mut ImplicitBlock<T, B>,
        first_allocated: *mut ImplicitBlock<T, B>,
    ) {
        let mut current_base = origin_tail.wrapping_sub(1) & !(B - 1);
        let mut block = first_allocated;
        while !block.is_null() {
            current_base = current_base.wrapping_add(B);
            let entry = self.entry_for_index(current_base);
            (*entry).value.store(null_mut(), Ordering::Relaxed);
            self.rewind_index_tail();
            block = (*block).next.load(Ordering::Relaxed);
        }
        self.manager().return_blocks(first_allocated);
        s.tail_block = origin_block;
    }

    // Double the index: copy the live pointer window oldest-first, then fill
    // the high half with pointers to a fresh entries batch.
    unsafe fn create_new_index_array(&self, s: &mut ProducerScratch<T, B>) {
        let prev = self.index.load(Ordering::Relaxed);
        s.entries_size <<= 1;
        let new_size = s.entries_size;
        let prev_size = if prev.is_null() { 0 } else { (*prev).size };
        let entry_count = if prev.is_null() { new_size } else { prev_size };

        let entries: Vec<ImplicitEntry<T, B>> = (0..entry_count)
            .map(|_| ImplicitEntry {
                key: AtomicUsize::new(INVALID_BLOCK_BASE),
                value: AtomicPtr::new(null_mut()),
            })
            .collect();
        let entries = Box::into_raw(entries.into_boxed_slice()) as *mut ImplicitEntry<T, B>;

        let mut index: Vec<*mut ImplicitEntry<T, B>> = Vec::with_capacity(new_size);
        if !prev.is_null() {
            let p = &*prev;
            let tail = p.tail.load(Ordering::Relaxed);
            let mut i = tail;
            loop {
                i = (i + 1) & (prev_size - 1);
                index.push(*p.index.add(i));
                if i == tail {
                    break;
                }
            }
        }
        for k in 0..entry_count {
            index.push(entries.add(k));
        }
        debug_assert_eq!(index.len(), new_size);
        let index = Box::into_raw(index.into_boxed_slice()) as *mut *mut ImplicitEntry<T, B>;

        let array = Box::into_raw(Box::new(ImplicitIndexArray {
            size: new_size,
            tail: AtomicUsize::new(prev_size.wrapping_sub(1) & (new_size - 1)),
            entries,
            entries_len: entry_count,
            index,
            prev,
        }));
        self.index.store(array, Ordering::Release);
    }
}

impl<T, const B: usize> Drop for ImplicitProducer<T, B> {
    fn drop(&mut self) {
        unsafe {
            let s = &mut *self.scratch.get();
            let mut index = self.head_index.load(Ordering::Relaxed);
            let tail = self.tail_index.load(Ordering::Relaxed);

            // Destroy the remaining elements and release each block at its
            // last slot; a partially filled tail block is released after.
            let mut block: *mut ImplicitBlock<T, B> = null_mut();
            while index != tail {
                let inner = index & (B - 1);
                if inner == 0 || block.is_null() {
                    block = (*self.entry_for_index(index)).value.load(Ordering::Relaxed);
                }
                if mem::needs_drop::<T>() {
                    ptr::drop_in_place((*block).slot(inner));
                }
                if inner == B - 1 {
                    self.manager().return_block(block);
                }
                index = index.wrapping_add(1);
            }
            if tail & (B - 1) != 0 && !s.tail_block.is_null() {
                self.manager().return_block(s.tail_block);
            }

            let mut array = self.index.load(Ordering::Relaxed);
            while !array.is_null() {
                let prev = (*array).prev;
                drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
                    (*array).entries,
                    (*array).entries_len,
                )));
                drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
                    (*array).index,
                    (*array).size,
                )));
                drop(Box::from_raw(array));
                array = prev;
            }
        }
    }
}
