use std::cell::UnsafeCell;
use std::mem;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::ptr::{self, null_mut, NonNull};
use std::sync::atomic::{fence, AtomicPtr, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use crate::block::{Block, FlagsPolicy};
use crate::block_manager::{AllocMode, BlockManager};
use crate::utils::{ceil_to_pow2, circular_less_than};

pub(crate) type ExplicitBlock<T, const B: usize> = Block<T, B, FlagsPolicy<B>>;

// (base tail index, block) pair; valid until overwritten. Producer writes
// are relaxed and become visible through the array tail's release store.
struct IndexEntry<T, const B: usize> {
    base: AtomicUsize,
    block: AtomicPtr<ExplicitBlock<T, B>>,
}

// Power-of-two entry array that grows by copy; old generations are kept
// alive (chained through `prev`) until the engine drops, so consumers can
// keep using a stale pointer.
struct IndexEntryArray<T, const B: usize> {
    size: usize,
    tail: AtomicUsize,
    entries: *mut IndexEntry<T, B>,
    entries_len: usize,
    prev: *mut IndexEntryArray<T, B>,
}

// Producer-only state; consumers never touch it.
struct ProducerScratch<T, const B: usize> {
    entries_used: usize,
    entries_size: usize,
    next_entry: usize,
    prev_entries: *mut IndexEntry<T, B>,
    tail_block: *mut ExplicitBlock<T, B>,
}

/// Fast single-producer / multi-consumer engine.
///
/// In-use blocks form a circular list through `Block::next`; the index
/// entry array maps tail-index space onto blocks for consumers. Blocks are
/// only reused in place once fully drained (flags policy) and never leave
/// the ring until the engine drops.
pub(crate) struct ExplicitProducer<T, const B: usize> {
    tail_index: CachePadded<AtomicUsize>,
    head_index: CachePadded<AtomicUsize>,
    dequeue_attempts: AtomicUsize,
    dequeue_failures: AtomicUsize,
    index: AtomicPtr<IndexEntryArray<T, B>>,
    scratch: UnsafeCell<ProducerScratch<T, B>>,
    manager: NonNull<BlockManager<T, B, FlagsPolicy<B>>>,
}

unsafe impl<T: Send, const B: usize> Send for ExplicitProducer<T, B> {}
unsafe impl<T: Send, const B: usize> Sync for ExplicitProducer<T, B> {}

impl<T, const B: usize> ExplicitProducer<T, B> {
    const LOG2: usize = B.trailing_zeros() as usize;

    pub(crate) fn new(
        initial_size: usize,
        manager: NonNull<BlockManager<T, B, FlagsPolicy<B>>>,
    ) -> Self {
        let mut initial = ceil_to_pow2(initial_size) >> 1;
        if initial < 2 {
            initial = 2;
        }
        let producer = ExplicitProducer {
            tail_index: CachePadded::new(AtomicUsize::new(0)),
            head_index: CachePadded::new(AtomicUsize::new(0)),
            dequeue_attempts: AtomicUsize::new(0),
            dequeue_failures: AtomicUsize::new(0),
            index: AtomicPtr::new(null_mut()),
            scratch: UnsafeCell::new(ProducerScratch {
                entries_used: 0,
                entries_size: initial,
                next_entry: 0,
                prev_entries: null_mut(),
                tail_block: null_mut(),
            }),
            manager,
        };
        unsafe {
            producer.create_new_index_array(&mut *producer.scratch.get(), 0);
        }
        producer
    }

    #[inline]
    fn manager(&self) -> &BlockManager<T, B, FlagsPolicy<B>> {
        unsafe { self.manager.as_ref() }
    }

    /// Single-producer enqueue. Returns the value on failure so the caller
    /// can hand it back.
    pub(crate) fn enqueue(&self, mode: AllocMode, value: T) -> Result<(), T> {
        unsafe {
            let s = &mut *self.scratch.get();
            let current_tail = self.tail_index.load(Ordering::Relaxed);
            let inner = current_tail & (B - 1);
            if inner == 0 {
                // Block boundary: reuse the next ring block if it drained,
                // otherwise requisition a fresh one.
                let reusable = !s.tail_block.is_null()
                    && (*(*s.tail_block).next.load(Ordering::Relaxed)).is_empty();
                if reusable {
                    let next = (*s.tail_block).next.load(Ordering::Relaxed);
                    s.tail_block = next;
                    (*next).reset();
                } else {
                    if !circular_less_than(
                        self.head_index.load(Ordering::Relaxed),
                        current_tail.wrapping_add(B),
                    ) {
                        return Err(value);
                    }
                    if s.entries_used == s.entries_size {
                        if mode == AllocMode::CannotAlloc {
                            return Err(value);
                        }
                        let filled = s.entries_used;
                        self.create_new_index_array(s, filled);
                    }
                    let new_block = self.manager().requisition_block(mode);
                    if new_block.is_null() {
                        return Err(value);
                    }
                    (*new_block).reset();
                    if s.tail_block.is_null() {
                        (*new_block).next.store(new_block, Ordering::Relaxed);
                    } else {
                        (*new_block)
                            .next
                            .store((*s.tail_block).next.load(Ordering::Relaxed), Ordering::Relaxed);
                        (*s.tail_block).next.store(new_block, Ordering::Relaxed);
                    }
                    s.tail_block = new_block;
                    s.entries_used += 1;
                }

                let array = &*self.index.load(Ordering::Relaxed);
                let entry = &*array.entries.add(s.next_entry);
                entry.base.store(current_tail, Ordering::Relaxed);
                entry.block.store(s.tail_block, Ordering::Relaxed);
                array.tail.store(s.next_entry, Ordering::Release);
                s.next_entry = (s.next_entry + 1) & (array.size - 1);
            }

            ptr::write((*s.tail_block).slot(inner), value);
            self.tail_index
                .store(current_tail.wrapping_add(1), Ordering::Release);
            Ok(())
        }
    }

    /// Bulk enqueue of exactly `count` items. A panic out of the iterator
    /// rolls everything back (values dropped, fresh blocks left empty in the
    /// ring for later reuse) before propagating.
    pub(crate) fn enqueue_bulk<I>(&self, mode: AllocMode, mut items: I, count: usize) -> bool
    where
        I: Iterator<Item = T>,
    {
        if count == 0 {
            return true;
        }
        unsafe {
            let s = &mut *self.scratch.get();
            let origin_entries_used = s.entries_used;
            let mut origin_next_entry = s.next_entry;
            let start_block = s.tail_block;
            let start_tail = self.tail_index.load(Ordering::Relaxed);
            let mut first_allocated: *mut ExplicitBlock<T, B> = null_mut();

            let mut need = start_tail
                .wrapping_add(count)
                .wrapping_sub(1)
                .wrapping_shr(Self::LOG2 as u32)
                .wrapping_sub(((start_tail.wrapping_sub(1) as isize) >> Self::LOG2) as usize);
            let mut current_base = start_tail.wrapping_sub(1) & !(B - 1);

            // First drain the reusable stretch of the ring.
            while need > 0 && !s.tail_block.is_null() {
                let next = (*s.tail_block).next.load(Ordering::Relaxed);
                if !(*next).is_empty() {
                    break;
                }
                need -= 1;
                current_base = current_base.wrapping_add(B);
                s.tail_block = next;
                if first_allocated.is_null() {
                    first_allocated = next;
                }
                (*next).reset();

                let array = &*self.index.load(Ordering::Relaxed);
                let entry = &*array.entries.add(s.next_entry);
                entry.base.store(current_base, Ordering::Relaxed);
                entry.block.store(next, Ordering::Relaxed);
                s.next_entry = (s.next_entry + 1) & (array.size - 1);
            }

            while need > 0 {
                need -= 1;
                current_base = current_base.wrapping_add(B);

                if !circular_less_than(
                    self.head_index.load(Ordering::Relaxed),
                    current_base.wrapping_add(B),
                ) {
                    self.abandon_bulk_blocks(first_allocated, s.tail_block);
                    s.next_entry = origin_next_entry;
                    s.tail_block = start_block;
                    return false;
                }
                if s.entries_used == s.entries_size {
                    if mode == AllocMode::CannotAlloc {
                        self.abandon_bulk_blocks(first_allocated, s.tail_block);
                        s.next_entry = origin_next_entry;
                        s.tail_block = start_block;
                        return false;
                    }
                    self.create_new_index_array(s, origin_entries_used);
                    origin_next_entry = origin_entries_used;
                }
                let new_block = self.manager().requisition_block(mode);
                if new_block.is_null() {
                    self.abandon_bulk_blocks(first_allocated, s.tail_block);
                    s.next_entry = origin_next_entry;
                    s.tail_block = start_block;
                    return false;
                }
                (*new_block).reset();
                if s.tail_block.is_null() {
                    (*new_block).next.store(new_block, Ordering::Relaxed);
                } else {
                    (*new_block)
                        .next
                        .store((*s.tail_block).next.load(Ordering::Relaxed), Ordering::Relaxed);
                    (*s.tail_block).next.store(new_block, Ordering::Relaxed);
                }
                s.tail_block = new_block;
                if first_allocated.is_null() {
                    first_allocated = new_block;
                }
                s.entries_used += 1;

                let array = &*self.index.load(Ordering::Relaxed);
                let entry = &*array.entries.add(s.next_entry);
                entry.base.store(current_base, Ordering::Relaxed);
                entry.block.store(new_block, Ordering::Relaxed);
                s.next_entry = (s.next_entry + 1) & (array.size - 1);
            }

            // Every needed block is in place; move the items in.
            let start_inner = start_tail & (B - 1);
            let fill_start_block = if start_inner == 0 && !first_allocated.is_null() {
                first_allocated
            } else {
                start_block
            };
            let tail_block = s.tail_block;
            let end_next_entry = s.next_entry;

            let mut written = 0usize;
            let fill = {
                let written = &mut written;
                catch_unwind(AssertUnwindSafe(move || {
                    let mut block = fill_start_block;
                    let mut inner = start_inner;
                    loop {
                        let end_inner = if block == tail_block {
                            (start_tail.wrapping_add(count).wrapping_sub(1) & (B - 1)) + 1
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
                // Fresh blocks stay spliced in the ring but must read as
                // drained so later enqueues can reuse them.
                self.abandon_bulk_blocks(first_allocated, tail_block);
                s.next_entry = origin_next_entry;
                s.tail_block = start_block;

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
                resume_unwind(payload);
            }

            if !first_allocated.is_null() {
                let array = &*self.index.load(Ordering::Relaxed);
                array.tail.store(
                    end_next_entry.wrapping_sub(1) & (array.size - 1),
                    Ordering::Release,
                );
            }
            self.tail_index
                .store(start_tail.wrapping_add(count), Ordering::Release);
            true
        }
    }

    /// Multi-consumer dequeue, racing on the attempts counter.
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
                // An element is guaranteed for us; claim its index.
                let index = self.head_index.fetch_add(1, Ordering::Relaxed);
                let inner = index & (B - 1);

                unsafe {
                    let array = &*self.index.load(Ordering::Acquire);
                    let ie_index = array.tail.load(Ordering::Acquire);
                    let tail_base = (*array.entries.add(ie_index)).base.load(Ordering::Relaxed);
                    let block_base = index & !(B - 1);
                    // Both bases are multiples of B, so the wrapping
                    // difference shifts down exactly.
                    let offset = block_base.wrapping_sub(tail_base) >> Self::LOG2;
                    let block = (*array
                        .entries
                        .add(ie_index.wrapping_add(offset) & (array.size - 1)))
                    .block
                    .load(Ordering::Relaxed);

                    let value = ptr::read((*block).slot(inner));
                    (*block).set_empty(inner);
                    return Some(value);
                }
            }

            self.dequeue_failures.fetch_add(1, Ordering::Release);
        }
        None
    }

    /// Dequeues up to `max` elements into `dest`; returns how many.
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
                    let array = &*self.index.load(Ordering::Acquire);
                    let ie_index = array.tail.load(Ordering::Acquire);
                    let tail_base = (*array.entries.add(ie_index)).base.load(Ordering::Relaxed);
                    let block_base = first & !(B - 1);
                    let offset = block_base.wrapping_sub(tail_base) >> Self::LOG2;
                    let mut block = (*array
                        .entries
                        .add(ie_index.wrapping_add(offset) & (array.size - 1)))
                    .block
                    .load(Ordering::Relaxed);

                    let mut start = first & (B - 1);
                    let mut remaining = actual;
                    while remaining != 0 {
                        let end = if remaining > B - start { B } else { start + remaining };
                        for i in start..end {
                            dest.push(ptr::read((*block).slot(i)));
                        }
                        remaining -= end - start;
                        let next = (*block).next.load(Ordering::Relaxed);
                        (*block).set_some_empty(start, end - start);
                        block = next;
                        start = 0;
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

    // Leave blocks touched by an aborted bulk enqueue in the ring, but
    // reading as fully drained so the destructor skips them and later
    // enqueues can reuse them.
    unsafe fn abandon_bulk_blocks(
        &self,
        first: *mut ExplicitBlock<T, B>,
        last: *mut ExplicitBlock<T, B>,
    ) {
        if first.is_null() {
            return;
        }
        let mut block = first;
        loop {
            (*block).set_all_empty();
            if block == last {
                break;
            }
            block = (*block).next.load(Ordering::Relaxed);
        }
    }

    // Doubles the entry array, compacting live entries oldest-first into the
    // new generation. `filled_slot` is the number of already published
    // entries; the new tail points at the last of them.
    unsafe fn create_new_index_array(&self, s: &mut ProducerScratch<T, B>, filled_slot: usize) {
        let size_mask = s.entries_size - 1;
        s.entries_size <<= 1;

        let entries: Vec<IndexEntry<T, B>> = (0..s.entries_size)
            .map(|_| IndexEntry {
                base: AtomicUsize::new(0),
                block: AtomicPtr::new(null_mut()),
            })
            .collect();
        let entries = Box::into_raw(entries.into_boxed_slice()) as *mut IndexEntry<T, B>;

        let mut j = 0;
        if s.entries_used != 0 {
            let mut i = s.next_entry.wrapping_sub(s.entries_used) & size_mask;
            loop {
                let src = &*s.prev_entries.add(i);
                let dst = &*entries.add(j);
                dst.base.store(src.base.load(Ordering::Relaxed), Ordering::Relaxed);
                dst.block
                    .store(src.block.load(Ordering::Relaxed), Ordering::Relaxed);
                j += 1;
                i = (i + 1) & size_mask;
                if i == s.next_entry {
                    break;
                }
            }
        }

        let array = Box::into_raw(Box::new(IndexEntryArray {
            size: s.entries_size,
            tail: AtomicUsize::new(filled_slot.wrapping_sub(1) & (s.entries_size - 1)),
            entries,
            entries_len: s.entries_size,
            prev: self.index.load(Ordering::Relaxed),
        }));
        s.next_entry = j;
        s.prev_entries = entries;
        self.index.store(array, Ordering::Release);
    }
}

impl<T, const B: usize> Drop for ExplicitProducer<T, B> {
    fn drop(&mut self) {
        unsafe {
            let s = &mut *self.scratch.get();
            if !s.tail_block.is_null() {
                let head = self.head_index.load(Ordering::Relaxed);

                // Locate the block that is only partially dequeued, if any.
                let mut half_dequeued: *mut ExplicitBlock<T, B> = null_mut();
                if head & (B - 1) != 0 {
                    let mask = s.entries_size - 1;
                    let mut i = s.next_entry.wrapping_sub(s.entries_used) & mask;
                    while circular_less_than(
                        (*s.prev_entries.add(i))
                            .base
                            .load(Ordering::Relaxed)
                            .wrapping_add(B),
                        head,
                    ) {
                        i = (i + 1) & mask;
                    }
                    half_dequeued = (*s.prev_entries.add(i)).block.load(Ordering::Relaxed);
                }

                if mem::needs_drop::<T>() {
                    let tail_inner = self.tail_index.load(Ordering::Relaxed) & (B - 1);
                    let last_index = if tail_inner == 0 { B } else { tail_inner };
                    let mut block = s.tail_block;
                    loop {
                        block = (*block).next.load(Ordering::Relaxed);
                        if !(*block).is_empty() {
                            let mut i = if block == half_dequeued { head & (B - 1) } else { 0 };
                            while i != B && (block != s.tail_block || i != last_index) {
                                ptr::drop_in_place((*block).slot(i));
                                i += 1;
                            }
                        }
                        if block == s.tail_block {
                            break;
                        }
                    }
                }

                let mut block = s.tail_block;
                loop {
                    let next = (*block).next.load(Ordering::Relaxed);
                    self.manager().return_block(block);
                    if next == s.tail_block {
                        break;
                    }
                    block = next;
                }
            }

            let mut array = self.index.load(Ordering::Relaxed);
            while !array.is_null() {
                let prev = (*array).prev;
                drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
                    (*array).entries,
                    (*array).entries_len,
                )));
                drop(Box::from_raw(array));
                array = prev;
            }
        }
    }
}
