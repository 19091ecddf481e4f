use std::array;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr::null_mut;
use std::sync::atomic::{fence, AtomicPtr, AtomicU32, AtomicU8, AtomicUsize, Ordering};

use crate::free_list::FreeListNode;

/// Per-slot emptiness tracking for a block of `B` slots.
///
/// Producers may only write slots the policy reports empty; consumers mark
/// slots empty with release ordering after moving the value out. The two
/// implementations trade detection granularity against a well-defined
/// release instant: `FlagsPolicy` can tell which slots are empty (the fast
/// engine reuses blocks in place), `CounterPolicy` only knows when the whole
/// block drained (the slow engine releases blocks on that transition).
pub trait SlotPolicy: Default {
    /// Whether `set_empty`'s return value reports the fully-empty transition.
    const MEANINGFUL_SET_RESULT: bool;

    fn is_empty(&self) -> bool;
    fn set_empty(&self, index: usize) -> bool;
    fn set_some_empty(&self, index: usize, count: usize) -> bool;
    fn set_all_empty(&self);
    fn reset(&self);
}

/// One atomic flag per slot; a block is empty iff every flag is set.
pub struct FlagsPolicy<const B: usize> {
    flags: [AtomicU8; B],
}

impl<const B: usize> Default for FlagsPolicy<B> {
    fn default() -> Self {
        FlagsPolicy {
            flags: array::from_fn(|_| AtomicU8::new(0)),
        }
    }
}

impl<const B: usize> SlotPolicy for FlagsPolicy<B> {
    const MEANINGFUL_SET_RESULT: bool = false;

    fn is_empty(&self) -> bool {
        for flag in &self.flags {
            if flag.load(Ordering::Relaxed) == 0 {
                return false;
            }
        }
        // Synchronizes with the release stores of set_empty/set_some_empty.
        fence(Ordering::Acquire);
        true
    }

    fn set_empty(&self, index: usize) -> bool {
        self.flags[index].store(1, Ordering::Release);
        false
    }

    fn set_some_empty(&self, index: usize, count: usize) -> bool {
        fence(Ordering::Release);
        for i in 0..count {
            self.flags[index + i].store(1, Ordering::Relaxed);
        }
        false
    }

    fn set_all_empty(&self) {
        for flag in &self.flags {
            flag.store(1, Ordering::Release);
        }
    }

    fn reset(&self) {
        for flag in &self.flags {
            flag.store(0, Ordering::Release);
        }
    }
}

/// A single counter of emptied slots; the block becomes empty exactly when
/// the counter reaches `B`, and `set_empty` reports that transition.
pub struct CounterPolicy<const B: usize> {
    counter: AtomicUsize,
}

impl<const B: usize> Default for CounterPolicy<B> {
    fn default() -> Self {
        CounterPolicy {
            counter: AtomicUsize::new(0),
        }
    }
}

impl<const B: usize> SlotPolicy for CounterPolicy<B> {
    const MEANINGFUL_SET_RESULT: bool = true;

    fn is_empty(&self) -> bool {
        if self.counter.load(Ordering::Relaxed) == B {
            fence(Ordering::Acquire);
            return true;
        }
        false
    }

    fn set_empty(&self, _index: usize) -> bool {
        let old = self.counter.fetch_add(1, Ordering::Release);
        old + 1 == B
    }

    fn set_some_empty(&self, _index: usize, count: usize) -> bool {
        let old = self.counter.fetch_add(count, Ordering::Release);
        old + count == B
    }

    fn set_all_empty(&self) {
        self.counter.store(B, Ordering::Release);
    }

    fn reset(&self) {
        self.counter.store(0, Ordering::Release);
    }
}

/// Fixed-size storage for `B` elements plus emptiness state.
///
/// The free-list word and link live first so the intrusive list never
/// touches element storage. `has_owner` marks pool-resident blocks, whose
/// memory belongs to the pool arena rather than the global allocator.
#[repr(C)]
pub struct Block<T, const B: usize, P> {
    free_refs: AtomicU32,
    free_next: AtomicPtr<Self>,
    pub(crate) has_owner: bool,
    /// Ring / chain link; owned by the producer that holds the block.
    pub(crate) next: AtomicPtr<Self>,
    policy: P,
    elements: [UnsafeCell<MaybeUninit<T>>; B],
}

unsafe impl<T: Send, const B: usize, P: Send> Send for Block<T, B, P> {}
unsafe impl<T: Send, const B: usize, P: Sync> Sync for Block<T, B, P> {}

impl<T, const B: usize, P: SlotPolicy> Default for Block<T, B, P> {
    fn default() -> Self {
        Block {
            free_refs: AtomicU32::new(0),
            free_next: AtomicPtr::new(null_mut()),
            has_owner: false,
            next: AtomicPtr::new(null_mut()),
            policy: P::default(),
            elements: array::from_fn(|_| UnsafeCell::new(MaybeUninit::uninit())),
        }
    }
}

impl<T, const B: usize, P: SlotPolicy> Block<T, B, P> {
    pub(crate) const VALID_BLOCK_SIZE: () = assert!(
        B >= 2 && B.is_power_of_two(),
        "block size must be a power of two and at least 2"
    );

    /// Raw pointer to slot `index`. The caller is responsible for the
    /// constructed/empty state of the slot.
    #[inline]
    pub(crate) unsafe fn slot(&self, index: usize) -> *mut T {
        debug_assert!(index < B);
        (*self.elements.get_unchecked(index).get()).as_mut_ptr()
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.policy.is_empty()
    }

    #[inline]
    pub(crate) fn set_empty(&self, index: usize) -> bool {
        self.policy.set_empty(index)
    }

    #[inline]
    pub(crate) fn set_some_empty(&self, index: usize, count: usize) -> bool {
        self.policy.set_some_empty(index, count)
    }

    #[inline]
    pub(crate) fn set_all_empty(&self) {
        self.policy.set_all_empty()
    }

    #[inline]
    pub(crate) fn reset(&self) {
        self.policy.reset()
    }
}

impl<T, const B: usize, P> FreeListNode for Block<T, B, P> {
    #[inline]
    fn free_list_refs(&self) -> &AtomicU32 {
        &self.free_refs
    }

    #[inline]
    fn free_list_next(&self) -> &AtomicPtr<Self> {
        &self.free_next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_policy_round_trip() {
        let policy = FlagsPolicy::<4>::default();
        assert!(!policy.is_empty());
        for i in 0..4 {
            assert!(!policy.set_empty(i));
        }
        assert!(policy.is_empty());
        policy.reset();
        assert!(!policy.is_empty());
        assert!(!policy.set_some_empty(0, 4));
        assert!(policy.is_empty());
        // after set_all_empty, further set_empty reports nothing
        policy.set_all_empty();
        assert!(!policy.set_empty(1));
    }

    #[test]
    fn counter_policy_transition() {
        let policy = CounterPolicy::<4>::default();
        assert!(!policy.is_empty());
        assert!(!policy.set_empty(0));
        assert!(!policy.set_empty(1));
        assert!(!policy.set_empty(2));
        // exactly the last slot reports the transition
        assert!(policy.set_empty(3));
        assert!(policy.is_empty());

        // past the transition nothing reports again
        policy.set_all_empty();
        assert!(!policy.set_empty(0));
    }

    #[test]
    fn counter_policy_bulk_transition() {
        let policy = CounterPolicy::<8>::default();
        assert!(!policy.set_some_empty(0, 5));
        assert!(policy.set_some_empty(5, 3));
        assert!(policy.is_empty());
        policy.reset();
        assert!(!policy.is_empty());
    }

    #[test]
    fn block_reset_then_is_empty() {
        let block: Block<u32, 4, CounterPolicy<4>> = Block::default();
        block.set_all_empty();
        assert!(block.is_empty());
        block.reset();
        assert!(!block.is_empty());
    }
}
