use std::sync::atomic::{AtomicUsize, Ordering};

/// Comparison modulo 2^64: `a < b` iff the wrapping difference `a - b` has
/// its top bit set. Indices may wrap; only relative distance matters.
#[inline]
pub(crate) fn circular_less_than(a: usize, b: usize) -> bool {
    (a.wrapping_sub(b) as isize) < 0
}

/// Rounds up to the next power of two. `0` stays `0`, exact powers stay put.
#[inline]
pub(crate) fn ceil_to_pow2(x: usize) -> usize {
    let mut x = x.wrapping_sub(1);
    x |= x >> 1;
    x |= x >> 2;
    x |= x >> 4;
    x |= x >> 8;
    x |= x >> 16;
    #[cfg(target_pointer_width = "64")]
    {
        x |= x >> 32;
    }
    x.wrapping_add(1)
}

/// Number of bits needed to represent `x` (`bit_width(0) == 0`).
#[inline]
pub(crate) fn bit_width(x: usize) -> u32 {
    usize::BITS - x.leading_zeros()
}

// Thread ids are minted once per thread from a global counter. Id 0 is the
// hash table's empty marker and usize::MAX its reserved sentinel; the
// counter starts at 1 and cannot practically reach the sentinel.
pub(crate) const INVALID_THREAD_ID: usize = usize::MAX;

static THREAD_ID_COUNTER: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    static THREAD_ID: usize = THREAD_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn current_thread_id() -> usize {
    THREAD_ID.with(|id| *id)
}
