use std::fmt;
use std::marker::PhantomData;
use std::ptr::{null_mut, NonNull};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use crate::block::{Block, CounterPolicy, FlagsPolicy};
use crate::block_manager::{AllocMode, BlockManager};
use crate::explicit::ExplicitProducer;
use crate::hash_table::{IdHashTable, InsertResult};
use crate::implicit::ImplicitProducer;
use crate::utils::current_thread_id;

// How many elements a consumer token drains from one producer before the
// global rotation advances.
const ROTATION_QUOTA: usize = 256;

/// Initial sizing knobs; the block size itself is the queue's const generic.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    pub initial_block_pool_size: usize,
    pub initial_hash_size: usize,
    pub initial_explicit_queue_size: usize,
    pub initial_implicit_queue_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            initial_block_pool_size: 64,
            initial_hash_size: 32,
            initial_explicit_queue_size: 32,
            initial_implicit_queue_size: 32,
        }
    }
}

/// Enqueue rejection carrying the value back to the caller. Only possible
/// when allocation is forbidden or the index space is exhausted.
pub struct EnqueueError<T>(pub T);

impl<T> fmt::Debug for EnqueueError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EnqueueError(..)")
    }
}

impl<T> fmt::Display for EnqueueError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("queue rejected the element")
    }
}

impl<T> std::error::Error for EnqueueError<T> {}

enum Engine<T, const B: usize> {
    Explicit(ExplicitProducer<T, B>),
    Implicit(ImplicitProducer<T, B>),
}

struct ProducerNode<T, const B: usize> {
    next: AtomicPtr<ProducerNode<T, B>>,
    inactive: AtomicBool,
    engine: Engine<T, B>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ProducerKind {
    Explicit,
    Implicit,
}

/// Lock-free MPMC queue built from per-producer SPMC engines.
///
/// Ordering is FIFO within one producer only. Capacity grows by
/// requisitioning fixed-size blocks (`BLOCK_SIZE` elements, a power of two)
/// from a pool / free-list manager shared per producer kind. Every
/// operation is non-blocking.
///
/// Producers are either *explicit* (bound to a [`ProducerToken`], fastest)
/// or *implicit* (one per enqueueing thread, discovered through a lock-free
/// hash table). Consumers may dequeue with or without a [`ConsumerToken`];
/// the token caches the last productive producer so repeat dequeues stay
/// O(1).
pub struct ConcurrentQueue<T, const BLOCK_SIZE: usize = 32> {
    producers_head: AtomicPtr<ProducerNode<T, BLOCK_SIZE>>,
    producer_count: AtomicUsize,
    next_consumer_id: CachePadded<AtomicUsize>,
    global_consumer_offset: CachePadded<AtomicUsize>,
    explicit_manager: Box<BlockManager<T, BLOCK_SIZE, FlagsPolicy<BLOCK_SIZE>>>,
    implicit_manager: Box<BlockManager<T, BLOCK_SIZE, CounterPolicy<BLOCK_SIZE>>>,
    implicit_map: IdHashTable<ImplicitProducer<T, BLOCK_SIZE>>,
    config: Config,
}

unsafe impl<T: Send, const B: usize> Send for ConcurrentQueue<T, B> {}
unsafe impl<T: Send, const B: usize> Sync for ConcurrentQueue<T, B> {}

/// Handle binding a producer thread to a dedicated explicit engine.
///
/// Dropping the token marks the engine inactive; a later
/// [`ConcurrentQueue::make_producer_token`] reclaims it together with any
/// elements still queued on it.
pub struct ProducerToken<'q, T, const B: usize> {
    node: *mut ProducerNode<T, B>,
    _queue: PhantomData<&'q ConcurrentQueue<T, B>>,
}

unsafe impl<T: Send, const B: usize> Send for ProducerToken<'_, T, B> {}
unsafe impl<T: Send, const B: usize> Sync for ProducerToken<'_, T, B> {}

impl<T, const B: usize> ProducerToken<'_, T, B> {
    pub fn is_valid(&self) -> bool {
        !self.node.is_null()
    }
}

impl<T, const B: usize> Drop for ProducerToken<'_, T, B> {
    fn drop(&mut self) {
        if !self.node.is_null() {
            unsafe {
                (*self.node).inactive.store(true, Ordering::Release);
            }
        }
    }
}

/// Consumer-side rotation state. Purely an optimization: dequeues through a
/// token keep hitting the producer that last yielded an element until the
/// global rotation moves on.
pub struct ConsumerToken<'q, T, const B: usize> {
    initial_offset: usize,
    last_known_global_offset: usize,
    items_consumed_from_current: usize,
    current_producer: *mut ProducerNode<T, B>,
    _queue: PhantomData<&'q ConcurrentQueue<T, B>>,
}

unsafe impl<T: Send, const B: usize> Send for ConsumerToken<'_, T, B> {}

impl<T, const BLOCK_SIZE: usize> ConcurrentQueue<T, BLOCK_SIZE> {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        Self::with_managers(
            config,
            BlockManager::new(config.initial_block_pool_size),
            BlockManager::new(config.initial_block_pool_size),
        )
    }

    /// Injection point for custom-sized (or pre-warmed) block managers.
    pub fn with_managers(
        config: Config,
        explicit_manager: BlockManager<T, BLOCK_SIZE, FlagsPolicy<BLOCK_SIZE>>,
        implicit_manager: BlockManager<T, BLOCK_SIZE, CounterPolicy<BLOCK_SIZE>>,
    ) -> Self {
        #[allow(clippy::let_unit_value)]
        let _ = Block::<T, BLOCK_SIZE, FlagsPolicy<BLOCK_SIZE>>::VALID_BLOCK_SIZE;
        ConcurrentQueue {
            producers_head: AtomicPtr::new(null_mut()),
            producer_count: AtomicUsize::new(0),
            next_consumer_id: CachePadded::new(AtomicUsize::new(0)),
            global_consumer_offset: CachePadded::new(AtomicUsize::new(0)),
            explicit_manager: Box::new(explicit_manager),
            implicit_manager: Box::new(implicit_manager),
            implicit_map: IdHashTable::new(config.initial_hash_size),
            config,
        }
    }

    /// Enqueues through this thread's implicit producer, creating it on
    /// first use. Fails only when the index space is exhausted.
    pub fn enqueue(&self, value: T) -> Result<(), EnqueueError<T>> {
        let producer = self.implicit_producer();
        unsafe { (*producer).enqueue(AllocMode::CanAlloc, value).map_err(EnqueueError) }
    }

    /// Like [`enqueue`](Self::enqueue) but never allocates: only the block
    /// pool and the free list may satisfy the request.
    pub fn try_enqueue(&self, value: T) -> Result<(), EnqueueError<T>> {
        let producer = self.implicit_producer();
        unsafe {
            (*producer)
                .enqueue(AllocMode::CannotAlloc, value)
                .map_err(EnqueueError)
        }
    }

    /// Enqueues every item of an exactly sized iterator, atomically with
    /// respect to failure: on `false` (or a panicking iterator) nothing is
    /// published and already-taken items are dropped.
    pub fn enqueue_bulk<I>(&self, items: I) -> bool
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: ExactSizeIterator,
    {
        let items = items.into_iter();
        let count = items.len();
        let producer = self.implicit_producer();
        unsafe { (*producer).enqueue_bulk(AllocMode::CanAlloc, items, count) }
    }

    pub fn try_enqueue_bulk<I>(&self, items: I) -> bool
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: ExactSizeIterator,
    {
        let items = items.into_iter();
        let count = items.len();
        let producer = self.implicit_producer();
        unsafe { (*producer).enqueue_bulk(AllocMode::CannotAlloc, items, count) }
    }

    /// Enqueues on the token's dedicated explicit engine. The exclusive
    /// borrow enforces the single-producer contract.
    pub fn enqueue_with_token(
        &self,
        token: &mut ProducerToken<'_, T, BLOCK_SIZE>,
        value: T,
    ) -> Result<(), EnqueueError<T>> {
        unsafe {
            Self::explicit_of(token.node)
                .enqueue(AllocMode::CanAlloc, value)
                .map_err(EnqueueError)
        }
    }

    pub fn try_enqueue_with_token(
        &self,
        token: &mut ProducerToken<'_, T, BLOCK_SIZE>,
        value: T,
    ) -> Result<(), EnqueueError<T>> {
        unsafe {
            Self::explicit_of(token.node)
                .enqueue(AllocMode::CannotAlloc, value)
                .map_err(EnqueueError)
        }
    }

    pub fn enqueue_bulk_with_token<I>(
        &self,
        token: &mut ProducerToken<'_, T, BLOCK_SIZE>,
        items: I,
    ) -> bool
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: ExactSizeIterator,
    {
        let items = items.into_iter();
        let count = items.len();
        unsafe { Self::explicit_of(token.node).enqueue_bulk(AllocMode::CanAlloc, items, count) }
    }

    /// Tries every producer once, starting at the global rotation offset;
    /// the rotation advances when a full pass finds nothing.
    pub fn try_dequeue(&self) -> Option<T> {
        let count = self.producer_count.load(Ordering::Relaxed);
        if count == 0 {
            return None;
        }
        let head = self.producers_head.load(Ordering::Acquire);
        if head.is_null() {
            return None;
        }
        unsafe {
            let offset = self.global_consumer_offset.load(Ordering::Relaxed) % count;
            let mut start = head;
            for _ in 0..offset {
                start = Self::next_or_head(start, head);
            }
            let mut node = start;
            loop {
                if let Some(value) = Self::engine_dequeue(node) {
                    return Some(value);
                }
                node = Self::next_or_head(node, head);
                if node == start {
                    break;
                }
            }
        }
        self.global_consumer_offset.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Token-cached dequeue: O(1) while the cached producer keeps
    /// delivering, falling back to a rotated scan otherwise.
    pub fn try_dequeue_with_token(
        &self,
        token: &mut ConsumerToken<'_, T, BLOCK_SIZE>,
    ) -> Option<T> {
        if token.current_producer.is_null()
            || token.last_known_global_offset != self.global_consumer_offset.load(Ordering::Relaxed)
        {
            if !self.refresh_consumer_rotation(token) {
                return None;
            }
        }
        unsafe {
            if let Some(value) = Self::engine_dequeue(token.current_producer) {
                token.items_consumed_from_current += 1;
                if token.items_consumed_from_current == ROTATION_QUOTA {
                    self.global_consumer_offset.fetch_add(1, Ordering::Relaxed);
                }
                return Some(value);
            }

            let head = self.producers_head.load(Ordering::Acquire);
            if head.is_null() {
                return None;
            }
            let start = token.current_producer;
            let mut node = Self::next_or_head(start, head);
            while node != start {
                if let Some(value) = Self::engine_dequeue(node) {
                    token.current_producer = node;
                    token.items_consumed_from_current = 1;
                    return Some(value);
                }
                node = Self::next_or_head(node, head);
            }
        }
        self.global_consumer_offset.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Dequeues directly from the token's explicit engine.
    pub fn try_dequeue_from_producer(
        &self,
        token: &ProducerToken<'_, T, BLOCK_SIZE>,
    ) -> Option<T> {
        unsafe { Self::explicit_of(token.node).dequeue() }
    }

    /// Dequeues up to `max` elements into `dest`, spreading across
    /// producers from the rotation offset. Returns the number taken.
    pub fn try_dequeue_bulk(&self, dest: &mut Vec<T>, max: usize) -> usize {
        let count = self.producer_count.load(Ordering::Relaxed);
        if count == 0 || max == 0 {
            return 0;
        }
        let head = self.producers_head.load(Ordering::Acquire);
        if head.is_null() {
            return 0;
        }
        let mut total = 0;
        unsafe {
            let offset = self.global_consumer_offset.load(Ordering::Relaxed) % count;
            let mut start = head;
            for _ in 0..offset {
                start = Self::next_or_head(start, head);
            }
            let mut node = start;
            loop {
                total += Self::engine_dequeue_bulk(node, dest, max - total);
                if total == max {
                    return total;
                }
                node = Self::next_or_head(node, head);
                if node == start {
                    break;
                }
            }
        }
        if total == 0 {
            self.global_consumer_offset.fetch_add(1, Ordering::Relaxed);
        }
        total
    }

    pub fn try_dequeue_bulk_with_token(
        &self,
        token: &mut ConsumerToken<'_, T, BLOCK_SIZE>,
        dest: &mut Vec<T>,
        max: usize,
    ) -> usize {
        if max == 0 {
            return 0;
        }
        if token.current_producer.is_null()
            || token.last_known_global_offset != self.global_consumer_offset.load(Ordering::Relaxed)
        {
            if !self.refresh_consumer_rotation(token) {
                return 0;
            }
        }
        unsafe {
            let mut total = Self::engine_dequeue_bulk(token.current_producer, dest, max);
            token.items_consumed_from_current += total;
            if total == max {
                if token.items_consumed_from_current >= ROTATION_QUOTA {
                    self.global_consumer_offset.fetch_add(1, Ordering::Relaxed);
                }
                return total;
            }

            let head = self.producers_head.load(Ordering::Acquire);
            if head.is_null() {
                return total;
            }
            let start = token.current_producer;
            let mut node = Self::next_or_head(start, head);
            while node != start {
                let taken = Self::engine_dequeue_bulk(node, dest, max - total);
                if taken > 0 {
                    token.current_producer = node;
                    token.items_consumed_from_current = taken;
                    total += taken;
                    if total == max {
                        return total;
                    }
                }
                node = Self::next_or_head(node, head);
            }
            total
        }
    }

    /// Bulk variant of [`try_dequeue_from_producer`](Self::try_dequeue_from_producer).
    pub fn try_dequeue_bulk_from_producer(
        &self,
        token: &ProducerToken<'_, T, BLOCK_SIZE>,
        dest: &mut Vec<T>,
        max: usize,
    ) -> usize {
        unsafe { Self::explicit_of(token.node).dequeue_bulk(dest, max) }
    }

    /// Approximate number of queued elements; exact at quiescence.
    pub fn len(&self) -> usize {
        let mut size = 0usize;
        let mut node = self.producers_head.load(Ordering::Acquire);
        while !node.is_null() {
            unsafe {
                size = size.wrapping_add(match &(*node).engine {
                    Engine::Explicit(producer) => producer.size_approx(),
                    Engine::Implicit(producer) => producer.size_approx(),
                });
                node = (*node).next.load(Ordering::Relaxed);
            }
        }
        size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Binds a new explicit producer, reclaiming an inactive engine (with
    /// its queued elements and blocks) when one exists.
    pub fn make_producer_token(&self) -> ProducerToken<'_, T, BLOCK_SIZE> {
        let mut node = self.producers_head.load(Ordering::Acquire);
        while !node.is_null() {
            unsafe {
                let candidate = &*node;
                if matches!(&candidate.engine, Engine::Explicit(_))
                    && candidate.inactive.load(Ordering::Relaxed)
                    && candidate
                        .inactive
                        .compare_exchange(true, false, Ordering::AcqRel, Ordering::Relaxed)
                        .is_ok()
                {
                    return ProducerToken {
                        node,
                        _queue: PhantomData,
                    };
                }
                node = candidate.next.load(Ordering::Relaxed);
            }
        }
        ProducerToken {
            node: self.create_producer(ProducerKind::Explicit),
            _queue: PhantomData,
        }
    }

    pub fn make_consumer_token(&self) -> ConsumerToken<'_, T, BLOCK_SIZE> {
        ConsumerToken {
            initial_offset: self.next_consumer_id.fetch_add(1, Ordering::Relaxed),
            last_known_global_offset: usize::MAX,
            items_consumed_from_current: 0,
            current_producer: null_mut(),
            _queue: PhantomData,
        }
    }

    fn implicit_producer(&self) -> *mut ImplicitProducer<T, BLOCK_SIZE> {
        let id = current_thread_id();
        let existing = self.implicit_map.get(id);
        if !existing.is_null() {
            return existing;
        }

        let node = self.create_producer(ProducerKind::Implicit);
        let engine = unsafe {
            match &(*node).engine {
                Engine::Implicit(producer) => {
                    producer as *const ImplicitProducer<T, BLOCK_SIZE> as *mut _
                }
                Engine::Explicit(_) => unreachable!(),
            }
        };
        match self.implicit_map.get_or_add(id, engine) {
            InsertResult::Added => engine,
            InsertResult::Got(existing) => existing,
        }
    }

    fn create_producer(&self, kind: ProducerKind) -> *mut ProducerNode<T, BLOCK_SIZE> {
        let engine = match kind {
            ProducerKind::Explicit => Engine::Explicit(ExplicitProducer::new(
                self.config.initial_explicit_queue_size,
                NonNull::from(&*self.explicit_manager),
            )),
            ProducerKind::Implicit => Engine::Implicit(ImplicitProducer::new(
                self.config.initial_implicit_queue_size,
                NonNull::from(&*self.implicit_manager),
            )),
        };
        let node = Box::into_raw(Box::new(ProducerNode {
            next: AtomicPtr::new(null_mut()),
            inactive: AtomicBool::new(false),
            engine,
        }));

        self.producer_count.fetch_add(1, Ordering::Relaxed);
        let mut head = self.producers_head.load(Ordering::Relaxed);
        loop {
            unsafe {
                (*node).next.store(head, Ordering::Relaxed);
            }
            match self.producers_head.compare_exchange_weak(
                head,
                node,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => head = actual,
            }
        }
        node
    }

    // Re-derives the token's producer from its dense id plus the current
    // global rotation.
    fn refresh_consumer_rotation(&self, token: &mut ConsumerToken<'_, T, BLOCK_SIZE>) -> bool {
        let head = self.producers_head.load(Ordering::Acquire);
        if head.is_null() {
            return false;
        }
        let count = self.producer_count.load(Ordering::Relaxed);
        if count == 0 {
            return false;
        }
        let global = self.global_consumer_offset.load(Ordering::Relaxed);
        let hops = token.initial_offset.wrapping_add(global) % count;
        let mut node = head;
        for _ in 0..hops {
            node = unsafe { Self::next_or_head(node, head) };
        }
        token.current_producer = node;
        token.last_known_global_offset = global;
        token.items_consumed_from_current = 0;
        true
    }

    #[inline]
    unsafe fn next_or_head(
        node: *mut ProducerNode<T, BLOCK_SIZE>,
        head: *mut ProducerNode<T, BLOCK_SIZE>,
    ) -> *mut ProducerNode<T, BLOCK_SIZE> {
        let next = (*node).next.load(Ordering::Relaxed);
        if next.is_null() {
            head
        } else {
            next
        }
    }

    unsafe fn engine_dequeue(node: *mut ProducerNode<T, BLOCK_SIZE>) -> Option<T> {
        match &(*node).engine {
            Engine::Explicit(producer) => producer.dequeue(),
            Engine::Implicit(producer) => producer.dequeue(),
        }
    }

    unsafe fn engine_dequeue_bulk(
        node: *mut ProducerNode<T, BLOCK_SIZE>,
        dest: &mut Vec<T>,
        max: usize,
    ) -> usize {
        match &(*node).engine {
            Engine::Explicit(producer) => producer.dequeue_bulk(dest, max),
            Engine::Implicit(producer) => producer.dequeue_bulk(dest, max),
        }
    }

    unsafe fn explicit_of<'a>(
        node: *mut ProducerNode<T, BLOCK_SIZE>,
    ) -> &'a ExplicitProducer<T, BLOCK_SIZE> {
        match &(*node).engine {
            Engine::Explicit(producer) => producer,
            Engine::Implicit(_) => unreachable!(),
        }
    }
}

impl<T, const BLOCK_SIZE: usize> Default for ConcurrentQueue<T, BLOCK_SIZE> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const BLOCK_SIZE: usize> Drop for ConcurrentQueue<T, BLOCK_SIZE> {
    fn drop(&mut self) {
        // Engines must drop (returning their blocks) before the managers,
        // which are fields and therefore drop after this body.
        let mut node = *self.producers_head.get_mut();
        while !node.is_null() {
            unsafe {
                let boxed = Box::from_raw(node);
                node = boxed.next.load(Ordering::Relaxed);
                drop(boxed);
            }
        }
    }
}
