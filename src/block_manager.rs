use std::ptr::null_mut;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::block::{Block, SlotPolicy};
use crate::free_list::{FreeList, FreeListNode};

/// Whether a requisition may fall through to the global allocator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocMode {
    CanAlloc,
    CannotAlloc,
}

/// Pre-allocated contiguous arena of blocks, each handed out at most once.
/// After hand-out a block circulates through engines and the free list; the
/// pool keeps owning its memory (`has_owner`) until destruction.
struct BlockPool<T, const B: usize, P: SlotPolicy> {
    blocks: Box<[Block<T, B, P>]>,
    index: AtomicUsize,
}

impl<T, const B: usize, P: SlotPolicy> BlockPool<T, B, P> {
    fn new(size: usize) -> Self {
        let mut blocks: Vec<Block<T, B, P>> = Vec::with_capacity(size);
        for _ in 0..size {
            let mut block = Block::default();
            block.has_owner = true;
            blocks.push(block);
        }
        BlockPool {
            blocks: blocks.into_boxed_slice(),
            index: AtomicUsize::new(0),
        }
    }

    fn get_block(&self) -> *mut Block<T, B, P> {
        if self.index.load(Ordering::Relaxed) >= self.blocks.len() {
            return null_mut();
        }
        let current = self.index.fetch_add(1, Ordering::Relaxed);
        if current < self.blocks.len() {
            &self.blocks[current] as *const _ as *mut _
        } else {
            null_mut()
        }
    }
}

/// Block factory shared by every engine of one kind within a queue:
/// pool first, then the free list, then (in `CanAlloc` mode) a fresh heap
/// allocation. Blocks returned by engines go to the free list; teardown
/// frees the heap-allocated ones and lets the pool arena drop the rest.
pub struct BlockManager<T, const B: usize, P: SlotPolicy> {
    pool: BlockPool<T, B, P>,
    free_list: FreeList<Block<T, B, P>>,
}

impl<T, const B: usize, P: SlotPolicy> BlockManager<T, B, P> {
    pub fn new(pool_size: usize) -> Self {
        BlockManager {
            pool: BlockPool::new(pool_size),
            free_list: FreeList::new(),
        }
    }

    pub(crate) fn requisition_block(&self, mode: AllocMode) -> *mut Block<T, B, P> {
        let block = self.pool.get_block();
        if !block.is_null() {
            return block;
        }

        let block = self.free_list.try_get();
        if !block.is_null() {
            return block;
        }

        match mode {
            AllocMode::CannotAlloc => null_mut(),
            AllocMode::CanAlloc => Box::into_raw(Box::new(Block::default())),
        }
    }

    pub(crate) fn return_block(&self, block: *mut Block<T, B, P>) {
        self.free_list.add(block);
    }

    /// Returns a null-terminated chain linked through `next`.
    pub(crate) fn return_blocks(&self, mut block: *mut Block<T, B, P>) {
        while !block.is_null() {
            let next = unsafe { (*block).next.load(Ordering::Relaxed) };
            self.free_list.add(block);
            block = next;
        }
    }
}

impl<T, const B: usize, P: SlotPolicy> Drop for BlockManager<T, B, P> {
    fn drop(&mut self) {
        // Everything on the free list that the pool arena does not own was
        // requisitioned from the heap.
        let mut node = self.free_list.head_relaxed();
        while !node.is_null() {
            unsafe {
                let next = (*node).free_list_next().load(Ordering::Relaxed);
                if !(*node).has_owner {
                    drop(Box::from_raw(node));
                }
                node = next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::CounterPolicy;

    type Manager = BlockManager<u64, 4, CounterPolicy<4>>;

    #[test]
    fn pool_hands_out_each_block_once() {
        let manager = Manager::new(2);
        let a = manager.requisition_block(AllocMode::CannotAlloc);
        let b = manager.requisition_block(AllocMode::CannotAlloc);
        assert!(!a.is_null());
        assert!(!b.is_null());
        assert_ne!(a, b);
        // pool exhausted, free list empty, allocation forbidden
        assert!(manager.requisition_block(AllocMode::CannotAlloc).is_null());
    }

    #[test]
    fn free_list_recycles_before_allocating() {
        let manager = Manager::new(1);
        let a = manager.requisition_block(AllocMode::CannotAlloc);
        manager.return_block(a);
        let b = manager.requisition_block(AllocMode::CannotAlloc);
        assert_eq!(a, b);
    }

    #[test]
    fn can_alloc_falls_through_to_heap() {
        let manager = Manager::new(0);
        let a = manager.requisition_block(AllocMode::CanAlloc);
        assert!(!a.is_null());
        assert!(unsafe { !(*a).has_owner });
        // hand it back so the manager frees it on drop
        manager.return_block(a);
    }
}
