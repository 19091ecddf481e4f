use std::ptr::null_mut;
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

/// Intrusive hook for [`FreeList`] membership. The refs word packs a 31-bit
/// reference count with an insertion-in-progress flag in the top bit.
pub(crate) trait FreeListNode: Sized {
    fn free_list_refs(&self) -> &AtomicU32;
    fn free_list_next(&self) -> &AtomicPtr<Self>;
}

const REFS_MASK: u32 = 0x7fff_ffff;
const ADD_FLAG: u32 = 0x8000_0000;

/// Lock-free stack of recyclable nodes.
///
/// A node is reachable from `head` iff its low 31 refcount bits are >= 1 and
/// the add flag is clear (except transiently during an add). Nodes are never
/// deallocated while the list lives, which rules out ABA on `head`; whoever
/// owns the nodes' memory frees them after draining `head_relaxed`.
pub(crate) struct FreeList<N: FreeListNode> {
    head: AtomicPtr<N>,
}

impl<N: FreeListNode> FreeList<N> {
    pub(crate) fn new() -> Self {
        FreeList {
            head: AtomicPtr::new(null_mut()),
        }
    }

    /// Inserts `node` at the head. If a concurrent `try_get` still holds a
    /// reference, setting the add flag delegates the republish to it.
    pub(crate) fn add(&self, node: *mut N) {
        unsafe {
            if (*node).free_list_refs().fetch_add(ADD_FLAG, Ordering::Relaxed) == 0 {
                self.inner_add(node);
            }
        }
    }

    pub(crate) fn try_get(&self) -> *mut N {
        unsafe {
            let mut head = self.head.load(Ordering::Relaxed);
            while !head.is_null() {
                let prev_head = head;
                let refs = (*head).free_list_refs().load(Ordering::Relaxed);
                if (refs & REFS_MASK) == 0
                    || (*head)
                        .free_list_refs()
                        .compare_exchange(refs, refs + 1, Ordering::Acquire, Ordering::Relaxed)
                        .is_err()
                {
                    head = self.head.load(Ordering::Relaxed);
                    continue;
                }

                // Our reference protects `next` from being repurposed.
                let next = (*head).free_list_next().load(Ordering::Relaxed);
                match self
                    .head
                    .compare_exchange(head, next, Ordering::Relaxed, Ordering::Relaxed)
                {
                    Ok(_) => {
                        // Drop both our reference and the list's.
                        (*head).free_list_refs().fetch_sub(2, Ordering::Relaxed);
                        return head;
                    }
                    Err(actual) => {
                        head = actual;
                        let old = (*prev_head).free_list_refs().fetch_sub(1, Ordering::Relaxed);
                        if old == ADD_FLAG + 1 {
                            // We were the last holder of a node someone tried
                            // to re-add; the republish falls to us.
                            self.inner_add(prev_head);
                        }
                    }
                }
            }
            null_mut()
        }
    }

    /// Not thread safe; only valid when no concurrent add/try_get runs
    /// (teardown).
    pub(crate) fn head_relaxed(&self) -> *mut N {
        self.head.load(Ordering::Relaxed)
    }

    // Publish a node whose refcount is known to be zero (add flag set).
    fn inner_add(&self, node: *mut N) {
        unsafe {
            let mut head = self.head.load(Ordering::Relaxed);
            loop {
                // next must be visible before the refs store makes the node
                // claimable.
                (*node).free_list_next().store(head, Ordering::Relaxed);
                (*node).free_list_refs().store(1, Ordering::Release);
                match self
                    .head
                    .compare_exchange(head, node, Ordering::Relaxed, Ordering::Relaxed)
                {
                    Ok(_) => return,
                    Err(actual) => {
                        head = actual;
                        if (*node)
                            .free_list_refs()
                            .fetch_add(ADD_FLAG - 1, Ordering::Release)
                            == 1
                        {
                            continue;
                        }
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestNode {
        refs: AtomicU32,
        next: AtomicPtr<TestNode>,
        value: usize,
    }

    impl TestNode {
        fn new(value: usize) -> Self {
            TestNode {
                refs: AtomicU32::new(0),
                next: AtomicPtr::new(null_mut()),
                value,
            }
        }
    }

    impl FreeListNode for TestNode {
        fn free_list_refs(&self) -> &AtomicU32 {
            &self.refs
        }
        fn free_list_next(&self) -> &AtomicPtr<Self> {
            &self.next
        }
    }

    #[test]
    fn add_then_get_single_thread() {
        let list = FreeList::new();
        let mut nodes: Vec<TestNode> = (0..4).map(TestNode::new).collect();
        for node in nodes.iter_mut() {
            list.add(node as *mut _);
        }
        let mut seen = Vec::new();
        loop {
            let node: *mut TestNode = list.try_get();
            if node.is_null() {
                break;
            }
            seen.push(unsafe { (*node).value });
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3]);
        assert!(list.try_get().is_null());
    }

    #[test]
    fn refcounts_quiesce_to_one() {
        let list = FreeList::new();
        let mut nodes: Vec<TestNode> = (0..3).map(TestNode::new).collect();
        for node in nodes.iter_mut() {
            list.add(node as *mut _);
        }
        for node in nodes.iter() {
            let refs = node.refs.load(Ordering::Relaxed);
            assert_eq!(refs & REFS_MASK, 1);
            assert_eq!(refs & ADD_FLAG, 0);
        }
    }

    #[test]
    fn concurrent_take_and_put() {
        use std::sync::atomic::AtomicUsize;
        use std::sync::{Arc, Barrier};
        use std::thread;

        const NODES: usize = 32;
        const THREADS: usize = 4;
        const ROUNDS: usize = 10_000;

        struct Shared {
            list: FreeList<TestNode>,
            taken: AtomicUsize,
        }
        unsafe impl Send for Shared {}
        unsafe impl Sync for Shared {}

        let nodes: Box<[TestNode]> = (0..NODES).map(TestNode::new).collect();
        let nodes = Box::leak(nodes);
        let shared = Arc::new(Shared {
            list: FreeList::new(),
            taken: AtomicUsize::new(0),
        });
        for node in nodes.iter() {
            shared.list.add(node as *const _ as *mut _);
        }

        let barrier = Arc::new(Barrier::new(THREADS));
        let mut handles = Vec::new();
        for _ in 0..THREADS {
            let shared = shared.clone();
            let barrier = barrier.clone();
            handles.push(thread::spawn(move || {
                barrier.wait();
                for _ in 0..ROUNDS {
                    let node = shared.list.try_get();
                    if !node.is_null() {
                        shared.taken.fetch_add(1, Ordering::Relaxed);
                        shared.list.add(node);
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        // every node ends up back on the list exactly once
        let mut count = 0;
        loop {
            let node = shared.list.try_get();
            if node.is_null() {
                break;
            }
            count += 1;
        }
        assert_eq!(count, NODES);
    }
}
