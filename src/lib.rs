//! blockq - lock-free block-based MPMC queue
//!
//! An unbounded multi-producer / multi-consumer FIFO queue built from
//! per-producer single-producer engines over recycled fixed-size blocks.
//!
//! - `enqueue` / `try_dequeue` : lock-free operations for any thread
//! - producer / consumer tokens : cached fast paths for pinned roles
//! - `enqueue_bulk` / `try_dequeue_bulk` : amortized batch transfer
//! - FIFO holds per producer; elements from different producers interleave

pub mod block;
pub mod block_manager;
mod explicit;
mod free_list;
mod hash_table;
mod implicit;
pub mod queue;
mod utils;

pub use block::{CounterPolicy, FlagsPolicy, SlotPolicy};
pub use block_manager::{AllocMode, BlockManager};
pub use queue::{Config, ConcurrentQueue, ConsumerToken, EnqueueError, ProducerToken};
