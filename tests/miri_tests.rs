// Scaled-down versions of the concurrency tests, sized so the whole file
// stays tractable under `cargo miri test`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use blockq::{ConcurrentQueue, Config};

fn tiny_config() -> Config {
    Config {
        initial_block_pool_size: 2,
        initial_hash_size: 4,
        initial_explicit_queue_size: 2,
        initial_implicit_queue_size: 2,
    }
}

#[test]
fn basic_operations() {
    let queue: ConcurrentQueue<usize, 4> = ConcurrentQueue::with_config(tiny_config());
    assert!(queue.is_empty());
    queue.enqueue(1).unwrap();
    assert_eq!(queue.try_dequeue(), Some(1));
    assert!(queue.try_dequeue().is_none());
}

#[test]
fn small_sequence_crosses_blocks() {
    let queue: ConcurrentQueue<usize, 4> = ConcurrentQueue::with_config(tiny_config());
    for i in 0..10 {
        queue.enqueue(i).unwrap();
    }
    for i in 0..10 {
        assert_eq!(queue.try_dequeue(), Some(i));
    }
    assert!(queue.is_empty());
}

#[test]
fn token_paths_small() {
    let queue: ConcurrentQueue<usize, 4> = ConcurrentQueue::with_config(tiny_config());
    let mut producer = queue.make_producer_token();
    let mut consumer = queue.make_consumer_token();
    assert!(queue.enqueue_bulk_with_token(&mut producer, 0..6));
    let mut seen = Vec::new();
    while let Some(value) = queue.try_dequeue_with_token(&mut consumer) {
        seen.push(value);
    }
    assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);
}

#[test]
fn two_producers_one_consumer_small() {
    let queue: Arc<ConcurrentQueue<usize, 4>> = Arc::new(ConcurrentQueue::with_config(tiny_config()));
    let mut handles = Vec::new();
    for p in 0..2 {
        let queue = queue.clone();
        handles.push(thread::spawn(move || {
            for i in 0..20 {
                queue.enqueue(p * 20 + i).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let mut items = Vec::new();
    while let Some(value) = queue.try_dequeue() {
        items.push(value);
    }
    items.sort_unstable();
    assert_eq!(items, (0..40).collect::<Vec<_>>());
}

#[test]
fn racing_consumers_small() {
    let queue: Arc<ConcurrentQueue<usize, 4>> = Arc::new(ConcurrentQueue::with_config(tiny_config()));
    for i in 0..30 {
        queue.enqueue(i).unwrap();
    }

    let taken = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for _ in 0..3 {
        let queue = queue.clone();
        let taken = taken.clone();
        handles.push(thread::spawn(move || {
            let mut seen = Vec::new();
            while taken.load(Ordering::Relaxed) < 30 {
                if let Some(value) = queue.try_dequeue() {
                    taken.fetch_add(1, Ordering::Relaxed);
                    seen.push(value);
                } else {
                    thread::yield_now();
                }
            }
            seen
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.join().unwrap());
    }
    all.sort_unstable();
    assert_eq!(all, (0..30).collect::<Vec<_>>());
    assert!(queue.is_empty());
}

#[test]
fn drop_with_elements_in_flight() {
    // exercises both engines' teardown paths, including partially
    // dequeued blocks
    let queue: ConcurrentQueue<Box<usize>, 4> = ConcurrentQueue::with_config(tiny_config());
    let mut token = queue.make_producer_token();
    for i in 0..10 {
        queue.enqueue(Box::new(i)).unwrap();
        queue.enqueue_with_token(&mut token, Box::new(100 + i)).unwrap();
    }
    assert_eq!(queue.try_dequeue_from_producer(&token).as_deref(), Some(&100));
    assert!(queue.try_dequeue().is_some());
    drop(token);
    drop(queue);
}
