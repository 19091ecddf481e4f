use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use blockq::ConcurrentQueue;

#[test]
fn explicit_producers_many_consumers_checksum() {
    const PRODUCERS: usize = 10;
    const ITEMS_PER_PRODUCER: usize = 100_000;
    const CONSUMERS: usize = 20;
    const TOTAL: usize = PRODUCERS * ITEMS_PER_PRODUCER;

    let queue: Arc<ConcurrentQueue<usize>> = Arc::new(ConcurrentQueue::new());
    let barrier = Arc::new(Barrier::new(PRODUCERS + CONSUMERS));
    let consumed = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();

    for p in 0..PRODUCERS {
        let queue = queue.clone();
        let barrier = barrier.clone();
        handles.push(thread::spawn(move || -> usize {
            let mut token = queue.make_producer_token();
            barrier.wait();
            for i in 0..ITEMS_PER_PRODUCER {
                queue
                    .enqueue_with_token(&mut token, p * ITEMS_PER_PRODUCER + i)
                    .unwrap();
            }
            0
        }));
    }

    for _ in 0..CONSUMERS {
        let queue = queue.clone();
        let barrier = barrier.clone();
        let consumed = consumed.clone();
        handles.push(thread::spawn(move || -> usize {
            let mut token = queue.make_consumer_token();
            let mut sum = 0usize;
            barrier.wait();
            while consumed.load(Ordering::Relaxed) < TOTAL {
                match queue.try_dequeue_with_token(&mut token) {
                    Some(value) => {
                        sum += value;
                        consumed.fetch_add(1, Ordering::Relaxed);
                    }
                    None => thread::yield_now(),
                }
            }
            sum
        }));
    }

    let total_sum: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(consumed.load(Ordering::Relaxed), TOTAL);
    assert_eq!(total_sum, TOTAL * (TOTAL - 1) / 2);
    assert!(queue.is_empty());
}

#[test]
fn implicit_producer_per_thread_single_consumer() {
    const THREADS: usize = 50;
    const ITEMS_PER_THREAD: usize = 20_000;
    const TOTAL: usize = THREADS * ITEMS_PER_THREAD;

    let queue: Arc<ConcurrentQueue<usize>> = Arc::new(ConcurrentQueue::new());
    let barrier = Arc::new(Barrier::new(THREADS));
    let mut producers = Vec::new();

    for t in 0..THREADS {
        let queue = queue.clone();
        let barrier = barrier.clone();
        producers.push(thread::spawn(move || {
            barrier.wait();
            for i in 0..ITEMS_PER_THREAD {
                queue.enqueue(t * ITEMS_PER_THREAD + i).unwrap();
            }
        }));
    }

    let consumer = {
        let queue = queue.clone();
        thread::spawn(move || {
            let mut items = Vec::with_capacity(TOTAL);
            while items.len() < TOTAL {
                match queue.try_dequeue() {
                    Some(value) => items.push(value),
                    None => thread::yield_now(),
                }
            }
            items
        })
    };

    for handle in producers {
        handle.join().unwrap();
    }
    let mut items = consumer.join().unwrap();
    assert_eq!(items.len(), TOTAL);
    items.sort_unstable();
    for (i, &item) in items.iter().enumerate() {
        assert_eq!(item, i);
    }
    assert!(queue.is_empty());
}

#[test]
fn per_producer_fifo_with_concurrent_consumers() {
    const ITEMS: usize = 100_000;
    const CONSUMERS: usize = 4;

    let queue: Arc<ConcurrentQueue<usize, 16>> = Arc::new(ConcurrentQueue::new());
    let barrier = Arc::new(Barrier::new(CONSUMERS + 1));
    let consumed = Arc::new(AtomicUsize::new(0));

    let producer = {
        let queue = queue.clone();
        let barrier = barrier.clone();
        thread::spawn(move || {
            let mut token = queue.make_producer_token();
            barrier.wait();
            for i in 0..ITEMS {
                queue.enqueue_with_token(&mut token, i).unwrap();
            }
        })
    };

    let mut consumers = Vec::new();
    for _ in 0..CONSUMERS {
        let queue = queue.clone();
        let barrier = barrier.clone();
        let consumed = consumed.clone();
        consumers.push(thread::spawn(move || {
            let mut seen = Vec::new();
            barrier.wait();
            while consumed.load(Ordering::Relaxed) < ITEMS {
                match queue.try_dequeue() {
                    Some(value) => {
                        seen.push(value);
                        consumed.fetch_add(1, Ordering::Relaxed);
                    }
                    None => thread::yield_now(),
                }
            }
            seen
        }));
    }

    producer.join().unwrap();
    let mut all = Vec::new();
    for handle in consumers {
        let seen = handle.join().unwrap();
        // single producer: every consumer observes an increasing subsequence
        for window in seen.windows(2) {
            assert!(window[0] < window[1]);
        }
        all.extend(seen);
    }
    // at-most-once and no-loss
    all.sort_unstable();
    assert_eq!(all, (0..ITEMS).collect::<Vec<_>>());
}

#[test]
fn bulk_producers_bulk_consumers() {
    const PRODUCERS: usize = 4;
    const BATCHES: usize = 500;
    const BATCH: usize = 100;
    const TOTAL: usize = PRODUCERS * BATCHES * BATCH;

    let queue: Arc<ConcurrentQueue<usize, 8>> = Arc::new(ConcurrentQueue::new());
    let barrier = Arc::new(Barrier::new(PRODUCERS + 2));
    let consumed = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();

    for p in 0..PRODUCERS {
        let queue = queue.clone();
        let barrier = barrier.clone();
        handles.push(thread::spawn(move || -> Vec<usize> {
            barrier.wait();
            for b in 0..BATCHES {
                let start = (p * BATCHES + b) * BATCH;
                assert!(queue.enqueue_bulk(start..start + BATCH));
            }
            Vec::new()
        }));
    }

    for _ in 0..2 {
        let queue = queue.clone();
        let barrier = barrier.clone();
        let consumed = consumed.clone();
        handles.push(thread::spawn(move || -> Vec<usize> {
            let mut token = queue.make_consumer_token();
            let mut taken = Vec::new();
            barrier.wait();
            while consumed.load(Ordering::Relaxed) < TOTAL {
                let got = queue.try_dequeue_bulk_with_token(&mut token, &mut taken, 64);
                if got == 0 {
                    thread::yield_now();
                } else {
                    consumed.fetch_add(got, Ordering::Relaxed);
                }
            }
            taken
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.join().unwrap());
    }
    assert_eq!(all.len(), TOTAL);
    all.sort_unstable();
    for (i, &item) in all.iter().enumerate() {
        assert_eq!(item, i);
    }
}

#[test]
fn move_after_partial_drain() {
    const TOTAL: usize = 1_000_000;
    const DRAIN_FIRST: usize = 250_000;

    let queue: ConcurrentQueue<usize> = ConcurrentQueue::new();
    assert!(queue.enqueue_bulk(0..TOTAL));

    let mut sum = 0usize;
    let mut buffer = Vec::with_capacity(DRAIN_FIRST);
    while buffer.len() < DRAIN_FIRST {
        let missing = DRAIN_FIRST - buffer.len();
        assert!(queue.try_dequeue_bulk(&mut buffer, missing) > 0);
    }
    sum += buffer.iter().sum::<usize>();

    // the move crosses a thread boundary; engines and blocks travel intact
    let handle = thread::spawn(move || {
        let moved = queue;
        assert_eq!(moved.len(), TOTAL - DRAIN_FIRST);
        let mut sum = 0usize;
        while let Some(value) = moved.try_dequeue() {
            sum += value;
        }
        assert!(moved.is_empty());
        sum
    });
    sum += handle.join().unwrap();
    assert_eq!(sum, TOTAL * (TOTAL - 1) / 2);
}

#[test]
fn mixed_producers_mixed_consumers_stress() {
    const EXPLICIT: usize = 3;
    const IMPLICIT: usize = 3;
    const ITEMS: usize = 30_000;
    const CONSUMERS: usize = 6;
    const TOTAL: usize = (EXPLICIT + IMPLICIT) * ITEMS;

    let queue: Arc<ConcurrentQueue<usize, 8>> = Arc::new(ConcurrentQueue::new());
    let barrier = Arc::new(Barrier::new(EXPLICIT + IMPLICIT + CONSUMERS));
    let consumed = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();

    for p in 0..EXPLICIT {
        let queue = queue.clone();
        let barrier = barrier.clone();
        handles.push(thread::spawn(move || -> Vec<usize> {
            let mut token = queue.make_producer_token();
            barrier.wait();
            let base = p * ITEMS;
            let mut i = 0;
            while i < ITEMS {
                // alternate batch and single enqueues
                if i % 3 == 0 && i + 10 <= ITEMS {
                    assert!(queue.enqueue_bulk_with_token(&mut token, base + i..base + i + 10));
                    i += 10;
                } else {
                    queue.enqueue_with_token(&mut token, base + i).unwrap();
                    i += 1;
                }
            }
            Vec::new()
        }));
    }

    for p in 0..IMPLICIT {
        let queue = queue.clone();
        let barrier = barrier.clone();
        handles.push(thread::spawn(move || -> Vec<usize> {
            barrier.wait();
            let base = (EXPLICIT + p) * ITEMS;
            let mut i = 0;
            while i < ITEMS {
                if i % 5 == 0 && i + 20 <= ITEMS {
                    assert!(queue.enqueue_bulk(base + i..base + i + 20));
                    i += 20;
                } else {
                    queue.enqueue(base + i).unwrap();
                    i += 1;
                }
            }
            Vec::new()
        }));
    }

    for c in 0..CONSUMERS {
        let queue = queue.clone();
        let barrier = barrier.clone();
        let consumed = consumed.clone();
        handles.push(thread::spawn(move || -> Vec<usize> {
            let mut token = queue.make_consumer_token();
            let mut taken = Vec::new();
            barrier.wait();
            while consumed.load(Ordering::Relaxed) < TOTAL {
                let got = if c % 2 == 0 {
                    queue.try_dequeue_bulk_with_token(&mut token, &mut taken, 32)
                } else {
                    match queue.try_dequeue_with_token(&mut token) {
                        Some(value) => {
                            taken.push(value);
                            1
                        }
                        None => 0,
                    }
                };
                if got == 0 {
                    thread::yield_now();
                } else {
                    consumed.fetch_add(got, Ordering::Relaxed);
                }
            }
            taken
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.join().unwrap());
    }
    assert_eq!(all.len(), TOTAL);
    all.sort_unstable();
    for (i, &item) in all.iter().enumerate() {
        assert_eq!(item, i);
    }
    assert!(queue.is_empty());
}
