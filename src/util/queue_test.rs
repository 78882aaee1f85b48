use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use std::{sync::Arc, thread, time};

use super::*;

#[test]
fn test_queue_fifo() {
    let q: BoundedQueue<u64> = BoundedQueue::new(4);
    let mut cursor = 0;

    for i in 0..4 {
        q.enqueue(Arc::new(i));
    }
    assert_eq!(q.len(), 4);

    for i in 0..4 {
        let item = q.peek_at(&mut cursor).unwrap();
        assert_eq!(*item, i);
        q.dequeue();
    }
    assert!(q.is_empty());
}

#[test]
fn test_queue_capacity_clamp() {
    let q: BoundedQueue<u64> = BoundedQueue::new(1000);
    for i in 0..8 {
        q.enqueue(Arc::new(i));
    }
    assert_eq!(q.len(), 8);

    let q: BoundedQueue<u64> = BoundedQueue::new(0);
    q.enqueue(Arc::new(1));
    assert_eq!(q.len(), 1);
}

#[test]
fn test_queue_clear_wakes_consumers() {
    let q: Arc<BoundedQueue<u64>> = Arc::new(BoundedQueue::new(2));

    let mut handles = vec![];
    for _i in 0..4 {
        let q = Arc::clone(&q);
        handles.push(thread::spawn(move || {
            let mut cursor = 0;
            let mut count = 0;
            while q.peek_at(&mut cursor).is_some() {
                count += 1;
            }
            count
        }));
    }

    // consumers are parked on an empty buffer, clear must wake them.
    thread::sleep(time::Duration::from_millis(50));
    q.clear();

    for handle in handles.into_iter() {
        assert_eq!(handle.join().unwrap(), 0);
    }
}

#[test]
fn test_queue_producer_consumer() {
    let seed: u64 = random();
    println!("test_queue_producer_consumer seed {}", seed);
    let mut rng = SmallRng::seed_from_u64(seed);

    let q: Arc<BoundedQueue<u64>> = Arc::new(BoundedQueue::new(rng.gen_range(1..=8)));
    let n = 10_000;

    // single consumer drives the cursor and the dequeue.
    let consumer = {
        let q = Arc::clone(&q);
        thread::spawn(move || {
            let mut cursor = 0;
            let mut items = vec![];
            while let Some(item) = q.peek_at(&mut cursor) {
                items.push(*item);
                q.dequeue();
            }
            items
        })
    };

    for i in 0..n {
        q.enqueue(Arc::new(i));
    }
    q.wait_empty();
    q.clear();

    let items = consumer.join().unwrap();
    assert_eq!(items.len() as u64, n);
    for (i, item) in items.into_iter().enumerate() {
        assert_eq!(i as u64, item);
    }
}
