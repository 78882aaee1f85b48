use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use std::{collections::BTreeMap, sync::Arc};

use super::*;
use crate::Config;

fn engine(name: &str, workers: usize, policy: Descend) -> Tree {
    let mut config = Config::new();
    config.set_batch_size(65536);
    Tree::new(name, config, workers, 8, policy).unwrap()
}

#[test]
fn test_palm_mixed_batch() {
    let tree = engine("test_palm_mixed_batch", 4, Descend::Lazy);

    let mut batch = tree.new_batch();
    batch.add_write(b"k1", 101).unwrap();
    batch.add_write(b"k2", 102).unwrap();
    batch.add_read(b"k1").unwrap();
    batch.add_write(b"k3", 103).unwrap();
    batch.add_read(b"k2").unwrap();
    batch.add_read(b"k4").unwrap();

    let batch = Arc::new(batch);
    tree.execute(Arc::clone(&batch));
    tree.flush();

    // writes report success, reads see same-batch writes of lower
    // arrival order, the absent key reads as zero.
    assert_eq!(batch.read_at(0).unwrap().2, 1);
    assert_eq!(batch.read_at(1).unwrap().2, 1);
    assert_eq!(batch.read_at(2).unwrap().2, 101);
    assert_eq!(batch.read_at(3).unwrap().2, 1);
    assert_eq!(batch.read_at(4).unwrap().2, 102);
    assert_eq!(batch.read_at(5).unwrap().2, 0);

    assert_eq!(tree.count(), 3);
    tree.validate().unwrap();
    tree.close().unwrap();
}

#[test]
fn test_palm_duplicate_batch() {
    let tree = engine("test_palm_duplicate_batch", 4, Descend::Lazy);

    let mut batch = tree.new_batch();
    for i in 0..10_u64 {
        batch.add_write(format!("dup-{:02}", i).as_bytes(), 100 + i).unwrap();
    }
    let batch = Arc::new(batch);

    tree.execute(Arc::clone(&batch));
    tree.flush();
    for i in 0..10 {
        assert_eq!(batch.read_at(i).unwrap().2, 1, "first run {}", i);
    }

    // the same ten writes again: every one is a duplicate now.
    tree.execute(Arc::clone(&batch));
    tree.flush();
    for i in 0..10 {
        assert_eq!(batch.read_at(i).unwrap().2, 0, "second run {}", i);
    }

    assert_eq!(tree.count(), 10);
    tree.validate().unwrap();

    // stored values are the first run's.
    let mut reads = tree.new_batch();
    for i in 0..10_u64 {
        reads.add_read(format!("dup-{:02}", i).as_bytes()).unwrap();
    }
    let reads = Arc::new(reads);
    tree.execute(Arc::clone(&reads));
    tree.flush();
    for i in 0..10_u64 {
        assert_eq!(reads.read_at(i as usize).unwrap().2, 100 + i, "{}", i);
    }
    tree.close().unwrap();
}

#[test]
fn test_palm_multi_batch_growth() {
    let tree = engine("test_palm_multi_batch_growth", 4, Descend::Lazy);
    let n = 20_000_u64;

    let mut batch = tree.new_batch();
    for i in 0..n {
        let key = format!("key-{:010}", i);
        if !batch.add_write(key.as_bytes(), i).unwrap() {
            tree.execute(Arc::new(std::mem::replace(&mut batch, tree.new_batch())));
            assert!(batch.add_write(key.as_bytes(), i).unwrap());
        }
    }
    tree.execute(Arc::new(batch));
    tree.flush();

    assert_eq!(tree.count() as u64, n);
    tree.validate().unwrap();

    // spot-read through the engine.
    let mut reads = tree.new_batch();
    let picks: Vec<u64> = (0..n).step_by(997).collect();
    for &i in picks.iter() {
        reads.add_read(format!("key-{:010}", i).as_bytes()).unwrap();
    }
    reads.add_read(b"key-absent").unwrap();
    let reads = Arc::new(reads);
    tree.execute(Arc::clone(&reads));
    tree.flush();

    for (at, &i) in picks.iter().enumerate() {
        assert_eq!(reads.read_at(at).unwrap().2, i, "{}", i);
    }
    assert_eq!(reads.read_at(picks.len()).unwrap().2, 0);
    tree.close().unwrap();
}

#[test]
fn test_palm_sequential_one_key_siblings() {
    // strictly ascending keys drive the sequential-insert optimization.
    let tree = engine("test_palm_sequential", 2, Descend::Lazy);
    let n = 5000_u64;

    let mut batch = tree.new_batch();
    for i in 0..n {
        let key = format!("{:012}", i);
        if !batch.add_write(key.as_bytes(), i).unwrap() {
            tree.execute(Arc::new(std::mem::replace(&mut batch, tree.new_batch())));
            assert!(batch.add_write(key.as_bytes(), i).unwrap());
        }
    }
    tree.execute(Arc::new(batch));
    tree.flush();

    assert_eq!(tree.count() as u64, n);
    tree.validate().unwrap();
    tree.close().unwrap();
}

#[test]
fn test_palm_policies_agree() {
    let seed: u64 = random();
    println!("test_palm_policies_agree seed {}", seed);

    let mut counts = vec![];
    for (policy, name) in [
        (Descend::Lazy, "test_palm_lazy"),
        (Descend::Level, "test_palm_level"),
        (Descend::Zigzag, "test_palm_zigzag"),
    ]
    .iter()
    {
        let mut rng = SmallRng::seed_from_u64(seed);
        let tree = engine(name, 4, *policy);
        let mut model: BTreeMap<Vec<u8>, u64> = BTreeMap::new();

        for _round in 0..5 {
            let mut batch = tree.new_batch();
            loop {
                let key = format!("{:06}", rng.gen_range(0..3000_u64));
                let value: u64 = rng.gen();
                if !batch.add_write(key.as_bytes(), value).unwrap() {
                    break;
                }
                model.entry(key.into_bytes()).or_insert(value);
            }
            tree.execute(Arc::new(batch));
        }
        tree.flush();

        assert_eq!(tree.count(), model.len(), "{}", name);
        tree.validate().unwrap();

        let mut reads = tree.new_batch();
        let keys: Vec<&Vec<u8>> = model.keys().take(500).collect();
        for key in keys.iter() {
            reads.add_read(key.as_slice()).unwrap();
        }
        let reads = Arc::new(reads);
        tree.execute(Arc::clone(&reads));
        tree.flush();
        for (i, key) in keys.iter().enumerate() {
            assert_eq!(reads.read_at(i).unwrap().2, model[key.as_slice()], "{}", name);
        }

        counts.push(model.len());
        tree.close().unwrap();
    }

    // identical workloads end in identical key populations.
    assert!(counts.windows(2).all(|w| w[0] == w[1]));
}

#[test]
fn test_palm_single_worker() {
    let tree = engine("test_palm_single_worker", 1, Descend::Level);

    let mut batch = tree.new_batch();
    for i in 0..1000_u64 {
        batch.add_write(format!("{:08}", i).as_bytes(), i).unwrap();
    }
    let batch = Arc::new(batch);
    tree.execute(Arc::clone(&batch));
    tree.flush();

    for i in 0..1000 {
        assert_eq!(batch.read_at(i).unwrap().2, 1);
    }
    assert_eq!(tree.count(), 1000);
    tree.validate().unwrap();
    tree.close().unwrap();
}

#[test]
fn test_palm_duplicates_within_batch() {
    let tree = engine("test_palm_duplicates_within_batch", 4, Descend::Lazy);

    let mut batch = tree.new_batch();
    batch.add_write(b"same", 1).unwrap();
    batch.add_write(b"same", 2).unwrap();
    batch.add_read(b"same").unwrap();
    let batch = Arc::new(batch);
    tree.execute(Arc::clone(&batch));
    tree.flush();

    // first arrival wins, the second reports duplicate.
    assert_eq!(batch.read_at(0).unwrap().2, 1);
    assert_eq!(batch.read_at(1).unwrap().2, 0);
    assert_eq!(batch.read_at(2).unwrap().2, 1);

    let mut reads = tree.new_batch();
    reads.add_read(b"same").unwrap();
    let reads = Arc::new(reads);
    tree.execute(Arc::clone(&reads));
    tree.flush();
    assert_eq!(reads.read_at(0).unwrap().2, 1);
    tree.close().unwrap();
}

#[test]
fn test_palm_empty_batch() {
    let tree = engine("test_palm_empty_batch", 4, Descend::Lazy);

    let batch = Arc::new(tree.new_batch());
    tree.execute(Arc::clone(&batch));
    tree.flush();

    assert_eq!(tree.count(), 0);
    tree.validate().unwrap();
    tree.close().unwrap();
}
