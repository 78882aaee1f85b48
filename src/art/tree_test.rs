use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use std::{collections::BTreeMap, thread};

use super::*;

#[test]
fn test_art_prefix_expand() {
    let index = Index::new("test_art_prefix_expand", Config::new());

    assert_eq!(index.put(b"helloworld", 1).unwrap(), Wr::Inserted);
    assert_eq!(index.put(b"help!", 2).unwrap(), Wr::Inserted);

    assert_eq!(index.get(b"helloworld").unwrap(), Some(1));
    assert_eq!(index.get(b"help!").unwrap(), Some(2));
    assert_eq!(index.get(b"hello").unwrap(), None);
    assert_eq!(index.get(b"hel").unwrap(), None);
    index.validate().unwrap();
}

#[test]
fn test_art_key_is_path_prefix() {
    let index = Index::new("test_art_key_is_path_prefix", Config::new());

    index.put(b"helloworld", 1).unwrap();
    index.put(b"help!", 2).unwrap();
    // lands exactly on the shared-prefix node.
    index.put(b"hel", 3).unwrap();

    assert_eq!(index.get(b"hel").unwrap(), Some(3));
    assert_eq!(index.get(b"helloworld").unwrap(), Some(1));
    assert_eq!(index.get(b"help!").unwrap(), Some(2));
    assert_eq!(index.len(), 3);
    index.validate().unwrap();
}

#[test]
fn test_art_duplicate() {
    let index = Index::new("test_art_duplicate", Config::new());

    assert_eq!(index.put(b"key", 1).unwrap(), Wr::Inserted);
    assert_eq!(index.put(b"key", 2).unwrap(), Wr::Duplicate);
    assert_eq!(index.get(b"key").unwrap(), Some(1));
    assert_eq!(index.len(), 1);
}

#[test]
fn test_art_invalid_key() {
    let index = Index::new("test_art_invalid_key", Config::new());

    assert!(index.put(b"", 1).is_err());
    assert!(index.put(&[7_u8; 256], 1).is_err());
    assert!(index.get(b"").is_err());
}

#[test]
fn test_art_node_growth() {
    let index = Index::new("test_art_node_growth", Config::new());

    // 255 distinct first bytes push the root through every variant up
    // to the 256-way node.
    for i in 1..=255_u8 {
        assert_eq!(index.put(&[i], i as u64).unwrap(), Wr::Inserted);
    }
    for i in 1..=255_u8 {
        assert_eq!(index.get(&[i]).unwrap(), Some(i as u64), "{}", i);
    }
    assert_eq!(index.len(), 255);
    index.validate().unwrap();
}

#[test]
fn test_art_long_shared_prefix() {
    let index = Index::new("test_art_long_shared_prefix", Config::new());

    // the 20-byte shared run does not fit one inline prefix.
    let k1 = b"0123456789abcdefghijXXX";
    let k2 = b"0123456789abcdefghijYYY";
    assert_eq!(index.put(k1, 1).unwrap(), Wr::Inserted);
    assert_eq!(index.put(k2, 2).unwrap(), Wr::Inserted);

    assert_eq!(index.get(k1).unwrap(), Some(1));
    assert_eq!(index.get(k2).unwrap(), Some(2));
    assert_eq!(index.get(b"0123456789abcdefghijZZZ").unwrap(), None);
    assert_eq!(index.get(b"0123456789").unwrap(), None);
    index.validate().unwrap();
}

#[test]
fn test_art_random_against_btreemap() {
    let seed: u64 = random();
    println!("test_art_random_against_btreemap seed {}", seed);
    let mut rng = SmallRng::seed_from_u64(seed);

    let index = Index::new("test_art_random", Config::new());
    let mut model: BTreeMap<Vec<u8>, u64> = BTreeMap::new();

    for _i in 0..20_000 {
        let klen = rng.gen_range(1..=16);
        let key: Vec<u8> = (0..klen).map(|_| rng.gen_range(b'a'..=b'd')).collect();
        let value: u64 = rng.gen();

        let wr = index.put(&key, value).unwrap();
        match model.insert(key.clone(), value) {
            None => assert_eq!(wr, Wr::Inserted, "{:?}", key),
            Some(old) => {
                assert_eq!(wr, Wr::Duplicate, "{:?}", key);
                model.insert(key, old);
            }
        }
    }

    assert_eq!(index.len(), model.len());
    for (key, value) in model.iter() {
        assert_eq!(index.get(key).unwrap(), Some(*value), "{:?}", key);
    }
    index.validate().unwrap();
}

#[test]
fn test_art_insert_order_invariance() {
    let seed: u64 = random();
    println!("test_art_insert_order_invariance seed {}", seed);
    let mut rng = SmallRng::seed_from_u64(seed);

    let mut keys: Vec<u64> = (0..3000).collect();

    let forward = Index::new("test_art_forward", Config::new());
    for &i in keys.iter() {
        forward.put(format!("node/{:06}", i).as_bytes(), i).unwrap();
    }

    for i in (1..keys.len()).rev() {
        let j = rng.gen_range(0..=i);
        keys.swap(i, j);
    }
    let shuffled = Index::new("test_art_shuffled", Config::new());
    for &i in keys.iter() {
        shuffled.put(format!("node/{:06}", i).as_bytes(), i).unwrap();
    }

    assert_eq!(forward.len(), shuffled.len());
    for i in 0..3000_u64 {
        let key = format!("node/{:06}", i);
        assert_eq!(
            forward.get(key.as_bytes()).unwrap(),
            shuffled.get(key.as_bytes()).unwrap(),
            "{}",
            key
        );
    }
}

#[test]
fn test_art_concurrent_writers() {
    let index = Index::new("test_art_concurrent_writers", Config::new());
    let (n_threads, n_keys) = (8_u64, 2000_u64);

    let mut handles = vec![];
    for id in 0..n_threads {
        let index = index.clone();
        handles.push(thread::spawn(move || {
            for i in 0..n_keys {
                let key = format!("{:02}-{:08}", id, i);
                assert_eq!(index.put(key.as_bytes(), id * n_keys + i).unwrap(), Wr::Inserted);
            }
        }));
    }
    for handle in handles.into_iter() {
        handle.join().unwrap();
    }

    assert_eq!(index.len() as u64, n_threads * n_keys);
    for id in 0..n_threads {
        for i in 0..n_keys {
            let key = format!("{:02}-{:08}", id, i);
            assert_eq!(index.get(key.as_bytes()).unwrap(), Some(id * n_keys + i), "{}", key);
        }
    }
    index.validate().unwrap();
}

#[test]
fn test_art_concurrent_readers_writers() {
    let seed: u64 = random();
    println!("test_art_concurrent_readers_writers seed {}", seed);

    let index = Index::new("test_art_rw", Config::new());
    let (n_writers, n_readers, n_keys) = (4_u64, 4_u64, 2000_u64);

    let mut handles = vec![];
    for id in 0..n_writers {
        let index = index.clone();
        handles.push(thread::spawn(move || {
            for i in 0..n_keys {
                let key = format!("{:02}-{:08}", id, i);
                index.put(key.as_bytes(), i).unwrap();
            }
        }));
    }

    let mut readers = vec![];
    for rid in 0..n_readers {
        let index = index.clone();
        let seed = seed + rid;
        readers.push(thread::spawn(move || {
            let mut rng = SmallRng::seed_from_u64(seed);
            for _i in 0..10_000 {
                let id = rng.gen_range(0..n_writers);
                let i = rng.gen_range(0..n_keys);
                let key = format!("{:02}-{:08}", id, i);
                match index.get(key.as_bytes()).unwrap() {
                    None => (),
                    Some(value) => assert_eq!(value, i, "{}", key),
                }
            }
        }));
    }

    for handle in handles.into_iter() {
        handle.join().unwrap();
    }
    for handle in readers.into_iter() {
        handle.join().unwrap();
    }

    assert_eq!(index.len() as u64, n_writers * n_keys);
    index.validate().unwrap();
}
