use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use std::{collections::BTreeMap, thread};

use super::*;

#[test]
fn test_mass_basic() {
    let index = Index::new("test_mass_basic", Config::new());

    assert_eq!(index.put(b"hello", 1).unwrap(), Wr::Inserted);
    assert_eq!(index.put(b"world", 2).unwrap(), Wr::Inserted);
    assert_eq!(index.put(b"hello", 9).unwrap(), Wr::Duplicate);

    assert_eq!(index.get(b"hello").unwrap(), Some(1));
    assert_eq!(index.get(b"world").unwrap(), Some(2));
    assert_eq!(index.get(b"missing").unwrap(), None);
    assert_eq!(index.len(), 2);
    index.validate().unwrap();
}

#[test]
fn test_mass_layer_creation() {
    let index = Index::new("test_mass_layer_creation", Config::new());

    // identical first slice, the conflict moves into a deeper layer.
    assert_eq!(index.put(b"aaaaaaaaX", 1).unwrap(), Wr::Inserted);
    assert_eq!(index.put(b"aaaaaaaaY", 2).unwrap(), Wr::Inserted);

    assert_eq!(index.get(b"aaaaaaaaX").unwrap(), Some(1));
    assert_eq!(index.get(b"aaaaaaaaY").unwrap(), Some(2));
    assert_eq!(index.get(b"aaaaaaaaZ").unwrap(), None);
    assert_eq!(index.get(b"aaaaaaaa").unwrap(), None);
    assert_eq!(index.len(), 2);
    index.validate().unwrap();
}

#[test]
fn test_mass_layer_chain() {
    let index = Index::new("test_mass_layer_chain", Config::new());

    // 24 shared bytes force a chain of layers before the keys separate.
    let k1 = b"012345670123456701234567suffix-a";
    let k2 = b"012345670123456701234567suffix-b";
    assert_eq!(index.put(k1, 1).unwrap(), Wr::Inserted);
    assert_eq!(index.put(k2, 2).unwrap(), Wr::Inserted);

    assert_eq!(index.get(k1).unwrap(), Some(1));
    assert_eq!(index.get(k2).unwrap(), Some(2));
    assert_eq!(index.get(b"012345670123456701234567suffix-c").unwrap(), None);
    assert_eq!(index.get(b"01234567").unwrap(), None);
    index.validate().unwrap();
}

#[test]
fn test_mass_short_and_long_keys() {
    let index = Index::new("test_mass_short_and_long", Config::new());

    assert_eq!(index.put(b"a", 1).unwrap(), Wr::Inserted);
    assert_eq!(index.put(b"abcdefgh", 2).unwrap(), Wr::Inserted);
    assert_eq!(index.put(b"abcdefghi", 3).unwrap(), Wr::Inserted);

    assert_eq!(index.get(b"a").unwrap(), Some(1));
    assert_eq!(index.get(b"abcdefgh").unwrap(), Some(2));
    assert_eq!(index.get(b"abcdefghi").unwrap(), Some(3));
    assert_eq!(index.get(b"abcdefg").unwrap(), None);
    index.validate().unwrap();
}

#[test]
fn test_mass_border_split() {
    let index = Index::new("test_mass_border_split", Config::new());

    // 100 distinct first slices overflow the 15-slot border repeatedly,
    // growing interior nodes and the layer root.
    for i in 0..100_u64 {
        let key = format!("{:08}", i);
        assert_eq!(index.put(key.as_bytes(), i).unwrap(), Wr::Inserted);
    }
    for i in 0..100_u64 {
        let key = format!("{:08}", i);
        assert_eq!(index.get(key.as_bytes()).unwrap(), Some(i), "{}", key);
    }
    assert_eq!(index.len(), 100);
    index.validate().unwrap();
}

#[test]
fn test_mass_random_against_btreemap() {
    let seed: u64 = random();
    println!("test_mass_random_against_btreemap seed {}", seed);
    let mut rng = SmallRng::seed_from_u64(seed);

    let index = Index::new("test_mass_random", Config::new());
    let mut model: BTreeMap<Vec<u8>, u64> = BTreeMap::new();

    for _i in 0..20_000 {
        let klen = rng.gen_range(1..=24);
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
fn test_mass_insert_order_invariance() {
    let seed: u64 = random();
    println!("test_mass_insert_order_invariance seed {}", seed);
    let mut rng = SmallRng::seed_from_u64(seed);

    let mut keys: Vec<u64> = (0..3000).collect();

    let forward = Index::new("test_mass_forward", Config::new());
    for &i in keys.iter() {
        forward.put(format!("key-{:012}", i).as_bytes(), i).unwrap();
    }

    for i in (1..keys.len()).rev() {
        let j = rng.gen_range(0..=i);
        keys.swap(i, j);
    }
    let shuffled = Index::new("test_mass_shuffled", Config::new());
    for &i in keys.iter() {
        shuffled.put(format!("key-{:012}", i).as_bytes(), i).unwrap();
    }

    assert_eq!(forward.len(), shuffled.len());
    for i in 0..3000_u64 {
        let key = format!("key-{:012}", i);
        assert_eq!(
            forward.get(key.as_bytes()).unwrap(),
            shuffled.get(key.as_bytes()).unwrap(),
            "{}",
            key
        );
    }
}

#[test]
fn test_mass_invalid_key() {
    let index = Index::new("test_mass_invalid_key", Config::new());

    assert!(index.put(b"", 1).is_err());
    assert!(index.put(&[7_u8; 256], 1).is_err());
    assert!(index.get(b"").is_err());
}

#[test]
fn test_mass_concurrent_writers() {
    let index = Index::new("test_mass_concurrent_writers", Config::new());
    let (n_threads, n_keys) = (8_u64, 2000_u64);

    let mut handles = vec![];
    for id in 0..n_threads {
        let index = index.clone();
        handles.push(thread::spawn(move || {
            for i in 0..n_keys {
                let key = format!("{:02}-{:010}", id, i);
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
            let key = format!("{:02}-{:010}", id, i);
            assert_eq!(index.get(key.as_bytes()).unwrap(), Some(id * n_keys + i), "{}", key);
        }
    }
    index.validate().unwrap();
}

#[test]
fn test_mass_concurrent_readers_writers() {
    let seed: u64 = random();
    println!("test_mass_concurrent_readers_writers seed {}", seed);

    let index = Index::new("test_mass_rw", Config::new());
    let (n_writers, n_readers, n_keys) = (4_u64, 4_u64, 2000_u64);

    let mut handles = vec![];
    for id in 0..n_writers {
        let index = index.clone();
        handles.push(thread::spawn(move || {
            for i in 0..n_keys {
                // shared slice prefixes force concurrent layer work.
                let key = format!("shard-{:02}-{:010}", id, i);
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
                let key = format!("shard-{:02}-{:010}", id, i);
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
