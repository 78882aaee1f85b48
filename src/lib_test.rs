use arbitrary::{Arbitrary, Unstructured};
use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use super::*;

#[test]
fn test_config_clamp() {
    let seed: u64 = random();
    println!("test_config_clamp seed {}", seed);
    let mut rng = SmallRng::seed_from_u64(seed);

    for _i in 0..1000 {
        let bytes: Vec<u8> = (0..64).map(|_| rng.gen()).collect();
        let mut uns = Unstructured::new(&bytes);
        let config = Config::arbitrary(&mut uns).unwrap().into_clamped();

        assert!(config.node_size >= NODE_MIN_SIZE, "{}", config.node_size);
        assert!(config.node_size <= NODE_MAX_SIZE, "{}", config.node_size);
        assert_eq!(config.node_size % NODE_MIN_SIZE, 0);
        assert!(config.batch_size >= NODE_MIN_SIZE, "{}", config.batch_size);
        assert!(config.batch_size <= NODE_MAX_SIZE, "{}", config.batch_size);
        assert_eq!(config.batch_size % NODE_MIN_SIZE, 0);
        assert!(config.max_key_size >= 1);
        assert!(config.max_key_size <= MAX_KEY_SIZE);
    }
}

#[test]
fn test_config_default() {
    let config = Config::new();
    assert_eq!(config.node_size, NODE_MIN_SIZE);
    assert_eq!(config.batch_size, NODE_MIN_SIZE);
    assert_eq!(config.max_key_size, MAX_KEY_SIZE);
}

#[test]
fn test_config_from_toml() {
    let text = "node_size = 8192\nbatch_size = 100000\n";
    let config = Config::from_toml_str(text).unwrap();
    assert_eq!(config.node_size, 8192);
    assert_eq!(config.batch_size, NODE_MAX_SIZE);
    assert_eq!(config.max_key_size, MAX_KEY_SIZE);

    let config = Config::from_toml_str("").unwrap();
    assert_eq!(config, Config::default());

    assert!(Config::from_toml_str("node_size = \"big\"").is_err());
}

#[test]
fn test_config_set() {
    let mut config = Config::new();
    config.set_node_size(0).set_batch_size(1 << 20).set_max_key_size(1024);
    assert_eq!(config.node_size, NODE_MIN_SIZE);
    assert_eq!(config.batch_size, NODE_MAX_SIZE);
    assert_eq!(config.max_key_size, MAX_KEY_SIZE);

    config.set_node_size(5000);
    assert_eq!(config.node_size, 4096);
}
