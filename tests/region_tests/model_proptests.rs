//! Property tests: the engine behaves like an in-memory map

use std::collections::{BTreeMap, BTreeSet};

use proptest::prelude::*;
use subkv::{Engine, RegionConfig};

#[derive(Debug, Clone)]
enum Op {
    Set(Vec<u8>, Vec<u8>),
    Remove(Vec<u8>),
    Rename(Vec<u8>, Vec<u8>),
    Truncate(Vec<u8>, u64),
    Get(Vec<u8>),
    Compact,
}

fn key_strategy() -> impl Strategy<Value = Vec<u8>> + Clone {
    // A leading zero byte is reserved for internal keys
    (1u8..=255, prop::collection::vec(any::<u8>(), 0..=6)).prop_map(|(first, rest)| {
        let mut key = vec![first % 8 + b'a'];
        key.extend(rest.into_iter().map(|b| b % 4));
        key
    })
}

fn ops_strategy() -> impl Strategy<Value = Vec<Op>> {
    let key = key_strategy();
    let value = prop::collection::vec(any::<u8>(), 0..=700);
    let op = prop_oneof![
        40 => (key.clone(), value).prop_map(|(k, v)| Op::Set(k, v)),
        15 => key.clone().prop_map(Op::Remove),
        10 => (key.clone(), key.clone()).prop_map(|(a, b)| Op::Rename(a, b)),
        10 => (key.clone(), 0u64..900).prop_map(|(k, len)| Op::Truncate(k, len)),
        24 => key.clone().prop_map(Op::Get),
        1 => Just(Op::Compact),
    ];
    prop::collection::vec(op, 0..=300)
}

fn small_engine() -> Engine {
    let config = RegionConfig::builder()
        .anonymous()
        .min_mask(0x1)
        .max_element_count(3)
        .initial_elements(8)
        .initial_pages(8)
        .build();
    Engine::open(config).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_engine_matches_model(ops in ops_strategy()) {
        let engine = small_engine();
        let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();

        for op in ops {
            match op {
                Op::Set(key, value) => {
                    engine.set(&key, &value).unwrap();
                    model.insert(key, value);
                }
                Op::Remove(key) => {
                    let removed = engine.remove(&key, false).unwrap();
                    prop_assert_eq!(removed, model.remove(&key).is_some());
                }
                Op::Rename(old, new) => {
                    let result = engine.rename(&old, &new);
                    match model.remove(&old) {
                        Some(value) => {
                            prop_assert!(result.is_ok());
                            model.insert(new, value);
                        }
                        None => prop_assert!(result.is_err()),
                    }
                }
                Op::Truncate(key, len) => {
                    let result = engine.truncate(&key, len);
                    match model.get_mut(&key) {
                        Some(value) => {
                            prop_assert!(result.is_ok());
                            value.resize(len as usize, 0);
                        }
                        None => prop_assert!(result.is_err()),
                    }
                }
                Op::Get(key) => {
                    let stored = engine.get(&key).unwrap();
                    prop_assert_eq!(stored, model.get(&key).cloned());
                }
                Op::Compact => {
                    engine.compact().unwrap();
                }
            }
        }

        prop_assert_eq!(engine.stats().unwrap().live_elements, model.len() as u64);
        let keys: BTreeSet<Vec<u8>> = engine.iter().map(|e| e.unwrap().key).collect();
        prop_assert_eq!(keys, model.keys().cloned().collect::<BTreeSet<_>>());
        for (key, value) in &model {
            let stored = engine.get(key).unwrap();
            prop_assert_eq!(stored.as_deref(), Some(value.as_slice()));
        }
        let report = engine.verify().unwrap();
        prop_assert!(report.is_clean(), "{:?}", report.problems);
    }
}
