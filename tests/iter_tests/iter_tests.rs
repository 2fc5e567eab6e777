//! Tests for RegionIter and SubkeyIter

use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use subkv::{
    Engine, EngineContext, RegionConfig, Result, SetOptions, SubKvError, TransactionHandler,
    TransactionMode, TxRecord,
};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_engine() -> (TempDir, Engine) {
    let temp_dir = TempDir::new().unwrap();
    let config = RegionConfig::builder()
        .path(temp_dir.path().join("region.skv"))
        .build();
    let engine = Engine::open(config).unwrap();
    (temp_dir, engine)
}

/// Rejects everything, so every group lands in the recovery queue
struct Rejecting;

impl TransactionHandler for Rejecting {
    fn apply(&self, _record: &TxRecord) -> Result<()> {
        Err(SubKvError::Transaction("rejected".into()))
    }
}

fn keys_of(engine: &Engine, all: bool) -> BTreeSet<Vec<u8>> {
    let iter = if all { engine.iter_all() } else { engine.iter() };
    iter.map(|entry| entry.unwrap().key).collect()
}

// =============================================================================
// Region Iteration Tests
// =============================================================================

#[test]
fn test_iter_empty_region() {
    let (_temp, engine) = setup_temp_engine();
    assert_eq!(engine.iter().count(), 0);
    assert_eq!(engine.iter_all().count(), 0);
}

#[test]
fn test_iter_visits_every_key_once() {
    let (_temp, engine) = setup_temp_engine();

    let mut expected = BTreeSet::new();
    for i in 0..1500u32 {
        let key = format!("key-{:05}", i).into_bytes();
        engine.set(&key, &i.to_le_bytes()).unwrap();
        expected.insert(key);
    }

    let mut seen = Vec::new();
    for entry in engine.iter() {
        let entry = entry.unwrap();
        let i = u32::from_le_bytes(entry.value.as_slice().try_into().unwrap());
        assert_eq!(entry.key, format!("key-{:05}", i).into_bytes());
        seen.push(entry.key);
    }

    assert_eq!(seen.len(), expected.len());
    assert_eq!(seen.into_iter().collect::<BTreeSet<_>>(), expected);
}

#[test]
fn test_iter_carries_subkeys_and_attributes() {
    let (_temp, engine) = setup_temp_engine();
    let subkeys = [b"b".as_slice(), b"a".as_slice()];
    engine
        .set_with(b"parent", b"v", Some(subkeys.as_slice()), &SetOptions::new())
        .unwrap();

    let entries: Vec<_> = engine.iter().map(|e| e.unwrap()).collect();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].subkeys, vec![b"a".to_vec(), b"b".to_vec()]);

    let attrs = entries[0].attributes.as_ref().unwrap();
    assert_eq!(Some(attrs), engine.get_attributes(b"parent").unwrap().as_ref());
    assert_eq!(entries[0].raw_attributes, attrs.encode().unwrap());
}

#[test]
fn test_iter_skips_internal_queue_keys() {
    let temp_dir = TempDir::new().unwrap();
    let ctx = Arc::new(EngineContext::new());
    ctx.register_handler("rejecting", Arc::new(Rejecting));

    let config = RegionConfig::builder()
        .path(temp_dir.path().join("region.skv"))
        .transaction_mode(TransactionMode::Sync)
        .transaction_handler("rejecting")
        .build();
    let engine = Engine::open_with_context(config, ctx).unwrap();

    engine.set(b"a", b"1").unwrap();
    engine.set(b"b", b"2").unwrap();

    let stats = engine.transactions().stats().unwrap();
    assert_eq!(stats.failed, 2);
    assert_eq!(stats.recovery, 2);
    assert!(engine.stats().unwrap().live_elements > 2);

    let expected: BTreeSet<Vec<u8>> = [b"a".to_vec(), b"b".to_vec()].into_iter().collect();
    assert_eq!(keys_of(&engine, false), expected);
    assert_eq!(keys_of(&engine, true), expected);
}

#[test]
fn test_iter_all_includes_expired_keys() {
    let (_temp, engine) = setup_temp_engine();

    engine.set(b"live", b"1").unwrap();
    engine
        .set_with(b"stale", b"2", None, &SetOptions::new().ttl(Duration::from_millis(1)))
        .unwrap();
    thread::sleep(Duration::from_millis(20));

    assert_eq!(keys_of(&engine, false), [b"live".to_vec()].into_iter().collect());
    assert_eq!(
        keys_of(&engine, true),
        [b"live".to_vec(), b"stale".to_vec()].into_iter().collect()
    );
}

#[test]
fn test_iter_body_may_mutate_region() {
    let (_temp, engine) = setup_temp_engine();
    for i in 0..50u32 {
        engine.set(format!("k{}", i).as_bytes(), b"x").unwrap();
    }

    for entry in engine.iter() {
        let entry = entry.unwrap();
        engine.remove(&entry.key, false).unwrap();
    }
    assert_eq!(engine.stats().unwrap().live_elements, 0);
}

// =============================================================================
// Cursor API Tests
// =============================================================================

#[test]
fn test_advance_and_accessors() {
    let (_temp, engine) = setup_temp_engine();
    engine.set(b"only", b"value").unwrap();

    let mut iter = engine.iter();
    assert!(iter.key().is_err());

    assert!(iter.advance().unwrap());
    assert_eq!(iter.key().unwrap(), b"only");
    assert_eq!(iter.value().unwrap(), b"value");
    assert!(iter.subkeys().unwrap().is_empty());
    assert!(iter.attributes().unwrap().is_some());
    assert_eq!(iter.entry().unwrap().value, b"value");

    assert!(!iter.advance().unwrap());
    assert!(!iter.advance().unwrap());
    assert!(matches!(iter.key(), Err(SubKvError::InvalidArgument(_))));
}

#[test]
fn test_positioned_iterator_allows_readers() {
    let (_temp, engine) = setup_temp_engine();
    engine.set(b"k", b"v").unwrap();

    let mut iter = engine.iter();
    assert!(iter.advance().unwrap());
    // Shared locks stack with other readers
    assert_eq!(engine.get(b"k").unwrap(), Some(b"v".to_vec()));
    drop(iter);

    engine.set(b"k", b"w").unwrap();
    assert_eq!(engine.get(b"k").unwrap(), Some(b"w".to_vec()));
}

// =============================================================================
// Subkey Iteration Tests
// =============================================================================

#[test]
fn test_subkey_iter_skips_missing_children() {
    let (_temp, engine) = setup_temp_engine();

    let children = [
        b"c1".as_slice(),
        b"gone".as_slice(),
        b"c2".as_slice(),
        b"old".as_slice(),
    ];
    engine
        .set_with(b"parent", b"p", Some(children.as_slice()), &SetOptions::new())
        .unwrap();
    engine.set(b"c1", b"one").unwrap();
    engine.set(b"c2", b"two").unwrap();
    engine
        .set_with(b"old", b"o", None, &SetOptions::new().ttl(Duration::from_millis(1)))
        .unwrap();
    thread::sleep(Duration::from_millis(20));

    let entries: Vec<_> = engine
        .iter_subkeys(b"parent")
        .unwrap()
        .map(|e| e.unwrap())
        .collect();
    let keys: Vec<_> = entries.iter().map(|e| e.key.clone()).collect();
    assert_eq!(keys, vec![b"c1".to_vec(), b"c2".to_vec()]);
    assert_eq!(entries[1].value, b"two");
}

#[test]
fn test_subkey_iter_of_missing_parent() {
    let (_temp, engine) = setup_temp_engine();
    assert!(matches!(
        engine.iter_subkeys(b"nobody"),
        Err(SubKvError::KeyNotFound)
    ));
}
