//! Tests for transaction dispatch through the engine

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use subkv::{
    CommandType, Engine, EngineContext, OpenMode, RegionConfig, Result, SubKvError,
    TransactionHandler, TransactionMode, TxRecord,
};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

/// Records every group; can be switched to reject and to stall
#[derive(Default)]
struct Recorder {
    groups: Mutex<Vec<Vec<TxRecord>>>,
    reject: AtomicBool,
    slow: AtomicBool,
}

impl Recorder {
    fn keys(&self) -> Vec<Vec<u8>> {
        self.groups
            .lock()
            .iter()
            .flat_map(|group| group.iter().map(|r| r.key.clone()))
            .collect()
    }
}

impl TransactionHandler for Recorder {
    fn apply(&self, record: &TxRecord) -> Result<()> {
        self.apply_group(std::slice::from_ref(record))
    }

    fn apply_group(&self, records: &[TxRecord]) -> Result<()> {
        if self.slow.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(5));
        }
        if self.reject.load(Ordering::SeqCst) {
            return Err(SubKvError::Transaction("handler offline".into()));
        }
        self.groups.lock().push(records.to_vec());
        Ok(())
    }
}

fn engine_with(
    dir: &TempDir,
    mode: TransactionMode,
    recorder: &Arc<Recorder>,
) -> (Arc<EngineContext>, Engine) {
    let ctx = Arc::new(EngineContext::new());
    ctx.register_handler("recorder", recorder.clone());
    let config = RegionConfig::builder()
        .path(dir.path().join("region.skv"))
        .transaction_mode(mode)
        .transaction_handler("recorder")
        .queue_poll_ms(5)
        .build();
    let engine = Engine::open_with_context(config, ctx.clone()).unwrap();
    (ctx, engine)
}

// =============================================================================
// Sync Mode Tests
// =============================================================================

#[test]
fn test_sync_dispatch_is_inline() {
    let temp = TempDir::new().unwrap();
    let recorder = Arc::new(Recorder::default());
    let (_ctx, engine) = engine_with(&temp, TransactionMode::Sync, &recorder);

    engine.set(b"k", b"v").unwrap();
    assert_eq!(recorder.keys(), vec![b"k".to_vec()]);

    engine.set(b"k", b"w").unwrap();
    let groups = recorder.groups.lock().clone();
    assert_eq!(groups.len(), 2);
    let commands: Vec<_> = groups[1].iter().map(|r| r.command).collect();
    assert_eq!(commands, vec![CommandType::Delete, CommandType::SetAll]);

    let stats = engine.transactions().stats().unwrap();
    assert_eq!(stats.dispatched, 2);
    assert_eq!(stats.applied, 2);
    assert_eq!(stats.pending, 0);
}

#[test]
fn test_cascade_remove_is_one_group() {
    let temp = TempDir::new().unwrap();
    let recorder = Arc::new(Recorder::default());
    let (_ctx, engine) = engine_with(&temp, TransactionMode::Sync, &recorder);

    engine.replace_subkeys(b"root", &[b"a".as_slice(), b"b".as_slice()]).unwrap();
    engine.set(b"a", b"1").unwrap();
    engine.set(b"b", b"2").unwrap();
    recorder.groups.lock().clear();

    engine.remove(b"root", true).unwrap();
    let groups = recorder.groups.lock().clone();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].len(), 3);
    assert!(groups[0].iter().all(|r| r.command == CommandType::Delete));
}

#[test]
fn test_handler_failure_does_not_undo_mutation() {
    let temp = TempDir::new().unwrap();
    let recorder = Arc::new(Recorder::default());
    let (_ctx, engine) = engine_with(&temp, TransactionMode::Sync, &recorder);

    recorder.reject.store(true, Ordering::SeqCst);
    engine.set(b"first", b"1").unwrap();
    engine.set(b"second", b"2").unwrap();
    assert_eq!(engine.get(b"first").unwrap(), Some(b"1".to_vec()));

    let stats = engine.transactions().stats().unwrap();
    assert_eq!(stats.failed, 2);
    assert_eq!(stats.recovery, 2);

    // Still offline: everything stays parked
    assert_eq!(engine.retry_failed().unwrap(), 0);
    assert_eq!(engine.transactions().stats().unwrap().recovery, 2);

    recorder.reject.store(false, Ordering::SeqCst);
    assert_eq!(engine.retry_failed().unwrap(), 2);
    assert_eq!(recorder.keys(), vec![b"second".to_vec(), b"first".to_vec()]);

    let stats = engine.transactions().stats().unwrap();
    assert_eq!(stats.retried, 2);
    assert_eq!(stats.recovery, 0);
}

#[test]
fn test_recovery_queue_survives_reattach() {
    let temp = TempDir::new().unwrap();
    let recorder = Arc::new(Recorder::default());

    {
        let (_ctx, engine) = engine_with(&temp, TransactionMode::Sync, &recorder);
        recorder.reject.store(true, Ordering::SeqCst);
        engine.set(b"k", b"v").unwrap();
        engine.close(None).unwrap();
    }

    recorder.reject.store(false, Ordering::SeqCst);
    let ctx = Arc::new(EngineContext::new());
    ctx.register_handler("recorder", recorder.clone());
    let config = RegionConfig::builder()
        .path(temp.path().join("region.skv"))
        .open_mode(OpenMode::Open)
        .transaction_mode(TransactionMode::Sync)
        .transaction_handler("recorder")
        .build();
    let engine = Engine::open_with_context(config, ctx).unwrap();

    assert_eq!(engine.transactions().stats().unwrap().recovery, 1);
    assert_eq!(engine.retry_failed().unwrap(), 1);
    assert_eq!(recorder.keys(), vec![b"k".to_vec()]);
}

// =============================================================================
// Async Mode Tests
// =============================================================================

#[test]
fn test_async_dispatch_drains_in_order() {
    let temp = TempDir::new().unwrap();
    let recorder = Arc::new(Recorder::default());
    let (_ctx, engine) = engine_with(&temp, TransactionMode::Async { workers: 1 }, &recorder);

    for i in 0..100u32 {
        engine.set(format!("k{:03}", i).as_bytes(), b"v").unwrap();
    }
    assert!(engine.transactions().wait_idle(Some(Duration::from_secs(10))).unwrap());

    let expected: Vec<_> = (0..100u32).map(|i| format!("k{:03}", i).into_bytes()).collect();
    assert_eq!(recorder.keys(), expected);

    let stats = engine.transactions().stats().unwrap();
    assert_eq!(stats.dispatched, 100);
    assert_eq!(stats.applied, 100);
    assert_eq!(stats.pending, 0);
}

#[test]
fn test_async_close_drains_queue() {
    let temp = TempDir::new().unwrap();
    let recorder = Arc::new(Recorder::default());
    recorder.slow.store(true, Ordering::SeqCst);
    let (_ctx, engine) = engine_with(&temp, TransactionMode::Async { workers: 3 }, &recorder);

    for i in 0..30u32 {
        engine.set(format!("k{}", i).as_bytes(), b"v").unwrap();
    }
    assert!(engine.close(None).unwrap());
    assert_eq!(recorder.groups.lock().len(), 30);
}

#[test]
fn test_async_close_with_timeout_keeps_leftovers() {
    let temp = TempDir::new().unwrap();
    let recorder = Arc::new(Recorder::default());
    recorder.slow.store(true, Ordering::SeqCst);

    {
        let (_ctx, engine) =
            engine_with(&temp, TransactionMode::Async { workers: 1 }, &recorder);
        for i in 0..200u32 {
            engine.set(format!("k{}", i).as_bytes(), b"v").unwrap();
        }
        assert!(!engine.close(Some(Duration::from_millis(20))).unwrap());
    }
    let delivered = recorder.groups.lock().len();
    assert!(delivered < 200);

    // A later attach picks the queue up where it stopped
    recorder.slow.store(false, Ordering::SeqCst);
    let (_ctx, engine) = engine_with(&temp, TransactionMode::Async { workers: 2 }, &recorder);
    assert!(engine.transactions().wait_idle(Some(Duration::from_secs(10))).unwrap());
    assert_eq!(recorder.groups.lock().len(), 200);
}

#[test]
fn test_async_failures_are_parked() {
    let temp = TempDir::new().unwrap();
    let recorder = Arc::new(Recorder::default());
    recorder.reject.store(true, Ordering::SeqCst);
    let (_ctx, engine) = engine_with(&temp, TransactionMode::Async { workers: 2 }, &recorder);

    engine.set(b"a", b"1").unwrap();
    engine.set(b"b", b"2").unwrap();
    assert!(engine.transactions().wait_idle(Some(Duration::from_secs(10))).unwrap());

    let stats = engine.transactions().stats().unwrap();
    assert_eq!(stats.failed, 2);
    assert_eq!(stats.recovery, 2);

    recorder.reject.store(false, Ordering::SeqCst);
    assert_eq!(engine.retry_failed().unwrap(), 2);
    assert_eq!(recorder.groups.lock().len(), 2);
}

#[test]
fn test_disabled_mode_reports_nothing() {
    let temp = TempDir::new().unwrap();
    let config = RegionConfig::builder()
        .path(temp.path().join("region.skv"))
        .build();
    let engine = Engine::open(config).unwrap();

    engine.set(b"k", b"v").unwrap();
    assert_eq!(engine.transactions().mode(), TransactionMode::Disabled);
    assert_eq!(engine.transactions().stats().unwrap().dispatched, 0);
    assert_eq!(engine.retry_failed().unwrap(), 0);
    assert!(engine.transactions().wait_idle(Some(Duration::ZERO)).unwrap());
}
