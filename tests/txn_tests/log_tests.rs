//! Tests for the transaction log: capture, replay and snapshots

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use subkv::{
    replay, save_log, CommandType, Engine, ErrorPolicy, LogFileHandler, LogReader, RegionConfig,
    SetOptions, SubKvError, TransactionHandler, TransactionMode, TxRecord, RECORD_HEADER_SIZE,
};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn logged_engine(dir: &Path, history: bool) -> Engine {
    let config = RegionConfig::builder()
        .path(dir.join("source.skv"))
        .transaction_mode(TransactionMode::Sync)
        .log_path(dir.join("tx.log"))
        .history(history)
        .build();
    Engine::open(config).unwrap()
}

fn fresh_engine(dir: &Path, name: &str) -> Engine {
    let config = RegionConfig::builder().path(dir.join(name)).build();
    Engine::open(config).unwrap()
}

fn read_log(path: &Path) -> Vec<TxRecord> {
    LogReader::open(path)
        .unwrap()
        .collect::<subkv::Result<Vec<_>>>()
        .unwrap()
}

fn names<'a>(list: &[&'a str]) -> Vec<&'a [u8]> {
    list.iter().map(|name| name.as_bytes()).collect()
}

// =============================================================================
// Capture Tests
// =============================================================================

#[test]
fn test_set_and_replace_are_logged() {
    let temp = TempDir::new().unwrap();
    let engine = logged_engine(temp.path(), false);

    engine.set(b"k", b"v1").unwrap();
    engine.set(b"k", b"v2").unwrap();
    engine.remove(b"k", false).unwrap();
    assert!(engine.close(None).unwrap());

    let commands: Vec<_> = read_log(&temp.path().join("tx.log"))
        .iter()
        .map(|r| r.command)
        .collect();
    assert_eq!(
        commands,
        vec![
            CommandType::SetAll,
            CommandType::Delete,
            CommandType::SetAll,
            CommandType::Delete,
        ]
    );
}

#[test]
fn test_history_remove_is_logged_as_rename() {
    let temp = TempDir::new().unwrap();
    let engine = logged_engine(temp.path(), true);

    engine.set(b"doc", b"body").unwrap();
    engine.remove(b"doc", false).unwrap();
    drop(engine);

    let records = read_log(&temp.path().join("tx.log"));
    assert_eq!(records.len(), 3);
    assert_eq!(records[1].command, CommandType::Rename);
    assert_eq!(records[1].key, b"doc");
    assert!(records[1].new_key().starts_with(b"doc\0"));
    assert_eq!(records[2].command, CommandType::ReplaceAttrs);
    assert_eq!(records[2].key, records[1].new_key());
}

#[test]
fn test_read_only_attach_does_not_log() {
    let temp = TempDir::new().unwrap();
    let engine = logged_engine(temp.path(), false);
    engine.set(b"k", b"v").unwrap();
    engine.sync().unwrap();

    let config = RegionConfig::builder()
        .path(temp.path().join("source.skv"))
        .read_only(true)
        .transaction_mode(TransactionMode::Sync)
        .log_path(temp.path().join("tx.log"))
        .build();
    let reader = Engine::open(config).unwrap();
    assert_eq!(reader.transactions().mode(), TransactionMode::Disabled);
    assert_eq!(reader.get(b"k").unwrap(), Some(b"v".to_vec()));
}

#[test]
fn test_transactions_need_a_handler() {
    let temp = TempDir::new().unwrap();
    let config = RegionConfig::builder()
        .path(temp.path().join("region.skv"))
        .transaction_mode(TransactionMode::Sync)
        .build();
    assert!(matches!(Engine::open(config), Err(SubKvError::Config(_))));

    let config = RegionConfig::builder()
        .path(temp.path().join("region.skv"))
        .transaction_mode(TransactionMode::Sync)
        .transaction_handler("unregistered")
        .build();
    assert!(matches!(Engine::open(config), Err(SubKvError::Config(_))));
}

// =============================================================================
// Replay Tests
// =============================================================================

#[test]
fn test_replay_rebuilds_region() {
    let temp = TempDir::new().unwrap();
    let source = logged_engine(temp.path(), false);

    source
        .set_with(b"parent", b"p", Some(names(&["a", "b"]).as_slice()), &SetOptions::new())
        .unwrap();
    source.set(b"a", b"1").unwrap();
    source.set(b"b", b"2").unwrap();
    source.set(b"tmp", b"gone soon").unwrap();
    source.add_subkey(b"parent", b"c").unwrap();
    source.replace_value(b"a", b"one").unwrap();
    source.rename(b"b", b"bee").unwrap();
    source.truncate(b"parent", 0).unwrap();
    source.remove(b"tmp", false).unwrap();
    source.sync().unwrap();

    let target = fresh_engine(temp.path(), "target.skv");
    let stats = replay(&target, temp.path().join("tx.log"), ErrorPolicy::FailFast).unwrap();
    assert_eq!(stats.records, stats.applied);
    assert_eq!(stats.skipped, 0);
    assert!(!stats.truncated);

    let dump = |engine: &Engine| {
        let mut entries: Vec<_> = engine.iter_all().map(|e| e.unwrap()).collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    };
    assert_eq!(dump(&source), dump(&target));
    assert_eq!(target.get(b"a").unwrap(), Some(b"one".to_vec()));
    assert_eq!(target.get(b"tmp").unwrap(), None);
    assert_eq!(
        target.get_subkeys(b"parent").unwrap(),
        vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]
    );
}

#[test]
fn test_replay_does_not_dispatch_again() {
    let temp = TempDir::new().unwrap();
    let source = logged_engine(temp.path(), false);
    source.set(b"k", b"v").unwrap();
    drop(source);

    let log_len = std::fs::metadata(temp.path().join("tx.log")).unwrap().len();

    // Target logs into the same file it replays
    let config = RegionConfig::builder()
        .path(temp.path().join("target.skv"))
        .transaction_mode(TransactionMode::Sync)
        .log_path(temp.path().join("tx.log"))
        .build();
    let target = Engine::open(config).unwrap();
    replay(&target, temp.path().join("tx.log"), ErrorPolicy::FailFast).unwrap();

    assert_eq!(std::fs::metadata(temp.path().join("tx.log")).unwrap().len(), log_len);
    assert_eq!(target.get(b"k").unwrap(), Some(b"v".to_vec()));
}

#[test]
fn test_replay_corrupted_record() {
    let temp = TempDir::new().unwrap();
    let log = temp.path().join("manual.log");
    let handler = LogFileHandler::create(&log).unwrap();

    let first = TxRecord::set_all(b"a", b"1", b"", b"");
    let second = TxRecord::set_all(b"b", b"2", b"", b"");
    let third = TxRecord::set_all(b"c", b"3", b"", b"");
    for record in [&first, &second, &third] {
        handler.apply(record).unwrap();
    }
    drop(handler);

    // Flip a payload byte of the second record
    let mut bytes = std::fs::read(&log).unwrap();
    let second_payload = first.encoded_len() + RECORD_HEADER_SIZE;
    bytes[second_payload] ^= 0xFF;
    std::fs::write(&log, &bytes).unwrap();

    let strict = fresh_engine(temp.path(), "strict.skv");
    assert!(replay(&strict, &log, ErrorPolicy::FailFast).is_err());
    assert_eq!(strict.get(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(strict.get(b"c").unwrap(), None);

    let lenient = fresh_engine(temp.path(), "lenient.skv");
    let stats = replay(&lenient, &log, ErrorPolicy::SkipOnError).unwrap();
    assert_eq!(stats.applied, 2);
    assert_eq!(stats.skipped, 1);
    assert!(!stats.truncated);
    assert_eq!(lenient.get(b"b").unwrap(), None);
    assert_eq!(lenient.get(b"c").unwrap(), Some(b"3".to_vec()));
}

#[test]
fn test_replay_truncated_tail() {
    let temp = TempDir::new().unwrap();
    let log = temp.path().join("torn.log");
    let handler = LogFileHandler::create(&log).unwrap();
    handler.apply(&TxRecord::set_all(b"a", b"1", b"", b"")).unwrap();
    drop(handler);

    let partial = TxRecord::set_all(b"b", b"2", b"", b"").encode();
    let mut file = OpenOptions::new().append(true).open(&log).unwrap();
    file.write_all(&partial[..RECORD_HEADER_SIZE / 2]).unwrap();
    drop(file);

    let engine = fresh_engine(temp.path(), "region.skv");
    let stats = replay(&engine, &log, ErrorPolicy::SkipOnError).unwrap();
    assert_eq!(stats.applied, 1);
    assert!(stats.truncated);
    assert_eq!(engine.get(b"a").unwrap(), Some(b"1".to_vec()));
}

#[test]
fn test_replay_into_read_only_fails() {
    let temp = TempDir::new().unwrap();
    let source = logged_engine(temp.path(), false);
    source.set(b"k", b"v").unwrap();
    source.sync().unwrap();

    let config = RegionConfig::builder()
        .path(temp.path().join("source.skv"))
        .read_only(true)
        .build();
    let reader = Engine::open(config).unwrap();
    assert!(matches!(
        replay(&reader, temp.path().join("tx.log"), ErrorPolicy::FailFast),
        Err(SubKvError::ReadOnly)
    ));
}

// =============================================================================
// Snapshot Tests
// =============================================================================

#[test]
fn test_save_log_then_replay() {
    let temp = TempDir::new().unwrap();
    let source = fresh_engine(temp.path(), "source.skv");
    for i in 0..200u32 {
        source
            .set(format!("key-{}", i).as_bytes(), format!("value-{}", i).as_bytes())
            .unwrap();
    }
    source
        .set_with(b"parent", b"p", Some(names(&["key-1", "key-2"]).as_slice()), &SetOptions::new())
        .unwrap();

    let snapshot = temp.path().join("snapshot.log");
    assert_eq!(save_log(&source, &snapshot).unwrap(), 201);
    assert!(read_log(&snapshot)
        .iter()
        .all(|r| r.command == CommandType::SetAll));

    let target = fresh_engine(temp.path(), "target.skv");
    let stats = replay(&target, &snapshot, ErrorPolicy::FailFast).unwrap();
    assert_eq!(stats.applied, 201);

    for i in 0..200u32 {
        assert_eq!(
            target.get(format!("key-{}", i).as_bytes()).unwrap(),
            Some(format!("value-{}", i).into_bytes())
        );
    }
    assert_eq!(
        target.get_attributes(b"parent").unwrap(),
        source.get_attributes(b"parent").unwrap()
    );
    assert_eq!(
        target.get_subkeys(b"parent").unwrap(),
        vec![b"key-1".to_vec(), b"key-2".to_vec()]
    );
}

#[test]
fn test_save_log_overwrites_existing_file() {
    let temp = TempDir::new().unwrap();
    let source = fresh_engine(temp.path(), "source.skv");
    source.set(b"only", b"key").unwrap();

    let snapshot = temp.path().join("snapshot.log");
    std::fs::write(&snapshot, b"stale bytes that are not a record").unwrap();
    assert_eq!(save_log(&source, &snapshot).unwrap(), 1);
    assert_eq!(read_log(&snapshot).len(), 1);
}
