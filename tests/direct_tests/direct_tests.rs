//! Tests for DirectAccess
//!
//! These tests verify:
//! - Cursor creation in read and write mode
//! - Offset handling and zero extension
//! - std::io Read/Write/Seek integration
//! - Block copies and the records each write emits

use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use parking_lot::Mutex;
use subkv::{
    AccessMode, CommandType, Engine, EngineContext, RegionConfig, Result, SetOptions, SubKvError,
    TransactionHandler, TransactionMode, TxRecord,
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

/// Subkey names as byte slices
fn names<'a>(list: &[&'a str]) -> Vec<&'a [u8]> {
    list.iter().map(|name| name.as_bytes()).collect()
}

/// Keeps every record it is handed
#[derive(Default)]
struct Collector {
    records: Mutex<Vec<TxRecord>>,
}

impl TransactionHandler for Collector {
    fn apply(&self, record: &TxRecord) -> Result<()> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}

fn setup_recording_engine(block_size: usize) -> (TempDir, Engine, Arc<Collector>) {
    let temp_dir = TempDir::new().unwrap();
    let collector = Arc::new(Collector::default());
    let ctx = Arc::new(EngineContext::new());
    ctx.register_handler("collector", collector.clone());

    let config = RegionConfig::builder()
        .path(temp_dir.path().join("region.skv"))
        .transaction_mode(TransactionMode::Sync)
        .transaction_handler("collector")
        .direct_block_size(block_size)
        .build();
    let engine = Engine::open_with_context(config, ctx).unwrap();
    (temp_dir, engine, collector)
}

// =============================================================================
// Open Tests
// =============================================================================

#[test]
fn test_write_mode_creates_key() {
    let (_temp, engine) = setup_temp_engine();

    {
        let cursor = engine.direct(b"fresh", AccessMode::Write).unwrap();
        assert_eq!(cursor.key(), b"fresh");
        assert_eq!(cursor.mode(), AccessMode::Write);
        assert!(cursor.is_empty().unwrap());
    }
    assert_eq!(engine.get(b"fresh").unwrap(), Some(Vec::new()));
}

#[test]
fn test_read_mode_requires_key() {
    let (_temp, engine) = setup_temp_engine();

    assert!(matches!(
        engine.direct(b"missing", AccessMode::Read),
        Err(SubKvError::KeyNotFound)
    ));
    assert_eq!(engine.get(b"missing").unwrap(), None);
}

// =============================================================================
// Offset Tests
// =============================================================================

#[test]
fn test_set_offset_zero_extends_in_write_mode() {
    let (_temp, engine) = setup_temp_engine();
    engine.set(b"key", b"abc").unwrap();

    {
        let mut cursor = engine.direct(b"key", AccessMode::Write).unwrap();
        cursor.set_offset(5, 3).unwrap();
        assert_eq!(cursor.position(), 5);
        assert_eq!(cursor.len().unwrap(), 8);
        cursor.write(b"xyz").unwrap();
        assert_eq!(cursor.position(), 8);
    }

    assert_eq!(engine.get(b"key").unwrap(), Some(b"abc\0\0xyz".to_vec()));
}

#[test]
fn test_set_offset_within_value_keeps_length() {
    let (_temp, engine) = setup_temp_engine();
    engine.set(b"key", b"0123456789").unwrap();

    let mut cursor = engine.direct(b"key", AccessMode::Write).unwrap();
    cursor.set_offset(2, 4).unwrap();
    assert_eq!(cursor.len().unwrap(), 10);
}

#[test]
fn test_read_mode_rejects_range_past_end() {
    let (_temp, engine) = setup_temp_engine();
    engine.set(b"key", b"short").unwrap();

    let mut cursor = engine.direct(b"key", AccessMode::Read).unwrap();
    assert!(matches!(
        cursor.set_offset(3, 10),
        Err(SubKvError::InvalidArgument(_))
    ));
    assert!(matches!(
        cursor.set_offset(u64::MAX, 2),
        Err(SubKvError::InvalidArgument(_))
    ));
    cursor.set_offset(1, 4).unwrap();

    let mut buf = [0u8; 16];
    let n = cursor.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"hort");
}

#[test]
fn test_read_mode_rejects_writes() {
    let (_temp, engine) = setup_temp_engine();
    engine.set(b"key", b"value").unwrap();

    {
        let mut cursor = engine.direct(b"key", AccessMode::Read).unwrap();
        assert!(matches!(cursor.write(b"x"), Err(SubKvError::InvalidArgument(_))));
        assert!(matches!(
            cursor.copy_from(&mut Cursor::new(b"abc".to_vec()), 3),
            Err(SubKvError::InvalidArgument(_))
        ));
    }
    assert_eq!(engine.get(b"key").unwrap(), Some(b"value".to_vec()));
}

// =============================================================================
// Read / Write Tests
// =============================================================================

#[test]
fn test_read_at_does_not_move_cursor() {
    let (_temp, engine) = setup_temp_engine();
    engine.set(b"key", b"hello world").unwrap();

    let cursor = engine.direct(b"key", AccessMode::Read).unwrap();
    let mut buf = [0u8; 5];
    assert_eq!(cursor.read_at(6, &mut buf).unwrap(), 5);
    assert_eq!(&buf, b"world");
    assert_eq!(cursor.position(), 0);

    // Past the end reads nothing
    assert_eq!(cursor.read_at(11, &mut buf).unwrap(), 0);
}

#[test]
fn test_write_spanning_pages() {
    let (_temp, engine) = setup_temp_engine();
    let original: Vec<u8> = vec![b'a'; 2000];
    engine.set(b"big", &original).unwrap();

    let patch = vec![b'Z'; 700];
    {
        let mut cursor = engine.direct(b"big", AccessMode::Write).unwrap();
        cursor.write_at(150, &patch).unwrap();
        assert_eq!(cursor.position(), 0);
    }

    let mut expected = original.clone();
    expected[150..850].copy_from_slice(&patch);
    assert_eq!(engine.get(b"big").unwrap(), Some(expected));
    assert!(engine.verify().unwrap().is_clean());
}

#[test]
fn test_write_past_end_zero_fills_gap() {
    let (_temp, engine) = setup_temp_engine();
    engine.set(b"key", b"ab").unwrap();

    {
        let mut cursor = engine.direct(b"key", AccessMode::Write).unwrap();
        cursor.write_at(4, b"cd").unwrap();
    }
    assert_eq!(engine.get(b"key").unwrap(), Some(b"ab\0\0cd".to_vec()));
}

#[test]
fn test_direct_access_bypasses_attributes() {
    let (_temp, engine) = setup_temp_engine();
    engine
        .set_with(b"key", b"value", Some(names(&["child"]).as_slice()), &SetOptions::new())
        .unwrap();
    let attrs = engine.get_attributes(b"key").unwrap();

    {
        let mut cursor = engine.direct(b"key", AccessMode::Write).unwrap();
        cursor.write_at(0, b"V").unwrap();
    }

    assert_eq!(engine.get(b"key").unwrap(), Some(b"Value".to_vec()));
    assert_eq!(engine.get_attributes(b"key").unwrap(), attrs);
    assert_eq!(engine.get_subkeys(b"key").unwrap(), vec![b"child".to_vec()]);
}

// =============================================================================
// std::io Tests
// =============================================================================

#[test]
fn test_io_read_and_seek() {
    let (_temp, engine) = setup_temp_engine();
    engine.set(b"key", b"0123456789").unwrap();

    let mut cursor = engine.direct(b"key", AccessMode::Read).unwrap();
    assert_eq!(cursor.seek(SeekFrom::End(-3)).unwrap(), 7);

    let mut rest = Vec::new();
    Read::read_to_end(&mut cursor, &mut rest).unwrap();
    assert_eq!(rest, b"789");

    assert_eq!(cursor.seek(SeekFrom::Start(2)).unwrap(), 2);
    assert_eq!(cursor.seek(SeekFrom::Current(1)).unwrap(), 3);
    let mut buf = [0u8; 2];
    Read::read_exact(&mut cursor, &mut buf).unwrap();
    assert_eq!(&buf, b"34");

    assert!(cursor.seek(SeekFrom::Current(-100)).is_err());
}

#[test]
fn test_io_write() {
    let (_temp, engine) = setup_temp_engine();

    {
        let mut cursor = engine.direct(b"log", AccessMode::Write).unwrap();
        writeln!(cursor, "line {}", 1).unwrap();
        writeln!(cursor, "line {}", 2).unwrap();
        cursor.flush().unwrap();
    }
    assert_eq!(engine.get(b"log").unwrap(), Some(b"line 1\nline 2\n".to_vec()));
}

// =============================================================================
// Block Copy Tests
// =============================================================================

#[test]
fn test_copy_from_and_copy_to_in_blocks() {
    let (_temp, engine, collector) = setup_recording_engine(64);
    let payload: Vec<u8> = (0..1000u32).map(|i| (i * 7 % 256) as u8).collect();

    {
        let mut cursor = engine.direct(b"blob", AccessMode::Write).unwrap();
        let copied = cursor
            .copy_from(&mut Cursor::new(payload.clone()), payload.len() as u64)
            .unwrap();
        assert_eq!(copied, 1000);
    }

    let writes = collector
        .records
        .lock()
        .iter()
        .filter(|r| r.command == CommandType::OverwriteAt)
        .count();
    assert_eq!(writes, 1000usize.div_ceil(64));

    let mut out = Vec::new();
    {
        let mut cursor = engine.direct(b"blob", AccessMode::Read).unwrap();
        assert_eq!(cursor.copy_to(&mut out).unwrap(), 1000);
    }
    assert_eq!(out, payload);
}

#[test]
fn test_copy_from_stops_when_reader_runs_dry() {
    let (_temp, engine) = setup_temp_engine();

    let mut cursor = engine.direct(b"blob", AccessMode::Write).unwrap();
    let copied = cursor
        .copy_from(&mut Cursor::new(b"only this".to_vec()), 100)
        .unwrap();
    assert_eq!(copied, 9);
    assert_eq!(cursor.len().unwrap(), 9);
}

// =============================================================================
// Transaction Record Tests
// =============================================================================

#[test]
fn test_cursor_emits_records() {
    let (_temp, engine, collector) = setup_recording_engine(1024);

    {
        let mut cursor = engine.direct(b"k", AccessMode::Write).unwrap();
        cursor.set_offset(0, 4).unwrap();
        cursor.write(b"ab").unwrap();
    }

    let records = collector.records.lock().clone();
    assert_eq!(records.len(), 3);

    assert_eq!(records[0].command, CommandType::SetAll);
    assert_eq!(records[0].key, b"k");
    assert!(records[0].value.is_empty());

    assert_eq!(records[1].command, CommandType::Truncate);
    assert_eq!(records[1].extra_u64().unwrap(), 4);

    assert_eq!(records[2].command, CommandType::OverwriteAt);
    assert_eq!(records[2].extra_u64().unwrap(), 0);
    assert_eq!(records[2].value, b"ab");
}

#[test]
fn test_recorded_writes_rebuild_value() {
    let (_temp, source, collector) = setup_recording_engine(1024);
    source.set(b"doc", b"hello").unwrap();
    {
        let mut cursor = source.direct(b"doc", AccessMode::Write).unwrap();
        cursor.write_at(5, b", world").unwrap();
        cursor.write_at(0, b"H").unwrap();
    }

    let (_temp2, target) = setup_temp_engine();
    for record in collector.records.lock().iter() {
        target.apply_record(record).unwrap();
    }
    assert_eq!(target.get(b"doc").unwrap(), Some(b"Hello, world".to_vec()));
    assert_eq!(target.get(b"doc").unwrap(), source.get(b"doc").unwrap());
}
