//! Tests for region growth, mask growth and compaction

use subkv::{Engine, OpenMode, RegionConfig};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

/// Tiny region: four base buckets, growth after four keys per bucket
fn small_config(temp: &TempDir) -> RegionConfig {
    RegionConfig::builder()
        .path(temp.path().join("region.skv"))
        .min_mask(0x3)
        .max_element_count(4)
        .initial_elements(16)
        .initial_pages(16)
        .build()
}

fn value_for(i: u32) -> Vec<u8> {
    format!("value-{}-", i).repeat(1 + (i % 40) as usize).into_bytes()
}

// =============================================================================
// Mask Growth Tests
// =============================================================================

#[test]
fn test_mask_grows_with_population() {
    let temp = TempDir::new().unwrap();
    let engine = Engine::open(small_config(&temp)).unwrap();
    assert_eq!(engine.stats().unwrap().current_mask, 0x3);

    for i in 0..600u32 {
        engine.set(format!("key-{}", i).as_bytes(), &value_for(i)).unwrap();
    }

    let stats = engine.stats().unwrap();
    assert!(stats.current_mask > 0x3, "mask stayed at {:#x}", stats.current_mask);
    assert_eq!(stats.current_mask & (stats.current_mask + 1), 0);
    assert_eq!(stats.live_elements, 600);

    for i in 0..600u32 {
        assert_eq!(
            engine.get(format!("key-{}", i).as_bytes()).unwrap(),
            Some(value_for(i)),
            "key-{} lost after growth",
            i
        );
    }

    let report = engine.verify().unwrap();
    assert!(report.is_clean(), "{:?}", report.problems);
    assert_eq!(report.elements, 600);
}

#[test]
fn test_mask_respects_maximum() {
    let temp = TempDir::new().unwrap();
    let config = RegionConfig::builder()
        .path(temp.path().join("region.skv"))
        .min_mask(0x3)
        .max_mask(0x7)
        .max_element_count(2)
        .build();
    let engine = Engine::open(config).unwrap();

    for i in 0..300u32 {
        engine.set(format!("k{}", i).as_bytes(), b"v").unwrap();
    }
    assert_eq!(engine.stats().unwrap().current_mask, 0x7);
    assert!(engine.verify().unwrap().is_clean());
    assert_eq!(engine.get(b"k299").unwrap(), Some(b"v".to_vec()));
}

#[test]
fn test_grown_region_survives_reattach() {
    let temp = TempDir::new().unwrap();
    let grown_mask;
    {
        let engine = Engine::open(small_config(&temp)).unwrap();
        for i in 0..400u32 {
            engine.set(format!("key-{}", i).as_bytes(), &value_for(i)).unwrap();
        }
        grown_mask = engine.stats().unwrap().current_mask;
        engine.close(None).unwrap();
    }

    let config = RegionConfig::builder()
        .path(temp.path().join("region.skv"))
        .open_mode(OpenMode::Open)
        .build();
    let engine = Engine::open(config).unwrap();
    let stats = engine.stats().unwrap();
    assert_eq!(stats.current_mask, grown_mask);
    assert_eq!(stats.min_mask, 0x3);
    assert_eq!(stats.live_elements, 400);

    for i in (0..400u32).step_by(7) {
        assert_eq!(
            engine.get(format!("key-{}", i).as_bytes()).unwrap(),
            Some(value_for(i))
        );
    }
    engine.set(b"after-reattach", b"ok").unwrap();
    assert!(engine.verify().unwrap().is_clean());
}

// =============================================================================
// Area Growth Tests
// =============================================================================

#[test]
fn test_region_appends_areas_when_full() {
    let temp = TempDir::new().unwrap();
    let engine = Engine::open(small_config(&temp)).unwrap();
    let before = engine.stats().unwrap();

    let big = vec![7u8; 64 * 1024];
    engine.set(b"big", &big).unwrap();
    for i in 0..100u32 {
        engine.set(format!("k{}", i).as_bytes(), b"x").unwrap();
    }

    let after = engine.stats().unwrap();
    assert!(after.area_count > before.area_count);
    assert!(after.region_len > before.region_len);
    assert!(after.total_pages > before.total_pages);
    assert!(after.total_elements > before.total_elements);
    assert_eq!(engine.get(b"big").unwrap(), Some(big));
}

#[test]
fn test_removed_pages_are_reused() {
    let temp = TempDir::new().unwrap();
    let engine = Engine::open(small_config(&temp)).unwrap();

    let value = vec![1u8; 20 * 1024];
    engine.set(b"a", &value).unwrap();
    engine.remove(b"a", false).unwrap();
    let len_after_first = engine.stats().unwrap().region_len;

    engine.set(b"b", &value).unwrap();
    assert_eq!(engine.stats().unwrap().region_len, len_after_first);
    assert!(engine.verify().unwrap().is_clean());
}

// =============================================================================
// Compaction Tests
// =============================================================================

#[test]
fn test_compaction_releases_trailing_areas() {
    let temp = TempDir::new().unwrap();
    // Fixed mask so only element and page areas are appended
    let config = RegionConfig::builder()
        .path(temp.path().join("region.skv"))
        .min_mask(0xFF)
        .max_mask(0xFF)
        .initial_elements(16)
        .initial_pages(16)
        .build();
    let engine = Engine::open(config).unwrap();

    for i in 0..300u32 {
        engine.set(format!("key-{}", i).as_bytes(), &value_for(i)).unwrap();
    }
    let grown = engine.stats().unwrap();

    for i in 10..300u32 {
        engine.remove(format!("key-{}", i).as_bytes(), false).unwrap();
    }

    let mut released = 0;
    while engine.compact().unwrap() {
        released += 1;
    }
    assert!(released > 0);

    let compacted = engine.stats().unwrap();
    assert!(compacted.area_count < grown.area_count);
    assert!(compacted.region_len < grown.region_len);
    assert_eq!(compacted.live_elements, 10);

    for i in 0..10u32 {
        assert_eq!(
            engine.get(format!("key-{}", i).as_bytes()).unwrap(),
            Some(value_for(i)),
            "key-{} damaged by compaction",
            i
        );
    }
    assert!(engine.verify().unwrap().is_clean());

    // The region grows again afterwards
    for i in 300..400u32 {
        engine.set(format!("key-{}", i).as_bytes(), &value_for(i)).unwrap();
    }
    assert_eq!(engine.stats().unwrap().live_elements, 110);
    assert!(engine.verify().unwrap().is_clean());
}

#[test]
fn test_compaction_with_nothing_to_release() {
    let temp = TempDir::new().unwrap();
    let engine = Engine::open(
        RegionConfig::builder()
            .path(temp.path().join("region.skv"))
            .build(),
    )
    .unwrap();
    engine.set(b"k", b"v").unwrap();

    let before = engine.stats().unwrap();
    assert!(!engine.compact().unwrap());
    assert_eq!(engine.stats().unwrap().region_len, before.region_len);
}
