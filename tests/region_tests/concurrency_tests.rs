//! Multi-threaded and multi-handle tests

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use subkv::{Engine, EngineContext, OpenMode, RegionConfig};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn shared_engine(temp: &TempDir) -> Arc<Engine> {
    let config = RegionConfig::builder()
        .path(temp.path().join("region.skv"))
        .min_mask(0x3)
        .max_element_count(4)
        .initial_elements(32)
        .initial_pages(32)
        .build();
    Arc::new(Engine::open(config).unwrap())
}

// =============================================================================
// Single Key Contention Tests
// =============================================================================

#[test]
fn test_concurrent_sets_never_mix_values() {
    let temp = TempDir::new().unwrap();
    let engine = shared_engine(&temp);
    engine.set(b"hot", &[0u8; 1500]).unwrap();

    let writers = 4;
    let barrier = Arc::new(Barrier::new(writers + 1));
    let done = Arc::new(AtomicBool::new(false));

    let handles: Vec<_> = (0..writers)
        .map(|t| {
            let engine = Arc::clone(&engine);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let fill = vec![t as u8 + 1; 1500];
                barrier.wait();
                for _ in 0..200 {
                    engine.set(b"hot", &fill).unwrap();
                }
            })
        })
        .collect();

    let reader = {
        let engine = Arc::clone(&engine);
        let barrier = Arc::clone(&barrier);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            barrier.wait();
            let mut reads = 0u64;
            while !done.load(Ordering::SeqCst) {
                let value = engine.get(b"hot").unwrap().unwrap();
                assert_eq!(value.len(), 1500);
                assert!(
                    value.iter().all(|b| *b == value[0]),
                    "torn value observed"
                );
                reads += 1;
            }
            reads
        })
    };

    for handle in handles {
        handle.join().unwrap();
    }
    done.store(true, Ordering::SeqCst);
    assert!(reader.join().unwrap() > 0);

    let last = engine.get(b"hot").unwrap().unwrap();
    assert!((1..=writers as u8).contains(&last[0]));
    assert_eq!(engine.stats().unwrap().live_elements, 1);
    assert!(engine.verify().unwrap().is_clean());
}

#[test]
fn test_unique_id_stable_under_contention() {
    let temp = TempDir::new().unwrap();
    let engine = shared_engine(&temp);
    engine.set(b"k", b"initial").unwrap();
    let unique_id = engine.get_attributes(b"k").unwrap().unwrap().unique_id;

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                for i in 0..100u32 {
                    engine.set(b"k", format!("{}-{}", t, i).as_bytes()).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(
        engine.get_attributes(b"k").unwrap().unwrap().unique_id,
        unique_id
    );
}

// =============================================================================
// Disjoint Key Tests
// =============================================================================

#[test]
fn test_concurrent_inserts_with_growth() {
    let temp = TempDir::new().unwrap();
    let engine = shared_engine(&temp);

    let threads = 4u32;
    let per_thread = 300u32;
    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                for i in 0..per_thread {
                    let key = format!("t{}-k{}", t, i);
                    engine.set(key.as_bytes(), key.repeat(3).as_bytes()).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let stats = engine.stats().unwrap();
    assert_eq!(stats.live_elements, (threads * per_thread) as u64);
    assert!(stats.current_mask > 0x3);

    for t in 0..threads {
        for i in 0..per_thread {
            let key = format!("t{}-k{}", t, i);
            assert_eq!(
                engine.get(key.as_bytes()).unwrap(),
                Some(key.repeat(3).into_bytes())
            );
        }
    }
    let report = engine.verify().unwrap();
    assert!(report.is_clean(), "{:?}", report.problems);
}

#[test]
fn test_concurrent_mixed_operations() {
    let temp = TempDir::new().unwrap();
    let engine = shared_engine(&temp);

    let handles: Vec<_> = (0..4u32)
        .map(|t| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                for i in 0..150u32 {
                    let key = format!("t{}-{}", t, i);
                    engine.set(key.as_bytes(), b"value").unwrap();
                    match i % 3 {
                        0 => {
                            engine.remove(key.as_bytes(), false).unwrap();
                        }
                        1 => {
                            let renamed = format!("{}-renamed", key);
                            engine.rename(key.as_bytes(), renamed.as_bytes()).unwrap();
                        }
                        _ => {
                            engine.truncate(key.as_bytes(), 2).unwrap();
                        }
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    for t in 0..4u32 {
        for i in 0..150u32 {
            let key = format!("t{}-{}", t, i);
            let renamed = format!("{}-renamed", key);
            let (plain, moved) = match i % 3 {
                0 => (None, None),
                1 => (None, Some(b"value".to_vec())),
                _ => (Some(b"va".to_vec()), None),
            };
            assert_eq!(engine.get(key.as_bytes()).unwrap(), plain);
            assert_eq!(engine.get(renamed.as_bytes()).unwrap(), moved);
        }
    }
    assert_eq!(engine.stats().unwrap().live_elements, 4 * 100);
    assert!(engine.verify().unwrap().is_clean());
}

// =============================================================================
// Multi-Handle Tests
// =============================================================================

#[test]
fn test_two_handles_on_one_file() {
    let temp = TempDir::new().unwrap();
    let ctx = Arc::new(EngineContext::new());
    let path = temp.path().join("region.skv");

    let first = Arc::new(
        Engine::open_with_context(
            RegionConfig::builder()
                .path(&path)
                .min_mask(0x3)
                .max_element_count(4)
                .initial_elements(16)
                .initial_pages(16)
                .build(),
            ctx.clone(),
        )
        .unwrap(),
    );
    let second = Arc::new(
        Engine::open_with_context(
            RegionConfig::builder()
                .path(&path)
                .open_mode(OpenMode::Open)
                .build(),
            ctx,
        )
        .unwrap(),
    );

    // Parameters come from the region, not the attaching config
    assert_eq!(second.stats().unwrap().min_mask, 0x3);

    let writers: Vec<_> = [Arc::clone(&first), Arc::clone(&second)]
        .into_iter()
        .enumerate()
        .map(|(h, engine)| {
            thread::spawn(move || {
                for i in 0..250u32 {
                    engine
                        .set(format!("h{}-{}", h, i).as_bytes(), &i.to_le_bytes())
                        .unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    // Each handle sees the other's writes and the growth they caused
    for (h, engine) in [(0, &second), (1, &first)] {
        for i in 0..250u32 {
            assert_eq!(
                engine.get(format!("h{}-{}", h, i).as_bytes()).unwrap(),
                Some(i.to_le_bytes().to_vec())
            );
        }
    }
    assert_eq!(first.stats().unwrap().live_elements, 500);
    assert_eq!(second.stats().unwrap().live_elements, 500);
    assert!(first.verify().unwrap().is_clean());
}
