//! Performance tests for digest reuse

use datshare::{NoopListener, ShareBuilder};
use std::fs;
use std::sync::Arc;
use std::time::Instant;
use tempfile::TempDir;

#[test]
#[ignore] // Run with: cargo test --test performance_test -- --ignored
fn test_resume_skips_rehashing() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path();

    println!("Creating test directory with 1000 files...");
    for i in 0..10 {
        let dir = root.join(format!("dir{}", i));
        fs::create_dir(&dir).unwrap();
        for j in 0..100 {
            let content = format!("Content for file {} in dir {}\n", j, i).repeat(500);
            fs::write(dir.join(format!("file{}.txt", j)), content).unwrap();
        }
    }

    let snapshot = || {
        ShareBuilder::new(root)
            .listener(Arc::new(NoopListener))
            .build()
            .unwrap()
            .snapshot()
            .unwrap()
    };

    println!("Taking initial snapshot...");
    let start = Instant::now();
    let first = snapshot();
    let initial_time = start.elapsed();
    println!("Initial snapshot took: {:?} ({} hashed)", initial_time, first.hashed);

    fs::write(root.join("dir5/file50.txt"), "Modified content").unwrap();

    println!("Taking snapshot after 1 file change...");
    let start = Instant::now();
    let second = snapshot();
    let resumed_time = start.elapsed();
    println!("Resumed snapshot took: {:?} ({} hashed)", resumed_time, second.hashed);

    assert_eq!(first.hashed, 1000);
    assert_eq!(second.hashed, 1);
    assert_eq!(second.reused, 999);
    assert_ne!(first.identity_key, second.identity_key);
    assert!(
        resumed_time < initial_time,
        "Resumed snapshot ({:?}) should be faster than initial ({:?})",
        resumed_time,
        initial_time
    );
}
