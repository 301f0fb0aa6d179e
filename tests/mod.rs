//! Main test module for datshare
//!
//! This module includes all test suites:
//! - Integration tests for multi-step scenarios
//! - Chaos tests for resilience
//! - Property-based tests for invariants

pub mod chaos;
pub mod integration;
pub mod property;

#[cfg(test)]
mod edge_cases {
    use ::datshare::*;
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn snapshot(root: &std::path::Path) -> snapshot::SnapshotOutcome {
        ShareBuilder::new(root)
            .listener(Arc::new(NoopListener))
            .build()
            .unwrap()
            .snapshot()
            .unwrap()
    }

    #[test]
    fn test_empty_directory() {
        let temp_dir = TempDir::new().unwrap();
        let outcome = snapshot(temp_dir.path());
        assert_eq!(outcome.report.item_count, 0);
        assert_eq!(outcome.report.total_bytes, 0);
        assert_eq!(outcome.report.display_size(), "0 B");

        // An empty tree still has a well-defined key
        let again = snapshot(temp_dir.path());
        assert_eq!(outcome.identity_key, again.identity_key);
    }

    #[test]
    fn test_empty_directories_are_part_of_the_key() {
        let temp_dir = TempDir::new().unwrap();
        let before = snapshot(temp_dir.path()).identity_key;
        fs::create_dir(temp_dir.path().join("empty_dir")).unwrap();
        let after = snapshot(temp_dir.path());

        assert_ne!(before, after.identity_key);
        assert_eq!(after.report.item_count, 0);
        assert_eq!(after.report.directory_count, 1);
    }

    #[test]
    fn test_special_filenames() {
        let temp_dir = TempDir::new().unwrap();
        let names = [
            "file with spaces.txt",
            "file-with-dashes.txt",
            "file_with_underscores.txt",
            "file.multiple.dots.txt",
            "UPPERCASE.TXT",
            "123numeric.txt",
            "ünïcödé.txt",
        ];
        for name in &names {
            fs::write(temp_dir.path().join(name), name.as_bytes()).unwrap();
        }

        let listener = RecordingListener::new();
        let outcome = ShareBuilder::new(temp_dir.path())
            .listener(Arc::new(listener.clone()))
            .build()
            .unwrap()
            .snapshot()
            .unwrap();

        assert_eq!(outcome.report.item_count, names.len() as u32);
        let indexed = listener.indexed_paths();
        let mut sorted = indexed.clone();
        sorted.sort();
        assert_eq!(indexed, sorted, "entries must arrive in walk order");
    }

    #[test]
    fn test_walk_order_puts_directory_before_similar_names() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir(temp_dir.path().join("a")).unwrap();
        fs::write(temp_dir.path().join("a/b"), "1").unwrap();
        fs::write(temp_dir.path().join("a.txt"), "2").unwrap();
        fs::write(temp_dir.path().join("a-z"), "3").unwrap();

        let listener = RecordingListener::new();
        ShareBuilder::new(temp_dir.path())
            .listener(Arc::new(listener.clone()))
            .build()
            .unwrap()
            .snapshot()
            .unwrap();

        let paths: Vec<String> = listener
            .indexed_paths()
            .iter()
            .map(|p| p.as_str().to_string())
            .collect();
        assert_eq!(paths, vec!["a", "a/b", "a-z", "a.txt"]);
    }

    #[test]
    fn test_deeply_nested_structure() {
        let temp_dir = TempDir::new().unwrap();
        let mut path = temp_dir.path().to_path_buf();
        for i in 0..40 {
            path = path.join(format!("level_{}", i));
        }
        fs::create_dir_all(&path).unwrap();
        fs::write(path.join("deep.txt"), "Deep content").unwrap();

        let outcome = snapshot(temp_dir.path());
        assert_eq!(outcome.report.item_count, 1);
        assert_eq!(outcome.report.directory_count, 40);
    }

    #[test]
    fn test_control_dir_name_is_configurable() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("data.txt"), "data").unwrap();

        let outcome = ShareBuilder::new(temp_dir.path())
            .control_dir_name(".share-state")
            .listener(Arc::new(NoopListener))
            .build()
            .unwrap()
            .snapshot()
            .unwrap();

        assert!(temp_dir.path().join(".share-state/key").exists());
        assert!(!temp_dir.path().join(DEFAULT_CONTROL_DIR).exists());
        assert_eq!(outcome.report.item_count, 1);
    }

    #[test]
    fn test_invalid_control_dir_name() {
        let temp_dir = TempDir::new().unwrap();
        let result = ShareBuilder::new(temp_dir.path()).control_dir_name("a/b").build();
        assert!(matches!(result, Err(ShareError::InvalidConfiguration(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_are_skipped_by_default() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("target.txt"), "target").unwrap();
        std::os::unix::fs::symlink(
            temp_dir.path().join("target.txt"),
            temp_dir.path().join("link.txt"),
        )
        .unwrap();

        let outcome = snapshot(temp_dir.path());
        assert_eq!(outcome.report.item_count, 1);
    }
}
