//! Property-based testing for datshare
//!
//! Uses proptest to check the index invariants across randomly generated
//! trees and edit sequences.

use ::datshare::index::Change;
use ::datshare::walker::Walker;
use ::datshare::*;
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A file operation on a generated tree
#[derive(Debug, Clone)]
pub enum FileOperation {
    Write { path: PathBuf, content: Vec<u8> },
    Delete { path: PathBuf },
}

/// Generate random file paths
fn path_strategy() -> impl Strategy<Value = PathBuf> {
    let dir_strategy = prop::collection::vec("[a-c]{1,2}", 0..=3);
    let filename_strategy = prop_oneof![
        "file[0-9]{1,2}\\.txt".prop_map(|s| s),
        "[d-f]{1,4}\\.(bin|md)".prop_map(|s| s),
    ];
    (dir_strategy, filename_strategy).prop_map(|(dirs, filename)| {
        let mut path = PathBuf::new();
        for dir in dirs {
            path = path.join(dir);
        }
        path.join(filename)
    })
}

/// Generate random file content, empty included
fn content_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        Just(Vec::new()),
        "[a-zA-Z0-9 \n]{1,200}".prop_map(|s| s.into_bytes()),
        prop::collection::vec(any::<u8>(), 1..2000),
    ]
}

fn file_operation_strategy() -> impl Strategy<Value = FileOperation> {
    prop_oneof![
        3 => (path_strategy(), content_strategy())
            .prop_map(|(path, content)| FileOperation::Write { path, content }),
        1 => path_strategy().prop_map(|path| FileOperation::Delete { path }),
    ]
}

/// Apply an operation, skipping ones that clash with the current tree
fn apply_operation(root: &Path, op: &FileOperation) -> bool {
    match op {
        FileOperation::Write { path, content } => {
            let full = root.join(path);
            if let Some(parent) = full.parent() {
                if fs::create_dir_all(parent).is_err() {
                    return false;
                }
            }
            if full.is_dir() {
                return false;
            }
            fs::write(full, content).is_ok()
        }
        FileOperation::Delete { path } => {
            let full = root.join(path);
            full.is_file() && fs::remove_file(full).is_ok()
        }
    }
}

fn full_build(root: &Path) -> ArchiveIndex {
    let walker = Walker::new(root.to_path_buf(), DEFAULT_CONTROL_DIR);
    ArchiveIndex::build(walker.scan(None).unwrap().entries, &NoopListener)
}

fn digests(index: &ArchiveIndex) -> BTreeMap<RelPath, Digest> {
    index
        .entries()
        .map(|e| (e.path.clone(), index.node_digest(&e.path).unwrap()))
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Rebuilding an unchanged tree gives identical digests everywhere
    #[test]
    fn rebuild_is_deterministic(
        operations in prop::collection::vec(file_operation_strategy(), 1..30)
    ) {
        let temp_dir = TempDir::new().unwrap();
        for op in &operations {
            apply_operation(temp_dir.path(), op);
        }

        let first = full_build(temp_dir.path());
        let second = full_build(temp_dir.path());
        prop_assert_eq!(first.identity_key(), second.identity_key());
        prop_assert_eq!(digests(&first), digests(&second));
    }

    /// Folding edits incrementally agrees with a rebuild from scratch
    #[test]
    fn incremental_matches_full_build(
        initial in prop::collection::vec(file_operation_strategy(), 1..20),
        edits in prop::collection::vec(file_operation_strategy(), 1..20)
    ) {
        let temp_dir = TempDir::new().unwrap();
        for op in &initial {
            apply_operation(temp_dir.path(), op);
        }
        let mut index = full_build(temp_dir.path());
        let before = index.identity_key();

        for op in &edits {
            apply_operation(temp_dir.path(), op);
        }
        let walker = Walker::new(temp_dir.path().to_path_buf(), DEFAULT_CONTROL_DIR);
        // Rewrites within one timestamp tick would defeat digest reuse
        let scan = walker.scan(None).unwrap();
        let changes = index.diff(&scan.entries);
        let outcome = index.apply(changes);

        let rebuilt = full_build(temp_dir.path());
        prop_assert_eq!(index.identity_key(), rebuilt.identity_key());
        prop_assert_eq!(digests(&index), digests(&rebuilt));
        prop_assert_eq!(index.report(), rebuilt.report());
        if !outcome.changed {
            prop_assert_eq!(before, index.identity_key());
        }
        prop_assert!(index.verify().is_ok());
    }

    /// A single-file change only touches that file's ancestors
    #[test]
    fn change_recomputes_only_ancestors(
        operations in prop::collection::vec(file_operation_strategy(), 2..30),
        content in prop::collection::vec(any::<u8>(), 1..64)
    ) {
        let temp_dir = TempDir::new().unwrap();
        for op in &operations {
            apply_operation(temp_dir.path(), op);
        }
        let mut index = full_build(temp_dir.path());
        let Some(target) = index.entries().find(|e| !e.is_dir()).cloned() else {
            return Ok(());
        };
        let before = digests(&index);

        let mut marker = content.clone();
        marker.extend_from_slice(b"-changed");
        let entry = Entry::file(
            target.path.clone(),
            marker.len() as u64,
            hasher::hash_bytes(&marker),
            target.modified_ns,
        );
        let outcome = index.apply(vec![Change::Upsert(entry)]);
        prop_assert!(outcome.changed);

        let mut expected: Vec<RelPath> = target.path.ancestors();
        expected.sort();
        let mut recomputed = outcome.recomputed.clone();
        recomputed.sort();
        prop_assert_eq!(recomputed, expected);

        let after = digests(&index);
        for (path, digest) in &before {
            let is_ancestor_or_self = *path == target.path || target.path.is_descendant_of(path);
            if is_ancestor_or_self {
                prop_assert_ne!(after.get(path), Some(digest));
            } else {
                prop_assert_eq!(after.get(path), Some(digest));
            }
        }
    }
}
