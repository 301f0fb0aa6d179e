//! Integration tests for datshare
//!
//! Drives live sessions through realistic sequences of edits and checks
//! that every committed key matches what a from-scratch snapshot of the
//! same tree produces.

use ::datshare::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tracing::info;

/// Test harness for live-share scenarios
pub struct ShareTestHarness {
    pub temp_dir: TempDir,
    pub operation_log: Vec<TestOperation>,
}

#[derive(Debug, Clone)]
pub enum TestOperation {
    WriteFile { path: PathBuf, content: Vec<u8> },
    DeleteFile { path: PathBuf },
    CreateDir { path: PathBuf },
    DeleteDir { path: PathBuf },
}

impl ShareTestHarness {
    /// Create a harness over a fresh directory
    pub fn new() -> Self {
        Self {
            temp_dir: TempDir::new().unwrap(),
            operation_log: Vec::new(),
        }
    }

    pub fn root(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Apply an operation to the tree and return the paths to notify
    pub fn apply(&mut self, op: TestOperation) -> Vec<RelPath> {
        let root = self.temp_dir.path().to_path_buf();
        let touched = match &op {
            TestOperation::WriteFile { path, content } => {
                if let Some(parent) = root.join(path).parent() {
                    fs::create_dir_all(parent).unwrap();
                }
                fs::write(root.join(path), content).unwrap();
                vec![path.clone()]
            }
            TestOperation::DeleteFile { path } => {
                fs::remove_file(root.join(path)).unwrap();
                vec![path.clone()]
            }
            TestOperation::CreateDir { path } => {
                fs::create_dir_all(root.join(path)).unwrap();
                vec![path.clone()]
            }
            TestOperation::DeleteDir { path } => {
                fs::remove_dir_all(root.join(path)).unwrap();
                vec![path.clone()]
            }
        };
        self.operation_log.push(op);
        touched
            .iter()
            .filter_map(|p| RelPath::from_relative(p))
            .collect()
    }

    /// Key a fresh snapshot of the current tree would get
    pub fn reference_key(&self) -> IdentityKey {
        let walker = walker::Walker::new(self.root().to_path_buf(), DEFAULT_CONTROL_DIR);
        let scan = walker.scan(None).unwrap();
        ArchiveIndex::build(scan.entries, &NoopListener).identity_key()
    }

    /// Start a live session that only sees fed events
    pub async fn live(&self, listener: RecordingListener) -> LiveSession {
        ShareBuilder::new(self.root())
            .watch(false)
            .debounce(Duration::from_millis(10))
            .max_batch_delay(Duration::from_millis(50))
            .listener(Arc::new(listener))
            .build()
            .unwrap()
            .live()
            .await
            .unwrap()
    }
}

/// Wait until the session reaches `version`
pub async fn wait_for_version(session: &LiveSession, version: u64) {
    for _ in 0..200 {
        if session.version() >= version {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session stuck at version {}, expected {}", session.version(), version);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_live_edits_match_reference() {
        let mut harness = ShareTestHarness::new();
        harness.apply(TestOperation::WriteFile {
            path: "docs/readme.md".into(),
            content: b"# Dataset".to_vec(),
        });
        harness.apply(TestOperation::WriteFile {
            path: "data/2016/jan.csv".into(),
            content: vec![b'1'; 2048],
        });

        let listener = RecordingListener::new();
        let session = harness.live(listener.clone()).await;
        assert_eq!(session.key(), Some(harness.reference_key()));

        let steps = vec![
            TestOperation::WriteFile { path: "data/2016/feb.csv".into(), content: vec![b'2'; 100] },
            TestOperation::WriteFile { path: "docs/readme.md".into(), content: b"# Dataset v2".to_vec() },
            TestOperation::DeleteFile { path: "data/2016/jan.csv".into() },
            TestOperation::CreateDir { path: "empty".into() },
            TestOperation::DeleteDir { path: "docs".into() },
        ];

        let mut expected_version = 1;
        for step in steps {
            info!("Applying {:?}", step);
            for path in harness.apply(step) {
                session
                    .notify(ChangeEvent::new(path, ChangeKind::Modified))
                    .unwrap();
            }
            expected_version += 1;
            wait_for_version(&session, expected_version).await;
            assert_eq!(session.key(), Some(harness.reference_key()));
        }

        let report = session.stop().await.unwrap();
        assert_eq!(report.item_count, 1);
        assert_eq!(report.total_bytes, 100);
        assert_eq!(harness.operation_log.len(), 7);

        // One announcement per distinct key
        let keys = listener.announced_keys();
        assert_eq!(keys.len(), 6);
    }

    #[tokio::test]
    async fn test_burst_is_committed_once() {
        let mut harness = ShareTestHarness::new();
        harness.apply(TestOperation::WriteFile { path: "log.txt".into(), content: b"0".to_vec() });

        let session = ShareBuilder::new(harness.root())
            .watch(false)
            .debounce(Duration::from_millis(100))
            .max_batch_delay(Duration::from_secs(5))
            .listener(Arc::new(NoopListener))
            .build()
            .unwrap()
            .live()
            .await
            .unwrap();

        for i in 0..20 {
            let content = format!("{}", i).into_bytes();
            for path in harness.apply(TestOperation::WriteFile { path: "log.txt".into(), content }) {
                session.notify(ChangeEvent::new(path, ChangeKind::Modified)).unwrap();
            }
        }
        wait_for_version(&session, 2).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(session.version(), 2);
        assert_eq!(session.key(), Some(harness.reference_key()));
        session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_unchanged_notification_commits_nothing() {
        let mut harness = ShareTestHarness::new();
        harness.apply(TestOperation::WriteFile { path: "a.txt".into(), content: b"a".to_vec() });

        let listener = RecordingListener::new();
        let session = harness.live(listener.clone()).await;
        session
            .notify(ChangeEvent::new(RelPath::new("a.txt"), ChangeKind::Modified))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(session.version(), 1);
        assert_eq!(listener.reports().len(), 1);
        session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_watcher_picks_up_changes() {
        let harness = ShareTestHarness::new();
        fs::write(harness.root().join("a.txt"), "a").unwrap();

        let session = ShareBuilder::new(harness.root())
            .debounce(Duration::from_millis(50))
            .listener(Arc::new(NoopListener))
            .build()
            .unwrap()
            .live()
            .await
            .unwrap();
        let first = session.key().unwrap();

        fs::write(harness.root().join("b.txt"), "b").unwrap();
        wait_for_version(&session, 2).await;

        assert_ne!(session.key().unwrap(), first);
        let report = session.stop().await.unwrap();
        assert_eq!(report.item_count, 2);
    }
}
