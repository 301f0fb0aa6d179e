//! Chaos tests for datshare
//!
//! Damages the control directory, races instances against each other and
//! makes saves fail, then checks that the engine recovers without ever
//! reporting a wrong key.

use ::datshare::resume::{INDEX_FILE, KEY_FILE, METADATA_FILE};
use ::datshare::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tracing::info;

/// Deterministic damage to files on disk
pub struct ChaosEngine {
    state: u64,
}

impl ChaosEngine {
    pub fn new(seed: u64) -> Self {
        Self { state: seed.max(1) }
    }

    fn next(&mut self) -> u64 {
        // xorshift64
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        self.state
    }

    /// Flip bytes at random offsets
    pub fn corrupt_file(&mut self, path: &Path, flips: usize) -> anyhow::Result<()> {
        let mut bytes = fs::read(path)?;
        if bytes.is_empty() {
            return Ok(());
        }
        for _ in 0..flips {
            let at = (self.next() % bytes.len() as u64) as usize;
            bytes[at] ^= 0xA5;
        }
        fs::write(path, bytes)?;
        Ok(())
    }

    /// Cut a file short
    pub fn truncate_file(&mut self, path: &Path) -> anyhow::Result<()> {
        let bytes = fs::read(path)?;
        let keep = (self.next() % bytes.len().max(1) as u64) as usize;
        fs::write(path, &bytes[..keep])?;
        Ok(())
    }
}

fn dataset() -> TempDir {
    let temp_dir = TempDir::new().unwrap();
    for i in 0..10 {
        let dir = temp_dir.path().join(format!("dir{}", i % 3));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(format!("file{}.dat", i)), vec![i as u8; 100 * (i + 1)]).unwrap();
    }
    temp_dir
}

fn snapshot(root: &Path, listener: RecordingListener) -> Result<snapshot::SnapshotOutcome> {
    ShareBuilder::new(root)
        .listener(Arc::new(listener))
        .build()?
        .snapshot()
}

fn control(root: &Path) -> PathBuf {
    root.join(DEFAULT_CONTROL_DIR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corrupted_index_falls_back_to_full_walk() {
        let temp_dir = dataset();
        let original = snapshot(temp_dir.path(), RecordingListener::new()).unwrap();

        let mut chaos = ChaosEngine::new(42);
        for round in 0..5 {
            info!("Corruption round {}", round);
            chaos.corrupt_file(&control(temp_dir.path()).join(INDEX_FILE), 8).unwrap();

            let listener = RecordingListener::new();
            let outcome = snapshot(temp_dir.path(), listener.clone()).unwrap();
            assert_eq!(outcome.identity_key, original.identity_key);
        }
    }

    #[test]
    fn test_truncated_index_is_detected() {
        let temp_dir = dataset();
        let original = snapshot(temp_dir.path(), RecordingListener::new()).unwrap();
        ChaosEngine::new(7)
            .truncate_file(&control(temp_dir.path()).join(INDEX_FILE))
            .unwrap();

        let store = ResumeStore::new(control(temp_dir.path()));
        let loaded = store.load();
        assert!(matches!(&loaded, Err(e) if e.is_corruption()), "got {:?}", loaded.map(|_| ()));

        let listener = RecordingListener::new();
        let outcome = snapshot(temp_dir.path(), listener.clone()).unwrap();
        assert_eq!(outcome.identity_key, original.identity_key);
        assert_eq!(listener.warnings().len(), 1);
    }

    #[test]
    fn test_missing_key_and_metadata_are_rewritten() {
        let temp_dir = dataset();
        let original = snapshot(temp_dir.path(), RecordingListener::new()).unwrap();
        fs::remove_file(control(temp_dir.path()).join(KEY_FILE)).unwrap();
        fs::write(control(temp_dir.path()).join(METADATA_FILE), "{ not json").unwrap();

        let store = ResumeStore::new(control(temp_dir.path()));
        let state = store.load().unwrap().unwrap();
        assert_eq!(state.identity_key, original.identity_key);
        assert_eq!(store.read_key().unwrap(), Some(original.identity_key));
    }

    #[test]
    fn test_concurrent_instances_one_wins() {
        let temp_dir = dataset();
        let root = temp_dir.path().to_path_buf();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let root = root.clone();
                std::thread::spawn(move || {
                    ShareBuilder::new(&root)
                        .listener(Arc::new(NoopListener))
                        .build()
                        .and_then(|share| {
                            // Hold the lock for a while so the others collide
                            std::thread::sleep(Duration::from_millis(200));
                            share.snapshot()
                        })
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        let busy = results
            .iter()
            .filter(|r| matches!(r, Err(ShareError::RootBusy(_))))
            .count();

        assert!(!winners.is_empty());
        assert_eq!(winners.len() + busy, results.len());
        let key = winners[0].identity_key;
        assert!(winners.iter().all(|w| w.identity_key == key));
    }

    #[tokio::test]
    async fn test_busy_root_does_not_disturb_live_session() {
        let temp_dir = dataset();
        let session = ShareBuilder::new(temp_dir.path())
            .watch(false)
            .listener(Arc::new(NoopListener))
            .build()
            .unwrap()
            .live()
            .await
            .unwrap();

        let intruder = ShareBuilder::new(temp_dir.path()).build();
        assert!(matches!(intruder, Err(ShareError::RootBusy(_))));
        assert_eq!(session.state(), ReconcilerState::Watching);

        session.stop().await.unwrap();
        assert!(ShareBuilder::new(temp_dir.path()).build().is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_persist_failures_stop_session_and_keep_last_state() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = dataset();
        let session = ShareBuilder::new(temp_dir.path())
            .watch(false)
            .debounce(Duration::from_millis(10))
            .persist_attempts(2)
            .persist_backoff(Duration::from_millis(1))
            .max_commit_failures(2)
            .listener(Arc::new(NoopListener))
            .build()
            .unwrap()
            .live()
            .await
            .unwrap();
        let committed = session.key().unwrap();

        let control_dir = control(temp_dir.path());
        fs::set_permissions(&control_dir, fs::Permissions::from_mode(0o500)).unwrap();
        if fs::write(control_dir.join("write-check"), b"x").is_ok() {
            // Running with privileges that ignore permissions
            fs::set_permissions(&control_dir, fs::Permissions::from_mode(0o755)).unwrap();
            session.stop().await.unwrap();
            return;
        }

        fs::write(temp_dir.path().join("dir0/new.dat"), b"new").unwrap();
        session
            .notify(ChangeEvent::new(RelPath::new("dir0/new.dat"), ChangeKind::Created))
            .unwrap();

        let mut session = session;
        let result = tokio::time::timeout(Duration::from_secs(10), session.wait())
            .await
            .unwrap();
        assert!(matches!(result, Err(ShareError::PersistFailure { attempts: 2, .. })));

        fs::set_permissions(&control_dir, fs::Permissions::from_mode(0o755)).unwrap();
        let state = ResumeStore::new(control_dir).load().unwrap().unwrap();
        assert_eq!(state.identity_key, committed);
        assert_eq!(state.index.version(), 1);
    }
}
