//! Share facade
//!
//! [`ShareBuilder`] assembles a [`ShareConfig`], validates it, takes the
//! root lock and hands back a [`Share`]. A `Share` is then turned into
//! either a snapshot ([`Share::snapshot`]) or a live session
//! ([`Share::live`]). Both consume the share, so a root is indexed by at most
//! one mode per process, and the lock is released when the snapshot returns
//! or the live session stops.

use crate::error::{Result, ShareError};
use crate::fs_watcher::{ChangeEvent, FsWatcher};
use crate::lock::RootLock;
use crate::reconciler::{LiveStatus, Reconciler, ReconcilerMessage, ReconcilerState};
use crate::report::{ReportListener, TracingListener};
use crate::resume::ResumeStore;
use crate::snapshot::{SnapshotOutcome, SnapshotTaker};
use crate::types::{IdentityKey, Report, ShareConfig};
use crate::walker::Walker;
use parking_lot::RwLock;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Builder for [`Share`]
///
/// # Examples
///
/// ```rust,no_run
/// use datshare::ShareBuilder;
/// use std::time::Duration;
///
/// # fn main() -> datshare::Result<()> {
/// let share = ShareBuilder::new("./photos")
///     .ignore_patterns(vec!["*.tmp".to_string(), "node_modules".to_string()])
///     .debounce(Duration::from_millis(500))
///     .build()?;
/// let outcome = share.snapshot()?;
/// println!("Link {}", outcome.identity_key);
/// # Ok(())
/// # }
/// ```
pub struct ShareBuilder {
    config: ShareConfig,
    listener: Arc<dyn ReportListener>,
}

impl ShareBuilder {
    /// Start from the default configuration for `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::from_config(ShareConfig {
            root_path: root.into(),
            ..Default::default()
        })
    }

    /// Start from an existing configuration
    pub fn from_config(config: ShareConfig) -> Self {
        Self {
            config,
            listener: Arc::new(TracingListener),
        }
    }

    /// Name of the control directory inside the root
    pub fn control_dir_name(mut self, name: impl Into<String>) -> Self {
        self.config.control_dir_name = name.into();
        self
    }

    /// Threads used for hashing (minimum 1)
    pub fn hash_workers(mut self, count: usize) -> Self {
        self.config.hash_workers = count.max(1);
        self
    }

    /// Quiet period before a batch of live changes is committed
    pub fn debounce(mut self, debounce: Duration) -> Self {
        self.config.debounce = debounce;
        self
    }

    /// Upper bound on how long a batch may keep growing
    pub fn max_batch_delay(mut self, delay: Duration) -> Self {
        self.config.max_batch_delay = delay;
        self
    }

    /// Attempts per save
    pub fn persist_attempts(mut self, attempts: u32) -> Self {
        self.config.persist_attempts = attempts;
        self
    }

    /// Delay before the first save retry; doubles on each further retry
    pub fn persist_backoff(mut self, backoff: Duration) -> Self {
        self.config.persist_backoff = backoff;
        self
    }

    /// Glob patterns excluded from the share
    ///
    /// A pattern matches either the full relative path or the name of an
    /// entry; a matching directory is skipped with everything below it. The
    /// control directory is always excluded.
    pub fn ignore_patterns(mut self, patterns: Vec<String>) -> Self {
        self.config.ignore_patterns = patterns;
        self
    }

    /// Follow symbolic links while walking
    pub fn follow_symlinks(mut self, follow: bool) -> Self {
        self.config.follow_symlinks = follow;
        self
    }

    /// Use OS notifications in live mode
    ///
    /// When disabled, changes must be fed through [`LiveSession::notify`].
    pub fn watch(mut self, watch: bool) -> Self {
        self.config.watch = watch;
        self
    }

    /// Consecutive failed commits after which a live session gives up
    pub fn max_commit_failures(mut self, failures: u32) -> Self {
        self.config.max_commit_failures = failures;
        self
    }

    /// Change-log records kept in the saved state
    pub fn log_retention(mut self, records: usize) -> Self {
        self.config.log_retention = records;
        self
    }

    /// Receiver of keys, entries, reports and warnings
    pub fn listener(mut self, listener: Arc<dyn ReportListener>) -> Self {
        self.listener = listener;
        self
    }

    /// Validate the configuration and take the root lock
    ///
    /// The root is canonicalized first, so `"."` resolves to the current
    /// directory.
    ///
    /// # Errors
    ///
    /// - [`ShareError::PathNotFound`] if the root does not exist
    /// - [`ShareError::InvalidConfiguration`] if it is not a directory or a
    ///   setting is out of range
    /// - [`ShareError::InvalidPattern`] for a malformed ignore pattern
    /// - [`ShareError::RootBusy`] if another instance owns the root
    pub fn build(self) -> Result<Share> {
        let mut config = self.config;
        config.root_path = match config.root_path.canonicalize() {
            Ok(path) => path,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(ShareError::PathNotFound(config.root_path))
            }
            Err(e) => return Err(e.into()),
        };
        if !config.root_path.is_dir() {
            return Err(ShareError::InvalidConfiguration(format!(
                "{} is not a directory",
                config.root_path.display()
            )));
        }
        config.validate()?;

        let walker = Walker::new(config.root_path.clone(), &config.control_dir_name)
            .with_ignore_patterns(&config.ignore_patterns)?
            .with_follow_symlinks(config.follow_symlinks)
            .with_hash_workers(config.hash_workers);
        let lock = RootLock::acquire(&config.control_dir())?;
        let store = ResumeStore::from_config(&config);

        info!("Opened share at {}", config.root_path.display());
        Ok(Share {
            walker: Arc::new(walker),
            store: Arc::new(store),
            listener: self.listener,
            lock,
            config,
        })
    }
}

/// A locked root, ready to be shared
pub struct Share {
    config: ShareConfig,
    walker: Arc<Walker>,
    store: Arc<ResumeStore>,
    listener: Arc<dyn ReportListener>,
    lock: RootLock,
}

impl Share {
    /// Canonical root directory
    pub fn root(&self) -> &Path {
        &self.config.root_path
    }

    /// Effective configuration
    pub fn config(&self) -> &ShareConfig {
        &self.config
    }

    /// Key recorded by the last save, without walking the tree
    pub fn saved_key(&self) -> Result<Option<IdentityKey>> {
        self.store.read_key()
    }

    /// Share a frozen copy of the tree
    ///
    /// Walks once, saves, announces the key and returns. The root lock is
    /// released on return.
    pub fn snapshot(self) -> Result<SnapshotOutcome> {
        let outcome = SnapshotTaker::new(
            &self.walker,
            &self.store,
            self.listener.as_ref(),
            self.config.log_retention,
        )
        .take()?;
        debug!("Releasing {}", self.lock.path().display());
        Ok(outcome)
    }

    /// Share the tree and keep following it
    ///
    /// Produces the first version (reusing saved state when it is still
    /// fresh), announces the key and returns a running [`LiveSession`].
    /// Must be called inside a tokio runtime.
    pub async fn live(self) -> Result<LiveSession> {
        let Share { config, walker, store, listener, lock } = self;
        let (tx, rx) = unbounded_channel();

        // Start watching before the first walk so nothing in between is lost
        let watcher = if config.watch {
            let watcher = FsWatcher::new(&config.root_path, Arc::clone(&walker), tx.clone())?;
            watcher.watch()?;
            Some(watcher)
        } else {
            None
        };

        let mut reconciler = Reconciler::new(walker, store, listener, &config).with_lock(lock);
        let status = reconciler.status();
        reconciler.start().await?;

        let handle = tokio::spawn(reconciler.run(rx));
        Ok(LiveSession {
            tx,
            status,
            handle: Some(handle),
            watcher,
        })
    }
}

/// A running live share
///
/// Dropping the session asks the reconciler to stop; use
/// [`stop`](Self::stop) to wait for it and get the final report.
pub struct LiveSession {
    tx: UnboundedSender<ReconcilerMessage>,
    status: Arc<RwLock<LiveStatus>>,
    handle: Option<JoinHandle<Result<Report>>>,
    watcher: Option<FsWatcher>,
}

impl LiveSession {
    /// Key of the last committed version
    pub fn key(&self) -> Option<IdentityKey> {
        self.status.read().identity_key
    }

    /// Current lifecycle state
    pub fn state(&self) -> ReconcilerState {
        self.status.read().state
    }

    /// Last committed version number
    pub fn version(&self) -> u64 {
        self.status.read().version
    }

    /// Report for the last committed version
    pub fn report(&self) -> Report {
        self.status.read().report.clone()
    }

    /// Feed a change to the reconciler
    pub fn notify(&self, event: ChangeEvent) -> Result<()> {
        self.send(ReconcilerMessage::Changed(event))
    }

    /// Ask for a full reconciliation walk
    pub fn rescan(&self) -> Result<()> {
        self.send(ReconcilerMessage::Rescan)
    }

    /// Sender for feeding messages from elsewhere
    pub fn sender(&self) -> UnboundedSender<ReconcilerMessage> {
        self.tx.clone()
    }

    fn send(&self, message: ReconcilerMessage) -> Result<()> {
        self.tx
            .send(message)
            .map_err(|_| ShareError::internal("live session has stopped"))
    }

    /// Wait until the reconciler stops on its own
    ///
    /// Returns immediately with the last report if it already stopped.
    pub async fn wait(&mut self) -> Result<Report> {
        let Some(handle) = self.handle.as_mut() else {
            return Ok(self.report());
        };
        let result = handle
            .await
            .map_err(|e| ShareError::internal(format!("reconciler task failed: {e}")))?;
        self.handle = None;
        result
    }

    /// Stop the session and wait for it to wind down
    ///
    /// A batch that has not started saving is discarded; a save in flight
    /// completes first. Returns the report of the last committed version.
    pub async fn stop(mut self) -> Result<Report> {
        self.shutdown_watcher();
        if self.tx.send(ReconcilerMessage::Stop).is_err() {
            debug!("Reconciler already stopped");
        }
        self.wait().await
    }

    fn shutdown_watcher(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            if let Err(e) = watcher.stop() {
                warn!("Failed to stop watcher: {}", e);
            }
        }
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        self.shutdown_watcher();
        if self.handle.is_some() {
            let _ = self.tx.send(ReconcilerMessage::Stop);
        }
    }
}
