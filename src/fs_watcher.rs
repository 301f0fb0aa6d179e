//! File system watcher feeding the live reconciler
//!
//! [`FsWatcher`] wraps the platform notification backend from the `notify`
//! crate. Raw callbacks never touch the index: every notification is turned
//! into a [`ReconcilerMessage`] and pushed onto the reconciler's channel, so
//! the reconciler sees one ordered message stream regardless of where events
//! come from.
//!
//! Paths inside the control directory and ignored paths are dropped here.
//! When the backend reports an error or asks for a rescan (for example after
//! a kernel queue overflow), a [`ReconcilerMessage::Rescan`] is sent instead
//! and the reconciler falls back to a full walk.

use crate::error::Result;
use crate::reconciler::ReconcilerMessage;
use crate::types::RelPath;
use crate::utils::make_relative;
use crate::walker::Walker;
use notify::{Event, EventKind, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, trace};

/// What happened to a path, as reported by the OS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Path appeared
    Created,
    /// Content or metadata changed, or the path was renamed
    Modified,
    /// Path disappeared
    Removed,
}

/// A single change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Affected path relative to the root
    pub path: RelPath,
    /// Reported kind; the reconciler re-stats the path regardless
    pub kind: ChangeKind,
}

impl ChangeEvent {
    /// Build an event
    pub fn new(path: RelPath, kind: ChangeKind) -> Self {
        Self { path, kind }
    }
}

/// OS notification source for one root
pub struct FsWatcher {
    watcher: Mutex<notify::RecommendedWatcher>,
    root_path: PathBuf,
    running: AtomicBool,
}

impl FsWatcher {
    /// Create a watcher that forwards changes under `root` to `tx`
    ///
    /// `root` should be canonical, since the backend reports canonical paths.
    /// Nothing is delivered until [`watch`](Self::watch) is called.
    ///
    /// # Errors
    ///
    /// Returns [`ShareError::Watch`](crate::ShareError::Watch) if the
    /// backend cannot be initialized.
    pub fn new(root: &Path, walker: Arc<Walker>, tx: UnboundedSender<ReconcilerMessage>) -> Result<Self> {
        info!("Initializing file system watcher for: {}", root.display());
        let root_path = root.to_path_buf();
        let callback_root = root_path.clone();

        let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let messages = match res {
                Ok(event) => {
                    trace!("File system event: {:?}", event);
                    translate(&event, &callback_root, &walker)
                }
                Err(e) => {
                    error!("Watch error: {}", e);
                    vec![ReconcilerMessage::Rescan]
                }
            };
            for message in messages {
                // The receiver is gone once the reconciler has stopped
                if tx.send(message).is_err() {
                    break;
                }
            }
        })?;

        Ok(Self {
            watcher: Mutex::new(watcher),
            root_path,
            running: AtomicBool::new(false),
        })
    }

    /// Start delivering notifications
    pub fn watch(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("Watcher already running");
            return Ok(());
        }
        info!("Starting file system watch on: {}", self.root_path.display());
        self.watcher.lock().watch(&self.root_path, RecursiveMode::Recursive)?;
        Ok(())
    }

    /// Stop delivering notifications
    pub fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Stopping file system watch");
        self.watcher.lock().unwatch(&self.root_path)?;
        Ok(())
    }

    /// Whether notifications are being delivered
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for FsWatcher {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            debug!("Failed to stop watcher cleanly: {}", e);
        }
    }
}

/// Convert one backend event into reconciler messages
pub fn translate(event: &Event, root: &Path, walker: &Walker) -> Vec<ReconcilerMessage> {
    if event.need_rescan() {
        return vec![ReconcilerMessage::Rescan];
    }
    let kind = match event.kind {
        EventKind::Create(_) => ChangeKind::Created,
        EventKind::Modify(_) | EventKind::Any | EventKind::Other => ChangeKind::Modified,
        EventKind::Remove(_) => ChangeKind::Removed,
        EventKind::Access(_) => return Vec::new(),
    };
    event
        .paths
        .iter()
        .filter_map(|p| make_relative(p, root))
        .filter(|rel| !rel.is_root() && !walker.is_excluded(rel))
        .map(|rel| ReconcilerMessage::Changed(ChangeEvent::new(rel, kind)))
        .collect()
}
