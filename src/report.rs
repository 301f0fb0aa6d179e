//! Report emitter interface
//!
//! The engine never prints. Everything a user interface might want to show
//! is delivered to a [`ReportListener`]:
//!
//! - `identity_key_announced` once when a share starts, and again in live
//!   mode whenever a committed version changes the key
//! - `entry_indexed` once per entry folded into the index
//! - `report_ready` when a walk or snapshot completes and after every
//!   committed live version
//! - `warning` for entries that were skipped and other recoverable problems
//!
//! All methods default to doing nothing, so an implementation only overrides
//! what it cares about. Listeners may be called from worker threads.

use crate::types::{EntryKind, IdentityKey, RelPath, Report, Warning};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Receiver of engine facts
///
/// # Examples
///
/// ```rust
/// use datshare::report::ReportListener;
/// use datshare::types::IdentityKey;
///
/// struct PrintLink;
///
/// impl ReportListener for PrintLink {
///     fn identity_key_announced(&self, key: &IdentityKey) {
///         println!("Link {}", key);
///     }
/// }
/// ```
pub trait ReportListener: Send + Sync {
    /// The identity key of the share, announced at start and on key changes
    fn identity_key_announced(&self, _key: &IdentityKey) {}

    /// An entry was folded into the index
    fn entry_indexed(&self, _path: &RelPath, _kind: &EntryKind) {}

    /// Aggregate counts are available
    fn report_ready(&self, _report: &Report) {}

    /// A recoverable problem was recorded
    fn warning(&self, _warning: &Warning) {}
}

impl<T: ReportListener + ?Sized> ReportListener for Arc<T> {
    fn identity_key_announced(&self, key: &IdentityKey) {
        (**self).identity_key_announced(key)
    }

    fn entry_indexed(&self, path: &RelPath, kind: &EntryKind) {
        (**self).entry_indexed(path, kind)
    }

    fn report_ready(&self, report: &Report) {
        (**self).report_ready(report)
    }

    fn warning(&self, warning: &Warning) {
        (**self).warning(warning)
    }
}

/// Listener that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl ReportListener for NoopListener {}

/// Listener that forwards every fact to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingListener;

impl ReportListener for TracingListener {
    fn identity_key_announced(&self, key: &IdentityKey) {
        info!(key = %key, "identity key announced");
    }

    fn entry_indexed(&self, path: &RelPath, kind: &EntryKind) {
        debug!(path = %path, kind = kind.label(), "entry indexed");
    }

    fn report_ready(&self, report: &Report) {
        info!(
            items = report.item_count,
            directories = report.directory_count,
            bytes = report.total_bytes,
            warnings = report.warnings.len(),
            "report ready"
        );
    }

    fn warning(&self, warning: &Warning) {
        warn!("{}", warning);
    }
}

/// A fact captured by [`RecordingListener`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportEvent {
    /// `identity_key_announced`
    KeyAnnounced(IdentityKey),
    /// `entry_indexed`
    EntryIndexed(RelPath, EntryKind),
    /// `report_ready`
    ReportReady(Report),
    /// `warning`
    Warning(Warning),
}

/// Thread-safe listener that records every event in order
#[derive(Debug, Default, Clone)]
pub struct RecordingListener {
    events: Arc<Mutex<Vec<ReportEvent>>>,
}

impl RecordingListener {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every event so far
    pub fn events(&self) -> Vec<ReportEvent> {
        self.events.lock().clone()
    }

    /// Announced keys in order
    pub fn announced_keys(&self) -> Vec<IdentityKey> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                ReportEvent::KeyAnnounced(key) => Some(*key),
                _ => None,
            })
            .collect()
    }

    /// Paths passed to `entry_indexed`, in order
    pub fn indexed_paths(&self) -> Vec<RelPath> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                ReportEvent::EntryIndexed(path, _) => Some(path.clone()),
                _ => None,
            })
            .collect()
    }

    /// Reports in order
    pub fn reports(&self) -> Vec<Report> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                ReportEvent::ReportReady(report) => Some(report.clone()),
                _ => None,
            })
            .collect()
    }

    /// Warnings in order
    pub fn warnings(&self) -> Vec<Warning> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                ReportEvent::Warning(w) => Some(w.clone()),
                _ => None,
            })
            .collect()
    }

    /// Forget everything recorded so far
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl ReportListener for RecordingListener {
    fn identity_key_announced(&self, key: &IdentityKey) {
        self.events.lock().push(ReportEvent::KeyAnnounced(*key));
    }

    fn entry_indexed(&self, path: &RelPath, kind: &EntryKind) {
        self.events.lock().push(ReportEvent::EntryIndexed(path.clone(), *kind));
    }

    fn report_ready(&self, report: &Report) {
        self.events.lock().push(ReportEvent::ReportReady(report.clone()));
    }

    fn warning(&self, warning: &Warning) {
        self.events.lock().push(ReportEvent::Warning(warning.clone()));
    }
}
