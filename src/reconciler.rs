//! Live-mode reconciler
//!
//! The reconciler keeps the index of a live share in step with the
//! filesystem. It is an explicit state machine driven by a single message
//! stream:
//!
//! ```text
//! Starting ──▶ Indexing ──▶ Watching ◀──▶ Reacting
//!                              │             │
//!                              ▼             ▼
//!                           Stopping ──▶ Stopped
//! ```
//!
//! - **Starting** loads the saved [`ResumeState`], if any
//! - **Indexing** reuses it when a stat-only walk shows nothing changed,
//!   reconciles it incrementally when something did, or walks from scratch
//! - **Watching** collects [`ReconcilerMessage`]s, coalescing repeated
//!   events for the same path and waiting for a quiet period (`debounce`,
//!   bounded by `max_batch_delay`)
//! - **Reacting** prepares the next version on a copy of the index in a
//!   blocking worker, then saves it; only a successful save makes it the
//!   committed version
//!
//! A [`ReconcilerMessage::Stop`] received while a batch is pending or being
//! prepared discards that batch. A save that has already started is always
//! awaited, so stopping never leaves a half-written control directory.

use crate::error::{Result, ShareError};
use crate::fs_watcher::{ChangeEvent, ChangeKind};
use crate::index::{ArchiveIndex, Change, UpdateOutcome};
use crate::lock::RootLock;
use crate::report::ReportListener;
use crate::resume::{ResumeState, ResumeStore};
use crate::types::{IdentityKey, RelPath, Report, ShareConfig, Warning};
use crate::walker::{Materialized, Walker};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Lifecycle state of a live share
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilerState {
    /// Loading saved state
    Starting,
    /// Producing the first version
    Indexing,
    /// Waiting for changes
    Watching,
    /// Preparing or committing a batch
    Reacting,
    /// Winding down after a stop request
    Stopping,
    /// Finished; the lock has been released
    Stopped,
}

/// Input to the reconciler loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcilerMessage {
    /// A path changed
    Changed(ChangeEvent),
    /// Notifications were lost; reconcile with a full walk
    Rescan,
    /// Stop after flushing any save in flight
    Stop,
}

/// Observable status of a live share
#[derive(Debug, Clone)]
pub struct LiveStatus {
    /// Current lifecycle state
    pub state: ReconcilerState,
    /// Key of the last committed version
    pub identity_key: Option<IdentityKey>,
    /// Last committed version
    pub version: u64,
    /// Report for the last committed version
    pub report: Report,
}

impl Default for LiveStatus {
    fn default() -> Self {
        Self {
            state: ReconcilerState::Starting,
            identity_key: None,
            version: 0,
            report: Report::default(),
        }
    }
}

/// A batch prepared against a copy of the index
struct Prepared {
    index: ArchiveIndex,
    outcome: UpdateOutcome,
    warnings: Vec<Warning>,
    full_walk: bool,
}

enum ReactOutcome {
    Committed,
    Unchanged,
    Cancelled,
}

/// Drives one live share
pub struct Reconciler {
    walker: Arc<Walker>,
    store: Arc<ResumeStore>,
    listener: Arc<dyn ReportListener>,
    status: Arc<RwLock<LiveStatus>>,
    committed: Option<ResumeState>,
    lock: Option<RootLock>,
    debounce: Duration,
    max_batch_delay: Duration,
    max_commit_failures: u32,
    log_retention: usize,
}

impl Reconciler {
    /// Create a reconciler in the `Starting` state
    pub fn new(
        walker: Arc<Walker>,
        store: Arc<ResumeStore>,
        listener: Arc<dyn ReportListener>,
        config: &ShareConfig,
    ) -> Self {
        Self {
            walker,
            store,
            listener,
            status: Arc::new(RwLock::new(LiveStatus::default())),
            committed: None,
            lock: None,
            debounce: config.debounce,
            max_batch_delay: config.max_batch_delay.max(config.debounce),
            max_commit_failures: config.max_commit_failures.max(1),
            log_retention: config.log_retention,
        }
    }

    /// Hold `lock` until the reconciler stops
    pub fn with_lock(mut self, lock: RootLock) -> Self {
        self.lock = Some(lock);
        self
    }

    /// Shared handle on the live status
    pub fn status(&self) -> Arc<RwLock<LiveStatus>> {
        Arc::clone(&self.status)
    }

    fn set_state(&self, state: ReconcilerState) {
        debug!("Reconciler state: {:?}", state);
        self.status.write().state = state;
    }

    /// Produce and commit the first version
    ///
    /// Announces the identity key and emits the initial report.
    ///
    /// # Errors
    ///
    /// Fails with [`ShareError::PathNotFound`] if the root vanished and with
    /// [`ShareError::PersistFailure`] if the first version cannot be saved.
    #[instrument(skip(self))]
    pub async fn start(&mut self) -> Result<Report> {
        self.set_state(ReconcilerState::Starting);
        let store = Arc::clone(&self.store);
        let loaded = blocking(move || Ok(store.load())).await?;

        let mut warnings = Vec::new();
        let prior = match loaded {
            Ok(state) => state,
            Err(e) if e.is_corruption() => {
                warn!("Discarding unusable resume state: {}", e);
                let warning = Warning::general(format!("discarded saved state: {}", e));
                self.listener.warning(&warning);
                warnings.push(warning);
                None
            }
            Err(e) => return Err(e),
        };

        self.set_state(ReconcilerState::Indexing);
        let walker = Arc::clone(&self.walker);
        let store = Arc::clone(&self.store);
        let listener = Arc::clone(&self.listener);
        let retention = self.log_retention;
        let (state, scan_warnings) = blocking(move || {
            index_for_live(&walker, &store, prior, listener.as_ref(), retention)
        })
        .await?;
        warnings.extend(scan_warnings);

        let mut report = state.index.report();
        report.warnings = warnings;
        {
            let mut status = self.status.write();
            status.identity_key = Some(state.identity_key);
            status.version = state.index.version();
            status.report = report.clone();
        }
        self.set_state(ReconcilerState::Watching);

        info!("Live share ready: key {}, version {}", state.identity_key, state.index.version());
        self.listener.identity_key_announced(&state.identity_key);
        self.listener.report_ready(&report);
        self.committed = Some(state);
        Ok(report)
    }

    /// Consume messages until stopped
    ///
    /// Returns the report of the last committed version.
    ///
    /// # Errors
    ///
    /// Returns [`ShareError::PersistFailure`] after `max_commit_failures`
    /// consecutive failed commits. The last committed state stays on disk.
    pub async fn run(mut self, mut rx: UnboundedReceiver<ReconcilerMessage>) -> Result<Report> {
        if self.committed.is_none() {
            self.start().await?;
        }
        self.set_state(ReconcilerState::Watching);

        let mut batch = Batch::default();
        let mut failures = 0u32;
        let result = loop {
            let deadline = batch.deadline;
            tokio::select! {
                message = rx.recv() => match message {
                    Some(ReconcilerMessage::Changed(event)) => batch.push(event, self.debounce, self.max_batch_delay),
                    Some(ReconcilerMessage::Rescan) => batch.rescan(self.debounce, self.max_batch_delay),
                    Some(ReconcilerMessage::Stop) | None => {
                        if !batch.is_empty() {
                            debug!("Discarding {} pending changes on stop", batch.changes.len());
                        }
                        break Ok(());
                    }
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    let current = std::mem::take(&mut batch);
                    self.set_state(ReconcilerState::Reacting);
                    match self.react(&current, &mut batch, &mut rx).await {
                        Ok(ReactOutcome::Cancelled) => break Ok(()),
                        Ok(ReactOutcome::Committed) | Ok(ReactOutcome::Unchanged) => failures = 0,
                        Err(e) => {
                            failures += 1;
                            error!("Commit failed ({}/{}): {}", failures, self.max_commit_failures, e);
                            self.listener.warning(&Warning::general(format!("commit failed: {}", e)));
                            if failures >= self.max_commit_failures {
                                break Err(e);
                            }
                            batch.requeue(current, self.debounce, self.max_batch_delay);
                        }
                    }
                    self.set_state(ReconcilerState::Watching);
                }
            }
        };

        self.set_state(ReconcilerState::Stopping);
        rx.close();
        let report = self.status.read().report.clone();
        drop(self.lock.take());
        self.set_state(ReconcilerState::Stopped);
        info!("Live share stopped");
        result.map(|_| report)
    }

    async fn react(
        &mut self,
        current: &Batch,
        next: &mut Batch,
        rx: &mut UnboundedReceiver<ReconcilerMessage>,
    ) -> Result<ReactOutcome> {
        let Some(committed) = self.committed.as_ref() else {
            return Err(ShareError::internal("reconciler has no committed state"));
        };

        let walker = Arc::clone(&self.walker);
        let base = committed.index.clone();
        let changes = current.changes.clone();
        let full = current.full_rescan;
        let mut prepare = tokio::task::spawn_blocking(move || prepare_batch(&walker, base, changes, full));

        let prepared = loop {
            tokio::select! {
                joined = &mut prepare => {
                    break joined.map_err(|e| ShareError::internal(format!("prepare task failed: {e}")))??;
                }
                message = rx.recv() => match message {
                    Some(ReconcilerMessage::Changed(event)) => next.push(event, self.debounce, self.max_batch_delay),
                    Some(ReconcilerMessage::Rescan) => next.rescan(self.debounce, self.max_batch_delay),
                    Some(ReconcilerMessage::Stop) | None => {
                        info!("Stop requested while preparing; discarding uncommitted batch");
                        return Ok(ReactOutcome::Cancelled);
                    }
                },
            }
        };

        for warning in &prepared.warnings {
            self.listener.warning(warning);
        }

        let outcome = prepared.outcome;
        if !outcome.changed && outcome.touched == 0 && !prepared.full_walk {
            return Ok(ReactOutcome::Unchanged);
        }

        let mut candidate = committed.clone();
        candidate.advance(prepared.index);
        if prepared.full_walk {
            candidate.last_walked_version = candidate.index.version();
        }

        // A save in flight is always completed before the next message is read
        let store = Arc::clone(&self.store);
        let to_save = candidate.clone();
        blocking(move || store.save(&to_save)).await?;

        let previous_key = committed.identity_key;
        self.committed = Some(candidate);
        if !outcome.changed {
            return Ok(ReactOutcome::Unchanged);
        }

        let Some(state) = self.committed.as_ref() else {
            return Err(ShareError::internal("reconciler lost its committed state"));
        };
        for entry in &outcome.indexed {
            self.listener.entry_indexed(&entry.path, &entry.kind);
        }
        let mut report = state.index.report();
        report.warnings = prepared.warnings;
        {
            let mut status = self.status.write();
            status.identity_key = Some(state.identity_key);
            status.version = state.index.version();
            status.report = report.clone();
        }

        if state.identity_key != previous_key {
            info!("Version {} committed, new key {}", state.index.version(), state.identity_key);
            self.listener.identity_key_announced(&state.identity_key);
        } else {
            debug!("Version {} committed, key unchanged", state.index.version());
        }
        self.listener.report_ready(&report);
        Ok(ReactOutcome::Committed)
    }
}

/// Coalesced changes waiting for the debounce window to close
#[derive(Debug, Default)]
struct Batch {
    changes: BTreeMap<RelPath, ChangeKind>,
    full_rescan: bool,
    first_seen: Option<Instant>,
    deadline: Option<Instant>,
}

impl Batch {
    fn is_empty(&self) -> bool {
        self.changes.is_empty() && !self.full_rescan
    }

    fn push(&mut self, event: ChangeEvent, debounce: Duration, max_delay: Duration) {
        self.changes.insert(event.path, event.kind);
        self.schedule(debounce, max_delay);
    }

    fn rescan(&mut self, debounce: Duration, max_delay: Duration) {
        self.full_rescan = true;
        self.schedule(debounce, max_delay);
    }

    /// Put a failed batch back without overriding newer events
    fn requeue(&mut self, failed: Batch, debounce: Duration, max_delay: Duration) {
        for (path, kind) in failed.changes {
            self.changes.entry(path).or_insert(kind);
        }
        self.full_rescan |= failed.full_rescan;
        self.schedule(debounce, max_delay);
    }

    fn schedule(&mut self, debounce: Duration, max_delay: Duration) {
        let now = Instant::now();
        let first = *self.first_seen.get_or_insert(now);
        self.deadline = Some((now + debounce).min(first + max_delay));
    }
}

/// Run `f` on the blocking pool
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ShareError::internal(format!("blocking task failed: {e}")))?
}

/// Produce the first live version from whatever was saved
fn index_for_live(
    walker: &Walker,
    store: &ResumeStore,
    prior: Option<ResumeState>,
    listener: &dyn ReportListener,
    log_retention: usize,
) -> Result<(ResumeState, Vec<Warning>)> {
    match prior {
        Some(state) if store.is_fresh(&state, walker)? => {
            info!("Saved state is fresh; reusing version {}", state.index.version());
            state.index.replay(listener);
            Ok((state, Vec::new()))
        }
        Some(mut state) => {
            info!("Saved state is stale; reconciling");
            let scan = walker.scan(Some(&state.index))?;
            let warnings = degraded_warnings(&scan.degraded, listener);
            let mut index = state.index.clone();
            let changes = index.diff(&scan.entries);
            let outcome = index.apply(changes);
            debug!(
                "Resume reconciliation: {} reused, {} hashed, version {} (changed: {})",
                scan.reused, scan.hashed, outcome.version, outcome.changed
            );
            index.replay(listener);
            state.advance(index);
            state.last_walked_version = state.index.version();
            store.save(&state)?;
            Ok((state, warnings))
        }
        None => {
            info!("No saved state; indexing from scratch");
            let scan = walker.scan(None)?;
            let warnings = degraded_warnings(&scan.degraded, listener);
            let mut index = ArchiveIndex::build(scan.entries, listener);
            index.set_log_retention(log_retention);
            let state = ResumeState::from_index(index);
            store.save(&state)?;
            Ok((state, warnings))
        }
    }
}

/// Turn degraded entries into warnings, notifying the listener
pub(crate) fn degraded_warnings(
    degraded: &[crate::types::Degraded],
    listener: &dyn ReportListener,
) -> Vec<Warning> {
    degraded
        .iter()
        .map(|d| {
            let warning = Warning::from(d);
            listener.warning(&warning);
            warning
        })
        .collect()
}

/// Stat and hash the paths of a batch and fold them into `index`
fn prepare_batch(
    walker: &Walker,
    mut index: ArchiveIndex,
    changes: BTreeMap<RelPath, ChangeKind>,
    full_rescan: bool,
) -> Result<Prepared> {
    let mut warnings = Vec::new();
    let mut folded = Vec::new();

    if full_rescan {
        info!("Reconciling with a full walk");
        let scan = walker.scan(Some(&index))?;
        warnings.extend(scan.degraded.iter().map(Warning::from));
        folded = index.diff(&scan.entries);
    } else {
        for (path, kind) in changes {
            if walker.is_excluded(&path) {
                continue;
            }
            let stat = match walker.stat(&path) {
                Ok(stat) => stat,
                Err(e) if e.is_recoverable() => {
                    warnings.push(Warning::at(path.clone(), e.to_string()));
                    folded.push(Change::Remove(path));
                    continue;
                }
                Err(e) => return Err(e),
            };
            match stat {
                None => {
                    debug!("{} is gone ({:?})", path, kind);
                    folded.push(Change::Remove(path));
                }
                Some(stat) if stat.is_dir => {
                    let scan = walker.scan_from(&path, Some(&index))?;
                    warnings.extend(scan.degraded.iter().map(Warning::from));
                    folded.extend(index.diff_within(&path, &scan.entries));
                }
                Some(stat) => match walker.materialize(stat, None) {
                    Materialized::Entry(entry, _) => folded.push(Change::Upsert(entry)),
                    Materialized::Degraded(d) => {
                        warnings.push(Warning::from(&d));
                        folded.push(Change::Remove(d.path));
                    }
                    Materialized::Vanished => folded.push(Change::Remove(path)),
                },
            }
        }
    }

    let outcome = index.apply(folded);
    Ok(Prepared { index, outcome, warnings, full_walk: full_rescan })
}
