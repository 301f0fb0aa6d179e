//! Snapshot mode
//!
//! A snapshot is taken exactly once: one walk, one build, one save and one
//! announcement. Later filesystem changes are never looked at. Saved state
//! from an earlier run is consulted to skip rehashing files whose size and
//! modification time are unchanged, and its version history is carried
//! forward so earlier keys are not lost. The key itself depends on nothing
//! but the content of the tree.

use crate::error::Result;
use crate::index::ArchiveIndex;
use crate::reconciler::degraded_warnings;
use crate::report::ReportListener;
use crate::resume::{ResumeState, ResumeStore};
use crate::types::{IdentityKey, Report, Warning};
use crate::walker::Walker;
use std::time::{Duration, Instant};
use tracing::{info, instrument, warn};

/// Result of a snapshot
#[derive(Debug, Clone)]
pub struct SnapshotOutcome {
    /// Key of the snapshot
    pub identity_key: IdentityKey,
    /// Counts for the snapshot
    pub report: Report,
    /// Files whose digest was taken from saved state
    pub reused: usize,
    /// Files that were read and hashed
    pub hashed: usize,
    /// Wall time of the walk, build and save
    pub duration: Duration,
}

/// Takes one snapshot of a root
pub struct SnapshotTaker<'a> {
    walker: &'a Walker,
    store: &'a ResumeStore,
    listener: &'a dyn ReportListener,
    log_retention: usize,
}

impl<'a> SnapshotTaker<'a> {
    /// Snapshot the root of `walker`, saving through `store`
    pub fn new(
        walker: &'a Walker,
        store: &'a ResumeStore,
        listener: &'a dyn ReportListener,
        log_retention: usize,
    ) -> Self {
        Self { walker, store, listener, log_retention }
    }

    /// Walk, build, save and announce
    ///
    /// # Errors
    ///
    /// Fails with [`ShareError::PathNotFound`](crate::ShareError::PathNotFound)
    /// if the root disappeared and with
    /// [`ShareError::PersistFailure`](crate::ShareError::PersistFailure) if
    /// the result cannot be saved. Nothing is announced on failure.
    #[instrument(skip(self))]
    pub fn take(&self) -> Result<SnapshotOutcome> {
        let start = Instant::now();
        let mut warnings = Vec::new();

        let prior = match self.store.load() {
            Ok(prior) => prior,
            Err(e) if e.is_corruption() => {
                warn!("Ignoring unusable saved state: {}", e);
                let warning = Warning::general(format!("discarded saved state: {}", e));
                self.listener.warning(&warning);
                warnings.push(warning);
                None
            }
            Err(e) => return Err(e),
        };

        let scan = self.walker.scan(prior.as_ref().map(|state| &state.index))?;
        warnings.extend(degraded_warnings(&scan.degraded, self.listener));

        let mut index = ArchiveIndex::build(scan.entries, self.listener);
        index.set_log_retention(self.log_retention);
        if let Some(prior) = &prior {
            index.continue_from(&prior.index);
        }
        let state = ResumeState::from_index(index);
        self.store.save(&state)?;

        let mut report = state.index.report();
        report.warnings = warnings;

        info!(
            "Snapshot {} taken: {} items, {} ({} hashed, {} reused)",
            state.identity_key.short(),
            report.item_count,
            report.display_size(),
            scan.hashed,
            scan.reused
        );
        self.listener.identity_key_announced(&state.identity_key);
        self.listener.report_ready(&report);

        Ok(SnapshotOutcome {
            identity_key: state.identity_key,
            report,
            reused: scan.reused,
            hashed: scan.hashed,
            duration: start.elapsed(),
        })
    }
}
