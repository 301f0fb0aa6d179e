//! Persisted resume state
//!
//! Everything needed to restart a share without rehashing lives in the
//! control directory of the root:
//!
//! ```text
//! <root>/.dat/
//! ├── lock            # advisory lock, see `lock`
//! ├── index.bin       # bincode: entries, version history, change log
//! ├── key             # the identity key as 64 hex characters
//! └── metadata.json   # crate version, timestamps, configuration
//! ```
//!
//! Each file is replaced atomically (temporary file, fsync, rename). The
//! index is written before the key, and on load the index is authoritative:
//! it is rebuilt from its entries and must reproduce the key it recorded.
//! A `key` file that disagrees, for example after a crash between the two
//! renames, is rewritten from the index.
//!
//! Saves are retried with doubling backoff; after the configured number of
//! attempts the save fails with [`ShareError::PersistFailure`] and the files
//! from the last successful save stay in place.

use crate::error::{Result, ShareError};
use crate::index::{ArchiveIndex, LogRecord, VersionRecord};
use crate::types::{Entry, IdentityKey, ShareConfig, ShareMetadata};
use crate::utils::{atomic_write, ensure_dir};
use crate::walker::Walker;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// On-disk format version of `index.bin`
pub const FORMAT_VERSION: u32 = 1;

/// Upper bound on bytes claimed while decoding `index.bin`
const DECODE_LIMIT: usize = 1 << 30;

/// File holding the serialized index
pub const INDEX_FILE: &str = "index.bin";
/// File holding the hex identity key
pub const KEY_FILE: &str = "key";
/// File holding [`ShareMetadata`]
pub const METADATA_FILE: &str = "metadata.json";

/// State carried from one run to the next
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeState {
    /// Key of the last committed version
    pub identity_key: IdentityKey,
    /// The index itself
    pub index: ArchiveIndex,
    /// Version of the index when the tree was last fully walked
    pub last_walked_version: u64,
    /// Newest modification time seen in the tree
    pub high_water_mark_ns: i64,
}

impl ResumeState {
    /// Capture the current state of `index` after a full walk
    pub fn from_index(index: ArchiveIndex) -> Self {
        let high_water_mark_ns = index.entries().map(|e| e.modified_ns).max().unwrap_or(0);
        Self {
            identity_key: index.identity_key(),
            last_walked_version: index.version(),
            high_water_mark_ns,
            index,
        }
    }

    /// Refresh the key and high-water mark after the index moved on
    pub fn advance(&mut self, index: ArchiveIndex) {
        let newest = index.entries().map(|e| e.modified_ns).max().unwrap_or(0);
        self.high_water_mark_ns = self.high_water_mark_ns.max(newest);
        self.identity_key = index.identity_key();
        self.index = index;
    }
}

#[derive(Serialize, Deserialize)]
struct PersistedState {
    format_version: u32,
    identity_key: IdentityKey,
    version: u64,
    last_walked_version: u64,
    high_water_mark_ns: i64,
    entries: Vec<Entry>,
    history: Vec<VersionRecord>,
    log: Vec<LogRecord>,
}

/// Load and save [`ResumeState`] under a control directory
#[derive(Debug, Clone)]
pub struct ResumeStore {
    control_dir: PathBuf,
    attempts: u32,
    backoff: Duration,
    log_retention: usize,
    config: ShareConfig,
}

impl ResumeStore {
    /// Store rooted at `control_dir` with default retry settings
    pub fn new(control_dir: PathBuf) -> Self {
        let config = ShareConfig {
            root_path: control_dir.parent().map(Path::to_path_buf).unwrap_or_default(),
            ..Default::default()
        };
        Self::from_config(&config).with_control_dir(control_dir)
    }

    /// Store for the share described by `config`
    pub fn from_config(config: &ShareConfig) -> Self {
        Self {
            control_dir: config.control_dir(),
            attempts: config.persist_attempts.max(1),
            backoff: config.persist_backoff,
            log_retention: config.log_retention,
            config: config.clone(),
        }
    }

    fn with_control_dir(mut self, control_dir: PathBuf) -> Self {
        self.control_dir = control_dir;
        self
    }

    /// Override the retry policy
    pub fn with_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.backoff = backoff;
        self
    }

    /// Control directory this store writes to
    pub fn control_dir(&self) -> &Path {
        &self.control_dir
    }

    /// Load the saved state, if any
    ///
    /// Returns `Ok(None)` when nothing has been saved yet.
    ///
    /// # Errors
    ///
    /// Returns [`ShareError::CorruptState`] (or a bincode error) if the saved
    /// index cannot be decoded, has an unknown format version, or does not
    /// reproduce its recorded key. Callers are expected to fall back to a
    /// full walk.
    pub fn load(&self) -> Result<Option<ResumeState>> {
        let index_path = self.control_dir.join(INDEX_FILE);
        let bytes = match fs::read(&index_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No resume state at {:?}", index_path);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let (persisted, _): (PersistedState, usize) =
            bincode::serde::decode_from_slice(
                &bytes,
                bincode::config::standard().with_limit::<DECODE_LIMIT>(),
            )
                .map_err(|e| ShareError::corrupt(format!("cannot decode {}: {}", INDEX_FILE, e)))?;

        if persisted.format_version != FORMAT_VERSION {
            return Err(ShareError::corrupt(format!(
                "unsupported format version {} (expected {})",
                persisted.format_version, FORMAT_VERSION
            )));
        }

        let index = ArchiveIndex::restore(
            persisted.entries,
            persisted.version,
            persisted.history,
            persisted.log,
            self.log_retention,
        )?;
        if index.identity_key() != persisted.identity_key {
            return Err(ShareError::corrupt(format!(
                "index rebuilds to {} but records {}",
                index.identity_key(),
                persisted.identity_key
            )));
        }

        let key = index.identity_key();
        self.repair_key_file(&key)?;

        info!("Loaded resume state: version {}, key {}", index.version(), key.short());
        Ok(Some(ResumeState {
            identity_key: key,
            index,
            last_walked_version: persisted.last_walked_version,
            high_water_mark_ns: persisted.high_water_mark_ns,
        }))
    }

    fn repair_key_file(&self, key: &IdentityKey) -> Result<()> {
        let key_path = self.control_dir.join(KEY_FILE);
        let stored = match fs::read_to_string(&key_path) {
            Ok(content) => content.trim().parse::<IdentityKey>().ok(),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        if stored.as_ref() != Some(key) {
            warn!("Key file at {:?} disagrees with the index, rewriting", key_path);
            atomic_write(&key_path, format!("{}\n", key).as_bytes())?;
        }
        Ok(())
    }

    /// Read only the key file
    ///
    /// Returns `Ok(None)` if there is no key file yet.
    pub fn read_key(&self) -> Result<Option<IdentityKey>> {
        match fs::read_to_string(self.control_dir.join(KEY_FILE)) {
            Ok(content) => Ok(Some(content.trim().parse()?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist `state`, retrying with backoff
    ///
    /// Blocks the calling thread during backoff; async callers run this
    /// through `spawn_blocking`.
    ///
    /// # Errors
    ///
    /// Returns [`ShareError::PersistFailure`] once every attempt has failed.
    pub fn save(&self, state: &ResumeState) -> Result<()> {
        let mut delay = self.backoff;
        let mut last_error = String::new();

        for attempt in 1..=self.attempts {
            match self.try_save(state) {
                Ok(()) => {
                    debug!(
                        "Saved resume state version {} (attempt {})",
                        state.index.version(),
                        attempt
                    );
                    return Ok(());
                }
                Err(e) => {
                    warn!("Save attempt {}/{} failed: {}", attempt, self.attempts, e);
                    last_error = e.to_string();
                    if attempt < self.attempts {
                        std::thread::sleep(delay);
                        delay = delay.saturating_mul(2);
                    }
                }
            }
        }

        Err(ShareError::PersistFailure { attempts: self.attempts, reason: last_error })
    }

    fn try_save(&self, state: &ResumeState) -> Result<()> {
        ensure_dir(&self.control_dir)?;

        let persisted = PersistedState {
            format_version: FORMAT_VERSION,
            identity_key: state.identity_key,
            version: state.index.version(),
            last_walked_version: state.last_walked_version,
            high_water_mark_ns: state.high_water_mark_ns,
            entries: state.index.entries().cloned().collect(),
            history: state.index.history().to_vec(),
            log: state.index.log().cloned().collect(),
        };
        let bytes = bincode::serde::encode_to_vec(&persisted, bincode::config::standard())?;
        atomic_write(&self.control_dir.join(INDEX_FILE), &bytes)?;
        atomic_write(
            &self.control_dir.join(KEY_FILE),
            format!("{}\n", state.identity_key).as_bytes(),
        )?;
        self.write_metadata(&state.identity_key)?;
        trace!("Wrote {} bytes of index state", bytes.len());
        Ok(())
    }

    fn write_metadata(&self, key: &IdentityKey) -> Result<()> {
        let path = self.control_dir.join(METADATA_FILE);
        let now = Utc::now();
        let created_at = self
            .read_metadata()
            .ok()
            .flatten()
            .map(|m| m.created_at)
            .unwrap_or(now);
        let metadata = ShareMetadata {
            format_version: FORMAT_VERSION,
            crate_version: env!("CARGO_PKG_VERSION").to_string(),
            created_at,
            last_saved: now,
            identity_key: key.to_hex(),
            config: self.config.clone(),
        };
        atomic_write(&path, serde_json::to_string_pretty(&metadata)?.as_bytes())
    }

    /// Read `metadata.json`, if present
    pub fn read_metadata(&self) -> Result<Option<ShareMetadata>> {
        match fs::read_to_string(self.control_dir.join(METADATA_FILE)) {
            Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether `state` still describes the tree under `walker`'s root
    ///
    /// Performs a stat-only walk: no file is opened. The state is fresh when
    /// the walk yields exactly the stored paths with the same kinds, sizes
    /// and modification times, and nothing newer than the high-water mark.
    /// Any unreadable entry makes the state stale, so the full walk that
    /// follows reports it again.
    pub fn is_fresh(&self, state: &ResumeState, walker: &Walker) -> Result<bool> {
        let mut stored = state.index.entries();
        for stat in walker.stats()? {
            let stat = match stat {
                Ok(stat) => stat,
                Err(degraded) => {
                    trace!("Stale: {} is unreadable", degraded.path);
                    return Ok(false);
                }
            };
            let Some(entry) = stored.next() else {
                trace!("Stale: {} is new", stat.path);
                return Ok(false);
            };
            let matches = entry.path == stat.path
                && entry.is_dir() == stat.is_dir
                && (stat.is_dir || entry.size == stat.size)
                && entry.modified_ns == stat.modified_ns
                && stat.modified_ns <= state.high_water_mark_ns;
            if !matches {
                trace!("Stale: {} differs from stored {}", stat.path, entry.path);
                return Ok(false);
            }
        }
        if let Some(extra) = stored.next() {
            trace!("Stale: {} no longer exists", extra.path);
            return Ok(false);
        }
        Ok(true)
    }
}
