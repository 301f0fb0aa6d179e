//! Core data types used throughout the datshare library
//!
//! This module contains the value types that flow between the walker, the
//! index, the resume store and the report listeners.
//!
//! ## Overview
//!
//! - **Hashes**: [`Digest`] and [`IdentityKey`], fixed 32-byte values rendered
//!   as lowercase hex
//! - **Paths**: [`RelPath`], a POSIX-normalized path relative to the shared root
//!   whose ordering matches a depth-first walk with name-sorted siblings
//! - **Entries**: [`Entry`] with its tagged [`EntryKind`], and [`Degraded`] for
//!   entries that could not be read
//! - **Reporting**: [`Report`] and [`Warning`]
//! - **Configuration**: [`ShareConfig`] and the persisted [`ShareMetadata`]
//!
//! ## Examples
//!
//! ```rust
//! use datshare::types::RelPath;
//!
//! let path = RelPath::new("docs/guide/intro.md");
//! assert_eq!(path.name(), "intro.md");
//! assert_eq!(path.parent().unwrap().as_str(), "docs/guide");
//! ```

use crate::error::{Result, ShareError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Name of the control directory created inside every shared root
pub const DEFAULT_CONTROL_DIR: &str = ".dat";

/// A 32-byte SHA-256 digest
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Digest(pub [u8; 32]);

impl Digest {
    /// Digest with every byte zero
    pub const ZERO: Digest = Digest([0u8; 32]);

    /// Raw bytes of the digest
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex rendering (64 characters)
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 64 character hex string
    pub fn from_hex(s: &str) -> Result<Self> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s.trim(), &mut bytes)
            .map_err(|e| ShareError::InvalidKey(format!("{s:?}: {e}")))?;
        Ok(Digest(bytes))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", &self.to_hex()[..12])
    }
}

/// The stable identifier of a shared directory
///
/// This is the root node digest of the [`ArchiveIndex`](crate::index::ArchiveIndex).
/// It depends only on the indexed tree: two directories with identical
/// content produce the same key regardless of timestamps, host or process.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityKey(pub Digest);

impl IdentityKey {
    /// 64 lowercase hex characters
    pub fn to_hex(&self) -> String {
        self.0.to_hex()
    }

    /// Short prefix for log lines
    pub fn short(&self) -> String {
        self.to_hex()[..8].to_string()
    }

    /// Underlying digest
    pub fn digest(&self) -> Digest {
        self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityKey({})", self.to_hex())
    }
}

impl FromStr for IdentityKey {
    type Err = ShareError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.len() != 64 {
            return Err(ShareError::InvalidKey(format!(
                "expected 64 hex characters, got {}",
                s.len()
            )));
        }
        Digest::from_hex(s).map(IdentityKey)
    }
}

/// A path relative to the shared root
///
/// Always `/`-separated without leading or trailing separators and without
/// `.` or `..` components. The empty path is the root itself.
///
/// Ordering compares component by component, so sorting a set of paths
/// yields exactly the depth-first order of a walk with siblings sorted by
/// name (`a`, `a/b`, `a.txt`).
#[derive(Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelPath(String);

impl RelPath {
    /// The root path
    pub fn root() -> Self {
        RelPath(String::new())
    }

    /// Normalize a `/`-separated string
    pub fn new(s: &str) -> Self {
        let joined = s
            .split('/')
            .filter(|c| !c.is_empty() && *c != ".")
            .collect::<Vec<_>>()
            .join("/");
        RelPath(joined)
    }

    /// Convert a path relative to the root
    ///
    /// Returns `None` for paths that escape the root or are not valid UTF-8.
    pub fn from_relative(path: &Path) -> Option<Self> {
        let mut parts = Vec::new();
        for component in path.components() {
            match component {
                Component::Normal(name) => parts.push(name.to_str()?),
                Component::CurDir => {}
                _ => return None,
            }
        }
        Some(RelPath(parts.join("/")))
    }

    /// Whether this is the root
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// String form
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path components from the root down
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|c| !c.is_empty())
    }

    /// Number of components (root has depth 0)
    pub fn depth(&self) -> usize {
        self.components().count()
    }

    /// Final component; empty for the root
    pub fn name(&self) -> &str {
        match self.0.rfind('/') {
            Some(idx) => &self.0[idx + 1..],
            None => &self.0,
        }
    }

    /// Parent directory, `None` for the root
    pub fn parent(&self) -> Option<RelPath> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(idx) => Some(RelPath(self.0[..idx].to_string())),
            None => Some(RelPath::root()),
        }
    }

    /// Append a single child name
    pub fn join(&self, name: &str) -> RelPath {
        if self.is_root() {
            RelPath::new(name)
        } else {
            RelPath::new(&format!("{}/{}", self.0, name))
        }
    }

    /// Whether `self` lies strictly below `ancestor`
    pub fn is_descendant_of(&self, ancestor: &RelPath) -> bool {
        if ancestor.is_root() {
            return !self.is_root();
        }
        self.0.len() > ancestor.0.len()
            && self.0.starts_with(&ancestor.0)
            && self.0.as_bytes()[ancestor.0.len()] == b'/'
    }

    /// All proper ancestors, nearest first, ending with the root
    pub fn ancestors(&self) -> Vec<RelPath> {
        let mut out = Vec::new();
        let mut current = self.parent();
        while let Some(p) = current {
            current = p.parent();
            out.push(p);
        }
        out
    }

    /// Absolute location of this path under `root`
    pub fn to_path(&self, root: &Path) -> PathBuf {
        let mut path = root.to_path_buf();
        for component in self.components() {
            path.push(component);
        }
        path
    }
}

impl Ord for RelPath {
    fn cmp(&self, other: &Self) -> Ordering {
        self.components().cmp(other.components())
    }
}

impl PartialOrd for RelPath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for RelPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for RelPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

/// What an entry is
///
/// Empty files carry no digest of their own; their node digest is derived
/// from a fixed sentinel so they never collide with a real content hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// Regular file with at least one byte
    File {
        /// SHA-256 of the file content
        digest: Digest,
    },
    /// Regular file of length zero
    EmptyFile,
    /// Directory
    Directory,
}

impl EntryKind {
    /// Short label used in logs
    pub fn label(&self) -> &'static str {
        match self {
            EntryKind::File { .. } => "file",
            EntryKind::EmptyFile => "empty",
            EntryKind::Directory => "directory",
        }
    }
}

/// A single filesystem object observed under the root
///
/// `modified_ns` is kept only to decide whether a later walk may reuse the
/// digest; it never feeds into any node digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Location relative to the root
    pub path: RelPath,
    /// Kind and content digest
    pub kind: EntryKind,
    /// Size in bytes (zero for directories)
    pub size: u64,
    /// Modification time in nanoseconds since the Unix epoch
    pub modified_ns: i64,
}

impl Entry {
    /// Build a directory entry
    pub fn directory(path: RelPath, modified_ns: i64) -> Self {
        Entry { path, kind: EntryKind::Directory, size: 0, modified_ns }
    }

    /// Build a file entry, choosing `EmptyFile` for zero-length content
    pub fn file(path: RelPath, size: u64, digest: Digest, modified_ns: i64) -> Self {
        let kind = if size == 0 { EntryKind::EmptyFile } else { EntryKind::File { digest } };
        Entry { path, kind, size, modified_ns }
    }

    /// Whether this is a directory
    pub fn is_dir(&self) -> bool {
        matches!(self.kind, EntryKind::Directory)
    }

    /// Content digest; the empty-file sentinel for empty files
    pub fn digest(&self) -> Option<Digest> {
        match self.kind {
            EntryKind::File { digest } => Some(digest),
            EntryKind::EmptyFile => Some(crate::hasher::EMPTY_FILE_SENTINEL),
            EntryKind::Directory => None,
        }
    }

    /// Same content and shape, ignoring the modification time
    pub fn same_content(&self, other: &Entry) -> bool {
        self.path == other.path && self.kind == other.kind && self.size == other.size
    }
}

/// An entry that could not be read
///
/// Degraded entries are reported with size zero and no digest and are left
/// out of the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Degraded {
    /// Location relative to the root
    pub path: RelPath,
    /// Why the entry was skipped
    pub reason: String,
}

/// A recoverable problem recorded during indexing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warning {
    /// Affected path, if any
    pub path: Option<RelPath>,
    /// Human-readable description
    pub message: String,
}

impl Warning {
    /// Warning tied to a path
    pub fn at(path: RelPath, message: impl Into<String>) -> Self {
        Warning { path: Some(path), message: message.into() }
    }

    /// Warning not tied to any path
    pub fn general(message: impl Into<String>) -> Self {
        Warning { path: None, message: message.into() }
    }
}

impl From<&Degraded> for Warning {
    fn from(d: &Degraded) -> Self {
        Warning::at(d.path.clone(), d.reason.clone())
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(path) => write!(f, "{}: {}", path, self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Aggregate facts about an indexed tree
///
/// `item_count` counts readable non-directory entries in both live and
/// snapshot mode; directories are counted separately so a formatter may
/// present them either way.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    /// Number of files, including empty files
    pub item_count: u32,
    /// Number of directories below the root
    pub directory_count: u32,
    /// Sum of file sizes in bytes
    pub total_bytes: u64,
    /// Recoverable problems seen while producing this report
    pub warnings: Vec<Warning>,
}

impl Report {
    /// Size rendered the way the share prompt prints it
    pub fn display_size(&self) -> String {
        crate::utils::format_size(self.total_bytes)
    }
}

/// Configuration for a share
///
/// Built by [`ShareBuilder`](crate::ShareBuilder) and recorded in the control
/// directory's `metadata.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareConfig {
    /// Root directory being shared
    pub root_path: PathBuf,
    /// Name of the control directory inside the root
    pub control_dir_name: String,
    /// Number of threads hashing file content
    pub hash_workers: usize,
    /// Quiet period after the last change before a batch is committed
    pub debounce: Duration,
    /// Upper bound on how long a continuously changing batch may wait
    pub max_batch_delay: Duration,
    /// Attempts per save before failing with `PersistFailure`
    pub persist_attempts: u32,
    /// Initial backoff between save attempts (doubled each retry)
    pub persist_backoff: Duration,
    /// Glob patterns excluded from the walk
    pub ignore_patterns: Vec<String>,
    /// Whether to follow symbolic links
    pub follow_symlinks: bool,
    /// Subscribe to OS change notifications in live mode
    pub watch: bool,
    /// Consecutive failed commits tolerated before live mode stops
    pub max_commit_failures: u32,
    /// Number of change-log and version-history records kept in the index
    pub log_retention: usize,
}

impl Default for ShareConfig {
    fn default() -> Self {
        ShareConfig {
            root_path: PathBuf::new(),
            control_dir_name: DEFAULT_CONTROL_DIR.to_string(),
            hash_workers: num_cpus::get(),
            debounce: Duration::from_millis(250),
            max_batch_delay: Duration::from_secs(2),
            persist_attempts: 3,
            persist_backoff: Duration::from_millis(50),
            ignore_patterns: Vec::new(),
            follow_symlinks: false,
            watch: true,
            max_commit_failures: 3,
            log_retention: 4096,
        }
    }
}

impl ShareConfig {
    /// Absolute path of the control directory
    pub fn control_dir(&self) -> PathBuf {
        self.root_path.join(&self.control_dir_name)
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.control_dir_name.is_empty()
            || self.control_dir_name.contains('/')
            || self.control_dir_name == "."
            || self.control_dir_name == ".."
        {
            return Err(ShareError::InvalidConfiguration(format!(
                "control directory name {:?} must be a single path component",
                self.control_dir_name
            )));
        }
        if self.hash_workers == 0 {
            return Err(ShareError::InvalidConfiguration(
                "hash_workers must be at least 1".to_string(),
            ));
        }
        if self.persist_attempts == 0 {
            return Err(ShareError::InvalidConfiguration(
                "persist_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Metadata stored next to the resume state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareMetadata {
    /// Version of the on-disk format
    pub format_version: u32,
    /// Crate version that last wrote the state
    pub crate_version: String,
    /// When the control directory was first populated
    pub created_at: DateTime<Utc>,
    /// When the state was last saved
    pub last_saved: DateTime<Utc>,
    /// Key at the time of the last save
    pub identity_key: String,
    /// Configuration in effect
    pub config: ShareConfig,
}
