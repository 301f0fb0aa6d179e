//! Deterministic directory walking
//!
//! The [`Walker`] turns a shared root into an ordered sequence of
//! [`Entry`] values: depth first, siblings sorted by file name, the control
//! directory and ignored paths pruned. Two walks of an unchanged tree always
//! produce element-wise equal sequences, which is what makes the identity key
//! reproducible.
//!
//! Three views of the same traversal are offered:
//!
//! - [`Walker::walk`] lazily yields [`WalkItem`]s, hashing each file as it is
//!   reached
//! - [`Walker::stats`] yields only `stat` information and never opens a file;
//!   the resume store uses it to decide whether saved state is still fresh
//! - [`Walker::scan`] collects the whole tree and hashes files on a bounded
//!   rayon pool, reusing digests from a previous index when size and
//!   modification time are unchanged
//!
//! Unreadable entries never abort a walk. They come out as [`Degraded`]
//! items that the caller turns into warnings.
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use datshare::walker::{Walker, WalkItem};
//!
//! let walker = Walker::new("./photos".into(), ".dat")
//!     .with_ignore_patterns(&["*.tmp".to_string()])?
//!     .with_hash_workers(4);
//!
//! for item in walker.walk()? {
//!     match item {
//!         WalkItem::Entry(entry) => println!("{} {}", entry.kind.label(), entry.path),
//!         WalkItem::Degraded(d) => eprintln!("skipped {}: {}", d.path, d.reason),
//!     }
//! }
//! ```

use crate::error::{Result, ShareError};
use crate::hasher;
use crate::index::ArchiveIndex;
use crate::types::{Degraded, Entry, RelPath};
use crate::utils::{make_relative, modified_ns};
use globset::{Glob, GlobSet, GlobSetBuilder};
use rayon::prelude::*;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, trace, warn};
use walkdir::WalkDir;

/// An item produced by [`Walker::walk`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalkItem {
    /// A readable entry
    Entry(Entry),
    /// An entry that could not be read
    Degraded(Degraded),
}

/// Metadata-only view of an entry, produced without opening files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatItem {
    /// Location relative to the root
    pub path: RelPath,
    /// Whether the entry is a directory
    pub is_dir: bool,
    /// Size in bytes (zero for directories)
    pub size: u64,
    /// Modification time in nanoseconds
    pub modified_ns: i64,
}

/// Result of a pooled scan
#[derive(Debug, Clone, Default)]
pub struct ScanOutcome {
    /// Readable entries in walk order
    pub entries: Vec<Entry>,
    /// Entries that could not be read
    pub degraded: Vec<Degraded>,
    /// Files whose digest was taken from the previous index
    pub reused: usize,
    /// Files whose content was read and hashed
    pub hashed: usize,
}

/// What became of a single stat item after hashing
#[derive(Debug)]
pub enum Materialized {
    /// Entry ready for the index; `true` when the digest was reused
    Entry(Entry, bool),
    /// Could not be read
    Degraded(Degraded),
    /// Disappeared between stat and read
    Vanished,
}

enum RawItem {
    Stat(StatItem),
    Unreadable(Degraded),
}

/// Deterministic walker over a shared root
///
/// # Example
///
/// ```rust,ignore
/// use datshare::walker::Walker;
///
/// let walker = Walker::new("/srv/share".into(), ".dat");
/// let outcome = walker.scan(None)?;
/// println!("{} entries, {} hashed", outcome.entries.len(), outcome.hashed);
/// ```
#[derive(Debug, Clone)]
pub struct Walker {
    root: PathBuf,
    control_dir_name: String,
    ignore: Option<GlobSet>,
    follow_symlinks: bool,
    hash_workers: usize,
}

impl Walker {
    /// Create a walker for `root`, pruning `control_dir_name` at the top level
    pub fn new(root: PathBuf, control_dir_name: &str) -> Self {
        Self {
            root,
            control_dir_name: control_dir_name.to_string(),
            ignore: None,
            follow_symlinks: false,
            hash_workers: num_cpus::get(),
        }
    }

    /// Exclude entries matching any of the glob `patterns`
    ///
    /// A pattern excludes a path when it matches either the full relative
    /// path or its final component; excluded directories are pruned with
    /// their whole subtree.
    ///
    /// # Errors
    ///
    /// Returns [`ShareError::InvalidPattern`] if a pattern does not compile.
    pub fn with_ignore_patterns(mut self, patterns: &[String]) -> Result<Self> {
        if patterns.is_empty() {
            self.ignore = None;
            return Ok(self);
        }
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let trimmed = pattern.trim_end_matches('/');
            builder.add(Glob::new(trimmed)?);
        }
        self.ignore = Some(builder.build()?);
        Ok(self)
    }

    /// Whether to follow symbolic links (otherwise they are skipped)
    pub fn with_follow_symlinks(mut self, follow: bool) -> Self {
        self.follow_symlinks = follow;
        self
    }

    /// Size of the hashing pool used by [`scan`](Self::scan)
    pub fn with_hash_workers(mut self, workers: usize) -> Self {
        self.hash_workers = workers.max(1);
        self
    }

    /// Root directory being walked
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether `path` is pruned from every walk
    ///
    /// True for the control directory and anything below it, and for any
    /// path with an ignored ancestor.
    pub fn is_excluded(&self, path: &RelPath) -> bool {
        if path.components().next() == Some(self.control_dir_name.as_str()) {
            return true;
        }
        if self.ignore.is_none() || path.is_root() {
            return false;
        }
        std::iter::once(path.clone())
            .chain(path.ancestors())
            .filter(|p| !p.is_root())
            .any(|p| self.is_ignored(&p))
    }

    fn is_ignored(&self, path: &RelPath) -> bool {
        match &self.ignore {
            Some(set) => set.is_match(path.as_str()) || set.is_match(path.name()),
            None => false,
        }
    }

    fn prune(&self, abs: &Path) -> bool {
        match make_relative(abs, &self.root) {
            Some(rel) => {
                (rel.depth() == 1 && rel.as_str() == self.control_dir_name) || self.is_ignored(&rel)
            }
            None => false,
        }
    }

    /// Lazily walk the whole root, hashing files as they are reached
    ///
    /// The root itself is not yielded.
    ///
    /// # Errors
    ///
    /// Returns [`ShareError::PathNotFound`] if the root does not exist.
    pub fn walk(&self) -> Result<impl Iterator<Item = WalkItem> + '_> {
        self.walk_from(&RelPath::root())
    }

    /// Lazily walk the subtree at `start`, including `start` itself unless
    /// it is the root
    pub fn walk_from(&self, start: &RelPath) -> Result<impl Iterator<Item = WalkItem> + '_> {
        let raw = self.raw_items(start)?;
        Ok(raw.filter_map(move |item| match item {
            RawItem::Unreadable(d) => Some(WalkItem::Degraded(d)),
            RawItem::Stat(stat) => match self.materialize(stat, None) {
                Materialized::Entry(entry, _) => Some(WalkItem::Entry(entry)),
                Materialized::Degraded(d) => Some(WalkItem::Degraded(d)),
                Materialized::Vanished => None,
            },
        }))
    }

    /// Lazily walk the root without opening any file
    ///
    /// Entries that cannot be listed or named come out as `Err(Degraded)`.
    pub fn stats(&self) -> Result<impl Iterator<Item = std::result::Result<StatItem, Degraded>> + '_> {
        let raw = self.raw_items(&RelPath::root())?;
        Ok(raw.map(|item| match item {
            RawItem::Stat(stat) => Ok(stat),
            RawItem::Unreadable(d) => Err(d),
        }))
    }

    /// Stat a single path
    ///
    /// Returns `Ok(None)` when the path no longer exists or is not a regular
    /// file or directory.
    pub fn stat(&self, path: &RelPath) -> Result<Option<StatItem>> {
        let abs = path.to_path(&self.root);
        let metadata = if self.follow_symlinks { fs::metadata(&abs) } else { fs::symlink_metadata(&abs) };
        let metadata = match metadata {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ShareError::from_read(abs, e)),
        };
        let file_type = metadata.file_type();
        if !(file_type.is_dir() || file_type.is_file()) {
            return Ok(None);
        }
        Ok(Some(StatItem {
            path: path.clone(),
            is_dir: file_type.is_dir(),
            size: if file_type.is_dir() { 0 } else { metadata.len() },
            modified_ns: modified_ns(&metadata),
        }))
    }

    /// Walk the whole root and hash every file on a bounded pool
    ///
    /// When `prior` is given, files whose size and modification time match
    /// the previous entry keep their old digest without being read.
    pub fn scan(&self, prior: Option<&ArchiveIndex>) -> Result<ScanOutcome> {
        self.scan_from(&RelPath::root(), prior)
    }

    /// Like [`scan`](Self::scan) but limited to the subtree at `start`
    pub fn scan_from(&self, start: &RelPath, prior: Option<&ArchiveIndex>) -> Result<ScanOutcome> {
        let started = Instant::now();
        let mut stats = Vec::new();
        let mut outcome = ScanOutcome::default();

        for item in self.raw_items(start)? {
            match item {
                RawItem::Stat(stat) => stats.push(stat),
                RawItem::Unreadable(d) => outcome.degraded.push(d),
            }
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.hash_workers)
            .build()
            .map_err(|e| ShareError::internal(format!("failed to build hashing pool: {e}")))?;

        let results: Vec<Materialized> = pool.install(|| {
            stats
                .into_par_iter()
                .map(|stat| self.materialize(stat, prior))
                .collect()
        });

        for result in results {
            match result {
                Materialized::Entry(entry, reused) => {
                    if !entry.is_dir() {
                        if reused {
                            outcome.reused += 1;
                        } else {
                            outcome.hashed += 1;
                        }
                    }
                    outcome.entries.push(entry);
                }
                Materialized::Degraded(d) => outcome.degraded.push(d),
                Materialized::Vanished => {}
            }
        }
        outcome.degraded.sort_by(|a, b| a.path.cmp(&b.path));

        debug!(
            "Scanned {} entries under {:?} ({} hashed, {} reused, {} degraded) in {:?}",
            outcome.entries.len(),
            start.to_path(&self.root),
            outcome.hashed,
            outcome.reused,
            outcome.degraded.len(),
            started.elapsed()
        );
        Ok(outcome)
    }

    /// Turn a stat item into an entry, hashing the file if needed
    pub fn materialize(&self, stat: StatItem, prior: Option<&ArchiveIndex>) -> Materialized {
        if stat.is_dir {
            return Materialized::Entry(Entry::directory(stat.path, stat.modified_ns), false);
        }

        if let Some(previous) = prior.and_then(|index| index.entry(&stat.path)) {
            if !previous.is_dir()
                && previous.size == stat.size
                && previous.modified_ns == stat.modified_ns
            {
                trace!("Reusing digest for {}", stat.path);
                let mut entry = previous.clone();
                entry.modified_ns = stat.modified_ns;
                return Materialized::Entry(entry, true);
            }
        }

        let abs = stat.path.to_path(&self.root);
        match hasher::hash_file_with_retry(&abs) {
            Ok((digest, len)) => {
                Materialized::Entry(Entry::file(stat.path, len, digest, stat.modified_ns), false)
            }
            Err(ShareError::PathNotFound(_)) => {
                debug!("{} vanished before it could be hashed", stat.path);
                Materialized::Vanished
            }
            Err(e) => {
                warn!("Skipping unreadable file {}: {}", stat.path, e);
                Materialized::Degraded(Degraded { path: stat.path, reason: e.to_string() })
            }
        }
    }

    fn raw_items<'a>(&'a self, start: &RelPath) -> Result<impl Iterator<Item = RawItem> + 'a> {
        let start_abs = start.to_path(&self.root);
        match fs::metadata(&start_abs) {
            Ok(m) if m.is_dir() => {}
            Ok(_) => {
                return Err(ShareError::InvalidConfiguration(format!(
                    "{:?} is not a directory",
                    start_abs
                )))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(ShareError::PathNotFound(start_abs))
            }
            Err(e) => return Err(e.into()),
        }

        let include_start = !start.is_root();
        let iter = WalkDir::new(&start_abs)
            .follow_links(self.follow_symlinks)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |e| e.depth() == 0 || !self.prune(e.path()))
            .filter_map(move |res| self.classify(res, include_start));
        Ok(iter)
    }

    fn classify(&self, res: walkdir::Result<walkdir::DirEntry>, include_start: bool) -> Option<RawItem> {
        let entry = match res {
            Ok(entry) => entry,
            Err(err) => {
                if err.io_error().map(|e| e.kind()) == Some(ErrorKind::NotFound) {
                    return None;
                }
                let path = err
                    .path()
                    .and_then(|p| make_relative(p, &self.root))
                    .unwrap_or_default();
                let reason = match err.io_error() {
                    Some(io) if io.kind() == ErrorKind::PermissionDenied => {
                        "permission denied".to_string()
                    }
                    _ => err.to_string(),
                };
                warn!("Walk error at {:?}: {}", path, reason);
                return Some(RawItem::Unreadable(Degraded { path, reason }));
            }
        };

        if entry.depth() == 0 && !include_start {
            return None;
        }

        let Some(path) = make_relative(entry.path(), &self.root) else {
            let lossy = entry
                .path()
                .strip_prefix(&self.root)
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default();
            warn!("Skipping entry with non UTF-8 name: {}", lossy);
            return Some(RawItem::Unreadable(Degraded {
                path: RelPath::new(&lossy),
                reason: "name is not valid UTF-8".to_string(),
            }));
        };

        let file_type = entry.file_type();
        if !(file_type.is_dir() || file_type.is_file()) {
            debug!("Skipping special entry {}", path);
            return None;
        }

        match entry.metadata() {
            Ok(metadata) => Some(RawItem::Stat(StatItem {
                path,
                is_dir: file_type.is_dir(),
                size: if file_type.is_dir() { 0 } else { metadata.len() },
                modified_ns: modified_ns(&metadata),
            })),
            Err(e) => Some(RawItem::Unreadable(Degraded { path, reason: e.to_string() })),
        }
    }
}
