//! Per-directory Merkle index
//!
//! [`ArchiveIndex`] folds an ordered sequence of [`Entry`] values into a tree
//! that mirrors the shared directory. Every node carries a digest:
//!
//! ```text
//!               root  ← identity key
//!             /      \
//!         docs/       photos/
//!        /     \          \
//!   a.md     b.md       img.jpg
//! ```
//!
//! Leaves hash their content (see [`hasher`](crate::hasher) for the exact
//! byte layout); a directory hashes the names and digests of its children in
//! name order. The root digest is the [`IdentityKey`].
//!
//! ## Versions
//!
//! The index is append oriented. A full [`build`](ArchiveIndex::build)
//! produces version 1. Each call to [`apply`](ArchiveIndex::apply) that
//! changes something produces the next version, appends a
//! [`VersionRecord`] to the history and the individual operations to a
//! bounded change log. Earlier records are never rewritten, so a key that
//! was announced once stays discoverable in the history.
//!
//! ## Incremental updates
//!
//! `apply` touches only the changed leaves and the directories on their way
//! to the root, deepest first. Sibling subtrees keep their digests untouched,
//! which makes an update after a single-file edit proportional to the depth
//! of that file rather than the size of the tree.

use crate::hasher;
use crate::error::{Result, ShareError};
use crate::report::ReportListener;
use crate::types::{Digest, Entry, EntryKind, IdentityKey, RelPath, Report};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::ops::Bound;
use tracing::{debug, trace};

/// Number of change-log records kept when no retention is configured
pub const DEFAULT_LOG_RETENTION: usize = 4096;

/// A node of the index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexNode {
    /// The entry this node represents
    pub entry: Entry,
    /// Node digest
    pub digest: Digest,
    /// Child names for directories, in name order
    pub children: BTreeSet<String>,
}

/// A change to fold into the index
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// Insert or replace the entry at its path
    Upsert(Entry),
    /// Remove the path and, for directories, everything below it
    Remove(RelPath),
}

impl Change {
    /// Path this change applies to
    pub fn path(&self) -> &RelPath {
        match self {
            Change::Upsert(entry) => &entry.path,
            Change::Remove(path) => path,
        }
    }
}

/// Operation recorded in the change log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogOp {
    /// Entry added or replaced
    Put(Entry),
    /// Path removed
    Tombstone(RelPath),
}

/// A change-log record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Version that introduced the operation
    pub version: u64,
    /// The operation
    pub op: LogOp,
}

/// Summary of one committed version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    /// Version number, starting at 1
    pub version: u64,
    /// Identity key after this version
    pub identity_key: IdentityKey,
    /// Files in the tree after this version
    pub item_count: u32,
    /// Bytes in the tree after this version
    pub total_bytes: u64,
    /// When the version was produced
    pub committed_at: DateTime<Utc>,
}

/// What an [`apply`](ArchiveIndex::apply) call did
#[derive(Debug, Clone, Default)]
pub struct UpdateOutcome {
    /// Whether a new version was produced
    pub changed: bool,
    /// Current version after the call
    pub version: u64,
    /// Identity key after the call
    pub identity_key: Option<IdentityKey>,
    /// Whether the identity key differs from before the call
    pub key_changed: bool,
    /// Directories whose digest was recomputed, deepest first
    pub recomputed: Vec<RelPath>,
    /// Entries inserted or replaced, including synthesized parents
    pub indexed: Vec<Entry>,
    /// Paths removed
    pub removed: Vec<RelPath>,
    /// Entries whose modification time was refreshed without a content change
    pub touched: usize,
}

/// Merkle index over a shared directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveIndex {
    nodes: BTreeMap<RelPath, IndexNode>,
    version: u64,
    history: Vec<VersionRecord>,
    log: VecDeque<LogRecord>,
    log_retention: usize,
}

impl Default for ArchiveIndex {
    fn default() -> Self {
        Self::empty()
    }
}

impl ArchiveIndex {
    /// An index holding only the root directory, at version 0
    pub fn empty() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            RelPath::root(),
            IndexNode {
                entry: Entry::directory(RelPath::root(), 0),
                digest: hasher::directory_node(std::iter::empty()),
                children: BTreeSet::new(),
            },
        );
        Self {
            nodes,
            version: 0,
            history: Vec::new(),
            log: VecDeque::new(),
            log_retention: DEFAULT_LOG_RETENTION,
        }
    }

    /// Fold an ordered entry sequence into a fresh index at version 1
    ///
    /// `entry_indexed` fires once for every folded entry. Parents that are
    /// missing from the sequence are synthesized as directories.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// use datshare::index::ArchiveIndex;
    /// use datshare::report::NoopListener;
    ///
    /// let outcome = walker.scan(None)?;
    /// let index = ArchiveIndex::build(outcome.entries, &NoopListener);
    /// println!("Link {}", index.identity_key());
    /// ```
    pub fn build<I>(entries: I, listener: &dyn ReportListener) -> Self
    where
        I: IntoIterator<Item = Entry>,
    {
        let mut index = Self::empty();
        let mut added = Vec::new();
        for entry in entries {
            if entry.path.is_root() {
                continue;
            }
            index.ensure_ancestors(&entry.path, &mut added);
            listener.entry_indexed(&entry.path, &entry.kind);
            index.put_node(entry.clone());
            added.push(entry);
        }

        let dirs: BTreeSet<RelPath> = index
            .nodes
            .iter()
            .filter(|(_, node)| node.entry.is_dir())
            .map(|(path, _)| path.clone())
            .collect();
        index.recompute(dirs);

        index.commit(added.into_iter().map(LogOp::Put).collect());
        debug!(
            "Built index with {} nodes, key {}",
            index.nodes.len(),
            index.identity_key().short()
        );
        index
    }

    /// Rebuild an index from persisted parts without firing events
    ///
    /// # Errors
    ///
    /// Returns [`ShareError::CorruptState`] if the rebuilt root does not
    /// match the last recorded key.
    pub fn restore(
        entries: Vec<Entry>,
        version: u64,
        history: Vec<VersionRecord>,
        log: Vec<LogRecord>,
        log_retention: usize,
    ) -> Result<Self> {
        let mut index = Self::build(entries, &crate::report::NoopListener);
        index.version = version;
        index.history = history;
        index.log = log.into();
        index.log_retention = log_retention.max(1);
        index.trim_log();
        index.trim_history();

        if let Some(last) = index.history.last() {
            if last.identity_key != index.identity_key() || last.version != version {
                return Err(ShareError::corrupt(format!(
                    "rebuilt key {} does not match recorded key {} at version {}",
                    index.identity_key(),
                    last.identity_key,
                    last.version
                )));
            }
        }
        Ok(index)
    }

    /// Set how many change-log and version-history records are retained
    ///
    /// The newest version record is always kept.
    pub fn set_log_retention(&mut self, retention: usize) {
        self.log_retention = retention.max(1);
        self.trim_log();
        self.trim_history();
    }

    /// Continue the version history of `prior` in this freshly built index
    ///
    /// When the content is unchanged the index takes over `prior`'s version,
    /// history and change log as they are. Otherwise the build becomes the
    /// version after `prior`'s, so earlier keys stay in the history.
    pub fn continue_from(&mut self, prior: &ArchiveIndex) {
        if prior.version == 0 {
            return;
        }
        if prior.identity_key() == self.identity_key() {
            self.version = prior.version;
            self.history = prior.history.clone();
            self.log = prior.log.clone();
        } else {
            let version = prior.version + 1;
            let mut history = prior.history.clone();
            history.extend(self.history.last().cloned().map(|record| VersionRecord { version, ..record }));
            let mut log = prior.log.clone();
            log.extend(self.log.drain(..).map(|record| LogRecord { version, ..record }));
            self.version = version;
            self.history = history;
            self.log = log;
        }
        self.trim_log();
        self.trim_history();
        debug!("Continued history at version {}", self.version);
    }

    /// The root digest
    pub fn identity_key(&self) -> IdentityKey {
        IdentityKey(self.node_digest(&RelPath::root()).unwrap_or(Digest::ZERO))
    }

    /// Digest of the node at `path`
    pub fn node_digest(&self, path: &RelPath) -> Option<Digest> {
        self.nodes.get(path).map(|node| node.digest)
    }

    /// Node at `path`
    pub fn node(&self, path: &RelPath) -> Option<&IndexNode> {
        self.nodes.get(path)
    }

    /// Entry at `path`
    pub fn entry(&self, path: &RelPath) -> Option<&Entry> {
        self.nodes.get(path).map(|node| &node.entry)
    }

    /// All entries below the root in walk order
    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.nodes.values().skip(1).map(|node| &node.entry)
    }

    /// Number of entries below the root
    pub fn len(&self) -> usize {
        self.nodes.len() - 1
    }

    /// Whether the index holds nothing but the root
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current version
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Every committed version, oldest first
    pub fn history(&self) -> &[VersionRecord] {
        &self.history
    }

    /// Retained change-log records, oldest first
    pub fn log(&self) -> impl Iterator<Item = &LogRecord> {
        self.log.iter()
    }

    /// Counts and sizes of the indexed tree
    pub fn report(&self) -> Report {
        let mut report = Report::default();
        for entry in self.entries() {
            match entry.kind {
                EntryKind::Directory => report.directory_count += 1,
                EntryKind::File { .. } | EntryKind::EmptyFile => {
                    report.item_count += 1;
                    report.total_bytes += entry.size;
                }
            }
        }
        report
    }

    /// Fire `entry_indexed` for every entry, as a build would
    pub fn replay(&self, listener: &dyn ReportListener) {
        for entry in self.entries() {
            listener.entry_indexed(&entry.path, &entry.kind);
        }
    }

    /// Changes that turn this index into the given scan of the whole tree
    pub fn diff(&self, scanned: &[Entry]) -> Vec<Change> {
        self.diff_within(&RelPath::root(), scanned)
    }

    /// Changes that turn the subtree at `scope` into the given scan of it
    ///
    /// Entries whose content is unchanged but whose modification time moved
    /// are returned as upserts so that the stored hint is refreshed.
    pub fn diff_within(&self, scope: &RelPath, scanned: &[Entry]) -> Vec<Change> {
        let mut changes = Vec::new();
        let seen: BTreeSet<&RelPath> = scanned.iter().map(|e| &e.path).collect();

        for entry in scanned {
            match self.entry(&entry.path) {
                Some(existing) if existing == entry => {}
                _ => changes.push(Change::Upsert(entry.clone())),
            }
        }

        let in_scope = self
            .nodes
            .range::<RelPath, _>((Bound::Included(scope), Bound::Unbounded))
            .take_while(|(path, _)| *path == scope || path.is_descendant_of(scope))
            .filter(|(path, _)| !path.is_root());
        for (path, _) in in_scope {
            if !seen.contains(path) {
                changes.push(Change::Remove(path.clone()));
            }
        }
        changes
    }

    /// Fold a set of changes into a new version
    ///
    /// Changes that would not alter any digest are dropped; if nothing is
    /// left the version stays where it is. Otherwise only the ancestors of
    /// changed paths are recomputed.
    pub fn apply(&mut self, changes: Vec<Change>) -> UpdateOutcome {
        let previous_key = self.identity_key();
        let mut outcome = UpdateOutcome::default();
        let mut dirty: BTreeSet<RelPath> = BTreeSet::new();
        let mut ops = Vec::new();

        for change in changes {
            match change {
                Change::Upsert(entry) => {
                    if entry.path.is_root() {
                        continue;
                    }
                    if let Some(node) = self.nodes.get_mut(&entry.path) {
                        if node.entry.same_content(&entry) {
                            if node.entry.modified_ns != entry.modified_ns {
                                node.entry.modified_ns = entry.modified_ns;
                                outcome.touched += 1;
                            }
                            continue;
                        }
                    }
                    trace!("Upsert {} ({})", entry.path, entry.kind.label());
                    let mut added = Vec::new();
                    self.ensure_ancestors(&entry.path, &mut added);
                    for parent in &added {
                        dirty.insert(parent.path.clone());
                    }
                    if entry.is_dir() {
                        dirty.insert(entry.path.clone());
                    }
                    dirty.extend(entry.path.ancestors());
                    self.put_node(entry.clone());
                    added.push(entry);
                    for e in added {
                        ops.push(LogOp::Put(e.clone()));
                        outcome.indexed.push(e);
                    }
                }
                Change::Remove(path) => {
                    if path.is_root() || !self.nodes.contains_key(&path) {
                        continue;
                    }
                    trace!("Remove {}", path);
                    self.remove_path(&path);
                    dirty.extend(path.ancestors());
                    ops.push(LogOp::Tombstone(path.clone()));
                    outcome.removed.push(path);
                }
            }
        }

        if ops.is_empty() {
            outcome.version = self.version;
            outcome.identity_key = Some(previous_key);
            return outcome;
        }

        outcome.recomputed = self.recompute(dirty);
        self.commit(ops);

        let key = self.identity_key();
        outcome.changed = true;
        outcome.version = self.version;
        outcome.identity_key = Some(key);
        outcome.key_changed = key != previous_key;
        debug!(
            "Applied version {}: {} indexed, {} removed, {} directories recomputed, key {}",
            self.version,
            outcome.indexed.len(),
            outcome.removed.len(),
            outcome.recomputed.len(),
            key.short()
        );
        outcome
    }

    /// Recompute every digest from scratch and compare with the stored ones
    ///
    /// # Errors
    ///
    /// Returns [`ShareError::CorruptState`] naming the first mismatching node.
    pub fn verify(&self) -> Result<()> {
        let fresh = Self::build(self.entries().cloned(), &crate::report::NoopListener);
        if fresh.nodes.len() != self.nodes.len() {
            return Err(ShareError::corrupt(format!(
                "index holds {} nodes but its entries rebuild to {}",
                self.nodes.len(),
                fresh.nodes.len()
            )));
        }
        for (path, node) in &self.nodes {
            if fresh.node_digest(path) != Some(node.digest) {
                return Err(ShareError::corrupt(format!("digest mismatch at {:?}", path)));
            }
        }
        Ok(())
    }

    fn ensure_ancestors(&mut self, path: &RelPath, added: &mut Vec<Entry>) {
        let mut ancestors = path.ancestors();
        ancestors.reverse();
        for ancestor in ancestors {
            if ancestor.is_root() {
                continue;
            }
            let is_dir = self.nodes.get(&ancestor).map(|n| n.entry.is_dir());
            if is_dir != Some(true) {
                let entry = Entry::directory(ancestor, 0);
                self.put_node(entry.clone());
                added.push(entry);
            }
        }
    }

    fn put_node(&mut self, entry: Entry) {
        let path = entry.path.clone();
        let (digest, children) = match self.nodes.remove(&path) {
            Some(old) if old.entry.is_dir() && entry.is_dir() => (old.digest, old.children),
            Some(old) => {
                if old.entry.is_dir() {
                    self.remove_descendants(&path);
                }
                (leaf_digest(&entry).unwrap_or(Digest::ZERO), BTreeSet::new())
            }
            None => (leaf_digest(&entry).unwrap_or(Digest::ZERO), BTreeSet::new()),
        };
        if let Some(parent) = path.parent() {
            if let Some(parent_node) = self.nodes.get_mut(&parent) {
                parent_node.children.insert(path.name().to_string());
            }
        }
        self.nodes.insert(path, IndexNode { entry, digest, children });
    }

    fn remove_path(&mut self, path: &RelPath) {
        self.remove_descendants(path);
        self.nodes.remove(path);
        if let Some(parent) = path.parent() {
            if let Some(parent_node) = self.nodes.get_mut(&parent) {
                parent_node.children.remove(path.name());
            }
        }
    }

    fn remove_descendants(&mut self, path: &RelPath) {
        let doomed: Vec<RelPath> = self
            .nodes
            .range::<RelPath, _>((Bound::Excluded(path), Bound::Unbounded))
            .take_while(|(p, _)| p.is_descendant_of(path))
            .map(|(p, _)| p.clone())
            .collect();
        for p in doomed {
            self.nodes.remove(&p);
        }
    }

    /// Recompute directory digests deepest first
    fn recompute(&mut self, dirty: BTreeSet<RelPath>) -> Vec<RelPath> {
        let mut dirs: Vec<RelPath> = dirty
            .into_iter()
            .filter(|p| self.nodes.get(p).is_some_and(|n| n.entry.is_dir()))
            .collect();
        dirs.sort_by(|a, b| b.depth().cmp(&a.depth()).then_with(|| a.cmp(b)));

        for dir in &dirs {
            let digest = self.directory_digest(dir);
            if let Some(node) = self.nodes.get_mut(dir) {
                node.digest = digest;
            }
        }
        dirs
    }

    fn directory_digest(&self, dir: &RelPath) -> Digest {
        let Some(node) = self.nodes.get(dir) else {
            return Digest::ZERO;
        };
        let children: Vec<(&str, Digest)> = node
            .children
            .iter()
            .filter_map(|name| {
                self.node_digest(&dir.join(name)).map(|digest| (name.as_str(), digest))
            })
            .collect();
        hasher::directory_node(children.into_iter())
    }

    fn commit(&mut self, ops: Vec<LogOp>) {
        self.version += 1;
        let report = self.report();
        self.history.push(VersionRecord {
            version: self.version,
            identity_key: self.identity_key(),
            item_count: report.item_count,
            total_bytes: report.total_bytes,
            committed_at: Utc::now(),
        });
        let version = self.version;
        self.log.extend(ops.into_iter().map(|op| LogRecord { version, op }));
        self.trim_log();
        self.trim_history();
    }

    fn trim_log(&mut self) {
        while self.log.len() > self.log_retention {
            self.log.pop_front();
        }
    }

    fn trim_history(&mut self) {
        let excess = self.history.len().saturating_sub(self.log_retention);
        if excess > 0 {
            self.history.drain(..excess);
        }
    }
}

fn leaf_digest(entry: &Entry) -> Option<Digest> {
    match entry.kind {
        EntryKind::File { digest } => Some(hasher::file_node(entry.size, &digest)),
        EntryKind::EmptyFile => Some(hasher::empty_node()),
        EntryKind::Directory => None,
    }
}
