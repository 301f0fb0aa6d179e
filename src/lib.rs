//! # datshare - Directory archive indexing
//!
//! Turns a local directory into a shareable unit identified by a stable
//! 64-hex-character key, either as a frozen **snapshot** or as a **live**
//! share that follows changes to the tree. State is kept under a control
//! directory inside the root (`.dat` by default), so restarting on unchanged
//! content reproduces the same key without reading a single file.
//!
//! ## Overview
//!
//! - Deterministic, depth-first walks with siblings sorted by name
//! - SHA-256 content digests folded into a per-directory Merkle tree whose
//!   root digest is the identity key
//! - Incremental updates that recompute only the ancestors of changed
//!   entries, recorded as an append-only version history
//! - Crash-safe persistence (temporary file, fsync, rename) with bounded
//!   retries
//! - An explicit reconciler state machine for live mode, fed by OS
//!   notifications through a single message stream
//!
//! The engine never prints. Keys, indexed entries, reports and warnings are
//! delivered to a [`ReportListener`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use datshare::ShareBuilder;
//!
//! # fn main() -> datshare::Result<()> {
//! let outcome = ShareBuilder::new("./my_dataset").build()?.snapshot()?;
//! println!(
//!     "Items: {}  Size: {}",
//!     outcome.report.item_count,
//!     outcome.report.display_size()
//! );
//! println!("Link {}", outcome.identity_key);
//! # Ok(())
//! # }
//! ```
//!
//! ## Live Sharing
//!
//! ```rust,no_run
//! use datshare::{ShareBuilder, report::TracingListener};
//! use std::sync::Arc;
//!
//! # async fn run() -> datshare::Result<()> {
//! let session = ShareBuilder::new(".")
//!     .listener(Arc::new(TracingListener))
//!     .build()?
//!     .live()
//!     .await?;
//!
//! if let Some(key) = session.key() {
//!     println!("Link {}", key);
//! }
//! tokio::signal::ctrl_c().await?;
//! let report = session.stop().await?;
//! println!("Items: {}", report.item_count);
//! # Ok(())
//! # }
//! ```
//!
//! ## Counting
//!
//! Both modes count the same way: every regular file, empty or not, is one
//! item, and directories are counted separately in
//! [`Report::directory_count`]. Sizes are summed over files only.
//!
//! ## Control Directory Layout
//!
//! ```text
//! <root>/.dat/
//! ├── lock            # held while a process owns the root
//! ├── index.bin       # entries, version history, change log
//! ├── key             # identity key, 64 hex characters
//! └── metadata.json   # versions, timestamps, configuration
//! ```
//!
//! ## Module Organization
//!
//! - [`hasher`]: content digests and node digest combinators
//! - [`walker`]: deterministic walks and pooled hashing scans
//! - [`index`]: the Merkle index and its version history
//! - [`resume`]: loading and saving state between runs
//! - [`reconciler`]: the live-mode state machine
//! - [`snapshot`]: one-shot indexing
//! - [`report`]: the listener interface
//! - [`types`]: shared data types
//! - [`error`]: error types and handling

pub mod error;
pub mod fs_watcher;
pub mod hasher;
pub mod index;
pub mod lock;
pub mod reconciler;
pub mod report;
pub mod resume;
pub mod share;
pub mod snapshot;
pub mod types;
pub mod walker;

mod utils;

pub use error::{Result, ShareError};
pub use fs_watcher::{ChangeEvent, ChangeKind};
pub use index::{ArchiveIndex, UpdateOutcome};
pub use reconciler::{ReconcilerMessage, ReconcilerState};
pub use report::{NoopListener, RecordingListener, ReportListener, TracingListener};
pub use resume::{ResumeState, ResumeStore};
pub use share::{LiveSession, Share, ShareBuilder};
pub use snapshot::SnapshotOutcome;
pub use types::*;
pub use utils::format_size;
