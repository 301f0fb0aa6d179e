//! Utility functions for datshare
//!
//! Small helpers shared across the library:
//!
//! - Atomic file replacement (temp file, fsync, rename, directory fsync)
//! - Path conversion from absolute paths to [`RelPath`]
//! - Modification-time extraction in nanoseconds
//! - Human-readable size rendering (`1440` → `"1.44 kB"`)

use crate::error::Result;
use crate::types::RelPath;
use std::fs::{self, File, Metadata};
use std::io::Write;
use std::path::Path;
use std::time::UNIX_EPOCH;
use tracing::trace;

/// Atomically replace `path` with `content`
///
/// The bytes land in a temporary file in the same directory, are flushed to
/// disk and only then renamed over the destination. A crash at any point
/// leaves either the previous file or the new one, never a torn mix.
///
/// # Errors
///
/// Returns an I/O error if the temporary file cannot be created, written,
/// synced or renamed.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp = tempfile::Builder::new()
        .prefix(".tmp-")
        .tempfile_in(dir)?;

    temp.write_all(content)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;

    sync_dir(dir)?;
    trace!("Atomically wrote {} bytes to {:?}", content.len(), path);
    Ok(())
}

/// Flush directory metadata so a completed rename survives a crash
#[cfg(unix)]
pub fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

/// Flush directory metadata so a completed rename survives a crash
#[cfg(not(unix))]
pub fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

/// Convert an absolute path under `root` to a [`RelPath`]
///
/// Returns `None` when `path` is outside `root`.
pub fn make_relative(path: &Path, root: &Path) -> Option<RelPath> {
    let rel = path.strip_prefix(root).ok()?;
    RelPath::from_relative(rel)
}

/// Modification time in nanoseconds since the Unix epoch
///
/// Times before the epoch are negative; unavailable times read as zero.
pub fn modified_ns(metadata: &Metadata) -> i64 {
    let Ok(modified) = metadata.modified() else {
        return 0;
    };
    match modified.duration_since(UNIX_EPOCH) {
        Ok(d) => i64::try_from(d.as_nanos()).unwrap_or(i64::MAX),
        Err(e) => i64::try_from(e.duration().as_nanos()).map(|n| -n).unwrap_or(i64::MIN),
    }
}

/// Create a directory and its parents if they do not exist
pub fn ensure_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)?;
    }
    Ok(())
}

/// Format a byte count with decimal units and three significant digits
///
/// # Examples
///
/// ```rust
/// use datshare::format_size;
///
/// assert_eq!(format_size(1440), "1.44 kB");
/// assert_eq!(format_size(999), "999 B");
/// assert_eq!(format_size(1_500_000), "1.5 MB");
/// ```
pub fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "kB", "MB", "GB", "TB", "PB", "EB"];
    if bytes < 1000 {
        return format!("{} B", bytes);
    }

    let mut value = bytes as f64;
    let mut unit_idx = 0;
    while value >= 1000.0 && unit_idx < UNITS.len() - 1 {
        value /= 1000.0;
        unit_idx += 1;
    }

    let decimals = if value >= 100.0 {
        0
    } else if value >= 10.0 {
        1
    } else {
        2
    };
    let mut rendered = format!("{:.*}", decimals, value);
    if rendered.contains('.') {
        rendered = rendered.trim_end_matches('0').trim_end_matches('.').to_string();
    }
    format!("{} {}", rendered, UNITS[unit_idx])
}
