//! Exclusive ownership of a shared root
//!
//! Only one process may index a given root at a time. [`RootLock`] takes a
//! non-blocking advisory `flock` on `<control dir>/lock`; a second instance
//! fails immediately with [`ShareError::RootBusy`] instead of waiting. The
//! lock is released when the value is dropped, including when the process
//! dies, so a crashed instance never leaves the root stuck.

use crate::error::{Result, ShareError};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Name of the lock file inside the control directory
pub const LOCK_FILE: &str = "lock";

/// Held while a process owns the control directory
pub struct RootLock {
    path: PathBuf,
    #[cfg(unix)]
    _file: nix::fcntl::Flock<File>,
    #[cfg(not(unix))]
    _file: File,
}

impl RootLock {
    /// Take the lock for `control_dir`, creating the directory if needed
    ///
    /// # Errors
    ///
    /// - [`ShareError::RootBusy`] if another instance holds the lock
    /// - I/O errors if the lock file cannot be created
    #[cfg(unix)]
    pub fn acquire(control_dir: &Path) -> Result<Self> {
        use nix::errno::Errno;
        use nix::fcntl::{Flock, FlockArg};

        std::fs::create_dir_all(control_dir)?;
        let path = control_dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;

        let mut locked = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(locked) => locked,
            Err((_, Errno::EWOULDBLOCK)) => return Err(ShareError::RootBusy(control_dir.to_path_buf())),
            Err((_, errno)) => return Err(std::io::Error::from(errno).into()),
        };

        locked.set_len(0)?;
        writeln!(locked, "{}", std::process::id())?;
        debug!("Acquired lock {:?}", path);
        Ok(Self { path, _file: locked })
    }

    /// Take the lock for `control_dir`, creating the directory if needed
    #[cfg(not(unix))]
    pub fn acquire(control_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(control_dir)?;
        let path = control_dir.join(LOCK_FILE);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(ShareError::RootBusy(control_dir.to_path_buf()))
            }
            Err(e) => return Err(e.into()),
        };
        writeln!(file, "{}", std::process::id())?;
        debug!("Acquired lock {:?}", path);
        Ok(Self { path, _file: file })
    }

    /// Location of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for RootLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootLock").field("path", &self.path).finish()
    }
}

#[cfg(not(unix))]
impl Drop for RootLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
