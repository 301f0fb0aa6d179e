//! Content and node hashing
//!
//! All digests in datshare are SHA-256. Content digests are computed by
//! streaming a file through a fixed 8 KiB buffer, so memory use does not
//! depend on file size. Node digests used by the index are domain separated
//! so that a file, an empty file and a directory can never produce the same
//! input to the hash function:
//!
//! ```text
//! file      = H("datshare:file"  ‖ size_be64 ‖ content_digest)
//! empty     = H("datshare:empty" ‖ EMPTY_FILE_SENTINEL)
//! directory = H("datshare:dir"   ‖ count_be64 ‖ { name_len_be64 ‖ name ‖ child_digest }*)
//! ```
//!
//! Directory children are fed in name order. Modification times never enter
//! any digest.

use crate::error::{Result, ShareError};
use crate::types::Digest;
use sha2::{Digest as _, Sha256};
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;
use tracing::{debug, trace};

const READ_BUFFER_SIZE: usize = 8192;

const FILE_DOMAIN: &[u8] = b"datshare:file";
const EMPTY_DOMAIN: &[u8] = b"datshare:empty";
const DIR_DOMAIN: &[u8] = b"datshare:dir";

/// Stand-in content digest for zero-length files
pub const EMPTY_FILE_SENTINEL: Digest = Digest(*b"datshare:empty-file-sentinel:v01");

/// Incremental SHA-256 over a byte stream
#[derive(Clone, Default)]
pub struct ContentHasher {
    inner: Sha256,
    bytes: u64,
}

impl ContentHasher {
    /// Start a new digest
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed more bytes
    pub fn update(&mut self, data: &[u8]) -> &mut Self {
        self.inner.update(data);
        self.bytes += data.len() as u64;
        self
    }

    /// Number of bytes fed so far
    pub fn bytes_hashed(&self) -> u64 {
        self.bytes
    }

    /// Finish and return the digest
    pub fn finalize(self) -> Digest {
        Digest(self.inner.finalize().into())
    }
}

/// Digest of an in-memory buffer
pub fn hash_bytes(data: &[u8]) -> Digest {
    let mut hasher = ContentHasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Stream a reader to completion and return its digest and length
pub fn hash_reader<R: Read>(mut reader: R) -> std::io::Result<(Digest, u64)> {
    let mut hasher = ContentHasher::new();
    let mut buffer = [0u8; READ_BUFFER_SIZE];
    loop {
        let bytes_read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buffer[..bytes_read]);
    }
    let len = hasher.bytes_hashed();
    Ok((hasher.finalize(), len))
}

/// Hash the content of a file
///
/// # Errors
///
/// - [`ShareError::PermissionDenied`] if the file cannot be opened or read
///   because of permissions
/// - [`ShareError::PathNotFound`] if the file vanished
/// - [`ShareError::ReadFailure`] for any other I/O error
pub fn hash_file(path: &Path) -> Result<(Digest, u64)> {
    let file = File::open(path).map_err(|e| ShareError::from_read(path, e))?;
    let result = hash_reader(file).map_err(|e| ShareError::from_read(path, e))?;
    trace!("Hashed {:?}: {} bytes", path, result.1);
    Ok(result)
}

/// Hash a file, retrying once after a transient read failure
///
/// Permission errors and vanished files are returned immediately.
pub fn hash_file_with_retry(path: &Path) -> Result<(Digest, u64)> {
    match hash_file(path) {
        Err(ShareError::ReadFailure { source, .. }) => {
            debug!("Read of {:?} failed ({}), retrying once", path, source);
            hash_file(path)
        }
        other => other,
    }
}

/// Node digest of a non-empty file
pub fn file_node(size: u64, content: &Digest) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(FILE_DOMAIN);
    hasher.update(size.to_be_bytes());
    hasher.update(content.as_bytes());
    Digest(hasher.finalize().into())
}

/// Node digest of an empty file
pub fn empty_node() -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(EMPTY_DOMAIN);
    hasher.update(EMPTY_FILE_SENTINEL.as_bytes());
    Digest(hasher.finalize().into())
}

/// Node digest of a directory from its `(name, child digest)` pairs
///
/// Children must already be sorted by name.
pub fn directory_node<'a, I>(children: I) -> Digest
where
    I: ExactSizeIterator<Item = (&'a str, Digest)>,
{
    let mut hasher = Sha256::new();
    hasher.update(DIR_DOMAIN);
    hasher.update((children.len() as u64).to_be_bytes());
    for (name, digest) in children {
        hasher.update((name.len() as u64).to_be_bytes());
        hasher.update(name.as_bytes());
        hasher.update(digest.as_bytes());
    }
    Digest(hasher.finalize().into())
}
