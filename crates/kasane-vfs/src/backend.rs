//! Delegate backend trait.
//!
//! A [`Backend`] is one single-namespace filesystem contributing a layer to
//! the composite: a disk directory, an in-memory tree, an archive view. The
//! layered engine is the only caller; it probes backends in registration
//! order and proxies content operations to whichever one currently wins a
//! path.
//!
//! All operations are path-based and synchronous. Paths are always the
//! normalized [`VfsPath`] form, relative to the backend's own root — the
//! engine never hands a backend another backend's paths.

use std::io::{Read, Write};
use std::time::SystemTime;

use kasane_types::{AttrValue, VfsPath};

use crate::error::VfsResult;

/// An acquired per-file lock token on one backend.
///
/// Tokens are issued by [`Backend::lock`] and must be returned to the same
/// backend via [`Backend::unlock`]. Deliberately not `Clone`: one token,
/// one owner.
#[derive(Debug, PartialEq, Eq)]
pub struct BackendLock {
    id: u64,
}

impl BackendLock {
    /// Create a token. Backends call this; the engine only stores tokens.
    pub fn new(id: u64) -> Self {
        Self { id }
    }

    /// The backend-assigned token id.
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Capability interface of a single delegate filesystem.
pub trait Backend: Send + Sync {
    // ========================================================================
    // Identity
    // ========================================================================

    /// Short human-readable name, for logs and error messages.
    fn name(&self) -> &str;

    /// True if this whole layer refuses writes.
    fn read_only(&self) -> bool;

    /// Monotonic counter bumped on every mutation of this backend.
    ///
    /// The background watcher polls this to notice out-of-band changes
    /// (an archive file replaced underneath, another process writing).
    fn revision(&self) -> u64;

    // ========================================================================
    // Reading
    // ========================================================================

    /// True if a resource exists at `path`.
    fn exists(&self, path: &VfsPath) -> bool;

    /// True if `path` exists and is a folder.
    fn is_folder(&self, path: &VfsPath) -> bool;

    /// Child names (name.ext form) of a folder, in the backend's order.
    fn children(&self, path: &VfsPath) -> VfsResult<Vec<String>>;

    /// Last modification time of `path`.
    fn last_modified(&self, path: &VfsPath) -> VfsResult<SystemTime>;

    /// Size in bytes; zero for folders.
    fn size(&self, path: &VfsPath) -> VfsResult<u64>;

    /// Open `path` for reading.
    fn open_read(&self, path: &VfsPath) -> VfsResult<Box<dyn Read + Send>>;

    // ========================================================================
    // Writing
    // ========================================================================

    /// Open `path` for writing, truncating. Fails on read-only backends.
    fn open_write(&self, path: &VfsPath) -> VfsResult<Box<dyn Write + Send>>;

    /// Create a folder, creating missing intermediate folders.
    fn create_folder(&self, path: &VfsPath) -> VfsResult<()>;

    /// Create an empty data file, creating missing parent folders.
    fn create_data(&self, path: &VfsPath) -> VfsResult<()>;

    /// Rename within the parent folder. `to` shares `from`'s parent.
    fn rename(&self, from: &VfsPath, to: &VfsPath) -> VfsResult<()>;

    /// Delete a file or folder (folders recursively).
    fn delete(&self, path: &VfsPath) -> VfsResult<()>;

    // ========================================================================
    // Locks
    // ========================================================================

    /// Acquire the per-file lock for `path`.
    fn lock(&self, path: &VfsPath) -> VfsResult<BackendLock>;

    /// Release a previously acquired lock token.
    fn unlock(&self, path: &VfsPath, lock: BackendLock);

    // ========================================================================
    // Attributes
    // ========================================================================

    /// Read one attribute. Decode failures degrade to `None` (logged by
    /// the backend); a broken attribute must never block a listing.
    fn read_attr(&self, path: &VfsPath, name: &str) -> Option<AttrValue>;

    /// Write one attribute; `None` clears it.
    fn write_attr(&self, path: &VfsPath, name: &str, value: Option<AttrValue>) -> VfsResult<()>;

    /// All attribute names set on `path`.
    fn attr_names(&self, path: &VfsPath) -> Vec<String>;

    // ========================================================================
    // Convenience (default implementations)
    // ========================================================================

    /// Read the whole file.
    fn read_all(&self, path: &VfsPath) -> VfsResult<Vec<u8>> {
        let mut reader = self.open_read(path)?;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Replace the whole file, creating it if missing.
    fn write_all(&self, path: &VfsPath, data: &[u8]) -> VfsResult<()> {
        if !self.exists(path) {
            self.create_data(path)?;
        }
        let mut writer = self.open_write(path)?;
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }
}
