//! Virtual handles: the per-path facade over the layered engine.
//!
//! A [`FileRef`] is a cheap clonable reference to the one live handle for a
//! logical path. Identity is guaranteed by the path-keyed registry on the
//! filesystem: two lookups of the same path return the same handle as long
//! as any strong reference is alive. Parent links are weak, the registry
//! holds weak entries, and a handle removes itself from the registry when
//! the last strong reference drops — nothing here owns a cycle.

use std::io::{Read, Write};
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use kasane_types::{AttrValue, VfsPath, path::compose_name_ext};
use parking_lot::Mutex;

use crate::error::{VfsError, VfsResult};
use crate::events::{EventKind, ListenerId, VfsEvent, VfsListener};
use crate::layered::FsInner;
use crate::layered::lock::{HandleLock, LockInner};

/// The cached, per-path resolution state.
pub(crate) struct HandleState {
    /// Current logical path; rewritten on rename.
    pub path: VfsPath,
    /// False once deleted or the delegate set emptied; never resurrected.
    pub valid: bool,
    /// Indices of delegates currently presenting this path, in
    /// registration order.
    pub delegates: Vec<usize>,
    /// Index of the authoritative delegate, if any.
    pub leader: Option<usize>,
    /// Folder/data flag, cached once the resource is confirmed to exist.
    pub is_folder: Option<bool>,
    /// Cached last-modified; invalidated on write and lock release.
    pub last_modified: Option<SystemTime>,
    /// Cached merged child-name list for folders.
    pub children: Option<Vec<String>>,
    /// Hot one-entry attribute cache: delegate index and the attribute
    /// key (possibly a root-prefixed key) that last answered.
    pub attr_cache: Option<(usize, String)>,
    /// The outstanding lock, if any.
    pub lock: Option<Weak<LockInner>>,
}

impl HandleState {
    fn new(path: VfsPath) -> Self {
        Self {
            path,
            valid: true,
            delegates: Vec::new(),
            leader: None,
            is_folder: None,
            last_modified: None,
            children: None,
            attr_cache: None,
            lock: None,
        }
    }

    /// The live lock, if one is outstanding.
    pub fn live_lock(&self) -> Option<Arc<LockInner>> {
        self.lock.as_ref()?.upgrade()
    }

    /// Drop derived caches after a structural change.
    pub fn clear_caches(&mut self) {
        self.last_modified = None;
        self.children = None;
        self.attr_cache = None;
    }
}

/// One node of the handle tree.
pub(crate) struct HandleInner {
    pub fs: Weak<FsInner>,
    /// Weak back-reference; the root has none.
    pub parent: Weak<HandleInner>,
    pub state: Mutex<HandleState>,
}

impl HandleInner {
    pub(crate) fn new(fs: &Arc<FsInner>, parent: Weak<HandleInner>, path: VfsPath) -> Arc<Self> {
        Arc::new(Self {
            fs: Arc::downgrade(fs),
            parent,
            state: Mutex::new(HandleState::new(path)),
        })
    }

    pub(crate) fn path(&self) -> VfsPath {
        self.state.lock().path.clone()
    }
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        // Reclamation callback: drop the registry entry (it is already
        // dead) and let the path's next lookup build a fresh handle.
        if let Some(fs) = self.fs.upgrade() {
            let path = self.state.get_mut().path.clone();
            fs.registry.remove_if(&path, |_, w| w.upgrade().is_none());
        }
    }
}

/// A file or folder in the composite filesystem.
///
/// Cloning is cheap and clones refer to the same underlying handle.
#[derive(Clone)]
pub struct FileRef {
    pub(crate) fs: Arc<FsInner>,
    pub(crate) inner: Arc<HandleInner>,
}

impl FileRef {
    /// The logical path of this handle.
    pub fn path(&self) -> VfsPath {
        self.inner.path()
    }

    /// Base name (before the last `.` of the last component).
    pub fn name(&self) -> String {
        self.path().name().to_string()
    }

    /// Extension (empty for folders and extension-less files).
    pub fn ext(&self) -> String {
        self.path().ext().to_string()
    }

    /// True until the handle is deleted or loses all delegates.
    pub fn is_valid(&self) -> bool {
        self.inner.state.lock().valid
    }

    /// True if this is the filesystem root.
    pub fn is_root(&self) -> bool {
        self.path().is_root()
    }

    /// The parent folder handle, while one is still alive. The root has
    /// none; a long-dropped parent resolves again via a fresh lookup.
    pub fn parent(&self) -> Option<FileRef> {
        let inner = self.inner.parent.upgrade()?;
        Some(FileRef {
            fs: Arc::clone(&self.fs),
            inner,
        })
    }

    /// True if this handle is a folder. The root always is; otherwise the
    /// leader decides, and the answer is cached once the resource exists.
    pub fn is_folder(&self) -> bool {
        let mut state = self.inner.state.lock();
        if state.path.is_root() {
            return true;
        }
        if let Some(cached) = state.is_folder {
            return cached;
        }
        let answer = match state.leader {
            Some(idx) => self.fs.delegates[idx].is_folder(&state.path),
            None => false,
        };
        // Only cache once backed by a real resource; a guess for a
        // not-yet-existing path must not stick.
        if state.leader.is_some() {
            state.is_folder = Some(answer);
        }
        answer
    }

    /// True if this handle is a data file. Exclusive with [`is_folder`].
    ///
    /// [`is_folder`]: FileRef::is_folder
    pub fn is_data(&self) -> bool {
        !self.is_folder() && !self.is_root()
    }

    /// Last modification time, proxied to the leader and cached until the
    /// next write or lock release.
    pub fn last_modified(&self) -> VfsResult<SystemTime> {
        let mut state = self.inner.state.lock();
        if let Some(cached) = state.last_modified {
            return Ok(cached);
        }
        let (idx, path) = self.leader_of(&state)?;
        let stamp = self.fs.delegates[idx].last_modified(&path)?;
        state.last_modified = Some(stamp);
        Ok(stamp)
    }

    /// Size in bytes, proxied to the leader.
    pub fn size(&self) -> VfsResult<u64> {
        let state = self.inner.state.lock();
        let (idx, path) = self.leader_of(&state)?;
        self.fs.delegates[idx].size(&path)
    }

    /// Open the leader's content for reading.
    pub fn open_read(&self) -> VfsResult<Box<dyn Read + Send>> {
        let state = self.inner.state.lock();
        let (idx, path) = self.leader_of(&state)?;
        self.fs.delegates[idx].open_read(&path)
    }

    /// Read the whole content.
    pub fn read_all(&self) -> VfsResult<Vec<u8>> {
        let mut buf = Vec::new();
        self.open_read()?.read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Open for writing. Requires the outstanding lock; migrates the
    /// resource to the writable layer first when the leader is read-only.
    pub fn open_write(&self, lock: &HandleLock) -> VfsResult<Box<dyn Write + Send>> {
        self.fs.clone().open_write(self, lock)
    }

    /// Replace the whole content.
    pub fn write_all(&self, lock: &HandleLock, data: &[u8]) -> VfsResult<()> {
        let mut w = self.open_write(lock)?;
        w.write_all(data)?;
        w.flush()?;
        Ok(())
    }

    /// Merged child names, masks applied, in first-seen layer order.
    pub fn child_names(&self) -> VfsResult<Vec<String>> {
        {
            let state = self.inner.state.lock();
            if !state.valid {
                return Err(VfsError::invalid(state.path.to_string()));
            }
            if let Some(cached) = &state.children {
                return Ok(cached.clone());
            }
        }
        let path = self.path();
        let names = self.fs.merged_children(&path);
        let mut state = self.inner.state.lock();
        state.children = Some(names.clone());
        Ok(names)
    }

    /// Child handles of this folder.
    pub fn children(&self) -> VfsResult<Vec<FileRef>> {
        let names = self.child_names()?;
        let path = self.path();
        Ok(names
            .iter()
            .map(|n| self.fs.handle_at(&path.join(n), Some(&self.inner)))
            .map(|inner| FileRef {
                fs: Arc::clone(&self.fs),
                inner,
            })
            .collect())
    }

    /// Look up one visible child by `name.ext`.
    pub fn child(&self, name_ext: &str) -> Option<FileRef> {
        let names = self.child_names().ok()?;
        if !names.iter().any(|n| n == name_ext) {
            return None;
        }
        let inner = self
            .fs
            .handle_at(&self.path().join(name_ext), Some(&self.inner));
        Some(FileRef {
            fs: Arc::clone(&self.fs),
            inner,
        })
    }

    /// Create a child folder. Fires one `FolderCreated`.
    pub fn create_folder(&self, name: &str) -> VfsResult<FileRef> {
        self.fs.clone().create_child(self, name, None)
    }

    /// Create a child data file. Fires one `DataCreated`.
    pub fn create_data(&self, name: &str, ext: &str) -> VfsResult<FileRef> {
        self.fs.clone().create_child(self, name, Some(ext))
    }

    /// Rename within the parent folder. Fires one `Renamed`.
    pub fn rename(&self, lock: &HandleLock, name: &str, ext: &str) -> VfsResult<()> {
        self.fs.clone().rename(self, lock, name, ext)
    }

    /// Delete (masking layers the lock cannot cover). Fires one `Deleted`.
    pub fn delete(&self, lock: &HandleLock) -> VfsResult<()> {
        self.fs.clone().delete(self, lock)
    }

    /// Acquire the cross-layer lock for this handle.
    pub fn lock(&self) -> VfsResult<HandleLock> {
        self.fs.clone().lock_handle(self)
    }

    /// True while a lock is outstanding.
    pub fn is_locked(&self) -> bool {
        self.inner.state.lock().live_lock().is_some()
    }

    /// Read one attribute through the layer merge.
    pub fn get_attribute(&self, name: &str) -> Option<AttrValue> {
        self.fs.get_attribute(&self.inner, name)
    }

    /// Write one attribute to the writable layer; `None` clears.
    pub fn set_attribute(&self, name: &str, value: Option<AttrValue>) -> VfsResult<()> {
        self.fs.clone().set_attribute(&self.inner, name, value)
    }

    /// All attribute names visible on this handle.
    pub fn attr_names(&self) -> Vec<String> {
        self.fs.attr_names(&self.inner)
    }

    /// Listen to events on exactly this path.
    pub fn add_listener(&self, listener: Arc<dyn VfsListener>) -> ListenerId {
        self.fs
            .listeners
            .add(Some(self.path()), false, false, listener)
    }

    /// Listen to events on this path and every descendant.
    pub fn add_recursive_listener(&self, listener: Arc<dyn VfsListener>) -> ListenerId {
        self.fs
            .listeners
            .add(Some(self.path()), true, false, listener)
    }

    /// Remove a previously added listener.
    pub fn remove_listener(&self, id: ListenerId) {
        self.fs.listeners.remove(id);
    }

    /// Copy this file or folder into `target`, returning the new handle.
    pub fn copy_to(&self, target: &FileRef, name: &str, ext: &str) -> VfsResult<FileRef> {
        self.fs.clone().copy_tree(self, target, name, ext)
    }

    /// Move = copy into `target` then delete here. The handle itself stays
    /// bound to the old (now invalid) path; the returned handle is the new
    /// location.
    pub fn move_to(&self, lock: &HandleLock, target: &FileRef, name: &str, ext: &str) -> VfsResult<FileRef> {
        let copied = self.copy_to(target, name, ext)?;
        self.delete(lock)?;
        Ok(copied)
    }

    /// Re-probe the delegate set and refresh caches, firing events for
    /// observed differences.
    pub fn refresh(&self) {
        self.fs.clone().refresh_handle(&self.inner);
    }

    fn leader_of(&self, state: &HandleState) -> VfsResult<(usize, VfsPath)> {
        if !state.valid {
            return Err(VfsError::invalid(state.path.to_string()));
        }
        match state.leader {
            Some(idx) => Ok((idx, state.path.clone())),
            None => Err(VfsError::invalid(state.path.to_string())),
        }
    }
}

impl std::fmt::Debug for FileRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("FileRef")
            .field("path", &state.path.to_string())
            .field("valid", &state.valid)
            .field("leader", &state.leader)
            .finish()
    }
}

/// Internal helper shared by create/rename: compose the full child name.
pub(crate) fn child_name(name: &str, ext: Option<&str>) -> String {
    match ext {
        Some(e) => compose_name_ext(name, e),
        None => name.to_string(),
    }
}

/// Writer wrapper that fires `Changed` and drops the stale
/// last-modified cache once the content write completes.
pub(crate) struct TrackedWriter {
    pub inner: Box<dyn Write + Send>,
    pub fs: Arc<FsInner>,
    pub handle: Arc<HandleInner>,
    pub fired: bool,
}

impl Write for TrackedWriter {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.inner.write(data)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()?;
        self.finish();
        Ok(())
    }
}

impl TrackedWriter {
    fn finish(&mut self) {
        if self.fired {
            return;
        }
        self.fired = true;
        let path = {
            let mut state = self.handle.state.lock();
            state.last_modified = None;
            state.path.clone()
        };
        self.fs.batcher.emit(VfsEvent::new(path, EventKind::Changed));
    }
}

impl Drop for TrackedWriter {
    fn drop(&mut self) {
        // Commit the delegate writer before announcing the change, so a
        // listener reading on the event sees the new content.
        let _ = self.inner.flush();
        self.finish();
    }
}
