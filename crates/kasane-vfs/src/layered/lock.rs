//! Cross-layer file locks.
//!
//! Locking a layered handle locks the file on every delegate currently
//! presenting it whose layer is lockable (read-only layers simply are not
//! locked). Acquisition iterates delegates in registration order, which
//! keeps lock ordering deterministic across composite filesystems sharing
//! backends. The caller's [`HandleLock`] stays valid across leader
//! migration: the per-delegate map is re-targeted in place.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use kasane_types::VfsPath;
use parking_lot::Mutex;

use crate::backend::BackendLock;
use crate::error::VfsResult;
use crate::layered::FsInner;
use crate::layered::handle::HandleInner;

/// Shared lock state; the handle holds it weakly, the [`HandleLock`]
/// strongly.
pub(crate) struct LockInner {
    pub handle: Weak<HandleInner>,
    /// Per-delegate tokens, each remembering the path it was acquired at
    /// (lower layers keep their old path across a rename-by-copy).
    locks: Mutex<HashMap<usize, (VfsPath, BackendLock)>>,
    released: AtomicBool,
}

impl LockInner {
    /// Acquire tokens on `indices` (registration order) at `path`. On any
    /// failure everything acquired so far is released again.
    pub(crate) fn acquire(
        fs: &FsInner,
        handle: Weak<HandleInner>,
        path: &VfsPath,
        indices: &[usize],
    ) -> VfsResult<Arc<LockInner>> {
        let mut acquired: HashMap<usize, (VfsPath, BackendLock)> = HashMap::new();
        for &idx in indices {
            match fs.delegates[idx].lock(path) {
                Ok(token) => {
                    acquired.insert(idx, (path.clone(), token));
                }
                Err(e) => {
                    for (i, (p, token)) in acquired {
                        fs.delegates[i].unlock(&p, token);
                    }
                    return Err(e);
                }
            }
        }
        Ok(Arc::new(LockInner {
            handle,
            locks: Mutex::new(acquired),
            released: AtomicBool::new(false),
        }))
    }

    /// Does this lock cover delegate `idx`?
    pub(crate) fn covers(&self, idx: usize) -> bool {
        self.locks.lock().contains_key(&idx)
    }

    /// Number of underlying tokens held.
    pub(crate) fn lock_count(&self) -> usize {
        self.locks.lock().len()
    }

    /// Acquire an additional delegate's token at `path`.
    pub(crate) fn add_lock(&self, fs: &FsInner, idx: usize, path: &VfsPath) -> VfsResult<()> {
        let mut locks = self.locks.lock();
        if locks.contains_key(&idx) {
            return Ok(());
        }
        let token = fs.delegates[idx].lock(path)?;
        locks.insert(idx, (path.clone(), token));
        Ok(())
    }

    /// Release `old`'s token and acquire `new`'s at `path`; used when the
    /// leader migrates to another layer.
    pub(crate) fn change_locks(
        &self,
        fs: &FsInner,
        old: usize,
        new: usize,
        path: &VfsPath,
    ) -> VfsResult<()> {
        let mut locks = self.locks.lock();
        if let Some((p, token)) = locks.remove(&old) {
            fs.delegates[old].unlock(&p, token);
        }
        if !locks.contains_key(&new) {
            let token = fs.delegates[new].lock(path)?;
            locks.insert(new, (path.clone(), token));
        }
        Ok(())
    }

    /// Re-key one delegate's token after an in-place rename on that layer.
    pub(crate) fn retarget_rename(&self, fs: &FsInner, idx: usize, new_path: &VfsPath) -> VfsResult<()> {
        let mut locks = self.locks.lock();
        if let Some((old_path, token)) = locks.remove(&idx) {
            fs.delegates[idx].unlock(&old_path, token);
            let token = fs.delegates[idx].lock(new_path)?;
            locks.insert(idx, (new_path.clone(), token));
        }
        Ok(())
    }

    /// Release all tokens. Idempotent.
    pub(crate) fn release(&self, fs: &FsInner) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let drained: Vec<(usize, (VfsPath, BackendLock))> =
            self.locks.lock().drain().collect();
        for (idx, (path, token)) in drained {
            fs.delegates[idx].unlock(&path, token);
        }
        // Detach from the handle and drop its stale last-modified cache.
        if let Some(handle) = self.handle.upgrade() {
            let mut state = handle.state.lock();
            if state
                .lock
                .as_ref()
                .is_some_and(|w| w.upgrade().map_or(true, |l| std::ptr::eq(&*l, self)))
            {
                state.lock = None;
            }
            state.last_modified = None;
        }
    }

    pub(crate) fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

/// An acquired cross-layer lock. Releases on drop.
pub struct HandleLock {
    pub(crate) fs: Arc<FsInner>,
    pub(crate) inner: Arc<LockInner>,
}

impl HandleLock {
    /// How many delegate locks this lock holds.
    pub fn delegate_count(&self) -> usize {
        self.inner.lock_count()
    }

    /// Release explicitly. Equivalent to dropping.
    pub fn release(self) {
        self.inner.release(&self.fs);
    }
}

impl Drop for HandleLock {
    fn drop(&mut self) {
        self.inner.release(&self.fs);
    }
}

impl std::fmt::Debug for HandleLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleLock")
            .field("delegates", &self.inner.lock_count())
            .field("released", &self.inner.is_released())
            .finish()
    }
}
