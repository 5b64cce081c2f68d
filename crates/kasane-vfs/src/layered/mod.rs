//! The layered composite filesystem.
//!
//! [`LayeredFs`] stacks delegate backends in a fixed registration order
//! into one logical namespace. Per path, the engine tracks which delegates
//! present a resource and which one is authoritative (the leader, picked
//! by weight); content operations proxy to the leader while the other
//! layers stay available for attribute merge and later promotion.
//!
//! A writable front layer can shadow lower layers, and a tombstone file
//! (`<name>_hidden`) on it masks a lower layer's resource entirely.
//! Structural mutations — create, rename, delete, attribute writes — run
//! as atomic actions: events queue during the action and flush, deduped,
//! when the outermost scope finishes.

mod attrs;
mod handle;
mod lock;
mod resolve;

use std::collections::HashSet;
use std::io::Write;
use std::sync::{Arc, OnceLock, Weak};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use kasane_types::{AttrValue, VfsPath};
use parking_lot::{Mutex, RwLock};
use tracing::debug;

pub use handle::FileRef;
pub use lock::HandleLock;
pub use resolve::{MASK_SUFFIX, WEIGHT_ATTR, is_mask_name, mask_path, masked_base};

use crate::backend::Backend;
use crate::error::{VfsError, VfsResult};
use crate::events::{EventBatcher, EventKind, ListenerId, ListenerRegistry, VfsEvent, VfsListener};
use handle::{HandleInner, TrackedWriter, child_name};
use lock::LockInner;

/// Shared state of one composite filesystem.
pub(crate) struct FsInner {
    /// Delegates in registration order; the order is part of the contract
    /// (tie-breaks, lock ordering, children merge).
    pub(crate) delegates: Vec<Arc<dyn Backend>>,
    pub(crate) propagate_masks: bool,
    /// Attribute names allowed to be probed on read-only layer roots.
    root_attr_optin: RwLock<HashSet<String>>,
    /// Path-keyed handle identity: one live handle per path.
    pub(crate) registry: DashMap<VfsPath, Weak<HandleInner>>,
    /// Per-folder structural monitors.
    monitors: DashMap<VfsPath, Arc<Mutex<()>>>,
    pub(crate) batcher: EventBatcher,
    pub(crate) listeners: Arc<ListenerRegistry>,
    root_handle: OnceLock<Arc<HandleInner>>,
}

/// Builder for [`LayeredFs`].
#[derive(Default)]
pub struct LayeredFsBuilder {
    delegates: Vec<Arc<dyn Backend>>,
    propagate_masks: bool,
    root_attr_optin: HashSet<String>,
}

impl LayeredFsBuilder {
    /// Append a delegate; earlier delegates win ties.
    pub fn delegate(mut self, backend: Arc<dyn Backend>) -> Self {
        self.delegates.push(backend);
        self
    }

    /// Keep mask markers visible in listings (for stacking composites).
    pub fn propagate_masks(mut self, propagate: bool) -> Self {
        self.propagate_masks = propagate;
        self
    }

    /// Allow probing `name` on read-only layer roots.
    pub fn allow_root_attr_on_read_only(mut self, name: impl Into<String>) -> Self {
        self.root_attr_optin.insert(name.into());
        self
    }

    pub fn build(self) -> LayeredFs {
        let listeners = Arc::new(ListenerRegistry::new());
        LayeredFs {
            inner: Arc::new(FsInner {
                delegates: self.delegates,
                propagate_masks: self.propagate_masks,
                root_attr_optin: RwLock::new(self.root_attr_optin),
                registry: DashMap::new(),
                monitors: DashMap::new(),
                batcher: EventBatcher::new(Arc::clone(&listeners)),
                listeners,
                root_handle: OnceLock::new(),
            }),
        }
    }
}

/// The composite filesystem. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct LayeredFs {
    inner: Arc<FsInner>,
}

impl LayeredFs {
    pub fn builder() -> LayeredFsBuilder {
        LayeredFsBuilder::default()
    }

    /// Stack `delegates` with default policies.
    pub fn new(delegates: Vec<Arc<dyn Backend>>) -> Self {
        let mut b = Self::builder();
        for d in delegates {
            b = b.delegate(d);
        }
        b.build()
    }

    /// The root folder handle.
    pub fn root(&self) -> FileRef {
        let inner = self
            .inner
            .root_handle
            .get_or_init(|| self.inner.handle_at(&VfsPath::root(), None))
            .clone();
        FileRef {
            fs: Arc::clone(&self.inner),
            inner,
        }
    }

    /// Look up a visible file or folder. Masked or absent paths are
    /// `None`.
    pub fn file(&self, path: &str) -> Option<FileRef> {
        let path = VfsPath::parse(path).ok()?;
        if path.is_root() {
            return Some(self.root());
        }
        if !self.inner.is_reachable(&path) {
            return None;
        }
        let inner = self.inner.handle_at(&path, None);
        if !inner.state.lock().valid {
            return None;
        }
        Some(FileRef {
            fs: Arc::clone(&self.inner),
            inner,
        })
    }

    /// Enter an atomic scope: events queue until the matching
    /// [`finish_atomic`](LayeredFs::finish_atomic). Reentrant.
    pub fn begin_atomic(&self) {
        self.inner.begin_atomic();
    }

    /// Leave an atomic scope; the outermost exit flushes batched events.
    pub fn finish_atomic(&self) {
        self.inner.finish_atomic();
    }

    /// Run `f` inside an atomic scope.
    pub fn atomic<R>(&self, f: impl FnOnce() -> R) -> R {
        self.inner.begin_atomic();
        let result = f();
        self.inner.finish_atomic();
        result
    }

    /// Listen to every event of this filesystem.
    pub fn add_listener(&self, listener: Arc<dyn VfsListener>) -> ListenerId {
        self.inner.listeners.add(None, false, false, listener)
    }

    /// Remove a filesystem-level listener.
    pub fn remove_listener(&self, id: ListenerId) {
        self.inner.listeners.remove(id);
    }

    /// Number of stacked delegates.
    pub fn delegate_count(&self) -> usize {
        self.inner.delegates.len()
    }

    /// Re-resolve every live handle, firing events for observed changes.
    pub fn refresh_all(&self) {
        self.inner.refresh_all();
    }

    /// Lower-layer entries currently shadowed or masked by the writable
    /// layer under `folder`.
    pub fn revealed(&self, folder: &FileRef) -> Vec<RevealedEntry> {
        self.inner.revealed(&folder.path())
    }

    /// Undo a shadow/mask: delete the override or marker on the writable
    /// layer so the lower layer's entry resolves again.
    pub fn restore(&self, folder: &FileRef, name: &str) -> VfsResult<()> {
        self.inner.restore(&folder.path(), name)
    }

    pub(crate) fn inner(&self) -> &Arc<FsInner> {
        &self.inner
    }
}

/// A lower-layer entry hidden by the writable layer: overridden by a
/// same-named file, or masked by a tombstone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RevealedEntry {
    /// Base name of the hidden entry.
    pub name: String,
    /// Delegate index the hidden entry lives on.
    pub layer: usize,
    /// True when hidden by a mask marker rather than an override.
    pub masked: bool,
}

impl FsInner {
    pub(crate) fn begin_atomic(&self) {
        self.batcher.begin();
    }

    pub(crate) fn finish_atomic(&self) {
        self.batcher.finish();
    }

    // ------------------------------------------------------------------
    // Policies
    // ------------------------------------------------------------------

    /// The layer that absorbs writes for `path`: the first non-read-only
    /// delegate.
    pub(crate) fn writable_layer(&self, _path: &VfsPath) -> Option<usize> {
        self.delegates.iter().position(|d| !d.read_only())
    }

    /// Like [`writable_layer`](FsInner::writable_layer) but an error when
    /// every layer is read-only.
    pub(crate) fn create_writable_on(&self, path: &VfsPath) -> VfsResult<usize> {
        self.writable_layer(path)
            .ok_or_else(|| VfsError::read_only(path.to_string()))
    }

    /// Layers worth locking for `path`: every non-read-only delegate, in
    /// registration order.
    fn create_locks_on(&self, _path: &VfsPath) -> Vec<usize> {
        self.delegates
            .iter()
            .enumerate()
            .filter(|(_, d)| !d.read_only())
            .map(|(i, _)| i)
            .collect()
    }

    pub(crate) fn can_have_root_attr_on_read_only(&self, name: &str) -> bool {
        let optin = self.root_attr_optin.read();
        optin.iter().any(|allowed| {
            name == allowed || name.ends_with(&format!("\\{allowed}"))
        })
    }

    // ------------------------------------------------------------------
    // Handles
    // ------------------------------------------------------------------

    fn monitor(&self, path: &VfsPath) -> Arc<Mutex<()>> {
        self.monitors
            .entry(path.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Get or create the one live handle for `path`. Invalidated handles
    /// are never resurrected: a fresh handle replaces them.
    pub(crate) fn handle_at(
        self: &Arc<Self>,
        path: &VfsPath,
        parent: Option<&Arc<HandleInner>>,
    ) -> Arc<HandleInner> {
        if let Some(existing) = self.registry.get(path).and_then(|w| w.upgrade())
            && existing.state.lock().valid
        {
            return existing;
        }

        // Build the parent chain first so the weak back-reference is set.
        let parent_arc = match parent {
            Some(p) => Some(Arc::clone(p)),
            None => path.parent().map(|pp| self.handle_at(&pp, None)),
        };
        let fresh = HandleInner::new(
            self,
            parent_arc.as_ref().map(Arc::downgrade).unwrap_or_default(),
            path.clone(),
        );

        let inner = match self.registry.entry(path.clone()) {
            Entry::Occupied(mut o) => {
                if let Some(existing) = o.get().upgrade()
                    && existing.state.lock().valid
                {
                    existing
                } else {
                    o.insert(Arc::downgrade(&fresh));
                    fresh
                }
            }
            Entry::Vacant(v) => {
                v.insert(Arc::downgrade(&fresh));
                fresh
            }
        };

        let events = self.update_handle(&inner);
        for e in events {
            self.batcher.emit(e);
        }
        inner
    }

    fn file_ref(self: &Arc<Self>, inner: Arc<HandleInner>) -> FileRef {
        FileRef {
            fs: Arc::clone(self),
            inner,
        }
    }

    /// Clear a folder handle's cached child list, if the handle is live.
    fn invalidate_children_cache(&self, folder: &VfsPath) {
        if let Some(handle) = self.registry.get(folder).and_then(|w| w.upgrade()) {
            handle.state.lock().children = None;
        }
    }

    /// Delegate indices currently presenting `path`.
    fn probe_present(&self, path: &VfsPath) -> Vec<usize> {
        (0..self.delegates.len())
            .filter(|&i| self.delegates[i].exists(path))
            .collect()
    }

    /// Leader election for a path without a handle.
    fn leader_for(&self, path: &VfsPath) -> Option<usize> {
        let writable = self.writable_layer(path);
        let mut leader = None;
        let mut max_weight = 0.0f64;
        for idx in 0..self.delegates.len() {
            if !self.delegates[idx].exists(path) {
                continue;
            }
            let weight = self.weight_of(idx, path, writable);
            if leader.is_none() || weight > max_weight {
                leader = Some(idx);
                max_weight = weight;
            }
        }
        leader
    }

    // ------------------------------------------------------------------
    // Masks
    // ------------------------------------------------------------------

    /// Write a tombstone for `path` on delegate `idx`.
    fn mask_file(&self, idx: usize, path: &VfsPath) -> VfsResult<()> {
        let marker = mask_path(path);
        match self.delegates[idx].create_data(&marker) {
            Ok(()) => Ok(()),
            Err(VfsError::AlreadyExists(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Remove tombstones for `path` on every writable layer.
    fn unmask_file_on_all(&self, path: &VfsPath) -> VfsResult<()> {
        let marker = mask_path(path);
        for delegate in &self.delegates {
            if delegate.read_only() || !delegate.exists(&marker) {
                continue;
            }
            match delegate.delete(&marker) {
                Ok(()) | Err(VfsError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Structural operations
    // ------------------------------------------------------------------

    /// Create a child folder (`ext = None`) or data file under `parent`.
    pub(crate) fn create_child(
        self: &Arc<Self>,
        parent: &FileRef,
        name: &str,
        ext: Option<&str>,
    ) -> VfsResult<FileRef> {
        let composed = child_name(name, ext);
        VfsPath::validate_name(&composed).map_err(|e| VfsError::invalid_name(e.to_string()))?;
        if is_mask_name(&composed) {
            return Err(VfsError::invalid_name(composed));
        }

        let parent_path = parent.path();
        self.begin_atomic();
        let result = (|| {
            let monitor = self.monitor(&parent_path);
            let _monitor = monitor.lock();

            if !parent.is_valid() {
                return Err(VfsError::invalid(parent_path.to_string()));
            }
            if !parent.is_folder() {
                return Err(VfsError::not_a_folder(parent_path.to_string()));
            }

            let full = parent_path.join(&composed);
            if self.is_visible(&full) {
                return Err(VfsError::already_exists(full.to_string()));
            }

            let target = self.create_writable_on(&full)?;
            match ext {
                None => self.delegates[target].create_folder(&full)?,
                Some(_) => self.delegates[target].create_data(&full)?,
            }

            // A lower layer may still carry a masked same-named resource;
            // drop the tombstone so resolution sees the new file.
            self.unmask_file_on_all(&full)?;

            if ext.is_none() {
                // Unmasking may have revealed a lower-layer folder's
                // content; a freshly created folder starts empty, so mask
                // what showed through.
                for child in self.merged_children(&full) {
                    self.mask_file(target, &full.join(&child))?;
                }
            }

            self.invalidate_children_cache(&parent_path);
            let inner = self.handle_at(&full, Some(&parent.inner));
            let events = self.update_handle(&inner);
            for e in events {
                self.batcher.emit(e);
            }

            let kind = if ext.is_none() {
                EventKind::FolderCreated
            } else {
                EventKind::DataCreated
            };
            self.batcher.emit(VfsEvent::new(full.clone(), kind));
            debug!(path = %full, delegate = self.delegates[target].name(), "created");

            Ok(self.file_ref(inner))
        })();
        self.finish_atomic();
        result
    }

    /// Delete a handle: remove directly on every layer the lock covers,
    /// mask when an uncovered layer still presents it.
    pub(crate) fn delete(self: &Arc<Self>, handle: &FileRef, lock: &HandleLock) -> VfsResult<()> {
        let path = handle.path();
        let Some(parent_path) = path.parent() else {
            return Err(VfsError::NotRoot);
        };
        self.verify_lock(handle, lock)?;

        self.begin_atomic();
        let result = (|| {
            let monitor = self.monitor(&parent_path);
            let _monitor = monitor.lock();

            let present = self.probe_present(&path);
            if present.is_empty() {
                return Err(VfsError::invalid(path.to_string()));
            }

            let mut needs_mask = false;
            for idx in present {
                if lock.inner.covers(idx) {
                    self.delegates[idx].delete(&path)?;
                } else {
                    needs_mask = true;
                }
            }

            if needs_mask {
                let target = self.create_writable_on(&path)?;
                self.mask_file(target, &path)?;
                // Masking may have materialized folders on the writable
                // layer; locked ancestors must follow.
                self.update_folders_lock(&parent_path)?;
            }

            self.invalidate_subtree(&path);
            self.invalidate_children_cache(&parent_path);
            self.batcher
                .emit(VfsEvent::new(path.clone(), EventKind::Deleted));
            debug!(path = %path, masked = needs_mask, "deleted");
            Ok(())
        })();
        self.finish_atomic();
        result
    }

    /// Rename within the parent folder.
    pub(crate) fn rename(
        self: &Arc<Self>,
        handle: &FileRef,
        lock: &HandleLock,
        name: &str,
        ext: &str,
    ) -> VfsResult<()> {
        let old_path = handle.path();
        let Some(parent_path) = old_path.parent() else {
            return Err(VfsError::NotRoot);
        };
        self.verify_lock(handle, lock)?;

        let is_folder = handle.is_folder();
        let composed = if is_folder {
            name.to_string()
        } else {
            child_name(name, Some(ext))
        };
        VfsPath::validate_name(&composed).map_err(|e| VfsError::invalid_name(e.to_string()))?;
        if composed == old_path.name_ext() {
            return Ok(());
        }
        let new_path = parent_path.join(&composed);
        let old_name = old_path.name().to_string();
        let old_ext = old_path.ext().to_string();

        self.begin_atomic();
        let result = (|| {
            let monitor = self.monitor(&parent_path);
            let _monitor = monitor.lock();

            if self.is_visible(&new_path) {
                return Err(VfsError::already_exists(new_path.to_string()));
            }

            let leader_idx = handle
                .inner
                .state
                .lock()
                .leader
                .ok_or_else(|| VfsError::invalid(old_path.to_string()))?;
            let target = self.create_writable_on(&new_path)?;

            // Attribute inheritance must survive the rename: snapshot the
            // merged view before layers shift.
            let attr_snapshot: Vec<(String, AttrValue)> = self
                .attr_names_at(&old_path)
                .into_iter()
                .filter_map(|n| self.get_attribute_at(&old_path, &n).map(|v| (n, v)))
                .collect();

            if target == leader_idx {
                self.delegates[target].rename(&old_path, &new_path)?;
                self.unmask_file_on_all(&new_path)?;
                lock.inner.retarget_rename(self, target, &new_path)?;
            } else {
                // The leader lives on another layer: rename lands on the
                // writable layer as a copy.
                if is_folder {
                    self.delegates[target].create_folder(&new_path)?;
                    self.copy_merged_tree(&old_path, target, &new_path)?;
                } else {
                    let data = self.delegates[leader_idx].read_all(&old_path)?;
                    self.delegates[target].create_data(&new_path)?;
                    self.delegates[target].write_all(&new_path, &data)?;
                }
                self.unmask_file_on_all(&new_path)?;
                lock.inner.change_locks(self, leader_idx, target, &new_path)?;
            }

            for (attr, value) in attr_snapshot {
                if self.delegates[target].read_attr(&new_path, &attr).as_ref() != Some(&value) {
                    self.delegates[target].write_attr(&new_path, &attr, Some(value))?;
                }
            }

            // An older version may still resolve under the old name on a
            // lower layer; hide it.
            if self.probe_present(&old_path).iter().any(|&i| i != target) {
                self.mask_file(target, &old_path)?;
                self.update_folders_lock(&parent_path)?;
            }

            self.rekey_subtree(&old_path, &new_path);
            self.invalidate_children_cache(&parent_path);
            let events = self.update_handle(&handle.inner);
            for e in events {
                self.batcher.emit(e);
            }

            self.batcher.emit(VfsEvent::new(
                new_path.clone(),
                EventKind::Renamed { old_name, old_ext },
            ));
            debug!(from = %old_path, to = %new_path, "renamed");
            Ok(())
        })();
        self.finish_atomic();
        result
    }

    /// Copy a file or merged folder tree into `target`.
    pub(crate) fn copy_tree(
        self: &Arc<Self>,
        src: &FileRef,
        target: &FileRef,
        name: &str,
        ext: &str,
    ) -> VfsResult<FileRef> {
        let src_path = src.path();
        let dst_parent = target.path();
        if !target.is_folder() {
            return Err(VfsError::not_a_folder(dst_parent.to_string()));
        }
        if dst_parent.starts_with(&src_path) && src.is_folder() {
            return Err(VfsError::invalid_name(format!(
                "cannot copy {src_path} into its own subtree"
            )));
        }
        let is_folder = src.is_folder();
        let composed = if is_folder {
            name.to_string()
        } else {
            child_name(name, Some(ext))
        };
        VfsPath::validate_name(&composed).map_err(|e| VfsError::invalid_name(e.to_string()))?;

        self.begin_atomic();
        let result = (|| {
            let monitor = self.monitor(&dst_parent);
            let _monitor = monitor.lock();
            let dst = dst_parent.join(&composed);
            if self.is_visible(&dst) {
                return Err(VfsError::already_exists(dst.to_string()));
            }
            let target_idx = self.create_writable_on(&dst)?;

            if is_folder {
                self.delegates[target_idx].create_folder(&dst)?;
                self.copy_merged_tree(&src_path, target_idx, &dst)?;
            } else {
                let leader = self
                    .leader_for(&src_path)
                    .ok_or_else(|| VfsError::invalid(src_path.to_string()))?;
                let data = self.delegates[leader].read_all(&src_path)?;
                self.delegates[target_idx].create_data(&dst)?;
                self.delegates[target_idx].write_all(&dst, &data)?;
                self.copy_merged_attrs(&src_path, target_idx, &dst)?;
            }
            self.unmask_file_on_all(&dst)?;

            self.invalidate_children_cache(&dst_parent);
            let inner = self.handle_at(&dst, Some(&target.inner));
            let kind = if is_folder {
                EventKind::FolderCreated
            } else {
                EventKind::DataCreated
            };
            self.batcher.emit(VfsEvent::new(dst, kind));
            Ok(self.file_ref(inner))
        })();
        self.finish_atomic();
        result
    }

    /// Recursive copy of the merged (mask-applied) view of `src` onto
    /// delegate `target_idx` at `dst`.
    fn copy_merged_tree(&self, src: &VfsPath, target_idx: usize, dst: &VfsPath) -> VfsResult<()> {
        self.copy_merged_attrs(src, target_idx, dst)?;
        for name in self.merged_children(src) {
            let child_src = src.join(&name);
            let child_dst = dst.join(&name);
            let Some(leader) = self.leader_for(&child_src) else {
                continue;
            };
            if self.delegates[leader].is_folder(&child_src) {
                self.delegates[target_idx].create_folder(&child_dst)?;
                self.copy_merged_tree(&child_src, target_idx, &child_dst)?;
            } else {
                let data = self.delegates[leader].read_all(&child_src)?;
                if !self.delegates[target_idx].exists(&child_dst) {
                    self.delegates[target_idx].create_data(&child_dst)?;
                }
                self.delegates[target_idx].write_all(&child_dst, &data)?;
                self.copy_merged_attrs(&child_src, target_idx, &child_dst)?;
            }
        }
        Ok(())
    }

    fn copy_merged_attrs(&self, src: &VfsPath, target_idx: usize, dst: &VfsPath) -> VfsResult<()> {
        for attr in self.attr_names_at(src) {
            if let Some(value) = self.get_attribute_at(src, &attr)
                && self.delegates[target_idx].read_attr(dst, &attr).as_ref() != Some(&value)
            {
                self.delegates[target_idx].write_attr(dst, &attr, Some(value))?;
            }
        }
        Ok(())
    }

    /// Open a handle for writing; migrates it to the writable layer first
    /// when the leader is elsewhere.
    pub(crate) fn open_write(
        self: &Arc<Self>,
        handle: &FileRef,
        lock: &HandleLock,
    ) -> VfsResult<Box<dyn Write + Send>> {
        self.verify_lock(handle, lock)?;
        // Content is about to be replaced wholesale; no need to copy it up.
        let idx = self.writable_migrate(&handle.inner, false)?;
        let path = handle.path();
        let inner_writer = self.delegates[idx].open_write(&path)?;
        Ok(Box::new(TrackedWriter {
            inner: inner_writer,
            fs: Arc::clone(self),
            handle: Arc::clone(&handle.inner),
            fired: false,
        }))
    }

    /// Ensure the handle's resource lives on the writable layer, copying
    /// content when asked, and re-target any outstanding lock. Returns the
    /// (possibly new) leader index.
    fn writable_migrate(&self, handle: &Arc<HandleInner>, copy_contents: bool) -> VfsResult<usize> {
        let mut state = handle.state.lock();
        if !state.valid {
            return Err(VfsError::invalid(state.path.to_string()));
        }
        let path = state.path.clone();
        let target = self.create_writable_on(&path)?;
        let Some(leader) = state.leader else {
            return Err(VfsError::invalid(path.to_string()));
        };
        if leader == target {
            return Ok(target);
        }

        if self.delegates[leader].is_folder(&path) {
            self.delegates[target].create_folder(&path)?;
        } else {
            if !self.delegates[target].exists(&path) {
                self.delegates[target].create_data(&path)?;
            }
            if copy_contents {
                let data = self.delegates[leader].read_all(&path)?;
                self.delegates[target].write_all(&path, &data)?;
            }
        }

        if let Some(lock) = state.live_lock() {
            lock.change_locks(self, leader, target, &path)?;
        }
        state.leader = Some(target);
        if !state.delegates.contains(&target) {
            state.delegates.push(target);
            state.delegates.sort_unstable();
        }
        Ok(target)
    }

    /// Walk ancestors and migrate any locked folder onto the writable
    /// layer; masking can materialize folders there and locks must follow.
    fn update_folders_lock(&self, folder: &VfsPath) -> VfsResult<()> {
        let mut current = Some(folder.clone());
        while let Some(path) = current {
            if let Some(handle) = self.registry.get(&path).and_then(|w| w.upgrade())
                && handle.state.lock().live_lock().is_some()
            {
                self.writable_migrate(&handle, true)?;
            }
            current = path.parent();
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Locks
    // ------------------------------------------------------------------

    /// Acquire the fan-out lock for a handle.
    pub(crate) fn lock_handle(self: &Arc<Self>, handle: &FileRef) -> VfsResult<HandleLock> {
        // Resolve freshly so the lock covers the current delegate set.
        let events = self.update_handle(&handle.inner);
        for e in events {
            self.batcher.emit(e);
        }

        let mut state = handle.inner.state.lock();
        if !state.valid {
            return Err(VfsError::invalid(state.path.to_string()));
        }
        if state.live_lock().is_some() {
            return Err(VfsError::already_locked(state.path.to_string()));
        }

        let path = state.path.clone();
        let lockable = self.create_locks_on(&path);
        let indices: Vec<usize> = state
            .delegates
            .iter()
            .copied()
            .filter(|i| lockable.contains(i))
            .collect();

        let lock_inner = LockInner::acquire(self, Arc::downgrade(&handle.inner), &path, &indices)?;
        state.lock = Some(Arc::downgrade(&lock_inner));
        Ok(HandleLock {
            fs: Arc::clone(self),
            inner: lock_inner,
        })
    }

    /// A structural mutation must present the handle's own live lock.
    fn verify_lock(&self, handle: &FileRef, lock: &HandleLock) -> VfsResult<()> {
        let state = handle.inner.state.lock();
        match state.live_lock() {
            Some(live) if Arc::ptr_eq(&live, &lock.inner) && !lock.inner.is_released() => Ok(()),
            _ => Err(VfsError::already_locked(format!(
                "{}: mutation without its active lock",
                state.path
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Refresh
    // ------------------------------------------------------------------

    /// Mark every handle at or under `path` invalid.
    fn invalidate_subtree(&self, path: &VfsPath) {
        let affected: Vec<Arc<HandleInner>> = self
            .registry
            .iter()
            .filter(|entry| entry.key().starts_with(path))
            .filter_map(|entry| entry.value().upgrade())
            .collect();
        for handle in affected {
            let mut state = handle.state.lock();
            state.valid = false;
            state.leader = None;
            state.delegates.clear();
            state.clear_caches();
        }
    }

    /// Rewrite handle paths after a folder rename.
    fn rekey_subtree(&self, old: &VfsPath, new: &VfsPath) {
        let moved: Vec<(VfsPath, Weak<HandleInner>)> = self
            .registry
            .iter()
            .filter(|entry| entry.key().starts_with(old))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        for (path, weak) in moved {
            self.registry.remove(&path);
            let Some(handle) = weak.upgrade() else {
                continue;
            };
            let suffix = path.as_str()[old.as_str().len()..].trim_start_matches('/');
            let new_path = if suffix.is_empty() {
                new.clone()
            } else {
                new.join_all(suffix)
            };
            handle.state.lock().path = new_path.clone();
            self.registry.insert(new_path, weak);
        }
    }

    /// Re-resolve one handle, diffing caches and firing events for what
    /// changed underneath.
    pub(crate) fn refresh_handle(self: &Arc<Self>, handle: &Arc<HandleInner>) {
        self.begin_atomic();

        let (path, was_valid, old_children, old_mtime, was_folder) = {
            let state = handle.state.lock();
            (
                state.path.clone(),
                state.valid,
                state.children.clone(),
                state.last_modified,
                state.is_folder,
            )
        };

        let events = self.update_handle(handle);
        for e in events {
            self.batcher.emit(e);
        }

        let mut state = handle.state.lock();
        if state.valid {
            if was_folder == Some(true) || (was_folder.is_none() && state.leader.is_some()) {
                let fresh = self.merged_children(&path);
                if let Some(old) = old_children {
                    for name in fresh.iter().filter(|n| !old.contains(n)) {
                        let child = path.join(name);
                        let kind = match self.leader_for(&child) {
                            Some(idx) if self.delegates[idx].is_folder(&child) => {
                                EventKind::FolderCreated
                            }
                            _ => EventKind::DataCreated,
                        };
                        self.batcher.emit(VfsEvent::new(child, kind));
                    }
                    for name in old.iter().filter(|n| !fresh.contains(n)) {
                        let child = path.join(name);
                        if let Some(stale) = self.registry.get(&child).and_then(|w| w.upgrade()) {
                            let mut child_state = stale.state.lock();
                            child_state.valid = false;
                            child_state.clear_caches();
                        }
                        self.batcher.emit(VfsEvent::new(child, EventKind::Deleted));
                    }
                }
                state.children = Some(fresh);
            } else if was_folder == Some(false)
                && let Some(leader) = state.leader
                && let Ok(stamp) = self.delegates[leader].last_modified(&path)
                && old_mtime.is_some()
                && old_mtime != Some(stamp)
            {
                state.last_modified = Some(stamp);
                self.batcher
                    .emit(VfsEvent::new(path.clone(), EventKind::Changed));
            }
        } else if was_valid {
            self.batcher
                .emit(VfsEvent::new(path.clone(), EventKind::Deleted));
        }
        drop(state);

        self.finish_atomic();
    }

    /// Refresh every live handle, parents before children.
    pub(crate) fn refresh_all(self: &Arc<Self>) {
        self.begin_atomic();
        let mut handles: Vec<Arc<HandleInner>> = self
            .registry
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .collect();
        handles.sort_by_key(|h| h.path().depth());
        for handle in handles {
            self.refresh_handle(&handle);
        }
        self.finish_atomic();
    }

    // ------------------------------------------------------------------
    // Revealed entries
    // ------------------------------------------------------------------

    fn revealed(&self, folder: &VfsPath) -> Vec<RevealedEntry> {
        let Some(writable) = self.writable_layer(folder) else {
            return Vec::new();
        };
        if !self.delegates[writable].is_folder(folder) {
            // No overrides: the containing folder was never materialized
            // on the writable layer.
            return Vec::new();
        }
        let Ok(names) = self.delegates[writable].children(folder) else {
            return Vec::new();
        };

        let mut out = Vec::new();
        for raw in names {
            let masked = is_mask_name(&raw);
            let base = if masked {
                masked_base(&raw).to_string()
            } else {
                raw.clone()
            };
            let hidden = folder.join(&base);
            for idx in 0..self.delegates.len() {
                if idx == writable {
                    continue;
                }
                if self.delegates[idx].exists(&hidden) {
                    out.push(RevealedEntry {
                        name: base,
                        layer: idx,
                        masked,
                    });
                    break;
                }
            }
        }
        out
    }

    fn restore(self: &Arc<Self>, folder: &VfsPath, name: &str) -> VfsResult<()> {
        let writable = self.create_writable_on(folder)?;
        let full = folder.join(name);
        let marker = mask_path(&full);

        self.begin_atomic();
        let result = (|| {
            let mut touched = false;
            if self.delegates[writable].exists(&marker) {
                self.delegates[writable].delete(&marker)?;
                touched = true;
            }
            if self.delegates[writable].exists(&full) {
                self.delegates[writable].delete(&full)?;
                touched = true;
            }
            if !touched {
                return Err(VfsError::not_found(full.to_string()));
            }
            self.invalidate_children_cache(folder);
            if let Some(handle) = self.registry.get(&full).and_then(|w| w.upgrade()) {
                let events = self.update_handle(&handle);
                for e in events {
                    self.batcher.emit(e);
                }
            }
            self.batcher
                .emit(VfsEvent::new(full.clone(), EventKind::Changed));
            Ok(())
        })();
        self.finish_atomic();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryBackend;
    use crate::events::VfsListener;
    use kasane_types::AttrValue;
    use parking_lot::Mutex as PlMutex;

    /// Records every event it sees.
    struct Recorder {
        events: Arc<PlMutex<Vec<VfsEvent>>>,
    }

    impl Recorder {
        fn new() -> (Arc<Self>, Arc<PlMutex<Vec<VfsEvent>>>) {
            let events = Arc::new(PlMutex::new(Vec::new()));
            (
                Arc::new(Recorder {
                    events: Arc::clone(&events),
                }),
                events,
            )
        }
    }

    impl VfsListener for Recorder {
        fn on_event(&self, event: &VfsEvent) {
            self.events.lock().push(event.clone());
        }
    }

    fn frozen(name: &str, files: &[(&str, &[u8])]) -> Arc<MemoryBackend> {
        let b = MemoryBackend::new(name);
        for (path, data) in files {
            b.put_file(path, data).unwrap();
        }
        b.set_read_only(true);
        Arc::new(b)
    }

    // ------------------------------------------------------------------
    // Leader election
    // ------------------------------------------------------------------

    #[test]
    fn test_leader_by_weight() {
        let a = MemoryBackend::new("a");
        a.put_file("pkg/x.txt", b"from-a").unwrap();
        a.put_attr("pkg/x.txt", "weight", AttrValue::Double(10.0)).unwrap();
        a.set_read_only(true);

        let b = MemoryBackend::new("b");
        b.put_file("pkg/x.txt", b"from-b").unwrap();
        b.put_attr("pkg/x.txt", "weight", AttrValue::Double(20.0)).unwrap();
        b.set_read_only(true);

        let fs = LayeredFs::new(vec![Arc::new(a), Arc::new(b)]);
        let f = fs.file("pkg/x.txt").unwrap();
        assert_eq!(f.read_all().unwrap(), b"from-b");

        // Idempotent: re-resolving with unchanged weights keeps the leader.
        f.refresh();
        assert_eq!(f.read_all().unwrap(), b"from-b");
    }

    #[test]
    fn test_leader_tie_prefers_first_registered() {
        let a = frozen("a", &[("pkg/x.txt", b"from-a")]);
        let b = frozen("b", &[("pkg/x.txt", b"from-b")]);

        let fs = LayeredFs::new(vec![a.clone(), b.clone()]);
        assert_eq!(fs.file("pkg/x.txt").unwrap().read_all().unwrap(), b"from-a");

        // Registration order decides, not any probing order.
        let fs2 = LayeredFs::new(vec![b, a]);
        assert_eq!(fs2.file("pkg/x.txt").unwrap().read_all().unwrap(), b"from-b");
    }

    #[test]
    fn test_writable_layer_always_wins() {
        let lower = frozen("lower", &[("pkg/x.txt", b"lower")]);
        // Huge stored weight on the lower layer still loses to the
        // designated writable layer.
        let upper = MemoryBackend::new("upper");
        upper.put_file("pkg/x.txt", b"upper").unwrap();

        let fs = LayeredFs::new(vec![Arc::new(upper), lower]);
        assert_eq!(fs.file("pkg/x.txt").unwrap().read_all().unwrap(), b"upper");
    }

    // ------------------------------------------------------------------
    // Children merge and masks
    // ------------------------------------------------------------------

    #[test]
    fn test_children_first_seen_order() {
        let upper = MemoryBackend::new("upper");
        upper.put_file("pkg/b.txt", b"").unwrap();
        upper.put_file("pkg/a.txt", b"").unwrap();
        let lower = frozen("lower", &[("pkg/a.txt", b""), ("pkg/c.txt", b"")]);

        let fs = LayeredFs::new(vec![Arc::new(upper), lower]);
        let names = fs.file("pkg").unwrap().child_names().unwrap();
        // Upper introduces a and b (its own sorted order), lower adds c;
        // the duplicate a keeps its first-seen position.
        assert_eq!(names, vec!["a.txt", "b.txt", "c.txt"]);
    }

    #[test]
    fn test_mask_hides_lower_layer_only() {
        let upper = MemoryBackend::new("upper");
        upper.put_file("pkg/a.txt_hidden", b"").unwrap();
        upper.put_file("pkg/b.txt", b"").unwrap();
        upper.put_file("pkg/b.txt_hidden", b"").unwrap();
        let lower = frozen("lower", &[("pkg/a.txt", b"")]);

        let fs = LayeredFs::new(vec![Arc::new(upper), lower]);
        // a.txt masked from the lower layer; b.txt survives its own
        // layer's mask.
        assert_eq!(fs.file("pkg").unwrap().child_names().unwrap(), vec!["b.txt"]);
        assert!(fs.file("pkg/a.txt").is_none());
        assert!(fs.file("pkg/b.txt").is_some());
    }

    #[test]
    fn test_propagate_masks_lists_markers() {
        let upper = MemoryBackend::new("upper");
        upper.put_file("pkg/a.txt_hidden", b"").unwrap();
        upper.put_file("pkg/b.txt", b"").unwrap();
        upper.put_file("pkg/b.txt_hidden", b"").unwrap();
        let lower = frozen("lower", &[("pkg/a.txt", b"")]);

        let fs = LayeredFs::builder()
            .delegate(Arc::new(upper))
            .delegate(lower)
            .propagate_masks(true)
            .build();

        let mut names = fs.file("pkg").unwrap().child_names().unwrap();
        names.sort();
        // Markers stay visible; every masked base name is swept, even the
        // same-layer b.txt.
        assert_eq!(names, vec!["a.txt_hidden", "b.txt_hidden"]);
    }

    #[test]
    fn test_mask_round_trip() {
        let lower = frozen("lower", &[("pkg/x.txt", b"lower")]);
        let upper = Arc::new(MemoryBackend::new("upper"));
        upper.put_file("pkg/x.txt", b"upper").unwrap();

        let fs = LayeredFs::new(vec![upper.clone(), lower]);
        let folder = fs.file("pkg").unwrap();
        assert_eq!(folder.child_names().unwrap(), vec!["x.txt"]);

        let f = fs.file("pkg/x.txt").unwrap();
        assert_eq!(f.read_all().unwrap(), b"upper");

        // Delete: the writable copy goes away directly, the read-only
        // lower copy forces a mask marker.
        let lock = f.lock().unwrap();
        f.delete(&lock).unwrap();
        drop(lock);

        let marker = VfsPath::parse("pkg/x.txt_hidden").unwrap();
        assert!(upper.exists(&marker));
        assert!(fs.file("pkg/x.txt").is_none());
        assert!(folder.child_names().unwrap().is_empty());
        assert!(!f.is_valid());

        // A fresh create drops the mask so resolution works normally again.
        let f2 = folder.create_data("x", "txt").unwrap();
        assert!(!upper.exists(&marker), "create unmasks");
        assert_eq!(folder.child_names().unwrap(), vec!["x.txt"]);
        assert_eq!(f2.read_all().unwrap(), b"");
    }

    // ------------------------------------------------------------------
    // Attributes
    // ------------------------------------------------------------------

    #[test]
    fn test_attribute_override_ordering() {
        let heavy = MemoryBackend::new("heavy");
        heavy.put_file("pkg/x.txt", b"").unwrap();
        heavy.put_attr("pkg/x.txt", "weight", AttrValue::Double(20.0)).unwrap();
        heavy.put_attr("pkg/x.txt", "color", AttrValue::Str("red".into())).unwrap();
        heavy.set_read_only(true);

        let light = MemoryBackend::new("light");
        light.put_file("pkg/x.txt", b"").unwrap();
        light.put_attr("pkg/x.txt", "weight", AttrValue::Double(10.0)).unwrap();
        light.put_attr("pkg/x.txt", "color", AttrValue::Str("green".into())).unwrap();
        light.set_read_only(true);

        // Registration order is light-first; weight still decides.
        let fs = LayeredFs::new(vec![Arc::new(light), Arc::new(heavy)]);
        let f = fs.file("pkg/x.txt").unwrap();
        assert_eq!(f.get_attribute("color"), Some(AttrValue::Str("red".into())));
    }

    #[test]
    fn test_attribute_override_scenario() {
        // Delegate A: read-only, holds /pkg/x.txt with color=red.
        let a = MemoryBackend::new("a");
        a.put_file("pkg/x.txt", b"content-a").unwrap();
        a.put_attr("pkg/x.txt", "color", AttrValue::Str("red".into())).unwrap();
        a.put_attr("pkg/x.txt", "weight", AttrValue::Double(10.0)).unwrap();
        a.set_read_only(true);
        let a = Arc::new(a);

        // Delegate B: writable front layer, no entry at /pkg/x.txt.
        let b = Arc::new(MemoryBackend::new("b"));

        let fs = LayeredFs::new(vec![b.clone(), a]);
        let f = fs.file("pkg/x.txt").unwrap();
        assert_eq!(f.read_all().unwrap(), b"content-a");
        assert_eq!(f.get_attribute("color"), Some(AttrValue::Str("red".into())));

        // Writing routes to B's root under the escaped-path key.
        f.set_attribute("color", Some(AttrValue::Str("blue".into()))).unwrap();
        assert_eq!(
            b.read_attr(&VfsPath::root(), "pkg\\x.txt\\color"),
            Some(AttrValue::Str("blue".into()))
        );

        // Immediately visible, no duplicated child, content untouched.
        assert_eq!(f.get_attribute("color"), Some(AttrValue::Str("blue".into())));
        assert_eq!(fs.file("pkg").unwrap().child_names().unwrap(), vec!["x.txt"]);
        assert_eq!(f.read_all().unwrap(), b"content-a");
    }

    #[test]
    fn test_void_tombstone_reads_as_absent() {
        let lower = MemoryBackend::new("lower");
        lower.put_file("pkg/x.txt", b"").unwrap();
        lower.put_attr("pkg/x.txt", "color", AttrValue::Str("red".into())).unwrap();
        lower.set_read_only(true);

        let upper = MemoryBackend::new("upper");
        upper.put_file("pkg/x.txt", b"").unwrap();
        upper.put_attr("pkg/x.txt", "color", AttrValue::Void { level: 0 }).unwrap();

        let fs = LayeredFs::new(vec![Arc::new(upper), Arc::new(lower)]);
        let f = fs.file("pkg/x.txt").unwrap();
        // The tombstone wins by weight and unwraps to "deliberately
        // absent" rather than falling through to red.
        assert_eq!(f.get_attribute("color"), None);
    }

    #[test]
    fn test_attr_names_include_prefixed_fallback() {
        let a = MemoryBackend::new("a");
        a.put_file("pkg/x.txt", b"").unwrap();
        a.put_attr("pkg/x.txt", "color", AttrValue::Str("red".into())).unwrap();
        a.set_read_only(true);
        let b = Arc::new(MemoryBackend::new("b"));

        let fs = LayeredFs::new(vec![b, Arc::new(a)]);
        let f = fs.file("pkg/x.txt").unwrap();
        f.set_attribute("position", Some(AttrValue::Int(3))).unwrap();

        let mut names = f.attr_names();
        names.sort();
        assert_eq!(names, vec!["color", "position", "weight"]);
    }

    #[test]
    fn test_unchanged_attribute_write_fires_nothing() {
        let upper = MemoryBackend::new("upper");
        upper.put_file("x.txt", b"").unwrap();
        let fs = LayeredFs::new(vec![Arc::new(upper)]);
        let f = fs.file("x.txt").unwrap();
        f.set_attribute("k", Some(AttrValue::Int(1))).unwrap();

        let (recorder, events) = Recorder::new();
        fs.add_listener(recorder);
        f.set_attribute("k", Some(AttrValue::Int(1))).unwrap();
        assert!(events.lock().is_empty());
    }

    // ------------------------------------------------------------------
    // Locks
    // ------------------------------------------------------------------

    #[test]
    fn test_lock_fan_out() {
        let w1 = Arc::new(MemoryBackend::new("w1"));
        w1.put_file("pkg/x.txt", b"one").unwrap();
        let w2 = Arc::new(MemoryBackend::new("w2"));
        w2.put_file("pkg/x.txt", b"two").unwrap();

        let fs = LayeredFs::new(vec![w1.clone(), w2.clone()]);
        let f = fs.file("pkg/x.txt").unwrap();

        let lock = f.lock().unwrap();
        assert_eq!(lock.delegate_count(), 2);
        assert!(f.is_locked());

        // A second lock fails and leaves the first untouched.
        assert!(matches!(f.lock(), Err(VfsError::AlreadyLocked(_))));
        assert_eq!(lock.delegate_count(), 2);

        lock.release();
        assert!(!f.is_locked());

        // Both backend locks really were released.
        let p = VfsPath::parse("pkg/x.txt").unwrap();
        let t1 = w1.lock(&p).unwrap();
        let t2 = w2.lock(&p).unwrap();
        w1.unlock(&p, t1);
        w2.unlock(&p, t2);
    }

    #[test]
    fn test_mutation_requires_own_lock() {
        let upper = Arc::new(MemoryBackend::new("upper"));
        upper.put_file("pkg/x.txt", b"").unwrap();
        upper.put_file("pkg/y.txt", b"").unwrap();
        let fs = LayeredFs::new(vec![upper]);

        let x = fs.file("pkg/x.txt").unwrap();
        let y = fs.file("pkg/y.txt").unwrap();
        let foreign = y.lock().unwrap();

        // A lock for another handle does not authorize this mutation.
        assert!(matches!(x.delete(&foreign), Err(VfsError::AlreadyLocked(_))));
        assert!(x.is_valid());
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    #[test]
    fn test_create_fires_exactly_one_event() {
        let upper = Arc::new(MemoryBackend::new("upper"));
        upper.put_file("pkg/seed.txt", b"").unwrap();
        let fs = LayeredFs::new(vec![upper]);

        let folder = fs.file("pkg").unwrap();
        let (recorder, events) = Recorder::new();
        folder.add_listener(recorder);

        folder.create_data("y", "txt").unwrap();

        let seen = events.lock().clone();
        let created: Vec<_> = seen
            .iter()
            .filter(|e| matches!(e.kind, EventKind::DataCreated))
            .collect();
        assert_eq!(created.len(), 1, "saw {seen:?}");
        assert_eq!(created[0].path.as_str(), "pkg/y.txt");
    }

    #[test]
    fn test_atomic_scope_batches_and_dedups() {
        let upper = Arc::new(MemoryBackend::new("upper"));
        let fs = LayeredFs::new(vec![upper]);
        let root = fs.root();

        let (recorder, events) = Recorder::new();
        fs.add_listener(recorder);

        fs.atomic(|| {
            root.create_data("a", "txt").unwrap();
            root.create_data("b", "txt").unwrap();
            assert!(events.lock().is_empty(), "suppressed inside the scope");
        });

        let seen = events.lock().clone();
        let created: Vec<&str> = seen
            .iter()
            .filter(|e| matches!(e.kind, EventKind::DataCreated))
            .map(|e| e.path.as_str())
            .collect();
        assert_eq!(created, vec!["a.txt", "b.txt"]);
    }

    #[test]
    fn test_rename_event_carries_old_name() {
        let upper = Arc::new(MemoryBackend::new("upper"));
        upper.put_file("pkg/old.txt", b"data").unwrap();
        let fs = LayeredFs::new(vec![upper]);

        let (recorder, events) = Recorder::new();
        fs.add_listener(recorder);

        let f = fs.file("pkg/old.txt").unwrap();
        let lock = f.lock().unwrap();
        f.rename(&lock, "new", "txt").unwrap();
        drop(lock);

        assert_eq!(f.path().as_str(), "pkg/new.txt");
        let seen = events.lock().clone();
        let renamed: Vec<_> = seen
            .iter()
            .filter_map(|e| match &e.kind {
                EventKind::Renamed { old_name, old_ext } => {
                    Some((e.path.as_str().to_string(), old_name.clone(), old_ext.clone()))
                }
                _ => None,
            })
            .collect();
        assert_eq!(
            renamed,
            vec![("pkg/new.txt".to_string(), "old".to_string(), "txt".to_string())]
        );
    }

    // ------------------------------------------------------------------
    // Structural operations across layers
    // ------------------------------------------------------------------

    #[test]
    fn test_masked_delete_scenario() {
        // Delegate A read-only with /pkg/x.txt; B writable and empty.
        let a = frozen("a", &[("pkg/x.txt", b"content-a")]);
        let b = Arc::new(MemoryBackend::new("b"));
        let fs = LayeredFs::new(vec![b.clone(), a]);

        let f = fs.file("pkg/x.txt").unwrap();
        let lock = f.lock().unwrap();
        // Nothing lockable presents the file; the lock is legitimately
        // empty.
        assert_eq!(lock.delegate_count(), 0);

        f.delete(&lock).unwrap();
        drop(lock);

        assert!(b.exists(&VfsPath::parse("pkg/x.txt_hidden").unwrap()));
        assert!(fs.file("pkg").unwrap().child_names().unwrap().is_empty());
        assert!(fs.file("pkg/x.txt").is_none());
    }

    #[test]
    fn test_rename_copies_up_and_masks_old_name() {
        let lower = frozen("lower", &[("pkg/old.txt", b"payload")]);
        let upper = Arc::new(MemoryBackend::new("upper"));
        let fs = LayeredFs::new(vec![upper.clone(), lower]);

        let f = fs.file("pkg/old.txt").unwrap();
        let lock = f.lock().unwrap();
        f.rename(&lock, "new", "txt").unwrap();

        // The rename landed on the writable layer as a copy, and the lock
        // now guards it there.
        assert_eq!(lock.delegate_count(), 1);
        drop(lock);

        assert_eq!(f.path().as_str(), "pkg/new.txt");
        assert_eq!(f.read_all().unwrap(), b"payload");
        assert!(upper.exists(&VfsPath::parse("pkg/old.txt_hidden").unwrap()));
        assert_eq!(fs.file("pkg").unwrap().child_names().unwrap(), vec!["new.txt"]);
        assert!(fs.file("pkg/old.txt").is_none());
    }

    #[test]
    fn test_write_migrates_to_writable_layer() {
        let lower = frozen("lower", &[("pkg/x.txt", b"original")]);
        let upper = Arc::new(MemoryBackend::new("upper"));
        let fs = LayeredFs::new(vec![upper.clone(), lower.clone()]);

        let f = fs.file("pkg/x.txt").unwrap();
        let lock = f.lock().unwrap();
        f.write_all(&lock, b"replaced").unwrap();
        drop(lock);

        assert_eq!(f.read_all().unwrap(), b"replaced");
        // The read-only layer is untouched; the override lives above it.
        let p = VfsPath::parse("pkg/x.txt").unwrap();
        assert_eq!(lower.read_all(&p).unwrap(), b"original");
        assert_eq!(upper.read_all(&p).unwrap(), b"replaced");
    }

    #[test]
    fn test_create_rejects_visible_duplicate() {
        let lower = frozen("lower", &[("pkg/x.txt", b"")]);
        let upper = Arc::new(MemoryBackend::new("upper"));
        let fs = LayeredFs::new(vec![upper, lower]);

        let folder = fs.file("pkg").unwrap();
        assert!(matches!(
            folder.create_data("x", "txt"),
            Err(VfsError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_create_folder_over_masked_folder_starts_empty() {
        let lower = frozen(
            "lower",
            &[("pkg/sub/inner.txt", b"old"), ("pkg/keep.txt", b"")],
        );
        let upper = Arc::new(MemoryBackend::new("upper"));
        let fs = LayeredFs::new(vec![upper.clone(), lower]);

        // Mask the folder away, then re-create it.
        let sub = fs.file("pkg/sub").unwrap();
        let lock = sub.lock().unwrap();
        sub.delete(&lock).unwrap();
        drop(lock);
        assert!(fs.file("pkg/sub").is_none());

        let folder = fs.file("pkg").unwrap();
        let fresh = folder.create_folder("sub").unwrap();
        // The lower layer's old content stays hidden behind child masks.
        assert!(fresh.child_names().unwrap().is_empty());
        assert!(fs.file("pkg/sub/inner.txt").is_none());
    }

    #[test]
    fn test_copy_and_move_between_folders() {
        let upper = Arc::new(MemoryBackend::new("upper"));
        upper.put_file("src/a.txt", b"payload").unwrap();
        upper.put_file("dst/seed.txt", b"").unwrap();
        let fs = LayeredFs::new(vec![upper]);

        let a = fs.file("src/a.txt").unwrap();
        a.set_attribute("color", Some(AttrValue::Str("red".into()))).unwrap();
        let dst = fs.file("dst").unwrap();

        let copied = a.copy_to(&dst, "a", "txt").unwrap();
        assert_eq!(copied.read_all().unwrap(), b"payload");
        assert_eq!(copied.get_attribute("color"), Some(AttrValue::Str("red".into())));
        assert!(fs.file("src/a.txt").is_some(), "copy leaves the source");

        let b = fs.file("src/a.txt").unwrap();
        let lock = b.lock().unwrap();
        let moved = b.move_to(&lock, &dst, "moved", "txt").unwrap();
        drop(lock);
        assert_eq!(moved.read_all().unwrap(), b"payload");
        assert!(fs.file("src/a.txt").is_none(), "move deletes the source");
    }

    // ------------------------------------------------------------------
    // Handle identity and lifecycle
    // ------------------------------------------------------------------

    #[test]
    fn test_handle_identity_per_path() {
        let upper = Arc::new(MemoryBackend::new("upper"));
        upper.put_file("pkg/x.txt", b"").unwrap();
        let fs = LayeredFs::new(vec![upper]);

        let f1 = fs.file("pkg/x.txt").unwrap();
        let f2 = fs.file("pkg/x.txt").unwrap();
        assert!(Arc::ptr_eq(&f1.inner, &f2.inner));

        // Once every strong reference is gone the registry entry is
        // reclaimed; the next lookup builds a fresh handle.
        let raw = Arc::as_ptr(&f1.inner) as usize;
        drop(f1);
        drop(f2);
        let f3 = fs.file("pkg/x.txt").unwrap();
        let _ = raw; // identity only matters while a strong ref lives
        assert!(f3.is_valid());
    }

    #[test]
    fn test_invalid_handle_not_resurrected() {
        let upper = Arc::new(MemoryBackend::new("upper"));
        upper.put_file("pkg/x.txt", b"").unwrap();
        let fs = LayeredFs::new(vec![upper.clone()]);

        let f = fs.file("pkg/x.txt").unwrap();
        let lock = f.lock().unwrap();
        f.delete(&lock).unwrap();
        drop(lock);
        assert!(!f.is_valid());

        // Recreate the same path; the old handle stays dead and the new
        // lookup yields a different, valid handle.
        fs.file("pkg").unwrap().create_data("x", "txt").unwrap();
        let fresh = fs.file("pkg/x.txt").unwrap();
        assert!(fresh.is_valid());
        assert!(!f.is_valid());
        assert!(!Arc::ptr_eq(&f.inner, &fresh.inner));
    }

    #[test]
    fn test_operations_on_invalid_handle_fail() {
        let upper = Arc::new(MemoryBackend::new("upper"));
        upper.put_file("x.txt", b"").unwrap();
        let fs = LayeredFs::new(vec![upper]);

        let f = fs.file("x.txt").unwrap();
        let lock = f.lock().unwrap();
        f.delete(&lock).unwrap();
        drop(lock);

        assert!(matches!(f.read_all(), Err(VfsError::Invalid(_))));
        assert!(matches!(f.lock(), Err(VfsError::Invalid(_))));
    }

    // ------------------------------------------------------------------
    // Revealed entries
    // ------------------------------------------------------------------

    #[test]
    fn test_revealed_and_restore() {
        let lower = frozen(
            "lower",
            &[("pkg/over.txt", b"lower-content"), ("pkg/gone.txt", b"ghost")],
        );
        let upper = Arc::new(MemoryBackend::new("upper"));
        upper.put_file("pkg/over.txt", b"upper-content").unwrap();
        upper.put_file("pkg/gone.txt_hidden", b"").unwrap();
        let fs = LayeredFs::new(vec![upper, lower]);

        let folder = fs.file("pkg").unwrap();
        let mut revealed = fs.revealed(&folder);
        revealed.sort_by(|x, y| x.name.cmp(&y.name));
        assert_eq!(
            revealed,
            vec![
                RevealedEntry { name: "gone.txt".into(), layer: 1, masked: true },
                RevealedEntry { name: "over.txt".into(), layer: 1, masked: false },
            ]
        );

        // Dropping the mask brings the ghost back.
        fs.restore(&folder, "gone.txt").unwrap();
        assert_eq!(fs.file("pkg/gone.txt").unwrap().read_all().unwrap(), b"ghost");

        // Dropping the override falls back to the lower layer's content.
        fs.restore(&folder, "over.txt").unwrap();
        assert_eq!(
            fs.file("pkg/over.txt").unwrap().read_all().unwrap(),
            b"lower-content"
        );
    }

    // ------------------------------------------------------------------
    // Disk-backed writable layer
    // ------------------------------------------------------------------

    #[test]
    fn test_disk_writable_layer_end_to_end() {
        use crate::backends::LocalBackend;

        let dir = tempfile::tempdir().unwrap();
        let disk = Arc::new(LocalBackend::new("disk", dir.path()).unwrap());
        let lower = frozen("lower", &[("pkg/x.txt", b"lower")]);
        let fs = LayeredFs::new(vec![disk.clone(), lower]);

        // Attribute override for a file the disk layer never materializes
        // lands in the root sidecar.
        let f = fs.file("pkg/x.txt").unwrap();
        f.set_attribute("color", Some(AttrValue::Str("blue".into()))).unwrap();
        assert_eq!(f.get_attribute("color"), Some(AttrValue::Str("blue".into())));
        assert!(
            dir.path().join(crate::attrstore::SIDECAR_NAME).exists(),
            "override persisted in the root sidecar"
        );

        // Content writes migrate the file onto disk.
        let lock = f.lock().unwrap();
        f.write_all(&lock, b"edited").unwrap();
        drop(lock);
        assert_eq!(f.read_all().unwrap(), b"edited");
        assert!(dir.path().join("pkg/x.txt").exists());

        // Deleting leaves the read-only copy behind a mask marker on disk.
        let f = fs.file("pkg/x.txt").unwrap();
        let lock = f.lock().unwrap();
        f.delete(&lock).unwrap();
        drop(lock);
        assert!(dir.path().join("pkg/x.txt_hidden").exists());
        assert!(fs.file("pkg/x.txt").is_none());
    }
}
