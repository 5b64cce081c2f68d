//! In-memory delegate backend.
//!
//! Used for scratch layers and testing. All data is ephemeral. The backend
//! can be frozen read-only after seeding, which is how tests model a
//! read-only lower layer.

use std::collections::HashMap;
use std::io::{Cursor, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::SystemTime;

use kasane_types::{AttrValue, VfsPath};
use parking_lot::RwLock;

use crate::backend::{Backend, BackendLock};
use crate::error::{VfsError, VfsResult};

/// Entry in the memory tree.
#[derive(Debug, Clone)]
enum Entry {
    File { data: Vec<u8>, mtime: SystemTime },
    Folder { mtime: SystemTime },
}

#[derive(Default)]
struct Inner {
    entries: HashMap<VfsPath, Entry>,
    attrs: HashMap<VfsPath, HashMap<String, AttrValue>>,
    locks: HashMap<VfsPath, u64>,
}

/// In-memory backend. Thread-safe via an internal `RwLock`; the state is
/// `Arc`-shared so open writers stay valid independent of the borrow.
pub struct MemoryBackend {
    name: String,
    read_only: AtomicBool,
    revision: Arc<AtomicU64>,
    lock_ids: AtomicU64,
    inner: Arc<RwLock<Inner>>,
}

impl MemoryBackend {
    /// Create an empty, writable memory backend.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            read_only: AtomicBool::new(false),
            revision: Arc::new(AtomicU64::new(0)),
            lock_ids: AtomicU64::new(1),
            inner: Arc::new(RwLock::new(Inner::default())),
        }
    }

    /// Flip the read-only flag. Tests seed a layer, then freeze it.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    fn bump(&self) {
        self.revision.fetch_add(1, Ordering::SeqCst);
    }

    fn check_writable(&self) -> VfsResult<()> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(VfsError::read_only(self.name.clone()));
        }
        Ok(())
    }

    /// Ensure all parent folders of `path` exist.
    fn ensure_parents(inner: &mut Inner, path: &VfsPath) {
        let mut current = VfsPath::root();
        let mut components: Vec<&str> = path.components().collect();
        components.pop(); // the entry itself
        for comp in components {
            current = current.join(comp);
            inner.entries.entry(current.clone()).or_insert(Entry::Folder {
                mtime: SystemTime::now(),
            });
        }
    }

    /// Seed helper: create a data file with contents in one call.
    pub fn put_file(&self, path: &str, data: &[u8]) -> VfsResult<()> {
        let path = VfsPath::parse(path).map_err(|e| VfsError::invalid_name(e.to_string()))?;
        self.check_writable()?;
        let mut inner = self.inner.write();
        Self::ensure_parents(&mut inner, &path);
        inner.entries.insert(
            path,
            Entry::File {
                data: data.to_vec(),
                mtime: SystemTime::now(),
            },
        );
        drop(inner);
        self.bump();
        Ok(())
    }

    /// Seed helper: set an attribute in one call.
    pub fn put_attr(&self, path: &str, name: &str, value: AttrValue) -> VfsResult<()> {
        let path = VfsPath::parse(path).map_err(|e| VfsError::invalid_name(e.to_string()))?;
        self.write_attr(&path, name, Some(value))
    }
}

impl Backend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    fn exists(&self, path: &VfsPath) -> bool {
        path.is_root() || self.inner.read().entries.contains_key(path)
    }

    fn is_folder(&self, path: &VfsPath) -> bool {
        if path.is_root() {
            return true;
        }
        matches!(self.inner.read().entries.get(path), Some(Entry::Folder { .. }))
    }

    fn children(&self, path: &VfsPath) -> VfsResult<Vec<String>> {
        let inner = self.inner.read();
        if !path.is_root() {
            match inner.entries.get(path) {
                Some(Entry::Folder { .. }) => {}
                Some(_) => return Err(VfsError::not_a_folder(path.to_string())),
                None => return Err(VfsError::not_found(path.to_string())),
            }
        }
        let mut names: Vec<String> = inner
            .entries
            .keys()
            .filter(|p| p.parent().as_ref() == Some(path))
            .map(|p| p.name_ext().to_string())
            .collect();
        // Deterministic order within the layer.
        names.sort();
        Ok(names)
    }

    fn last_modified(&self, path: &VfsPath) -> VfsResult<SystemTime> {
        if path.is_root() {
            return Ok(SystemTime::UNIX_EPOCH);
        }
        match self.inner.read().entries.get(path) {
            Some(Entry::File { mtime, .. }) | Some(Entry::Folder { mtime }) => Ok(*mtime),
            None => Err(VfsError::not_found(path.to_string())),
        }
    }

    fn size(&self, path: &VfsPath) -> VfsResult<u64> {
        match self.inner.read().entries.get(path) {
            Some(Entry::File { data, .. }) => Ok(data.len() as u64),
            Some(Entry::Folder { .. }) => Ok(0),
            None if path.is_root() => Ok(0),
            None => Err(VfsError::not_found(path.to_string())),
        }
    }

    fn open_read(&self, path: &VfsPath) -> VfsResult<Box<dyn Read + Send>> {
        match self.inner.read().entries.get(path) {
            Some(Entry::File { data, .. }) => Ok(Box::new(Cursor::new(data.clone()))),
            Some(Entry::Folder { .. }) => Err(VfsError::not_found(format!(
                "{path} is a folder, not readable"
            ))),
            None => Err(VfsError::not_found(path.to_string())),
        }
    }

    fn open_write(&self, path: &VfsPath) -> VfsResult<Box<dyn Write + Send>> {
        self.check_writable()?;
        if !matches!(self.inner.read().entries.get(path), Some(Entry::File { .. })) {
            return Err(VfsError::not_found(path.to_string()));
        }
        Ok(Box::new(MemoryWriter {
            path: path.clone(),
            inner: Arc::clone(&self.inner),
            revision: Arc::clone(&self.revision),
            buf: Vec::new(),
            committed: false,
        }))
    }

    fn create_folder(&self, path: &VfsPath) -> VfsResult<()> {
        self.check_writable()?;
        if path.is_root() {
            return Ok(());
        }
        let mut inner = self.inner.write();
        if let Some(existing) = inner.entries.get(path) {
            return match existing {
                Entry::Folder { .. } => Ok(()),
                Entry::File { .. } => Err(VfsError::already_exists(path.to_string())),
            };
        }
        Self::ensure_parents(&mut inner, path);
        inner.entries.insert(
            path.clone(),
            Entry::Folder {
                mtime: SystemTime::now(),
            },
        );
        drop(inner);
        self.bump();
        Ok(())
    }

    fn create_data(&self, path: &VfsPath) -> VfsResult<()> {
        self.check_writable()?;
        let mut inner = self.inner.write();
        if inner.entries.contains_key(path) {
            return Err(VfsError::already_exists(path.to_string()));
        }
        Self::ensure_parents(&mut inner, path);
        inner.entries.insert(
            path.clone(),
            Entry::File {
                data: Vec::new(),
                mtime: SystemTime::now(),
            },
        );
        drop(inner);
        self.bump();
        Ok(())
    }

    fn rename(&self, from: &VfsPath, to: &VfsPath) -> VfsResult<()> {
        self.check_writable()?;
        let mut inner = self.inner.write();
        let entry = inner
            .entries
            .remove(from)
            .ok_or_else(|| VfsError::not_found(from.to_string()))?;

        // Folders carry their subtree along.
        if matches!(entry, Entry::Folder { .. }) {
            let moved: Vec<VfsPath> = inner
                .entries
                .keys()
                .filter(|p| p.starts_with(from))
                .cloned()
                .collect();
            for old in moved {
                if let Some(child) = inner.entries.remove(&old) {
                    let suffix = old.as_str()[from.as_str().len()..].trim_start_matches('/');
                    let new_path = VfsPath::parse(&format!("{}/{}", to.as_str(), suffix))
                        .expect("rename target stays well-formed");
                    if let Some(attrs) = inner.attrs.remove(&old) {
                        inner.attrs.insert(new_path.clone(), attrs);
                    }
                    inner.entries.insert(new_path, child);
                }
            }
        }

        if let Some(attrs) = inner.attrs.remove(from) {
            inner.attrs.insert(to.clone(), attrs);
        }
        inner.entries.insert(to.clone(), entry);
        drop(inner);
        self.bump();
        Ok(())
    }

    fn delete(&self, path: &VfsPath) -> VfsResult<()> {
        self.check_writable()?;
        let mut inner = self.inner.write();
        if !inner.entries.contains_key(path) {
            return Err(VfsError::not_found(path.to_string()));
        }
        inner.entries.retain(|p, _| !p.starts_with(path));
        inner.attrs.retain(|p, _| !p.starts_with(path));
        drop(inner);
        self.bump();
        Ok(())
    }

    fn lock(&self, path: &VfsPath) -> VfsResult<BackendLock> {
        let mut inner = self.inner.write();
        if inner.locks.contains_key(path) {
            return Err(VfsError::already_locked(path.to_string()));
        }
        let id = self.lock_ids.fetch_add(1, Ordering::SeqCst);
        inner.locks.insert(path.clone(), id);
        Ok(BackendLock::new(id))
    }

    fn unlock(&self, path: &VfsPath, lock: BackendLock) {
        let mut inner = self.inner.write();
        if inner.locks.get(path) == Some(&lock.id()) {
            inner.locks.remove(path);
        }
    }

    fn read_attr(&self, path: &VfsPath, name: &str) -> Option<AttrValue> {
        self.inner.read().attrs.get(path)?.get(name).cloned()
    }

    fn write_attr(&self, path: &VfsPath, name: &str, value: Option<AttrValue>) -> VfsResult<()> {
        self.check_writable()?;
        let mut inner = self.inner.write();
        if !path.is_root() && !inner.entries.contains_key(path) {
            return Err(VfsError::not_found(path.to_string()));
        }
        match value {
            Some(v) => {
                inner
                    .attrs
                    .entry(path.clone())
                    .or_default()
                    .insert(name.to_string(), v);
            }
            None => {
                if let Some(table) = inner.attrs.get_mut(path) {
                    table.remove(name);
                    if table.is_empty() {
                        inner.attrs.remove(path);
                    }
                }
            }
        }
        drop(inner);
        self.bump();
        Ok(())
    }

    fn attr_names(&self, path: &VfsPath) -> Vec<String> {
        let inner = self.inner.read();
        let mut names: Vec<String> = inner
            .attrs
            .get(path)
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}

/// Buffered writer handed out by `open_write`; commits the buffer to the
/// entry on flush (and on drop, if never flushed).
struct MemoryWriter {
    path: VfsPath,
    inner: Arc<RwLock<Inner>>,
    revision: Arc<AtomicU64>,
    buf: Vec<u8>,
    committed: bool,
}

impl MemoryWriter {
    fn commit(&mut self) {
        let mut inner = self.inner.write();
        if let Some(Entry::File { data, mtime }) = inner.entries.get_mut(&self.path) {
            *data = self.buf.clone();
            *mtime = SystemTime::now();
        }
        drop(inner);
        self.revision.fetch_add(1, Ordering::SeqCst);
        self.committed = true;
    }
}

impl Write for MemoryWriter {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(data);
        self.committed = false;
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.commit();
        Ok(())
    }
}

impl Drop for MemoryWriter {
    fn drop(&mut self) {
        if !self.committed {
            self.commit();
        }
    }
}
