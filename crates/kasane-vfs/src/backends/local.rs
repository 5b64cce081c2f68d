//! Local filesystem delegate backend.
//!
//! Maps the logical namespace onto a host directory. Data and folders go
//! through `std::fs`; attributes live in the per-folder sidecar store. The
//! sidecar files themselves never appear in listings.

use std::fs;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::SystemTime;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use kasane_types::{AttrValue, VfsPath};

use crate::attrstore::{self, FolderAttrStore};
use crate::backend::{Backend, BackendLock};
use crate::error::{VfsError, VfsResult};

/// Disk-directory backend.
pub struct LocalBackend {
    name: String,
    root: PathBuf,
    attrs: FolderAttrStore,
    read_only: AtomicBool,
    revision: AtomicU64,
    lock_ids: AtomicU64,
    locks: DashMap<VfsPath, u64>,
}

impl LocalBackend {
    /// Create a backend over `root`, creating the directory if missing.
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> VfsResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            name: name.into(),
            attrs: FolderAttrStore::new(&root),
            root,
            read_only: AtomicBool::new(false),
            revision: AtomicU64::new(0),
            lock_ids: AtomicU64::new(1),
            locks: DashMap::new(),
        })
    }

    /// Flip the read-only flag.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    /// The attribute store, for transient-name registration.
    pub fn attr_store(&self) -> &FolderAttrStore {
        &self.attrs
    }

    fn host_path(&self, path: &VfsPath) -> PathBuf {
        let mut p = self.root.clone();
        for comp in path.components() {
            p.push(comp);
        }
        p
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
}

impl Backend for LocalBackend {
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
        self.host_path(path).exists()
    }

    fn is_folder(&self, path: &VfsPath) -> bool {
        self.host_path(path).is_dir()
    }

    fn children(&self, path: &VfsPath) -> VfsResult<Vec<String>> {
        let host = self.host_path(path);
        if !host.is_dir() {
            return if host.exists() {
                Err(VfsError::not_a_folder(path.to_string()))
            } else {
                Err(VfsError::not_found(path.to_string()))
            };
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&host)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if attrstore::is_sidecar(&name) {
                continue;
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }

    fn last_modified(&self, path: &VfsPath) -> VfsResult<SystemTime> {
        Ok(fs::metadata(self.host_path(path))?.modified()?)
    }

    fn size(&self, path: &VfsPath) -> VfsResult<u64> {
        let meta = fs::metadata(self.host_path(path))?;
        Ok(if meta.is_dir() { 0 } else { meta.len() })
    }

    fn open_read(&self, path: &VfsPath) -> VfsResult<Box<dyn Read + Send>> {
        let file = fs::File::open(self.host_path(path))?;
        Ok(Box::new(file))
    }

    fn open_write(&self, path: &VfsPath) -> VfsResult<Box<dyn Write + Send>> {
        self.check_writable()?;
        let file = fs::File::create(self.host_path(path))?;
        self.bump();
        Ok(Box::new(file))
    }

    fn create_folder(&self, path: &VfsPath) -> VfsResult<()> {
        self.check_writable()?;
        let host = self.host_path(path);
        if host.is_file() {
            return Err(VfsError::already_exists(path.to_string()));
        }
        fs::create_dir_all(&host)?;
        self.bump();
        Ok(())
    }

    fn create_data(&self, path: &VfsPath) -> VfsResult<()> {
        self.check_writable()?;
        let host = self.host_path(path);
        if host.exists() {
            return Err(VfsError::already_exists(path.to_string()));
        }
        if let Some(dir) = host.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::File::create_new(&host)?;
        self.bump();
        Ok(())
    }

    fn rename(&self, from: &VfsPath, to: &VfsPath) -> VfsResult<()> {
        self.check_writable()?;
        let from_host = self.host_path(from);
        if !from_host.exists() {
            return Err(VfsError::not_found(from.to_string()));
        }
        fs::rename(&from_host, self.host_path(to))?;
        self.attrs.rename(from, to)?;
        self.bump();
        Ok(())
    }

    fn delete(&self, path: &VfsPath) -> VfsResult<()> {
        self.check_writable()?;
        let host = self.host_path(path);
        if host.is_dir() {
            fs::remove_dir_all(&host)?;
        } else if host.exists() {
            fs::remove_file(&host)?;
        } else {
            return Err(VfsError::not_found(path.to_string()));
        }
        self.attrs.delete(path)?;
        self.bump();
        Ok(())
    }

    fn lock(&self, path: &VfsPath) -> VfsResult<BackendLock> {
        let id = self.lock_ids.fetch_add(1, Ordering::SeqCst);
        match self.locks.entry(path.clone()) {
            Entry::Occupied(_) => Err(VfsError::already_locked(path.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(id);
                Ok(BackendLock::new(id))
            }
        }
    }

    fn unlock(&self, path: &VfsPath, lock: BackendLock) {
        self.locks
            .remove_if(path, |_, held| *held == lock.id());
    }

    fn read_attr(&self, path: &VfsPath, name: &str) -> Option<AttrValue> {
        self.attrs.read(path, name)
    }

    fn write_attr(&self, path: &VfsPath, name: &str, value: Option<AttrValue>) -> VfsResult<()> {
        self.check_writable()?;
        self.attrs.write(path, name, value)?;
        self.bump();
        Ok(())
    }

    fn attr_names(&self, path: &VfsPath) -> Vec<String> {
        self.attrs.names(path)
    }
}
