//! Per-folder attribute persistence.
//!
//! Each folder of a disk-backed delegate owns a sidecar document mapping
//! `file base name -> attribute name -> value`. The sidecar is hidden from
//! listings (see [`SIDECAR_NAME`]).
//!
//! Two on-disk forms are understood:
//! - the textual form: a serde_json document with a `version` field and an
//!   entry per file, an attribute per entry — the only form ever written;
//! - a legacy binary form, sniffed by its 4-byte magic, read for backward
//!   compatibility and migrated to the textual form on the next save.
//!
//! Writes are optimistic: a writer snapshots the table and its version,
//! recomputes, and commits only if the version is unchanged; otherwise the
//! whole read-modify-write restarts. The retry loop is unbounded (real
//! contention is rare); only the file commit itself — temp write then
//! atomic rename — has a bounded retry before the I/O error surfaces.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use kasane_types::{AttrValue, VfsPath};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{VfsError, VfsResult};

/// Sidecar file name inside each folder.
pub const SIDECAR_NAME: &str = ".kasane-attrs";

/// Magic prefix of the legacy binary sidecar form.
pub const LEGACY_MAGIC: [u8; 4] = *b"KSAT";

/// Current textual format version.
const FORMAT_VERSION: u32 = 1;

/// Retry budget for the final rename step of a commit. A concurrent reader
/// elsewhere may briefly hold the destination open.
const COMMIT_RETRIES: u32 = 10;

/// How many folder tables the soft cache retains.
const CACHE_CAPACITY: usize = 64;

/// The persisted document: one entry per file base name, one attribute per
/// entry element.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AttrDocument {
    pub version: u32,
    #[serde(default)]
    pub files: BTreeMap<String, BTreeMap<String, AttrValue>>,
}

impl AttrDocument {
    fn is_empty(&self) -> bool {
        self.files.values().all(|t| t.is_empty())
    }
}

/// An immutable snapshot of one folder's table, tagged with the optimistic
/// version it was read at.
struct CachedTable {
    doc: AttrDocument,
    version: u64,
}

/// Attribute store for one delegate rooted at a host directory.
pub struct FolderAttrStore {
    root: PathBuf,
    /// Soft-retention cache of folder tables; evicted entries reload from
    /// disk on demand.
    cache: Mutex<LruCache<VfsPath, Arc<CachedTable>>>,
    /// Authoritative per-folder version counters; survive cache eviction.
    versions: DashMap<VfsPath, u64>,
    /// Per-folder commit serialization.
    commit_locks: DashMap<VfsPath, Arc<Mutex<()>>>,
    /// Attribute names that do not survive rename/copy.
    transient: Mutex<HashSet<String>>,
    tmp_ids: AtomicU64,
    #[cfg(test)]
    forced_collisions: AtomicU64,
}

impl FolderAttrStore {
    /// Create a store rooted at a host directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(CACHE_CAPACITY).expect("nonzero capacity"),
            )),
            versions: DashMap::new(),
            commit_locks: DashMap::new(),
            transient: Mutex::new(HashSet::new()),
            tmp_ids: AtomicU64::new(0),
            #[cfg(test)]
            forced_collisions: AtomicU64::new(0),
        }
    }

    /// Mark an attribute name as transient: stripped on rename.
    pub fn mark_transient(&self, name: impl Into<String>) {
        self.transient.lock().insert(name.into());
    }

    /// Read one attribute of `path`.
    pub fn read(&self, path: &VfsPath, attr: &str) -> Option<AttrValue> {
        let folder = path.parent()?;
        let table = self.load(&folder);
        table.doc.files.get(path.name_ext())?.get(attr).cloned()
    }

    /// All attribute names set on `path`.
    pub fn names(&self, path: &VfsPath) -> Vec<String> {
        let Some(folder) = path.parent() else {
            return Vec::new();
        };
        let table = self.load(&folder);
        table
            .doc
            .files
            .get(path.name_ext())
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Write one attribute of `path`; `None` clears it.
    pub fn write(&self, path: &VfsPath, attr: &str, value: Option<AttrValue>) -> VfsResult<()> {
        let folder = path
            .parent()
            .ok_or_else(|| VfsError::invalid_name("root has no attribute table"))?;
        let base = path.name_ext().to_string();
        self.modify(&folder, |doc| {
            let table = doc.files.entry(base.clone()).or_default();
            let changed = match &value {
                Some(v) => table.insert(attr.to_string(), v.clone()).as_ref() != Some(v),
                None => table.remove(attr).is_some(),
            };
            if table.is_empty() {
                doc.files.remove(&base);
            }
            changed
        })
    }

    /// Move the attribute sub-map from one name to another within the same
    /// folder, stripping transient attributes.
    pub fn rename(&self, from: &VfsPath, to: &VfsPath) -> VfsResult<()> {
        let folder = from
            .parent()
            .ok_or_else(|| VfsError::invalid_name("root cannot be renamed"))?;
        debug_assert_eq!(to.parent().as_ref(), Some(&folder));
        let from_base = from.name_ext().to_string();
        let to_base = to.name_ext().to_string();
        let transient = self.transient.lock().clone();
        self.modify(&folder, |doc| {
            let Some(mut table) = doc.files.remove(&from_base) else {
                return false;
            };
            table.retain(|name, _| !transient.contains(name));
            if !table.is_empty() {
                doc.files.insert(to_base.clone(), table);
            }
            true
        })
    }

    /// Drop the attribute sub-map for `path`, persisting only if present.
    pub fn delete(&self, path: &VfsPath) -> VfsResult<()> {
        let Some(folder) = path.parent() else {
            return Ok(());
        };
        let base = path.name_ext().to_string();
        self.modify(&folder, |doc| doc.files.remove(&base).is_some())
    }

    // -- internals -----------------------------------------------------------

    /// Optimistic read-modify-write. `mutate` returns whether anything
    /// changed; unchanged tables are not persisted.
    fn modify<F>(&self, folder: &VfsPath, mutate: F) -> VfsResult<()>
    where
        F: Fn(&mut AttrDocument) -> bool,
    {
        loop {
            let snapshot = self.load(folder);
            let mut doc = snapshot.doc.clone();
            if !mutate(&mut doc) {
                return Ok(());
            }
            if self.commit(folder, doc, snapshot.version)? {
                return Ok(());
            }
            // Version moved underneath us; drop the snapshot we read from
            // and restart the whole cycle against fresh state.
            self.cache.lock().pop(folder);
        }
    }

    /// Fetch the folder table, from cache or disk.
    ///
    /// The version is snapshotted *before* the disk read and the insert is
    /// put-if-absent, so a racing commit can never be clobbered by a stale
    /// table; at worst the stale snapshot loses its CAS and the writer
    /// retries.
    fn load(&self, folder: &VfsPath) -> Arc<CachedTable> {
        if let Some(hit) = self.cache.lock().get(folder) {
            return Arc::clone(hit);
        }
        let version = self.versions.get(folder).map(|v| *v).unwrap_or(0);
        let doc = self.load_from_disk(folder);
        let mut cache = self.cache.lock();
        Arc::clone(cache.get_or_insert(folder.clone(), || Arc::new(CachedTable { doc, version })))
    }

    fn sidecar_path(&self, folder: &VfsPath) -> PathBuf {
        let mut p = self.root.clone();
        for comp in folder.components() {
            p.push(comp);
        }
        p.push(SIDECAR_NAME);
        p
    }

    fn load_from_disk(&self, folder: &VfsPath) -> AttrDocument {
        let path = self.sidecar_path(folder);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return AttrDocument::default(),
            Err(e) => {
                warn!(folder = %folder, error = %e, "failed reading attribute sidecar");
                return AttrDocument::default();
            }
        };
        decode_document(&bytes).unwrap_or_else(|e| {
            warn!(folder = %folder, error = %e, "undecodable attribute sidecar, treating as empty");
            AttrDocument::default()
        })
    }

    /// Commit a new table if the folder version is still `expected`.
    /// Returns false when the version moved (caller restarts).
    fn commit(&self, folder: &VfsPath, doc: AttrDocument, expected: u64) -> VfsResult<bool> {
        let lock = self
            .commit_locks
            .entry(folder.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock();

        #[cfg(test)]
        if self
            .forced_collisions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            self.versions
                .entry(folder.clone())
                .and_modify(|v| *v += 1)
                .or_insert(1);
            self.cache.lock().pop(folder);
            return Ok(false);
        }

        let current = self.versions.get(folder).map(|v| *v).unwrap_or(0);
        if current != expected {
            return Ok(false);
        }

        self.persist(folder, &doc)?;

        let next = current + 1;
        self.versions.insert(folder.clone(), next);
        self.cache
            .lock()
            .put(folder.clone(), Arc::new(CachedTable { doc, version: next }));
        Ok(true)
    }

    /// Write the sidecar: temp file, then atomic rename with bounded retry.
    /// An empty document removes the sidecar instead.
    fn persist(&self, folder: &VfsPath, doc: &AttrDocument) -> VfsResult<()> {
        let target = self.sidecar_path(folder);

        if doc.is_empty() {
            match fs::remove_file(&target) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
                Err(e) => return Err(VfsError::persistence(folder.to_string(), e)),
            }
        }

        if let Some(dir) = target.parent() {
            fs::create_dir_all(dir).map_err(|e| VfsError::persistence(folder.to_string(), e))?;
        }

        let tmp = target.with_file_name(format!(
            "{}.tmp{}",
            SIDECAR_NAME,
            self.tmp_ids.fetch_add(1, Ordering::SeqCst)
        ));
        let json = serde_json::to_vec_pretty(doc)
            .map_err(|e| VfsError::persistence(folder.to_string(), io::Error::other(e)))?;

        if let Err(e) = fs::write(&tmp, &json) {
            let _ = fs::remove_file(&tmp);
            return Err(VfsError::persistence(folder.to_string(), e));
        }

        let mut last_err = None;
        for _ in 0..COMMIT_RETRIES {
            match fs::rename(&tmp, &target) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    last_err = Some(e);
                    std::thread::sleep(std::time::Duration::from_millis(5));
                }
            }
        }

        let _ = fs::remove_file(&tmp);
        Err(VfsError::persistence(
            folder.to_string(),
            last_err.unwrap_or_else(|| io::Error::other("rename retries exhausted")),
        ))
    }

    #[cfg(test)]
    fn force_collisions(&self, n: u64) {
        self.forced_collisions.store(n, Ordering::SeqCst);
    }
}

/// Decode a sidecar payload, sniffing the legacy binary magic.
fn decode_document(bytes: &[u8]) -> Result<AttrDocument, String> {
    if bytes.len() >= 4 && bytes[..4] == LEGACY_MAGIC {
        let mut doc: AttrDocument =
            postcard::from_bytes(&bytes[4..]).map_err(|e| format!("legacy form: {e}"))?;
        doc.version = FORMAT_VERSION;
        return Ok(doc);
    }
    serde_json::from_slice(bytes).map_err(|e| format!("textual form: {e}"))
}

/// Encode the legacy binary form. Only used by tests and migration tooling;
/// the store itself never writes this.
pub fn encode_legacy(doc: &AttrDocument) -> Vec<u8> {
    let mut out = LEGACY_MAGIC.to_vec();
    out.extend(postcard::to_stdvec(doc).expect("postcard encoding of a plain document"));
    out
}

/// True if a child name is the attribute sidecar (excluded from listings).
pub fn is_sidecar(name: &str) -> bool {
    name == SIDECAR_NAME || name.starts_with(&format!("{SIDECAR_NAME}.tmp"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> VfsPath {
        VfsPath::parse(s).unwrap()
    }

    #[test]
    fn test_write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FolderAttrStore::new(dir.path());

        store
            .write(&p("pkg/x.txt"), "color", Some(AttrValue::Str("red".into())))
            .unwrap();
        assert_eq!(
            store.read(&p("pkg/x.txt"), "color"),
            Some(AttrValue::Str("red".into()))
        );

        // A second store over the same root sees the persisted value.
        let fresh = FolderAttrStore::new(dir.path());
        assert_eq!(
            fresh.read(&p("pkg/x.txt"), "color"),
            Some(AttrValue::Str("red".into()))
        );
    }

    #[test]
    fn test_clear_removes_and_prunes_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let store = FolderAttrStore::new(dir.path());

        store
            .write(&p("a.txt"), "k", Some(AttrValue::Int(1)))
            .unwrap();
        let sidecar = dir.path().join(SIDECAR_NAME);
        assert!(sidecar.exists());

        store.write(&p("a.txt"), "k", None).unwrap();
        assert_eq!(store.read(&p("a.txt"), "k"), None);
        assert!(!sidecar.exists(), "empty table removes the sidecar");
    }

    #[test]
    fn test_unchanged_write_does_not_touch_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = FolderAttrStore::new(dir.path());
        store
            .write(&p("a.txt"), "k", Some(AttrValue::Int(1)))
            .unwrap();
        let mtime = fs::metadata(dir.path().join(SIDECAR_NAME))
            .unwrap()
            .modified()
            .unwrap();

        // Deleting attributes of a file that has none persists nothing.
        store.delete(&p("other.txt")).unwrap();
        let mtime2 = fs::metadata(dir.path().join(SIDECAR_NAME))
            .unwrap()
            .modified()
            .unwrap();
        assert_eq!(mtime, mtime2);
    }

    #[test]
    fn test_rename_strips_transient() {
        let dir = tempfile::tempdir().unwrap();
        let store = FolderAttrStore::new(dir.path());
        store.mark_transient("wizard.state");

        store
            .write(&p("old.txt"), "color", Some(AttrValue::Str("red".into())))
            .unwrap();
        store
            .write(&p("old.txt"), "wizard.state", Some(AttrValue::Int(3)))
            .unwrap();

        store.rename(&p("old.txt"), &p("new.txt")).unwrap();

        assert_eq!(store.read(&p("old.txt"), "color"), None);
        assert_eq!(
            store.read(&p("new.txt"), "color"),
            Some(AttrValue::Str("red".into()))
        );
        assert_eq!(store.read(&p("new.txt"), "wizard.state"), None);
    }

    #[test]
    fn test_legacy_binary_sniff_and_migration() {
        let dir = tempfile::tempdir().unwrap();

        let mut doc = AttrDocument::default();
        doc.files
            .entry("x.txt".into())
            .or_default()
            .insert("color".into(), AttrValue::Str("red".into()));
        fs::write(dir.path().join(SIDECAR_NAME), encode_legacy(&doc)).unwrap();

        let store = FolderAttrStore::new(dir.path());
        assert_eq!(
            store.read(&p("x.txt"), "color"),
            Some(AttrValue::Str("red".into()))
        );

        // Any save rewrites in the textual form.
        store
            .write(&p("x.txt"), "size", Some(AttrValue::Int(2)))
            .unwrap();
        let bytes = fs::read(dir.path().join(SIDECAR_NAME)).unwrap();
        assert_ne!(&bytes[..4], &LEGACY_MAGIC);
        serde_json::from_slice::<AttrDocument>(&bytes).expect("textual form");
    }

    #[test]
    fn test_corrupt_sidecar_degrades_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(SIDECAR_NAME), b"{ not json").unwrap();

        let store = FolderAttrStore::new(dir.path());
        assert_eq!(store.read(&p("x.txt"), "color"), None);
    }

    #[test]
    fn test_optimistic_retry_after_forced_collision() {
        let dir = tempfile::tempdir().unwrap();
        let store = FolderAttrStore::new(dir.path());
        store
            .write(&p("x.txt"), "a", Some(AttrValue::Int(1)))
            .unwrap();

        // The next two commit attempts observe a moved version.
        store.force_collisions(2);
        store
            .write(&p("x.txt"), "b", Some(AttrValue::Int(2)))
            .unwrap();

        assert_eq!(store.read(&p("x.txt"), "a"), Some(AttrValue::Int(1)));
        assert_eq!(store.read(&p("x.txt"), "b"), Some(AttrValue::Int(2)));
    }

    #[test]
    fn test_concurrent_writers_both_survive() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FolderAttrStore::new(dir.path()));
        store
            .write(&p("x.txt"), "seed", Some(AttrValue::Int(0)))
            .unwrap();

        let a = Arc::clone(&store);
        let b = Arc::clone(&store);
        let ta = std::thread::spawn(move || {
            for i in 0..20 {
                a.write(&p("x.txt"), "left", Some(AttrValue::Int(i))).unwrap();
            }
        });
        let tb = std::thread::spawn(move || {
            for i in 0..20 {
                b.write(&p("x.txt"), "right", Some(AttrValue::Int(i))).unwrap();
            }
        });
        ta.join().unwrap();
        tb.join().unwrap();

        // Neither writer's final update was lost.
        assert_eq!(store.read(&p("x.txt"), "left"), Some(AttrValue::Int(19)));
        assert_eq!(store.read(&p("x.txt"), "right"), Some(AttrValue::Int(19)));
    }
}
