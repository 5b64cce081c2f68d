//! Cross-layer attribute merge.
//!
//! Reads scan delegates in registration order and keep the
//! highest-weight non-null hit; a void tombstone participates like any
//! value and unwraps to "deliberately absent" at the end. Besides the
//! attribute stored on the file itself, a layer may answer from its
//! *root* under a prefixed key — `path\with\backslashes\attrName` — which
//! lets a thin writable front layer annotate files it never materializes.
//!
//! Writes route to the writable layer, falling back to the root-prefix
//! key when the file does not exist there, and fire as if set on the
//! real handle.

use std::sync::Arc;

use indexmap::IndexSet;
use kasane_types::{AttrValue, VfsPath, devoidify, voidify};

use crate::error::VfsResult;
use crate::events::{EventKind, VfsEvent};
use crate::layered::FsInner;
use crate::layered::handle::HandleInner;
use crate::layered::resolve::WEIGHT_ATTR;

/// Attribute names exempt from weight ordering: first hit in layer order
/// wins. Weight itself must be readable without recursing into weights.
const SPECIAL_ATTR_NAMES: &[&str] = &[WEIGHT_ATTR];

/// The root-fallback key for (`path`, `name`): path with separators
/// flipped to backslashes, then the attribute name.
pub(crate) fn prefix_key(path: &VfsPath, name: &str) -> String {
    format!("{}\\{}", path.as_str().replace('/', "\\"), name)
}

impl FsInner {
    /// Layered attribute read through a handle, with the hot one-entry
    /// cache.
    pub(crate) fn get_attribute(&self, handle: &Arc<HandleInner>, name: &str) -> Option<AttrValue> {
        let (path, cached) = {
            let state = handle.state.lock();
            (state.path.clone(), state.attr_cache.clone())
        };

        // Root attributes never use backslashes directly; such names are
        // reserved for the prefix-fallback encoding.
        if path.is_root() && name.contains('\\') {
            return None;
        }

        let prefixed = (!path.is_root()).then(|| prefix_key(&path, name));

        // Hot path: the delegate that answered the last query usually
        // answers the next one too.
        if let Some((idx, cached_name)) = cached
            && cached_name == name
            && idx < self.delegates.len()
        {
            if let Some(pk) = &prefixed
                && (!self.delegates[idx].read_only()
                    || self.can_have_root_attr_on_read_only(pk))
                && let Some(v) = self.delegates[idx].read_attr(&VfsPath::root(), pk)
            {
                return devoidify(v);
            }
            if let Some(v) = self.delegates[idx].read_attr(&path, name) {
                return devoidify(v);
            }
        }

        let (best, best_idx) = self.scan_attribute(&path, name);
        if let Some(idx) = best_idx {
            handle.state.lock().attr_cache = Some((idx, name.to_string()));
        }
        best.and_then(devoidify)
    }

    /// Layered attribute read by path, no handle cache involved.
    pub(crate) fn get_attribute_at(&self, path: &VfsPath, name: &str) -> Option<AttrValue> {
        if path.is_root() && name.contains('\\') {
            return None;
        }
        self.scan_attribute(path, name).0.and_then(devoidify)
    }

    /// The weight-ordered scan over delegates: direct attribute plus the
    /// root-prefix fallback. Returns the raw (not yet devoidified) winner
    /// and the delegate that provided it.
    fn scan_attribute(&self, path: &VfsPath, name: &str) -> (Option<AttrValue>, Option<usize>) {
        let special = SPECIAL_ATTR_NAMES.contains(&name);
        let writable = self.writable_layer(path);
        let root = VfsPath::root();
        let prefixed = (!path.is_root()).then(|| prefix_key(path, name));

        let mut best: Option<AttrValue> = None;
        let mut best_idx: Option<usize> = None;
        let mut max_weight = 0.0f64;

        for idx in 0..self.delegates.len() {
            if self.delegates[idx].exists(path)
                && let Some(v) = self.delegates[idx].read_attr(path, name)
            {
                if special {
                    return (Some(v), Some(idx));
                }
                let weight = self.weight_of(idx, path, writable);
                if best.is_none() || weight > max_weight {
                    best = Some(v);
                    best_idx = Some(idx);
                    max_weight = weight;
                }
            }

            if let Some(pk) = &prefixed
                && (!self.delegates[idx].read_only()
                    || self.can_have_root_attr_on_read_only(pk))
                && let Some(v) = self.delegates[idx].read_attr(&root, pk)
            {
                let weight = self.weight_of(idx, &root, writable);
                if best.is_none() || weight > max_weight {
                    best = Some(v);
                    best_idx = Some(idx);
                    max_weight = weight;
                }
            }
        }

        (best, best_idx)
    }

    /// Layered attribute write.
    pub(crate) fn set_attribute(
        self: &Arc<Self>,
        handle: &Arc<HandleInner>,
        name: &str,
        value: Option<AttrValue>,
    ) -> VfsResult<()> {
        let path = handle.path();
        let target_idx = self.create_writable_on(&path)?;

        let old = self.get_attribute(handle, name);
        if old == value {
            // Unchanged writes are skipped entirely: no store touch, no
            // event.
            return Ok(());
        }

        self.begin_atomic();
        let result = (|| {
            let delegate = &self.delegates[target_idx];
            let (target_path, key) = if delegate.exists(&path) {
                (path.clone(), name.to_string())
            } else {
                // Thin-overlay fallback: annotate the unmaterialized file
                // from the layer root.
                (VfsPath::root(), prefix_key(&path, name))
            };

            match &value {
                Some(v) => {
                    delegate.write_attr(&target_path, &key, Some(voidify(Some(v.clone()))))?;
                }
                None => {
                    delegate.write_attr(&target_path, &key, None)?;
                    // If the delegate still reports a value (it is itself
                    // layered), a tombstone is needed to mask it.
                    if delegate.read_attr(&target_path, &key).is_some() {
                        delegate.write_attr(&target_path, &key, Some(voidify(None)))?;
                    }
                }
            }

            handle.state.lock().attr_cache = Some((target_idx, name.to_string()));

            self.batcher.emit(VfsEvent::new(
                path.clone(),
                EventKind::AttributeChanged {
                    name: name.to_string(),
                    old,
                    new: value.clone(),
                },
            ));
            Ok(())
        })();
        self.finish_atomic();
        result
    }

    /// Merged attribute-name enumeration for a handle.
    pub(crate) fn attr_names(&self, handle: &Arc<HandleInner>) -> Vec<String> {
        self.attr_names_at(&handle.path())
    }

    /// Merged attribute-name enumeration across delegates, including
    /// root-prefixed names translated back to their plain form.
    pub(crate) fn attr_names_at(&self, path: &VfsPath) -> Vec<String> {
        let root = VfsPath::root();
        let prefix = (!path.is_root()).then(|| format!("{}\\", path.as_str().replace('/', "\\")));

        let mut out: IndexSet<String> = IndexSet::new();
        for delegate in &self.delegates {
            if delegate.exists(path) {
                for name in delegate.attr_names(path) {
                    // Prefixed keys live on roots only; skip them when
                    // enumerating the root itself.
                    if path.is_root() && name.contains('\\') {
                        continue;
                    }
                    out.insert(name);
                }
            }
            if let Some(prefix) = &prefix {
                for name in delegate.attr_names(&root) {
                    if let Some(rest) = name.strip_prefix(prefix.as_str())
                        && !rest.contains('\\')
                    {
                        out.insert(rest.to_string());
                    }
                }
            }
        }
        out.into_iter().collect()
    }
}
