//! Per-path resolution: delegate probing, weight evaluation, leader
//! election, and the masked children merge.
//!
//! The rules here are the contract of the whole engine:
//!
//! - Delegates are probed in fixed registration order; the leader is the
//!   strict-maximum weight, so the first-registered delegate wins ties.
//! - The designated writable layer always wins (infinite weight).
//! - A mask marker (`<name>_hidden`) on layer *i* hides `name` on layers
//!   *i+1..*, never on layer *i* itself. Once excluded, a name stays
//!   excluded for the rest of the scan.

use std::collections::HashSet;
use std::sync::Arc;

use indexmap::IndexSet;
use kasane_types::VfsPath;
use tracing::warn;

use crate::events::{EventKind, VfsEvent};
use crate::layered::FsInner;
use crate::layered::handle::HandleInner;

/// Attribute holding a delegate-assigned numeric priority.
pub const WEIGHT_ATTR: &str = "weight";

/// Reserved suffix marking a tombstone on a writable layer.
pub const MASK_SUFFIX: &str = "_hidden";

/// True for mask marker names.
pub fn is_mask_name(name: &str) -> bool {
    name.ends_with(MASK_SUFFIX)
}

/// The base name a mask marker hides.
pub fn masked_base(name: &str) -> &str {
    &name[..name.len() - MASK_SUFFIX.len()]
}

/// The mask marker path for a logical path.
pub fn mask_path(path: &VfsPath) -> VfsPath {
    path.with_name_ext(&format!("{}{}", path.name_ext(), MASK_SUFFIX))
}

impl FsInner {
    /// Weight of delegate `idx` presenting `path`, given the writable
    /// layer for that path.
    pub(crate) fn weight_of(&self, idx: usize, path: &VfsPath, writable: Option<usize>) -> f64 {
        if writable == Some(idx) {
            return f64::INFINITY;
        }
        // Probing the weight attribute on a read-only root is costly and
        // almost never meaningful; require explicit opt-in.
        if path.is_root()
            && self.delegates[idx].read_only()
            && !self.can_have_root_attr_on_read_only(WEIGHT_ATTR)
        {
            return 0.0;
        }
        match self.delegates[idx].read_attr(path, WEIGHT_ATTR) {
            None => 0.0,
            Some(v) => match v.as_f64() {
                Some(w) => w,
                None => {
                    warn!(
                        path = %path,
                        delegate = self.delegates[idx].name(),
                        value = %v,
                        "nonnumeric weight attribute, counting as 0"
                    );
                    0.0
                }
            },
        }
    }

    /// Recompute the delegate set and leader for one handle.
    ///
    /// Returns events to emit after the caller releases the state lock. A
    /// leader change fires `Changed` for a still-valid data file and
    /// re-targets any outstanding lock; an emptied delegate set
    /// invalidates the handle.
    pub(crate) fn update_handle(&self, handle: &Arc<HandleInner>) -> Vec<VfsEvent> {
        let mut events = Vec::new();
        let mut state = handle.state.lock();
        let path = state.path.clone();
        let writable = self.writable_layer(&path);

        let mut present = Vec::new();
        let mut leader: Option<usize> = None;
        let mut max_weight = 0.0f64;

        for idx in 0..self.delegates.len() {
            if !self.delegates[idx].exists(&path) {
                continue;
            }
            present.push(idx);
            let weight = self.weight_of(idx, &path, writable);
            if leader.is_none() || weight > max_weight {
                leader = Some(idx);
                max_weight = weight;
            }
        }

        if let (Some(new_leader), Some(old_leader)) = (leader, state.leader)
            && new_leader != old_leader
        {
            let is_data = match state.is_folder {
                Some(folder) => !folder,
                // Folder-ness is uniform across layers; the new leader
                // answers when nothing was cached yet.
                None => !self.delegates[new_leader].is_folder(&path),
            };
            if is_data && state.valid {
                events.push(VfsEvent::new(path.clone(), EventKind::Changed));
            }
            // Migration: an outstanding lock follows the leader.
            if let Some(lock) = state.live_lock()
                && let Err(e) = lock.change_locks(self, old_leader, new_leader, &path)
            {
                warn!(path = %path, error = %e, "lock re-target failed during leader migration");
            }
        }

        if let Some(led) = leader {
            state.leader = Some(led);
        }
        if present.is_empty() {
            state.valid = false;
            state.leader = None;
        }
        state.delegates = present;
        state.clear_caches();
        events
    }

    /// Union of children across delegates, masks applied.
    ///
    /// First-seen order: the first delegate that introduces a name fixes
    /// its position. A mask found at one layer excludes that base name
    /// from all later layers; with `propagate_masks` the markers
    /// themselves stay listed but every masked base name is swept out at
    /// the end, same-layer or not.
    pub(crate) fn merged_children(&self, path: &VfsPath) -> Vec<String> {
        let mut out: IndexSet<String> = IndexSet::new();
        let mut exclude: HashSet<String> = HashSet::new();
        let mut all_masked: HashSet<String> = HashSet::new();

        for delegate in &self.delegates {
            if !delegate.is_folder(path) {
                continue;
            }
            let Ok(names) = delegate.children(path) else {
                continue;
            };
            // Masks found at this layer only take effect from the next
            // layer on.
            let mut local: Option<HashSet<String>> = None;
            for name in names {
                if is_mask_name(&name) {
                    let base = masked_base(&name).to_string();
                    local
                        .get_or_insert_with(|| exclude.clone())
                        .insert(base.clone());
                    all_masked.insert(base);
                    if !self.propagate_masks {
                        continue;
                    }
                }
                if !exclude.contains(&name) {
                    out.insert(name);
                }
            }
            if let Some(local) = local {
                exclude = local;
            }
        }

        if self.propagate_masks {
            out.retain(|name| !all_masked.contains(name));
        }

        out.into_iter().collect()
    }

    /// Is the resource at `path` visible through the mask rules?
    ///
    /// Present at layer `p`, first mask at layer `m`: visible iff `p <= m`
    /// (the masking layer's own entry survives its own mask). With
    /// `propagate_masks`, any mask hides the name outright.
    pub(crate) fn is_visible(&self, path: &VfsPath) -> bool {
        if path.is_root() {
            return true;
        }
        let marker = mask_path(path);
        let mut present_at: Option<usize> = None;
        let mut mask_at: Option<usize> = None;
        for (idx, delegate) in self.delegates.iter().enumerate() {
            if present_at.is_none() && delegate.exists(path) {
                present_at = Some(idx);
            }
            if mask_at.is_none() && delegate.exists(&marker) {
                mask_at = Some(idx);
            }
            if present_at.is_some() && mask_at.is_some() {
                break;
            }
        }
        match (present_at, mask_at) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(p), Some(m)) => {
                if self.propagate_masks {
                    false
                } else {
                    p <= m
                }
            }
        }
    }

    /// Is every prefix of `path` visible? A masked ancestor folder hides
    /// the whole subtree.
    pub(crate) fn is_reachable(&self, path: &VfsPath) -> bool {
        let mut current = VfsPath::root();
        for comp in path.components() {
            current = current.join(comp);
            // Mask markers are not addressable unless masks propagate.
            if is_mask_name(comp) && !self.propagate_masks {
                return false;
            }
            if !self.is_visible(&current) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_name_helpers() {
        assert!(is_mask_name("x.txt_hidden"));
        assert!(!is_mask_name("x.txt"));
        assert_eq!(masked_base("x.txt_hidden"), "x.txt");

        let p = VfsPath::parse("pkg/x.txt").unwrap();
        assert_eq!(mask_path(&p).as_str(), "pkg/x.txt_hidden");
    }
}
