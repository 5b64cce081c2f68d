//! # kasane-vfs
//!
//! Layered overlay virtual filesystem.
//!
//! A [`LayeredFs`] composites an ordered stack of delegate backends into
//! one logical tree:
//!
//! - per path, the delegate set is resolved and a **leader** elected by
//!   weight (the writable front layer always wins); content operations
//!   proxy to the leader while lower layers contribute attributes;
//! - a tombstone file (`<name>_hidden`) on a writable layer **masks** a
//!   lower layer's resource;
//! - attribute reads merge across layers with void tombstones for
//!   "deliberately cleared"; a thin front layer can annotate files it
//!   never materializes via root-prefixed keys;
//! - locks fan out across every lockable layer presenting the path and
//!   follow the leader when it migrates;
//! - structural changes batch their events per atomic action and deliver
//!   each logical change exactly once.
//!
//! ```
//! use std::sync::Arc;
//! use kasane_types::AttrValue;
//! use kasane_vfs::{LayeredFs, backends::MemoryBackend};
//!
//! let lower = Arc::new(MemoryBackend::new("base"));
//! lower.put_file("pkg/x.txt", b"from base").unwrap();
//! lower.set_read_only(true);
//! let upper = Arc::new(MemoryBackend::new("writable"));
//!
//! let fs = LayeredFs::new(vec![upper, lower]);
//! let file = fs.file("pkg/x.txt").unwrap();
//! assert_eq!(file.read_all().unwrap(), b"from base");
//! file.set_attribute("color", Some(AttrValue::Str("blue".into()))).unwrap();
//! ```

pub mod attrstore;
pub mod backend;
pub mod backends;
pub mod error;
pub mod events;
pub mod global;
pub mod layered;
pub mod watch;

// Re-export primary types at crate root for convenience.
pub use backend::{Backend, BackendLock};
pub use error::{VfsError, VfsResult};
pub use events::{EventKind, ListenerId, VfsEvent, VfsListener};
pub use layered::{
    FileRef, HandleLock, LayeredFs, LayeredFsBuilder, MASK_SUFFIX, RevealedEntry, WEIGHT_ATTR,
};
pub use watch::Watcher;
