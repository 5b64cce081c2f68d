//! Change events, listeners, and atomic-action batching.
//!
//! Every structural change produces exactly one logical event. During an
//! atomic action (see [`crate::LayeredFs::begin_atomic`]) events are not
//! delivered immediately: they collect in a queue, are collapsed by
//! `(path, kind)` keeping the first occurrence, and flush in original
//! order when the outermost scope finishes.
//!
//! Delivery order is contractual: priority listeners (internal
//! bookkeeping) before ordinary ones, and within each class listeners
//! registered directly on the affected path before recursive ancestor
//! registrations, before filesystem-level registrations.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;
use kasane_types::{AttrValue, VfsPath};
use parking_lot::{Mutex, RwLock};

/// What happened.
#[derive(Clone, Debug, PartialEq)]
pub enum EventKind {
    /// A folder child was created.
    FolderCreated,
    /// A data child was created.
    DataCreated,
    /// File content changed (including leader migration of a data file).
    Changed,
    /// The resource was deleted or masked away.
    Deleted,
    /// Renamed within its parent; carries the old name and extension.
    Renamed { old_name: String, old_ext: String },
    /// An attribute changed value.
    AttributeChanged {
        name: String,
        old: Option<AttrValue>,
        new: Option<AttrValue>,
    },
}

impl EventKind {
    /// Stable label used for `(path, kind)` dedup during batching.
    fn label(&self) -> &'static str {
        match self {
            EventKind::FolderCreated => "folder-created",
            EventKind::DataCreated => "data-created",
            EventKind::Changed => "changed",
            EventKind::Deleted => "deleted",
            EventKind::Renamed { .. } => "renamed",
            EventKind::AttributeChanged { .. } => "attribute-changed",
        }
    }
}

/// One change notification.
#[derive(Clone, Debug)]
pub struct VfsEvent {
    /// The affected logical path (post-change path for renames).
    pub path: VfsPath,
    pub kind: EventKind,
}

impl VfsEvent {
    pub fn new(path: VfsPath, kind: EventKind) -> Self {
        Self { path, kind }
    }
}

/// Receiver of change notifications.
pub trait VfsListener: Send + Sync {
    fn on_event(&self, event: &VfsEvent);
}

impl<F: Fn(&VfsEvent) + Send + Sync> VfsListener for F {
    fn on_event(&self, event: &VfsEvent) {
        self(event)
    }
}

/// Handle for removing a registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Registration {
    id: ListenerId,
    /// `None` registers at filesystem level (sees everything).
    path: Option<VfsPath>,
    /// Also fire for descendants of `path`.
    recursive: bool,
    /// Internal bookkeeping listeners run before external ones.
    priority: bool,
    listener: Arc<dyn VfsListener>,
}

/// All listener registrations of one composite filesystem.
#[derive(Default)]
pub struct ListenerRegistry {
    regs: RwLock<Vec<Registration>>,
    ids: AtomicU64,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. `path = None` means filesystem-level.
    pub fn add(
        &self,
        path: Option<VfsPath>,
        recursive: bool,
        priority: bool,
        listener: Arc<dyn VfsListener>,
    ) -> ListenerId {
        let id = ListenerId(self.ids.fetch_add(1, Ordering::SeqCst));
        self.regs.write().push(Registration {
            id,
            path,
            recursive,
            priority,
            listener,
        });
        id
    }

    /// Remove a registration; unknown ids are ignored.
    pub fn remove(&self, id: ListenerId) {
        self.regs.write().retain(|r| r.id != id);
    }

    /// Deliver one event to every matching listener, in contract order.
    ///
    /// A direct registration on a path hears events for that path and for
    /// its immediate children (a folder listener observes child creation);
    /// recursive registrations hear the whole subtree.
    pub fn dispatch(&self, event: &VfsEvent) {
        // Scope rank: 0 direct, 1 recursive ancestor, 2 filesystem.
        let matching: Vec<(u8, bool, Arc<dyn VfsListener>)> = {
            let regs = self.regs.read();
            regs.iter()
                .filter_map(|r| {
                    let scope = match &r.path {
                        None => 2,
                        Some(p) if *p == event.path || event.path.parent().as_ref() == Some(p) => 0,
                        Some(p) if r.recursive && event.path.starts_with(p) => 1,
                        Some(_) => return None,
                    };
                    Some((scope, r.priority, Arc::clone(&r.listener)))
                })
                .collect()
        };

        for want_priority in [true, false] {
            for scope in 0..=2u8 {
                for (s, priority, listener) in &matching {
                    if *s == scope && *priority == want_priority {
                        listener.on_event(event);
                    }
                }
            }
        }
    }
}

#[derive(Default)]
struct BatchState {
    depth: usize,
    /// First occurrence per `(path, kind)` wins; insertion order is flush
    /// order.
    queue: IndexMap<(VfsPath, &'static str), VfsEvent>,
}

/// Event queue scoped to the atomic-action boundary.
pub struct EventBatcher {
    registry: Arc<ListenerRegistry>,
    state: Mutex<BatchState>,
}

impl EventBatcher {
    pub fn new(registry: Arc<ListenerRegistry>) -> Self {
        Self {
            registry,
            state: Mutex::new(BatchState::default()),
        }
    }

    /// Enter an atomic scope. Reentrant: nested scopes collapse to the
    /// outermost.
    pub fn begin(&self) {
        self.state.lock().depth += 1;
    }

    /// Leave an atomic scope; the outermost finish flushes the queue.
    /// Events queued by committed sub-steps flush even when a later step
    /// failed — partial success stays visible.
    pub fn finish(&self) {
        let to_flush = {
            let mut state = self.state.lock();
            debug_assert!(state.depth > 0, "finish without begin");
            state.depth = state.depth.saturating_sub(1);
            if state.depth > 0 {
                return;
            }
            std::mem::take(&mut state.queue)
        };
        for (_, event) in to_flush {
            self.registry.dispatch(&event);
        }
    }

    /// Emit one event: queued inside a scope, delivered immediately
    /// outside one.
    pub fn emit(&self, event: VfsEvent) {
        {
            let mut state = self.state.lock();
            if state.depth > 0 {
                let key = (event.path.clone(), event.kind.label());
                state.queue.entry(key).or_insert(event);
                return;
            }
        }
        self.registry.dispatch(&event);
    }

    pub fn registry(&self) -> &Arc<ListenerRegistry> {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    /// Listener that records a tag per delivery into a shared log.
    struct Recorder {
        tag: &'static str,
        log: Arc<PlMutex<Vec<String>>>,
    }

    impl VfsListener for Recorder {
        fn on_event(&self, event: &VfsEvent) {
            self.log
                .lock()
                .push(format!("{}:{}", self.tag, event.path));
        }
    }

    fn p(s: &str) -> VfsPath {
        VfsPath::parse(s).unwrap()
    }

    #[test]
    fn test_dispatch_scope_and_priority_order() {
        let registry = Arc::new(ListenerRegistry::new());
        let log = Arc::new(PlMutex::new(Vec::new()));

        let add = |path: Option<&str>, recursive, priority, tag| {
            registry.add(
                path.map(|s| p(s)),
                recursive,
                priority,
                Arc::new(Recorder {
                    tag,
                    log: Arc::clone(&log),
                }),
            )
        };

        add(None, false, false, "fs");
        add(Some("pkg"), true, false, "ancestor");
        add(Some("pkg/sub/x.txt"), false, false, "direct");
        add(Some("pkg/sub/x.txt"), false, true, "prio-direct");

        registry.dispatch(&VfsEvent::new(p("pkg/sub/x.txt"), EventKind::Changed));

        let got = log.lock().clone();
        assert_eq!(
            got,
            vec![
                "prio-direct:pkg/sub/x.txt",
                "direct:pkg/sub/x.txt",
                "ancestor:pkg/sub/x.txt",
                "fs:pkg/sub/x.txt"
            ]
        );
    }

    #[test]
    fn test_non_recursive_scope_is_self_and_children() {
        let registry = Arc::new(ListenerRegistry::new());
        let log = Arc::new(PlMutex::new(Vec::new()));
        registry.add(
            Some(p("pkg")),
            false,
            false,
            Arc::new(Recorder {
                tag: "parent",
                log: Arc::clone(&log),
            }),
        );

        // Direct child events are heard...
        registry.dispatch(&VfsEvent::new(p("pkg/x.txt"), EventKind::Changed));
        assert_eq!(log.lock().len(), 1);

        // ...grandchildren are not, without a recursive registration.
        registry.dispatch(&VfsEvent::new(p("pkg/sub/y.txt"), EventKind::Changed));
        assert_eq!(log.lock().len(), 1);

        registry.dispatch(&VfsEvent::new(p("pkg"), EventKind::Changed));
        assert_eq!(log.lock().len(), 2);
    }

    #[test]
    fn test_remove_listener() {
        let registry = Arc::new(ListenerRegistry::new());
        let log = Arc::new(PlMutex::new(Vec::new()));
        let id = registry.add(
            None,
            false,
            false,
            Arc::new(Recorder {
                tag: "fs",
                log: Arc::clone(&log),
            }),
        );
        registry.remove(id);
        registry.dispatch(&VfsEvent::new(p("x"), EventKind::Deleted));
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_batch_dedup_keeps_first_in_order() {
        let registry = Arc::new(ListenerRegistry::new());
        let log = Arc::new(PlMutex::new(Vec::new()));
        registry.add(
            None,
            false,
            false,
            Arc::new(Recorder {
                tag: "fs",
                log: Arc::clone(&log),
            }),
        );

        let batcher = EventBatcher::new(registry);
        batcher.begin();
        batcher.emit(VfsEvent::new(p("a"), EventKind::Changed));
        batcher.emit(VfsEvent::new(p("b"), EventKind::Changed));
        batcher.emit(VfsEvent::new(p("a"), EventKind::Changed)); // duplicate
        assert!(log.lock().is_empty(), "suppressed until scope exit");
        batcher.finish();

        assert_eq!(log.lock().clone(), vec!["fs:a", "fs:b"]);
    }

    #[test]
    fn test_nested_scopes_flush_once() {
        let registry = Arc::new(ListenerRegistry::new());
        let log = Arc::new(PlMutex::new(Vec::new()));
        registry.add(
            None,
            false,
            false,
            Arc::new(Recorder {
                tag: "fs",
                log: Arc::clone(&log),
            }),
        );

        let batcher = EventBatcher::new(registry);
        batcher.begin();
        batcher.begin();
        batcher.emit(VfsEvent::new(p("a"), EventKind::Deleted));
        batcher.finish();
        assert!(log.lock().is_empty(), "inner finish does not flush");
        batcher.finish();
        assert_eq!(log.lock().len(), 1);
    }

    #[test]
    fn test_emit_outside_scope_is_immediate() {
        let registry = Arc::new(ListenerRegistry::new());
        let log = Arc::new(PlMutex::new(Vec::new()));
        registry.add(
            None,
            false,
            false,
            Arc::new(Recorder {
                tag: "fs",
                log: Arc::clone(&log),
            }),
        );

        let batcher = EventBatcher::new(registry);
        batcher.emit(VfsEvent::new(p("a"), EventKind::Changed));
        assert_eq!(log.lock().len(), 1);
    }
}
