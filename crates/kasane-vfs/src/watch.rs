//! Background modification watcher.
//!
//! A dedicated thread polls each delegate's revision counter and runs a
//! full refresh pass when something moved underneath the composite
//! (archive replaced on disk, another process writing a layer). The poll
//! itself happens outside the engine's locks; only the structural refresh
//! afterwards takes them.
//!
//! The poll interval adapts to the observed change cadence: bursts pull
//! the window down toward [`MIN_POLL`], quiet periods let it drift back to
//! [`MAX_POLL`], so short-lived access bursts don't thrash the backends.

use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::layered::{FsInner, LayeredFs};

/// Fastest the watcher will poll during a burst of changes.
const MIN_POLL: Duration = Duration::from_millis(100);

/// Idle poll interval.
const MAX_POLL: Duration = Duration::from_secs(5);

/// How many recent changes feed the cadence estimate.
const CADENCE_SAMPLES: usize = 8;

/// Poll-window estimator from recent change timestamps.
struct AdaptiveWindow {
    recent: Vec<Instant>,
}

impl AdaptiveWindow {
    fn new() -> Self {
        Self { recent: Vec::new() }
    }

    fn observe_change(&mut self, now: Instant) {
        self.recent.push(now);
        if self.recent.len() > CADENCE_SAMPLES {
            self.recent.remove(0);
        }
    }

    /// Half the average spacing of recent changes, clamped; idle streams
    /// settle at the maximum.
    fn next_delay(&self, now: Instant) -> Duration {
        let Some(last) = self.recent.last() else {
            return MAX_POLL;
        };
        if now.duration_since(*last) > MAX_POLL * 4 {
            return MAX_POLL;
        }
        if self.recent.len() < 2 {
            return MAX_POLL / 2;
        }
        let span = self
            .recent
            .last()
            .unwrap()
            .duration_since(self.recent[0]);
        let avg = span / (self.recent.len() as u32 - 1);
        (avg / 2).clamp(MIN_POLL, MAX_POLL)
    }
}

struct WatchState {
    stop: bool,
    poke: bool,
    passes: u64,
    last_seen: Option<Vec<u64>>,
    window: AdaptiveWindow,
}

struct WatchShared {
    fs: Weak<FsInner>,
    state: Mutex<WatchState>,
    /// Wakes the poll loop early (shutdown or an explicit poke).
    wake: Condvar,
    /// Signaled once per completed poll pass.
    pass_done: Condvar,
}

/// Handle to the watcher thread. Stops on drop.
pub struct Watcher {
    shared: Arc<WatchShared>,
    thread: Option<JoinHandle<()>>,
}

impl Watcher {
    /// Start watching a composite filesystem. The watcher holds the
    /// filesystem weakly and shuts down when it goes away.
    pub fn spawn(fs: &LayeredFs) -> Watcher {
        let shared = Arc::new(WatchShared {
            fs: Arc::downgrade(fs.inner()),
            state: Mutex::new(WatchState {
                stop: false,
                poke: false,
                passes: 0,
                last_seen: None,
                window: AdaptiveWindow::new(),
            }),
            wake: Condvar::new(),
            pass_done: Condvar::new(),
        });

        let loop_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("kasane-watcher".to_string())
            .spawn(move || poll_loop(loop_shared))
            .expect("spawn watcher thread");

        Watcher {
            shared,
            thread: Some(thread),
        }
    }

    /// Trigger a poll now and block until a pass that started after this
    /// call completes. Two rounds: the first drains any pass already in
    /// flight (whose snapshot may predate the caller's change), the
    /// second is guaranteed fresh.
    pub fn wait_for_refresh(&self) {
        for _ in 0..2 {
            let mut state = self.shared.state.lock();
            if state.stop {
                return;
            }
            let target = state.passes + 1;
            state.poke = true;
            self.shared.wake.notify_all();
            while state.passes < target && !state.stop {
                self.shared.pass_done.wait(&mut state);
            }
        }
    }

    /// Stop the watcher thread and wait for it to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.stop = true;
            self.shared.wake.notify_all();
            self.shared.pass_done.notify_all();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn poll_loop(shared: Arc<WatchShared>) {
    loop {
        // Phase 1: I/O without any engine lock.
        let Some(fs) = shared.fs.upgrade() else {
            debug!("watched filesystem dropped, watcher exiting");
            let mut state = shared.state.lock();
            state.stop = true;
            shared.pass_done.notify_all();
            return;
        };
        let revisions: Vec<u64> = fs.delegates.iter().map(|d| d.revision()).collect();

        let now = Instant::now();
        let changed = {
            let mut state = shared.state.lock();
            if state.stop {
                return;
            }
            let changed = state
                .last_seen
                .as_ref()
                .is_some_and(|seen| *seen != revisions);
            if state.last_seen.is_none() {
                state.last_seen = Some(revisions.clone());
            } else if changed {
                state.last_seen = Some(revisions);
                state.window.observe_change(now);
            }
            changed
        };

        // Phase 2: structural refresh under the normal engine locking,
        // only when something actually moved.
        if changed {
            debug!("delegate revisions moved, refreshing");
            fs.refresh_all();
        }
        drop(fs);

        let mut state = shared.state.lock();
        state.passes += 1;
        state.poke = false;
        shared.pass_done.notify_all();
        if state.stop {
            return;
        }
        let delay = state.window.next_delay(now);
        let deadline = now + delay;
        while !state.stop && !state.poke {
            if shared.wake.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        if state.stop {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryBackend;

    #[test]
    fn test_wait_for_refresh_sees_external_change() {
        let lower = Arc::new(MemoryBackend::new("lower"));
        lower.put_file("pkg/x.txt", b"one").unwrap();
        let fs = LayeredFs::new(vec![lower.clone()]);

        let folder = fs.file("pkg").unwrap();
        assert_eq!(folder.child_names().unwrap(), vec!["x.txt"]);

        let watcher = Watcher::spawn(&fs);
        watcher.wait_for_refresh(); // baseline pass

        // Out-of-band change on the backend.
        lower.put_file("pkg/y.txt", b"two").unwrap();
        watcher.wait_for_refresh();

        let names = folder.child_names().unwrap();
        assert!(names.contains(&"y.txt".to_string()), "saw {names:?}");
        watcher.stop();
    }

    #[test]
    fn test_adaptive_window_bounds() {
        let mut w = AdaptiveWindow::new();
        let t0 = Instant::now();
        assert_eq!(w.next_delay(t0), MAX_POLL);

        // A tight burst drives the window to the floor.
        for i in 0..CADENCE_SAMPLES {
            w.observe_change(t0 + Duration::from_millis(i as u64));
        }
        let d = w.next_delay(t0 + Duration::from_millis(CADENCE_SAMPLES as u64));
        assert!(d >= MIN_POLL && d <= MAX_POLL);
        assert!(d <= Duration::from_millis(500), "burst should poll fast, got {d:?}");
    }

    #[test]
    fn test_watcher_stops_cleanly() {
        let fs = LayeredFs::new(vec![Arc::new(MemoryBackend::new("mem"))]);
        let watcher = Watcher::spawn(&fs);
        watcher.wait_for_refresh();
        watcher.stop();
    }
}
