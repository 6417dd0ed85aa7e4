//! Debouncing event reducer for continuous sync.
//!
//! Listener threads feed raw filesystem events in; once the tree has been
//! quiet for a TTL, the surviving top-level paths are handed to the sync
//! handler. Two rules keep the pending set minimal: an event whose ancestor
//! is already queued is dropped (the ancestor re-syncs everything below),
//! and a newly queued event evicts any queued descendants.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;

use crate::relpath::RelPath;

/// Async handler invoked with each settled path.
pub type EventHandler =
    Arc<dyn Fn(RelPath) -> futures::future::BoxFuture<'static, ()> + Send + Sync>;

#[derive(Default)]
struct State {
    events: BTreeSet<RelPath>,
    last_changed: Option<std::time::Instant>,
}

fn insert_subsumed(events: &mut BTreeSet<RelPath>, relpath: RelPath) {
    // an already queued ancestor (the path itself included, as is the root)
    // absorbs this event
    for len in 0..=relpath.len() {
        if events.contains(&relpath.prefix(len)) {
            return;
        }
    }
    // otherwise queue it and discard the descendants it covers
    events.retain(|event| !event.starts_with(&relpath));
    events.insert(relpath);
}

/// Cheap handle for feeding events into a running reducer.
#[derive(Clone)]
pub struct ReducerHandle {
    state: Arc<std::sync::Mutex<State>>,
    stop_requested: Arc<AtomicBool>,
}

impl ReducerHandle {
    /// Add a filesystem event; holds the lock only briefly.
    pub fn add_event(&self, relpath: RelPath) {
        if self.stop_requested.load(Ordering::SeqCst) {
            return;
        }
        let mut state = self.state.lock().expect("reducer state poisoned");
        insert_subsumed(&mut state.events, relpath);
        state.last_changed = Some(std::time::Instant::now());
    }

    /// Snapshot of the pending set.
    pub fn pending(&self) -> Vec<RelPath> {
        let state = self.state.lock().expect("reducer state poisoned");
        state.events.iter().cloned().collect()
    }
}

/// Background worker that drains the pending set after quiescence.
pub struct EventReducer {
    handle: ReducerHandle,
    stopped: Arc<AtomicBool>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl EventReducer {
    /// Start the reducer. `can_trigger` is the global sync gate: while it is
    /// cleared the tick neither drains nor fires. Event processing runs
    /// without the state lock, so new events keep accumulating for the next
    /// round of quiescence.
    pub fn start(ttl: std::time::Duration, can_trigger: Arc<AtomicBool>, handler: EventHandler) -> Self {
        let state = Arc::new(std::sync::Mutex::new(State::default()));
        let stop_requested = Arc::new(AtomicBool::new(false));
        let stopped = Arc::new(AtomicBool::new(false));
        let handle = ReducerHandle {
            state: state.clone(),
            stop_requested: stop_requested.clone(),
        };
        let task = {
            let stop_requested = stop_requested.clone();
            let stopped = stopped.clone();
            tokio::spawn(async move {
                while !stop_requested.load(Ordering::SeqCst) {
                    tokio::time::sleep(ttl / 10).await;
                    let mut to_process = None;
                    if can_trigger.load(Ordering::SeqCst) {
                        let mut state = state.lock().expect("reducer state poisoned");
                        if let Some(last_changed) = state.last_changed {
                            if !state.events.is_empty() && last_changed.elapsed() > ttl {
                                to_process = Some(std::mem::take(&mut state.events));
                                state.last_changed = None;
                            }
                        }
                    }
                    if let Some(events) = to_process {
                        for event in events {
                            if stop_requested.load(Ordering::SeqCst) {
                                break;
                            }
                            handler(event).await;
                        }
                    }
                }
                stopped.store(true, Ordering::SeqCst);
            })
        };
        Self {
            handle,
            stopped,
            task: Some(task),
        }
    }

    pub fn handle(&self) -> ReducerHandle {
        self.handle.clone()
    }

    pub fn add_event(&self, relpath: RelPath) {
        self.handle.add_event(relpath);
    }

    pub fn pending(&self) -> Vec<RelPath> {
        self.handle.pending()
    }

    pub fn request_stop(&self) {
        self.handle.stop_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_stopping(&self) -> bool {
        self.handle.stop_requested.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub async fn join(&mut self) -> Result<()> {
        if let Some(task) = self.task.take() {
            task.await?;
        }
        Ok(())
    }
}

impl Drop for EventReducer {
    fn drop(&mut self) {
        self.request_stop();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
