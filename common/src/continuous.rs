//! Continuous synchronization: listeners feed event reducers, reducers
//! trigger drilled sub-syncs, and an optional background worker re-runs the
//! full sync on an interval. A single mutex serializes every sync, and the
//! shared `can_trigger` gate keeps reducers from queueing a competing one
//! while a sync is running.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use futures::FutureExt;

use crate::cryptfile::HashedKey;
use crate::provider::{FsListener, FsProvider, KeyPolicy};
use crate::reducer::{EventReducer, ReducerHandle};
use crate::relpath::RelPath;
use crate::syncdir::{self, SyncOptions};

/// Parsed synchronization mode string: a subset of `a`, `s`, `b`, `d`.
///
/// `a` = asymmetric, `s` = symmetric (src to dst, then dst back to src),
/// `b` = background listeners, `d` = propagate deletions. The default is
/// `ad`; one of `a` or `s` is required, and `a` wins when both appear.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyncMode {
    pub symmetric: bool,
    pub background: bool,
    pub sync_deletes: bool,
}

impl Default for SyncMode {
    fn default() -> Self {
        Self {
            symmetric: false,
            background: false,
            sync_deletes: true,
        }
    }
}

impl std::str::FromStr for SyncMode {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mode = s.trim().to_lowercase();
        for ch in mode.chars() {
            if !"asbd".contains(ch) {
                bail!("invalid character {ch:?} in mode string {s:?}");
            }
        }
        let asymmetric = mode.contains('a');
        let symmetric = mode.contains('s');
        if !asymmetric && !symmetric {
            bail!("mode string must contain \"a\" or \"s\"");
        }
        Ok(Self {
            symmetric: symmetric && !asymmetric,
            background: mode.contains('b'),
            sync_deletes: mode.contains('d'),
        })
    }
}

/// The two providers of a sync relationship plus their keys.
pub struct SyncPair {
    pub src: Arc<dyn FsProvider>,
    pub dst: Arc<dyn FsProvider>,
    pub src_key: Option<HashedKey>,
    pub dst_key: Option<HashedKey>,
}

#[derive(Clone, Copy, Debug)]
enum Direction {
    SrcToDst,
    DstToSrc,
}

/// Settings for [`run`].
#[derive(Clone, Copy, Debug)]
pub struct ContinuousOptions {
    pub mode: SyncMode,
    /// Comparator settings; the `sync_deletes` field is overridden per
    /// direction.
    pub compare: SyncOptions,
    /// Re-run a full sync every this often.
    pub background_ttl: Option<std::time::Duration>,
    /// Listen for source changes and sync them to the destination;
    /// the value tells whether deletions are propagated.
    pub bg_src_to_dst: Option<bool>,
    /// Listen for destination changes and sync them back to the source.
    pub bg_dst_to_src: Option<bool>,
    /// Quiescence window of the event reducers.
    pub reducer_ttl: std::time::Duration,
}

impl Default for ContinuousOptions {
    fn default() -> Self {
        Self {
            mode: SyncMode::default(),
            compare: SyncOptions::default(),
            background_ttl: None,
            bg_src_to_dst: None,
            bg_dst_to_src: None,
            reducer_ttl: std::time::Duration::from_secs(2),
        }
    }
}

struct Engine {
    pair: SyncPair,
    options: ContinuousOptions,
    /// At most one sync runs at a time.
    sync_lock: tokio::sync::Mutex<()>,
    /// Cleared while a sync runs so reducers skip their tick.
    can_trigger: Arc<AtomicBool>,
}

impl Engine {
    fn ends(&self, direction: Direction) -> (&dyn FsProvider, &dyn FsProvider) {
        match direction {
            Direction::SrcToDst => (self.pair.src.as_ref(), self.pair.dst.as_ref()),
            Direction::DstToSrc => (self.pair.dst.as_ref(), self.pair.src.as_ref()),
        }
    }

    fn keys(&self, direction: Direction) -> (Option<HashedKey>, Option<HashedKey>) {
        match direction {
            Direction::SrcToDst => (self.pair.src_key, self.pair.dst_key),
            Direction::DstToSrc => (self.pair.dst_key, self.pair.src_key),
        }
    }

    /// One full compare-and-sync pass, symmetric when the mode asks for it.
    async fn full_sync(&self, reason: &str) -> Result<()> {
        let _guard = self.sync_lock.lock().await;
        self.can_trigger.store(false, Ordering::SeqCst);
        let result = self.full_sync_locked(reason).await;
        self.can_trigger.store(true, Ordering::SeqCst);
        result
    }

    async fn full_sync_locked(&self, reason: &str) -> Result<()> {
        let mode = self.options.mode;
        let mut options = self.options.compare;
        options.sync_deletes = mode.sync_deletes;
        tracing::info!("{reason}: source --> destination");
        syncdir::sync(
            self.pair.src.as_ref(),
            self.pair.dst.as_ref(),
            &options,
            self.pair.src_key.as_ref(),
            self.pair.dst_key.as_ref(),
            None,
        )
        .await?;
        if mode.symmetric {
            // anything deleted on the destination was just restored from the
            // source, and files may be changing underneath in the
            // background: never propagate deletions on the return leg
            options.sync_deletes = false;
            tracing::info!("{reason}: source <-- destination");
            syncdir::sync(
                self.pair.dst.as_ref(),
                self.pair.src.as_ref(),
                &options,
                self.pair.dst_key.as_ref(),
                self.pair.src_key.as_ref(),
                None,
            )
            .await?;
        }
        Ok(())
    }

    /// Focused sync of a single settled subtree: clone both providers,
    /// drill the changed side at the raw event path and the other side at
    /// its re-crypted counterpart.
    async fn drilled_sync(
        &self,
        direction: Direction,
        sync_deletes: bool,
        relpath: RelPath,
    ) -> Result<()> {
        let _guard = self.sync_lock.lock().await;
        self.can_trigger.store(false, Ordering::SeqCst);
        let result = self.drilled_sync_locked(direction, sync_deletes, &relpath).await;
        self.can_trigger.store(true, Ordering::SeqCst);
        result
    }

    async fn drilled_sync_locked(
        &self,
        direction: Direction,
        sync_deletes: bool,
        relpath: &RelPath,
    ) -> Result<()> {
        let (changed, other) = self.ends(direction);
        let (changed_key, other_key) = self.keys(direction);
        tracing::info!("event sync {direction:?} at {relpath}");
        let mut drilled_src = changed.clone_provider();
        drilled_src.drill(relpath);
        let mut drilled_dst = other.clone_provider();
        let translate = KeyPolicy {
            decryption: changed_key,
            encryption: other_key,
        };
        drilled_dst.drill(&translate.recrypt_path(relpath)?);
        let mut options = self.options.compare;
        options.sync_deletes = sync_deletes;
        syncdir::sync(
            drilled_src.as_ref(),
            drilled_dst.as_ref(),
            &options,
            changed_key.as_ref(),
            other_key.as_ref(),
            None,
        )
        .await
    }
}

fn start_direction(
    engine: &Arc<Engine>,
    direction: Direction,
    sync_deletes: bool,
) -> EventReducer {
    let handler = {
        let engine = engine.clone();
        Arc::new(move |relpath: RelPath| {
            let engine = engine.clone();
            async move {
                if let Err(err) = engine.drilled_sync(direction, sync_deletes, relpath).await {
                    tracing::error!("event sync {direction:?} failed: {err:#}");
                }
            }
            .boxed()
        })
    };
    EventReducer::start(engine.options.reducer_ttl, engine.can_trigger.clone(), handler)
}

fn listener_callback(
    provider: Arc<dyn FsProvider>,
    reducer: ReducerHandle,
) -> crate::provider::OnChange {
    Arc::new(move |event| {
        let relpath = match provider.event_relpath(&event.path) {
            Ok(relpath) => relpath,
            Err(err) => {
                tracing::debug!("ignoring event outside root: {err:#}");
                return;
            }
        };
        // every event settles at its containing directory: the comparator
        // drills into a directory root, and for deletions the entry itself
        // is gone anyway
        reducer.add_event(relpath.parent());
    })
}

/// Run the continuous-sync control plane until `shutdown` fires: an initial
/// full sync, then change listeners per requested direction and an optional
/// periodic full re-sync.
pub async fn run(
    pair: SyncPair,
    options: ContinuousOptions,
    shutdown: tokio_util::sync::CancellationToken,
) -> Result<()> {
    let engine = Arc::new(Engine {
        pair,
        options,
        sync_lock: tokio::sync::Mutex::new(()),
        can_trigger: Arc::new(AtomicBool::new(true)),
    });
    engine.full_sync("SYNC").await?;

    let background_work = options.background_ttl.is_some()
        || options.bg_src_to_dst.is_some()
        || options.bg_dst_to_src.is_some();
    if !background_work {
        return Ok(());
    }

    let mut reducers: Vec<EventReducer> = Vec::new();
    let mut listeners: Vec<Box<dyn FsListener>> = Vec::new();
    if let Some(sync_deletes) = options.bg_src_to_dst {
        let reducer = start_direction(&engine, Direction::SrcToDst, sync_deletes);
        let listener = engine
            .pair
            .src
            .listen_changes(listener_callback(
                engine.pair.src.clone(),
                reducer.handle(),
            ))
            .await?;
        reducers.push(reducer);
        listeners.push(listener);
    }
    if let Some(sync_deletes) = options.bg_dst_to_src {
        let reducer = start_direction(&engine, Direction::DstToSrc, sync_deletes);
        let listener = engine
            .pair
            .dst
            .listen_changes(listener_callback(
                engine.pair.dst.clone(),
                reducer.handle(),
            ))
            .await?;
        reducers.push(reducer);
        listeners.push(listener);
    }

    // periodic full re-sync, independent of the event-driven paths
    let tick = options
        .background_ttl
        .map_or(std::time::Duration::from_secs(1), |ttl| ttl / 10);
    let mut elapsed = std::time::Duration::ZERO;
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            () = tokio::time::sleep(tick) => {
                if let Some(ttl) = options.background_ttl {
                    elapsed += tick;
                    if elapsed >= ttl && engine.can_trigger.load(Ordering::SeqCst) {
                        elapsed = std::time::Duration::ZERO;
                        if let Err(err) = engine.full_sync("BGSYNC").await {
                            tracing::error!("background sync failed: {err:#}");
                        }
                    }
                }
            }
        }
    }

    tracing::info!("stopping filesystem listeners and event reducers");
    for listener in &listeners {
        listener.request_stop();
    }
    for reducer in &reducers {
        reducer.request_stop();
    }
    for mut listener in listeners {
        listener.join().await?;
    }
    for mut reducer in reducers {
        reducer.join().await?;
    }
    Ok(())
}
