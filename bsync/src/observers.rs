//! Server-side change notifier: observers register for a root, mutating
//! actions fan events out to every observer whose root prefixes the event
//! path, and clients drain their queue through a granularity-stepped long
//! poll. Observer leases are renewed by polling and expired entries are
//! collected on the next notify or poll.

use std::collections::HashMap;

use anyhow::Result;
use common::provider::EventKind;
use remote::protocol::WireEvent;

use crate::actions::AbortRequest;

struct Observer {
    expires: std::time::Instant,
    root: String,
    events: Vec<WireEvent>,
}

/// The observer table of one server instance.
pub struct EventObservers {
    poll_ttl: std::time::Duration,
    poll_granularity: std::time::Duration,
    table: tokio::sync::Mutex<HashMap<String, Observer>>,
}

impl EventObservers {
    pub fn new(poll_ttl: std::time::Duration, poll_granularity: std::time::Duration) -> Self {
        Self {
            poll_ttl,
            poll_granularity,
            table: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn poll_ttl(&self) -> std::time::Duration {
        self.poll_ttl
    }

    /// Register an observer for `root`; the lease runs out after two TTLs
    /// unless polling renews it.
    pub async fn add_observer(&self, root: String) -> String {
        let uid = common::provider::new_provider_uid();
        let mut table = self.table.lock().await;
        table.insert(
            uid.clone(),
            Observer {
                expires: std::time::Instant::now() + 2 * self.poll_ttl,
                root,
                events: Vec::new(),
            },
        );
        uid
    }

    /// Queue an event for every live observer whose root is a prefix of the
    /// event path; expired observers are dropped along the way.
    pub async fn notify(&self, event_path: &str, kind: EventKind, origin_uid: &str) {
        tracing::debug!("notify {event_path} ({kind:?}) from {origin_uid}");
        let now = std::time::Instant::now();
        let mut table = self.table.lock().await;
        table.retain(|uid, observer| {
            if observer.expires < now {
                tracing::debug!("dropping expired observer {uid}");
                return false;
            }
            if event_path.starts_with(&observer.root) {
                observer.events.push(WireEvent {
                    path: event_path.to_string(),
                    kind,
                    origin_uid: origin_uid.to_string(),
                });
            }
            true
        });
    }

    /// One renewal step: drain buffered events and extend the lease by a
    /// TTL. An observer past its grace window is removed and reported gone.
    async fn take_events(&self, uid: &str) -> Result<Vec<WireEvent>> {
        let now = std::time::Instant::now();
        let mut table = self.table.lock().await;
        let observer = table
            .get_mut(uid)
            .ok_or_else(|| AbortRequest::new(404, "Invalid event notification request."))?;
        if now > observer.expires + 2 * self.poll_ttl {
            table.remove(uid);
            return Err(AbortRequest::new(404, "Invalid event notification request.").into());
        }
        observer.expires = now + self.poll_ttl;
        Ok(std::mem::take(&mut observer.events))
    }

    /// Long poll: deliver buffered events immediately, otherwise re-check
    /// every granularity tick until events arrive or the remaining budget
    /// falls below one tick, then deliver an empty list.
    pub async fn poll(&self, uid: &str) -> Result<Vec<WireEvent>> {
        let started = std::time::Instant::now();
        loop {
            let events = self.take_events(uid).await?;
            if !events.is_empty() {
                return Ok(events);
            }
            if started.elapsed() + self.poll_granularity > self.poll_ttl {
                return Ok(Vec::new());
            }
            tokio::time::sleep(self.poll_granularity).await;
        }
    }
}
