//! Segment synchronization: one periodic task per referenced segment,
//! fetching membership deltas and applying them to the cache.
//!
//! Segments are discovered dynamically: the split sync task reconciles the
//! [`SegmentRegistry`] against the set of segments referenced by active
//! splits, registering newly referenced segments and eventually stopping
//! tasks for segments no longer referenced by anything.
use std::collections::HashMap;
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::cache::CacheStore;
use crate::gateway::Gateway;
use crate::task::{FetchStamp, PeriodicTask, TaskWork};

/// Periodic work for one segment: fetch membership deltas since the locally
/// known change number and apply them, draining a paginated backlog within a
/// single cycle.
pub struct SegmentSynchronizer {
    name: String,
    gateway: Arc<dyn Gateway>,
    cache: Arc<CacheStore>,
    last_fetch: FetchStamp,
}

impl SegmentSynchronizer {
    pub fn new(
        name: impl Into<String>,
        gateway: Arc<dyn Gateway>,
        cache: Arc<CacheStore>,
    ) -> SegmentSynchronizer {
        SegmentSynchronizer {
            name: name.into(),
            gateway,
            cache,
            last_fetch: FetchStamp::new(),
        }
    }

    /// Handle for health probes; clone before handing the synchronizer to a
    /// task.
    pub fn last_fetch(&self) -> FetchStamp {
        self.last_fetch.clone()
    }
}

impl TaskWork for SegmentSynchronizer {
    fn cycle(&mut self) {
        loop {
            let since = self.cache.segment_change_number(&self.name);
            let changes = match self.gateway.fetch_segment_changes(&self.name, since) {
                Ok(changes) => changes,
                Err(err) => {
                    log::warn!(
                        target: "flagsync",
                        segment = self.name.as_str();
                        "failed to fetch segment changes: {err}",
                    );
                    return;
                }
            };
            self.last_fetch.mark();

            let till = changes.till;
            if till > since {
                self.cache
                    .update_segment(&self.name, changes.added, changes.removed, till);
            } else if till < since {
                // Must not regress the cache on an out-of-order response.
                log::warn!(
                    target: "flagsync",
                    segment = self.name.as_str();
                    "server returned change number {till} older than local {since}, ignoring",
                );
            }

            if till <= since {
                // Caught up; wait for the next scheduled cycle.
                return;
            }
        }
    }
}

struct SegmentHandle {
    task: PeriodicTask,
    last_fetch: FetchStamp,
}

/// Owns one [`PeriodicTask`] per tracked segment.
pub struct SegmentRegistry {
    gateway: Arc<dyn Gateway>,
    cache: Arc<CacheStore>,
    interval: Duration,
    jitter: Duration,
    tasks: Mutex<HashMap<String, SegmentHandle>>,
}

impl SegmentRegistry {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        cache: Arc<CacheStore>,
        interval: Duration,
        jitter: Duration,
    ) -> SegmentRegistry {
        SegmentRegistry {
            gateway,
            cache,
            interval,
            jitter,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Bring the set of running segment tasks in line with the set of
    /// segment names referenced by active splits: start tasks for newly
    /// referenced segments, stop tasks for segments no longer referenced.
    pub fn reconcile(&self, referenced: &std::collections::HashSet<String>) {
        let mut tasks = self
            .tasks
            .lock()
            .expect("thread holding segment registry lock should not panic");

        for name in referenced {
            if tasks.contains_key(name) {
                continue;
            }
            log::debug!(target: "flagsync", segment = name.as_str(); "registering segment for sync");
            let work = SegmentSynchronizer::new(
                name.as_str(),
                Arc::clone(&self.gateway),
                Arc::clone(&self.cache),
            );
            let last_fetch = work.last_fetch();
            let task = PeriodicTask::new(
                format!("segment-sync-{name}"),
                self.interval,
                self.jitter,
                work,
            );
            if let Err(err) = task.start() {
                log::error!(
                    target: "flagsync",
                    segment = name.as_str();
                    "failed to start segment sync task: {err}",
                );
                continue;
            }
            tasks.insert(name.clone(), SegmentHandle { task, last_fetch });
        }

        tasks.retain(|name, handle| {
            if referenced.contains(name) {
                return true;
            }
            log::debug!(target: "flagsync", segment = name.as_str(); "segment no longer referenced, stopping sync");
            handle.task.stop();
            false
        });
    }

    /// Names of currently tracked segments.
    pub fn tracked(&self) -> Vec<String> {
        let tasks = self
            .tasks
            .lock()
            .expect("thread holding segment registry lock should not panic");
        tasks.keys().cloned().collect()
    }

    /// Whether the sync task for `name` is currently running.
    pub fn is_running(&self, name: &str) -> bool {
        let tasks = self
            .tasks
            .lock()
            .expect("thread holding segment registry lock should not panic");
        tasks
            .get(name)
            .map(|handle| handle.task.is_running())
            .unwrap_or(false)
    }

    /// Whether any segment task is still running.
    pub fn any_running(&self) -> bool {
        let tasks = self
            .tasks
            .lock()
            .expect("thread holding segment registry lock should not panic");
        tasks.values().any(|handle| handle.task.is_running())
    }

    /// Epoch milliseconds of the last successful fetch for `name`.
    pub fn last_fetch(&self, name: &str) -> Option<i64> {
        let tasks = self
            .tasks
            .lock()
            .expect("thread holding segment registry lock should not panic");
        tasks.get(name).and_then(|handle| handle.last_fetch.get())
    }

    /// Stop every segment task and wait (bounded by `timeout`) for their
    /// in-flight cycles to finish.
    pub fn stop_all(&self, timeout: Duration) {
        let waits: Vec<(String, Receiver<()>)> = {
            let tasks = self
                .tasks
                .lock()
                .expect("thread holding segment registry lock should not panic");
            tasks
                .iter()
                .map(|(name, handle)| {
                    let (signal, done) = sync_channel(1);
                    handle.task.stop_with_signal(signal);
                    (name.clone(), done)
                })
                .collect()
        };

        let deadline = Instant::now() + timeout;
        for (name, done) in waits {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if done.recv_timeout(remaining).is_err() {
                log::warn!(
                    target: "flagsync",
                    segment = name.as_str();
                    "segment sync task did not stop within the shutdown timeout",
                );
            }
        }
    }
}
