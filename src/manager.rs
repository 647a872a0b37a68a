//! Wires the cache, gateway, and background tasks together and exposes the
//! lifecycle surface used by the owning process: start, readiness, health
//! probes, forced refresh/flush, and graceful shutdown.
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cache::CacheStore;
use crate::gateway::Gateway;
use crate::segment_sync::SegmentRegistry;
use crate::split_sync::SplitSynchronizer;
use crate::task::{FetchStamp, PeriodicTask, ReadySignal};
use crate::telemetry_flush::{EventsFlushWork, ImpressionsFlushWork};

/// Configuration for [`SyncManager`].
// Not implementing `Copy` as we may add non-copyable fields in the future.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Interval between split-changes polls.
    pub split_interval: Duration,
    /// Interval between segment-changes polls (per segment).
    pub segment_interval: Duration,
    /// Interval between impression flushes.
    pub impressions_interval: Duration,
    /// Interval between event flushes.
    pub events_interval: Duration,
    /// Randomized duration subtracted from each interval. Helps to avoid
    /// fleets of clients synchronizing and producing spiky network load.
    pub jitter: Duration,
    /// Capacity of the impressions buffer; overflow drops incoming records.
    pub impressions_capacity: usize,
    /// Capacity of the events buffer; overflow drops incoming records.
    pub events_capacity: usize,
    /// Maximum impressions uploaded per flush cycle.
    pub impressions_batch_size: usize,
    /// Maximum events uploaded per flush cycle.
    pub events_batch_size: usize,
}

impl SyncConfig {
    pub const DEFAULT_SPLIT_INTERVAL: Duration = Duration::from_secs(30);
    pub const DEFAULT_SEGMENT_INTERVAL: Duration = Duration::from_secs(30);
    pub const DEFAULT_IMPRESSIONS_INTERVAL: Duration = Duration::from_secs(30);
    pub const DEFAULT_EVENTS_INTERVAL: Duration = Duration::from_secs(60);
    pub const DEFAULT_JITTER: Duration = Duration::from_secs(3);
    pub const DEFAULT_IMPRESSIONS_CAPACITY: usize = 10_000;
    pub const DEFAULT_EVENTS_CAPACITY: usize = 10_000;
    pub const DEFAULT_IMPRESSIONS_BATCH_SIZE: usize = 5_000;
    pub const DEFAULT_EVENTS_BATCH_SIZE: usize = 500;

    /// Create a new `SyncConfig` using default configuration.
    pub fn new() -> SyncConfig {
        SyncConfig::default()
    }

    pub fn with_split_interval(mut self, interval: Duration) -> SyncConfig {
        self.split_interval = interval;
        self
    }

    pub fn with_segment_interval(mut self, interval: Duration) -> SyncConfig {
        self.segment_interval = interval;
        self
    }

    pub fn with_impressions_interval(mut self, interval: Duration) -> SyncConfig {
        self.impressions_interval = interval;
        self
    }

    pub fn with_events_interval(mut self, interval: Duration) -> SyncConfig {
        self.events_interval = interval;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> SyncConfig {
        self.jitter = jitter;
        self
    }

    pub fn with_impressions_capacity(mut self, capacity: usize) -> SyncConfig {
        self.impressions_capacity = capacity;
        self
    }

    pub fn with_events_capacity(mut self, capacity: usize) -> SyncConfig {
        self.events_capacity = capacity;
        self
    }

    pub fn with_impressions_batch_size(mut self, batch_size: usize) -> SyncConfig {
        self.impressions_batch_size = batch_size;
        self
    }

    pub fn with_events_batch_size(mut self, batch_size: usize) -> SyncConfig {
        self.events_batch_size = batch_size;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> SyncConfig {
        SyncConfig {
            split_interval: SyncConfig::DEFAULT_SPLIT_INTERVAL,
            segment_interval: SyncConfig::DEFAULT_SEGMENT_INTERVAL,
            impressions_interval: SyncConfig::DEFAULT_IMPRESSIONS_INTERVAL,
            events_interval: SyncConfig::DEFAULT_EVENTS_INTERVAL,
            jitter: SyncConfig::DEFAULT_JITTER,
            impressions_capacity: SyncConfig::DEFAULT_IMPRESSIONS_CAPACITY,
            events_capacity: SyncConfig::DEFAULT_EVENTS_CAPACITY,
            impressions_batch_size: SyncConfig::DEFAULT_IMPRESSIONS_BATCH_SIZE,
            events_batch_size: SyncConfig::DEFAULT_EVENTS_BATCH_SIZE,
        }
    }
}

/// Owns the cache and all background synchronization tasks.
///
/// The evaluation path reads splits and segments from [`SyncManager::cache`]
/// and enqueues impressions/events there; it never touches the tasks. No
/// task failure is ever surfaced to evaluation callers: evaluation always
/// reads best-effort current cache state, stale or empty.
pub struct SyncManager {
    cache: Arc<CacheStore>,
    segments: Arc<SegmentRegistry>,
    split_task: PeriodicTask,
    impressions_task: PeriodicTask,
    events_task: PeriodicTask,
    ready: ReadySignal,
    split_fetch: FetchStamp,
}

impl SyncManager {
    pub fn new(gateway: Arc<dyn Gateway>, config: SyncConfig) -> SyncManager {
        let cache = Arc::new(CacheStore::new(
            config.impressions_capacity,
            config.events_capacity,
        ));
        let segments = Arc::new(SegmentRegistry::new(
            Arc::clone(&gateway),
            Arc::clone(&cache),
            config.segment_interval,
            config.jitter,
        ));
        let ready = ReadySignal::new();

        let split_work = SplitSynchronizer::new(
            Arc::clone(&gateway),
            Arc::clone(&cache),
            Arc::clone(&segments),
            ready.clone(),
        );
        let split_fetch = split_work.last_fetch();
        let split_task = PeriodicTask::new(
            "split-sync",
            config.split_interval,
            config.jitter,
            split_work,
        );

        let impressions_task = PeriodicTask::new(
            "impressions-flush",
            config.impressions_interval,
            config.jitter,
            ImpressionsFlushWork::new(
                Arc::clone(&gateway),
                Arc::clone(&cache),
                config.impressions_batch_size,
            ),
        );
        let events_task = PeriodicTask::new(
            "events-flush",
            config.events_interval,
            config.jitter,
            EventsFlushWork::new(gateway, Arc::clone(&cache), config.events_batch_size),
        );

        SyncManager {
            cache,
            segments,
            split_task,
            impressions_task,
            events_task,
            ready,
            split_fetch,
        }
    }

    /// The store the evaluation path reads from and enqueues telemetry
    /// into.
    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    /// Start all background tasks. Idempotent. Segment tasks are registered
    /// and started automatically as splits referencing them are discovered.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`](crate::Error::Io) if a task thread failed to
    /// spawn.
    pub fn start(&self) -> crate::Result<()> {
        log::debug!(target: "flagsync", "starting synchronization tasks");
        self.split_task.start()?;
        self.impressions_task.start()?;
        self.events_task.start()?;
        Ok(())
    }

    /// Block until the initial split fetch has completed or `timeout`
    /// elapses. Returns whether the cache is ready.
    pub fn wait_until_ready(&self, timeout: Duration) -> bool {
        self.ready.wait_timeout(timeout)
    }

    /// Whether the initial split fetch has completed.
    pub fn is_ready(&self) -> bool {
        self.ready.is_set()
    }

    /// Run a split fetch-apply cycle now, out of band. Used when an external
    /// channel signals that splits changed. The regular polling schedule is
    /// unaffected.
    pub fn force_refresh(&self) {
        self.split_task.force_run();
    }

    /// Flush buffered telemetry now, out of band.
    pub fn flush(&self) {
        self.impressions_task.force_run();
        self.events_task.force_run();
    }

    /// Whether any background task is still running.
    pub fn is_running(&self) -> bool {
        self.split_task.is_running()
            || self.impressions_task.is_running()
            || self.events_task.is_running()
            || self.segments.any_running()
    }

    /// Whether the split sync task is running. Per-segment probes live on
    /// [`SyncManager::segments`].
    pub fn is_split_sync_running(&self) -> bool {
        self.split_task.is_running()
    }

    /// Registry of per-segment sync tasks, for health probes.
    pub fn segments(&self) -> &SegmentRegistry {
        &self.segments
    }

    /// Epoch milliseconds of the last successful split fetch. Together with
    /// the change-number lag this is the staleness health signal.
    pub fn last_split_fetch(&self) -> Option<i64> {
        self.split_fetch.get()
    }

    /// Gracefully stop all tasks, waiting up to `timeout` for in-flight
    /// cycles to finish. The flush tasks perform one final best-effort
    /// telemetry flush on their way out.
    pub fn stop(&self, timeout: Duration) {
        log::debug!(target: "flagsync", "stopping synchronization tasks");
        let deadline = Instant::now() + timeout;

        let mut waits: Vec<(&str, Receiver<()>)> = Vec::new();
        for task in [
            &self.split_task,
            &self.impressions_task,
            &self.events_task,
        ] {
            let (signal, done) = sync_channel(1);
            task.stop_with_signal(signal);
            waits.push((task.name(), done));
        }

        self.segments
            .stop_all(deadline.saturating_duration_since(Instant::now()));

        for (name, done) in waits {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if done.recv_timeout(remaining).is_err() {
                log::warn!(
                    target: "flagsync",
                    task = name;
                    "task did not stop within the shutdown timeout",
                );
            }
        }
    }
}
