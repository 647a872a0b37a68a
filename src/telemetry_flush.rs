//! Flush tasks that drain buffered telemetry from the cache in bounded
//! batches and push them to the backend.
//!
//! A failed push is logged and the batch is discarded: buffers are already
//! capacity-bounded, a lost batch is an accepted telemetry-completeness
//! trade-off, and nothing is ever surfaced to the evaluation path. Each task
//! performs one final best-effort flush cycle on shutdown.
use std::sync::Arc;

use crate::cache::CacheStore;
use crate::gateway::Gateway;
use crate::task::TaskWork;

/// Periodic work that uploads buffered impressions in bulk.
pub struct ImpressionsFlushWork {
    gateway: Arc<dyn Gateway>,
    cache: Arc<CacheStore>,
    batch_size: usize,
}

impl ImpressionsFlushWork {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        cache: Arc<CacheStore>,
        batch_size: usize,
    ) -> ImpressionsFlushWork {
        ImpressionsFlushWork {
            gateway,
            cache,
            batch_size,
        }
    }
}

impl TaskWork for ImpressionsFlushWork {
    fn cycle(&mut self) {
        let batch = self.cache.pop_many_impressions(self.batch_size);
        if batch.is_empty() {
            // Nothing buffered; skip the cycle with no network call.
            return;
        }
        if let Err(err) = self.gateway.post_impressions(&batch) {
            log::warn!(
                target: "flagsync",
                count = batch.len();
                "failed to flush impressions, dropping batch: {err}",
            );
        }
    }

    fn on_stop(&mut self) {
        // Final flush, best-effort.
        self.cycle();
    }
}

/// Periodic work that uploads buffered events in bulk.
pub struct EventsFlushWork {
    gateway: Arc<dyn Gateway>,
    cache: Arc<CacheStore>,
    batch_size: usize,
}

impl EventsFlushWork {
    pub fn new(gateway: Arc<dyn Gateway>, cache: Arc<CacheStore>, batch_size: usize) -> EventsFlushWork {
        EventsFlushWork {
            gateway,
            cache,
            batch_size,
        }
    }
}

impl TaskWork for EventsFlushWork {
    fn cycle(&mut self) {
        let batch = self.cache.pop_many_events(self.batch_size);
        if batch.is_empty() {
            return;
        }
        if let Err(err) = self.gateway.post_events(&batch) {
            log::warn!(
                target: "flagsync",
                count = batch.len();
                "failed to flush events, dropping batch: {err}",
            );
        }
    }

    fn on_stop(&mut self) {
        self.cycle();
    }
}
