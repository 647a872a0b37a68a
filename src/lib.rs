//! `flagsync` is the synchronization core of a client-side feature-flag SDK.
//!
//! # Overview
//!
//! The crate keeps a local in-memory cache of feature-flag definitions
//! ("splits") and user segment memberships eventually-consistent with a
//! remote control-plane, and ships usage telemetry (impressions, events)
//! back to it, all from background tasks. Flag evaluation reads only the
//! local cache: no evaluation call ever waits on the network.
//!
//! [`CacheStore`](cache::CacheStore) is the heart of the crate. It is a
//! thread-safe multi-reader multi-writer store that is the central authority
//! on locally known state. Sync tasks are its only writers for splits and
//! segments; the evaluation path is a reader that additionally enqueues
//! telemetry into its bounded buffers. Readers get immutable snapshots
//! (splits behind `Arc`, segments as defensive copies) that are unaffected
//! by concurrent writes.
//!
//! [`Gateway`](gateway::Gateway) abstracts the outbound calls: fetching
//! split/segment change batches and posting telemetry bulks.
//! [`HttpGateway`](gateway::HttpGateway) is the production implementation;
//! it's best to save and reuse the same instance, so it can reuse the
//! connection.
//!
//! [`PeriodicTask`](task::PeriodicTask) launches a background thread that
//! runs a [`TaskWork`](task::TaskWork) cycle once per interval, with prompt
//! graceful stop, forced out-of-band runs, and a running-state probe. The
//! sync and flush tasks are all built on it:
//! [`SplitSynchronizer`](split_sync::SplitSynchronizer) polls for split
//! changes and triggers segment discovery,
//! [`SegmentSynchronizer`](segment_sync::SegmentSynchronizer) (one per
//! referenced segment, managed by a
//! [`SegmentRegistry`](segment_sync::SegmentRegistry)) polls membership
//! deltas, and the [`telemetry_flush`] works drain the outbound buffers in
//! bounded batches.
//!
//! [`SyncManager`](manager::SyncManager) wires all of the above together and
//! is the lifecycle surface for the owning process: start, readiness,
//! health probes, forced refresh/flush, graceful shutdown.
//!
//! Failures never propagate to evaluation callers. A transport error is
//! logged and retried on the next cycle; a malformed split is skipped
//! without aborting its batch; a full telemetry buffer drops incoming
//! records and counts them. The only externally observable failure mode is
//! staleness, detectable via change-number lag and the health probes.

#![warn(rustdoc::missing_crate_level_docs)]

pub mod cache;
pub mod gateway;
pub mod manager;
pub mod segment_sync;
pub mod segments;
pub mod split_sync;
pub mod splits;
pub mod task;
pub mod telemetry;
pub mod telemetry_flush;

mod error;

pub use error::{Error, Result};
