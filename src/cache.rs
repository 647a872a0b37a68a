//! A thread-safe in-memory store for synchronized state. [`CacheStore`]
//! provides concurrent access for readers (flag evaluation) and writers (the
//! background sync tasks), plus bounded FIFO buffers for outbound telemetry.
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::segments::Segment;
use crate::splits::Split;
use crate::telemetry::{Event, Impression};

/// Change number value before the first successful synchronization.
pub const NO_CHANGE_NUMBER: i64 = -1;

struct Splits {
    by_name: HashMap<String, Arc<Split>>,
    change_number: i64,
}

struct SegmentEntry {
    keys: HashSet<String>,
    change_number: i64,
}

/// Bounded FIFO buffer for telemetry records.
///
/// When full, incoming records are dropped (drop-newest: earlier evaluation
/// evidence is preserved) and counted, never surfaced as an error to the
/// evaluation path.
struct TelemetryQueue<T> {
    queue: Mutex<VecDeque<T>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl<T> TelemetryQueue<T> {
    fn new(capacity: usize) -> Self {
        TelemetryQueue {
            queue: Mutex::new(VecDeque::new()),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    fn enqueue(&self, records: impl IntoIterator<Item = T>) {
        let mut queue = self
            .queue
            .lock()
            .expect("thread holding telemetry lock should not panic");
        for record in records {
            if queue.len() >= self.capacity {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            } else {
                queue.push_back(record);
            }
        }
    }

    fn pop_many(&self, max_count: usize) -> Vec<T> {
        let mut queue = self
            .queue
            .lock()
            .expect("thread holding telemetry lock should not panic");
        let count = max_count.min(queue.len());
        queue.drain(..count).collect()
    }

    fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// `CacheStore` is the single authority on locally known state: split
/// definitions, segment membership sets, and buffered outbound telemetry.
///
/// All mutations are atomic with respect to concurrent readers: a reader
/// never observes a partially applied batch. Splits are stored behind `Arc`
/// and are immutable once stored; segments are returned as defensive copies.
/// Each collection is guarded by its own lock; there is no cross-collection
/// atomicity (none is required).
pub struct CacheStore {
    splits: RwLock<Splits>,
    segments: RwLock<HashMap<String, SegmentEntry>>,
    impressions: TelemetryQueue<Impression>,
    events: TelemetryQueue<Event>,
}

impl CacheStore {
    /// Create an empty store with the given telemetry buffer capacities.
    pub fn new(impressions_capacity: usize, events_capacity: usize) -> CacheStore {
        CacheStore {
            splits: RwLock::new(Splits {
                by_name: HashMap::new(),
                change_number: NO_CHANGE_NUMBER,
            }),
            segments: RwLock::new(HashMap::new()),
            impressions: TelemetryQueue::new(impressions_capacity),
            events: TelemetryQueue::new(events_capacity),
        }
    }

    /// Get a split by name. Returns `None` for unknown or archived splits.
    pub fn get_split(&self, name: &str) -> Option<Arc<Split>> {
        let splits = self
            .splits
            .read()
            .expect("thread holding splits lock should not panic");
        splits.by_name.get(name).cloned()
    }

    /// Names of all retrievable splits.
    pub fn split_names(&self) -> Vec<String> {
        let splits = self
            .splits
            .read()
            .expect("thread holding splits lock should not panic");
        splits.by_name.keys().cloned().collect()
    }

    /// Atomically upsert a batch of splits and advance the global change
    /// number to `new_change_number`.
    ///
    /// Archived splits are removed from the retrievable set. A call with
    /// `new_change_number` below the currently stored one is a no-op: change
    /// numbers only move forward.
    pub fn put_splits(&self, batch: Vec<Split>, new_change_number: i64) {
        let mut splits = self
            .splits
            .write()
            .expect("thread holding splits lock should not panic");
        if new_change_number < splits.change_number {
            log::debug!(
                target: "flagsync",
                "ignoring split batch with stale change number {new_change_number}",
            );
            return;
        }
        for split in batch {
            if split.is_active() {
                splits.by_name.insert(split.name.clone(), Arc::new(split));
            } else {
                splits.by_name.remove(&split.name);
            }
        }
        splits.change_number = new_change_number;
    }

    /// Global split change number, [`NO_CHANGE_NUMBER`] if never synced.
    pub fn split_change_number(&self) -> i64 {
        let splits = self
            .splits
            .read()
            .expect("thread holding splits lock should not panic");
        splits.change_number
    }

    /// Segment names referenced by any retrievable split's matchers. Drives
    /// registration and cleanup of segment sync tasks.
    pub fn referenced_segments(&self) -> HashSet<String> {
        let splits = self
            .splits
            .read()
            .expect("thread holding splits lock should not panic");
        splits
            .by_name
            .values()
            .flat_map(|split| split.segment_names())
            .collect()
    }

    /// Get a defensive copy of a segment.
    pub fn get_segment(&self, name: &str) -> Option<Segment> {
        let segments = self
            .segments
            .read()
            .expect("thread holding segments lock should not panic");
        segments.get(name).map(|entry| Segment {
            name: name.to_owned(),
            keys: entry.keys.clone(),
            change_number: entry.change_number,
        })
    }

    /// Atomically apply a membership delta: union `added`, then subtract
    /// `removed`, then advance the segment's change number.
    ///
    /// The change number advances only if `new_change_number` is greater
    /// than the current one; a stale delta is ignored entirely.
    pub fn update_segment(
        &self,
        name: &str,
        added: Vec<String>,
        removed: Vec<String>,
        new_change_number: i64,
    ) {
        let mut segments = self
            .segments
            .write()
            .expect("thread holding segments lock should not panic");
        // Staleness is checked before the entry exists: a stale delta for an
        // unknown segment must not leave an empty tracked segment behind.
        let current = segments
            .get(name)
            .map(|entry| entry.change_number)
            .unwrap_or(NO_CHANGE_NUMBER);
        if new_change_number <= current {
            log::debug!(
                target: "flagsync",
                "ignoring stale delta for segment {name} (change number {new_change_number})",
            );
            return;
        }
        let entry = segments.entry(name.to_owned()).or_insert_with(|| SegmentEntry {
            keys: HashSet::new(),
            change_number: NO_CHANGE_NUMBER,
        });
        entry.keys.extend(added);
        for key in &removed {
            entry.keys.remove(key);
        }
        entry.change_number = new_change_number;
    }

    /// O(1) membership test. An absent segment contains nothing.
    pub fn segment_contains(&self, name: &str, key: &str) -> bool {
        let segments = self
            .segments
            .read()
            .expect("thread holding segments lock should not panic");
        segments
            .get(name)
            .map(|entry| entry.keys.contains(key))
            .unwrap_or(false)
    }

    /// Change number of a segment, [`NO_CHANGE_NUMBER`] if untracked.
    pub fn segment_change_number(&self, name: &str) -> i64 {
        let segments = self
            .segments
            .read()
            .expect("thread holding segments lock should not panic");
        segments
            .get(name)
            .map(|entry| entry.change_number)
            .unwrap_or(NO_CHANGE_NUMBER)
    }

    /// Append impressions to the outbound buffer. Overflow drops the
    /// incoming records and bumps [`CacheStore::dropped_impressions`].
    pub fn enqueue_impressions(&self, impressions: impl IntoIterator<Item = Impression>) {
        self.impressions.enqueue(impressions);
    }

    /// Append events to the outbound buffer. Overflow drops the incoming
    /// records and bumps [`CacheStore::dropped_events`].
    pub fn enqueue_events(&self, events: impl IntoIterator<Item = Event>) {
        self.events.enqueue(events);
    }

    /// Atomically remove and return up to `max_count` oldest impressions.
    pub fn pop_many_impressions(&self, max_count: usize) -> Vec<Impression> {
        self.impressions.pop_many(max_count)
    }

    /// Atomically remove and return up to `max_count` oldest events.
    pub fn pop_many_events(&self, max_count: usize) -> Vec<Event> {
        self.events.pop_many(max_count)
    }

    /// Number of impressions dropped due to a full buffer.
    pub fn dropped_impressions(&self) -> u64 {
        self.impressions.dropped()
    }

    /// Number of events dropped due to a full buffer.
    pub fn dropped_events(&self) -> u64 {
        self.events.dropped()
    }
}
