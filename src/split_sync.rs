//! Split synchronization: the periodic task that keeps split definitions in
//! the cache current with the backend, and the trigger for segment
//! discovery.
use std::sync::Arc;

use crate::cache::CacheStore;
use crate::gateway::Gateway;
use crate::segment_sync::SegmentRegistry;
use crate::splits::{Split, TryParse};
use crate::task::{FetchStamp, ReadySignal, TaskWork};

/// Periodic work that fetches split changes since the locally known change
/// number and applies them atomically to the cache.
///
/// A paginated backlog is drained within a single cycle: the fetch-apply
/// step repeats until the server reports `till == since`. The first
/// successful cycle fires the one-shot ready signal used by callers waiting
/// for the initial cache population.
pub struct SplitSynchronizer {
    gateway: Arc<dyn Gateway>,
    cache: Arc<CacheStore>,
    segments: Arc<SegmentRegistry>,
    ready: ReadySignal,
    last_fetch: FetchStamp,
}

impl SplitSynchronizer {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        cache: Arc<CacheStore>,
        segments: Arc<SegmentRegistry>,
        ready: ReadySignal,
    ) -> SplitSynchronizer {
        SplitSynchronizer {
            gateway,
            cache,
            segments,
            ready,
            last_fetch: FetchStamp::new(),
        }
    }

    /// Handle for health probes; clone before handing the synchronizer to a
    /// task.
    pub fn last_fetch(&self) -> FetchStamp {
        self.last_fetch.clone()
    }

    /// Parse a raw batch, skipping (and logging) individual splits that
    /// failed to parse. One malformed split never aborts the batch.
    fn parse_batch(raw: Vec<TryParse<Split>>) -> Vec<Split> {
        raw.into_iter()
            .filter_map(|raw| match raw {
                TryParse::Parsed(split) => Some(split),
                TryParse::ParseFailed(value) => {
                    let name = value
                        .get("name")
                        .and_then(|name| name.as_str())
                        .unwrap_or("<unknown>");
                    log::warn!(target: "flagsync", split = name; "failed to parse split, skipping");
                    None
                }
            })
            .collect()
    }
}

impl TaskWork for SplitSynchronizer {
    fn cycle(&mut self) {
        loop {
            let since = self.cache.split_change_number();
            let changes = match self.gateway.fetch_splits(since) {
                Ok(changes) => changes,
                Err(err) => {
                    // Transient by contract; state is left untouched and the
                    // task retries on its next cycle.
                    log::warn!(target: "flagsync", "failed to fetch split changes: {err}");
                    return;
                }
            };
            self.last_fetch.mark();

            let till = changes.till;
            if till < since {
                // Must not regress the cache on an out-of-order response.
                log::warn!(
                    target: "flagsync",
                    "server returned change number {till} older than local {since}, ignoring",
                );
            } else if till > since || !changes.splits.is_empty() {
                // A non-empty payload at the current change number (a
                // replay) is still applied; only an empty caught-up
                // response skips the store entirely.
                let batch = SplitSynchronizer::parse_batch(changes.splits);
                self.cache.put_splits(batch, till);
                // Newly referenced segments start syncing; segments no
                // longer referenced by any split are eventually dropped.
                self.segments.reconcile(&self.cache.referenced_segments());
            }

            self.ready.set();

            if till <= since {
                // Caught up; wait for the next scheduled cycle.
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::cache::CacheStore;
    use crate::gateway::fake::FakeGateway;
    use crate::splits::SplitChanges;
    use crate::task::PeriodicTask;
    use crate::Error;

    fn split_value(name: &str, change_number: i64) -> serde_json::Value {
        serde_json::json!({
            "name": name,
            "trafficTypeName": "user",
            "seed": 321654,
            "algo": 2,
            "status": "ACTIVE",
            "killed": false,
            "defaultTreatment": "off",
            "changeNumber": change_number,
            "conditions": [{
                "conditionType": "WHITELIST",
                "label": "some_label",
                "partitions": [
                    {"treatment": "on", "size": 50},
                    {"treatment": "off", "size": 50},
                ],
                "matcherGroup": {"combiner": "AND", "matchers": [{
                    "matcherType": "WHITELIST",
                    "negate": false,
                    "whitelistMatcherData": {"whitelist": ["k1", "k2", "k3"]},
                }]},
            }],
        })
    }

    fn changes(splits: Vec<serde_json::Value>, since: i64, till: i64) -> SplitChanges {
        serde_json::from_value(serde_json::json!({
            "splits": splits,
            "since": since,
            "till": till,
        }))
        .unwrap()
    }

    fn fixture() -> (Arc<FakeGateway>, Arc<CacheStore>, SplitSynchronizer) {
        let gateway = Arc::new(FakeGateway::new());
        let cache = Arc::new(CacheStore::new(10, 10));
        let segments = Arc::new(SegmentRegistry::new(
            gateway.clone(),
            cache.clone(),
            Duration::from_secs(3600),
            Duration::ZERO,
        ));
        let work = SplitSynchronizer::new(
            gateway.clone(),
            cache.clone(),
            segments,
            ReadySignal::new(),
        );
        (gateway, cache, work)
    }

    #[test]
    fn normal_operation() {
        let (gateway, cache, mut work) = fixture();
        gateway.script_splits(Ok(changes(vec![split_value("some_name", 123)], -1, 123)));

        work.cycle();

        assert_eq!(*gateway.split_calls.lock().unwrap(), vec![-1, 123]);
        assert_eq!(cache.split_change_number(), 123);
        let split = cache.get_split("some_name").expect("split should be stored");
        assert_eq!(split.name, "some_name");
        assert!(work.ready.is_set());
        assert!(work.last_fetch().get().is_some());
    }

    #[test]
    fn ready_fires_on_empty_first_fetch() {
        let (gateway, cache, mut work) = fixture();
        gateway.script_splits(Ok(changes(vec![], -1, -1)));

        work.cycle();

        assert!(work.ready.is_set());
        assert_eq!(cache.split_change_number(), -1);
        assert_eq!(*gateway.split_calls.lock().unwrap(), vec![-1]);
    }

    #[test]
    fn catch_up_loop_drains_backlog_in_one_cycle() {
        let (gateway, cache, mut work) = fixture();
        gateway.script_splits(Ok(changes(vec![split_value("a", 10)], -1, 10)));
        gateway.script_splits(Ok(changes(vec![split_value("b", 20)], 10, 20)));
        gateway.script_splits(Ok(changes(vec![split_value("c", 30)], 20, 30)));

        work.cycle();

        assert_eq!(*gateway.split_calls.lock().unwrap(), vec![-1, 10, 20, 30]);
        assert_eq!(cache.split_change_number(), 30);
        assert!(cache.get_split("a").is_some());
        assert!(cache.get_split("c").is_some());
    }

    #[test]
    fn transport_failure_leaves_state_unchanged() {
        let (gateway, cache, mut work) = fixture();
        gateway.script_splits(Err(Error::Unauthorized));

        work.cycle();

        assert_eq!(cache.split_change_number(), -1);
        assert!(!work.ready.is_set());
        assert!(work.last_fetch().get().is_none());
    }

    #[test]
    fn out_of_order_till_does_not_regress() {
        let (gateway, cache, mut work) = fixture();
        gateway.script_splits(Ok(changes(vec![split_value("a", 50)], -1, 50)));
        work.cycle();
        assert_eq!(cache.split_change_number(), 50);

        gateway.script_splits(Ok(changes(vec![split_value("stale", 10)], 10, 10)));
        work.cycle();

        assert_eq!(cache.split_change_number(), 50);
        assert!(cache.get_split("stale").is_none());
    }

    #[test]
    fn replayed_payload_at_current_change_number_is_applied() {
        let (gateway, cache, mut work) = fixture();
        gateway.script_splits(Ok(changes(vec![split_value("a", 10)], -1, 10)));
        work.cycle();
        assert_eq!(cache.split_change_number(), 10);

        // The backend may re-send definitions at the local change number; the
        // payload must land even though the change number does not advance.
        gateway.script_splits(Ok(changes(vec![split_value("replayed", 10)], 10, 10)));
        work.cycle();

        assert!(cache.get_split("replayed").is_some());
        assert_eq!(cache.split_change_number(), 10);
        // Still terminates after a single fetch: -1, 10 (catch-up), then 10.
        assert_eq!(*gateway.split_calls.lock().unwrap(), vec![-1, 10, 10]);
    }

    #[test]
    fn malformed_split_is_skipped_not_fatal() {
        let (gateway, cache, mut work) = fixture();
        gateway.script_splits(Ok(changes(
            vec![
                serde_json::json!({"name": "broken", "status": 42}),
                split_value("good", 7),
            ],
            -1,
            7,
        )));

        work.cycle();

        assert_eq!(cache.split_change_number(), 7);
        assert!(cache.get_split("broken").is_none());
        assert!(cache.get_split("good").is_some());
        assert!(work.ready.is_set());
    }

    #[test]
    fn discovered_segments_are_registered() {
        let gateway = Arc::new(FakeGateway::new());
        let cache = Arc::new(CacheStore::new(10, 10));
        let segments = Arc::new(SegmentRegistry::new(
            gateway.clone(),
            cache.clone(),
            Duration::from_secs(3600),
            Duration::ZERO,
        ));
        let mut work = SplitSynchronizer::new(
            gateway.clone(),
            cache.clone(),
            segments.clone(),
            ReadySignal::new(),
        );
        let with_segment = serde_json::json!({
            "name": "seg_split",
            "trafficTypeName": "user",
            "seed": 1,
            "algo": 2,
            "status": "ACTIVE",
            "killed": false,
            "defaultTreatment": "off",
            "changeNumber": 5,
            "conditions": [{
                "matcherGroup": {"combiner": "AND", "matchers": [{
                    "matcherType": "IN_SEGMENT",
                    "userDefinedSegmentMatcherData": {"segmentName": "employees"},
                }]},
            }],
        });
        gateway.script_splits(Ok(changes(vec![with_segment], -1, 5)));

        work.cycle();

        assert_eq!(segments.tracked(), vec!["employees".to_owned()]);

        // Archiving the split unregisters the segment on the next applied
        // batch.
        let archived = serde_json::json!({
            "name": "seg_split",
            "trafficTypeName": "user",
            "seed": 1,
            "algo": 2,
            "status": "ARCHIVED",
            "killed": false,
            "defaultTreatment": "off",
            "changeNumber": 6,
            "conditions": [],
        });
        gateway.script_splits(Ok(changes(vec![archived], 5, 6)));
        work.cycle();

        assert!(segments.tracked().is_empty());
    }

    #[test]
    fn errors_dont_stop_task() {
        let (gateway, _cache, work) = fixture();
        gateway.script_splits(Ok(changes(vec![], -1, -1)));
        gateway.script_splits(Err(Error::Unauthorized));
        gateway.script_splits(Err(Error::Unauthorized));

        let ready = work.ready.clone();
        let task = PeriodicTask::new(
            "split-sync",
            Duration::from_millis(50),
            Duration::ZERO,
            work,
        );
        task.start().unwrap();

        assert!(ready.wait_timeout(Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(300));
        assert!(task.is_running());
        assert!(gateway.split_calls.lock().unwrap().len() >= 3);

        let (signal, done) = std::sync::mpsc::sync_channel(1);
        task.stop_with_signal(signal);
        done.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(!task.is_running());
    }
}
