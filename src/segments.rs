//! Segment membership sets and the wire format used by the segment-changes
//! endpoint.
use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// A named set of keys usable as a matcher input.
///
/// Values returned from the cache are defensive copies: mutating them has no
/// effect on the stored segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub name: String,
    pub keys: HashSet<String>,
    /// Monotonic version stamp, independent per segment.
    pub change_number: i64,
}

impl Segment {
    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }
}

/// Response format of the segment-changes endpoint: membership delta between
/// `since` and `till`.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SegmentChanges {
    pub name: String,
    #[serde(default)]
    pub added: Vec<String>,
    #[serde(default)]
    pub removed: Vec<String>,
    pub since: i64,
    pub till: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_segment_changes() {
        let changes: SegmentChanges = serde_json::from_value(serde_json::json!({
            "name": "employees",
            "added": ["k1", "k2"],
            "removed": [],
            "since": -1,
            "till": 42,
        }))
        .unwrap();

        assert_eq!(changes.name, "employees");
        assert_eq!(changes.added, vec!["k1", "k2"]);
        assert!(changes.removed.is_empty());
        assert_eq!(changes.till, 42);
    }
}
