//! Split (feature flag) definitions and the wire format used by the
//! split-changes endpoint.
use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Response format of the split-changes endpoint.
///
/// `since` echoes the change number the request was made with; `till` is the
/// change number the returned batch advances the cache to. `till == since`
/// means the caller is caught up.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SplitChanges {
    /// Changed splits since `since`.
    ///
    /// Each entry is wrapped in `TryParse` so that if the server sends one
    /// split in a format we don't understand, the rest of the batch is still
    /// usable.
    #[serde(default)]
    pub splits: Vec<TryParse<Split>>,
    pub since: i64,
    pub till: i64,
}

/// `TryParse` allows the subfield to fail parsing without failing the parsing
/// of the whole structure.
///
/// This can be helpful to isolate errors in a subtree. e.g., if one split in a
/// change batch fails to parse, the rest of the batch is still applied.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(untagged)]
pub enum TryParse<T> {
    /// Successfully parsed.
    Parsed(T),
    /// Parsing failed.
    ParseFailed(serde_json::Value),
}
impl<T> From<TryParse<T>> for Result<T, serde_json::Value> {
    fn from(value: TryParse<T>) -> Self {
        match value {
            TryParse::Parsed(v) => Ok(v),
            TryParse::ParseFailed(v) => Err(v),
        }
    }
}
impl<T> From<TryParse<T>> for Option<T> {
    fn from(value: TryParse<T>) -> Self {
        match value {
            TryParse::Parsed(v) => Some(v),
            TryParse::ParseFailed(_) => None,
        }
    }
}
impl<'a, T> From<&'a TryParse<T>> for Option<&'a T> {
    fn from(value: &TryParse<T>) -> Option<&T> {
        match value {
            TryParse::Parsed(v) => Some(v),
            TryParse::ParseFailed(_) => None,
        }
    }
}

/// A feature flag definition with its rollout rules.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Split {
    pub name: String,
    pub traffic_type_name: String,
    pub seed: i64,
    /// Hashing algorithm id used by the evaluator.
    #[serde(default)]
    pub algo: i32,
    pub status: SplitStatus,
    pub killed: bool,
    pub default_treatment: String,
    /// Monotonic version stamp. Only ever increases for a given name.
    pub change_number: i64,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl Split {
    /// Returns whether this split is retrievable. Archived splits are
    /// logically deleted.
    pub fn is_active(&self) -> bool {
        self.status == SplitStatus::Active
    }

    /// Names of segments referenced by this split's matchers. Used to
    /// auto-register segment synchronization for newly referenced segments.
    pub fn segment_names(&self) -> HashSet<String> {
        self.conditions
            .iter()
            .flat_map(|condition| condition.matcher_group.matchers.iter())
            .filter_map(|matcher| matcher.segment_name())
            .map(str::to_owned)
            .collect()
    }
}

/// Lifecycle status of a split.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SplitStatus {
    Active,
    Archived,
}

/// One targeting rule of a split: a matcher group plus the treatments it
/// distributes traffic over.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub condition_type: ConditionType,
    /// Ordered partitions. Sizes are percentages summing to 100.
    #[serde(default)]
    pub partitions: Vec<Partition>,
    pub matcher_group: MatcherGroup,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConditionType {
    Whitelist,
    #[default]
    Rollout,
    /// Condition types introduced by newer servers. Kept so the split still
    /// parses; the evaluator decides what to do with them.
    #[serde(other)]
    Unknown,
}

/// Treatment → percentage pair.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Partition {
    pub treatment: String,
    pub size: u8,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MatcherGroup {
    #[serde(default)]
    pub combiner: String,
    #[serde(default)]
    pub matchers: Vec<Matcher>,
}

/// A single matcher.
///
/// Matcher payloads are opaque to the synchronization core (the evaluator
/// interprets them), with one exception: `IN_SEGMENT` matchers carry the name
/// of a segment that must be kept in sync, so that field is parsed out.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Matcher {
    pub matcher_type: String,
    #[serde(default)]
    pub negate: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_defined_segment_matcher_data: Option<SegmentMatcherData>,
    /// Remaining matcher-type-specific payload, preserved verbatim.
    #[serde(flatten)]
    pub data: serde_json::Map<String, serde_json::Value>,
}

pub const IN_SEGMENT_MATCHER: &str = "IN_SEGMENT";

impl Matcher {
    /// Name of the segment this matcher references, if it is a segment
    /// matcher.
    pub fn segment_name(&self) -> Option<&str> {
        if self.matcher_type != IN_SEGMENT_MATCHER {
            return None;
        }
        self.user_defined_segment_matcher_data
            .as_ref()
            .map(|data| data.segment_name.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SegmentMatcherData {
    pub segment_name: String,
}
