//! Ledger blocks: the immutable unit of memory.

use crate::slot::{Placement, SlotId};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// `prev_hash` of the first block in the ledger.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// A single immutable entry of the hash-chained ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// Monotonic position in the global ledger (0-based).
    pub index: u64,
    /// The textual content.
    pub content: String,
    /// Keywords extracted by the text pipeline.
    pub keywords: BTreeSet<String>,
    /// Tags extracted by the text pipeline.
    pub tags: BTreeSet<String>,
    /// Fixed-dimension embedding vector.
    pub embedding: Vec<f32>,
    /// Importance score (0.0 - 1.0).
    pub importance: f32,
    /// When the block was appended (microsecond precision).
    pub created_at: DateTime<Utc>,
    /// SHA-256 over index, timestamp, content, and `prev_hash`.
    pub hash: String,
    /// Hash of the previous block in the global ledger.
    pub prev_hash: String,
    /// Slot the block was routed to.
    pub slot_id: Option<SlotId>,
    /// Long-lived thread/conversation identifier.
    pub root: String,
    /// Parent block hash within the branch.
    pub before: Option<String>,
    /// Child block hashes within the branch (derived on read).
    pub after: Vec<String>,
    /// Distance from the branch root.
    pub depth: u32,
    /// Arbitrary caller metadata.
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Block {
    /// The timestamp string committed to by the hash.
    pub fn ledger_timestamp(&self) -> String {
        ledger_timestamp(&self.created_at)
    }
}

/// Canonical timestamp rendering used both for storage and hashing.
pub fn ledger_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Truncate a timestamp to the precision the ledger stores.
pub fn truncate_to_ledger_precision(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(at.timestamp_micros()).unwrap_or(at)
}

/// Input for an append.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppendRequest {
    /// The textual content.
    pub content: String,
    /// Keywords (lower-cased on store).
    pub keywords: BTreeSet<String>,
    /// Tags (lower-cased on store).
    pub tags: BTreeSet<String>,
    /// Embedding produced by the text pipeline.
    pub embedding: Vec<f32>,
    /// Importance score in 0.0 - 1.0; appends outside that range are rejected.
    pub importance: f32,
    /// Route into this slot instead of asking the router.
    pub slot: Option<SlotId>,
    /// Thread identifier; inherited from the parent when omitted.
    pub root: Option<String>,
    /// Explicit parent block hash; defaults to the slot head.
    pub before: Option<String>,
    /// Reject the append unless the ledger tail still has this hash.
    pub expected_prev_hash: Option<String>,
    /// Arbitrary metadata.
    pub metadata: HashMap<String, serde_json::Value>,
}

impl AppendRequest {
    /// Start a request from content and its embedding.
    pub fn new(content: impl Into<String>, embedding: Vec<f32>) -> Self {
        Self {
            content: content.into(),
            embedding,
            importance: 0.5,
            ..Default::default()
        }
    }

    /// Set the keywords.
    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    /// Set the tags.
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Set the importance.
    pub fn with_importance(mut self, importance: f32) -> Self {
        self.importance = importance;
        self
    }

    /// Pin the request to a slot.
    pub fn in_slot(mut self, slot: SlotId) -> Self {
        self.slot = Some(slot);
        self
    }

    /// Set the thread root.
    pub fn with_root(mut self, root: impl Into<String>) -> Self {
        self.root = Some(root.into());
        self
    }

    /// Attach to an explicit parent block.
    pub fn after_block(mut self, parent_hash: impl Into<String>) -> Self {
        self.before = Some(parent_hash.into());
        self
    }

    /// Require the ledger tail to match.
    pub fn expecting_tail(mut self, prev_hash: impl Into<String>) -> Self {
        self.expected_prev_hash = Some(prev_hash.into());
        self
    }

    /// Add a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// A freshly appended block together with its routing decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockRecord {
    /// The persisted block.
    pub block: Block,
    /// How the router placed the block.
    pub placement: Placement,
    /// Similarity to the chosen slot's topic, when one existed.
    pub route_similarity: Option<f32>,
}

/// Outcome of a chain verification pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainVerification {
    /// Whether every checked block verified.
    pub valid: bool,
    /// Index of the first block that failed, if any.
    pub first_corrupt_index: Option<u64>,
    /// Number of blocks checked.
    pub checked: u64,
    /// Human-readable description of the first failure.
    pub reason: Option<String>,
}

impl ChainVerification {
    /// A passing result.
    pub fn ok(checked: u64) -> Self {
        Self {
            valid: true,
            first_corrupt_index: None,
            checked,
            reason: None,
        }
    }

    /// A failing result at `index`.
    pub fn corrupt(index: u64, checked: u64, reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            first_corrupt_index: Some(index),
            checked,
            reason: Some(reason.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_ledger_timestamp_round_trips() {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 30, 5).unwrap()
            + chrono::Duration::nanoseconds(123_456_789);
        let truncated = truncate_to_ledger_precision(at);
        let rendered = ledger_timestamp(&truncated);
        assert_eq!(rendered, "2026-03-01T12:30:05.123456Z");
        let parsed = DateTime::parse_from_rfc3339(&rendered)
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(ledger_timestamp(&parsed), rendered);
    }

    #[test]
    fn test_append_request_builder() {
        let req = AppendRequest::new("auth login bug", vec![1.0, 0.0])
            .with_keywords(["auth", "login"])
            .with_tags(["bug"])
            .with_root("conv-1")
            .with_importance(0.9);
        assert_eq!(req.keywords.len(), 2);
        assert!(req.tags.contains("bug"));
        assert_eq!(req.root.as_deref(), Some("conv-1"));
        assert!(req.slot.is_none());
        assert!((req.importance - 0.9).abs() < f32::EPSILON);
    }
}
