//! Consolidation queue, pair state, and reports.

use crate::association::AssociationType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Waiting for a worker.
    Pending,
    /// Claimed by a worker.
    Processing,
    /// Finished.
    Done,
    /// Gave up after the retry bound.
    DeadLetter,
}

impl QueueStatus {
    /// Stable string form used in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Done => "done",
            QueueStatus::DeadLetter => "dead_letter",
        }
    }

    /// Parse the storage form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(QueueStatus::Pending),
            "processing" => Some(QueueStatus::Processing),
            "done" => Some(QueueStatus::Done),
            "dead_letter" => Some(QueueStatus::DeadLetter),
            _ => None,
        }
    }
}

/// One block waiting for (or finished with) consolidation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationQueueEntry {
    /// The block to consolidate.
    pub block_index: u64,
    /// When the block was enqueued.
    pub queued_at: DateTime<Utc>,
    /// Current status.
    pub status: QueueStatus,
    /// Failed attempts so far.
    pub attempts: u32,
    /// Last failure, if any.
    pub last_error: Option<String>,
}

/// Outcome of evaluating one pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Related; an association is recorded.
    Connected,
    /// Not related.
    Unrelated,
    /// Same content stated twice.
    Duplicate,
}

impl Verdict {
    /// Stable string form used in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Connected => "connected",
            Verdict::Unrelated => "unrelated",
            Verdict::Duplicate => "duplicate",
        }
    }

    /// Parse the storage form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "connected" => Some(Verdict::Connected),
            "unrelated" => Some(Verdict::Unrelated),
            "duplicate" => Some(Verdict::Duplicate),
            _ => None,
        }
    }
}

/// What a pair classifier concluded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairVerdict {
    /// The verdict.
    pub verdict: Verdict,
    /// Kind of connection, when connected.
    pub connection_type: Option<AssociationType>,
    /// Strength of the connection (0.0 - 1.0).
    pub strength: f32,
    /// Why the classifier decided so.
    pub justification: String,
}

impl PairVerdict {
    /// An unrelated verdict.
    pub fn unrelated(justification: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Unrelated,
            connection_type: None,
            strength: 0.0,
            justification: justification.into(),
        }
    }
}

/// The recorded evaluation of an unordered block pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationState {
    /// Lower block index.
    pub block_a: u64,
    /// Higher block index.
    pub block_b: u64,
    /// Cosine similarity of the two embeddings.
    pub cosine_similarity: f32,
    /// The verdict.
    pub verdict: Verdict,
    /// Kind of connection, when connected.
    pub connection_type: Option<AssociationType>,
    /// Strength reported by the classifier.
    pub strength: f32,
    /// Classifier justification.
    pub justification: String,
    /// When the pair was evaluated.
    pub compared_at: DateTime<Utc>,
}

/// Canonical ordering of a pair: `(lower, higher)`.
pub fn canonical_pair(a: u64, b: u64) -> (u64, u64) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Counts of queue entries per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Pending entries.
    pub pending: u64,
    /// Entries being processed.
    pub processing: u64,
    /// Finished entries.
    pub done: u64,
    /// Dead-lettered entries.
    pub dead_letter: u64,
}

/// Report from a consolidation run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationReport {
    /// Entries processed successfully.
    pub processed: u64,
    /// Entries that failed and were requeued.
    pub failed: u64,
    /// Entries moved to the dead letter status.
    pub dead_lettered: u64,
    /// Pairs sent to the classifier.
    pub pairs_evaluated: u64,
    /// Pairs skipped because they were already evaluated.
    pub pair_cache_hits: u64,
    /// New association edges.
    pub associations_created: u64,
    /// Existing association edges reinforced.
    pub associations_reinforced: u64,
    /// How long the run took.
    pub duration_ms: u64,
}

impl ConsolidationReport {
    /// Fold another report into this one.
    pub fn absorb(&mut self, other: &ConsolidationReport) {
        self.processed += other.processed;
        self.failed += other.failed;
        self.dead_lettered += other.dead_lettered;
        self.pairs_evaluated += other.pairs_evaluated;
        self.pair_cache_hits += other.pair_cache_hits;
        self.associations_created += other.associations_created;
        self.associations_reinforced += other.associations_reinforced;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_pair() {
        assert_eq!(canonical_pair(7, 3), (3, 7));
        assert_eq!(canonical_pair(3, 7), (3, 7));
    }

    #[test]
    fn test_status_round_trip() {
        for s in [
            QueueStatus::Pending,
            QueueStatus::Processing,
            QueueStatus::Done,
            QueueStatus::DeadLetter,
        ] {
            assert_eq!(QueueStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(QueueStatus::parse("lost"), None);
    }

    #[test]
    fn test_report_absorb() {
        let mut total = ConsolidationReport::default();
        let step = ConsolidationReport {
            processed: 2,
            pairs_evaluated: 5,
            pair_cache_hits: 1,
            associations_created: 3,
            ..Default::default()
        };
        total.absorb(&step);
        total.absorb(&step);
        assert_eq!(total.processed, 4);
        assert_eq!(total.pairs_evaluated, 10);
        assert_eq!(total.associations_created, 6);
    }
}
