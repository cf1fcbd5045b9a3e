//! Association edges discovered by consolidation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Kinds of association between two memory nodes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssociationType {
    /// The blocks talk about the same thing.
    Semantic,
    /// One block explains or results from the other.
    Causal,
    /// The blocks happened close together in the same thread.
    Temporal,
    /// The blocks assert conflicting things.
    Contradiction,
    /// Anything else a classifier reports.
    Custom(String),
}

impl AssociationType {
    /// Stable string form used in storage.
    pub fn as_str(&self) -> &str {
        match self {
            AssociationType::Semantic => "semantic",
            AssociationType::Causal => "causal",
            AssociationType::Temporal => "temporal",
            AssociationType::Contradiction => "contradiction",
            AssociationType::Custom(name) => name,
        }
    }

    /// Parse the storage form; unknown names become `Custom`.
    pub fn parse(s: &str) -> Self {
        match s {
            "semantic" => AssociationType::Semantic,
            "causal" => AssociationType::Causal,
            "temporal" => AssociationType::Temporal,
            "contradiction" => AssociationType::Contradiction,
            other => AssociationType::Custom(other.to_string()),
        }
    }
}

impl std::fmt::Display for AssociationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed, weighted edge between two memory nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Association {
    /// Row identifier.
    pub id: i64,
    /// Node of the lower-indexed block.
    pub source_node: String,
    /// Node of the higher-indexed block.
    pub target_node: String,
    /// Edge kind.
    pub assoc_type: AssociationType,
    /// Strength (0.0 - 1.0), EMA-blended on reinforcement.
    pub strength: f32,
    /// When the edge was first recorded.
    pub created_at: DateTime<Utc>,
    /// How many times consolidation re-discovered the edge.
    pub activation_count: u64,
    /// Arbitrary metadata (justification, classifier name).
    pub metadata: HashMap<String, serde_json::Value>,
}

/// An association seen from one of its endpoint blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssociatedBlock {
    /// The block the lookup started from.
    pub from_block: u64,
    /// The block on the other end of the edge.
    pub neighbor_block: u64,
    /// The edge itself.
    pub association: Association,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_association_type_round_trip() {
        for t in [
            AssociationType::Semantic,
            AssociationType::Causal,
            AssociationType::Temporal,
            AssociationType::Contradiction,
            AssociationType::Custom("elaborates".to_string()),
        ] {
            assert_eq!(AssociationType::parse(t.as_str()), t);
        }
    }
}
