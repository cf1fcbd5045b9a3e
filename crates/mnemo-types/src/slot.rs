//! Slots: the small set of concurrently active threads of thought.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Slot identifier, rendered as a letter (`A`, `B`, `C`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SlotId(pub u8);

impl SlotId {
    /// Highest supported slot count.
    pub const MAX_SLOTS: u8 = 26;

    /// Slot at position `n` (0 = `A`).
    pub fn nth(n: u8) -> Self {
        Self(n)
    }

    /// The slot letter.
    pub fn label(&self) -> char {
        (b'A' + self.0) as char
    }
}

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl FromStr for SlotId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.trim().chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) if c.is_ascii_alphabetic() => {
                let n = c.to_ascii_uppercase() as u8 - b'A';
                if n < Self::MAX_SLOTS {
                    Ok(Self(n))
                } else {
                    Err(format!("slot out of range: {s}"))
                }
            }
            _ => Err(format!("invalid slot id: {s:?}")),
        }
    }
}

impl TryFrom<String> for SlotId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SlotId> for String {
    fn from(id: SlotId) -> Self {
        id.to_string()
    }
}

/// A thread of thought anchored to a branch head.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slot {
    /// Slot identifier.
    pub id: SlotId,
    /// Index of the branch head block.
    pub head_block_id: Option<u64>,
    /// EMA of the embeddings written through this slot (unit length).
    pub topic_vector: Option<Vec<f32>>,
    /// Pinned slots never move automatically.
    pub pinned: bool,
    /// Base hop budget for searches entering through this slot.
    pub hop_budget: u32,
    /// Last time a write was routed here.
    pub last_used_at: Option<DateTime<Utc>>,
    /// Set when the in-memory state could not be persisted.
    pub dirty: bool,
}

impl Slot {
    /// An empty slot.
    pub fn empty(id: SlotId, hop_budget: u32) -> Self {
        Self {
            id,
            head_block_id: None,
            topic_vector: None,
            pinned: false,
            hop_budget,
            last_used_at: None,
            dirty: false,
        }
    }

    /// Whether nothing has been written through this slot yet.
    pub fn is_empty(&self) -> bool {
        self.topic_vector.is_none() && self.head_block_id.is_none()
    }
}

/// How a write was placed relative to the existing threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    /// Continues the current thread of the chosen slot.
    ExistingBranch,
    /// Starts a lower-confidence sub-branch inside the chosen slot.
    Divergence,
    /// Opens a fresh thread in an empty slot.
    NewContext,
    /// Evicts the least related slot and reuses it.
    GlobalReallocation,
}

impl Placement {
    /// Whether the new block attaches to the slot's current head.
    pub fn extends_head(&self) -> bool {
        matches!(self, Placement::ExistingBranch | Placement::Divergence)
    }

    /// Stable string form used in storage and metadata.
    pub fn as_str(&self) -> &'static str {
        match self {
            Placement::ExistingBranch => "existing_branch",
            Placement::Divergence => "divergence",
            Placement::NewContext => "new_context",
            Placement::GlobalReallocation => "global_reallocation",
        }
    }
}

/// A routing decision.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SlotDecision {
    /// The chosen slot.
    pub slot_id: SlotId,
    /// How the write is placed.
    pub placement: Placement,
    /// Similarity between the query and the chosen slot's topic, if it had one.
    pub similarity: Option<f32>,
}

/// Search parameters derived from a slot's recent activity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SlotProfile {
    /// Hop budget for local traversal.
    pub hop_budget: u32,
    /// Exploration slack applied to association neighbours.
    pub explore_eps: f32,
    /// Whether the slot is pinned.
    pub pinned: bool,
    /// Whether the slot was used within the hot window.
    pub hot: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_id_labels() {
        assert_eq!(SlotId::nth(0).to_string(), "A");
        assert_eq!(SlotId::nth(2).to_string(), "C");
        assert_eq!("b".parse::<SlotId>().unwrap(), SlotId(1));
        assert!("AA".parse::<SlotId>().is_err());
        assert!("".parse::<SlotId>().is_err());
        assert!("7".parse::<SlotId>().is_err());
    }

    #[test]
    fn test_slot_id_serializes_as_letter() {
        let json = serde_json::to_string(&SlotId(1)).unwrap();
        assert_eq!(json, "\"B\"");
        let back: SlotId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, SlotId(1));
    }

    #[test]
    fn test_placement_extends_head() {
        assert!(Placement::ExistingBranch.extends_head());
        assert!(Placement::Divergence.extends_head());
        assert!(!Placement::NewContext.extends_head());
        assert!(!Placement::GlobalReallocation.extends_head());
    }
}
