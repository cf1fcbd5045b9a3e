//! Contract of the external text pipeline.

use crate::error::MnemoResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Features extracted from a piece of content.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextFeatures {
    /// Keywords.
    pub keywords: BTreeSet<String>,
    /// Tags.
    pub tags: BTreeSet<String>,
    /// Embedding vector.
    pub embedding: Vec<f32>,
}

/// Turns raw content into keywords, tags, and an embedding.
///
/// The engine depends only on this contract and ships no implementation.
#[async_trait]
pub trait TextAnalyzer: Send + Sync {
    /// Analyze `content`.
    async fn analyze(&self, content: &str) -> MnemoResult<TextFeatures>;
}
