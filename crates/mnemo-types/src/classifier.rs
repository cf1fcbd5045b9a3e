//! Pair classification contract used by consolidation.

use crate::block::Block;
use crate::consolidation::PairVerdict;
use crate::error::MnemoResult;
use async_trait::async_trait;

/// Decides whether two blocks are related and how.
///
/// Implementations may be local rules or a remote model. An implementation
/// that cannot reach its backend returns
/// [`MnemoError::ClassifierUnavailable`](crate::error::MnemoError::ClassifierUnavailable);
/// the pipeline then requeues the entry instead of recording a verdict.
#[async_trait]
pub trait PairClassifier: Send + Sync {
    /// Classify the pair `(a, b)` whose embeddings have cosine similarity `cosine`.
    async fn classify(&self, a: &Block, b: &Block, cosine: f32) -> MnemoResult<PairVerdict>;

    /// Short name recorded in association metadata.
    fn name(&self) -> &str;
}
