use crate::types::{InferenceScore, TokenSequence};
use anyhow::Result;
use async_trait::async_trait;

#[async_trait]
pub trait Engine {
    async fn score(&self, sequence: TokenSequence) -> Result<InferenceScore>;
}

/// Scores several sequences in one pass. The outer error fails the whole
/// batch; inner errors belong to a single sequence.
#[async_trait]
pub trait BatchedEngine: Send + Sync {
    async fn score_batch(
        &self,
        sequences: Vec<TokenSequence>,
    ) -> Result<Vec<Result<InferenceScore>>>;
}
