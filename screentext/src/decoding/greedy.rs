use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::inference::{DecoderFeeds, DecoderInference, EncoderHiddenStates};
use super::scoring::{softmax, top_k};
use super::sequence::TokenSequence;
use super::{DecoderOptions, SequenceGenerator};
use crate::error::{OcrError, Result};

/// Always extends the single hypothesis with its most probable next token.
#[derive(Debug, Clone)]
pub struct GreedyDecoder {
    options: DecoderOptions,
}

impl GreedyDecoder {
    pub fn new(options: DecoderOptions) -> Self {
        Self { options }
    }

    pub async fn decode(
        &self,
        inference: &dyn DecoderInference,
        hidden_states: Arc<EncoderHiddenStates>,
    ) -> Result<TokenSequence> {
        let mut sequence = self.options.seed_sequence();

        while !sequence.eos_reached() {
            let feeds = DecoderFeeds::new(&sequence.token_ids(), Arc::clone(&hidden_states));
            let logits = inference.run(feeds).await?;
            let probabilities = softmax(logits.last_position());

            let next = top_k(&probabilities, 1)
                .into_iter()
                .next()
                .ok_or_else(|| OcrError::Decode("empty probability distribution".to_string()))?;
            sequence.add_token(next);
        }

        debug!(
            length = sequence.len(),
            score = sequence.score(),
            "Greedy decoding finished"
        );

        Ok(sequence)
    }
}

#[async_trait]
impl SequenceGenerator for GreedyDecoder {
    async fn generate(
        &self,
        inference: &dyn DecoderInference,
        hidden_states: Arc<EncoderHiddenStates>,
    ) -> Result<Vec<TokenSequence>> {
        Ok(vec![self.decode(inference, hidden_states).await?])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoding::mock_inference::{hidden, ScriptedInference};

    fn options(max_sequence_length: usize) -> DecoderOptions {
        DecoderOptions {
            start_token_id: 2,
            eos_token_id: 3,
            max_sequence_length,
            min_token_index: 5,
            length_penalty: 2.0,
        }
    }

    #[tokio::test]
    async fn test_follows_argmax_until_eos() {
        // 2 -> 5 -> 6 -> 3
        let inference = ScriptedInference::sequence(8, &[5, 6, 3]);
        let decoder = GreedyDecoder::new(options(20));

        let seq = decoder.decode(&inference, hidden()).await.unwrap();
        assert_eq!(seq.token_ids(), vec![2, 5, 6, 3]);
        assert!(seq.eos_reached());
        assert_eq!(inference.calls(), 3);
    }

    #[tokio::test]
    async fn test_stops_at_length_cap() {
        let inference = ScriptedInference::constant(8, 6);
        let decoder = GreedyDecoder::new(options(4));

        let seq = decoder.decode(&inference, hidden()).await.unwrap();
        assert_eq!(seq.len(), 4);
        assert_eq!(inference.calls(), 3);
    }

    #[tokio::test]
    async fn test_is_deterministic() {
        let decoder = GreedyDecoder::new(options(20));
        let first = decoder
            .decode(&ScriptedInference::sequence(8, &[7, 5, 7, 3]), hidden())
            .await
            .unwrap();
        let second = decoder
            .decode(&ScriptedInference::sequence(8, &[7, 5, 7, 3]), hidden())
            .await
            .unwrap();
        assert_eq!(first.token_ids(), second.token_ids());
    }

    #[tokio::test]
    async fn test_feeds_grow_by_one_token_per_step() {
        let inference = ScriptedInference::sequence(8, &[5, 6, 3]);
        let decoder = GreedyDecoder::new(options(20));
        decoder.decode(&inference, hidden()).await.unwrap();

        let lengths: Vec<usize> = inference.seen_inputs().iter().map(Vec::len).collect();
        assert_eq!(lengths, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_inference_failure_propagates() {
        let inference = ScriptedInference::failing(8);
        let decoder = GreedyDecoder::new(options(20));

        let result = decoder.decode(&inference, hidden()).await;
        assert!(matches!(result, Err(OcrError::Inference(_))));
    }
}
