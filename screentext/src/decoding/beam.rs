use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::inference::{DecoderFeeds, DecoderInference, EncoderHiddenStates};
use super::scoring::{softmax, top_k};
use super::sequence::TokenSequence;
use super::{DecoderOptions, SequenceGenerator};
use crate::error::Result;

/// Keeps the `width` best hypotheses by normalized score at every step.
#[derive(Debug, Clone)]
pub struct BeamSearchDecoder {
    options: DecoderOptions,
    width: usize,
}

impl BeamSearchDecoder {
    pub fn new(options: DecoderOptions, width: usize) -> Self {
        Self {
            options,
            width: width.max(1),
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Returns up to `width` sequences, best first.
    pub async fn decode(
        &self,
        inference: &dyn DecoderInference,
        hidden_states: Arc<EncoderHiddenStates>,
    ) -> Result<Vec<TokenSequence>> {
        let k = self.width;
        let seed = self.options.seed_sequence();
        let (mut finished, mut active): (Vec<TokenSequence>, Vec<TokenSequence>) =
            if seed.eos_reached() {
                (vec![seed], Vec::new())
            } else {
                (Vec::new(), vec![seed])
            };

        let mut rounds = 0usize;
        while finished.len() < k && !active.is_empty() {
            let mut candidates = Vec::with_capacity(active.len() * k);

            for hypothesis in &active {
                let feeds = DecoderFeeds::new(&hypothesis.token_ids(), Arc::clone(&hidden_states));
                let logits = inference.run(feeds).await?;
                let probabilities = softmax(logits.last_position());

                for token in top_k(&probabilities, k) {
                    let mut branch = hypothesis.clone();
                    branch.add_token(token);
                    candidates.push(branch);
                }
            }

            rank(&mut candidates);
            candidates.truncate(k);

            active.clear();
            for candidate in candidates {
                if candidate.eos_reached() {
                    finished.push(candidate);
                } else {
                    active.push(candidate);
                }
            }
            rounds += 1;
        }

        let mut ranked = finished;
        if ranked.len() < k {
            ranked.extend(active);
        }
        rank(&mut ranked);
        ranked.truncate(k);

        debug!(
            width = k,
            rounds,
            best_score = ranked.first().map(TokenSequence::score),
            "Beam search finished"
        );

        Ok(ranked)
    }
}

/// Sort by normalized score, best first. Equal scores keep their order.
fn rank(sequences: &mut [TokenSequence]) {
    sequences.sort_by(|a, b| b.score().total_cmp(&a.score()));
}

#[async_trait]
impl SequenceGenerator for BeamSearchDecoder {
    async fn generate(
        &self,
        inference: &dyn DecoderInference,
        hidden_states: Arc<EncoderHiddenStates>,
    ) -> Result<Vec<TokenSequence>> {
        self.decode(inference, hidden_states).await
    }
}
