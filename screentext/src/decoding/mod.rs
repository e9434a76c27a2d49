//! Autoregressive decoding for sequence-to-sequence text recognizers.
//!
//! An encoder turns the image into hidden states once; the decoder is then
//! stepped token by token through [`DecoderInference`]. Each step's logits
//! are normalized with [`softmax`] and the next tokens picked with [`top_k`].
//!
//! Two strategies share the [`SequenceGenerator`] interface:
//! - [`GreedyDecoder`] keeps a single hypothesis and always takes the argmax
//! - [`BeamSearchDecoder`] keeps the `k` best hypotheses by
//!   `sum(ln p) / len^length_penalty`
//!
//! [`SequenceDecoder`] picks the strategy from a [`DecodeStrategy`] and turns
//! the resulting sequences into text.

mod beam;
mod greedy;
mod inference;
#[cfg(test)]
pub(crate) mod mock_inference;
mod scoring;
mod sequence;
mod vocab;

use std::sync::Arc;

use async_trait::async_trait;

pub use beam::BeamSearchDecoder;
pub use greedy::GreedyDecoder;
pub use inference::{DecoderFeeds, DecoderInference, EncoderHiddenStates, Logits};
pub use scoring::{softmax, top_k};
pub use sequence::{Token, TokenSequence};
pub use vocab::Vocabulary;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStrategy {
    Greedy,
    Beam { width: usize },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecoderOptions {
    pub start_token_id: u32,
    pub eos_token_id: u32,
    pub max_sequence_length: usize,
    /// Ids below this are special tokens and never rendered.
    pub min_token_index: u32,
    pub length_penalty: f64,
}

impl Default for DecoderOptions {
    fn default() -> Self {
        Self {
            start_token_id: 2,
            eos_token_id: 3,
            max_sequence_length: 300,
            min_token_index: 5,
            length_penalty: 2.0,
        }
    }
}

impl DecoderOptions {
    pub fn seed_sequence(&self) -> TokenSequence {
        TokenSequence::new(
            Token::seed(self.start_token_id),
            self.eos_token_id,
            self.max_sequence_length,
            self.length_penalty,
        )
    }
}

/// Common interface of the decoding strategies.
#[async_trait]
pub trait SequenceGenerator: Send + Sync {
    /// Decode until every kept hypothesis terminates. Best sequence first.
    async fn generate(
        &self,
        inference: &dyn DecoderInference,
        hidden_states: Arc<EncoderHiddenStates>,
    ) -> Result<Vec<TokenSequence>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedText {
    pub text: String,
    pub score: f64,
}

/// A decoder bound to an inference session and a vocabulary.
pub struct SequenceDecoder {
    inference: Arc<dyn DecoderInference>,
    generator: Box<dyn SequenceGenerator>,
    vocab: Arc<Vocabulary>,
    options: DecoderOptions,
    strategy: DecodeStrategy,
}

impl SequenceDecoder {
    pub fn new(
        inference: Arc<dyn DecoderInference>,
        vocab: Arc<Vocabulary>,
        options: DecoderOptions,
        strategy: DecodeStrategy,
    ) -> Self {
        let generator: Box<dyn SequenceGenerator> = match strategy {
            DecodeStrategy::Greedy => Box::new(GreedyDecoder::new(options)),
            DecodeStrategy::Beam { width } => Box::new(BeamSearchDecoder::new(options, width)),
        };

        if inference.vocab_size() != vocab.len() {
            tracing::warn!(
                decoder_vocab = inference.vocab_size(),
                table_vocab = vocab.len(),
                "Decoder and vocabulary table sizes differ"
            );
        }

        Self {
            inference,
            generator,
            vocab,
            options,
            strategy,
        }
    }

    pub fn strategy(&self) -> DecodeStrategy {
        self.strategy
    }

    /// Decode the hidden states into ranked texts, best first.
    pub async fn generate(&self, hidden_states: EncoderHiddenStates) -> Result<Vec<DecodedText>> {
        let sequences = self
            .generator
            .generate(self.inference.as_ref(), Arc::new(hidden_states))
            .await?;

        Ok(sequences
            .iter()
            .map(|seq| DecodedText {
                text: seq.to_text(&self.vocab, self.options.min_token_index),
                score: seq.score(),
            })
            .collect())
    }
}
