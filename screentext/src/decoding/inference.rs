use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{OcrError, Result};

/// Encoder output, passed through to the decoder untouched.
///
/// Layout and dtype belong to the inference collaborator; the decoding loop
/// only shares it between steps.
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderHiddenStates {
    pub data: Vec<f32>,
    pub shape: Vec<usize>,
}

impl EncoderHiddenStates {
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Self {
        Self { data, shape }
    }
}

/// Inputs for one decoder step. Rebuilt every step.
#[derive(Debug, Clone)]
pub struct DecoderFeeds {
    /// Token ids generated so far, seed first, shaped `[1, len]`.
    pub input_token_ids: Vec<i64>,
    pub encoder_hidden_states: Arc<EncoderHiddenStates>,
}

impl DecoderFeeds {
    pub fn new(token_ids: &[u32], encoder_hidden_states: Arc<EncoderHiddenStates>) -> Self {
        Self {
            input_token_ids: token_ids.iter().map(|&id| id as i64).collect(),
            encoder_hidden_states,
        }
    }

    pub fn sequence_length(&self) -> usize {
        self.input_token_ids.len()
    }
}

/// Decoder output: one row of `vocab_size` logits per generated position.
#[derive(Debug, Clone)]
pub struct Logits {
    data: Vec<f32>,
    vocab_size: usize,
}

impl Logits {
    pub fn new(data: Vec<f32>, vocab_size: usize) -> Result<Self> {
        if vocab_size == 0 {
            return Err(OcrError::Inference("vocabulary size must be positive".to_string()));
        }
        if data.is_empty() || data.len() % vocab_size != 0 {
            return Err(OcrError::Inference(format!(
                "logits of length {} do not cover whole positions of vocabulary size {}",
                data.len(),
                vocab_size
            )));
        }
        Ok(Self { data, vocab_size })
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// Logits of the most recent position.
    pub fn last_position(&self) -> &[f32] {
        &self.data[self.data.len() - self.vocab_size..]
    }
}

/// The decoder half of a sequence-to-sequence recognizer.
#[async_trait]
pub trait DecoderInference: Send + Sync {
    /// Number of entries in every logits row.
    fn vocab_size(&self) -> usize;

    /// Run one decoder step.
    async fn run(&self, feeds: DecoderFeeds) -> Result<Logits>;
}
