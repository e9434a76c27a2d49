use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::inference::{DecoderFeeds, DecoderInference, EncoderHiddenStates, Logits};
use crate::error::{OcrError, Result};

type LogitsFn = dyn Fn(&[i64]) -> Vec<f32> + Send + Sync;

/// Decoder stand-in whose logits are a function of the input token ids.
pub struct ScriptedInference {
    vocab_size: usize,
    logits: Option<Box<LogitsFn>>,
    seen: Mutex<Vec<Vec<i64>>>,
}

pub fn hidden() -> Arc<EncoderHiddenStates> {
    Arc::new(EncoderHiddenStates::new(vec![0.0; 8], vec![1, 2, 4]))
}

/// Logits that put most of the mass on `id`.
pub fn favoring(vocab_size: usize, id: u32) -> Vec<f32> {
    let mut row = vec![0.0; vocab_size];
    row[id as usize] = 5.0;
    row
}

impl ScriptedInference {
    pub fn from_fn<F>(vocab_size: usize, f: F) -> Self
    where
        F: Fn(&[i64]) -> Vec<f32> + Send + Sync + 'static,
    {
        Self {
            vocab_size,
            logits: Some(Box::new(f)),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Emit `script[n]` at step `n`, repeating the last entry afterwards.
    pub fn sequence(vocab_size: usize, script: &[u32]) -> Self {
        let script = script.to_vec();
        Self::from_fn(vocab_size, move |ids| {
            let step = (ids.len() - 1).min(script.len() - 1);
            favoring(vocab_size, script[step])
        })
    }

    pub fn constant(vocab_size: usize, id: u32) -> Self {
        Self::from_fn(vocab_size, move |_| favoring(vocab_size, id))
    }

    pub fn failing(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            logits: None,
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn seen_inputs(&self) -> Vec<Vec<i64>> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl DecoderInference for ScriptedInference {
    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    async fn run(&self, feeds: DecoderFeeds) -> Result<Logits> {
        self.seen
            .lock()
            .unwrap()
            .push(feeds.input_token_ids.clone());

        let Some(f) = &self.logits else {
            return Err(OcrError::Inference("session closed".to_string()));
        };

        // Previous positions are padding; only the last row is read.
        let mut data = vec![0.0; self.vocab_size * (feeds.sequence_length() - 1)];
        data.extend(f(&feeds.input_token_ids));
        Logits::new(data, self.vocab_size)
    }
}
