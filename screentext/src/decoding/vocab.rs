use std::path::Path;

use crate::error::{OcrError, Result};

/// Token table mapping vocabulary ids to their surface strings.
#[derive(Debug, Clone, Default)]
pub struct Vocabulary {
    tokens: Vec<String>,
}

impl Vocabulary {
    pub fn from_tokens<I>(tokens: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        Self {
            tokens: tokens.into_iter().collect(),
        }
    }

    /// Load a newline-separated vocabulary file, one token per line.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| {
            OcrError::Config(format!("Failed to read vocabulary {}: {e}", path.display()))
        })?;

        let vocab = Self::from_tokens(data.lines().map(|line| line.trim_end_matches('\r').to_string()));
        if vocab.is_empty() {
            return Err(OcrError::Config(format!(
                "Vocabulary {} is empty",
                path.display()
            )));
        }

        tracing::debug!(path = %path.display(), size = vocab.len(), "Vocabulary loaded");
        Ok(vocab)
    }

    pub fn token(&self, id: u32) -> Option<&str> {
        self.tokens.get(id as usize).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}
