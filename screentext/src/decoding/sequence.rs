use super::vocab::Vocabulary;

/// One generated token: vocabulary index and its probability.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Token {
    pub id: u32,
    pub score: f32,
}

impl Token {
    /// A seed token carries probability 1 so it does not affect the score.
    pub fn seed(id: u32) -> Self {
        Self { id, score: 1.0 }
    }
}

/// A decoding hypothesis.
///
/// `eos_reached` latches once the end-of-sequence token is appended or the
/// length cap is hit; it is never reset.
#[derive(Debug, Clone)]
pub struct TokenSequence {
    tokens: Vec<Token>,
    eos_token_id: u32,
    max_sequence_length: usize,
    length_penalty: f64,
    eos_reached: bool,
}

impl TokenSequence {
    pub fn new(
        seed: Token,
        eos_token_id: u32,
        max_sequence_length: usize,
        length_penalty: f64,
    ) -> Self {
        let mut tokens = Vec::with_capacity(max_sequence_length.min(512));
        tokens.push(seed);
        Self {
            eos_reached: tokens.len() >= max_sequence_length,
            tokens,
            eos_token_id,
            max_sequence_length,
            length_penalty,
        }
    }

    pub fn add_token(&mut self, token: Token) {
        if self.tokens.len() >= self.max_sequence_length {
            self.eos_reached = true;
            return;
        }

        self.tokens.push(token);
        if token.id == self.eos_token_id || self.tokens.len() >= self.max_sequence_length {
            self.eos_reached = true;
        }
    }

    pub fn eos_reached(&self) -> bool {
        self.eos_reached
    }

    pub fn token_ids(&self) -> Vec<u32> {
        self.tokens.iter().map(|t| t.id).collect()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Length-normalized log-likelihood: `sum(ln p) / len^length_penalty`.
    pub fn score(&self) -> f64 {
        let log_likelihood: f64 = self.tokens.iter().map(|t| (t.score as f64).ln()).sum();
        log_likelihood / (self.tokens.len() as f64).powf(self.length_penalty)
    }

    /// Render the sequence, skipping ids below `min_index` and ids the
    /// vocabulary does not know.
    pub fn to_text(&self, vocab: &Vocabulary, min_index: u32) -> String {
        self.tokens
            .iter()
            .filter(|t| t.id >= min_index)
            .filter_map(|t| vocab.token(t.id))
            .collect()
    }
}
