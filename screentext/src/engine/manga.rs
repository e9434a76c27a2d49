use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::preprocess::{post_process, prepare, PixelValues};
use crate::config::{DecoderConfig, MangaConfig};
use crate::decoding::{DecoderInference, EncoderHiddenStates, SequenceDecoder, Vocabulary};
use crate::error::{OcrError, Result};

pub const MANGA_LANGUAGES: &[&str] = &["ja"];

/// The vision half of the recognizer: pixels in, hidden states out.
#[async_trait]
pub trait ImageEncoder: Send + Sync {
    async fn encode(&self, pixels: PixelValues) -> Result<EncoderHiddenStates>;
}

/// Vision encoder + autoregressive text decoder for manga speech bubbles.
pub struct MangaOcr {
    encoder: Arc<dyn ImageEncoder>,
    decoder: SequenceDecoder,
    image_size: u32,
}

impl MangaOcr {
    pub fn new(encoder: Arc<dyn ImageEncoder>, decoder: SequenceDecoder, image_size: u32) -> Self {
        Self {
            encoder,
            decoder,
            image_size,
        }
    }

    /// Wire up the model halves with the vocabulary and decoder settings
    /// from the configuration.
    pub fn from_config(
        encoder: Arc<dyn ImageEncoder>,
        inference: Arc<dyn DecoderInference>,
        manga: &MangaConfig,
        decoder: &DecoderConfig,
    ) -> Result<Self> {
        let vocab = Arc::new(Vocabulary::from_file(&manga.vocab_path)?);
        let decoder = SequenceDecoder::new(inference, vocab, decoder.options(), decoder.strategy());
        Ok(Self::new(encoder, decoder, manga.image_size))
    }

    pub async fn recognize(&self, image_bytes: &[u8]) -> Result<String> {
        let bytes = image_bytes.to_vec();
        let size = self.image_size;
        let pixels = tokio::task::spawn_blocking(move || prepare(&bytes, size))
            .await
            .map_err(|e| OcrError::Image(format!("Preprocessing task panicked: {e}")))??;

        let hidden_states = self.encoder.encode(pixels).await?;
        let decoded = self.decoder.generate(hidden_states).await?;

        let best = decoded
            .into_iter()
            .next()
            .ok_or_else(|| OcrError::Decode("decoder returned no sequences".to_string()))?;

        debug!(
            strategy = ?self.decoder.strategy(),
            score = best.score,
            "Manga text decoded"
        );

        Ok(post_process(&best.text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoding::mock_inference::ScriptedInference;
    use crate::decoding::{DecodeStrategy, DecoderOptions};
    use image::{DynamicImage, ImageFormat, Luma};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingEncoder {
        shapes: Mutex<Vec<[usize; 4]>>,
    }

    #[async_trait]
    impl ImageEncoder for RecordingEncoder {
        async fn encode(&self, pixels: PixelValues) -> Result<EncoderHiddenStates> {
            self.shapes.lock().unwrap().push(pixels.shape);
            Ok(EncoderHiddenStates::new(vec![0.0; 4], vec![1, 1, 4]))
        }
    }

    fn vocab() -> Arc<Vocabulary> {
        Arc::new(Vocabulary::from_tokens(
            ["[PAD]", "[UNK]", "[CLS]", "[SEP]", "[MASK]", "な", "に", "…"]
                .iter()
                .map(|s| s.to_string()),
        ))
    }

    fn png() -> Vec<u8> {
        let img = DynamicImage::ImageLuma8(image::GrayImage::from_pixel(30, 12, Luma([40])));
        let mut out = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut out), ImageFormat::Png)
            .unwrap();
        out
    }

    fn manga(script: &[u32], strategy: DecodeStrategy) -> (MangaOcr, Arc<RecordingEncoder>) {
        let encoder = Arc::new(RecordingEncoder::default());
        let decoder = SequenceDecoder::new(
            Arc::new(ScriptedInference::sequence(8, script)),
            vocab(),
            DecoderOptions::default(),
            strategy,
        );
        (MangaOcr::new(encoder.clone(), decoder, 32), encoder)
    }

    #[tokio::test]
    async fn test_recognize_decodes_and_post_processes() {
        let (ocr, encoder) = manga(&[5, 6, 7, 3], DecodeStrategy::Greedy);

        let text = ocr.recognize(&png()).await.unwrap();
        assert_eq!(text, "なに...");
        assert_eq!(encoder.shapes.lock().unwrap().as_slice(), &[[1, 3, 32, 32]]);
    }

    #[tokio::test]
    async fn test_beam_strategy_returns_best_text() {
        let (ocr, _) = manga(&[6, 3], DecodeStrategy::Beam { width: 3 });
        assert_eq!(ocr.recognize(&png()).await.unwrap(), "に");
    }

    #[tokio::test]
    async fn test_from_config_loads_vocabulary() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[PAD]\n[UNK]\n[CLS]\n[SEP]\n[MASK]\nな\nに\n…\n").unwrap();

        let manga = MangaConfig {
            vocab_path: file.path().to_path_buf(),
            image_size: 16,
        };
        let encoder = Arc::new(RecordingEncoder::default());
        let ocr = MangaOcr::from_config(
            encoder.clone(),
            Arc::new(ScriptedInference::sequence(8, &[6, 5, 3])),
            &manga,
            &DecoderConfig::default(),
        )
        .unwrap();

        assert_eq!(ocr.recognize(&png()).await.unwrap(), "にな");
        assert_eq!(encoder.shapes.lock().unwrap().as_slice(), &[[1, 3, 16, 16]]);
    }

    #[test]
    fn test_from_config_needs_vocabulary_file() {
        let manga = MangaConfig {
            vocab_path: "/nonexistent/vocab.txt".into(),
            image_size: 16,
        };
        let result = MangaOcr::from_config(
            Arc::new(RecordingEncoder::default()),
            Arc::new(ScriptedInference::constant(8, 3)),
            &manga,
            &DecoderConfig::default(),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_undecodable_image_fails_before_encoding() {
        let (ocr, encoder) = manga(&[3], DecodeStrategy::Greedy);
        let result = ocr.recognize(b"garbage").await;
        assert!(matches!(result, Err(OcrError::Image(_))));
        assert!(encoder.shapes.lock().unwrap().is_empty());
    }
}
