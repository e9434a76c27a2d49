use serde::{Deserialize, Serialize};
use tracing::warn;

/// Image widths handed to the engine must be a multiple of this.
pub const WIDTH_BLOCK_SIZE: u32 = 32;

/// Per-engine tuning pushed to the recognition service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    pub threads: u32,
    pub max_image_width: u32,
    /// Inference backend, e.g. `cpu`, `cuda`, `directml`.
    pub inference_runtime: String,
    pub text_score_threshold: f32,
    pub use_angle_classifier: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            threads: 4,
            max_image_width: 960,
            inference_runtime: "cpu".to_string(),
            text_score_threshold: 0.5,
            use_angle_classifier: false,
        }
    }
}

/// Outcome of [`OcrEngineAdapter::update_settings`](super::OcrEngineAdapter::update_settings).
#[derive(Debug, Clone, PartialEq)]
pub struct SettingsUpdate {
    pub settings: EngineSettings,
    /// The engine has to be restarted to pick the settings up.
    pub restart: bool,
}

impl EngineSettings {
    /// Replace invalid values with the previous ones, or the defaults.
    pub fn validated(mut self, previous: Option<&EngineSettings>) -> Self {
        let fallback = previous.cloned().unwrap_or_default();

        if self.threads == 0 {
            warn!(fallback = fallback.threads, "Thread count must be positive");
            self.threads = fallback.threads;
        }
        if !is_valid_width(self.max_image_width) {
            warn!(
                width = self.max_image_width,
                fallback = fallback.max_image_width,
                "Max image width must be a positive multiple of {}",
                WIDTH_BLOCK_SIZE
            );
            self.max_image_width = fallback.max_image_width;
        }
        if self.inference_runtime.trim().is_empty() {
            self.inference_runtime = fallback.inference_runtime;
        }
        self
    }

    /// Whether switching from `self` to `other` needs an engine restart.
    pub fn requires_restart(&self, other: &EngineSettings) -> bool {
        self.threads != other.threads
            || self.max_image_width != other.max_image_width
            || self.inference_runtime != other.inference_runtime
    }
}

pub fn is_valid_width(width: u32) -> bool {
    width > 0 && width % WIDTH_BLOCK_SIZE == 0
}
