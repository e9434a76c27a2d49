use serde::{Deserialize, Serialize};

/// One image to recognize.
#[derive(Debug, Clone, PartialEq)]
pub struct RecognitionRequest {
    pub image_bytes: Vec<u8>,
    pub language_code: String,
    /// Set when re-recognizing part of an earlier result.
    pub result_id: Option<String>,
    pub region_id: Option<String>,
}

impl RecognitionRequest {
    pub fn new(image_bytes: Vec<u8>, language_code: impl Into<String>) -> Self {
        Self {
            image_bytes,
            language_code: language_code.into(),
            result_id: None,
            region_id: None,
        }
    }

    pub fn with_region(mut self, result_id: impl Into<String>, region_id: impl Into<String>) -> Self {
        self.result_id = Some(result_id.into());
        self.region_id = Some(region_id.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// A line or block of recognized text. Coordinates are in the context
/// resolution's pixel space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognizedText {
    pub text: String,
    #[serde(default)]
    pub confidence: Option<f32>,
    #[serde(default)]
    pub bounding_box: Option<BoundingBox>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RecognitionResult {
    #[serde(default)]
    pub context_resolution: Option<Resolution>,
    #[serde(default)]
    pub results: Vec<RecognizedText>,
    /// Echoed from the request for partial re-recognition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region_id: Option<String>,
}

impl RecognitionResult {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            results: vec![RecognizedText {
                text: text.into(),
                confidence: None,
                bounding_box: None,
            }],
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.results.iter().all(|r| r.text.trim().is_empty())
    }

    /// All recognized text joined by newlines.
    pub fn text(&self) -> String {
        self.results
            .iter()
            .map(|r| r.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub(crate) fn for_request(mut self, request: &RecognitionRequest) -> Self {
        self.result_id = request.result_id.clone();
        self.region_id = request.region_id.clone();
        self
    }
}
