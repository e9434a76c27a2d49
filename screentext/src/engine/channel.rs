//! Request/response channel to a local recognition service.
//!
//! The adapter only talks to [`RecognitionChannel`]; [`HttpRecognitionChannel`]
//! is the JSON-over-HTTP implementation used by the bundled service:
//!
//! - `POST /recognize` with `{id, image, language}` (image base64-encoded)
//! - `GET /languages` returning `{languages: [...]}`
//! - `POST /settings` with the settings record, returning `{ok}`

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::request::RecognitionResult;
use super::settings::EngineSettings;
use crate::error::{OcrError, Result};

#[async_trait]
pub trait RecognitionChannel: Send + Sync {
    async fn recognize_bytes(
        &self,
        id: &str,
        image_bytes: &[u8],
        language_code: &str,
    ) -> Result<RecognitionResult>;

    async fn supported_languages(&self) -> Result<Vec<String>>;

    async fn update_settings(&self, settings: &EngineSettings) -> Result<()>;
}

/// Opens channels to a service at an announced address.
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn connect(&self, address: &str) -> Result<Arc<dyn RecognitionChannel>>;
}

#[derive(Debug, Serialize)]
struct RecognizeRequest<'a> {
    id: &'a str,
    image: String,
    language: &'a str,
}

#[derive(Debug, Deserialize)]
struct LanguagesResponse {
    languages: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct AckResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Clone, Debug)]
pub struct HttpRecognitionChannel {
    client: Client,
    base_url: String,
}

impl HttpRecognitionChannel {
    pub fn new(address: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OcrError::Rpc(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url(address),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Err(OcrError::Rpc(format!("service returned {status}: {body}")))
    }
}

fn base_url(address: &str) -> String {
    let address = address.trim().trim_end_matches('/');
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{address}")
    }
}

/// Transport failures stay `Http`; a body that does not parse is `Decode`.
async fn read_body<T: DeserializeOwned>(resp: reqwest::Response, what: &str) -> Result<T> {
    let body = resp.text().await?;
    serde_json::from_str(&body)
        .map_err(|e| OcrError::Decode(format!("Malformed {what} response: {e}")))
}

#[async_trait]
impl RecognitionChannel for HttpRecognitionChannel {
    async fn recognize_bytes(
        &self,
        id: &str,
        image_bytes: &[u8],
        language_code: &str,
    ) -> Result<RecognitionResult> {
        let body = RecognizeRequest {
            id,
            image: STANDARD.encode(image_bytes),
            language: language_code,
        };

        debug!(id, bytes = image_bytes.len(), language = language_code, "RecognizeBytes");

        let resp = self
            .client
            .post(format!("{}/recognize", self.base_url))
            .json(&body)
            .send()
            .await?;

        let resp = Self::check(resp).await?;
        read_body(resp, "recognition").await
    }

    async fn supported_languages(&self) -> Result<Vec<String>> {
        let resp = self
            .client
            .get(format!("{}/languages", self.base_url))
            .send()
            .await?;

        let resp = Self::check(resp).await?;
        let languages: LanguagesResponse = read_body(resp, "languages").await?;
        Ok(languages.languages)
    }

    async fn update_settings(&self, settings: &EngineSettings) -> Result<()> {
        let resp = self
            .client
            .post(format!("{}/settings", self.base_url))
            .json(settings)
            .send()
            .await?;

        let resp = Self::check(resp).await?;
        let ack: AckResponse = read_body(resp, "settings").await?;

        if ack.ok {
            Ok(())
        } else {
            Err(OcrError::Rpc(format!(
                "service rejected settings: {}",
                ack.error.unwrap_or_else(|| "no reason given".to_string())
            )))
        }
    }
}

/// Connects [`HttpRecognitionChannel`]s with a shared request timeout.
#[derive(Clone, Debug)]
pub struct HttpConnector {
    timeout: Duration,
}

impl HttpConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ChannelConnector for HttpConnector {
    async fn connect(&self, address: &str) -> Result<Arc<dyn RecognitionChannel>> {
        if address.trim().is_empty() {
            return Err(OcrError::Rpc("empty service address".to_string()));
        }
        Ok(Arc::new(HttpRecognitionChannel::new(address, self.timeout)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_adds_scheme() {
        assert_eq!(base_url("127.0.0.1:5000"), "http://127.0.0.1:5000");
        assert_eq!(base_url("http://localhost:9/"), "http://localhost:9");
        assert_eq!(base_url("https://ocr.local"), "https://ocr.local");
    }

    #[tokio::test]
    async fn test_connector_rejects_empty_address() {
        let connector = HttpConnector::new(Duration::from_secs(1));
        assert!(matches!(
            connector.connect("  ").await,
            Err(OcrError::Rpc(_))
        ));
    }

    #[test]
    fn test_recognize_request_shape() {
        let body = RecognizeRequest {
            id: "abc",
            image: STANDARD.encode([0xFF, 0xD8, 0xFF, 0xE0]),
            language: "ja",
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["image"], "/9j/4A==");
        assert_eq!(json["language"], "ja");
    }
}
