use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{parse_cloud_provider_model, CloudOcrConfig};
use crate::error::{OcrError, Result};

/// Vision chat providers that can transcribe images.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudProvider {
    OpenAi,
    Mistral,
    DeepSeek,
}

impl CloudProvider {
    fn from_prefix(prefix: &str) -> Self {
        match prefix.to_lowercase().as_str() {
            "mistral" => CloudProvider::Mistral,
            "deepseek" => CloudProvider::DeepSeek,
            _ => CloudProvider::OpenAi,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CloudProvider::OpenAi => "openai",
            CloudProvider::Mistral => "mistral",
            CloudProvider::DeepSeek => "deepseek",
        }
    }

    fn default_base_url(&self) -> &'static str {
        match self {
            CloudProvider::OpenAi => "https://api.openai.com/v1",
            CloudProvider::Mistral => "https://api.mistral.ai/v1",
            CloudProvider::DeepSeek => "https://api.deepseek.com/v1",
        }
    }
}

#[derive(Clone, Debug)]
pub struct CloudVisionClient {
    client: Client,
    provider: CloudProvider,
    model: String,
    api_key: String,
    base_url: String,
    max_retries: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: Vec<ContentPart>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Debug, Deserialize)]
struct ChatMessageResponse {
    content: Option<String>,
}

fn transcription_prompt(language_code: &str) -> String {
    format!(
        "Extract all text from this image. The text is most likely in the language \
         with code '{language_code}'. Return only the extracted text without any \
         explanations or formatting."
    )
}

/// MIME type for the data URL. Unrecognized bytes are sent as PNG.
fn image_mime(image_bytes: &[u8]) -> &'static str {
    image::guess_format(image_bytes)
        .map(|format| format.to_mime_type())
        .unwrap_or("image/png")
}

impl CloudVisionClient {
    pub fn new(config: &CloudOcrConfig) -> Result<Self> {
        let (prefix, model) = parse_cloud_provider_model(&config.model);
        let provider = CloudProvider::from_prefix(prefix);

        let api_key = config.api_key.clone().ok_or_else(|| {
            OcrError::Config(format!("API key required for {} OCR", provider.name()))
        })?;

        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| provider.default_base_url().to_string())
            .trim_end_matches('/')
            .to_string();

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| OcrError::Config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            provider,
            model: model.to_string(),
            api_key,
            base_url,
            max_retries: config.max_retries.max(1),
        })
    }

    pub fn provider(&self) -> CloudProvider {
        self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Transcribe the text in an image.
    pub async fn recognize(&self, image_bytes: &[u8], language_code: &str) -> Result<String> {
        let data_url = format!(
            "data:{};base64,{}",
            image_mime(image_bytes),
            STANDARD.encode(image_bytes)
        );

        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: vec![
                    ContentPart::Text {
                        text: transcription_prompt(language_code),
                    },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl { url: data_url },
                    },
                ],
            }],
            max_tokens: 4096,
        };

        let text = self.make_request(&request).await?;
        Ok(text.trim().to_string())
    }

    async fn make_request(&self, request: &ChatRequest) -> Result<String> {
        let mut retries = 0;

        loop {
            let response = self
                .client
                .post(format!("{}/chat/completions", self.base_url))
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(request)
                .send()
                .await;

            match response {
                Ok(resp) => {
                    if resp.status().is_success() {
                        let chat_response: ChatResponse = resp.json().await.map_err(|e| {
                            OcrError::Engine(format!("Failed to parse response: {e}"))
                        })?;

                        return chat_response
                            .choices
                            .into_iter()
                            .next()
                            .and_then(|c| c.message.content)
                            .ok_or_else(|| OcrError::Engine("No response from API".to_string()));
                    } else if resp.status().as_u16() == 429 || resp.status().is_server_error() {
                        retries += 1;
                        if retries >= self.max_retries {
                            return Err(OcrError::Engine(format!(
                                "API request failed after {} retries: {}",
                                self.max_retries,
                                resp.status()
                            )));
                        }
                        warn!(
                            provider = self.provider.name(),
                            status = %resp.status(),
                            retries,
                            "Cloud OCR request throttled or failed, retrying"
                        );
                        tokio::time::sleep(backoff(retries)).await;
                    } else {
                        let status = resp.status();
                        let body = resp.text().await.unwrap_or_default();
                        return Err(OcrError::Engine(format!(
                            "API request failed: {status} - {body}"
                        )));
                    }
                }
                Err(e) => {
                    retries += 1;
                    if retries >= self.max_retries {
                        return Err(OcrError::Http(e));
                    }
                    debug!(provider = self.provider.name(), error = %e, retries, "Retrying cloud OCR request");
                    tokio::time::sleep(backoff(retries)).await;
                }
            }
        }
    }
}

fn backoff(retries: u32) -> Duration {
    Duration::from_millis(100 * 2_u64.pow(retries))
}
