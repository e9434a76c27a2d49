//! OCR engines behind a uniform adapter.
//!
//! Every engine is wrapped in an [`OcrEngineAdapter`], which owns its
//! [`OcrAdapterStatus`] and serializes recognition:
//!
//! - `Service`: a local recognition service reached over a
//!   [`RecognitionChannel`], optionally spawned and watched by a
//!   [`ProcessSupervisor`]
//! - `Cloud`: a vision chat API ([`CloudVisionClient`])
//! - `Manga`: an image encoder plus an autoregressive text decoder
//!   ([`MangaOcr`])
//!
//! # Usage
//!
//! ```rust,ignore
//! let adapter = OcrEngineAdapter::from_config(&config)?;
//! adapter.start().await?;
//! if let Some(result) = adapter.recognize(RecognitionRequest::new(png, "ja")).await {
//!     println!("{}", result.text());
//! }
//! adapter.shutdown().await;
//! ```

mod adapter;
mod channel;
mod cloud;
mod manga;
mod preprocess;
mod request;
mod settings;
mod status;
mod supervisor;

pub use adapter::{OcrEngineAdapter, ServiceOptions};
pub use channel::{ChannelConnector, HttpConnector, HttpRecognitionChannel, RecognitionChannel};
pub use cloud::{CloudProvider, CloudVisionClient};
pub use manga::{ImageEncoder, MangaOcr, MANGA_LANGUAGES};
pub use preprocess::{decode_image, pixel_values, post_process, prepare, PixelValues};
pub use request::{BoundingBox, RecognitionRequest, RecognitionResult, RecognizedText, Resolution};
pub use settings::{is_valid_width, EngineSettings, SettingsUpdate, WIDTH_BLOCK_SIZE};
pub use status::{OcrAdapterStatus, StatusEvent};
pub use supervisor::{HealthCheck, ProcessExit, ProcessSpec, ProcessSupervisor};
