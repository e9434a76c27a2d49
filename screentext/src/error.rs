use thiserror::Error;

use crate::engine::{OcrAdapterStatus, StatusEvent};

#[derive(Error, Debug)]
pub enum OcrError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Invalid status transition: {event:?} while {from:?}")]
    InvalidTransition {
        from: OcrAdapterStatus,
        event: StatusEvent,
    },

    #[error("Inference error: {0}")]
    Inference(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Image error: {0}")]
    Image(String),

    #[error("Timed out after {0} seconds")]
    Timeout(u64),
}

impl OcrError {
    /// Failures of the engine or its transport, as opposed to caller mistakes.
    pub fn is_engine_failure(&self) -> bool {
        matches!(
            self,
            OcrError::Http(_)
                | OcrError::Rpc(_)
                | OcrError::Process(_)
                | OcrError::Engine(_)
                | OcrError::EngineUnavailable(_)
                | OcrError::Timeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, OcrError>;
