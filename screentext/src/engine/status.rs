use std::fmt;

use serde::Serialize;

use crate::error::{OcrError, Result};

/// Lifecycle status of one engine adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OcrAdapterStatus {
    Disabled,
    Enabled,
    Restarting,
    Processing,
}

/// Events that move an adapter between statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusEvent {
    /// The engine is bound and ready to serve.
    Initialize,
    BeginRecognition,
    FinishRecognition,
    BeginRestart,
    Disable,
}

impl Default for OcrAdapterStatus {
    fn default() -> Self {
        Self::Disabled
    }
}

impl fmt::Display for OcrAdapterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disabled => "disabled",
            Self::Enabled => "enabled",
            Self::Restarting => "restarting",
            Self::Processing => "processing",
        };
        f.write_str(name)
    }
}

impl OcrAdapterStatus {
    /// The transition table. Anything not listed here is rejected.
    pub fn transition(self, event: StatusEvent) -> Result<Self> {
        use OcrAdapterStatus::*;
        use StatusEvent::*;

        match (self, event) {
            (Disabled | Restarting | Enabled, Initialize) => Ok(Enabled),
            (Enabled, BeginRecognition) => Ok(Processing),
            (Processing, FinishRecognition) => Ok(Enabled),
            (_, BeginRestart) => Ok(Restarting),
            (_, Disable) => Ok(Disabled),
            (from, event) => Err(OcrError::InvalidTransition { from, event }),
        }
    }
}
