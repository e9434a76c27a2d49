//! Screen-capture text recognition.
//!
//! - [`engine`]: OCR engines behind a status machine that coalesces requests
//!   and restarts failed engines
//! - [`decoding`]: greedy and beam-search decoding for sequence-to-sequence
//!   recognizers
//! - [`config`]: environment-driven configuration

pub mod config;
pub mod decoding;
pub mod engine;
pub mod error;

pub use error::{OcrError, Result};
