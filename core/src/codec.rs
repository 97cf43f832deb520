//! Flat text encoding for configuration sets.
//!
//! The scheduler serializes the whole configuration set into a single
//! environment variable; every array task decodes it back independently.
//! The transform is pure and must round-trip every field, including the
//! open-ended value maps and both solver reference forms.

use crate::config::Configuration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("failed to encode configuration set")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode configuration set")]
    Decode(#[source] serde_json::Error),
}

pub fn encode(configurations: &[Configuration]) -> Result<String, CodecError> {
    serde_json::to_string(configurations).map_err(CodecError::Encode)
}

pub fn decode(text: &str) -> Result<Vec<Configuration>, CodecError> {
    serde_json::from_str(text).map_err(CodecError::Decode)
}
