//! Serialization utilities for Zubridge stores
//!
//! Persisted records and telemetry frames are encoded with one of two
//! self-describing formats. Only the logical shape has to round-trip, so the
//! format can be switched between runs without migrating anything beyond a
//! one-off rehydration miss.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Available serialization formats
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// JSON format - more human-readable, compatible with browsers
    Json,
    /// MessagePack format - more efficient binary format
    MessagePack,
}

impl Default for Format {
    fn default() -> Self {
        Self::Json
    }
}

impl Format {
    /// Short name used in log lines
    pub fn name(&self) -> &'static str {
        match self {
            Format::Json => "json",
            Format::MessagePack => "messagepack",
        }
    }
}

/// Encode data according to the specified format
pub fn encode<T: Serialize>(data: &T, format: Format) -> Result<Vec<u8>> {
    match format {
        Format::Json => serde_json::to_vec(data).map_err(Error::Json),
        // Named encoding keeps struct fields as map keys so the payload decodes
        // back into a `serde_json::Value` object.
        Format::MessagePack => rmp_serde::to_vec_named(data).map_err(Error::MessagePack),
    }
}

/// Decode data according to the specified format
pub fn decode<T: DeserializeOwned>(bytes: &[u8], format: Format) -> Result<T> {
    match format {
        Format::Json => serde_json::from_slice(bytes).map_err(Error::Json),
        Format::MessagePack => rmp_serde::from_slice(bytes).map_err(Error::MessagePackDecode),
    }
}
