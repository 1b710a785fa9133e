//! Error types for the Zubridge store runtime

use thiserror::Error;

/// Result type for Zubridge store runtime operations
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error produced by user-supplied updaters and initializers
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error types that can occur in the Zubridge store runtime
#[derive(Debug, Error)]
pub enum Error {
    /// Errors related to JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Errors related to MessagePack serialization
    #[error("MessagePack error: {0}")]
    MessagePack(#[from] rmp_serde::encode::Error),

    /// Errors related to MessagePack deserialization
    #[error("MessagePack decode error: {0}")]
    MessagePackDecode(#[from] rmp_serde::decode::Error),

    /// Errors related to WebSocket operations
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Errors related to IO operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors related to Tokio runtime
    #[error("Tokio error: {0}")]
    Tokio(#[from] tokio::task::JoinError),

    /// An updater passed to `set_state_with` failed; state was left unchanged
    #[error("Updater failed: {0}")]
    Updater(#[source] BoxError),

    /// A partial update could not be merged into the current state
    #[error("Invalid partial state: {0}")]
    InvalidPartial(String),

    /// Errors reported by a storage backend
    #[error("Storage error: {0}")]
    Storage(String),

    /// An initializer was registered after orchestration had started
    #[error("Initializer \"{0}\" registered after startup began; ignored")]
    LateRegistration(String),

    /// One or more initializers failed during startup
    #[error("Initialization failed: {0}")]
    Initializer(String),

    /// Errors related to runtime configuration
    #[error("Configuration error: {0}")]
    Config(String),
}
