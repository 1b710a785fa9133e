//! Zubridge Store Runtime
//!
//! Observable, persisted state stores shared by the web and native surfaces
//! of a Zubridge application, plus a one-shot bootstrap that runs every
//! store's async initialization before the UI is considered ready.
//!
//! - [`Store`]: state container with shallow-merge updates and selector-based
//!   subscriptions
//! - [`persist()`]: wraps a store so a chosen subset of its state survives
//!   restarts, using any [`StorageBackend`]
//! - [`Bootstrap`]: initializer registry and startup orchestrator
//! - [`Runtime`]: the process-scoped context tying these together
//!
//! ```no_run
//! use serde::{Deserialize, Serialize};
//! use zubridge_runtime::{PersistOptions, Runtime, RuntimeConfig};
//!
//! #[derive(Clone, PartialEq, Serialize, Deserialize)]
//! struct Counter {
//!     count: i64,
//!     last_updated: Option<String>,
//! }
//!
//! #[derive(Serialize)]
//! struct PersistedCounter {
//!     count: i64,
//! }
//!
//! # async fn example() -> zubridge_runtime::Result<()> {
//! let runtime = Runtime::new(RuntimeConfig::default()).await?;
//! let counter = runtime
//!     .create_persistent_store(
//!         || Counter { count: 0, last_updated: None },
//!         PersistOptions::new("app-counter")
//!             .partialize(|s: &Counter| PersistedCounter { count: s.count }),
//!     )
//!     .await;
//!
//! runtime.init_stores().await?;
//! println!("count = {}", counter.get_state().count);
//! # Ok(())
//! # }
//! ```

mod error;

pub mod bootstrap;
pub mod persist;
pub mod runtime;
pub mod serialization;
pub mod storage;
pub mod store;
pub mod telemetry;
mod websocket;

use serde::{Deserialize, Serialize};

pub use bootstrap::{init_stores, register_initializer, Bootstrap, OrchestrationStatus, Readiness};
pub use error::{BoxError, Error, Result};
pub use persist::{persist, PersistOptions, PersistedStore};
pub use runtime::Runtime;
pub use serialization::Format;
pub use storage::{open_storage, FileStorage, MemoryStorage, StorageBackend, StorageConfig};
pub use store::{CommitHook, Partial, StateValue, Store, StoreBuilder, Subscription, Update};
pub use telemetry::{Telemetry, TelemetryConfig, TelemetryEvent, TelemetryEventKind};

/// Defaults for persisted stores
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PersistConfig {
    /// Encoding used when a store does not choose one
    #[serde(default)]
    pub format: Format,
}

/// Configuration for the store runtime
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Storage backend shared by persisted stores
    #[serde(default)]
    pub storage: StorageConfig,

    /// Defaults for persisted stores
    #[serde(default)]
    pub persist: PersistConfig,

    /// Configuration for telemetry
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl RuntimeConfig {
    /// Parse configuration from JSON; missing sections take their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_config_defaults() {
        let config = RuntimeConfig::from_json("{}").unwrap();
        assert_eq!(config.storage, StorageConfig::Memory);
        assert_eq!(config.persist.format, Format::Json);
        assert!(config.telemetry.enabled);
    }

    #[test]
    fn test_config_from_json() {
        let config = RuntimeConfig::from_json(
            r#"{
                "storage": { "backend": "file", "dir": "/tmp/zubridge" },
                "persist": { "format": "messagepack" },
                "telemetry": { "console_output": false, "log_limit": 10 }
            }"#,
        )
        .unwrap();

        assert_eq!(
            config.storage,
            StorageConfig::File {
                dir: PathBuf::from("/tmp/zubridge")
            }
        );
        assert_eq!(config.persist.format, Format::MessagePack);
        assert!(!config.telemetry.console_output);
        assert_eq!(config.telemetry.log_limit, 10);
    }

    #[test]
    fn test_invalid_config_is_reported() {
        let result = RuntimeConfig::from_json(r#"{ "storage": { "backend": "cloud" } }"#);
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
