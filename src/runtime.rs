//! Process-scoped runtime context
//!
//! Composes the storage backend, telemetry and bootstrap registry once, and
//! hands them to every store created through it. UI bootstrap code receives
//! a `Runtime` instead of reaching for globals.

use std::future::Future;
use std::sync::Arc;

use crate::bootstrap::{Bootstrap, Readiness};
use crate::error::{BoxError, Result};
use crate::persist::{persist, PersistOptions, PersistedStore};
use crate::storage::{open_storage, StorageBackend};
use crate::store::{StateValue, Store};
use crate::telemetry::Telemetry;
use crate::RuntimeConfig;

/// Shared context for the stores of one application instance
#[derive(Clone)]
pub struct Runtime {
    config: RuntimeConfig,
    storage: Arc<dyn StorageBackend>,
    telemetry: Telemetry,
    bootstrap: Bootstrap,
}

impl Runtime {
    /// Compose a runtime from configuration
    ///
    /// Opens the configured storage backend and starts telemetry.
    pub async fn new(config: RuntimeConfig) -> Result<Self> {
        let storage = open_storage(&config.storage).await?;
        let telemetry = Telemetry::new(config.telemetry.clone());
        Ok(Self::with_parts(config, storage, telemetry, None))
    }

    /// Compose a runtime from parts chosen by the caller
    ///
    /// Without a `bootstrap`, a fresh registry is created.
    pub fn with_parts(
        config: RuntimeConfig,
        storage: Arc<dyn StorageBackend>,
        telemetry: Telemetry,
        bootstrap: Option<Bootstrap>,
    ) -> Self {
        let bootstrap = bootstrap.unwrap_or_else(|| Bootstrap::new(telemetry.clone()));
        Self {
            config,
            storage,
            telemetry,
            bootstrap,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn storage(&self) -> Arc<dyn StorageBackend> {
        self.storage.clone()
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub fn bootstrap(&self) -> &Bootstrap {
        &self.bootstrap
    }

    /// Create an in-memory store
    pub fn create_store<T, F>(&self, name: impl Into<String>, factory: F) -> Store<T>
    where
        T: StateValue,
        F: FnOnce() -> T,
    {
        Store::builder(factory())
            .name(name)
            .telemetry(self.telemetry.clone())
            .build()
    }

    /// Create a store persisted to this runtime's storage
    ///
    /// Options that leave the format unset use the configured default.
    pub async fn create_persistent_store<T, F>(&self, factory: F, options: PersistOptions<T>) -> PersistedStore<T>
    where
        T: StateValue,
        F: FnOnce() -> T,
    {
        let options = options.default_format(self.config.persist.format);
        persist(factory, options, self.storage.clone(), &self.telemetry).await
    }

    /// Register an initializer with this runtime's bootstrap
    pub fn register_initializer<F, Fut, E>(&self, name: impl Into<String>, initializer: F) -> Result<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: Into<BoxError>,
    {
        self.bootstrap.register_initializer(name, initializer)
    }

    /// Run all registered initializers once and wait for them
    pub async fn init_stores(&self) -> Result<()> {
        self.bootstrap.run().await
    }

    /// Readiness of the bootstrap
    pub fn readiness(&self) -> Readiness {
        self.bootstrap.readiness()
    }
}
