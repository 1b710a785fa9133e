//! Initializer registry and startup orchestrator
//!
//! Stores and modules register async initializers while the application
//! boots. The first call to [`Bootstrap::run`] starts every registered
//! initializer concurrently; later calls share that single run and its
//! outcome. Status only moves forward:
//! `NotStarted -> Running -> Done | Failed`.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use futures_util::stream::{FuturesUnordered, StreamExt};
use log::{debug, error, info};
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;

use crate::error::{BoxError, Error, Result};
use crate::telemetry::{Telemetry, TelemetryEventKind};

type InitFuture = Pin<Box<dyn Future<Output = std::result::Result<(), BoxError>> + Send>>;
type InitFn = Box<dyn FnOnce() -> InitFuture + Send>;

struct Initializer {
    name: String,
    run: InitFn,
}

/// Status of the startup orchestrator
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum OrchestrationStatus {
    NotStarted,
    Running,
    Done,
    /// Carries the first failure observed
    Failed(String),
}

impl OrchestrationStatus {
    /// Whether the run has finished, successfully or not
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed(_))
    }

    /// The readiness signal derived from this status
    pub fn readiness(&self) -> Readiness {
        match self {
            Self::NotStarted | Self::Running => Readiness::Pending,
            Self::Done => Readiness::Ready,
            Self::Failed(reason) => Readiness::Failed(reason.clone()),
        }
    }
}

/// Readiness as seen by UI consumers
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum Readiness {
    Pending,
    Ready,
    Failed(String),
}

#[derive(Default)]
struct Registry {
    initializers: Vec<Initializer>,
    names: Vec<String>,
    started: bool,
    /// Bumped by `reset` so a run from before the reset cannot report into it
    generation: u64,
}

struct BootstrapInner {
    registry: Mutex<Registry>,
    status: watch::Sender<OrchestrationStatus>,
    telemetry: Telemetry,
}

impl BootstrapInner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_status(&self, status: OrchestrationStatus) {
        info!("Bootstrap status: {:?}", status);
        self.telemetry.record(
            TelemetryEventKind::BootstrapStatusChanged,
            None,
            Some(json!(status)),
        );
        self.status.send_replace(status);
    }
}

/// Process-scoped initializer registry and orchestrator
///
/// Cloning is cheap; clones share the registry and status.
#[derive(Clone)]
pub struct Bootstrap {
    inner: Arc<BootstrapInner>,
}

impl Bootstrap {
    /// Create an independent registry
    pub fn new(telemetry: Telemetry) -> Self {
        let (status, _) = watch::channel(OrchestrationStatus::NotStarted);
        Self {
            inner: Arc::new(BootstrapInner {
                registry: Mutex::new(Registry::default()),
                status,
                telemetry,
            }),
        }
    }

    /// The process-wide registry, created on first use
    pub fn global() -> Self {
        static GLOBAL: OnceLock<Bootstrap> = OnceLock::new();
        GLOBAL.get_or_init(|| Bootstrap::new(Telemetry::default())).clone()
    }

    /// Register an initializer
    ///
    /// Only valid before [`run`](Self::run) is first called. A late
    /// initializer is logged, reported to telemetry and dropped, and
    /// [`Error::LateRegistration`] is returned.
    pub fn register_initializer<F, Fut, E>(&self, name: impl Into<String>, initializer: F) -> Result<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: Into<BoxError>,
    {
        let name = name.into();
        let mut registry = self.inner.registry();

        if registry.started {
            drop(registry);
            error!("Initializer \"{}\" registered after startup began; ignoring it", name);
            self.inner.telemetry.record(
                TelemetryEventKind::LateRegistration,
                None,
                Some(json!({ "initializer": name })),
            );
            return Err(Error::LateRegistration(name));
        }

        let run: InitFn = Box::new(move || -> InitFuture {
            Box::pin(async move {
                let outcome: std::result::Result<(), BoxError> = initializer().await.map_err(Into::into);
                outcome
            })
        });
        registry.names.push(name.clone());
        registry.initializers.push(Initializer {
            name: name.clone(),
            run,
        });
        drop(registry);

        debug!("Registered initializer \"{}\"", name);
        self.inner.telemetry.record(
            TelemetryEventKind::InitializerRegistered,
            None,
            Some(json!({ "initializer": name })),
        );
        Ok(())
    }

    /// Names of the registered initializers, in registration order
    pub fn registered_initializers(&self) -> Vec<String> {
        self.inner.registry().names.clone()
    }

    /// Run every registered initializer once and wait for the outcome
    ///
    /// Safe to call any number of times, concurrently or not. Only the first
    /// call starts initializers; every call resolves to the same outcome.
    /// The run continues even if the calling future is dropped.
    pub async fn run(&self) -> Result<()> {
        self.start();
        self.wait_ready().await
    }

    /// Wait for the run to finish without starting it
    pub async fn wait_ready(&self) -> Result<()> {
        let mut receiver = self.inner.status.subscribe();
        let status = receiver
            .wait_for(OrchestrationStatus::is_terminal)
            .await
            .map(|status| status.clone())
            .map_err(|_| Error::Initializer("bootstrap was dropped".to_string()))?;

        match status {
            OrchestrationStatus::Failed(reason) => Err(Error::Initializer(reason)),
            _ => Ok(()),
        }
    }

    /// Current orchestration status
    pub fn status(&self) -> OrchestrationStatus {
        self.inner.status.borrow().clone()
    }

    /// Current readiness
    pub fn readiness(&self) -> Readiness {
        self.status().readiness()
    }

    /// Receive status changes instead of polling
    pub fn subscribe(&self) -> watch::Receiver<OrchestrationStatus> {
        self.inner.status.subscribe()
    }

    /// Forget all initializers and return to `NotStarted`
    ///
    /// For test harnesses only. A run still in flight keeps going but no
    /// longer updates the status.
    #[cfg(any(test, feature = "test-util"))]
    pub fn reset(&self) {
        let mut registry = self.inner.registry();
        registry.initializers.clear();
        registry.names.clear();
        registry.started = false;
        registry.generation += 1;
        self.inner.status.send_replace(OrchestrationStatus::NotStarted);
    }

    fn start(&self) {
        let (initializers, generation) = {
            let mut registry = self.inner.registry();
            if registry.started {
                return;
            }
            registry.started = true;
            // Status changes under the registry lock so a concurrent reset
            // cannot interleave with it
            self.inner.set_status(OrchestrationStatus::Running);
            (std::mem::take(&mut registry.initializers), registry.generation)
        };

        info!("Running {} initializer(s)", initializers.len());
        let inner = self.inner.clone();
        tokio::spawn(orchestrate(inner, initializers, generation));
    }
}

async fn orchestrate(inner: Arc<BootstrapInner>, initializers: Vec<Initializer>, generation: u64) {
    let mut running = FuturesUnordered::new();
    for initializer in initializers {
        let name = initializer.name;
        let handle = tokio::spawn((initializer.run)());
        running.push(async move { (name, handle.await) });
    }

    let mut first_failure: Option<String> = None;
    while let Some((name, outcome)) = running.next().await {
        let failure = match outcome {
            Ok(Ok(())) => {
                debug!("Initializer \"{}\" finished", name);
                None
            }
            Ok(Err(err)) => Some(format!("initializer \"{}\" failed: {}", name, err)),
            Err(join_err) => Some(format!("initializer \"{}\" did not complete: {}", name, Error::Tokio(join_err))),
        };

        if let Some(reason) = failure {
            error!("{}", reason);
            inner.telemetry.record(
                TelemetryEventKind::InitializerFailed,
                None,
                Some(json!({ "initializer": name, "reason": reason })),
            );
            first_failure.get_or_insert(reason);
        }
    }

    let status = match first_failure {
        None => OrchestrationStatus::Done,
        Some(reason) => OrchestrationStatus::Failed(reason),
    };

    let registry = inner.registry();
    if registry.generation == generation {
        inner.set_status(status);
    } else {
        debug!("Discarding outcome of a run from before reset");
    }
}

/// Register an initializer with the process-wide [`Bootstrap`]
pub fn register_initializer<F, Fut, E>(name: impl Into<String>, initializer: F) -> Result<()>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
    E: Into<BoxError>,
{
    Bootstrap::global().register_initializer(name, initializer)
}

/// Run the process-wide [`Bootstrap`] once and wait for it
pub async fn init_stores() -> Result<()> {
    Bootstrap::global().run().await
}
