//! Telemetry for Zubridge stores
//!
//! This module is the observability channel of the runtime. Store lifecycle
//! events, persistence failures and bootstrap progress are recorded here,
//! mirrored to the `log` facade, kept in a bounded history and optionally
//! streamed to remote monitors over a WebSocket.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::broadcast;

use crate::serialization::Format;
use crate::websocket::WebSocketServer;

/// Capacity of the in-process event feed
const FEED_CHANNEL_SIZE: usize = 256;

/// Configuration for telemetry
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Whether events are recorded at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Whether to mirror events to the `log` facade
    #[serde(default = "default_true")]
    pub console_output: bool,

    /// Maximum number of events to keep in memory
    #[serde(default = "default_log_limit")]
    pub log_limit: usize,

    /// Port for the WebSocket server (None to disable)
    #[serde(default)]
    pub websocket_port: Option<u16>,

    /// Whether to log verbose debug information
    #[serde(default = "default_false")]
    pub verbose: bool,

    /// Serialization format for WebSocket frames
    #[serde(default)]
    pub serialization_format: Format,
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

fn default_log_limit() -> usize {
    1000
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            console_output: true,
            log_limit: default_log_limit(),
            websocket_port: None,
            verbose: false,
            serialization_format: Format::default(),
        }
    }
}

/// Kinds of telemetry events
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum TelemetryEventKind {
    /// A store was created and became observable
    StoreCreated,

    /// A store committed a new state
    StateUpdated,

    /// Persisted state was merged into a store
    Rehydrated,

    /// A persisted record was unreadable and the default state was kept
    RehydrationFailed,

    /// A persistence write failed
    PersistFailed,

    /// A persisted record was removed from storage
    StorageCleared,

    /// An initializer was added to the registry
    InitializerRegistered,

    /// An initializer was registered after startup had begun
    LateRegistration,

    /// An initializer returned an error or panicked
    InitializerFailed,

    /// The startup orchestrator changed status
    BootstrapStatusChanged,
}

impl TelemetryEventKind {
    fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::RehydrationFailed | Self::PersistFailed | Self::LateRegistration | Self::InitializerFailed
        )
    }
}

/// A single telemetry event
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TelemetryEvent {
    /// Unique identifier for the event
    pub id: String,

    /// When the event was recorded
    pub timestamp: chrono::DateTime<chrono::Utc>,

    /// What happened
    pub kind: TelemetryEventKind,

    /// Store name, for store-scoped events
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<String>,

    /// Free-form detail such as an error message or a status
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<JsonValue>,
}

pub(crate) type EventHistory = Arc<Mutex<VecDeque<TelemetryEvent>>>;

pub(crate) fn lock_history(history: &EventHistory) -> MutexGuard<'_, VecDeque<TelemetryEvent>> {
    history.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct TelemetryInner {
    config: TelemetryConfig,
    history: EventHistory,
    feed: broadcast::Sender<TelemetryEvent>,
    websocket: Option<Arc<WebSocketServer>>,
}

/// Handle to the observability channel
///
/// Cloning is cheap; all clones share the same history and feed.
#[derive(Clone)]
pub struct Telemetry {
    inner: Arc<TelemetryInner>,
}

impl Telemetry {
    /// Create a telemetry channel with the specified configuration
    ///
    /// When a WebSocket port is configured the server is spawned on the
    /// current Tokio runtime. Outside a runtime the server is skipped with a
    /// warning.
    pub fn new(config: TelemetryConfig) -> Self {
        if config.verbose {
            log::set_max_level(log::LevelFilter::Debug);
        }

        let history: EventHistory = Arc::new(Mutex::new(VecDeque::with_capacity(config.log_limit.min(1024))));
        let (feed, _) = broadcast::channel(FEED_CHANNEL_SIZE);

        let websocket = match (config.enabled, config.websocket_port) {
            (true, Some(port)) => match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let server = Arc::new(WebSocketServer::new(port, history.clone(), config.serialization_format));
                    let ws = server.clone();
                    handle.spawn(async move {
                        if let Err(err) = ws.start().await {
                            error!("WebSocket server error: {}", err);
                        }
                    });
                    Some(server)
                }
                Err(_) => {
                    warn!("No Tokio runtime available; telemetry WebSocket on port {} not started", port);
                    None
                }
            },
            _ => None,
        };

        Self {
            inner: Arc::new(TelemetryInner {
                config,
                history,
                feed,
                websocket,
            }),
        }
    }

    /// Create a telemetry channel that records nothing
    pub fn disabled() -> Self {
        Self::new(TelemetryConfig {
            enabled: false,
            ..Default::default()
        })
    }

    /// Whether events are being recorded
    pub fn is_enabled(&self) -> bool {
        self.inner.config.enabled
    }

    /// Get a reference to the configuration
    pub fn config(&self) -> &TelemetryConfig {
        &self.inner.config
    }

    /// Record an event
    pub fn record(&self, kind: TelemetryEventKind, store: Option<&str>, detail: Option<JsonValue>) {
        if !self.inner.config.enabled {
            return;
        }

        let event = TelemetryEvent {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now(),
            kind,
            store: store.map(str::to_string),
            detail,
        };

        if self.inner.config.console_output {
            self.log_event(&event);
        }

        {
            let mut history = lock_history(&self.inner.history);
            history.push_back(event.clone());
            while history.len() > self.inner.config.log_limit {
                history.pop_front();
            }
        }

        if let Some(websocket) = &self.inner.websocket {
            if let Err(err) = websocket.broadcast(&event) {
                error!("Error broadcasting telemetry event: {}", err);
            }
        }

        // No receivers is the common case
        let _ = self.inner.feed.send(event);
    }

    /// Get a snapshot of the recorded events, oldest first
    pub fn history(&self) -> Vec<TelemetryEvent> {
        lock_history(&self.inner.history).iter().cloned().collect()
    }

    /// Clear the recorded events
    pub fn clear_history(&self) {
        lock_history(&self.inner.history).clear();
    }

    /// Subscribe to events recorded from now on
    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.inner.feed.subscribe()
    }

    fn log_event(&self, event: &TelemetryEvent) {
        let store = event.store.as_deref().unwrap_or("-");
        let detail = event
            .detail
            .as_ref()
            .map(|d| d.to_string())
            .unwrap_or_default();

        if event.kind.is_failure() {
            match event.kind {
                TelemetryEventKind::RehydrationFailed => {
                    warn!("{:?} (store: {}) {}", event.kind, store, detail)
                }
                _ => error!("{:?} (store: {}) {}", event.kind, store, detail),
            }
        } else if event.kind == TelemetryEventKind::StateUpdated {
            debug!("{:?} (store: {}) {}", event.kind, store, detail);
        } else {
            info!("{:?} (store: {}) {}", event.kind, store, detail);
        }
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new(TelemetryConfig::default())
    }
}

/// Install `env_logger` as the global logger
///
/// Honours `RUST_LOG`; falls back to `debug` when verbose and `info`
/// otherwise. Calling it again after a logger is installed is a no-op.
pub fn init_logger(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).try_init();
}
