//! Persistence middleware for stores
//!
//! A persisted store reads its record from a [`StorageBackend`] before the
//! store handle is returned, so callers never observe pre-rehydration state.
//! Every later commit hands the partialized state to a writer task owned by
//! the store. The writer applies writes for its key one at a time, skips
//! revisions older than the last one written and coalesces bursts to the
//! latest value. `set_state` never waits for, or fails because of, a write.

use std::collections::HashSet;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};

use crate::serialization::{self, Format};
use crate::storage::StorageBackend;
use crate::store::{CommitHook, Partial, StateValue, Store, Update};
use crate::telemetry::{Telemetry, TelemetryEventKind};
use crate::{Error, Result};

type Partializer<T> = Arc<dyn Fn(&T) -> Result<Partial> + Send + Sync>;

/// Options for a persisted store
pub struct PersistOptions<T> {
    name: String,
    partialize: Partializer<T>,
    version: u32,
    format: Option<Format>,
}

impl<T: StateValue> PersistOptions<T> {
    /// Persist the whole state under `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            partialize: Arc::new(|state: &T| Partial::from_serializable(state)),
            version: 0,
            format: None,
        }
    }

    /// Choose which fields are persisted
    ///
    /// `partialize` may return any value that serializes to an object. Only
    /// its fields are written, and only those fields are restored.
    pub fn partialize<P, F>(mut self, partialize: F) -> Self
    where
        P: Serialize,
        F: Fn(&T) -> P + Send + Sync + 'static,
    {
        self.partialize = Arc::new(move |state: &T| Partial::from_serializable(&partialize(state)));
        self
    }

    /// Record version; stored records with another version are discarded
    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Encoding of the stored record
    pub fn format(mut self, format: Format) -> Self {
        self.format = Some(format);
        self
    }

    /// Use `format` unless one was chosen explicitly
    pub(crate) fn default_format(mut self, format: Format) -> Self {
        self.format.get_or_insert(format);
        self
    }

    /// Storage key
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Envelope written to storage
#[derive(Debug, Serialize, Deserialize)]
struct PersistRecord {
    state: Partial,
    version: u32,
}

enum WriteCommand {
    Write { revision: u64, bytes: Vec<u8> },
    Remove(oneshot::Sender<Result<()>>),
    Flush(oneshot::Sender<()>),
}

struct Codec<T> {
    name: String,
    partialize: Partializer<T>,
    version: u32,
    format: Format,
    /// Top-level fields of the state
    state_fields: HashSet<String>,
    /// State fields the partializer writes for the initial state
    persisted_fields: HashSet<String>,
}

impl<T: StateValue> Codec<T> {
    fn encode(&self, state: &T) -> Result<Vec<u8>> {
        let record = PersistRecord {
            state: (self.partialize)(state)?,
            version: self.version,
        };
        serialization::encode(&record, self.format)
    }

    /// Decode a stored record into the partial to merge, if it is current
    fn decode(&self, bytes: &[u8]) -> Result<Option<Partial>> {
        let record: PersistRecord = serialization::decode(bytes, self.format)?;
        if record.version != self.version {
            warn!(
                "Discarding persisted state for {}: stored version {}, expected {}",
                self.name, record.version, self.version
            );
            return Ok(None);
        }

        let mut partial = record.state;
        partial.retain(|field| self.state_fields.contains(field));
        Ok(Some(partial))
    }

    /// Keep the stored fields the partializer would write
    ///
    /// A field missing from the initial partialized state may still be
    /// written for other values, so each such field is checked against
    /// `base` with the stored value applied.
    fn restorable(&self, mut partial: Partial, base: &T) -> Partial {
        let dropped: HashSet<String> = partial
            .fields()
            .filter(|field| !self.persisted_fields.contains(*field) && !self.written_for(&partial, field, base))
            .map(str::to_string)
            .collect();

        for field in &dropped {
            debug!("Ignoring stored field {} of {}: not persisted", field, self.name);
        }
        partial.retain(|field| !dropped.contains(field));
        partial
    }

    fn written_for(&self, partial: &Partial, field: &str, base: &T) -> bool {
        let Some(value) = partial.get(field) else {
            return false;
        };

        let mut single = Partial::new();
        single.insert(field, value).is_ok()
            && single
                .apply_to(base)
                .and_then(|candidate| (self.partialize)(&candidate))
                .map(|written| written.contains(field))
                .unwrap_or(false)
    }
}

struct PersistHook<T> {
    codec: Arc<Codec<T>>,
    sender: mpsc::UnboundedSender<WriteCommand>,
    telemetry: Telemetry,
}

impl<T: StateValue> CommitHook<T> for PersistHook<T> {
    fn on_commit(&self, state: &T, revision: u64) {
        let bytes = match self.codec.encode(state) {
            Ok(bytes) => bytes,
            Err(err) => {
                error!("Error encoding state for {}: {}", self.codec.name, err);
                self.telemetry.record(
                    TelemetryEventKind::PersistFailed,
                    Some(&self.codec.name),
                    Some(json!(err.to_string())),
                );
                return;
            }
        };

        if self.sender.send(WriteCommand::Write { revision, bytes }).is_err() {
            error!("Persistence writer for {} has stopped; write dropped", self.codec.name);
        }
    }
}

/// A store whose state survives restarts
///
/// Dereferences to the wrapped [`Store`].
pub struct PersistedStore<T> {
    store: Store<T>,
    codec: Arc<Codec<T>>,
    storage: Arc<dyn StorageBackend>,
    sender: mpsc::UnboundedSender<WriteCommand>,
    hydrated: Arc<AtomicBool>,
    telemetry: Telemetry,
}

impl<T> Clone for PersistedStore<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            codec: self.codec.clone(),
            storage: self.storage.clone(),
            sender: self.sender.clone(),
            hydrated: self.hydrated.clone(),
            telemetry: self.telemetry.clone(),
        }
    }
}

impl<T> Deref for PersistedStore<T> {
    type Target = Store<T>;

    fn deref(&self) -> &Store<T> {
        &self.store
    }
}

/// Create a persisted store
///
/// `factory` builds the default state. A stored record under the options'
/// name is merged into it before the store is returned; an absent, outdated
/// or unreadable record leaves the default in place.
pub async fn persist<T, F>(
    factory: F,
    options: PersistOptions<T>,
    storage: Arc<dyn StorageBackend>,
    telemetry: &Telemetry,
) -> PersistedStore<T>
where
    T: StateValue,
    F: FnOnce() -> T,
{
    let initial = factory();
    let (state_fields, persisted_fields) = field_sets(&initial, &options);
    let codec = Arc::new(Codec {
        state_fields,
        persisted_fields,
        name: options.name,
        partialize: options.partialize,
        version: options.version,
        format: options.format.unwrap_or_default(),
    });

    let state = match read_record(&codec, storage.as_ref()).await {
        Ok(Some(stored)) => {
            let partial = codec.restorable(stored, &initial);
            match partial.apply_to(&initial) {
                Ok(state) => {
                    debug!(
                        "Rehydrated {} field(s) of {} from a {} record",
                        partial.len(),
                        codec.name,
                        codec.format.name()
                    );
                    telemetry.record(
                        TelemetryEventKind::Rehydrated,
                        Some(&codec.name),
                        Some(json!({ "fields": partial.fields().collect::<Vec<_>>() })),
                    );
                    state
                }
                Err(err) => {
                    report_rehydration_failure(telemetry, &codec.name, &err);
                    initial
                }
            }
        }
        Ok(None) => {
            debug!("No persisted state for {}", codec.name);
            initial
        }
        Err(err) => {
            report_rehydration_failure(telemetry, &codec.name, &err);
            initial
        }
    };

    let (sender, receiver) = mpsc::unbounded_channel();
    tokio::spawn(run_writer(codec.name.clone(), storage.clone(), telemetry.clone(), receiver));

    let hook = Arc::new(PersistHook {
        codec: codec.clone(),
        sender: sender.clone(),
        telemetry: telemetry.clone(),
    });

    let store = Store::builder(state)
        .name(codec.name.clone())
        .telemetry(telemetry.clone())
        .hook(hook)
        .build();

    PersistedStore {
        store,
        codec,
        storage,
        sender,
        hydrated: Arc::new(AtomicBool::new(true)),
        telemetry: telemetry.clone(),
    }
}

impl<T: StateValue> PersistedStore<T> {
    /// The wrapped store
    pub fn store(&self) -> &Store<T> {
        &self.store
    }

    /// Storage key of this store
    pub fn persist_name(&self) -> &str {
        &self.codec.name
    }

    /// Whether rehydration has finished
    pub fn has_hydrated(&self) -> bool {
        self.hydrated.load(Ordering::SeqCst)
    }

    /// Read the stored record again and merge it into the current state
    ///
    /// Returns whether a record was applied. Listeners are notified as for
    /// any other commit.
    pub async fn rehydrate(&self) -> Result<bool> {
        self.hydrated.store(false, Ordering::SeqCst);
        let result = self.rehydrate_inner().await;
        self.hydrated.store(true, Ordering::SeqCst);

        if let Err(err) = &result {
            report_rehydration_failure(&self.telemetry, &self.codec.name, err);
        }
        result
    }

    async fn rehydrate_inner(&self) -> Result<bool> {
        match read_record(&self.codec, self.storage.as_ref()).await? {
            Some(stored) => {
                self.store
                    .set_state_with(|current| Update::Merge(self.codec.restorable(stored, current)))?;
                self.telemetry
                    .record(TelemetryEventKind::Rehydrated, Some(&self.codec.name), None);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Remove the stored record
    ///
    /// Ordered after every write queued before the call. The in-memory state
    /// is unchanged and the next commit writes a new record.
    pub async fn clear_storage(&self) -> Result<()> {
        let (done, wait) = oneshot::channel();
        self.sender
            .send(WriteCommand::Remove(done))
            .map_err(|_| Error::Storage(format!("persistence writer for {} has stopped", self.codec.name)))?;

        let result = wait
            .await
            .map_err(|_| Error::Storage(format!("persistence writer for {} has stopped", self.codec.name)))?;

        if result.is_ok() {
            self.telemetry
                .record(TelemetryEventKind::StorageCleared, Some(&self.codec.name), None);
        }
        result
    }

    /// Wait until every write queued so far has reached storage or failed
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.sender.send(WriteCommand::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }
}

/// State fields, and the subset of them written for the initial state
fn field_sets<T: StateValue>(initial: &T, options: &PersistOptions<T>) -> (HashSet<String>, HashSet<String>) {
    let state_fields: HashSet<String> = match serde_json::to_value(initial) {
        Ok(serde_json::Value::Object(map)) => map.into_iter().map(|(k, _)| k).collect(),
        _ => HashSet::new(),
    };

    let persisted_fields = match (options.partialize)(initial) {
        Ok(partial) => partial
            .fields()
            .filter(|field| state_fields.contains(*field))
            .map(str::to_string)
            .collect(),
        Err(err) => {
            error!("Partializer for {} failed on the initial state: {}", options.name, err);
            HashSet::new()
        }
    };

    (state_fields, persisted_fields)
}

async fn read_record<T: StateValue>(codec: &Codec<T>, storage: &dyn StorageBackend) -> Result<Option<Partial>> {
    match storage.get(&codec.name).await? {
        Some(bytes) => codec.decode(&bytes),
        None => Ok(None),
    }
}

fn report_rehydration_failure(telemetry: &Telemetry, name: &str, err: &Error) {
    warn!("Could not rehydrate {}, keeping current state: {}", name, err);
    telemetry.record(
        TelemetryEventKind::RehydrationFailed,
        Some(name),
        Some(json!(err.to_string())),
    );
}

async fn run_writer(
    name: String,
    storage: Arc<dyn StorageBackend>,
    telemetry: Telemetry,
    mut receiver: mpsc::UnboundedReceiver<WriteCommand>,
) {
    let mut last_written = 0u64;

    while let Some(command) = receiver.recv().await {
        let (revision, bytes) = match command {
            WriteCommand::Write { revision, bytes } => (revision, bytes),
            control => {
                handle_control(&name, storage.as_ref(), control).await;
                continue;
            }
        };

        // Coalesce queued writes; a control command ends the batch
        let mut latest = (revision, bytes);
        let mut pending = None;
        while let Ok(next) = receiver.try_recv() {
            match next {
                WriteCommand::Write { revision, bytes } => {
                    if revision > latest.0 {
                        latest = (revision, bytes);
                    }
                }
                control => {
                    pending = Some(control);
                    break;
                }
            }
        }

        let (revision, bytes) = latest;
        if revision > last_written {
            last_written = revision;
            match storage.set(&name, bytes).await {
                Ok(()) => debug!("Persisted {} at revision {}", name, revision),
                Err(err) => {
                    error!("Error persisting {}: {}", name, err);
                    telemetry.record(
                        TelemetryEventKind::PersistFailed,
                        Some(&name),
                        Some(json!({ "revision": revision, "error": err.to_string() })),
                    );
                }
            }
        } else {
            debug!("Skipping stale write of {} at revision {}", name, revision);
        }

        if let Some(control) = pending {
            handle_control(&name, storage.as_ref(), control).await;
        }
    }

    debug!("Persistence writer for {} stopped", name);
}

async fn handle_control(name: &str, storage: &dyn StorageBackend, command: WriteCommand) {
    match command {
        WriteCommand::Remove(done) => {
            let _ = done.send(storage.remove(name).await);
        }
        WriteCommand::Flush(done) => {
            let _ = done.send(());
        }
        WriteCommand::Write { .. } => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use async_trait::async_trait;
    use std::time::Duration;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Prefs {
        theme: String,
        volume: u8,
        session: Option<String>,
    }

    fn prefs() -> Prefs {
        Prefs {
            theme: "light".to_string(),
            volume: 5,
            session: None,
        }
    }

    #[derive(Serialize)]
    struct PersistedPrefs {
        theme: String,
        volume: u8,
    }

    fn options() -> PersistOptions<Prefs> {
        PersistOptions::new("prefs").partialize(|s: &Prefs| PersistedPrefs {
            theme: s.theme.clone(),
            volume: s.volume,
        })
    }

    /// Delays writes whose payload contains `slow_marker`
    #[derive(Clone, Default)]
    struct SlowStorage {
        inner: MemoryStorage,
        slow_marker: &'static str,
    }

    #[async_trait]
    impl StorageBackend for SlowStorage {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
            if String::from_utf8_lossy(&bytes).contains(self.slow_marker) {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            self.inner.set(key, bytes).await
        }

        async fn remove(&self, key: &str) -> Result<()> {
            self.inner.remove(key).await
        }
    }

    #[tokio::test]
    async fn test_only_partialized_fields_are_written() {
        let storage = MemoryStorage::new();
        let store = persist(prefs, options(), Arc::new(storage.clone()), &Telemetry::disabled()).await;

        store
            .set_state(Partial::new().with("session", "abc").unwrap().with("volume", 7).unwrap())
            .unwrap();
        store.flush().await;

        let bytes = storage.get("prefs").await.unwrap().unwrap();
        let record: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(record, json!({ "state": { "theme": "light", "volume": 7 }, "version": 0 }));
    }

    #[tokio::test]
    async fn test_unknown_and_excluded_stored_fields_are_ignored() {
        let storage = MemoryStorage::new();
        storage
            .set(
                "prefs",
                serde_json::to_vec(&json!({
                    "state": { "theme": "dark", "session": "stale", "legacy": true },
                    "version": 0
                }))
                .unwrap(),
            )
            .await
            .unwrap();

        let store = persist(prefs, options(), Arc::new(storage), &Telemetry::disabled()).await;
        let state = store.get_state();
        assert_eq!(state.theme, "dark");
        assert_eq!(state.session, None);
        assert!(store.has_hydrated());
    }

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Profile {
        name: String,
        nickname: Option<String>,
        online: bool,
    }

    #[derive(Serialize)]
    struct PersistedProfile {
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        nickname: Option<String>,
    }

    fn profile() -> Profile {
        Profile {
            name: "anon".to_string(),
            nickname: None,
            online: false,
        }
    }

    fn profile_options() -> PersistOptions<Profile> {
        PersistOptions::new("profile").partialize(|s: &Profile| PersistedProfile {
            name: s.name.clone(),
            nickname: s.nickname.clone(),
        })
    }

    #[tokio::test]
    async fn test_field_omitted_for_default_still_restores() {
        let storage = MemoryStorage::new();
        let telemetry = Telemetry::disabled();

        let first = persist(profile, profile_options(), Arc::new(storage.clone()), &telemetry).await;
        first
            .set_state(
                Partial::new()
                    .with("nickname", "bo")
                    .unwrap()
                    .with("online", true)
                    .unwrap(),
            )
            .unwrap();
        first.flush().await;

        let second = persist(profile, profile_options(), Arc::new(storage.clone()), &telemetry).await;
        let state = second.get_state();
        assert_eq!(state.nickname.as_deref(), Some("bo"));
        assert!(!state.online);

        // A stored field the partializer never writes stays out
        storage
            .set(
                "profile",
                serde_json::to_vec(&json!({ "state": { "nickname": "al", "online": true }, "version": 0 })).unwrap(),
            )
            .await
            .unwrap();
        assert!(second.rehydrate().await.unwrap());
        let state = second.get_state();
        assert_eq!(state.nickname.as_deref(), Some("al"));
        assert!(!state.online);
    }

    #[tokio::test]
    async fn test_version_mismatch_discards_record() {
        let storage = MemoryStorage::new();
        storage
            .set(
                "prefs",
                serde_json::to_vec(&json!({ "state": { "theme": "dark" }, "version": 1 })).unwrap(),
            )
            .await
            .unwrap();

        let store = persist(prefs, options().version(2), Arc::new(storage), &Telemetry::disabled()).await;
        assert_eq!(*store.get_state(), prefs());
    }

    #[tokio::test]
    async fn test_slow_earlier_write_is_not_overtaken() {
        let storage = SlowStorage {
            inner: MemoryStorage::new(),
            slow_marker: "\"volume\":1",
        };
        let store = persist(prefs, options(), Arc::new(storage.clone()), &Telemetry::disabled()).await;

        store.set_state(Partial::new().with("volume", 1).unwrap()).unwrap();
        // Let the writer pick up the slow write before queueing the next one
        tokio::time::sleep(Duration::from_millis(10)).await;
        store.set_state(Partial::new().with("volume", 2).unwrap()).unwrap();
        store.flush().await;

        let bytes = storage.inner.get("prefs").await.unwrap().unwrap();
        let record: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(record["state"]["volume"], json!(2));
    }

    #[tokio::test]
    async fn test_clear_storage_then_write_again() {
        let storage = MemoryStorage::new();
        let store = persist(prefs, options(), Arc::new(storage.clone()), &Telemetry::disabled()).await;

        store.set_state(Partial::new().with("theme", "dark").unwrap()).unwrap();
        store.clear_storage().await.unwrap();
        assert_eq!(storage.get("prefs").await.unwrap(), None);
        assert_eq!(store.get_state().theme, "dark");

        store.set_state(Partial::new().with("volume", 9).unwrap()).unwrap();
        store.flush().await;
        assert!(storage.get("prefs").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_rehydrate_merges_into_current_state() {
        let storage = MemoryStorage::new();
        let store = persist(prefs, options(), Arc::new(storage.clone()), &Telemetry::disabled()).await;
        store.set_state(Partial::new().with("session", "live").unwrap()).unwrap();
        store.flush().await;

        storage
            .set(
                "prefs",
                serde_json::to_vec(&json!({ "state": { "volume": 1 }, "version": 0 })).unwrap(),
            )
            .await
            .unwrap();

        assert!(store.rehydrate().await.unwrap());
        let state = store.get_state();
        assert_eq!(state.volume, 1);
        assert_eq!(state.session.as_deref(), Some("live"));
    }

    #[tokio::test]
    async fn test_messagepack_round_trip() {
        let storage = MemoryStorage::new();
        let opts = || options().format(Format::MessagePack);

        let first = persist(prefs, opts(), Arc::new(storage.clone()), &Telemetry::disabled()).await;
        first.set_state(Partial::new().with("theme", "solarized").unwrap()).unwrap();
        first.flush().await;

        let second = persist(prefs, opts(), Arc::new(storage), &Telemetry::disabled()).await;
        assert_eq!(second.get_state().theme, "solarized");
    }
}
