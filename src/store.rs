//! Observable state container
//!
//! A [`Store`] owns one state value. Mutations either replace the value or
//! shallow-merge a [`Partial`] into it, and each commit is a single atomic
//! step: readers see the old state or the new one, never a mix. After a
//! commit, listeners whose selected value changed are called in subscription
//! order, then commit hooks (such as persistence) run.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use log::debug;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{BoxError, Error, Result};
use crate::telemetry::{Telemetry, TelemetryEventKind};

/// Bound for values a store can hold
///
/// Shallow merging goes through the value's serde representation, which must
/// be an object whose keys are the top-level fields. A merge is refused when
/// that representation would lose data held by the current state, such as a
/// non-default `#[serde(skip)]` field or a NaN float; use
/// [`Update::Replace`] for such states.
pub trait StateValue: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> StateValue for T where T: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// A subset of top-level state fields
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Partial(serde_json::Map<String, JsonValue>);

impl Partial {
    /// Create an empty partial
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field, builder style
    pub fn with(mut self, field: impl Into<String>, value: impl Serialize) -> Result<Self> {
        self.insert(field, value)?;
        Ok(self)
    }

    /// Add or overwrite a field
    pub fn insert(&mut self, field: impl Into<String>, value: impl Serialize) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.0.insert(field.into(), value);
        Ok(())
    }

    /// Build a partial from anything that serializes to an object
    pub fn from_serializable<P: Serialize + ?Sized>(value: &P) -> Result<Self> {
        match serde_json::to_value(value)? {
            JsonValue::Object(map) => Ok(Self(map)),
            other => Err(Error::InvalidPartial(format!(
                "expected an object, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Get a field's value
    pub fn get(&self, field: &str) -> Option<&JsonValue> {
        self.0.get(field)
    }

    /// Whether the field is present
    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    /// Field names
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Keep only the fields for which `keep` returns true
    pub fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.0.retain(|field, _| keep(field));
    }

    pub fn into_inner(self) -> serde_json::Map<String, JsonValue> {
        self.0
    }

    /// Shallow-merge this partial into a state value
    ///
    /// Fails without touching anything if a field is unknown to the state,
    /// the merged value no longer deserializes into `T`, or the state's serde
    /// form does not carry all of its data.
    pub fn apply_to<T: StateValue>(&self, state: &T) -> Result<T> {
        let mut value = serde_json::to_value(state)?;

        // Untouched fields are rebuilt from `value`, so it must be lossless
        let lossless = serde_json::from_value::<T>(value.clone())
            .map(|rebuilt| rebuilt == *state)
            .unwrap_or(false);
        if !lossless {
            return Err(Error::InvalidPartial(
                "state does not survive a serde round trip; replace it instead of merging".to_string(),
            ));
        }

        let object = value.as_object_mut().ok_or_else(|| {
            Error::InvalidPartial("state does not serialize to an object".to_string())
        })?;

        for (field, field_value) in &self.0 {
            match object.get_mut(field) {
                Some(slot) => *slot = field_value.clone(),
                None => return Err(Error::InvalidPartial(format!("unknown field \"{}\"", field))),
            }
        }

        serde_json::from_value(value).map_err(|e| Error::InvalidPartial(e.to_string()))
    }
}

impl From<serde_json::Map<String, JsonValue>> for Partial {
    fn from(map: serde_json::Map<String, JsonValue>) -> Self {
        Self(map)
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

/// A state mutation
#[derive(Clone, Debug)]
pub enum Update<T> {
    /// Replace the whole state
    Replace(T),

    /// Shallow-merge fields into the current state
    Merge(Partial),
}

impl<T> From<Partial> for Update<T> {
    fn from(partial: Partial) -> Self {
        Update::Merge(partial)
    }
}

/// Runs after every commit, once listeners have been notified
pub trait CommitHook<T>: Send + Sync {
    /// Called with the committed state and its revision
    fn on_commit(&self, state: &T, revision: u64);
}

struct Snapshot<T> {
    state: Arc<T>,
    revision: u64,
}

struct Listener<T> {
    id: u64,
    active: AtomicBool,
    notify: Box<dyn Fn(&T, u64) + Send + Sync>,
}

struct StoreInner<T> {
    name: Option<String>,
    snapshot: RwLock<Snapshot<T>>,

    /// Serializes mutations on this container
    mutation: Mutex<()>,

    listeners: Mutex<Vec<Arc<Listener<T>>>>,
    next_listener_id: AtomicU64,
    hooks: Vec<Arc<dyn CommitHook<T>>>,
    telemetry: Telemetry,
}

fn lock<G>(mutex: &Mutex<G>) -> MutexGuard<'_, G> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read<G>(lock: &RwLock<G>) -> RwLockReadGuard<'_, G> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<G>(lock: &RwLock<G>) -> RwLockWriteGuard<'_, G> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

trait ListenerRegistry: Send + Sync {
    fn remove_listener(&self, id: u64);
}

impl<T: Send + Sync + 'static> ListenerRegistry for StoreInner<T> {
    fn remove_listener(&self, id: u64) {
        let mut listeners = lock(&self.listeners);
        if let Some(index) = listeners.iter().position(|l| l.id == id) {
            let listener = listeners.remove(index);
            // A dispatch already holding this listener must skip it
            listener.active.store(false, Ordering::SeqCst);
        }
    }
}

/// Handle returned by [`Store::subscribe`]
///
/// Holds only a weak reference to the store. Dropping it leaves the listener
/// registered.
pub struct Subscription {
    id: u64,
    store: Weak<dyn ListenerRegistry>,
    removed: AtomicBool,
}

impl Subscription {
    /// Remove the listener. Calling this more than once is a no-op.
    pub fn unsubscribe(&self) {
        if self.removed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(store) = self.store.upgrade() {
            store.remove_listener(self.id);
        }
    }

    /// Whether `unsubscribe` has been called
    pub fn is_unsubscribed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }
}

/// Builder for stores that need a name, telemetry or commit hooks
pub struct StoreBuilder<T> {
    initial: T,
    name: Option<String>,
    telemetry: Option<Telemetry>,
    hooks: Vec<Arc<dyn CommitHook<T>>>,
}

impl<T: StateValue> StoreBuilder<T> {
    /// Name used in logs and telemetry
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Telemetry channel for store events
    pub fn telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Add a hook run after every commit
    pub fn hook(mut self, hook: Arc<dyn CommitHook<T>>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Build the store
    pub fn build(self) -> Store<T> {
        let telemetry = self.telemetry.unwrap_or_else(Telemetry::disabled);
        telemetry.record(TelemetryEventKind::StoreCreated, self.name.as_deref(), None);

        Store {
            inner: Arc::new(StoreInner {
                name: self.name,
                snapshot: RwLock::new(Snapshot {
                    state: Arc::new(self.initial),
                    revision: 0,
                }),
                mutation: Mutex::new(()),
                listeners: Mutex::new(Vec::new()),
                next_listener_id: AtomicU64::new(0),
                hooks: self.hooks,
                telemetry,
            }),
        }
    }
}

/// A thread-safe observable state container
pub struct Store<T> {
    inner: Arc<StoreInner<T>>,
}

impl<T> Clone for Store<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: StateValue> Store<T> {
    /// Create a store holding `initial`
    pub fn new(initial: T) -> Self {
        Self::builder(initial).build()
    }

    /// Create a store from an initial state factory, invoked once
    pub fn create<F>(factory: F) -> Self
    where
        F: FnOnce() -> T,
    {
        Self::new(factory())
    }

    /// Start building a store holding `initial`
    pub fn builder(initial: T) -> StoreBuilder<T> {
        StoreBuilder {
            initial,
            name: None,
            telemetry: None,
            hooks: Vec::new(),
        }
    }

    /// Store name, if one was given
    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    /// Get the current state
    pub fn get_state(&self) -> Arc<T> {
        read(&self.inner.snapshot).state.clone()
    }

    /// Number of commits so far
    pub fn revision(&self) -> u64 {
        read(&self.inner.snapshot).revision
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        lock(&self.inner.listeners).len()
    }

    /// Apply an update
    ///
    /// Accepts an [`Update`] or a [`Partial`]. On error the state is left
    /// unchanged and no listener runs.
    pub fn set_state(&self, update: impl Into<Update<T>>) -> Result<()> {
        let update = update.into();
        self.commit(move |_| Ok(update))
    }

    /// Apply the update computed from the current state
    ///
    /// The updater runs while the store's mutation lock is held and must not
    /// mutate this store itself.
    pub fn set_state_with<F>(&self, updater: F) -> Result<()>
    where
        F: FnOnce(&T) -> Update<T>,
    {
        self.commit(|state| Ok(updater(state)))
    }

    /// Like [`set_state_with`](Self::set_state_with), for updaters that can fail
    ///
    /// An updater error is returned as [`Error::Updater`] and nothing changes.
    pub fn try_set_state_with<F, E>(&self, updater: F) -> Result<()>
    where
        F: FnOnce(&T) -> std::result::Result<Update<T>, E>,
        E: Into<BoxError>,
    {
        self.commit(|state| updater(state).map_err(|e| Error::Updater(e.into())))
    }

    /// Replace the whole state
    pub fn replace(&self, state: T) -> Result<()> {
        self.set_state(Update::Replace(state))
    }

    /// Register a listener for changes of a selected value
    ///
    /// `callback` receives the new and the previous selected values. It runs
    /// only when the selected value changes. `selector` must be a pure
    /// function of the state.
    pub fn subscribe<V, S, C>(&self, selector: S, callback: C) -> Subscription
    where
        V: PartialEq + Clone + Send + 'static,
        S: Fn(&T) -> V + Send + Sync + 'static,
        C: Fn(&V, &V) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);

        // Reading the snapshot under the listener lock means a concurrent
        // commit either sees this listener or is already reflected in `last`.
        let mut listeners = lock(&self.inner.listeners);
        let (initial, revision) = {
            let snapshot = read(&self.inner.snapshot);
            (selector(&snapshot.state), snapshot.revision)
        };
        let last = Mutex::new((revision, initial));

        let notify = move |state: &T, revision: u64| {
            let next = selector(state);
            let previous = {
                let mut last = lock(&last);
                if revision <= last.0 {
                    return;
                }
                last.0 = revision;
                if last.1 == next {
                    return;
                }
                std::mem::replace(&mut last.1, next.clone())
            };
            callback(&next, &previous);
        };

        listeners.push(Arc::new(Listener {
            id,
            active: AtomicBool::new(true),
            notify: Box::new(notify),
        }));
        drop(listeners);

        let registry: Arc<dyn ListenerRegistry> = self.inner.clone();
        Subscription {
            id,
            store: Arc::downgrade(&registry),
            removed: AtomicBool::new(false),
        }
    }

    fn commit<F>(&self, compute: F) -> Result<()>
    where
        F: FnOnce(&T) -> Result<Update<T>>,
    {
        let (state, revision) = {
            let _mutation = lock(&self.inner.mutation);
            let current = self.get_state();

            let next = match compute(&*current)? {
                Update::Replace(state) => state,
                Update::Merge(partial) => partial.apply_to(&*current)?,
            };

            let mut snapshot = write(&self.inner.snapshot);
            snapshot.revision += 1;
            snapshot.state = Arc::new(next);
            (snapshot.state.clone(), snapshot.revision)
        };

        debug!(
            "Store {} committed revision {}",
            self.name().unwrap_or("<anonymous>"),
            revision
        );

        // A panicking listener must not keep the commit from its hooks
        let notified = panic::catch_unwind(AssertUnwindSafe(|| self.notify(&state, revision)));

        for hook in &self.inner.hooks {
            hook.on_commit(&state, revision);
        }

        if let Err(payload) = notified {
            panic::resume_unwind(payload);
        }

        self.inner.telemetry.record(
            TelemetryEventKind::StateUpdated,
            self.name(),
            Some(serde_json::json!({ "revision": revision })),
        );

        Ok(())
    }

    fn notify(&self, state: &T, revision: u64) {
        // Iterate over a copy so callbacks may subscribe or unsubscribe
        let listeners: Vec<Arc<Listener<T>>> = lock(&self.inner.listeners).clone();
        for listener in listeners {
            if listener.active.load(Ordering::SeqCst) {
                (listener.notify)(state, revision);
            }
        }
    }
}
