use std::time::Duration;

use serde::{Deserialize, Serialize};
use zubridge_runtime::{
    Partial, PersistOptions, PersistedStore, Runtime, RuntimeConfig, StorageConfig, TelemetryConfig,
    Update,
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct CounterState {
    count: i64,
    last_updated: Option<String>,
}

/// Only the count survives a restart
#[derive(Serialize)]
struct PersistedCounter {
    count: i64,
}

fn initial_counter() -> CounterState {
    CounterState {
        count: 0,
        last_updated: None,
    }
}

fn select_count(state: &CounterState) -> i64 {
    state.count
}

fn counter_options() -> PersistOptions<CounterState> {
    PersistOptions::new("app-template-counter").partialize(|s: &CounterState| PersistedCounter { count: s.count })
}

// Actions
fn increment(counter: &PersistedStore<CounterState>) -> zubridge_runtime::Result<()> {
    counter.try_set_state_with(|s| stamp(s.count + 1))
}

fn decrement(counter: &PersistedStore<CounterState>) -> zubridge_runtime::Result<()> {
    counter.try_set_state_with(|s| stamp(s.count - 1))
}

fn reset(counter: &PersistedStore<CounterState>) -> zubridge_runtime::Result<()> {
    counter.set_state(stamp(0)?)
}

fn stamp(count: i64) -> zubridge_runtime::Result<Update<CounterState>> {
    let partial = Partial::new()
        .with("count", count)?
        .with("last_updated", chrono::Utc::now().to_rfc3339())?;
    Ok(Update::Merge(partial))
}

async fn start(
    dir: &std::path::Path,
    websocket_port: Option<u16>,
) -> Result<(Runtime, PersistedStore<CounterState>), Box<dyn std::error::Error>> {
    let config = RuntimeConfig {
        storage: StorageConfig::File { dir: dir.to_path_buf() },
        telemetry: TelemetryConfig {
            websocket_port,
            ..Default::default()
        },
        ..Default::default()
    };

    let runtime = Runtime::new(config).await?;
    let counter = runtime.create_persistent_store(initial_counter, counter_options()).await;

    let store = counter.clone();
    runtime.register_initializer("counter", move || async move {
        // Stand-in for fetching remote state
        tokio::time::sleep(Duration::from_millis(50)).await;
        log::info!("Counter ready at {}", select_count(&store.get_state()));
        Ok::<(), zubridge_runtime::Error>(())
    })?;

    Ok((runtime, counter))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    zubridge_runtime::telemetry::init_logger(false);

    println!("Zubridge Store Runtime Example");
    println!("==============================");

    let dir = std::env::temp_dir().join("zubridge-counter-demo");
    let (runtime, counter) = start(&dir, Some(9000)).await?;
    let subscription = counter.subscribe(select_count, |count, previous| {
        println!("count: {} -> {}", previous, count);
    });

    runtime.init_stores().await?;
    println!("Stores ready; telemetry feed on ws://localhost:9000");

    increment(&counter)?;
    increment(&counter)?;
    increment(&counter)?;
    decrement(&counter)?;
    println!("State after actions: {:?}", counter.get_state());

    counter.flush().await;
    subscription.unsubscribe();
    drop(counter);
    drop(runtime);

    // Simulate a restart over the same directory
    println!("------------------------------------");
    println!("Restarting...");
    let (runtime, counter) = start(&dir, None).await?;
    runtime.init_stores().await?;
    println!("Rehydrated state: {:?}", counter.get_state());

    reset(&counter)?;
    counter.flush().await;
    counter.clear_storage().await?;

    Ok(())
}
