use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_test::{assert_err, assert_ok};
use zubridge_runtime::{
    Bootstrap, Error, MemoryStorage, OrchestrationStatus, Partial, PersistOptions, Readiness, Runtime, RuntimeConfig,
    StorageBackend, Telemetry, TelemetryConfig, TelemetryEventKind,
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Settings {
    theme: String,
    loaded_from_server: bool,
}

fn default_settings() -> Settings {
    Settings {
        theme: "light".to_string(),
        loaded_from_server: false,
    }
}

fn test_runtime(storage: MemoryStorage) -> Runtime {
    let telemetry = Telemetry::new(TelemetryConfig {
        console_output: false,
        ..Default::default()
    });
    Runtime::with_parts(RuntimeConfig::default(), Arc::new(storage), telemetry, None)
}

#[tokio::test]
async fn init_stores_runs_store_initializers_once() {
    let runtime = test_runtime(MemoryStorage::new());
    let settings = runtime
        .create_persistent_store(default_settings, PersistOptions::new("settings"))
        .await;

    let calls = Arc::new(AtomicUsize::new(0));
    let store = settings.clone();
    let counter = calls.clone();
    assert_ok!(runtime.register_initializer("settings", move || async move {
        counter.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.set_state(Partial::new().with("loaded_from_server", true)?)
    }));

    assert_eq!(runtime.readiness(), Readiness::Pending);

    let (a, b, c) = tokio::join!(runtime.init_stores(), runtime.init_stores(), runtime.init_stores());
    assert_ok!(a);
    assert_ok!(b);
    assert_ok!(c);

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(settings.get_state().loaded_from_server);
    assert_eq!(runtime.readiness(), Readiness::Ready);

    // Later calls resolve immediately with the same outcome
    assert_ok!(runtime.init_stores().await);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn late_registration_is_rejected_and_reported() {
    let runtime = test_runtime(MemoryStorage::new());
    assert_ok!(runtime.init_stores().await);

    let ran = Arc::new(AtomicUsize::new(0));
    let flag = ran.clone();
    let result = runtime.register_initializer("late", move || async move {
        flag.fetch_add(1, Ordering::SeqCst);
        Ok::<(), Error>(())
    });

    assert!(matches!(result, Err(Error::LateRegistration(ref name)) if name == "late"));
    assert_ok!(runtime.init_stores().await);
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert!(runtime
        .telemetry()
        .history()
        .iter()
        .any(|e| e.kind == TelemetryEventKind::LateRegistration));
}

#[tokio::test]
async fn registration_while_running_is_rejected() {
    let runtime = test_runtime(MemoryStorage::new());
    let (release, gate) = tokio::sync::oneshot::channel::<()>();
    runtime
        .register_initializer("slow", move || async move {
            let _ = gate.await;
            Ok::<(), Error>(())
        })
        .unwrap();

    let runner = runtime.clone();
    let run = tokio::spawn(async move { runner.init_stores().await });

    let mut status = runtime.bootstrap().subscribe();
    status
        .wait_for(|s| *s == OrchestrationStatus::Running)
        .await
        .unwrap();

    let ran = Arc::new(AtomicUsize::new(0));
    let flag = ran.clone();
    let result = runtime.register_initializer("during-run", move || async move {
        flag.fetch_add(1, Ordering::SeqCst);
        Ok::<(), Error>(())
    });
    assert!(matches!(result, Err(Error::LateRegistration(ref name)) if name == "during-run"));
    assert_eq!(runtime.bootstrap().registered_initializers(), vec!["slow"]);

    release.send(()).unwrap();
    assert_ok!(run.await.unwrap());
    assert_eq!(runtime.readiness(), Readiness::Ready);
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn failing_initializer_fails_every_waiter() {
    let runtime = test_runtime(MemoryStorage::new());
    let finished = Arc::new(AtomicUsize::new(0));

    let done = finished.clone();
    runtime
        .register_initializer("slow-ok", move || async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            done.fetch_add(1, Ordering::SeqCst);
            Ok::<(), Error>(())
        })
        .unwrap();
    runtime
        .register_initializer("broken", || async { Err::<(), _>(Error::Storage("unreachable".to_string())) })
        .unwrap();

    let (a, b) = tokio::join!(runtime.init_stores(), runtime.bootstrap().wait_ready());
    assert_err!(a);
    assert_err!(b);

    // Siblings are not cancelled
    assert_eq!(finished.load(Ordering::SeqCst), 1);
    match runtime.bootstrap().status() {
        OrchestrationStatus::Failed(reason) => assert!(reason.contains("broken")),
        other => panic!("unexpected status {:?}", other),
    }
    assert!(matches!(runtime.readiness(), Readiness::Failed(_)));
}

#[tokio::test]
async fn initializers_start_concurrently() {
    let runtime = test_runtime(MemoryStorage::new());
    let order = Arc::new(Mutex::new(Vec::new()));

    for (name, delay) in [("first", 40u64), ("second", 0)] {
        let order = order.clone();
        runtime
            .register_initializer(name, move || async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                order.lock().unwrap().push(name);
                Ok::<(), Error>(())
            })
            .unwrap();
    }

    assert_eq!(runtime.bootstrap().registered_initializers(), vec!["first", "second"]);
    runtime.init_stores().await.unwrap();
    assert_eq!(*order.lock().unwrap(), vec!["second", "first"]);
}

#[tokio::test]
async fn readiness_can_be_observed_without_polling() {
    let runtime = test_runtime(MemoryStorage::new());
    runtime
        .register_initializer("tick", || async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok::<(), Error>(())
        })
        .unwrap();

    let mut status = runtime.bootstrap().subscribe();
    assert_eq!(*status.borrow(), OrchestrationStatus::NotStarted);

    let runner = runtime.clone();
    let handle = tokio::spawn(async move { runner.init_stores().await });

    let done = status.wait_for(OrchestrationStatus::is_terminal).await.unwrap().clone();
    assert_eq!(done, OrchestrationStatus::Done);
    assert_ok!(handle.await.unwrap());
}

#[tokio::test]
async fn runtime_shares_storage_between_stores() {
    let storage = MemoryStorage::new();
    let runtime = test_runtime(storage.clone());

    let settings = runtime
        .create_persistent_store(default_settings, PersistOptions::new("settings"))
        .await;
    settings
        .set_state(Partial::new().with("theme", "dark").unwrap())
        .unwrap();
    settings.flush().await;
    assert!(storage.get("settings").await.unwrap().is_some());

    let plain = runtime.create_store("scratch", default_settings);
    assert_eq!(plain.name(), Some("scratch"));
    plain.set_state(Partial::new().with("theme", "blue").unwrap()).unwrap();
    assert_eq!(storage.len().await, 1);

    let restarted = test_runtime(storage);
    let settings = restarted
        .create_persistent_store(default_settings, PersistOptions::new("settings"))
        .await;
    assert_eq!(settings.get_state().theme, "dark");
}

#[tokio::test]
async fn separate_runtimes_have_separate_bootstraps() {
    let one = test_runtime(MemoryStorage::new());
    let two = test_runtime(MemoryStorage::new());

    one.init_stores().await.unwrap();
    assert_eq!(two.bootstrap().status(), OrchestrationStatus::NotStarted);
    assert_ok!(two.register_initializer("still-open", || async { Ok::<(), Error>(()) }));
}

#[tokio::test]
async fn runtime_can_share_an_existing_bootstrap() {
    let telemetry = Telemetry::disabled();
    let bootstrap = Bootstrap::new(telemetry.clone());
    let runtime = Runtime::with_parts(
        RuntimeConfig::default(),
        Arc::new(MemoryStorage::new()),
        telemetry,
        Some(bootstrap.clone()),
    );

    bootstrap
        .register_initializer("direct", || async { Ok::<(), Error>(()) })
        .unwrap();
    runtime.init_stores().await.unwrap();
    assert_eq!(bootstrap.status(), OrchestrationStatus::Done);
}
