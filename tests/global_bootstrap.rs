//! The process-wide bootstrap lives in its own test binary so no other test
//! can start it first.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use zubridge_runtime::{init_stores, register_initializer, Bootstrap, Error, Readiness};

#[tokio::test]
async fn global_bootstrap_runs_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    register_initializer("global", move || async move {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok::<(), Error>(())
    })
    .unwrap();

    assert_eq!(Bootstrap::global().readiness(), Readiness::Pending);

    let (a, b) = tokio::join!(init_stores(), init_stores());
    a.unwrap();
    b.unwrap();
    init_stores().await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(Bootstrap::global().readiness(), Readiness::Ready);

    let late = register_initializer("too-late", || async { Ok::<(), Error>(()) });
    assert!(matches!(late, Err(Error::LateRegistration(_))));
}
