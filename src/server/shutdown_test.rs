use super::shutdown::*;
use crate::controller::store::MockReleaseStore;
use crate::controller::test_support::{deployed, pending};
use crate::controller::updater::run_gc_loop;
use crate::crd::release::{PlatformRelease, ReleasePhase};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_signal_starts_clear() {
    let (_controller, signal) = shutdown_channel();
    assert!(!signal.is_shutdown());
}

#[tokio::test]
async fn test_clones_observe_shutdown() {
    let (controller, signal) = shutdown_channel();
    let other = signal.clone();

    controller.shutdown();

    assert!(signal.is_shutdown());
    assert!(other.is_shutdown());
}

#[tokio::test]
async fn test_wait_completes_on_shutdown() {
    let (controller, mut signal) = shutdown_channel();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        controller.shutdown();
    });

    let result = tokio::time::timeout(Duration::from_secs(1), signal.wait()).await;
    assert!(result.is_ok(), "wait() should complete when shutdown triggered");
}

#[tokio::test]
async fn test_wait_completes_when_controller_dropped() {
    let (controller, mut signal) = shutdown_channel();
    drop(controller);

    let result = tokio::time::timeout(Duration::from_secs(1), signal.wait()).await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_shutdown_without_listeners_is_harmless() {
    let (controller, signal) = shutdown_channel();
    drop(signal);

    controller.shutdown();
    controller.shutdown();
}

#[tokio::test]
async fn test_gc_loop_runs_then_stops() {
    let store = MockReleaseStore::new(vec![pending("v1.29.0"), deployed("v1.30.0")]);
    let (controller, signal) = shutdown_channel();

    let handle = tokio::spawn(run_gc_loop::<PlatformRelease>(
        Arc::new(store.clone()),
        Duration::from_secs(3600),
        3,
        signal,
    ));
    // the first tick fires immediately
    tokio::time::sleep(Duration::from_millis(50)).await;
    controller.shutdown();

    let stopped = tokio::time::timeout(Duration::from_secs(1), handle).await;
    assert!(stopped.is_ok(), "GC loop should stop on shutdown");
    assert_eq!(store.phase_of("v1.29.0"), Some(ReleasePhase::Skipped));
}
