//! Term supervision driven by synthetic leadership events.

mod common;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use sentinel_failover::controller::{run_elected, supervise};
use sentinel_failover::endpoints::TargetPublisher;
use sentinel_failover::service::LogicalService;
use sentinel_failover::{LeaderElector, LeadershipEvent, PublishError};

use common::*;

#[tokio::test(start_paused = true)]
async fn test_reacquired_leadership_republishes_same_address() {
    let resolver = ScriptedResolver::fixed("10.0.0.5");
    let publisher = RecordingPublisher::new(&resolver);
    let reconciler = test_reconciler(Arc::new(resolver.clone()), Arc::new(publisher.clone()));

    let (tx, rx) = mpsc::channel(4);
    let handle = tokio::spawn(supervise(rx, reconciler, CancellationToken::new()));

    tx.send(LeadershipEvent::Acquired).await.unwrap();
    tokio::time::sleep(TICK * 2 + TICK / 2).await;
    assert_eq!(resolver.calls(), 3);

    tx.send(LeadershipEvent::Lost).await.unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(resolver.calls(), 3, "no ticks while not leading");

    tx.send(LeadershipEvent::Acquired).await.unwrap();
    tokio::time::sleep(TICK / 2).await;

    assert_eq!(
        publisher.published(),
        vec![(1, ip("10.0.0.5")), (4, ip("10.0.0.5"))]
    );

    drop(tx);
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_nothing_runs_before_acquisition() {
    let resolver = ScriptedResolver::fixed("10.0.0.5");
    let publisher = RecordingPublisher::new(&resolver);
    let reconciler = test_reconciler(Arc::new(resolver.clone()), Arc::new(publisher.clone()));

    let (tx, rx) = mpsc::channel(4);
    let handle = tokio::spawn(supervise(rx, reconciler, CancellationToken::new()));

    tokio::time::sleep(TICK * 4).await;
    assert_eq!(resolver.calls(), 0);

    drop(tx);
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_term_and_releases_lease() {
    let resolver = ScriptedResolver::fixed("10.0.0.5");
    let publisher = RecordingPublisher::new(&resolver);
    let reconciler = test_reconciler(Arc::new(resolver.clone()), Arc::new(publisher.clone()));

    let lock = InMemoryLeaseLock::new();
    let elector = LeaderElector::new(lock.clone(), election_config("pod-a")).unwrap();
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(run_elected(elector, reconciler, shutdown.clone()));

    tokio::time::sleep(TICK + TICK / 2).await;
    assert_eq!(lock.holder().as_deref(), Some("pod-a"));
    assert_eq!(publisher.published(), vec![(1, ip("10.0.0.5"))]);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("controller did not stop promptly")
        .unwrap();

    let calls = resolver.calls();
    tokio::time::sleep(TICK * 3).await;
    assert_eq!(resolver.calls(), calls);
    assert!(lock.holder().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_lost_lease_stops_publishing() {
    let resolver = ScriptedResolver::fixed("10.0.0.5");
    let publisher = RecordingPublisher::new(&resolver);
    let reconciler = test_reconciler(Arc::new(resolver.clone()), Arc::new(publisher.clone()));

    let lock = InMemoryLeaseLock::new();
    let elector = LeaderElector::new(lock.clone(), election_config("pod-a")).unwrap();
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(run_elected(elector, reconciler, shutdown.clone()));

    tokio::time::sleep(Duration::from_secs(1)).await;
    lock.set_failing(true);

    // Lost after retry period + renew deadline (t=12).
    tokio::time::sleep(Duration::from_secs(13)).await;
    let calls = resolver.calls();
    tokio::time::sleep(TICK * 4).await;
    assert_eq!(resolver.calls(), calls, "no ticks after leadership loss");

    shutdown.cancel();
    handle.await.unwrap();
}

/// Notes the lease holder at the moment an in-flight write is abandoned.
struct NoteHolderOnDrop {
    lock: InMemoryLeaseLock,
    seen: Arc<Mutex<Vec<Option<String>>>>,
}

impl Drop for NoteHolderOnDrop {
    fn drop(&mut self) {
        self.seen.lock().push(self.lock.holder());
    }
}

/// A publisher whose writes are still in flight when the term ends.
struct StuckPublisher {
    lock: InMemoryLeaseLock,
    seen: Arc<Mutex<Vec<Option<String>>>>,
}

#[async_trait]
impl TargetPublisher for StuckPublisher {
    async fn publish(&self, _service: &LogicalService, _addr: IpAddr) -> Result<(), PublishError> {
        let _note = NoteHolderOnDrop {
            lock: self.lock.clone(),
            seen: self.seen.clone(),
        };
        std::future::pending().await
    }
}

#[tokio::test(start_paused = true)]
async fn test_lease_released_only_after_term_stopped() {
    let lock = InMemoryLeaseLock::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let publisher = StuckPublisher {
        lock: lock.clone(),
        seen: seen.clone(),
    };
    let reconciler = test_reconciler(
        Arc::new(ScriptedResolver::fixed("10.0.0.5")),
        Arc::new(publisher),
    );

    let elector = LeaderElector::new(lock.clone(), election_config("pod-a")).unwrap();
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(run_elected(elector, reconciler, shutdown.clone()));

    // First tick starts a write that is still pending at shutdown.
    tokio::time::sleep(Duration::from_secs(1)).await;
    shutdown.cancel();
    handle.await.unwrap();

    assert_eq!(*seen.lock(), vec![Some("pod-a".to_string())]);
    assert!(lock.holder().is_none());
}
