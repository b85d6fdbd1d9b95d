//! Graceful shutdown: flushing, worker quit handshake, timeouts

mod common;

use std::time::Duration;

use common::{config, gated_factory, Gate, Rig};
use warren_core::application::{DeliveryGuarantee, DispatcherConfig, DispatcherEvent};
use warren_core::domain::DispatcherState;
use warren_core::port::queue_feed::mocks::FeedCall;
use warren_core::port::FeedError;
use warren_core::AppError;

#[tokio::test(start_paused = true)]
async fn test_in_flight_and_cached_messages_finish_before_exit() {
    let gate = Gate::closed();
    let (factory, handled) = gated_factory(&gate);
    let mut rig = Rig::start(config(Some(2), 10), factory).await;

    for content in ["m1", "m2", "m3", "m4"] {
        rig.publish(content).await;
    }
    rig.wait_until(|s| s.cached == 2).await;

    rig.handle.shutdown().unwrap();
    let snapshot = rig.wait_until(|s| s.state == DispatcherState::Flushing).await;
    assert_eq!(snapshot.cached, 2);
    assert_eq!(rig.feed.count(&FeedCall::Disconnect), 1);

    gate.release();
    let (dispatcher, result) = rig.join().await;
    assert!(result.is_ok());
    assert_eq!(dispatcher.state(), DispatcherState::Shutdown);
    assert_eq!(dispatcher.count_workers(), 0);
    assert_eq!(dispatcher.stats().processed, 4);

    let mut seen = handled.lock().unwrap().clone();
    seen.sort();
    assert_eq!(seen, vec!["m1", "m2", "m3", "m4"]);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_emits_final_stats() {
    let (factory, _handled) = gated_factory(&Gate::open());
    let mut rig = Rig::start(config(None, 0), factory).await;

    rig.publish("m1").await;
    rig.wait_processed(1).await;
    rig.handle.shutdown().unwrap();

    let event = rig
        .wait_for(|e| matches!(e, DispatcherEvent::Shutdown { .. }))
        .await;
    let DispatcherEvent::Shutdown { stats } = event else {
        unreachable!()
    };
    assert_eq!(stats.consumed, 1);
    assert_eq!(stats.processed, 1);

    let (_, result) = rig.join().await;
    assert!(result.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_stalled_flush_requeues_cached_deliveries() {
    let gate = Gate::closed();
    let (factory, _handled) = gated_factory(&gate);
    let at_least_once = DispatcherConfig {
        delivery_guarantee: DeliveryGuarantee::AtLeastOnce,
        shutdown_timeout: Duration::from_secs(2),
        ..config(Some(1), 10)
    };
    let rig = Rig::start(at_least_once, factory).await;

    for content in ["m1", "m2", "m3"] {
        rig.publish(content).await;
    }
    rig.wait_until(|s| s.cached == 2).await;
    assert_eq!(rig.feed.acked(), vec![1], "only the dispatched delivery is acked");

    let feed = rig.feed.clone();
    let (dispatcher, result) = rig.shutdown().await;
    assert!(result.is_ok());
    assert_eq!(dispatcher.state(), DispatcherState::Shutdown);
    assert_eq!(dispatcher.num_cached(), 0);
    assert_eq!(feed.count(&FeedCall::Reject(2, true)), 1);
    assert_eq!(feed.count(&FeedCall::Reject(3, true)), 1);
    assert_eq!(feed.acked(), vec![1]);
    drop(gate);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_error_is_returned_from_run() {
    let (factory, _handled) = gated_factory(&Gate::open());
    let rig = Rig::start(config(None, 0), factory).await;

    rig.handle
        .shutdown_with_error(AppError::Feed(FeedError::Io("broker went away".to_string())))
        .unwrap();
    let handle = rig.handle.clone();
    let (dispatcher, result) = rig.join().await;
    assert!(matches!(
        result,
        Err(AppError::Feed(FeedError::Io(msg))) if msg == "broker went away"
    ));

    drop(dispatcher);
    assert!(handle.shutdown().is_err(), "commands fail once the dispatcher is gone");
}

#[tokio::test(start_paused = true)]
async fn test_repeated_shutdown_requests_are_harmless() {
    let (factory, _handled) = gated_factory(&Gate::open());
    let rig = Rig::start(config(None, 0), factory).await;

    rig.handle.shutdown().unwrap();
    rig.handle.shutdown().unwrap();
    let feed = rig.feed.clone();
    let (_, result) = rig.join().await;
    assert!(result.is_ok());
    assert_eq!(feed.count(&FeedCall::Disconnect), 1);
}
