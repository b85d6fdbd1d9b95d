//! Backpressure: worker cap, message cache and feed pause/resume

mod common;

use common::{config, gated_factory, Gate, Rig};
use warren_core::application::DispatcherEvent;
use warren_core::port::queue_feed::mocks::FeedCall;

#[tokio::test(start_paused = true)]
async fn test_feed_pauses_at_cache_limit_and_resumes_once() {
    let gate = Gate::closed();
    let (factory, handled) = gated_factory(&gate);
    let mut rig = Rig::start(config(Some(1), 2), factory).await;

    for content in ["m1", "m2", "m3", "m4"] {
        rig.publish(content).await;
    }
    let snapshot = rig.wait_until(|s| s.cached == 3).await;
    assert!(snapshot.limit_reached);
    assert_eq!(snapshot.workers, 1);
    assert_eq!(rig.feed.count(&FeedCall::Pause), 1, "paused once at the limit");
    assert_eq!(rig.feed.count(&FeedCall::Resume), 0);

    gate.release();
    rig.wait_processed(4).await;
    rig.wait_until(|s| s.cached == 0 && !s.limit_reached).await;

    assert_eq!(rig.feed.count(&FeedCall::Pause), 1);
    assert_eq!(rig.feed.count(&FeedCall::Resume), 1, "resumed once the cache drained");
    assert_eq!(*handled.lock().unwrap(), vec!["m1", "m2", "m3", "m4"]);

    let (dispatcher, _) = rig.shutdown().await;
    assert_eq!(dispatcher.stats().peak_num_cached, 3);
}

#[tokio::test(start_paused = true)]
async fn test_limit_reached_is_announced_once_per_saturation() {
    let gate = Gate::closed();
    let (factory, _handled) = gated_factory(&gate);
    let mut rig = Rig::start(config(Some(2), 10), factory).await;

    for content in ["m1", "m2", "m3", "m4", "m5"] {
        rig.publish(content).await;
    }
    let snapshot = rig.wait_until(|s| s.cached == 3).await;
    assert_eq!(snapshot.workers, 2, "no worker beyond the cap");
    assert!(snapshot.limit_reached);
    assert_eq!(rig.feed.count(&FeedCall::Pause), 0, "cache still below its limit");
    assert_eq!(count_limit_reached(&mut rig), 1);

    // Draining the cache re-saturates the pool without a new announcement
    gate.release();
    rig.wait_until(|s| s.stats.processed == 5).await;
    assert_eq!(count_limit_reached(&mut rig), 0);

    let (dispatcher, _) = rig.shutdown().await;
    assert_eq!(dispatcher.stats().peak_num_workers, 2);
    assert_eq!(dispatcher.stats().consumed, 5);
}

fn count_limit_reached(rig: &mut Rig) -> usize {
    rig.drain_events()
        .iter()
        .filter(|e| matches!(e, DispatcherEvent::LimitReached))
        .count()
}

#[tokio::test(start_paused = true)]
async fn test_zero_cache_limit_pauses_on_saturation() {
    let gate = Gate::closed();
    let (factory, _handled) = gated_factory(&gate);
    let mut rig = Rig::start(config(Some(1), 0), factory).await;

    rig.publish("m1").await;
    rig.wait_for(|e| matches!(e, DispatcherEvent::LimitReached))
        .await;
    let snapshot = rig.wait_until(|s| s.limit_reached).await;
    assert_eq!(snapshot.cached, 0);
    assert_eq!(rig.feed.count(&FeedCall::Pause), 1);

    gate.release();
    rig.wait_processed(1).await;
    rig.wait_until(|s| !s.limit_reached).await;
    assert_eq!(rig.feed.count(&FeedCall::Resume), 1);
    assert_eq!(
        rig.feed.calls(),
        vec![
            FeedCall::Connect,
            FeedCall::Ack(1),
            FeedCall::Pause,
            FeedCall::Resume
        ]
    );
    rig.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_unlimited_workers_never_pause() {
    let gate = Gate::closed();
    let (factory, _handled) = gated_factory(&gate);
    let mut rig = Rig::start(config(None, 0), factory).await;

    for content in ["m1", "m2", "m3"] {
        rig.publish(content).await;
    }
    let snapshot = rig.wait_until(|s| s.workers == 3).await;
    assert_eq!(snapshot.cached, 0);
    assert!(!snapshot.limit_reached);
    assert_eq!(rig.feed.count(&FeedCall::Pause), 0);

    gate.release();
    rig.wait_processed(3).await;
    rig.shutdown().await;
}
