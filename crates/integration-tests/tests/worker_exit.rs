//! Worker-initiated exits: idle timeout, passive kill, handler shutdown

mod common;

use common::{config, gated_factory, Gate, Rig};
use warren_core::application::{message_handler_fn, DispatcherEvent, WorkerEvent, WorkerFactory};
use warren_core::domain::{ExitMode, WorkerId};

async fn consumed_by(rig: &mut Rig) -> WorkerId {
    match rig
        .wait_for(|e| matches!(e, DispatcherEvent::Consumed { .. }))
        .await
    {
        DispatcherEvent::Consumed { worker_id, .. } => worker_id,
        _ => unreachable!(),
    }
}

async fn exit_of(rig: &mut Rig) -> (WorkerId, usize) {
    match rig
        .wait_for(|e| matches!(e, DispatcherEvent::WorkerExit { .. }))
        .await
    {
        DispatcherEvent::WorkerExit {
            worker_id,
            remaining,
            ..
        } => (worker_id, remaining),
        _ => unreachable!(),
    }
}

#[tokio::test(start_paused = true)]
async fn test_idle_worker_leaves_and_is_replaced() {
    let (factory, handled) = gated_factory(&Gate::open());
    let mut rig = Rig::start(config(Some(1), 0), factory.with_idle_shutdown(5)).await;

    rig.publish("m1").await;
    let first = consumed_by(&mut rig).await;
    rig.wait_processed(1).await;

    // STOP_SENDING -> LAST_MSG -> I_QUIT -> ROGER_THAT -> exit
    let (exited, remaining) = exit_of(&mut rig).await;
    assert_eq!(exited, first);
    assert_eq!(remaining, 0);
    assert_eq!(rig.snapshot().await.workers, 0);

    rig.publish("m2").await;
    let second = consumed_by(&mut rig).await;
    assert_ne!(second, first, "a fresh worker takes the next message");
    rig.wait_processed(1).await;
    assert_eq!(*handled.lock().unwrap(), vec!["m1", "m2"]);

    let (dispatcher, result) = rig.shutdown().await;
    assert!(result.is_ok());
    assert_eq!(dispatcher.stats().peak_num_workers, 1);
}

#[tokio::test(start_paused = true)]
async fn test_passive_worker_is_killed_on_request() {
    let mut factory = WorkerFactory::new()
        .with_idle_shutdown(1)
        .with_exit_mode(ExitMode::Passive);
    let mut worker_events = factory.subscribe();
    let mut rig = Rig::start(config(Some(1), 0), factory).await;

    rig.publish("m1").await;
    let worker = consumed_by(&mut rig).await;
    let (exited, _) = exit_of(&mut rig).await;
    assert_eq!(exited, worker);

    // Aborted tasks never report a disconnect
    let mut saw_start = false;
    while let Ok(event) = worker_events.try_recv() {
        assert!(!matches!(event, WorkerEvent::Disconnected { .. }));
        saw_start |= matches!(event, WorkerEvent::Start { .. });
    }
    assert!(saw_start);

    let (dispatcher, result) = rig.shutdown().await;
    assert!(result.is_ok());
    assert_eq!(dispatcher.count_workers(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_handler_requested_shutdown_retires_worker() {
    let factory = WorkerFactory::new().with_message_handler(message_handler_fn(|message, ctx| {
        if message.content_str() == Some("last") {
            ctx.shutdown();
        }
        Ok(())
    }));
    let mut rig = Rig::start(config(None, 0), factory).await;

    rig.publish("last").await;
    let first = consumed_by(&mut rig).await;
    let (exited, remaining) = exit_of(&mut rig).await;
    assert_eq!(exited, first);
    assert_eq!(remaining, 0);

    rig.publish("next").await;
    let second = consumed_by(&mut rig).await;
    assert_ne!(second, first);
    rig.wait_processed(1).await;

    let (dispatcher, _) = rig.shutdown().await;
    assert_eq!(dispatcher.stats().processed, 2);
}

#[tokio::test(start_paused = true)]
async fn test_exited_worker_leaves_the_scheduler() {
    let gate = Gate::closed();
    let (factory, handled) = gated_factory(&gate);
    let mut rig = Rig::start(config(Some(2), 10), factory.with_idle_shutdown(5)).await;

    rig.publish("m1").await;
    let first = consumed_by(&mut rig).await;
    gate.release();
    rig.wait_processed(1).await;
    let (exited, _) = exit_of(&mut rig).await;
    assert_eq!(exited, first);

    for content in ["m2", "m3"] {
        rig.publish(content).await;
    }
    rig.wait_processed(2).await;
    assert_eq!(handled.lock().unwrap().len(), 3);

    let snapshot = rig.snapshot().await;
    assert!(snapshot.workers >= 1);
    assert_eq!(snapshot.retired, 0, "exited workers leave the scheduler");
    rig.shutdown().await;
}
