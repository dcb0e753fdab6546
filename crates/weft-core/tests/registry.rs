//! Stream-registry behaviour: admission, chunk accounting, flow control,
//! deadlines, and the terminal statistics contract.

use std::time::Duration;

use weft_bridge::abort::abort_pair;
use weft_core::error::SchedError;
use weft_core::registry::{RegisterOptions, RegistryConfig, RegistrySignal, StreamRegistry};
use weft_proto::notify::{ChunkParams, EventParams, StatsParams, StreamEvent};
use weft_types::StreamId;

fn config() -> RegistryConfig {
    RegistryConfig {
        max_concurrent_streams: 16,
        initial_limit: 8,
        backpressure_threshold: 4,
        slow_consumer_after: Duration::from_millis(50),
        sweep_interval: Duration::from_millis(10),
    }
}

fn token_chunk(stream_id: &StreamId, token: &str, is_final: bool) -> ChunkParams {
    ChunkParams {
        stream_id: stream_id.clone(),
        token: Some(token.to_owned()),
        tokens: None,
        is_final,
    }
}

fn completed(stream_id: &StreamId) -> EventParams {
    EventParams {
        stream_id: stream_id.clone(),
        event: StreamEvent::Completed,
        is_final: true,
    }
}

// Register, emit k chunks, stats, completed: the stats future resolves
// with tokens_generated == k.
#[tokio::test]
async fn tokens_generated_counts_every_chunk() {
    let registry = StreamRegistry::start(config());
    let sid = StreamId::new("s-count");
    let mut handle = registry
        .register(sid.clone(), RegisterOptions::default())
        .await
        .unwrap();

    for i in 0..4 {
        registry
            .handle_chunk(token_chunk(&sid, &format!("t{i}"), false))
            .await;
    }
    registry.handle_chunk(token_chunk(&sid, "t4", true)).await;
    registry
        .handle_stats(StatsParams {
            stream_id: sid.clone(),
            tokens_generated: 5,
            tokens_per_second: 42.0,
            time_to_first_token: 10.0,
            total_time: 120.0,
        })
        .await;
    registry.handle_event(completed(&sid)).await;

    // Chunks arrive in emission order.
    let mut texts = Vec::new();
    while let Some(chunk) = handle.next_chunk().await {
        texts.push(chunk.text());
    }
    assert_eq!(texts, vec!["t0", "t1", "t2", "t3", "t4"]);

    let stats = handle.finished().await.unwrap();
    assert_eq!(stats.tokens_generated, 5);
    assert_eq!(stats.tokens_per_second, 42.0);

    let metrics = registry.metrics().await.unwrap();
    assert_eq!(metrics.completed, 1);
    assert_eq!(metrics.active_streams, 0);
}

#[tokio::test]
async fn admission_respects_current_limit() {
    let registry = StreamRegistry::start(RegistryConfig {
        initial_limit: 1,
        ..config()
    });

    let first = registry
        .register(StreamId::new("s-1"), RegisterOptions::default())
        .await
        .unwrap();

    let overload = registry
        .register(StreamId::new("s-2"), RegisterOptions::default())
        .await;
    assert!(matches!(
        overload,
        Err(SchedError::Overloaded { active: 1, limit: 1 })
    ));

    // Terminating the first stream frees the slot.
    registry.handle_event(completed(&first.stream_id)).await;
    let _ = first.finished().await;
    registry
        .register(StreamId::new("s-3"), RegisterOptions::default())
        .await
        .expect("slot released after completion");
}

#[tokio::test]
async fn duplicate_stream_ids_are_rejected() {
    let registry = StreamRegistry::start(config());
    let sid = StreamId::new("s-dup");
    let _first = registry
        .register(sid.clone(), RegisterOptions::default())
        .await
        .unwrap();
    assert!(matches!(
        registry.register(sid, RegisterOptions::default()).await,
        Err(SchedError::DuplicateStream { .. })
    ));
}

#[tokio::test]
async fn cancel_settles_with_cancelled() {
    let registry = StreamRegistry::start(config());
    let sid = StreamId::new("s-cancel");
    let handle = registry
        .register(sid.clone(), RegisterOptions::default())
        .await
        .unwrap();

    registry.cancel(sid).await;
    assert!(matches!(handle.finished().await, Err(SchedError::Cancelled)));
    assert_eq!(registry.metrics().await.unwrap().cancelled, 1);
}

#[tokio::test]
async fn abort_token_cancels_the_stream() {
    let registry = StreamRegistry::start(config());
    let (abort, token) = abort_pair();
    let handle = registry
        .register(
            StreamId::new("s-abort"),
            RegisterOptions {
                deadline: None,
                abort: Some(token),
            },
        )
        .await
        .unwrap();

    abort.abort();
    assert!(matches!(handle.finished().await, Err(SchedError::Cancelled)));
}

#[tokio::test(start_paused = true)]
async fn deadline_fails_the_stream() {
    let registry = StreamRegistry::start(config());
    let handle = registry
        .register(
            StreamId::new("s-deadline"),
            RegisterOptions {
                deadline: Some(Duration::from_millis(30)),
                abort: None,
            },
        )
        .await
        .unwrap();

    assert!(matches!(
        handle.finished().await,
        Err(SchedError::DeadlineExceeded)
    ));
    assert_eq!(registry.metrics().await.unwrap().failed, 1);
}

#[tokio::test]
async fn unacked_chunks_trigger_backpressure_then_recovery() {
    let registry = StreamRegistry::start(config());
    let mut signals = registry.signals();
    let sid = StreamId::new("s-slow");
    let mut handle = registry
        .register(sid.clone(), RegisterOptions::default())
        .await
        .unwrap();

    // Threshold is 4 unacked chunks.
    for i in 0..4 {
        registry
            .handle_chunk(token_chunk(&sid, &format!("t{i}"), false))
            .await;
    }
    match signals.recv().await.unwrap() {
        RegistrySignal::Backpressure { stream_id } => assert_eq!(stream_id, sid),
        other => panic!("expected backpressure, got {other:?}"),
    }

    // Acknowledge and push one more chunk: below threshold, no new signal.
    registry.acknowledge_chunk(sid.clone(), 4).await;
    registry.handle_chunk(token_chunk(&sid, "t5", false)).await;
    registry.handle_event(completed(&sid)).await;
    let _ = handle.next_chunk().await;
    assert!(
        signals.try_recv().is_err(),
        "no further signal once acknowledged"
    );
}

#[tokio::test(start_paused = true)]
async fn persistent_pressure_flags_a_slow_consumer() {
    let registry = StreamRegistry::start(config());
    let mut signals = registry.signals();
    let sid = StreamId::new("s-stuck");
    let _handle = registry
        .register(sid.clone(), RegisterOptions::default())
        .await
        .unwrap();

    for i in 0..4 {
        registry
            .handle_chunk(token_chunk(&sid, &format!("t{i}"), false))
            .await;
    }
    assert!(matches!(
        signals.recv().await.unwrap(),
        RegistrySignal::Backpressure { .. }
    ));

    // Never acknowledged: the sweep escalates after slow_consumer_after.
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(matches!(
        signals.recv().await.unwrap(),
        RegistrySignal::SlowConsumer { .. }
    ));
}

#[tokio::test]
async fn limit_adjustment_is_clamped_to_the_hard_max() {
    let registry = StreamRegistry::start(config());
    registry.set_limit(1000).await;
    assert_eq!(registry.metrics().await.unwrap().current_limit, 16);
    registry.set_limit(0).await;
    assert_eq!(registry.metrics().await.unwrap().current_limit, 1);
}

#[tokio::test]
async fn error_event_fails_the_stream_with_its_code() {
    let registry = StreamRegistry::start(config());
    let sid = StreamId::new("s-err");
    let handle = registry
        .register(sid.clone(), RegisterOptions::default())
        .await
        .unwrap();

    registry
        .handle_event(EventParams {
            stream_id: sid,
            event: StreamEvent::Error {
                code: Some(-32005),
                message: "model not loaded".into(),
            },
            is_final: true,
        })
        .await;

    match handle.finished().await {
        Err(SchedError::Generation { code, .. }) => {
            assert_eq!(code, weft_types::ErrorCode::ModelNotLoaded);
        }
        other => panic!("expected generation failure, got {other:?}"),
    }
}
