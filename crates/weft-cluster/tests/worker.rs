//! Worker-node behaviour over a real bus, registry, and batcher with a
//! scripted runtime client.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use weft_bridge::BridgeError;
use weft_bridge::abort::AbortToken;
use weft_bus::{InMemoryBus, MessageBus, publish_json};
use weft_cluster::error::ClusterError;
use weft_cluster::worker::{RegisterWhen, WorkerConfig, WorkerHandles, WorkerNode, WorkerState};
use weft_core::batcher::{BatcherConfig, GenerateBatcher, GenerateClient};
use weft_core::coalesce::{CoalesceConfig, CoalescingRegistry};
use weft_core::registry::{RegistryConfig, StreamRegistry};
use weft_proto::bus::{
    HeartbeatMessage, InferenceRequestMessage, RegisterMessage, ResponseMessage,
    WORKER_DEREGISTER, WORKER_HEARTBEAT, WORKER_REGISTER, inference_subject, response_subject,
};
use weft_proto::notify::{ChunkParams, EventParams, StreamEvent};
use weft_types::{ErrorCode, GenerateParams, Priority, RequestId, StreamId, WorkerId};

struct FakeRuntime {
    calls: Arc<Mutex<Vec<(String, Value)>>>,
    fail_load: bool,
}

#[async_trait]
impl GenerateClient for FakeRuntime {
    async fn call(
        &self,
        method: &str,
        params: Value,
        _timeout: Option<Duration>,
        _abort: Option<AbortToken>,
    ) -> Result<Value, BridgeError> {
        self.calls
            .lock()
            .unwrap()
            .push((method.to_owned(), params.clone()));
        match method {
            "load_model" if self.fail_load => Err(BridgeError::Rpc(
                weft_proto::rpc::RpcErrorObject {
                    code: -32001,
                    message: "weights missing".into(),
                    data: None,
                },
            )),
            "load_model" => Ok(json!({ "model_id": params["model_id"], "state": "loaded" })),
            "generate" => Ok(json!({ "stream_id": params["stream_id"], "started_at": 1 })),
            "batch_generate" => {
                let requests = params["requests"].as_array().cloned().unwrap_or_default();
                let results: Vec<Value> = requests
                    .iter()
                    .map(|r| json!({ "success": true, "result": { "stream_id": r["stream_id"], "started_at": 1 } }))
                    .collect();
                Ok(json!({ "results": results }))
            }
            _ => Ok(json!({})),
        }
    }
}

struct Fixture {
    bus: Arc<InMemoryBus>,
    registry: StreamRegistry,
    handles: WorkerHandles,
    calls: Arc<Mutex<Vec<(String, Value)>>>,
}

fn fixture(fail_load: bool) -> Fixture {
    let bus = Arc::new(InMemoryBus::new());
    let calls = Arc::new(Mutex::new(Vec::new()));
    let control: Arc<dyn GenerateClient> = Arc::new(FakeRuntime {
        calls: Arc::clone(&calls),
        fail_load,
    });
    let registry = StreamRegistry::start(RegistryConfig::default());
    let batcher = GenerateBatcher::start(
        Arc::clone(&control),
        Some(registry.clone()),
        BatcherConfig {
            hold: Duration::from_millis(1),
            ..BatcherConfig::default()
        },
    );
    let coalescer = CoalescingRegistry::new(CoalesceConfig::default());
    Fixture {
        bus,
        registry: registry.clone(),
        handles: WorkerHandles {
            control,
            batcher,
            registry,
            coalescer,
        },
        calls,
    }
}

fn worker_config(id: &str) -> WorkerConfig {
    WorkerConfig {
        worker_id: WorkerId::new(id),
        models: vec!["llama-7b".into()],
        heartbeat_interval: Duration::from_millis(30),
        queue_capacity: 8,
        max_concurrent: 4,
        default_timeout: Duration::from_secs(5),
        drain_grace: Duration::from_millis(200),
        ..WorkerConfig::default()
    }
}

fn inference_message(rid: &str, sid: &str, streaming: bool) -> InferenceRequestMessage {
    let mut params = GenerateParams::new("llama-7b", "say hi", StreamId::new(sid));
    params.streaming = streaming;
    InferenceRequestMessage {
        request_id: RequestId::new(rid),
        params,
        priority: None,
        timeout_ms: Some(2_000),
    }
}

#[tokio::test]
async fn registers_and_heartbeats_on_the_bus() {
    let f = fixture(false);
    let registrations = f.bus.subscribe(WORKER_REGISTER).await.unwrap();
    let heartbeats = f.bus.subscribe(WORKER_HEARTBEAT).await.unwrap();

    let node = WorkerNode::start(f.bus.clone(), f.handles.clone(), worker_config("w-reg"))
        .await
        .unwrap();
    assert_eq!(node.state(), WorkerState::Ready);

    let register: RegisterMessage =
        serde_json::from_value(registrations.recv().await.unwrap().payload).unwrap();
    assert_eq!(register.worker_id, WorkerId::new("w-reg"));
    assert_eq!(register.skills.available_models, vec!["llama-7b".to_owned()]);

    let heartbeat: HeartbeatMessage =
        serde_json::from_value(heartbeats.recv().await.unwrap().payload).unwrap();
    assert_eq!(heartbeat.worker_id, WorkerId::new("w-reg"));
    assert_eq!(heartbeat.active_requests, 0);
}

#[tokio::test]
async fn serves_an_inference_request_end_to_end() {
    let f = fixture(false);
    let node = WorkerNode::start(f.bus.clone(), f.handles.clone(), worker_config("w-serve"))
        .await
        .unwrap();

    let responses = f
        .bus
        .subscribe(&response_subject(&RequestId::new("r-1")))
        .await
        .unwrap();
    publish_json(
        f.bus.as_ref(),
        &inference_subject(node.worker_id()),
        &inference_message("r-1", "s-1", true),
    )
    .await
    .unwrap();

    // Wait for the worker to register the stream, then emit the tokens the
    // runtime would produce.
    let sid = StreamId::new("s-1");
    for _ in 0..100 {
        if f.registry.metrics().await.unwrap().active_streams == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    for token in ["Hi", " there"] {
        f.registry
            .handle_chunk(ChunkParams {
                stream_id: sid.clone(),
                token: Some(token.to_owned()),
                tokens: None,
                is_final: false,
            })
            .await;
    }
    f.registry
        .handle_event(EventParams {
            stream_id: sid,
            event: StreamEvent::Completed,
            is_final: true,
        })
        .await;

    let mut received = Vec::new();
    loop {
        let msg: ResponseMessage =
            serde_json::from_value(responses.recv().await.unwrap().payload).unwrap();
        let terminal = msg.is_terminal();
        received.push(msg);
        if terminal {
            break;
        }
    }
    match received.as_slice() {
        [
            ResponseMessage::Token { text: t1 },
            ResponseMessage::Token { text: t2 },
            ResponseMessage::Done {
                tokens_generated, ..
            },
        ] => {
            assert_eq!(t1, "Hi");
            assert_eq!(t2, " there");
            assert_eq!(*tokens_generated, 2);
        }
        other => panic!("unexpected response sequence: {other:?}"),
    }

    // The generate call reached the runtime exactly once.
    let calls = f.calls.lock().unwrap();
    let generates = calls
        .iter()
        .filter(|(m, _)| m == "generate" || m == "batch_generate")
        .count();
    assert_eq!(generates, 1);
}

// Two identical concurrent requests coalesce onto one upstream
// generation; both clients still get the full token sequence.
#[tokio::test]
async fn identical_requests_share_one_generation() {
    let f = fixture(false);
    let node = WorkerNode::start(f.bus.clone(), f.handles.clone(), worker_config("w-coal"))
        .await
        .unwrap();

    let responses_a = f
        .bus
        .subscribe(&response_subject(&RequestId::new("r-a")))
        .await
        .unwrap();
    let responses_b = f
        .bus
        .subscribe(&response_subject(&RequestId::new("r-b")))
        .await
        .unwrap();

    publish_json(
        f.bus.as_ref(),
        &inference_subject(node.worker_id()),
        &inference_message("r-a", "s-prime", true),
    )
    .await
    .unwrap();
    for _ in 0..100 {
        if f.registry.metrics().await.unwrap().active_streams == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    // Same parameter bag, different request/stream identity.
    publish_json(
        f.bus.as_ref(),
        &inference_subject(node.worker_id()),
        &inference_message("r-b", "s-late", true),
    )
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    let sid = StreamId::new("s-prime");
    f.registry
        .handle_chunk(ChunkParams {
            stream_id: sid.clone(),
            token: Some("42".into()),
            tokens: None,
            is_final: false,
        })
        .await;
    f.registry
        .handle_event(EventParams {
            stream_id: sid,
            event: StreamEvent::Completed,
            is_final: true,
        })
        .await;

    for responses in [&responses_a, &responses_b] {
        let token: ResponseMessage =
            serde_json::from_value(responses.recv().await.unwrap().payload).unwrap();
        assert!(matches!(token, ResponseMessage::Token { text } if text == "42"));
        let done: ResponseMessage =
            serde_json::from_value(responses.recv().await.unwrap().payload).unwrap();
        assert!(matches!(done, ResponseMessage::Done { tokens_generated: 1, .. }));
    }

    // One stream, one generate call: the second request rode along.
    assert_eq!(f.registry.metrics().await.unwrap().total_streams, 1);
    let generates = f
        .calls
        .lock()
        .unwrap()
        .iter()
        .filter(|(m, _)| m == "generate" || m == "batch_generate")
        .count();
    assert_eq!(generates, 1);
}

#[tokio::test]
async fn zero_capacity_rejects_with_resource_limit() {
    let f = fixture(false);
    let node = WorkerNode::start(
        f.bus.clone(),
        f.handles.clone(),
        WorkerConfig {
            max_concurrent: 0,
            ..worker_config("w-full")
        },
    )
    .await
    .unwrap();

    let responses = f
        .bus
        .subscribe(&response_subject(&RequestId::new("r-2")))
        .await
        .unwrap();
    publish_json(
        f.bus.as_ref(),
        &inference_subject(node.worker_id()),
        &inference_message("r-2", "s-2", true),
    )
    .await
    .unwrap();

    let msg: ResponseMessage =
        serde_json::from_value(responses.recv().await.unwrap().payload).unwrap();
    match msg {
        ResponseMessage::Error { code, .. } => {
            assert_eq!(code, ErrorCode::ResourceLimitExceeded);
        }
        other => panic!("expected resource-limit error, got {other:?}"),
    }
}

#[tokio::test]
async fn full_queue_rejects_with_queue_full() {
    let f = fixture(false);
    let node = WorkerNode::start(
        f.bus.clone(),
        f.handles.clone(),
        WorkerConfig {
            queue_capacity: 0,
            ..worker_config("w-queue")
        },
    )
    .await
    .unwrap();

    let responses = f
        .bus
        .subscribe(&response_subject(&RequestId::new("r-3")))
        .await
        .unwrap();
    publish_json(
        f.bus.as_ref(),
        &inference_subject(node.worker_id()),
        &inference_message("r-3", "s-3", true),
    )
    .await
    .unwrap();

    let msg: ResponseMessage =
        serde_json::from_value(responses.recv().await.unwrap().payload).unwrap();
    match msg {
        ResponseMessage::Error { code, .. } => assert_eq!(code, ErrorCode::QueueFull),
        other => panic!("expected queue-full error, got {other:?}"),
    }
}

#[tokio::test]
async fn prewarm_failure_is_fatal_when_registering_ready() {
    let f = fixture(true);
    let out = WorkerNode::start(
        f.bus.clone(),
        f.handles.clone(),
        WorkerConfig {
            prewarm: vec!["llama-7b".into()],
            register_when: RegisterWhen::Ready,
            ..worker_config("w-warm")
        },
    )
    .await;
    assert!(matches!(out, Err(ClusterError::Bridge(_))));
}

#[tokio::test]
async fn prewarm_failure_is_advisory_when_registering_warming() {
    let f = fixture(true);
    let node = WorkerNode::start(
        f.bus.clone(),
        f.handles.clone(),
        WorkerConfig {
            prewarm: vec!["llama-7b".into()],
            register_when: RegisterWhen::Warming,
            ..worker_config("w-warm-bg")
        },
    )
    .await
    .expect("warming registration tolerates load failures");
    assert_eq!(node.state(), WorkerState::Ready);
}

#[tokio::test]
async fn stop_deregisters_and_reaches_stopped() {
    let f = fixture(false);
    let deregistrations = f.bus.subscribe(WORKER_DEREGISTER).await.unwrap();
    let node = WorkerNode::start(f.bus.clone(), f.handles.clone(), worker_config("w-stop"))
        .await
        .unwrap();

    node.stop().await;
    assert_eq!(node.state(), WorkerState::Stopped);
    let msg = deregistrations.recv().await.unwrap();
    assert_eq!(msg.payload["worker_id"], "w-stop");
}

#[tokio::test]
async fn explicit_priority_beats_derived_classes() {
    // Pure message-level check of the derivation rule.
    let mut explicit = inference_message("r", "s", true);
    explicit.priority = Some(Priority::Urgent);
    assert_eq!(explicit.effective_priority(), Priority::Urgent);

    let buffered = inference_message("r", "s", false);
    assert_eq!(buffered.effective_priority(), Priority::Default);

    let streaming = inference_message("r", "s", true);
    assert_eq!(streaming.effective_priority(), Priority::Background);
}
