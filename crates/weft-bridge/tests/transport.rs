//! Transport integration tests: correlation, bounds, cancellation, and the
//! conservation of request outcomes.

mod support;

use std::time::Duration;

use serde_json::json;

use support::{harness, ok_response};
use weft_bridge::abort::abort_pair;
use weft_bridge::config::BridgeConfig;
use weft_bridge::error::BridgeError;
use weft_bridge::transport::RequestOptions;

#[tokio::test]
async fn correlates_responses_by_id() {
    let h = harness(BridgeConfig::default(), |req| {
        Some(ok_response(req.id, json!({ "echo": req.method })))
    });

    let a = h
        .transport
        .request("runtime_info", json!({}), RequestOptions::default());
    let b = h
        .transport
        .request("tokenize", json!({"text": "x"}), RequestOptions::default());
    let (a, b) = tokio::join!(a, b);

    assert_eq!(a.unwrap()["echo"], "runtime_info");
    assert_eq!(b.unwrap()["echo"], "tokenize");
}

#[tokio::test]
async fn timeout_rejects_and_frees_the_pending_slot() {
    let h = harness(BridgeConfig::default(), |_req| None);

    let out = h
        .transport
        .request(
            "tokenize",
            json!({}),
            RequestOptions::with_timeout(Duration::from_millis(30)),
        )
        .await;
    assert!(matches!(out, Err(BridgeError::Timeout { .. })));
}

#[tokio::test]
async fn abort_surfaces_as_cancellation_not_timeout() {
    let h = harness(BridgeConfig::default(), |_req| None);
    let (handle, token) = abort_pair();

    let pending = {
        let transport = h.transport.clone();
        tokio::spawn(async move {
            transport
                .request(
                    "tokenize",
                    json!({}),
                    RequestOptions {
                        timeout: Some(Duration::from_secs(5)),
                        abort: Some(token),
                    },
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    handle.abort();

    let out = pending.await.unwrap();
    assert!(matches!(out, Err(BridgeError::Aborted)));
}

#[tokio::test]
async fn pending_table_bound_rejects_overflow() {
    let config = BridgeConfig {
        max_pending: 1,
        ..BridgeConfig::default()
    };
    let h = harness(config, |_req| None);

    let transport = h.transport.clone();
    let parked = tokio::spawn(async move {
        transport
            .request(
                "tokenize",
                json!({}),
                RequestOptions::with_timeout(Duration::from_millis(300)),
            )
            .await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let overflow = h
        .transport
        .request("tokenize", json!({}), RequestOptions::default())
        .await;
    assert!(matches!(overflow, Err(BridgeError::Overloaded { max_pending: 1 })));
    let _ = parked.await.unwrap();
}

#[tokio::test]
async fn close_rejects_every_pending_request() {
    let h = harness(BridgeConfig::default(), |_req| None);

    let transport = h.transport.clone();
    let parked = tokio::spawn(async move {
        transport
            .request(
                "tokenize",
                json!({}),
                RequestOptions::with_timeout(Duration::from_secs(10)),
            )
            .await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    h.transport.close().await;
    let out = parked.await.unwrap();
    assert!(matches!(out, Err(BridgeError::Closed)));
    assert!(h.transport.is_closed());

    let after = h
        .transport
        .request("tokenize", json!({}), RequestOptions::default())
        .await;
    assert!(matches!(after, Err(BridgeError::Closed)));
}

// Every issued request ends in exactly one of resolved / rejected /
// aborted, so the counters balance at quiescence.
#[tokio::test]
async fn outcome_counters_balance_at_quiescence() {
    let h = harness(BridgeConfig::default(), |req| {
        match req.params.get("mode").and_then(|m| m.as_str()) {
            Some("ok") => Some(ok_response(req.id, json!({}))),
            Some("err") => Some(support::err_response(req.id, -32602, "bad params")),
            _ => None, // let it time out or get aborted
        }
    });

    let ok = h
        .transport
        .request("tokenize", json!({"mode": "ok"}), RequestOptions::default())
        .await;
    assert!(ok.is_ok());

    let rejected = h
        .transport
        .request("tokenize", json!({"mode": "err"}), RequestOptions::default())
        .await;
    assert!(rejected.is_err());

    let timed_out = h
        .transport
        .request(
            "tokenize",
            json!({"mode": "silent"}),
            RequestOptions::with_timeout(Duration::from_millis(20)),
        )
        .await;
    assert!(matches!(timed_out, Err(BridgeError::Timeout { .. })));

    let (handle, token) = abort_pair();
    let transport = h.transport.clone();
    let aborted = tokio::spawn(async move {
        transport
            .request(
                "tokenize",
                json!({"mode": "silent"}),
                RequestOptions {
                    timeout: Some(Duration::from_secs(5)),
                    abort: Some(token),
                },
            )
            .await
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    handle.abort();
    assert!(matches!(aborted.await.unwrap(), Err(BridgeError::Aborted)));

    let metrics = h.transport.metrics();
    assert_eq!(metrics.issued, 4);
    assert_eq!(metrics.resolved, 1);
    assert_eq!(metrics.rejected, 2); // RPC error + timeout
    assert_eq!(metrics.aborted, 1);
    assert_eq!(
        metrics.issued,
        metrics.resolved + metrics.rejected + metrics.aborted
    );
}

#[tokio::test]
async fn notifications_fan_out_to_subscribers() {
    // The responder side here never answers; we drive notifications by
    // writing frames straight through a second harness-free transport pair.
    let (client_out, _server_in) = tokio::io::duplex(16 * 1024);
    let (mut server_out, client_in) = tokio::io::duplex(16 * 1024);
    let transport =
        weft_bridge::transport::Transport::spawn(client_out, client_in, BridgeConfig::default());

    let chunks = transport.on_notification("stream.chunk");
    let stats = transport.on_notification("stream.stats");

    let frame = br#"{"jsonrpc":"2.0","method":"stream.chunk","params":{"stream_id":"s","token":"hi"}}"#;
    tokio::io::AsyncWriteExt::write_all(&mut server_out, frame).await.unwrap();
    tokio::io::AsyncWriteExt::write_all(&mut server_out, b"\n").await.unwrap();

    let received = chunks.recv().await.unwrap();
    assert_eq!(received["token"], "hi");
    assert!(stats.try_recv().is_none(), "other methods stay silent");
}
