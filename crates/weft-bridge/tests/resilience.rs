//! Circuit-breaker behaviour over a live transport (spec scenario: open on
//! consecutive failures, fail fast, recover through probes).

mod support;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde_json::json;

use support::{err_response, harness, ok_response};
use weft_bridge::config::{BridgeConfig, RetryConfig};
use weft_bridge::error::BridgeError;
use weft_bridge::resilience::circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use weft_bridge::resilience::client::ResilientClient;
use weft_bridge::transport::RequestOptions;

fn no_retry() -> RetryConfig {
    RetryConfig {
        max_retries: 0,
        ..RetryConfig::default()
    }
}

fn breaker() -> Arc<CircuitBreaker> {
    Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
        failure_threshold: 3,
        failure_window: Duration::from_secs(10),
        recovery_timeout: Duration::from_millis(80),
        half_open_max_calls: 2,
        half_open_success_threshold: 2,
    }))
}

#[tokio::test]
async fn circuit_opens_fails_fast_then_recovers() {
    // Fail the first three calls, succeed afterwards.
    let calls = Arc::new(AtomicU32::new(0));
    let calls_in_responder = Arc::clone(&calls);
    let h = harness(BridgeConfig::default(), move |req| {
        let n = calls_in_responder.fetch_add(1, Ordering::SeqCst);
        if n < 3 {
            Some(err_response(req.id, -32603, "runtime hiccup"))
        } else {
            Some(ok_response(req.id, json!({"tokens": [1]})))
        }
    });

    let circuit = breaker();
    let client = ResilientClient::new(h.transport.clone(), Arc::clone(&circuit), no_retry());

    for _ in 0..3 {
        let out = client
            .request("tokenize", json!({"text": "x"}), RequestOptions::default())
            .await;
        assert!(out.is_err());
    }
    assert_eq!(circuit.snapshot().state, CircuitState::Open);

    // Fail-fast with a positive retry-after, without touching the wire.
    let wire_calls_before = calls.load(Ordering::SeqCst);
    let denied = client
        .request("tokenize", json!({"text": "x"}), RequestOptions::default())
        .await;
    match denied {
        Err(BridgeError::CircuitOpen { retry_after }) => {
            assert!(retry_after > Duration::ZERO);
        }
        other => panic!("expected CircuitOpen, got {other:?}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), wire_calls_before);

    // After the recovery timeout, two successful probes close the circuit.
    tokio::time::sleep(Duration::from_millis(100)).await;
    for _ in 0..2 {
        client
            .request("tokenize", json!({"text": "x"}), RequestOptions::default())
            .await
            .expect("probe should succeed");
    }
    let snap = circuit.snapshot();
    assert_eq!(snap.state, CircuitState::Closed);
    assert_eq!(snap.failure_count, 0);
    assert_eq!(snap.open_remaining, None);
}

#[tokio::test]
async fn idempotent_methods_retry_transient_failures() {
    let calls = Arc::new(AtomicU32::new(0));
    let calls_in_responder = Arc::clone(&calls);
    let h = harness(BridgeConfig::default(), move |req| {
        let n = calls_in_responder.fetch_add(1, Ordering::SeqCst);
        if n == 0 {
            Some(err_response(req.id, -32603, "transient"))
        } else {
            Some(ok_response(req.id, json!({"tokens": [7]})))
        }
    });

    let client = ResilientClient::new(
        h.transport.clone(),
        Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default())),
        RetryConfig {
            max_retries: 2,
            initial_delay: Duration::from_millis(5),
            multiplier: 2.0,
            max_delay: Duration::from_millis(20),
        },
    );

    let out = client
        .request("tokenize", json!({"text": "x"}), RequestOptions::default())
        .await;
    assert!(out.is_ok());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn generate_is_never_retried() {
    let calls = Arc::new(AtomicU32::new(0));
    let calls_in_responder = Arc::clone(&calls);
    let h = harness(BridgeConfig::default(), move |req| {
        calls_in_responder.fetch_add(1, Ordering::SeqCst);
        Some(err_response(req.id, -32603, "mid-generation crash"))
    });

    let client = ResilientClient::new(
        h.transport.clone(),
        Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default())),
        RetryConfig {
            max_retries: 5,
            ..RetryConfig::default()
        },
    );

    let out = client
        .request("generate", json!({"model_id": "m"}), RequestOptions::default())
        .await;
    // Exactly one wire call, surfaced enriched with method + attempts.
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    match out {
        Err(BridgeError::Exhausted {
            method, attempts, ..
        }) => {
            assert_eq!(method, "generate");
            assert_eq!(attempts, 1);
        }
        other => panic!("expected Exhausted, got {other:?}"),
    }
}

#[tokio::test]
async fn deterministic_rpc_errors_do_not_burn_retries() {
    let calls = Arc::new(AtomicU32::new(0));
    let calls_in_responder = Arc::clone(&calls);
    let h = harness(BridgeConfig::default(), move |req| {
        calls_in_responder.fetch_add(1, Ordering::SeqCst);
        Some(err_response(req.id, -32602, "invalid params"))
    });

    let client = ResilientClient::new(
        h.transport.clone(),
        Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default())),
        RetryConfig {
            max_retries: 4,
            ..RetryConfig::default()
        },
    );

    let out = client
        .request("tokenize", json!({}), RequestOptions::default())
        .await;
    assert!(out.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1, "INVALID_PARAMS is final");
}
