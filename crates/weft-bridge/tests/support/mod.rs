//! In-memory runtime double for bridge tests.
//!
//! Wires a [`Transport`] to a scripted responder over duplex pipes and
//! records every request it sees.
#![allow(dead_code)] // each test binary uses a different subset

use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use weft_bridge::config::BridgeConfig;
use weft_bridge::transport::Transport;
use weft_proto::rpc::{RpcErrorObject, RpcRequest, RpcResponse};

pub struct Harness {
    pub transport: Transport,
    pub requests: Arc<Mutex<Vec<RpcRequest>>>,
}

/// Build a transport whose peer answers via `responder`. Returning `None`
/// leaves the request unanswered (for timeout tests).
pub fn harness<F>(config: BridgeConfig, mut responder: F) -> Harness
where
    F: FnMut(&RpcRequest) -> Option<RpcResponse> + Send + 'static,
{
    let (client_out, server_in) = tokio::io::duplex(256 * 1024);
    let (server_out, client_in) = tokio::io::duplex(256 * 1024);
    let transport = Transport::spawn(client_out, client_in, config);

    let requests = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&requests);
    tokio::spawn(async move {
        let mut lines = BufReader::new(server_in).lines();
        let mut sink = server_out;
        while let Ok(Some(line)) = lines.next_line().await {
            let Ok(value) = serde_json::from_str::<Value>(&line) else {
                continue;
            };
            if value.get("id").is_none() {
                continue; // notification from the client side; nothing to answer
            }
            let Ok(request) = serde_json::from_value::<RpcRequest>(value) else {
                continue;
            };
            seen.lock().unwrap().push(request.clone());
            if let Some(response) = responder(&request) {
                let mut frame = serde_json::to_vec(&response).unwrap();
                frame.push(b'\n');
                if sink.write_all(&frame).await.is_err() {
                    return;
                }
            }
        }
    });

    Harness {
        transport,
        requests,
    }
}

pub fn ok_response(id: u64, result: Value) -> RpcResponse {
    RpcResponse {
        jsonrpc: "2.0".to_owned(),
        id: Some(id),
        result: Some(result),
        error: None,
    }
}

pub fn err_response(id: u64, code: i64, message: &str) -> RpcResponse {
    RpcResponse {
        jsonrpc: "2.0".to_owned(),
        id: Some(id),
        result: None,
        error: Some(RpcErrorObject {
            code,
            message: message.to_owned(),
            data: None,
        }),
    }
}
