use std::sync::atomic::{AtomicU64, Ordering};

use alloy::primitives::{Address, B256};
use alloy::rpc::types::Log;
use serde::Deserialize;
use tracing::warn;

static PARSE_FAILURES: AtomicU64 = AtomicU64::new(0);

/// JSON-RPC error object.
#[derive(Debug, Deserialize, Clone)]
pub struct RpcErrorBody {
    pub code: i64,
    pub message: String,
}

/// `params` of an `eth_subscription` notification.
#[derive(Debug, Deserialize)]
struct NotificationParams {
    subscription: String,
    result: serde_json::Value,
}

/// Raw shape covering responses and notifications on the node's WS endpoint.
/// Fields are optional because the two kinds carry different subsets.
#[derive(Debug, Deserialize)]
struct RawRpcMsg {
    id: Option<serde_json::Value>,
    result: Option<serde_json::Value>,
    error: Option<RpcErrorBody>,
    method: Option<String>,
    params: Option<NotificationParams>,
}

/// Parsed event from a single WS message object.
#[derive(Debug)]
pub enum ParsedFrame {
    /// Response to our `eth_subscribe` request.
    Subscribed { subscription: String },
    /// One log delivered by an active subscription.
    Log { subscription: String, log: Box<Log> },
    /// A log retracted by a reorg.
    Removed { subscription: String, log: Box<Log> },
    /// JSON-RPC error response.
    Error(RpcErrorBody),
}

/// Parse a raw WebSocket text frame into zero or more events.
///
/// Nodes send either a single JSON object or, for batched requests, an array.
pub fn parse_rpc_frame(raw: &str) -> Vec<ParsedFrame> {
    let msgs: Vec<RawRpcMsg> = if raw.trim_start().starts_with('[') {
        serde_json::from_str(raw).unwrap_or_default()
    } else {
        match serde_json::from_str::<RawRpcMsg>(raw) {
            Ok(m) => vec![m],
            Err(_) => vec![],
        }
    };

    if msgs.is_empty() {
        record_parse_failure(raw);
        return vec![];
    }

    let mut frames = Vec::new();
    for msg in msgs {
        expand_raw_msg(msg, &mut frames);
    }
    frames
}

fn expand_raw_msg(msg: RawRpcMsg, out: &mut Vec<ParsedFrame>) {
    if let Some(err) = msg.error {
        out.push(ParsedFrame::Error(err));
        return;
    }

    match (msg.method.as_deref(), msg.params) {
        (Some("eth_subscription"), Some(params)) => {
            match serde_json::from_value::<Log>(params.result) {
                Ok(log) if log.removed => out.push(ParsedFrame::Removed {
                    subscription: params.subscription,
                    log: Box::new(log),
                }),
                Ok(log) => out.push(ParsedFrame::Log {
                    subscription: params.subscription,
                    log: Box::new(log),
                }),
                Err(e) => {
                    let count = PARSE_FAILURES.fetch_add(1, Ordering::Relaxed) + 1;
                    if count <= 10 || count % 1000 == 0 {
                        warn!(count, "[WS PARSE] undecodable log notification: {e}");
                    }
                }
            }
        }
        _ => {
            if let (Some(_), Some(serde_json::Value::String(subscription))) = (msg.id, msg.result) {
                out.push(ParsedFrame::Subscribed { subscription });
            }
        }
    }
}

fn record_parse_failure(raw: &str) {
    let count = PARSE_FAILURES.fetch_add(1, Ordering::Relaxed) + 1;
    if count <= 10 || count % 1000 == 0 {
        let end = raw.char_indices().nth(500).map(|(i, _)| i).unwrap_or(raw.len());
        warn!(count, "[WS PARSE] unrecognized frame: {}", &raw[..end]);
    }
}

/// Build an `eth_subscribe` request for logs from `address` whose first topic
/// is any of `events`.
pub fn build_logs_subscribe_msg(request_id: u64, address: Address, events: &[B256]) -> String {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": request_id,
        "method": "eth_subscribe",
        "params": ["logs", { "address": address, "topics": [events] }]
    })
    .to_string()
}

pub fn build_unsubscribe_msg(request_id: u64, subscription: &str) -> String {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": request_id,
        "method": "eth_unsubscribe",
        "params": [subscription]
    })
    .to_string()
}
