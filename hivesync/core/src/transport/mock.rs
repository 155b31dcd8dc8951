//! Scripted nodes for tests and local experiments.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use chrono::DateTime;
use serde_json::{json, Value};

use crate::{
    errors::TransportError,
    transport::{Transport, TransportResponse},
    utils::lock,
};

/// Unix time of the first mock block.
const MOCK_GENESIS_TIME: i64 = 1_704_067_200;
const MOCK_BLOCK_INTERVAL_SECS: i64 = 3;

/// What a scripted node does with one request.
#[derive(Debug, Clone, PartialEq)]
pub enum MockReply {
    Result(Value),
    RpcError(Value),
    /// Non-200 answer with a plain text body.
    Status(u16),
    /// HTTP 429 with an optional `Retry-After` in seconds.
    Throttled { retry_after: Option<u64> },
    /// The connection drops before any answer.
    Disconnect,
    /// 200 with a body that is not JSON at all.
    Garbage,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MockCall {
    pub method: String,
    pub params: Value,
}

type Responder = dyn Fn(&str, &Value) -> MockReply + Send + Sync;

/// A [`Transport`] answering from a closure instead of the network.
#[derive(Clone)]
pub struct MockTransport {
    responder: Arc<Responder>,
    delay: Duration,
    calls: Arc<Mutex<Vec<MockCall>>>,
}

impl fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockTransport")
            .field("delay", &self.delay)
            .field("calls", &lock(&self.calls).len())
            .finish_non_exhaustive()
    }
}

impl MockTransport {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&str, &Value) -> MockReply + Send + Sync + 'static,
    {
        Self {
            responder: Arc::new(responder),
            delay: Duration::ZERO,
            calls: Arc::default(),
        }
    }

    /// A node that never answers.
    pub fn unreachable() -> Self {
        Self::new(|_, _| MockReply::Disconnect)
    }

    /// Delays every answer, which is what the endpoint client measures as latency.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> Vec<MockCall> {
        lock(&self.calls).clone()
    }

    pub fn methods(&self) -> Vec<String> {
        lock(&self.calls)
            .iter()
            .map(|call| call.method.clone())
            .collect()
    }

    pub fn count(&self, method: &str) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|call| call.method == method)
            .count()
    }
}

impl Transport for MockTransport {
    async fn post(&self, body: String) -> Result<TransportResponse, TransportError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let request = serde_json::from_str::<Value>(&body).unwrap_or(Value::Null);
        let method = request["method"].as_str().unwrap_or_default().to_string();
        let params = request["params"].clone();
        let id = request["id"].clone();
        lock(&self.calls).push(MockCall {
            method: method.clone(),
            params: params.clone(),
        });

        match (self.responder)(&method, &params) {
            MockReply::Result(result) => Ok(TransportResponse::ok(
                json!({"jsonrpc": "2.0", "result": result, "id": id}).to_string(),
            )),
            MockReply::RpcError(error) => Ok(TransportResponse::ok(
                json!({"jsonrpc": "2.0", "error": error, "id": id}).to_string(),
            )),
            MockReply::Status(status) => Ok(TransportResponse {
                status,
                ratelimit: None,
                retry_after: None,
                body: format!("mock status {status}"),
            }),
            MockReply::Throttled { retry_after } => Ok(TransportResponse {
                status: 429,
                ratelimit: None,
                retry_after: retry_after.map(|seconds| seconds.to_string()),
                body: "too many requests".to_string(),
            }),
            MockReply::Disconnect => Err(TransportError::Http("connection reset".to_string())),
            MockReply::Garbage => Ok(TransportResponse::ok("<html>bad gateway</html>")),
        }
    }
}

/// A healthy node serving a synthetic chain whose head can be moved by the test.
#[derive(Debug, Clone)]
pub struct MockChain {
    head: Arc<AtomicU64>,
    irreversible_lag: u64,
    range_shortfall: Arc<AtomicUsize>,
    advertised: Vec<String>,
}

impl MockChain {
    pub fn new(head: u64) -> Self {
        Self {
            head: Arc::new(AtomicU64::new(head)),
            irreversible_lag: 20,
            range_shortfall: Arc::default(),
            advertised: [
                "account_history_api.get_ops_in_block",
                "block_api.get_block",
                "block_api.get_block_range",
                "condenser_api.get_dynamic_global_properties",
                "database_api.get_dynamic_global_properties",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
        }
    }

    /// Replaces the advertised `jsonrpc.get_methods` list.
    pub fn advertise<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.advertised = methods.into_iter().map(Into::into).collect();
        self
    }

    pub fn head(&self) -> u64 {
        self.head.load(Ordering::SeqCst)
    }

    pub fn set_head(&self, head: u64) {
        self.head.store(head, Ordering::SeqCst);
    }

    /// Makes every range answer come back `missing` blocks short.
    pub fn set_range_shortfall(&self, missing: usize) {
        self.range_shortfall.store(missing, Ordering::SeqCst);
    }

    pub fn transport(&self) -> MockTransport {
        let chain = self.clone();
        MockTransport::new(move |method, params| chain.reply(method, params))
    }

    pub fn block_id(height: u64) -> String {
        format!("{height:08x}{}", "0".repeat(32))
    }

    pub fn timestamp(height: u64) -> String {
        let seconds = MOCK_GENESIS_TIME + MOCK_BLOCK_INTERVAL_SECS * height as i64;
        DateTime::from_timestamp(seconds, 0)
            .map(|time| time.naive_utc().format("%Y-%m-%dT%H:%M:%S").to_string())
            .unwrap_or_default()
    }

    pub fn block(height: u64) -> Value {
        json!({
            "previous": Self::block_id(height.saturating_sub(1)),
            "timestamp": Self::timestamp(height),
            "witness": "mock-witness",
            "block_id": Self::block_id(height),
            "transactions": [{
                "ref_block_num": height & 0xffff,
                "operations": [{
                    "type": "transfer_operation",
                    "value": {
                        "from": "alice",
                        "to": "bob",
                        "amount": {"amount": "1000", "precision": 3, "nai": "@@000000021"},
                        "memo": format!("block {height}"),
                    }
                }]
            }],
            "transaction_ids": [format!("{height:040x}")],
        })
    }

    pub fn reply(&self, method: &str, params: &Value) -> MockReply {
        let head = self.head();
        match method {
            "jsonrpc.get_methods" => MockReply::Result(json!(self.advertised)),
            "condenser_api.get_dynamic_global_properties"
            | "database_api.get_dynamic_global_properties" => MockReply::Result(json!({
                "head_block_number": head,
                "head_block_id": Self::block_id(head),
                "last_irreversible_block_num": head.saturating_sub(self.irreversible_lag),
                "time": Self::timestamp(head),
            })),
            "block_api.get_block" => match params["block_num"].as_u64() {
                Some(height) if height <= head => {
                    MockReply::Result(json!({"block": Self::block(height)}))
                }
                _ => MockReply::Result(json!({})),
            },
            "block_api.get_block_range" => {
                let start = params["starting_block_num"].as_u64().unwrap_or(0);
                let count = params["count"].as_u64().unwrap_or(0);
                let mut blocks = (start..start.saturating_add(count))
                    .filter(|height| *height <= head)
                    .map(Self::block)
                    .collect::<Vec<_>>();
                let shortfall = self.range_shortfall.load(Ordering::SeqCst);
                blocks.truncate(blocks.len().saturating_sub(shortfall));
                MockReply::Result(json!({"blocks": blocks}))
            }
            "account_history_api.get_ops_in_block" => {
                let height = params["block_num"].as_u64().unwrap_or(0);
                MockReply::Result(json!({"ops": [{
                    "trx_id": "0000000000000000000000000000000000000000",
                    "block": height,
                    "op": {
                        "type": "producer_reward_operation",
                        "value": {"producer": "mock-witness"},
                    },
                }]}))
            }
            _ => MockReply::RpcError(json!({
                "code": -32601,
                "message": format!("Could not find method {method}"),
            })),
        }
    }
}
