use std::{collections::BTreeMap, future::Future, time::Duration};

use chrono::NaiveDateTime;
use serde::Serialize;
use serde_json::Value;

use crate::{endpoint::MethodErrorStats, errors::RequestError, rate_limit::RateLimitStatus};

/// Snapshot of the node that announced the head a block was fetched for.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientInfo {
    pub uri: String,
    pub latency_ms: f64,
    pub error_pct: f64,
}

/// Routing hints for business calls made while handling a block.
///
/// `block_source` is the node whose announcement drove delivery of the block being handled and
/// `blocks_behind` is how far that block trails the announced head.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallContext {
    pub block_source: Option<String>,
    pub blocks_behind: u64,
}

/// "Blocks up to `head_height` may be available" as reported by one node's heartbeat.
#[derive(Debug, Clone, PartialEq)]
pub struct HeadAnnouncement {
    pub head_height: u64,
    pub irreversible_height: u64,
    pub client_info: ClientInfo,
    pub head_block_id: String,
    pub timestamp: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockEvent {
    pub height: u64,
    /// The block without its `transactions` and `transaction_ids`.
    pub block: Value,
    pub transactions: Vec<Value>,
    pub transaction_ids: Vec<String>,
    pub client_info: ClientInfo,
    pub timestamp: NaiveDateTime,
    pub head_height: u64,
    pub irreversible_height: u64,
    pub context: CallContext,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransactionEvent {
    pub transaction_id: String,
    /// The transaction without its `operations`.
    pub transaction: Value,
    pub height: u64,
    pub timestamp: NaiveDateTime,
    pub head_height: u64,
    pub irreversible_height: u64,
    pub context: CallContext,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OperationEvent {
    pub op_type: String,
    /// The operation's `value`.
    pub body: Value,
    pub operation: Value,
    pub transaction_id: String,
    pub is_virtual: bool,
    pub height: u64,
    pub timestamp: NaiveDateTime,
    pub head_height: u64,
    pub irreversible_height: u64,
    pub context: CallContext,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockProcessedEvent {
    pub height: u64,
    pub client_info: ClientInfo,
    pub timestamp: NaiveDateTime,
    pub head_height: u64,
    pub irreversible_height: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockRateEvent {
    /// Blocks per second over the reporting window.
    pub rate: f64,
    pub behind_head: u64,
    pub behind_irreversible: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApiAvailability {
    /// Listed by `jsonrpc.get_methods`.
    pub published: bool,
    /// Listed, found by probing, or implied.
    pub available: bool,
}

pub type ApiSupport = BTreeMap<String, ApiAvailability>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeStatus {
    pub node_uri: String,
    pub error_percentage: f64,
    pub latency_ms: f64,
    /// Successful requests per minute over the reporting interval.
    pub ok_rate: f64,
    /// Failed requests per minute over the reporting interval.
    pub error_rate: f64,
    /// Single block fetches per minute over the reporting interval.
    pub block_rate: f64,
    /// Range fetches per minute over the reporting interval.
    pub range_rate: f64,
    /// Requests per JSON-RPC method over the reporting interval, retries counted once.
    pub calls: BTreeMap<String, u64>,
    pub rate_limit_status: RateLimitStatus,
    pub detailed_error_status: BTreeMap<String, MethodErrorStats>,
}

/// A full sweep over the fleet failed to serve one call.
#[derive(Debug, Clone)]
pub struct StallEvent {
    pub block_source_node: Option<String>,
    pub tried_nodes: Vec<String>,
    pub api: String,
    pub method: String,
    pub blocks_behind: u64,
    pub stall_count: u32,
    pub stall_time: Duration,
    pub errors: Vec<RequestError>,
    pub no_responses: Vec<RequestError>,
}

/// Callbacks the streaming client feeds. Every method defaults to doing nothing.
///
/// Callbacks are best effort: they are awaited in place, never retried, and anything they need to
/// report has to be handled inside the callback itself.
pub trait EventHandler: Send + Sync + 'static {
    fn on_block(&self, _event: &BlockEvent) -> impl Future<Output = ()> + Send {
        async {}
    }

    fn on_transaction(&self, _event: &TransactionEvent) -> impl Future<Output = ()> + Send {
        async {}
    }

    fn on_operation(&self, _event: &OperationEvent) -> impl Future<Output = ()> + Send {
        async {}
    }

    fn on_block_processed(&self, _event: &BlockProcessedEvent) -> impl Future<Output = ()> + Send {
        async {}
    }

    fn on_block_rate(&self, _event: &BlockRateEvent) -> impl Future<Output = ()> + Send {
        async {}
    }

    fn on_api_support_changed(
        &self,
        _node_uri: &str,
        _support: &ApiSupport,
    ) -> impl Future<Output = ()> + Send {
        async {}
    }

    fn on_node_status(&self, _status: &NodeStatus) -> impl Future<Output = ()> + Send {
        async {}
    }

    fn on_stall(&self, _event: &StallEvent) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// Handler for consumers that only care about business calls or registry dispatch.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl EventHandler for NoopHandler {}
