//! Turns head announcements into an ordered, de-duplicated block stream.
//!
//! Every endpoint client reports its node's head to the same [`IngestionController`]. The
//! controller keeps a single cursor (the last delivered height) and only ever delivers the block
//! directly after it, so concurrent announcements from several nodes race for each height and
//! exactly one of them wins it. Blocks are fetched from the announcing node itself, one by one
//! when close to the head or for single-block nodes, and in bulk ranges when far behind.

use std::{
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, RwLock,
    },
    time::Duration,
};

use log::{debug, trace};
use serde_json::{json, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    config::IngestionOptions,
    dispatcher::Dispatcher,
    endpoint::{EndpointClient, EndpointObserver},
    events::{
        ApiSupport, BlockEvent, BlockProcessedEvent, BlockRateEvent, CallContext, ClientInfo,
        EventHandler, HeadAnnouncement, NodeStatus, OperationEvent, TransactionEvent,
    },
    registry::OperationRegistry,
    transport::Transport,
    utils::{lock, read, write},
};

mod block;
pub use block::BlockPayload;
use block::take_operations;

/// Below this many missing blocks, blocks are fetched one at a time.
const RANGE_THRESHOLD: u64 = 20;
const MAX_SINGLE_FETCHES: u64 = 16;
const MAX_RANGE_SIZE: u64 = 128;
/// Blocks left out at the tip of a range fetch.
const RANGE_TIP_MARGIN: u64 = 10;

const SOURCE_MAX_ERROR_RATE: f64 = 0.05;
const SOURCE_MAX_LATENCY_SECS: f64 = 0.5;

const BLOCK_RATE_WINDOW: Duration = Duration::from_secs(60);

/// Cursor value before any announcement was seen.
const UNSET: u64 = u64::MAX;

#[derive(Debug)]
struct RateWindow {
    started: Instant,
    blocks: u64,
}

/// Announced chain position a block is delivered under.
#[derive(Debug, Clone)]
struct Position {
    head_height: u64,
    irreversible_height: u64,
    client_info: ClientInfo,
}

#[derive(Debug)]
pub struct IngestionController<T, H> {
    options: IngestionOptions,
    cursor: AtomicU64,
    processing: AtomicUsize,
    handler: Arc<H>,
    registry: Arc<OperationRegistry>,
    dispatcher: Arc<Dispatcher<T, H>>,
    abort: CancellationToken,
    rate: Mutex<RateWindow>,
    block_source: RwLock<Option<String>>,
}

impl<T, H> IngestionController<T, H>
where
    T: Transport,
    H: EventHandler,
{
    pub fn new(
        options: IngestionOptions,
        handler: Arc<H>,
        registry: Arc<OperationRegistry>,
        dispatcher: Arc<Dispatcher<T, H>>,
        abort: CancellationToken,
    ) -> Self {
        let cursor = options
            .start_block
            .map_or(UNSET, |start_block| start_block.saturating_sub(1));
        Self {
            options,
            cursor: AtomicU64::new(cursor),
            processing: AtomicUsize::new(0),
            handler,
            registry,
            dispatcher,
            abort,
            rate: Mutex::new(RateWindow {
                started: Instant::now(),
                blocks: 0,
            }),
            block_source: RwLock::default(),
        }
    }

    /// Height of the last block handed to the consumer, `None` before the first announcement.
    pub fn cursor(&self) -> Option<u64> {
        match self.cursor.load(Ordering::SeqCst) {
            UNSET => None,
            height => Some(height),
        }
    }

    /// Node whose announcement most recently got a block delivered.
    pub fn block_source(&self) -> Option<String> {
        read(&self.block_source).clone()
    }

    pub fn processing_depth(&self) -> usize {
        self.processing.load(Ordering::SeqCst)
    }

    fn order_gate_open(&self) -> bool {
        !self.options.maintain_order || self.processing.load(Ordering::SeqCst) == 0
    }

    /// Advances the cursor onto `height` if it is exactly the next block, taking the ordering
    /// gate along with it when order has to be maintained.
    fn claim(&self, height: u64) -> bool {
        let Some(previous) = height.checked_sub(1) else {
            return false;
        };

        if self.options.maintain_order {
            if self
                .processing
                .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return false;
            }
            if self
                .cursor
                .compare_exchange(previous, height, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                self.processing.store(0, Ordering::SeqCst);
                return false;
            }
            return true;
        }

        if self
            .cursor
            .compare_exchange(previous, height, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.processing.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn release(&self) {
        self.processing.fetch_sub(1, Ordering::SeqCst);
    }

    /// Handles one head announcement of `source`.
    pub async fn ingest(&self, announcement: HeadAnnouncement, source: Arc<EndpointClient<T>>) {
        let head = if self.options.use_irreversible {
            announcement.irreversible_height
        } else {
            announcement.head_height
        };
        let _ = self.cursor.compare_exchange(
            UNSET,
            head.saturating_sub(1),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        let Some(cursor) = self.cursor() else {
            return;
        };

        if head <= cursor
            || !source.api_check("block_api", SOURCE_MAX_ERROR_RATE, SOURCE_MAX_LATENCY_SECS)
            || !self.order_gate_open()
        {
            return;
        }

        let position = Position {
            head_height: head,
            irreversible_height: announcement.irreversible_height,
            client_info: announcement.client_info,
        };
        if head - cursor < RANGE_THRESHOLD || source.is_single_block() {
            self.fetch_single(cursor, &position, &source).await;
        } else {
            self.fetch_range(cursor, &position, &source).await;
        }
    }

    async fn fetch_single(&self, cursor: u64, position: &Position, source: &EndpointClient<T>) {
        let start = cursor + 1;
        let count = (position.head_height - start + 1).min(MAX_SINGLE_FETCHES);

        for height in start..start + count {
            if self.abort.is_cancelled() {
                return;
            }
            // Someone else already delivered this one.
            if self.cursor().is_some_and(|cursor| height <= cursor) {
                continue;
            }

            let Some(block) = source.get_block(height).await else {
                continue;
            };
            let Some(payload) = BlockPayload::parse(block) else {
                debug!("Malformed block #{} from {}", height, source.uri());
                continue;
            };
            if !self.order_gate_open() || !self.claim(height) {
                continue;
            }

            self.deliver(height, payload, position, source.uri()).await;
            self.release();
        }
    }

    async fn fetch_range(&self, cursor: u64, position: &Position, source: &EndpointClient<T>) {
        let start = cursor + 1;
        let count = (position.head_height - cursor - RANGE_TIP_MARGIN).min(MAX_RANGE_SIZE);

        let Some(blocks) = source.get_block_range(start, count).await else {
            return;
        };
        if blocks.len() as u64 != count {
            debug!(
                "Rejecting range #{}+{} from {}: got {} block(s)",
                start,
                count,
                source.uri(),
                blocks.len()
            );
            return;
        }
        let Some(payloads) = blocks
            .into_iter()
            .map(BlockPayload::parse)
            .collect::<Option<Vec<_>>>()
        else {
            debug!(
                "Rejecting range #{}+{} from {}: malformed block",
                start,
                count,
                source.uri()
            );
            return;
        };

        for (height, payload) in (start..).zip(payloads) {
            if self.abort.is_cancelled() {
                return;
            }
            if !self.claim(height) {
                continue;
            }

            self.deliver(height, payload, position, source.uri()).await;
            self.release();
        }
    }

    async fn deliver(&self, height: u64, payload: BlockPayload, position: &Position, source: &str) {
        trace!("Delivering block #{} from {}", height, source);
        *write(&self.block_source) = Some(source.to_string());

        let context = CallContext {
            block_source: Some(source.to_string()),
            blocks_behind: position.head_height.saturating_sub(height),
        };
        let BlockPayload {
            header,
            transactions,
            transaction_ids,
            timestamp,
        } = payload;

        self.handler
            .on_block(&BlockEvent {
                height,
                block: header,
                transactions: transactions.clone(),
                transaction_ids: transaction_ids.clone(),
                client_info: position.client_info.clone(),
                timestamp,
                head_height: position.head_height,
                irreversible_height: position.irreversible_height,
                context: context.clone(),
            })
            .await;

        for (index, mut transaction) in transactions.into_iter().enumerate() {
            let operations = take_operations(&mut transaction);
            let transaction_id = transaction_ids.get(index).cloned().unwrap_or_default();

            self.handler
                .on_transaction(&TransactionEvent {
                    transaction_id: transaction_id.clone(),
                    transaction,
                    height,
                    timestamp,
                    head_height: position.head_height,
                    irreversible_height: position.irreversible_height,
                    context: context.clone(),
                })
                .await;
            if self.abort.is_cancelled() {
                return;
            }

            for operation in operations {
                let event = OperationEvent {
                    op_type: operation_type(&operation),
                    body: operation.get("value").cloned().unwrap_or(Value::Null),
                    operation,
                    transaction_id: transaction_id.clone(),
                    is_virtual: false,
                    height,
                    timestamp,
                    head_height: position.head_height,
                    irreversible_height: position.irreversible_height,
                    context: context.clone(),
                };
                if !self.handle_operation(event).await {
                    return;
                }
            }
        }

        if self.options.use_virtual {
            let Some(result) = self
                .dispatcher
                .call(
                    "account_history_api",
                    "get_ops_in_block",
                    json!({
                        "block_num": height,
                        "only_virtual": true,
                        "include_reversible": !self.options.use_irreversible,
                    }),
                    &context,
                )
                .await
            else {
                return;
            };
            if self.abort.is_cancelled() {
                return;
            }

            let virtual_ops = match result {
                Value::Object(mut result) => match result.remove("ops") {
                    Some(Value::Array(ops)) => ops,
                    _ => Vec::new(),
                },
                _ => Vec::new(),
            };
            for mut virtual_op in virtual_ops {
                let operation = virtual_op.get_mut("op").map(Value::take).unwrap_or_default();
                let event = OperationEvent {
                    op_type: operation_type(&operation),
                    body: operation.get("value").cloned().unwrap_or(Value::Null),
                    operation,
                    transaction_id: virtual_op
                        .get("trx_id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    is_virtual: true,
                    height: virtual_op
                        .get("block")
                        .and_then(Value::as_u64)
                        .unwrap_or(height),
                    timestamp,
                    head_height: position.head_height,
                    irreversible_height: position.irreversible_height,
                    context: context.clone(),
                };
                if !self.handle_operation(event).await {
                    return;
                }
            }
        }

        self.handler
            .on_block_processed(&BlockProcessedEvent {
                height,
                client_info: position.client_info.clone(),
                timestamp,
                head_height: position.head_height,
                irreversible_height: position.irreversible_height,
            })
            .await;
        self.block_processed(position).await;
    }

    /// Feeds one operation to `on_operation` and its type handler. Returns `false` once aborted.
    async fn handle_operation(&self, event: OperationEvent) -> bool {
        self.handler.on_operation(&event).await;
        if self.abort.is_cancelled() {
            return false;
        }

        let typed = event.operation.get("type").is_some() && event.operation.get("value").is_some();
        if typed && self.registry.contains(&event.op_type) {
            self.registry.dispatch(event).await;
            if self.abort.is_cancelled() {
                return false;
            }
        }
        true
    }

    async fn block_processed(&self, position: &Position) {
        let rate = {
            let mut window = lock(&self.rate);
            window.blocks += 1;
            let age = window.started.elapsed();
            if age < BLOCK_RATE_WINDOW {
                return;
            }
            let rate = (window.blocks as f64 * 100.0 / age.as_secs_f64()).floor() / 100.0;
            window.blocks = 0;
            window.started = Instant::now();
            rate
        };

        let cursor = self.cursor().unwrap_or_default();
        let event = BlockRateEvent {
            rate,
            behind_head: position.head_height.saturating_sub(cursor),
            behind_irreversible: position.irreversible_height.saturating_sub(cursor),
        };
        debug!(
            "Processing {} block(s)/s, {} behind head",
            event.rate, event.behind_head
        );
        self.handler.on_block_rate(&event).await;
    }
}

fn operation_type(operation: &Value) -> String {
    operation
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

impl<T, H> EndpointObserver<T> for IngestionController<T, H>
where
    T: Transport,
    H: EventHandler,
{
    async fn potential_block(
        &self,
        announcement: HeadAnnouncement,
        source: Arc<EndpointClient<T>>,
    ) {
        self.ingest(announcement, source).await
    }

    async fn api_support_changed(&self, node_uri: &str, support: &ApiSupport) {
        self.handler.on_api_support_changed(node_uri, support).await
    }

    async fn node_status(&self, status: &NodeStatus) {
        self.handler.on_node_status(status).await
    }
}

#[cfg(test)]
mod tests;
