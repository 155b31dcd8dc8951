use std::{future::Ready, time::Duration};

use chrono::NaiveDateTime;

use super::*;
use crate::{
    config::{ClientSettings, NodeConfig, ProbeTable},
    selector::DefaultNodeSelector,
    transport::mock::{MockChain, MockReply, MockTransport},
};

type Log = Arc<Mutex<Vec<String>>>;

#[derive(Default)]
struct Recorder {
    log: Log,
    blocks: Mutex<Vec<u64>>,
    rates: Mutex<Vec<BlockRateEvent>>,
    /// `on_block` takes a second for this height.
    slow_height: Option<u64>,
    abort_on_transaction: Option<CancellationToken>,
}

impl Recorder {
    fn blocks(&self) -> Vec<u64> {
        lock(&self.blocks).clone()
    }

    fn log(&self) -> Vec<String> {
        lock(&self.log).clone()
    }
}

impl EventHandler for Recorder {
    async fn on_block(&self, event: &BlockEvent) {
        lock(&self.blocks).push(event.height);
        lock(&self.log).push(format!("block {}", event.height));
        if self.slow_height == Some(event.height) {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    async fn on_transaction(&self, event: &TransactionEvent) {
        lock(&self.log).push(format!("tx {}", event.height));
        if let Some(abort) = &self.abort_on_transaction {
            abort.cancel();
        }
    }

    async fn on_operation(&self, event: &OperationEvent) {
        let kind = if event.is_virtual { "vop" } else { "op" };
        lock(&self.log).push(format!("{} {}", kind, event.op_type));
    }

    async fn on_block_processed(&self, event: &BlockProcessedEvent) {
        lock(&self.log).push(format!("processed {}", event.height));
    }

    async fn on_block_rate(&self, event: &BlockRateEvent) {
        lock(&self.rates).push(*event);
    }
}

type Controller = IngestionController<MockTransport, Recorder>;
type Client = Arc<EndpointClient<MockTransport>>;

struct Harness {
    controller: Arc<Controller>,
    handler: Arc<Recorder>,
}

fn log_operation(log: Log) -> impl Fn(OperationEvent) -> Ready<()> + Send + Sync + 'static {
    move |event| {
        lock(&log).push(format!("registry {}", event.op_type));
        std::future::ready(())
    }
}

fn node(name: &str, transport: MockTransport, single_block: bool) -> Client {
    Arc::new(EndpointClient::new(
        NodeConfig::new(name)
            .single_block(single_block)
            .policy(60.0, 10_000),
        ClientSettings::default(),
        Arc::new(ProbeTable::default()),
        transport,
        CancellationToken::new(),
    ))
}

async fn harness(
    options: IngestionOptions,
    handler: Recorder,
    nodes: &[Client],
    abort: CancellationToken,
) -> Harness {
    let handler = Arc::new(handler);
    let registry = OperationRegistry::new()
        .on("transfer_operation", log_operation(Arc::clone(&handler.log)))
        .on(
            "producer_reward_operation",
            log_operation(Arc::clone(&handler.log)),
        );
    let dispatcher = Arc::new(Dispatcher::new(
        nodes.to_vec(),
        Arc::new(DefaultNodeSelector),
        Arc::clone(&handler),
        abort.clone(),
    ));
    let controller = Arc::new(IngestionController::new(
        options,
        Arc::clone(&handler),
        Arc::new(registry),
        dispatcher,
        abort,
    ));
    for node in nodes {
        node.initialize_api(controller.as_ref()).await;
    }
    Harness {
        controller,
        handler,
    }
}

fn starting_at(start_block: u64) -> IngestionOptions {
    IngestionOptions {
        start_block: Some(start_block),
        ..Default::default()
    }
}

fn announcement(client: &Client, head: u64) -> HeadAnnouncement {
    HeadAnnouncement {
        head_height: head,
        irreversible_height: head.saturating_sub(20),
        client_info: client.client_info(),
        head_block_id: MockChain::block_id(head),
        timestamp: NaiveDateTime::default(),
    }
}

impl Harness {
    async fn announce(&self, client: &Client, head: u64) {
        self.controller
            .ingest(announcement(client, head), Arc::clone(client))
            .await;
    }
}

fn range_requests(transport: &MockTransport) -> Vec<(u64, u64)> {
    transport
        .calls()
        .into_iter()
        .filter(|call| call.method == "block_api.get_block_range")
        .map(|call| {
            (
                call.params["starting_block_num"].as_u64().unwrap(),
                call.params["count"].as_u64().unwrap(),
            )
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_first_announcement_starts_at_head() {
    let chain = MockChain::new(50);
    let client = node("a", chain.transport(), false);
    let harness = harness(
        IngestionOptions::default(),
        Recorder::default(),
        &[Arc::clone(&client)],
        CancellationToken::new(),
    )
    .await;
    assert_eq!(harness.controller.cursor(), None);

    harness.announce(&client, 50).await;

    assert_eq!(harness.handler.blocks(), vec![50]);
    assert_eq!(harness.controller.cursor(), Some(50));
    assert_eq!(harness.controller.block_source().as_deref(), Some("a"));
}

#[tokio::test(start_paused = true)]
async fn test_small_gap_uses_single_block_fetches() {
    let chain = MockChain::new(119);
    let transport = chain.transport();
    let client = node("a", transport.clone(), false);
    let harness = harness(
        starting_at(101),
        Recorder::default(),
        &[Arc::clone(&client)],
        CancellationToken::new(),
    )
    .await;

    harness.announce(&client, 119).await;

    assert_eq!(harness.handler.blocks(), (101..=116).collect::<Vec<_>>());
    assert_eq!(transport.count("block_api.get_block"), 16);
    assert!(range_requests(&transport).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_gap_of_twenty_uses_range_fetch() {
    let chain = MockChain::new(120);
    let transport = chain.transport();
    let client = node("a", transport.clone(), false);
    let harness = harness(
        starting_at(101),
        Recorder::default(),
        &[Arc::clone(&client)],
        CancellationToken::new(),
    )
    .await;

    harness.announce(&client, 120).await;

    assert_eq!(range_requests(&transport), vec![(101, 10)]);
    assert_eq!(harness.handler.blocks(), (101..=110).collect::<Vec<_>>());
    assert_eq!(transport.count("block_api.get_block"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_range_fetch_is_capped() {
    let chain = MockChain::new(400);
    let transport = chain.transport();
    let client = node("a", transport.clone(), false);
    let harness = harness(
        starting_at(101),
        Recorder::default(),
        &[Arc::clone(&client)],
        CancellationToken::new(),
    )
    .await;

    harness.announce(&client, 400).await;

    assert_eq!(range_requests(&transport), vec![(101, 128)]);
    assert_eq!(harness.controller.cursor(), Some(228));
}

#[tokio::test(start_paused = true)]
async fn test_single_block_node_never_fetches_ranges() {
    let chain = MockChain::new(150);
    let transport = chain.transport();
    let client = node("anyx", transport.clone(), true);
    let harness = harness(
        starting_at(101),
        Recorder::default(),
        &[Arc::clone(&client)],
        CancellationToken::new(),
    )
    .await;

    harness.announce(&client, 150).await;

    assert!(range_requests(&transport).is_empty());
    assert_eq!(harness.handler.blocks(), (101..=116).collect::<Vec<_>>());
}

#[tokio::test(start_paused = true)]
async fn test_short_range_delivers_nothing() {
    let chain = MockChain::new(130);
    chain.set_range_shortfall(1);
    let transport = chain.transport();
    let client = node("a", transport.clone(), false);
    let harness = harness(
        starting_at(101),
        Recorder::default(),
        &[Arc::clone(&client)],
        CancellationToken::new(),
    )
    .await;

    harness.announce(&client, 130).await;
    assert!(harness.handler.blocks().is_empty());
    assert_eq!(harness.controller.cursor(), Some(100));

    chain.set_range_shortfall(0);
    harness.announce(&client, 130).await;
    assert_eq!(range_requests(&transport), vec![(101, 20), (101, 20)]);
    assert_eq!(harness.handler.blocks(), (101..=120).collect::<Vec<_>>());
}

#[tokio::test(start_paused = true)]
async fn test_untrusted_source_does_not_drive_ingestion() {
    let chain = MockChain::new(105);
    let slow = node(
        "slow",
        chain.transport().with_delay(Duration::from_millis(600)),
        false,
    );
    let harness = harness(
        starting_at(101),
        Recorder::default(),
        &[Arc::clone(&slow)],
        CancellationToken::new(),
    )
    .await;

    harness.announce(&slow, 105).await;

    assert!(harness.handler.blocks().is_empty());
    assert_eq!(harness.controller.cursor(), Some(100));
}

#[tokio::test(start_paused = true)]
async fn test_stale_and_repeated_announcements_deliver_each_height_once() {
    let chain = MockChain::new(105);
    let client = node("a", chain.transport(), false);
    let harness = harness(
        starting_at(101),
        Recorder::default(),
        &[Arc::clone(&client)],
        CancellationToken::new(),
    )
    .await;

    harness.announce(&client, 105).await;
    harness.announce(&client, 103).await;
    harness.announce(&client, 105).await;
    chain.set_head(107);
    harness.announce(&client, 107).await;
    harness.announce(&client, 104).await;

    assert_eq!(harness.handler.blocks(), (101..=107).collect::<Vec<_>>());
}

#[tokio::test(start_paused = true)]
async fn test_malformed_block_is_not_delivered() {
    let chain = MockChain::new(101);
    let transport = MockTransport::new(move |method, params| match method {
        "block_api.get_block" => {
            MockReply::Result(json!({"block": {"timestamp": "2024-01-01T00:00:00"}}))
        }
        _ => chain.reply(method, params),
    });
    let client = node("a", transport, false);
    let harness = harness(
        starting_at(101),
        Recorder::default(),
        &[Arc::clone(&client)],
        CancellationToken::new(),
    )
    .await;

    harness.announce(&client, 101).await;

    assert!(harness.handler.blocks().is_empty());
    assert_eq!(harness.controller.cursor(), Some(100));
}

#[tokio::test(start_paused = true)]
async fn test_irreversible_mode_follows_last_irreversible_block() {
    let chain = MockChain::new(50);
    let client = node("a", chain.transport(), false);
    let harness = harness(
        IngestionOptions {
            use_irreversible: true,
            ..Default::default()
        },
        Recorder::default(),
        &[Arc::clone(&client)],
        CancellationToken::new(),
    )
    .await;

    harness.announce(&client, 50).await;
    chain.set_head(51);
    harness.announce(&client, 51).await;

    assert_eq!(harness.handler.blocks(), vec![30, 31]);
}

#[tokio::test(start_paused = true)]
async fn test_callbacks_run_in_delivery_order() {
    let chain = MockChain::new(101);
    let transport = chain.transport();
    let client = node("a", transport.clone(), false);
    let harness = harness(
        IngestionOptions {
            start_block: Some(101),
            use_virtual: true,
            ..Default::default()
        },
        Recorder::default(),
        &[Arc::clone(&client)],
        CancellationToken::new(),
    )
    .await;

    harness.announce(&client, 101).await;

    assert_eq!(
        harness.handler.log(),
        vec![
            "block 101",
            "tx 101",
            "op transfer_operation",
            "registry transfer_operation",
            "vop producer_reward_operation",
            "registry producer_reward_operation",
            "processed 101",
        ]
    );
    let virtual_call = transport
        .calls()
        .into_iter()
        .find(|call| call.method == "account_history_api.get_ops_in_block")
        .unwrap();
    assert_eq!(
        virtual_call.params,
        json!({"block_num": 101, "only_virtual": true, "include_reversible": true})
    );
}

#[tokio::test(start_paused = true)]
async fn test_abort_stops_block_processing() {
    let chain = MockChain::new(102);
    let client = node("a", chain.transport(), false);
    let abort = CancellationToken::new();
    let harness = harness(
        starting_at(101),
        Recorder {
            abort_on_transaction: Some(abort.clone()),
            ..Default::default()
        },
        &[Arc::clone(&client)],
        abort,
    )
    .await;

    harness.announce(&client, 102).await;

    assert_eq!(harness.handler.log(), vec!["block 101", "tx 101"]);
    assert_eq!(harness.controller.processing_depth(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_maintain_order_serializes_sources() {
    let chain = MockChain::new(102);
    let first = node("first", chain.transport(), false);
    let second = node("second", chain.transport(), false);
    let harness = harness(
        IngestionOptions {
            start_block: Some(101),
            maintain_order: true,
            ..Default::default()
        },
        Recorder {
            slow_height: Some(101),
            ..Default::default()
        },
        &[Arc::clone(&first), Arc::clone(&second)],
        CancellationToken::new(),
    )
    .await;

    tokio::join!(
        harness.announce(&first, 102),
        harness.announce(&second, 102)
    );

    assert_eq!(
        harness.handler.log(),
        vec![
            "block 101",
            "tx 101",
            "op transfer_operation",
            "registry transfer_operation",
            "processed 101",
            "block 102",
            "tx 102",
            "op transfer_operation",
            "registry transfer_operation",
            "processed 102",
        ]
    );
    assert_eq!(harness.controller.block_source().as_deref(), Some("first"));
}

#[tokio::test(start_paused = true)]
async fn test_without_order_a_later_block_may_overtake() {
    let chain = MockChain::new(102);
    let first = node("first", chain.transport(), false);
    let second = node("second", chain.transport(), false);
    let harness = harness(
        starting_at(101),
        Recorder {
            slow_height: Some(101),
            ..Default::default()
        },
        &[Arc::clone(&first), Arc::clone(&second)],
        CancellationToken::new(),
    )
    .await;

    tokio::join!(
        harness.announce(&first, 102),
        harness.announce(&second, 102)
    );

    let log = harness.handler.log();
    let position = |entry: &str| log.iter().position(|line| line == entry).unwrap();
    assert!(position("processed 102") < position("processed 101"));
    // Still never twice.
    assert_eq!(harness.handler.blocks(), vec![101, 102]);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_announcements_keep_heights_monotonic() {
    let chain = MockChain::new(112);
    let nodes = ["a", "b", "c"]
        .into_iter()
        .map(|name| node(name, chain.transport(), false))
        .collect::<Vec<_>>();
    let harness = harness(
        IngestionOptions {
            start_block: Some(101),
            maintain_order: true,
            ..Default::default()
        },
        Recorder::default(),
        &nodes,
        CancellationToken::new(),
    )
    .await;

    for head in [104, 112, 108, 112] {
        tokio::join!(
            harness.announce(&nodes[0], head),
            harness.announce(&nodes[1], head - 1),
            harness.announce(&nodes[2], head),
        );
    }

    assert_eq!(harness.handler.blocks(), (101..=112).collect::<Vec<_>>());
}

#[tokio::test(start_paused = true)]
async fn test_block_rate_reported_after_a_minute() {
    let chain = MockChain::new(101);
    let client = node("a", chain.transport(), false);
    let harness = harness(
        starting_at(101),
        Recorder::default(),
        &[Arc::clone(&client)],
        CancellationToken::new(),
    )
    .await;

    harness.announce(&client, 101).await;
    assert!(lock(&harness.handler.rates).is_empty());

    tokio::time::advance(Duration::from_secs(61)).await;
    chain.set_head(104);
    harness.announce(&client, 104).await;

    let rates = lock(&harness.handler.rates);
    assert_eq!(rates.len(), 1);
    assert!(rates[0].rate > 0.0 && rates[0].rate < 0.1);
    assert_eq!(rates[0].behind_head, 2);
    assert_eq!(rates[0].behind_irreversible, 0);
}
