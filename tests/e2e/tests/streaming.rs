use std::time::Duration;

use hivesync_core::{
    config::IngestionOptions,
    events::CallContext,
    orchestrator::StreamBotBuilder,
    service::Daemon,
};
use hivesync_e2e::{RecordingHandler, ScriptedFleet, ScriptedNode};
use serde_json::json;

const SLOW: Duration = Duration::from_millis(600);

fn fleet() -> ScriptedFleet {
    ScriptedFleet::new(vec![
        ScriptedNode::new("node-105", 105).delay(SLOW),
        ScriptedNode::new("node-103", 103).delay(SLOW),
        ScriptedNode::new("node-106", 106),
    ])
}

#[tokio::test(start_paused = true)]
async fn test_fastest_node_drives_catch_up() {
    let fleet = fleet();
    let handler = RecordingHandler::default();
    let bot = StreamBotBuilder::new(handler.clone())
        .fleet(fleet.config())
        .options(IngestionOptions {
            start_block: Some(101),
            ..Default::default()
        })
        .build_with(fleet.transports())
        .unwrap();
    let controller = bot.controller();
    let shutdown = bot.shutdown_handle();

    bot.start();
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(handler.heights(), (101..=106).collect::<Vec<_>>());
    assert!(handler
        .deliveries()
        .iter()
        .all(|delivery| delivery.source == "node-106"));
    assert_eq!(handler.processed(), (101..=106).collect::<Vec<_>>());
    assert_eq!(controller.cursor(), Some(106));
    assert_eq!(controller.block_source().as_deref(), Some("node-106"));

    // Later heartbeats of every node keep announcing heads already delivered.
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(handler.heights(), (101..=106).collect::<Vec<_>>());

    shutdown.shutdown();
    shutdown.finished().await;
}

#[tokio::test(start_paused = true)]
async fn test_stream_follows_moving_head_with_virtual_operations() {
    let fleet = fleet();
    let handler = RecordingHandler::default();
    let bot = StreamBotBuilder::new(handler.clone())
        .fleet(fleet.config())
        .options(IngestionOptions {
            start_block: Some(104),
            use_virtual: true,
            ..Default::default()
        })
        .build_with(fleet.transports())
        .unwrap();
    let shutdown = bot.shutdown_handle();

    bot.start();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(handler.heights(), vec![104, 105, 106]);

    fleet.node("node-106").unwrap().chain.set_head(109);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(handler.heights(), (104..=109).collect::<Vec<_>>());

    let operations = handler.operations();
    for height in 104..=109 {
        let kinds = operations
            .iter()
            .filter(|(at, _)| *at == height)
            .map(|(_, kind)| kind.as_str())
            .collect::<Vec<_>>();
        assert_eq!(kinds, vec!["transfer_operation", "producer_reward_operation"]);
    }

    shutdown.shutdown();
    shutdown.finished().await;
}

#[tokio::test(start_paused = true)]
async fn test_business_calls_prefer_the_fast_node() {
    let fleet = fleet();
    let bot = StreamBotBuilder::new(RecordingHandler::default())
        .fleet(fleet.config())
        .build_with(fleet.transports())
        .unwrap();
    let api = bot.api();
    let shutdown = bot.shutdown_handle();

    bot.start();
    tokio::time::sleep(Duration::from_secs(10)).await;

    let properties = api
        .call(
            "database_api",
            "get_dynamic_global_properties",
            json!({}),
            &CallContext::default(),
        )
        .await
        .unwrap();
    assert_eq!(properties["head_block_number"], json!(106));

    shutdown.shutdown();
    shutdown.finished().await;
}
