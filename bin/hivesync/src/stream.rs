use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use hivesync_core::{
    config::IngestionOptions,
    events::{
        ApiSupport, BlockEvent, BlockRateEvent, EventHandler, NodeStatus, OperationEvent,
        StallEvent,
    },
    orchestrator::StreamBotBuilder,
    registry::OperationRegistry,
    service::Daemon,
};
use log::{debug, info, warn};

use crate::common::FleetOptions;

/// 10 seconds.
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
pub struct Stream {
    #[clap(flatten)]
    fleet: FleetOptions,
    /// First block to deliver. Defaults to the head announced first
    #[clap(long, env = "HIVESYNC_START_BLOCK")]
    start_block: Option<u64>,
    /// Follow the last irreversible block instead of the head block
    #[clap(long, env = "HIVESYNC_IRREVERSIBLE")]
    irreversible: bool,
    /// Also deliver virtual operations
    #[clap(long, env = "HIVESYNC_VIRTUAL_OPS")]
    virtual_ops: bool,
    /// Finish handling each block before the next one is delivered
    #[clap(long, env = "HIVESYNC_MAINTAIN_ORDER")]
    maintain_order: bool,
}

/// Writes stream events to the log.
#[derive(Debug)]
struct LogHandler;

impl EventHandler for LogHandler {
    async fn on_block(&self, event: &BlockEvent) {
        info!(
            "Block #{} with {} transaction(s) from {} ({} behind head)",
            event.height,
            event.transactions.len(),
            event.client_info.uri,
            event.head_height.saturating_sub(event.height)
        );
    }

    async fn on_block_rate(&self, event: &BlockRateEvent) {
        info!(
            "Streaming {:.2} blocks/s, {} behind head, {} behind irreversible",
            event.rate, event.behind_head, event.behind_irreversible
        );
    }

    async fn on_api_support_changed(&self, node_uri: &str, support: &ApiSupport) {
        let available = support
            .iter()
            .filter(|(_, availability)| availability.available)
            .count();
        debug!("{} serves {} sub-API(s)", node_uri, available);
    }

    async fn on_node_status(&self, status: &NodeStatus) {
        match serde_json::to_string(status) {
            Ok(status) => info!("Node status: {}", status),
            Err(err) => warn!("Unable to serialize node status: {}", err),
        }
    }

    async fn on_stall(&self, event: &StallEvent) {
        warn!(
            "{}.{} unanswered for {:?} after {} sweep(s)",
            event.api, event.method, event.stall_time, event.stall_count
        );
    }
}

async fn log_transfer(event: OperationEvent) {
    debug!(
        "Transfer in #{}: {} -> {} ({})",
        event.height, event.body["from"], event.body["to"], event.body["amount"]["amount"]
    );
}

impl Stream {
    pub async fn run(self) -> Result<()> {
        let (fleet, probes, settings) = self.fleet.load()?;

        let bot = StreamBotBuilder::new(LogHandler)
            .fleet(fleet)
            .probes(probes)
            .settings(settings)
            .options(IngestionOptions {
                start_block: self.start_block,
                use_irreversible: self.irreversible,
                use_virtual: self.virtual_ops,
                maintain_order: self.maintain_order,
            })
            .registry(OperationRegistry::new().on("transfer_operation", log_transfer))
            .build()?;
        let bot_shutdown = bot.shutdown_handle();
        bot.start();

        let mut sigterm_handle =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        let ctrl_c_handle = tokio::signal::ctrl_c();

        tokio::select! {
            _ = sigterm_handle.recv() => {},
            _ = ctrl_c_handle => {},
            _ = bot_shutdown.finished() => {},
        }

        // Graceful shutdown
        bot_shutdown.shutdown();
        tokio::select! {
            _ = tokio::time::sleep(GRACEFUL_SHUTDOWN_TIMEOUT) => {
                Err(anyhow::anyhow!("timeout waiting for graceful shutdown"))
            },
            _ = bot_shutdown.finished() => {
                Ok(())
            },
        }
    }
}
