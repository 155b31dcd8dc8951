use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use hivesync_core::{
    endpoint::{EndpointClient, EndpointObserver},
    events::{ApiSupport, HeadAnnouncement, NodeStatus},
    service::FinishHandle,
    transport::HttpTransport,
};
use log::{info, warn};
use tokio::time::Instant;

use crate::common::FleetOptions;

#[derive(Debug, Parser)]
pub struct Status {
    #[clap(flatten)]
    fleet: FleetOptions,
    /// Attempts of the head block read per node
    #[clap(long, env = "HIVESYNC_STATUS_ATTEMPTS", default_value_t = 3)]
    attempts: u32,
}

/// Prints what each node reports as one JSON line per finding.
#[derive(Debug)]
struct Report;

impl EndpointObserver<HttpTransport> for Report {
    async fn potential_block(
        &self,
        announcement: HeadAnnouncement,
        source: Arc<EndpointClient<HttpTransport>>,
    ) {
        println!(
            "{}",
            serde_json::json!({
                "node": source.uri(),
                "head_block_number": announcement.head_height,
                "last_irreversible_block_num": announcement.irreversible_height,
                "time": announcement.timestamp.to_string(),
            })
        );
    }

    async fn api_support_changed(&self, node_uri: &str, support: &ApiSupport) {
        println!("{}", serde_json::json!({ "node": node_uri, "apis": support }));
    }

    async fn node_status(&self, status: &NodeStatus) {
        match serde_json::to_string(status) {
            Ok(status) => println!("{}", status),
            Err(err) => warn!("Unable to serialize node status: {}", err),
        }
    }
}

impl Status {
    pub async fn run(self) -> Result<()> {
        let (fleet, probes, mut settings) = self.fleet.load()?;
        settings.read_max_attempts = Some(self.attempts.max(1));

        let probes = Arc::new(probes);
        let finish_handle = FinishHandle::new();
        let report = Arc::new(Report);

        let mut tasks = Vec::with_capacity(fleet.nodes.len());
        for node in fleet.nodes {
            let transport = HttpTransport::new(node.url()?, settings.http_timeout())?;
            let client = Arc::new(EndpointClient::new(
                node,
                settings.clone(),
                Arc::clone(&probes),
                transport,
                finish_handle.child_token(),
            ));
            let report = Arc::clone(&report);

            tasks.push(tokio::spawn(async move {
                let started = Instant::now();
                client.initialize_api(report.as_ref()).await;
                client.heartbeat(report.as_ref()).await;
                report
                    .node_status(&client.node_status(started.elapsed()))
                    .await;
            }));
        }

        info!("Checking {} node(s)", tasks.len());
        for task in tasks {
            task.await?;
        }

        Ok(())
    }
}
