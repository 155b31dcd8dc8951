//! Helpers shared by the end-to-end scenarios.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Result;
use hivesync_core::{
    config::{FleetConfig, NodeConfig},
    events::{BlockEvent, BlockProcessedEvent, EventHandler, OperationEvent},
    transport::mock::{MockChain, MockTransport},
};

/// One delivered block as the consumer saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub height: u64,
    pub source: String,
}

/// Event handler recording what reached the consumer.
#[derive(Debug, Clone, Default)]
pub struct RecordingHandler {
    deliveries: Arc<Mutex<Vec<Delivery>>>,
    operations: Arc<Mutex<Vec<(u64, String)>>>,
    processed: Arc<Mutex<Vec<u64>>>,
}

impl RecordingHandler {
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().unwrap().clone()
    }

    pub fn heights(&self) -> Vec<u64> {
        self.deliveries().into_iter().map(|d| d.height).collect()
    }

    pub fn operations(&self) -> Vec<(u64, String)> {
        self.operations.lock().unwrap().clone()
    }

    pub fn processed(&self) -> Vec<u64> {
        self.processed.lock().unwrap().clone()
    }
}

impl EventHandler for RecordingHandler {
    async fn on_block(&self, event: &BlockEvent) {
        self.deliveries.lock().unwrap().push(Delivery {
            height: event.height,
            source: event.client_info.uri.clone(),
        });
    }

    async fn on_operation(&self, event: &OperationEvent) {
        self.operations
            .lock()
            .unwrap()
            .push((event.height, event.op_type.clone()));
    }

    async fn on_block_processed(&self, event: &BlockProcessedEvent) {
        self.processed.lock().unwrap().push(event.height);
    }
}

/// A scripted node: its own synthetic chain and how long every answer takes.
#[derive(Debug, Clone)]
pub struct ScriptedNode {
    pub name: String,
    pub chain: MockChain,
    pub delay: Duration,
}

impl ScriptedNode {
    pub fn new<S: Into<String>>(name: S, head: u64) -> Self {
        Self {
            name: name.into(),
            chain: MockChain::new(head),
            delay: Duration::ZERO,
        }
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Scripted nodes keyed by host, ready to back a bot through `build_with`.
#[derive(Debug, Clone, Default)]
pub struct ScriptedFleet {
    nodes: Vec<ScriptedNode>,
}

impl ScriptedFleet {
    pub fn new(nodes: Vec<ScriptedNode>) -> Self {
        Self { nodes }
    }

    pub fn config(&self) -> FleetConfig {
        FleetConfig {
            nodes: self
                .nodes
                .iter()
                .map(|node| NodeConfig::new(node.name.clone()).policy(60.0, 10_000))
                .collect(),
        }
    }

    pub fn transports(&self) -> impl FnMut(&NodeConfig) -> Result<MockTransport> {
        let transports = self
            .nodes
            .iter()
            .map(|node| {
                (
                    node.name.clone(),
                    node.chain.transport().with_delay(node.delay),
                )
            })
            .collect::<HashMap<_, _>>();

        move |config: &NodeConfig| match transports.get(&config.host) {
            Some(transport) => Ok(transport.clone()),
            None => anyhow::bail!("no scripted node `{}`", config.host),
        }
    }

    pub fn node(&self, name: &str) -> Option<&ScriptedNode> {
        self.nodes.iter().find(|node| node.name == name)
    }
}
