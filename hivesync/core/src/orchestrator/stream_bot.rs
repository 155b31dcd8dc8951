use std::{sync::Arc, time::Duration};

use anyhow::Result;
use log::{debug, info};
use tokio::task::JoinHandle;

use crate::{
    config::{ClientSettings, FleetConfig, IngestionOptions, NodeConfig, ProbeTable},
    dispatcher::Dispatcher,
    endpoint::EndpointClient,
    events::EventHandler,
    ingestion::IngestionController,
    registry::OperationRegistry,
    selector::{DefaultNodeSelector, NodeSelector},
    service::{Daemon, FinishHandle, ShutdownHandle},
    transport::{HttpTransport, Transport},
};

/// A streaming client following the chain through a fleet of public nodes.
///
/// Every node gets its own endpoint client task. Their heartbeats drive one shared ingestion
/// controller, which hands blocks to the event handler in height order. Business calls made
/// through [`api`](Self::api) go to whichever node currently ranks best.
#[derive(Debug)]
pub struct StreamBot<T, H> {
    clients: Vec<Arc<EndpointClient<T>>>,
    dispatcher: Arc<Dispatcher<T, H>>,
    controller: Arc<IngestionController<T, H>>,
    finish_handle: FinishHandle,
}

#[derive(Debug)]
pub struct StreamBotBuilder<H> {
    handler: H,
    fleet: FleetConfig,
    probes: ProbeTable,
    settings: ClientSettings,
    options: IngestionOptions,
    registry: OperationRegistry,
    selector: Arc<dyn NodeSelector>,
    stall_pause: Option<Duration>,
}

struct StreamBotState {
    tasks: Vec<JoinHandle<()>>,
    finish_handle: FinishHandle,
}

impl<H> StreamBotBuilder<H>
where
    H: EventHandler,
{
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            fleet: FleetConfig::default(),
            probes: ProbeTable::default(),
            settings: ClientSettings::default(),
            options: IngestionOptions::default(),
            registry: OperationRegistry::default(),
            selector: Arc::new(DefaultNodeSelector),
            stall_pause: None,
        }
    }

    pub fn fleet(mut self, fleet: FleetConfig) -> Self {
        self.fleet = fleet;
        self
    }

    pub fn probes(mut self, probes: ProbeTable) -> Self {
        self.probes = probes;
        self
    }

    pub fn settings(mut self, settings: ClientSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn options(mut self, options: IngestionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn registry(mut self, registry: OperationRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Replaces the default node scoring policy.
    pub fn selector<S>(mut self, selector: S) -> Self
    where
        S: NodeSelector,
    {
        self.selector = Arc::new(selector);
        self
    }

    /// Pause between two fleet sweeps of a business call that nobody answered (default: 15s).
    pub fn stall_pause(mut self, stall_pause: Duration) -> Self {
        self.stall_pause = Some(stall_pause);
        self
    }

    /// Builds a bot talking JSON-RPC over HTTPS to every configured node.
    pub fn build(self) -> Result<StreamBot<HttpTransport, H>> {
        let timeout = self.settings.http_timeout();
        self.build_with(|node| HttpTransport::new(node.url()?, timeout))
    }

    /// Builds a bot with a custom transport per node.
    pub fn build_with<T, F>(self, mut make_transport: F) -> Result<StreamBot<T, H>>
    where
        T: Transport,
        F: FnMut(&NodeConfig) -> Result<T>,
    {
        if self.fleet.nodes.is_empty() {
            anyhow::bail!("`fleet` has no nodes");
        }

        let finish_handle = FinishHandle::new();
        let probes = Arc::new(self.probes);
        let clients = self
            .fleet
            .nodes
            .iter()
            .map(|node| {
                Ok(Arc::new(EndpointClient::new(
                    node.clone(),
                    self.settings.clone(),
                    Arc::clone(&probes),
                    make_transport(node)?,
                    finish_handle.child_token(),
                )))
            })
            .collect::<Result<Vec<_>>>()?;

        let handler = Arc::new(self.handler);
        let mut dispatcher = Dispatcher::new(
            clients.clone(),
            self.selector,
            Arc::clone(&handler),
            finish_handle.child_token(),
        );
        if let Some(stall_pause) = self.stall_pause {
            dispatcher = dispatcher.with_stall_pause(stall_pause);
        }
        let dispatcher = Arc::new(dispatcher);

        let controller = Arc::new(IngestionController::new(
            self.options,
            handler,
            Arc::new(self.registry),
            Arc::clone(&dispatcher),
            finish_handle.child_token(),
        ));

        Ok(StreamBot {
            clients,
            dispatcher,
            controller,
            finish_handle,
        })
    }
}

impl<T, H> StreamBot<T, H>
where
    T: Transport,
    H: EventHandler,
{
    /// Entry point for business calls. Stays usable after the bot is started.
    pub fn api(&self) -> Arc<Dispatcher<T, H>> {
        Arc::clone(&self.dispatcher)
    }

    pub fn controller(&self) -> Arc<IngestionController<T, H>> {
        Arc::clone(&self.controller)
    }

    pub fn clients(&self) -> &[Arc<EndpointClient<T>>] {
        &self.clients
    }

    /// Stops every endpoint client, pending business call and block delivery.
    pub fn abort(&self) {
        self.finish_handle.shutdown_handle().shutdown();
    }
}

impl StreamBotState {
    async fn run(self) {
        self.finish_handle.shutdown_requested().await;

        futures_util::future::join_all(self.tasks).await;

        debug!("Graceful shutdown finished");
        self.finish_handle.finish();
    }
}

impl<T, H> Daemon for StreamBot<T, H>
where
    T: Transport,
    H: EventHandler,
{
    fn shutdown_handle(&self) -> ShutdownHandle {
        self.finish_handle.shutdown_handle()
    }

    fn start(self) {
        info!("Streaming from {} node(s)", self.clients.len());

        let tasks = self
            .clients
            .iter()
            .map(|client| tokio::spawn(Arc::clone(client).run(Arc::clone(&self.controller))))
            .collect();

        tokio::spawn(
            StreamBotState {
                tasks,
                finish_handle: self.finish_handle,
            }
            .run(),
        );
    }
}
