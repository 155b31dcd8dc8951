//! Client of a single public API node.
//!
//! An [`EndpointClient`] discovers which sub-APIs its node serves, keeps decaying error rate and
//! latency averages over every request it makes, simulates the node's rate limit, and announces
//! the node's head block to an [`EndpointObserver`] on every heartbeat. It never pushes blocks by
//! itself.

use std::{
    collections::BTreeSet,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
    time::Duration,
};

use log::{debug, info, trace};
use serde_json::{json, Map, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    config::{ClientSettings, NodeConfig, ProbeTable},
    errors::RequestError,
    events::{ApiAvailability, ApiSupport, ClientInfo, HeadAnnouncement, NodeStatus},
    rate_limit::RateLimitTracker,
    service::sleep_unless_aborted,
    transport::{Transport, TransportResponse},
    utils::{coerce_error_rate, coerce_latency, lock, parse_timestamp, read, write},
};

mod stats;
pub use stats::MethodErrorStats;
use stats::EndpointStats;

const GET_METHODS_ATTEMPTS: u32 = 10;
const GET_METHODS_PAUSE: Duration = Duration::from_secs(30);
const PROBE_ATTEMPTS: u32 = 5;
const PROBE_PAUSE: Duration = Duration::from_millis(500);

/// Namespace with no canary request of its own, assumed served wherever `condenser_api` is.
const BROADCAST_API: &str = "network_broadcast_api";
const CONDENSER_API: &str = "condenser_api";

/// Receives what endpoint clients find out about their nodes.
pub trait EndpointObserver<T: Transport>: Send + Sync + 'static {
    /// Blocks up to the announced head may be fetched, `source` being the announcing node.
    fn potential_block(
        &self,
        announcement: HeadAnnouncement,
        source: Arc<EndpointClient<T>>,
    ) -> impl Future<Output = ()> + Send;

    fn api_support_changed(
        &self,
        node_uri: &str,
        support: &ApiSupport,
    ) -> impl Future<Output = ()> + Send;

    fn node_status(&self, status: &NodeStatus) -> impl Future<Output = ()> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointPhase {
    Uninitialized,
    /// Capability discovery in progress.
    Probing,
    Active,
    Aborted,
}

/// Error rate and latency of a node for one sub-API, NaN already coerced.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EndpointQuality {
    pub error_rate: f64,
    pub latency: f64,
}

impl EndpointQuality {
    /// Quality reported for a sub-API the node does not serve.
    pub const UNSUPPORTED: Self = Self {
        error_rate: 1.0,
        latency: f64::INFINITY,
    };
}

/// Attempt bookkeeping of one `retried_request` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    max_attempts: Option<u32>,
    pause: Duration,
    attempts_used: u32,
}

impl RetryBudget {
    pub fn bounded(max_attempts: u32, pause: Duration) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            pause,
            attempts_used: 0,
        }
    }

    /// Retries until the client is aborted.
    pub fn unbounded(pause: Duration) -> Self {
        Self {
            max_attempts: None,
            pause,
            attempts_used: 0,
        }
    }

    pub fn attempts_used(&self) -> u32 {
        self.attempts_used
    }

    fn has_remaining(&self) -> bool {
        self.max_attempts
            .map_or(true, |max_attempts| self.attempts_used < max_attempts)
    }

    fn try_attempt(&mut self) -> bool {
        if !self.has_remaining() {
            return false;
        }
        self.attempts_used += 1;
        true
    }
}

enum Attempt {
    Done(Result<Value, RequestError>),
    Failed(String),
}

#[derive(Debug)]
pub struct EndpointClient<T> {
    uri: String,
    config: NodeConfig,
    settings: ClientSettings,
    transport: T,
    probes: Arc<ProbeTable>,
    apis: RwLock<BTreeSet<String>>,
    stats: Mutex<EndpointStats>,
    rate_limit: Mutex<RateLimitTracker>,
    phase: Mutex<EndpointPhase>,
    next_id: AtomicU64,
    abort: CancellationToken,
}

impl<T> EndpointClient<T>
where
    T: Transport,
{
    pub fn new(
        config: NodeConfig,
        settings: ClientSettings,
        probes: Arc<ProbeTable>,
        transport: T,
        abort: CancellationToken,
    ) -> Self {
        Self {
            uri: config.host.clone(),
            stats: Mutex::new(EndpointStats::new(settings.ewma_decay)),
            rate_limit: Mutex::new(RateLimitTracker::new(&config.effective_policies())),
            config,
            settings,
            transport,
            probes,
            apis: RwLock::default(),
            phase: Mutex::new(EndpointPhase::Uninitialized),
            next_id: AtomicU64::new(0),
            abort,
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn is_single_block(&self) -> bool {
        self.config.single_block
    }

    pub fn phase(&self) -> EndpointPhase {
        *lock(&self.phase)
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_cancelled()
    }

    /// Stops the run loop and every pending retry at their next check point.
    pub fn abort(&self) {
        self.abort.cancel();
        self.set_phase(EndpointPhase::Aborted);
    }

    pub fn apis(&self) -> Vec<String> {
        read(&self.apis).iter().cloned().collect()
    }

    pub fn supports(&self, api: &str) -> bool {
        read(&self.apis).contains(api)
    }

    pub fn get_api_quality(&self, api: &str) -> EndpointQuality {
        let api = if api == BROADCAST_API {
            CONDENSER_API
        } else {
            api
        };
        if !self.supports(api) {
            return EndpointQuality::UNSUPPORTED;
        }

        let stats = lock(&self.stats);
        EndpointQuality {
            error_rate: coerce_error_rate(stats.error_rate.get()),
            latency: coerce_latency(stats.latency.get()),
        }
    }

    /// Whether the node serves `api` with an error rate and latency (seconds) under the limits.
    ///
    /// A node without samples never passes.
    pub fn api_check(&self, api: &str, error_rate_threshold: f64, max_latency: f64) -> bool {
        if !self.supports(api) {
            return false;
        }
        let stats = lock(&self.stats);
        error_rate_threshold > stats.error_rate.get() && max_latency > stats.latency.get()
    }

    /// Seconds the rate limit is expected to hold back the next request.
    pub fn predicted_sleep(&self) -> f64 {
        lock(&self.rate_limit).predicted_sleep()
    }

    pub fn get_projected_ratelimit_window_latency(&self) -> f64 {
        lock(&self.rate_limit).projected_window_latency()
    }

    pub fn client_info(&self) -> ClientInfo {
        let stats = lock(&self.stats);
        ClientInfo {
            uri: self.uri.clone(),
            latency_ms: coerce_latency(stats.latency.get()) * 1000.0,
            error_pct: coerce_error_rate(stats.error_rate.get()) * 100.0,
        }
    }

    /// Sends one JSON-RPC request, retrying within `budget` on transport errors, non-200
    /// answers and bodies that aren't JSON-RPC responses.
    ///
    /// A JSON-RPC error object is a valid answer: it is returned at once and does not count
    /// against the node's error rate.
    pub async fn retried_request(
        &self,
        method: &str,
        params: Value,
        mut budget: RetryBudget,
    ) -> Result<Value, RequestError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id,
        })
        .to_string();
        lock(&self.stats).record_call(method);

        let mut failures = Vec::new();
        while !self.abort.is_cancelled() && budget.try_attempt() {
            lock(&self.stats).requests += 1;

            let sleep = self.predicted_sleep();
            if sleep > 0.0 {
                let sleep = Duration::from_secs_f64(sleep);
                trace!("Rate limit sleep of {:?} before {} on {}", sleep, method, self.uri);
                lock(&self.rate_limit).record_sleep(sleep);
                if !sleep_unless_aborted(&self.abort, sleep).await {
                    break;
                }
            }

            let started = Instant::now();
            let outcome = match self.transport.post(body.clone()).await {
                Ok(response) => self.settle(method, response, started.elapsed()),
                Err(err) => {
                    lock(&self.stats).record_transport_failure(method, &err);
                    Attempt::Failed(err.to_string())
                }
            };

            match outcome {
                Attempt::Done(result) => return result,
                Attempt::Failed(reason) => {
                    trace!(
                        "Attempt {} of {} on {} failed: {}",
                        budget.attempts_used(),
                        method,
                        self.uri,
                        reason
                    );
                    failures.push(reason);
                }
            }

            if budget.has_remaining() && !sleep_unless_aborted(&self.abort, budget.pause).await {
                break;
            }
        }

        Err(RequestError::NoResponse {
            node: self.uri.clone(),
            attempts: budget.attempts_used(),
            failures,
        })
    }

    fn settle(&self, method: &str, response: TransportResponse, elapsed: Duration) -> Attempt {
        lock(&self.rate_limit).update(
            response.status,
            response.ratelimit.as_deref(),
            response.retry_after.as_deref(),
        );

        let mut stats = lock(&self.stats);
        stats.record_answer(method, response.status, elapsed);

        if response.status != 200 {
            stats.record_failure();
            return Attempt::Failed(format!("HTTP {}: {}", response.status, response.body));
        }

        let mut reply = match serde_json::from_str::<Map<String, Value>>(&response.body) {
            Ok(reply) => reply,
            Err(err) => {
                stats.record_failure();
                return Attempt::Failed(format!("invalid JSON body: {err}"));
            }
        };

        if reply.contains_key("jsonrpc") {
            if let Some(error) = reply.remove("error") {
                stats.record_success();
                return Attempt::Done(Err(RequestError::Rpc {
                    node: self.uri.clone(),
                    error,
                }));
            }
            if let Some(result) = reply.remove("result") {
                stats.record_success();
                return Attempt::Done(Ok(result));
            }
        }

        stats.record_failure();
        Attempt::Failed("not a JSON-RPC response".to_string())
    }

    fn read_budget(&self) -> RetryBudget {
        let pause = self.settings.read_retry_pause();
        match self.settings.read_max_attempts {
            Some(max_attempts) => RetryBudget::bounded(max_attempts, pause),
            None => RetryBudget::unbounded(pause),
        }
    }

    /// Fetches a single block, `None` on any failure or when the node doesn't have it yet.
    pub async fn get_block(&self, height: u64) -> Option<Value> {
        lock(&self.stats).blocks += 1;
        let mut result = self
            .retried_request(
                "block_api.get_block",
                json!({ "block_num": height }),
                self.read_budget(),
            )
            .await
            .ok()?;
        result.get_mut("block").map(Value::take)
    }

    /// Fetches up to `count` blocks starting at `start`, `None` on any failure.
    pub async fn get_block_range(&self, start: u64, count: u64) -> Option<Vec<Value>> {
        lock(&self.stats).block_ranges += 1;
        let mut result = self
            .retried_request(
                "block_api.get_block_range",
                json!({ "starting_block_num": start, "count": count }),
                self.read_budget(),
            )
            .await
            .ok()?;
        match result.get_mut("blocks").map(Value::take) {
            Some(Value::Array(blocks)) => Some(blocks),
            _ => None,
        }
    }

    /// Works out which sub-APIs the node serves and reports the result to `observer`.
    ///
    /// Advertised namespaces come from `jsonrpc.get_methods`. Every namespace of the probe table
    /// that isn't advertised gets its canary request, and `network_broadcast_api` is implied by
    /// `condenser_api`.
    pub async fn initialize_api<O>(&self, observer: &O)
    where
        O: EndpointObserver<T>,
    {
        self.set_phase(EndpointPhase::Probing);

        let methods = match self
            .retried_request(
                "jsonrpc.get_methods",
                json!({}),
                RetryBudget::bounded(GET_METHODS_ATTEMPTS, GET_METHODS_PAUSE),
            )
            .await
        {
            Ok(Value::Array(methods)) => methods,
            Ok(_) => Vec::new(),
            Err(err) => {
                debug!("Method listing failed on {}: {}", self.uri, err);
                Vec::new()
            }
        };

        let published = methods
            .iter()
            .filter_map(Value::as_str)
            .filter_map(|method| method.split_once('.'))
            .map(|(namespace, _)| namespace.to_string())
            .collect::<BTreeSet<_>>();

        let mut found = published.clone();
        for (namespace, probe) in &self.probes.probes {
            if found.contains(namespace) {
                continue;
            }
            if self.abort.is_cancelled() {
                return;
            }
            let method = format!("{}.{}", namespace, probe.method);
            match self
                .retried_request(
                    &method,
                    probe.params.clone(),
                    RetryBudget::bounded(PROBE_ATTEMPTS, PROBE_PAUSE),
                )
                .await
            {
                Ok(Value::Null) | Err(_) => {}
                Ok(_) => {
                    found.insert(namespace.clone());
                }
            }
        }
        if found.contains(CONDENSER_API) {
            found.insert(BROADCAST_API.to_string());
        }

        let mut known = published.clone();
        known.extend(self.probes.probes.keys().cloned());
        known.insert(BROADCAST_API.to_string());
        let support = known
            .into_iter()
            .map(|namespace| {
                let availability = ApiAvailability {
                    published: published.contains(&namespace),
                    available: found.contains(&namespace),
                };
                (namespace, availability)
            })
            .collect::<ApiSupport>();

        let changed = {
            let mut apis = write(&self.apis);
            let changed = *apis != found;
            *apis = found;
            changed
        };
        if changed {
            info!("Node {} serves: {}", self.uri, self.apis().join(", "));
        }

        if self.abort.is_cancelled() {
            return;
        }
        observer.api_support_changed(&self.uri, &support).await;
        self.set_phase(EndpointPhase::Active);
    }

    /// Announces the node's head block to `observer` if the node reports a complete chain state.
    pub async fn heartbeat<O>(self: &Arc<Self>, observer: &O)
    where
        O: EndpointObserver<T>,
    {
        if !self.supports(CONDENSER_API) {
            return;
        }

        let properties = match self
            .retried_request(
                "condenser_api.get_dynamic_global_properties",
                json!([]),
                self.read_budget(),
            )
            .await
        {
            Ok(properties) => properties,
            Err(err) => {
                debug!("Heartbeat failed on {}: {}", self.uri, err);
                return;
            }
        };

        let Some(announcement) = self.parse_head(&properties) else {
            debug!("Incomplete chain state from {}", self.uri);
            return;
        };
        if self.abort.is_cancelled() {
            return;
        }
        observer.potential_block(announcement, Arc::clone(self)).await;
    }

    fn parse_head(&self, properties: &Value) -> Option<HeadAnnouncement> {
        Some(HeadAnnouncement {
            head_height: properties.get("head_block_number")?.as_u64()?,
            irreversible_height: properties.get("last_irreversible_block_num")?.as_u64()?,
            head_block_id: properties.get("head_block_id")?.as_str()?.to_string(),
            timestamp: parse_timestamp(properties.get("time")?.as_str()?),
            client_info: self.client_info(),
        })
    }

    /// Activity over the last `interval`, rates per minute.
    pub fn node_status(&self, interval: Duration) -> NodeStatus {
        let minutes = interval.as_secs_f64().max(f64::EPSILON) / 60.0;
        let rate_limit_status = lock(&self.rate_limit).status().clone();
        let stats = lock(&self.stats);
        NodeStatus {
            node_uri: self.uri.clone(),
            error_percentage: coerce_error_rate(stats.error_rate.get()) * 100.0,
            latency_ms: coerce_latency(stats.latency.get()) * 1000.0,
            ok_rate: stats.requests.saturating_sub(stats.errors) as f64 / minutes,
            error_rate: stats.errors as f64 / minutes,
            block_rate: stats.blocks as f64 / minutes,
            range_rate: stats.block_ranges as f64 / minutes,
            calls: stats.calls.clone(),
            rate_limit_status,
            detailed_error_status: stats.detailed_errors.clone(),
        }
    }

    fn reset_counters(&self) {
        lock(&self.stats).reset_counters();
        lock(&self.rate_limit).clear_status();
    }

    fn set_phase(&self, phase: EndpointPhase) {
        let mut current = lock(&self.phase);
        if *current != EndpointPhase::Aborted {
            *current = phase;
        }
    }

    /// Heartbeats every probe interval, and reports status plus rediscovers capabilities every
    /// reinit interval, until aborted.
    pub async fn run<O>(self: Arc<Self>, observer: Arc<O>)
    where
        O: EndpointObserver<T>,
    {
        self.initialize_api(observer.as_ref()).await;
        let mut last_reinit = Instant::now();

        while !self.abort.is_cancelled() {
            if last_reinit.elapsed() > self.settings.reinit_interval() {
                let status = self.node_status(last_reinit.elapsed());
                last_reinit = Instant::now();
                observer.node_status(&status).await;
                self.initialize_api(observer.as_ref()).await;
                self.reset_counters();
            }

            self.heartbeat(observer.as_ref()).await;

            if !sleep_unless_aborted(&self.abort, self.settings.probe_interval()).await {
                break;
            }
        }

        self.set_phase(EndpointPhase::Aborted);
        debug!("Node client {} stopped", self.uri);
    }
}
