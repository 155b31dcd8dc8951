use std::{collections::BTreeMap, path::Path, time::Duration};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use url::Url;

/// Tuning knobs shared by every endpoint client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientSettings {
    /// Seconds between two heartbeats of one endpoint (default: 3)
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,

    /// Seconds between two capability discoveries and status reports (default: 900)
    #[serde(default = "default_reinit_interval_secs")]
    pub reinit_interval_secs: u64,

    /// Decay factor of the error rate and latency averages (default: 0.8)
    #[serde(default = "default_ewma_decay")]
    pub ewma_decay: f64,

    /// Transport timeout of a single request attempt in seconds (default: 30)
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,

    /// Attempt cap for heartbeat and block reads, `None` retries until aborted (default: `None`)
    #[serde(default)]
    pub read_max_attempts: Option<u32>,

    /// Pause between two attempts of a heartbeat or block read in seconds (default: 0.5)
    #[serde(default = "default_read_retry_pause_secs")]
    pub read_retry_pause_secs: f64,
}

fn default_probe_interval_secs() -> u64 {
    3
}
fn default_reinit_interval_secs() -> u64 {
    900
}
fn default_ewma_decay() -> f64 {
    0.8
}
fn default_http_timeout_secs() -> u64 {
    30
}
fn default_read_retry_pause_secs() -> f64 {
    0.5
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            probe_interval_secs: default_probe_interval_secs(),
            reinit_interval_secs: default_reinit_interval_secs(),
            ewma_decay: default_ewma_decay(),
            http_timeout_secs: default_http_timeout_secs(),
            read_max_attempts: None,
            read_retry_pause_secs: default_read_retry_pause_secs(),
        }
    }
}

impl ClientSettings {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        read_json(path.as_ref())
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn reinit_interval(&self) -> Duration {
        Duration::from_secs(self.reinit_interval_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn read_retry_pause(&self) -> Duration {
        Duration::from_secs_f64(self.read_retry_pause_secs.max(0.0))
    }
}

/// One rate limit window advertised (or assumed) for a node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitPolicyConfig {
    /// Window length in seconds.
    #[serde(alias = "w")]
    pub window_secs: f64,
    /// Requests allowed per window.
    #[serde(alias = "v")]
    pub quota: u32,
}

/// Static configuration of one public API node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Host name, or a full base URL for nodes not served over `https` on the default port.
    pub host: String,
    /// Optional path segment appended to the base URL.
    #[serde(default)]
    pub path: Option<String>,
    /// The node cannot serve `block_api.get_block_range`.
    #[serde(default)]
    pub single_block: bool,
    /// Requests per `period` assumed when no explicit policy is given (default: 60)
    #[serde(default = "default_rate")]
    pub rate: u32,
    /// Period in seconds for `rate` (default: 60)
    #[serde(default = "default_period")]
    pub period: f64,
    #[serde(default)]
    pub policies: Vec<RateLimitPolicyConfig>,
}

fn default_rate() -> u32 {
    60
}
fn default_period() -> f64 {
    60.0
}

impl NodeConfig {
    pub fn new<S: Into<String>>(host: S) -> Self {
        Self {
            host: host.into(),
            path: None,
            single_block: false,
            rate: default_rate(),
            period: default_period(),
            policies: Vec::new(),
        }
    }

    pub fn single_block(mut self, single_block: bool) -> Self {
        self.single_block = single_block;
        self
    }

    pub fn policy(mut self, window_secs: f64, quota: u32) -> Self {
        self.policies.push(RateLimitPolicyConfig { window_secs, quota });
        self
    }

    /// Rate limit windows in effect, falling back to a single `rate` per `period` window.
    pub fn effective_policies(&self) -> Vec<RateLimitPolicyConfig> {
        if self.policies.is_empty() {
            vec![RateLimitPolicyConfig {
                window_secs: self.period,
                quota: self.rate,
            }]
        } else {
            self.policies.clone()
        }
    }

    pub fn url(&self) -> Result<Url> {
        let mut base = if self.host.contains("://") {
            self.host.clone()
        } else {
            format!("https://{}", self.host)
        };
        if let Some(path) = self.path.as_deref().filter(|path| !path.is_empty()) {
            base.push('/');
            base.push_str(path.trim_start_matches('/'));
        }
        Url::parse(&base).with_context(|| format!("invalid node url `{base}`"))
    }
}

/// The ordered set of nodes the client keeps up with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FleetConfig {
    pub nodes: Vec<NodeConfig>,
}

impl FleetConfig {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let fleet: Self = read_json(path.as_ref())?;
        if fleet.nodes.is_empty() {
            anyhow::bail!("node list `{}` is empty", path.as_ref().display());
        }
        Ok(fleet)
    }
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            nodes: vec![
                NodeConfig::new("api.hive.blog"),
                NodeConfig::new("api.deathwing.me"),
                NodeConfig::new("api.openhive.network"),
                NodeConfig::new("hive-api.arcange.eu"),
                NodeConfig::new("rpc.mahdiyari.com"),
                NodeConfig::new("techcoderx.com"),
                NodeConfig::new("hive-api.3speak.tv"),
                NodeConfig::new("anyx.io").single_block(true),
            ],
        }
    }
}

/// Canary request used to find out whether a node serves a sub-API it doesn't advertise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeRequest {
    pub method: String,
    #[serde(default = "empty_params")]
    pub params: Value,
}

fn empty_params() -> Value {
    json!({})
}

/// Sub-API namespace to canary request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProbeTable {
    pub probes: BTreeMap<String, ProbeRequest>,
}

impl ProbeTable {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        read_json(path.as_ref())
    }
}

impl Default for ProbeTable {
    fn default() -> Self {
        let probe = |method: &str, params: Value| ProbeRequest {
            method: method.to_string(),
            params,
        };

        let probes = [
            (
                "account_by_key_api",
                probe("get_key_references", json!({"keys": []})),
            ),
            (
                "account_history_api",
                probe(
                    "get_ops_in_block",
                    json!({"block_num": 1, "only_virtual": false}),
                ),
            ),
            ("block_api", probe("get_block", json!({"block_num": 1}))),
            (
                "condenser_api",
                probe("get_dynamic_global_properties", json!([])),
            ),
            (
                "database_api",
                probe("get_dynamic_global_properties", json!({})),
            ),
            ("market_history_api", probe("get_ticker", json!({}))),
            ("rc_api", probe("get_resource_params", json!({}))),
            (
                "reputation_api",
                probe(
                    "get_account_reputations",
                    json!({"account_lower_bound": "", "limit": 1}),
                ),
            ),
            (
                "transaction_status_api",
                probe(
                    "find_transaction",
                    json!({"transaction_id": "0000000000000000000000000000000000000000"}),
                ),
            ),
        ];

        Self {
            probes: probes
                .into_iter()
                .map(|(namespace, request)| (namespace.to_string(), request))
                .collect(),
        }
    }
}

/// How announced heads are turned into delivered blocks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionOptions {
    /// First block to deliver. Without it, streaming starts at the first announced head.
    #[serde(default)]
    pub start_block: Option<u64>,
    /// Follow the last irreversible block instead of the head block.
    #[serde(default)]
    pub use_irreversible: bool,
    /// Also deliver virtual operations of every block.
    #[serde(default)]
    pub use_virtual: bool,
    /// Never let the consumer see a block before the previous one has been fully handled.
    #[serde(default)]
    pub maintain_order: bool,
}

fn read_json<T>(path: &Path) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read `{}`", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse `{}`", path.display()))
}
