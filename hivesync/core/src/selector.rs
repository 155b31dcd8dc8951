//! Ranking of endpoint clients for a single business call.

use std::fmt::Debug;

const MAX_ERROR_RATE: f64 = 0.667;
const MAX_LATENCY_SECS: f64 = 30.0;
const MAX_RATELIMIT_SLEEP_SECS: f64 = 30.0;
const PENALTY_ERROR_RATE: f64 = 0.2;
const BLOCK_SOURCE_HISTORY_API: &str = "account_history_api";

/// Everything known about one candidate node when ranking it for a call.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreInput<'a> {
    pub error_rate: f64,
    pub recent_latency: f64,
    pub predicted_ratelimit_sleep: f64,
    pub projected_ratelimit_window_latency: f64,
    pub blocks_behind: u64,
    pub api: &'a str,
    pub method: &'a str,
    pub is_block_source: bool,
}

/// Sort key policy for candidate nodes: lower is better, `f64::INFINITY` means never use.
pub trait NodeSelector: Debug + Send + Sync + 'static {
    fn score(&self, input: &ScoreInput<'_>) -> f64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultNodeSelector;

impl NodeSelector for DefaultNodeSelector {
    fn score(&self, input: &ScoreInput<'_>) -> f64 {
        if input.error_rate >= MAX_ERROR_RATE
            || input.recent_latency > MAX_LATENCY_SECS
            || input.predicted_ratelimit_sleep >= MAX_RATELIMIT_SLEEP_SECS
        {
            return f64::INFINITY;
        }

        // Other nodes may not have indexed the newest block's history yet.
        if input.blocks_behind < 2
            && input.api == BLOCK_SOURCE_HISTORY_API
            && input.is_block_source
        {
            return -1.0;
        }

        let mut latency = input
            .recent_latency
            .max(input.projected_ratelimit_window_latency)
            + input.predicted_ratelimit_sleep;
        if input.error_rate > PENALTY_ERROR_RATE {
            latency = latency * (1.0 + input.error_rate) + input.error_rate;
        }
        latency
    }
}

/// Orders `items` by ascending score. Equal scores keep their original order.
pub fn rank<T>(mut items: Vec<(f64, T)>) -> Vec<(f64, T)> {
    items.sort_by(|(left, _), (right, _)| left.total_cmp(right));
    items
}
