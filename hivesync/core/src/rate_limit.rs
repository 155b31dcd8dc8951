//! Client-side simulation of a node's rate limit windows.
//!
//! Public nodes rarely tell clients how close they are to being throttled. The tracker replays
//! every request against the configured windows, lets `RateLimit`/`Retry-After` feedback override
//! the simulation, and turns the resulting budget into the sleep and latency estimates the node
//! selector scores with.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::config::RateLimitPolicyConfig;

/// Longest reset we are willing to believe while a budget is exhausted.
const MAX_RESET_HORIZON: Duration = Duration::from_secs(900);

/// Spend ratio against a flat spend above which sleeping kicks in.
const BURST_RATIO: f64 = 1.3;

/// Extra margin slept after an exhausted window resets.
const RESET_MARGIN_SECS: f64 = 0.1;

/// Counters reported with every node status event.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RateLimitStatus {
    pub count: u64,
    pub uses_ratelimit_header: bool,
    pub used_429: bool,
    pub used_retry_header: bool,
    pub total_ratelimit_sleeptime: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct PolicyState {
    /// Sustainable request rate for the rest of the window, `None` when exhausted.
    rate: Option<f64>,
    limit: u32,
    remaining: u32,
    reset: Instant,
    window: f64,
}

#[derive(Debug, Clone)]
struct Policy {
    window: f64,
    quota: u32,
    remaining: u32,
    reset: Instant,
}

impl Policy {
    fn new(config: &RateLimitPolicyConfig, now: Instant) -> Self {
        let window = if config.window_secs > 0.0 {
            config.window_secs
        } else {
            1.0
        };
        let quota = config.quota.max(1);
        Self {
            window,
            quota,
            remaining: quota,
            reset: now + Duration::from_secs_f64(window),
        }
    }

    fn update(&mut self, now: Instant) {
        self.remaining = self.remaining.saturating_sub(1);
        if now >= self.reset {
            self.reset = now + Duration::from_secs_f64(self.window);
            self.remaining = self.quota - 1;
        }
    }

    fn state(&self, now: Instant) -> PolicyState {
        if self.reset <= now {
            return PolicyState {
                rate: Some(f64::from(self.quota) / self.window),
                limit: self.quota,
                remaining: self.quota,
                reset: now + Duration::from_secs_f64(self.window),
                window: self.window,
            };
        }
        let rate = if self.remaining == 0 {
            None
        } else {
            Some(f64::from(self.remaining) / secs_until(self.reset, now))
        };
        PolicyState {
            rate,
            limit: self.quota,
            remaining: self.remaining,
            reset: self.reset,
            window: self.window,
        }
    }
}

/// Picks the policy that currently constrains the client the most.
///
/// Any exhausted policy wins (the one resetting last if several are); otherwise the one with the
/// fewest remaining requests, ties going to the one resetting last.
fn governing_state(policies: &[Policy], now: Instant) -> Option<PolicyState> {
    let mut best: Option<PolicyState> = None;
    for policy in policies {
        let candidate = policy.state(now);
        best = match best {
            None => Some(candidate),
            Some(current) => {
                let replace = match (current.rate, candidate.rate) {
                    (None, None) => current.reset < candidate.reset,
                    (None, Some(_)) => false,
                    (Some(_), None) => true,
                    (Some(_), Some(_)) => {
                        current.remaining > candidate.remaining
                            || (current.remaining == candidate.remaining
                                && current.reset < candidate.reset)
                    }
                };
                Some(if replace { candidate } else { current })
            }
        };
    }
    best
}

/// Signed number of seconds from `now` until `instant`.
fn secs_until(instant: Instant, now: Instant) -> f64 {
    if instant >= now {
        (instant - now).as_secs_f64()
    } else {
        -(now - instant).as_secs_f64()
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitTracker {
    policies: Vec<Policy>,
    limit: u32,
    remaining: u32,
    reset: Instant,
    window: f64,
    status: RateLimitStatus,
}

impl RateLimitTracker {
    pub fn new(policies: &[RateLimitPolicyConfig]) -> Self {
        Self::new_at(policies, Instant::now())
    }

    pub fn new_at(policies: &[RateLimitPolicyConfig], now: Instant) -> Self {
        let mut policies = policies
            .iter()
            .map(|config| Policy::new(config, now))
            .collect::<Vec<_>>();
        if policies.is_empty() {
            policies.push(Policy::new(
                &RateLimitPolicyConfig {
                    window_secs: 60.0,
                    quota: 60,
                },
                now,
            ));
        }

        let mut tracker = Self {
            policies,
            limit: 0,
            remaining: 0,
            reset: now,
            window: 0.0,
            status: RateLimitStatus::default(),
        };
        tracker.adopt_governing(now);
        tracker
    }

    fn adopt_governing(&mut self, now: Instant) {
        if let Some(state) = governing_state(&self.policies, now) {
            self.limit = state.limit;
            self.remaining = state.remaining;
            self.reset = state.reset;
            self.window = state.window;
        }
    }

    pub fn status(&self) -> &RateLimitStatus {
        &self.status
    }

    pub fn clear_status(&mut self) {
        self.status = RateLimitStatus::default();
    }

    pub fn record_sleep(&mut self, sleep: Duration) {
        self.status.total_ratelimit_sleeptime += sleep.as_secs_f64();
    }

    /// Folds one answered request into the simulation, then applies server feedback.
    pub fn update(&mut self, status_code: u16, ratelimit: Option<&str>, retry_after: Option<&str>) {
        self.update_at(status_code, ratelimit, retry_after, Instant::now());
    }

    pub fn update_at(
        &mut self,
        status_code: u16,
        ratelimit: Option<&str>,
        retry_after: Option<&str>,
        now: Instant,
    ) {
        for policy in &mut self.policies {
            policy.update(now);
        }
        self.status.count += 1;
        self.adopt_governing(now);

        if let Some(header) = ratelimit {
            self.status.uses_ratelimit_header = true;
            for part in header.split(',') {
                let Some((key, value)) = part.trim().split_once('=') else {
                    continue;
                };
                let Some(value) = parse_numeric(value) else {
                    continue;
                };
                match key {
                    "limit" => self.limit = clamp_u32(value).max(1),
                    "remaining" => self.remaining = clamp_u32(value),
                    "reset" => self.reset = reset_after(now, value),
                    _ => {}
                }
            }
        } else if status_code == 429 {
            self.status.used_429 = true;
            self.remaining = 0;
            if let Some(seconds) = retry_after.and_then(parse_numeric) {
                self.status.used_retry_header = true;
                self.reset = reset_after(now, seconds);
            }
        }

        if self.remaining == 0 && secs_until(self.reset, now) > MAX_RESET_HORIZON.as_secs_f64() {
            self.reset = now + MAX_RESET_HORIZON;
        }
    }

    /// Seconds the next request is expected to have to wait, 0 when no throttling is expected.
    pub fn predicted_sleep(&self) -> f64 {
        self.predicted_sleep_at(Instant::now()).unwrap_or(0.0)
    }

    pub fn predicted_sleep_at(&self, now: Instant) -> Option<f64> {
        let until_reset = secs_until(self.reset, now);
        if until_reset <= 0.0 {
            return None;
        }
        let sleep = if self.remaining == 0 {
            until_reset + RESET_MARGIN_SECS
        } else {
            let limit = f64::from(self.limit);
            let flat = (self.window - until_reset) * (limit / self.window);
            let spent = limit - f64::from(self.remaining);
            let ratio = if flat > 0.0 { spent / flat } else { f64::INFINITY };
            if ratio <= BURST_RATIO || spent <= limit / 5.0 {
                return None;
            }
            until_reset / (f64::from(self.remaining) - 0.5)
        };
        Some(sleep.min(MAX_RESET_HORIZON.as_secs_f64() + RESET_MARGIN_SECS))
    }

    /// Mean latency per request if the rest of the current window were used up evenly.
    pub fn projected_window_latency(&self) -> f64 {
        self.projected_window_latency_at(Instant::now())
    }

    pub fn projected_window_latency_at(&self, now: Instant) -> f64 {
        let limit = f64::from(self.limit.max(1));
        let remaining_window = secs_until(self.reset, now);
        if remaining_window <= 0.0 {
            return self.window / limit;
        }
        if self.remaining == 0 {
            return remaining_window + self.window / limit;
        }
        remaining_window / f64::from(self.remaining)
    }
}

/// `seconds` from `now` as announced by the node, or the horizon when that is beyond what an
/// `Instant` can hold.
fn reset_after(now: Instant, seconds: u64) -> Instant {
    now.checked_add(Duration::from_secs(seconds))
        .unwrap_or(now + MAX_RESET_HORIZON)
}

fn parse_numeric(value: &str) -> Option<u64> {
    let value = value.trim();
    if value.is_empty() || !value.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    value.parse().ok()
}

fn clamp_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}
