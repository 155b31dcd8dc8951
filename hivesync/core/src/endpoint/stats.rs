use std::{collections::BTreeMap, time::Duration};

use serde::Serialize;

use crate::{errors::TransportError, stats::Ewma};

/// Failures of one JSON-RPC method on one node since the last status report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MethodErrorStats {
    pub http_errors: u64,
    pub tls_errors: u64,
    /// HTTP status code histogram, successful answers included.
    pub status_codes: BTreeMap<u16, u64>,
}

#[derive(Debug, Clone)]
pub(crate) struct EndpointStats {
    pub latency: Ewma,
    pub error_rate: Ewma,
    pub requests: u64,
    pub errors: u64,
    pub blocks: u64,
    pub block_ranges: u64,
    pub calls: BTreeMap<String, u64>,
    pub detailed_errors: BTreeMap<String, MethodErrorStats>,
}

impl EndpointStats {
    pub fn new(decay: f64) -> Self {
        Self {
            latency: Ewma::new(decay),
            error_rate: Ewma::new(decay),
            requests: 0,
            errors: 0,
            blocks: 0,
            block_ranges: 0,
            calls: BTreeMap::new(),
            detailed_errors: BTreeMap::new(),
        }
    }

    pub fn record_call(&mut self, method: &str) {
        *self.calls.entry(method.to_string()).or_default() += 1;
        self.detailed_errors.entry(method.to_string()).or_default();
    }

    pub fn record_success(&mut self) {
        self.error_rate.record(0.0);
    }

    pub fn record_failure(&mut self) {
        self.error_rate.record(1.0);
        self.errors += 1;
    }

    pub fn record_transport_failure(&mut self, method: &str, error: &TransportError) {
        self.record_failure();
        let detail = self.detailed_errors.entry(method.to_string()).or_default();
        match error {
            TransportError::Tls(_) => detail.tls_errors += 1,
            TransportError::Http(_) | TransportError::Timeout => detail.http_errors += 1,
        }
    }

    pub fn record_answer(&mut self, method: &str, status: u16, elapsed: Duration) {
        *self
            .detailed_errors
            .entry(method.to_string())
            .or_default()
            .status_codes
            .entry(status)
            .or_default() += 1;
        self.latency.record(elapsed.as_secs_f64());
    }

    /// Clears the interval counters. The averages carry over.
    pub fn reset_counters(&mut self) {
        self.requests = 0;
        self.errors = 0;
        self.blocks = 0;
        self.block_ranges = 0;
        self.calls.clear();
        self.detailed_errors.clear();
    }
}
