//! Fleet-wide execution of business calls.

use std::{sync::Arc, time::Duration};

use log::{trace, warn};
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    endpoint::{EndpointClient, RetryBudget},
    errors::RequestError,
    events::{CallContext, EventHandler, StallEvent},
    selector::{rank, NodeSelector, ScoreInput},
    service::sleep_unless_aborted,
    transport::Transport,
};

const ATTEMPTS_PER_NODE: u32 = 2;
const PAUSE_PER_NODE: Duration = Duration::from_millis(200);
const DEFAULT_STALL_PAUSE: Duration = Duration::from_secs(15);

/// Runs one logical call against the best node that will answer it.
///
/// A call never fails: every full sweep over the fleet that doesn't produce an answer is reported
/// as a stall, and the sweep starts over after a pause. Only an abort ends it without a result.
#[derive(Debug)]
pub struct Dispatcher<T, H> {
    clients: Vec<Arc<EndpointClient<T>>>,
    selector: Arc<dyn NodeSelector>,
    handler: Arc<H>,
    abort: CancellationToken,
    stall_pause: Duration,
}

impl<T, H> Dispatcher<T, H>
where
    T: Transport,
    H: EventHandler,
{
    pub fn new(
        clients: Vec<Arc<EndpointClient<T>>>,
        selector: Arc<dyn NodeSelector>,
        handler: Arc<H>,
        abort: CancellationToken,
    ) -> Self {
        Self {
            clients,
            selector,
            handler,
            abort,
            stall_pause: DEFAULT_STALL_PAUSE,
        }
    }

    pub fn with_stall_pause(mut self, stall_pause: Duration) -> Self {
        self.stall_pause = stall_pause;
        self
    }

    /// Candidate nodes for `api` in the order they should be tried, disqualified ones left out.
    pub fn candidates(
        &self,
        api: &str,
        method: &str,
        context: &CallContext,
    ) -> Vec<Arc<EndpointClient<T>>> {
        let scored = self
            .clients
            .iter()
            .filter(|client| !client.is_aborted())
            .filter_map(|client| {
                let quality = client.get_api_quality(api);
                if quality.latency.is_infinite() {
                    return None;
                }
                let score = self.selector.score(&ScoreInput {
                    error_rate: quality.error_rate,
                    recent_latency: quality.latency,
                    predicted_ratelimit_sleep: client.predicted_sleep(),
                    projected_ratelimit_window_latency: client
                        .get_projected_ratelimit_window_latency(),
                    blocks_behind: context.blocks_behind,
                    api,
                    method,
                    is_block_source: context.block_source.as_deref() == Some(client.uri()),
                });
                Some((score, Arc::clone(client)))
            })
            .collect::<Vec<_>>();

        rank(scored)
            .into_iter()
            .filter(|(score, _)| *score != f64::INFINITY)
            .map(|(_, client)| client)
            .collect()
    }

    /// Calls `api.method` with `params`, returning `None` only once aborted.
    pub async fn call(
        &self,
        api: &str,
        method: &str,
        params: Value,
        context: &CallContext,
    ) -> Option<Value> {
        let full_method = format!("{}.{}", api, method);
        let started = Instant::now();
        let mut stall_count = 0;

        while !self.abort.is_cancelled() {
            stall_count += 1;
            let mut tried_nodes = Vec::new();
            let mut errors = Vec::new();
            let mut no_responses = Vec::new();

            for client in self.candidates(api, method, context) {
                if self.abort.is_cancelled() {
                    return None;
                }
                tried_nodes.push(client.uri().to_string());
                match client
                    .retried_request(
                        &full_method,
                        params.clone(),
                        RetryBudget::bounded(ATTEMPTS_PER_NODE, PAUSE_PER_NODE),
                    )
                    .await
                {
                    Ok(result) => return Some(result),
                    Err(err @ RequestError::Rpc { .. }) => {
                        trace!("{} rejected {}: {}", client.uri(), full_method, err);
                        errors.push(err);
                    }
                    Err(err @ RequestError::NoResponse { .. }) => {
                        trace!("{} did not answer {}: {}", client.uri(), full_method, err);
                        no_responses.push(err);
                    }
                }
            }

            if self.abort.is_cancelled() {
                return None;
            }

            let event = StallEvent {
                block_source_node: context.block_source.clone(),
                tried_nodes,
                api: api.to_string(),
                method: method.to_string(),
                blocks_behind: context.blocks_behind,
                stall_count,
                stall_time: started.elapsed(),
                errors,
                no_responses,
            };
            warn!(
                "Stall #{} on {}: no answer from {} node(s) after {:?}",
                stall_count,
                full_method,
                event.tried_nodes.len(),
                event.stall_time
            );
            self.handler.on_stall(&event).await;

            if !sleep_unless_aborted(&self.abort, self.stall_pause).await {
                break;
            }
        }

        None
    }
}
