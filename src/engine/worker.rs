//! Per-item lifecycle: throttle, submit, back off, retry, record.

use opentelemetry::KeyValue;
use std::sync::Arc;
use tokio::sync::OwnedSemaphorePermit;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, warn};

use crate::error::Result;
use crate::model::{
    Attempt, AttemptOutcome, Item, ItemError, Outcome, Prompt, RequestParameters, ResultRecord,
    RunId, SubmitError,
};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::store::ResultStore;
use crate::submit::Submitter;
use crate::telemetry::item::{record_attempt, record_outcome, start_item_span};
use crate::telemetry::metrics;
use crate::throttle::RequestThrottle;

use super::on_store;

/// How an item's task ended.
#[derive(Debug)]
pub(crate) enum ItemOutcome {
    Completed,
    Failed(ItemError),
    /// Abandoned by an aborting cancellation. Nothing was written.
    Aborted,
}

/// Everything a worker task needs. Shared by all tasks of one run.
pub(crate) struct Worker<S> {
    pub submitter: Arc<S>,
    pub store: Arc<dyn ResultStore>,
    pub throttle: Arc<RequestThrottle>,
    pub policy: RetryPolicy,
    pub params: RequestParameters,
    pub run_id: RunId,
    pub abort: CancellationToken,
}

impl<S: Submitter> Worker<S> {
    /// Drive one item to a terminal result. The concurrency permit is held
    /// for the whole lifecycle, retries and backoff included.
    pub async fn evaluate(
        self: Arc<Self>,
        item: Item,
        _permit: OwnedSemaphorePermit,
    ) -> Result<ItemOutcome> {
        let span = start_item_span(&self.run_id, &item.id);
        self.finish(item).instrument(span).await
    }

    async fn finish(&self, item: Item) -> Result<ItemOutcome> {
        let Some((outcome, attempts)) = self.attempt_until_terminal(&item.prompt).await else {
            debug!("aborted before a result was recorded");
            record_outcome(&tracing::Span::current(), "aborted");
            return Ok(ItemOutcome::Aborted);
        };

        let failure = match &outcome {
            Outcome::Success { .. } => None,
            Outcome::Failure { kind, error } => Some(ItemError {
                id: item.id.clone(),
                kind: *kind,
                message: error.clone(),
            }),
        };

        let attempt_count = attempts.len();
        let record = ResultRecord {
            run_id: self.run_id,
            id: item.id,
            input: item.input,
            prompt: Some(item.prompt),
            outcome,
            attempts,
            recorded_at: chrono::Utc::now(),
        };
        on_store(&self.store, move |store| store.append(&record)).await?;

        match failure {
            None => {
                record_outcome(&tracing::Span::current(), "success");
                debug!(attempts = attempt_count, "result recorded");
                Ok(ItemOutcome::Completed)
            }
            Some(err) => {
                record_outcome(&tracing::Span::current(), "failure");
                warn!(kind = %err.kind, error = %err.message, "item failed permanently");
                Ok(ItemOutcome::Failed(err))
            }
        }
    }

    /// Submit until success or a stop decision. Returns None if aborted.
    async fn attempt_until_terminal(&self, prompt: &Prompt) -> Option<(Outcome, Vec<Attempt>)> {
        let span = tracing::Span::current();
        let mut attempts = Vec::new();
        let mut number = 1;

        loop {
            tokio::select! {
                biased;
                _ = self.abort.cancelled() => return None,
                _ = self.throttle.acquire() => {}
            }

            let started = Instant::now();
            let result = tokio::select! {
                biased;
                _ = self.abort.cancelled() => return None,
                result = self.submit_once(prompt) => result,
            };
            let elapsed = started.elapsed();
            let latency_ms = elapsed.as_millis() as u64;
            metrics::attempt_duration_ms().record(elapsed.as_secs_f64() * 1000.0, &[]);

            match result {
                Ok(response) => {
                    let attempt = Attempt {
                        number,
                        outcome: AttemptOutcome::Success,
                        latency_ms,
                    };
                    record_attempt(&span, number, &attempt.outcome, latency_ms);
                    metrics::attempts().add(1, &[KeyValue::new("result", "success")]);
                    attempts.push(attempt);
                    return Some((Outcome::Success { response }, attempts));
                }
                Err(err) => {
                    let attempt = Attempt {
                        number,
                        outcome: AttemptOutcome::Failure {
                            kind: err.kind,
                            error: err.message.clone(),
                        },
                        latency_ms,
                    };
                    record_attempt(&span, number, &attempt.outcome, latency_ms);
                    metrics::attempts().add(1, &[KeyValue::new("result", err.kind.to_string())]);
                    attempts.push(attempt);

                    match self.policy.decide(number, err.kind) {
                        RetryDecision::Retry(delay) => {
                            debug!(
                                attempt = number,
                                delay_ms = delay.as_millis() as u64,
                                "backing off before retry"
                            );
                            tokio::select! {
                                biased;
                                _ = self.abort.cancelled() => return None,
                                _ = tokio::time::sleep(delay) => {}
                            }
                            number += 1;
                        }
                        RetryDecision::Stop => {
                            return Some((
                                Outcome::Failure {
                                    kind: err.kind,
                                    error: err.message,
                                },
                                attempts,
                            ));
                        }
                    }
                }
            }
        }
    }

    /// One call to the submitter, bounded by the request timeout if set.
    async fn submit_once(
        &self,
        prompt: &Prompt,
    ) -> std::result::Result<serde_json::Value, SubmitError> {
        let call = self.submitter.submit(prompt, &self.params);
        match self.params.timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => Err(SubmitError::transient(format!(
                    "request timed out after {:.1}s",
                    limit.as_secs_f64()
                ))),
            },
            None => call.await,
        }
    }
}
