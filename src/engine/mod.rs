//! Evaluation engine: feeds items through a bounded pool of workers.
//!
//! The engine pulls items lazily from the input, skips any whose result is
//! already in the store, and hands the rest to worker tasks. At most
//! `max_concurrency` items are in flight at once; every submission, retries
//! included, goes through the shared [`RequestThrottle`]. Each item's outcome
//! is appended to the store as soon as it is terminal, so an interrupted run
//! can be resumed by running again against the same store.

mod worker;

use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::input::InputError;
use crate::model::{
    FailureKind, Item, ItemError, ItemId, Outcome, RequestParameters, ResultRecord, RunId, Summary,
};
use crate::retry::RetryPolicy;
use crate::store::ResultStore;
use crate::submit::Submitter;
use crate::telemetry::metrics;
use crate::throttle::RequestThrottle;

use worker::{ItemOutcome, Worker};

/// How a cancellation treats work already in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelMode {
    /// Stop admitting items; let in-flight items finish and record.
    Drain,
    /// Stop admitting items and abandon in-flight ones without recording.
    Abort,
}

/// Cancels a run from outside, e.g. a signal handler.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    stop: CancellationToken,
    abort: CancellationToken,
}

impl CancelHandle {
    pub fn cancel(&self, mode: CancelMode) {
        self.stop.cancel();
        if mode == CancelMode::Abort {
            self.abort.cancel();
        }
    }
}

pub struct EvaluationEngine<S> {
    submitter: Arc<S>,
    store: Arc<dyn ResultStore>,
    throttle: Arc<RequestThrottle>,
    policy: RetryPolicy,
    params: RequestParameters,
    run_id: RunId,
    stop: CancellationToken,
    abort: CancellationToken,
}

impl<S: Submitter> EvaluationEngine<S> {
    /// An engine with default throttle, retry and request settings.
    pub fn new(submitter: S, store: Arc<dyn ResultStore>) -> Self {
        Self::from_config(&EngineConfig::default(), submitter, store)
    }

    pub fn from_config(config: &EngineConfig, submitter: S, store: Arc<dyn ResultStore>) -> Self {
        Self {
            submitter: Arc::new(submitter),
            store,
            throttle: Arc::new(config.throttle()),
            policy: config.retry_policy(),
            params: config.request_parameters(),
            run_id: RunId::new(),
            stop: CancellationToken::new(),
            abort: CancellationToken::new(),
        }
    }

    pub fn with_throttle(mut self, throttle: RequestThrottle) -> Self {
        self.throttle = Arc::new(throttle);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_request_parameters(mut self, params: RequestParameters) -> Self {
        self.params = params;
        self
    }

    /// Stamped on every record this engine writes.
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// A handle that cancels this engine's runs. A cancelled engine stays
    /// cancelled; later runs admit nothing.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            stop: self.stop.clone(),
            abort: self.abort.clone(),
        }
    }

    /// Evaluate every item not already recorded in the store.
    ///
    /// Items are pulled one at a time, only when a worker slot is free.
    /// Items that fail to parse are recorded as `invalid_input` failures under
    /// a synthetic `input-error-<position>` id and never submitted.
    ///
    /// # Errors
    ///
    /// A store failure or an unreadable input is fatal: admission stops,
    /// in-flight items are abandoned, and the error is returned. Item
    /// failures are not errors; they are recorded and reported in the
    /// [`Summary`].
    pub async fn run<I>(&self, items: I, max_concurrency: usize) -> Result<Summary>
    where
        I: IntoIterator<Item = std::result::Result<Item, InputError>>,
    {
        if max_concurrency == 0 {
            return Err(Error::Config("max_concurrency must be at least 1".to_string()));
        }

        let recorded = on_store(&self.store, |store| store.existing_identifiers()).await?;
        info!(
            run_id = %self.run_id,
            already_recorded = recorded.len(),
            max_concurrency,
            rate_limit = self.throttle.limit(),
            window_secs = self.throttle.period().as_secs_f64(),
            "run started"
        );

        // Per-run token so a fatal store error aborts this run's workers
        // without cancelling the engine.
        let abort = self.abort.child_token();
        let worker = Arc::new(Worker {
            submitter: Arc::clone(&self.submitter),
            store: Arc::clone(&self.store),
            throttle: Arc::clone(&self.throttle),
            policy: self.policy.clone(),
            params: self.params.clone(),
            run_id: self.run_id,
            abort: abort.clone(),
        });

        let slots = Arc::new(Semaphore::new(max_concurrency));
        let mut workers: JoinSet<Result<ItemOutcome>> = JoinSet::new();
        let mut admitted: HashSet<ItemId> = HashSet::new();
        let mut summary = Summary::default();
        let mut fatal: Option<Error> = None;
        let mut items = items.into_iter().enumerate();

        'admit: loop {
            while let Some(joined) = workers.try_join_next() {
                settle(joined, &mut summary, &mut fatal, &abort);
            }
            if fatal.is_some() {
                break;
            }

            let permit = tokio::select! {
                biased;
                _ = self.stop.cancelled() => {
                    summary.cancelled = true;
                    info!("cancellation requested, no further items admitted");
                    break 'admit;
                }
                permit = Arc::clone(&slots).acquire_owned() => permit
                    .map_err(|_| Error::Other("worker slots closed".to_string()))?,
            };

            let item = loop {
                let Some((position, next)) = items.next() else {
                    break 'admit;
                };
                match next {
                    Ok(item) => {
                        if recorded.contains(&item.id) || !admitted.insert(item.id.clone()) {
                            debug!(item_id = %item.id, "already recorded, skipping");
                            summary.skipped += 1;
                            metrics::items_skipped().add(1, &[]);
                            continue;
                        }
                        break item;
                    }
                    Err(err) if err.is_fatal() => {
                        fatal = Some(Error::Input(err.to_string()));
                        break 'admit;
                    }
                    Err(err) => {
                        let id = ItemId::synthetic(position);
                        if recorded.contains(&id) || !admitted.insert(id.clone()) {
                            summary.skipped += 1;
                            metrics::items_skipped().add(1, &[]);
                            continue;
                        }
                        warn!(item_id = %id, error = %err, "malformed input item");
                        if let Err(e) = self.record_invalid(id.clone(), &err).await {
                            fatal = Some(e);
                            break 'admit;
                        }
                        summary.failed += 1;
                        metrics::items_failed()
                            .add(1, &[metrics::error_type(FailureKind::InvalidInput)]);
                        summary.errors.push(ItemError {
                            id,
                            kind: FailureKind::InvalidInput,
                            message: err.to_string(),
                        });
                    }
                }
            };

            workers.spawn(Arc::clone(&worker).evaluate(item, permit));
        }

        if fatal.is_some() {
            abort.cancel();
        }
        while let Some(joined) = workers.join_next().await {
            settle(joined, &mut summary, &mut fatal, &abort);
        }
        if summary.aborted > 0 {
            summary.cancelled = true;
        }

        if let Some(err) = fatal {
            error!(run_id = %self.run_id, error = %err, "run stopped by a fatal error");
            return Err(err);
        }

        info!(
            run_id = %self.run_id,
            completed = summary.completed,
            failed = summary.failed,
            skipped = summary.skipped,
            aborted = summary.aborted,
            cancelled = summary.cancelled,
            "run finished"
        );
        Ok(summary)
    }

    async fn record_invalid(&self, id: ItemId, err: &InputError) -> Result<()> {
        let record = ResultRecord {
            run_id: self.run_id,
            id,
            input: serde_json::Value::Null,
            prompt: None,
            outcome: Outcome::Failure {
                kind: FailureKind::InvalidInput,
                error: err.to_string(),
            },
            attempts: Vec::new(),
            recorded_at: chrono::Utc::now(),
        };
        on_store(&self.store, move |store| store.append(&record)).await
    }
}

/// Run a store call on the blocking pool. Appends sync to disk and keep
/// runtime threads free for throttle waits and in-flight requests.
async fn on_store<T, F>(store: &Arc<dyn ResultStore>, call: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn ResultStore) -> Result<T> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || call(store.as_ref())).await?
}

/// Fold one finished worker into the summary. The first error wins and
/// aborts the rest of the run.
fn settle(
    joined: std::result::Result<Result<ItemOutcome>, tokio::task::JoinError>,
    summary: &mut Summary,
    fatal: &mut Option<Error>,
    abort: &CancellationToken,
) {
    match joined {
        Ok(Ok(ItemOutcome::Completed)) => {
            summary.completed += 1;
            metrics::items_completed().add(1, &[]);
        }
        Ok(Ok(ItemOutcome::Failed(err))) => {
            summary.failed += 1;
            metrics::items_failed().add(1, &[metrics::error_type(err.kind)]);
            summary.errors.push(err);
        }
        Ok(Ok(ItemOutcome::Aborted)) => summary.aborted += 1,
        Ok(Err(err)) => {
            if fatal.is_none() {
                abort.cancel();
                *fatal = Some(err);
            }
        }
        Err(join_err) => {
            if fatal.is_none() {
                abort.cancel();
                *fatal = Some(Error::Task(join_err));
            }
        }
    }
}
