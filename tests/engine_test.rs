//! Integration tests for the evaluation engine.
//!
//! All timing tests run on tokio's paused clock, so throttle windows and
//! backoff delays are exact and cost no wall time.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use evalq::engine::{CancelHandle, CancelMode, EvaluationEngine};
use evalq::error::Error;
use evalq::input::{InputError, JsonlItems};
use evalq::model::*;
use evalq::retry::RetryPolicy;
use evalq::store::{MemoryStore, ResultStore};
use evalq::submit::Submitter;
use evalq::throttle::RequestThrottle;
use serde_json::{Value, json};
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// Scripted submitter
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeState {
    latency: Duration,
    /// Failures to return, in order, before an item succeeds. Keyed by prompt.
    scripts: Mutex<HashMap<String, VecDeque<SubmitError>>>,
    calls: Mutex<Vec<(String, Instant)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    /// Cancel the run when this many calls have started.
    cancel_at: Mutex<Option<(usize, CancelMode, CancelHandle)>>,
}

#[derive(Clone, Default)]
struct FakeSubmitter {
    state: Arc<FakeState>,
}

impl FakeSubmitter {
    fn with_latency(latency: Duration) -> Self {
        Self {
            state: Arc::new(FakeState {
                latency,
                ..FakeState::default()
            }),
        }
    }

    fn fail(&self, prompt: &str, failures: Vec<SubmitError>) -> &Self {
        self.state
            .scripts
            .lock()
            .unwrap()
            .insert(prompt.to_string(), failures.into());
        self
    }

    fn cancel_at(&self, calls: usize, mode: CancelMode, handle: CancelHandle) {
        *self.state.cancel_at.lock().unwrap() = Some((calls, mode, handle));
    }

    fn calls(&self) -> Vec<(String, Instant)> {
        self.state.calls.lock().unwrap().clone()
    }

    fn call_times(&self, prompt: &str) -> Vec<Instant> {
        self.calls()
            .into_iter()
            .filter(|(p, _)| p == prompt)
            .map(|(_, at)| at)
            .collect()
    }

    fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }
}

impl Submitter for FakeSubmitter {
    async fn submit(
        &self,
        prompt: &Prompt,
        _params: &RequestParameters,
    ) -> Result<Value, SubmitError> {
        let key = match prompt {
            Prompt::Text(text) => text.clone(),
            Prompt::Messages(messages) => messages
                .last()
                .map(|m| m.content.clone())
                .unwrap_or_default(),
        };

        let started = {
            let mut calls = self.state.calls.lock().unwrap();
            calls.push((key.clone(), Instant::now()));
            calls.len()
        };
        let trigger = {
            let mut cancel_at = self.state.cancel_at.lock().unwrap();
            match cancel_at.as_ref() {
                Some((at, _, _)) if *at == started => cancel_at.take(),
                _ => None,
            }
        };
        if let Some((_, mode, handle)) = trigger {
            handle.cancel(mode);
        }

        let now = self.state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.state.latency).await;
        self.state.in_flight.fetch_sub(1, Ordering::SeqCst);

        let failure = self
            .state
            .scripts
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(|script| script.pop_front());
        match failure {
            Some(err) => Err(err),
            None => Ok(json!({ "text": format!("answer to {key}") })),
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Items whose prompt text equals their id.
fn items(ids: &[&str]) -> Vec<Result<Item, InputError>> {
    ids.iter().map(|id| Ok(Item::new(*id, *id))).collect()
}

fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        backoff_base: Duration::from_millis(100),
        backoff_cap: Duration::from_millis(400),
        rate_limit_base: Duration::from_secs(2),
    }
}

fn engine(submitter: &FakeSubmitter, store: &Arc<MemoryStore>) -> EvaluationEngine<FakeSubmitter> {
    let store: Arc<dyn ResultStore> = store.clone();
    EvaluationEngine::new(submitter.clone(), store)
        .with_throttle(RequestThrottle::new(1_000, Duration::from_secs(1)))
        .with_retry_policy(fast_policy(5))
}

fn recorded(store: &MemoryStore, id: &str) -> ResultRecord {
    store
        .records()
        .unwrap()
        .into_iter()
        .find(|r| r.id.as_str() == id)
        .unwrap_or_else(|| panic!("no record for {id}"))
}

fn prior_record(id: &str, success: bool) -> ResultRecord {
    ResultRecord {
        run_id: RunId::new(),
        id: ItemId::new(id),
        input: Value::Null,
        prompt: Some(Prompt::from(id)),
        outcome: if success {
            Outcome::Success {
                response: json!({"text": "earlier"}),
            }
        } else {
            Outcome::Failure {
                kind: FailureKind::Rejected,
                error: "earlier failure".to_string(),
            }
        },
        attempts: Vec::new(),
        recorded_at: chrono::Utc::now(),
    }
}

// ---------------------------------------------------------------------------
// Basic runs and resume
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn every_item_is_evaluated_and_recorded() {
    let submitter = FakeSubmitter::with_latency(Duration::from_millis(50));
    let store = Arc::new(MemoryStore::new());

    let summary = engine(&submitter, &store)
        .run(items(&["a", "b", "c", "d", "e"]), 2)
        .await
        .unwrap();

    assert_eq!(summary.completed, 5);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.skipped, 0);
    assert!(!summary.cancelled);
    assert_eq!(store.len(), 5);

    let record = recorded(&store, "c");
    assert_eq!(record.prompt, Some(Prompt::from("c")));
    assert_eq!(record.attempts.len(), 1);
    assert_eq!(
        record.outcome,
        Outcome::Success {
            response: json!({"text": "answer to c"})
        }
    );
}

#[tokio::test(start_paused = true)]
async fn recorded_items_are_skipped_on_resume() {
    let submitter = FakeSubmitter::with_latency(Duration::from_millis(10));
    let store = Arc::new(MemoryStore::with_records(vec![
        prior_record("a", true),
        prior_record("b", false),
    ]));

    let summary = engine(&submitter, &store)
        .run(items(&["a", "b", "c", "d", "e"]), 4)
        .await
        .unwrap();

    assert_eq!(summary.skipped, 2);
    assert_eq!(summary.completed, 3);
    let mut called: Vec<String> = submitter.calls().into_iter().map(|(p, _)| p).collect();
    called.sort();
    assert_eq!(called, vec!["c", "d", "e"]);
    assert_eq!(store.len(), 5);
}

#[tokio::test(start_paused = true)]
async fn rerun_over_a_complete_store_submits_nothing() {
    let submitter = FakeSubmitter::with_latency(Duration::from_millis(10));
    let store = Arc::new(MemoryStore::new());
    let ids = ["a", "b", "c"];

    engine(&submitter, &store).run(items(&ids), 2).await.unwrap();
    let first = store.records().unwrap();

    let again = FakeSubmitter::default();
    let summary = engine(&again, &store).run(items(&ids), 2).await.unwrap();

    assert_eq!(summary.skipped, 3);
    assert_eq!(summary.processed(), 0);
    assert!(again.calls().is_empty());
    assert_eq!(store.records().unwrap(), first);
}

#[tokio::test(start_paused = true)]
async fn duplicate_ids_within_a_run_are_evaluated_once() {
    let submitter = FakeSubmitter::default();
    let store = Arc::new(MemoryStore::new());

    let summary = engine(&submitter, &store)
        .run(items(&["a", "b", "a"]), 2)
        .await
        .unwrap();

    assert_eq!(summary.completed, 2);
    assert_eq!(summary.skipped, 1);
    assert_eq!(submitter.calls().len(), 2);
    assert_eq!(store.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn counts_add_up_across_mixed_outcomes() {
    let submitter = FakeSubmitter::with_latency(Duration::from_millis(5));
    submitter.fail("bad", vec![SubmitError::rejected("400 invalid request")]);
    let store = Arc::new(MemoryStore::with_records(vec![prior_record("old", true)]));

    let mut input = items(&["old", "a", "bad", "b", "a"]);
    input.push(Err(InputError::malformed("line 6: expected value")));

    let summary = engine(&submitter, &store).run(input, 3).await.unwrap();

    let pulled = 6;
    assert_eq!(summary.completed, 2);
    assert_eq!(summary.failed, 2);
    assert_eq!(summary.skipped, 2);
    assert_eq!(summary.completed + summary.failed, pulled - summary.skipped);
    assert_eq!(summary.errors.len(), 2);
}

#[tokio::test]
async fn zero_concurrency_is_rejected() {
    let submitter = FakeSubmitter::default();
    let store = Arc::new(MemoryStore::new());
    let result = engine(&submitter, &store).run(items(&["a"]), 0).await;
    assert!(matches!(result, Err(Error::Config(_))));
    assert!(store.is_empty());
}

// ---------------------------------------------------------------------------
// Concurrency and rate limiting
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn concurrency_never_exceeds_the_limit() {
    let submitter = FakeSubmitter::with_latency(Duration::from_millis(100));
    let store = Arc::new(MemoryStore::new());
    let ids: Vec<String> = (0..20).map(|i| format!("item-{i}")).collect();
    let ids: Vec<&str> = ids.iter().map(String::as_str).collect();

    let summary = engine(&submitter, &store).run(items(&ids), 3).await.unwrap();

    assert_eq!(summary.completed, 20);
    assert_eq!(submitter.max_in_flight(), 3);
}

#[tokio::test(start_paused = true)]
async fn no_window_admits_more_than_the_rate_limit() {
    let submitter = FakeSubmitter::with_latency(Duration::from_millis(10));
    let store = Arc::new(MemoryStore::new());
    let ids: Vec<String> = (0..10).map(|i| format!("item-{i}")).collect();
    let ids: Vec<&str> = ids.iter().map(String::as_str).collect();

    let summary = engine(&submitter, &store)
        .with_throttle(RequestThrottle::new(3, Duration::from_secs(1)))
        .run(items(&ids), 10)
        .await
        .unwrap();
    assert_eq!(summary.completed, 10);

    let mut times: Vec<Instant> = submitter.calls().into_iter().map(|(_, at)| at).collect();
    times.sort();
    for pair in times.windows(4) {
        assert!(
            pair[3] - pair[0] >= Duration::from_secs(1),
            "four requests within one window: {:?}",
            pair[3] - pair[0]
        );
    }
}

#[tokio::test(start_paused = true)]
async fn five_items_at_three_per_second_take_at_least_a_second() {
    let submitter = FakeSubmitter::with_latency(Duration::from_millis(10));
    let store = Arc::new(MemoryStore::new());
    let started = Instant::now();

    let summary = engine(&submitter, &store)
        .with_throttle(RequestThrottle::new(3, Duration::from_secs(1)))
        .run(items(&["a", "b", "c", "d", "e"]), 2)
        .await
        .unwrap();

    assert_eq!(summary.completed, 5);
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert_eq!(store.len(), 5);

    let mut times: Vec<Instant> = submitter.calls().into_iter().map(|(_, at)| at).collect();
    times.sort();
    assert_eq!(times.len(), 5);
    assert!(times[2] - times[0] < Duration::from_secs(1));
    assert!(times[3] - times[0] >= Duration::from_secs(1), "{:?}", times[3] - times[0]);
    assert!(times[4] - times[0] >= Duration::from_secs(1), "{:?}", times[4] - times[0]);
}

#[tokio::test(start_paused = true)]
async fn input_is_pulled_only_as_slots_free_up() {
    let submitter = FakeSubmitter::with_latency(Duration::from_millis(100));
    let store = Arc::new(MemoryStore::new());
    let pulled = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&pulled);
    let seen = Arc::clone(&store);
    let input = (0usize..).map(move |n| {
        counter.fetch_add(1, Ordering::SeqCst);
        // Every earlier item is recorded, or holds the one other slot.
        assert!(n <= seen.len() + 1, "pulled item {n} with {} recorded", seen.len());
        let id = format!("item-{n}");
        Ok(Item::new(id.clone(), id.as_str()))
    });

    let run = engine(&submitter, &store);
    submitter.cancel_at(6, CancelMode::Drain, run.cancel_handle());
    let summary = run.run(input, 2).await.unwrap();

    assert!(summary.cancelled);
    assert!(summary.completed >= 6);
    let pulled = pulled.load(Ordering::SeqCst);
    assert!(
        pulled <= summary.completed + summary.skipped + 1,
        "pulled {pulled} for {summary:?}"
    );
    assert_eq!(store.len(), summary.completed);
}

#[tokio::test(start_paused = true)]
async fn retries_pass_through_the_throttle() {
    let submitter = FakeSubmitter::default();
    submitter.fail(
        "a",
        vec![SubmitError::transient("reset"), SubmitError::transient("reset")],
    );
    let store = Arc::new(MemoryStore::new());

    engine(&submitter, &store)
        .with_throttle(RequestThrottle::new(1, Duration::from_secs(1)))
        .run(items(&["a"]), 1)
        .await
        .unwrap();

    let times = submitter.call_times("a");
    assert_eq!(times.len(), 3);
    assert!(times[1] - times[0] >= Duration::from_secs(1));
    assert!(times[2] - times[1] >= Duration::from_secs(1));
}

// ---------------------------------------------------------------------------
// Retry behaviour
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried_until_success() {
    let submitter = FakeSubmitter::default();
    submitter.fail(
        "flaky",
        vec![
            SubmitError::transient("connection reset"),
            SubmitError::transient("503 unavailable"),
        ],
    );
    let store = Arc::new(MemoryStore::new());

    let summary = engine(&submitter, &store)
        .run(items(&["flaky"]), 1)
        .await
        .unwrap();

    assert_eq!(summary.completed, 1);
    let record = recorded(&store, "flaky");
    assert!(record.outcome.is_success());
    assert_eq!(record.attempts.len(), 3);
    assert_eq!(
        record.attempts[0].outcome,
        AttemptOutcome::Failure {
            kind: FailureKind::Transient,
            error: "connection reset".to_string(),
        }
    );
    assert_eq!(record.attempts[2].outcome, AttemptOutcome::Success);

    let times = submitter.call_times("flaky");
    assert!(times[1] - times[0] >= Duration::from_millis(100));
    assert!(times[2] - times[1] >= Duration::from_millis(200));
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_record_a_failure_with_bounded_delays() {
    let submitter = FakeSubmitter::default();
    submitter.fail(
        "down",
        (0..10).map(|_| SubmitError::transient("502 bad gateway")).collect(),
    );
    let store = Arc::new(MemoryStore::new());

    let summary = engine(&submitter, &store)
        .run(items(&["down"]), 1)
        .await
        .unwrap();

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.errors[0].kind, FailureKind::Transient);
    let record = recorded(&store, "down");
    assert_eq!(record.attempts.len(), 5);
    assert!(matches!(
        record.outcome,
        Outcome::Failure {
            kind: FailureKind::Transient,
            ..
        }
    ));

    let times = submitter.call_times("down");
    assert_eq!(times.len(), 5);
    let gaps: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();
    for pair in gaps.windows(2) {
        assert!(pair[1] >= pair[0], "delays shrank: {gaps:?}");
    }
    for gap in &gaps {
        assert!(*gap <= Duration::from_millis(400) + Duration::from_millis(1));
    }
}

#[tokio::test(start_paused = true)]
async fn rejected_requests_are_not_retried() {
    let submitter = FakeSubmitter::default();
    submitter.fail("nope", vec![SubmitError::rejected("400 context too long")]);
    let store = Arc::new(MemoryStore::new());

    let summary = engine(&submitter, &store)
        .run(items(&["nope"]), 1)
        .await
        .unwrap();

    assert_eq!(summary.failed, 1);
    assert_eq!(submitter.calls().len(), 1);
    assert_eq!(recorded(&store, "nope").attempts.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn rate_limited_failures_back_off_longer() {
    let submitter = FakeSubmitter::default();
    submitter.fail("busy", vec![SubmitError::rate_limited("429 Too Many Requests")]);
    let store = Arc::new(MemoryStore::new());

    engine(&submitter, &store)
        .run(items(&["busy"]), 1)
        .await
        .unwrap();

    let times = submitter.call_times("busy");
    assert_eq!(times.len(), 2);
    assert!(times[1] - times[0] >= Duration::from_secs(2));
    assert!(recorded(&store, "busy").outcome.is_success());
}

#[tokio::test(start_paused = true)]
async fn timed_out_attempts_count_as_transient() {
    let submitter = FakeSubmitter::with_latency(Duration::from_secs(5));
    let store = Arc::new(MemoryStore::new());
    let params = RequestParameters {
        timeout: Some(Duration::from_secs(1)),
        ..RequestParameters::default()
    };

    let summary = engine(&submitter, &store)
        .with_retry_policy(fast_policy(2))
        .with_request_parameters(params)
        .run(items(&["slow"]), 1)
        .await
        .unwrap();

    assert_eq!(summary.failed, 1);
    let record = recorded(&store, "slow");
    assert_eq!(record.attempts.len(), 2);
    match record.outcome {
        Outcome::Failure { kind, error } => {
            assert_eq!(kind, FailureKind::Transient);
            assert!(error.contains("timed out"), "{error}");
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Malformed input
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn malformed_input_is_recorded_under_a_synthetic_id() {
    let submitter = FakeSubmitter::default();
    let store = Arc::new(MemoryStore::new());
    let input = vec![
        Ok(Item::new("a", "a")),
        Err(InputError::malformed("line 2: missing field `prompt`")),
        Ok(Item::new("c", "c")),
    ];

    let summary = engine(&submitter, &store).run(input, 2).await.unwrap();

    assert_eq!(summary.completed, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.errors[0].id, ItemId::synthetic(1));
    assert_eq!(summary.errors[0].kind, FailureKind::InvalidInput);
    assert_eq!(submitter.calls().len(), 2);

    let record = recorded(&store, "input-error-1");
    assert!(record.attempts.is_empty());
    assert!(record.prompt.is_none());
    assert!(matches!(
        record.outcome,
        Outcome::Failure {
            kind: FailureKind::InvalidInput,
            ..
        }
    ));

    let rerun = vec![
        Ok(Item::new("a", "a")),
        Err(InputError::malformed("line 2: missing field `prompt`")),
        Ok(Item::new("c", "c")),
    ];
    let summary = engine(&submitter, &store).run(rerun, 2).await.unwrap();
    assert_eq!(summary.skipped, 3);
    assert_eq!(store.len(), 3);
}

// ---------------------------------------------------------------------------
// Cancellation and fatal errors
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn drained_run_keeps_finished_items_and_resume_completes_the_rest() {
    let ids = ["a", "b", "c", "d", "e"];
    let submitter = FakeSubmitter::with_latency(Duration::from_millis(100));
    let store = Arc::new(MemoryStore::new());

    let first = engine(&submitter, &store);
    submitter.cancel_at(3, CancelMode::Drain, first.cancel_handle());
    let summary = first.run(items(&ids), 1).await.unwrap();

    assert!(summary.cancelled);
    assert_eq!(summary.completed, 3);
    assert_eq!(summary.aborted, 0);
    assert_eq!(store.len(), 3);

    let resumed = FakeSubmitter::with_latency(Duration::from_millis(100));
    let summary = engine(&resumed, &store).run(items(&ids), 1).await.unwrap();

    assert!(!summary.cancelled);
    assert_eq!(summary.skipped, 3);
    assert_eq!(summary.completed, 2);
    let called: Vec<String> = resumed.calls().into_iter().map(|(p, _)| p).collect();
    assert_eq!(called, vec!["d", "e"]);
    assert_eq!(store.len(), 5);
}

#[tokio::test(start_paused = true)]
async fn aborted_run_records_nothing_for_in_flight_items() {
    let submitter = FakeSubmitter::with_latency(Duration::from_secs(1));
    let store = Arc::new(MemoryStore::new());

    let run = engine(&submitter, &store);
    submitter.cancel_at(1, CancelMode::Abort, run.cancel_handle());
    let summary = run.run(items(&["a", "b", "c", "d"]), 2).await.unwrap();

    assert!(summary.cancelled);
    assert!(summary.aborted >= 1);
    assert_eq!(summary.completed, 0);
    assert!(store.is_empty());
}

/// A store whose writes always fail.
struct BrokenStore;

impl ResultStore for BrokenStore {
    fn existing_identifiers(&self) -> evalq::error::Result<std::collections::HashSet<ItemId>> {
        Ok(Default::default())
    }

    fn append(&self, _record: &ResultRecord) -> evalq::error::Result<()> {
        Err(Error::Storage(std::io::Error::other("disk full")))
    }

    fn records(&self) -> evalq::error::Result<Vec<ResultRecord>> {
        Ok(Vec::new())
    }
}

#[tokio::test(start_paused = true)]
async fn unreadable_input_stops_the_run() {
    let submitter = FakeSubmitter::with_latency(Duration::from_millis(10));
    let store = Arc::new(MemoryStore::new());
    let pulled = Arc::new(AtomicUsize::new(0));

    // A broken reader fails the same way on every call.
    let counter = Arc::clone(&pulled);
    let input = (0usize..).map(move |n| {
        counter.fetch_add(1, Ordering::SeqCst);
        if n < 2 {
            Ok(Item::new(format!("item-{n}"), "question"))
        } else {
            Err(InputError::unreadable(
                "line 3: read failed: Input/output error (os error 5)",
            ))
        }
    });

    let result = engine(&submitter, &store).run(input, 4).await;

    assert!(
        matches!(result, Err(Error::Input(ref msg)) if msg.contains("read failed")),
        "{result:?}"
    );
    assert_eq!(pulled.load(Ordering::SeqCst), 3);
    let records = store.records().unwrap();
    assert!(records.iter().all(|r| !r.id.as_str().starts_with("input-error")));
}

#[tokio::test(start_paused = true)]
async fn input_path_that_cannot_be_read_fails_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let submitter = FakeSubmitter::default();
    let store = Arc::new(MemoryStore::new());

    let input = JsonlItems::open(dir.path()).unwrap();
    let result = engine(&submitter, &store).run(input, 4).await;

    assert!(matches!(result, Err(Error::Input(_))), "{result:?}");
    assert!(store.is_empty());
    assert!(submitter.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn storage_failure_stops_the_run() {
    let submitter = FakeSubmitter::with_latency(Duration::from_millis(10));
    let ids: Vec<String> = (0..50).map(|i| format!("item-{i}")).collect();
    let ids: Vec<&str> = ids.iter().map(String::as_str).collect();

    let result = EvaluationEngine::new(submitter.clone(), Arc::new(BrokenStore))
        .with_throttle(RequestThrottle::new(1_000, Duration::from_secs(1)))
        .run(items(&ids), 2)
        .await;

    assert!(matches!(result, Err(Error::Storage(_))));
    assert!(submitter.calls().len() < 50);
}

/// Holds the append for `first` until the gate opens.
struct GatedStore {
    inner: MemoryStore,
    gate: Mutex<std::sync::mpsc::Receiver<()>>,
}

impl ResultStore for GatedStore {
    fn existing_identifiers(&self) -> evalq::error::Result<std::collections::HashSet<ItemId>> {
        self.inner.existing_identifiers()
    }

    fn append(&self, record: &ResultRecord) -> evalq::error::Result<()> {
        if record.id.as_str() == "first" {
            self.gate
                .lock()
                .unwrap()
                .recv_timeout(Duration::from_secs(5))
                .map_err(|_| Error::Other("gate never opened".to_string()))?;
        }
        self.inner.append(record)
    }

    fn records(&self) -> evalq::error::Result<Vec<ResultRecord>> {
        self.inner.records()
    }
}

/// Opens the gate from inside the `second` request, after a timer.
struct GateOpener {
    open: Mutex<std::sync::mpsc::Sender<()>>,
}

impl Submitter for GateOpener {
    async fn submit(
        &self,
        prompt: &Prompt,
        _params: &RequestParameters,
    ) -> Result<Value, SubmitError> {
        if *prompt == Prompt::from("second") {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = self.open.lock().unwrap().send(());
        }
        Ok(json!({"text": "ok"}))
    }
}

#[tokio::test]
async fn slow_store_writes_do_not_stall_other_items() {
    // Single-threaded runtime: an append blocking this thread would starve
    // the timer that opens the gate.
    let (open, gate) = std::sync::mpsc::channel();
    let store = Arc::new(GatedStore {
        inner: MemoryStore::new(),
        gate: Mutex::new(gate),
    });
    let submitter = GateOpener {
        open: Mutex::new(open),
    };

    let summary = EvaluationEngine::new(submitter, store.clone())
        .with_throttle(RequestThrottle::new(1_000, Duration::from_secs(1)))
        .run(items(&["first", "second"]), 2)
        .await
        .unwrap();

    assert_eq!(summary.completed, 2);
    assert_eq!(store.records().unwrap().len(), 2);
}
