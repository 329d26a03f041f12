//! Item lifecycle span helpers.
//!
//! One span per item, covering every attempt from the first throttle wait to
//! the written record.

use tracing::Span;

use crate::model::{AttemptOutcome, ItemId, RunId};

/// Start a span for one item's evaluation.
///
/// `item.attempts` and `item.outcome` are declared empty and filled in by
/// [`record_attempt`] and [`record_outcome`].
pub fn start_item_span(run_id: &RunId, item_id: &ItemId) -> Span {
    tracing::info_span!(
        "item.evaluate",
        "run.id" = %run_id,
        "item.id" = %item_id,
        "item.attempts" = tracing::field::Empty,
        "item.outcome" = tracing::field::Empty,
    )
}

/// Record a finished attempt on the item span.
pub fn record_attempt(span: &Span, number: u32, outcome: &AttemptOutcome, latency_ms: u64) {
    span.record("item.attempts", number);
    span.in_scope(|| match outcome {
        AttemptOutcome::Success => {
            tracing::debug!(attempt = number, latency_ms, "attempt succeeded");
        }
        AttemptOutcome::Failure { kind, error } => {
            tracing::warn!(attempt = number, latency_ms, %kind, %error, "attempt failed");
        }
    });
}

/// Record the terminal outcome ("success" | "failure" | "aborted").
pub fn record_outcome(span: &Span, outcome: &str) {
    span.record("item.outcome", outcome);
}
