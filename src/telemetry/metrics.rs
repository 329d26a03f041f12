//! Metric instrument factories for evalq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created from the `"evalq"` meter; without a
//! configured provider they are no-ops.

use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Histogram, Meter};

use crate::model::FailureKind;

/// Returns the shared meter for evalq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("evalq")
}

/// Counter: items whose response was recorded.
pub fn items_completed() -> Counter<u64> {
    meter()
        .u64_counter("evalq.items.completed")
        .with_description("Items evaluated successfully")
        .build()
}

/// Counter: items recorded as permanent failures.
/// Labels: `error.type` (failure kind).
pub fn items_failed() -> Counter<u64> {
    meter()
        .u64_counter("evalq.items.failed")
        .with_description("Items recorded as failed")
        .build()
}

/// Counter: items skipped because a result already exists.
pub fn items_skipped() -> Counter<u64> {
    meter()
        .u64_counter("evalq.items.skipped")
        .with_description("Items skipped on resume")
        .build()
}

/// Counter: submission attempts.
/// Labels: `result` ("success" | failure kind).
pub fn attempts() -> Counter<u64> {
    meter()
        .u64_counter("evalq.attempts")
        .with_description("Submission attempts")
        .build()
}

/// Histogram: time spent waiting for a throttle slot, in milliseconds.
pub fn throttle_wait_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("evalq.throttle.wait_ms")
        .with_description("Time spent waiting for the request throttle")
        .with_unit("ms")
        .build()
}

/// Histogram: duration of a single attempt in milliseconds.
pub fn attempt_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("evalq.attempt.duration_ms")
        .with_description("Submission attempt duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Label for a failure kind using the semantic-convention key.
pub fn error_type(kind: FailureKind) -> KeyValue {
    KeyValue::new(
        opentelemetry_semantic_conventions::attribute::ERROR_TYPE,
        kind.to_string(),
    )
}
