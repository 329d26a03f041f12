//! Core data model.
//!
//! An item is one question to put to the model: a stable identifier plus the
//! prompt to submit. Each item ends a run with exactly one result record,
//! either the captured response or a recorded permanent failure.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Stable identifier of an item. Must be identical across runs so a resumed
/// run can match it against stored results.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub String);

impl ItemId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identifier used for an input record that could not be parsed.
    pub fn synthetic(position: usize) -> Self {
        Self(format!("input-error-{position}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(&self.0)
    }
}

impl From<&str> for ItemId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ItemId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier of a single engine run. Stamped on every record it writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

// ---------------------------------------------------------------------------
// Prompt
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One turn of a chat conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// The payload submitted for an item. The engine never looks inside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Prompt {
    Text(String),
    Messages(Vec<Message>),
}

impl From<&str> for Prompt {
    fn from(s: &str) -> Self {
        Prompt::Text(s.to_string())
    }
}

impl From<Vec<Message>> for Prompt {
    fn from(messages: Vec<Message>) -> Self {
        Prompt::Messages(messages)
    }
}

// ---------------------------------------------------------------------------
// Item
// ---------------------------------------------------------------------------

/// A unit of work pulled from the input sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub prompt: Prompt,
    /// Original input fields carried through to the result record for
    /// downstream analysis. Opaque to the engine.
    #[serde(default)]
    pub input: serde_json::Value,
}

impl Item {
    pub fn new(id: impl Into<ItemId>, prompt: impl Into<Prompt>) -> Self {
        Self {
            id: id.into(),
            prompt: prompt.into(),
            input: serde_json::Value::Null,
        }
    }

    pub fn input(mut self, input: serde_json::Value) -> Self {
        self.input = input;
        self
    }
}

// ---------------------------------------------------------------------------
// Request parameters
// ---------------------------------------------------------------------------

/// Parameters handed to the submitter with every request. The engine only
/// reads `timeout`; everything else is passed through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestParameters {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f64,
    /// Upper bound for a single attempt. None = unbounded.
    #[serde(default, with = "duration_secs_opt")]
    pub timeout: Option<Duration>,
    /// Completions per request.
    #[serde(default = "default_n")]
    pub n: u32,
}

fn default_n() -> u32 {
    1
}

impl Default for RequestParameters {
    fn default() -> Self {
        Self {
            model: "gpt-3.5-turbo".to_string(),
            max_tokens: 32,
            temperature: 0.0,
            timeout: Some(Duration::from_secs(30)),
            n: default_n(),
        }
    }
}

mod duration_secs_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let secs = Option::<f64>::deserialize(d)?;
        secs.filter(|s| *s > 0.0)
            .map(|s| Duration::try_from_secs_f64(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

/// Classification of a failed attempt. Drives the retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network error, timeout, server 5xx.
    Transient,
    /// The remote API signalled quota exhaustion or overload.
    RateLimited,
    /// The remote API refused the request (e.g. invalid input). Not retried.
    Rejected,
    /// The input record itself was malformed. Never submitted.
    InvalidInput,
}

impl FailureKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, FailureKind::Transient | FailureKind::RateLimited)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::Transient => "transient",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::Rejected => "rejected",
            FailureKind::InvalidInput => "invalid_input",
        };
        f.pad(s)
    }
}

/// Failure returned by a submitter for a single attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitError {
    pub kind: FailureKind,
    pub message: String,
}

impl SubmitError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transient, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(FailureKind::RateLimited, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Rejected, message)
    }
}

impl std::fmt::Display for SubmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for SubmitError {}

// ---------------------------------------------------------------------------
// Attempts and results
// ---------------------------------------------------------------------------

/// A single submission of an item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    /// 1-based.
    pub number: u32,
    pub outcome: AttemptOutcome,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failure { kind: FailureKind, error: String },
}

/// Terminal outcome of an item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Success { response: serde_json::Value },
    Failure { kind: FailureKind, error: String },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }
}

/// One persisted record. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub run_id: RunId,
    pub id: ItemId,
    #[serde(default)]
    pub input: serde_json::Value,
    /// The prompt as submitted. None for records of malformed input.
    #[serde(default)]
    pub prompt: Option<Prompt>,
    pub outcome: Outcome,
    #[serde(default)]
    pub attempts: Vec<Attempt>,
    pub recorded_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

/// A per-item failure as reported in the run summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    pub id: ItemId,
    pub kind: FailureKind,
    pub message: String,
}

/// What a run did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    /// Items whose response was recorded.
    pub completed: usize,
    /// Items recorded as permanent failures.
    pub failed: usize,
    /// Items skipped because a result already existed (or the identifier was
    /// already admitted earlier in this run).
    pub skipped: usize,
    /// In-flight items abandoned by an aborting cancellation. Nothing was
    /// written for them.
    pub aborted: usize,
    /// Whether the run stopped early because of cancellation.
    pub cancelled: bool,
    pub errors: Vec<ItemError>,
}

impl Summary {
    /// Items that reached a terminal, recorded result.
    pub fn processed(&self) -> usize {
        self.completed + self.failed
    }
}
