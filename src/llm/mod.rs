//! Chat-completion submitter backed by rig-core.
//!
//! [`ChatSubmitter`] wraps any rig `CompletionModel`; the client helpers
//! build one for Anthropic or OpenAI from a [`SecretString`] key.
//!
//! # Example
//! ```no_run
//! use evalq::llm::{ChatSubmitter, anthropic_client};
//! use rig::client::CompletionClient;
//! use secrecy::SecretString;
//!
//! let key = SecretString::from("sk-ant-...");
//! let client = anthropic_client(&key).expect("failed to create Anthropic client");
//! let model = client.completion_model("claude-3-5-haiku-latest");
//! let submitter = ChatSubmitter::new(model, "anthropic");
//! ```
//!
//! [`SecretString`]: secrecy::SecretString

use rig::completion::{CompletionError, CompletionModel};
use rig::message::AssistantContent;
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use tracing::Instrument;

use crate::model::{FailureKind, Message, Prompt, RequestParameters, Role, SubmitError};
use crate::submit::Submitter;
use crate::telemetry::genai::{record_token_usage, start_chat_span};

/// Create an Anthropic client from a secret API key.
///
/// # Errors
/// Returns an error if the underlying HTTP client cannot be constructed.
pub fn anthropic_client(
    api_key: &SecretString,
) -> Result<rig::providers::anthropic::Client, rig::http_client::Error> {
    rig::providers::anthropic::Client::new(api_key.expose_secret())
}

/// Create an OpenAI client from a secret API key.
///
/// # Errors
/// Returns an error if the underlying HTTP client cannot be constructed.
pub fn openai_client(
    api_key: &SecretString,
) -> Result<rig::providers::openai::Client, rig::http_client::Error> {
    rig::providers::openai::Client::new(api_key.expose_secret())
}

/// Submits prompts to a chat-completion model.
///
/// The stored response is `{"model", "text", "choices", "usage"}`; `text` is
/// the first text choice, `choices` all of them.
pub struct ChatSubmitter<M> {
    model: M,
    provider: &'static str,
}

impl<M> ChatSubmitter<M> {
    pub fn new(model: M, provider: &'static str) -> Self {
        Self { model, provider }
    }
}

impl<M> Submitter for ChatSubmitter<M>
where
    M: CompletionModel + 'static,
{
    async fn submit(
        &self,
        prompt: &Prompt,
        params: &RequestParameters,
    ) -> Result<serde_json::Value, SubmitError> {
        let span = start_chat_span(params, self.provider);
        let conversation = Conversation::from_prompt(prompt)?;

        let mut request = self
            .model
            .completion_request(conversation.prompt)
            .messages(conversation.history)
            .temperature(params.temperature)
            .max_tokens(u64::from(params.max_tokens));
        if let Some(preamble) = conversation.preamble {
            request = request.preamble(preamble);
        }
        if params.n > 1 && self.provider == "openai" {
            request = request.additional_params(json!({ "n": params.n }));
        }

        let response = request
            .send()
            .instrument(span.clone())
            .await
            .map_err(|e| SubmitError::new(classify_error(&e), e.to_string()))?;

        record_token_usage(&span, response.usage.input_tokens, response.usage.output_tokens);

        let choices: Vec<String> = response
            .choice
            .iter()
            .filter_map(|content| match content {
                AssistantContent::Text(text) => Some(text.text.clone()),
                _ => None,
            })
            .collect();

        Ok(json!({
            "model": params.model,
            "text": choices.first(),
            "choices": choices,
            "usage": {
                "input_tokens": response.usage.input_tokens,
                "output_tokens": response.usage.output_tokens,
            },
        }))
    }
}

/// A prompt split the way chat APIs want it: system text, prior turns, and
/// the final message.
#[derive(Debug)]
struct Conversation {
    preamble: Option<String>,
    history: Vec<rig::message::Message>,
    prompt: rig::message::Message,
}

impl Conversation {
    fn from_prompt(prompt: &Prompt) -> Result<Self, SubmitError> {
        let messages = match prompt {
            Prompt::Text(text) => {
                return Ok(Self {
                    preamble: None,
                    history: Vec::new(),
                    prompt: rig::message::Message::user(text.clone()),
                });
            }
            Prompt::Messages(messages) => messages,
        };

        let system: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();
        let mut turns: Vec<rig::message::Message> = messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(to_rig_message)
            .collect();

        let Some(last) = turns.pop() else {
            return Err(SubmitError::new(
                FailureKind::InvalidInput,
                "prompt has no user or assistant messages",
            ));
        };

        Ok(Self {
            preamble: (!system.is_empty()).then(|| system.join("\n\n")),
            history: turns,
            prompt: last,
        })
    }
}

fn to_rig_message(message: &Message) -> rig::message::Message {
    match message.role {
        Role::Assistant => rig::message::Message::assistant(message.content.clone()),
        Role::System | Role::User => rig::message::Message::user(message.content.clone()),
    }
}

/// Classify a failed completion call.
///
/// An HTTP status decides when rig kept one: 429 (and Anthropic's 529
/// "overloaded") is a rate limit, 408 is transient, any other 4xx is a
/// rejection that would fail again unchanged, and everything else is
/// transient. Providers that fold a non-2xx reply into an error body are
/// classified from that body. Connection and decoding failures are transient.
pub fn classify_error(err: &CompletionError) -> FailureKind {
    match err {
        CompletionError::HttpError(
            rig::http_client::Error::InvalidStatusCode(status)
            | rig::http_client::Error::InvalidStatusCodeWithMessage(status, _),
        ) => classify_status(status.as_u16()),
        CompletionError::HttpError(_) | CompletionError::JsonError(_) => FailureKind::Transient,
        CompletionError::UrlError(_) | CompletionError::RequestError(_) => FailureKind::Rejected,
        CompletionError::ProviderError(body) | CompletionError::ResponseError(body) => {
            classify(body)
        }
    }
}

fn classify_status(status: u16) -> FailureKind {
    match status {
        429 | 529 => FailureKind::RateLimited,
        408 => FailureKind::Transient,
        400..=499 => FailureKind::Rejected,
        _ => FailureKind::Transient,
    }
}

/// Classify a provider error body.
///
/// Both Anthropic and OpenAI name the error in a `type` or `code` field
/// (`rate_limit_error`, `invalid_request_error`, ...). Matching is on whole
/// words, so digits inside request ids or byte counts never look like a
/// status code.
pub fn classify(message: &str) -> FailureKind {
    let lower = message.to_ascii_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .collect();
    let has = |word: &str| words.contains(&word);
    let has_pair = |first: &str, second: &str| {
        words.windows(2).any(|pair| pair[0] == first && pair[1] == second)
    };

    if has("429")
        || has("529")
        || has("overloaded")
        || has("overloaded_error")
        || has("rate_limit_error")
        || has("rate_limit_exceeded")
        || has("insufficient_quota")
        || has_pair("rate", "limit")
        || has_pair("too", "many")
    {
        return FailureKind::RateLimited;
    }

    let rejected = [
        "400",
        "401",
        "403",
        "404",
        "422",
        "invalid_request_error",
        "authentication_error",
        "permission_error",
        "not_found_error",
        "invalid_api_key",
        "model_not_found",
        "context_length_exceeded",
    ];
    if rejected.iter().any(|word| has(word)) || has_pair("invalid", "request") {
        return FailureKind::Rejected;
    }
    FailureKind::Transient
}
