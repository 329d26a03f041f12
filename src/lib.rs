//! # evalq
//!
//! Rate-limited, resumable batch evaluation of prompts against a remote
//! language model.
//!
//! Items stream in from JSONL, run through a bounded worker pool behind a
//! shared sliding-window throttle, retry with exponential backoff, and land
//! one record at a time in a durable result store (JSONL or SQLite). A rerun
//! against the same store skips everything already recorded.

pub mod config;
pub mod engine;
pub mod error;
pub mod input;
pub mod llm;
pub mod model;
pub mod retry;
pub mod store;
pub mod submit;
pub mod telemetry;
pub mod throttle;
