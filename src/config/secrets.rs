//! Secret handling utilities.
//!
//! Re-exports the secrecy types used for provider API keys.

pub use secrecy::{ExposeSecret, SecretString};
