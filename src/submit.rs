//! The submission seam between the engine and a remote model.

use std::future::Future;

use crate::model::{Prompt, RequestParameters, SubmitError};

/// Sends one prompt to the remote model and returns its response.
///
/// Implementations classify failures with a [`FailureKind`](crate::model::FailureKind)
/// so the engine can decide whether to retry. The response is stored as-is.
pub trait Submitter: Send + Sync + 'static {
    fn submit(
        &self,
        prompt: &Prompt,
        params: &RequestParameters,
    ) -> impl Future<Output = Result<serde_json::Value, SubmitError>> + Send;
}
