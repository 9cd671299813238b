//! Boundary to the language model that judges entries.

pub mod openai;

use futures::future::BoxFuture;
use thiserror::Error;

pub use openai::{OpenAiConfig, OpenAiReasoner};

/// Failures of a [`Reasoner`] call.
#[derive(Debug, Error)]
pub enum ReasonerError {
    /// The request never produced a response.
    #[error("reasoning endpoint unreachable")]
    Transport {
        #[source]
        source: reqwest::Error,
    },
    /// The endpoint answered with an error status.
    #[error("reasoning endpoint returned HTTP {status}: {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body.
        message: String,
    },
    /// The endpoint answered without any completion text.
    #[error("reasoning endpoint returned no completion")]
    EmptyCompletion,
    /// The response body did not match the expected shape.
    #[error("failed to decode reasoning response")]
    Decode {
        #[source]
        source: reqwest::Error,
    },
}

/// Opaque, possibly slow and possibly failing text completion.
pub trait Reasoner: Send + Sync {
    /// Complete `prompt`, with `context` given as standing instructions.
    fn complete(&self, prompt: String, context: String)
    -> BoxFuture<'static, Result<String, ReasonerError>>;
}
