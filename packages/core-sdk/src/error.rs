use std::time::Duration;

use thiserror::Error;

/**
 * \brief Rejected run parameters. Aborts a run before anything is dispatched.
 */
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Please enter a prompt")]
    EmptyPrompt,

    #[error("Please provide an API key")]
    MissingCredential,

    #[error("Invalid API key format. Should start with \"pplx-\" followed by 48 characters")]
    MalformedCredential,

    #[error("Temperature must be between 0 and 1, got {0}")]
    TemperatureOutOfRange(f64),

    #[error("Max tokens must be a positive integer")]
    ZeroMaxTokens,
}

/**
 * \brief Failure of a single dispatch. Only ever affects the model it belongs to.
 */
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("network error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("request failed: {status} -> {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("no response within {0:?}")]
    Timeout(Duration),
}
