//! Handler-side errors.
//!
//! Every variant is a *task* failure: it is written into `last_error` and
//! the history table and drives the retry path. None of them stop a worker.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("payload decode: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),

    #[error("cancelled")]
    Cancelled,

    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_displays_bare_message() {
        assert_eq!(HandlerError::failed("upstream 503").to_string(), "upstream 503");
    }

    #[test]
    fn decode_errors_convert() {
        let err: HandlerError = serde_json::from_slice::<u32>(b"nope").unwrap_err().into();
        assert!(err.to_string().starts_with("payload decode:"));
    }
}
