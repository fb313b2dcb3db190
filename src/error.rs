use reqwest::StatusCode;
use thiserror::Error;

/// Failure of a single round trip to the analysis service.
///
/// Never fatal to a poll session: the poller hands it to `on_error` and keeps going.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("service returned {status}: {detail}")]
    Status { status: StatusCode, detail: String },

    #[error("malformed response payload: {0}")]
    Decode(#[from] serde_json::Error),
}

impl FetchError {
    /// Build a status error from a non-success response body.
    ///
    /// The service reports failures as `{"detail": "..."}`; anything else is kept verbatim.
    pub fn from_status_body(status: StatusCode, body: &str) -> Self {
        let detail = serde_json::from_str::<serde_json::Value>(body)
            .ok()
            .and_then(|v| match v.get("detail") {
                Some(serde_json::Value::String(s)) => Some(s.clone()),
                Some(other) if !other.is_null() => Some(other.to_string()),
                _ => None,
            })
            .unwrap_or_else(|| {
                let trimmed = body.trim();
                if trimmed.is_empty() {
                    status
                        .canonical_reason()
                        .unwrap_or("no response body")
                        .to_string()
                } else {
                    trimmed.to_string()
                }
            });
        FetchError::Status { status, detail }
    }
}

/// Errors returned synchronously by `Poller::start`. No session exists when one is returned.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PollError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}
