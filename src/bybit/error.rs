// =============================================================================
// Bybit Error Taxonomy — typed retCode classification
// =============================================================================
//
// The v5 API reports failures through a retCode in the JSON envelope, not
// through the HTTP status. Classes that matter to us:
//   auth        10005, 10006, 10018  — fatal, never retried
//   timestamp   10017                — fatal (clock drift, fix locally)
//   rate limit  10016                — retried with backoff / Retry-After
//   parameter   10001..10004         — fatal, the request itself is wrong
//   trading     3xxxx                — surfaced to the order path
// =============================================================================

use thiserror::Error;

/// Errors surfaced by the Bybit REST layer.
#[derive(Debug, Error)]
pub enum BybitError {
    #[error("authentication rejected (retCode={code}): {message}")]
    Auth { code: i64, message: String },

    #[error("timestamp out of recv window (retCode={code}): {message}")]
    Timestamp { code: i64, message: String },

    #[error("rate limit exceeded (retCode={code}): {message}")]
    RateLimit { code: i64, message: String },

    #[error("invalid request parameters (retCode={code}): {message}")]
    InvalidParams { code: i64, message: String },

    #[error("trading rejected (retCode={code}): {message}")]
    Trading { code: i64, message: String },

    /// Nonzero retCode outside the known classes.
    #[error("api error (retCode={code}): {message}")]
    Api { code: i64, message: String },

    /// Nonzero retCode raised mid-pagination; carries how far we got.
    #[error("api error (retCode={code}) on page {page}, collected={collected}: {message}")]
    Upstream {
        code: i64,
        message: String,
        page: u32,
        collected: usize,
    },

    #[error("http status {status}: {detail}")]
    HttpStatus { status: u16, detail: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl BybitError {
    /// Build the class-appropriate variant from a nonzero retCode.
    pub fn from_ret_code(code: i64, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            10005 | 10006 | 10018 => BybitError::Auth { code, message },
            10017 => BybitError::Timestamp { code, message },
            10016 => BybitError::RateLimit { code, message },
            10001..=10004 => BybitError::InvalidParams { code, message },
            30000..=39999 => BybitError::Trading { code, message },
            _ => BybitError::Api { code, message },
        }
    }

    /// Whether the rate-limited request helper may retry this failure.
    /// Only rate limiting and transport faults are transient; everything
    /// else reflects a request we would just fail again.
    pub fn is_retryable(&self) -> bool {
        match self {
            BybitError::RateLimit { .. } => true,
            BybitError::Transport(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            BybitError::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// retCode carried by this error, when there is one.
    pub fn ret_code(&self) -> Option<i64> {
        match self {
            BybitError::Auth { code, .. }
            | BybitError::Timestamp { code, .. }
            | BybitError::RateLimit { code, .. }
            | BybitError::InvalidParams { code, .. }
            | BybitError::Trading { code, .. }
            | BybitError::Api { code, .. }
            | BybitError::Upstream { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// retCodes on which a single order re-submission is attempted before giving
/// up on the symbol.
pub fn is_transient_order_code(code: i64) -> bool {
    matches!(code, 10006 | 10002)
}
