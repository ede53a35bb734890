use std::fmt;

use serde::{Deserialize, Serialize};

/// Closed set of failure kinds an outbound API call can end in.
///
/// Retry decisions are made on the kind, never on the concrete error type,
/// see [`crate::batch::RetryPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// HTTP 429 or an explicit rate-limit error body.
    RateLimited,
    /// Provider-wide overload (HTTP 529 / 503).
    Overloaded,
    Timeout,
    Connection,
    /// Any other 5xx.
    Server,
    /// 4xx other than 429: bad request, auth, not found.
    Api,
    /// Response arrived but could not be decoded.
    InvalidResponse,
}

impl ErrorKind {
    /// True when the failure means the whole provider is saturated, not just
    /// this one request. Siblings in the same batch should back off too.
    pub fn signals_overload(self) -> bool {
        matches!(self, ErrorKind::RateLimited | ErrorKind::Overloaded)
    }

    pub fn from_status(status: reqwest::StatusCode) -> ErrorKind {
        match status.as_u16() {
            429 => ErrorKind::RateLimited,
            503 | 529 => ErrorKind::Overloaded,
            s if s >= 500 => ErrorKind::Server,
            _ => ErrorKind::Api,
        }
    }

    pub fn from_reqwest(err: &reqwest::Error) -> ErrorKind {
        if err.is_timeout() {
            ErrorKind::Timeout
        } else if err.is_connect() {
            ErrorKind::Connection
        } else if let Some(status) = err.status() {
            ErrorKind::from_status(status)
        } else if err.is_decode() {
            ErrorKind::InvalidResponse
        } else {
            ErrorKind::Connection
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Overloaded => "overloaded",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Connection => "connection",
            ErrorKind::Server => "server",
            ErrorKind::Api => "api",
            ErrorKind::InvalidResponse => "invalid_response",
        };
        f.write_str(name)
    }
}

/// Anything the retry primitive can reason about.
pub trait Classify {
    fn kind(&self) -> ErrorKind;
}

/// Failure of a text judge call.
#[derive(Debug, thiserror::Error)]
pub enum JudgeError {
    #[error("judge returned HTTP {status}: {message}")]
    Status {
        kind: ErrorKind,
        status: u16,
        message: String,
    },
    #[error("judge transport error ({kind}): {source}")]
    Transport {
        kind: ErrorKind,
        #[source]
        source: reqwest::Error,
    },
    #[error("judge response is invalid: {message}")]
    InvalidResponse { message: String },
}

impl Classify for JudgeError {
    fn kind(&self) -> ErrorKind {
        match self {
            JudgeError::Status { kind, .. } | JudgeError::Transport { kind, .. } => *kind,
            JudgeError::InvalidResponse { .. } => ErrorKind::InvalidResponse,
        }
    }
}

impl From<reqwest::Error> for JudgeError {
    fn from(source: reqwest::Error) -> Self {
        JudgeError::Transport {
            kind: ErrorKind::from_reqwest(&source),
            source,
        }
    }
}

/// Failure of a single recovery-layer call. Never escapes the cascade.
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("{endpoint} returned HTTP {status}")]
    Status {
        endpoint: &'static str,
        kind: ErrorKind,
        status: u16,
    },
    #[error("{endpoint} request failed ({kind}): {source}")]
    Transport {
        endpoint: &'static str,
        kind: ErrorKind,
        #[source]
        source: reqwest::Error,
    },
    #[error("{endpoint} returned unsupported content type {content_type:?}")]
    ContentType {
        endpoint: &'static str,
        content_type: String,
    },
    #[error("{endpoint} content too short ({chars} chars)")]
    TooShort { endpoint: &'static str, chars: usize },
}

impl RecoveryError {
    pub fn transport(endpoint: &'static str, source: reqwest::Error) -> Self {
        RecoveryError::Transport {
            endpoint,
            kind: ErrorKind::from_reqwest(&source),
            source,
        }
    }

    pub fn status(endpoint: &'static str, status: reqwest::StatusCode) -> Self {
        RecoveryError::Status {
            endpoint,
            kind: ErrorKind::from_status(status),
            status: status.as_u16(),
        }
    }
}

impl Classify for RecoveryError {
    fn kind(&self) -> ErrorKind {
        match self {
            RecoveryError::Status { kind, .. } | RecoveryError::Transport { kind, .. } => *kind,
            RecoveryError::ContentType { .. } | RecoveryError::TooShort { .. } => {
                ErrorKind::InvalidResponse
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("relevance_cutoff must be within 1..=5, got {0}")]
    CutoffOutOfRange(u8),
    #[error("min_sources_short_report must be at least 1")]
    ZeroShortThreshold,
    #[error("min_sources_short_report ({short}) exceeds min_sources_full_report ({full})")]
    ShortAboveFull { short: usize, full: usize },
    #[error("min_sources_full_report ({full}) exceeds max_sources ({max})")]
    FullAboveMax { full: usize, max: usize },
    #[error("unknown research mode {0:?}")]
    UnknownMode(String),
}

/// Why a judge response could not be read as a score. The caller decides
/// what to substitute.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScoreParseError {
    #[error("response is empty")]
    Empty,
    #[error("response has no SCORE line")]
    MissingScore,
    #[error("SCORE value {0:?} is not a number")]
    NotANumber(String),
}
