//! Typed failures for every stage of the pipeline.
//!
//! Fetch and classification errors are retried locally and folded into
//! stats; store errors are either reinterpreted (constraint violations
//! become duplicates) or end the current cycle (store unavailable).

use serde::Serialize;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FetchErrorKind {
    Timeout,
    Unreachable,
    BadStatus,
    ParseFailure,
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FetchErrorKind::Timeout => "timeout",
            FetchErrorKind::Unreachable => "unreachable",
            FetchErrorKind::BadStatus => "bad_status",
            FetchErrorKind::ParseFailure => "parse_failure",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{kind}: {message}")]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub message: String,
    /// Set for `BadStatus` so the retry policy can tell 5xx/429 from other 4xx.
    #[serde(skip)]
    pub status: Option<u16>,
}

impl FetchError {
    pub fn new(kind: FetchErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Timeout, message)
    }

    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Unreachable, message)
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::ParseFailure, message)
    }

    pub fn bad_status(status: u16) -> Self {
        Self {
            kind: FetchErrorKind::BadStatus,
            message: format!("http status {status}"),
            status: Some(status),
        }
    }

    /// Timeouts, connection failures, 5xx and 429 are worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self.kind {
            FetchErrorKind::Timeout | FetchErrorKind::Unreachable => true,
            FetchErrorKind::BadStatus => {
                matches!(self.status, Some(s) if s >= 500 || s == 429)
            }
            FetchErrorKind::ParseFailure => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClassificationError {
    #[error("classification timed out")]
    Timeout,
    #[error("classification service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("invalid classification response: {0}")]
    InvalidResponse(String),
}

impl ClassificationError {
    /// Every classification failure is retried within the attempt bound;
    /// an invalid response is often a one-off from a sampling backend.
    pub fn is_transient(&self) -> bool {
        true
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ClassificationError::Timeout => "timeout",
            ClassificationError::ServiceUnavailable(_) => "service_unavailable",
            ClassificationError::InvalidResponse(_) => "invalid_response",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("source not found: {0}")]
pub struct NotFound(pub String);
