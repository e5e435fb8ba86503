//! Error model for replayed operations.

use thiserror::Error;

use crate::operation::FailureClass;

/// Failure reported by a replayed operation (or by the original attempt that
/// got the operation queued in the first place).
///
/// The variant decides how the coordinator treats the operation afterwards;
/// see [`FailureClass`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReplayError {
    /// No path to the backend existed.
    #[error("connectivity error: {0}")]
    Connectivity(String),

    /// The backend answered with a transient failure (5xx, timeout, throttling).
    #[error("transient error: {0}")]
    Transient(String),

    /// The backend rejected the operation (validation, conflict, 4xx).
    #[error("permanent error: {0}")]
    Permanent(String),
}

impl ReplayError {
    pub fn connectivity(msg: impl Into<String>) -> Self {
        Self::Connectivity(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    /// Classify an HTTP status code.
    ///
    /// 408, 425, 429 and 5xx are transient; any other 4xx is permanent.
    /// Anything else is treated as transient.
    pub fn from_status(status: u16, msg: impl Into<String>) -> Self {
        match status {
            408 | 425 | 429 => Self::Transient(msg.into()),
            400..=499 => Self::Permanent(msg.into()),
            _ => Self::Transient(msg.into()),
        }
    }

    pub fn class(&self) -> FailureClass {
        match self {
            ReplayError::Connectivity(_) => FailureClass::Connectivity,
            ReplayError::Transient(_) => FailureClass::Transient,
            ReplayError::Permanent(_) => FailureClass::Permanent,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ReplayError::Connectivity(m) | ReplayError::Transient(m) | ReplayError::Permanent(m) => m,
        }
    }
}

/// An identifier string could not be parsed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid {kind}: {reason}")]
pub struct ParseIdError {
    pub kind: &'static str,
    pub reason: String,
}
