// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Error taxonomy shared by every component: discovery, drivers, the state
//! store, the bus, and the sheets host all translate failures into one of
//! these five categories at the task boundary so callers can react uniformly
//! (reconnect, log-and-continue, or give up) without matching on strings.

use thiserror::Error;

/// The five error categories from the design doc's error-handling section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Logged at warn; triggers reconnect/retry.
    Recoverable,
    /// Logged at error; terminates the affected subsystem.
    Fatal,
    /// Not a system error — an operation outcome carrying a reason.
    Cancelled,
    /// Device returned an unexpected token or malformed line; triggers reconnect.
    Protocol,
    /// Operation rejected at submission without disturbing state.
    QueueFull,
}

/// The orchestrator's closed error type. Every fallible path in the crate
/// eventually resolves to one of these variants via `?` or an explicit map.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("device returned unexpected token: {0:?}")]
    Protocol(String),

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("queue is full (depth {depth}, max {max})")]
    QueueFull { depth: usize, max: usize },

    #[error("reconnect attempts exhausted after {attempts} tries: {message}")]
    Fatal { attempts: u32, message: String },

    #[error("schema validation rejected message on topic {topic:?}: {reason}")]
    SchemaRejected { topic: String, reason: String },

    #[error("{0}")]
    Other(String),
}

impl OrchestratorError {
    /// Classify this error for uniform handling at the task boundary.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Io(_) | Self::Timeout(_) => ErrorCategory::Recoverable,
            Self::Serial(_) => ErrorCategory::Recoverable,
            Self::Json(_) => ErrorCategory::Recoverable,
            Self::Protocol(_) => ErrorCategory::Protocol,
            Self::Cancelled(_) => ErrorCategory::Cancelled,
            Self::QueueFull { .. } => ErrorCategory::QueueFull,
            Self::Fatal { .. } | Self::SchemaRejected { .. } => ErrorCategory::Fatal,
            Self::Other(_) => ErrorCategory::Recoverable,
        }
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled(reason.into())
    }

    pub fn queue_full(depth: usize, max: usize) -> Self {
        Self::QueueFull { depth, max }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categorizes_queue_full_without_disturbing_state() {
        let err = OrchestratorError::queue_full(8, 8);
        assert_eq!(err.category(), ErrorCategory::QueueFull);
    }

    #[test]
    fn categorizes_cancelled_as_not_fatal() {
        let err = OrchestratorError::cancelled("host-power-off");
        assert_eq!(err.category(), ErrorCategory::Cancelled);
        assert_eq!(err.to_string(), "operation cancelled: host-power-off");
    }

    #[test]
    fn fatal_after_exhausted_reconnects() {
        let err = OrchestratorError::Fatal { attempts: 5, message: "gave up".to_owned() };
        assert_eq!(err.category(), ErrorCategory::Fatal);
    }
}
