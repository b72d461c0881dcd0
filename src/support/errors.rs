//! Error types
//!
//! `OcppError` carries the OCPP-J error codes used both on the wire
//! (CALLERROR frames) and internally (rejected pending requests).
//! `SimulatorError` covers template/IO-level failures outside the
//! protocol taxonomy.

use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// OCPP-J error codes (the subset a charge point emits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NotImplemented,
    NotSupported,
    InternalError,
    ProtocolError,
    FormationViolation,
    GenericError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotImplemented => "NotImplemented",
            Self::NotSupported => "NotSupported",
            Self::InternalError => "InternalError",
            Self::ProtocolError => "ProtocolError",
            Self::FormationViolation => "FormationViolation",
            Self::GenericError => "GenericError",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An OCPP-level failure, convertible to a CALLERROR frame.
#[derive(Debug, Clone, Error)]
#[error("{code}: {description}")]
pub struct OcppError {
    pub code: ErrorCode,
    pub description: String,
    pub details: Option<Value>,
}

impl OcppError {
    pub fn new(code: ErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn generic(description: impl Into<String>) -> Self {
        Self::new(ErrorCode::GenericError, description)
    }

    pub fn not_implemented(action: &str) -> Self {
        Self::new(
            ErrorCode::NotImplemented,
            format!("Requested action {} is not implemented", action),
        )
    }

    /// Rejection handed to a caller whose frame was parked in the
    /// offline queue.
    pub fn buffered(action: &str) -> Self {
        Self::generic(format!("WebSocket closed, message buffered ({})", action))
    }

    pub fn timeout(message_id: &str) -> Self {
        Self::generic(format!("Timeout for message id {}", message_id))
    }
}

/// Failures outside the OCPP wire taxonomy.
#[derive(Debug, Error)]
pub enum SimulatorError {
    #[error("template error: {0}")]
    Template(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("file watcher error: {0}")]
    Watch(#[from] notify::Error),
}
