//! # Error Handling
//!
//! This module defines the error taxonomy shared by the storage layer. It separates
//! two kinds of failure:
//!
//! - [`StoreError`]: a failure of the whole operation, returned through [`StoreResult`].
//! - [`SyncError`]: a failure of a single source (one uplink or one metadata filter)
//!   that is collected alongside a possibly still successful result.
//!
//! ## Error Classifications
//!
//! Every [`StoreError`] maps onto an [`ErrorCode`], which in turn maps onto the HTTP
//! status an outer API layer should answer with:
//!
//! - **Not Found** (404): no source has the package or file
//! - **Conflict** (409): the package already exists, or a revision check failed
//! - **Service Unavailable** (503): uplinks unreachable, registry cannot decide
//! - **Validation Errors** (400): malformed input or malformed upstream metadata
//! - **Internal Errors** (500): local store failures, unexpected transport faults
//!
//! ## Usage
//!
//! ```rust
//! use registry_store::error::{StoreError, StoreResult};
//!
//! fn require_name(name: &str) -> StoreResult<()> {
//!     if name.is_empty() {
//!         return Err(StoreError::BadRequest("Package name cannot be empty".to_string()));
//!     }
//!     Ok(())
//! }
//! ```

use reqwest::StatusCode;
use std::fmt;

/// Error code classification for machine-readable error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NotFound,
    Conflict,
    ServiceUnavailable,
    ValidationError,
    FilterError,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotFound => "not_found",
            ErrorCode::Conflict => "conflict",
            ErrorCode::ServiceUnavailable => "service_unavailable",
            ErrorCode::ValidationError => "validation_error",
            ErrorCode::FilterError => "filter_error",
            ErrorCode::InternalError => "internal_error",
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::Conflict => StatusCode::CONFLICT,
            ErrorCode::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::ValidationError => StatusCode::BAD_REQUEST,
            ErrorCode::FilterError | ErrorCode::InternalError => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Storage-layer error types
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization/deserialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{message}")]
    NotFound {
        message: String,
        uplink_errors: Vec<SyncError>,
    },

    #[error("{0}")]
    Conflict(String),

    #[error("{message}")]
    ServiceUnavailable {
        message: String,
        uplink_errors: Vec<SyncError>,
    },

    #[error("{0}")]
    BadRequest(String),

    #[error("Invalid metadata: {0}")]
    Validation(String),

    #[error("Metadata filter '{filter}' failed: {message}")]
    Filter { filter: String, message: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StoreError {
    /// A not-found error without any uplink diagnostics attached
    pub fn not_found(message: impl Into<String>) -> Self {
        StoreError::NotFound {
            message: message.into(),
            uplink_errors: Vec::new(),
        }
    }

    /// A service-unavailable error without any uplink diagnostics attached
    pub fn unavailable(message: impl Into<String>) -> Self {
        StoreError::ServiceUnavailable {
            message: message.into(),
            uplink_errors: Vec::new(),
        }
    }

    /// Get the appropriate error code for this error type
    pub fn error_code(&self) -> ErrorCode {
        match self {
            StoreError::NotFound { .. } => ErrorCode::NotFound,
            StoreError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => ErrorCode::NotFound,
            StoreError::Conflict(_) => ErrorCode::Conflict,
            StoreError::ServiceUnavailable { .. } => ErrorCode::ServiceUnavailable,
            StoreError::BadRequest(_) | StoreError::Validation(_) | StoreError::Json(_) => {
                ErrorCode::ValidationError
            }
            StoreError::Filter { .. } => ErrorCode::FilterError,
            StoreError::Io(_) | StoreError::Internal(_) => ErrorCode::InternalError,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.error_code() == ErrorCode::NotFound
    }

    /// Per-uplink diagnostics carried by aggregate failures
    pub fn uplink_errors(&self) -> &[SyncError] {
        match self {
            StoreError::NotFound { uplink_errors, .. }
            | StoreError::ServiceUnavailable { uplink_errors, .. } => uplink_errors,
            _ => &[],
        }
    }
}

/// Convenient result type for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Which collaborator produced a [`SyncError`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorSource {
    Uplink(String),
    Filter(String),
}

impl fmt::Display for ErrorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSource::Uplink(id) => write!(f, "uplink '{id}'"),
            ErrorSource::Filter(name) => write!(f, "filter '{name}'"),
        }
    }
}

/// Classification of a single-source failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncErrorKind {
    /// The source answered cleanly that it does not have the package
    NotFound,
    /// The request timed out
    Timeout,
    /// The connection was reset by the peer
    ConnectionReset,
    /// The source answered with an unexpected HTTP status
    Status(u16),
    /// Any other transport-level failure
    Transport,
    /// The response was not well-formed package metadata
    Validation,
    /// A metadata filter failed
    Filter,
}

impl SyncErrorKind {
    /// Timeouts and resets suggest the registry is unreachable rather than the
    /// package being absent.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, SyncErrorKind::Timeout | SyncErrorKind::ConnectionReset)
    }
}

/// The failure an uplink reports for one request, before it is tagged with the
/// uplink identity.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct UplinkFailure {
    pub kind: SyncErrorKind,
    pub message: String,
}

impl UplinkFailure {
    pub fn new(kind: SyncErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// A failure of one source during a synchronization pass.
///
/// These travel next to the merged record instead of failing the request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{origin}: {message}")]
pub struct SyncError {
    pub origin: ErrorSource,
    pub kind: SyncErrorKind,
    pub message: String,
}

impl SyncError {
    pub fn uplink(id: &str, failure: UplinkFailure) -> Self {
        Self {
            origin: ErrorSource::Uplink(id.to_string()),
            kind: failure.kind,
            message: failure.message,
        }
    }

    pub fn filter(name: &str, error: &StoreError) -> Self {
        Self {
            origin: ErrorSource::Filter(name.to_string()),
            kind: SyncErrorKind::Filter,
            message: error.to_string(),
        }
    }
}
