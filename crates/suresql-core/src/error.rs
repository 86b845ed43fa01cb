//! Error types for the SureSQL node
//!
//! Provides granular error classification for the gateway boundary:
//! - Authentication family (missing/invalid/expired token, bad credentials)
//! - Pool admission failures
//! - Driver/operational failures
//! - `NoRows`, which is never surfaced as a boundary failure; the
//!   dispatcher converts it to an empty result set

use std::fmt;
use thiserror::Error;

/// Result type for SureSQL operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for classification and status mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Malformed input
    Validation,
    /// Authentication family (401)
    Authentication,
    /// Blocked by table-access policy
    Authorization,
    /// Entity lookup failed
    NotFound,
    /// Entity already exists
    Conflict,
    /// Pool admission failure
    PoolExhausted,
    /// Operational failure from a driver
    Driver,
    /// Empty result set marker, not a failure
    NoRows,
    /// Request cancelled before completion
    Cancelled,
    /// Anything else
    Internal,
}

/// Main error type for the SureSQL node
#[derive(Error, Debug)]
pub enum Error {
    /// Input malformed
    #[error("validation error: {message}")]
    Validation {
        message: String,
    },

    /// No bearer token presented
    #[error("missing token")]
    MissingToken,

    /// Token not found in the store
    #[error("invalid token")]
    InvalidToken,

    /// Token past its expiry
    #[error("token expired")]
    TokenExpired,

    /// Username/password rejected; deliberately generic
    #[error("invalid credentials")]
    InvalidCredentials,

    /// Blocked by table-access policy
    #[error("forbidden: {message}")]
    Forbidden {
        message: String,
    },

    /// Lookup failed
    #[error("not found: {message}")]
    NotFound {
        message: String,
    },

    /// Already exists
    #[error("conflict: {message}")]
    Conflict {
        message: String,
    },

    /// Pool admission failed
    #[error("pool exhausted: {message}")]
    PoolExhausted {
        message: String,
    },

    /// No active connection for the presented token
    #[error("no db connection")]
    NoConnection,

    /// Operational failure from the driver, annotated with the operation label
    #[error("driver error in {operation}: {message}")]
    Driver {
        operation: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Statement produced zero rows; callers convert to an empty result
    #[error("no rows in result set")]
    NoRows,

    /// Request cancelled before completion
    #[error("request cancelled")]
    Cancelled,

    /// Configuration error
    #[error("configuration error: {message}")]
    Configuration {
        message: String,
    },

    /// Internal error
    #[error("internal error: {message}")]
    Internal {
        message: String,
    },
}

impl Error {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation { .. } => ErrorCategory::Validation,
            Self::MissingToken
            | Self::InvalidToken
            | Self::TokenExpired
            | Self::InvalidCredentials
            | Self::NoConnection => ErrorCategory::Authentication,
            Self::Forbidden { .. } => ErrorCategory::Authorization,
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::Conflict { .. } => ErrorCategory::Conflict,
            Self::PoolExhausted { .. } => ErrorCategory::PoolExhausted,
            Self::Driver { .. } => ErrorCategory::Driver,
            Self::NoRows => ErrorCategory::NoRows,
            Self::Cancelled => ErrorCategory::Cancelled,
            Self::Configuration { .. } | Self::Internal { .. } => ErrorCategory::Internal,
        }
    }

    /// HTTP-style status code for the boundary response
    pub fn status_code(&self) -> u16 {
        match self.category() {
            ErrorCategory::Validation => 400,
            ErrorCategory::Authentication => 401,
            ErrorCategory::Authorization => 403,
            ErrorCategory::NotFound => 404,
            ErrorCategory::Conflict => 409,
            ErrorCategory::PoolExhausted => 503,
            ErrorCategory::Driver | ErrorCategory::Internal => 500,
            ErrorCategory::Cancelled => 499,
            // Never reaches the boundary; mapped to an empty result upstream.
            ErrorCategory::NoRows => 200,
        }
    }

    /// Whether this is the `no-rows` marker
    #[inline]
    pub fn is_no_rows(&self) -> bool {
        matches!(self, Self::NoRows)
    }

    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a forbidden error
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden {
            message: message.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Create a conflict error
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Create a pool-exhausted error
    pub fn pool_exhausted(message: impl Into<String>) -> Self {
        Self::PoolExhausted {
            message: message.into(),
        }
    }

    /// Create a driver error with an operation label
    pub fn driver(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Driver {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a driver error wrapping an underlying cause
    pub fn driver_with_source(
        operation: impl Into<String>,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Driver {
            operation: operation.into(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Re-annotate a driver error with a different operation label.
    ///
    /// Non-driver errors pass through unchanged.
    pub fn with_operation(self, operation: impl Into<String>) -> Self {
        match self {
            Self::Driver {
                message, source, ..
            } => Self::Driver {
                operation: operation.into(),
                message,
                source,
            },
            other => other,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::Authentication => write!(f, "authentication"),
            Self::Authorization => write!(f, "authorization"),
            Self::NotFound => write!(f, "not_found"),
            Self::Conflict => write!(f, "conflict"),
            Self::PoolExhausted => write!(f, "pool_exhausted"),
            Self::Driver => write!(f, "driver"),
            Self::NoRows => write!(f, "no_rows"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_mapping() {
        assert_eq!(
            Error::validation("bad").category(),
            ErrorCategory::Validation
        );
        assert_eq!(
            Error::InvalidCredentials.category(),
            ErrorCategory::Authentication
        );
        assert_eq!(Error::NoRows.category(), ErrorCategory::NoRows);
        assert_eq!(
            Error::pool_exhausted("full").category(),
            ErrorCategory::PoolExhausted
        );
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(Error::validation("bad").status_code(), 400);
        assert_eq!(Error::MissingToken.status_code(), 401);
        assert_eq!(Error::InvalidToken.status_code(), 401);
        assert_eq!(Error::forbidden("internal table").status_code(), 403);
        assert_eq!(Error::not_found("user").status_code(), 404);
        assert_eq!(Error::conflict("exists").status_code(), 409);
        assert_eq!(Error::pool_exhausted("full").status_code(), 503);
        assert_eq!(Error::driver("SelectMany", "boom").status_code(), 500);
    }

    #[test]
    fn test_no_rows_marker() {
        assert!(Error::NoRows.is_no_rows());
        assert!(!Error::driver("SelectOne", "boom").is_no_rows());
    }

    #[test]
    fn test_with_operation_relabels_driver_errors() {
        let err = Error::driver("ExecOneSQL", "syntax error").with_operation("ExecManySQL");
        match err {
            Error::Driver { operation, .. } => assert_eq!(operation, "ExecManySQL"),
            other => panic!("unexpected error: {other}"),
        }

        // Non-driver errors keep their shape
        let err = Error::NoRows.with_operation("SelectMany");
        assert!(err.is_no_rows());
    }
}
