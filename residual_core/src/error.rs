//! Error types for residual model operations
//!
//! Every fallible operation in the crate returns [`ResidualResult`]. Shape and
//! configuration checks run before any state is touched, so an error never
//! leaves the predictor or a disk buffer half-updated.

use std::fmt;
use std::io;

/// Result type alias for residual model operations
pub type ResidualResult<T> = Result<T, ResidualError>;

/// Error type shared by the selector, predictor, strategies and facade
#[derive(Debug, Clone, PartialEq)]
pub enum ResidualError {
    /// Invalid construction parameter (empty mask, zero capacity, ...)
    Configuration {
        parameter: String,
        value: String,
        reason: String,
    },

    /// Array dimension did not match what the component was built for
    Shape {
        expected: usize,
        got: usize,
        context: String,
    },

    /// File open, append or rollback failure
    Io {
        context: String,
        kind: io::ErrorKind,
        message: String,
    },

    /// Malformed persisted row or configuration text
    Parse { context: String, details: String },

    /// Kernel matrix could not be factorized
    Numerical { context: String, details: String },
}

impl fmt::Display for ResidualError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResidualError::Configuration {
                parameter,
                value,
                reason,
            } => {
                write!(
                    f,
                    "Invalid configuration for parameter '{}' with value '{}': {}",
                    parameter, value, reason
                )
            }
            ResidualError::Shape {
                expected,
                got,
                context,
            } => {
                write!(
                    f,
                    "Shape mismatch in {}: expected {} dimensions, got {}",
                    context, expected, got
                )
            }
            ResidualError::Io {
                context,
                kind,
                message,
            } => {
                write!(f, "I/O error during {} ({:?}): {}", context, kind, message)
            }
            ResidualError::Parse { context, details } => {
                write!(f, "Failed to parse {}: {}", context, details)
            }
            ResidualError::Numerical { context, details } => {
                write!(f, "Numerical failure in {}: {}", context, details)
            }
        }
    }
}

impl std::error::Error for ResidualError {}

impl From<io::Error> for ResidualError {
    fn from(err: io::Error) -> Self {
        ResidualError::io("file access", &err)
    }
}

impl ResidualError {
    /// Create a configuration error
    pub fn configuration(
        parameter: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        ResidualError::Configuration {
            parameter: parameter.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// Create a shape mismatch error
    pub fn shape(expected: usize, got: usize, context: impl Into<String>) -> Self {
        ResidualError::Shape {
            expected,
            got,
            context: context.into(),
        }
    }

    /// Capture an `io::Error` in owned, clonable form
    pub fn io(context: impl Into<String>, err: &io::Error) -> Self {
        ResidualError::Io {
            context: context.into(),
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    /// Create a parse error
    pub fn parse(context: impl Into<String>, details: impl Into<String>) -> Self {
        ResidualError::Parse {
            context: context.into(),
            details: details.into(),
        }
    }

    /// Create a numerical failure error
    pub fn numerical(context: impl Into<String>, details: impl Into<String>) -> Self {
        ResidualError::Numerical {
            context: context.into(),
            details: details.into(),
        }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, ResidualError::Configuration { .. })
    }

    pub fn is_shape(&self) -> bool {
        matches!(self, ResidualError::Shape { .. })
    }

    pub fn is_io(&self) -> bool {
        matches!(self, ResidualError::Io { .. })
    }
}
