//! Error taxonomy and transport error mapping

use serde::Serialize;
use thiserror::Error;

/// Result type for this crate
pub type Result<T> = std::result::Result<T, Error>;

/// Rejection code for a required parameter that is missing or of the wrong type
pub const ERROR_MISSING_REQUIRED_PARAMETER: &str = "ERROR_MISSING_REQUIRED_PARAMETER";
/// Rejection code for a required string parameter that is empty
pub const ERROR_UNEXPECTED_EMPTY_VALUE: &str = "ERROR_UNEXPECTED_EMPTY_VALUE";
/// Rejection code for a parameter with an unaccepted value
pub const ERROR_INVALID_VALUE: &str = "ERROR_INVALID_VALUE";
/// Rejection code for a host that could not be resolved
pub const ERROR_UNKNOWN_HOST: &str = "ERROR_UNKNOWN_HOST";
/// Rejection code for a request that was cancelled
pub const ERROR_CANCELED_EXCEPTION: &str = "ERROR_CANCELED_EXCEPTION";
/// Rejection code for a recoverable runtime fault
pub const ERROR_UNEXPECTED_EXCEPTION: &str = "ERROR_UNEXPECTED_EXCEPTION";
/// Rejection code for an unanticipated fault
pub const ERROR_UNEXPECTED_ERROR: &str = "ERROR_UNEXPECTED_ERROR";

/// Every way a courier request can be rejected
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// A required parameter is absent or has the wrong type
    #[error("`{name}` is a required parameter of type `{expected}`")]
    MissingParameter {
        /// Parameter name
        name: String,
        /// Expected type name
        expected: String,
    },

    /// The key is absent or its value is null
    #[error("Key `{name}` does not exist")]
    KeyDoesNotExist {
        /// Parameter name
        name: String,
    },

    /// A required string parameter is empty
    #[error("Parameter `{name}` cannot be empty")]
    EmptyValue {
        /// Parameter name
        name: String,
    },

    /// A parameter holds a value outside its accepted domain
    #[error("Parameter `{name}` has an invalid value (received: {received})")]
    InvalidValue {
        /// Parameter name
        name: String,
        /// The raw value received
        received: String,
    },

    /// The remote host could not be resolved
    #[error("Unknown host: {message}")]
    UnknownHost {
        /// Transport message
        message: String,
    },

    /// The request was cancelled
    #[error("Request was cancelled")]
    Cancelled,

    /// A recoverable runtime fault, usually from the transport or the filesystem
    #[error("An unexpected exception occurred: {message}")]
    UnexpectedException {
        /// Fault description
        message: String,
    },

    /// An unanticipated fault such as a panicking worker
    #[error("An unexpected error occurred: {message}")]
    UnexpectedError {
        /// Fault description
        message: String,
    },
}

/// Serializable rejection handed back across the bridge
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorPayload {
    /// Stable error code
    pub code: &'static str,
    /// Human readable message
    pub message: String,
}

impl Error {
    pub(crate) fn missing(name: impl Into<String>, expected: impl Into<String>) -> Self {
        Error::MissingParameter {
            name: name.into(),
            expected: expected.into(),
        }
    }

    pub(crate) fn no_key(name: impl Into<String>) -> Self {
        Error::KeyDoesNotExist { name: name.into() }
    }

    pub(crate) fn empty(name: impl Into<String>) -> Self {
        Error::EmptyValue { name: name.into() }
    }

    pub(crate) fn invalid(name: impl Into<String>, received: impl Into<String>) -> Self {
        Error::InvalidValue {
            name: name.into(),
            received: received.into(),
        }
    }

    pub(crate) fn exception(message: impl Into<String>) -> Self {
        Error::UnexpectedException {
            message: message.into(),
        }
    }

    /// The stable code callers may branch on
    pub fn code(&self) -> &'static str {
        match self {
            Error::MissingParameter { .. } | Error::KeyDoesNotExist { .. } => {
                ERROR_MISSING_REQUIRED_PARAMETER
            }
            Error::EmptyValue { .. } => ERROR_UNEXPECTED_EMPTY_VALUE,
            Error::InvalidValue { .. } => ERROR_INVALID_VALUE,
            Error::UnknownHost { .. } => ERROR_UNKNOWN_HOST,
            Error::Cancelled => ERROR_CANCELED_EXCEPTION,
            Error::UnexpectedException { .. } => ERROR_UNEXPECTED_EXCEPTION,
            Error::UnexpectedError { .. } => ERROR_UNEXPECTED_ERROR,
        }
    }

    /// Whether this error was raised while validating parameters
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::MissingParameter { .. }
                | Error::KeyDoesNotExist { .. }
                | Error::EmptyValue { .. }
                | Error::InvalidValue { .. }
        )
    }

    /// Build the `{code, message}` rejection payload
    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            code: self.code(),
            message: self.to_string(),
        }
    }

    /// Map a join failure of a request worker
    pub(crate) fn from_join(error: tokio::task::JoinError) -> Self {
        if error.is_cancelled() {
            return Error::Cancelled;
        }

        match error.try_into_panic() {
            Ok(panic) => Error::from_panic(panic),
            Err(e) => Error::UnexpectedError {
                message: e.to_string(),
            },
        }
    }

    /// Map a caught panic payload of a request worker
    pub(crate) fn from_panic(panic: Box<dyn std::any::Any + Send>) -> Self {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "request worker panicked".to_string());

        Error::UnexpectedError { message }
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::exception(error.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Self {
        if is_resolution_failure(&error) {
            return Error::UnknownHost {
                message: error_chain(&error),
            };
        }

        Error::exception(error_chain(&error))
    }
}

fn is_resolution_failure(error: &reqwest::Error) -> bool {
    if !error.is_connect() {
        return false;
    }

    let chain = error_chain(error).to_ascii_lowercase();
    ["dns error", "failed to lookup address", "name or service not known", "no such host"]
        .iter()
        .any(|marker| chain.contains(marker))
}

fn error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();

    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }

    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(Error::missing("url", "String").code(), ERROR_MISSING_REQUIRED_PARAMETER);
        assert_eq!(Error::no_key("url").code(), ERROR_MISSING_REQUIRED_PARAMETER);
        assert_eq!(Error::empty("url").code(), ERROR_UNEXPECTED_EMPTY_VALUE);
        assert_eq!(Error::invalid("target", "bogus").code(), ERROR_INVALID_VALUE);
        assert_eq!(Error::Cancelled.code(), ERROR_CANCELED_EXCEPTION);
        assert_eq!(Error::exception("boom").code(), ERROR_UNEXPECTED_EXCEPTION);
    }

    #[test]
    fn test_payload_carries_received_value() {
        let payload = Error::invalid("target", "bogus").to_payload();
        assert_eq!(payload.code, ERROR_INVALID_VALUE);
        assert!(payload.message.contains("bogus"));
    }

    #[test]
    fn test_io_error_is_exception() {
        let error: Error = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert_eq!(error.code(), ERROR_UNEXPECTED_EXCEPTION);
        assert!(!error.is_validation());
    }

    #[tokio::test]
    async fn test_panicking_worker_is_unexpected_error() {
        let handle = tokio::spawn(async { panic!("kaboom") });
        let error = Error::from_join(handle.await.unwrap_err());
        assert_eq!(error, Error::UnexpectedError { message: "kaboom".to_string() });
    }
}
