//! Error types.
//!
//! Unprocessed keys and items are never errors: they are retried or handed back to the
//! caller. Only configuration mistakes, value conversion failures and outright remote
//! failures surface here.

use aws_sdk_dynamodb::error::{BuildError, DisplayErrorContext, SdkError};
use std::{error, fmt};
use thiserror::Error;

/// The main error type of the crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid options, rejected before any remote call is issued.
    #[error("Configuration error: {message}")]
    Configuration {
        /// What was wrong with the options
        message: String,
    },

    /// A value could not be converted to or from a DynamoDB attribute value.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_dynamo::Error),

    /// A DynamoDB request could not be built.
    #[error("Request build error: {0}")]
    Build(#[from] BuildError),

    /// A remote call failed outright.
    #[error("Store error: {message}")]
    Store {
        /// Error message, including the context of the underlying error
        message: String,
        /// The underlying error, if any
        #[source]
        source: Option<Box<dyn error::Error + Send + Sync>>,
    },

    /// An in-flight request task panicked or was aborted.
    #[error("Request task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl Error {
    /// Creates a new Configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new Store error without an underlying source.
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
            source: None,
        }
    }

    /// Returns true if this is a Configuration error.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration { .. })
    }

    /// Returns true if this is a Store error.
    pub fn is_store(&self) -> bool {
        matches!(self, Self::Store { .. })
    }
}

impl<E, R> From<SdkError<E, R>> for Error
where
    E: error::Error + Send + Sync + 'static,
    R: fmt::Debug + Send + Sync + 'static,
{
    fn from(error: SdkError<E, R>) -> Self {
        Self::Store {
            message: DisplayErrorContext(&error).to_string(),
            source: Some(Box::new(error)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rstest::rstest;

    #[rstest]
    #[case::configuration(Error::configuration("batch size must be positive"), "Configuration error: batch size must be positive")]
    #[case::store(Error::store("connection reset"), "Store error: connection reset")]
    fn test_error_display(#[case] error: Error, #[case] expected: &str) {
        assert_eq!(error.to_string(), expected);
    }

    #[test]
    fn test_error_predicates() {
        assert!(Error::configuration("a").is_configuration());
        assert!(!Error::configuration("a").is_store());
        assert!(Error::store("b").is_store());
    }
}
