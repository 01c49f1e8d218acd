use std::time::Duration;
use thiserror::Error;

/// Boxed native error kept as the cause of a wrapped failure
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Unified error type for all integration operations
#[derive(Error, Debug)]
pub enum DataError {
    /// Unknown integration or missing backend record
    #[error("Not found: {0}")]
    NotFound(String),

    /// An integration with the same name is already registered
    #[error("Integration already registered: {0}")]
    AlreadyRegistered(String),

    /// The adapter does not provide a handler for an operation its schema declares
    #[error("Integration '{integration}' has no handler for declared operation '{operation}'")]
    MissingHandler {
        integration: String,
        operation: String,
    },

    /// Operation absent from the integration's schema
    #[error("Operation '{operation}' is not supported by integration '{integration}'")]
    UnsupportedOperation {
        integration: String,
        operation: String,
    },

    /// Missing or mistyped configuration/payload field, or payload kind mismatch
    #[error("Invalid configuration: {0}")]
    ConfigValidation(String),

    /// Client acquisition failed
    #[error("Connection to '{integration}' failed: {source}")]
    Connection {
        integration: String,
        #[source]
        source: BoxError,
    },

    /// Remote call failed after a client was acquired
    #[error("Query '{operation}' on '{integration}' failed: {source}")]
    BackendQuery {
        integration: String,
        operation: String,
        #[source]
        source: BoxError,
    },

    /// Adapter pool saturated for longer than its acquire timeout
    #[error("Connection pool for '{integration}' exhausted after {}ms", .waited.as_millis())]
    PoolExhausted {
        integration: String,
        waited: Duration,
    },

    /// Releasing the client failed. `prior` holds the execution error, if any.
    #[error(
        "Releasing client after '{operation}' on '{integration}' failed: {source}{}",
        prior_suffix(.prior)
    )]
    ResourceCleanup {
        integration: String,
        operation: String,
        #[source]
        source: BoxError,
        prior: Option<Box<DataError>>,
    },

    /// The caller cancelled the query
    #[error("Query '{operation}' on '{integration}' was cancelled")]
    Cancelled {
        integration: String,
        operation: String,
    },
}

fn prior_suffix(prior: &Option<Box<DataError>>) -> String {
    match prior {
        Some(err) => format!(" (after earlier error: {})", err),
        None => String::new(),
    }
}

impl DataError {
    /// Create a "not found" error with custom message
    pub fn not_found(msg: impl Into<String>) -> Self {
        DataError::NotFound(msg.into())
    }

    /// Create a configuration validation error
    pub fn config_validation(msg: impl Into<String>) -> Self {
        DataError::ConfigValidation(msg.into())
    }

    /// Create an unsupported operation error
    pub fn unsupported_operation(integration: &str, operation: &str) -> Self {
        DataError::UnsupportedOperation {
            integration: integration.to_string(),
            operation: operation.to_string(),
        }
    }

    pub(crate) fn cancelled(integration: &str, operation: &str) -> Self {
        DataError::Cancelled {
            integration: integration.to_string(),
            operation: operation.to_string(),
        }
    }

    /// Map a failed acquisition
    pub(crate) fn from_acquire(integration: &str, err: AdapterError) -> Self {
        match err {
            AdapterError::PoolExhausted(waited) => DataError::PoolExhausted {
                integration: integration.to_string(),
                waited,
            },
            AdapterError::Connection(source) | AdapterError::Backend(source) => {
                DataError::Connection {
                    integration: integration.to_string(),
                    source,
                }
            }
            AdapterError::NotFound(msg) => DataError::Connection {
                integration: integration.to_string(),
                source: msg.into(),
            },
        }
    }

    /// Map a failed adapter call, keeping the native cause
    pub(crate) fn from_execution(integration: &str, operation: &str, err: AdapterError) -> Self {
        match err {
            AdapterError::NotFound(msg) => {
                DataError::NotFound(format!("{} ({}.{})", msg, integration, operation))
            }
            AdapterError::PoolExhausted(waited) => DataError::PoolExhausted {
                integration: integration.to_string(),
                waited,
            },
            AdapterError::Backend(source) => DataError::BackendQuery {
                integration: integration.to_string(),
                operation: operation.to_string(),
                source,
            },
            other @ AdapterError::Connection(_) => DataError::BackendQuery {
                integration: integration.to_string(),
                operation: operation.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// Map a failed release, chaining the earlier error when there was one
    pub(crate) fn from_cleanup(
        integration: &str,
        operation: &str,
        err: AdapterError,
        prior: Option<DataError>,
    ) -> Self {
        let source: BoxError = match err {
            AdapterError::Backend(source) | AdapterError::Connection(source) => source,
            other => Box::new(other),
        };
        DataError::ResourceCleanup {
            integration: integration.to_string(),
            operation: operation.to_string(),
            source,
            prior: prior.map(Box::new),
        }
    }

    /// The execution error a cleanup failure was chained onto
    pub fn prior(&self) -> Option<&DataError> {
        match self {
            DataError::ResourceCleanup { prior, .. } => prior.as_deref(),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DataError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, DataError>;

/// Error returned by adapters. The dispatcher wraps it with integration and
/// operation names before it reaches the caller.
#[derive(Error, Debug)]
pub enum AdapterError {
    /// The targeted record does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// The backend could not be reached
    #[error("Connection failed: {0}")]
    Connection(#[source] BoxError),

    /// No pool slot became free within the timeout
    #[error("Connection pool exhausted after {}ms", .0.as_millis())]
    PoolExhausted(Duration),

    /// Native backend failure
    #[error("{0}")]
    Backend(#[source] BoxError),
}

impl AdapterError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        AdapterError::NotFound(msg.into())
    }

    pub fn connection(err: impl Into<BoxError>) -> Self {
        AdapterError::Connection(err.into())
    }

    pub fn backend(err: impl Into<BoxError>) -> Self {
        AdapterError::Backend(err.into())
    }
}

pub type AdapterResult<T> = std::result::Result<T, AdapterError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_execution_not_found_maps_to_not_found() {
        let err = DataError::from_execution("couchdb", "delete", AdapterError::not_found("doc x"));
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "Not found: doc x (couchdb.delete)");
    }

    #[test]
    fn test_backend_error_keeps_cause() {
        let err = DataError::from_execution(
            "postgres",
            "read",
            AdapterError::backend("relation \"users\" does not exist"),
        );
        match &err {
            DataError::BackendQuery {
                integration,
                operation,
                source,
            } => {
                assert_eq!(integration, "postgres");
                assert_eq!(operation, "read");
                assert_eq!(source.to_string(), "relation \"users\" does not exist");
            }
            other => panic!("Expected BackendQuery, got: {:?}", other),
        }
        assert!(err.source().is_some());
    }

    #[test]
    fn test_cleanup_chains_prior_error() {
        let prior = DataError::from_execution("mongodb", "read", AdapterError::backend("boom"));
        let err = DataError::from_cleanup(
            "mongodb",
            "read",
            AdapterError::backend("socket closed"),
            Some(prior),
        );
        assert!(matches!(err.prior(), Some(DataError::BackendQuery { .. })));
        let message = err.to_string();
        assert!(message.contains("socket closed"));
        assert!(message.contains("boom"));
    }

    #[test]
    fn test_acquire_pool_exhausted() {
        let err = DataError::from_acquire(
            "postgres",
            AdapterError::PoolExhausted(Duration::from_millis(250)),
        );
        assert_eq!(
            err.to_string(),
            "Connection pool for 'postgres' exhausted after 250ms"
        );
    }
}
