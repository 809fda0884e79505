use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Shared, cloneable handle to an underlying backend error.
pub type Source = Arc<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Every failure the mapper can report.
///
/// The error is `Clone` so a failed lazy field can hand the same error to
/// every caller that awaits it. Backend errors are kept as `source`.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Source>,
    },

    #[error("query error: {message}")]
    Query {
        message: String,
        #[source]
        source: Option<Source>,
    },

    #[error("constraint violated: {message}")]
    Constraint {
        message: String,
        #[source]
        source: Option<Source>,
    },

    #[error("transaction error: {message}")]
    Transaction {
        message: String,
        #[source]
        source: Option<Source>,
    },

    #[error("invalid query: {message}")]
    InvalidQuery { message: String },

    #[error("query on {expected} references fields of {found}")]
    CrossModelQuery { expected: String, found: String },

    #[error("no {model} matched the query")]
    NoResult { model: String },

    #[error("schema error: {message}")]
    Schema {
        message: String,
        #[source]
        source: Option<Source>,
    },

    #[error("internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Source>,
    },
}

/// Fieldless mirror of [`Error`] for branching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Connection,
    Query,
    Constraint,
    Transaction,
    InvalidQuery,
    CrossModelQuery,
    NoResult,
    Schema,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Connection => write!(f, "Connection Error"),
            ErrorKind::Query => write!(f, "Query Error"),
            ErrorKind::Constraint => write!(f, "Constraint Error"),
            ErrorKind::Transaction => write!(f, "Transaction Error"),
            ErrorKind::InvalidQuery => write!(f, "Invalid Query"),
            ErrorKind::CrossModelQuery => write!(f, "Cross-Model Query"),
            ErrorKind::NoResult => write!(f, "No Result"),
            ErrorKind::Schema => write!(f, "Schema Error"),
            ErrorKind::Internal => write!(f, "Internal Error"),
        }
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Connection { .. } => ErrorKind::Connection,
            Error::Query { .. } => ErrorKind::Query,
            Error::Constraint { .. } => ErrorKind::Constraint,
            Error::Transaction { .. } => ErrorKind::Transaction,
            Error::InvalidQuery { .. } => ErrorKind::InvalidQuery,
            Error::CrossModelQuery { .. } => ErrorKind::CrossModelQuery,
            Error::NoResult { .. } => ErrorKind::NoResult,
            Error::Schema { .. } => ErrorKind::Schema,
            Error::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Build an error of `kind` that wraps a backend error.
    ///
    /// Kinds without a source slot fall back to their plain form.
    pub fn with_source<E>(kind: ErrorKind, message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        let message = message.into();
        let source: Option<Source> = Some(Arc::new(source));
        match kind {
            ErrorKind::Connection => Error::Connection { message, source },
            ErrorKind::Query => Error::Query { message, source },
            ErrorKind::Constraint => Error::Constraint { message, source },
            ErrorKind::Transaction => Error::Transaction { message, source },
            ErrorKind::Schema => Error::Schema { message, source },
            ErrorKind::Internal => Error::Internal { message, source },
            ErrorKind::InvalidQuery => Error::InvalidQuery { message },
            ErrorKind::NoResult => Error::NoResult { model: message },
            ErrorKind::CrossModelQuery => Error::CrossModelQuery {
                expected: message,
                found: String::new(),
            },
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Error::Connection {
            message: message.into(),
            source: None,
        }
    }

    pub fn query(message: impl Into<String>) -> Self {
        Error::Query {
            message: message.into(),
            source: None,
        }
    }

    pub fn constraint(message: impl Into<String>) -> Self {
        Error::Constraint {
            message: message.into(),
            source: None,
        }
    }

    pub fn transaction(message: impl Into<String>) -> Self {
        Error::Transaction {
            message: message.into(),
            source: None,
        }
    }

    pub fn invalid_query(message: impl Into<String>) -> Self {
        Error::InvalidQuery {
            message: message.into(),
        }
    }

    pub fn cross_model(expected: impl Into<String>, found: impl Into<String>) -> Self {
        Error::CrossModelQuery {
            expected: expected.into(),
            found: found.into(),
        }
    }

    pub fn no_result(model: impl Into<String>) -> Self {
        Error::NoResult {
            model: model.into(),
        }
    }

    pub fn schema(message: impl Into<String>) -> Self {
        Error::Schema {
            message: message.into(),
            source: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// Re-tag the error as a transaction failure, keeping the original as source.
    pub fn into_transaction(self, message: impl Into<String>) -> Self {
        match self {
            Error::Transaction { .. } => self,
            other => Error::with_source(ErrorKind::Transaction, message, other),
        }
    }

    /// Re-tag the error as a schema failure, keeping the original as source.
    pub fn into_schema(self, message: impl Into<String>) -> Self {
        match self {
            Error::Schema { .. } => self,
            other => Error::with_source(ErrorKind::Schema, message, other),
        }
    }
}
