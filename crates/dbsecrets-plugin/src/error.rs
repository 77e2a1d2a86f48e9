//! Error types for dbsecrets plugins
//!
//! Every failure that crosses the host boundary is one of the variants below.
//! Driver errors are wrapped as [`Error::Statement`] and keep the backend's
//! classifier code so the lifecycle can recognise statements that must be
//! re-run outside a transaction.

use std::fmt;
use thiserror::Error;

use crate::secrets::SecretValues;

/// Result type for plugin operations
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed driver error kept as the source of a wrapped error
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error categories reported to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Empty or malformed configuration
    Configuration,
    /// Operation invoked before a successful initialize
    NotInitialized,
    /// Database could not be reached or failed its liveness probe
    Reachability,
    /// Request failed validation before touching the database
    InvalidRequest,
    /// Username template failed to compile or render
    Template,
    /// The database rejected an administrative statement
    Statement,
    /// Existence probe found no such user
    UserNotFound,
    /// Revocation sweep finished with failures
    PartialRevocation,
    /// Feature not available for this backend
    Unsupported,
    /// Unexpected internal failure
    Internal,
}

impl ErrorCategory {
    /// Whether the host may reasonably retry the operation
    #[inline]
    pub const fn is_retriable(self) -> bool {
        matches!(self, Self::Reachability)
    }
}

/// Main error type for dbsecrets plugins
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    /// Invalid plugin configuration
    #[error("invalid configuration: {message}")]
    Configuration { message: String },

    /// Plugin used before initialize succeeded
    #[error("plugin has not been initialized")]
    NotInitialized,

    /// Connection could not be established or verified
    #[error("unable to connect to database: {message}")]
    Reachability {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// New user requested without creation statements
    #[error("empty creation statements")]
    EmptyCreationStatements,

    /// Update requested without password or expiration change
    #[error("no changes requested")]
    NoChanges,

    /// Request rejected before execution
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    /// Username template error
    #[error("{message}")]
    Template { message: String },

    /// Administrative statement failed
    #[error("statement execution failed: {message}")]
    Statement {
        message: String,
        code: Option<String>,
        #[source]
        source: Option<BoxError>,
    },

    /// User does not exist
    #[error("user {username:?} does not exist")]
    UserNotFound { username: String },

    /// One or more revocation statements failed
    #[error("failed to revoke user: {}", join_errors(.errors))]
    PartialRevocation { errors: Vec<Error> },

    /// Creation failed and the follow-up rollback failed as well
    #[error("{original}; rollback statements also failed: {rollback}")]
    Rollback {
        #[source]
        original: Box<Error>,
        rollback: Box<Error>,
    },

    /// Unsupported operation for this backend
    #[error("unsupported: {message}")]
    Unsupported { message: String },

    /// Internal error
    #[error("internal error: {message}")]
    Internal { message: String },

    /// Error whose text has been scrubbed of secret values
    #[error("{message}")]
    Sanitized {
        category: ErrorCategory,
        message: String,
        #[source]
        source: Option<Box<RedactedCause>>,
    },
}

/// One link of a sanitized error chain
#[derive(Error, Debug)]
#[error("{message}")]
pub struct RedactedCause {
    message: String,
    #[source]
    source: Option<Box<RedactedCause>>,
}

fn join_errors(errors: &[Error]) -> String {
    match errors {
        [] => "no errors recorded".to_string(),
        [single] => single.to_string(),
        many => {
            let parts: Vec<String> = many.iter().map(|e| format!("* {e}")).collect();
            format!("{} errors occurred: {}", many.len(), parts.join("; "))
        }
    }
}

impl Error {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::NotInitialized => ErrorCategory::NotInitialized,
            Self::Reachability { .. } => ErrorCategory::Reachability,
            Self::EmptyCreationStatements | Self::NoChanges | Self::InvalidRequest { .. } => {
                ErrorCategory::InvalidRequest
            }
            Self::Template { .. } => ErrorCategory::Template,
            Self::Statement { .. } => ErrorCategory::Statement,
            Self::UserNotFound { .. } => ErrorCategory::UserNotFound,
            Self::PartialRevocation { .. } => ErrorCategory::PartialRevocation,
            Self::Rollback { original, .. } => original.category(),
            Self::Unsupported { .. } => ErrorCategory::Unsupported,
            Self::Internal { .. } => ErrorCategory::Internal,
            Self::Sanitized { category, .. } => *category,
        }
    }

    /// Whether this error is retriable
    #[inline]
    pub fn is_retriable(&self) -> bool {
        self.category().is_retriable()
    }

    /// Backend classifier code attached to a statement error
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Statement { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a reachability error
    pub fn reachability(message: impl Into<String>) -> Self {
        Self::Reachability {
            message: message.into(),
            source: None,
        }
    }

    /// Create a reachability error with source
    pub fn reachability_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Reachability {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an invalid request error
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Create a template error
    pub fn template(message: impl Into<String>) -> Self {
        Self::Template {
            message: message.into(),
        }
    }

    /// Create a statement error without classifier code
    pub fn statement(message: impl Into<String>) -> Self {
        Self::Statement {
            message: message.into(),
            code: None,
            source: None,
        }
    }

    /// Create a statement error carrying the backend classifier code
    pub fn statement_with_code(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self::Statement {
            message: message.into(),
            code: Some(code.into()),
            source: None,
        }
    }

    /// Wrap a driver error, keeping its text, code and source chain
    pub fn statement_with_source(
        code: Option<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Statement {
            message: source.to_string(),
            code,
            source: Some(Box::new(source)),
        }
    }

    /// Create a user-not-found error
    pub fn user_not_found(username: impl Into<String>) -> Self {
        Self::UserNotFound {
            username: username.into(),
        }
    }

    /// Combine creation and rollback failures
    pub fn rollback(original: Error, rollback: Error) -> Self {
        Self::Rollback {
            original: Box::new(original),
            rollback: Box::new(rollback),
        }
    }

    /// Create an unsupported operation error
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Rebuild this error with every secret value replaced by its token.
    ///
    /// The message and each cause in the source chain are rendered to text and
    /// scrubbed independently; the category is preserved.
    pub fn redact(&self, secrets: &SecretValues) -> Error {
        let message = secrets.redact(&self.to_string());

        let mut causes = Vec::new();
        let mut next = std::error::Error::source(self);
        while let Some(cause) = next {
            causes.push(secrets.redact(&cause.to_string()));
            next = cause.source();
        }

        let source = causes.into_iter().rev().fold(None, |inner, message| {
            Some(Box::new(RedactedCause {
                message,
                source: inner,
            }))
        });

        Error::Sanitized {
            category: self.category(),
            message,
            source,
        }
    }

    /// Prefix the message with the failing operation, keeping the category
    pub fn in_operation(self, operation: &str) -> Error {
        let category = self.category();
        let message = format!("{operation}: {self}");
        let source = match self {
            Error::Sanitized { source, .. } => source,
            other => Some(Box::new(RedactedCause {
                message: other.to_string(),
                source: None,
            })),
        };
        Error::Sanitized {
            category,
            message,
            source,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration"),
            Self::NotInitialized => write!(f, "not_initialized"),
            Self::Reachability => write!(f, "reachability"),
            Self::InvalidRequest => write!(f, "invalid_request"),
            Self::Template => write!(f, "template"),
            Self::Statement => write!(f, "statement"),
            Self::UserNotFound => write!(f, "user_not_found"),
            Self::PartialRevocation => write!(f, "partial_revocation"),
            Self::Unsupported => write!(f, "unsupported"),
            Self::Internal => write!(f, "internal"),
        }
    }
}
