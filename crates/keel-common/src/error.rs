//! Error types for Keel controllers
//!
//! Errors are structured with fields to aid debugging in production.
//! Besides carrying context, the error type is what the reconcile loop uses to
//! decide how a failed sync is retried:
//!
//! - API conflicts and racing creates are expected and requeued quietly
//! - [`Error::NonRetriable`] is dropped from the queue and surfaced via status
//! - everything else is logged and requeued with backoff

use std::fmt::Write as _;

use kube::core::ErrorResponse;
use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// HTTP status returned by the API server for optimistic-concurrency failures and racing creates
const STATUS_CONFLICT: u16 = 409;
/// HTTP status returned for missing objects
const STATUS_NOT_FOUND: u16 = 404;
/// HTTP status returned for rejected (invalid) writes, including UID precondition mismatches
const STATUS_INVALID: u16 = 422;

/// Reason the API server reports on a create whose name is already taken
const REASON_ALREADY_EXISTS: &str = "AlreadyExists";

/// Main error type for Keel operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A required invariant on an object is not met (e.g. a required label is missing)
    #[error("validation error for {object}: {message}")]
    Validation {
        /// The object (`namespace/name`) with invalid configuration
        object: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "metadata.labels")
        field: Option<String>,
    },

    /// A permanent failure that retrying cannot fix
    #[error("non-retriable error for {object}: {message}")]
    NonRetriable {
        /// The object (`namespace/name`) the failure belongs to
        object: String,
        /// Description of what failed
        message: String,
    },

    /// A live object is controlled by someone other than the desired owner
    #[error("{kind} {object} isn't controlled by us: {message}")]
    OwnershipMismatch {
        /// Kind of the live object
        kind: String,
        /// The live object (`namespace/name`)
        object: String,
        /// Which controller the object references instead
        message: String,
    },

    /// A desired object carries no controller reference
    #[error("{kind} {object} is missing a controller reference")]
    MissingControllerRef {
        /// Kind of the desired object
        kind: String,
        /// The desired object (`namespace/name`)
        object: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// The operation observed shutdown of the controller
    #[error("cancelled [{context}]")]
    Cancelled {
        /// Where cancellation was observed
        context: String,
    },

    /// The operation exceeded its sync deadline
    #[error("deadline exceeded [{context}]")]
    DeadlineExceeded {
        /// Where the deadline was hit
        context: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "claim", "apply", "prune")
        context: String,
    },

    /// Several independent failures collected from one pass
    #[error("{}", format_aggregate(.0))]
    Aggregate(Vec<Error>),
}

fn format_aggregate(errors: &[Error]) -> String {
    let mut out = String::from("[");
    for (i, err) in errors.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        let _ = write!(out, "{err}");
    }
    out.push(']');
    out
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            object: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with object context and field path
    pub fn validation_for_field(
        object: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            object: object.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a permanent error that the reconcile loop will not retry
    pub fn non_retriable(object: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::NonRetriable {
            object: object.into(),
            message: msg.into(),
        }
    }

    /// Create an ownership mismatch error
    pub fn ownership_mismatch(
        kind: impl Into<String>,
        object: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::OwnershipMismatch {
            kind: kind.into(),
            object: object.into(),
            message: msg.into(),
        }
    }

    /// Create a missing controller reference error
    pub fn missing_controller_ref(kind: impl Into<String>, object: impl Into<String>) -> Self {
        Self::MissingControllerRef {
            kind: kind.into(),
            object: object.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create a cancellation error
    pub fn cancelled(context: impl Into<String>) -> Self {
        Self::Cancelled {
            context: context.into(),
        }
    }

    /// Create a deadline error
    pub fn deadline_exceeded(context: impl Into<String>) -> Self {
        Self::DeadlineExceeded {
            context: context.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Build an API status error as returned by the API server
    pub fn api_status(code: u16, reason: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Kube {
            source: kube::Error::Api(ErrorResponse {
                status: "Failure".to_string(),
                message: msg.into(),
                reason: reason.into(),
                code,
            }),
        }
    }

    /// Collapse a list of errors: none becomes `None`, one stays itself,
    /// several become an [`Error::Aggregate`]. Nested aggregates are flattened.
    pub fn reduce(errors: Vec<Error>) -> Option<Error> {
        let mut flat = Vec::with_capacity(errors.len());
        for err in errors {
            match err {
                Error::Aggregate(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => None,
            1 => flat.pop(),
            _ => Some(Error::Aggregate(flat)),
        }
    }

    /// [`Error::reduce`] as a `Result`
    pub fn aggregate(errors: Vec<Error>) -> crate::Result<()> {
        match Self::reduce(errors) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// The API status carried by this error, if it came from the API server
    pub fn api_response(&self) -> Option<&ErrorResponse> {
        match self {
            Error::Kube {
                source: kube::Error::Api(resp),
            } => Some(resp),
            _ => None,
        }
    }

    /// Optimistic-concurrency conflict (409 other than AlreadyExists)
    pub fn is_conflict(&self) -> bool {
        self.classify(&|resp: &ErrorResponse| {
            resp.code == STATUS_CONFLICT && resp.reason != REASON_ALREADY_EXISTS
        })
    }

    /// A create raced with another writer and lost
    pub fn is_already_exists(&self) -> bool {
        self.classify(&|resp: &ErrorResponse| {
            resp.code == STATUS_CONFLICT && resp.reason == REASON_ALREADY_EXISTS
        })
    }

    /// The object is gone
    pub fn is_not_found(&self) -> bool {
        self.classify(&|resp: &ErrorResponse| resp.code == STATUS_NOT_FOUND)
    }

    /// The write was rejected as invalid (this includes UID precondition mismatches on patches)
    pub fn is_invalid(&self) -> bool {
        self.classify(&|resp: &ErrorResponse| resp.code == STATUS_INVALID)
    }

    /// Whether retrying cannot fix this error
    ///
    /// An aggregate is non-retriable only when every member is.
    pub fn is_non_retriable(&self) -> bool {
        match self {
            Error::NonRetriable { .. } => true,
            Error::Aggregate(errors) => {
                !errors.is_empty() && errors.iter().all(Error::is_non_retriable)
            }
            _ => false,
        }
    }

    /// Whether the sync gave up because of its deadline or shutdown
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::Cancelled { .. } | Error::DeadlineExceeded { .. }
        )
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Cancelled { context } => Some(context),
            Error::DeadlineExceeded { context } => Some(context),
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }

    fn classify(&self, pred: &dyn Fn(&ErrorResponse) -> bool) -> bool {
        match self {
            Error::Aggregate(errors) => {
                !errors.is_empty() && errors.iter().all(|e| e.classify(pred))
            }
            other => other.api_response().is_some_and(|resp| pred(resp)),
        }
    }
}
