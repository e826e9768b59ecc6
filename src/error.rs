use serde::{Deserialize, Serialize};
use tracing::error;
use uuid::Uuid;

/// A single invalid field reported back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Domain error taxonomy. `NotFound` is a store-level signal that the
/// service layer translates into the operation-appropriate `BadRequest`
/// or `Unauthorized`; it is not meant to reach external callers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("validation failed")]
    Validation(Vec<FieldError>),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("no data found")]
    NotFound,

    /// Unexpected failure. The full cause is logged server-side; callers
    /// only see the correlation id.
    #[error("internal error [{id}]")]
    Internal {
        id: Uuid,
        #[source]
        source: anyhow::Error,
    },
}

impl Error {
    pub fn bad_request(cause: impl Into<String>) -> Self {
        Error::BadRequest(cause.into())
    }

    pub fn unauthorized(cause: impl Into<String>) -> Self {
        Error::Unauthorized(cause.into())
    }

    /// A validation failure naming a single field.
    pub fn field(field: &str, message: &str) -> Self {
        Error::Validation(vec![FieldError::new(field, message)])
    }

    /// Wraps an unexpected failure. Logs the full cause and returns an
    /// opaque correlation id in its place.
    pub fn internal(source: impl Into<anyhow::Error>, msg: &'static str) -> Self {
        let id = Uuid::new_v4();
        let source = source.into().context(msg);
        error!(correlation_id = %id, error = ?source, "internal error");
        Error::Internal { id, source }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
