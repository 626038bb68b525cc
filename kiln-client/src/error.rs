//! Error handling in [`kiln_client`][crate]
use thiserror::Error;

pub use kiln_core::ErrorResponse;

/// Possible errors when talking to the object store
#[derive(Error, Debug)]
pub enum Error {
    /// ApiError for when things fail
    ///
    /// Callers classify these with [`Error::is_not_found`] and friends.
    #[error("ApiError: {0} ({0:?})")]
    Api(#[source] ErrorResponse),

    /// Common error case when requesting parsing into own structs
    #[error("Error deserializing response: {0}")]
    SerdeError(#[source] serde_json::Error),

    /// Transport level failure
    #[error("ServiceError: {0}")]
    Service(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl From<ErrorResponse> for Error {
    fn from(e: ErrorResponse) -> Self {
        Error::Api(e)
    }
}

impl Error {
    fn api_code(&self) -> Option<(u16, &str)> {
        match self {
            Error::Api(e) => Some((e.code, e.reason.as_str())),
            _ => None,
        }
    }

    /// The object does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self.api_code(), Some((404, _)))
    }

    /// A create collided with an existing object of the same name
    pub fn is_already_exists(&self) -> bool {
        matches!(self.api_code(), Some((409, "AlreadyExists")))
    }

    /// A write raced with another writer
    pub fn is_conflict(&self) -> bool {
        matches!(self.api_code(), Some((409, "Conflict")))
    }
}
