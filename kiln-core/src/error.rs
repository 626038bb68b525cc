use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::BuildPhase;

/// Possible errors when working with build objects without a client
#[derive(Error, Debug)]
pub enum Error {
    /// The build has no build number annotation
    #[error("build {0} has no build number annotation")]
    MissingBuildNumber(String),

    /// The build number annotation is not a base 10 integer
    #[error("build {name} has an invalid build number {value:?}: {source}")]
    InvalidBuildNumber {
        /// Name of the build
        name: String,
        /// The annotation value
        value: String,
        /// Parse failure
        #[source]
        source: std::num::ParseIntError,
    },

    /// The requested phase change is not allowed by the build state machine
    #[error("invalid phase transition {from:?} -> {to:?}")]
    InvalidTransition {
        /// Phase of the build
        from: BuildPhase,
        /// Requested phase
        to: BuildPhase,
    },

    /// An object could not be serialized for patch creation
    #[error("failed to serialize object: {0}")]
    SerializePatch(#[source] serde_json::Error),
}

/// An error response from the API.
#[derive(Error, Deserialize, Serialize, Debug, Clone, Eq, PartialEq)]
#[error("{message}: {reason}")]
pub struct ErrorResponse {
    /// The status
    pub status: String,
    /// A message about the error
    #[serde(default)]
    pub message: String,
    /// The reason for the error
    #[serde(default)]
    pub reason: String,
    /// The error code
    pub code: u16,
}

impl ErrorResponse {
    fn failure(code: u16, reason: &str, message: String) -> Self {
        Self {
            status: "Failure".into(),
            message,
            reason: reason.into(),
            code,
        }
    }

    /// A 404 for the named object
    pub fn not_found(kind: &str, name: &str) -> Self {
        Self::failure(404, "NotFound", format!("{kind} \"{name}\" not found"))
    }

    /// A 409 returned when creating an object whose name is taken
    pub fn already_exists(kind: &str, name: &str) -> Self {
        Self::failure(409, "AlreadyExists", format!("{kind} \"{name}\" already exists"))
    }

    /// A 409 returned when a write raced with another writer
    pub fn conflict(kind: &str, name: &str) -> Self {
        Self::failure(
            409,
            "Conflict",
            format!("Operation cannot be fulfilled on {kind} \"{name}\": the object has been modified"),
        )
    }

    /// A 500 with an arbitrary message
    pub fn internal(message: impl Into<String>) -> Self {
        Self::failure(500, "InternalError", message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOT_FOUND: &str = r#"
    {
      "kind": "Status",
      "apiVersion": "v1",
      "metadata": {},
      "status": "Failure",
      "message": "pods \"ruby-1-build\" not found",
      "reason": "NotFound",
      "details": {
        "name": "ruby-1-build",
        "kind": "pods"
      },
      "code": 404
    }
    "#;

    #[test]
    fn deserializes_status() {
        let status: ErrorResponse = serde_json::from_str(NOT_FOUND).unwrap();
        assert_eq!(status.code, 404);
        assert_eq!(status.reason, "NotFound");
        assert_eq!(status, ErrorResponse::not_found("pods", "ruby-1-build"));
    }

    #[test]
    fn conflict_and_exists_share_code() {
        let exists = ErrorResponse::already_exists("pods", "a");
        let conflict = ErrorResponse::conflict("builds", "a");
        assert_eq!(exists.code, conflict.code);
        assert_ne!(exists.reason, conflict.reason);
    }
}
