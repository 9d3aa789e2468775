//! Error types for permission resolution

use thiserror::Error;

/// Permission resolution errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthzError {
    /// The role hierarchy contains a cycle; `cycle` lists the roles that
    /// could not be ordered.
    #[error("Circular role inheritance detected: {}", .cycle.join(" -> "))]
    CycleDetected { cycle: Vec<String> },

    /// Role referenced by a rule or a parent edge does not exist
    #[error("Unknown role: {0}")]
    UnknownRole(String),

    /// Resource key referenced by a rule is not registered
    #[error("Unknown resource key: {0}")]
    UnknownResourceKey(String),

    /// Role definitions must carry a name
    #[error("Role name cannot be empty")]
    EmptyRoleName,

    /// A role lists a blank parent
    #[error("Role '{0}' lists an empty parent role name")]
    EmptyParentName(String),

    /// Access to a resource was refused for the role
    #[error("Access to '{key}' is not allowed for role '{role}'")]
    Unauthorized { role: String, key: String },

    /// Backing store failure
    #[error("Store error: {0}")]
    Store(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for AuthzError {
    fn from(err: serde_json::Error) -> Self {
        AuthzError::Config(err.to_string())
    }
}

impl From<std::io::Error> for AuthzError {
    fn from(err: std::io::Error) -> Self {
        AuthzError::Store(err.to_string())
    }
}

/// Result type for permission operations
pub type Result<T> = std::result::Result<T, AuthzError>;
