//! Error types for the vSphere cloud provider

use std::fmt;
use thiserror::Error;

/// Result type alias for provider operations
pub type Result<T> = std::result::Result<T, OperatorError>;

/// Why a selector term could not be turned into a platform object
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionFailure {
    /// Neither a name nor tags were given
    NoSelector,
    /// Both a name and tags were given
    ConflictingSelector,
    /// The lookup ran but returned nothing
    NotFound(String),
    /// More than one object matched
    Ambiguous(usize),
    /// The lookup returned an object of a different kind
    UnexpectedKind(String),
    /// The image lookup returned a virtual machine that is not a template
    NotTemplate(String),
}

impl fmt::Display for ResolutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolutionFailure::NoSelector => write!(f, "no selector provided"),
            ResolutionFailure::ConflictingSelector => {
                write!(f, "selector specifies both a name and tags")
            }
            ResolutionFailure::NotFound(detail) => write!(f, "lookup returned nothing: {}", detail),
            ResolutionFailure::Ambiguous(count) => {
                write!(f, "selector is ambiguous, {} objects matched", count)
            }
            ResolutionFailure::UnexpectedKind(found) => {
                write!(f, "lookup returned an object of kind {}", found)
            }
            ResolutionFailure::NotTemplate(name) => {
                write!(f, "virtual machine {} is not a template", name)
            }
        }
    }
}

/// Errors that can occur during provider operations
#[derive(Debug, Error)]
pub enum OperatorError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeApi(String),

    /// Optimistic-lock conflict on a patch
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Kubernetes object not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Transport error talking to the platform
    #[error("HTTP error: {0}")]
    Http(String),

    /// Platform fault or failed platform task
    #[error("vSphere error: {0}")]
    Platform(String),

    /// Selector resolution failed
    #[error("failed to resolve {kind}: {failure}")]
    Resolution {
        kind: String,
        failure: ResolutionFailure,
    },

    /// The instance no longer exists on the platform
    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    /// The node class Ready condition is False
    #[error("NodeClass not ready: {0}")]
    NodeClassNotReady(String),

    /// Create failed for a named reason
    #[error("{message}")]
    Create { reason: String, message: String },

    /// No compatible instance type could be launched
    #[error("insufficient capacity: {0}")]
    InsufficientCapacity(String),

    /// Provider ID did not match `<scheme>://<id>`
    #[error("provider id does not match known format: {0}")]
    InvalidProviderId(String),

    /// Boot data could not be built
    #[error("Boot data error: {0}")]
    BootData(String),

    /// Invalid resource state
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl OperatorError {
    pub fn resolution(kind: impl Into<String>, failure: ResolutionFailure) -> Self {
        OperatorError::Resolution {
            kind: kind.into(),
            failure,
        }
    }

    pub fn create(reason: &str, message: impl Into<String>) -> Self {
        OperatorError::Create {
            reason: reason.to_string(),
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, OperatorError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, OperatorError::Conflict(_))
    }

    pub fn is_instance_not_found(&self) -> bool {
        matches!(self, OperatorError::InstanceNotFound(_))
    }

    pub fn is_insufficient_capacity(&self) -> bool {
        matches!(self, OperatorError::InsufficientCapacity(_))
    }
}

impl From<kube::Error> for OperatorError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) if ae.code == 404 => OperatorError::NotFound(ae.message),
            kube::Error::Api(ae) if ae.code == 409 => OperatorError::Conflict(ae.message),
            other => OperatorError::KubeApi(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for OperatorError {
    fn from(err: serde_json::Error) -> Self {
        OperatorError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for OperatorError {
    fn from(err: serde_yaml::Error) -> Self {
        OperatorError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for OperatorError {
    fn from(err: reqwest::Error) -> Self {
        OperatorError::Http(err.to_string())
    }
}
