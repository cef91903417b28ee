//! Error types for the VCD provider engine.

use thiserror::Error;

/// Convenience alias used throughout the engine.
pub type Result<T, E = ProviderError> = std::result::Result<T, E>;

/// Errors surfaced by resource lifecycle operations.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The target object does not exist in VCD.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The session lacks the privilege required by the operation.
    #[error("Permission denied: {0}")]
    Permission(String),

    /// A precondition on the parent object is not met.
    #[error("Failed precondition: {0}")]
    Precondition(String),

    /// An attribute requires a newer VCD API version than the negotiated one.
    #[error("Unsupported version: {0}")]
    Version(String),

    /// A schema-level violation (missing required, conflicting attributes, import arity).
    #[error("Validation error: {0}")]
    Validation(String),

    /// VCD reported a concurrent modification or a name collision.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The per-operation deadline was exceeded.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Any other SDK failure, tagged with the resource and lifecycle phase.
    #[error("[{resource} {phase}] {message}")]
    Remote {
        /// Resource kind, e.g. `vcd_network_routed_v2`.
        resource: String,
        /// Lifecycle phase, e.g. `create`.
        phase: String,
        /// Message propagated verbatim from the SDK.
        message: String,
    },

    /// A named mutex was released without being held.
    #[error("Mutex misuse: {0}")]
    Misuse(String),

    /// The operation was cancelled by the host.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Writing sensitive material was not acknowledged by the user.
    #[error("Sensitive information: {0}")]
    SensitiveInfo(String),

    /// The requested resource or data source type is not registered.
    #[error("Unknown resource type: {0}")]
    UnknownResource(String),

    /// A local I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ProviderError {
    /// Get the error message without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::NotFound(msg) => msg,
            Self::Permission(msg) => msg,
            Self::Precondition(msg) => msg,
            Self::Version(msg) => msg,
            Self::Validation(msg) => msg,
            Self::Conflict(msg) => msg,
            Self::Timeout(msg) => msg,
            Self::Remote { message, .. } => message,
            Self::Misuse(msg) => msg,
            Self::Cancelled(msg) => msg,
            Self::SensitiveInfo(msg) => msg,
            Self::UnknownResource(msg) => msg,
            Self::Io(_err) => "i/o error (see Debug output)",
            Self::Serialization(_err) => "serialization error (see Debug output)",
        }
    }

    /// Whether this error means the target object is absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Build a [`ProviderError::Remote`] for the given resource and phase.
    pub fn remote(
        resource: impl Into<String>,
        phase: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Remote {
            resource: resource.into(),
            phase: phase.into(),
            message: message.into(),
        }
    }
}

/// A failure reported by the VCD SDK.
///
/// The SDK only knows the HTTP status and the message VCD returned; the
/// engine classifies it with [`ApiError::classify`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("API error {status}: {message}")]
pub struct ApiError {
    /// HTTP status code returned by VCD.
    pub status: u16,
    /// Message returned by VCD.
    pub message: String,
}

impl ApiError {
    /// Create an API error.
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// Shorthand for a 404 response.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(404, message)
    }

    /// Map this SDK error onto the engine taxonomy.
    pub fn classify(self, resource: &str, phase: &str) -> ProviderError {
        match self.status {
            404 => ProviderError::NotFound(self.message),
            401 | 403 => ProviderError::Permission(self.message),
            409 => ProviderError::Conflict(self.message),
            412 => ProviderError::Precondition(self.message),
            _ => ProviderError::remote(resource, phase, self.message),
        }
    }
}

impl From<ProviderError> for tonic::Status {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::NotFound(msg) => tonic::Status::not_found(msg),
            ProviderError::Permission(msg) => tonic::Status::permission_denied(msg),
            ProviderError::Precondition(msg) => tonic::Status::failed_precondition(msg),
            ProviderError::Version(msg) => tonic::Status::failed_precondition(msg),
            ProviderError::Validation(msg) => tonic::Status::invalid_argument(msg),
            ProviderError::Conflict(msg) => tonic::Status::aborted(msg),
            ProviderError::Timeout(msg) => tonic::Status::deadline_exceeded(msg),
            err @ ProviderError::Remote { .. } => tonic::Status::internal(err.to_string()),
            ProviderError::Misuse(msg) => tonic::Status::internal(msg),
            ProviderError::Cancelled(msg) => tonic::Status::cancelled(msg),
            ProviderError::SensitiveInfo(msg) => tonic::Status::invalid_argument(msg),
            ProviderError::UnknownResource(msg) => tonic::Status::not_found(msg),
            ProviderError::Io(err) => tonic::Status::internal(format!("I/O error: {}", err)),
            ProviderError::Serialization(err) => {
                tonic::Status::invalid_argument(format!("Serialization error: {}", err))
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProviderError::NotFound("network net1".to_string());
        assert_eq!(format!("{}", err), "Not found: network net1");

        let err = ProviderError::Validation("missing name".to_string());
        assert_eq!(format!("{}", err), "Validation error: missing name");

        let err = ProviderError::remote("vcd_network_routed_v2", "create", "boom");
        assert_eq!(format!("{}", err), "[vcd_network_routed_v2 create] boom");
        assert_eq!(err.message(), "boom");
    }

    #[test]
    fn test_api_error_classification() {
        let err = ApiError::not_found("gone").classify("r", "read");
        assert!(err.is_not_found());

        let err = ApiError::new(403, "no").classify("r", "create");
        assert!(matches!(err, ProviderError::Permission(_)));

        let err = ApiError::new(409, "busy").classify("r", "update");
        assert!(matches!(err, ProviderError::Conflict(_)));

        let err = ApiError::new(500, "exploded").classify("vcd_x", "delete");
        assert_eq!(err.to_string(), "[vcd_x delete] exploded");
    }

    #[test]
    fn test_error_to_status() {
        let status: tonic::Status = ProviderError::NotFound("x".into()).into();
        assert_eq!(status.code(), tonic::Code::NotFound);

        let status: tonic::Status = ProviderError::Permission("x".into()).into();
        assert_eq!(status.code(), tonic::Code::PermissionDenied);

        let status: tonic::Status = ProviderError::Timeout("x".into()).into();
        assert_eq!(status.code(), tonic::Code::DeadlineExceeded);

        let status: tonic::Status = ProviderError::Cancelled("x".into()).into();
        assert_eq!(status.code(), tonic::Code::Cancelled);

        let status: tonic::Status = ProviderError::remote("r", "read", "m").into();
        assert_eq!(status.code(), tonic::Code::Internal);
        assert_eq!(status.message(), "[r read] m");
    }

    #[test]
    fn test_message_method() {
        let err = ProviderError::Version("dns_servers".to_string());
        assert_eq!(err.message(), "dns_servers");

        let err = ProviderError::Misuse("release of unheld key".to_string());
        assert_eq!(err.message(), "release of unheld key");
    }
}
