//! Error types for the workload operator

/// Result type alias for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

/// Errors that can occur during operator operations
#[derive(Debug, thiserror::Error)]
pub enum OperatorError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeApi(String),
    /// Optimistic concurrency conflict on write
    #[error("Conflict: {0}")]
    Conflict(String),
    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// Reconciliation error
    #[error("Reconciliation error: {0}")]
    Reconciliation(String),
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),
    /// Invalid resource state
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl OperatorError {
    /// Whether retrying the same pass shortly is likely to succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, OperatorError::Conflict(_) | OperatorError::KubeApi(_))
    }
}

impl From<kube::Error> for OperatorError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) if ae.code == 409 => OperatorError::Conflict(ae.message),
            kube::Error::Api(ae) if ae.code == 404 => OperatorError::NotFound(ae.message),
            err => OperatorError::KubeApi(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for OperatorError {
    fn from(err: serde_json::Error) -> Self {
        OperatorError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("status {}", code),
            reason: String::new(),
            code,
        })
    }

    #[test]
    fn test_error_display() {
        let err = OperatorError::KubeApi("test error".to_string());
        assert!(err.to_string().contains("Kubernetes API error"));

        let err = OperatorError::InvalidState("no owner".to_string());
        assert_eq!(err.to_string(), "Invalid state: no owner");
    }

    #[test]
    fn test_conflict_maps_from_409() {
        let err: OperatorError = api_error(409).into();
        assert!(matches!(err, OperatorError::Conflict(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn test_not_found_maps_from_404() {
        let err: OperatorError = api_error(404).into();
        assert!(matches!(err, OperatorError::NotFound(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_other_api_errors_are_kube_api() {
        let err: OperatorError = api_error(500).into();
        assert!(matches!(err, OperatorError::KubeApi(_)));
    }
}
