//! Error types for the KMM operator

use thiserror::Error;

/// Main error type for KMM operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// A resource the reconcile was triggered for no longer exists
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        /// Resource kind (Pod, Node, ...)
        kind: String,
        /// Namespace, empty for cluster-scoped resources
        namespace: String,
        /// Resource name
        name: String,
    },

    /// Kernel version could not be resolved into a loader configuration
    #[error("kernel mapping error: {0}")]
    KernelMapping(#[from] crate::kernel_mapper::MappingError),

    /// Build or sign collaborator failure
    #[error("{phase} pipeline error: {message}")]
    Pipeline {
        /// Pipeline phase (build, sign)
        phase: String,
        /// Description of what failed
        message: String,
    },

    /// One or more garbage collectors failed; every collector still ran
    #[error("garbage collection failed: {}", .0.join("; "))]
    GarbageCollection(Vec<String>),

    /// Validation error for a resource
    #[error("validation error: {0}")]
    Validation(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal/operational error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a not-found error for a namespaced resource
    pub fn not_found(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::NotFound {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Create a pipeline error for the given phase
    pub fn pipeline(phase: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Pipeline {
            phase: phase.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Returns true when a kube error is an API 404
pub(crate) fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: a pod trigger for a pod that is gone surfaces a clear error
    ///
    /// The node labeler reports missing pods as errors so stale triggers are
    /// visible, and the message names the exact object.
    #[test]
    fn story_not_found_names_the_object() {
        let err = Error::not_found("Pod", "kmm-system", "loader-abc");
        assert_eq!(err.to_string(), "Pod kmm-system/loader-abc not found");
        assert!(matches!(err, Error::NotFound { .. }));
    }

    /// Story: garbage collection reports every collector that failed
    #[test]
    fn story_garbage_collection_aggregates_failures() {
        let err = Error::GarbageCollection(vec![
            "workloads: boom".to_string(),
            "sign: registry down".to_string(),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("workloads: boom"));
        assert!(msg.contains("sign: registry down"));
    }

    #[test]
    fn pipeline_error_carries_phase() {
        let err = Error::pipeline("build", "job failed");
        assert_eq!(err.to_string(), "build pipeline error: job failed");
    }

    #[test]
    fn not_found_detection_only_matches_404() {
        let api = |code| {
            kube::Error::Api(kube::error::ErrorResponse {
                status: "Failure".to_string(),
                message: "apiserver said no".to_string(),
                reason: "Test".to_string(),
                code,
            })
        };
        assert!(is_not_found(&api(404)));
        assert!(!is_not_found(&api(409)));
    }

    #[test]
    fn serde_errors_convert_to_serialization() {
        let parse: Result<serde_json::Value, _> = serde_json::from_str("{not json");
        let err: Error = parse.unwrap_err().into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
