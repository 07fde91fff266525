//! Error types for the enclave syncer
//!
//! Errors carry enough structure for the controller runtime to pick a
//! handling strategy: transient errors requeue with backoff, collisions are
//! terminal for the key, and invariant violations halt the affected kind.

use thiserror::Error;

/// Main error type for syncer operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error (either cluster)
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A host object exists at the destination name without our markers.
    /// Terminal for the key; requires operator intervention.
    #[error("collision for {kind} at {host_key}: {message}")]
    Collision {
        /// Resource kind being synced
        kind: String,
        /// The occupied host identity (`namespace/name`)
        host_key: String,
        /// Description of the conflicting state
        message: String,
    },

    /// The host API rejected a projected object. The user may fix the
    /// virtual spec, so this requeues with backoff.
    #[error("host rejected {kind} {key}: {message}")]
    HostValidation {
        /// Resource kind being synced
        kind: String,
        /// Virtual key (`namespace/name`)
        key: String,
        /// The host API server's message, surfaced on the virtual object
        message: String,
    },

    /// Two virtual objects resolved to one host identity. Fatal for the
    /// kind's controller to prevent data loss.
    #[error("mapping invariant violated for {kind}: {message}")]
    MappingConflict {
        /// Resource kind being synced
        kind: String,
        /// Description of the conflicting mappings
        message: String,
    },

    /// Mapping store persistence error (the in-memory entry is kept and
    /// re-attempted at the next reconcile)
    #[error("mapping store error: {message}")]
    MappingStore {
        /// Description of what failed
        message: String,
    },

    /// A referenced object is not yet present on the host. The referrer
    /// reconcile returns a retry-after.
    #[error("{kind} {key} is waiting for dependencies: {missing:?}")]
    DependenciesMissing {
        /// Resource kind of the referrer
        kind: String,
        /// Virtual key of the referrer
        key: String,
        /// Virtual keys of the absent dependencies
        missing: Vec<String>,
    },

    /// Configuration error detected at startup
    #[error("configuration error: {message}")]
    Config {
        /// Description of what's invalid
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "cache", "queue")
        context: String,
    },
}

impl Error {
    /// Create a collision error for the given kind and occupied host key
    pub fn collision(
        kind: impl Into<String>,
        host_key: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Collision {
            kind: kind.into(),
            host_key: host_key.into(),
            message: msg.into(),
        }
    }

    /// Create a mapping store error with the given message
    pub fn mapping_store(msg: impl Into<String>) -> Self {
        Self::MappingStore { message: msg.into() }
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config { message: msg.into() }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization { message: msg.into() }
    }

    /// Create an internal error with the given context and message
    pub fn internal(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether the error should be retried with backoff.
    ///
    /// Collisions and mapping invariant violations are not retryable: the
    /// conflicting state will not resolve itself, and overwriting would
    /// destroy data that is not ours.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => is_transient_kube_error(source),
            Error::HostValidation { .. } => true,
            Error::DependenciesMissing { .. } => true,
            Error::MappingStore { .. } => true,
            Error::Internal { .. } => true,
            Error::Collision { .. } => false,
            Error::MappingConflict { .. } => false,
            Error::Config { .. } => false,
            Error::Serialization { .. } => false,
        }
    }

    /// Whether the error is fatal for the whole kind's controller
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::MappingConflict { .. })
    }

    /// Whether the underlying API error is a 404
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 404)
    }

    /// Whether the underlying API error is an AlreadyExists conflict
    pub fn is_already_exists(&self) -> bool {
        matches!(
            self,
            Error::Kube { source: kube::Error::Api(ae) }
                if ae.code == 409 && ae.reason == "AlreadyExists"
        )
    }

    /// Whether the underlying API error is an optimistic concurrency
    /// conflict (resourceVersion mismatch). Never retried in place; the
    /// key requeues so the next attempt sees fresh cached state.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Error::Kube { source: kube::Error::Api(ae) }
                if ae.code == 409 && ae.reason != "AlreadyExists"
        )
    }

    /// Whether the underlying API error is a permission failure. Logged
    /// once per (kind, verb) per leader term; the controller degrades
    /// instead of crash-looping.
    pub fn is_forbidden(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 403)
    }

    /// Whether the underlying API error is a 422 the user can fix by
    /// changing the virtual spec
    pub fn is_invalid(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 422)
    }
}

/// Transient API failures: timeouts, 5xx, rate limiting, conflicts.
fn is_transient_kube_error(err: &kube::Error) -> bool {
    match err {
        kube::Error::Api(ae) => ae.code == 409 || ae.code == 429 || ae.code >= 500,
        kube::Error::HyperError(_) | kube::Error::Service(_) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> Error {
        Error::Kube {
            source: kube::Error::Api(ErrorResponse {
                status: "Failure".into(),
                message: "test".into(),
                reason: reason.into(),
                code,
            }),
        }
    }

    #[test]
    fn transient_api_errors_are_retryable() {
        assert!(api_error(500, "InternalError").is_retryable());
        assert!(api_error(503, "ServiceUnavailable").is_retryable());
        assert!(api_error(429, "TooManyRequests").is_retryable());
        assert!(api_error(409, "Conflict").is_retryable());
    }

    #[test]
    fn collisions_are_terminal() {
        let err = Error::collision("Service", "host-ns/svc-x-ns-x-vc", "foreign object");
        assert!(!err.is_retryable());
        assert!(!err.is_fatal());
    }

    #[test]
    fn mapping_conflicts_are_fatal() {
        let err = Error::MappingConflict {
            kind: "PersistentVolume".into(),
            message: "two virtual PVs claim host-pv-1".into(),
        };
        assert!(err.is_fatal());
        assert!(!err.is_retryable());
    }

    #[test]
    fn conflict_classification_distinguishes_already_exists() {
        assert!(api_error(409, "AlreadyExists").is_already_exists());
        assert!(!api_error(409, "AlreadyExists").is_conflict());
        assert!(api_error(409, "Conflict").is_conflict());
        assert!(!api_error(409, "Conflict").is_already_exists());
    }

    #[test]
    fn not_found_and_forbidden_classification() {
        assert!(api_error(404, "NotFound").is_not_found());
        assert!(api_error(403, "Forbidden").is_forbidden());
        assert!(api_error(422, "Invalid").is_invalid());
        assert!(!api_error(404, "NotFound").is_forbidden());
    }

    #[test]
    fn dependency_waits_are_retryable() {
        let err = Error::DependenciesMissing {
            kind: "Pod".into(),
            key: "ns/web".into(),
            missing: vec!["ns/web-config".into()],
        };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("web-config"));
    }
}
