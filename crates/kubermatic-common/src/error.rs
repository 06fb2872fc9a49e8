//! Error types for the Kubermatic controllers
//!
//! Errors are structured with fields to aid debugging in production.
//! Each error variant includes contextual information like cluster names,
//! provider types, and underlying causes.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Kubermatic operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for cluster or datacenter configuration
    #[error("validation error for {cluster}: {message}")]
    Validation {
        /// Name of the cluster with invalid configuration
        cluster: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.cloud.dc")
        field: Option<String>,
    },

    /// Cloud provider error
    #[error("provider error [{provider}] for {cluster}: {message}")]
    Provider {
        /// Name of the cluster being provisioned
        cluster: String,
        /// Provider name (fake, bringyourown, digitalocean, ...)
        provider: String,
        /// Description of what failed
        message: String,
        /// Whether this error is retryable
        retryable: bool,
    },

    /// DNS resolution error during address sync
    #[error("dns error for {host}: {message}")]
    Dns {
        /// The host name that failed to resolve
        host: String,
        /// Description of what failed
        message: String,
    },

    /// Optimistic-concurrency conflict that survived the bounded retry
    #[error("conflict updating {resource}: retries exhausted")]
    Conflict {
        /// The resource that kept changing under us
        resource: String,
    },

    /// A project-owned resource whose owning project cannot be resolved
    #[error("no owning project for {kind} {name}")]
    MissingOwner {
        /// Kind of the orphaned resource
        kind: String,
        /// Name of the orphaned resource
        name: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "ensure", "address")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    ///
    /// For simple validation errors without cluster context.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with cluster context
    pub fn validation_for(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with cluster context and field path
    pub fn validation_for_field(
        cluster: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a provider error with full context
    pub fn provider_for(
        cluster: impl Into<String>,
        provider: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Provider {
            cluster: cluster.into(),
            provider: provider.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable provider error (e.g., configuration error)
    pub fn provider_permanent(
        cluster: impl Into<String>,
        provider: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Provider {
            cluster: cluster.into(),
            provider: provider.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a DNS error for the given host
    pub fn dns(host: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Dns {
            host: host.into(),
            message: msg.into(),
        }
    }

    /// Create an orphaned-resource error
    pub fn missing_owner(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::MissingOwner {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    ///
    /// For simple internal errors without specific context.
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

    /// Check if this error is retryable
    ///
    /// Validation and serialization errors are not retryable (require config
    /// fix). DNS and conflict errors resolve on their own and are retried.
    /// Kubernetes errors depend on the status code.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // Retry on transient K8s errors (connection, timeout, 409)
                // Don't retry on other 4xx errors (validation, forbidden, ...)
                match source {
                    kube::Error::Api(ae) if ae.code == 409 => true,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code) => false,
                    _ => true,
                }
            }
            Error::Validation { .. } => false,
            Error::Provider { retryable, .. } => *retryable,
            Error::Dns { .. } => true,
            Error::Conflict { .. } => true,
            Error::MissingOwner { .. } => false,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// True if this error wraps a 404 from the API server
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 404)
    }

    /// True if this error wraps a resourceVersion conflict from the API server
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 409)
    }

    /// Get the cluster name if this error is associated with a specific cluster
    pub fn cluster(&self) -> Option<&str> {
        match self {
            Error::Validation { cluster, .. } => Some(cluster),
            Error::Provider { cluster, .. } => Some(cluster),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==========================================================================
    // Story Tests: Error Propagation in Cluster Operations
    // ==========================================================================
    //
    // These tests demonstrate how errors flow through the system during
    // cluster reconciliation. Each error type represents a different failure
    // category with specific handling requirements.

    /// Story: datacenter validation catches misconfigurations before launch
    ///
    /// When a user creates a Cluster referencing a datacenter that does not
    /// exist, or a node datacenter flagged as seed, the validating phase
    /// surfaces it with a clear message and the cluster never launches.
    #[test]
    fn story_validation_prevents_invalid_cluster_launch() {
        let err = Error::validation_for("fqpcvnc6v", "unknown datacenter \"moon-base-1\"");
        assert!(err.to_string().contains("validation error"));
        assert!(err.to_string().contains("moon-base-1"));
        assert_eq!(err.cluster(), Some("fqpcvnc6v"));
        assert!(!err.is_retryable());

        let err = Error::validation_for_field(
            "fqpcvnc6v",
            "spec.cloud.dc",
            "datacenter is a seed, expected a node datacenter",
        );
        match &err {
            Error::Validation { field, .. } => {
                assert_eq!(field.as_deref(), Some("spec.cloud.dc"));
            }
            _ => panic!("Expected Validation variant"),
        }
    }

    /// Story: cloud provider errors carry provider and retryability
    ///
    /// A transient DigitalOcean API hiccup should be retried by the queue,
    /// while a bad token is permanent until the user fixes the spec.
    #[test]
    fn story_provider_errors_during_cloud_init() {
        let err = Error::provider_for("do-cluster", "digitalocean", "api rate limited");
        assert!(err.to_string().contains("digitalocean"));
        assert!(err.is_retryable());

        let err = Error::provider_permanent("do-cluster", "digitalocean", "token missing");
        assert!(!err.is_retryable());
        assert_eq!(err.cluster(), Some("do-cluster"));
    }

    /// Story: address sync fails the step when DNS has no records yet
    ///
    /// Freshly created external names take a while to propagate. The DNS
    /// error is retryable so the cluster simply stays in its phase until
    /// records appear.
    #[test]
    fn story_dns_errors_keep_cluster_in_phase() {
        let err = Error::dns(
            "fqpcvnc6v.europe-west3-c.dev.kubermatic.io",
            "no A records",
        );
        assert!(err.to_string().contains("dns error"));
        assert!(err.is_retryable());
    }

    /// Story: orphaned resources are a policy decision, not a crash
    ///
    /// In strict mode the resource controller surfaces MissingOwner; the
    /// error is terminal for the key because retrying cannot conjure an
    /// OwnerReference into existence.
    #[test]
    fn story_orphans_are_not_retryable() {
        let err = Error::missing_owner("UserSSHKey", "key-abc123");
        assert!(err.to_string().contains("UserSSHKey"));
        assert!(!err.is_retryable());
    }

    /// Story: API conflicts are retryable, other 4xx are not
    #[test]
    fn story_kube_error_retryability_follows_status_code() {
        let conflict = kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "conflict".to_string(),
            reason: "Conflict".to_string(),
            code: 409,
        });
        let err: Error = conflict.into();
        assert!(err.is_conflict());
        assert!(err.is_retryable());

        let not_found = kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "not found".to_string(),
            reason: "NotFound".to_string(),
            code: 404,
        });
        let err: Error = not_found.into();
        assert!(err.is_not_found());
        assert!(!err.is_retryable());
    }
}
