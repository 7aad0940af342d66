//! Error types for the credential bootstrap

use thiserror::Error;

/// Indicates that a bearer token could not be produced
#[derive(Debug, Error)]
pub enum CredentialError {
    /// The base credentials could not be resolved
    #[error("failed to resolve base credentials: {0}")]
    Provider(#[source] aws_credential_types::provider::error::CredentialsError),

    /// The security token service rejected the role assumption
    #[error("failed to assume role {role_arn}: {message}")]
    AssumeRole {
        /// The role that could not be assumed.
        role_arn: String,
        /// The error reported by the token service.
        message: String,
    },

    /// The role assumption response did not include credentials
    #[error("assume role response for {0} did not include credentials")]
    MissingCredentials(String),

    /// The identity-assertion request could not be presigned
    #[error("failed to presign request: {0}")]
    Signing(String),
}

/// Indicates that cluster connection metadata could not be resolved
#[derive(Debug, Error)]
pub enum EksClusterError {
    /// The describe call failed
    #[error("failed to describe cluster {cluster}: {message}")]
    Describe {
        /// The cluster that was described.
        cluster: String,
        /// The error reported by the control plane.
        message: String,
    },

    /// The describe response did not include a cluster
    #[error("cluster {0} not found")]
    NotFound(String),

    /// The cluster description is missing a required field
    #[error("cluster description is missing {0}")]
    MissingField(&'static str),
}

/// Indicates that the cluster access configuration could not be written or
/// loaded
#[derive(Debug, Error)]
pub enum KubeconfigError {
    /// The kubeconfig file could not be written or read
    #[error("kubeconfig i/o failed: {0}")]
    Io(#[from] std::io::Error),

    /// The kubeconfig document could not be serialized
    #[error("failed to serialize kubeconfig: {0}")]
    Serialize(#[from] serde_yaml::Error),

    /// kube-rs rejected the kubeconfig document
    #[error("failed to load kubeconfig: {0}")]
    Load(#[from] kube_client::config::KubeconfigError),

    /// A Kubernetes client could not be built from the loaded configuration
    #[error("failed to build kubernetes client: {0}")]
    Client(#[from] kube_client::Error),
}
