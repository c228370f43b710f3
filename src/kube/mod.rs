//! Cluster control-plane access
//!
//! A narrow façade over the Kubernetes API used by the credential layer:
//! secret CRUD plus the certificate-signing-request protocol.

pub mod client;

pub use client::{KubeClient, ServiceIdentity};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use thiserror::Error;

/// Marker label present on every object this proxy creates.
pub const MARKER_LABEL: &str = "auth.stiil.dk/clientcertificates";
pub const MARKER_GENERATED: &str = "generated";
/// Advisory content hash of the secret data map.
pub const VERSION_LABEL: &str = "auth.stiil.dk/version";
/// Certificate NotAfter in label-safe form, or [`EXPIRATION_UNKNOWN`].
pub const EXPIRATION_LABEL: &str = "auth.stiil.dk/expiration";
pub const EXPIRATION_UNKNOWN: &str = "unknown";

/// Signer that produces client certificates the API server accepts.
pub const CSR_SIGNER_NAME: &str = "kubernetes.io/kube-apiserver-client";
pub const CSR_USAGE_CLIENT_AUTH: &str = "client auth";

#[derive(Debug, Error)]
pub enum ControlPlaneError {
    #[error("{0} was not found")]
    NotFound(String),
    #[error("{0} already exists")]
    Conflict(String),
    #[error("access denied by the control plane: {0}")]
    Forbidden(String),
    #[error("timed out waiting for a signed certificate for {0}")]
    Timeout(String),
    #[error("control plane request failed: {0}")]
    Transport(#[source] kube::Error),
}

impl ControlPlaneError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ControlPlaneError::NotFound(_))
    }
}

/// Control-plane operations the credential layer depends on.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn get_secret(&self, name: &str) -> Result<Secret, ControlPlaneError>;
    async fn create_secret(&self, secret: Secret) -> Result<(), ControlPlaneError>;
    async fn delete_secret(&self, name: &str) -> Result<(), ControlPlaneError>;
    /// Submit a PEM CSR under `name` for the API-server client signer.
    async fn create_csr(&self, name: &str, pem_csr: &[u8]) -> Result<(), ControlPlaneError>;
    async fn approve_csr(&self, name: &str) -> Result<(), ControlPlaneError>;
    /// Poll until the CSR carries a signed certificate, subject to the fetch
    /// deadline.
    async fn fetch_signed_certificate(&self, name: &str) -> Result<Vec<u8>, ControlPlaneError>;
    async fn delete_csr(&self, name: &str) -> Result<(), ControlPlaneError>;
}
