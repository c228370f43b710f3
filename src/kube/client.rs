//! Kubernetes client and service identity loading
//!
//! Configuration resolution mirrors kubectl: an explicit kubeconfig path wins,
//! then `$HOME/.kube/config` if present, then in-cluster credentials. The
//! service identity (cluster CA pool, client certificate, bearer token) is
//! extracted from the same configuration for use by the proxy engine.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use k8s_openapi::api::certificates::v1::{
    CertificateSigningRequest, CertificateSigningRequestCondition, CertificateSigningRequestSpec,
    CertificateSigningRequestStatus,
};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, DeleteParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use secrecy::ExposeSecret;

use super::{
    ControlPlane, ControlPlaneError, CSR_SIGNER_NAME, CSR_USAGE_CLIENT_AUTH, MARKER_GENERATED,
    MARKER_LABEL,
};
use crate::config::KubernetesSettings;

/// Requested certificate lifetime, 5 days.
const CERTIFICATE_EXPIRATION_SECONDS: i32 = 60 * 60 * 24 * 5;
/// Deadline for a signed certificate to appear on an approved CSR.
const CERTIFICATE_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const CERTIFICATE_POLL_INTERVAL: Duration = Duration::from_millis(100);

const APPROVAL_REASON: &str = "Auto approved by kube-auth-proxy";

pub struct KubeClient {
    secrets: Api<Secret>,
    csrs: Api<CertificateSigningRequest>,
    expiration_seconds: i32,
}

/// Credentials of the proxy itself, lifted from the resolved kubeconfig.
#[derive(Debug, Clone, Default)]
pub struct ServiceIdentity {
    ca_certificates: Vec<Vec<u8>>,
    client_identity_pem: Option<Vec<u8>>,
    bearer_token: Option<String>,
}

impl ServiceIdentity {
    fn from_config(config: &Config) -> anyhow::Result<Self> {
        let auth = &config.auth_info;

        let cert_pem = match (&auth.client_certificate_data, &auth.client_certificate) {
            (Some(data), _) => Some(
                BASE64
                    .decode(data)
                    .context("decoding client certificate data")?,
            ),
            (None, Some(path)) => Some(
                std::fs::read(path)
                    .with_context(|| format!("reading client certificate {path}"))?,
            ),
            (None, None) => None,
        };
        let key_pem = match (&auth.client_key_data, &auth.client_key) {
            (Some(data), _) => Some(
                BASE64
                    .decode(data.expose_secret())
                    .context("decoding client key data")?,
            ),
            (None, Some(path)) => {
                Some(std::fs::read(path).with_context(|| format!("reading client key {path}"))?)
            }
            (None, None) => None,
        };
        let client_identity_pem = match (cert_pem, key_pem) {
            (Some(cert), Some(key)) => Some(pem_bundle(&cert, &key)),
            _ => None,
        };

        let bearer_token = match (&auth.token, &auth.token_file) {
            (Some(token), _) => Some(token.expose_secret().to_string()),
            (None, Some(path)) => Some(
                std::fs::read_to_string(path)
                    .with_context(|| format!("reading service account token {path}"))?
                    .trim()
                    .to_string(),
            ),
            (None, None) => None,
        };

        Ok(Self {
            ca_certificates: config.root_cert.clone().unwrap_or_default(),
            client_identity_pem,
            bearer_token,
        })
    }

    /// Cluster CA certificates in DER form.
    pub fn ca_certificates(&self) -> &[Vec<u8>] {
        &self.ca_certificates
    }

    /// PEM bundle (certificate then key) for upstream mTLS, when configured.
    pub fn client_identity_pem(&self) -> Option<&[u8]> {
        self.client_identity_pem.as_deref()
    }

    pub fn bearer_token(&self) -> Option<&str> {
        self.bearer_token.as_deref()
    }
}

impl KubeClient {
    /// Resolve cluster configuration and build the client plus the proxy's
    /// own service identity. See `deployment/authorization.yaml` for the RBAC
    /// this client requires.
    pub async fn connect(
        settings: &KubernetesSettings,
    ) -> anyhow::Result<(Self, ServiceIdentity)> {
        let config = resolve_config(settings).await?;
        let identity = ServiceIdentity::from_config(&config)?;
        let client = Client::try_from(config).context("building Kubernetes client")?;

        let secrets = Api::namespaced(client.clone(), &settings.namespace);
        let csrs = Api::all(client);
        Ok((
            Self {
                secrets,
                csrs,
                expiration_seconds: CERTIFICATE_EXPIRATION_SECONDS,
            },
            identity,
        ))
    }
}

async fn resolve_config(settings: &KubernetesSettings) -> anyhow::Result<Config> {
    let explicit = (!settings.kube_config.is_empty()).then(|| PathBuf::from(&settings.kube_config));
    let path = explicit.or_else(|| {
        dirs::home_dir()
            .map(|home| home.join(".kube").join("config"))
            .filter(|candidate| candidate.exists())
    });

    match path {
        Some(path) => {
            tracing::info!("using kubeconfig at {}", path.display());
            let kubeconfig = Kubeconfig::read_from(&path)
                .with_context(|| format!("reading kubeconfig {}", path.display()))?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .context("loading kubeconfig")
        }
        None => {
            tracing::info!("using in-cluster configuration");
            Config::incluster().context("loading in-cluster configuration")
        }
    }
}

fn pem_bundle(cert: &[u8], key: &[u8]) -> Vec<u8> {
    let mut bundle = Vec::with_capacity(cert.len() + key.len() + 2);
    bundle.extend_from_slice(cert);
    if !bundle.ends_with(b"\n") {
        bundle.push(b'\n');
    }
    bundle.extend_from_slice(key);
    if !bundle.ends_with(b"\n") {
        bundle.push(b'\n');
    }
    bundle
}

fn control_plane_error(name: &str, err: kube::Error) -> ControlPlaneError {
    match &err {
        kube::Error::Api(response) if response.code == 404 => {
            ControlPlaneError::NotFound(name.to_string())
        }
        kube::Error::Api(response) if response.code == 409 => {
            ControlPlaneError::Conflict(name.to_string())
        }
        kube::Error::Api(response) if response.code == 403 => {
            ControlPlaneError::Forbidden(response.message.clone())
        }
        _ => ControlPlaneError::Transport(err),
    }
}

#[async_trait]
impl ControlPlane for KubeClient {
    async fn get_secret(&self, name: &str) -> Result<Secret, ControlPlaneError> {
        self.secrets
            .get(name)
            .await
            .map_err(|err| control_plane_error(name, err))
    }

    async fn create_secret(&self, secret: Secret) -> Result<(), ControlPlaneError> {
        let name = secret.metadata.name.clone().unwrap_or_default();
        self.secrets
            .create(&PostParams::default(), &secret)
            .await
            .map_err(|err| control_plane_error(&name, err))?;
        Ok(())
    }

    async fn delete_secret(&self, name: &str) -> Result<(), ControlPlaneError> {
        self.secrets
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|err| control_plane_error(name, err))?;
        Ok(())
    }

    async fn create_csr(&self, name: &str, pem_csr: &[u8]) -> Result<(), ControlPlaneError> {
        let csr = CertificateSigningRequest {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(
                    [(MARKER_LABEL.to_string(), MARKER_GENERATED.to_string())].into(),
                ),
                ..ObjectMeta::default()
            },
            spec: CertificateSigningRequestSpec {
                request: ByteString(pem_csr.to_vec()),
                signer_name: CSR_SIGNER_NAME.to_string(),
                usages: Some(vec![CSR_USAGE_CLIENT_AUTH.to_string()]),
                expiration_seconds: Some(self.expiration_seconds),
                ..CertificateSigningRequestSpec::default()
            },
            status: None,
        };
        self.csrs
            .create(&PostParams::default(), &csr)
            .await
            .map_err(|err| control_plane_error(name, err))?;
        Ok(())
    }

    async fn approve_csr(&self, name: &str) -> Result<(), ControlPlaneError> {
        let mut csr = self
            .csrs
            .get(name)
            .await
            .map_err(|err| control_plane_error(name, err))?;

        let status = csr
            .status
            .get_or_insert_with(CertificateSigningRequestStatus::default);
        status
            .conditions
            .get_or_insert_with(Vec::new)
            .push(CertificateSigningRequestCondition {
                type_: "Approved".to_string(),
                status: "True".to_string(),
                reason: Some(APPROVAL_REASON.to_string()),
                message: Some("Issued for directory-authenticated proxy user".to_string()),
                last_transition_time: None,
                last_update_time: None,
            });

        self.csrs
            .replace_approval(name, &PostParams::default(), &csr)
            .await
            .map_err(|err| control_plane_error(name, err))?;
        Ok(())
    }

    async fn fetch_signed_certificate(&self, name: &str) -> Result<Vec<u8>, ControlPlaneError> {
        let deadline = tokio::time::Instant::now() + CERTIFICATE_FETCH_TIMEOUT;
        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(ControlPlaneError::Timeout(name.to_string()));
            }
            let csr = self
                .csrs
                .get(name)
                .await
                .map_err(|err| control_plane_error(name, err))?;
            if let Some(certificate) = csr.status.and_then(|status| status.certificate) {
                if !certificate.0.is_empty() {
                    return Ok(certificate.0);
                }
            }
            tokio::time::sleep(CERTIFICATE_POLL_INTERVAL).await;
        }
    }

    async fn delete_csr(&self, name: &str) -> Result<(), ControlPlaneError> {
        self.csrs
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|err| control_plane_error(name, err))?;
        Ok(())
    }
}
