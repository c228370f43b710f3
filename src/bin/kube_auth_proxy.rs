//! kube-auth-proxy daemon
//!
//! Reads `config.yaml` from the working directory, connects to the cluster
//! and the directory, then serves the authenticating proxy until the process
//! is stopped. Exits non-zero on any startup failure.

use std::sync::Arc;

use kube_auth_proxy::auth::LdapAuthenticator;
use kube_auth_proxy::config::Settings;
use kube_auth_proxy::credentials::CertificateStore;
use kube_auth_proxy::kube::KubeClient;
use kube_auth_proxy::proxy::{run_server, ProxyEngine, UpstreamIdentity};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    tracing::info!("starting kube-auth-proxy v{}", kube_auth_proxy::VERSION);

    let settings = Settings::load()?;
    let (kube_client, service_identity) = KubeClient::connect(&settings.kubernetes).await?;
    let authenticator = Arc::new(LdapAuthenticator::new(settings.ldap.clone())?);

    let identity = if settings.impersonation() {
        tracing::info!("forwarding with service credentials and impersonation headers");
        let identity = match service_identity.client_identity_pem() {
            Some(pem) => Some(reqwest::Identity::from_pem(pem)?),
            None => None,
        };
        UpstreamIdentity::Impersonation {
            identity,
            bearer_token: service_identity.bearer_token().map(str::to_string),
        }
    } else {
        tracing::info!("forwarding with per-user client certificates");
        UpstreamIdentity::ClientCertificates(CertificateStore::new(Arc::new(kube_client)))
    };

    let engine = Arc::new(ProxyEngine::new(
        authenticator,
        identity,
        settings.kubernetes.host.clone(),
        service_identity.ca_certificates(),
        settings.verbose,
    )?);
    run_server(engine, &settings.proxy).await
}

fn init_tracing() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(resolve_log_level())
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn resolve_log_level() -> LevelFilter {
    match std::env::var("RUST_LOG") {
        Ok(value) => match value.to_lowercase().as_str() {
            "trace" => LevelFilter::TRACE,
            "debug" => LevelFilter::DEBUG,
            "info" => LevelFilter::INFO,
            "warn" | "warning" => LevelFilter::WARN,
            "error" => LevelFilter::ERROR,
            _ => LevelFilter::INFO,
        },
        Err(_) => LevelFilter::INFO,
    }
}
