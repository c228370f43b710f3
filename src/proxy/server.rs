//! Listener and connection handling
//!
//! Binds the configured address and serves HTTP/1.1 and HTTP/2 per
//! connection. When both TLS certificate and key files exist on disk the
//! listener terminates TLS; listener TLS is independent of the upstream mTLS
//! configuration.

use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context as _;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use crate::config::{ProxySettings, TlsSettings};
use crate::proxy::ProxyEngine;

/// Accept connections forever; only binding and TLS setup can fail.
pub async fn run_server(engine: Arc<ProxyEngine>, settings: &ProxySettings) -> anyhow::Result<()> {
    let host = if settings.host.is_empty() {
        "0.0.0.0"
    } else {
        settings.host.as_str()
    };
    let addr = format!("{host}:{}", settings.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding listener on {addr}"))?;
    let acceptor = tls_acceptor(&settings.tls)?;

    if acceptor.is_some() {
        tracing::info!("proxy listening on {addr} with TLS");
    } else {
        tracing::info!("proxy listening on {addr}");
    }

    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::error!("accept error: {err}");
                continue;
            }
        };
        tracing::debug!("connection from {peer}");

        let engine = Arc::clone(&engine);
        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            let served = match acceptor {
                Some(acceptor) => match acceptor.accept(socket).await {
                    Ok(stream) => serve_connection(stream, engine).await,
                    Err(err) => {
                        tracing::debug!("TLS handshake with {peer} failed: {err}");
                        return;
                    }
                },
                None => serve_connection(socket, engine).await,
            };
            if let Err(err) = served {
                tracing::debug!("connection from {peer} ended with error: {err}");
            }
        });
    }
}

async fn serve_connection<S>(
    stream: S,
    engine: Arc<ProxyEngine>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req| {
        let engine = Arc::clone(&engine);
        async move { Ok::<_, std::convert::Infallible>(engine.handle(req).await) }
    });
    auto::Builder::new(TokioExecutor::new())
        .serve_connection(TokioIo::new(stream), service)
        .await
}

/// TLS is enabled only when both configured files are present.
fn tls_acceptor(tls: &TlsSettings) -> anyhow::Result<Option<TlsAcceptor>> {
    if tls.certificate.is_empty() || tls.key.is_empty() {
        return Ok(None);
    }
    let cert_path = Path::new(&tls.certificate);
    let key_path = Path::new(&tls.key);
    if !cert_path.exists() || !key_path.exists() {
        return Ok(None);
    }

    let cert_file = std::fs::File::open(cert_path)
        .with_context(|| format!("opening listener certificate {}", cert_path.display()))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<Result<Vec<_>, _>>()
        .context("reading listener certificate")?;
    let key_file = std::fs::File::open(key_path)
        .with_context(|| format!("opening listener key {}", key_path.display()))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .context("reading listener key")?
        .context("no private key found in the listener key file")?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("building TLS listener config")?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}
