//! Request pipeline
//!
//! Per request: parse Basic credentials, authenticate against the directory,
//! acquire upstream credentials for the selected mode, rebuild the request at
//! the upstream authority, dispatch over mTLS, relay the response. Only this
//! module translates failures into HTTP status codes.

use std::sync::Arc;

use bytes::Bytes;
use http::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT_ENCODING, AUTHORIZATION, CONTENT_LENGTH,
    CONTENT_TYPE, HOST, TRANSFER_ENCODING, WWW_AUTHENTICATE,
};
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::auth::{Authenticator, DirectoryUser};
use crate::credentials::CertificateStore;

/// Canonical challenge sent with every 401.
const WWW_AUTHENTICATE_VALUE: &str = r#"Basic realm="restricted", charset="UTF-8""#;

/// Inbound headers never forwarded upstream. Accept-Encoding is dropped so
/// the relay never has to decode compressed bodies; Host and the framing
/// headers are re-derived from the upstream authority and the buffered body.
const REMOVE_REQUEST_HEADERS: [HeaderName; 5] = [
    AUTHORIZATION,
    ACCEPT_ENCODING,
    HOST,
    CONTENT_LENGTH,
    TRANSFER_ENCODING,
];

const IMPERSONATE_USER: HeaderName = HeaderName::from_static("impersonate-user");
const IMPERSONATE_GROUP: HeaderName = HeaderName::from_static("impersonate-group");

/// Client identity used toward the API server, fixed at startup.
pub enum UpstreamIdentity {
    /// Per-user mTLS with cache-issued client certificates
    ClientCertificates(Arc<CertificateStore>),
    /// The proxy's own service credentials plus impersonation headers
    Impersonation {
        identity: Option<reqwest::Identity>,
        bearer_token: Option<String>,
    },
}

pub struct ProxyEngine {
    authenticator: Arc<dyn Authenticator>,
    identity: UpstreamIdentity,
    upstream_host: String,
    ca_certificates: Vec<reqwest::Certificate>,
    verbose: bool,
}

impl ProxyEngine {
    pub fn new(
        authenticator: Arc<dyn Authenticator>,
        identity: UpstreamIdentity,
        upstream_host: impl Into<String>,
        ca_certificates_der: &[Vec<u8>],
        verbose: bool,
    ) -> anyhow::Result<Self> {
        let ca_certificates = ca_certificates_der
            .iter()
            .map(|der| reqwest::Certificate::from_der(der))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            authenticator,
            identity,
            upstream_host: upstream_host.into(),
            ca_certificates,
            verbose,
        })
    }

    /// Handle one inbound request. Failures surface as status responses,
    /// never as transport errors toward the client.
    pub async fn handle<B>(&self, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: http_body::Body,
        B::Error: std::fmt::Display,
    {
        let Some((username, password)) = basic_credentials(req.headers()) else {
            tracing::info!("request without usable Basic credentials");
            return unauthorized();
        };

        let user = match self.authenticator.authenticate(&username, &password).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                tracing::info!("directory login failed for user {username}");
                return unauthorized();
            }
            Err(err) => {
                tracing::error!("directory error for user {username}: {err}");
                return plain_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");
            }
        };

        self.forward(req, &user).await
    }

    async fn forward<B>(&self, req: Request<B>, user: &DirectoryUser) -> Response<Full<Bytes>>
    where
        B: http_body::Body,
        B::Error: std::fmt::Display,
    {
        let identity = match &self.identity {
            UpstreamIdentity::ClientCertificates(store) => {
                let certificate = match store.get(&user.username).await {
                    Ok(certificate) => certificate,
                    Err(err) => {
                        tracing::error!("issuing credential for user {}: {err}", user.username);
                        return plain_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string());
                    }
                };
                match reqwest::Identity::from_pem(&certificate.identity_pem()) {
                    Ok(identity) => Some(identity),
                    Err(err) => {
                        tracing::error!("client identity for user {}: {err}", user.username);
                        return plain_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string());
                    }
                }
            }
            UpstreamIdentity::Impersonation { identity, .. } => identity.clone(),
        };

        let client = match self.client(identity) {
            Ok(client) => client,
            Err(err) => {
                tracing::error!("building upstream client: {err}");
                return plain_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");
            }
        };

        let (parts, body) = req.into_parts();
        let request_uri = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let url = format!("https://{}{}", self.upstream_host, request_uri);

        // The body is buffered whole so the upstream request is self-contained.
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(err) => {
                tracing::error!("reading request body: {err}");
                return plain_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");
            }
        };

        if self.verbose {
            tracing::info!(
                "> {} {} {} {}",
                user.username,
                parts.method,
                request_uri,
                body.len()
            );
        }

        let mut headers = HeaderMap::new();
        for (name, value) in &parts.headers {
            if REMOVE_REQUEST_HEADERS.iter().any(|skip| skip == name) {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }
        if let UpstreamIdentity::Impersonation { bearer_token, .. } = &self.identity {
            if let Some(token) = bearer_token {
                match HeaderValue::from_str(&format!("Bearer {token}")) {
                    Ok(value) => {
                        headers.insert(AUTHORIZATION, value);
                    }
                    Err(err) => {
                        tracing::error!("service bearer token is not a valid header: {err}");
                        return plain_response(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            "Internal Server Error",
                        );
                    }
                }
            }
            // https://kubernetes.io/docs/reference/access-authn-authz/authentication/#user-impersonation
            match impersonation_headers(user) {
                Ok(impersonation) => headers.extend(impersonation),
                Err(err) => {
                    tracing::error!("impersonation headers for {}: {err}", user.username);
                    return plain_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Internal Server Error",
                    );
                }
            }
        }

        let upstream_response = match client
            .request(parts.method.clone(), &url)
            .headers(headers)
            .body(body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                tracing::info!(
                    "{} {} {} upstream failure: {err}",
                    user.username,
                    parts.method,
                    request_uri
                );
                return plain_response(StatusCode::BAD_GATEWAY, &err.to_string());
            }
        };

        let status = upstream_response.status();
        let response_headers = upstream_response.headers().clone();
        let response_body = match upstream_response.bytes().await {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::error!("reading upstream response body: {err}");
                return plain_response(StatusCode::BAD_GATEWAY, &err.to_string());
            }
        };

        if self.verbose {
            tracing::info!(
                "< {} {} {} {}",
                user.username,
                parts.method,
                request_uri,
                status
            );
        }

        let mut response = Response::new(Full::new(response_body));
        *response.status_mut() = status;
        response.headers_mut().extend(response_headers);
        response
    }

    fn client(&self, identity: Option<reqwest::Identity>) -> reqwest::Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder();
        for certificate in &self.ca_certificates {
            builder = builder.add_root_certificate(certificate.clone());
        }
        if let Some(identity) = identity {
            builder = builder.identity(identity);
        }
        builder.build()
    }
}

fn impersonation_headers(user: &DirectoryUser) -> Result<HeaderMap, http::header::InvalidHeaderValue> {
    let mut headers = HeaderMap::new();
    headers.insert(IMPERSONATE_USER, HeaderValue::from_str(&user.username)?);
    for group in &user.groups {
        headers.append(IMPERSONATE_GROUP, HeaderValue::from_str(group)?);
    }
    Ok(headers)
}

fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, payload) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = BASE64.decode(payload.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

fn unauthorized() -> Response<Full<Bytes>> {
    let mut response = plain_response(StatusCode::UNAUTHORIZED, "Unauthorized");
    response.headers_mut().insert(
        WWW_AUTHENTICATE,
        HeaderValue::from_static(WWW_AUTHENTICATE_VALUE),
    );
    response
}

fn plain_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::DirectoryError;
    use crate::credentials::testing::MockControlPlane;
    use async_trait::async_trait;
    use base64::Engine as _;
    use chrono::{Duration as ChronoDuration, Utc};
    use ldap3::LdapError;
    use rcgen::{
        BasicConstraints, CertificateParams, DistinguishedName, DnType, Ia5String, IsCa, KeyPair,
        SanType,
    };
    use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio_rustls::TlsAcceptor;

    struct StaticAuthenticator {
        user: Option<DirectoryUser>,
        fail: bool,
    }

    #[async_trait]
    impl Authenticator for StaticAuthenticator {
        async fn authenticate(
            &self,
            _username: &str,
            _password: &str,
        ) -> Result<Option<DirectoryUser>, DirectoryError> {
            if self.fail {
                return Err(DirectoryError::Connection(LdapError::Io {
                    source: std::io::Error::new(
                        std::io::ErrorKind::ConnectionRefused,
                        "directory down",
                    ),
                }));
            }
            Ok(self.user.clone())
        }
    }

    fn known_user() -> DirectoryUser {
        DirectoryUser {
            username: "alice".to_string(),
            groups: vec!["admins".to_string(), "devs".to_string()],
        }
    }

    fn basic_header(username: &str, password: &str) -> String {
        format!("Basic {}", BASE64.encode(format!("{username}:{password}")))
    }

    fn request_with_auth(value: Option<&str>) -> Request<Full<Bytes>> {
        let mut request = Request::new(Full::new(Bytes::new()));
        *request.uri_mut() = "/api/v1/pods?watch=true".parse().unwrap();
        if let Some(value) = value {
            request
                .headers_mut()
                .insert(AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        }
        request
    }

    fn impersonation_engine(
        authenticator: StaticAuthenticator,
        upstream_host: String,
        ca: &[Vec<u8>],
        bearer_token: Option<String>,
    ) -> ProxyEngine {
        ProxyEngine::new(
            Arc::new(authenticator),
            UpstreamIdentity::Impersonation {
                identity: None,
                bearer_token,
            },
            upstream_host,
            ca,
            false,
        )
        .unwrap()
    }

    /// One-shot HTTPS upstream with a freshly minted CA; returns the bind
    /// address, the CA certificate (DER) and a channel with the raw request
    /// head it received.
    async fn spawn_tls_upstream(raw_response: &'static str) -> (SocketAddr, Vec<u8>, mpsc::Receiver<String>) {
        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::default();
        let mut ca_dn = DistinguishedName::new();
        ca_dn.push(DnType::CommonName, "kube-auth-proxy test CA");
        ca_params.distinguished_name = ca_dn;
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        let leaf_key = KeyPair::generate().unwrap();
        let mut leaf_params = CertificateParams::default();
        let mut leaf_dn = DistinguishedName::new();
        leaf_dn.push(DnType::CommonName, "localhost");
        leaf_params.distinguished_name = leaf_dn;
        leaf_params.subject_alt_names = vec![
            SanType::DnsName(Ia5String::try_from("localhost").unwrap()),
            SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        ];
        let leaf_cert = leaf_params.signed_by(&leaf_key, &ca_cert, &ca_key).unwrap();

        let mut server_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(
                vec![leaf_cert.der().clone()],
                PrivateKeyDer::from(PrivatePkcs8KeyDer::from(leaf_key.serialize_der())),
            )
            .unwrap();
        server_config.alpn_protocols = vec![b"http/1.1".to_vec()];
        let acceptor = TlsAcceptor::from(Arc::new(server_config));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (head_tx, head_rx) = mpsc::channel(1);

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut stream = acceptor.accept(socket).await.unwrap();

            let mut buffer = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let read = stream.read(&mut chunk).await.unwrap();
                if read == 0 {
                    break;
                }
                buffer.extend_from_slice(&chunk[..read]);
                if buffer.windows(4).any(|window| window == b"\r\n\r\n") {
                    break;
                }
            }
            let _ = head_tx.send(String::from_utf8_lossy(&buffer).to_string()).await;

            stream.write_all(raw_response.as_bytes()).await.unwrap();
            stream.shutdown().await.unwrap();
        });

        (addr, ca_cert.der().to_vec(), head_rx)
    }

    #[test]
    fn basic_credentials_parse_and_reject() {
        let mut headers = HeaderMap::new();
        assert!(basic_credentials(&headers).is_none());

        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&basic_header("alice", "s3cret:with:colons")).unwrap(),
        );
        assert_eq!(
            basic_credentials(&headers),
            Some(("alice".to_string(), "s3cret:with:colons".to_string()))
        );

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer token"));
        assert!(basic_credentials(&headers).is_none());

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic not-base64!"));
        assert!(basic_credentials(&headers).is_none());
    }

    #[tokio::test]
    async fn missing_credentials_yield_the_canonical_challenge() {
        let engine = impersonation_engine(
            StaticAuthenticator { user: None, fail: false },
            "localhost:1".to_string(),
            &[],
            None,
        );

        let response = engine.handle(request_with_auth(None)).await;

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get(WWW_AUTHENTICATE).unwrap(),
            WWW_AUTHENTICATE_VALUE
        );
    }

    #[tokio::test]
    async fn unknown_users_get_401_without_reaching_upstream() {
        let engine = impersonation_engine(
            StaticAuthenticator { user: None, fail: false },
            "localhost:1".to_string(),
            &[],
            None,
        );

        let response = engine
            .handle(request_with_auth(Some(&basic_header("ghost", "pw"))))
            .await;

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key(WWW_AUTHENTICATE));
    }

    #[tokio::test]
    async fn directory_failures_surface_as_500() {
        let engine = impersonation_engine(
            StaticAuthenticator { user: None, fail: true },
            "localhost:1".to_string(),
            &[],
            None,
        );

        let response = engine
            .handle(request_with_auth(Some(&basic_header("alice", "pw"))))
            .await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn unreachable_upstream_becomes_502() {
        // Reserve a port and close it again so the connection is refused.
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = closed.local_addr().unwrap();
        drop(closed);

        let engine = impersonation_engine(
            StaticAuthenticator { user: Some(known_user()), fail: false },
            format!("127.0.0.1:{}", addr.port()),
            &[],
            None,
        );

        let response = engine
            .handle(request_with_auth(Some(&basic_header("alice", "pw"))))
            .await;

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn impersonation_requests_scrub_and_decorate_headers() {
        let (addr, ca_der, mut head_rx) = spawn_tls_upstream(
            "HTTP/1.1 200 OK\r\nContent-Length: 4\r\nX-Upstream: yes\r\nConnection: close\r\n\r\nPONG",
        )
        .await;

        let engine = impersonation_engine(
            StaticAuthenticator { user: Some(known_user()), fail: false },
            format!("localhost:{}", addr.port()),
            &[ca_der],
            Some("svc-token".to_string()),
        );

        let mut request = request_with_auth(Some(&basic_header("alice", "pw")));
        request
            .headers_mut()
            .insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
        request
            .headers_mut()
            .insert("x-trace-id", HeaderValue::from_static("abc123"));

        let response = engine.handle(request).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("x-upstream").unwrap(), "yes");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"PONG");

        let head = head_rx.recv().await.unwrap().to_lowercase();
        assert!(head.contains("get /api/v1/pods?watch=true http/1.1"));
        assert!(head.contains("impersonate-user: alice"));
        assert!(head.contains("impersonate-group: admins"));
        assert!(head.contains("impersonate-group: devs"));
        assert!(head.contains("authorization: bearer svc-token"));
        assert!(head.contains("x-trace-id: abc123"));
        assert!(!head.contains("accept-encoding"));
        assert!(!head.contains("basic "));
    }

    #[tokio::test]
    async fn client_certificate_mode_issues_and_dispatches() {
        let (addr, ca_der, mut head_rx) = spawn_tls_upstream(
            "HTTP/1.1 201 Created\r\nContent-Length: 2\r\nConnection: close\r\n\r\nOK",
        )
        .await;

        let mock = Arc::new(MockControlPlane::new(Utc::now() + ChronoDuration::days(5)));
        let store = CertificateStore::new(mock.clone());
        let engine = ProxyEngine::new(
            Arc::new(StaticAuthenticator { user: Some(known_user()), fail: false }),
            UpstreamIdentity::ClientCertificates(store),
            format!("localhost:{}", addr.port()),
            &[ca_der],
            false,
        )
        .unwrap();

        let response = engine
            .handle(request_with_auth(Some(&basic_header("alice", "pw"))))
            .await;

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(mock.csr_count(), 1);

        // No impersonation headers in client-certificate mode.
        let head = head_rx.recv().await.unwrap().to_lowercase();
        assert!(!head.contains("impersonate-user"));
        assert!(!head.contains("authorization"));
    }

    #[tokio::test]
    async fn credential_issuance_failure_surfaces_as_500() {
        let mock = Arc::new(MockControlPlane::new(Utc::now() + ChronoDuration::days(5)));
        mock.fail_fetch.store(true, std::sync::atomic::Ordering::SeqCst);
        let store = CertificateStore::new(mock.clone());
        let engine = ProxyEngine::new(
            Arc::new(StaticAuthenticator { user: Some(known_user()), fail: false }),
            UpstreamIdentity::ClientCertificates(store),
            "localhost:1".to_string(),
            &[],
            false,
        )
        .unwrap();

        let response = engine
            .handle(request_with_auth(Some(&basic_header("alice", "pw"))))
            .await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
