//! # kube-auth-proxy
//!
//! Authenticating reverse proxy for the Kubernetes API server. Users present
//! HTTP Basic credentials, the proxy validates them against an LDAP directory
//! and forwards the request to the API server as a fully-identified cluster
//! principal.
//!
//! ## Features
//!
//! - HTTP Basic authentication backed by an LDAP directory
//! - Per-user short-lived client certificates signed by the cluster CA
//! - Durable credential caching in cluster secrets across restarts
//! - Impersonation mode using the proxy's own service credentials
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     kubectl / browser                     │
//! ├──────────────────────────────────────────────────────────┤
//! │                   kube-auth-proxy (Rust)                  │
//! │  ┌─────────┐  ┌──────────┐  ┌─────────────┐  ┌────────┐  │
//! │  │  Proxy  │──│   LDAP   │  │ Credential  │──│  Kube  │  │
//! │  │ Engine  │  │   Auth   │  │    Cache    │  │ Client │  │
//! │  └─────────┘  └──────────┘  └─────────────┘  └────────┘  │
//! ├──────────────────────────────────────────────────────────┤
//! │                 Kubernetes API server (mTLS)              │
//! └──────────────────────────────────────────────────────────┘
//! ```

pub mod auth;
pub mod config;
pub mod credentials;
pub mod kube;
pub mod proxy;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
