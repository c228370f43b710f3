//! Per-user client credentials
//!
//! This is the credential lifecycle layer: certificate issuance against the
//! cluster CA, durable caching in cluster secrets, and the in-memory cache
//! with single-flight issuance and idle eviction.

pub mod certificate;
pub mod store;

pub use certificate::{ClientCertificate, CredentialError};
pub use store::CertificateStore;
