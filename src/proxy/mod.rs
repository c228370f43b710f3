//! HTTP proxy front end
//!
//! The engine authenticates each request against the directory, acquires
//! upstream credentials, and relays the request to the API server. The server
//! module owns the listener and optional TLS termination.

pub mod engine;
pub mod server;

pub use engine::{ProxyEngine, UpstreamIdentity};
pub use server::run_server;
