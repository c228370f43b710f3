//! Configuration loading
//!
//! Settings are read once at startup from `config.yaml` in the working
//! directory. Key names follow the shape of the deployment manifests
//! (`Proxy.Port`, `LDAP.BindDN`, ...), so serde renames are explicit.

use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

/// Environment variable that overrides `LDAP.BindPassword`.
pub const LDAP_BIND_PASSWORD_ENV: &str = "LDAP_BIND_PASSWORD";

const CONFIG_FILE: &str = "config.yaml";

/// Top-level daemon settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Log one line per request in and out
    #[serde(rename = "Verbose")]
    pub verbose: bool,
    /// Forward with service credentials and impersonation headers instead of
    /// per-user client certificates
    #[serde(rename = "Impersonation")]
    pub impersonation: Option<bool>,
    #[serde(rename = "Proxy")]
    pub proxy: ProxySettings,
    #[serde(rename = "Kubernetes")]
    pub kubernetes: KubernetesSettings,
    #[serde(rename = "LDAP")]
    pub ldap: LdapSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    #[serde(rename = "Host")]
    pub host: String,
    #[serde(rename = "Port")]
    pub port: u16,
    #[serde(rename = "TLS")]
    pub tls: TlsSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    /// Path to the listener certificate; TLS is enabled when both this and
    /// `Key` exist on disk
    #[serde(rename = "Certificate")]
    pub certificate: String,
    #[serde(rename = "Key")]
    pub key: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KubernetesSettings {
    /// Explicit kubeconfig path; empty means auto-detect `$HOME/.kube/config`
    /// and fall back to in-cluster credentials
    #[serde(rename = "KubeConfig")]
    pub kube_config: String,
    /// Namespace that stores generated credential secrets
    #[serde(rename = "Namespace")]
    pub namespace: String,
    /// Upstream authority for forwarded requests
    #[serde(rename = "Host")]
    pub host: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LdapSettings {
    #[serde(rename = "URL")]
    pub url: String,
    #[serde(rename = "BaseDN")]
    pub base_dn: String,
    #[serde(rename = "BindDN")]
    pub bind_dn: String,
    #[serde(rename = "BindPassword")]
    pub bind_password: String,
    /// Access group; membership is required to authenticate
    #[serde(rename = "Group")]
    pub group: String,
    /// Optional PEM CA bundle for the directory connection
    #[serde(rename = "CACertificate")]
    pub ca_certificate: String,
    /// Two `%s` substitutions: username, group DN
    #[serde(rename = "SearchUserFilter")]
    pub search_user_filter: String,
    /// One `%s` substitution: group cn
    #[serde(rename = "SearchGroupFilter")]
    pub search_group_filter: String,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 8080,
            tls: TlsSettings::default(),
        }
    }
}

impl Default for KubernetesSettings {
    fn default() -> Self {
        Self {
            kube_config: String::new(),
            namespace: "kube-auth-proxy".to_string(),
            host: "kubernetes.default".to_string(),
        }
    }
}

impl Default for LdapSettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            base_dn: String::new(),
            bind_dn: String::new(),
            bind_password: String::new(),
            group: String::new(),
            ca_certificate: String::new(),
            search_user_filter: "(&(uid=%s)(memberOf=%s))".to_string(),
            search_group_filter: "(&(cn=%s)(objectClass=groupOfNames))".to_string(),
        }
    }
}

impl Settings {
    /// Load `config.yaml` from the working directory and apply environment
    /// overrides.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(Path::new(CONFIG_FILE))
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading configuration file {}", path.display()))?;
        let mut settings: Settings = serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing configuration file {}", path.display()))?;
        if let Ok(password) = std::env::var(LDAP_BIND_PASSWORD_ENV) {
            settings.ldap.bind_password = password;
        }
        Ok(settings)
    }

    /// Impersonation is the default mode unless explicitly disabled.
    pub fn impersonation(&self) -> bool {
        self.impersonation.unwrap_or(true)
    }
}
