//! LDAP directory authentication
//!
//! Verifies Basic credentials against the configured directory and resolves
//! the user's group memberships. Every authentication opens a fresh
//! connection; nothing is pooled or cached here.

use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use ldap3::{ldap_escape, Ldap, LdapConnAsync, LdapConnSettings, LdapError, Scope, SearchEntry};
use rustls::{ClientConfig, RootCertStore};
use thiserror::Error;

use crate::config::LdapSettings;

/// Directory result code for a failed password bind.
const RC_INVALID_CREDENTIALS: u32 = 49;

/// An authenticated directory user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryUser {
    pub username: String,
    /// Group names derived from `memberOf`, in directory order
    pub groups: Vec<String>,
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("directory connection failed: {0}")]
    Connection(#[source] LdapError),
    #[error("service bind failed: {0}")]
    ServiceBind(#[source] LdapError),
    #[error("directory search failed: {0}")]
    Search(#[source] LdapError),
    #[error("user bind failed: {0}")]
    UserBind(#[source] LdapError),
    #[error("group {0} not found")]
    GroupNotFound(String),
    #[error("group search for {group} matched {count} entries, expected exactly 1")]
    AmbiguousGroup { group: String, count: usize },
    #[error("user search for {username} matched {count} entries, expected exactly 1")]
    AmbiguousUser { username: String, count: usize },
    #[error("invalid CA certificate bundle for the directory connection")]
    InvalidCaBundle,
}

/// Credential verification seam used by the proxy engine.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Returns `Ok(None)` for unknown users and wrong passwords; errors are
    /// reserved for directory/operational failures.
    async fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<DirectoryUser>, DirectoryError>;
}

pub struct LdapAuthenticator {
    settings: LdapSettings,
    tls: Option<Arc<ClientConfig>>,
}

impl LdapAuthenticator {
    pub fn new(settings: LdapSettings) -> Result<Self, DirectoryError> {
        let tls = if settings.ca_certificate.is_empty() {
            None
        } else {
            Some(Arc::new(tls_config_for_bundle(&settings.ca_certificate)?))
        };
        Ok(Self { settings, tls })
    }

    async fn connect(&self) -> Result<Ldap, DirectoryError> {
        let mut conn_settings = LdapConnSettings::new();
        if let Some(tls) = &self.tls {
            conn_settings = conn_settings.set_config(tls.clone());
        }
        let (conn, ldap) = LdapConnAsync::with_settings(conn_settings, &self.settings.url)
            .await
            .map_err(DirectoryError::Connection)?;
        ldap3::drive!(conn);
        Ok(ldap)
    }

    async fn authenticate_inner(
        &self,
        ldap: &mut Ldap,
        username: &str,
        password: &str,
    ) -> Result<Option<DirectoryUser>, DirectoryError> {
        let cfg = &self.settings;

        ldap.simple_bind(&cfg.bind_dn, &cfg.bind_password)
            .await
            .map_err(DirectoryError::ServiceBind)?
            .success()
            .map_err(DirectoryError::ServiceBind)?;

        // Resolve the access group to its DN.
        let group_filter = fill_filter(&cfg.search_group_filter, &[&ldap_escape(&cfg.group)]);
        let (mut entries, _) = ldap
            .search(
                &cfg.base_dn,
                Scope::Subtree,
                &group_filter,
                vec!["displayName"],
            )
            .await
            .map_err(DirectoryError::Search)?
            .success()
            .map_err(DirectoryError::Search)?;
        if entries.len() > 1 {
            return Err(DirectoryError::AmbiguousGroup {
                group: cfg.group.clone(),
                count: entries.len(),
            });
        }
        let Some(group_entry) = entries.pop() else {
            return Err(DirectoryError::GroupNotFound(cfg.group.clone()));
        };
        let group_dn = SearchEntry::construct(group_entry).dn;

        // Find the user within the access group.
        let user_filter = fill_filter(
            &cfg.search_user_filter,
            &[&ldap_escape(username), &ldap_escape(&group_dn)],
        );
        let (mut entries, _) = ldap
            .search(
                &cfg.base_dn,
                Scope::Subtree,
                &user_filter,
                vec!["displayName", "memberOf"],
            )
            .await
            .map_err(DirectoryError::Search)?
            .success()
            .map_err(DirectoryError::Search)?;
        if entries.len() > 1 {
            return Err(DirectoryError::AmbiguousUser {
                username: username.to_string(),
                count: entries.len(),
            });
        }
        let Some(user_entry) = entries.pop() else {
            return Ok(None);
        };
        let user_entry = SearchEntry::construct(user_entry);
        let member_of = user_entry
            .attrs
            .get("memberOf")
            .cloned()
            .unwrap_or_default();

        // Prove the password by binding as the user.
        let bind = ldap
            .simple_bind(&user_entry.dn, password)
            .await
            .map_err(DirectoryError::Connection)?;
        match bind.success() {
            Ok(_) => Ok(Some(DirectoryUser {
                username: username.to_string(),
                groups: derive_groups(&group_dn, &member_of),
            })),
            Err(LdapError::LdapResult { result }) if result.rc == RC_INVALID_CREDENTIALS => {
                Ok(None)
            }
            Err(err) => Err(DirectoryError::UserBind(err)),
        }
    }
}

#[async_trait]
impl Authenticator for LdapAuthenticator {
    async fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<DirectoryUser>, DirectoryError> {
        let mut ldap = self.connect().await?;
        let outcome = self.authenticate_inner(&mut ldap, username, password).await;
        let _ = ldap.unbind().await;
        outcome
    }
}

fn tls_config_for_bundle(pem_bundle: &str) -> Result<ClientConfig, DirectoryError> {
    let mut roots = RootCertStore::empty();
    let mut reader = std::io::BufReader::new(Cursor::new(pem_bundle.as_bytes()));
    let mut added = 0usize;
    for cert in rustls_pemfile::certs(&mut reader) {
        let cert = cert.map_err(|_| DirectoryError::InvalidCaBundle)?;
        roots
            .add(cert)
            .map_err(|_| DirectoryError::InvalidCaBundle)?;
        added += 1;
    }
    if added == 0 {
        return Err(DirectoryError::InvalidCaBundle);
    }
    Ok(ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth())
}

/// Substitute `%s` placeholders left to right.
fn fill_filter(template: &str, args: &[&str]) -> String {
    let mut filter = template.to_string();
    for arg in args {
        filter = filter.replacen("%s", arg, 1);
    }
    filter
}

/// Turn `memberOf` DNs into bare group names by stripping the access group's
/// structural suffix and the `cn=` prefix.
fn derive_groups(group_dn: &str, member_of: &[String]) -> Vec<String> {
    let suffix = group_dn
        .find(',')
        .map(|idx| &group_dn[idx..])
        .unwrap_or("");
    member_of
        .iter()
        .map(|value| {
            let value = value.strip_suffix(suffix).unwrap_or(value);
            let value = value.strip_prefix("cn=").unwrap_or(value);
            value.chars().filter(|c| !c.is_whitespace()).collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_filter_substitutes_in_order() {
        assert_eq!(
            fill_filter("(&(uid=%s)(memberOf=%s))", &["alice", "cn=kubeauth,dc=x"]),
            "(&(uid=alice)(memberOf=cn=kubeauth,dc=x))"
        );
        assert_eq!(
            fill_filter("(&(cn=%s)(objectClass=groupOfNames))", &["kubeauth"]),
            "(&(cn=kubeauth)(objectClass=groupOfNames))"
        );
    }

    #[test]
    fn derive_groups_strips_group_suffix_and_prefix() {
        let group_dn = "cn=kubeauth,cn=groups,dc=example,dc=org";
        let member_of = vec![
            "cn=admins,cn=groups,dc=example,dc=org".to_string(),
            "cn=dev ops,cn=groups,dc=example,dc=org".to_string(),
        ];

        assert_eq!(
            derive_groups(group_dn, &member_of),
            vec!["admins".to_string(), "devops".to_string()]
        );
    }

    #[test]
    fn derive_groups_keeps_foreign_values_intact() {
        let group_dn = "cn=kubeauth,cn=groups,dc=example,dc=org";
        let member_of = vec!["cn=other,ou=teams,dc=example,dc=org".to_string()];

        // Values outside the group subtree lose only the cn= prefix.
        assert_eq!(
            derive_groups(group_dn, &member_of),
            vec!["other,ou=teams,dc=example,dc=org".to_string()]
        );
    }

    #[test]
    fn derive_groups_handles_flat_group_dn() {
        assert_eq!(
            derive_groups("cn=kubeauth", &["cn=admins".to_string()]),
            vec!["admins".to_string()]
        );
    }
}
