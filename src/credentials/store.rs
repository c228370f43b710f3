//! In-memory credential cache
//!
//! Maps usernames to live client certificates. Issuance for a given user is
//! single-flight: concurrent first-time requests coalesce into one CSR, and
//! everyone shares the published credential. A background reaper evicts
//! entries that have been idle for half an hour.

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;

use super::certificate::{ClientCertificate, CredentialError};
use crate::kube::ControlPlane;

const REAPER_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub struct CertificateStore {
    control_plane: Arc<dyn ControlPlane>,
    entries: DashMap<String, Arc<ClientCertificate>>,
    issuance_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl CertificateStore {
    /// Create the store and start its reaper. The reaper stops on the next
    /// tick after the store is dropped.
    pub fn new(control_plane: Arc<dyn ControlPlane>) -> Arc<Self> {
        let store = Arc::new(Self {
            control_plane,
            entries: DashMap::new(),
            issuance_locks: DashMap::new(),
        });
        tokio::spawn(reaper(Arc::downgrade(&store)));
        store
    }

    /// Get a live credential for `username`, issuing or reloading one when
    /// the cached entry is missing or about to expire.
    pub async fn get(&self, username: &str) -> Result<Arc<ClientCertificate>, CredentialError> {
        if let Some(certificate) = self.lookup(username) {
            return Ok(certificate);
        }

        let lock = {
            let entry = self
                .issuance_locks
                .entry(username.to_string())
                .or_default();
            Arc::clone(&entry)
        };
        let _guard = lock.lock().await;

        // Another caller may have finished issuing while we waited.
        if let Some(certificate) = self.lookup(username) {
            return Ok(certificate);
        }

        let certificate = Arc::new(
            ClientCertificate::obtain(self.control_plane.as_ref(), username).await?,
        );
        self.entries
            .insert(username.to_string(), Arc::clone(&certificate));
        Ok(certificate)
    }

    fn lookup(&self, username: &str) -> Option<Arc<ClientCertificate>> {
        let entry = self.entries.get(username)?;
        if entry.is_about_to_expire() {
            return None;
        }
        entry.touch();
        Some(Arc::clone(&entry))
    }

    /// One reaper pass: drop idle credentials and unused issuance locks.
    pub fn sweep_stale(&self) {
        let total = self.entries.len();
        let mut removed = 0usize;
        self.entries.retain(|_, certificate| {
            if certificate.is_stale() {
                removed += 1;
                false
            } else {
                true
            }
        });
        self.issuance_locks
            .retain(|_, lock| Arc::strong_count(lock) > 1);
        tracing::info!("credential sweep: {total} cached, removed {removed} stale");
    }

    #[cfg(test)]
    pub(crate) fn cached(&self, username: &str) -> Option<Arc<ClientCertificate>> {
        self.entries
            .get(username)
            .map(|entry| Arc::clone(&entry))
    }
}

async fn reaper(store: Weak<CertificateStore>) {
    let mut ticker = tokio::time::interval(REAPER_INTERVAL);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(store) = store.upgrade() else {
            break;
        };
        store.sweep_stale();
    }
}
