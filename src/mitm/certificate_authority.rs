//! Certificate Authority - per-host leaf issuance for MITM
//!
//! Leaves are looked up in three places, cheapest first: the in-memory LRU
//! cache, the personal trust store (filtered by this process's root as
//! issuer), and finally fresh generation. Concurrent first requests for the
//! same host may both generate, but only the first certificate to reach the
//! cache is ever served.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::ca::{leaf_subject, CaConfig, LeafCertificate, RootCertificate};
use super::trust_store::{StoreLocation, TrustStore};
use crate::error::{ProxyError, Result};

/// Root CA plus the leaf cache, shared by every connection worker.
pub struct CertificateAuthority {
    /// Published once at startup, read-only afterwards
    root: Arc<RootCertificate>,

    /// Trusted-root and personal certificate stores
    store: Arc<dyn TrustStore>,

    /// host -> leaf
    cache: Mutex<LruCache<String, Arc<LeafCertificate>>>,

    /// Leaves generated (not restored) by this process
    leaves_generated: AtomicUsize,
}

impl CertificateAuthority {
    /// Generate the root and install it into the trusted-root store.
    ///
    /// Fails with `CryptoFailure` if either step fails; the caller decides
    /// whether to continue without interception.
    pub async fn initialize(config: &CaConfig, store: Arc<dyn TrustStore>) -> Result<Self> {
        info!("Initializing Certificate Authority");

        let subject = config.subject_name.clone();
        let key_strength = config.key_strength;
        let root = tokio::task::spawn_blocking(move || {
            RootCertificate::generate(&subject, key_strength)
        })
        .await
        .map_err(|e| ProxyError::crypto(format!("Root generation task failed: {}", e)))??;

        store
            .add(StoreLocation::Root, root.to_stored())
            .await
            .map_err(|e| ProxyError::crypto(format!("Failed to install root: {}", e)))?;

        info!(
            subject = %root.name(),
            serial = root.serial(),
            cache_size = config.cache_size,
            "Root certificate installed"
        );

        Ok(Self::with_root(Arc::new(root), store, config.cache_size))
    }

    /// Build around an already published root.
    pub fn with_root(
        root: Arc<RootCertificate>,
        store: Arc<dyn TrustStore>,
        cache_size: usize,
    ) -> Self {
        let cache_size = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN);

        Self {
            root,
            store,
            cache: Mutex::new(LruCache::new(cache_size)),
            leaves_generated: AtomicUsize::new(0),
        }
    }

    pub fn root(&self) -> &Arc<RootCertificate> {
        &self.root
    }

    /// Get the leaf for `host`, issuing one if none is known.
    pub async fn issue_or_get_leaf(&self, host: &str) -> Result<Arc<LeafCertificate>> {
        let host = normalize_host(host)?;

        if let Some(leaf) = self.cache.lock().await.get(&host) {
            debug!(host = %host, "Certificate cache hit");
            return Ok(Arc::clone(leaf));
        }

        if let Some(leaf) = self.find_stored(&host).await? {
            debug!(host = %host, "Certificate restored from trust store");
            return Ok(self.publish(&host, Arc::new(leaf)).await);
        }

        debug!(host = %host, "Generating new certificate");
        let root = Arc::clone(&self.root);
        let issue_host = host.clone();
        let leaf = tokio::task::spawn_blocking(move || root.issue_leaf(&issue_host))
            .await
            .map_err(|e| ProxyError::crypto(format!("Leaf generation task failed: {}", e)))??;
        self.leaves_generated.fetch_add(1, Ordering::Relaxed);

        let leaf = Arc::new(leaf);
        let served = self.publish(&host, Arc::clone(&leaf)).await;
        if !Arc::ptr_eq(&served, &leaf) {
            debug!(host = %host, "Lost issuance race, serving cached certificate");
            return Ok(served);
        }

        if let Err(e) = self
            .store
            .add(StoreLocation::Personal, leaf.to_stored())
            .await
        {
            let mut cache = self.cache.lock().await;
            if cache.peek(&host).is_some_and(|cached| Arc::ptr_eq(cached, &leaf)) {
                cache.pop(&host);
            }
            return Err(ProxyError::crypto(format!(
                "Failed to install certificate for {}: {}",
                host, e
            )));
        }

        info!(host = %host, serial = leaf.serial(), "Issued leaf certificate");
        Ok(leaf)
    }

    /// Insert `leaf` unless another worker got there first; returns the winner.
    async fn publish(&self, host: &str, leaf: Arc<LeafCertificate>) -> Arc<LeafCertificate> {
        let mut cache = self.cache.lock().await;
        if let Some(existing) = cache.get(host) {
            return Arc::clone(existing);
        }
        cache.put(host.to_string(), Arc::clone(&leaf));
        leaf
    }

    async fn find_stored(&self, host: &str) -> Result<Option<LeafCertificate>> {
        let stored = self
            .store
            .find(
                StoreLocation::Personal,
                &leaf_subject(host),
                &self.root.issuer_id(),
            )
            .await?;

        match stored {
            Some(stored) => match self.root.restore_leaf(host, &stored) {
                Ok(leaf) => Ok(Some(leaf)),
                Err(e) => {
                    warn!(host = %host, error = %e, "Ignoring unreadable stored certificate");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    /// Number of leaves generated by this process
    pub fn leaves_generated(&self) -> usize {
        self.leaves_generated.load(Ordering::Relaxed)
    }

    /// (cached, capacity)
    pub async fn cache_stats(&self) -> (usize, usize) {
        let cache = self.cache.lock().await;
        (cache.len(), cache.cap().get())
    }
}

/// Lower-case the host and strip a trailing dot; reject empty names.
fn normalize_host(host: &str) -> Result<String> {
    let host = host.trim().trim_end_matches('.').to_ascii_lowercase();
    if host.is_empty() {
        return Err(ProxyError::crypto("Cannot issue a certificate for an empty host"));
    }
    Ok(host)
}
