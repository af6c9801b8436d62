//! Certificate trust store
//!
//! The proxy installs its root certificate into a trusted-root location and
//! every issued leaf into a personal location. Lookups filter by subject and
//! by issuer, so a leaf signed by a root from an earlier run is never served.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

/// Trust store errors
#[derive(Debug, Error)]
pub enum TrustStoreError {
    #[error("Store I/O failed for {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Corrupt store record {path}: {reason}")]
    Corrupt { path: String, reason: String },
}

/// Where a certificate lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreLocation {
    /// Trusted roots
    Root,
    /// Issued leaves
    Personal,
}

impl StoreLocation {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreLocation::Root => "root",
            StoreLocation::Personal => "personal",
        }
    }
}

/// Identity of a signing certificate: its name and its serial number.
///
/// The name alone is constant across runs; the serial is random per root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IssuerId {
    pub name: String,
    pub serial: u64,
}

/// A certificate as persisted in a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCertificate {
    /// Subject common name
    pub subject: String,
    pub issuer: IssuerId,
    pub serial: u64,
    pub cert_pem: String,
    /// PKCS#8 private key; roots are stored without one
    pub key_pem: Option<String>,
}

/// Platform trust store provider.
#[async_trait]
pub trait TrustStore: Send + Sync {
    /// Add (or replace) the certificate for `entry.subject` at `location`
    async fn add(
        &self,
        location: StoreLocation,
        entry: StoredCertificate,
    ) -> Result<(), TrustStoreError>;

    /// Find a certificate by subject, signed by `issuer`
    async fn find(
        &self,
        location: StoreLocation,
        subject: &str,
        issuer: &IssuerId,
    ) -> Result<Option<StoredCertificate>, TrustStoreError>;
}

/// In-process store.
#[derive(Debug, Default)]
pub struct MemoryTrustStore {
    entries: RwLock<HashMap<(StoreLocation, String), StoredCertificate>>,
}

impl MemoryTrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of certificates at `location`
    pub async fn len(&self, location: StoreLocation) -> usize {
        self.entries
            .read()
            .await
            .keys()
            .filter(|(loc, _)| *loc == location)
            .count()
    }
}

#[async_trait]
impl TrustStore for MemoryTrustStore {
    async fn add(
        &self,
        location: StoreLocation,
        entry: StoredCertificate,
    ) -> Result<(), TrustStoreError> {
        debug!(location = location.as_str(), subject = %entry.subject, "Adding certificate to memory store");
        self.entries
            .write()
            .await
            .insert((location, entry.subject.clone()), entry);
        Ok(())
    }

    async fn find(
        &self,
        location: StoreLocation,
        subject: &str,
        issuer: &IssuerId,
    ) -> Result<Option<StoredCertificate>, TrustStoreError> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(&(location, subject.to_string()))
            .filter(|entry| &entry.issuer == issuer)
            .cloned())
    }
}

/// Store backed by a directory tree: `<root>/<location>/<subject>.json`.
#[derive(Debug, Clone)]
pub struct DirectoryTrustStore {
    root: PathBuf,
}

impl DirectoryTrustStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, location: StoreLocation, subject: &str) -> PathBuf {
        self.root
            .join(location.as_str())
            .join(format!("{}.json", file_stem(subject)))
    }
}

/// Filesystem-safe name for a subject such as `*.example.com`.
fn file_stem(subject: &str) -> String {
    subject
        .replace('*', "_wildcard_")
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn io_error(path: &Path, e: std::io::Error) -> TrustStoreError {
    TrustStoreError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    }
}

#[async_trait]
impl TrustStore for DirectoryTrustStore {
    async fn add(
        &self,
        location: StoreLocation,
        entry: StoredCertificate,
    ) -> Result<(), TrustStoreError> {
        let path = self.record_path(location, &entry.subject);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| io_error(dir, e))?;
        }

        let json = serde_json::to_vec_pretty(&entry).map_err(|e| TrustStoreError::Corrupt {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        tokio::fs::write(&path, json)
            .await
            .map_err(|e| io_error(&path, e))?;

        debug!(path = %path.display(), "Certificate written to directory store");
        Ok(())
    }

    async fn find(
        &self,
        location: StoreLocation,
        subject: &str,
        issuer: &IssuerId,
    ) -> Result<Option<StoredCertificate>, TrustStoreError> {
        let path = self.record_path(location, subject);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&path, e)),
        };

        let entry: StoredCertificate =
            serde_json::from_slice(&bytes).map_err(|e| TrustStoreError::Corrupt {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        if entry.subject == subject && &entry.issuer == issuer {
            Ok(Some(entry))
        } else {
            debug!(path = %path.display(), "Stored certificate has a different issuer, ignoring");
            Ok(None)
        }
    }
}
