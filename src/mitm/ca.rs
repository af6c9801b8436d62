//! Root CA and leaf certificate generation
//!
//! The root is an RSA key with a self-signed certificate whose subject and
//! issuer carry a distrust-labelled name. Leaves are issued per host, carry
//! SANs for `host` and `*.host`, and are signed by the root with SHA-256/RSA.
//!
//! RSA key generation is CPU-bound and can take seconds at 4096 bits; callers
//! on the async runtime run these functions through `spawn_blocking`.

use base64::Engine;
use rand::Rng;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SerialNumber,
};
use rsa::pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::net::IpAddr;
use time::{Duration, OffsetDateTime, Time};
use tracing::{debug, info};

use super::trust_store::{IssuerId, StoredCertificate};
use crate::error::{ProxyError, Result};

/// Default root subject; the name tells users not to trust it elsewhere.
pub const DEFAULT_ROOT_NAME: &str = "DO_NOT_TRUST_HTTP_Logger_Root";

/// Organizational unit stamped on every certificate we create
pub const ORGANIZATIONAL_UNIT: &str = "Created by http://httplogger.net";

/// Smallest RSA modulus we are willing to generate
pub const MIN_KEY_STRENGTH: usize = 2048;

/// Validity of roots and leaves
const VALIDITY_DAYS: i64 = 730;

/// CA configuration
#[derive(Debug, Clone)]
pub struct CaConfig {
    /// Root subject CN and O
    pub subject_name: String,

    /// RSA modulus bits for the root and for leaves
    pub key_strength: usize,

    /// In-memory leaf cache capacity
    pub cache_size: usize,
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            subject_name: DEFAULT_ROOT_NAME.to_string(),
            key_strength: MIN_KEY_STRENGTH,
            cache_size: 1000,
        }
    }
}

/// Generate an RSA key pair usable by rcgen for SHA-256/RSA signatures.
pub fn generate_rsa_key(bits: usize) -> Result<KeyPair> {
    if bits < MIN_KEY_STRENGTH {
        return Err(ProxyError::crypto(format!(
            "RSA key strength {} is below the {} bit minimum",
            bits, MIN_KEY_STRENGTH
        )));
    }

    let rsa_key = RsaPrivateKey::new(&mut rand::thread_rng(), bits)
        .map_err(|e| ProxyError::crypto(format!("RSA key generation failed: {}", e)))?;
    let pkcs8 = rsa_key
        .to_pkcs8_der()
        .map_err(|e| ProxyError::crypto(format!("PKCS#8 encoding failed: {}", e)))?;

    KeyPair::from_pkcs8_der_and_sign_algo(
        &PrivatePkcs8KeyDer::from(pkcs8.as_bytes()),
        &rcgen::PKCS_RSA_SHA256,
    )
    .map_err(|e| ProxyError::crypto(format!("Failed to load RSA key: {}", e)))
}

/// Random serial in `[1, i64::MAX]`
pub fn random_serial() -> u64 {
    rand::thread_rng().gen_range(1..=i64::MAX as u64)
}

/// Validity window: today's UTC midnight plus two years.
fn validity_window() -> (OffsetDateTime, OffsetDateTime) {
    let not_before = OffsetDateTime::now_utc().replace_time(Time::MIDNIGHT);
    (not_before, not_before + Duration::days(VALIDITY_DAYS))
}

fn distinguished_name(common_name: &str, organization: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationName, organization);
    dn.push(DnType::OrganizationalUnitName, ORGANIZATIONAL_UNIT);
    dn
}

/// Subject under which a host's leaf is issued and stored
pub fn leaf_subject(host: &str) -> String {
    format!("*.{}", host)
}

/// Names the leaf for `host` is valid for.
///
/// IP literals cannot be wildcarded and get a single IP SAN.
fn leaf_alt_names(host: &str) -> Vec<String> {
    if host.parse::<IpAddr>().is_ok() {
        vec![host.to_string()]
    } else {
        vec![host.to_string(), leaf_subject(host)]
    }
}

/// The process-wide signing root.
///
/// Created once at startup and never mutated afterwards.
pub struct RootCertificate {
    name: String,
    serial: u64,
    key_strength: usize,
    cert: Certificate,
    key: KeyPair,
}

impl std::fmt::Debug for RootCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootCertificate")
            .field("name", &self.name)
            .field("serial", &self.serial)
            .field("key_strength", &self.key_strength)
            .finish_non_exhaustive()
    }
}

impl RootCertificate {
    /// Generate a fresh self-signed root.
    pub fn generate(subject_name: &str, key_strength: usize) -> Result<Self> {
        info!(subject = %subject_name, key_strength, "Generating root certificate");

        let key = generate_rsa_key(key_strength)?;
        let serial = random_serial();
        let (not_before, not_after) = validity_window();

        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(subject_name, subject_name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.serial_number = Some(SerialNumber::from(serial));
        params.not_before = not_before;
        params.not_after = not_after;

        let cert = params
            .self_signed(&key)
            .map_err(|e| ProxyError::crypto(format!("Failed to self-sign root: {}", e)))?;

        info!(serial, "Root certificate generated");

        Ok(Self {
            name: subject_name.to_string(),
            serial,
            key_strength,
            cert,
            key,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Issuer identity of every leaf this root signs
    pub fn issuer_id(&self) -> IssuerId {
        IssuerId {
            name: self.name.clone(),
            serial: self.serial,
        }
    }

    pub fn cert_der(&self) -> CertificateDer<'static> {
        self.cert.der().clone()
    }

    pub fn cert_pem(&self) -> String {
        self.cert.pem()
    }

    /// Trusted-root store record; the private key never leaves the process.
    pub fn to_stored(&self) -> StoredCertificate {
        StoredCertificate {
            subject: self.name.clone(),
            issuer: self.issuer_id(),
            serial: self.serial,
            cert_pem: self.cert_pem(),
            key_pem: None,
        }
    }

    /// Generate a key pair for `host` and sign its leaf.
    pub fn issue_leaf(&self, host: &str) -> Result<LeafCertificate> {
        debug!(host = %host, "Issuing leaf certificate");

        let key = generate_rsa_key(self.key_strength)?;
        let serial = random_serial();
        let (not_before, not_after) = validity_window();

        let mut params = CertificateParams::new(leaf_alt_names(host))
            .map_err(|e| ProxyError::crypto(format!("Invalid host name '{}': {}", host, e)))?;
        params.distinguished_name = distinguished_name(&leaf_subject(host), &self.name);
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.serial_number = Some(SerialNumber::from(serial));
        params.not_before = not_before;
        params.not_after = not_after;

        let cert = params
            .signed_by(&key, &self.cert, &self.key)
            .map_err(|e| ProxyError::crypto(format!("Failed to sign leaf for {}: {}", host, e)))?;

        Ok(LeafCertificate {
            host: host.to_string(),
            serial,
            issuer: self.issuer_id(),
            cert_der: cert.der().clone(),
            key_der: PrivatePkcs8KeyDer::from(key.serialize_der()),
            root_der: self.cert_der(),
        })
    }

    /// Rebuild a leaf previously persisted with [`LeafCertificate::to_stored`].
    pub fn restore_leaf(&self, host: &str, stored: &StoredCertificate) -> Result<LeafCertificate> {
        let cert_der = CertificateDer::from_pem_slice(stored.cert_pem.as_bytes())
            .map_err(|e| ProxyError::crypto(format!("Stored certificate unreadable: {}", e)))?;
        let key_pem = stored
            .key_pem
            .as_deref()
            .ok_or_else(|| ProxyError::crypto("Stored leaf has no private key"))?;
        let key_der = PrivatePkcs8KeyDer::from_pem_slice(key_pem.as_bytes())
            .map_err(|e| ProxyError::crypto(format!("Stored private key unreadable: {}", e)))?;

        Ok(LeafCertificate {
            host: host.to_string(),
            serial: stored.serial,
            issuer: stored.issuer.clone(),
            cert_der,
            key_der,
            root_der: self.cert_der(),
        })
    }
}

/// A host certificate and its private key, signed by the root.
pub struct LeafCertificate {
    host: String,
    serial: u64,
    issuer: IssuerId,
    cert_der: CertificateDer<'static>,
    key_der: PrivatePkcs8KeyDer<'static>,
    root_der: CertificateDer<'static>,
}

impl std::fmt::Debug for LeafCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafCertificate")
            .field("host", &self.host)
            .field("serial", &self.serial)
            .field("issuer", &self.issuer)
            .finish_non_exhaustive()
    }
}

impl LeafCertificate {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn subject(&self) -> String {
        leaf_subject(&self.host)
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn issuer(&self) -> &IssuerId {
        &self.issuer
    }

    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    /// Leaf followed by the root, as presented in the ServerHello
    pub fn cert_chain(&self) -> Vec<CertificateDer<'static>> {
        vec![self.cert_der.clone(), self.root_der.clone()]
    }

    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(self.key_der.clone_key())
    }

    /// Personal store record, PEM-encoded with its key
    pub fn to_stored(&self) -> StoredCertificate {
        StoredCertificate {
            subject: self.subject(),
            issuer: self.issuer.clone(),
            serial: self.serial,
            cert_pem: pem_encode("CERTIFICATE", self.cert_der.as_ref()),
            key_pem: Some(pem_encode("PRIVATE KEY", self.key_der.secret_pkcs8_der())),
        }
    }
}

fn pem_encode(label: &str, der: &[u8]) -> String {
    let body = base64::engine::general_purpose::STANDARD.encode(der);
    let mut out = format!("-----BEGIN {}-----\n", label);
    for line in body.as_bytes().chunks(64) {
        out.push_str(&String::from_utf8_lossy(line));
        out.push('\n');
    }
    out.push_str(&format!("-----END {}-----\n", label));
    out
}
