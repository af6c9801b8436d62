use anyhow::{Context, Result};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::mitm::ca::{CaConfig, DEFAULT_ROOT_NAME, MIN_KEY_STRENGTH};

/// Log output style of the binary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone)]
pub struct Config {
    // Listener
    pub host: String,
    pub port: u16,

    // Outbound requests
    pub upstream_timeout_seconds: u64,

    // HTTPS interception
    pub https_interception_enabled: bool,
    pub ca_subject_name: String,
    pub ca_key_strength: usize,
    pub cert_cache_size: usize,
    pub cert_store_path: Option<PathBuf>,

    // Logging
    pub log_format: LogFormat,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok(); // Load .env file if present

        let host = env::var("PROXY_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("PROXY_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .context("Invalid PROXY_PORT")?;

        let upstream_timeout_seconds = env::var("UPSTREAM_TIMEOUT_SECONDS")
            .unwrap_or_else(|_| "15".to_string())
            .parse()
            .context("Invalid UPSTREAM_TIMEOUT_SECONDS")?;
        if upstream_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("UPSTREAM_TIMEOUT_SECONDS must be greater than 0"));
        }

        let https_interception_enabled = env::var("HTTPS_INTERCEPTION_ENABLED")
            .unwrap_or_else(|_| "true".to_string())
            .parse()
            .context("Invalid HTTPS_INTERCEPTION_ENABLED")?;

        let ca_subject_name =
            env::var("CA_SUBJECT_NAME").unwrap_or_else(|_| DEFAULT_ROOT_NAME.to_string());
        if ca_subject_name.trim().is_empty() {
            return Err(anyhow::anyhow!("CA_SUBJECT_NAME cannot be empty"));
        }

        let ca_key_strength: usize = env::var("CA_KEY_STRENGTH")
            .unwrap_or_else(|_| MIN_KEY_STRENGTH.to_string())
            .parse()
            .context("Invalid CA_KEY_STRENGTH")?;
        if ca_key_strength < MIN_KEY_STRENGTH {
            return Err(anyhow::anyhow!(
                "CA_KEY_STRENGTH is too small ({} bits). Minimum is {} bits.",
                ca_key_strength,
                MIN_KEY_STRENGTH
            ));
        }

        let cert_cache_size = env::var("CERT_CACHE_SIZE")
            .unwrap_or_else(|_| "1000".to_string())
            .parse()
            .context("Invalid CERT_CACHE_SIZE")?;
        if cert_cache_size == 0 {
            return Err(anyhow::anyhow!("CERT_CACHE_SIZE must be greater than 0"));
        }

        let cert_store_path = env::var("CERT_STORE_PATH")
            .ok()
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from);

        let log_format = match env::var("LOG_FORMAT")
            .unwrap_or_else(|_| "pretty".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "pretty" => LogFormat::Pretty,
            "json" => LogFormat::Json,
            other => {
                return Err(anyhow::anyhow!(
                    "Invalid LOG_FORMAT '{}': expected 'pretty' or 'json'",
                    other
                ))
            }
        };

        Ok(Config {
            host,
            port,
            upstream_timeout_seconds,
            https_interception_enabled,
            ca_subject_name,
            ca_key_strength,
            cert_cache_size,
            cert_store_path,
            log_format,
        })
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid listen address {}:{}", self.host, self.port))
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_seconds)
    }

    pub fn ca_config(&self) -> CaConfig {
        CaConfig {
            subject_name: self.ca_subject_name.clone(),
            key_strength: self.ca_key_strength,
            cache_size: self.cert_cache_size,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            upstream_timeout_seconds: 15,
            https_interception_enabled: true,
            ca_subject_name: DEFAULT_ROOT_NAME.to_string(),
            ca_key_strength: MIN_KEY_STRENGTH,
            cert_cache_size: 1000,
            cert_store_path: None,
            log_format: LogFormat::Pretty,
        }
    }
}
