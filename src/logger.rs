use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use tracing::info;

use crate::request::ProxyRequest;

/// One traced request, handed to the tracing collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub method: String,
    pub absolute_uri: String,
    pub http_version: String,
    pub client_ip: IpAddr,
    pub content_length: u64,
    pub status_code: Option<u16>,
    pub timestamp: DateTime<Local>,
}

impl From<&ProxyRequest> for TraceRecord {
    fn from(request: &ProxyRequest) -> Self {
        Self {
            method: request.method.clone(),
            absolute_uri: request.remote_uri.clone(),
            http_version: request.http_version.to_string(),
            client_ip: request.client_address,
            content_length: request.content_length,
            status_code: request.status_code,
            timestamp: request.request_timestamp,
        }
    }
}

/// Receives one record per completed or attempted request.
///
/// Persistence and display live outside the proxy core.
pub trait RequestTracer: Send + Sync {
    fn trace(&self, record: TraceRecord);
}

pub type SharedRequestTracer = Arc<dyn RequestTracer>;

/// Emits every trace record as a structured log event.
#[derive(Debug, Default)]
pub struct LoggingTracer;

impl RequestTracer for LoggingTracer {
    fn trace(&self, record: TraceRecord) {
        info!(
            method = %record.method,
            uri = %record.absolute_uri,
            version = %record.http_version,
            client_ip = %record.client_ip,
            content_length = record.content_length,
            status = ?record.status_code,
            timestamp = %record.timestamp.to_rfc3339(),
            "Proxied request"
        );
    }
}

/// Keeps trace records in memory.
#[derive(Debug, Default)]
pub struct MemoryTracer {
    records: Mutex<Vec<TraceRecord>>,
}

impl MemoryTracer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything traced so far
    pub fn records(&self) -> Vec<TraceRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }
}

impl RequestTracer for MemoryTracer {
    fn trace(&self, record: TraceRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
    }
}
