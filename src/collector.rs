//! Collector wire format and HTTP client.
//!
//! A batch is an immutable, sequence-numbered group of closed flow records.
//! The collector dedupes on `(client_id, sequence)`, so re-sending the same
//! batch after a partial failure is always safe; the exporter leans on that
//! for its retry and staging behavior.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

use crate::flow_table::FlowAggregate;

/// Flattened form of a closed flow aggregate, as persisted by the collector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowRecord {
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub packets_forward: u64,
    pub bytes_forward: u64,
    pub packets_reverse: u64,
    pub bytes_reverse: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

impl From<FlowAggregate> for FlowRecord {
    fn from(agg: FlowAggregate) -> Self {
        FlowRecord {
            src_addr: agg.key.src_addr,
            dst_addr: agg.key.dst_addr,
            src_port: agg.key.src_port,
            dst_port: agg.key.dst_port,
            protocol: agg.key.protocol.label().to_string(),
            first_seen: agg.first_seen,
            last_seen: agg.last_seen,
            packets_forward: agg.packets_forward,
            bytes_forward: agg.bytes_forward,
            packets_reverse: agg.packets_reverse,
            bytes_reverse: agg.bytes_reverse,
            host: agg.host,
        }
    }
}

/// Immutable once constructed: acknowledged and discarded, retried as-is,
/// or staged as-is.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExportBatch {
    pub client_id: String,
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    pub flows: Vec<FlowRecord>,
}

impl ExportBatch {
    pub fn new(client_id: String, sequence: u64, flows: Vec<FlowRecord>) -> Self {
        ExportBatch {
            client_id,
            sequence,
            created_at: Utc::now(),
            flows,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub device_name: String,
    pub ip_address: Option<IpAddr>,
    pub status: &'static str,
}

impl DeviceIdentity {
    pub fn new(client_id: &str) -> Self {
        let device_name = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| client_id.to_string());
        DeviceIdentity {
            device_id: client_id.to_string(),
            device_name,
            ip_address: local_ip(),
            status: "active",
        }
    }
}

/// Local address used to reach the outside; a connected UDP socket never
/// sends a packet but reveals the route's source address.
fn local_ip() -> Option<IpAddr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    socket.local_addr().ok().map(|a| a.ip())
}

#[derive(Debug)]
pub enum DeliveryError {
    /// Connect/timeout/transport failure.
    Request(reqwest::Error),
    /// The collector answered with a non-success status.
    Status(u16),
}

impl std::fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryError::Request(e) => write!(f, "request failed: {}", e),
            DeliveryError::Status(code) => write!(f, "collector returned status {}", code),
        }
    }
}

impl std::error::Error for DeliveryError {}

impl From<reqwest::Error> for DeliveryError {
    fn from(e: reqwest::Error) -> Self {
        DeliveryError::Request(e)
    }
}

/// Delivery seam between the exporter and the collector. The exporter is
/// generic over this so retry and staging behavior can be exercised with a
/// scripted client in tests.
pub trait CollectorClient {
    fn send_batch(
        &self,
        batch: &ExportBatch,
    ) -> impl std::future::Future<Output = Result<(), DeliveryError>> + Send;

    fn register_device(
        &self,
        identity: &DeviceIdentity,
    ) -> impl std::future::Future<Output = Result<(), DeliveryError>> + Send;
}

pub struct HttpCollector {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCollector {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(HttpCollector {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<(), DeliveryError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.client.post(&url).json(body).send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(DeliveryError::Status(response.status().as_u16()))
        }
    }
}

impl CollectorClient for HttpCollector {
    async fn send_batch(&self, batch: &ExportBatch) -> Result<(), DeliveryError> {
        self.post("/api/batch-flows", batch).await
    }

    async fn register_device(&self, identity: &DeviceIdentity) -> Result<(), DeliveryError> {
        self.post("/api/register-device", identity).await
    }
}
