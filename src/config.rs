use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub collector: CollectorConfig,
    pub flow: FlowConfig,
    pub export: ExportConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CaptureConfig {
    /// Process a pcap file instead of a live stream.
    pub pcap_file: Option<String>,
    /// Capture command whose stdout is a pcap stream, e.g.
    /// `tcpdump` with `["-i", "eth0", "-w", "-", "-U"]`.
    /// When neither this nor `pcap_file` is set, stdin is read.
    pub command: Option<String>,
    pub args: Vec<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            pcap_file: None,
            command: None,
            args: Vec::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CollectorConfig {
    /// Base URL of the collector, e.g. "http://collector.example.com:5000".
    pub base_url: String,
    /// Identity sent with every batch; defaults to the hostname when unset.
    pub client_id: Option<String>,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct FlowConfig {
    /// Inactivity after which an open flow is closed.
    pub idle_timeout_secs: u64,
    /// Maximum total lifetime of a flow regardless of activity.
    pub active_timeout_secs: u64,
    /// How often the flow table is swept for expired flows.
    pub sweep_interval_secs: u64,
    /// Hard cap on concurrently tracked flows; the flow with the oldest
    /// first-seen is force-closed when a new one would exceed it.
    pub max_flows: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ExportConfig {
    /// Flow records per batch; a batch is also cut on the interval timer.
    pub batch_size: usize,
    pub batch_interval_secs: u64,
    /// Cap on flow records waiting to be batched; oldest are dropped on
    /// overflow.
    pub max_pending: usize,
    /// Delivery attempts per batch before it is staged to disk.
    pub max_attempts: usize,
    pub backoff_base_ms: u64,
    pub backoff_max_secs: u64,
    /// How long shutdown waits for in-flight batches before staging them.
    pub shutdown_grace_secs: u64,
    /// Directory holding batches that exhausted their retry budget.
    pub staging_dir: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_level: String,
    pub log_file: Option<String>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        CollectorConfig {
            base_url: "http://localhost:5000".to_string(),
            client_id: None,
            request_timeout_secs: 10,
        }
    }
}

impl Default for FlowConfig {
    fn default() -> Self {
        FlowConfig {
            idle_timeout_secs: 60,
            active_timeout_secs: 300,
            sweep_interval_secs: 5,
            max_flows: 65536,
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        ExportConfig {
            batch_size: 20,
            batch_interval_secs: 30,
            max_pending: 10_000,
            max_attempts: 5,
            backoff_base_ms: 500,
            backoff_max_secs: 60,
            shutdown_grace_secs: 10,
            staging_dir: "offline_data".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            capture: CaptureConfig::default(),
            collector: CollectorConfig::default(),
            flow: FlowConfig::default(),
            export: ExportConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the engine cannot run with. Called before capture
    /// starts so a bad config never produces partial data.
    pub fn validate(&self) -> Result<(), String> {
        if self.capture.pcap_file.is_some() && self.capture.command.is_some() {
            return Err("capture.pcap_file and capture.command are mutually exclusive".to_string());
        }
        if self.collector.base_url.trim().is_empty() {
            return Err("collector.base_url must not be empty".to_string());
        }
        if self.collector.request_timeout_secs == 0 {
            return Err("collector.request_timeout_secs must be > 0".to_string());
        }
        if self.flow.idle_timeout_secs == 0 {
            return Err("flow.idle_timeout_secs must be > 0".to_string());
        }
        if self.flow.active_timeout_secs == 0 {
            return Err("flow.active_timeout_secs must be > 0".to_string());
        }
        if self.flow.idle_timeout_secs > self.flow.active_timeout_secs {
            return Err(
                "flow.idle_timeout_secs must not exceed flow.active_timeout_secs".to_string(),
            );
        }
        if self.flow.sweep_interval_secs == 0 {
            return Err("flow.sweep_interval_secs must be > 0".to_string());
        }
        if self.flow.max_flows == 0 {
            return Err("flow.max_flows must be > 0".to_string());
        }
        if self.export.batch_size == 0 {
            return Err("export.batch_size must be > 0".to_string());
        }
        if self.export.batch_interval_secs == 0 {
            return Err("export.batch_interval_secs must be > 0".to_string());
        }
        if self.export.max_pending == 0 {
            return Err("export.max_pending must be > 0".to_string());
        }
        if self.export.max_attempts == 0 {
            return Err("export.max_attempts must be > 0".to_string());
        }
        if self.export.backoff_base_ms == 0 {
            return Err("export.backoff_base_ms must be > 0".to_string());
        }
        if self.export.staging_dir.trim().is_empty() {
            return Err("export.staging_dir must not be empty".to_string());
        }
        Ok(())
    }

    /// Client identity for the collector; falls back to the hostname, then
    /// to a fixed label when even that is unavailable.
    pub fn client_id(&self) -> String {
        if let Some(id) = &self.collector.client_id {
            return id.clone();
        }
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown-host".to_string())
    }
}
