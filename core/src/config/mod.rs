pub mod settings;

use crate::tls::TlsConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Node configuration.
///
/// Durations are carried as milliseconds so the struct round-trips through
/// TOML files and `RILLMQ_*` environment variables unchanged; use the
/// accessor methods to get [`Duration`] values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub tcp_address: String,
    pub node_id: u16,
    pub data_path: String,

    pub handshake_timeout_ms: u64,
    pub client_timeout_ms: u64,
    pub max_heartbeat_interval_ms: u64,

    pub mem_queue_size: usize,
    pub max_msg_size: usize,
    pub max_body_size: usize,
    pub max_frame_size: usize,

    pub msg_timeout_ms: u64,
    pub max_msg_timeout_ms: u64,
    pub max_req_timeout_ms: u64,
    pub max_rdy_count: i64,

    pub output_buffer_size: usize,
    pub max_output_buffer_size: usize,
    pub output_buffer_timeout_ms: u64,
    pub min_output_buffer_timeout_ms: u64,
    pub max_output_buffer_timeout_ms: u64,

    pub queue_scan_interval_ms: u64,
    pub queue_scan_refresh_interval_ms: u64,
    pub queue_scan_selection_count: usize,
    pub queue_scan_worker_pool_max: usize,
    pub queue_scan_dirty_percent: f64,

    // TLS configuration
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub tls_required: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            tcp_address: "0.0.0.0:4150".to_string(),
            node_id: 0,
            data_path: "./data".to_string(),

            handshake_timeout_ms: 10_000,
            client_timeout_ms: 60_000,
            max_heartbeat_interval_ms: 60_000,

            mem_queue_size: 10_000,
            max_msg_size: 1024 * 1024,
            max_body_size: 5 * 1024 * 1024,
            max_frame_size: 5 * 1024 * 1024 + 30, // body plus message header

            msg_timeout_ms: 60_000,
            max_msg_timeout_ms: 15 * 60 * 1000,
            max_req_timeout_ms: 60 * 60 * 1000,
            max_rdy_count: 2500,

            output_buffer_size: 16 * 1024,
            max_output_buffer_size: 64 * 1024,
            output_buffer_timeout_ms: 250,
            min_output_buffer_timeout_ms: 25,
            max_output_buffer_timeout_ms: 30_000,

            queue_scan_interval_ms: 100,
            queue_scan_refresh_interval_ms: 5_000,
            queue_scan_selection_count: 20,
            queue_scan_worker_pool_max: 4,
            queue_scan_dirty_percent: 0.25,

            tls_cert: None,
            tls_key: None,
            tls_required: false,
        }
    }
}

impl BrokerConfig {
    /// Enable the in-band TLS upgrade with the given PEM files
    pub fn with_tls(mut self, cert_path: &str, key_path: &str) -> Self {
        self.tls_cert = Some(cert_path.to_string());
        self.tls_key = Some(key_path.to_string());
        self
    }

    /// TLS settings when both certificate and key are configured
    pub fn tls_config(&self) -> Option<TlsConfig> {
        match (&self.tls_cert, &self.tls_key) {
            (Some(cert), Some(key)) => Some(TlsConfig::new(cert.as_str(), key.as_str())),
            _ => None,
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_millis(self.client_timeout_ms)
    }

    /// Heartbeat interval used when a client does not ask for one
    pub fn default_heartbeat_interval(&self) -> Duration {
        self.client_timeout() / 2
    }

    pub fn msg_timeout(&self) -> Duration {
        Duration::from_millis(self.msg_timeout_ms)
    }

    pub fn max_msg_timeout(&self) -> Duration {
        Duration::from_millis(self.max_msg_timeout_ms)
    }

    pub fn max_req_timeout(&self) -> Duration {
        Duration::from_millis(self.max_req_timeout_ms)
    }

    pub fn output_buffer_timeout(&self) -> Duration {
        Duration::from_millis(self.output_buffer_timeout_ms)
    }

    pub fn queue_scan_interval(&self) -> Duration {
        Duration::from_millis(self.queue_scan_interval_ms)
    }

    pub fn queue_scan_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.queue_scan_refresh_interval_ms)
    }

    /// Validate configuration bounds to prevent zero intervals and nonsensical limits
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.node_id >= 1024 {
            return Err(format!("node_id must be < 1024, got {}", self.node_id));
        }
        if self.max_msg_size == 0 {
            return Err("max_msg_size must be > 0".to_string());
        }
        if self.max_body_size < self.max_msg_size {
            return Err("max_body_size must be >= max_msg_size".to_string());
        }
        if self.max_frame_size < self.max_msg_size {
            return Err("max_frame_size must be >= max_msg_size".to_string());
        }
        if self.msg_timeout_ms == 0 {
            return Err("msg_timeout_ms must be > 0".to_string());
        }
        if self.msg_timeout_ms > self.max_msg_timeout_ms {
            return Err("msg_timeout_ms must be <= max_msg_timeout_ms".to_string());
        }
        if self.max_rdy_count <= 0 {
            return Err("max_rdy_count must be > 0".to_string());
        }
        if self.client_timeout_ms == 0 || self.handshake_timeout_ms == 0 {
            return Err("client_timeout_ms and handshake_timeout_ms must be > 0".to_string());
        }
        if self.output_buffer_size > self.max_output_buffer_size {
            return Err("output_buffer_size must be <= max_output_buffer_size".to_string());
        }
        if self.min_output_buffer_timeout_ms > self.max_output_buffer_timeout_ms {
            return Err(
                "min_output_buffer_timeout_ms must be <= max_output_buffer_timeout_ms".to_string(),
            );
        }
        if self.queue_scan_interval_ms == 0 || self.queue_scan_refresh_interval_ms == 0 {
            return Err("queue scan intervals must be > 0".to_string());
        }
        if self.queue_scan_selection_count == 0 || self.queue_scan_worker_pool_max == 0 {
            return Err(
                "queue_scan_selection_count and queue_scan_worker_pool_max must be > 0"
                    .to_string(),
            );
        }
        if !(0.0..=1.0).contains(&self.queue_scan_dirty_percent) {
            return Err("queue_scan_dirty_percent must be within 0.0..=1.0".to_string());
        }
        if self.tls_cert.is_some() != self.tls_key.is_some() {
            return Err("tls_cert and tls_key must be set together".to_string());
        }
        if self.tls_required && self.tls_cert.is_none() {
            return Err("tls_required needs tls_cert and tls_key".to_string());
        }
        Ok(())
    }
}
