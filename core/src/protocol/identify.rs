//! IDENTIFY capability negotiation.

use super::errors::{ErrorCode, ProtocolError};
use crate::config::BrokerConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Smallest explicit output buffer a client may ask for
const MIN_OUTPUT_BUFFER_SIZE: i64 = 64;
/// Smallest explicit heartbeat interval and message timeout, in milliseconds
const MIN_INTERVAL_MS: i64 = 1000;

/// IDENTIFY body as sent by the client. Zero means "use the node default",
/// -1 disables the feature where that makes sense.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentifyRequest {
    pub client_id: String,
    pub hostname: String,
    pub user_agent: String,
    pub feature_negotiation: bool,
    pub heartbeat_interval: i64,
    pub output_buffer_size: i64,
    pub output_buffer_timeout: i64,
    pub tls_v1: bool,
    pub deflate: bool,
    pub deflate_level: i32,
    pub snappy: bool,
    pub sample_rate: i32,
    pub msg_timeout: i64,
}

/// JSON body returned when the client set `feature_negotiation`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentifyResponse {
    pub max_rdy_count: i64,
    pub version: String,
    pub max_msg_timeout: u64,
    pub msg_timeout: u64,
    pub tls_v1: bool,
    pub deflate: bool,
    pub deflate_level: i32,
    pub max_deflate_level: i32,
    pub snappy: bool,
    pub sample_rate: u8,
    pub auth_required: bool,
    pub output_buffer_size: usize,
    pub output_buffer_timeout: i64,
}

/// Capabilities negotiated for one session
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub client_id: String,
    pub hostname: String,
    pub user_agent: String,
    pub feature_negotiation: bool,
    /// `None` when the client disabled heartbeats
    pub heartbeat_interval: Option<Duration>,
    /// Zero disables output buffering
    pub output_buffer_size: usize,
    /// `None` when the client disabled timed flushes
    pub output_buffer_timeout: Option<Duration>,
    pub tls: bool,
    pub deflate: bool,
    pub snappy: bool,
    /// Percentage of messages delivered, zero delivers everything
    pub sample_rate: u8,
    pub msg_timeout: Duration,
}

fn bad_body(description: String) -> ProtocolError {
    ProtocolError::fatal(ErrorCode::BadBody, description)
}

impl IdentifyRequest {
    pub fn parse(body: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(body)
            .map_err(|e| bad_body(format!("IDENTIFY failed to decode JSON body - {}", e)))
    }

    /// Validate the request against node limits and settle every capability.
    ///
    /// `tls_available` reports whether this node can perform a TLS upgrade.
    pub fn negotiate(
        self,
        config: &BrokerConfig,
        tls_available: bool,
    ) -> Result<Identity, ProtocolError> {
        let heartbeat_interval = match self.heartbeat_interval {
            -1 => None,
            0 => Some(config.default_heartbeat_interval()),
            ms if ms >= MIN_INTERVAL_MS && ms as u64 <= config.max_heartbeat_interval_ms => {
                Some(Duration::from_millis(ms as u64))
            }
            ms => {
                return Err(bad_body(format!(
                    "IDENTIFY heartbeat interval ({}) is invalid",
                    ms
                )))
            }
        };

        let output_buffer_size = match self.output_buffer_size {
            -1 => 0,
            0 => config.output_buffer_size,
            size if size >= MIN_OUTPUT_BUFFER_SIZE
                && size as usize <= config.max_output_buffer_size =>
            {
                size as usize
            }
            size => {
                return Err(bad_body(format!(
                    "IDENTIFY output buffer size ({}) is invalid",
                    size
                )))
            }
        };

        let output_buffer_timeout = match self.output_buffer_timeout {
            -1 => None,
            0 => Some(config.output_buffer_timeout()),
            ms if ms as u64 >= config.min_output_buffer_timeout_ms
                && ms as u64 <= config.max_output_buffer_timeout_ms
                && ms > 0 =>
            {
                Some(Duration::from_millis(ms as u64))
            }
            ms => {
                return Err(bad_body(format!(
                    "IDENTIFY output buffer timeout ({}) is invalid",
                    ms
                )))
            }
        };

        let sample_rate = match self.sample_rate {
            rate @ 0..=99 => rate as u8,
            rate => {
                return Err(bad_body(format!(
                    "IDENTIFY sample rate ({}) is invalid",
                    rate
                )))
            }
        };

        let msg_timeout = match self.msg_timeout {
            0 => config.msg_timeout(),
            ms if ms >= MIN_INTERVAL_MS && ms as u64 <= config.max_msg_timeout_ms => {
                Duration::from_millis(ms as u64)
            }
            ms => {
                return Err(bad_body(format!(
                    "IDENTIFY msg timeout ({}) is invalid",
                    ms
                )))
            }
        };

        if self.deflate && self.snappy {
            return Err(bad_body(
                "IDENTIFY cannot enable both deflate and snappy compression".to_string(),
            ));
        }

        let tls = self.tls_v1 && tls_available;
        if config.tls_required && !tls {
            return Err(ProtocolError::fatal(
                ErrorCode::Invalid,
                "IDENTIFY TLS is required by this node",
            ));
        }

        Ok(Identity {
            client_id: self.client_id,
            hostname: self.hostname,
            user_agent: self.user_agent,
            feature_negotiation: self.feature_negotiation,
            heartbeat_interval,
            output_buffer_size,
            output_buffer_timeout,
            tls,
            // Stream compression is not carried by this node
            deflate: false,
            snappy: false,
            sample_rate,
            msg_timeout,
        })
    }
}

impl Identity {
    pub fn response(&self, config: &BrokerConfig) -> IdentifyResponse {
        IdentifyResponse {
            max_rdy_count: config.max_rdy_count,
            version: env!("CARGO_PKG_VERSION").to_string(),
            max_msg_timeout: config.max_msg_timeout_ms,
            msg_timeout: self.msg_timeout.as_millis() as u64,
            tls_v1: self.tls,
            deflate: self.deflate,
            deflate_level: 0,
            max_deflate_level: 0,
            snappy: self.snappy,
            sample_rate: self.sample_rate,
            auth_required: false,
            output_buffer_size: self.output_buffer_size,
            output_buffer_timeout: self
                .output_buffer_timeout
                .map(|d| d.as_millis() as i64)
                .unwrap_or(-1),
        }
    }
}
