//! # RillMQ Core Library
//!
//! RillMQ is a topic/channel message broker node. Producers publish messages to
//! named topics; every channel of a topic receives a copy, and within a channel
//! each message is delivered to exactly one of the connected consumers.
//!
//! ## Architecture Overview
//!
//! - [`broker`] - TCP listener, per-connection sessions, the command handler
//!   (input loop) and the message pump (output loop)
//! - [`protocol`] - wire framing, command decoding, message ids and IDENTIFY
//!   negotiation
//! - [`storage`] - per-channel ready queues with in-flight and deferred sets
//! - [`topic_manager`] - topic registry and the publish/subscribe entry points
//! - [`scanner`] - worker pool that requeues timed-out and due deferred messages
//! - [`metadata`] - topic/channel list persistence across restarts
//! - [`metrics`] - lock-free counters for operational visibility
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rillmq::{BrokerConfig, BrokerMetrics, BrokerServer, TopicManager};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BrokerConfig {
//!         tcp_address: "127.0.0.1:4150".to_string(),
//!         ..Default::default()
//!     };
//!
//!     let topics = Arc::new(TopicManager::from_config(&config));
//!     let metrics = Arc::new(BrokerMetrics::new());
//!     let server = BrokerServer::bind(config, topics, metrics).await?;
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Delivery Guarantees
//!
//! Delivery is at-least-once. A message handed to a consumer stays in the
//! channel's in-flight set until it is finished (`FIN`), requeued (`REQ`) or its
//! deadline passes, in which case the [`scanner`] moves it back to the ready
//! queue. A consumer that disconnects returns its in-flight messages at once.

pub mod broker;
pub mod config;
pub mod metadata;
pub mod metrics;
pub mod protocol;
pub mod scanner;
pub mod storage;
pub mod tls;
pub mod topic_manager;

pub use broker::{BrokerServer, ClientSession, ConnectionRegistry, SessionState};
pub use config::BrokerConfig;
pub use metadata::MetadataStore;
pub use metrics::{BrokerMetrics, MetricsSnapshot};
pub use protocol::{ErrorCode, Frame, FrameCodec, FrameType, Message, MessageId, ProtocolError};
pub use scanner::QueueScanner;
pub use storage::{Channel, Topic};
pub use topic_manager::TopicManager;

use thiserror::Error;

/// RillMQ error types
///
/// Connection-level failures surface as [`RillmqError::Protocol`] (a framed
/// error was already sent to the client) or [`RillmqError::Io`] (the transport
/// failed). Neither is fatal to the process.
#[derive(Debug, Error)]
pub enum RillmqError {
    /// Socket and file I/O failures
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Connection-level failures that are not plain I/O errors (timeouts, early close)
    #[error("Network error: {0}")]
    Network(String),

    /// JSON encoding and decoding errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid or unloadable configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// A protocol error reported to the client
    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    /// Framing failures on the outbound stream
    #[error("Frame error: {0}")]
    Frame(#[from] protocol::FrameError),

    /// TLS setup or in-band upgrade failures
    #[error("TLS error: {0}")]
    Tls(#[from] tls::TlsError),

    /// Topic/channel metadata could not be loaded or persisted
    #[error("Metadata error: {0}")]
    Metadata(String),
}

/// Result type alias for RillMQ operations
pub type Result<T> = std::result::Result<T, RillmqError>;
