//! # RillMQ Broker Module
//!
//! The TCP side of a node: accepting connections, running the V2 protocol
//! and pushing messages to subscribed clients.
//!
//! ## Architecture
//!
//! - [`server`] - listener, handshake magic, per-connection tasks and
//!   graceful shutdown
//! - [`connection`] - IDENTIFY, the optional TLS upgrade and the input loop
//! - [`handler`] - executes commands against the session and topic store
//! - [`pump`] - output loop delivering messages within the client's credit
//! - [`session`] - per-connection state shared by the two loops
//! - [`writer`] - the frame sink both loops write through
//! - [`registry`] - live sessions, closed together at shutdown
//!
//! ## Usage Example
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
//!     let topics = Arc::new(TopicManager::from_config(&config));
//!     let server = BrokerServer::bind(config, topics, Arc::new(BrokerMetrics::new())).await?;
//!
//!     // Runs until shutdown() is called
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod connection;
pub mod handler;
pub mod pump;
pub mod registry;
pub mod server;
pub mod session;
pub mod writer;

pub use connection::ProtocolV2;
pub use handler::MessageHandler;
pub use pump::MessagePump;
pub use registry::ConnectionRegistry;
pub use server::BrokerServer;
pub use session::{ClientSession, SessionState};
pub use writer::{BoxedStream, ConnectionWriter};
