//! # RillMQ Storage Module
//!
//! In-memory message store backing topics and channels.
//!
//! ## Architecture
//!
//! 1. **Topic**: named publish target. Holds a backlog until its first
//!    channel exists, then fans every message out to all channels.
//! 2. **Channel**: ready queue, in-flight set and deferred set of one
//!    consumer group, each guarded by the channel's own lock.
//! 3. **Deadline queues**: min-heaps so the scanner only inspects the
//!    earliest in-flight deadlines and ready-at times.
//!
//! Messages are not written to disk; only the topic/channel list is
//! persisted (see [`crate::metadata`]).
//!
//! ## Modules
//!
//! - [`channel`] - per consumer group queues and delivery
//! - [`topic`] - fan-out and pre-channel backlog
//! - [`pqueue`] - deadline min-heap with lazy deletion

pub mod channel;
pub mod pqueue;
pub mod topic;

pub use channel::{Channel, ChannelStats};
pub use topic::Topic;

use crate::config::BrokerConfig;
use crate::protocol::MessageId;
use std::time::Duration;
use thiserror::Error;

/// Identity of a consumer within the node
pub type ClientId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("message {0} is not in flight")]
    MessageNotInFlight(MessageId),
    #[error("message {id} is not owned by client {owner}")]
    NotOwner { id: MessageId, owner: ClientId },
    #[error("channel {0} is exiting")]
    ChannelExiting(String),
    #[error("topic {0} is exiting")]
    TopicExiting(String),
}

/// Verdict of a delivery gate on the head of a ready queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Dequeue and hand the message to the consumer
    Deliver,
    /// Dequeue and discard the message for this consumer group
    Drop,
    /// Leave the message where it is
    Hold,
}

/// A subscriber bound to a channel
pub trait Consumer: Send + Sync {
    fn id(&self) -> ClientId;

    /// Called after the scanner requeued a message this consumer held
    fn timed_out(&self, id: &MessageId);

    /// Called when the channel shuts down
    fn close(&self);
}

/// Limits shared by every topic and channel on a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreSettings {
    /// Ready-queue depth above which a warning is logged
    pub mem_queue_size: usize,
    /// Upper bound on how long TOUCH can keep a message in flight
    pub max_msg_timeout: Duration,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self::from(&BrokerConfig::default())
    }
}

impl From<&BrokerConfig> for StoreSettings {
    fn from(config: &BrokerConfig) -> Self {
        Self {
            mem_queue_size: config.mem_queue_size,
            max_msg_timeout: config.max_msg_timeout(),
        }
    }
}
