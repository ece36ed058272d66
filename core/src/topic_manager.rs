//! # RillMQ Topic Management
//!
//! Node-wide registry of topics, and the entry point the protocol handler
//! uses to publish and subscribe.
//!
//! ## Overview
//!
//! - **Publishing**: assigns message ids and hands messages to a topic,
//!   creating the topic on first use
//! - **Subscribing**: creates the channel on demand and registers the
//!   consumer on it
//! - **Ephemeral cleanup**: a `#ephemeral` channel goes away with its last
//!   consumer, a `#ephemeral` topic with its last channel
//!
//! ## Topic Lifecycle
//!
//! ```text
//! PUB/SUB ──▶ created ──▶ channels added/removed ──▶ closed (shutdown or delete)
//! ```
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use rillmq::topic_manager::TopicManager;
//! use rillmq::BrokerConfig;
//! use bytes::Bytes;
//!
//! let manager = TopicManager::from_config(&BrokerConfig::default());
//! let id = manager.publish("orders", Bytes::from_static(b"hello"))?;
//! println!("published {}", id);
//! # Ok::<(), rillmq::storage::StoreError>(())
//! ```

use crate::config::BrokerConfig;
use crate::protocol::{GuidFactory, Message, MessageId};
use crate::storage::{Channel, ClientId, Consumer, StoreError, StoreSettings, Topic};
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const EPHEMERAL_SUFFIX: &str = "#ephemeral";
const MAX_NAME_LENGTH: usize = 64;

/// Topic and channel names: 1..=64 bytes of `[.a-zA-Z0-9_-]`, optionally
/// ending in `#ephemeral` (counted toward the limit).
pub fn is_valid_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LENGTH {
        return false;
    }
    let base = name.strip_suffix(EPHEMERAL_SUFFIX).unwrap_or(name);
    !base.is_empty()
        && base
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

/// Manages the topics of one node (lock-free map, per-topic locking)
#[derive(Debug)]
pub struct TopicManager {
    topics: DashMap<String, Arc<Topic>>,
    guid: GuidFactory,
    settings: StoreSettings,
    closing: AtomicBool,
}

impl TopicManager {
    pub fn new(node_id: u16, settings: StoreSettings) -> Self {
        Self {
            topics: DashMap::new(),
            guid: GuidFactory::new(node_id),
            settings,
            closing: AtomicBool::new(false),
        }
    }

    pub fn from_config(config: &BrokerConfig) -> Self {
        Self::new(config.node_id, StoreSettings::from(config))
    }

    fn ensure_open(&self, topic_name: &str) -> Result<(), StoreError> {
        if self.closing.load(Ordering::Acquire) {
            return Err(StoreError::TopicExiting(topic_name.to_string()));
        }
        Ok(())
    }

    /// Get a topic, creating it if needed (atomic check-and-insert)
    pub fn get_or_create_topic(&self, name: &str) -> Result<Arc<Topic>, StoreError> {
        self.ensure_open(name)?;
        if let Some(topic) = self.topics.get(name) {
            return Ok(topic.clone());
        }

        use dashmap::mapref::entry::Entry;
        let topic = match self.topics.entry(name.to_string()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let topic = Arc::new(Topic::new(name, self.settings));
                entry.insert(topic.clone());
                info!("Created topic '{}'", name);
                topic
            }
        };
        Ok(topic)
    }

    pub fn get_topic(&self, name: &str) -> Option<Arc<Topic>> {
        self.topics.get(name).map(|entry| entry.clone())
    }

    pub fn list_topics(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn topics(&self) -> Vec<Arc<Topic>> {
        self.topics.iter().map(|e| e.value().clone()).collect()
    }

    pub fn publish(&self, topic: &str, body: Bytes) -> Result<MessageId, StoreError> {
        let topic = self.get_or_create_topic(topic)?;
        let message = Message::new(self.guid.next_id(), body);
        let id = message.id;
        topic.put(message)?;
        Ok(id)
    }

    /// Publish a batch as one unit: every channel receives all of it or,
    /// when the topic is exiting, nothing is stored.
    pub fn publish_batch(&self, topic: &str, bodies: Vec<Bytes>) -> Result<usize, StoreError> {
        let topic = self.get_or_create_topic(topic)?;
        let messages: Vec<Message> = bodies
            .into_iter()
            .map(|body| Message::new(self.guid.next_id(), body))
            .collect();
        let count = messages.len();
        topic.put_many(messages)?;
        Ok(count)
    }

    pub fn publish_deferred(
        &self,
        topic: &str,
        body: Bytes,
        delay: Duration,
    ) -> Result<MessageId, StoreError> {
        let topic = self.get_or_create_topic(topic)?;
        let message = Message::new(self.guid.next_id(), body);
        let id = message.id;
        topic.put_deferred(message, delay)?;
        Ok(id)
    }

    /// Bind a consumer to `topic`/`channel`, creating both on demand
    pub fn subscribe(
        &self,
        topic: &str,
        channel: &str,
        consumer: Arc<dyn Consumer>,
    ) -> Result<Arc<Channel>, StoreError> {
        let topic = self.get_or_create_topic(topic)?;
        let channel = topic.get_or_create_channel(channel)?;
        channel.add_consumer(consumer)?;
        Ok(channel)
    }

    /// Unbind a consumer and delete whatever ephemeral state it leaves idle
    pub fn release_channel(&self, channel: &Channel, client: ClientId) {
        let remaining = channel.remove_consumer(client);
        if remaining > 0 || !channel.is_ephemeral() {
            return;
        }

        let Some(topic) = self.get_topic(channel.topic_name()) else {
            return;
        };
        if topic.delete_channel_if_unused(channel.name())
            && topic.is_ephemeral()
            && topic.channel_count() == 0
        {
            self.delete_topic_if_unused(topic.name());
        }
    }

    fn delete_topic_if_unused(&self, name: &str) {
        let removed = self
            .topics
            .remove_if(name, |_, topic| topic.is_ephemeral() && topic.channel_count() == 0);
        if let Some((_, topic)) = removed {
            topic.close();
            info!("Deleted ephemeral topic '{}'", name);
        }
    }

    pub fn delete_topic(&self, name: &str) -> bool {
        match self.topics.remove(name) {
            Some((_, topic)) => {
                topic.close();
                info!("Deleted topic '{}'", name);
                true
            }
            None => false,
        }
    }

    /// Every channel of every topic
    pub fn all_channels(&self) -> Vec<Arc<Channel>> {
        self.topics
            .iter()
            .flat_map(|entry| entry.value().channels())
            .collect()
    }

    /// Stop accepting publishes and close every topic
    pub fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        for topic in self.topics() {
            topic.close();
        }
        info!("Closed {} topics", self.topics.len());
    }
}
