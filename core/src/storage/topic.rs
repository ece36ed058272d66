use super::{Channel, StoreError, StoreSettings};
use crate::protocol::Message;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

const EPHEMERAL_SUFFIX: &str = "#ephemeral";

/// A message published before the topic had any channel
#[derive(Debug)]
struct Pending {
    message: Message,
    ready_at: Option<Instant>,
}

/// A topic fans each published message out to all of its channels.
///
/// Until the first channel is created messages wait in a backlog, which is
/// then handed to that channel in publish order.
pub struct Topic {
    name: String,
    ephemeral: bool,
    settings: StoreSettings,
    channels: RwLock<HashMap<String, Arc<Channel>>>,
    backlog: Mutex<Vec<Pending>>,
    exiting: AtomicBool,
    message_count: AtomicU64,
}

impl std::fmt::Debug for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topic")
            .field("name", &self.name)
            .field("channels", &self.channel_names())
            .finish()
    }
}

impl Topic {
    pub fn new(name: &str, settings: StoreSettings) -> Self {
        Self {
            name: name.to_string(),
            ephemeral: name.ends_with(EPHEMERAL_SUFFIX),
            settings,
            channels: RwLock::new(HashMap::new()),
            backlog: Mutex::new(Vec::new()),
            exiting: AtomicBool::new(false),
            message_count: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    pub fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::Acquire)
    }

    pub fn message_count(&self) -> u64 {
        self.message_count.load(Ordering::Relaxed)
    }

    /// Messages waiting for a first channel
    pub fn backlog_depth(&self) -> usize {
        self.backlog.lock().len()
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.is_exiting() {
            return Err(StoreError::TopicExiting(self.name.clone()));
        }
        Ok(())
    }

    pub fn get_or_create_channel(&self, name: &str) -> Result<Arc<Channel>, StoreError> {
        self.ensure_open()?;
        if let Some(channel) = self.channels.read().get(name) {
            return Ok(channel.clone());
        }

        let mut channels = self.channels.write();
        if let Some(channel) = channels.get(name) {
            return Ok(channel.clone());
        }

        let channel = Arc::new(Channel::new(&self.name, name, self.settings));
        if channels.is_empty() {
            let pending = std::mem::take(&mut *self.backlog.lock());
            if !pending.is_empty() {
                debug!(
                    "Topic {} handing {} backlog messages to channel {}",
                    self.name,
                    pending.len(),
                    name
                );
            }
            let now = Instant::now();
            for entry in pending {
                match entry.ready_at {
                    Some(at) if at > now => channel.put_deferred(entry.message, at - now)?,
                    _ => channel.put(entry.message)?,
                }
            }
        }
        channels.insert(name.to_string(), channel.clone());
        info!("Topic {} created channel {}", self.name, name);
        Ok(channel)
    }

    pub fn get_channel(&self, name: &str) -> Option<Arc<Channel>> {
        self.channels.read().get(name).cloned()
    }

    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.channels.read().values().cloned().collect()
    }

    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn channel_count(&self) -> usize {
        self.channels.read().len()
    }

    fn fan_out<F>(&self, messages: Vec<Message>, ready_at: Option<Instant>, mut deliver: F) -> Result<(), StoreError>
    where
        F: FnMut(&Channel, Vec<Message>) -> Result<(), StoreError>,
    {
        self.ensure_open()?;
        let count = messages.len() as u64;
        let channels = self.channels.read();

        if channels.is_empty() {
            self.backlog.lock().extend(
                messages
                    .into_iter()
                    .map(|message| Pending { message, ready_at }),
            );
        } else {
            for channel in channels.values() {
                if let Err(e) = deliver(channel, messages.clone()) {
                    // A channel being deleted concurrently simply misses the message
                    debug!("Topic {} skipped channel {}: {}", self.name, channel.name(), e);
                }
            }
        }
        self.message_count.fetch_add(count, Ordering::Relaxed);
        Ok(())
    }

    /// Publish one message to every channel
    pub fn put(&self, message: Message) -> Result<(), StoreError> {
        self.fan_out(vec![message], None, |channel, mut batch| match batch.pop() {
            Some(message) => channel.put(message),
            None => Ok(()),
        })
    }

    /// Publish a batch; each channel receives it under one lock acquisition
    pub fn put_many(&self, messages: Vec<Message>) -> Result<(), StoreError> {
        self.fan_out(messages, None, |channel, batch| channel.put_many(batch))
    }

    /// Publish one message that becomes deliverable after `delay`
    pub fn put_deferred(&self, message: Message, delay: Duration) -> Result<(), StoreError> {
        let ready_at = Some(Instant::now() + delay);
        self.fan_out(vec![message], ready_at, |channel, mut batch| {
            match batch.pop() {
                Some(message) => channel.put_deferred(message, delay),
                None => Ok(()),
            }
        })
    }

    /// Remove and close a channel
    pub fn delete_channel(&self, name: &str) -> Option<Arc<Channel>> {
        let channel = self.channels.write().remove(name)?;
        channel.close();
        info!("Topic {} deleted channel {}", self.name, name);
        Some(channel)
    }

    /// Delete an ephemeral channel once no consumer is left on it
    pub fn delete_channel_if_unused(&self, name: &str) -> bool {
        let mut channels = self.channels.write();
        let unused = channels
            .get(name)
            .is_some_and(|c| c.is_ephemeral() && c.consumer_count() == 0);
        if !unused {
            return false;
        }
        if let Some(channel) = channels.remove(name) {
            drop(channels);
            channel.close();
            info!("Topic {} deleted ephemeral channel {}", self.name, name);
        }
        true
    }

    /// Stop the topic and every channel on it
    pub fn close(&self) {
        if self.exiting.swap(true, Ordering::AcqRel) {
            return;
        }
        for channel in self.channels() {
            channel.close();
        }
        debug!("Closed topic {}", self.name);
    }
}
