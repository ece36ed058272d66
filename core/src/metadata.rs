//! Topic and channel names persisted across restarts.
//!
//! Only the shape of the node is kept, never messages. The file is written
//! to a temporary sibling and renamed over the target so a crash mid-write
//! leaves the previous version intact.

use crate::config::BrokerConfig;
use crate::topic_manager::TopicManager;
use crate::{Result, RillmqError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const METADATA_FILE: &str = "rillmq.dat";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ChannelMetadata {
    name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct TopicMetadata {
    name: String,
    #[serde(default)]
    channels: Vec<ChannelMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct NodeMetadata {
    version: String,
    #[serde(default)]
    topics: Vec<TopicMetadata>,
}

#[derive(Debug, Clone)]
pub struct MetadataStore {
    path: PathBuf,
}

impl MetadataStore {
    pub fn new(data_path: impl AsRef<Path>) -> Self {
        Self {
            path: data_path.as_ref().join(METADATA_FILE),
        }
    }

    pub fn from_config(config: &BrokerConfig) -> Self {
        Self::new(&config.data_path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Recreate every recorded topic and channel. Returns how many topics
    /// were restored; a missing file restores nothing.
    pub fn load(&self, topics: &TopicManager) -> Result<usize> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("No metadata at {}, starting empty", self.path.display());
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };

        let metadata: NodeMetadata = serde_json::from_slice(&data).map_err(|e| {
            RillmqError::Metadata(format!("failed to parse {} - {}", self.path.display(), e))
        })?;

        let mut restored = 0;
        for entry in metadata.topics {
            let topic = match topics.get_or_create_topic(&entry.name) {
                Ok(topic) => topic,
                Err(e) => {
                    warn!("Skipping topic '{}' from metadata: {}", entry.name, e);
                    continue;
                }
            };
            for channel in entry.channels {
                if let Err(e) = topic.get_or_create_channel(&channel.name) {
                    warn!(
                        "Skipping channel '{}/{}' from metadata: {}",
                        entry.name, channel.name, e
                    );
                }
            }
            restored += 1;
        }

        info!(
            "Loaded {} topics from {} (written by {})",
            restored,
            self.path.display(),
            metadata.version
        );
        Ok(restored)
    }

    /// Write every non-ephemeral topic and channel
    pub fn persist(&self, topics: &TopicManager) -> Result<()> {
        let mut entries: Vec<TopicMetadata> = topics
            .topics()
            .into_iter()
            .filter(|topic| !topic.is_ephemeral())
            .map(|topic| TopicMetadata {
                name: topic.name().to_string(),
                channels: topic
                    .channels()
                    .into_iter()
                    .filter(|channel| !channel.is_ephemeral())
                    .map(|channel| ChannelMetadata {
                        name: channel.name().to_string(),
                    })
                    .collect(),
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        for entry in &mut entries {
            entry.channels.sort_by(|a, b| a.name.cmp(&b.name));
        }

        let metadata = NodeMetadata {
            version: env!("CARGO_PKG_VERSION").to_string(),
            topics: entries,
        };
        let data = serde_json::to_vec(&metadata)?;

        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let tmp = self.path.with_extension("dat.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;

        info!(
            "Persisted {} topics to {}",
            metadata.topics.len(),
            self.path.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_loads_nothing() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::new(dir.path());
        let topics = TopicManager::from_config(&BrokerConfig::default());
        assert_eq!(store.load(&topics).unwrap(), 0);
        assert!(topics.list_topics().is_empty());
    }

    #[test]
    fn test_persist_then_load_skips_ephemeral() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::new(dir.path().join("nested"));

        let before = TopicManager::from_config(&BrokerConfig::default());
        let orders = before.get_or_create_topic("orders").unwrap();
        orders.get_or_create_channel("billing").unwrap();
        orders.get_or_create_channel("audit").unwrap();
        orders.get_or_create_channel("tail#ephemeral").unwrap();
        before.get_or_create_topic("scratch#ephemeral").unwrap();
        store.persist(&before).unwrap();
        assert!(store.path().exists());

        let after = TopicManager::from_config(&BrokerConfig::default());
        assert_eq!(store.load(&after).unwrap(), 1);
        assert_eq!(after.list_topics(), vec!["orders".to_string()]);
        assert_eq!(
            after.get_topic("orders").unwrap().channel_names(),
            vec!["audit".to_string(), "billing".to_string()]
        );
    }

    #[test]
    fn test_file_format() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::new(dir.path());
        let topics = TopicManager::from_config(&BrokerConfig::default());
        topics.get_or_create_topic("t").unwrap();
        store.persist(&topics).unwrap();

        let json: serde_json::Value =
            serde_json::from_slice(&fs::read(store.path()).unwrap()).unwrap();
        assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
        assert_eq!(json["topics"][0]["name"], "t");
        assert_eq!(json["topics"][0]["channels"], serde_json::json!([]));
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::new(dir.path());
        fs::write(store.path(), b"not json").unwrap();
        let topics = TopicManager::from_config(&BrokerConfig::default());
        assert!(matches!(store.load(&topics), Err(RillmqError::Metadata(_))));
    }
}
