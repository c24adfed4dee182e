//! Keyed publish topics and the subscribe topic set.
//!
//! Publish entries are read by their publish loop once per tick and may be
//! rewritten by any caller at any time; the last completed write wins.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use tracing::debug;

use crate::{codec::Payload, error::TransferError, Result};

/// Snapshot of one publish topic.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishTopic {
    pub key: String,
    /// Wire topic name.
    pub topic: String,
    pub content: Payload,
    pub frequency: f64,
    /// Incremented by every content update.
    pub revision: u64,
}

#[derive(Debug, Default)]
pub struct PublishTopics {
    entries: RwLock<HashMap<String, PublishTopic>>,
}

impl PublishTopics {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, PublishTopic>> {
        self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, PublishTopic>> {
        self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers `key`, replacing any existing entry with that key.
    pub fn add(
        &self,
        key: &str,
        topic: &str,
        content: impl Into<Payload>,
        frequency: f64,
    ) -> Result<()> {
        check_frequency(key, frequency)?;
        let previous = self.write().insert(
            key.to_string(),
            PublishTopic {
                key: key.to_string(),
                topic: topic.to_string(),
                content: content.into(),
                frequency,
                revision: 0,
            },
        );
        debug!(key, topic, frequency, replaced = previous.is_some(), "Publish topic added");
        Ok(())
    }

    pub fn update_content(&self, key: &str, content: impl Into<Payload>) -> Result<()> {
        let mut entries = self.write();
        let entry = entries
            .get_mut(key)
            .ok_or_else(|| TransferError::UnknownTopic(key.to_string()))?;
        entry.content = content.into();
        entry.revision += 1;
        Ok(())
    }

    /// Updates every entry publishing on `topic`; returns how many changed.
    pub fn update_content_by_topic(&self, topic: &str, content: impl Into<Payload>) -> Result<usize> {
        let content = content.into();
        let mut entries = self.write();
        let mut updated = 0;
        for entry in entries.values_mut().filter(|e| e.topic == topic) {
            entry.content = content.clone();
            entry.revision += 1;
            updated += 1;
        }
        if updated == 0 {
            return Err(TransferError::UnknownTopic(topic.to_string()));
        }
        Ok(updated)
    }

    pub fn set_frequency(&self, key: &str, frequency: f64) -> Result<()> {
        check_frequency(key, frequency)?;
        self.write()
            .get_mut(key)
            .map(|entry| entry.frequency = frequency)
            .ok_or_else(|| TransferError::UnknownTopic(key.to_string()))
    }

    pub fn get(&self, key: &str) -> Result<PublishTopic> {
        self.read()
            .get(key)
            .cloned()
            .ok_or_else(|| TransferError::UnknownTopic(key.to_string()))
    }

    pub fn content(&self, key: &str) -> Result<Payload> {
        self.get(key).map(|entry| entry.content)
    }

    pub fn remove(&self, key: &str) -> Result<PublishTopic> {
        self.write()
            .remove(key)
            .ok_or_else(|| TransferError::UnknownTopic(key.to_string()))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.read().contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

/// Publish rates must be positive and finite.
pub(crate) fn check_frequency(key: &str, frequency: f64) -> Result<()> {
    if frequency.is_finite() && frequency > 0.0 {
        Ok(())
    } else {
        Err(TransferError::InvalidParam {
            section: "publish_topics".into(),
            key: key.to_string(),
            reason: format!("frequency must be a finite number above 0 Hz, got {frequency}"),
        })
    }
}

/// Topic filters used for SUB sockets created without explicit topics.
#[derive(Debug, Default)]
pub struct SubscribeTopics {
    topics: RwLock<BTreeSet<String>>,
}

impl SubscribeTopics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the topic was already present.
    pub fn add(&self, topic: &str) -> bool {
        self.topics
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(topic.to_string())
    }

    /// Returns false when the topic was not present.
    pub fn remove(&self, topic: &str) -> bool {
        self.topics
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(topic)
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.topics
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(topic)
    }

    pub fn list(&self) -> Vec<String> {
        self.topics
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}
