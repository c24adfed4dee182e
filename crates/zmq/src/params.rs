//! Thread-safe parameter store.
//!
//! `ParamStore` is built from a validated [`Config`] and shared as
//! `Arc<ParamStore>`. Values are addressed by `(section, key)` and exchanged
//! as `serde_json::Value`; every write re-deserializes and re-validates the
//! whole section, so a rejected write leaves the section untouched.

use std::{
    fmt,
    str::FromStr,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use tracing::debug;
use validator::Validate;

use crate::{
    config::{BridgeParams, Config, NetworkParams, ZmqParams},
    error::TransferError,
    loops::LoopSettings,
    Result,
};

/// Named parameter group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Section {
    Zmq,
    Network,
    Bridge,
}

impl Section {
    pub fn as_str(&self) -> &'static str {
        match self {
            Section::Zmq => "zmq",
            Section::Network => "network",
            Section::Bridge => "bridge",
        }
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Section {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "zmq" => Ok(Section::Zmq),
            "network" => Ok(Section::Network),
            "bridge" | "rosbridge" => Ok(Section::Bridge),
            other => Err(TransferError::InvalidParam {
                section: other.to_string(),
                key: String::new(),
                reason: "unknown section".into(),
            }),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Sections {
    zmq: ZmqParams,
    network: NetworkParams,
    bridge: BridgeParams,
}

#[derive(Debug, Default)]
pub struct ParamStore {
    inner: RwLock<Sections>,
}

impl ParamStore {
    /// Builds a store from `config`, validating it first.
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: RwLock::new(Sections {
                zmq: config.zmq.clone(),
                network: config.network.clone(),
                bridge: config.bridge.clone(),
            }),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, Sections> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Sections> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn zmq(&self) -> ZmqParams {
        self.read().zmq.clone()
    }

    pub fn network(&self) -> NetworkParams {
        self.read().network.clone()
    }

    pub fn bridge(&self) -> BridgeParams {
        self.read().bridge.clone()
    }

    /// Per-tick settings for pattern loops, read without cloning strings.
    pub fn loop_settings(&self) -> LoopSettings {
        let guard = self.read();
        let zmq = &guard.zmq;
        LoopSettings {
            format: zmq.message_format,
            idle_sleep: zmq.message_processing_sleep(),
            show_content: zmq.show_message_content,
            max_message_length: zmq.max_message_length,
            verbose: zmq.verbose,
        }
    }

    /// Returns one value, or `None` when the key does not exist.
    pub fn get(&self, section: Section, key: &str) -> Option<Value> {
        self.get_all(section).remove(key)
    }

    pub fn get_or(&self, section: Section, key: &str, default: Value) -> Value {
        self.get(section, key).unwrap_or(default)
    }

    /// Returns every key of `section`.
    pub fn get_all(&self, section: Section) -> Map<String, Value> {
        let guard = self.read();
        let value = match section {
            Section::Zmq => serde_json::to_value(&guard.zmq),
            Section::Network => serde_json::to_value(&guard.network),
            Section::Bridge => serde_json::to_value(&guard.bridge),
        };
        match value {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    /// Sets one value. Unknown keys, type mismatches and out-of-range
    /// values are rejected.
    pub fn set(&self, section: Section, key: &str, value: Value) -> Result<()> {
        let mut updates = Map::new();
        updates.insert(key.to_string(), value);
        self.update(section, &updates)
    }

    /// Applies several values at once; either all apply or none do.
    pub fn update(&self, section: Section, updates: &Map<String, Value>) -> Result<()> {
        let mut guard = self.write();
        match section {
            Section::Zmq => guard.zmq = patch(&guard.zmq, section, updates)?,
            Section::Network => guard.network = patch(&guard.network, section, updates)?,
            Section::Bridge => guard.bridge = patch(&guard.bridge, section, updates)?,
        }
        debug!(%section, keys = ?updates.keys().collect::<Vec<_>>(), "Parameters updated");
        Ok(())
    }

    /// Restores the defaults of one section.
    pub fn reset(&self, section: Section) {
        let mut guard = self.write();
        match section {
            Section::Zmq => guard.zmq = ZmqParams::default(),
            Section::Network => guard.network = NetworkParams::default(),
            Section::Bridge => guard.bridge = BridgeParams::default(),
        }
    }
}

fn patch<T>(current: &T, section: Section, updates: &Map<String, Value>) -> Result<T>
where
    T: Serialize + DeserializeOwned + Validate,
{
    let mut value = serde_json::to_value(current)?;
    let fields = value
        .as_object_mut()
        .ok_or_else(|| TransferError::Serialization(format!("section {section} is not a map")))?;

    for (key, new_value) in updates {
        if !fields.contains_key(key) {
            return Err(TransferError::UnknownParam {
                section: section.to_string(),
                key: key.clone(),
            });
        }
        fields.insert(key.clone(), new_value.clone());
    }

    let next: T = serde_json::from_value(value).map_err(|e| TransferError::InvalidParam {
        section: section.to_string(),
        key: updates.keys().cloned().collect::<Vec<_>>().join(","),
        reason: e.to_string(),
    })?;
    next.validate()?;
    Ok(next)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::MessageFormat;

    #[test]
    fn test_get_defaults() {
        let store = ParamStore::default();
        assert_eq!(store.get(Section::Zmq, "port"), Some(json!(5555)));
        assert_eq!(store.get(Section::Network, "connectivity_timeout"), Some(json!(3.0)));
        assert_eq!(store.get(Section::Zmq, "missing"), None);
        assert_eq!(
            store.get_or(Section::Zmq, "missing", json!("fallback")),
            json!("fallback")
        );
    }

    #[test]
    fn test_set_and_read_back() {
        let store = ParamStore::default();
        store.set(Section::Zmq, "host", json!("10.0.0.7")).unwrap();
        store.set(Section::Zmq, "message_format", json!("string")).unwrap();

        let zmq = store.zmq();
        assert_eq!(zmq.host, "10.0.0.7");
        assert_eq!(zmq.message_format, MessageFormat::String);
        assert_eq!(store.loop_settings().format, MessageFormat::String);
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let store = ParamStore::default();
        let err = store.set(Section::Zmq, "hostname", json!("x")).unwrap_err();
        assert!(matches!(err, TransferError::UnknownParam { key, .. } if key == "hostname"));
    }

    #[test]
    fn test_type_mismatch_leaves_section_untouched() {
        let store = ParamStore::default();
        assert!(store.set(Section::Zmq, "port", json!("not a port")).is_err());
        assert!(store.set(Section::Zmq, "port", json!(70000)).is_err());
        assert_eq!(store.zmq().port, 5555);
    }

    #[test]
    fn test_validation_failure_rolls_back_batch() {
        let store = ParamStore::default();
        let mut updates = Map::new();
        updates.insert("port".into(), json!(6000));
        updates.insert("compression_level".into(), json!(42));

        assert!(matches!(
            store.update(Section::Zmq, &updates),
            Err(TransferError::ConfigError(_))
        ));
        assert_eq!(store.zmq().port, 5555);
    }

    #[test]
    fn test_reset_section() {
        let store = ParamStore::default();
        store.set(Section::Bridge, "port", json!(9191)).unwrap();
        store.reset(Section::Bridge);
        assert_eq!(store.bridge().port, 9090);
    }

    #[test]
    fn test_section_names() {
        assert_eq!("rosbridge".parse::<Section>().unwrap(), Section::Bridge);
        assert_eq!("ZMQ".parse::<Section>().unwrap(), Section::Zmq);
        assert!("metrics".parse::<Section>().is_err());
    }

    #[test]
    fn test_from_config_validates() {
        let mut config = Config::default();
        config.zmq.max_message_length = 0;
        assert!(ParamStore::from_config(&config).is_err());
    }
}
