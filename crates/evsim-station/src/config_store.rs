//! OCPP configuration key store.
//!
//! Entries keep their insertion order, which is observable through
//! GetConfiguration. Lookup is case-sensitive except where
//! ChangeConfiguration mandates otherwise.

use crate::template::ConfigurationKeyTemplate;
use evsim_types::v16::{ConfigurationStatus, KeyValue};
use tracing::error;

/// Well-known configuration key names.
pub mod keys {
    pub const HEARTBEAT_INTERVAL: &str = "HeartbeatInterval";
    /// Legacy spelling kept as a mirror of [`HEARTBEAT_INTERVAL`]
    pub const HEART_BEAT_INTERVAL: &str = "HeartBeatInterval";
    pub const WEB_SOCKET_PING_INTERVAL: &str = "WebSocketPingInterval";
    pub const METER_VALUE_SAMPLE_INTERVAL: &str = "MeterValueSampleInterval";
    pub const METER_VALUES_SAMPLED_DATA: &str = "MeterValuesSampledData";
    pub const NUMBER_OF_CONNECTORS: &str = "NumberOfConnectors";
    pub const LOCAL_AUTH_LIST_ENABLED: &str = "LocalAuthListEnabled";
}

/// One stored configuration entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigurationKey {
    pub key: String,
    pub value: String,
    pub readonly: bool,
    pub visible: bool,
    pub reboot: bool,
}

impl ConfigurationKey {
    fn to_key_value(&self) -> KeyValue {
        KeyValue {
            key: self.key.clone(),
            readonly: Some(self.readonly),
            value: Some(self.value.clone()),
        }
    }
}

/// Which timer a configuration change requires restarting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerRestart {
    Heartbeat,
    WebSocketPing,
}

/// Result of applying a ChangeConfiguration request.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeOutcome {
    pub status: ConfigurationStatus,
    pub restart: Option<TimerRestart>,
}

/// Ordered configuration key store.
#[derive(Debug, Clone, Default)]
pub struct ConfigStore {
    entries: Vec<ConfigurationKey>,
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a store from the template's `Configuration` section,
    /// preserving the template order.
    pub fn from_template(keys: &[ConfigurationKeyTemplate]) -> Self {
        let mut store = Self::new();
        for key in keys {
            store.add(
                &key.key,
                &key.value,
                key.readonly,
                key.visible.unwrap_or(true),
                key.reboot,
            );
        }
        store
    }

    pub fn get(&self, key: &str) -> Option<&ConfigurationKey> {
        self.entries.iter().find(|entry| entry.key == key)
    }

    pub fn get_case_insensitive(&self, key: &str) -> Option<&ConfigurationKey> {
        self.entries
            .iter()
            .find(|entry| entry.key.eq_ignore_ascii_case(key))
    }

    /// Append a new entry. Adding an existing key is a logged no-op.
    pub fn add(&mut self, key: &str, value: &str, readonly: bool, visible: bool, reboot: bool) {
        if self.get(key).is_some() {
            error!("configuration key '{key}' already exists, not adding");
            return;
        }
        self.entries.push(ConfigurationKey {
            key: key.to_string(),
            value: value.to_string(),
            readonly,
            visible,
            reboot,
        });
    }

    /// Add the key only when it is not present yet.
    pub fn ensure(&mut self, key: &str, value: &str, readonly: bool) {
        if self.get(key).is_none() {
            self.add(key, value, readonly, true, false);
        }
    }

    /// Mutate an existing entry's value. Setting an absent key is a
    /// logged no-op.
    pub fn set_value(&mut self, key: &str, value: &str) {
        match self.entries.iter_mut().find(|entry| entry.key == key) {
            Some(entry) => entry.value = value.to_string(),
            None => error!("configuration key '{key}' does not exist, not setting"),
        }
    }

    /// Write both heartbeat interval spellings, creating them as visible
    /// writable keys when absent.
    pub fn set_heartbeat_interval(&mut self, seconds: i64) {
        let value = seconds.to_string();
        for key in [keys::HEARTBEAT_INTERVAL, keys::HEART_BEAT_INTERVAL] {
            if self.get(key).is_some() {
                self.set_value(key, &value);
            } else {
                self.add(key, &value, false, true, false);
            }
        }
    }

    /// Apply a ChangeConfiguration request with case-insensitive lookup,
    /// the heartbeat-key mirror, and readonly/reboot handling.
    pub fn apply_change(&mut self, key: &str, value: &str) -> ChangeOutcome {
        let Some(entry) = self
            .entries
            .iter_mut()
            .find(|entry| entry.key.eq_ignore_ascii_case(key))
        else {
            return ChangeOutcome {
                status: ConfigurationStatus::NotSupported,
                restart: None,
            };
        };

        if entry.readonly {
            return ChangeOutcome {
                status: ConfigurationStatus::Rejected,
                restart: None,
            };
        }

        entry.value = value.to_string();
        let canonical = entry.key.clone();
        let reboot = entry.reboot;

        let restart = if canonical == keys::HEARTBEAT_INTERVAL
            || canonical == keys::HEART_BEAT_INTERVAL
        {
            let mirror = if canonical == keys::HEARTBEAT_INTERVAL {
                keys::HEART_BEAT_INTERVAL
            } else {
                keys::HEARTBEAT_INTERVAL
            };
            if self.get(mirror).is_some() {
                self.set_value(mirror, value);
            } else {
                self.add(mirror, value, false, true, false);
            }
            Some(TimerRestart::Heartbeat)
        } else if canonical == keys::WEB_SOCKET_PING_INTERVAL {
            Some(TimerRestart::WebSocketPing)
        } else {
            None
        };

        ChangeOutcome {
            status: if reboot {
                ConfigurationStatus::RebootRequired
            } else {
                ConfigurationStatus::Accepted
            },
            restart,
        }
    }

    /// Resolve a GetConfiguration request: visible matches and unknown
    /// keys, in request order; an empty request returns every visible
    /// entry in insertion order.
    pub fn get_configuration(
        &self,
        requested: Option<&[String]>,
    ) -> (Vec<KeyValue>, Vec<String>) {
        match requested {
            None | Some([]) => (
                self.entries
                    .iter()
                    .filter(|entry| entry.visible)
                    .map(ConfigurationKey::to_key_value)
                    .collect(),
                Vec::new(),
            ),
            Some(requested) => {
                let mut known = Vec::new();
                let mut unknown = Vec::new();
                for key in requested {
                    match self.get(key).filter(|entry| entry.visible) {
                        Some(entry) => known.push(entry.to_key_value()),
                        None => unknown.push(key.clone()),
                    }
                }
                (known, unknown)
            }
        }
    }

    /// Parse a numeric configuration value, `None` when absent or
    /// unparseable.
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|entry| entry.value.parse().ok())
    }

    /// The effective heartbeat interval in seconds, preferring the
    /// canonical spelling over the legacy one.
    pub fn heartbeat_interval_secs(&self) -> Option<i64> {
        self.get_i64(keys::HEARTBEAT_INTERVAL)
            .or_else(|| self.get_i64(keys::HEART_BEAT_INTERVAL))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(key: &str, value: &str) -> ConfigStore {
        let mut store = ConfigStore::new();
        store.add(key, value, false, true, false);
        store
    }

    #[test]
    fn add_preserves_order_and_rejects_duplicates() {
        let mut store = ConfigStore::new();
        store.add("B", "2", false, true, false);
        store.add("A", "1", false, true, false);
        store.add("B", "overwrite", false, true, false);

        assert_eq!(store.len(), 2);
        let (all, _) = store.get_configuration(None);
        assert_eq!(all[0].key, "B");
        assert_eq!(all[0].value.as_deref(), Some("2"));
        assert_eq!(all[1].key, "A");
    }

    #[test]
    fn set_value_ignores_absent_key() {
        let mut store = store_with("A", "1");
        store.set_value("missing", "x");
        assert_eq!(store.len(), 1);
        store.set_value("A", "2");
        assert_eq!(store.get("A").unwrap().value, "2");
    }

    #[test]
    fn lookup_is_case_sensitive_by_default() {
        let store = store_with("HeartbeatInterval", "60");
        assert!(store.get("heartbeatinterval").is_none());
        assert!(store.get_case_insensitive("heartbeatinterval").is_some());
    }

    #[test]
    fn change_unknown_key_is_not_supported() {
        let mut store = ConfigStore::new();
        let outcome = store.apply_change("Nope", "1");
        assert_eq!(outcome.status, ConfigurationStatus::NotSupported);
        assert!(outcome.restart.is_none());
    }

    #[test]
    fn change_readonly_key_is_rejected() {
        let mut store = ConfigStore::new();
        store.add("NumberOfConnectors", "2", true, true, false);
        let outcome = store.apply_change("NumberOfConnectors", "4");
        assert_eq!(outcome.status, ConfigurationStatus::Rejected);
        assert_eq!(store.get("NumberOfConnectors").unwrap().value, "2");
    }

    #[test]
    fn change_reboot_key_reports_reboot_required() {
        let mut store = ConfigStore::new();
        store.add("SomeDeepSetting", "a", false, true, true);
        let outcome = store.apply_change("somedeepsetting", "b");
        assert_eq!(outcome.status, ConfigurationStatus::RebootRequired);
        assert_eq!(store.get("SomeDeepSetting").unwrap().value, "b");
    }

    #[test]
    fn heartbeat_keys_mirror_both_directions() {
        let mut store = ConfigStore::new();
        store.add(keys::HEARTBEAT_INTERVAL, "60", false, true, false);
        store.add(keys::HEART_BEAT_INTERVAL, "60", false, true, false);

        let outcome = store.apply_change(keys::HEARTBEAT_INTERVAL, "30");
        assert_eq!(outcome.status, ConfigurationStatus::Accepted);
        assert_eq!(outcome.restart, Some(TimerRestart::Heartbeat));
        assert_eq!(store.get(keys::HEART_BEAT_INTERVAL).unwrap().value, "30");

        let outcome = store.apply_change(keys::HEART_BEAT_INTERVAL, "45");
        assert_eq!(outcome.restart, Some(TimerRestart::Heartbeat));
        assert_eq!(store.get(keys::HEARTBEAT_INTERVAL).unwrap().value, "45");
    }

    #[test]
    fn heartbeat_mirror_is_created_when_absent() {
        let mut store = ConfigStore::new();
        store.add(keys::HEARTBEAT_INTERVAL, "60", false, true, false);
        store.apply_change(keys::HEARTBEAT_INTERVAL, "90");
        assert_eq!(store.get(keys::HEART_BEAT_INTERVAL).unwrap().value, "90");
    }

    #[test]
    fn ping_interval_change_requests_ping_restart() {
        let mut store = store_with(keys::WEB_SOCKET_PING_INTERVAL, "0");
        let outcome = store.apply_change(keys::WEB_SOCKET_PING_INTERVAL, "54");
        assert_eq!(outcome.restart, Some(TimerRestart::WebSocketPing));
    }

    #[test]
    fn get_configuration_hides_invisible_entries() {
        let mut store = ConfigStore::new();
        store.add("Public", "1", false, true, false);
        store.add("Hidden", "2", false, false, false);

        let (all, unknown) = store.get_configuration(None);
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].key, "Public");
        assert!(unknown.is_empty());

        let request = vec!["Public".to_string(), "Hidden".to_string(), "Nope".to_string()];
        let (known, unknown) = store.get_configuration(Some(&request));
        assert_eq!(known.len(), 1);
        assert_eq!(unknown, vec!["Hidden".to_string(), "Nope".to_string()]);
    }

    #[test]
    fn empty_request_list_returns_everything_visible() {
        let store = store_with("A", "1");
        let (all, unknown) = store.get_configuration(Some(&[]));
        assert_eq!(all.len(), 1);
        assert!(unknown.is_empty());
    }

    #[test]
    fn heartbeat_interval_prefers_canonical_spelling() {
        let mut store = ConfigStore::new();
        store.add(keys::HEART_BEAT_INTERVAL, "120", false, true, false);
        assert_eq!(store.heartbeat_interval_secs(), Some(120));
        store.add(keys::HEARTBEAT_INTERVAL, "30", false, true, false);
        assert_eq!(store.heartbeat_interval_secs(), Some(30));
    }

    #[test]
    fn set_heartbeat_interval_writes_both_keys() {
        let mut store = ConfigStore::new();
        store.set_heartbeat_interval(30);
        assert_eq!(store.get(keys::HEARTBEAT_INTERVAL).unwrap().value, "30");
        assert_eq!(store.get(keys::HEART_BEAT_INTERVAL).unwrap().value, "30");
    }
}
