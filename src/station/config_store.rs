//! OCPP configuration key store
//!
//! Ordered list of configuration entries backing GetConfiguration /
//! ChangeConfiguration. Insertion order is preserved and observable
//! through GetConfiguration. `HeartbeatInterval` and the legacy
//! `HeartBeatInterval` spelling are kept as mutual mirrors.

use tracing::error;

pub const HEARTBEAT_INTERVAL: &str = "HeartbeatInterval";
pub const HEART_BEAT_INTERVAL: &str = "HeartBeatInterval";
pub const WEB_SOCKET_PING_INTERVAL: &str = "WebSocketPingInterval";
pub const NUMBER_OF_CONNECTORS: &str = "NumberOfConnectors";
pub const METER_VALUES_SAMPLED_DATA: &str = "MeterValuesSampledData";
pub const METER_VALUE_SAMPLE_INTERVAL: &str = "MeterValueSampleInterval";
pub const AUTHORIZE_REMOTE_TX_REQUESTS: &str = "AuthorizeRemoteTxRequests";
pub const LOCAL_AUTH_LIST_ENABLED: &str = "LocalAuthListEnabled";
pub const CONNECTION_TIMEOUT: &str = "ConnectionTimeOut";
pub const SUPPORTED_FEATURE_PROFILES: &str = "SupportedFeatureProfiles";

pub const DEFAULT_METER_VALUES_SAMPLED_DATA: &str = "Energy.Active.Import.Register";
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct ConfigurationEntry {
    pub key: String,
    pub value: String,
    pub readonly: bool,
    pub visible: bool,
    pub reboot: bool,
}

/// Flags applied when adding a key. Defaults: writable, visible, no
/// reboot required.
#[derive(Debug, Clone, Copy)]
pub struct KeyFlags {
    pub readonly: bool,
    pub visible: bool,
    pub reboot: bool,
}

impl Default for KeyFlags {
    fn default() -> Self {
        Self {
            readonly: false,
            visible: true,
            reboot: false,
        }
    }
}

impl KeyFlags {
    pub fn readonly() -> Self {
        Self {
            readonly: true,
            ..Self::default()
        }
    }

    pub fn hidden() -> Self {
        Self {
            visible: false,
            ..Self::default()
        }
    }
}

#[derive(Debug, Default)]
pub struct ConfigStore {
    station_id: String,
    entries: Vec<ConfigurationEntry>,
}

impl ConfigStore {
    pub fn new(station_id: impl Into<String>) -> Self {
        Self {
            station_id: station_id.into(),
            entries: Vec::new(),
        }
    }

    /// Case-sensitive lookup.
    pub fn get(&self, key: &str) -> Option<&ConfigurationEntry> {
        self.entries.iter().find(|entry| entry.key == key)
    }

    /// Case-insensitive lookup (ChangeConfiguration semantics).
    pub fn get_case_insensitive(&self, key: &str) -> Option<&ConfigurationEntry> {
        self.entries
            .iter()
            .find(|entry| entry.key.eq_ignore_ascii_case(key))
    }

    /// Insert a new key. Logs an error and leaves the store untouched if
    /// the key is already present.
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>, flags: KeyFlags) {
        let key = key.into();
        if self.get(&key).is_some() {
            error!(
                station_id = self.station_id.as_str(),
                key = key.as_str(),
                "Configuration key already set"
            );
            return;
        }
        self.entries.push(ConfigurationEntry {
            key,
            value: value.into(),
            readonly: flags.readonly,
            visible: flags.visible,
            reboot: flags.reboot,
        });
    }

    /// Insert a key only when absent, keeping any template-provided entry.
    pub fn add_if_absent(
        &mut self,
        key: &str,
        value: impl Into<String>,
        flags: KeyFlags,
    ) {
        if self.get(key).is_none() {
            self.add(key.to_string(), value, flags);
        }
    }

    /// Mutate an existing key in place. Logs an error and does nothing if
    /// the key is absent.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        match self.entries.iter_mut().find(|entry| entry.key == key) {
            Some(entry) => entry.value = value.into(),
            None => error!(
                station_id = self.station_id.as_str(),
                key, "Configuration key not set"
            ),
        }
    }

    /// Write both heartbeat-interval spellings, creating them if needed.
    /// `HeartbeatInterval` is the visible one; the legacy spelling is
    /// kept hidden but always equal.
    pub fn set_heartbeat_interval(&mut self, value: &str) {
        self.add_if_absent(HEARTBEAT_INTERVAL, value, KeyFlags::default());
        self.add_if_absent(HEART_BEAT_INTERVAL, value, KeyFlags::hidden());
        self.set(HEARTBEAT_INTERVAL, value);
        self.set(HEART_BEAT_INTERVAL, value);
    }

    /// Parse a key's value as an integer.
    pub fn numeric(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|entry| entry.value.trim().parse().ok())
    }

    /// Parse a key's value as a boolean ("true", any case).
    pub fn boolean(&self, key: &str) -> Option<bool> {
        self.get(key)
            .map(|entry| entry.value.trim().eq_ignore_ascii_case("true"))
    }

    /// Heartbeat interval in seconds, preferring `HeartbeatInterval` over
    /// the legacy spelling.
    pub fn heartbeat_interval_secs(&self) -> Option<i64> {
        self.numeric(HEARTBEAT_INTERVAL)
            .or_else(|| self.numeric(HEART_BEAT_INTERVAL))
    }

    pub fn entries(&self) -> &[ConfigurationEntry] {
        &self.entries
    }

    /// Entries visible through GetConfiguration, in insertion order.
    pub fn visible_entries(&self) -> impl Iterator<Item = &ConfigurationEntry> {
        self.entries.iter().filter(|entry| entry.visible)
    }

    /// Measurands declared in `MeterValuesSampledData` (comma-separated).
    pub fn sampled_data_measurands(&self) -> Vec<String> {
        self.get(METER_VALUES_SAMPLED_DATA)
            .map(|entry| entry.value.as_str())
            .unwrap_or(DEFAULT_METER_VALUES_SAMPLED_DATA)
            .split(',')
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .collect()
    }
}
