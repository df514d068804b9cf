//! Station template model.
//!
//! A template is the JSON document a fleet operator writes once per
//! station model; every simulated station is instantiated from one. The
//! shape follows the fields listed in the OCPP simulator template format;
//! unknown fields are ignored.

use crate::error::{StationError, StationResult};
use evsim_types::v16::{AvailabilityType, ChargePointStatus, ChargingProfile, Measurand,
    ReadingContext, UnitOfMeasure};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Environment variable that, when set, is woven into generated station
/// identifiers (used when several instances run per host).
pub const CF_INSTANCE_INDEX_ENV: &str = "CF_INSTANCE_INDEX";

const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 30;
const DEFAULT_RESET_TIME_SECS: u64 = 60;
const DEFAULT_VOLTAGE_OUT: f64 = 230.0;
const DEFAULT_NUMBER_OF_PHASES: u32 = 3;

/// A JSON field that may hold either one value or a list of candidates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T: Copy> OneOrMany<T> {
    /// Resolve to a single value, picking uniformly from a list.
    fn pick(&self) -> Option<T> {
        match self {
            OneOrMany::One(value) => Some(*value),
            OneOrMany::Many(values) if values.is_empty() => None,
            OneOrMany::Many(values) => {
                let idx = rand::thread_rng().gen_range(0..values.len());
                Some(values[idx])
            }
        }
    }
}

/// Current type delivered by the station.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerOutType {
    AC,
    DC,
}

/// Template of one sampled value the meter sampler should emit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampledValueTemplate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub measurand: Option<Measurand>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<UnitOfMeasure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<ReadingContext>,
    /// Fixed value to report instead of a synthesised one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// Template of one connector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectorTemplate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub availability: Option<AvailabilityType>,
    #[serde(rename = "bootStatus", skip_serializing_if = "Option::is_none")]
    pub boot_status: Option<ChargePointStatus>,
    #[serde(rename = "MeterValues", default, skip_serializing_if = "Vec::is_empty")]
    pub meter_values: Vec<SampledValueTemplate>,
    #[serde(
        rename = "chargingProfiles",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub charging_profiles: Vec<ChargingProfile>,
}

/// One configuration key seeded from the template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationKeyTemplate {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub readonly: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visible: Option<bool>,
    #[serde(default)]
    pub reboot: bool,
}

/// The `Configuration` section of a template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationSection {
    #[serde(rename = "configurationKey", default)]
    pub configuration_key: Vec<ConfigurationKeyTemplate>,
}

/// Settings for the (externally driven) automatic transaction generator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionGeneratorSettings {
    #[serde(default)]
    pub enable: bool,
    #[serde(rename = "stopOnConnectionFailure", default = "default_true")]
    pub stop_on_connection_failure: bool,
    /// Driver-specific knobs passed through untouched
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_true() -> bool {
    true
}

/// Station template as read from disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StationTemplate {
    pub charge_point_model: String,
    pub charge_point_vendor: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charge_box_serial_number_prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
    pub base_name: String,
    #[serde(default)]
    pub fixed_name: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name_suffix: Option<String>,
    /// Station power in W; a list means one is picked at instantiation
    pub power: OneOrMany<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number_of_connectors: Option<OneOrMany<u32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number_of_phases: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voltage_out: Option<f64>,
    #[serde(default = "default_power_out_type")]
    pub power_out_type: PowerOutType,
    #[serde(rename = "supervisionURL")]
    pub supervision_url: OneOrMany<SupervisionUrl>,
    #[serde(default)]
    pub distribute_stations_to_tenants_equally: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization_file: Option<String>,
    #[serde(default = "default_true")]
    pub use_connector_id0: bool,
    #[serde(default)]
    pub random_connectors: bool,
    #[serde(default)]
    pub power_shared_by_connectors: bool,
    #[serde(default)]
    pub authorize_remote_tx_requests: bool,
    /// WebSocket handshake timeout in seconds; 0 disables the timeout
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_reconnect_max_retries: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registration_max_retries: Option<i32>,
    #[serde(default)]
    pub reconnect_exponential_delay: bool,
    /// Seconds a Reset keeps the station down
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_time: Option<u64>,
    #[serde(default)]
    pub enable_statistics: bool,
    #[serde(rename = "Configuration", default)]
    pub configuration: ConfigurationSection,
    #[serde(rename = "Connectors", default)]
    pub connectors: BTreeMap<u32, ConnectorTemplate>,
    #[serde(rename = "AutomaticTransactionGenerator", default)]
    pub automatic_transaction_generator: TransactionGeneratorSettings,
}

/// Supervision URLs are plain strings; the alias keeps the OneOrMany
/// signature readable.
pub type SupervisionUrl = String;

// OneOrMany::pick needs Copy; strings are resolved separately.
impl OneOrMany<SupervisionUrl> {
    fn as_slice(&self) -> std::slice::Iter<'_, SupervisionUrl> {
        match self {
            OneOrMany::One(url) => std::slice::from_ref(url).iter(),
            OneOrMany::Many(urls) => urls.iter(),
        }
    }

    fn len(&self) -> usize {
        match self {
            OneOrMany::One(_) => 1,
            OneOrMany::Many(urls) => urls.len(),
        }
    }
}

fn default_power_out_type() -> PowerOutType {
    PowerOutType::AC
}

impl StationTemplate {
    /// Load a template from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> StationResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let template: StationTemplate = serde_json::from_str(&raw)
            .map_err(|e| StationError::template(format!("{}: {e}", path.display())))?;
        template.validate()?;
        Ok(template)
    }

    /// Check the invariants instantiation relies on.
    pub fn validate(&self) -> StationResult<()> {
        if self.base_name.is_empty() {
            return Err(StationError::template("baseName must not be empty"));
        }
        if self.supervision_url.len() == 0 {
            return Err(StationError::template(
                "supervisionURL must hold at least one URL",
            ));
        }
        if self.max_connectors() == 0 {
            return Err(StationError::template(
                "template defines no connectors and no numberOfConnectors",
            ));
        }
        if let Some(voltage) = self.voltage_out {
            if voltage <= 0.0 {
                return Err(StationError::template("voltageOut must be positive"));
            }
        }
        Ok(())
    }

    /// The charging station identifier for instance `index`.
    pub fn station_id(&self, index: u32) -> String {
        let instance = std::env::var(CF_INSTANCE_INDEX_ENV).unwrap_or_default();
        self.station_id_with_instance(index, &instance)
    }

    pub(crate) fn station_id_with_instance(&self, index: u32, instance: &str) -> String {
        if self.fixed_name {
            return self.base_name.clone();
        }
        format!(
            "{}-{}{:04}{}",
            self.base_name,
            instance,
            index,
            self.name_suffix.as_deref().unwrap_or_default()
        )
    }

    /// Pick the supervision URL for instance `index`: round-robin when
    /// stations are distributed to tenants equally, otherwise uniform
    /// random.
    pub fn supervision_url(&self, index: u32) -> String {
        let urls: Vec<&String> = self.supervision_url.as_slice().collect();
        let slot = if self.distribute_stations_to_tenants_equally {
            index as usize % urls.len()
        } else {
            rand::thread_rng().gen_range(0..urls.len())
        };
        urls[slot].clone()
    }

    /// The configured maximum number of physical connectors.
    pub fn max_connectors(&self) -> u32 {
        match &self.number_of_connectors {
            Some(n) => n.pick().unwrap_or(0),
            None => self.connectors.keys().filter(|id| **id > 0).count() as u32,
        }
    }

    /// Resolve the station's maximum power in W.
    pub fn max_power(&self) -> f64 {
        self.power.pick().unwrap_or(0.0)
    }

    pub fn voltage_out(&self) -> f64 {
        self.voltage_out.unwrap_or(DEFAULT_VOLTAGE_OUT)
    }

    pub fn number_of_phases(&self) -> u32 {
        self.number_of_phases.unwrap_or(DEFAULT_NUMBER_OF_PHASES)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(
            self.connection_timeout
                .unwrap_or(DEFAULT_CONNECTION_TIMEOUT_SECS),
        )
    }

    pub fn reset_time(&self) -> Duration {
        Duration::from_secs(self.reset_time.unwrap_or(DEFAULT_RESET_TIME_SECS))
    }
}

/// Static station facts resolved from a template at instantiation time.
#[derive(Debug, Clone)]
pub struct StationInfo {
    pub station_id: String,
    pub vendor: String,
    pub model: String,
    pub charge_box_serial_number: Option<String>,
    pub firmware_version: Option<String>,
    /// Station maximum power in W
    pub max_power: f64,
    pub number_of_phases: u32,
    pub voltage_out: f64,
    pub power_out_type: PowerOutType,
    pub power_shared_by_connectors: bool,
    pub authorize_remote_tx_requests: bool,
    pub enable_statistics: bool,
    pub connection_timeout: Duration,
    /// −1 means reconnect forever
    pub auto_reconnect_max_retries: i32,
    /// −1 means retry registration forever, 0 means a single attempt
    pub registration_max_retries: i32,
    pub reconnect_exponential_delay: bool,
    pub reset_time: Duration,
}

impl StationInfo {
    /// Derive the per-instance station facts from a template.
    pub fn from_template(template: &StationTemplate, index: u32) -> Self {
        let station_id = template.station_id(index);
        Self {
            charge_box_serial_number: template
                .charge_box_serial_number_prefix
                .as_ref()
                .map(|prefix| format!("{prefix}{index:04}")),
            vendor: template.charge_point_vendor.clone(),
            model: template.charge_point_model.clone(),
            firmware_version: template.firmware_version.clone(),
            max_power: template.max_power(),
            number_of_phases: template.number_of_phases(),
            voltage_out: template.voltage_out(),
            power_out_type: template.power_out_type,
            power_shared_by_connectors: template.power_shared_by_connectors,
            authorize_remote_tx_requests: template.authorize_remote_tx_requests,
            enable_statistics: template.enable_statistics,
            connection_timeout: template.connection_timeout(),
            auto_reconnect_max_retries: template.auto_reconnect_max_retries.unwrap_or(-1),
            registration_max_retries: template.registration_max_retries.unwrap_or(-1),
            reconnect_exponential_delay: template.reconnect_exponential_delay,
            reset_time: template.reset_time(),
            station_id,
        }
    }
}

/// Load the authorization tag file: a top-level JSON array of idTag
/// strings.
pub fn load_authorized_tags(path: impl AsRef<Path>) -> StationResult<Vec<String>> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)?;
    serde_json::from_str(&raw)
        .map_err(|e| StationError::template(format!("{}: {e}", path.display())))
}

/// Fixture shared by the crate's unit tests.
#[cfg(test)]
pub(crate) fn minimal_template() -> StationTemplate {
    serde_json::from_value(serde_json::json!({
        "chargePointModel": "Virtual",
        "chargePointVendor": "evsim",
        "baseName": "CS-TEST",
        "power": 7360.0,
        "numberOfConnectors": 2,
        "supervisionURL": "ws://localhost:8010",
        "Connectors": {
            "0": {},
            "1": {"MeterValues": [{"measurand": "Energy.Active.Import.Register"}]}
        }
    }))
    .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_applied() {
        let template = minimal_template();
        assert!(template.use_connector_id0);
        assert!(!template.random_connectors);
        assert_eq!(template.voltage_out(), 230.0);
        assert_eq!(template.number_of_phases(), 3);
        assert_eq!(template.power_out_type, PowerOutType::AC);
        assert_eq!(template.connection_timeout(), Duration::from_secs(30));
        assert_eq!(template.reset_time(), Duration::from_secs(60));
        assert!(template.automatic_transaction_generator.stop_on_connection_failure);
        assert!(!template.automatic_transaction_generator.enable);
    }

    #[test]
    fn station_id_generation() {
        let mut template = minimal_template();
        assert_eq!(template.station_id_with_instance(7, ""), "CS-TEST-0007");
        assert_eq!(template.station_id_with_instance(7, "2"), "CS-TEST-20007");

        template.name_suffix = Some("-EU".to_string());
        assert_eq!(template.station_id_with_instance(7, ""), "CS-TEST-0007-EU");

        template.fixed_name = true;
        assert_eq!(template.station_id_with_instance(7, ""), "CS-TEST");
    }

    #[test]
    fn supervision_url_round_robin() {
        let mut template = minimal_template();
        template.supervision_url = OneOrMany::Many(vec![
            "ws://a".to_string(),
            "ws://b".to_string(),
            "ws://c".to_string(),
        ]);
        template.distribute_stations_to_tenants_equally = true;

        assert_eq!(template.supervision_url(0), "ws://a");
        assert_eq!(template.supervision_url(1), "ws://b");
        assert_eq!(template.supervision_url(5), "ws://c");
    }

    #[test]
    fn supervision_url_random_stays_in_bounds() {
        let mut template = minimal_template();
        template.supervision_url =
            OneOrMany::Many(vec!["ws://a".to_string(), "ws://b".to_string()]);
        for _ in 0..50 {
            let url = template.supervision_url(0);
            assert!(url == "ws://a" || url == "ws://b");
        }
    }

    #[test]
    fn max_connectors_falls_back_to_connector_map() {
        let mut template = minimal_template();
        template.number_of_connectors = None;
        // ids 0 and 1 in the map, only id 1 counts
        assert_eq!(template.max_connectors(), 1);
    }

    #[test]
    fn power_list_picks_a_member() {
        let mut template = minimal_template();
        template.power = OneOrMany::Many(vec![11000.0, 22000.0]);
        for _ in 0..20 {
            let power = template.max_power();
            assert!(power == 11000.0 || power == 22000.0);
        }
    }

    #[test]
    fn validation_rejects_empty_base_name() {
        let mut template = minimal_template();
        template.base_name = String::new();
        assert!(template.validate().is_err());
    }

    #[test]
    fn validation_rejects_connectorless_template() {
        let mut template = minimal_template();
        template.number_of_connectors = None;
        template.connectors.clear();
        assert!(template.validate().is_err());
    }

    #[test]
    fn station_info_from_template() {
        let template = minimal_template();
        let info = StationInfo::from_template(&template, 3);
        assert_eq!(info.station_id, "CS-TEST-0003");
        assert_eq!(info.max_power, 7360.0);
        assert_eq!(info.auto_reconnect_max_retries, -1);
        assert_eq!(info.registration_max_retries, -1);
        assert!(info.charge_box_serial_number.is_none());
    }

    #[test]
    fn charge_box_serial_uses_prefix() {
        let mut template = minimal_template();
        template.charge_box_serial_number_prefix = Some("EVB".to_string());
        let info = StationInfo::from_template(&template, 12);
        assert_eq!(info.charge_box_serial_number.as_deref(), Some("EVB0012"));
    }

    #[test]
    fn connector_template_parses_meter_values() {
        let template = minimal_template();
        let connector = &template.connectors[&1];
        assert_eq!(connector.meter_values.len(), 1);
        assert_eq!(
            connector.meter_values[0].measurand,
            Some(Measurand::EnergyActiveImportRegister)
        );
    }

    #[test]
    fn generator_settings_keep_driver_knobs() {
        let settings: TransactionGeneratorSettings = serde_json::from_value(json!({
            "enable": true,
            "stopOnConnectionFailure": false,
            "probabilityOfStart": 0.7
        }))
        .unwrap();
        assert!(settings.enable);
        assert!(!settings.stop_on_connection_failure);
        assert_eq!(settings.extra["probabilityOfStart"], json!(0.7));
    }
}
