//! Connector records and the template-driven connector table.

use crate::template::{ConnectorTemplate, SampledValueTemplate};
use evsim_messages::ClearChargingProfileRequest;
use evsim_types::v16::{AvailabilityType, ChargePointStatus, ChargingProfile};
use rand::Rng;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tokio::task::JoinHandle;
use tracing::warn;

/// Energy register value meaning "no transaction has ever run".
pub const ENERGY_REGISTER_UNSET: i64 = -1;

/// One connector of a station. Id 0 represents the station aggregate and
/// never carries a transaction.
#[derive(Debug)]
pub struct Connector {
    pub availability: AvailabilityType,
    pub status: ChargePointStatus,
    /// Status to report right after boot, when the template supplies one
    pub boot_status: Option<ChargePointStatus>,
    pub transaction_started: bool,
    pub transaction_id: Option<i32>,
    pub id_tag: Option<String>,
    /// Running Energy.Active.Import.Register value in Wh;
    /// [`ENERGY_REGISTER_UNSET`] outside transactions
    pub energy_active_import_register: i64,
    pub charging_profiles: Vec<ChargingProfile>,
    /// Sampled values this connector emits every metering tick
    pub meter_values: Vec<SampledValueTemplate>,
    /// Handle of the running meter sampler task
    pub(crate) sampler: Option<JoinHandle<()>>,
}

impl Connector {
    /// Build a connector from its template definition.
    pub fn from_template(template: &ConnectorTemplate) -> Self {
        let mut connector = Self {
            // availability is forced OPERATIVE on (re)initialisation
            availability: AvailabilityType::Operative,
            status: template
                .boot_status
                .unwrap_or(ChargePointStatus::Available),
            boot_status: template.boot_status,
            transaction_started: false,
            transaction_id: None,
            id_tag: None,
            energy_active_import_register: ENERGY_REGISTER_UNSET,
            charging_profiles: Vec::new(),
            meter_values: template.meter_values.clone(),
            sampler: None,
        };
        connector.init_transaction();
        connector
    }

    /// Reset the transaction fields to their pristine state.
    pub fn init_transaction(&mut self) {
        self.transaction_started = false;
        self.transaction_id = None;
        self.id_tag = None;
        self.energy_active_import_register = ENERGY_REGISTER_UNSET;
    }

    /// End the current transaction: clears the fields and cancels the
    /// meter sampler. Every path that ends a transaction must go through
    /// here so no sampler outlives its transaction.
    pub fn reset_transaction(&mut self) {
        if let Some(sampler) = self.sampler.take() {
            sampler.abort();
        }
        self.init_transaction();
    }

    pub fn has_active_transaction(&self) -> bool {
        self.transaction_started
    }

    /// Install a charging profile: replaces a stored profile with the
    /// same id or the same (stackLevel, purpose) pair, appends otherwise.
    pub fn upsert_charging_profile(&mut self, profile: ChargingProfile) {
        for stored in self.charging_profiles.iter_mut() {
            if stored.charging_profile_id == profile.charging_profile_id
                || (stored.stack_level == profile.stack_level
                    && stored.charging_profile_purpose == profile.charging_profile_purpose)
            {
                *stored = profile;
                return;
            }
        }
        self.charging_profiles.push(profile);
    }

    /// Remove profiles matching a ClearChargingProfile criteria set;
    /// returns how many were removed.
    ///
    /// A profile is cleared when it matches any of: the requested id, the
    /// requested stack level (with no purpose requested), the requested
    /// purpose (with no stack level requested), or the requested
    /// (stack level, purpose) pair. An empty criteria set clears nothing;
    /// the connector-wide wipe of a request naming a connectorId is
    /// handled by the dispatcher.
    pub fn clear_charging_profiles(&mut self, request: &ClearChargingProfileRequest) -> usize {
        let before = self.charging_profiles.len();
        self.charging_profiles.retain(|profile| {
            let by_id = request.id == Some(profile.charging_profile_id);
            let by_stack = request.charging_profile_purpose.is_none()
                && request.stack_level == Some(profile.stack_level);
            let by_purpose = request.stack_level.is_none()
                && request.charging_profile_purpose == Some(profile.charging_profile_purpose);
            let by_both = request.stack_level == Some(profile.stack_level)
                && request.charging_profile_purpose == Some(profile.charging_profile_purpose);
            !(by_id || by_stack || by_purpose || by_both)
        });
        before - self.charging_profiles.len()
    }

    /// Drop every stored charging profile; returns how many were removed.
    pub fn clear_all_charging_profiles(&mut self) -> usize {
        let cleared = self.charging_profiles.len();
        self.charging_profiles.clear();
        cleared
    }

    /// A field-for-field copy without the sampler handle, for inspection
    /// from tests and embedding processes.
    pub fn snapshot(&self) -> Connector {
        Connector {
            availability: self.availability,
            status: self.status,
            boot_status: self.boot_status,
            transaction_started: self.transaction_started,
            transaction_id: self.transaction_id,
            id_tag: self.id_tag.clone(),
            energy_active_import_register: self.energy_active_import_register,
            charging_profiles: self.charging_profiles.clone(),
            meter_values: self.meter_values.clone(),
            sampler: None,
        }
    }
}

/// Hash of the connector-relevant template content; compared on reload
/// so an unchanged template keeps the live connector table (and its
/// ongoing transactions).
pub fn connector_config_hash(
    connectors: &BTreeMap<u32, ConnectorTemplate>,
    max_connectors: u32,
) -> String {
    let mut hasher = Sha256::new();
    // BTreeMap keeps serialization deterministic
    let serialized = serde_json::to_string(connectors).unwrap_or_default();
    hasher.update(serialized.as_bytes());
    hasher.update(max_connectors.to_be_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Build the connector table from the template definitions.
///
/// Connector 0 is present iff the template defines it and
/// `use_connector_id0` is set. Physical connectors 1..=max copy their
/// template definition by id (cycling when the template defines fewer),
/// or a uniformly random one when `random_connectors` is set.
pub fn build_connector_table(
    station_id: &str,
    connectors: &BTreeMap<u32, ConnectorTemplate>,
    max_connectors: u32,
    use_connector_id0: bool,
    random_connectors: bool,
) -> BTreeMap<u32, Connector> {
    let mut table = BTreeMap::new();

    if use_connector_id0 {
        if let Some(template) = connectors.get(&0) {
            table.insert(0, Connector::from_template(template));
        }
    }

    let physical_ids: Vec<u32> = connectors.keys().copied().filter(|id| *id > 0).collect();
    if physical_ids.is_empty() {
        warn!("{station_id}: template defines no physical connectors");
        return table;
    }

    for id in 1..=max_connectors {
        let source_id = if random_connectors {
            physical_ids[rand::thread_rng().gen_range(0..physical_ids.len())]
        } else {
            physical_ids[((id - 1) as usize) % physical_ids.len()]
        };
        // source id is always a template key
        let template = &connectors[&source_id];
        table.insert(id, Connector::from_template(template));
    }

    table
}
