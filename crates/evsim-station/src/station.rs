//! The station root entity.
//!
//! One [`Station`] owns the connector table, the configuration store, the
//! RPC transport and every timer handle. All mutation funnels through the
//! tokio runtime the station was created on; locks are held only across
//! non-suspending sections.

use crate::config_store::{keys, ConfigStore};
use crate::connector::{build_connector_table, connector_config_hash, Connector};
use crate::error::StationResult;
use crate::generator::TransactionGenerator;
use crate::meter::{self, SamplingContext};
use crate::template::{load_authorized_tags, StationInfo, StationTemplate};
use crate::transport::{RpcTransport, DEFAULT_RPC_TIMEOUT};
use evsim_messages::{BootNotificationResponse, MeterValuesRequest};
use evsim_types::v16::RegistrationStatus;
use evsim_types::{OcppError, OcppResult};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default meter sampling period when MeterValueSampleInterval is absent.
pub(crate) const DEFAULT_METER_SAMPLE_INTERVAL: Duration = Duration::from_millis(60_000);

/// A simulated OCPP 1.6-J charging station.
pub struct Station {
    index: u32,
    station_id: String,
    template_path: Option<PathBuf>,
    authorization_path: RwLock<Option<PathBuf>>,
    pub(crate) info: RwLock<StationInfo>,
    pub(crate) template: RwLock<StationTemplate>,
    pub(crate) connectors: RwLock<BTreeMap<u32, Connector>>,
    pub(crate) config: RwLock<ConfigStore>,
    transport: RpcTransport,
    authorized_tags: RwLock<Vec<String>>,
    boot_response: RwLock<Option<BootNotificationResponse>>,
    connector_hash: RwLock<String>,
    has_stopped: AtomicBool,
    pub(crate) has_socket_restarted: AtomicBool,
    pub(crate) auto_reconnect_retry_count: AtomicU32,
    pub(crate) registration_retry_count: AtomicU32,
    pub(crate) heartbeat_handle: Mutex<Option<JoinHandle<()>>>,
    pub(crate) ping_handle: Mutex<Option<JoinHandle<()>>>,
    pub(crate) socket_handles: Mutex<Vec<JoinHandle<()>>>,
    watchers_started: AtomicBool,
    pub(crate) watcher_handles: Mutex<Vec<JoinHandle<()>>>,
    generator: RwLock<Option<Arc<dyn TransactionGenerator>>>,
}

impl Station {
    /// Instantiate a station from an in-memory template.
    pub async fn from_template(index: u32, template: StationTemplate) -> StationResult<Arc<Self>> {
        template.validate()?;
        let station = Self::build(index, template, None)?;
        station.initialize().await;
        Ok(station)
    }

    /// Instantiate a station from a template file; the file (and the
    /// authorization file it references, if any) will be watched once the
    /// station starts.
    pub async fn from_template_file(
        index: u32,
        path: impl Into<PathBuf>,
    ) -> StationResult<Arc<Self>> {
        let path = path.into();
        let template = StationTemplate::load(&path)?;
        let station = Self::build(index, template, Some(path))?;
        station.initialize().await;
        Ok(station)
    }

    fn build(
        index: u32,
        template: StationTemplate,
        template_path: Option<PathBuf>,
    ) -> StationResult<Arc<Self>> {
        let info = StationInfo::from_template(&template, index);
        let station_id = info.station_id.clone();
        Ok(Arc::new(Self {
            index,
            transport: RpcTransport::new(station_id.clone(), DEFAULT_RPC_TIMEOUT),
            station_id,
            template_path,
            authorization_path: RwLock::new(None),
            info: RwLock::new(info),
            template: RwLock::new(template),
            connectors: RwLock::new(BTreeMap::new()),
            config: RwLock::new(ConfigStore::new()),
            authorized_tags: RwLock::new(Vec::new()),
            boot_response: RwLock::new(None),
            connector_hash: RwLock::new(String::new()),
            has_stopped: AtomicBool::new(false),
            has_socket_restarted: AtomicBool::new(false),
            auto_reconnect_retry_count: AtomicU32::new(0),
            registration_retry_count: AtomicU32::new(0),
            heartbeat_handle: Mutex::new(None),
            ping_handle: Mutex::new(None),
            socket_handles: Mutex::new(Vec::new()),
            watchers_started: AtomicBool::new(false),
            watcher_handles: Mutex::new(Vec::new()),
            generator: RwLock::new(None),
        }))
    }

    /// (Re)build the connector table and seed the configuration store.
    ///
    /// The connector table is rebuilt only when the connector-relevant
    /// template content changed since the last pass, so a template reload
    /// with untouched connectors keeps ongoing transactions alive.
    pub(crate) async fn initialize(&self) {
        let template = self.template.read().await.clone();
        let max_connectors = template.max_connectors();
        let hash = connector_config_hash(&template.connectors, max_connectors);

        {
            let mut current_hash = self.connector_hash.write().await;
            if *current_hash != hash {
                let mut connectors = self.connectors.write().await;
                if !connectors.is_empty() {
                    warn!(
                        "{}: connector template changed, rebuilding table (ongoing transactions are dropped)",
                        self.station_id
                    );
                }
                for connector in connectors.values_mut() {
                    connector.reset_transaction();
                }
                *connectors = build_connector_table(
                    &self.station_id,
                    &template.connectors,
                    max_connectors,
                    template.use_connector_id0,
                    template.random_connectors,
                );
                *current_hash = hash;
            } else {
                debug!(
                    "{}: connector template unchanged, keeping connector table",
                    self.station_id
                );
            }
        }

        let physical_connectors = {
            let connectors = self.connectors.read().await;
            connectors.keys().filter(|id| **id > 0).count()
        };

        {
            let mut config = self.config.write().await;
            if config.is_empty() {
                *config = ConfigStore::from_template(&template.configuration.configuration_key);
            }
            if config.get(keys::NUMBER_OF_CONNECTORS).is_none() {
                config.add(
                    keys::NUMBER_OF_CONNECTORS,
                    &physical_connectors.to_string(),
                    true,
                    true,
                    false,
                );
            } else {
                config.set_value(keys::NUMBER_OF_CONNECTORS, &physical_connectors.to_string());
            }
            config.ensure(
                keys::METER_VALUES_SAMPLED_DATA,
                "Energy.Active.Import.Register",
                false,
            );
            config.ensure(keys::LOCAL_AUTH_LIST_ENABLED, "false", false);
        }

        // resolve the authorization file next to the template
        if let Some(file) = &template.authorization_file {
            let path = match &self.template_path {
                Some(template_path) => template_path
                    .parent()
                    .map(|dir| dir.join(file))
                    .unwrap_or_else(|| PathBuf::from(file)),
                None => PathBuf::from(file),
            };
            match load_authorized_tags(&path) {
                Ok(tags) => {
                    info!(
                        "{}: loaded {} authorization tag(s)",
                        self.station_id,
                        tags.len()
                    );
                    *self.authorized_tags.write().await = tags;
                }
                Err(error) => warn!(
                    "{}: could not load authorization file {}: {error}",
                    self.station_id,
                    path.display()
                ),
            }
            *self.authorization_path.write().await = Some(path);
        }

        info!(
            "{}: initialized with {} physical connector(s)",
            self.station_id, physical_connectors
        );
    }

    pub fn station_id(&self) -> &str {
        &self.station_id
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// The RPC transport; exposed so an embedding process (or a test) can
    /// attach its own socket layer.
    pub fn transport(&self) -> &RpcTransport {
        &self.transport
    }

    pub fn has_stopped(&self) -> bool {
        self.has_stopped.load(Ordering::SeqCst)
    }

    pub(crate) fn set_has_stopped(&self, stopped: bool) -> bool {
        self.has_stopped.swap(stopped, Ordering::SeqCst)
    }

    /// Registered means the Central System accepted our BootNotification.
    pub async fn is_registered(&self) -> bool {
        self.boot_response
            .read()
            .await
            .as_ref()
            .map(|response| response.status == RegistrationStatus::Accepted)
            .unwrap_or(false)
    }

    pub(crate) async fn set_boot_response(&self, response: Option<BootNotificationResponse>) {
        let registered = response
            .as_ref()
            .map(|r| r.status == RegistrationStatus::Accepted)
            .unwrap_or(false);
        *self.boot_response.write().await = response;
        self.transport.set_registered(registered);
    }

    pub async fn boot_response(&self) -> Option<BootNotificationResponse> {
        self.boot_response.read().await.clone()
    }

    /// Tags accepted for remote starts when the local auth list is
    /// enabled. Normally fed by the authorization file watcher.
    pub async fn set_authorized_tags(&self, tags: Vec<String>) {
        *self.authorized_tags.write().await = tags;
    }

    pub async fn authorized_tags(&self) -> Vec<String> {
        self.authorized_tags.read().await.clone()
    }

    /// Install the external transaction generator hook.
    pub async fn set_transaction_generator(&self, generator: Arc<dyn TransactionGenerator>) {
        *self.generator.write().await = Some(generator);
    }

    pub(crate) async fn generator(&self) -> Option<Arc<dyn TransactionGenerator>> {
        self.generator.read().await.clone()
    }

    /// Snapshot of one connector for inspection.
    pub async fn connector(&self, connector_id: u32) -> Option<Connector> {
        self.connectors
            .read()
            .await
            .get(&connector_id)
            .map(Connector::snapshot)
    }

    pub async fn connector_ids(&self) -> Vec<u32> {
        self.connectors.read().await.keys().copied().collect()
    }

    /// Number of ways the station power is currently divided: the number
    /// of running transactions when power is shared by connectors,
    /// otherwise the number of physical connectors.
    pub async fn power_divider(&self) -> u32 {
        let info = self.info.read().await;
        let connectors = self.connectors.read().await;
        Self::power_divider_of(&info, &connectors)
    }

    pub(crate) fn power_divider_of(
        info: &StationInfo,
        connectors: &BTreeMap<u32, Connector>,
    ) -> u32 {
        if info.power_shared_by_connectors {
            connectors
                .values()
                .filter(|connector| connector.transaction_started)
                .count() as u32
        } else {
            connectors.keys().filter(|id| **id > 0).count() as u32
        }
    }

    /// One metering tick for `connector_id`: synthesise the sampled
    /// values from the connector's template and ship them as MeterValues.
    pub(crate) async fn sample_connector(
        self: &Arc<Self>,
        connector_id: u32,
        interval: Duration,
    ) -> OcppResult<()> {
        let (context, templates, mut register, transaction_id) = {
            let info = self.info.read().await;
            let config = self.config.read().await;
            let connectors = self.connectors.read().await;
            let connector = connectors.get(&connector_id).ok_or_else(|| {
                OcppError::generic(format!("unknown connector {connector_id}"))
            })?;

            let declared = config
                .get(keys::METER_VALUES_SAMPLED_DATA)
                .map(|entry| {
                    entry
                        .value
                        .split(',')
                        .map(|name| name.trim().to_string())
                        .collect()
                })
                .unwrap_or_default();

            (
                SamplingContext {
                    station_id: self.station_id.clone(),
                    max_power: info.max_power,
                    power_divider: Self::power_divider_of(&info, &connectors),
                    number_of_phases: info.number_of_phases,
                    voltage_out: info.voltage_out,
                    power_out_type: info.power_out_type,
                    declared,
                    interval,
                },
                connector.meter_values.clone(),
                connector.energy_active_import_register,
                connector.transaction_id,
            )
        };

        let samples = meter::synthesize_sampled_values(&context, &templates, &mut register)?;

        {
            let mut connectors = self.connectors.write().await;
            if let Some(connector) = connectors.get_mut(&connector_id) {
                connector.energy_active_import_register = register;
            }
        }

        if samples.is_empty() {
            debug!(
                "{}: nothing to sample on connector {connector_id}",
                self.station_id
            );
            return Ok(());
        }

        let request = MeterValuesRequest {
            connector_id,
            transaction_id,
            meter_value: vec![meter::meter_value(samples)],
        };
        self.send_meter_values(request).await
    }

    /// The meter sampling period from configuration.
    pub(crate) async fn meter_sample_interval(&self) -> Duration {
        self.config
            .read()
            .await
            .get_i64(keys::METER_VALUE_SAMPLE_INTERVAL)
            .filter(|secs| *secs > 0)
            .map(|secs| Duration::from_millis(secs as u64 * 1000))
            .unwrap_or(DEFAULT_METER_SAMPLE_INTERVAL)
    }

    pub(crate) fn watchers_already_started(&self) -> bool {
        self.watchers_started.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn template_path(&self) -> Option<&PathBuf> {
        self.template_path.as_ref()
    }

    pub(crate) async fn authorization_path(&self) -> Option<PathBuf> {
        self.authorization_path.read().await.clone()
    }

    /// Re-parse the template file and apply it: station facts are
    /// refreshed, the connector table preserved or rebuilt per the
    /// connector hash, and the transaction generator re-evaluated against
    /// the new enable flag.
    pub(crate) async fn reload_template(self: &Arc<Self>) -> StationResult<()> {
        let Some(path) = &self.template_path else {
            return Ok(());
        };
        let template = StationTemplate::load(path)?;
        info!("{}: template file changed, re-initializing", self.station_id);

        *self.info.write().await = StationInfo::from_template(&template, self.index);
        let generator_enabled = template.automatic_transaction_generator.enable;
        *self.template.write().await = template;
        self.initialize().await;

        if let Some(generator) = self.generator().await {
            if generator_enabled {
                generator.start().await;
            } else {
                generator.stop().await;
            }
        }
        Ok(())
    }

    /// Re-parse the authorization tag file.
    pub(crate) async fn reload_authorized_tags(&self) -> StationResult<()> {
        let Some(path) = self.authorization_path().await else {
            return Ok(());
        };
        let tags = load_authorized_tags(&path)?;
        info!(
            "{}: authorization file changed, {} tag(s) loaded",
            self.station_id,
            tags.len()
        );
        *self.authorized_tags.write().await = tags;
        Ok(())
    }
}

impl std::fmt::Debug for Station {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Station")
            .field("index", &self.index)
            .field("station_id", &self.station_id)
            .field("has_stopped", &self.has_stopped)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::minimal_template;
    use evsim_types::v16::AvailabilityType;

    #[tokio::test]
    async fn initialize_builds_connector_table() {
        let station = Station::from_template(0, minimal_template()).await.unwrap();
        assert_eq!(station.connector_ids().await, vec![0, 1, 2]);

        let connector = station.connector(1).await.unwrap();
        assert_eq!(connector.availability, AvailabilityType::Operative);
        assert!(!connector.transaction_started);
        assert_eq!(connector.energy_active_import_register, -1);
    }

    #[tokio::test]
    async fn initialize_without_connector_zero() {
        let mut template = minimal_template();
        template.use_connector_id0 = false;
        let station = Station::from_template(0, template).await.unwrap();
        assert_eq!(station.connector_ids().await, vec![1, 2]);
    }

    #[tokio::test]
    async fn number_of_connectors_key_is_readonly() {
        let station = Station::from_template(0, minimal_template()).await.unwrap();
        let config = station.config.read().await;
        let entry = config.get(keys::NUMBER_OF_CONNECTORS).unwrap();
        assert_eq!(entry.value, "2");
        assert!(entry.readonly);
        assert!(config.get(keys::METER_VALUES_SAMPLED_DATA).is_some());
        assert_eq!(
            config.get(keys::LOCAL_AUTH_LIST_ENABLED).unwrap().value,
            "false"
        );
    }

    #[tokio::test]
    async fn power_divider_counts_connectors_by_default() {
        let station = Station::from_template(0, minimal_template()).await.unwrap();
        assert_eq!(station.power_divider().await, 2);
    }

    #[tokio::test]
    async fn power_divider_counts_transactions_when_shared() {
        let mut template = minimal_template();
        template.power_shared_by_connectors = true;
        let station = Station::from_template(0, template).await.unwrap();
        assert_eq!(station.power_divider().await, 0);

        station
            .connectors
            .write()
            .await
            .get_mut(&1)
            .unwrap()
            .transaction_started = true;
        assert_eq!(station.power_divider().await, 1);
    }

    #[tokio::test]
    async fn reinitialize_with_same_template_keeps_state() {
        let station = Station::from_template(0, minimal_template()).await.unwrap();
        {
            let mut connectors = station.connectors.write().await;
            let connector = connectors.get_mut(&1).unwrap();
            connector.transaction_started = true;
            connector.transaction_id = Some(99);
        }

        station.initialize().await;
        let connector = station.connector(1).await.unwrap();
        assert!(connector.transaction_started);
        assert_eq!(connector.transaction_id, Some(99));
    }

    #[tokio::test]
    async fn reinitialize_with_changed_connectors_rebuilds() {
        let station = Station::from_template(0, minimal_template()).await.unwrap();
        {
            let mut connectors = station.connectors.write().await;
            connectors.get_mut(&1).unwrap().transaction_started = true;
        }

        {
            let mut template = station.template.write().await;
            template.number_of_connectors = Some(crate::template::OneOrMany::One(3));
        }
        station.initialize().await;

        assert_eq!(station.connector_ids().await, vec![0, 1, 2, 3]);
        assert!(!station.connector(1).await.unwrap().transaction_started);
        let config = station.config.read().await;
        assert_eq!(config.get(keys::NUMBER_OF_CONNECTORS).unwrap().value, "3");
    }

    #[tokio::test]
    async fn station_is_not_registered_initially() {
        let station = Station::from_template(0, minimal_template()).await.unwrap();
        assert!(!station.is_registered().await);
        assert!(!station.transport().is_registered());
    }

    #[tokio::test]
    async fn meter_sample_interval_defaults_to_a_minute() {
        let station = Station::from_template(0, minimal_template()).await.unwrap();
        assert_eq!(
            station.meter_sample_interval().await,
            Duration::from_millis(60_000)
        );

        station
            .config
            .write()
            .await
            .add(keys::METER_VALUE_SAMPLE_INTERVAL, "10", false, true, false);
        assert_eq!(
            station.meter_sample_interval().await,
            Duration::from_secs(10)
        );
    }
}
