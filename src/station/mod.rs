//! Station root entity
//!
//! One `Station` owns the whole per-station core: template-derived
//! attributes, connector table, configuration store, RPC transport and
//! the session tasks. All mutation happens behind its locks; timers and
//! the connect loop run as tasks that `stop` cancels.

pub mod config_store;
pub mod connectors;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use rust_ocpp::v1_6::messages::boot_notification::BootNotificationResponse;
use rust_ocpp::v1_6::types::{ChargePointStatus, Reason};
use tracing::{debug, error, info, warn};

use crate::config::{self, StationInfo, StationTemplate};
use crate::ocpp::requests;
use crate::session::{self, SessionTasks};
use crate::support::errors::SimulatorError;
use crate::transport::RpcTransport;

use config_store::{ConfigStore, KeyFlags};
use connectors::ConnectorTable;

const SUPPORTED_FEATURE_PROFILES_VALUE: &str =
    "Core,FirmwareManagement,LocalAuthListManagement,SmartCharging,RemoteTrigger";

const DEFAULT_METER_VALUE_SAMPLE_INTERVAL_MS: u64 = 60_000;

pub struct Station {
    index: u32,
    id: String,
    template_path: Option<PathBuf>,
    pub(crate) template: RwLock<StationTemplate>,
    info: RwLock<StationInfo>,
    connectors: Mutex<ConnectorTable>,
    config: Mutex<ConfigStore>,
    pub transport: RpcTransport,
    boot_response: Mutex<Option<BootNotificationResponse>>,
    authorized_tags: RwLock<Vec<String>>,
    session: Mutex<SessionTasks>,
    /// Serialises inbound command handlers for this station.
    pub(crate) handler_gate: tokio::sync::Mutex<()>,
    pub(crate) has_stopped: AtomicBool,
    pub(crate) has_socket_restarted: AtomicBool,
    pub(crate) auto_reconnect_retry_count: AtomicU32,
}

impl Station {
    /// Build a station from a template file. `index` distinguishes the
    /// instances fanned out of one template.
    pub fn from_template_file(
        path: impl Into<PathBuf>,
        index: u32,
    ) -> Result<Arc<Self>, SimulatorError> {
        let path = path.into();
        let template = StationTemplate::load(&path)?;
        Self::build(template, Some(path), index)
    }

    /// Build a station from an in-memory template.
    pub fn from_template(
        template: StationTemplate,
        index: u32,
    ) -> Result<Arc<Self>, SimulatorError> {
        Self::build(template, None, index)
    }

    fn build(
        template: StationTemplate,
        template_path: Option<PathBuf>,
        index: u32,
    ) -> Result<Arc<Self>, SimulatorError> {
        let id = config::station_id(&template, index);
        let info = StationInfo::from_template(&template, index);
        let station = Arc::new(Self {
            index,
            transport: RpcTransport::new(&id),
            config: Mutex::new(ConfigStore::new(&id)),
            id,
            template_path,
            template: RwLock::new(template),
            info: RwLock::new(info),
            connectors: Mutex::new(ConnectorTable::default()),
            boot_response: Mutex::new(None),
            authorized_tags: RwLock::new(Vec::new()),
            session: Mutex::new(SessionTasks::default()),
            handler_gate: tokio::sync::Mutex::new(()),
            has_stopped: AtomicBool::new(false),
            has_socket_restarted: AtomicBool::new(false),
            auto_reconnect_retry_count: AtomicU32::new(0),
        });
        station.initialize();
        Ok(station)
    }

    /// (Re)derive everything the template defines: station attributes,
    /// connector table (digest-guarded) and configuration keys.
    fn initialize(&self) {
        let template = self.template.read().expect("template lock").clone();
        let info = StationInfo::from_template(&template, self.index);
        {
            let mut connectors = self.connectors.lock().expect("connector lock");
            connectors.initialize(&self.id, &template, &info);
        }
        self.seed_configuration(&template, &info);
        *self.info.write().expect("info lock") = info;
        self.reload_authorized_tags();
    }

    fn seed_configuration(&self, template: &StationTemplate, info: &StationInfo) {
        let connector_count = {
            let connectors = self.connectors.lock().expect("connector lock");
            connectors.physical_count()
        };
        let mut config = self.config.lock().expect("config lock");
        if let Some(configuration) = &template.configuration {
            for key in &configuration.configuration_key {
                config.add_if_absent(
                    &key.key,
                    key.value.clone(),
                    KeyFlags {
                        readonly: key.readonly.unwrap_or(false),
                        visible: key.visible.unwrap_or(true),
                        reboot: key.reboot.unwrap_or(false),
                    },
                );
            }
        }
        config.add_if_absent(
            config_store::SUPPORTED_FEATURE_PROFILES,
            SUPPORTED_FEATURE_PROFILES_VALUE,
            KeyFlags::readonly(),
        );
        config.add_if_absent(
            config_store::NUMBER_OF_CONNECTORS,
            connector_count.to_string(),
            KeyFlags::readonly(),
        );
        // Keep the readonly key honest across template reloads.
        config.set(
            config_store::NUMBER_OF_CONNECTORS,
            connector_count.to_string(),
        );
        // Mirror pair: a template-provided value for either spelling wins
        // over the default, and both keys start equal.
        let heartbeat_interval = config
            .get(config_store::HEARTBEAT_INTERVAL)
            .or_else(|| config.get(config_store::HEART_BEAT_INTERVAL))
            .map(|entry| entry.value.clone())
            .unwrap_or_else(|| config_store::DEFAULT_HEARTBEAT_INTERVAL_SECS.to_string());
        config.add_if_absent(
            config_store::HEARTBEAT_INTERVAL,
            heartbeat_interval.clone(),
            KeyFlags::default(),
        );
        config.add_if_absent(
            config_store::HEART_BEAT_INTERVAL,
            heartbeat_interval,
            KeyFlags::hidden(),
        );
        config.add_if_absent(
            config_store::METER_VALUES_SAMPLED_DATA,
            config_store::DEFAULT_METER_VALUES_SAMPLED_DATA,
            KeyFlags::default(),
        );
        config.add_if_absent(
            config_store::METER_VALUE_SAMPLE_INTERVAL,
            "60",
            KeyFlags::default(),
        );
        config.add_if_absent(
            config_store::WEB_SOCKET_PING_INTERVAL,
            "0",
            KeyFlags::default(),
        );
        config.add_if_absent(
            config_store::CONNECTION_TIMEOUT,
            info.connection_timeout_secs.to_string(),
            KeyFlags::default(),
        );
        config.add_if_absent(
            config_store::AUTHORIZE_REMOTE_TX_REQUESTS,
            info.authorize_remote_tx_requests.to_string(),
            KeyFlags::readonly(),
        );
        config.add_if_absent(
            config_store::LOCAL_AUTH_LIST_ENABLED,
            "false",
            KeyFlags::default(),
        );
    }

    // ── Lifecycle ──────────────────────────────────────────────

    /// Open the WebSocket and run the session until stopped. Also the
    /// restart path after `stop` (Reset uses exactly this).
    pub fn start<'a>(
        self: &'a Arc<Self>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), SimulatorError>> + Send + 'a>>
    {
        Box::pin(async move {
        {
            let session = self.lock_session();
            let running = session
                .connection
                .as_ref()
                .map(|handle| !handle.is_finished())
                .unwrap_or(false);
            if running {
                warn!(station_id = self.id(), "Station already started");
                return Ok(());
            }
        }
        self.has_stopped.store(false, Ordering::SeqCst);
        self.has_socket_restarted.store(false, Ordering::SeqCst);
        self.auto_reconnect_retry_count.store(0, Ordering::SeqCst);
        self.initialize();
        session::watcher::spawn_watchers(self)?;

        info!(station_id = self.id(), "Starting station");
        let handle = tokio::spawn(session::run_connection_loop(self.clone()));
        self.lock_session().connection = Some(handle);
        Ok(())
        })
    }

    /// Authoritative terminal path: cancel timers, stop running
    /// transactions, announce Unavailable, close the socket and forget
    /// the registration. Idempotent; `start` afterwards is supported.
    pub async fn stop(self: &Arc<Self>, reason: Option<Reason>) {
        if self.has_stopped.swap(true, Ordering::SeqCst) {
            debug!(station_id = self.id(), "Station already stopped");
            return;
        }
        info!(station_id = self.id(), reason = ?reason, "Stopping station");

        session::stop_heartbeat(self);
        session::stop_ping(self);
        session::stop_boot(self);

        let transacting: Vec<u32> = {
            let connectors = self.lock_connectors();
            connectors
                .iter()
                .filter(|(id, connector)| **id > 0 && connector.has_active_transaction())
                .map(|(id, _)| *id)
                .collect()
        };
        for connector_id in transacting {
            if let Err(err) =
                requests::finish_transaction(self, connector_id, reason.clone()).await
            {
                error!(
                    station_id = self.id(),
                    connector_id,
                    error = %err,
                    "StopTransaction during shutdown failed"
                );
            }
        }

        let ids: Vec<u32> = {
            let connectors = self.lock_connectors();
            connectors.ids().into_iter().filter(|id| *id > 0).collect()
        };
        for connector_id in ids {
            if let Err(err) =
                requests::update_status(self, connector_id, ChargePointStatus::Unavailable).await
            {
                error!(
                    station_id = self.id(),
                    connector_id,
                    error = %err,
                    "StatusNotification during shutdown failed"
                );
            }
        }

        self.transport.send_close();
        if let Some(connection) = self.lock_session().connection.take() {
            connection.abort();
        }
        self.transport.detach();
        self.transport.set_registered(false);
        self.store_boot_response(None);
        info!(station_id = self.id(), "Station stopped");
    }

    // ── Accessors ──────────────────────────────────────────────

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn is_registered(&self) -> bool {
        self.transport.is_registered()
    }

    pub fn has_stopped(&self) -> bool {
        self.has_stopped.load(Ordering::SeqCst)
    }

    pub(crate) fn read_info(&self) -> StationInfo {
        self.info.read().expect("info lock").clone()
    }

    pub(crate) fn lock_connectors(&self) -> MutexGuard<'_, ConnectorTable> {
        self.connectors.lock().expect("connector lock")
    }

    pub(crate) fn lock_config(&self) -> MutexGuard<'_, ConfigStore> {
        self.config.lock().expect("config lock")
    }

    pub(crate) fn lock_session(&self) -> MutexGuard<'_, SessionTasks> {
        self.session.lock().expect("session lock")
    }

    pub(crate) fn template_path(&self) -> Option<PathBuf> {
        self.template_path.clone()
    }

    pub(crate) fn supervision_url(&self) -> String {
        self.template
            .read()
            .expect("template lock")
            .supervision_url_for(self.index)
    }

    pub fn boot_notification_response(&self) -> Option<BootNotificationResponse> {
        self.boot_response.lock().expect("boot response lock").clone()
    }

    pub(crate) fn store_boot_response(&self, response: Option<BootNotificationResponse>) {
        *self.boot_response.lock().expect("boot response lock") = response;
    }

    pub fn authorized_tags(&self) -> Vec<String> {
        self.authorized_tags.read().expect("tags lock").clone()
    }

    pub(crate) fn set_authorized_tags(&self, tags: Vec<String>) {
        *self.authorized_tags.write().expect("tags lock") = tags;
    }

    /// Absolute authorization file path, resolved against the template
    /// file's directory when relative.
    pub(crate) fn authorization_file_path(&self) -> Option<PathBuf> {
        let file = self
            .template
            .read()
            .expect("template lock")
            .authorization_file
            .clone()?;
        let file = PathBuf::from(file);
        if file.is_absolute() {
            return Some(file);
        }
        match &self.template_path {
            Some(template_path) => Some(
                template_path
                    .parent()
                    .map(|dir| dir.join(&file))
                    .unwrap_or(file),
            ),
            None => Some(file),
        }
    }

    pub(crate) fn reload_authorized_tags(&self) {
        let Some(path) = self.authorization_file_path() else {
            return;
        };
        match config::load_authorized_tags(&path) {
            Ok(tags) => {
                info!(
                    station_id = self.id(),
                    count = tags.len(),
                    "Authorization tags loaded"
                );
                self.set_authorized_tags(tags);
            }
            Err(err) => error!(
                station_id = self.id(),
                path = %path.display(),
                error = %err,
                "Cannot load authorization tags"
            ),
        }
    }

    /// Reparse the template file and re-run initialisation. Timers are
    /// deliberately not restarted on reload; only boot-accept and
    /// ChangeConfiguration touch them.
    pub(crate) fn reload_template(&self) -> Result<(), SimulatorError> {
        let Some(path) = &self.template_path else {
            return Ok(());
        };
        let template = StationTemplate::load(path)?;
        *self.template.write().expect("template lock") = template;
        self.initialize();
        Ok(())
    }

    // ── Timer plumbing used by command handlers ────────────────

    pub(crate) fn restart_heartbeat(self: &Arc<Self>) {
        session::restart_heartbeat(self);
    }

    pub(crate) fn restart_ping(self: &Arc<Self>) {
        session::restart_ping(self);
    }

    pub(crate) fn reset_time(&self) -> Duration {
        Duration::from_secs(self.read_info().reset_time_secs)
    }

    /// Meter sampler period: `MeterValueSampleInterval` seconds.
    pub(crate) fn meter_value_sample_interval(&self) -> Duration {
        let config = self.lock_config();
        config
            .numeric(config_store::METER_VALUE_SAMPLE_INTERVAL)
            .filter(|secs| *secs > 0)
            .map(|secs| Duration::from_secs(secs as u64))
            .unwrap_or(Duration::from_millis(DEFAULT_METER_VALUE_SAMPLE_INTERVAL_MS))
    }
}
