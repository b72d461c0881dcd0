//! Station template configuration
//!
//! A station template is a JSON file describing the simulated hardware:
//! identity, electrical characteristics, supervision URL(s), connector
//! layout and initial OCPP configuration keys. One template fans out to
//! N station instances distinguished by an integer index.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use rand::Rng;
use rust_ocpp::v1_6::types::{
    AvailabilityType, ChargePointStatus, Location, Measurand, ReadingContext, UnitOfMeasure,
};
use serde::{Deserialize, Serialize};

use crate::support::errors::SimulatorError;

pub const DEFAULT_SUPERVISION_URL: &str = "ws://localhost:8010";
pub const DEFAULT_VOLTAGE_OUT: f64 = 230.0;
pub const DEFAULT_NUMBER_OF_PHASES: u32 = 3;
pub const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_RESET_TIME_SECS: u64 = 60;

/// Environment variable mixed into generated station identifiers.
pub const CF_INSTANCE_INDEX_ENV: &str = "CF_INSTANCE_INDEX";

/// A JSON value that is either a scalar or a list of scalars.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T: Clone> OneOrMany<T> {
    /// Deterministic pick for station `index` (1-based round-robin over
    /// list values; a scalar always yields itself).
    pub fn pick(&self, index: u32) -> Option<T> {
        match self {
            Self::One(value) => Some(value.clone()),
            Self::Many(values) if values.is_empty() => None,
            Self::Many(values) => {
                let slot = index.saturating_sub(1) as usize % values.len();
                Some(values[slot].clone())
            }
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::One(_) => 1,
            Self::Many(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
pub enum PowerOutType {
    #[default]
    AC,
    DC,
}

/// One sampled-value descriptor from a connector's `MeterValues` template.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SampledValueTemplate {
    pub measurand: Option<Measurand>,
    pub unit: Option<UnitOfMeasure>,
    pub context: Option<ReadingContext>,
    pub location: Option<Location>,
    /// Fixed value overriding synthesis for this measurand.
    pub value: Option<String>,
}

/// Template descriptor for a single connector.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectorTemplate {
    pub availability: Option<AvailabilityType>,
    pub boot_status: Option<ChargePointStatus>,
    #[serde(rename = "MeterValues")]
    pub meter_values: Vec<SampledValueTemplate>,
}

/// Initial OCPP configuration keys carried by the template.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TemplateConfiguration {
    pub configuration_key: Vec<TemplateConfigurationKey>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TemplateConfigurationKey {
    pub key: String,
    pub value: String,
    pub readonly: Option<bool>,
    pub visible: Option<bool>,
    pub reboot: Option<bool>,
}

/// Automatic-transaction-generator block. The generator driver itself is
/// an external collaborator; the fields are parsed as configuration
/// surface only.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AutomaticTransactionGeneratorConfiguration {
    pub enable: bool,
    pub stop_on_connection_failure: bool,
    pub min_duration: Option<u64>,
    pub max_duration: Option<u64>,
}

/// The station template file (JSON).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StationTemplate {
    pub charge_point_model: String,
    pub charge_point_vendor: String,
    pub charge_box_serial_number_prefix: Option<String>,
    pub firmware_version: Option<String>,
    pub base_name: String,
    pub fixed_name: Option<bool>,
    pub name_suffix: Option<String>,
    /// Station power in watts; a list is distributed round-robin by index.
    pub power: Option<OneOrMany<f64>>,
    pub number_of_connectors: Option<OneOrMany<u32>>,
    pub number_of_phases: Option<u32>,
    pub voltage_out: Option<f64>,
    pub power_out_type: Option<PowerOutType>,
    #[serde(rename = "supervisionURL")]
    pub supervision_url: Option<OneOrMany<String>>,
    pub distribute_stations_to_tenants_equally: Option<bool>,
    pub authorization_file: Option<String>,
    pub use_connector_id0: Option<bool>,
    pub random_connectors: Option<bool>,
    pub power_shared_by_connectors: Option<bool>,
    pub authorize_remote_tx_requests: Option<bool>,
    pub connection_timeout: Option<u64>,
    pub auto_reconnect_max_retries: Option<i32>,
    pub registration_max_retries: Option<i32>,
    pub reconnect_exponential_delay: Option<bool>,
    pub reset_time: Option<u64>,
    pub enable_statistics: Option<bool>,
    #[serde(rename = "Configuration")]
    pub configuration: Option<TemplateConfiguration>,
    // BTreeMap keeps the serialized form stable for the connector digest.
    #[serde(rename = "Connectors")]
    pub connectors: BTreeMap<String, ConnectorTemplate>,
    #[serde(rename = "AutomaticTransactionGenerator")]
    pub automatic_transaction_generator: Option<AutomaticTransactionGeneratorConfiguration>,
}

impl StationTemplate {
    pub fn load(path: &Path) -> Result<Self, SimulatorError> {
        let text = fs::read_to_string(path)?;
        let template: Self = serde_json::from_str(&text)?;
        if template.base_name.is_empty() {
            return Err(SimulatorError::Template(format!(
                "{}: baseName is required",
                path.display()
            )));
        }
        Ok(template)
    }

    /// Template connector definitions with id > 0.
    pub fn connector_template_count(&self) -> u32 {
        self.connectors
            .keys()
            .filter(|key| key.as_str() != "0")
            .count() as u32
    }

    /// Supervision URL for station `index`: `index % N` when the template
    /// distributes stations over tenants equally, uniform random pick
    /// otherwise.
    pub fn supervision_url_for(&self, index: u32) -> String {
        let urls = match &self.supervision_url {
            Some(OneOrMany::One(url)) => return url.clone(),
            Some(OneOrMany::Many(urls)) if !urls.is_empty() => urls,
            _ => return DEFAULT_SUPERVISION_URL.to_string(),
        };
        let slot = if self.distribute_stations_to_tenants_equally.unwrap_or(false) {
            index as usize % urls.len()
        } else {
            rand::thread_rng().gen_range(0..urls.len())
        };
        urls[slot].clone()
    }
}

/// Derive the charging-station identifier for instance `index`.
///
/// `fixedName ? baseName
///            : baseName + "-" + (CF_INSTANCE_INDEX|"") + zeroPad4(index) + (nameSuffix|"")`
pub fn station_id(template: &StationTemplate, index: u32) -> String {
    if template.fixed_name.unwrap_or(false) {
        return template.base_name.clone();
    }
    let instance = std::env::var(CF_INSTANCE_INDEX_ENV).unwrap_or_default();
    format!(
        "{}-{}{:04}{}",
        template.base_name,
        instance,
        index,
        template.name_suffix.as_deref().unwrap_or_default()
    )
}

/// Station attributes resolved from a template for one instance.
#[derive(Debug, Clone)]
pub struct StationInfo {
    pub vendor: String,
    pub model: String,
    pub charge_box_serial_number: Option<String>,
    pub firmware_version: Option<String>,
    /// Station maximum power in watts.
    pub max_power: f64,
    pub number_of_phases: u32,
    pub voltage_out: f64,
    pub power_out_type: PowerOutType,
    pub max_connectors: u32,
    pub use_connector_id0: bool,
    pub random_connectors: bool,
    pub power_shared_by_connectors: bool,
    pub authorize_remote_tx_requests: bool,
    pub connection_timeout_secs: u64,
    pub auto_reconnect_max_retries: i32,
    pub registration_max_retries: i32,
    pub reconnect_exponential_delay: bool,
    pub reset_time_secs: u64,
    pub enable_statistics: bool,
}

impl StationInfo {
    pub fn from_template(template: &StationTemplate, index: u32) -> Self {
        let template_connectors = template.connector_template_count();
        let max_connectors = template
            .number_of_connectors
            .as_ref()
            .and_then(|n| n.pick(index))
            .unwrap_or(template_connectors);

        Self {
            vendor: template.charge_point_vendor.clone(),
            model: template.charge_point_model.clone(),
            charge_box_serial_number: template
                .charge_box_serial_number_prefix
                .as_ref()
                .map(|prefix| format!("{}{:04}", prefix, index)),
            firmware_version: template.firmware_version.clone(),
            max_power: template
                .power
                .as_ref()
                .and_then(|p| p.pick(index))
                .unwrap_or_default(),
            number_of_phases: template.number_of_phases.unwrap_or(DEFAULT_NUMBER_OF_PHASES),
            voltage_out: template.voltage_out.unwrap_or(DEFAULT_VOLTAGE_OUT),
            power_out_type: template.power_out_type.unwrap_or_default(),
            max_connectors,
            use_connector_id0: template.use_connector_id0.unwrap_or(true),
            random_connectors: template.random_connectors.unwrap_or(false),
            power_shared_by_connectors: template.power_shared_by_connectors.unwrap_or(false),
            authorize_remote_tx_requests: template.authorize_remote_tx_requests.unwrap_or(false),
            connection_timeout_secs: template
                .connection_timeout
                .unwrap_or(DEFAULT_CONNECTION_TIMEOUT_SECS),
            auto_reconnect_max_retries: template.auto_reconnect_max_retries.unwrap_or(-1),
            registration_max_retries: template.registration_max_retries.unwrap_or(-1),
            reconnect_exponential_delay: template.reconnect_exponential_delay.unwrap_or(false),
            reset_time_secs: template.reset_time.unwrap_or(DEFAULT_RESET_TIME_SECS),
            enable_statistics: template.enable_statistics.unwrap_or(false),
        }
    }
}

/// Load the authorization-tag file: a top-level JSON array of idTag strings.
pub fn load_authorized_tags(path: &Path) -> Result<Vec<String>, SimulatorError> {
    let text = fs::read_to_string(path)?;
    let tags: Vec<String> = serde_json::from_str(&text)?;
    Ok(tags)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template_json() -> serde_json::Value {
        serde_json::json!({
            "chargePointModel": "SIM-1",
            "chargePointVendor": "SimVendor",
            "baseName": "CS-SIM",
            "power": 22080.0,
            "numberOfConnectors": 2,
            "voltageOut": 230,
            "powerOutType": "AC",
            "supervisionURL": "ws://cs.example:8010",
            "Connectors": {
                "0": {},
                "1": { "bootStatus": "Available", "MeterValues": [{ "measurand": "Energy.Active.Import.Register" }] },
                "2": { "MeterValues": [] }
            }
        })
    }

    #[test]
    fn parses_template_fields() {
        let template: StationTemplate = serde_json::from_value(template_json()).unwrap();
        assert_eq!(template.charge_point_model, "SIM-1");
        assert_eq!(template.connector_template_count(), 2);
        assert_eq!(template.supervision_url_for(7), "ws://cs.example:8010");

        let info = StationInfo::from_template(&template, 1);
        assert_eq!(info.max_connectors, 2);
        assert_eq!(info.number_of_phases, 3);
        assert!((info.max_power - 22080.0).abs() < f64::EPSILON);
        assert!(info.use_connector_id0);
    }

    #[test]
    fn station_id_zero_pads_index() {
        let template: StationTemplate = serde_json::from_value(template_json()).unwrap();
        assert_eq!(station_id(&template, 7), "CS-SIM-0007");
    }

    #[test]
    fn station_id_honours_fixed_name() {
        let mut template: StationTemplate = serde_json::from_value(template_json()).unwrap();
        template.fixed_name = Some(true);
        assert_eq!(station_id(&template, 3), "CS-SIM");
    }

    #[test]
    fn list_values_distribute_round_robin() {
        let numbers = OneOrMany::Many(vec![2u32, 4, 8]);
        assert_eq!(numbers.pick(1), Some(2));
        assert_eq!(numbers.pick(2), Some(4));
        assert_eq!(numbers.pick(4), Some(2));
    }

    #[test]
    fn equal_tenant_distribution_uses_index() {
        let mut template: StationTemplate = serde_json::from_value(template_json()).unwrap();
        template.supervision_url = Some(OneOrMany::Many(vec![
            "ws://a".into(),
            "ws://b".into(),
        ]));
        template.distribute_stations_to_tenants_equally = Some(true);
        assert_eq!(template.supervision_url_for(0), "ws://a");
        assert_eq!(template.supervision_url_for(3), "ws://b");
    }
}
