//! Connector table
//!
//! Connector 0 represents the station aggregate; ids 1..M are physical
//! outlets. The table is rebuilt from the template on initialisation,
//! guarded by a SHA-256 digest over the template connector map and the
//! connector count so that a template reload with unchanged connectors
//! preserves ongoing transactions.

use std::collections::BTreeMap;

use rand::Rng;
use rust_ocpp::v1_6::types::{AvailabilityType, ChargePointStatus, ChargingProfile};
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::{ConnectorTemplate, SampledValueTemplate, StationInfo, StationTemplate};

/// Energy register sentinel: no transaction has ever run.
pub const ENERGY_REGISTER_UNSET: i64 = -1;

#[derive(Debug)]
pub struct Connector {
    pub availability: AvailabilityType,
    pub status: ChargePointStatus,
    pub boot_status: Option<ChargePointStatus>,
    pub transaction_started: bool,
    pub transaction_id: Option<i32>,
    pub id_tag: Option<String>,
    /// Energy.Active.Import.Register accumulator in Wh; −1 while no
    /// transaction has run, 0 on transaction start.
    pub last_energy_register_wh: i64,
    pub charging_profiles: Vec<ChargingProfile>,
    pub meter_values: Vec<SampledValueTemplate>,
    /// Handle of the running meter-sampler task, if any.
    pub sampler: Option<JoinHandle<()>>,
}

impl Connector {
    fn from_template(template: &ConnectorTemplate) -> Self {
        Self {
            // Availability is forced Operative on initialisation.
            availability: AvailabilityType::Operative,
            status: template
                .boot_status
                .clone()
                .unwrap_or(ChargePointStatus::Available),
            boot_status: template.boot_status.clone(),
            transaction_started: false,
            transaction_id: None,
            id_tag: None,
            last_energy_register_wh: ENERGY_REGISTER_UNSET,
            charging_profiles: Vec::new(),
            meter_values: template.meter_values.clone(),
            sampler: None,
        }
    }

    pub fn has_active_transaction(&self) -> bool {
        self.transaction_started
    }

    /// Reset all transaction fields and cancel the sampler.
    pub fn reset_transaction(&mut self) {
        self.transaction_started = false;
        self.transaction_id = None;
        self.id_tag = None;
        self.last_energy_register_wh = ENERGY_REGISTER_UNSET;
        self.stop_sampler();
    }

    pub fn stop_sampler(&mut self) {
        if let Some(handle) = self.sampler.take() {
            handle.abort();
        }
    }

    /// Install a charging profile: a profile with the same
    /// `chargingProfileId` or the same (stackLevel, purpose) pair
    /// replaces the existing one in place, otherwise it is appended.
    pub fn upsert_charging_profile(&mut self, profile: ChargingProfile) {
        for existing in self.charging_profiles.iter_mut() {
            let same_id = existing.charging_profile_id == profile.charging_profile_id;
            let same_slot = existing.stack_level == profile.stack_level
                && existing.charging_profile_purpose == profile.charging_profile_purpose;
            if same_id || same_slot {
                *existing = profile;
                return;
            }
        }
        self.charging_profiles.push(profile);
    }
}

#[derive(Debug, Default)]
pub struct ConnectorTable {
    connectors: BTreeMap<u32, Connector>,
    template_hash: Option<String>,
}

impl ConnectorTable {
    /// (Re)build the table from the template. A matching template digest
    /// leaves the existing table untouched, running transactions included.
    pub fn initialize(&mut self, station_id: &str, template: &StationTemplate, info: &StationInfo) {
        let hash = connectors_digest(template, info.max_connectors);
        if self.template_hash.as_deref() == Some(hash.as_str()) && !self.connectors.is_empty() {
            debug!(
                station_id,
                "Connector template unchanged, keeping connector table"
            );
            return;
        }
        self.template_hash = Some(hash);
        self.connectors.clear();

        let template_connectors = template.connector_template_count();
        if template_connectors == 0 {
            warn!(station_id, "Template defines no connectors");
            return;
        }

        if info.use_connector_id0 {
            if let Some(zero) = template.connectors.get("0") {
                self.connectors.insert(0, Connector::from_template(zero));
            }
        }

        for id in 1..=info.max_connectors {
            let source = if info.random_connectors {
                rand::thread_rng().gen_range(1..=template_connectors)
            } else {
                // Wrap around when the template defines fewer connectors
                // than the station instantiates.
                (id - 1) % template_connectors + 1
            };
            let connector = template
                .connectors
                .get(&source.to_string())
                .map(Connector::from_template)
                .unwrap_or_else(|| Connector::from_template(&ConnectorTemplate::default()));
            self.connectors.insert(id, connector);
        }
        // from_template yields clean transaction state (no transaction,
        // register unset, no sampler); nothing to reset here.
    }

    pub fn get(&self, id: u32) -> Option<&Connector> {
        self.connectors.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut Connector> {
        self.connectors.get_mut(&id)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.connectors.contains_key(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u32, &Connector)> {
        self.connectors.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&u32, &mut Connector)> {
        self.connectors.iter_mut()
    }

    pub fn ids(&self) -> Vec<u32> {
        self.connectors.keys().copied().collect()
    }

    /// Physical connectors (id > 0).
    pub fn physical_count(&self) -> u32 {
        self.connectors.keys().filter(|id| **id > 0).count() as u32
    }

    pub fn running_transactions(&self) -> u32 {
        self.connectors
            .iter()
            .filter(|(id, connector)| **id > 0 && connector.transaction_started)
            .count() as u32
    }

    /// Connector currently bound to `transaction_id`.
    pub fn connector_for_transaction(&self, transaction_id: i32) -> Option<u32> {
        self.connectors
            .iter()
            .find(|(id, connector)| {
                **id > 0 && connector.transaction_id == Some(transaction_id)
            })
            .map(|(id, _)| *id)
    }

    /// Station availability is connector 0's; a station without a
    /// connector 0 is considered operative.
    pub fn station_operative(&self) -> bool {
        self.connectors
            .get(&0)
            .map(|c| matches!(c.availability, AvailabilityType::Operative))
            .unwrap_or(true)
    }
}

/// Number of ways the station's power is divided across loads: the
/// running transaction count when power is shared by connectors, the
/// physical connector count otherwise.
pub fn power_divider(table: &ConnectorTable, info: &StationInfo) -> u32 {
    if info.power_shared_by_connectors {
        table.running_transactions()
    } else {
        table.physical_count()
    }
}

fn connectors_digest(template: &StationTemplate, max_connectors: u32) -> String {
    let serialized = serde_json::to_string(&template.connectors).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(serialized.as_bytes());
    hasher.update(max_connectors.to_string().as_bytes());
    hex::encode(hasher.finalize())
}
