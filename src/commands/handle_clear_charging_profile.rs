//! ClearChargingProfile handler
//!
//! With a connectorId the whole profile list of that connector is
//! dropped. Without one, every connector is scanned and profiles are
//! cleared by id, by stack level, by purpose, or by the
//! (stackLevel, purpose) pair, depending on which criteria are present.

use std::sync::Arc;

use rust_ocpp::v1_6::messages::clear_charging_profile::{
    ClearChargingProfileRequest, ClearChargingProfileResponse,
};
use rust_ocpp::v1_6::types::{ChargingProfile, ClearChargingProfileStatus};
use serde_json::Value;
use tracing::info;

use super::{into_payload, parse_request};
use crate::station::Station;
use crate::support::errors::OcppError;

fn matches_criteria(profile: &ChargingProfile, request: &ClearChargingProfileRequest) -> bool {
    if let Some(id) = request.id {
        if profile.charging_profile_id == id {
            return true;
        }
    }
    match (request.stack_level, &request.charging_profile_purpose) {
        (Some(stack_level), None) => profile.stack_level as i32 == stack_level,
        (None, Some(purpose)) => profile.charging_profile_purpose == *purpose,
        (Some(stack_level), Some(purpose)) => {
            profile.stack_level as i32 == stack_level
                && profile.charging_profile_purpose == *purpose
        }
        (None, None) => false,
    }
}

pub async fn handle_clear_charging_profile(
    station: &Arc<Station>,
    payload: &Value,
) -> Result<Value, OcppError> {
    let request: ClearChargingProfileRequest = parse_request("ClearChargingProfile", payload)?;

    let mut cleared = false;
    {
        let mut connectors = station.lock_connectors();
        match request.connector_id {
            Some(connector_id) => {
                if let Some(connector) = u32::try_from(connector_id)
                    .ok()
                    .and_then(|id| connectors.get_mut(id))
                {
                    if !connector.charging_profiles.is_empty() {
                        connector.charging_profiles.clear();
                        cleared = true;
                    }
                }
            }
            None => {
                for (_, connector) in connectors.iter_mut() {
                    let before = connector.charging_profiles.len();
                    connector
                        .charging_profiles
                        .retain(|profile| !matches_criteria(profile, &request));
                    if connector.charging_profiles.len() != before {
                        cleared = true;
                    }
                }
            }
        }
    }

    if cleared {
        info!(station_id = station.id(), "Charging profiles cleared");
    }

    into_payload(&ClearChargingProfileResponse {
        status: if cleared {
            ClearChargingProfileStatus::Accepted
        } else {
            ClearChargingProfileStatus::Unknown
        },
    })
}
