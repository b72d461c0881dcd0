//! SetChargingProfile handler
//!
//! ChargePointMaxProfile only installs on connector 0; TxProfile only on
//! a transacting physical connector. A profile with the same id or the
//! same (stackLevel, purpose) slot replaces in place.

use std::sync::Arc;

use rust_ocpp::v1_6::messages::set_charging_profile::{
    SetChargingProfileRequest, SetChargingProfileResponse,
};
use rust_ocpp::v1_6::types::{ChargingProfilePurposeType, ChargingProfileStatus};
use serde_json::Value;
use tracing::info;

use super::{into_payload, parse_request};
use crate::station::Station;
use crate::support::errors::OcppError;

pub async fn handle_set_charging_profile(
    station: &Arc<Station>,
    payload: &Value,
) -> Result<Value, OcppError> {
    let request: SetChargingProfileRequest = parse_request("SetChargingProfile", payload)?;
    let profile = request.cs_charging_profiles;

    let status = match u32::try_from(request.connector_id) {
        Err(_) => ChargingProfileStatus::Rejected,
        Ok(connector_id) => {
            let mut connectors = station.lock_connectors();
            match connectors.get_mut(connector_id) {
                None => ChargingProfileStatus::Rejected,
                Some(connector) => {
                    let purpose_allowed = match profile.charging_profile_purpose {
                        ChargingProfilePurposeType::ChargePointMaxProfile => connector_id == 0,
                        ChargingProfilePurposeType::TxProfile => {
                            connector_id != 0 && connector.has_active_transaction()
                        }
                        ChargingProfilePurposeType::TxDefaultProfile => true,
                    };
                    if purpose_allowed {
                        info!(
                            station_id = station.id(),
                            connector_id,
                            profile_id = profile.charging_profile_id,
                            "Charging profile installed"
                        );
                        connector.upsert_charging_profile(profile);
                        ChargingProfileStatus::Accepted
                    } else {
                        ChargingProfileStatus::Rejected
                    }
                }
            }
        }
    };

    into_payload(&SetChargingProfileResponse { status })
}
