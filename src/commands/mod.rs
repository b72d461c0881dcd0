//! Central System → charge point command handlers
//!
//! Inbound CALL frames are routed by OCPP action name; each handler
//! deserializes the payload into its `rust_ocpp::v1_6` request type,
//! applies the command to the station and returns the response payload.
//! Unknown actions produce a NotImplemented CALLERROR.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::station::Station;
use crate::support::errors::{ErrorCode, OcppError};

mod handle_change_availability;
mod handle_change_configuration;
mod handle_clear_cache;
mod handle_clear_charging_profile;
mod handle_get_configuration;
mod handle_remote_start;
mod handle_remote_stop;
mod handle_reset;
mod handle_set_charging_profile;
mod handle_unlock_connector;

pub use handle_change_availability::handle_change_availability;
pub use handle_change_configuration::handle_change_configuration;
pub use handle_clear_cache::handle_clear_cache;
pub use handle_clear_charging_profile::handle_clear_charging_profile;
pub use handle_get_configuration::handle_get_configuration;
pub use handle_remote_start::handle_remote_start;
pub use handle_remote_stop::handle_remote_stop;
pub use handle_reset::handle_reset;
pub use handle_set_charging_profile::handle_set_charging_profile;
pub use handle_unlock_connector::handle_unlock_connector;

/// Route an inbound CALL to its handler.
pub async fn dispatch(
    station: &Arc<Station>,
    action: &str,
    payload: &Value,
) -> Result<Value, OcppError> {
    match action {
        "ChangeAvailability" => handle_change_availability(station, payload).await,
        "ChangeConfiguration" => handle_change_configuration(station, payload).await,
        "ClearCache" => handle_clear_cache(station, payload).await,
        "ClearChargingProfile" => handle_clear_charging_profile(station, payload).await,
        "GetConfiguration" => handle_get_configuration(station, payload).await,
        "RemoteStartTransaction" => handle_remote_start(station, payload).await,
        "RemoteStopTransaction" => handle_remote_stop(station, payload).await,
        "Reset" => handle_reset(station, payload).await,
        "SetChargingProfile" => handle_set_charging_profile(station, payload).await,
        "UnlockConnector" => handle_unlock_connector(station, payload).await,
        unknown => Err(OcppError::not_implemented(unknown)),
    }
}

pub(crate) fn parse_request<T: DeserializeOwned>(
    action: &str,
    payload: &Value,
) -> Result<T, OcppError> {
    serde_json::from_value(payload.clone()).map_err(|e| {
        OcppError::new(
            ErrorCode::FormationViolation,
            format!("Malformed {} payload: {}", action, e),
        )
    })
}

pub(crate) fn into_payload<T: Serialize>(response: &T) -> Result<Value, OcppError> {
    serde_json::to_value(response).map_err(|e| {
        OcppError::new(
            ErrorCode::InternalError,
            format!("Response serialization failed: {}", e),
        )
    })
}
