//! Charge-point → Central System requests
//!
//! Each helper builds the typed `rust_ocpp` request, pushes it through
//! the transport and interprets the typed response.
//! `begin_transaction` / `finish_transaction` carry the transaction
//! state machine side of StartTransaction / StopTransaction.

use std::sync::Arc;

use chrono::Utc;
use rust_ocpp::v1_6::messages::authorize::{AuthorizeRequest, AuthorizeResponse};
use rust_ocpp::v1_6::messages::boot_notification::{
    BootNotificationRequest, BootNotificationResponse,
};
use rust_ocpp::v1_6::messages::heart_beat::{HeartbeatRequest, HeartbeatResponse};
use rust_ocpp::v1_6::messages::meter_values::MeterValuesRequest;
use rust_ocpp::v1_6::messages::start_transaction::{
    StartTransactionRequest, StartTransactionResponse,
};
use rust_ocpp::v1_6::messages::status_notification::StatusNotificationRequest;
use rust_ocpp::v1_6::messages::stop_transaction::{
    StopTransactionRequest, StopTransactionResponse,
};
use rust_ocpp::v1_6::types::{
    AuthorizationStatus, AvailabilityType, ChargePointErrorCode, ChargePointStatus, MeterValue,
    Reason,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::meter;
use crate::station::Station;
use crate::support::errors::{ErrorCode, OcppError};

pub(crate) fn to_payload<T: Serialize>(request: &T) -> Result<Value, OcppError> {
    serde_json::to_value(request).map_err(|e| {
        OcppError::new(
            ErrorCode::InternalError,
            format!("Request serialization failed: {}", e),
        )
    })
}

pub(crate) fn from_payload<T: DeserializeOwned>(payload: Value) -> Result<T, OcppError> {
    serde_json::from_value(payload).map_err(|e| {
        OcppError::new(
            ErrorCode::FormationViolation,
            format!("Malformed response payload: {}", e),
        )
    })
}

pub async fn send_boot_notification(
    station: &Arc<Station>,
) -> Result<BootNotificationResponse, OcppError> {
    let info = station.read_info();
    let request = BootNotificationRequest {
        charge_point_vendor: info.vendor.clone(),
        charge_point_model: info.model.clone(),
        charge_point_serial_number: None,
        charge_box_serial_number: info.charge_box_serial_number.clone(),
        firmware_version: info.firmware_version.clone(),
        iccid: None,
        imsi: None,
        meter_type: None,
        meter_serial_number: None,
    };
    let result = station
        .transport
        .send_request("BootNotification", to_payload(&request)?)
        .await?;
    let response: BootNotificationResponse = from_payload(result)?;
    station.store_boot_response(Some(response.clone()));
    Ok(response)
}

pub async fn send_heartbeat(station: &Arc<Station>) -> Result<HeartbeatResponse, OcppError> {
    let result = station
        .transport
        .send_request("Heartbeat", to_payload(&HeartbeatRequest {})?)
        .await?;
    from_payload(result)
}

pub async fn send_authorize(
    station: &Arc<Station>,
    id_tag: &str,
) -> Result<AuthorizeResponse, OcppError> {
    let request = AuthorizeRequest {
        id_tag: id_tag.to_string(),
    };
    let result = station
        .transport
        .send_request("Authorize", to_payload(&request)?)
        .await?;
    from_payload(result)
}

/// Record the new connector status and notify the Central System.
pub async fn update_status(
    station: &Arc<Station>,
    connector_id: u32,
    status: ChargePointStatus,
) -> Result<(), OcppError> {
    {
        let mut connectors = station.lock_connectors();
        if let Some(connector) = connectors.get_mut(connector_id) {
            connector.status = status.clone();
        }
    }
    let request = StatusNotificationRequest {
        connector_id,
        error_code: ChargePointErrorCode::NoError,
        info: None,
        status,
        timestamp: Some(Utc::now()),
        vendor_id: None,
        vendor_error_code: None,
    };
    station
        .transport
        .send_request("StatusNotification", to_payload(&request)?)
        .await?;
    Ok(())
}

/// Start a transaction on `connector_id` and apply the response: on
/// Accepted the connector enters Charging with a zeroed energy register
/// and a running meter sampler, otherwise its transaction state is reset
/// and Available announced.
pub async fn begin_transaction(
    station: &Arc<Station>,
    connector_id: u32,
    id_tag: &str,
) -> Result<(), OcppError> {
    let request = StartTransactionRequest {
        connector_id,
        id_tag: id_tag.to_string(),
        meter_start: 0,
        reservation_id: None,
        timestamp: Utc::now(),
    };
    let result = station
        .transport
        .send_request("StartTransaction", to_payload(&request)?)
        .await?;
    let response: StartTransactionResponse = from_payload(result)?;

    let accepted = matches!(response.id_tag_info.status, AuthorizationStatus::Accepted);
    let started = {
        let mut connectors = station.lock_connectors();
        let connector = connectors.get_mut(connector_id).ok_or_else(|| {
            OcppError::generic(format!("Connector {} does not exist", connector_id))
        })?;
        if accepted && !connector.transaction_started {
            connector.transaction_started = true;
            connector.transaction_id = Some(response.transaction_id);
            connector.id_tag = Some(id_tag.to_string());
            connector.last_energy_register_wh = 0;
            true
        } else {
            connector.reset_transaction();
            false
        }
    };

    if started {
        info!(
            station_id = station.id(),
            connector_id,
            transaction_id = response.transaction_id,
            id_tag,
            "Transaction started"
        );
        update_status(station, connector_id, ChargePointStatus::Charging).await?;
        meter::start_sampler(station, connector_id);
    } else {
        warn!(
            station_id = station.id(),
            connector_id,
            status = ?response.id_tag_info.status,
            "StartTransaction not accepted"
        );
        update_status(station, connector_id, ChargePointStatus::Available).await?;
    }
    Ok(())
}

/// Stop the transaction running on `connector_id`. Returns whether the
/// Central System accepted the stop; only then is the connector's
/// transaction state reset and its availability announced.
pub async fn finish_transaction(
    station: &Arc<Station>,
    connector_id: u32,
    reason: Option<Reason>,
) -> Result<bool, OcppError> {
    let (transaction_id, id_tag, meter_stop) = {
        let connectors = station.lock_connectors();
        let connector = connectors.get(connector_id).ok_or_else(|| {
            OcppError::generic(format!("Connector {} does not exist", connector_id))
        })?;
        let transaction_id = connector.transaction_id.ok_or_else(|| {
            OcppError::generic(format!(
                "No transaction to stop on connector {}",
                connector_id
            ))
        })?;
        (
            transaction_id,
            connector.id_tag.clone(),
            connector.last_energy_register_wh.max(0) as i32,
        )
    };

    let request = StopTransactionRequest {
        transaction_id,
        id_tag,
        meter_stop,
        timestamp: Utc::now(),
        reason,
        transaction_data: None,
    };
    let result = station
        .transport
        .send_request("StopTransaction", to_payload(&request)?)
        .await?;
    let response: StopTransactionResponse = from_payload(result)?;

    let accepted = response
        .id_tag_info
        .map(|tag_info| matches!(tag_info.status, AuthorizationStatus::Accepted))
        .unwrap_or(true);

    if accepted {
        let status = {
            let connectors = station.lock_connectors();
            let connector_inoperative = connectors
                .get(connector_id)
                .map(|c| matches!(c.availability, AvailabilityType::Inoperative))
                .unwrap_or(false);
            if !connectors.station_operative() || connector_inoperative {
                ChargePointStatus::Unavailable
            } else {
                ChargePointStatus::Available
            }
        };
        update_status(station, connector_id, status).await?;
        {
            let mut connectors = station.lock_connectors();
            if let Some(connector) = connectors.get_mut(connector_id) {
                connector.reset_transaction();
            }
        }
        info!(
            station_id = station.id(),
            connector_id, transaction_id, "Transaction stopped"
        );
    } else {
        warn!(
            station_id = station.id(),
            connector_id, transaction_id, "StopTransaction not accepted"
        );
    }
    Ok(accepted)
}

pub async fn send_meter_values(
    station: &Arc<Station>,
    connector_id: u32,
    transaction_id: Option<i32>,
    meter_value: Vec<MeterValue>,
) -> Result<(), OcppError> {
    let request = MeterValuesRequest {
        connector_id,
        transaction_id,
        meter_value,
    };
    station
        .transport
        .send_request("MeterValues", to_payload(&request)?)
        .await?;
    Ok(())
}
