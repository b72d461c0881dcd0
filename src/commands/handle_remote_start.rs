//! RemoteStartTransaction handler
//!
//! Validation (availability, local authorization, charging-profile
//! purpose) is synchronous so the CALLRESULT reflects it; the Preparing
//! notification, the optional wire Authorize and the StartTransaction
//! exchange run after the response has gone out.

use std::sync::Arc;

use rust_ocpp::v1_6::messages::remote_start_transaction::{
    RemoteStartTransactionRequest, RemoteStartTransactionResponse,
};
use rust_ocpp::v1_6::types::{
    AuthorizationStatus, AvailabilityType, ChargePointStatus, ChargingProfilePurposeType,
    RemoteStartStopStatus,
};
use serde_json::Value;
use tracing::{error, warn};

use super::{into_payload, parse_request};
use crate::ocpp::requests;
use crate::station::config_store::{AUTHORIZE_REMOTE_TX_REQUESTS, LOCAL_AUTH_LIST_ENABLED};
use crate::station::Station;
use crate::support::errors::OcppError;

/// RemoteStartTransaction without a connectorId targets connector 1.
const DEFAULT_TRANSACTION_CONNECTOR: u32 = 1;

fn rejected() -> Result<Value, OcppError> {
    into_payload(&RemoteStartTransactionResponse {
        status: RemoteStartStopStatus::Rejected,
    })
}

pub async fn handle_remote_start(
    station: &Arc<Station>,
    payload: &Value,
) -> Result<Value, OcppError> {
    let request: RemoteStartTransactionRequest = parse_request("RemoteStartTransaction", payload)?;
    let connector_id = request
        .connector_id
        .unwrap_or(DEFAULT_TRANSACTION_CONNECTOR);

    let available = {
        let connectors = station.lock_connectors();
        connectors.station_operative()
            && connectors
                .get(connector_id)
                .map(|connector| {
                    connector_id != 0
                        && matches!(connector.availability, AvailabilityType::Operative)
                })
                .unwrap_or(false)
    };
    if !available {
        warn!(
            station_id = station.id(),
            connector_id, "Remote start rejected, connector unavailable"
        );
        return rejected();
    }

    // Local auth list short-circuit.
    let (authorize_remote, local_auth_list) = {
        let config = station.lock_config();
        (
            config.boolean(AUTHORIZE_REMOTE_TX_REQUESTS).unwrap_or(false),
            config.boolean(LOCAL_AUTH_LIST_ENABLED).unwrap_or(false),
        )
    };
    let tags = station.authorized_tags();
    let mut locally_authorized = false;
    if authorize_remote && local_auth_list && !tags.is_empty() {
        if !tags.iter().any(|tag| tag == &request.id_tag) {
            warn!(
                station_id = station.id(),
                connector_id,
                id_tag = request.id_tag.as_str(),
                "Remote start rejected, idTag not in local authorization list"
            );
            return rejected();
        }
        locally_authorized = true;
    }

    if let Some(profile) = request.charging_profile {
        if !matches!(
            profile.charging_profile_purpose,
            ChargingProfilePurposeType::TxProfile
        ) {
            warn!(
                station_id = station.id(),
                connector_id, "Remote start rejected, charging profile is not a TxProfile"
            );
            return rejected();
        }
        let mut connectors = station.lock_connectors();
        if let Some(connector) = connectors.get_mut(connector_id) {
            connector.upsert_charging_profile(profile);
        }
    }

    let wire_authorize = authorize_remote && !locally_authorized;
    let id_tag = request.id_tag.clone();
    let station = station.clone();
    tokio::spawn(async move {
        // Runs once the dispatcher has released the gate, so the Accepted
        // CALLRESULT precedes the Preparing notification on the wire.
        let _gate = station.handler_gate.lock().await;
        if let Err(err) =
            remote_start_flow(&station, connector_id, &id_tag, wire_authorize).await
        {
            error!(
                station_id = station.id(),
                connector_id,
                error = %err,
                "Remote start flow failed"
            );
        }
    });

    into_payload(&RemoteStartTransactionResponse {
        status: RemoteStartStopStatus::Accepted,
    })
}

async fn remote_start_flow(
    station: &Arc<Station>,
    connector_id: u32,
    id_tag: &str,
    wire_authorize: bool,
) -> Result<(), OcppError> {
    requests::update_status(station, connector_id, ChargePointStatus::Preparing).await?;
    if wire_authorize {
        let response = requests::send_authorize(station, id_tag).await?;
        if !matches!(response.id_tag_info.status, AuthorizationStatus::Accepted) {
            warn!(
                station_id = station.id(),
                connector_id, id_tag, "Authorize rejected, remote start abandoned"
            );
            return requests::update_status(station, connector_id, ChargePointStatus::Available)
                .await;
        }
    }
    requests::begin_transaction(station, connector_id, id_tag).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{attach_cs_stub, test_station, wait_for_action, wait_until};
    use serde_json::json;

    #[tokio::test]
    async fn happy_path_prepares_starts_and_charges() {
        let station = test_station();
        let stub = attach_cs_stub(&station);

        let response = handle_remote_start(
            &station,
            &json!({"connectorId": 1, "idTag": "TAG1"}),
        )
        .await
        .unwrap();
        assert_eq!(response["status"], "Accepted");

        // The sampler is armed after the Charging notification, so its
        // presence pins the whole flow as finished.
        let sampler_station = station.clone();
        wait_until(
            move || {
                sampler_station
                    .lock_connectors()
                    .get(1)
                    .map(|c| c.sampler.is_some())
                    .unwrap_or(false)
            },
            "remote start flow finished",
        )
        .await;

        let actions = stub.actions.lock().await;
        let statuses: Vec<&str> = actions
            .iter()
            .filter(|(action, _)| action == "StatusNotification")
            .map(|(_, payload)| payload["status"].as_str().unwrap())
            .collect();
        assert_eq!(statuses.first(), Some(&"Preparing"));
        assert!(statuses.contains(&"Charging"));

        let start = actions
            .iter()
            .find(|(action, _)| action == "StartTransaction")
            .unwrap();
        assert_eq!(start.1["idTag"], "TAG1");
        assert_eq!(start.1["connectorId"], 1);
        drop(actions);

        let connectors = station.lock_connectors();
        let connector = connectors.get(1).unwrap();
        assert!(connector.transaction_started);
        assert_eq!(connector.transaction_id, Some(1001));
        assert_eq!(connector.last_energy_register_wh, 0);
        assert!(connector.sampler.is_some());
        drop(connectors);
        stub.task.abort();
    }

    #[tokio::test]
    async fn local_auth_list_rejects_unknown_tag() {
        let station = test_station();
        let stub = attach_cs_stub(&station);
        {
            let mut config = station.lock_config();
            config.set(AUTHORIZE_REMOTE_TX_REQUESTS, "true");
            config.set(LOCAL_AUTH_LIST_ENABLED, "true");
        }
        station.set_authorized_tags(vec!["OTHER".to_string()]);

        let response = handle_remote_start(
            &station,
            &json!({"connectorId": 1, "idTag": "TAG1"}),
        )
        .await
        .unwrap();
        assert_eq!(response["status"], "Rejected");

        // No StartTransaction goes out for a rejected request.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let actions = stub.actions.lock().await;
        assert!(!actions.iter().any(|(action, _)| action == "StartTransaction"));
        drop(actions);
        stub.task.abort();
    }

    #[tokio::test]
    async fn defaults_to_connector_one() {
        let station = test_station();
        let stub = attach_cs_stub(&station);

        let response = handle_remote_start(&station, &json!({"idTag": "TAG1"}))
            .await
            .unwrap();
        assert_eq!(response["status"], "Accepted");

        wait_for_action(&stub, "StartTransaction").await;
        let actions = stub.actions.lock().await;
        let start = actions
            .iter()
            .find(|(action, _)| action == "StartTransaction")
            .unwrap();
        assert_eq!(start.1["connectorId"], 1);
        drop(actions);
        stub.task.abort();
    }

    #[tokio::test]
    async fn non_tx_profile_is_rejected() {
        let station = test_station();
        let response = handle_remote_start(
            &station,
            &json!({
                "connectorId": 1,
                "idTag": "TAG1",
                "chargingProfile": {
                    "chargingProfileId": 1,
                    "stackLevel": 0,
                    "chargingProfilePurpose": "TxDefaultProfile",
                    "chargingProfileKind": "Absolute",
                    "chargingSchedule": {
                        "chargingRateUnit": "W",
                        "chargingSchedulePeriod": [{ "startPeriod": 0, "limit": 8000.0 }]
                    }
                }
            }),
        )
        .await
        .unwrap();
        assert_eq!(response["status"], "Rejected");
    }

    #[tokio::test]
    async fn inoperative_connector_is_rejected() {
        let station = test_station();
        station
            .lock_connectors()
            .get_mut(1)
            .unwrap()
            .availability = AvailabilityType::Inoperative;
        let response = handle_remote_start(
            &station,
            &json!({"connectorId": 1, "idTag": "TAG1"}),
        )
        .await
        .unwrap();
        assert_eq!(response["status"], "Rejected");
    }
}
