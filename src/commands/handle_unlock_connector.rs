//! UnlockConnector handler
//!
//! Unlocking a transacting connector stops the transaction with reason
//! UnlockCommand; the unlock succeeds only if the Central System accepts
//! the stop. Connector 0 cannot be unlocked.

use std::sync::Arc;

use rust_ocpp::v1_6::messages::unlock_connector::{
    UnlockConnectorRequest, UnlockConnectorResponse,
};
use rust_ocpp::v1_6::types::{ChargePointStatus, Reason, UnlockStatus};
use serde_json::Value;

use super::{into_payload, parse_request};
use crate::ocpp::requests;
use crate::station::Station;
use crate::support::errors::OcppError;

pub async fn handle_unlock_connector(
    station: &Arc<Station>,
    payload: &Value,
) -> Result<Value, OcppError> {
    let request: UnlockConnectorRequest = parse_request("UnlockConnector", payload)?;
    let connector_id = request.connector_id;

    let transacting = {
        let connectors = station.lock_connectors();
        match connectors.get(connector_id) {
            Some(connector) if connector_id != 0 => Some(connector.has_active_transaction()),
            _ => None,
        }
    };

    let status = match transacting {
        None => UnlockStatus::NotSupported,
        Some(true) => {
            let accepted =
                requests::finish_transaction(station, connector_id, Some(Reason::UnlockCommand))
                    .await?;
            if accepted {
                UnlockStatus::Unlocked
            } else {
                UnlockStatus::UnlockFailed
            }
        }
        Some(false) => {
            requests::update_status(station, connector_id, ChargePointStatus::Available).await?;
            UnlockStatus::Unlocked
        }
    };

    into_payload(&UnlockConnectorResponse { status })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{attach_cs_stub, test_station};
    use serde_json::json;

    #[tokio::test]
    async fn connector_zero_is_not_supported() {
        let station = test_station();
        let response = handle_unlock_connector(&station, &json!({"connectorId": 0}))
            .await
            .unwrap();
        assert_eq!(response["status"], "NotSupported");
    }

    #[tokio::test]
    async fn idle_connector_unlocks_and_reports_available() {
        let station = test_station();
        let stub = attach_cs_stub(&station);

        let response = handle_unlock_connector(&station, &json!({"connectorId": 1}))
            .await
            .unwrap();
        assert_eq!(response["status"], "Unlocked");

        let actions = stub.actions.lock().await;
        assert!(actions
            .iter()
            .any(|(action, payload)| action == "StatusNotification"
                && payload["status"] == "Available"));
        drop(actions);
        stub.task.abort();
    }

    #[tokio::test]
    async fn transacting_connector_stops_with_unlock_reason() {
        let station = test_station();
        let stub = attach_cs_stub(&station);
        {
            let mut connectors = station.lock_connectors();
            let connector = connectors.get_mut(1).unwrap();
            connector.transaction_started = true;
            connector.transaction_id = Some(77);
            connector.last_energy_register_wh = 500;
        }

        let response = handle_unlock_connector(&station, &json!({"connectorId": 1}))
            .await
            .unwrap();
        assert_eq!(response["status"], "Unlocked");

        let actions = stub.actions.lock().await;
        let stop = actions
            .iter()
            .find(|(action, _)| action == "StopTransaction")
            .expect("StopTransaction sent");
        assert_eq!(stop.1["reason"], "UnlockCommand");
        assert_eq!(stop.1["transactionId"], 77);
        drop(actions);

        assert!(!station
            .lock_connectors()
            .get(1)
            .unwrap()
            .transaction_started);
        stub.task.abort();
    }
}
