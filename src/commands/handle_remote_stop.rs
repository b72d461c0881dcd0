//! RemoteStopTransaction handler
//!
//! Accepted only when some connector carries the requested transaction;
//! the Finishing notification and the StopTransaction exchange run after
//! the CALLRESULT.

use std::sync::Arc;

use rust_ocpp::v1_6::messages::remote_stop_transaction::{
    RemoteStopTransactionRequest, RemoteStopTransactionResponse,
};
use rust_ocpp::v1_6::types::{ChargePointStatus, RemoteStartStopStatus};
use serde_json::Value;
use tracing::{error, warn};

use super::{into_payload, parse_request};
use crate::ocpp::requests;
use crate::station::Station;
use crate::support::errors::OcppError;

pub async fn handle_remote_stop(
    station: &Arc<Station>,
    payload: &Value,
) -> Result<Value, OcppError> {
    let request: RemoteStopTransactionRequest = parse_request("RemoteStopTransaction", payload)?;

    let connector_id = {
        let connectors = station.lock_connectors();
        connectors.connector_for_transaction(request.transaction_id)
    };

    let status = match connector_id {
        Some(connector_id) => {
            let station = station.clone();
            tokio::spawn(async move {
                let _gate = station.handler_gate.lock().await;
                if let Err(err) = remote_stop_flow(&station, connector_id).await {
                    error!(
                        station_id = station.id(),
                        connector_id,
                        error = %err,
                        "Remote stop flow failed"
                    );
                }
            });
            RemoteStartStopStatus::Accepted
        }
        None => {
            warn!(
                station_id = station.id(),
                transaction_id = request.transaction_id,
                "Remote stop rejected, transaction id does not match any connector"
            );
            RemoteStartStopStatus::Rejected
        }
    };

    into_payload(&RemoteStopTransactionResponse { status })
}

async fn remote_stop_flow(station: &Arc<Station>, connector_id: u32) -> Result<(), OcppError> {
    requests::update_status(station, connector_id, ChargePointStatus::Finishing).await?;
    requests::finish_transaction(station, connector_id, None).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{attach_cs_stub, test_station, wait_for_action};
    use serde_json::json;

    #[tokio::test]
    async fn stops_the_matching_transaction() {
        let station = test_station();
        let stub = attach_cs_stub(&station);
        {
            let mut connectors = station.lock_connectors();
            let connector = connectors.get_mut(2).unwrap();
            connector.transaction_started = true;
            connector.transaction_id = Some(55);
            connector.last_energy_register_wh = 300;
        }

        let response = handle_remote_stop(&station, &json!({"transactionId": 55}))
            .await
            .unwrap();
        assert_eq!(response["status"], "Accepted");

        wait_for_action(&stub, "StopTransaction").await;
        let actions = stub.actions.lock().await;
        let statuses: Vec<&str> = actions
            .iter()
            .filter(|(action, _)| action == "StatusNotification")
            .map(|(_, payload)| payload["status"].as_str().unwrap())
            .collect();
        assert_eq!(statuses.first(), Some(&"Finishing"));
        let stop = actions
            .iter()
            .find(|(action, _)| action == "StopTransaction")
            .unwrap();
        assert_eq!(stop.1["transactionId"], 55);
        assert_eq!(stop.1["meterStop"], 300);
        drop(actions);
        stub.task.abort();
    }

    #[tokio::test]
    async fn unknown_transaction_is_rejected() {
        let station = test_station();
        let response = handle_remote_stop(&station, &json!({"transactionId": 12345}))
            .await
            .unwrap();
        assert_eq!(response["status"], "Rejected");
    }
}
