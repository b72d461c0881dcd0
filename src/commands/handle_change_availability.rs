//! ChangeAvailability handler
//!
//! Connector 0 switches every connector; a connector with a running
//! transaction still takes the new availability but answers Scheduled.
//! A request on a single connector is only honoured while the station
//! itself is operative (or when both sides agree on Inoperative).

use std::sync::Arc;

use rust_ocpp::v1_6::messages::change_availability::{
    ChangeAvailabilityRequest, ChangeAvailabilityResponse,
};
use rust_ocpp::v1_6::types::{AvailabilityStatus, AvailabilityType, ChargePointStatus};
use serde_json::Value;
use tracing::error;

use super::{into_payload, parse_request};
use crate::ocpp::requests;
use crate::station::Station;
use crate::support::errors::OcppError;

fn availability_status_of(kind: &AvailabilityType) -> ChargePointStatus {
    match kind {
        AvailabilityType::Operative => ChargePointStatus::Available,
        AvailabilityType::Inoperative => ChargePointStatus::Unavailable,
    }
}

pub async fn handle_change_availability(
    station: &Arc<Station>,
    payload: &Value,
) -> Result<Value, OcppError> {
    let request: ChangeAvailabilityRequest = parse_request("ChangeAvailability", payload)?;
    let target_status = availability_status_of(&request.kind);

    if request.connector_id == 0 {
        let mut status = AvailabilityStatus::Accepted;
        let ids = {
            let connectors = station.lock_connectors();
            connectors.ids()
        };
        for id in ids {
            {
                let mut connectors = station.lock_connectors();
                if let Some(connector) = connectors.get_mut(id) {
                    if connector.has_active_transaction() {
                        status = AvailabilityStatus::Scheduled;
                    }
                    connector.availability = request.kind.clone();
                }
            }
            if matches!(status, AvailabilityStatus::Accepted) {
                if let Err(err) =
                    requests::update_status(station, id, target_status.clone()).await
                {
                    error!(
                        station_id = station.id(),
                        connector_id = id,
                        error = %err,
                        "StatusNotification after availability change failed"
                    );
                }
            }
        }
        return into_payload(&ChangeAvailabilityResponse { status });
    }

    // None = rejected, Some(true) = scheduled, Some(false) = applied.
    let outcome = {
        let mut connectors = station.lock_connectors();
        let honoured = connectors.station_operative()
            || matches!(request.kind, AvailabilityType::Inoperative);
        match connectors.get_mut(request.connector_id) {
            Some(connector) if honoured => {
                connector.availability = request.kind.clone();
                Some(connector.has_active_transaction())
            }
            _ => None,
        }
    };

    let status = match outcome {
        None => AvailabilityStatus::Rejected,
        Some(true) => AvailabilityStatus::Scheduled,
        Some(false) => {
            requests::update_status(station, request.connector_id, target_status).await?;
            AvailabilityStatus::Accepted
        }
    };
    into_payload(&ChangeAvailabilityResponse { status })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{attach_cs_stub, test_station};
    use serde_json::json;

    #[tokio::test]
    async fn connector_zero_switches_every_connector() {
        let station = test_station();
        let stub = attach_cs_stub(&station);

        let response = handle_change_availability(
            &station,
            &json!({"connectorId": 0, "type": "Inoperative"}),
        )
        .await
        .unwrap();
        assert_eq!(response["status"], "Accepted");

        let connectors = station.lock_connectors();
        for (_, connector) in connectors.iter() {
            assert!(matches!(
                connector.availability,
                AvailabilityType::Inoperative
            ));
        }
        drop(connectors);
        stub.task.abort();
    }

    #[tokio::test]
    async fn transaction_in_progress_schedules_the_change() {
        let station = test_station();
        let stub = attach_cs_stub(&station);
        station
            .lock_connectors()
            .get_mut(1)
            .unwrap()
            .transaction_started = true;

        let response = handle_change_availability(
            &station,
            &json!({"connectorId": 1, "type": "Inoperative"}),
        )
        .await
        .unwrap();
        assert_eq!(response["status"], "Scheduled");
        // The availability is still applied.
        assert!(matches!(
            station.lock_connectors().get(1).unwrap().availability,
            AvailabilityType::Inoperative
        ));
        stub.task.abort();
    }

    #[tokio::test]
    async fn inoperative_station_rejects_operative_request() {
        let station = test_station();
        let stub = attach_cs_stub(&station);
        station
            .lock_connectors()
            .get_mut(0)
            .unwrap()
            .availability = AvailabilityType::Inoperative;

        let rejected = handle_change_availability(
            &station,
            &json!({"connectorId": 1, "type": "Operative"}),
        )
        .await
        .unwrap();
        assert_eq!(rejected["status"], "Rejected");

        let honoured = handle_change_availability(
            &station,
            &json!({"connectorId": 1, "type": "Inoperative"}),
        )
        .await
        .unwrap();
        assert_eq!(honoured["status"], "Accepted");
        stub.task.abort();
    }

    #[tokio::test]
    async fn unknown_connector_is_rejected() {
        let station = test_station();
        let response = handle_change_availability(
            &station,
            &json!({"connectorId": 9, "type": "Operative"}),
        )
        .await
        .unwrap();
        assert_eq!(response["status"], "Rejected");
    }
}
