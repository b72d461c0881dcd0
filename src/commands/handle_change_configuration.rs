//! ChangeConfiguration handler
//!
//! Lookup is case-insensitive. Writing either heartbeat-interval
//! spelling mirrors the other and restarts the heartbeat timer; writing
//! `WebSocketPingInterval` restarts the ping timer.

use std::sync::Arc;

use rust_ocpp::v1_6::messages::change_configuration::{
    ChangeConfigurationRequest, ChangeConfigurationResponse,
};
use rust_ocpp::v1_6::types::ConfigurationStatus;
use serde_json::Value;

use super::{into_payload, parse_request};
use crate::station::config_store::{HEARTBEAT_INTERVAL, WEB_SOCKET_PING_INTERVAL};
use crate::station::Station;
use crate::support::errors::OcppError;

pub async fn handle_change_configuration(
    station: &Arc<Station>,
    payload: &Value,
) -> Result<Value, OcppError> {
    let request: ChangeConfigurationRequest = parse_request("ChangeConfiguration", payload)?;

    let mut restart_heartbeat = false;
    let mut restart_ping = false;

    let status = {
        let mut config = station.lock_config();
        match config.get_case_insensitive(&request.key) {
            None => ConfigurationStatus::NotSupported,
            Some(entry) if entry.readonly => ConfigurationStatus::Rejected,
            Some(entry) => {
                let canonical_key = entry.key.clone();
                let reboot_required = entry.reboot;
                // Both heartbeat spellings only differ in case.
                if canonical_key.eq_ignore_ascii_case(HEARTBEAT_INTERVAL) {
                    config.set_heartbeat_interval(&request.value);
                    restart_heartbeat = true;
                } else {
                    config.set(&canonical_key, &request.value);
                    if canonical_key == WEB_SOCKET_PING_INTERVAL {
                        restart_ping = true;
                    }
                }
                if reboot_required {
                    ConfigurationStatus::RebootRequired
                } else {
                    ConfigurationStatus::Accepted
                }
            }
        }
    };

    if restart_heartbeat {
        station.restart_heartbeat();
    }
    if restart_ping {
        station.restart_ping();
    }

    into_payload(&ChangeConfigurationResponse { status })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::station::config_store::{KeyFlags, HEART_BEAT_INTERVAL};
    use crate::test_support::test_station;
    use serde_json::json;

    #[tokio::test]
    async fn absent_key_is_not_supported() {
        let station = test_station();
        let response =
            handle_change_configuration(&station, &json!({"key": "Nope", "value": "1"}))
                .await
                .unwrap();
        assert_eq!(response["status"], "NotSupported");
    }

    #[tokio::test]
    async fn readonly_key_is_rejected() {
        let station = test_station();
        let response = handle_change_configuration(
            &station,
            &json!({"key": "NumberOfConnectors", "value": "9"}),
        )
        .await
        .unwrap();
        assert_eq!(response["status"], "Rejected");
        assert_eq!(
            station.lock_config().get("NumberOfConnectors").unwrap().value,
            "2"
        );
    }

    #[tokio::test]
    async fn heartbeat_keys_stay_mirrored() {
        let station = test_station();

        let response = handle_change_configuration(
            &station,
            &json!({"key": "heartbeatinterval", "value": "45"}),
        )
        .await
        .unwrap();
        assert_eq!(response["status"], "Accepted");

        let config = station.lock_config();
        assert_eq!(config.get(HEARTBEAT_INTERVAL).unwrap().value, "45");
        assert_eq!(config.get(HEART_BEAT_INTERVAL).unwrap().value, "45");
    }

    #[tokio::test]
    async fn change_then_get_returns_new_value() {
        let station = test_station();
        station
            .lock_config()
            .add("AllowOfflineTxForUnknownId", "false", KeyFlags::default());

        let response = handle_change_configuration(
            &station,
            &json!({"key": "AllowOfflineTxForUnknownId", "value": "true"}),
        )
        .await
        .unwrap();
        assert_eq!(response["status"], "Accepted");

        let get = super::super::handle_get_configuration(
            &station,
            &json!({"key": ["AllowOfflineTxForUnknownId"]}),
        )
        .await
        .unwrap();
        assert_eq!(get["configurationKey"][0]["value"], "true");
    }

    #[tokio::test]
    async fn ping_interval_change_starts_the_timer() {
        let station = test_station();
        assert!(station.lock_session().ping.is_none());

        let response = handle_change_configuration(
            &station,
            &json!({"key": "WebSocketPingInterval", "value": "5"}),
        )
        .await
        .unwrap();
        assert_eq!(response["status"], "Accepted");
        assert!(station.lock_session().ping.is_some());
    }

    #[tokio::test]
    async fn reboot_flagged_key_requires_reboot() {
        let station = test_station();
        station.lock_config().add(
            "ConnectionTimeOutReboot",
            "30",
            KeyFlags {
                reboot: true,
                ..KeyFlags::default()
            },
        );
        let response = handle_change_configuration(
            &station,
            &json!({"key": "ConnectionTimeOutReboot", "value": "60"}),
        )
        .await
        .unwrap();
        assert_eq!(response["status"], "RebootRequired");
    }
}
