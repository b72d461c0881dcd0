//! GetConfiguration handler

use std::sync::Arc;

use rust_ocpp::v1_6::messages::get_configuration::{
    GetConfigurationRequest, GetConfigurationResponse,
};
use rust_ocpp::v1_6::types::KeyValue;
use serde_json::Value;

use super::{into_payload, parse_request};
use crate::station::config_store::ConfigurationEntry;
use crate::station::Station;
use crate::support::errors::OcppError;

fn key_value(entry: &ConfigurationEntry) -> KeyValue {
    KeyValue {
        key: entry.key.clone(),
        readonly: entry.readonly,
        value: Some(entry.value.clone()),
    }
}

pub async fn handle_get_configuration(
    station: &Arc<Station>,
    payload: &Value,
) -> Result<Value, OcppError> {
    let request: GetConfigurationRequest = parse_request("GetConfiguration", payload)?;

    let mut configuration_key = Vec::new();
    let mut unknown_key = Vec::new();

    {
        let config = station.lock_config();
        match request.key.filter(|keys| !keys.is_empty()) {
            None => {
                configuration_key.extend(config.visible_entries().map(key_value));
            }
            Some(keys) => {
                for key in keys {
                    match config.get(&key) {
                        Some(entry) if entry.visible => configuration_key.push(key_value(entry)),
                        _ => unknown_key.push(key),
                    }
                }
            }
        }
    }

    into_payload(&GetConfigurationResponse {
        configuration_key: Some(configuration_key),
        unknown_key: Some(unknown_key),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::station::config_store::KeyFlags;
    use crate::test_support::test_station;
    use serde_json::json;

    #[tokio::test]
    async fn empty_request_returns_all_visible_entries() {
        let station = test_station();
        {
            let mut config = station.lock_config();
            config.add("Hidden", "x", KeyFlags::hidden());
        }
        let response = handle_get_configuration(&station, &json!({})).await.unwrap();
        let keys: Vec<&str> = response["configurationKey"]
            .as_array()
            .unwrap()
            .iter()
            .map(|kv| kv["key"].as_str().unwrap())
            .collect();
        assert!(keys.contains(&"NumberOfConnectors"));
        assert!(!keys.contains(&"Hidden"));
    }

    #[tokio::test]
    async fn unknown_keys_are_accumulated() {
        let station = test_station();
        let response = handle_get_configuration(
            &station,
            &json!({"key": ["NumberOfConnectors", "NoSuchKey"]}),
        )
        .await
        .unwrap();
        assert_eq!(
            response["configurationKey"][0]["key"],
            "NumberOfConnectors"
        );
        assert_eq!(response["unknownKey"][0], "NoSuchKey");
    }
}
