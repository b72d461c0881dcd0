//! ClearCache handler
//!
//! The simulator keeps no authorization cache, so the command always
//! succeeds without side effects.

use std::sync::Arc;

use rust_ocpp::v1_6::messages::clear_cache::ClearCacheResponse;
use rust_ocpp::v1_6::types::ClearCacheStatus;
use serde_json::Value;

use super::into_payload;
use crate::station::Station;
use crate::support::errors::OcppError;

pub async fn handle_clear_cache(
    _station: &Arc<Station>,
    _payload: &Value,
) -> Result<Value, OcppError> {
    into_payload(&ClearCacheResponse {
        status: ClearCacheStatus::Accepted,
    })
}
