//! Reset handler
//!
//! Accepts immediately, then runs the reset cycle in the background:
//! stop with the matching StopTransaction reason, wait the configured
//! reset time, start again.

use std::sync::Arc;

use rust_ocpp::v1_6::messages::reset::{ResetRequest, ResetResponse};
use rust_ocpp::v1_6::types::{Reason, ResetRequestStatus, ResetResponseStatus};
use serde_json::Value;
use tracing::{error, info};

use super::{into_payload, parse_request};
use crate::station::Station;
use crate::support::errors::OcppError;

pub async fn handle_reset(station: &Arc<Station>, payload: &Value) -> Result<Value, OcppError> {
    let request: ResetRequest = parse_request("Reset", payload)?;

    let reason = match request.kind {
        ResetRequestStatus::Hard => Reason::HardReset,
        ResetRequestStatus::Soft => Reason::SoftReset,
    };
    let reset_time = station.reset_time();

    info!(
        station_id = station.id(),
        kind = ?request.kind,
        reset_time_secs = reset_time.as_secs(),
        "Reset scheduled"
    );

    let station = station.clone();
    tokio::spawn(async move {
        // Waits for the dispatcher to release the gate, i.e. for the
        // Accepted CALLRESULT to be on the wire.
        let _gate = station.handler_gate.lock().await;
        station.stop(Some(reason)).await;
        tokio::time::sleep(reset_time).await;
        if let Err(err) = station.start().await {
            error!(
                station_id = station.id(),
                error = %err,
                "Restart after reset failed"
            );
        }
    });

    into_payload(&ResetResponse {
        status: ResetResponseStatus::Accepted,
    })
}
