//! Shared test fixtures: an in-memory station and a Central System stub
//! that answers every outbound CALL on the transport channel.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::config::StationTemplate;
use crate::station::Station;
use crate::support::frame::Frame;

pub(crate) fn sample_template() -> StationTemplate {
    serde_json::from_value(json!({
        "chargePointModel": "SIM-1",
        "chargePointVendor": "SimVendor",
        "baseName": "CS-TEST",
        "power": 22080.0,
        "numberOfConnectors": 2,
        "numberOfPhases": 3,
        "voltageOut": 230,
        "powerOutType": "AC",
        "supervisionURL": "ws://localhost:8010",
        "autoReconnectMaxRetries": 0,
        "Connectors": {
            "0": {},
            "1": { "MeterValues": [{ "measurand": "Energy.Active.Import.Register" }] },
            "2": { "MeterValues": [{ "measurand": "Energy.Active.Import.Register" }] }
        }
    }))
    .expect("valid test template")
}

pub(crate) fn test_station() -> Arc<Station> {
    init_test_logging();
    Station::from_template(sample_template(), 1).expect("test station")
}

/// Honour RUST_LOG in test runs; repeated calls are fine.
pub(crate) fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

pub(crate) struct CsStub {
    /// Outbound CALLs in send order: (action, payload).
    pub actions: Arc<Mutex<Vec<(String, Value)>>>,
    pub task: JoinHandle<()>,
}

/// Wire the station's transport to an in-memory Central System that
/// records every CALL and immediately resolves it with a canned reply.
pub(crate) fn attach_cs_stub(station: &Arc<Station>) -> CsStub {
    let (tx, mut rx) = mpsc::unbounded_channel();
    station.transport.attach(tx);
    station.transport.set_registered(true);

    let actions = Arc::new(Mutex::new(Vec::new()));
    let recorded = actions.clone();
    let responder = station.clone();
    let task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Message::Text(text) = message {
                if let Ok(Frame::Call {
                    message_id,
                    action,
                    payload,
                }) = Frame::parse(&text)
                {
                    recorded.lock().await.push((action.clone(), payload));
                    responder
                        .transport
                        .resolve_result(&message_id, canned_reply(&action));
                }
            }
        }
    });
    CsStub { actions, task }
}

fn canned_reply(action: &str) -> Value {
    match action {
        "BootNotification" => json!({
            "status": "Accepted",
            "currentTime": "2024-01-01T00:00:00Z",
            "interval": 30
        }),
        "Heartbeat" => json!({ "currentTime": "2024-01-01T00:00:00Z" }),
        "StartTransaction" => json!({
            "transactionId": 1001,
            "idTagInfo": { "status": "Accepted" }
        }),
        "StopTransaction" => json!({ "idTagInfo": { "status": "Accepted" } }),
        "Authorize" => json!({ "idTagInfo": { "status": "Accepted" } }),
        _ => json!({}),
    }
}

/// Poll until `condition` holds (5 s deadline).
pub(crate) async fn wait_until<F: Fn() -> bool>(condition: F, what: &str) {
    let deadline = Duration::from_secs(5);
    let poll = async {
        loop {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(deadline, poll)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting until {}", what));
}

/// Poll the stub until `action` has been recorded (5 s deadline).
pub(crate) async fn wait_for_action(stub: &CsStub, action: &str) {
    let deadline = Duration::from_secs(5);
    let poll = async {
        loop {
            if stub
                .actions
                .lock()
                .await
                .iter()
                .any(|(recorded, _)| recorded == action)
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(deadline, poll)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", action));
}
