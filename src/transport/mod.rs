//! OCPP RPC transport
//!
//! Owns the outbound half of the WebSocket (a channel into the writer
//! task), the pending-requests table keyed by message id, and the
//! offline queue that buffers frames while the socket is down. Every
//! send passes the boot gate: before the station is Registered only
//! BootNotification may traverse the socket.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::support::errors::OcppError;
use crate::support::frame::Frame;

/// Fixed CALL response timeout.
pub const OCPP_RESPONSE_TIMEOUT: Duration = Duration::from_secs(60);

pub const BOOT_NOTIFICATION_ACTION: &str = "BootNotification";

struct PendingRequest {
    action: String,
    responder: oneshot::Sender<Result<Value, OcppError>>,
}

pub struct RpcTransport {
    station_id: String,
    sender: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    pending: DashMap<String, PendingRequest>,
    offline_queue: Mutex<VecDeque<String>>,
    registered: AtomicBool,
}

impl RpcTransport {
    pub fn new(station_id: impl Into<String>) -> Self {
        Self {
            station_id: station_id.into(),
            sender: Mutex::new(None),
            pending: DashMap::new(),
            offline_queue: Mutex::new(VecDeque::new()),
            registered: AtomicBool::new(false),
        }
    }

    /// Bind the writer channel of a freshly opened socket.
    pub fn attach(&self, sender: mpsc::UnboundedSender<Message>) {
        *self.sender.lock().expect("transport sender lock") = Some(sender);
    }

    /// Drop the writer channel when the socket goes down. In-flight
    /// requests are left to their response timeout.
    pub fn detach(&self) {
        *self.sender.lock().expect("transport sender lock") = None;
    }

    pub fn is_open(&self) -> bool {
        self.sender
            .lock()
            .expect("transport sender lock")
            .as_ref()
            .map(|tx| !tx.is_closed())
            .unwrap_or(false)
    }

    pub fn set_registered(&self, registered: bool) {
        self.registered.store(registered, Ordering::SeqCst);
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    /// Issue a CALL and await its CALLRESULT / CALLERROR / timeout.
    ///
    /// When the gate denies the send, BootNotification fails immediately
    /// while any other action is parked in the offline queue and the
    /// caller rejected with the buffered-message error.
    pub async fn send_request(&self, action: &str, payload: Value) -> Result<Value, OcppError> {
        let message_id = Uuid::new_v4().to_string();
        let frame = Frame::Call {
            message_id: message_id.clone(),
            action: action.to_string(),
            payload,
        };
        let text = frame.serialize();

        if !self.admitted(action) {
            if action == BOOT_NOTIFICATION_ACTION {
                return Err(OcppError::generic(
                    "WebSocket closed, cannot send BootNotification",
                ));
            }
            self.enqueue(text);
            return Err(OcppError::buffered(action));
        }

        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            message_id.clone(),
            PendingRequest {
                action: action.to_string(),
                responder: tx,
            },
        );

        debug!(
            station_id = self.station_id.as_str(),
            action,
            message_id = message_id.as_str(),
            "Sending request"
        );

        if !self.write(&text) {
            // Socket died between the gate check and the send.
            self.pending.remove(&message_id);
            self.enqueue(text);
            return Err(OcppError::buffered(action));
        }

        match timeout(OCPP_RESPONSE_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                self.pending.remove(&message_id);
                Err(OcppError::generic("Response channel closed"))
            }
            Err(_) => {
                // Deleting the entry here guarantees a response arriving
                // after the deadline is dropped, not dispatched.
                self.pending.remove(&message_id);
                warn!(
                    station_id = self.station_id.as_str(),
                    action,
                    message_id = message_id.as_str(),
                    "Request timed out"
                );
                Err(OcppError::timeout(&message_id))
            }
        }
    }

    /// Send a CALLRESULT answering an inbound CALL.
    pub fn send_result(&self, message_id: &str, payload: Value) {
        let frame = Frame::CallResult {
            message_id: message_id.to_string(),
            payload,
        };
        if !self.write(&frame.serialize()) {
            error!(
                station_id = self.station_id.as_str(),
                message_id, "Failed to send CALLRESULT, socket closed"
            );
        }
    }

    /// Send a CALLERROR answering an inbound CALL.
    pub fn send_error(&self, message_id: &str, error: &OcppError) {
        let frame = Frame::error_response(message_id, error);
        if !self.write(&frame.serialize()) {
            error!(
                station_id = self.station_id.as_str(),
                message_id, "Failed to send CALLERROR, socket closed"
            );
        }
    }

    /// Resolve the pending entry for an inbound CALLRESULT.
    pub fn resolve_result(&self, message_id: &str, payload: Value) {
        match self.pending.remove(message_id) {
            Some((_, pending)) => {
                debug!(
                    station_id = self.station_id.as_str(),
                    action = pending.action.as_str(),
                    message_id,
                    "Response received"
                );
                let _ = pending.responder.send(Ok(payload));
            }
            None => warn!(
                station_id = self.station_id.as_str(),
                message_id, "CALLRESULT for unknown message id"
            ),
        }
    }

    /// Reject the pending entry for an inbound CALLERROR.
    pub fn resolve_error(&self, message_id: &str, error: OcppError) {
        match self.pending.remove(message_id) {
            Some((_, pending)) => {
                warn!(
                    station_id = self.station_id.as_str(),
                    action = pending.action.as_str(),
                    message_id,
                    code = error.code.as_str(),
                    description = error.description.as_str(),
                    "Error response received"
                );
                let _ = pending.responder.send(Err(error));
            }
            None => warn!(
                station_id = self.station_id.as_str(),
                message_id, "CALLERROR for unknown message id"
            ),
        }
    }

    /// Send an RFC 6455 ping frame.
    pub fn send_ping(&self) -> bool {
        let guard = self.sender.lock().expect("transport sender lock");
        match guard.as_ref() {
            Some(tx) => tx.send(Message::Ping(Vec::new())).is_ok(),
            None => false,
        }
    }

    /// Request a WebSocket close handshake.
    pub fn send_close(&self) {
        let guard = self.sender.lock().expect("transport sender lock");
        if let Some(tx) = guard.as_ref() {
            let _ = tx.send(Message::Close(None));
        }
    }

    /// Drain the offline queue in FIFO order onto the open socket.
    /// Entries are removed as they are sent.
    pub fn drain_offline_queue(&self) {
        loop {
            let next = {
                let mut queue = self.offline_queue.lock().expect("offline queue lock");
                queue.pop_front()
            };
            let Some(text) = next else { break };
            debug!(
                station_id = self.station_id.as_str(),
                "Sending buffered message"
            );
            if !self.write(&text) {
                // Socket went down again; park the frame back at the front.
                let mut queue = self.offline_queue.lock().expect("offline queue lock");
                queue.push_front(text);
                break;
            }
        }
    }

    pub fn queued_frames(&self) -> usize {
        self.offline_queue.lock().expect("offline queue lock").len()
    }

    fn admitted(&self, action: &str) -> bool {
        self.is_open() && (self.is_registered() || action == BOOT_NOTIFICATION_ACTION)
    }

    fn enqueue(&self, text: String) {
        let mut queue = self.offline_queue.lock().expect("offline queue lock");
        // Exact duplicates are suppressed: repeated failed sends of the
        // same serialized frame buffer once.
        if !queue.contains(&text) {
            queue.push_back(text);
        }
    }

    fn write(&self, text: &str) -> bool {
        let guard = self.sender.lock().expect("transport sender lock");
        match guard.as_ref() {
            Some(tx) => tx.send(Message::Text(text.to_string())).is_ok(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn transport() -> RpcTransport {
        RpcTransport::new("CS-TEST-0001")
    }

    fn attach_channel(transport: &RpcTransport) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        transport.attach(tx);
        rx
    }

    fn sent_text(message: Message) -> String {
        match message {
            Message::Text(text) => text,
            other => panic!("expected text frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn boot_notification_fails_immediately_when_closed() {
        let transport = transport();
        let err = transport
            .send_request(BOOT_NOTIFICATION_ACTION, json!({}))
            .await
            .unwrap_err();
        assert!(err.description.contains("BootNotification"));
        assert_eq!(transport.queued_frames(), 0);
    }

    #[tokio::test]
    async fn non_boot_actions_buffer_while_closed() {
        let transport = transport();
        let err = transport
            .send_request("Heartbeat", json!({}))
            .await
            .unwrap_err();
        assert!(err.description.contains("buffered"));
        assert_eq!(transport.queued_frames(), 1);
    }

    #[tokio::test]
    async fn boot_gate_blocks_until_registered() {
        let transport = transport();
        let mut rx = attach_channel(&transport);

        let err = transport
            .send_request("Heartbeat", json!({}))
            .await
            .unwrap_err();
        assert!(err.description.contains("buffered"));

        transport.set_registered(true);
        let transport = std::sync::Arc::new(transport);
        let sender = transport.clone();
        let pending = tokio::spawn(async move {
            sender.send_request("Heartbeat", json!({})).await
        });
        // The request is now admitted: it hits the socket and waits.
        let sent = sent_text(rx.recv().await.unwrap());
        assert!(sent.contains("Heartbeat"));
        assert_eq!(transport.pending.len(), 1);
        pending.abort();
    }

    #[tokio::test]
    async fn offline_queue_drains_fifo() {
        let transport = transport();
        let _ = transport.send_request("Heartbeat", json!({"n": 1})).await;
        let _ = transport
            .send_request("StatusNotification", json!({"n": 2}))
            .await;
        assert_eq!(transport.queued_frames(), 2);

        let mut rx = attach_channel(&transport);
        transport.set_registered(true);
        transport.drain_offline_queue();

        let first = sent_text(rx.recv().await.unwrap());
        let second = sent_text(rx.recv().await.unwrap());
        assert!(first.contains("Heartbeat"));
        assert!(second.contains("StatusNotification"));
        assert_eq!(transport.queued_frames(), 0);
    }

    #[tokio::test]
    async fn duplicate_frames_are_suppressed() {
        let transport = transport();
        // Identical serialized frames require identical message ids, so
        // feed the queue directly.
        transport.enqueue("[2,\"x\",\"Heartbeat\",{}]".to_string());
        transport.enqueue("[2,\"x\",\"Heartbeat\",{}]".to_string());
        assert_eq!(transport.queued_frames(), 1);
    }

    #[tokio::test]
    async fn call_result_resolves_pending_request() {
        let transport = std::sync::Arc::new(transport());
        let mut rx = attach_channel(&transport);
        transport.set_registered(true);

        let sender = transport.clone();
        let request =
            tokio::spawn(async move { sender.send_request("Heartbeat", json!({})).await });

        let sent = sent_text(rx.recv().await.unwrap());
        let frame = Frame::parse(&sent).unwrap();
        transport.resolve_result(frame.message_id(), json!({"currentTime": "2024-01-01T00:00:00Z"}));

        let payload = request.await.unwrap().unwrap();
        assert_eq!(payload["currentTime"], "2024-01-01T00:00:00Z");
        assert_eq!(transport.pending.len(), 0);
    }

    #[tokio::test]
    async fn call_error_rejects_pending_request() {
        let transport = std::sync::Arc::new(transport());
        let mut rx = attach_channel(&transport);
        transport.set_registered(true);

        let sender = transport.clone();
        let request =
            tokio::spawn(async move { sender.send_request("Heartbeat", json!({})).await });

        let sent = sent_text(rx.recv().await.unwrap());
        let frame = Frame::parse(&sent).unwrap();
        transport.resolve_error(
            frame.message_id(),
            OcppError::generic("Internal failure"),
        );

        let err = request.await.unwrap().unwrap_err();
        assert!(err.description.contains("Internal failure"));
        assert_eq!(transport.pending.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn request_times_out_and_late_response_is_dropped() {
        let transport = std::sync::Arc::new(transport());
        let mut rx = attach_channel(&transport);
        transport.set_registered(true);

        let sender = transport.clone();
        let request =
            tokio::spawn(async move { sender.send_request("Heartbeat", json!({})).await });

        let sent = sent_text(rx.recv().await.unwrap());
        let frame = Frame::parse(&sent).unwrap();
        let message_id = frame.message_id().to_string();

        tokio::time::advance(OCPP_RESPONSE_TIMEOUT + Duration::from_secs(1)).await;
        let err = request.await.unwrap().unwrap_err();
        assert!(err.description.contains("Timeout"));

        // A response arriving after the deadline finds no pending entry.
        transport.resolve_result(&message_id, json!({}));
        assert_eq!(transport.pending.len(), 0);
    }

    #[tokio::test]
    async fn resolve_unknown_message_id_is_ignored() {
        let transport = transport();
        transport.resolve_result("never-sent", json!({}));
        transport.resolve_error("never-sent", OcppError::generic("x"));
    }
}
