//! Session controller
//!
//! Drives the WebSocket lifecycle: connect with the `ocpp1.6`
//! subprotocol, run the boot-notification handshake until Registered,
//! keep heartbeat and ping timers alive, dispatch inbound frames, and
//! reconnect with backoff after an abnormal close. Close codes 1000
//! (Normal) and 1005 (NoStatus) are terminal; everything else re-enters
//! the connect loop. A transport error alone never reconnects; only the
//! close path does.

pub mod watcher;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rust_ocpp::v1_6::types::{ChargePointStatus, RegistrationStatus};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, timeout};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, trace, warn};

use crate::commands;
use crate::ocpp::requests;
use crate::station::Station;
use crate::support::backoff;
use crate::support::errors::{ErrorCode, OcppError};
use crate::support::frame::{Frame, MESSAGE_TYPE_CALL_ERROR};

/// OCPP 1.6-J WebSocket subprotocol.
pub const OCPP16_SUBPROTOCOL: &str = "ocpp1.6";

/// Close codes that end the session for good.
const CLOSE_NORMAL: u16 = 1000;
const CLOSE_NO_STATUS: u16 = 1005;
/// Reported when the stream ends without a close frame.
const CLOSE_ABNORMAL: u16 = 1006;

/// Fallback sleep between boot attempts when the Central System supplied
/// no usable interval.
const DEFAULT_BOOT_RETRY_SECS: u64 = 60;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Background tasks owned by the station; every one of them must be
/// cancelled by `stop` before the socket goes away.
#[derive(Default)]
pub(crate) struct SessionTasks {
    pub connection: Option<tokio::task::JoinHandle<()>>,
    pub boot: Option<tokio::task::JoinHandle<()>>,
    pub heartbeat: Option<tokio::task::JoinHandle<()>>,
    pub ping: Option<tokio::task::JoinHandle<()>>,
    pub watch: Option<tokio::task::JoinHandle<()>>,
    pub watcher: Option<notify::RecommendedWatcher>,
}

// ── Connect / reconnect loop ───────────────────────────────────

pub(crate) async fn run_connection_loop(station: Arc<Station>) {
    let mut handshake_timeout = initial_handshake_timeout(&station);
    loop {
        if station.has_stopped() {
            return;
        }
        let url = station.supervision_url();
        match open_socket(station.id(), &url, handshake_timeout).await {
            Ok(stream) => {
                info!(station_id = station.id(), url = url.as_str(), "Connected");
                station.auto_reconnect_retry_count.store(0, Ordering::SeqCst);
                let close_code = run_session(&station, stream).await;
                if station.has_stopped() {
                    return;
                }
                match close_code {
                    Some(code @ (CLOSE_NORMAL | CLOSE_NO_STATUS)) => {
                        info!(
                            station_id = station.id(),
                            code, "WebSocket closed normally"
                        );
                        station.auto_reconnect_retry_count.store(0, Ordering::SeqCst);
                        return;
                    }
                    code => warn!(
                        station_id = station.id(),
                        code = code.unwrap_or(CLOSE_ABNORMAL),
                        "WebSocket closed abnormally"
                    ),
                }
            }
            Err(err) => error!(
                station_id = station.id(),
                url = url.as_str(),
                error = %err,
                "WebSocket connection failed"
            ),
        }

        stop_heartbeat(&station);

        let info = station.read_info();
        let retries = station.auto_reconnect_retry_count.load(Ordering::SeqCst) as i32;
        if info.auto_reconnect_max_retries >= 0 && retries >= info.auto_reconnect_max_retries {
            error!(
                station_id = station.id(),
                retries, "Reconnect retries exhausted, giving up"
            );
            return;
        }
        let count = station
            .auto_reconnect_retry_count
            .fetch_add(1, Ordering::SeqCst)
            + 1;
        let base = Duration::from_secs(info.connection_timeout_secs.max(1));
        let delay = if info.reconnect_exponential_delay {
            backoff::exponential_delay(count, base)
        } else {
            base
        };
        warn!(
            station_id = station.id(),
            retry = count,
            delay_ms = delay.as_millis() as u64,
            "Reconnecting"
        );
        sleep(delay).await;
        station.has_socket_restarted.store(true, Ordering::SeqCst);
        handshake_timeout = Some(delay.saturating_sub(Duration::from_millis(100)));
    }
}

fn initial_handshake_timeout(station: &Arc<Station>) -> Option<Duration> {
    // connectionTimeout = 0 disables the handshake deadline.
    let secs = station.read_info().connection_timeout_secs;
    (secs > 0).then(|| Duration::from_secs(secs))
}

async fn open_socket(
    station_id: &str,
    url: &str,
    handshake_timeout: Option<Duration>,
) -> Result<WsStream, OcppError> {
    let endpoint = format!("{}/{}", url.trim_end_matches('/'), station_id);
    let mut request = endpoint
        .clone()
        .into_client_request()
        .map_err(|e| OcppError::generic(format!("Invalid supervision URL {}: {}", endpoint, e)))?;
    request.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        HeaderValue::from_static(OCPP16_SUBPROTOCOL),
    );

    let connect = connect_async(request);
    let result = match handshake_timeout {
        Some(deadline) => timeout(deadline, connect).await.map_err(|_| {
            OcppError::generic(format!(
                "WebSocket handshake timed out after {} ms",
                deadline.as_millis()
            ))
        })?,
        None => connect.await,
    };
    let (stream, _response) =
        result.map_err(|e| OcppError::generic(format!("WebSocket connect failed: {}", e)))?;
    Ok(stream)
}

// ── One socket session ─────────────────────────────────────────

async fn run_session(station: &Arc<Station>, stream: WsStream) -> Option<u16> {
    let (sink, reader) = stream.split();
    let (tx, rx) = mpsc::unbounded_channel::<Message>();
    station.transport.attach(tx);
    let writer = tokio::spawn(write_loop(sink, rx, station.id().to_string()));

    if station.is_registered() {
        // Socket restart of a registered session: no second boot
        // handshake; flush what queued up while offline.
        if station.has_socket_restarted.load(Ordering::SeqCst) {
            station.transport.drain_offline_queue();
        }
        restart_heartbeat(station);
    } else {
        let boot = tokio::spawn(boot_sequence(station.clone()));
        if let Some(previous) = station.lock_session().boot.replace(boot) {
            previous.abort();
        }
    }
    restart_ping(station);

    let close_code = read_loop(station, reader).await;

    station.transport.detach();
    stop_ping(station);
    stop_heartbeat(station);
    stop_boot(station);
    writer.abort();
    close_code
}

pub(crate) fn stop_boot(station: &Arc<Station>) {
    if let Some(handle) = station.lock_session().boot.take() {
        handle.abort();
    }
}

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
    station_id: String,
) {
    while let Some(message) = rx.recv().await {
        if let Err(err) = sink.send(message).await {
            error!(
                station_id = station_id.as_str(),
                error = %err,
                "WebSocket send failed"
            );
            return;
        }
    }
}

async fn read_loop(station: &Arc<Station>, mut reader: SplitStream<WsStream>) -> Option<u16> {
    while let Some(message) = reader.next().await {
        match message {
            Ok(Message::Text(text)) => handle_incoming(station, &text).await,
            Ok(Message::Ping(_)) => trace!(station_id = station.id(), "Ping received"),
            Ok(Message::Pong(_)) => trace!(station_id = station.id(), "Pong received"),
            Ok(Message::Close(frame)) => {
                let code = frame
                    .as_ref()
                    .map(|f| u16::from(f.code))
                    .unwrap_or(CLOSE_NO_STATUS);
                info!(station_id = station.id(), code, "Close frame received");
                return Some(code);
            }
            Ok(_) => {}
            Err(err) => {
                // The error itself triggers no reconnect; ending the read
                // loop hands control to the close handling.
                error!(station_id = station.id(), error = %err, "WebSocket error");
                return None;
            }
        }
    }
    None
}

// ── Inbound dispatch ───────────────────────────────────────────

pub(crate) async fn handle_incoming(station: &Arc<Station>, text: &str) {
    match Frame::parse(text) {
        Ok(Frame::Call {
            message_id,
            action,
            payload,
        }) => {
            let station = station.clone();
            tokio::spawn(async move {
                // Commands are handled one at a time per station, while
                // response correlation stays on the reader so a handler
                // awaiting a nested request cannot deadlock.
                let _gate = station.handler_gate.lock().await;
                match commands::dispatch(&station, &action, &payload).await {
                    Ok(result) => station.transport.send_result(&message_id, result),
                    Err(err) => {
                        error!(
                            station_id = station.id(),
                            action = action.as_str(),
                            code = err.code.as_str(),
                            description = err.description.as_str(),
                            "Command failed"
                        );
                        station.transport.send_error(&message_id, &err);
                    }
                }
            });
        }
        Ok(Frame::CallResult {
            message_id,
            payload,
        }) => station.transport.resolve_result(&message_id, payload),
        Ok(Frame::CallError {
            message_id,
            code,
            description,
            details,
        }) => {
            let error = OcppError {
                code: wire_error_code(&code),
                description,
                details: Some(details),
            };
            station.transport.resolve_error(&message_id, error);
        }
        Err(parse_error) => {
            warn!(
                station_id = station.id(),
                error = %parse_error,
                raw = text,
                "Malformed inbound frame"
            );
            // Reply with a CALLERROR unless the offending frame was itself
            // a CALLERROR (no reply storm).
            let raw: Option<Vec<Value>> = serde_json::from_str(text).ok();
            let message_type = raw
                .as_ref()
                .and_then(|arr| arr.first())
                .and_then(Value::as_u64);
            if message_type == Some(MESSAGE_TYPE_CALL_ERROR) {
                return;
            }
            let message_id = raw
                .as_ref()
                .and_then(|arr| arr.get(1))
                .and_then(Value::as_str)
                .unwrap_or_default();
            station.transport.send_error(
                message_id,
                &OcppError::generic(parse_error.description.clone()),
            );
        }
    }
}

fn wire_error_code(code: &str) -> ErrorCode {
    match code {
        "NotImplemented" => ErrorCode::NotImplemented,
        "NotSupported" => ErrorCode::NotSupported,
        "InternalError" => ErrorCode::InternalError,
        "ProtocolError" => ErrorCode::ProtocolError,
        "FormationViolation" => ErrorCode::FormationViolation,
        _ => ErrorCode::GenericError,
    }
}

// ── Boot handshake ─────────────────────────────────────────────

pub(crate) async fn boot_sequence(station: Arc<Station>) {
    let max_retries = station.read_info().registration_max_retries;
    let mut retry_count: i32 = 0;
    loop {
        if station.has_stopped() || !station.transport.is_open() {
            return;
        }
        match requests::send_boot_notification(&station).await {
            Ok(response) => {
                match response.status {
                    RegistrationStatus::Accepted => {
                        info!(station_id = station.id(), "Registration accepted");
                        station.transport.set_registered(true);
                        on_boot_accepted(&station, response.interval as i64).await;
                        return;
                    }
                    RegistrationStatus::Pending => {
                        info!(station_id = station.id(), "Registration pending")
                    }
                    RegistrationStatus::Rejected => {
                        warn!(station_id = station.id(), "Registration rejected")
                    }
                }
                let secs = if response.interval > 0 {
                    response.interval as u64
                } else {
                    DEFAULT_BOOT_RETRY_SECS
                };
                sleep(Duration::from_secs(secs)).await;
            }
            Err(err) => {
                error!(
                    station_id = station.id(),
                    error = %err,
                    "BootNotification failed"
                );
                sleep(Duration::from_secs(DEFAULT_BOOT_RETRY_SECS)).await;
            }
        }
        retry_count += 1;
        if max_retries >= 0 && retry_count > max_retries {
            error!(
                station_id = station.id(),
                retries = retry_count,
                "Registration retries exhausted"
            );
            return;
        }
    }
}

/// Apply an Accepted boot response: write both heartbeat-interval keys,
/// arm the heartbeat, clear the stopped flag, and announce every
/// physical connector's status.
pub(crate) async fn on_boot_accepted(station: &Arc<Station>, interval_secs: i64) {
    {
        let mut config = station.lock_config();
        config.set_heartbeat_interval(&interval_secs.to_string());
    }
    restart_heartbeat(station);
    station.has_stopped.store(false, Ordering::SeqCst);

    let ids: Vec<u32> = {
        let connectors = station.lock_connectors();
        connectors.ids().into_iter().filter(|id| *id > 0).collect()
    };
    for id in ids {
        let status = {
            let connectors = station.lock_connectors();
            connectors
                .get(id)
                .map(|connector| {
                    connector
                        .boot_status
                        .clone()
                        .unwrap_or_else(|| connector.status.clone())
                })
                .unwrap_or(ChargePointStatus::Available)
        };
        if let Err(err) = requests::update_status(station, id, status).await {
            error!(
                station_id = station.id(),
                connector_id = id,
                error = %err,
                "StatusNotification after boot failed"
            );
        }
    }
}

// ── Heartbeat timer ────────────────────────────────────────────

pub(crate) fn restart_heartbeat(station: &Arc<Station>) {
    stop_heartbeat(station);
    let secs = {
        let config = station.lock_config();
        config.heartbeat_interval_secs().unwrap_or(0)
    };
    if secs <= 0 {
        warn!(
            station_id = station.id(),
            interval = secs,
            "Heartbeat disabled, interval is not positive"
        );
        return;
    }
    let handle = tokio::spawn(heartbeat_loop(station.clone(), secs as u64));
    station.lock_session().heartbeat = Some(handle);
}

pub(crate) fn stop_heartbeat(station: &Arc<Station>) {
    if let Some(handle) = station.lock_session().heartbeat.take() {
        handle.abort();
    }
}

async fn heartbeat_loop(station: Arc<Station>, secs: u64) {
    let mut ticker = interval(Duration::from_secs(secs));
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match requests::send_heartbeat(&station).await {
            Ok(response) => debug!(
                station_id = station.id(),
                current_time = %response.current_time,
                "Heartbeat"
            ),
            Err(err) => error!(
                station_id = station.id(),
                error = %err,
                "Heartbeat failed"
            ),
        }
    }
}

// ── WebSocket ping timer ───────────────────────────────────────

pub(crate) fn restart_ping(station: &Arc<Station>) {
    stop_ping(station);
    let secs = {
        let config = station.lock_config();
        config
            .numeric(crate::station::config_store::WEB_SOCKET_PING_INTERVAL)
            .unwrap_or(0)
    };
    if secs <= 0 {
        debug!(station_id = station.id(), "WebSocket ping disabled");
        return;
    }
    let handle = tokio::spawn(ping_loop(station.clone(), secs as u64));
    station.lock_session().ping = Some(handle);
}

pub(crate) fn stop_ping(station: &Arc<Station>) {
    if let Some(handle) = station.lock_session().ping.take() {
        handle.abort();
    }
}

async fn ping_loop(station: Arc<Station>, secs: u64) {
    let mut ticker = interval(Duration::from_secs(secs));
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if station.transport.send_ping() {
            trace!(station_id = station.id(), "Ping sent");
        } else {
            debug!(
                station_id = station.id(),
                "Ping skipped, socket not open"
            );
        }
    }
}
