//! # OCPP 1.6-J charging-station simulator
//!
//! In-process core that impersonates electric-vehicle charging stations
//! toward a Central System over WebSocket-carried JSON RPC.
//!
//! ## Architecture
//!
//! - **support**: cross-cutting utilities (OCPP-J framing, errors, backoff)
//! - **config**: station template model and derived per-instance attributes
//! - **station**: the root `Station` entity, connector table, config store
//! - **transport**: RPC correlation, offline buffering, boot gate
//! - **session**: connect/boot/heartbeat/ping/reconnect loop, file watch
//! - **commands**: handlers for Central-System-initiated commands
//! - **meter**: per-connector telemetry synthesis
//!
//! The supervising process that fans out N stations is out of scope; this
//! crate exposes `Station::from_template_file` / `start` / `stop`.

pub mod config;
pub mod station;
pub mod support;
pub mod transport;

mod commands;
mod meter;
mod ocpp;
mod session;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::{PowerOutType, StationInfo, StationTemplate};
pub use station::Station;
pub use support::errors::{ErrorCode, OcppError, SimulatorError};
