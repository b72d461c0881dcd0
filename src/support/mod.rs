//! Cross-cutting utilities: OCPP-J framing, error types, backoff.

pub mod backoff;
pub mod errors;
pub mod frame;
