//! Station-initiated OCPP 1.6 requests and their response semantics.

pub mod requests;
