//! Per-family wire-level entry points. Each submodule owns decoding,
//! skeleton construction, handler-chain invocation, and transmit-target
//! resolution for its protocol family; the listener just moves bytes.

pub mod v4;
pub mod v6;
