//! Typed error taxonomy for the DHCP core.
//!
//! `anyhow` is used at the setup/startup boundary (see `config` and `main`)
//! where a human-readable context chain is what matters. Everywhere else —
//! allocator, lease store, handler chain, listener — callers need to match
//! on a specific variant, so those paths return one of the enums below.

use std::net::{Ipv4Addr, Ipv6Addr};
use thiserror::Error;

/// Malformed handler argument, unknown handler name, or a setup-time
/// invariant violation. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown handler `{0}`")]
    UnknownHandler(String),

    #[error("handler `{handler}` expects {expected} argument(s), got {got}")]
    ArgCount {
        handler: &'static str,
        expected: &'static str,
        got: usize,
    },

    #[error("handler `{handler}`: invalid argument `{arg}`: {reason}")]
    InvalidArg {
        handler: &'static str,
        arg: String,
        reason: String,
    },

    #[error("unsupported DUID variant `{0}`, only LL and LLT are accepted")]
    UnsupportedDuidVariant(String),

    #[error("lease file `{path}` holds an address the pool cannot re-reserve: {addr}")]
    WarmRecoveryFailed { path: String, addr: String },

    #[error("allocator pool is invalid: {0}")]
    InvalidPool(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Inbound packet malformed, or relay nesting exceeded bounds. Local:
/// log and drop the datagram.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("failed to decode DHCP message: {0}")]
    Codec(String),

    #[error("relay-forward chain exceeded the maximum of {max} hops")]
    RelayChainTooDeep { max: u32 },

    #[error("empty datagram")]
    Empty,
}

/// Opcode/message-type disallowed, or ServerID mismatched. Local: drop
/// silently (debug log); never reply.
#[derive(Debug, Error)]
pub enum ProtocolViolation {
    #[error("unexpected BOOTP opcode {0}, expected BOOTREQUEST")]
    BadOpcode(u8),

    #[error("message type {0:?} has no reply-skeleton mapping")]
    UnhandledMessageType(String),

    #[error("server-identifier mismatch: request carried {requested}, we are {ours}")]
    ServerIdMismatch { requested: String, ours: String },

    #[error("server-identifier required but absent for this message type")]
    ServerIdRequired,

    #[error("server-identifier must not be present for this message type")]
    ServerIdForbidden,
}

/// Allocator contract errors. `NoAddressAvailable` surfaces to callers as
/// `NoPrefixAvail` (v6 status code) or reply suppression (v4).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AllocationError {
    #[error("no address available in pool")]
    NoAddressAvailable,

    #[error("address {0} is outside the configured pool")]
    OutOfRange(String),

    #[error("double free of address {0}")]
    DoubleFree(String),

    #[error("prefix length {0} is out of range [0, 128]")]
    BadPrefixLength(u8),

    #[error("prefix arithmetic overflowed 128 bits")]
    Overflow,

    #[error("bitmap of {0} bits exceeds machine-addressable capacity")]
    PoolTooLarge(u64),
}

/// Lease store write failed. Logged; the in-memory lease still proceeds —
/// availability over strict persistence.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("failed to serialize lease records: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to write lease file {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read lease file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("lease-store write exceeded its deadline")]
    Timeout,
}

/// Terminal for the affected listener; reported on the `Servers` error
/// channel. Other listeners continue.
#[derive(Debug, Error)]
pub enum SocketError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to bind to interface `{iface}`: {source}")]
    BindDevice {
        iface: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to join multicast group {group} on interface {iface}: {source}")]
    JoinMulticast {
        group: Ipv6Addr,
        iface: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("listener socket closed")]
    Closed,

    #[error("recv failed: {0}")]
    Recv(std::io::Error),

    #[error("send failed: {0}")]
    Send(std::io::Error),

    #[error("raw L2 send unavailable on this platform/interface: {0}")]
    RawSendUnavailable(String),

    #[error("no usable source address on interface for destination {0}")]
    NoSourceAddress(Ipv4Addr),
}
