//! Lease records and their persistent store.

pub mod store;

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub use store::LeaseStore;

/// MAC (v4) or DUID bytes (v6), used as the map/store primary key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientKey(pub Vec<u8>);

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ":")?;
            }
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl ClientKey {
    pub fn from_mac(mac: [u8; 6]) -> Self {
        Self(mac.to_vec())
    }

    pub fn from_duid(duid: &[u8]) -> Self {
        Self(duid.to_vec())
    }

    /// Parse `"aa:bb:cc:dd:ee:ff"` style hex-colon text into a key.
    pub fn parse_hex_colon(s: &str) -> Option<Self> {
        let mut bytes = Vec::new();
        for part in s.split(':') {
            bytes.push(u8::from_str_radix(part, 16).ok()?);
        }
        if bytes.is_empty() {
            None
        } else {
            Some(Self(bytes))
        }
    }
}

/// `{client-key -> assignment, expiry, hostname}`. One record per client
/// per address family. Invariant: `expiry >= last issue time`; extension
/// never shortens (enforced by callers via `extend_expiry`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    /// Text form of the assigned IPv4 address or IPv6 prefix (`"addr/len"`
    /// for prefixes), matching the store's on-disk text representation.
    pub address: String,
    /// Seconds since epoch.
    pub expiry: u64,
    #[serde(default)]
    pub hostname: Option<String>,
}

impl LeaseRecord {
    pub fn new(address: String, expiry: u64, hostname: Option<String>) -> Self {
        Self {
            address,
            expiry,
            hostname,
        }
    }

    /// Monotonic expiry extension: never regresses the stored value, even
    /// under a race between two concurrent renewals.
    pub fn extend_expiry(&mut self, candidate: u64) {
        self.expiry = self.expiry.max(candidate);
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.expiry < now
    }
}

pub fn now_epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs()
}
