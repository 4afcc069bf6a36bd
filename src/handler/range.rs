//! RangeHandler (v4): stateful lease management on top of the IPv4 range
//! allocator and a persistent lease store.

use std::sync::Arc;
use std::time::Duration;

use dhcproto::v4;
use tracing::warn;

use crate::allocator::Ipv4RangeAllocator;
use crate::error::ConfigError;
use crate::handler::{HandlerV4, Request4};
use crate::lease::{now_epoch_secs, ClientKey, LeaseRecord, LeaseStore};

pub struct RangeHandlerState {
    allocator: Ipv4RangeAllocator,
    store: LeaseStore,
    lease_time: Duration,
}

impl RangeHandlerState {
    fn client_key(mac: &[u8]) -> ClientKey {
        let mut key = [0u8; 6];
        let n = mac.len().min(6);
        key[..n].copy_from_slice(&mac[..n]);
        ClientKey::from_mac(key)
    }

    /// Look up or create a lease for `mac`, extending its expiry if
    /// needed. Never shortens `expiry`.
    fn lease_for(&self, mac: &[u8]) -> Result<std::net::Ipv4Addr, crate::error::AllocationError> {
        let key = Self::client_key(mac);
        let now = now_epoch_secs();
        let candidate_expiry = now + self.lease_time.as_secs();

        if let Some(mut record) = self.store.get(&key) {
            if record.expiry < candidate_expiry {
                record.extend_expiry(candidate_expiry);
                if let Err(e) = self.store.upsert(key.clone(), record.clone()) {
                    warn!(error = %e, client = %key, "failed to persist lease extension");
                }
            }
            return record
                .address
                .parse()
                .map_err(|_| crate::error::AllocationError::OutOfRange(record.address.clone()));
        }

        let ip = self.allocator.allocate(None)?;
        let record = LeaseRecord::new(ip.to_string(), candidate_expiry, None);
        if let Err(e) = self.store.upsert(key, record) {
            warn!(error = %e, %ip, "failed to persist new lease");
        }
        Ok(ip)
    }
}

/// Setup for the v4 `range` handler. Args: `filename, start, end, duration`.
/// Duration accepts unit suffixes `s`/`m`/`h` (bare numbers are seconds).
pub fn setup(args: &[String]) -> Result<HandlerV4, ConfigError> {
    if args.len() != 4 {
        return Err(ConfigError::ArgCount {
            handler: "range",
            expected: "4 (filename, start, end, duration)",
            got: args.len(),
        });
    }
    let filename = &args[0];
    let start: std::net::Ipv4Addr = args[1].parse().map_err(|e| ConfigError::InvalidArg {
        handler: "range",
        arg: args[1].clone(),
        reason: format!("{e}"),
    })?;
    let end: std::net::Ipv4Addr = args[2].parse().map_err(|e| ConfigError::InvalidArg {
        handler: "range",
        arg: args[2].clone(),
        reason: format!("{e}"),
    })?;
    let lease_time = parse_duration(&args[3]).map_err(|reason| ConfigError::InvalidArg {
        handler: "range",
        arg: args[3].clone(),
        reason,
    })?;

    let allocator = Ipv4RangeAllocator::new(start, end)
        .map_err(|e| ConfigError::InvalidPool(e.to_string()))?;
    let store = LeaseStore::new(filename);
    let existing = store
        .load()
        .map_err(|e| ConfigError::InvalidPool(format!("loading {filename}: {e}")))?;

    // Warm recovery: re-reserve every persisted lease at setup.
    for (key, record) in &existing {
        let ip: std::net::Ipv4Addr = record
            .address
            .parse()
            .map_err(|_| ConfigError::WarmRecoveryFailed {
                path: filename.clone(),
                addr: record.address.clone(),
            })?;
        let got = allocator
            .allocate(Some(ip))
            .map_err(|_| ConfigError::WarmRecoveryFailed {
                path: filename.clone(),
                addr: ip.to_string(),
            })?;
        if got != ip {
            return Err(ConfigError::WarmRecoveryFailed {
                path: filename.clone(),
                addr: ip.to_string(),
            });
        }
        let _ = key;
    }

    let state = Arc::new(RangeHandlerState {
        allocator,
        store,
        lease_time,
    });

    Ok(Box::new(move |req: &Request4, resp| apply(&state, req, resp)))
}

fn apply(
    state: &RangeHandlerState,
    req: &Request4,
    resp: Option<v4::Message>,
) -> (Option<v4::Message>, bool) {
    let Some(mut resp) = resp else {
        return (None, false);
    };

    match state.lease_for(req.message.chaddr()) {
        Ok(ip) => {
            resp.set_yiaddr(ip);
            resp.opts_mut().insert(v4::DhcpOption::AddressLeaseTime(
                state.lease_time.as_secs() as u32,
            ));
        }
        Err(e) => {
            warn!(error = %e, "v4 range handler could not assign an address, dropping");
            return (None, true);
        }
    }
    (Some(resp), false)
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if let Some(num) = s.strip_suffix('s') {
        return num.parse().map(Duration::from_secs).map_err(|e| e.to_string());
    }
    if let Some(num) = s.strip_suffix('m') {
        return num
            .parse::<u64>()
            .map(|m| Duration::from_secs(m * 60))
            .map_err(|e| e.to_string());
    }
    if let Some(num) = s.strip_suffix('h') {
        return num
            .parse::<u64>()
            .map(|h| Duration::from_secs(h * 3600))
            .map_err(|e| e.to_string());
    }
    s.parse().map(Duration::from_secs).map_err(|e| e.to_string())
}
