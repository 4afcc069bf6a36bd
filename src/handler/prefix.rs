//! PrefixHandler (v6): stateful delegated-prefix management on top of the
//! IPv6 prefix allocator and a persistent lease store.
//!
//! Each IA_PD can carry more than one IA_Prefix hint — one to renew, one to
//! additionally allocate, and so on — so every hint gets its own lease slot
//! keyed by `(client DUID, IAID, position of the hint within the IA_PD)`.
//! Each slot is reconciled independently against three tiers: a hint whose
//! address exactly matches that slot's existing lease renews it outright;
//! failing that, a hint whose prefix length merely matches renews the
//! existing lease anyway (the client is free to re-propose the address);
//! failing that, or when there's no hint at all, a fresh prefix is
//! allocated for the slot. A client proposing two hints in one IA_PD can
//! therefore get one renewed and the other freshly allocated in the same
//! reply, each as its own IA_Prefix.

use std::time::Duration;

use dhcproto::v6;
use ipnet::Ipv6Net;
use tracing::warn;

use crate::allocator::Ipv6PrefixAllocator;
use crate::error::ConfigError;
use crate::handler::{HandlerV6, Request6};
use crate::lease::{now_epoch_secs, ClientKey, LeaseRecord, LeaseStore};

/// Minimum lease duration absent explicit configuration.
pub const DEFAULT_MIN_LEASE_SECS: u64 = 3600;

pub struct PrefixHandlerState {
    allocator: Ipv6PrefixAllocator,
    store: LeaseStore,
    min_lease: Duration,
}

impl PrefixHandlerState {
    fn key(duid: &[u8], iaid: u32, slot: u32) -> ClientKey {
        let mut bytes = duid.to_vec();
        bytes.extend_from_slice(&iaid.to_be_bytes());
        bytes.extend_from_slice(&slot.to_be_bytes());
        ClientKey(bytes)
    }

    /// Reconciles one hint slot within an IA_PD against its own persisted
    /// lease: exact-address match renews, length-only match renews anyway,
    /// otherwise (or with no hint at all) a fresh prefix is allocated.
    fn reconcile_one(
        &self,
        duid: &[u8],
        iaid: u32,
        slot: u32,
        hint: Option<Ipv6Net>,
    ) -> Option<(Ipv6Net, u64)> {
        let key = Self::key(duid, iaid, slot);
        let now = now_epoch_secs();
        let candidate_expiry = now + self.min_lease.as_secs();

        if let Some(existing) = self.store.get(&key) {
            if let Ok(existing_net) = existing.address.parse::<Ipv6Net>() {
                let exact_match = hint == Some(existing_net);
                let length_only_match = match hint {
                    None => true,
                    Some(h) => h.prefix_len() == existing_net.prefix_len(),
                };
                if exact_match || length_only_match {
                    let mut record = existing;
                    record.extend_expiry(candidate_expiry);
                    if let Err(e) = self.store.upsert(key, record.clone()) {
                        warn!(error = %e, "failed to persist prefix lease renewal");
                    }
                    return Some((existing_net, record.expiry));
                }
            }
        }

        match self.allocator.allocate(hint.map(|h| h.addr())) {
            Ok(net) => {
                let record = LeaseRecord::new(net.to_string(), candidate_expiry, None);
                if let Err(e) = self.store.upsert(key, record) {
                    warn!(error = %e, %net, "failed to persist new prefix lease");
                }
                Some((net, candidate_expiry))
            }
            Err(e) => {
                warn!(error = %e, "no prefix available for delegation");
                None
            }
        }
    }
}

/// Setup for the v6 `prefix` handler. Args: `containing-CIDR, allocation-length`.
pub fn setup(args: &[String]) -> Result<HandlerV6, ConfigError> {
    if args.len() != 2 {
        return Err(ConfigError::ArgCount {
            handler: "prefix",
            expected: "2 (containing-CIDR, allocation-length)",
            got: args.len(),
        });
    }
    let containing: Ipv6Net = args[0].parse().map_err(|e| ConfigError::InvalidArg {
        handler: "prefix",
        arg: args[0].clone(),
        reason: format!("{e}"),
    })?;
    let page: u8 = args[1].parse().map_err(|e| ConfigError::InvalidArg {
        handler: "prefix",
        arg: args[1].clone(),
        reason: format!("{e}"),
    })?;

    let allocator = Ipv6PrefixAllocator::new(containing, page)
        .map_err(|e| ConfigError::InvalidPool(e.to_string()))?;
    let store = LeaseStore::new(format!("{}-leases.json", args[0].replace(['/', ':'], "_")));
    let existing = store
        .load()
        .map_err(|e| ConfigError::InvalidPool(format!("loading lease store: {e}")))?;

    for record in existing.values() {
        let net: Ipv6Net = record
            .address
            .parse()
            .map_err(|_| ConfigError::WarmRecoveryFailed {
                path: "prefix-leases".into(),
                addr: record.address.clone(),
            })?;
        let got = allocator
            .allocate(Some(net.addr()))
            .map_err(|_| ConfigError::WarmRecoveryFailed {
                path: "prefix-leases".into(),
                addr: net.to_string(),
            })?;
        if got != net {
            return Err(ConfigError::WarmRecoveryFailed {
                path: "prefix-leases".into(),
                addr: net.to_string(),
            });
        }
    }

    let state = std::sync::Arc::new(PrefixHandlerState {
        allocator,
        store,
        min_lease: Duration::from_secs(DEFAULT_MIN_LEASE_SECS),
    });

    Ok(Box::new(move |req: &Request6, resp| apply(&state, req, resp)))
}

fn duid_bytes(req: &Request6) -> Vec<u8> {
    use v6::{DhcpOption, OptionCode};
    req.outer
        .opts()
        .get(OptionCode::ClientId)
        .and_then(|o| match o {
            DhcpOption::ClientId(id) => Some(id.clone()),
            _ => None,
        })
        .map(|id| id.as_ref().to_vec())
        .unwrap_or_default()
}

fn extract_hints(iapd_opts: &v6::DhcpOptions) -> Vec<Ipv6Net> {
    use v6::DhcpOption;
    iapd_opts
        .iter()
        .filter_map(|o| match o {
            DhcpOption::IAPDPrefix(p) => Ipv6Net::new(p.prefix_ip, p.prefix_len).ok(),
            _ => None,
        })
        .collect()
}

fn apply(
    state: &PrefixHandlerState,
    req: &Request6,
    resp: Option<v6::Message>,
) -> (Option<v6::Message>, bool) {
    use v6::{DhcpOption, IAPDPrefix, Status, StatusCode};

    let Some(mut resp) = resp else {
        return (None, false);
    };

    let duid = duid_bytes(req);
    if duid.is_empty() {
        return (Some(resp), false);
    }

    // v6 `DhcpOptions` is order-preserving and may hold more than one entry
    // per code, so every IA_PD needs `iter()`, not `get()` (which returns
    // only the first match).
    let ia_pds: Vec<v6::IAPD> = req
        .outer
        .opts()
        .iter()
        .filter_map(|o| match o {
            DhcpOption::IAPD(iapd) => Some(iapd.clone()),
            _ => None,
        })
        .collect();

    let now = now_epoch_secs();

    for iapd in ia_pds {
        let hints = extract_hints(&iapd.opts);
        let mut out_opts = v6::DhcpOptions::default();

        // One slot per hint, or a single hint-less slot when the client
        // proposed nothing — each slot is reconciled (and persisted)
        // independently so multiple hints in one IA_PD can resolve to
        // different outcomes (a renewal alongside a fresh allocation).
        let slots: Vec<Option<Ipv6Net>> = if hints.is_empty() {
            vec![None]
        } else {
            hints.into_iter().map(Some).collect()
        };

        let mut assigned_any = false;
        for (slot, hint) in slots.into_iter().enumerate() {
            if let Some((net, expiry)) = state.reconcile_one(&duid, iapd.id, slot as u32, hint) {
                assigned_any = true;
                let lifetime = expiry.saturating_sub(now) as u32;
                out_opts.push(DhcpOption::IAPDPrefix(IAPDPrefix {
                    preferred_lifetime: lifetime,
                    valid_lifetime: lifetime,
                    prefix_len: net.prefix_len(),
                    prefix_ip: net.addr(),
                    opts: v6::DhcpOptions::default(),
                }));
            }
        }
        if !assigned_any {
            out_opts.push(DhcpOption::StatusCode(StatusCode {
                status: Status::NoPrefixAvail,
                msg: "no prefix available".to_string(),
            }));
        }

        // Each IA_PD in the request gets its own IA_PD in the reply, so the
        // option code repeats per IAID — push, not an upsert-by-code insert.
        resp.opts_mut().push(DhcpOption::IAPD(v6::IAPD {
            id: iapd.id,
            t1: iapd.t1,
            t2: iapd.t2,
            opts: out_opts,
        }));
    }

    (Some(resp), false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv6Addr, SocketAddr};

    fn empty_request(duid_bytes: Vec<u8>, iaid: u32) -> Request6 {
        request_with_hints(duid_bytes, iaid, &[])
    }

    fn request_with_hints(duid_bytes: Vec<u8>, iaid: u32, hints: &[Ipv6Net]) -> Request6 {
        let mut iapd_opts = v6::DhcpOptions::default();
        for hint in hints {
            iapd_opts.push(v6::DhcpOption::IAPDPrefix(v6::IAPDPrefix {
                preferred_lifetime: 0,
                valid_lifetime: 0,
                prefix_len: hint.prefix_len(),
                prefix_ip: hint.addr(),
                opts: v6::DhcpOptions::default(),
            }));
        }
        let mut solicit = v6::Solicit::new();
        solicit
            .opts_mut()
            .push(v6::DhcpOption::ClientId(v6::Duid::from(duid_bytes)));
        solicit.opts_mut().push(v6::DhcpOption::IAPD(v6::IAPD {
            id: iaid,
            t1: 0,
            t2: 0,
            opts: iapd_opts,
        }));
        Request6 {
            outer: v6::Message::Solicit(solicit),
            inner_type: v6::MessageType::Solicit,
            peer: SocketAddr::new(Ipv6Addr::LOCALHOST.into(), 546),
            interface: None,
        }
    }

    fn iapd_prefixes(resp: &v6::Message) -> Vec<v6::IAPDPrefix> {
        let iapd = match resp.opts().get(v6::OptionCode::IAPD) {
            Some(v6::DhcpOption::IAPD(i)) => i.clone(),
            _ => panic!("expected IAPD in response"),
        };
        iapd.opts
            .iter()
            .filter_map(|o| match o {
                v6::DhcpOption::IAPDPrefix(p) => Some(p.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn empty_hint_gets_one_page_length_prefix_in_pool() {
        let handler = setup(&["2001:db8::/56".into(), "64".into()]).unwrap();
        let req = empty_request(vec![1, 2, 3, 4, 5, 6, 7, 8], 1);
        let skeleton = v6::Message::Advertise(v6::Advertise::new());
        let (resp, stop) = handler(&req, Some(skeleton));
        assert!(!stop);
        let resp = resp.unwrap();
        let iapd = match resp.opts().get(v6::OptionCode::IAPD) {
            Some(v6::DhcpOption::IAPD(i)) => i.clone(),
            _ => panic!("expected IAPD in response"),
        };
        let prefix = match iapd.opts.get(v6::OptionCode::IAPDPrefix) {
            Some(v6::DhcpOption::IAPDPrefix(p)) => p.clone(),
            _ => panic!("expected IAPDPrefix in IAPD"),
        };
        assert_eq!(prefix.prefix_len, 64);
        assert_eq!(prefix.preferred_lifetime, 3600);
        let net = Ipv6Net::new(prefix.prefix_ip, prefix.prefix_len).unwrap();
        let pool: Ipv6Net = "2001:db8::/56".parse().unwrap();
        assert!(pool.contains(&net));
    }

    #[test]
    fn renew_of_existing_lease_returns_same_prefix() {
        let handler = setup(&["2001:db8::/56".into(), "64".into()]).unwrap();
        let req1 = empty_request(vec![9, 9, 9, 9, 9, 9, 9, 9], 7);
        let first = handler(&req1, Some(v6::Message::Advertise(v6::Advertise::new())))
            .0
            .unwrap();
        let first_prefix = match first.opts().get(v6::OptionCode::IAPD) {
            Some(v6::DhcpOption::IAPD(i)) => match i.opts.get(v6::OptionCode::IAPDPrefix) {
                Some(v6::DhcpOption::IAPDPrefix(p)) => p.prefix_ip,
                _ => panic!(),
            },
            _ => panic!(),
        };

        let req2 = empty_request(vec![9, 9, 9, 9, 9, 9, 9, 9], 7);
        let second = handler(&req2, Some(v6::Message::Reply(v6::Reply::new())))
            .0
            .unwrap();
        let second_prefix = match second.opts().get(v6::OptionCode::IAPD) {
            Some(v6::DhcpOption::IAPD(i)) => match i.opts.get(v6::OptionCode::IAPDPrefix) {
                Some(v6::DhcpOption::IAPDPrefix(p)) => p.prefix_ip,
                _ => panic!(),
            },
            _ => panic!(),
        };
        assert_eq!(first_prefix, second_prefix);
    }

    #[test]
    fn exhausted_pool_attaches_no_prefix_avail_status() {
        let handler = setup(&["2001:db8::/63".into(), "64".into()]).unwrap();
        // two /64s available; exhaust them first
        let _ = handler(
            &empty_request(vec![1; 8], 1),
            Some(v6::Message::Advertise(v6::Advertise::new())),
        );
        let _ = handler(
            &empty_request(vec![2; 8], 1),
            Some(v6::Message::Advertise(v6::Advertise::new())),
        );
        let (resp, _stop) = handler(
            &empty_request(vec![3; 8], 1),
            Some(v6::Message::Advertise(v6::Advertise::new())),
        );
        let resp = resp.unwrap();
        let iapd = match resp.opts().get(v6::OptionCode::IAPD) {
            Some(v6::DhcpOption::IAPD(i)) => i.clone(),
            _ => panic!("expected IAPD"),
        };
        match iapd.opts.get(v6::OptionCode::StatusCode) {
            Some(v6::DhcpOption::StatusCode(s)) => {
                assert_eq!(s.status, v6::Status::NoPrefixAvail);
            }
            _ => panic!("expected NoPrefixAvail status code"),
        }
    }

    #[test]
    fn second_hint_in_same_ia_pd_gets_its_own_independent_allocation() {
        let handler = setup(&["2001:db8::/56".into(), "64".into()]).unwrap();
        let duid = vec![4, 4, 4, 4, 4, 4, 4, 4];

        // First exchange: no hint, allocates one prefix into slot 0.
        let first_req = empty_request(duid.clone(), 1);
        let first = handler(&first_req, Some(v6::Message::Advertise(v6::Advertise::new())))
            .0
            .unwrap();
        let first_prefixes = iapd_prefixes(&first);
        assert_eq!(first_prefixes.len(), 1);
        let held = Ipv6Net::new(first_prefixes[0].prefix_ip, first_prefixes[0].prefix_len).unwrap();

        // Second exchange: the client proposes the held prefix to renew it
        // (slot 0) and a second, different hint to additionally allocate
        // (slot 1) — both in the same IA_PD.
        let second_hint: Ipv6Net = "2001:db8:0:99::/64".parse().unwrap();
        let second_req = request_with_hints(duid, 1, &[held, second_hint]);
        let second = handler(&second_req, Some(v6::Message::Reply(v6::Reply::new())))
            .0
            .unwrap();
        let second_prefixes = iapd_prefixes(&second);
        assert_eq!(second_prefixes.len(), 2);

        let renewed = Ipv6Net::new(second_prefixes[0].prefix_ip, second_prefixes[0].prefix_len).unwrap();
        let fresh = Ipv6Net::new(second_prefixes[1].prefix_ip, second_prefixes[1].prefix_len).unwrap();
        assert_eq!(renewed, held);
        assert_ne!(fresh, held);
    }
}
