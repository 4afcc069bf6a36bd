//! DHCPv6 protocol front-end: parse, decapsulate nested relay-forward
//! envelopes, build a reply skeleton from the inner message type, run the
//! handler chain, then re-encapsulate and resolve the peer.

use std::net::{Ipv6Addr, SocketAddr};

use dhcproto::{v6, Decodable, Decoder, Encodable, Encoder};
use tracing::{debug, trace};

use crate::handler::{HandlerChain6, Request6};

/// Bound relay-forward nesting depth to prevent pathological recursion.
pub const MAX_RELAY_HOPS: u32 = 32;

/// One level of relay-forward envelope, captured on the way in so the
/// reply can mirror it exactly on the way back out.
struct RelayHop {
    hop_count: u8,
    link_address: Ipv6Addr,
    peer_address: Ipv6Addr,
}

/// Whether the listener should direct the outbound write to the interface
/// the datagram arrived on: link-local peers need this because there's no
/// other way to pick the right link.
pub struct Transmit6 {
    pub target: SocketAddr,
    pub direct_to_receive_interface: bool,
}

/// Parse `bytes`, decapsulate any relay chain, run the inner message
/// through `chain`, re-encapsulate if needed, and resolve the reply
/// target. Returns `None` to mean "drop silently".
pub fn handle(
    chain: &HandlerChain6,
    bytes: &[u8],
    peer: SocketAddr,
    interface: Option<ipnet::Ipv6Net>,
) -> Option<(v6::Message, Transmit6)> {
    let outer = match v6::Message::decode(&mut Decoder::new(bytes)) {
        Ok(m) => m,
        Err(e) => {
            debug!(error = %e, "failed to decode DHCPv6 message, dropping");
            return None;
        }
    };

    let (hops, inner) = decapsulate(&outer)?;
    let inner_type = inner.msg_type();

    let skeleton = build_skeleton(&inner)?;

    let req = Request6 {
        outer,
        inner_type,
        peer,
        interface,
    };

    let resp = chain.invoke(&req, skeleton)?;
    let wrapped = reencapsulate(resp, &hops);

    let transmit = Transmit6 {
        target: peer,
        direct_to_receive_interface: is_link_local_unicast(peer.ip()),
    };
    Some((wrapped, transmit))
}

fn is_link_local_unicast(ip: std::net::IpAddr) -> bool {
    match ip {
        std::net::IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
        std::net::IpAddr::V4(_) => false,
    }
}

/// Walk nested `RelayForw` envelopes down to the first non-relay message,
/// collecting each hop outermost-first. `None` on a chain deeper than
/// `MAX_RELAY_HOPS` or a relay envelope missing its `RelayMsg` payload.
fn decapsulate(outer: &v6::Message) -> Option<(Vec<RelayHop>, v6::Message)> {
    let mut hops = Vec::new();
    let mut current = outer.clone();
    loop {
        match current {
            v6::Message::RelayForw(rf) => {
                if hops.len() as u32 >= MAX_RELAY_HOPS {
                    trace!("relay-forward chain exceeded max hops, dropping");
                    return None;
                }
                hops.push(RelayHop {
                    hop_count: rf.hop_count,
                    link_address: rf.link_address,
                    peer_address: rf.peer_address,
                });
                let inner_bytes = match rf.opts().get(v6::OptionCode::RelayMsg) {
                    Some(v6::DhcpOption::RelayMsg(relay_msg)) => relay_msg.data().to_vec(),
                    _ => {
                        trace!("relay-forward envelope missing relay-message option, dropping");
                        return None;
                    }
                };
                current = v6::Message::decode(&mut Decoder::new(&inner_bytes)).ok()?;
            }
            other => return Some((hops, other)),
        }
    }
}

/// Reverses `decapsulate`: wraps `resp` in a `RelayRepl` per collected hop,
/// innermost first, mirroring hop count and address fields exactly.
fn reencapsulate(resp: v6::Message, hops: &[RelayHop]) -> v6::Message {
    let mut current = resp;
    for hop in hops.iter().rev() {
        let mut buf = Vec::new();
        current
            .encode(&mut Encoder::new(&mut buf))
            .expect("encoding an already-built v6 message cannot fail");
        let mut opts = v6::DhcpOptions::default();
        opts.insert(v6::DhcpOption::RelayMsg(v6::RelayMsg::new(buf)));
        current = v6::Message::RelayRepl(v6::RelayRepl {
            hop_count: hop.hop_count,
            link_address: hop.link_address,
            peer_address: hop.peer_address,
            opts,
        });
    }
    current
}

fn inner_xid(inner: &v6::Message) -> Option<v6::TransactionId> {
    use v6::Message::*;
    match inner {
        Solicit(m) => Some(m.xid),
        Request(m) => Some(m.xid),
        Confirm(m) => Some(m.xid),
        Renew(m) => Some(m.xid),
        Rebind(m) => Some(m.xid),
        Release(m) => Some(m.xid),
        Decline(m) => Some(m.xid),
        InformationRequest(m) => Some(m.xid),
        Reply(m) => Some(m.xid),
        Advertise(m) => Some(m.xid),
        _ => None,
    }
}

/// Decline is folded into the Request/Renew/Release group here: the
/// ServerID handler's discard table requires a reply skeleton to exist for
/// DECLINE too, so dropping it earlier would make that row unreachable.
fn build_skeleton(inner: &v6::Message) -> Option<v6::Message> {
    use v6::{Message, OptionCode};

    let xid = inner_xid(inner)?;
    let mut skeleton = match inner {
        Message::Solicit(_) => {
            let rapid_commit = inner.opts().get(OptionCode::RapidCommit).is_some();
            if rapid_commit {
                Message::Reply(v6::Reply::new_with_xid(xid))
            } else {
                Message::Advertise(v6::Advertise::new_with_xid(xid))
            }
        }
        Message::Request(_)
        | Message::Confirm(_)
        | Message::Renew(_)
        | Message::Rebind(_)
        | Message::Release(_)
        | Message::Decline(_)
        | Message::InformationRequest(_) => Message::Reply(v6::Reply::new_with_xid(xid)),
        _ => {
            trace!(ty = ?inner.msg_type(), "v6 message type has no reply-skeleton mapping, dropping");
            return None;
        }
    };
    copy_client_identifier(inner, &mut skeleton);
    Some(skeleton)
}

/// RFC 8415 §18.3.9: a reply must echo the client's DUID (option ClientId)
/// verbatim.
fn copy_client_identifier(inner: &v6::Message, skeleton: &mut v6::Message) {
    if let Some(opt @ v6::DhcpOption::ClientId(_)) = inner.opts().get(v6::OptionCode::ClientId) {
        skeleton.opts_mut().insert(opt.clone());
    }
}
