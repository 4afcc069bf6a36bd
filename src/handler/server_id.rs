//! ServerID handler: enforces RFC 8415 §16 (v6) and RFC 2131 (v4) discard
//! rules, and stamps the configured identifier onto outgoing responses.

use std::net::Ipv4Addr;

use dhcproto::v4;
use dhcproto::v6;
use tracing::{debug, trace};

use crate::error::ConfigError;
use crate::handler::{HandlerV4, HandlerV6, Request4, Request6};

/// v6 DUID variants this handler accepts. EN/UUID/opaque are rejected at
/// setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuidVariant {
    LinkLayer,
    LinkLayerPlusTime,
}

/// Build a DUID-LL or DUID-LLT byte sequence for an Ethernet (hw type 1)
/// MAC, per RFC 8415 §11.
fn build_duid(variant: DuidVariant, mac: [u8; 6], llt_time: u32) -> v6::Duid {
    let mut bytes = Vec::with_capacity(14);
    match variant {
        DuidVariant::LinkLayer => {
            bytes.extend_from_slice(&3u16.to_be_bytes()); // DUID-LL type
            bytes.extend_from_slice(&1u16.to_be_bytes()); // hardware type: ethernet
        }
        DuidVariant::LinkLayerPlusTime => {
            bytes.extend_from_slice(&1u16.to_be_bytes()); // DUID-LLT type
            bytes.extend_from_slice(&1u16.to_be_bytes());
            bytes.extend_from_slice(&llt_time.to_be_bytes());
        }
    }
    bytes.extend_from_slice(&mac);
    v6::Duid::from(bytes)
}

/// Setup for the v4 `server_id` handler. Argument: a single IPv4 literal.
pub fn setup_v4(args: &[String]) -> Result<HandlerV4, ConfigError> {
    if args.len() != 1 {
        return Err(ConfigError::ArgCount {
            handler: "server_id",
            expected: "1 (IPv4 literal)",
            got: args.len(),
        });
    }
    let id: Ipv4Addr = args[0]
        .parse()
        .map_err(|e| ConfigError::InvalidArg {
            handler: "server_id",
            arg: args[0].clone(),
            reason: format!("{e}"),
        })?;

    Ok(Box::new(move |req: &Request4, resp| {
        apply_v4(id, req, resp)
    }))
}

fn apply_v4(
    id: Ipv4Addr,
    req: &Request4,
    resp: Option<v4::Message>,
) -> (Option<v4::Message>, bool) {
    let siaddr = req.message.siaddr();
    if !siaddr.is_unspecified() && siaddr != id {
        debug!(%siaddr, configured = %id, "v4 server-id mismatch, dropping");
        return (None, true);
    }

    let Some(mut resp) = resp else {
        return (None, true);
    };
    resp.set_siaddr(id);
    resp.opts_mut()
        .insert(v4::DhcpOption::ServerIdentifier(id));
    (Some(resp), false)
}

/// Setup for the v6 `server_id` handler. Arguments: `[LL|LLT, MAC]`.
pub fn setup_v6(args: &[String]) -> Result<HandlerV6, ConfigError> {
    if args.len() != 2 {
        return Err(ConfigError::ArgCount {
            handler: "server_id",
            expected: "2 (LL|LLT, MAC)",
            got: args.len(),
        });
    }
    let variant = match args[0].to_ascii_uppercase().as_str() {
        "LL" => DuidVariant::LinkLayer,
        "LLT" => DuidVariant::LinkLayerPlusTime,
        other => return Err(ConfigError::UnsupportedDuidVariant(other.to_string())),
    };
    let mac = parse_mac(&args[1]).map_err(|reason| ConfigError::InvalidArg {
        handler: "server_id",
        arg: args[1].clone(),
        reason,
    })?;
    let duid = build_duid(variant, mac, 0);

    Ok(Box::new(move |req: &Request6, resp| {
        apply_v6(&duid, req, resp)
    }))
}

fn parse_mac(s: &str) -> Result<[u8; 6], String> {
    let mut out = [0u8; 6];
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 6 {
        return Err(format!("expected 6 colon-separated octets, got {}", parts.len()));
    }
    for (i, p) in parts.iter().enumerate() {
        out[i] = u8::from_str_radix(p, 16).map_err(|e| e.to_string())?;
    }
    Ok(out)
}

fn apply_v6(
    ours: &v6::Duid,
    req: &Request6,
    resp: Option<v6::Message>,
) -> (Option<v6::Message>, bool) {
    use v6::{DhcpOption, MessageType, OptionCode};

    let requested = req
        .outer
        .opts()
        .get(OptionCode::ServerId)
        .and_then(|o| match o {
            DhcpOption::ServerId(id) => Some(id.clone()),
            _ => None,
        });

    let matches = requested.as_ref() == Some(ours);

    let should_stamp = match req.inner_type {
        MessageType::Solicit | MessageType::Confirm | MessageType::Rebind => {
            // RFC 8415 §16.2/§16.5/§16.7: these MUST NOT carry a server-id;
            // drop regardless of whether it matches.
            if requested.is_some() {
                trace!(ty = ?req.inner_type, "server-id present on solicit/confirm/rebind, dropping");
                return (None, true);
            }
            true
        }
        MessageType::Request
        | MessageType::Renew
        | MessageType::Decline
        | MessageType::Release => {
            if requested.is_none() {
                trace!(ty = ?req.inner_type, "server-id required but absent, dropping");
                return (None, true);
            }
            if !matches {
                trace!(ty = ?req.inner_type, "server-id mismatch, dropping");
                return (None, true);
            }
            true
        }
        _ => {
            if requested.is_some() && !matches {
                trace!(ty = ?req.inner_type, "server-id mismatch on other message type, dropping");
                return (None, true);
            }
            true
        }
    };

    let Some(mut resp) = resp else {
        return (None, true);
    };
    if should_stamp {
        resp.opts_mut()
            .insert(DhcpOption::ServerId(ours.clone()));
    }
    (Some(resp), false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn v4_req(siaddr: Ipv4Addr) -> Request4 {
        let mut msg = v4::Message::new(
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            &[0, 1, 2, 3, 4, 5],
        );
        msg.set_siaddr(siaddr);
        Request4 {
            message: msg,
            peer: SocketAddr::from(([127, 0, 0, 1], 68)),
            interface: None,
        }
    }

    fn v4_skeleton() -> v4::Message {
        v4::Message::new(
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            &[0, 1, 2, 3, 4, 5],
        )
    }

    #[test]
    fn v4_zero_siaddr_passes_gate() {
        let handler = setup_v4(&["192.0.2.1".to_string()]).unwrap();
        let req = v4_req(Ipv4Addr::UNSPECIFIED);
        let (resp, stop) = handler(&req, Some(v4_skeleton()));
        assert!(!stop);
        assert!(resp.is_some());
    }

    #[test]
    fn v4_mismatched_siaddr_drops() {
        let handler = setup_v4(&["192.0.2.1".to_string()]).unwrap();
        let req = v4_req(Ipv4Addr::new(10, 0, 0, 1));
        let (resp, stop) = handler(&req, Some(v4_skeleton()));
        assert!(stop);
        assert!(resp.is_none());
    }

    #[test]
    fn v4_stamps_siaddr_and_option_54() {
        let id = Ipv4Addr::new(192, 0, 2, 1);
        let handler = setup_v4(&[id.to_string()]).unwrap();
        let req = v4_req(Ipv4Addr::UNSPECIFIED);
        let (resp, _stop) = handler(&req, Some(v4_skeleton()));
        let resp = resp.unwrap();
        assert_eq!(resp.siaddr(), id);
        assert_eq!(
            resp.opts().get(v4::OptionCode::ServerIdentifier),
            Some(&v4::DhcpOption::ServerIdentifier(id))
        );
    }

    fn v6_req(inner_type: v6::MessageType, with_server_id: Option<v6::Duid>) -> Request6 {
        let mut outer = match inner_type {
            v6::MessageType::Solicit => v6::Message::Solicit(v6::Solicit::new()),
            v6::MessageType::Request => v6::Message::Request(v6::Request::new()),
            _ => v6::Message::Solicit(v6::Solicit::new()),
        };
        if let Some(id) = with_server_id {
            match &mut outer {
                v6::Message::Solicit(m) => {
                    m.opts_mut().insert(v6::DhcpOption::ServerId(id));
                }
                v6::Message::Request(m) => {
                    m.opts_mut().insert(v6::DhcpOption::ServerId(id));
                }
                _ => {}
            }
        }
        Request6 {
            outer,
            inner_type,
            peer: SocketAddr::new(
                std::net::Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1).into(),
                546,
            ),
            interface: None,
        }
    }

    #[test]
    fn v6_solicit_without_server_id_stamps_response() {
        let handler = setup_v6(&["LL".into(), "aa:bb:cc:dd:ee:ff".into()]).unwrap();
        let req = v6_req(v6::MessageType::Solicit, None);
        let skeleton = v6::Message::Advertise(v6::Advertise::new());
        let (resp, stop) = handler(&req, Some(skeleton));
        assert!(!stop);
        let resp = resp.unwrap();
        let expected = build_duid(DuidVariant::LinkLayer, [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff], 0);
        assert_eq!(
            resp.opts().get(v6::OptionCode::ServerId),
            Some(&v6::DhcpOption::ServerId(expected))
        );
    }

    #[test]
    fn v6_solicit_with_server_id_always_drops() {
        // RFC 8415 §16.2: even a *matching* server-id on SOLICIT is a drop.
        let handler = setup_v6(&["LL".into(), "aa:bb:cc:dd:ee:ff".into()]).unwrap();
        let duid = build_duid(DuidVariant::LinkLayer, [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff], 0);
        let req = v6_req(v6::MessageType::Solicit, Some(duid));
        let skeleton = v6::Message::Advertise(v6::Advertise::new());
        let (resp, stop) = handler(&req, Some(skeleton));
        assert!(stop);
        assert!(resp.is_none());
    }

    #[test]
    fn v6_request_without_server_id_drops() {
        let handler = setup_v6(&["LL".into(), "aa:bb:cc:dd:ee:ff".into()]).unwrap();
        let req = v6_req(v6::MessageType::Request, None);
        let skeleton = v6::Message::Reply(v6::Reply::new());
        let (resp, stop) = handler(&req, Some(skeleton));
        assert!(stop);
        assert!(resp.is_none());
    }
}
