//! DHCPv4 protocol front-end: parse the datagram, validate the BOOTP
//! opcode, build a reply skeleton from the message type, run the handler
//! chain, then resolve where the listener should send the result.

use std::net::{Ipv4Addr, SocketAddr};

use dhcproto::{v4, Decodable, Decoder};
use tracing::{debug, trace};

use crate::handler::{HandlerChain4, Request4};

/// Where `Listener` should deliver the reply.
pub enum Transmit4 {
    Unicast(SocketAddr),
    Broadcast,
    /// No usable IP destination: the listener's raw L2 send path unicasts
    /// to the client's hardware address carrying `yiaddr`, falling back to
    /// broadcast if the raw socket is unavailable.
    Raw {
        yiaddr: Ipv4Addr,
        htype: v4::HType,
        chaddr: Vec<u8>,
    },
}

/// Header fields needed to pick a transmit path, captured before `message`
/// is moved into the `Request4` the handler chain observes.
struct TransmitSrc {
    giaddr: Ipv4Addr,
    ciaddr: Ipv4Addr,
    broadcast: bool,
    htype: v4::HType,
    chaddr: Vec<u8>,
}

impl TransmitSrc {
    fn capture(msg: &v4::Message) -> Self {
        Self {
            giaddr: msg.giaddr(),
            ciaddr: msg.ciaddr(),
            broadcast: msg.flags().broadcast(),
            htype: msg.htype(),
            chaddr: msg.chaddr().to_vec(),
        }
    }
}

/// Parse `bytes`, run the result through `chain`, and resolve a transmit
/// target. Returns `None` whenever the exchange must be dropped silently
/// (parse failure, wrong opcode, unmapped message type, or a handler
/// returning the null-response drop sentinel).
pub fn handle(
    chain: &HandlerChain4,
    bytes: &[u8],
    peer: SocketAddr,
    interface: Option<ipnet::Ipv4Net>,
) -> Option<(v4::Message, Transmit4)> {
    let message = match v4::Message::decode(&mut Decoder::new(bytes)) {
        Ok(m) => m,
        Err(e) => {
            debug!(error = %e, "failed to decode DHCPv4 message, dropping");
            return None;
        }
    };

    if message.opcode() != v4::Opcode::BootRequest {
        trace!(opcode = ?message.opcode(), "not a BOOTREQUEST, dropping");
        return None;
    }

    let msg_type = message.opts().iter().find_map(|(_, opt)| match opt {
        v4::DhcpOption::MessageType(mt) => Some(*mt),
        _ => None,
    });

    let reply_type = match msg_type {
        Some(v4::MessageType::Discover) => v4::MessageType::Offer,
        Some(v4::MessageType::Request) => v4::MessageType::Ack,
        other => {
            trace!(?other, "message type has no reply-skeleton mapping, dropping");
            return None;
        }
    };

    let skeleton = build_skeleton(&message, reply_type);
    let src = TransmitSrc::capture(&message);

    let req = Request4 {
        message,
        peer,
        interface,
    };

    let resp = chain.invoke(&req, skeleton)?;
    let transmit = choose_transmit(&src, &resp);
    Some((resp, transmit))
}

fn build_skeleton(req: &v4::Message, reply_type: v4::MessageType) -> v4::Message {
    let mut reply = v4::Message::new_with_id(
        req.xid(),
        Ipv4Addr::UNSPECIFIED,
        Ipv4Addr::UNSPECIFIED,
        Ipv4Addr::UNSPECIFIED,
        req.giaddr(),
        req.chaddr(),
    );
    reply.set_opcode(v4::Opcode::BootReply);
    reply.set_htype(req.htype());
    reply.set_secs(0);
    reply.set_flags(req.flags());
    reply
        .opts_mut()
        .insert(v4::DhcpOption::MessageType(reply_type));
    copy_client_identifier(req, &mut reply);
    reply
}

/// RFC 6842 §3: a reply must echo the client-identifier option verbatim
/// when the request carried one.
fn copy_client_identifier(req: &v4::Message, reply: &mut v4::Message) {
    if let Some(opt @ v4::DhcpOption::ClientIdentifier(_)) =
        req.opts().get(v4::OptionCode::ClientIdentifier)
    {
        reply.opts_mut().insert(opt.clone());
    }
}

/// Priority order: relay agent (giaddr), then NAK-always-broadcasts, then
/// the client's claimed address (ciaddr), then the broadcast flag, then
/// the L2 raw fallback.
fn choose_transmit(src: &TransmitSrc, resp: &v4::Message) -> Transmit4 {
    if !src.giaddr.is_unspecified() {
        return Transmit4::Unicast(SocketAddr::from((src.giaddr, v4::SERVER_PORT)));
    }

    let is_nak = matches!(
        resp.opts().get(v4::OptionCode::MessageType),
        Some(v4::DhcpOption::MessageType(v4::MessageType::Nak))
    );
    if is_nak {
        return Transmit4::Broadcast;
    }

    if !src.ciaddr.is_unspecified() {
        return Transmit4::Unicast(SocketAddr::from((src.ciaddr, v4::CLIENT_PORT)));
    }

    if src.broadcast {
        return Transmit4::Broadcast;
    }

    Transmit4::Raw {
        yiaddr: resp.yiaddr(),
        htype: src.htype,
        chaddr: src.chaddr.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerChain4;
    use dhcproto::Encodable;

    fn discover_bytes(chaddr: &[u8; 6]) -> Vec<u8> {
        let mut msg = v4::Message::new(
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            chaddr,
        );
        msg.set_opcode(v4::Opcode::BootRequest);
        msg.opts_mut()
            .insert(v4::DhcpOption::MessageType(v4::MessageType::Discover));
        let mut buf = Vec::new();
        msg.encode(&mut dhcproto::Encoder::new(&mut buf)).unwrap();
        buf
    }

    #[test]
    fn bootreply_opcode_is_dropped() {
        let mut msg = v4::Message::new(
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            &[0, 1, 2, 3, 4, 5],
        );
        msg.set_opcode(v4::Opcode::BootReply);
        let mut buf = Vec::new();
        msg.encode(&mut dhcproto::Encoder::new(&mut buf)).unwrap();

        let chain = HandlerChain4::new(vec![]);
        let peer = SocketAddr::from(([127, 0, 0, 1], 68));
        assert!(handle(&chain, &buf, peer, None).is_none());
    }

    #[test]
    fn discover_without_broadcast_and_no_yiaddr_falls_back_to_raw() {
        let chain = HandlerChain4::new(vec![]);
        let bytes = discover_bytes(&[9, 8, 7, 6, 5, 4]);
        let peer = SocketAddr::from(([127, 0, 0, 1], 68));
        let (_, transmit) = handle(&chain, &bytes, peer, None).unwrap();
        assert!(matches!(transmit, Transmit4::Raw { .. }));
    }
}
