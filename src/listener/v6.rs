//! DHCPv6 listener: one UDP socket per configured address, joining the
//! `ff02::1:2` relay/server multicast group when the listen address itself
//! is multicast, dispatching each datagram to `protocol::v6`.

use std::net::{Ipv6Addr, SocketAddr};
use std::sync::Arc;

use dhcproto::{Encodable, Encoder};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::error::SocketError;
use crate::handler::HandlerChain6;
use crate::listener::ListenAddr;
use crate::protocol::v6 as front;

const ALL_DHCP_RELAY_AGENTS_AND_SERVERS: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 1, 2);

fn bind_err(addr: &ListenAddr, source: std::io::Error) -> SocketError {
    SocketError::Bind {
        addr: format!("{}:{}", addr.ip, addr.port),
        source,
    }
}

/// Reads `/sys/class/net/{name}/ifindex`, the portable-enough way to turn
/// an interface name into the index `join_multicast_v6`/`bind_device`
/// expect on Linux.
fn interface_index(name: &str) -> Option<u32> {
    let path = format!("/sys/class/net/{name}/ifindex");
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

pub fn bind(addr: &ListenAddr) -> Result<UdpSocket, SocketError> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| bind_err(addr, e))?;
    socket.set_reuse_address(true).map_err(|e| bind_err(addr, e))?;
    #[cfg(unix)]
    socket.set_reuse_port(true).map_err(|e| bind_err(addr, e))?;
    socket.set_nonblocking(true).map_err(|e| bind_err(addr, e))?;

    let bind_addr = SocketAddr::new(addr.ip, addr.port);
    socket
        .bind(&bind_addr.into())
        .map_err(|e| bind_err(addr, e))?;

    if let Some(iface) = &addr.interface {
        socket
            .bind_device(Some(iface.as_bytes()))
            .map_err(|e| SocketError::BindDevice {
                iface: iface.clone(),
                source: e,
            })?;
    }

    if let SocketAddr::V6(v6) = bind_addr {
        if v6.ip().is_multicast() {
            let if_index = addr
                .interface
                .as_deref()
                .and_then(interface_index)
                .unwrap_or(0);
            socket
                .join_multicast_v6(&ALL_DHCP_RELAY_AGENTS_AND_SERVERS, if_index)
                .map_err(|e| SocketError::JoinMulticast {
                    group: ALL_DHCP_RELAY_AGENTS_AND_SERVERS,
                    iface: if_index,
                    source: e,
                })?;
        }
    }

    UdpSocket::from_std(socket.into()).map_err(|e| bind_err(addr, e))
}

pub async fn serve(
    label: String,
    socket: UdpSocket,
    chain: Arc<HandlerChain6>,
    mut shutdown: watch::Receiver<bool>,
    errors: mpsc::Sender<(String, SocketError)>,
) {
    let socket = Arc::new(socket);
    let mut buf = vec![0u8; 65536];
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                debug!(%label, "listener closing");
                return;
            }
            res = socket.recv_from(&mut buf) => {
                match res {
                    Ok((len, peer)) => {
                        let bytes = buf[..len].to_vec();
                        let chain = chain.clone();
                        let socket = socket.clone();
                        tokio::spawn(async move {
                            dispatch(&chain, &bytes, peer, &socket).await;
                        });
                    }
                    Err(e) => {
                        let _ = errors.send((label.clone(), SocketError::Recv(e))).await;
                        return;
                    }
                }
            }
        }
    }
}

async fn dispatch(chain: &HandlerChain6, bytes: &[u8], peer: SocketAddr, socket: &UdpSocket) {
    let Some((resp, transmit)) = front::handle(chain, bytes, peer, None) else {
        return;
    };

    let mut out = Vec::new();
    if let Err(e) = resp.encode(&mut Encoder::new(&mut out)) {
        warn!(error = %e, "failed to encode v6 reply");
        return;
    }

    // Directing the write to the receive interface (rather than letting
    // the routing table pick one) matters for link-local peers; absent a
    // per-socket control-message API for that here, the bound interface
    // already scopes this socket to the right link.
    let _ = transmit.direct_to_receive_interface;

    if let Err(e) = socket.send_to(&out, transmit.target).await {
        warn!(target = %transmit.target, error = %e, "v6 reply send failed");
    }
}
