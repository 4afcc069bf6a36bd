//! DHCPv4 listener: one broadcast-enabled UDP socket per configured
//! address, dispatching each datagram to `protocol::v4` in its own task.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use dhcproto::{v4, Encodable, Encoder};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::error::SocketError;
use crate::handler::HandlerChain4;
use crate::listener::raw4::RawSender;
use crate::listener::ListenAddr;
use crate::protocol::v4::{self as front, Transmit4};

fn bind_err(addr: &ListenAddr, source: std::io::Error) -> SocketError {
    SocketError::Bind {
        addr: format!("{}:{}", addr.ip, addr.port),
        source,
    }
}

pub fn bind(addr: &ListenAddr) -> Result<UdpSocket, SocketError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| bind_err(addr, e))?;
    socket.set_reuse_address(true).map_err(|e| bind_err(addr, e))?;
    socket.set_broadcast(true).map_err(|e| bind_err(addr, e))?;
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

    UdpSocket::from_std(socket.into()).map_err(|e| bind_err(addr, e))
}

pub async fn serve(
    label: String,
    socket: UdpSocket,
    chain: Arc<HandlerChain4>,
    raw: Option<Arc<RawSender>>,
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
                        let raw = raw.clone();
                        tokio::spawn(async move {
                            dispatch(&chain, &bytes, peer, &socket, raw.as_deref()).await;
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

async fn dispatch(
    chain: &HandlerChain4,
    bytes: &[u8],
    peer: SocketAddr,
    socket: &UdpSocket,
    raw: Option<&RawSender>,
) {
    let Some((resp, transmit)) = front::handle(chain, bytes, peer, None) else {
        return;
    };

    let mut out = Vec::new();
    if let Err(e) = resp.encode(&mut Encoder::new(&mut out)) {
        warn!(error = %e, "failed to encode v4 reply");
        return;
    }

    match transmit {
        Transmit4::Unicast(target) => send(socket, &out, target).await,
        Transmit4::Broadcast => {
            send(socket, &out, SocketAddr::from((Ipv4Addr::BROADCAST, v4::CLIENT_PORT))).await
        }
        Transmit4::Raw {
            yiaddr,
            htype,
            chaddr,
        } => {
            let sent = raw.is_some_and(|raw| raw.send(yiaddr, htype, &chaddr, &out));
            if !sent {
                warn!(%yiaddr, "raw L2 send unavailable, falling back to broadcast");
                send(socket, &out, SocketAddr::from((Ipv4Addr::BROADCAST, v4::CLIENT_PORT))).await;
            }
        }
    }
}

async fn send(socket: &UdpSocket, bytes: &[u8], target: SocketAddr) {
    if let Err(e) = socket.send_to(bytes, target).await {
        warn!(%target, error = %e, "v4 reply send failed");
    }
}
