//! Listener subsystem: one task per configured listen address, each owning
//! a socket, optional interface binding, and (v6) multicast membership.
//! `Servers` is the collection of live listeners plus the terminal-error
//! channel every one of them reports on exactly once.

pub mod raw4;
pub mod v4;
pub mod v6;

use std::net::IpAddr;
use std::sync::Arc;

use ipnet::Ipv4Net;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::info;

use crate::error::SocketError;
use crate::handler::{HandlerChain4, HandlerChain6};

/// One configured listen endpoint.
#[derive(Debug, Clone)]
pub struct ListenAddr {
    pub ip: IpAddr,
    pub port: u16,
    pub interface: Option<String>,
    /// v4 only: the interface's own address and prefix, used both to
    /// populate `Request4::interface` and to pick a source address for the
    /// raw L2 send path.
    pub network: Option<Ipv4Net>,
}

/// The full set of live listeners started from a `Config`. Lifecycle:
/// `start` binds every socket up front (any bind failure aborts the whole
/// call); `wait` reports the first terminal error; `close` is idempotent
/// and safe to call while `wait` is pending.
pub struct Servers {
    tasks: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
    errors: mpsc::Receiver<(String, SocketError)>,
}

impl Servers {
    pub async fn start(
        v4_listen: Vec<ListenAddr>,
        v6_listen: Vec<ListenAddr>,
        chain4: Arc<HandlerChain4>,
        chain6: Arc<HandlerChain6>,
    ) -> Result<Self, SocketError> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let channel_capacity = (v4_listen.len() + v6_listen.len()).max(1);
        let (error_tx, error_rx) = mpsc::channel(channel_capacity);

        let mut tasks = Vec::with_capacity(v4_listen.len() + v6_listen.len());

        for addr in v4_listen {
            let label = format!("dhcpv4 {}:{}", addr.ip, addr.port);
            let socket = v4::bind(&addr)?;
            let raw = match &addr.interface {
                Some(iface) => {
                    let addresses = addr.network.into_iter().collect::<Vec<_>>();
                    match raw4::RawSender::new(iface, addresses) {
                        Ok(sender) => Some(Arc::new(sender)),
                        Err(e) => {
                            info!(%label, error = %e, "raw L2 send unavailable, will broadcast instead");
                            None
                        }
                    }
                }
                None => None,
            };
            let task = tokio::spawn(v4::serve(
                label,
                socket,
                chain4.clone(),
                raw,
                shutdown_rx.clone(),
                error_tx.clone(),
            ));
            tasks.push(task);
        }

        for addr in v6_listen {
            let label = format!("dhcpv6 {}:{}", addr.ip, addr.port);
            let socket = v6::bind(&addr)?;
            let task = tokio::spawn(v6::serve(
                label,
                socket,
                chain6.clone(),
                shutdown_rx.clone(),
                error_tx.clone(),
            ));
            tasks.push(task);
        }

        Ok(Self {
            tasks,
            shutdown: shutdown_tx,
            errors: error_rx,
        })
    }

    /// Waits for the first terminal error reported by any listener. Returns
    /// `None` once every listener has shut down cleanly and the error
    /// channel has closed.
    pub async fn wait(&mut self) -> Option<(String, SocketError)> {
        self.errors.recv().await
    }

    /// Signals every receive loop to stop. Idempotent; safe to call
    /// concurrently with `wait`.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Waits for every listener task to finish after `close`.
    pub async fn join(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }
}
