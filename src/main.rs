mod allocator;
mod config;
mod error;
mod handler;
mod lease;
mod listener;
mod protocol;

use std::path::PathBuf;

use anyhow::{Context, Result};
use ipnet::Ipv4Net;
use signal_hook::consts::SIGHUP;
use signal_hook_tokio::Signals;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};

use crate::config::{Config, ServerConfig};
use crate::error::ConfigError;
use crate::handler::registry::{RegistryV4, RegistryV6};
use crate::handler::{HandlerChain4, HandlerChain6};
use crate::listener::{ListenAddr, Servers};

fn config_path() -> PathBuf {
    PathBuf::from(
        std::env::var("COREDHCP_RS_CONFIG_PATH")
            .unwrap_or_else(|_| "/etc/coredhcp-rs/config.json".to_string()),
    )
}

fn build_chain4(registry: &RegistryV4, server: &ServerConfig) -> Result<HandlerChain4, ConfigError> {
    let handlers = server
        .plugins
        .iter()
        .map(|p| registry.build(&p.name, &p.args))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(HandlerChain4::new(handlers))
}

fn build_chain6(registry: &RegistryV6, server: &ServerConfig) -> Result<HandlerChain6, ConfigError> {
    let handlers = server
        .plugins
        .iter()
        .map(|p| registry.build(&p.name, &p.args))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(HandlerChain6::new(handlers))
}

fn listen_addrs(server: &ServerConfig) -> Vec<ListenAddr> {
    server
        .listen
        .iter()
        .map(|e| ListenAddr {
            ip: e.ip,
            port: e.port,
            interface: e.interface.clone(),
            network: e.interface.as_deref().and_then(interface_network),
        })
        .collect()
}

/// No portable way to read an interface's bound addresses from the
/// standard library alone; until that's wired up, `Request4::interface`
/// stays unset and the raw L2 send path falls back to broadcast.
fn interface_network(_name: &str) -> Option<Ipv4Net> {
    None
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "coredhcp_rs=info".parse().unwrap()),
        )
        .init();

    info!("coredhcp-rs starting");

    tokio::spawn(watch_sighup());

    let path = config_path();
    let config = if path.exists() {
        Config::load_from_file(&path)
            .with_context(|| format!("failed to load config from {}", path.display()))?
    } else {
        info!(path = %path.display(), "no config file found, using an empty config");
        Config::default()
    };

    let registry4 = RegistryV4::with_builtins();
    let registry6 = RegistryV6::with_builtins();

    let (v4_listen, chain4) = match &config.server4 {
        Some(server) => (
            listen_addrs(server),
            build_chain4(&registry4, server).context("building dhcpv4 handler chain")?,
        ),
        None => (Vec::new(), HandlerChain4::new(Vec::new())),
    };

    let (v6_listen, chain6) = match &config.server6 {
        Some(server) => (
            listen_addrs(server),
            build_chain6(&registry6, server).context("building dhcpv6 handler chain")?,
        ),
        None => (Vec::new(), HandlerChain6::new(Vec::new())),
    };

    if v4_listen.is_empty() && v6_listen.is_empty() {
        info!("no server4/server6 listen addresses configured, nothing to do");
        return Ok(());
    }

    let mut servers = Servers::start(
        v4_listen,
        v6_listen,
        std::sync::Arc::new(chain4),
        std::sync::Arc::new(chain6),
    )
    .await
    .context("starting listeners")?;

    info!("coredhcp-rs started successfully");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
        err = servers.wait() => {
            if let Some((label, e)) = err {
                error!(%label, error = %e, "listener terminated unexpectedly");
            }
        }
    }

    servers.close();
    servers.join().await;
    info!("coredhcp-rs stopped");

    Ok(())
}

/// Re-parses the config file on SIGHUP and logs the result. The listen
/// addresses and handler chains a running `Servers` was built from are
/// structural, not swappable state, so a reload never touches them — this
/// only confirms the file on disk still parses, the way a future reload of
/// non-structural config would need it to.
async fn watch_sighup() {
    let mut signals = match Signals::new([SIGHUP]) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to install SIGHUP handler, hot-reload disabled");
            return;
        }
    };

    while signals.next().await.is_some() {
        info!("received SIGHUP, re-reading config");
        match Config::load_from_file(&config_path()) {
            Ok(_) => info!("config file re-read successfully"),
            Err(e) => error!(error = %e, "failed to re-read config on SIGHUP"),
        }
    }
}
