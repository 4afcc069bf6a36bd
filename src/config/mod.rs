//! Config surface: an optional `server4`/`server6` section, each listing
//! listen endpoints and an ordered plugin chain. Immutable once loaded;
//! `Servers::start` and the handler registries consume it by reference.

use std::net::IpAddr;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server4: Option<ServerConfig>,
    #[serde(default)]
    pub server6: Option<ServerConfig>,
}

/// One protocol family's worth of listen endpoints and handler chain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub listen: Vec<ListenEntry>,
    #[serde(default)]
    pub plugins: Vec<PluginEntry>,
}

/// One configured listen address. An unspecified IP binds the wildcard
/// address; a multicast IP (v6) triggers group join on `interface`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenEntry {
    pub ip: IpAddr,
    pub port: u16,
    #[serde(default)]
    pub interface: Option<String>,
}

/// One handler chain entry: a registry name and its raw argument list, in
/// the exact order the registry's setup functions expect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginEntry {
    pub name: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Config {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;
        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;
        Ok(config)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self).context("failed to serialize config")?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename config to {}", path.display()))?;
        Ok(())
    }
}
