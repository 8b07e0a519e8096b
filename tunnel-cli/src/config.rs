//! Merged configuration: an optional TOML file overridden by CLI flags,
//! validated once before the engine is constructed.

use std::fmt;
use std::fs;
use std::net::ToSocketAddrs;
use std::path::Path;
use std::time::Duration;

use clap::ValueEnum;
use serde::Deserialize;
use tunnel_core::{EngineConfig, Mode};

use crate::CliResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModeArg {
    Client,
    Server,
}

impl fmt::Display for ModeArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModeArg::Client => write!(f, "client"),
            ModeArg::Server => write!(f, "server"),
        }
    }
}

impl From<ModeArg> for Mode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::Client => Mode::Client,
            ModeArg::Server => Mode::Server,
        }
    }
}

/// Shape of the optional TOML config file. Every field is optional here, since
/// a value not set in the file may still come from a CLI flag; merging and
/// defaulting happen in [`Config::merge`].
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    pub mode: Option<ModeArg>,
    pub server: Option<String>,
    pub port: Option<u16>,
    pub mtu: Option<usize>,
    pub key: Option<String>,
    pub duplicate: Option<bool>,
    pub keepalive: Option<u64>,
    pub tun_name: Option<String>,
    pub address: Option<String>,
    pub route: Option<bool>,
    pub nat: Option<bool>,
    pub user: Option<String>,
    pub log_level: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> CliResult<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| format!("failed to read config file {}: {e}", path.display()))?;
        toml::from_str(&text)
            .map_err(|e| format!("failed to parse config file {}: {e}", path.display()))
    }
}

/// The fully resolved, validated configuration the binary runs with.
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: ModeArg,
    pub server: Option<String>,
    pub port: u16,
    pub mtu: usize,
    pub key: String,
    pub duplicate: bool,
    pub keepalive: u64,
    pub tun_name: String,
    pub address: String,
    pub route: bool,
    pub nat: bool,
    pub user: Option<String>,
    pub log_level: String,
}

const DEFAULT_PORT: u16 = 11081;
const DEFAULT_MTU: usize = 1400;
const DEFAULT_TUN_NAME: &str = "tun0";
const DEFAULT_LOG_LEVEL: &str = "info";
const MTU_MIN: usize = 576;
/// Must not exceed `tunnel_core::packet::MAX_MTU`: the engine's packet buffer
/// is sized off that constant, not off this config bound.
const MTU_MAX: usize = tunnel_core::packet::MAX_MTU;

impl Config {
    /// Merge a file-sourced config (if any) with CLI overrides, apply
    /// defaults, and validate. CLI values always win when both are present.
    pub fn merge(file: FileConfig, cli: FileConfig) -> CliResult<Self> {
        let mode = cli
            .mode
            .or(file.mode)
            .ok_or_else(|| "mode must be set to \"client\" or \"server\", via --mode or the config file".to_string())?;

        let config = Config {
            mode,
            server: cli.server.or(file.server),
            port: cli.port.or(file.port).unwrap_or(DEFAULT_PORT),
            mtu: cli.mtu.or(file.mtu).unwrap_or(DEFAULT_MTU),
            key: cli
                .key
                .or(file.key)
                .ok_or_else(|| "key must be set, via --key or the config file".to_string())?,
            duplicate: cli.duplicate.or(file.duplicate).unwrap_or(false),
            keepalive: cli.keepalive.or(file.keepalive).unwrap_or(0),
            tun_name: cli.tun_name.or(file.tun_name).unwrap_or_else(|| DEFAULT_TUN_NAME.to_string()),
            address: cli
                .address
                .or(file.address)
                .ok_or_else(|| "address must be set, via --address or the config file".to_string())?,
            route: cli.route.or(file.route).unwrap_or(false),
            nat: cli.nat.or(file.nat).unwrap_or(false),
            user: cli.user.or(file.user),
            log_level: cli.log_level.or(file.log_level).unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> CliResult<()> {
        if self.key.is_empty() {
            return Err("key must not be empty".to_string());
        }

        if !(MTU_MIN..=MTU_MAX).contains(&self.mtu) {
            return Err(format!("mtu {} out of range {MTU_MIN}..={MTU_MAX}", self.mtu));
        }

        match self.mode {
            ModeArg::Client => {
                if self.server.is_none() {
                    return Err("client mode requires \"server\" to be set".to_string());
                }
            }
            ModeArg::Server => {
                if self.nat && self.address.is_empty() {
                    return Err("nat requires an \"address\" to masquerade from".to_string());
                }
            }
        }

        Ok(())
    }

    /// Resolve `server:port` to a concrete address. Only meaningful in client
    /// mode; server mode binds locally instead.
    pub fn resolve_peer(&self) -> CliResult<std::net::SocketAddr> {
        let host = self.server.as_deref().ok_or_else(|| "no server address configured".to_string())?;
        (host, self.port)
            .to_socket_addrs()
            .map_err(|e| format!("failed to resolve {host}:{}: {e}", self.port))?
            .next()
            .ok_or_else(|| format!("{host}:{} resolved to no addresses", self.port))
    }

    pub fn keepalive_duration(&self) -> Option<Duration> {
        if self.keepalive == 0 {
            None
        } else {
            Some(Duration::from_secs(self.keepalive))
        }
    }

    pub fn engine_config(&self, peer: Option<std::net::SocketAddr>) -> EngineConfig {
        EngineConfig {
            mode: self.mode.into(),
            mtu: self.mtu,
            duplicate: self.duplicate,
            keepalive: self.keepalive_duration(),
            peer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_file() -> FileConfig {
        FileConfig {
            key: Some("k".repeat(64)),
            address: Some("10.0.0.1/24".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn client_requires_server() {
        let file = base_file();
        let cli = FileConfig { mode: Some(ModeArg::Client), ..Default::default() };
        let err = Config::merge(file, cli).unwrap_err();
        assert!(err.contains("server"));
    }

    #[test]
    fn cli_overrides_file() {
        let file = FileConfig { mtu: Some(1000), ..base_file() };
        let cli = FileConfig {
            mode: Some(ModeArg::Server),
            mtu: Some(1400),
            ..Default::default()
        };
        let config = Config::merge(file, cli).unwrap();
        assert_eq!(config.mtu, 1400);
    }

    #[test]
    fn mtu_out_of_range_is_rejected() {
        let file = base_file();
        let cli = FileConfig { mode: Some(ModeArg::Server), mtu: Some(100), ..Default::default() };
        assert!(Config::merge(file, cli).is_err());
    }

    #[test]
    fn empty_key_is_rejected() {
        let file = FileConfig { key: Some(String::new()), ..base_file() };
        let cli = FileConfig { mode: Some(ModeArg::Server), ..Default::default() };
        assert!(Config::merge(file, cli).is_err());
    }
}
