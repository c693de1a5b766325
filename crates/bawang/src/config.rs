//! Configuration for a bawang node.
//!
//! One flat TOML file; paths and addresses are required, timing knobs
//! have defaults.  Semantic validation of the tunnel length happens in
//! the core when the router is constructed.

use anyhow::Context;
use bawang_proto::RouterConfig;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A node's configuration file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct Config {
    /// Path to the 4096-bit RSA identity key (PKCS#1 or PKCS#8 PEM).
    pub(crate) hostkey: PathBuf,
    /// Hostname or address the peer TLS listener binds to.
    pub(crate) p2p_hostname: String,
    /// Port the peer TLS listener binds to.
    pub(crate) p2p_port: u16,
    /// Address the local client API listens on.
    pub(crate) api_address: SocketAddr,
    /// Address of the RPS service.
    pub(crate) rps_api_address: SocketAddr,
    /// Total hop count per tunnel, destination included.
    #[serde(default = "default_tunnel_length")]
    pub(crate) tunnel_length: usize,
    /// Seconds allowed per handshake step.
    #[serde(default = "default_build_timeout")]
    pub(crate) build_timeout: u64,
    /// Seconds allowed per RPS or API round-trip.
    #[serde(default = "default_api_timeout")]
    pub(crate) api_timeout: u64,
    /// Seconds between tunnel-rebuild rounds.
    #[serde(default = "default_round_duration")]
    pub(crate) round_duration: u64,
}

/// Default hop count.
fn default_tunnel_length() -> usize {
    3
}

/// Default handshake-step budget.
fn default_build_timeout() -> u64 {
    15
}

/// Default RPS/API round-trip budget.
fn default_api_timeout() -> u64 {
    5
}

/// Default rebuild cadence.
fn default_round_duration() -> u64 {
    60
}

impl Config {
    /// Load a configuration file.
    pub(crate) fn load(path: &Path) -> anyhow::Result<Config> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }

    /// The slice of this configuration the onion-routing core wants.
    pub(crate) fn router_config(&self) -> RouterConfig {
        RouterConfig {
            tunnel_length: self.tunnel_length,
            build_timeout: Duration::from_secs(self.build_timeout),
            round_duration: Duration::from_secs(self.round_duration),
        }
    }

    /// The RPS/API round-trip budget as a duration.
    pub(crate) fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout)
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    const MINIMAL: &str = r#"
hostkey = "/etc/bawang/hostkey.pem"
p2p_hostname = "198.51.100.7"
p2p_port = 4433
api_address = "127.0.0.1:9000"
rps_api_address = "127.0.0.1:9100"
"#;

    #[test]
    fn minimal_config_gets_defaults() {
        let config: Config = toml::from_str(MINIMAL).unwrap();
        assert_eq!(config.tunnel_length, 3);
        assert_eq!(config.build_timeout, 15);
        assert_eq!(config.api_timeout, 5);
        assert_eq!(config.round_duration, 60);
        assert_eq!(config.p2p_port, 4433);
    }

    #[test]
    fn overrides_are_honored() {
        let raw = format!("{MINIMAL}\ntunnel_length = 5\nround_duration = 120\n");
        let config: Config = toml::from_str(&raw).unwrap();
        assert_eq!(config.tunnel_length, 5);
        assert_eq!(config.router_config().round_duration, Duration::from_secs(120));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let raw = format!("{MINIMAL}\nonion_port = 1\n");
        assert!(toml::from_str::<Config>(&raw).is_err());
    }

    #[test]
    fn missing_required_key_is_rejected() {
        assert!(toml::from_str::<Config>("p2p_port = 1").is_err());
    }
}
