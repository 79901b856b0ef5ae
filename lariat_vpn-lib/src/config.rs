use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Firewall mark claimed by the daemon for tunnel-bound traffic.
///
/// The firewall subsystem stamps outgoing tunnel packets with this mark;
/// the routing engine installs an inverted `ip rule` so that everything
/// *without* the mark is diverted through the custom routing table.
pub const DEFAULT_FWMARK: u32 = 0xe1f1;

#[derive(Debug, Error)]
pub enum Error {
    #[error("reading config file: {0}")]
    IO(#[from] std::io::Error),
    #[error("parsing config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("fwmark cannot be 0")]
    ZeroFwmark,
}

/// Daemon settings consumed by the routing engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Firewall mark used for the inverted policy rule.
    pub fwmark: u32,
    /// Whether IPv6 rules and routes are managed alongside IPv4.
    pub ipv6: bool,
    /// Keep local network destinations reachable while connected.
    pub allow_local_network: bool,
    /// Keep multicast/broadcast discovery traffic on the LAN working.
    pub lan_discovery: bool,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            fwmark: DEFAULT_FWMARK,
            ipv6: false,
            allow_local_network: false,
            lan_discovery: false,
        }
    }
}

impl RoutingConfig {
    pub fn from_str(content: &str) -> Result<Self, Error> {
        let config: Self = toml::from_str(content)?;
        if config.fwmark == 0 {
            return Err(Error::ZeroFwmark);
        }
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_missing_fields() -> anyhow::Result<()> {
        let config = RoutingConfig::from_str("ipv6 = true")?;
        assert_eq!(config.fwmark, DEFAULT_FWMARK);
        assert!(config.ipv6);
        assert!(!config.allow_local_network);
        Ok(())
    }

    #[test]
    fn full_config_parses() -> anyhow::Result<()> {
        let content = r#"
fwmark = 51820
ipv6 = true
allow_local_network = true
lan_discovery = true
"#;
        let config = RoutingConfig::from_str(content)?;
        assert_eq!(config.fwmark, 51820);
        assert!(config.allow_local_network);
        assert!(config.lan_discovery);
        Ok(())
    }

    #[test]
    fn zero_fwmark_is_rejected() {
        assert!(matches!(RoutingConfig::from_str("fwmark = 0"), Err(Error::ZeroFwmark)));
    }
}
