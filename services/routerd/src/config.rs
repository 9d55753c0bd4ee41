// Daemon configuration from a JSON file. A missing file falls back to the
// defaults; a malformed one is an error.
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use syrinx_router::DEFAULT_PORT;

#[derive(Debug, Clone, Deserialize)]
pub struct ProtocolConfig {
    pub network: String,
    pub marshal: String,
    pub address: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouterdConfig {
    pub protocols: Vec<ProtocolConfig>,
    // 0 means unlimited.
    pub max_connections: usize,
    pub do_failover: bool,
    // Seconds of idleness before a keep-alive probe.
    pub test_conn_interval: u64,
    // Seconds of grace after a probe before teardown.
    pub test_conn_timeout: u64,
    pub failover: Option<ProtocolConfig>,
}

impl Default for RouterdConfig {
    fn default() -> Self {
        Self {
            protocols: vec![ProtocolConfig {
                network: "tcp".into(),
                marshal: "xdr".into(),
                address: format!("0.0.0.0:{DEFAULT_PORT}"),
            }],
            max_connections: 1024,
            do_failover: false,
            test_conn_interval: 30,
            test_conn_timeout: 10,
            failover: None,
        }
    }
}

impl RouterdConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "config file missing, using defaults");
                return Ok(Self::default());
            }
            Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
        };
        serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_listen_on_the_standard_port() {
        let config = RouterdConfig::default();
        assert_eq!(config.protocols.len(), 1);
        assert_eq!(config.protocols[0].address, "0.0.0.0:2917");
        assert_eq!(config.protocols[0].network, "tcp");
        assert_eq!(config.protocols[0].marshal, "xdr");
        assert!(!config.do_failover);
    }

    #[test]
    fn partial_config_fills_in_defaults() {
        let config: RouterdConfig =
            serde_json::from_str(r#"{"max_connections": 7}"#).expect("parse");
        assert_eq!(config.max_connections, 7);
        assert_eq!(config.test_conn_interval, 30);
        assert_eq!(config.protocols[0].address, "0.0.0.0:2917");
    }

    #[test]
    fn full_config_round_trips() {
        let config: RouterdConfig = serde_json::from_str(
            r#"{
                "protocols": [
                    {"network": "tcp", "marshal": "xdr", "address": "127.0.0.1:2917"},
                    {"network": "udp", "marshal": "xdr", "address": "127.0.0.1:2918"}
                ],
                "max_connections": 64,
                "do_failover": true,
                "test_conn_interval": 5,
                "test_conn_timeout": 2,
                "failover": {"network": "tcp", "marshal": "xdr", "address": "backup:2917"}
            }"#,
        )
        .expect("parse");
        assert_eq!(config.protocols.len(), 2);
        assert!(config.do_failover);
        assert_eq!(config.failover.expect("failover").address, "backup:2917");
    }

    #[test]
    fn missing_file_uses_defaults() {
        let config = RouterdConfig::load("/nonexistent/routerd.json").expect("load");
        assert_eq!(config.max_connections, 1024);
    }
}
