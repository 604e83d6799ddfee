use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;

use orb_store::StoreConfig;
use serde::{Deserialize, Serialize};

use crate::error::{ServerError, ServerResult};

/// Port a listener binds when none is configured.
pub const DEFAULT_PORT: u16 = 4000;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Connections beyond this many are closed as soon as they are accepted.
    pub max_connections: usize,
    /// Store whose root the listener exports.
    pub store: StoreConfig,
}

impl ServerConfig {
    /// Load from a TOML file. Missing keys keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> ServerResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text)
            .map_err(|e| ServerError::Config(format!("{}: {e}", path.display())))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            max_connections: 256,
            store: StoreConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;

    #[test]
    fn default_config() {
        let c = ServerConfig::default();
        assert_eq!(c.bind_addr, "0.0.0.0:4000".parse::<SocketAddr>().unwrap());
        assert_eq!(c.max_connections, 256);
        assert_eq!(c.store, StoreConfig::default());
    }

    #[test]
    fn from_file_merges_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "bind_addr = \"127.0.0.1:5000\"\n\n[store]\npath = \"/var/lib/orb/root.db\"\nmax_backoff_ms = 50"
        )
        .unwrap();
        let c = ServerConfig::from_file(file.path()).unwrap();
        assert_eq!(c.bind_addr.port(), 5000);
        assert_eq!(c.max_connections, 256);
        assert_eq!(c.store.path, PathBuf::from("/var/lib/orb/root.db"));
        assert_eq!(c.store.max_backoff_ms, 50);
        assert_eq!(c.store.busy_timeout_ms, 250);
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "bind_addr = 12").unwrap();
        assert!(matches!(
            ServerConfig::from_file(file.path()),
            Err(ServerError::Config(_))
        ));
    }

    #[test]
    fn missing_file_is_io() {
        assert!(matches!(
            ServerConfig::from_file("/nonexistent/orb.toml"),
            Err(ServerError::Io(_))
        ));
    }
}
