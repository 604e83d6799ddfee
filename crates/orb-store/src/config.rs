use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Settings for an on-disk object store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database file.
    pub path: PathBuf,
    /// How long SQLite waits on a lock before reporting a conflict.
    pub busy_timeout_ms: u64,
    /// Upper bound of the random pause before a conflicted transaction is
    /// retried.
    pub max_backoff_ms: u64,
    /// Run `VACUUM` after every collection.
    pub vacuum_after_gc: bool,
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("orb.db"),
            busy_timeout_ms: 250,
            max_backoff_ms: 1000,
            vacuum_after_gc: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let c = StoreConfig::default();
        assert_eq!(c.path, PathBuf::from("orb.db"));
        assert_eq!(c.max_backoff(), Duration::from_secs(1));
        assert!(c.vacuum_after_gc);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let c: StoreConfig = toml::from_str("path = \"/tmp/x.db\"\nvacuum_after_gc = false").unwrap();
        assert_eq!(c.path, PathBuf::from("/tmp/x.db"));
        assert!(!c.vacuum_after_gc);
        assert_eq!(c.busy_timeout_ms, 250);
    }
}
