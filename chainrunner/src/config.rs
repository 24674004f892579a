// File: chainrunner/src/config.rs
//
// Harness configuration
//
// The working directory and node binary are passed in explicitly; only the
// driver binary reads them from the environment.

use crate::node::AccountId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default working directory of the reference scenario
pub const DEFAULT_WORKDIR: &str = "/tmp/workdir";

/// Default file name of the generated chain spec
pub const DEFAULT_CHAIN_SPEC: &str = "chainspec.json";

/// Default bound on a single status query
pub const DEFAULT_QUERY_TIMEOUT_MS: u64 = 5_000;

/// Explicit configuration of a harness run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Chain spec, node logs and node databases are written here
    pub working_dir: PathBuf,
    /// Path to the node binary
    pub binary: PathBuf,
    /// File name of the chain spec inside `working_dir`
    pub chain_spec_file: String,
    /// Bound on each finalized-height query, in milliseconds
    pub query_timeout_ms: u64,
    /// Host the nodes' RPC endpoints listen on
    pub rpc_host: String,
}

impl HarnessConfig {
    pub fn new(working_dir: impl Into<PathBuf>, binary: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            binary: binary.into(),
            ..Self::default()
        }
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn chain_spec_path(&self) -> PathBuf {
        self.working_dir.join(&self.chain_spec_file)
    }

    /// Database directory owned by one node
    pub fn node_base_path(&self, account: &AccountId) -> PathBuf {
        self.working_dir.join(account.as_str())
    }

    /// Log file owned by one node
    pub fn node_log_path(&self, account: &AccountId) -> PathBuf {
        self.working_dir.join(format!("{}.log", account))
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.working_dir.join("artifacts")
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        let working_dir = PathBuf::from(DEFAULT_WORKDIR);
        Self {
            binary: working_dir.join("aleph-node"),
            working_dir,
            chain_spec_file: DEFAULT_CHAIN_SPEC.to_string(),
            query_timeout_ms: DEFAULT_QUERY_TIMEOUT_MS,
            rpc_host: "127.0.0.1".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_reference_layout() {
        let config = HarnessConfig::default();
        assert_eq!(config.working_dir, PathBuf::from("/tmp/workdir"));
        assert_eq!(config.binary, PathBuf::from("/tmp/workdir/aleph-node"));
        assert_eq!(config.chain_spec_path(), PathBuf::from("/tmp/workdir/chainspec.json"));
        assert_eq!(config.query_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_per_node_paths() {
        let config = HarnessConfig::new("/work", "/bin/aleph-node");
        let account = AccountId::new("5Grw");
        assert_eq!(config.node_base_path(&account), PathBuf::from("/work/5Grw"));
        assert_eq!(config.node_log_path(&account), PathBuf::from("/work/5Grw.log"));
    }

    #[test]
    fn test_query_timeout_saturates() {
        let config = HarnessConfig::default().with_query_timeout(Duration::MAX);
        assert_eq!(config.query_timeout_ms, u64::MAX);

        let config = HarnessConfig::default().with_query_timeout(Duration::from_millis(1500));
        assert_eq!(config.query_timeout(), Duration::from_millis(1500));
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config: HarnessConfig = serde_yaml::from_str("working_dir: /data\nquery_timeout_ms: 250\n").unwrap();
        assert_eq!(config.working_dir, PathBuf::from("/data"));
        assert_eq!(config.query_timeout(), Duration::from_millis(250));
        assert_eq!(config.chain_spec_file, "chainspec.json");
    }
}
