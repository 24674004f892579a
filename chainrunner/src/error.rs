// File: chainrunner/src/error.rs
//
// Error taxonomy for the harness.
//
// Transport-level failures (`ChainError`) are recorded per node inside batch
// operations. Verdicts (`CheckFailure`) end a run.

use std::collections::BTreeMap;
use thiserror::Error;

/// Errors raised while building, configuring, driving or observing a chain
#[derive(Error, Debug)]
pub enum ChainError {
    /// Invalid configuration, e.g. a flag set after the node was launched
    #[error("Configuration error: {0}")]
    Config(String),
    /// Invalid or overlapping account sets, or chain-spec generation failure
    #[error("Bootstrap error: {0}")]
    Bootstrap(String),
    /// Node is stopped, timed out or refused the status query
    #[error("Node {ordinal} is unreachable: {reason}")]
    Unreachable { ordinal: usize, reason: String },
    /// Delta requested where one of the snapshots has no data
    #[error("Node {ordinal} has no finalized height in one of the compared snapshots")]
    Incomparable { ordinal: usize },
    #[error("Node {0} does not exist in this chain")]
    UnknownNode(usize),
    /// Spawning or signalling the node process failed
    #[error("Process error on node {ordinal}: {source:#}")]
    Process {
        ordinal: usize,
        #[source]
        source: anyhow::Error,
    },
    /// Every targeted operation of a batch failed
    #[error("All {} targeted operations failed: {}", failures.len(), summarize(failures))]
    BatchFailed { failures: BTreeMap<usize, String> },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ChainError {
    /// Whether this error means the node could not be observed
    pub fn is_unreachable(&self) -> bool {
        matches!(self, ChainError::Unreachable { .. })
    }
}

fn summarize(failures: &BTreeMap<usize, String>) -> String {
    failures
        .iter()
        .map(|(ordinal, reason)| format!("node {}: {}", ordinal, reason))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Verdict raised by the liveness and catch-up checks
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CheckFailure {
    #[error(
        "Finalization stalled: node {ordinal} finalized {observed} blocks, expected at least {expected:.2}"
    )]
    Liveness {
        ordinal: usize,
        observed: i64,
        expected: f64,
    },
    #[error(
        "Too small catch up for {role} node {ordinal}: {observed} blocks, must be more than {allowed}"
    )]
    CatchUp {
        ordinal: usize,
        role: String,
        observed: i64,
        allowed: u64,
    },
}

/// Outcome of a failed scenario run
#[derive(Error, Debug)]
pub enum ScenarioError {
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Check(#[from] CheckFailure),
}

impl ScenarioError {
    /// Process exit code used by the driver
    ///
    /// Verdicts exit with 1, infrastructure failures with 2.
    pub fn exit_code(&self) -> i32 {
        match self {
            ScenarioError::Check(_) => 1,
            ScenarioError::Chain(_) => 2,
        }
    }
}
