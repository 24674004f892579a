//! FinalizationMonitor - finalized-height snapshots and the checks built on them
//!
//! A snapshot queries every node concurrently, each query bounded by its own
//! timeout. A node that is stopped, refuses the query or does not answer in
//! time is recorded as absent instead of failing the snapshot.

use crate::chain::Chain;
use crate::config::DEFAULT_QUERY_TIMEOUT_MS;
use crate::error::{ChainError, CheckFailure};
use crate::node::NodeRole;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Finalized heights of every node at one logical point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalizationSnapshot {
    /// Height reported by each node, `None` when the node could not be queried
    heights: Vec<Option<u64>>,
    /// Most recent height known for each node when the snapshot was taken
    last_known: Vec<Option<u64>>,
    captured_at: DateTime<Utc>,
}

impl FinalizationSnapshot {
    /// Snapshot from explicit heights; last-known heights equal the heights
    pub fn from_heights(heights: Vec<Option<u64>>) -> Self {
        Self {
            last_known: heights.clone(),
            heights,
            captured_at: Utc::now(),
        }
    }

    /// Replace the last-known heights, e.g. for nodes that were down
    pub fn with_last_known(mut self, last_known: Vec<Option<u64>>) -> Self {
        self.last_known = last_known;
        self
    }

    pub fn get(&self, ordinal: usize) -> Option<u64> {
        self.heights.get(ordinal).copied().flatten()
    }

    pub fn last_known(&self, ordinal: usize) -> Option<u64> {
        self.last_known.get(ordinal).copied().flatten()
    }

    pub fn heights(&self) -> &[Option<u64>] {
        &self.heights
    }

    pub fn len(&self) -> usize {
        self.heights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heights.is_empty()
    }

    /// Ordinals with no height in this snapshot
    pub fn absent(&self) -> Vec<usize> {
        self.heights
            .iter()
            .enumerate()
            .filter(|(_, h)| h.is_none())
            .map(|(ordinal, _)| ordinal)
            .collect()
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    fn check_ordinal(&self, ordinal: usize) -> Result<(), ChainError> {
        if ordinal >= self.heights.len() {
            return Err(ChainError::UnknownNode(ordinal));
        }
        Ok(())
    }
}

// Saturates instead of wrapping for heights beyond i64
fn signed_diff(after: u64, before: u64) -> i64 {
    let diff = i128::from(after) - i128::from(before);
    i64::try_from(diff).unwrap_or(if diff < 0 { i64::MIN } else { i64::MAX })
}

/// `after[ordinal] - before[ordinal]`, signed so regressions show up negative
///
/// # Errors
///
/// `Incomparable` if either snapshot has no height for the node.
pub fn delta(
    before: &FinalizationSnapshot,
    after: &FinalizationSnapshot,
    ordinal: usize,
) -> Result<i64, ChainError> {
    before.check_ordinal(ordinal)?;
    after.check_ordinal(ordinal)?;
    match (before.get(ordinal), after.get(ordinal)) {
        (Some(b), Some(a)) => Ok(signed_diff(a, b)),
        _ => Err(ChainError::Incomparable { ordinal }),
    }
}

/// Like `delta`, but a node absent from `before` is measured from the last
/// height it was known to have reached
///
/// This is what a restarted node is compared with: the snapshot taken while
/// it was down has no height for it.
pub fn delta_since_last_known(
    before: &FinalizationSnapshot,
    after: &FinalizationSnapshot,
    ordinal: usize,
) -> Result<i64, ChainError> {
    before.check_ordinal(ordinal)?;
    after.check_ordinal(ordinal)?;
    let start = before.get(ordinal).or_else(|| before.last_known(ordinal));
    match (start, after.get(ordinal)) {
        (Some(b), Some(a)) => Ok(signed_diff(a, b)),
        _ => Err(ChainError::Incomparable { ordinal }),
    }
}

/// Polls finalized heights across a chain
#[derive(Debug, Clone)]
pub struct FinalizationMonitor {
    query_timeout: Duration,
}

impl FinalizationMonitor {
    pub fn new(query_timeout: Duration) -> Self {
        Self { query_timeout }
    }

    pub fn query_timeout(&self) -> Duration {
        self.query_timeout
    }

    /// Query every node and record the successful answers as last-known heights
    pub async fn snapshot(&self, chain: &mut Chain) -> FinalizationSnapshot {
        let timeout = self.query_timeout;
        let queries = chain.nodes().iter().map(|node| async move {
            match tokio::time::timeout(timeout, node.query_finalized()).await {
                Ok(Ok(height)) => Some(height),
                Ok(Err(e)) => {
                    if node.is_running() {
                        warn!("{}", e);
                    } else {
                        debug!("{}", e);
                    }
                    None
                }
                Err(_) => {
                    warn!(
                        "Node {} did not answer within {}ms",
                        node.ordinal(),
                        timeout.as_millis()
                    );
                    None
                }
            }
        });
        let heights = join_all(queries).await;

        for (node, height) in chain.nodes_mut().iter_mut().zip(&heights) {
            if let Some(height) = height {
                node.record_finalized(*height);
            }
        }
        let last_known = chain.nodes().iter().map(|n| n.last_finalized()).collect();

        info!("Finalized heights: {:?}", heights);
        FinalizationSnapshot {
            heights,
            last_known,
            captured_at: Utc::now(),
        }
    }
}

impl Default for FinalizationMonitor {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_QUERY_TIMEOUT_MS))
    }
}

/// Minimum progress the chain must make while part of it is offline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessCheck {
    /// Fraction of the ideal progress that is still accepted
    pub margin_factor: f64,
    /// Expected finalization rate with every validator online, blocks/s
    pub block_rate: f64,
}

impl Default for LivenessCheck {
    fn default() -> Self {
        Self {
            margin_factor: 0.9,
            block_rate: 1.0,
        }
    }
}

impl LivenessCheck {
    /// `elapsed * block_rate * (1 - offline_fraction) * margin_factor`
    pub fn threshold(&self, elapsed: Duration, offline_fraction: f64) -> f64 {
        elapsed.as_secs_f64() * self.block_rate * (1.0 - offline_fraction) * self.margin_factor
    }

    pub fn evaluate(
        &self,
        ordinal: usize,
        observed: i64,
        elapsed: Duration,
        offline_fraction: f64,
    ) -> Result<(), CheckFailure> {
        let expected = self.threshold(elapsed, offline_fraction);
        if (observed as f64) < expected {
            return Err(CheckFailure::Liveness {
                ordinal,
                observed,
                expected,
            });
        }
        debug!(
            "Node {} finalized {} blocks, threshold {:.2}",
            ordinal, observed, expected
        );
        Ok(())
    }
}

/// Minimum progress of a restarted node during the catch-up window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatchUpCheck {
    /// A node that finalized this many blocks or fewer has not caught up
    pub allowed_delta: u64,
}

impl Default for CatchUpCheck {
    fn default() -> Self {
        Self { allowed_delta: 5 }
    }
}

impl CatchUpCheck {
    pub fn evaluate(&self, ordinal: usize, role: NodeRole, observed: i64) -> Result<(), CheckFailure> {
        let caught_up = i64::try_from(self.allowed_delta).is_ok_and(|allowed| observed > allowed);
        if !caught_up {
            return Err(CheckFailure::CatchUp {
                ordinal,
                role: role.to_string(),
                observed,
                allowed: self.allowed_delta,
            });
        }
        Ok(())
    }
}
