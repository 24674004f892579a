// File: chainrunner/src/lifecycle.rs
//
// LifecycleController
//
// Starts and stops subsets of a chain. Every node of a batch is driven
// concurrently; a failing node never blocks the others and its error is
// reported next to the successes.

use crate::chain::Chain;
use crate::error::ChainError;
use crate::node::{Flags, NodeRole};
use futures::future::join_all;
use log::{info, warn};
use std::collections::{BTreeMap, BTreeSet};

/// Per-node outcome of a batch operation, keyed by ordinal
pub type BatchReport = BTreeMap<usize, Result<(), ChainError>>;

/// Extra launch flags applied according to the node's role
#[derive(Debug, Clone, PartialEq)]
pub struct RoleFlags {
    pub validator: Flags,
    pub nonvalidator: Flags,
}

impl RoleFlags {
    pub fn for_role(&self, role: NodeRole) -> &Flags {
        match role {
            NodeRole::Validator => &self.validator,
            NodeRole::NonValidator => &self.nonvalidator,
        }
    }
}

impl Default for RoleFlags {
    fn default() -> Self {
        Self {
            validator: Flags::new().with("validator", true),
            nonvalidator: Flags::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Start,
    Stop,
}

impl Op {
    fn verb(self) -> &'static str {
        match self {
            Op::Start => "start",
            Op::Stop => "stop",
        }
    }
}

/// Drives start/stop transitions of chain nodes
#[derive(Debug, Clone, Default)]
pub struct LifecycleController {
    role_flags: RoleFlags,
}

impl LifecycleController {
    pub fn new(role_flags: RoleFlags) -> Self {
        Self { role_flags }
    }

    pub fn role_flags(&self) -> &RoleFlags {
        &self.role_flags
    }

    /// Start every node that is not running
    pub async fn start_all(&self, chain: &mut Chain) -> Result<BatchReport, ChainError> {
        let stopped: Vec<usize> = chain
            .nodes()
            .iter()
            .filter(|n| !n.is_running())
            .map(|n| n.ordinal())
            .collect();
        self.run_batch(chain, &stopped, Op::Start).await
    }

    pub async fn start_subset(
        &self,
        chain: &mut Chain,
        ordinals: &[usize],
    ) -> Result<BatchReport, ChainError> {
        self.run_batch(chain, ordinals, Op::Start).await
    }

    pub async fn stop_subset(
        &self,
        chain: &mut Chain,
        ordinals: &[usize],
    ) -> Result<BatchReport, ChainError> {
        self.run_batch(chain, ordinals, Op::Stop).await
    }

    /// Stop every running node, used at teardown
    pub async fn stop_all(&self, chain: &mut Chain) -> Result<BatchReport, ChainError> {
        let running = chain.running();
        self.run_batch(chain, &running, Op::Stop).await
    }

    /// Run `op` on every listed node concurrently
    ///
    /// Duplicated ordinals collapse into one operation. Unknown ordinals are
    /// reported as `UnknownNode`. Fails with `BatchFailed` only when every
    /// targeted operation failed.
    async fn run_batch(
        &self,
        chain: &mut Chain,
        ordinals: &[usize],
        op: Op,
    ) -> Result<BatchReport, ChainError> {
        let targets: BTreeSet<usize> = ordinals.iter().copied().collect();
        let mut report = BatchReport::new();
        if targets.is_empty() {
            return Ok(report);
        }

        let len = chain.len();
        for &ordinal in targets.iter().filter(|&&o| o >= len) {
            report.insert(ordinal, Err(ChainError::UnknownNode(ordinal)));
        }

        let role_flags = &self.role_flags;
        let operations = chain
            .nodes_mut()
            .iter_mut()
            .filter(|node| targets.contains(&node.ordinal()))
            .map(|node| async move {
                let role = node.role();
                let result = match op {
                    Op::Start => node.start(role_flags.for_role(role)).await,
                    Op::Stop => node.stop().await,
                };
                (node.ordinal(), result)
            });
        report.extend(join_all(operations).await);

        for (ordinal, result) in &report {
            if let Err(e) = result {
                warn!("Failed to {} node {}: {}", op.verb(), ordinal, e);
            }
        }

        if report.values().all(Result::is_err) {
            let failures = report
                .into_iter()
                .filter_map(|(ordinal, result)| result.err().map(|e| (ordinal, e.to_string())))
                .collect();
            return Err(ChainError::BatchFailed { failures });
        }

        let succeeded = report.values().filter(|r| r.is_ok()).count();
        info!(
            "{} {}/{} nodes: {:?}",
            match op {
                Op::Start => "Started",
                Op::Stop => "Stopped",
            },
            succeeded,
            report.len(),
            targets
        );
        Ok(report)
    }
}
