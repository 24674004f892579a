// File: chainrunner/src/scenario.rs
//
// Restart Scenario
//
// The perturbation loop: for each phase, let the chain run, stop a subset,
// check that finalization kept going, restart the subset and check that the
// restarted nodes caught up.
//
// Scenario files are YAML:
//
//   name: multiple_restarts
//   phases:
//     - { run: 90, stop: 30, catch_up: 45 }
//     - { run: 5, stop: 10, catch_up: 20 }
//   stopped_nodes: [3, 4]
//   reference_node: 0
//   liveness:
//     margin_factor: 0.9
//     block_rate: 1.0
//   catch_up:
//     allowed_delta: 5

use crate::chain::Chain;
use crate::error::{ChainError, ScenarioError};
use crate::lifecycle::LifecycleController;
use crate::monitor::{
    delta, delta_since_last_known, CatchUpCheck, FinalizationMonitor, FinalizationSnapshot,
    LivenessCheck,
};
use crate::orchestrator::{wait_phase, Clock};
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::time::Duration;

/// Durations of one perturbation round, in seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
    pub run: u64,
    pub stop: u64,
    pub catch_up: u64,
}

impl Phase {
    pub fn new(run: u64, stop: u64, catch_up: u64) -> Self {
        Self { run, stop, catch_up }
    }
}

/// Description of a restart scenario
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    pub name: String,
    pub phases: Vec<Phase>,
    /// Nodes stopped and restarted in every phase
    pub stopped_nodes: Vec<usize>,
    /// Node whose progress the liveness check looks at
    pub reference_node: usize,
    /// Offline validator fraction used by the liveness check; derived from
    /// the chain when unset
    pub offline_fraction: Option<f64>,
    pub liveness: LivenessCheck,
    pub catch_up: CatchUpCheck,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            name: "multiple_restarts".to_string(),
            phases: vec![
                Phase::new(90, 30, 45),
                Phase::new(5, 10, 20),
                Phase::new(5, 10, 20),
            ],
            stopped_nodes: vec![3, 4],
            reference_node: 0,
            offline_fraction: None,
            liveness: LivenessCheck::default(),
            catch_up: CatchUpCheck::default(),
        }
    }
}

impl ScenarioConfig {
    pub fn from_yaml(content: &str) -> Result<Self, ChainError> {
        let config: Self = serde_yaml::from_str(content)
            .map_err(|e| ChainError::Config(format!("invalid scenario: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ChainError> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_yaml(&content)
    }

    pub fn validate(&self) -> Result<(), ChainError> {
        if self.phases.is_empty() {
            return Err(ChainError::Config("scenario has no phases".to_string()));
        }
        if self.stopped_nodes.is_empty() {
            return Err(ChainError::Config("scenario stops no nodes".to_string()));
        }
        if self.stopped_nodes.contains(&self.reference_node) {
            return Err(ChainError::Config(format!(
                "reference node {} cannot be stopped",
                self.reference_node
            )));
        }
        if let Some(f) = self.offline_fraction {
            if !(0.0..=1.0).contains(&f) {
                return Err(ChainError::Config(format!(
                    "offline fraction {} is outside [0, 1]",
                    f
                )));
            }
        }

        let liveness = &self.liveness;
        if !liveness.margin_factor.is_finite()
            || liveness.margin_factor <= 0.0
            || liveness.margin_factor > 1.0
        {
            return Err(ChainError::Config(format!(
                "liveness margin factor {} is outside (0, 1]",
                liveness.margin_factor
            )));
        }
        if !liveness.block_rate.is_finite() || liveness.block_rate <= 0.0 {
            return Err(ChainError::Config(format!(
                "liveness block rate {} must be positive",
                liveness.block_rate
            )));
        }
        Ok(())
    }

    fn check_against(&self, chain: &Chain) -> Result<(), ChainError> {
        self.validate()?;
        let ordinals = self.stopped_nodes.iter().chain(Some(&self.reference_node));
        for &ordinal in ordinals {
            chain.node(ordinal)?;
        }
        Ok(())
    }
}

/// Snapshot tagged with where in the scenario it was taken
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabeledSnapshot {
    pub phase: usize,
    pub label: String,
    pub snapshot: FinalizationSnapshot,
}

/// Numbers measured in one successful phase
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseReport {
    pub phase: usize,
    pub liveness_delta: i64,
    pub liveness_threshold: f64,
    /// Blocks finalized by each restarted node during catch-up
    pub catch_up: BTreeMap<usize, i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub name: String,
    pub phases: Vec<PhaseReport>,
}

/// Runs a `ScenarioConfig` against a started chain
pub struct RestartScenario {
    config: ScenarioConfig,
    controller: LifecycleController,
    monitor: FinalizationMonitor,
    clock: Arc<dyn Clock>,
    history: Vec<LabeledSnapshot>,
}

impl RestartScenario {
    pub fn new(config: ScenarioConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            controller: LifecycleController::default(),
            monitor: FinalizationMonitor::default(),
            clock,
            history: Vec::new(),
        }
    }

    pub fn with_controller(mut self, controller: LifecycleController) -> Self {
        self.controller = controller;
        self
    }

    pub fn with_monitor(mut self, monitor: FinalizationMonitor) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn config(&self) -> &ScenarioConfig {
        &self.config
    }

    /// Every snapshot taken so far, in order
    pub fn history(&self) -> &[LabeledSnapshot] {
        &self.history
    }

    async fn capture(&mut self, chain: &mut Chain, phase: usize, label: &str) -> FinalizationSnapshot {
        let snapshot = self.monitor.snapshot(chain).await;
        self.history.push(LabeledSnapshot {
            phase,
            label: label.to_string(),
            snapshot: snapshot.clone(),
        });
        snapshot
    }

    /// Run every phase, stopping at the first failed check
    pub async fn run(&mut self, chain: &mut Chain) -> Result<ScenarioReport, ScenarioError> {
        self.config.check_against(chain)?;
        let mut report = ScenarioReport {
            name: self.config.name.clone(),
            phases: Vec::new(),
        };

        let phases = self.config.phases.clone();
        for (index, phase) in phases.iter().enumerate() {
            info!(
                "Phase {}/{}: run {}s, stop {}s, catch up {}s",
                index + 1,
                phases.len(),
                phase.run,
                phase.stop,
                phase.catch_up
            );
            report.phases.push(self.run_phase(chain, index, phase).await?);
        }

        info!("Scenario {} passed", self.config.name);
        Ok(report)
    }

    async fn run_phase(
        &mut self,
        chain: &mut Chain,
        index: usize,
        phase: &Phase,
    ) -> Result<PhaseReport, ScenarioError> {
        let stopped = self.config.stopped_nodes.clone();
        let reference = self.config.reference_node;

        wait_phase(&self.clock, "run", Duration::from_secs(phase.run)).await;
        let before_stop = self.capture(chain, index, "before_stop").await;

        info!("Stopping nodes {:?}", stopped);
        self.controller.stop_subset(chain, &stopped).await?;
        let offline_fraction = self
            .config
            .offline_fraction
            .unwrap_or_else(|| chain.offline_validator_fraction());

        let stop_window = Duration::from_secs(phase.stop);
        wait_phase(&self.clock, "stop", stop_window).await;
        let before_restart = self.capture(chain, index, "before_restart").await;

        let liveness_delta = delta(&before_stop, &before_restart, reference)?;
        self.config
            .liveness
            .evaluate(reference, liveness_delta, stop_window, offline_fraction)?;
        let liveness_threshold = self.config.liveness.threshold(stop_window, offline_fraction);
        info!(
            "Node {} finalized {} blocks while {:.0}% of validators were offline (threshold {:.2})",
            reference,
            liveness_delta,
            offline_fraction * 100.0,
            liveness_threshold
        );

        info!("Restarting nodes {:?}", stopped);
        self.controller.start_subset(chain, &stopped).await?;
        wait_phase(&self.clock, "catch up", Duration::from_secs(phase.catch_up)).await;
        let after_catch_up = self.capture(chain, index, "after_catch_up").await;

        // Non-validators are judged first, then validators
        let mut restarted = stopped.clone();
        restarted.sort_by_key(|&o| (chain[o].role().is_validator(), o));
        restarted.dedup();

        let mut catch_up = BTreeMap::new();
        for ordinal in restarted {
            let observed = delta_since_last_known(&before_restart, &after_catch_up, ordinal)?;
            self.config
                .catch_up
                .evaluate(ordinal, chain[ordinal].role(), observed)?;
            info!("Node {} caught up {} blocks", ordinal, observed);
            catch_up.insert(ordinal, observed);
        }

        Ok(PhaseReport {
            phase: index,
            liveness_delta,
            liveness_threshold,
            catch_up,
        })
    }
}
