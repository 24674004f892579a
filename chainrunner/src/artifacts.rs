// File: chainrunner/src/artifacts.rs
//
// Failure Artifact Collection
//
// When a scenario fails, every snapshot taken so far, the state of each node
// and the failure itself are written to a JSON file so the run can be
// inspected after the nodes are gone.

use crate::chain::Chain;
use crate::node::{AccountId, NodeRole};
use crate::scenario::LabeledSnapshot;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Run metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    pub scenario: String,
    /// RFC 3339 start time
    pub started_at: String,
    pub duration_ms: u64,
    pub failure_reason: Option<String>,
    /// Process exit code the driver ends with
    pub exit_code: Option<i32>,
}

/// State of one node at the time the artifact was saved
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSummary {
    pub ordinal: usize,
    pub account: AccountId,
    pub role: NodeRole,
    pub running: bool,
    pub last_finalized: Option<u64>,
    pub args: Vec<String>,
}

/// Complete run artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunArtifact {
    pub metadata: RunMetadata,
    pub nodes: Vec<NodeSummary>,
    pub snapshots: Vec<LabeledSnapshot>,
}

/// Collects what happened during a run and saves it on failure
///
/// ```rust,ignore
/// let mut collector = ArtifactCollector::new("multiple_restarts");
/// if let Err(e) = scenario.run(&mut chain).await {
///     collector.set_failure(&e.to_string(), e.exit_code());
///     collector.capture_chain(&chain);
///     collector.add_snapshots(scenario.history());
///     collector.save(config.artifacts_dir()).await?;
/// }
/// ```
pub struct ArtifactCollector {
    metadata: RunMetadata,
    nodes: Vec<NodeSummary>,
    snapshots: Vec<LabeledSnapshot>,
    start_time: std::time::Instant,
}

impl ArtifactCollector {
    pub fn new(scenario: impl Into<String>) -> Self {
        Self {
            metadata: RunMetadata {
                scenario: scenario.into(),
                started_at: chrono::Utc::now().to_rfc3339(),
                duration_ms: 0,
                failure_reason: None,
                exit_code: None,
            },
            nodes: Vec::new(),
            snapshots: Vec::new(),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn set_failure(&mut self, reason: impl Into<String>, exit_code: i32) {
        self.metadata.failure_reason = Some(reason.into());
        self.metadata.exit_code = Some(exit_code);
    }

    /// Record the current state of every node
    pub fn capture_chain(&mut self, chain: &Chain) {
        self.nodes = chain
            .nodes()
            .iter()
            .map(|node| NodeSummary {
                ordinal: node.ordinal(),
                account: node.account().clone(),
                role: node.role(),
                running: node.is_running(),
                last_finalized: node.last_finalized(),
                args: node.flags().to_args(),
            })
            .collect();
    }

    pub fn add_snapshots(&mut self, snapshots: &[LabeledSnapshot]) {
        self.snapshots.extend_from_slice(snapshots);
    }

    /// Save the artifact as `<scenario>_<timestamp>.json` inside `output_dir`
    ///
    /// Returns the path of the written file.
    pub async fn save(&mut self, output_dir: impl AsRef<Path>) -> Result<PathBuf> {
        self.metadata.duration_ms = self.start_time.elapsed().as_millis() as u64;

        let artifact = RunArtifact {
            metadata: self.metadata.clone(),
            nodes: self.nodes.clone(),
            snapshots: self.snapshots.clone(),
        };

        let output_dir = output_dir.as_ref();
        fs::create_dir_all(output_dir)
            .await
            .context("Failed to create artifact directory")?;

        let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S%3f");
        let filepath = output_dir.join(format!("{}_{}.json", self.metadata.scenario, timestamp));

        let json = serde_json::to_string_pretty(&artifact).context("Failed to serialize artifact")?;
        let mut file = fs::File::create(&filepath)
            .await
            .context("Failed to create artifact file")?;
        file.write_all(json.as_bytes())
            .await
            .context("Failed to write artifact data")?;
        file.flush().await.context("Failed to flush artifact file")?;

        Ok(filepath)
    }

    pub async fn load(filepath: impl AsRef<Path>) -> Result<RunArtifact> {
        let content = fs::read_to_string(filepath.as_ref())
            .await
            .context("Failed to read artifact file")?;
        serde_json::from_str(&content).context("Failed to parse artifact JSON")
    }
}
