//! # chainrunner
//!
//! Lifecycle control and finalization monitoring for local multi-node chains.
//!
//! ## Architecture Overview
//!
//! - **node**: `NodeHandle`, one node with its flags and a `NodeProcess` backend
//! - **chain**: `Chain`, the ordered node set (validators first) and its chain spec
//! - **flags**: `FlagAssigner`, constant and sequential per-node flag values
//! - **lifecycle**: `LifecycleController`, concurrent start/stop of node subsets
//! - **monitor**: `FinalizationMonitor`, finalized-height snapshots and the
//!   liveness / catch-up checks
//! - **scenario**: `RestartScenario`, the stop/restart perturbation loop
//!
//! Backends: `process` runs the real node binary, `sim` is an in-process
//! network used by tests and `--simulate` runs.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use chainrunner::prelude::*;
//!
//! #[tokio::test(start_paused = true)]
//! async fn test_restarts() {
//!     let clock: Arc<dyn Clock> = Arc::new(PausedClock::attach());
//!     let network = SimNetwork::new(clock.clone(), 1.0);
//!     let mut chain = ChainBuilder::new(HarnessConfig::new(dir.path(), "aleph-node"))
//!         .with_validators(validators)
//!         .with_nonvalidators(nonvalidators)
//!         .with_chain_spec_generator(Arc::new(JsonChainSpecGenerator))
//!         .with_node_factory(Arc::new(network))
//!         .build()
//!         .await
//!         .unwrap();
//!
//!     LifecycleController::default().start_all(&mut chain).await.unwrap();
//!     RestartScenario::new(ScenarioConfig::default(), clock)
//!         .run(&mut chain)
//!         .await
//!         .unwrap();
//! }
//! ```

#![warn(clippy::all)]

pub mod artifacts;
pub mod chain;
pub mod config;
pub mod error;
pub mod flags;
pub mod genesis;
pub mod lifecycle;
pub mod monitor;
pub mod node;

/// Clock abstraction and phase waits
pub mod orchestrator;

pub mod process;
pub mod rpc;
pub mod scenario;

/// In-process simulated network
pub mod sim;

pub use chain::{Chain, ChainBuilder};
pub use error::{ChainError, CheckFailure, ScenarioError};
pub use node::{AccountId, FlagValue, Flags, NodeHandle, NodeRole};

/// Convenient re-exports for drivers and tests
pub mod prelude {
    pub use crate::artifacts::ArtifactCollector;
    pub use crate::chain::{Chain, ChainBuilder, NodeContext, NodeFactory};
    pub use crate::config::HarnessConfig;
    pub use crate::error::{ChainError, CheckFailure, ScenarioError};
    pub use crate::flags::{derive_flag, set_flags, FlagAssigner, FlagSpec, Seq, SharedSeq, Target};
    pub use crate::genesis::{
        generate_keys, indexed_phrases, BinaryChainSpecGenerator, BinaryKeyGenerator,
        ChainSpecGenerator, DerivedKeyGenerator, JsonChainSpecGenerator, KeyGenerator,
    };
    pub use crate::lifecycle::{BatchReport, LifecycleController, RoleFlags};
    pub use crate::monitor::{
        delta, delta_since_last_known, CatchUpCheck, FinalizationMonitor, FinalizationSnapshot,
        LivenessCheck,
    };
    pub use crate::node::{AccountId, FlagValue, Flags, NodeHandle, NodeProcess, NodeRole};
    pub use crate::orchestrator::{wait_phase, Clock, PausedClock, SystemClock};
    pub use crate::process::ProcessNodeFactory;
    pub use crate::scenario::{Phase, RestartScenario, ScenarioConfig, ScenarioReport};
    pub use crate::sim::SimNetwork;
    pub use std::sync::Arc;
}
