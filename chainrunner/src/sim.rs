// File: chainrunner/src/sim.rs
//
// Simulated Network
//
// In-process stand-in for a set of node binaries. The network finalizes at a
// fixed block rate as long as more than two thirds of the validators are
// running, and every running node follows the network head. Progress is
// computed lazily from the shared `Clock`, so a whole restart scenario runs
// instantly under tokio paused time.

use crate::chain::{NodeContext, NodeFactory};
use crate::node::{Flags, LaunchSpec, NodeProcess, NodeRole};
use crate::orchestrator::Clock;
use async_trait::async_trait;
use log::debug;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct SimNodeState {
    role: NodeRole,
    running: bool,
    height: u64,
    unresponsive: bool,
    stalled: bool,
    fail_start: bool,
    launches: usize,
    launch_flags: Option<Flags>,
}

impl SimNodeState {
    fn new(role: NodeRole) -> Self {
        Self {
            role,
            running: false,
            height: 0,
            unresponsive: false,
            stalled: false,
            fail_start: false,
            launches: 0,
            launch_flags: None,
        }
    }
}

#[derive(Debug)]
struct SimState {
    block_rate: f64,
    nodes: BTreeMap<usize, SimNodeState>,
    network_height: f64,
    last_update: Option<Instant>,
}

impl SimState {
    fn has_quorum(&self) -> bool {
        let validators = self.nodes.values().filter(|n| n.role.is_validator());
        let total = validators.clone().count();
        let online = validators.filter(|n| n.running).count();
        total > 0 && online > total * 2 / 3
    }

    /// Bring the network up to `now`
    ///
    /// Must run before any change of the running set, so the elapsed
    /// interval is credited with the membership it actually had.
    fn advance(&mut self, now: Instant) {
        if let Some(last) = self.last_update {
            if self.has_quorum() {
                let elapsed = now.saturating_duration_since(last).as_secs_f64();
                self.network_height += elapsed * self.block_rate;
            }
        }
        if self.nodes.values().any(|n| n.running) {
            self.last_update = Some(now);
        } else {
            self.last_update = None;
        }

        let head = self.network_height.floor() as u64;
        for node in self.nodes.values_mut().filter(|n| n.running && !n.stalled) {
            node.height = node.height.max(head);
        }
    }

    fn node_mut(&mut self, ordinal: usize) -> anyhow::Result<&mut SimNodeState> {
        self.nodes
            .get_mut(&ordinal)
            .ok_or_else(|| anyhow::anyhow!("node {} is not registered", ordinal))
    }
}

/// Shared handle to a simulated network
///
/// Clones refer to the same network. Used as the `NodeFactory` of a chain and
/// as the control surface of tests.
#[derive(Clone)]
pub struct SimNetwork {
    state: Arc<Mutex<SimState>>,
    clock: Arc<dyn Clock>,
}

impl SimNetwork {
    /// New empty network finalizing `block_rate` blocks per second
    pub fn new(clock: Arc<dyn Clock>, block_rate: f64) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                block_rate,
                nodes: BTreeMap::new(),
                network_height: 0.0,
                last_update: None,
            })),
            clock,
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut SimState) -> T) -> T {
        let mut state = self.state.lock();
        state.advance(self.clock.now());
        f(&mut state)
    }

    /// Highest height finalized by the network so far
    pub fn network_height(&self) -> u64 {
        self.with_state(|s| s.network_height.floor() as u64)
    }

    pub fn height_of(&self, ordinal: usize) -> Option<u64> {
        self.with_state(|s| s.nodes.get(&ordinal).map(|n| n.height))
    }

    /// Flags of the most recent launch of `ordinal`
    pub fn launch_flags(&self, ordinal: usize) -> Option<Flags> {
        self.state
            .lock()
            .nodes
            .get(&ordinal)
            .and_then(|n| n.launch_flags.clone())
    }

    pub fn launches(&self, ordinal: usize) -> usize {
        self.state.lock().nodes.get(&ordinal).map_or(0, |n| n.launches)
    }

    /// Make status queries of `ordinal` hang forever
    pub fn set_unresponsive(&self, ordinal: usize, unresponsive: bool) {
        if let Some(node) = self.state.lock().nodes.get_mut(&ordinal) {
            node.unresponsive = unresponsive;
        }
    }

    /// Keep `ordinal` running and answering queries, but stop it from
    /// following the network head
    pub fn set_stalled(&self, ordinal: usize, stalled: bool) {
        self.with_state(|s| {
            if let Some(node) = s.nodes.get_mut(&ordinal) {
                node.stalled = stalled;
            }
        });
    }

    /// Make the next launches of `ordinal` fail
    pub fn set_fail_start(&self, ordinal: usize, fail: bool) {
        if let Some(node) = self.state.lock().nodes.get_mut(&ordinal) {
            node.fail_start = fail;
        }
    }

    pub fn set_block_rate(&self, block_rate: f64) {
        self.with_state(|s| s.block_rate = block_rate);
    }
}

impl NodeFactory for SimNetwork {
    fn create(&self, ctx: &NodeContext) -> Box<dyn NodeProcess> {
        self.state
            .lock()
            .nodes
            .insert(ctx.ordinal, SimNodeState::new(ctx.role));
        Box::new(SimulatedNode {
            ordinal: ctx.ordinal,
            network: self.clone(),
        })
    }
}

/// One node of a `SimNetwork`
pub struct SimulatedNode {
    ordinal: usize,
    network: SimNetwork,
}

#[async_trait]
impl NodeProcess for SimulatedNode {
    async fn start(&mut self, spec: &LaunchSpec) -> anyhow::Result<()> {
        let ordinal = self.ordinal;
        self.network.with_state(|s| -> anyhow::Result<()> {
            let node = s.node_mut(ordinal)?;
            if node.fail_start {
                anyhow::bail!("simulated launch failure");
            }
            node.running = true;
            node.launches += 1;
            node.launch_flags = Some(spec.flags.clone());
            debug!("Simulated node {} launched: {:?}", ordinal, spec.flags.to_args());
            Ok(())
        })?;
        // First node up starts the clock of the network
        let now = self.network.clock.now();
        self.network.state.lock().advance(now);
        Ok(())
    }

    async fn stop(&mut self) -> anyhow::Result<()> {
        let ordinal = self.ordinal;
        self.network.with_state(|s| -> anyhow::Result<()> {
            s.node_mut(ordinal)?.running = false;
            Ok(())
        })
    }

    fn is_running(&self) -> bool {
        self.network
            .state
            .lock()
            .nodes
            .get(&self.ordinal)
            .is_some_and(|n| n.running)
    }

    async fn finalized_height(&self) -> anyhow::Result<u64> {
        let ordinal = self.ordinal;
        let unresponsive = self
            .network
            .state
            .lock()
            .nodes
            .get(&ordinal)
            .is_some_and(|n| n.unresponsive);
        if unresponsive {
            return std::future::pending::<anyhow::Result<u64>>().await;
        }

        self.network.with_state(|s| -> anyhow::Result<u64> {
            let node = s.node_mut(ordinal)?;
            if !node.running {
                anyhow::bail!("connection refused");
            }
            Ok(node.height)
        })
    }
}
