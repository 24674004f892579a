//! Chain - the ordered set of nodes forming one test network
//!
//! Nodes are created once at bootstrap: validators first, then
//! non-validators, each list in input order. Ordinals index straight into
//! the node vector and never change afterwards.

use crate::config::HarnessConfig;
use crate::error::ChainError;
use crate::genesis::{BinaryChainSpecGenerator, ChainSpecGenerator, ChainSpecRequest};
use crate::node::{AccountId, NodeHandle, NodeProcess, NodeRole};
use crate::process::ProcessNodeFactory;
use log::info;
use std::collections::HashSet;
use std::ops::{Index, IndexMut};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Where a node keeps its files
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub ordinal: usize,
    pub account: AccountId,
    pub role: NodeRole,
    pub base_path: PathBuf,
    pub chain_spec: PathBuf,
    pub log_file: PathBuf,
}

/// Creates the backend of every node at bootstrap
pub trait NodeFactory: Send + Sync {
    fn create(&self, ctx: &NodeContext) -> Box<dyn NodeProcess>;
}

/// Builder for `Chain` with fluent API
///
/// # Example
///
/// ```rust,ignore
/// let network = SimNetwork::new(clock, 1.0);
/// let chain = ChainBuilder::new(config)
///     .with_validators(keys[..4].to_vec())
///     .with_nonvalidators(keys[4..].to_vec())
///     .with_sudo(keys[0].clone())
///     .with_chain_spec_generator(Arc::new(JsonChainSpecGenerator))
///     .with_node_factory(Arc::new(network.clone()))
///     .build()
///     .await?;
/// ```
pub struct ChainBuilder {
    config: HarnessConfig,
    validators: Vec<AccountId>,
    nonvalidators: Vec<AccountId>,
    sudo: Option<AccountId>,
    chain_type: String,
    spec_generator: Option<Arc<dyn ChainSpecGenerator>>,
    node_factory: Option<Arc<dyn NodeFactory>>,
}

impl ChainBuilder {
    /// Create new builder
    ///
    /// Defaults: chain type `local`, sudo is the first validator, chain spec
    /// and node processes come from `config.binary`.
    pub fn new(config: HarnessConfig) -> Self {
        Self {
            config,
            validators: Vec::new(),
            nonvalidators: Vec::new(),
            sudo: None,
            chain_type: "local".to_string(),
            spec_generator: None,
            node_factory: None,
        }
    }

    pub fn with_validators(mut self, accounts: Vec<AccountId>) -> Self {
        self.validators = accounts;
        self
    }

    pub fn with_nonvalidators(mut self, accounts: Vec<AccountId>) -> Self {
        self.nonvalidators = accounts;
        self
    }

    pub fn with_sudo(mut self, account: AccountId) -> Self {
        self.sudo = Some(account);
        self
    }

    pub fn with_chain_type(mut self, chain_type: impl Into<String>) -> Self {
        self.chain_type = chain_type.into();
        self
    }

    pub fn with_chain_spec_generator(mut self, generator: Arc<dyn ChainSpecGenerator>) -> Self {
        self.spec_generator = Some(generator);
        self
    }

    pub fn with_node_factory(mut self, factory: Arc<dyn NodeFactory>) -> Self {
        self.node_factory = Some(factory);
        self
    }

    fn validate(&self) -> Result<(), ChainError> {
        if self.validators.is_empty() {
            return Err(ChainError::Bootstrap(
                "at least one validator account is required".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for account in self.validators.iter().chain(self.nonvalidators.iter()) {
            if !seen.insert(account) {
                return Err(ChainError::Bootstrap(format!(
                    "account {} appears more than once",
                    account
                )));
            }
        }
        Ok(())
    }

    /// Generate the chain spec and create one node per account
    ///
    /// # Errors
    ///
    /// `ChainError::Bootstrap` on an empty validator list, a duplicated
    /// account, or a failing chain-spec generator.
    pub async fn build(self) -> Result<Chain, ChainError> {
        self.validate()?;

        let sudo = match self.sudo {
            Some(sudo) => sudo,
            None => self.validators[0].clone(),
        };
        let spec_generator = self
            .spec_generator
            .unwrap_or_else(|| Arc::new(BinaryChainSpecGenerator::new(&self.config.binary)));
        let node_factory = self
            .node_factory
            .unwrap_or_else(|| Arc::new(ProcessNodeFactory::from_config(&self.config)));

        tokio::fs::create_dir_all(&self.config.working_dir).await?;

        let request = ChainSpecRequest {
            working_dir: &self.config.working_dir,
            validators: &self.validators,
            nonvalidators: &self.nonvalidators,
            sudo: &sudo,
            chain_type: &self.chain_type,
        };
        let spec = spec_generator
            .generate(&request)
            .await
            .map_err(|e| ChainError::Bootstrap(format!("chain spec generation failed: {:#}", e)))?;
        let chain_spec = self.config.chain_spec_path();
        tokio::fs::write(&chain_spec, spec).await?;

        let accounts = self
            .validators
            .into_iter()
            .map(|account| (account, NodeRole::Validator))
            .chain(
                self.nonvalidators
                    .into_iter()
                    .map(|account| (account, NodeRole::NonValidator)),
            );

        let mut nodes = Vec::new();
        for (ordinal, (account, role)) in accounts.enumerate() {
            let ctx = NodeContext {
                ordinal,
                base_path: self.config.node_base_path(&account),
                log_file: self.config.node_log_path(&account),
                chain_spec: chain_spec.clone(),
                account,
                role,
            };
            let backend = node_factory.create(&ctx);
            nodes.push(NodeHandle::new(ordinal, role, ctx.account, backend));
        }

        info!(
            "Bootstrapped {} chain with {} nodes in {}",
            self.chain_type,
            nodes.len(),
            self.config.working_dir.display()
        );

        Ok(Chain {
            nodes,
            sudo,
            chain_type: self.chain_type,
            working_dir: self.config.working_dir,
            chain_spec,
        })
    }
}

/// Ordered collection of nodes sharing one chain spec
#[derive(Debug)]
pub struct Chain {
    nodes: Vec<NodeHandle>,
    sudo: AccountId,
    chain_type: String,
    working_dir: PathBuf,
    chain_spec: PathBuf,
}

impl Chain {
    /// Bootstrap a chain of real node processes driven by `config.binary`
    pub async fn bootstrap(
        config: HarnessConfig,
        validators: Vec<AccountId>,
        nonvalidators: Vec<AccountId>,
        sudo: AccountId,
        chain_type: &str,
    ) -> Result<Chain, ChainError> {
        ChainBuilder::new(config)
            .with_validators(validators)
            .with_nonvalidators(nonvalidators)
            .with_sudo(sudo)
            .with_chain_type(chain_type)
            .build()
            .await
    }

    /// All nodes, indexed by ordinal
    pub fn nodes(&self) -> &[NodeHandle] {
        &self.nodes
    }

    pub(crate) fn nodes_mut(&mut self) -> &mut [NodeHandle] {
        &mut self.nodes
    }

    pub fn node(&self, ordinal: usize) -> Result<&NodeHandle, ChainError> {
        self.nodes.get(ordinal).ok_or(ChainError::UnknownNode(ordinal))
    }

    pub fn node_mut(&mut self, ordinal: usize) -> Result<&mut NodeHandle, ChainError> {
        self.nodes
            .get_mut(ordinal)
            .ok_or(ChainError::UnknownNode(ordinal))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn validators(&self) -> impl Iterator<Item = &NodeHandle> {
        self.nodes.iter().filter(|n| n.role().is_validator())
    }

    pub fn nonvalidators(&self) -> impl Iterator<Item = &NodeHandle> {
        self.nodes.iter().filter(|n| !n.role().is_validator())
    }

    /// Ordinals of running nodes
    pub fn running(&self) -> Vec<usize> {
        self.nodes
            .iter()
            .filter(|n| n.is_running())
            .map(NodeHandle::ordinal)
            .collect()
    }

    /// Fraction of validators that are currently stopped
    pub fn offline_validator_fraction(&self) -> f64 {
        let total = self.validators().count();
        if total == 0 {
            return 0.0;
        }
        let offline = self.validators().filter(|n| !n.is_running()).count();
        offline as f64 / total as f64
    }

    pub fn sudo_account(&self) -> &AccountId {
        &self.sudo
    }

    pub fn chain_type(&self) -> &str {
        &self.chain_type
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn chain_spec_path(&self) -> &Path {
        &self.chain_spec
    }
}

impl Index<usize> for Chain {
    type Output = NodeHandle;

    fn index(&self, ordinal: usize) -> &NodeHandle {
        &self.nodes[ordinal]
    }
}

impl IndexMut<usize> for Chain {
    fn index_mut(&mut self, ordinal: usize) -> &mut NodeHandle {
        &mut self.nodes[ordinal]
    }
}
