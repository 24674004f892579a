//! NodeHandle - one node of the chain
//!
//! A `NodeHandle` owns the flag mapping a node is launched with, its
//! last-known finalized height, and a `NodeProcess` backend that actually
//! runs it (an OS process in production, a simulated node in tests).

use crate::error::ChainError;
use async_trait::async_trait;
use indexmap::IndexMap;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Account identifier derived from a key-derivation phrase
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    /// Wrap an identifier produced by the key generator
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AccountId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Role of a node, fixed at bootstrap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Validator,
    #[serde(rename = "nonvalidator")]
    NonValidator,
}

impl NodeRole {
    pub fn is_validator(&self) -> bool {
        matches!(self, NodeRole::Validator)
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Validator => f.write_str("validator"),
            NodeRole::NonValidator => f.write_str("nonvalidator"),
        }
    }
}

/// Value of a single command-line flag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlagValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl FlagValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            FlagValue::Int(v) => Some(*v),
            FlagValue::Str(s) => s.parse().ok(),
            FlagValue::Bool(_) => None,
        }
    }
}

impl fmt::Display for FlagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlagValue::Bool(v) => write!(f, "{}", v),
            FlagValue::Int(v) => write!(f, "{}", v),
            FlagValue::Str(v) => f.write_str(v),
        }
    }
}

impl From<bool> for FlagValue {
    fn from(v: bool) -> Self {
        FlagValue::Bool(v)
    }
}

impl From<i64> for FlagValue {
    fn from(v: i64) -> Self {
        FlagValue::Int(v)
    }
}

impl From<u16> for FlagValue {
    fn from(v: u16) -> Self {
        FlagValue::Int(v as i64)
    }
}

impl From<&str> for FlagValue {
    fn from(v: &str) -> Self {
        FlagValue::Str(v.to_string())
    }
}

impl From<String> for FlagValue {
    fn from(v: String) -> Self {
        FlagValue::Str(v)
    }
}

/// Ordered flag mapping
///
/// Keys are normalized on insertion (`_` becomes `-`), so `rpc_port` and
/// `rpc-port` address the same flag. Insertion order is kept so the rendered
/// command line is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Flags(IndexMap<String, FlagValue>);

impl Flags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn normalize_key(key: &str) -> String {
        key.trim_start_matches("--").replace('_', "-")
    }

    /// Insert or replace a flag, returning the previous value
    pub fn insert(&mut self, key: &str, value: impl Into<FlagValue>) -> Option<FlagValue> {
        self.0.insert(Self::normalize_key(key), value.into())
    }

    /// Builder-style insert
    pub fn with(mut self, key: &str, value: impl Into<FlagValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&FlagValue> {
        self.0.get(&Self::normalize_key(key))
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(FlagValue::as_int)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(&Self::normalize_key(key))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FlagValue)> {
        self.0.iter()
    }

    /// Copy of `self` with every entry of `overrides` applied on top
    pub fn merged(&self, overrides: &Flags) -> Flags {
        let mut merged = self.clone();
        for (key, value) in overrides.iter() {
            merged.0.insert(key.clone(), value.clone());
        }
        merged
    }

    /// Render as command-line arguments
    ///
    /// `--key value` for strings and integers, `--key` for `true`, nothing for
    /// `false`.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(self.0.len() * 2);
        for (key, value) in self.0.iter() {
            match value {
                FlagValue::Bool(true) => args.push(format!("--{}", key)),
                FlagValue::Bool(false) => {}
                other => {
                    args.push(format!("--{}", key));
                    args.push(other.to_string());
                }
            }
        }
        args
    }
}

/// Everything a backend needs to launch a node
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub ordinal: usize,
    pub account: AccountId,
    pub role: NodeRole,
    /// Accumulated flags merged with the call-time overrides
    pub flags: Flags,
}

/// Capability interface over a running node
///
/// Implemented by `ProcessNode` for real binaries and `SimulatedNode` for
/// tests. Backends report failures with `anyhow` context; `NodeHandle` maps
/// them onto `ChainError`.
#[async_trait]
pub trait NodeProcess: Send + Sync {
    /// Launch the node. Only called while the node is stopped.
    async fn start(&mut self, spec: &LaunchSpec) -> anyhow::Result<()>;

    /// Ask the node to terminate. Only called while the node is running.
    async fn stop(&mut self) -> anyhow::Result<()>;

    fn is_running(&self) -> bool;

    /// Finalized block height as reported by the node's status endpoint
    async fn finalized_height(&self) -> anyhow::Result<u64>;
}

/// One node of the chain
pub struct NodeHandle {
    ordinal: usize,
    role: NodeRole,
    account: AccountId,
    flags: Flags,
    backend: Box<dyn NodeProcess>,
    /// Set on first successful launch, flags are frozen from then on
    started: bool,
    last_finalized: Option<u64>,
}

impl NodeHandle {
    pub(crate) fn new(
        ordinal: usize,
        role: NodeRole,
        account: AccountId,
        backend: Box<dyn NodeProcess>,
    ) -> Self {
        Self {
            ordinal,
            role,
            account,
            flags: Flags::new(),
            backend,
            started: false,
            last_finalized: None,
        }
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn account(&self) -> &AccountId {
        &self.account
    }

    pub fn flags(&self) -> &Flags {
        &self.flags
    }

    pub fn is_running(&self) -> bool {
        self.backend.is_running()
    }

    /// Whether the node has been launched at least once
    pub fn has_started(&self) -> bool {
        self.started
    }

    /// Height seen by the most recent successful query, if any
    pub fn last_finalized(&self) -> Option<u64> {
        self.last_finalized
    }

    /// Set a single flag
    ///
    /// # Errors
    ///
    /// `ChainError::Config` once the node has been launched.
    pub fn set_flag(&mut self, key: &str, value: impl Into<FlagValue>) -> Result<(), ChainError> {
        self.ensure_configurable()?;
        self.flags.insert(key, value);
        Ok(())
    }

    pub(crate) fn ensure_configurable(&self) -> Result<(), ChainError> {
        if self.started {
            return Err(ChainError::Config(format!(
                "node {} has already been started, flags are frozen",
                self.ordinal
            )));
        }
        Ok(())
    }

    /// Launch the node with its flags plus `extra`
    ///
    /// Starting a running node logs a warning and succeeds without touching it.
    pub async fn start(&mut self, extra: &Flags) -> Result<(), ChainError> {
        if self.backend.is_running() {
            warn!("Node {} is already running, not starting it again", self.ordinal);
            return Ok(());
        }

        let spec = LaunchSpec {
            ordinal: self.ordinal,
            account: self.account.clone(),
            role: self.role,
            flags: self.flags.merged(extra),
        };
        debug!("Node {} launch flags: {:?}", self.ordinal, spec.flags.to_args());

        self.backend
            .start(&spec)
            .await
            .map_err(|source| ChainError::Process {
                ordinal: self.ordinal,
                source,
            })?;
        self.started = true;
        info!("Node {} ({}) started", self.ordinal, self.role);
        Ok(())
    }

    /// Terminate the node; stopping a stopped node is a no-op
    pub async fn stop(&mut self) -> Result<(), ChainError> {
        if !self.backend.is_running() {
            debug!("Node {} is already stopped", self.ordinal);
            return Ok(());
        }

        self.backend
            .stop()
            .await
            .map_err(|source| ChainError::Process {
                ordinal: self.ordinal,
                source,
            })?;
        info!("Node {} ({}) stopped", self.ordinal, self.role);
        Ok(())
    }

    /// Query the node's finalized block height
    ///
    /// # Errors
    ///
    /// `ChainError::Unreachable` if the node is stopped or the query fails.
    pub async fn query_finalized(&self) -> Result<u64, ChainError> {
        if !self.backend.is_running() {
            return Err(ChainError::Unreachable {
                ordinal: self.ordinal,
                reason: "node is stopped".to_string(),
            });
        }

        self.backend
            .finalized_height()
            .await
            .map_err(|e| ChainError::Unreachable {
                ordinal: self.ordinal,
                reason: format!("{:#}", e),
            })
    }

    pub(crate) fn record_finalized(&mut self, height: u64) {
        self.last_finalized = Some(height);
    }
}

impl fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeHandle")
            .field("ordinal", &self.ordinal)
            .field("role", &self.role)
            .field("account", &self.account)
            .field("running", &self.backend.is_running())
            .field("last_finalized", &self.last_finalized)
            .finish()
    }
}
