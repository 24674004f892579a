//! FlagAssigner - per-node configuration before launch
//!
//! A flag is either the same constant for every targeted node or drawn from a
//! sequence, where the n-th targeted node (in topology order) gets
//! `base + n * step`. Port numbers are the usual use of sequences.

use crate::chain::Chain;
use crate::error::ChainError;
use crate::node::{FlagValue, Flags, NodeHandle};
use indexmap::IndexMap;
use log::debug;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Which nodes a flag assignment applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    All,
    Validators,
    NonValidators,
    Ordinals(Vec<usize>),
}

impl Target {
    pub fn matches(&self, node: &NodeHandle) -> bool {
        match self {
            Target::All => true,
            Target::Validators => node.role().is_validator(),
            Target::NonValidators => !node.role().is_validator(),
            Target::Ordinals(ordinals) => ordinals.contains(&node.ordinal()),
        }
    }

    /// Targeted ordinals in topology order, without duplicates
    pub(crate) fn resolve(&self, chain: &Chain) -> Result<Vec<usize>, ChainError> {
        if let Target::Ordinals(ordinals) = self {
            let unique: BTreeSet<usize> = ordinals.iter().copied().collect();
            if let Some(&unknown) = unique.iter().find(|&&o| o >= chain.len()) {
                return Err(ChainError::UnknownNode(unknown));
            }
            return Ok(unique.into_iter().collect());
        }
        Ok(chain
            .nodes()
            .iter()
            .filter(|node| self.matches(node))
            .map(NodeHandle::ordinal)
            .collect())
    }
}

/// Arithmetic sequence cursor
///
/// Yields `base`, `base + step`, `base + 2 * step`, ... and stops instead of
/// overflowing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seq {
    next: Option<i64>,
    step: i64,
}

impl Seq {
    pub fn new(base: i64) -> Self {
        Self {
            next: Some(base),
            step: 1,
        }
    }

    pub fn with_step(mut self, step: i64) -> Self {
        self.step = step;
        self
    }
}

impl Iterator for Seq {
    type Item = i64;

    fn next(&mut self) -> Option<i64> {
        let current = self.next?;
        self.next = current.checked_add(self.step);
        Some(current)
    }
}

/// Sequence cursor shared between several flag keys
///
/// Clones share one position: a second key drawing from the same `SharedSeq`
/// continues where the first stopped.
#[derive(Debug, Clone)]
pub struct SharedSeq(Arc<Mutex<Seq>>);

impl SharedSeq {
    pub fn new(seq: Seq) -> Self {
        Self(Arc::new(Mutex::new(seq)))
    }

    pub fn next_value(&self) -> Option<i64> {
        self.0.lock().next()
    }
}

/// How the value of one flag is produced for each targeted node
#[derive(Debug, Clone)]
pub enum FlagSpec {
    Const(FlagValue),
    /// Fresh cursor, owned by this one flag key
    Seq(Seq),
    Shared(SharedSeq),
}

impl FlagSpec {
    fn next_value(&mut self, key: &str) -> Result<FlagValue, ChainError> {
        let value = match self {
            FlagSpec::Const(value) => return Ok(value.clone()),
            FlagSpec::Seq(seq) => seq.next(),
            FlagSpec::Shared(shared) => shared.next_value(),
        };
        value
            .map(FlagValue::Int)
            .ok_or_else(|| ChainError::Config(format!("sequence for flag {} is exhausted", key)))
    }
}

impl From<FlagValue> for FlagSpec {
    fn from(value: FlagValue) -> Self {
        FlagSpec::Const(value)
    }
}

impl From<Seq> for FlagSpec {
    fn from(seq: Seq) -> Self {
        FlagSpec::Seq(seq)
    }
}

impl From<SharedSeq> for FlagSpec {
    fn from(seq: SharedSeq) -> Self {
        FlagSpec::Shared(seq)
    }
}

impl From<bool> for FlagSpec {
    fn from(v: bool) -> Self {
        FlagSpec::Const(v.into())
    }
}

impl From<i64> for FlagSpec {
    fn from(v: i64) -> Self {
        FlagSpec::Const(v.into())
    }
}

impl From<&str> for FlagSpec {
    fn from(v: &str) -> Self {
        FlagSpec::Const(v.into())
    }
}

fn ensure_configurable(chain: &Chain, ordinals: &[usize]) -> Result<(), ChainError> {
    for &ordinal in ordinals {
        chain.node(ordinal)?.ensure_configurable()?;
    }
    Ok(())
}

fn apply_plan(chain: &mut Chain, plan: Vec<(usize, String, FlagValue)>) -> Result<(), ChainError> {
    for (ordinal, key, value) in plan {
        debug!("Node {}: {} = {}", ordinal, key, value);
        chain.node_mut(ordinal)?.set_flag(&key, value)?;
    }
    Ok(())
}

/// Apply every `(key, spec)` entry to the nodes matching `target`
///
/// Nothing is written unless every targeted node is still configurable and
/// every sequence produced a value.
pub fn set_flags<K, S>(
    chain: &mut Chain,
    specs: impl IntoIterator<Item = (K, S)>,
    target: &Target,
) -> Result<(), ChainError>
where
    K: Into<String>,
    S: Into<FlagSpec>,
{
    let ordinals = target.resolve(chain)?;
    ensure_configurable(chain, &ordinals)?;

    let mut plan = Vec::new();
    for (key, spec) in specs {
        let key = key.into();
        let mut spec = spec.into();
        for &ordinal in &ordinals {
            plan.push((ordinal, key.clone(), spec.next_value(&key)?));
        }
    }
    apply_plan(chain, plan)
}

/// Set `key` on each targeted node to a value computed from the node itself
///
/// Nodes for which `derive` returns `None` are left untouched.
pub fn derive_flag<F>(
    chain: &mut Chain,
    target: &Target,
    key: &str,
    derive: F,
) -> Result<(), ChainError>
where
    F: Fn(&NodeHandle) -> Option<FlagValue>,
{
    let ordinals = target.resolve(chain)?;
    ensure_configurable(chain, &ordinals)?;

    let mut plan = Vec::new();
    for &ordinal in &ordinals {
        if let Some(value) = derive(chain.node(ordinal)?) {
            plan.push((ordinal, key.to_string(), value));
        }
    }
    apply_plan(chain, plan)
}

/// Builder collecting flag specs before applying them in one go
///
/// ```rust,ignore
/// FlagAssigner::new()
///     .flag("port", Seq::new(30334))
///     .flag("rpc_port", Seq::new(9933))
///     .flag("unit_creation_delay", 200i64)
///     .flag("execution", "Native")
///     .apply(&mut chain, &Target::All)?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct FlagAssigner {
    specs: IndexMap<String, FlagSpec>,
}

impl FlagAssigner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flag(mut self, key: &str, spec: impl Into<FlagSpec>) -> Self {
        self.specs.insert(Flags::normalize_key(key), spec.into());
        self
    }

    pub fn apply(self, chain: &mut Chain, target: &Target) -> Result<(), ChainError> {
        set_flags(chain, self.specs, target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::fixtures::sim_chain;
    use proptest::prelude::*;
    use tempfile::TempDir;

    #[test]
    fn test_seq_yields_arithmetic_progression() {
        let seq = Seq::new(30334).with_step(2);
        assert_eq!(seq.take(3).collect::<Vec<_>>(), vec![30334, 30336, 30338]);
    }

    #[test]
    fn test_seq_stops_before_overflow() {
        let mut seq = Seq::new(i64::MAX - 1);
        assert_eq!(seq.next(), Some(i64::MAX - 1));
        assert_eq!(seq.next(), Some(i64::MAX));
        assert_eq!(seq.next(), None);
    }

    #[tokio::test]
    async fn test_reference_flag_assignment() {
        let dir = TempDir::new().unwrap();
        let (mut chain, _network) = sim_chain(&dir, 4, 2).await;

        FlagAssigner::new()
            .flag("port", Seq::new(30334))
            .flag("ws_port", Seq::new(9944))
            .flag("rpc_port", Seq::new(9933))
            .flag("unit_creation_delay", 200i64)
            .flag("execution", "Native")
            .apply(&mut chain, &Target::All)
            .unwrap();

        for (i, node) in chain.nodes().iter().enumerate() {
            let i = i as i64;
            assert_eq!(node.flags().get_int("port"), Some(30334 + i));
            assert_eq!(node.flags().get_int("ws-port"), Some(9944 + i));
            assert_eq!(node.flags().get_int("rpc-port"), Some(9933 + i));
            assert_eq!(node.flags().get_int("unit-creation-delay"), Some(200));
            assert_eq!(node.flags().get("execution"), Some(&FlagValue::from("Native")));
        }
    }

    #[tokio::test]
    async fn test_shared_seq_continues_across_keys() {
        let dir = TempDir::new().unwrap();
        let (mut chain, _network) = sim_chain(&dir, 2, 1).await;

        let ports = SharedSeq::new(Seq::new(40000));
        set_flags(
            &mut chain,
            vec![("port", ports.clone()), ("rpc_port", ports.clone())],
            &Target::All,
        )
        .unwrap();

        let ports_of = |key: &str| -> Vec<i64> {
            chain
                .nodes()
                .iter()
                .map(|n| n.flags().get_int(key).unwrap())
                .collect()
        };
        assert_eq!(ports_of("port"), vec![40000, 40001, 40002]);
        assert_eq!(ports_of("rpc-port"), vec![40003, 40004, 40005]);
        assert_eq!(ports.next_value(), Some(40006));
    }

    #[tokio::test]
    async fn test_role_targets() {
        let dir = TempDir::new().unwrap();
        let (mut chain, _network) = sim_chain(&dir, 2, 2).await;

        set_flags(&mut chain, [("port", Seq::new(100))], &Target::NonValidators).unwrap();
        set_flags(&mut chain, [("validator", true)], &Target::Validators).unwrap();

        let ports: Vec<_> = chain.nodes().iter().map(|n| n.flags().get_int("port")).collect();
        assert_eq!(ports, vec![None, None, Some(100), Some(101)]);
        assert!(chain[0].flags().contains("validator"));
        assert!(!chain[3].flags().contains("validator"));
    }

    #[tokio::test]
    async fn test_ordinal_target_is_deduplicated_and_sorted() {
        let dir = TempDir::new().unwrap();
        let (mut chain, _network) = sim_chain(&dir, 3, 0).await;

        set_flags(
            &mut chain,
            [("port", Seq::new(10))],
            &Target::Ordinals(vec![2, 0, 2]),
        )
        .unwrap();
        assert_eq!(chain[0].flags().get_int("port"), Some(10));
        assert_eq!(chain[1].flags().get_int("port"), None);
        assert_eq!(chain[2].flags().get_int("port"), Some(11));

        let err = set_flags(&mut chain, [("port", 1i64)], &Target::Ordinals(vec![0, 9])).unwrap_err();
        assert!(matches!(err, ChainError::UnknownNode(9)));
        assert_eq!(chain[0].flags().get_int("port"), Some(10));
    }

    #[tokio::test]
    async fn test_started_node_rejects_whole_batch() {
        let dir = TempDir::new().unwrap();
        let (mut chain, _network) = sim_chain(&dir, 3, 0).await;
        chain[1].start(&Flags::new()).await.unwrap();

        let err = set_flags(&mut chain, [("port", Seq::new(1))], &Target::All).unwrap_err();
        assert!(matches!(err, ChainError::Config(_)));
        for node in chain.nodes() {
            assert!(!node.flags().contains("port"));
        }

        // Nodes that were never started can still be configured on their own
        set_flags(&mut chain, [("port", 7i64)], &Target::Ordinals(vec![0, 2])).unwrap();
        assert_eq!(chain[2].flags().get_int("port"), Some(7));
    }

    #[tokio::test]
    async fn test_exhausted_sequence_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let (mut chain, _network) = sim_chain(&dir, 3, 0).await;

        let err = set_flags(&mut chain, [("port", Seq::new(i64::MAX - 1))], &Target::All).unwrap_err();
        assert!(matches!(err, ChainError::Config(_)));
        assert!(chain.nodes().iter().all(|n| n.flags().is_empty()));
    }

    #[tokio::test]
    async fn test_derive_public_addr_from_port() {
        let dir = TempDir::new().unwrap();
        let (mut chain, _network) = sim_chain(&dir, 2, 1).await;

        set_flags(&mut chain, [("port", Seq::new(30334))], &Target::Validators).unwrap();
        derive_flag(&mut chain, &Target::All, "public_addr", |node| {
            node.flags()
                .get_int("port")
                .map(|port| format!("/ip4/127.0.0.1/tcp/{}", port).into())
        })
        .unwrap();

        assert_eq!(
            chain[1].flags().get("public-addr"),
            Some(&FlagValue::from("/ip4/127.0.0.1/tcp/30335"))
        );
        // No port, nothing derived
        assert!(!chain[2].flags().contains("public-addr"));
    }

    proptest! {
        #[test]
        fn prop_seq_assigns_base_plus_index_times_step(
            validators in 1usize..5,
            nonvalidators in 0usize..4,
            base in -1_000_000i64..1_000_000,
            step in -100i64..100,
        ) {
            let dir = TempDir::new().unwrap();
            let chain = tokio_test::block_on(async {
                let (mut chain, _network) = sim_chain(&dir, validators, nonvalidators).await;
                set_flags(&mut chain, [("port", Seq::new(base).with_step(step))], &Target::All).unwrap();
                chain
            });

            prop_assert_eq!(chain.len(), validators + nonvalidators);
            for (i, node) in chain.nodes().iter().enumerate() {
                prop_assert_eq!(node.flags().get_int("port"), Some(base + i as i64 * step));
            }
        }
    }
}
