//! Key generation and chain-spec generation
//!
//! Both are external collaborators: the node binary derives account
//! identifiers from phrases and renders the chain spec. The harness only
//! orders the calls and stores the results.

use crate::node::AccountId;
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::try_join_all;
use indexmap::IndexMap;
use log::{debug, info};
use serde_json::json;
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// Derives an account identifier from a key-derivation phrase
#[async_trait]
pub trait KeyGenerator: Send + Sync {
    async fn account_id(&self, phrase: &str) -> Result<AccountId>;
}

/// Derive identifiers for every phrase, keeping the phrase order
pub async fn generate_keys(
    generator: &dyn KeyGenerator,
    phrases: &[String],
) -> Result<IndexMap<String, AccountId>> {
    let ids = try_join_all(phrases.iter().map(|phrase| generator.account_id(phrase))).await?;
    Ok(phrases.iter().cloned().zip(ids).collect())
}

/// Reference phrases `//0`, `//1`, ... used by the local scenarios
pub fn indexed_phrases(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("//{}", i)).collect()
}

/// Runs `<binary> key inspect <phrase>`
pub struct BinaryKeyGenerator {
    binary: PathBuf,
}

impl BinaryKeyGenerator {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl KeyGenerator for BinaryKeyGenerator {
    async fn account_id(&self, phrase: &str) -> Result<AccountId> {
        let output = Command::new(&self.binary)
            .args(["key", "inspect", phrase])
            .output()
            .await
            .with_context(|| format!("Failed to run {} key inspect", self.binary.display()))?;

        if !output.status.success() {
            anyhow::bail!(
                "key inspect for {} exited with {}: {}",
                phrase,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_inspect_output(&stdout)
            .with_context(|| format!("No SS58 address in key inspect output for {}", phrase))
    }
}

/// Extract the account identifier from `key inspect` output
pub fn parse_inspect_output(stdout: &str) -> Option<AccountId> {
    stdout.lines().find_map(|line| {
        let rest = line.trim().strip_prefix("SS58 Address:")?;
        let id = rest.trim();
        (!id.is_empty()).then(|| AccountId::new(id))
    })
}

/// Deterministic identifiers for simulated chains, no binary involved
pub struct DerivedKeyGenerator;

#[async_trait]
impl KeyGenerator for DerivedKeyGenerator {
    async fn account_id(&self, phrase: &str) -> Result<AccountId> {
        let seed = phrase.trim_start_matches('/');
        if seed.is_empty() {
            anyhow::bail!("Empty derivation phrase");
        }
        Ok(AccountId::new(format!("sim{}", seed)))
    }
}

/// Accounts and metadata embedded into the chain spec
#[derive(Debug, Clone)]
pub struct ChainSpecRequest<'a> {
    pub working_dir: &'a Path,
    pub validators: &'a [AccountId],
    pub nonvalidators: &'a [AccountId],
    pub sudo: &'a AccountId,
    pub chain_type: &'a str,
}

/// Produces the chain-spec bytes every node loads at startup
#[async_trait]
pub trait ChainSpecGenerator: Send + Sync {
    async fn generate(&self, request: &ChainSpecRequest<'_>) -> Result<Vec<u8>>;
}

/// Runs `<binary> bootstrap-chain` and `<binary> bootstrap-node`
pub struct BinaryChainSpecGenerator {
    binary: PathBuf,
}

impl BinaryChainSpecGenerator {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub(crate) fn bootstrap_chain_args(request: &ChainSpecRequest<'_>) -> Vec<String> {
        let account_ids = request
            .validators
            .iter()
            .map(AccountId::as_str)
            .collect::<Vec<_>>()
            .join(",");
        vec![
            "bootstrap-chain".to_string(),
            "--base-path".to_string(),
            request.working_dir.display().to_string(),
            "--account-ids".to_string(),
            account_ids,
            "--sudo-account-id".to_string(),
            request.sudo.to_string(),
            "--chain-type".to_string(),
            request.chain_type.to_string(),
        ]
    }

    async fn run(&self, args: &[String]) -> Result<Vec<u8>> {
        debug!("Running {} {}", self.binary.display(), args.join(" "));
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .with_context(|| format!("Failed to run {}", self.binary.display()))?;

        if !output.status.success() {
            anyhow::bail!(
                "{} exited with {}: {}",
                args[0],
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl ChainSpecGenerator for BinaryChainSpecGenerator {
    async fn generate(&self, request: &ChainSpecRequest<'_>) -> Result<Vec<u8>> {
        let spec = self.run(&Self::bootstrap_chain_args(request)).await?;

        // Non-validators only need their node keys
        for account in request.nonvalidators {
            let args = vec![
                "bootstrap-node".to_string(),
                "--base-path".to_string(),
                request.working_dir.display().to_string(),
                "--account-id".to_string(),
                account.to_string(),
            ];
            self.run(&args).await?;
        }

        info!(
            "Chain spec generated for {} validators and {} non-validators",
            request.validators.len(),
            request.nonvalidators.len()
        );
        Ok(spec)
    }
}

/// Writes a plain JSON chain spec, used for simulated chains
pub struct JsonChainSpecGenerator;

#[async_trait]
impl ChainSpecGenerator for JsonChainSpecGenerator {
    async fn generate(&self, request: &ChainSpecRequest<'_>) -> Result<Vec<u8>> {
        let spec = json!({
            "chainType": request.chain_type,
            "sudo": request.sudo,
            "validators": request.validators,
            "nonvalidators": request.nonvalidators,
        });
        Ok(serde_json::to_vec_pretty(&spec)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_inspect_output() {
        let stdout = "Secret Key URI `//0` is account:\n  \
                      Network ID:        substrate\n  \
                      Secret seed:       0x3b7b\n  \
                      Public key (hex):  0xd43593c7\n  \
                      Account ID:        0xd43593c7\n  \
                      SS58 Address:      5GrwvaEF5zXb26Fz9rcQpDWS57CtERHpNehXCPcNoHGKutQY\n";
        assert_eq!(
            parse_inspect_output(stdout),
            Some(AccountId::new("5GrwvaEF5zXb26Fz9rcQpDWS57CtERHpNehXCPcNoHGKutQY"))
        );
    }

    #[test]
    fn test_parse_inspect_output_without_address() {
        assert_eq!(parse_inspect_output("Invalid phrase/URI given"), None);
        assert_eq!(parse_inspect_output("SS58 Address:   \n"), None);
    }

    #[test]
    fn test_indexed_phrases() {
        assert_eq!(indexed_phrases(3), vec!["//0", "//1", "//2"]);
    }

    #[tokio::test]
    async fn test_generate_keys_keeps_phrase_order() {
        let phrases = indexed_phrases(6);
        let keys = generate_keys(&DerivedKeyGenerator, &phrases).await.unwrap();

        assert_eq!(keys.len(), 6);
        let ids: Vec<_> = keys.values().map(|id| id.to_string()).collect();
        assert_eq!(ids, vec!["sim0", "sim1", "sim2", "sim3", "sim4", "sim5"]);
        assert_eq!(keys["//0"], AccountId::new("sim0"));
    }

    #[tokio::test]
    async fn test_generate_keys_fails_on_bad_phrase() {
        let phrases = vec!["//0".to_string(), "//".to_string()];
        assert!(generate_keys(&DerivedKeyGenerator, &phrases).await.is_err());
    }

    #[test]
    fn test_bootstrap_chain_args() {
        let validators = vec![AccountId::new("a"), AccountId::new("b")];
        let nonvalidators = vec![AccountId::new("c")];
        let sudo = AccountId::new("a");
        let request = ChainSpecRequest {
            working_dir: Path::new("/work"),
            validators: &validators,
            nonvalidators: &nonvalidators,
            sudo: &sudo,
            chain_type: "local",
        };

        assert_eq!(
            BinaryChainSpecGenerator::bootstrap_chain_args(&request),
            vec![
                "bootstrap-chain",
                "--base-path",
                "/work",
                "--account-ids",
                "a,b",
                "--sudo-account-id",
                "a",
                "--chain-type",
                "local"
            ]
        );
    }

    #[tokio::test]
    async fn test_json_chain_spec_embeds_roles() {
        let validators = vec![AccountId::new("a"), AccountId::new("b")];
        let nonvalidators = vec![AccountId::new("c")];
        let sudo = AccountId::new("a");
        let request = ChainSpecRequest {
            working_dir: Path::new("/work"),
            validators: &validators,
            nonvalidators: &nonvalidators,
            sudo: &sudo,
            chain_type: "local",
        };

        let bytes = JsonChainSpecGenerator.generate(&request).await.unwrap();
        let spec: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(spec["chainType"], "local");
        assert_eq!(spec["sudo"], "a");
        assert_eq!(spec["validators"], json!(["a", "b"]));
        assert_eq!(spec["nonvalidators"], json!(["c"]));
    }
}
