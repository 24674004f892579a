//! ProcessNode - a node running as an OS process
//!
//! The node binary is launched as
//! `<binary> --base-path <workdir>/<account> --chain <chainspec> <flags...>`
//! with stdout and stderr appended to `<workdir>/<account>.log`. Stopping
//! sends SIGTERM and does not wait for the process to exit; a background task
//! reaps it.

use crate::chain::{NodeContext, NodeFactory};
use crate::config::{HarnessConfig, DEFAULT_QUERY_TIMEOUT_MS};
use crate::node::{Flags, LaunchSpec, NodeProcess};
use crate::rpc::RpcClient;
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, warn};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};

/// RPC port a node listens on when no `rpc-port` flag is set
pub const DEFAULT_RPC_PORT: u16 = 9933;

/// Creates `ProcessNode` backends for a chain
#[derive(Debug, Clone)]
pub struct ProcessNodeFactory {
    binary: PathBuf,
    rpc_host: String,
    query_timeout: Duration,
}

impl ProcessNodeFactory {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            rpc_host: "127.0.0.1".to_string(),
            query_timeout: Duration::from_millis(DEFAULT_QUERY_TIMEOUT_MS),
        }
    }

    pub fn from_config(config: &HarnessConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            rpc_host: config.rpc_host.clone(),
            query_timeout: config.query_timeout(),
        }
    }
}

impl NodeFactory for ProcessNodeFactory {
    fn create(&self, ctx: &NodeContext) -> Box<dyn NodeProcess> {
        Box::new(ProcessNode {
            binary: self.binary.clone(),
            ctx: ctx.clone(),
            rpc_host: self.rpc_host.clone(),
            query_timeout: self.query_timeout,
            child: Mutex::new(None),
            rpc: None,
        })
    }
}

/// Full argument list of one launch
pub(crate) fn launch_args(ctx: &NodeContext, flags: &Flags) -> Vec<String> {
    let mut args = vec![
        "--base-path".to_string(),
        ctx.base_path.display().to_string(),
        "--chain".to_string(),
        ctx.chain_spec.display().to_string(),
    ];
    args.extend(flags.to_args());
    args
}

pub struct ProcessNode {
    binary: PathBuf,
    ctx: NodeContext,
    rpc_host: String,
    query_timeout: Duration,
    child: Mutex<Option<Child>>,
    rpc: Option<RpcClient>,
}

impl ProcessNode {
    async fn open_log(&self) -> Result<std::fs::File> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.ctx.log_file)
            .await
            .with_context(|| format!("Failed to open log file {}", self.ctx.log_file.display()))?;
        Ok(file.into_std().await)
    }
}

#[async_trait]
impl NodeProcess for ProcessNode {
    async fn start(&mut self, spec: &LaunchSpec) -> Result<()> {
        tokio::fs::create_dir_all(&self.ctx.base_path)
            .await
            .with_context(|| format!("Failed to create {}", self.ctx.base_path.display()))?;

        let stdout = self.open_log().await?;
        let stderr = stdout.try_clone().context("Failed to duplicate log handle")?;
        let args = launch_args(&self.ctx, &spec.flags);
        debug!("Spawning {} {}", self.binary.display(), args.join(" "));

        let child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.binary.display()))?;

        let port = spec
            .flags
            .get_int("rpc-port")
            .unwrap_or(DEFAULT_RPC_PORT as i64);
        self.rpc = Some(RpcClient::new(
            format!("http://{}:{}", self.rpc_host, port),
            self.query_timeout,
        )?);
        *self.child.get_mut() = Some(child);
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        let Some(mut child) = self.child.get_mut().take() else {
            return Ok(());
        };

        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if let Some(pid) = child.id() {
                if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    warn!("SIGTERM to node {} failed ({}), killing it", self.ctx.ordinal, e);
                    child.start_kill().context("Failed to kill node process")?;
                }
            }
        }
        #[cfg(not(unix))]
        child.start_kill().context("Failed to kill node process")?;

        let ordinal = self.ctx.ordinal;
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!("Node {} exited with {}", ordinal, status),
                Err(e) => warn!("Failed to reap node {}: {}", ordinal, e),
            }
        });
        Ok(())
    }

    fn is_running(&self) -> bool {
        let mut child = self.child.lock();
        let exited = match child.as_mut() {
            None => return false,
            Some(process) => match process.try_wait() {
                Ok(None) => false,
                Ok(Some(status)) => {
                    warn!("Node {} exited on its own with {}", self.ctx.ordinal, status);
                    true
                }
                Err(e) => {
                    warn!("Failed to poll node {}: {}", self.ctx.ordinal, e);
                    true
                }
            },
        };
        if exited {
            *child = None;
        }
        !exited
    }

    async fn finalized_height(&self) -> Result<u64> {
        self.rpc
            .as_ref()
            .context("Node has not been launched")?
            .finalized_height()
            .await
    }
}
