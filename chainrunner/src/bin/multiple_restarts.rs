// Multiple restarts driver
//
// Bootstraps a local chain of 4 validators and 2 non-validators, then
// repeatedly stops and restarts one validator and one non-validator while
// checking that finalization keeps going and that the restarted nodes catch
// up.
//
// Usage:
//   WORKDIR=/tmp/workdir ALEPH_NODE_BINARY=./aleph-node cargo run --bin multiple_restarts
//   cargo run --bin multiple_restarts -- --simulate --scenario scenarios/multiple_restarts.yaml
//
// Exit codes: 0 on success, 1 when a liveness or catch-up check fails, 2 when
// the harness itself fails.

use chainrunner::config::DEFAULT_WORKDIR;
use chainrunner::prelude::*;
use clap::Parser;
use log::{error, info, warn};
use std::path::{Path, PathBuf};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "multiple_restarts")]
#[command(about = "Stop and restart nodes of a local chain, checking finalization", long_about = None)]
struct Args {
    /// Working directory for chain spec, logs and node databases
    #[arg(long, env = "WORKDIR", default_value = DEFAULT_WORKDIR)]
    workdir: PathBuf,

    /// Node binary (defaults to <workdir>/aleph-node)
    #[arg(long, env = "ALEPH_NODE_BINARY")]
    binary: Option<PathBuf>,

    /// Number of validators
    #[arg(long, default_value_t = 4)]
    validators: usize,

    /// Number of non-validators
    #[arg(long, default_value_t = 2)]
    nonvalidators: usize,

    /// YAML scenario file (defaults to the built-in three-phase scenario)
    #[arg(long)]
    scenario: Option<PathBuf>,

    /// Bound on each finalized-height query, in milliseconds
    #[arg(long, default_value_t = 5000)]
    query_timeout_ms: u64,

    /// Run against an in-process simulated network under paused time
    #[arg(long, default_value_t = false)]
    simulate: bool,

    /// Enable verbose logging
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path.to_path_buf(),
    }
}

// ============================================================================
// Chain setup
// ============================================================================

async fn bootstrap(args: &Args, config: &HarnessConfig, clock: &Arc<dyn Clock>) -> Result<Chain, ChainError> {
    if args.validators == 0 {
        return Err(ChainError::Config("at least one validator is required".to_string()));
    }

    let phrases = indexed_phrases(args.validators + args.nonvalidators);
    let generator: Box<dyn KeyGenerator> = if args.simulate {
        Box::new(DerivedKeyGenerator)
    } else {
        Box::new(BinaryKeyGenerator::new(&config.binary))
    };
    let keys = generate_keys(generator.as_ref(), &phrases)
        .await
        .map_err(|e| ChainError::Bootstrap(format!("key generation failed: {:#}", e)))?;

    let accounts: Vec<AccountId> = keys.values().cloned().collect();
    let (validators, nonvalidators) = accounts.split_at(args.validators);
    let sudo = keys[&phrases[0]].clone();

    info!("Bootstrapping the chain in {}", config.working_dir.display());
    let mut chain = if args.simulate {
        ChainBuilder::new(config.clone())
            .with_validators(validators.to_vec())
            .with_nonvalidators(nonvalidators.to_vec())
            .with_sudo(sudo)
            .with_chain_spec_generator(Arc::new(JsonChainSpecGenerator))
            .with_node_factory(Arc::new(SimNetwork::new(clock.clone(), 1.0)))
            .build()
            .await?
    } else {
        Chain::bootstrap(
            config.clone(),
            validators.to_vec(),
            nonvalidators.to_vec(),
            sudo,
            "local",
        )
        .await?
    };

    FlagAssigner::new()
        .flag("port", Seq::new(30334))
        .flag("ws_port", Seq::new(9944))
        .flag("rpc_port", Seq::new(9933))
        .flag("unit_creation_delay", 200i64)
        .flag("execution", "Native")
        .apply(&mut chain, &Target::All)?;

    // AlephBFT needs every address up front, otherwise it waits and retries
    derive_flag(&mut chain, &Target::All, "public_addr", |node| {
        node.flags()
            .get_int("port")
            .map(|port| FlagValue::from(format!("/ip4/127.0.0.1/tcp/{}", port)))
    })?;

    Ok(chain)
}

// ============================================================================
// Main
// ============================================================================

async fn run(args: Args) -> i32 {
    let workdir = absolute(&args.workdir);
    let binary = absolute(
        &args
            .binary
            .clone()
            .unwrap_or_else(|| workdir.join("aleph-node")),
    );
    let config = HarnessConfig::new(&workdir, binary)
        .with_query_timeout(std::time::Duration::from_millis(args.query_timeout_ms));

    let scenario = match &args.scenario {
        Some(path) => match ScenarioConfig::load(path).await {
            Ok(scenario) => scenario,
            Err(e) => {
                error!("Failed to load scenario {}: {}", path.display(), e);
                return 2;
            }
        },
        None => ScenarioConfig::default(),
    };

    let clock: Arc<dyn Clock> = if args.simulate {
        Arc::new(PausedClock::new())
    } else {
        Arc::new(SystemClock)
    };

    let mut chain = match bootstrap(&args, &config, &clock).await {
        Ok(chain) => chain,
        Err(e) => {
            error!("{}", e);
            return 2;
        }
    };

    let controller = LifecycleController::default();
    info!("Starting the chain");
    if let Err(e) = controller.start_all(&mut chain).await {
        error!("{}", e);
        let _ = controller.stop_all(&mut chain).await;
        return 2;
    }

    let mut collector = ArtifactCollector::new(scenario.name.clone());
    let mut runner = RestartScenario::new(scenario, clock)
        .with_controller(controller.clone())
        .with_monitor(FinalizationMonitor::new(config.query_timeout()));

    let code = match runner.run(&mut chain).await {
        Ok(report) => {
            for phase in &report.phases {
                info!(
                    "Phase {}: liveness {} (threshold {:.2}), catch up {:?}",
                    phase.phase + 1,
                    phase.liveness_delta,
                    phase.liveness_threshold,
                    phase.catch_up
                );
            }
            0
        }
        Err(e) => {
            error!("{}", e);
            collector.set_failure(e.to_string(), e.exit_code());
            collector.capture_chain(&chain);
            collector.add_snapshots(runner.history());
            match collector.save(config.artifacts_dir()).await {
                Ok(path) => info!("Failure artifact saved to {}", path.display()),
                Err(e) => warn!("Failed to save failure artifact: {:#}", e),
            }
            e.exit_code()
        }
    };

    if let Err(e) = controller.stop_all(&mut chain).await {
        warn!("Teardown failed: {}", e);
    }
    code
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .format_timestamp_millis()
        .init();

    let code = run(args).await;
    std::process::exit(code);
}
