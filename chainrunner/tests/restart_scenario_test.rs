#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
//! End-to-end restart scenarios against a simulated network
//!
//! Every test runs under paused time, so the 90s/30s/45s windows of the
//! reference scenario complete instantly.

use chainrunner::prelude::*;
use tempfile::TempDir;
use tokio::time::Duration;

struct TestChain {
    chain: Chain,
    network: SimNetwork,
    clock: Arc<dyn Clock>,
    _dir: TempDir,
}

async fn reference_chain() -> TestChain {
    let dir = TempDir::new().unwrap();
    let clock: Arc<dyn Clock> = Arc::new(PausedClock::attach());
    let network = SimNetwork::new(clock.clone(), 1.0);

    let phrases = indexed_phrases(6);
    let keys = generate_keys(&DerivedKeyGenerator, &phrases).await.unwrap();
    let accounts: Vec<AccountId> = keys.values().cloned().collect();

    let mut chain = ChainBuilder::new(HarnessConfig::new(dir.path(), "aleph-node"))
        .with_validators(accounts[..4].to_vec())
        .with_nonvalidators(accounts[4..].to_vec())
        .with_sudo(keys["//0"].clone())
        .with_chain_type("local")
        .with_chain_spec_generator(Arc::new(JsonChainSpecGenerator))
        .with_node_factory(Arc::new(network.clone()))
        .build()
        .await
        .unwrap();

    FlagAssigner::new()
        .flag("port", Seq::new(30334))
        .flag("ws_port", Seq::new(9944))
        .flag("rpc_port", Seq::new(9933))
        .flag("unit_creation_delay", 200i64)
        .flag("execution", "Native")
        .apply(&mut chain, &Target::All)
        .unwrap();
    derive_flag(&mut chain, &Target::All, "public_addr", |node| {
        node.flags()
            .get_int("port")
            .map(|port| FlagValue::from(format!("/ip4/127.0.0.1/tcp/{}", port)))
    })
    .unwrap();

    TestChain {
        chain,
        network,
        clock,
        _dir: dir,
    }
}

#[tokio::test(start_paused = true)]
async fn test_reference_scenario_passes() {
    let TestChain {
        mut chain,
        network,
        clock,
        _dir,
    } = reference_chain().await;

    let controller = LifecycleController::default();
    controller.start_all(&mut chain).await.unwrap();

    let start = clock.now();
    let mut scenario = RestartScenario::new(ScenarioConfig::default(), clock.clone());
    let report = scenario.run(&mut chain).await.unwrap();

    // 90+30+45, then twice 5+10+20
    assert_eq!(clock.now() - start, Duration::from_secs(235));
    assert_eq!(report.phases.len(), 3);
    for phase in &report.phases {
        assert!(phase.liveness_delta as f64 >= phase.liveness_threshold);
        assert!(phase.catch_up.values().all(|&d| d > 5));
    }
    assert_eq!(report.phases[0].liveness_delta, 30);
    assert_eq!(report.phases[1].liveness_delta, 10);

    // 9 snapshots, three per phase
    assert_eq!(scenario.history().len(), 9);
    assert_eq!(chain.running(), vec![0, 1, 2, 3, 4, 5]);
    assert_eq!(network.network_height(), 235);

    // Restarted nodes were launched three extra times with the same flags
    assert_eq!(network.launches(3), 4);
    let flags = network.launch_flags(3).unwrap();
    assert_eq!(flags.get_int("port"), Some(30337));
    assert_eq!(flags.get_int("rpc-port"), Some(9936));
    assert!(flags.contains("validator"));
    assert!(!network.launch_flags(4).unwrap().contains("validator"));
    assert_eq!(
        network.launch_flags(4).unwrap().get("public-addr"),
        Some(&FlagValue::from("/ip4/127.0.0.1/tcp/30338"))
    );

    controller.stop_all(&mut chain).await.unwrap();
    assert!(chain.running().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stopping_half_the_validators_stalls_finalization() {
    let TestChain {
        mut chain,
        clock,
        _dir,
        ..
    } = reference_chain().await;
    LifecycleController::default().start_all(&mut chain).await.unwrap();

    let config = ScenarioConfig::from_yaml(include_str!("../scenarios/quorum_loss.yaml")).unwrap();
    let mut scenario = RestartScenario::new(config, clock);
    let err = scenario.run(&mut chain).await.unwrap_err();

    assert_eq!(err.exit_code(), 1);
    assert!(err.to_string().starts_with("Finalization stalled"));
    match err {
        ScenarioError::Check(CheckFailure::Liveness { observed, expected, .. }) => {
            assert_eq!(observed, 0);
            assert!((expected - 13.5).abs() < 1e-9);
        }
        other => panic!("expected liveness failure, got {:?}", other),
    }
    // Run stopped before the restart
    assert_eq!(scenario.history().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_node_that_cannot_restart_fails_the_run() {
    let TestChain {
        mut chain,
        network,
        clock,
        _dir,
    } = reference_chain().await;
    LifecycleController::default().start_all(&mut chain).await.unwrap();

    // Node 4 goes down with the others but never comes back
    network.set_fail_start(4, true);
    let config = ScenarioConfig {
        phases: vec![Phase::new(90, 30, 45)],
        ..ScenarioConfig::default()
    };
    let err = RestartScenario::new(config, clock)
        .run(&mut chain)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ScenarioError::Chain(ChainError::Incomparable { ordinal: 4 })
    ));
    assert_eq!(err.exit_code(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_slow_chain_fails_catch_up() {
    let TestChain {
        mut chain,
        network,
        clock,
        _dir,
    } = reference_chain().await;
    LifecycleController::default().start_all(&mut chain).await.unwrap();

    // Liveness is calibrated to the slow rate, the catch-up allowance is not
    network.set_block_rate(0.25);
    let config = ScenarioConfig {
        phases: vec![Phase::new(10, 10, 10)],
        liveness: LivenessCheck {
            margin_factor: 0.9,
            block_rate: 0.25,
        },
        ..ScenarioConfig::default()
    };
    let err = RestartScenario::new(config, clock)
        .run(&mut chain)
        .await
        .unwrap_err();

    // Non-validators are judged first
    match err {
        ScenarioError::Check(CheckFailure::CatchUp {
            ordinal,
            role,
            observed,
            allowed,
        }) => {
            assert_eq!(ordinal, 4);
            assert_eq!(role, "nonvalidator");
            // 2 blocks at the first snapshot, 7 after catching up
            assert_eq!(observed, 5);
            assert_eq!(allowed, 5);
        }
        other => panic!("expected catch-up failure, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_unresponsive_node_is_absent_from_snapshot() {
    let TestChain {
        mut chain,
        network,
        clock,
        _dir,
    } = reference_chain().await;
    LifecycleController::default().start_all(&mut chain).await.unwrap();
    clock.sleep(Duration::from_secs(10)).await;

    network.set_unresponsive(5, true);
    let monitor = FinalizationMonitor::new(Duration::from_secs(2));
    let snapshot = monitor.snapshot(&mut chain).await;

    assert_eq!(snapshot.absent(), vec![5]);
    assert_eq!(snapshot.get(0), Some(10));
    assert_eq!(chain[5].last_finalized(), None);
    assert!(chain[5].is_running());
}

#[tokio::test(start_paused = true)]
async fn test_stalled_validator_fails_while_observer_catches_up() {
    let TestChain {
        mut chain,
        network,
        clock,
        _dir,
    } = reference_chain().await;
    LifecycleController::default().start_all(&mut chain).await.unwrap();

    // Node 3 keeps answering but never follows the head again
    network.set_stalled(3, true);
    let config = ScenarioConfig {
        phases: vec![Phase::new(10, 10, 10)],
        ..ScenarioConfig::default()
    };
    let mut scenario = RestartScenario::new(config, clock);
    let err = scenario.run(&mut chain).await.unwrap_err();

    assert_eq!(err.exit_code(), 1);
    match err {
        ScenarioError::Check(CheckFailure::CatchUp {
            ordinal,
            role,
            observed,
            ..
        }) => {
            assert_eq!(ordinal, 3);
            assert_eq!(role, "validator");
            assert_eq!(observed, 0);
        }
        other => panic!("expected catch-up failure, got {:?}", other),
    }

    // The non-validator restarted alongside it did catch up
    let history = scenario.history();
    let before = &history[0].snapshot;
    let after = &history[2].snapshot;
    assert!(delta_since_last_known(before, after, 4).unwrap() > 5);
    assert_eq!(chain.running(), vec![0, 1, 2, 3, 4, 5]);
}
