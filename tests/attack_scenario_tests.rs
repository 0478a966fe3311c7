/// False command injection against the simulated train controller.
///
/// The injector's writes are accepted like any HMI command; the only place
/// they surface is the next poll, through the topology consistency check and
/// the interlock monitor.
use std::time::Duration;

use metro_scada_sim::config::ScadaConfig;
use metro_scada_sim::event_log::{JournalEntry, JournalEvent};
use metro_scada_sim::modbus::PlcSimulator;
use metro_scada_sim::{
    AnomalyKind, CommandInjector, ControllerId, DataManager, EventJournal, InjectionConfig, InterlockMonitor,
    LineId, MonitorState, TrackModel, TrainOperator, verify_journal_file,
};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

struct AttackHarness {
    config: ScadaConfig,
    sims: Vec<PlcSimulator>,
}

impl AttackHarness {
    async fn start() -> Self {
        let mut config = ScadaConfig::metro_default();
        config.timing.io_timeout_ms = 500;
        let mut sims = Vec::new();
        for endpoint in config.controllers.clone() {
            let sim = PlcSimulator::bind_named(
                endpoint.id.as_str(),
                "127.0.0.1:0",
                endpoint.coil_count,
                endpoint.register_count,
            )
            .await
            .unwrap();
            config.set_address(&endpoint.id, sim.local_addr().to_string()).unwrap();
            sims.push(sim);
        }

        let harness = Self { config, sims };
        // Normal operation: every guard armed, second west-east train running
        {
            let memory = harness.train_plc().memory();
            let mut mem = memory.lock().await;
            for guard in 10..20 {
                mem.coils[guard] = true;
            }
            mem.coils[1] = true;
            mem.registers[1] = 40;
        }
        harness
    }

    fn train_plc(&self) -> &PlcSimulator {
        self.sims.iter().find(|s| s.name() == "PLC-06").unwrap()
    }

    fn injection(&self) -> InjectionConfig {
        let endpoint = self.config.endpoint(&ControllerId::from("PLC-06")).unwrap();
        InjectionConfig::front_sensor_bypass(endpoint).with_timing(Duration::ZERO, Duration::from_millis(20))
    }

    async fn stop(self) {
        for sim in self.sims {
            sim.shutdown().await;
        }
    }
}

#[tokio::test]
async fn test_injection_surfaces_as_unguarded_power() {
    let harness = AttackHarness::start().await;
    let plc06 = ControllerId::from("PLC-06");

    let data = DataManager::new(harness.config.clone()).unwrap();
    data.start().await;
    data.refresh().await.unwrap();
    let mut track = TrackModel::build(&harness.config).unwrap();
    let mut monitor = InterlockMonitor::new();

    track.sync(&data).unwrap();
    assert!(track.check_consistency().is_empty());
    assert_eq!(monitor.observe(&[]), MonitorState::Normal);

    let mut injector = CommandInjector::new(harness.injection());
    injector.connect_with_retry(&CancellationToken::new()).await.unwrap();
    let report = injector.inject_once().await;
    assert!(report.all_acknowledged(), "{:?}", report.outcomes);

    // Poll pending: the aggregator still shows the pre-attack image
    assert_eq!(data.get_coils(&plc06, 0, 2).unwrap(), vec![false, true]);
    assert_eq!(data.get_coils(&plc06, 10, 11).unwrap(), vec![true]);

    let cycle = data.refresh().await.unwrap();
    assert!(cycle.all_refreshed());
    assert!(cycle.mismatched.is_empty());
    assert_eq!(data.get_coils(&plc06, 0, 2).unwrap(), vec![true, false]);
    assert_eq!(data.get_coils(&plc06, 10, 11).unwrap(), vec![false]);

    track.sync(&data).unwrap();
    let anomalies = track.check_consistency();
    assert_eq!(anomalies.len(), 1);
    assert_eq!(anomalies[0].kind, AnomalyKind::UnguardedPower);
    assert_eq!(anomalies[0].element, "weline-t0");

    assert_eq!(monitor.observe(&anomalies), MonitorState::UnderAttack);
    assert_eq!(monitor.tripped_by(), Some(AnomalyKind::UnguardedPower));

    injector.disconnect().await;
    data.shutdown().await;
    harness.stop().await;
}

#[tokio::test]
async fn test_aggregator_and_injector_share_controller() {
    let harness = AttackHarness::start().await;
    let data = DataManager::new(harness.config.clone()).unwrap();
    data.start().await;

    let mut config = harness.injection();
    config.max_rounds = Some(5);
    let mut injector = CommandInjector::new(config);

    let cancel = CancellationToken::new();
    let attack = tokio::spawn(async move { injector.run_sustained(cancel).await });

    // Keep polling while the injector hammers the same PLC
    for _ in 0..5 {
        let report = data.refresh().await.unwrap();
        assert!(report.mismatched.is_empty());
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let stats = attack.await.unwrap().unwrap();
    assert_eq!(stats.rounds, 5);
    assert_eq!(stats.writes_acknowledged, 15);
    assert_eq!(stats.writes_failed, 0);

    data.shutdown().await;
    harness.stop().await;
}

#[tokio::test]
async fn test_injected_writes_are_journaled_and_tamper_evident() {
    let harness = AttackHarness::start().await;
    let dir = TempDir::new().unwrap();
    let journal = EventJournal::create("INJECTOR", Some(dir.path().to_path_buf())).unwrap();
    let path = journal.path().to_path_buf();

    let mut injector = CommandInjector::new(harness.injection()).with_journal(journal);
    injector.connect_with_retry(&CancellationToken::new()).await.unwrap();
    injector.inject_once().await;
    injector.disconnect().await;

    let content = std::fs::read_to_string(&path).unwrap();
    let offsets: Vec<usize> = content
        .lines()
        .map(|l| serde_json::from_str::<JournalEntry>(l).unwrap().event)
        .filter_map(|e| match e {
            JournalEvent::InjectedWrite {
                offset, acknowledged, ..
            } => {
                assert!(acknowledged);
                Some(offset)
            }
            _ => None,
        })
        .collect();
    assert_eq!(offsets, vec![10, 1, 0]);
    assert!(verify_journal_file(&path).unwrap().verified);

    // Hide the guard write by rewriting its value
    let forged = content.replacen("\"offset\":10,\"value\":0", "\"offset\":10,\"value\":1", 1);
    assert_ne!(forged, content);
    std::fs::write(&path, forged).unwrap();
    let result = verify_journal_file(&path).unwrap();
    assert!(!result.verified);
    assert!(result.issues.iter().any(|i| i.contains("entry 0")));

    harness.stop().await;
}

#[tokio::test]
async fn test_injector_waits_for_late_controller() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mut config = ScadaConfig::metro_default();
    config.set_address(&ControllerId::from("PLC-06"), addr.to_string()).unwrap();
    let endpoint = config.endpoint(&ControllerId::from("PLC-06")).unwrap();
    let mut injection = InjectionConfig::front_sensor_bypass(endpoint).with_timing(Duration::ZERO, Duration::ZERO);
    injection.retry.initial = Duration::from_millis(50);
    injection.retry.max = Duration::from_millis(100);

    let late = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(120)).await;
        PlcSimulator::bind_named("PLC-06", &addr.to_string(), 20, 10).await.unwrap()
    });

    let mut injector = CommandInjector::new(injection);
    let attempt = injector.connect_with_retry(&CancellationToken::new()).await.unwrap();
    assert!(attempt > 1);

    let sim = late.await.unwrap();
    assert!(injector.inject_once().await.all_acknowledged());
    injector.disconnect().await;
    sim.shutdown().await;
}

#[tokio::test]
async fn test_operator_power_is_consistent_until_guard_forged() {
    let harness = AttackHarness::start().await;
    let data = Arc::new(DataManager::new(harness.config.clone()).unwrap());
    data.start().await;
    let operator = TrainOperator::new(Arc::clone(&data)).unwrap();
    let mut track = TrackModel::build(&harness.config).unwrap();

    // Legitimate command: every guard is armed, so powering all trains is fine
    assert_eq!(operator.power_all(true).await.unwrap(), 10);
    data.refresh().await.unwrap();
    track.sync(&data).unwrap();
    assert!(track.trains(&LineId::from("weline")).unwrap().iter().all(|t| t.powered));
    assert!(track.check_consistency().is_empty(), "{:?}", track.check_consistency());

    // Forged guard write on the same controller
    let mut injector = CommandInjector::new(harness.injection());
    injector.connect_with_retry(&CancellationToken::new()).await.unwrap();
    assert!(injector.inject_once().await.all_acknowledged());
    injector.disconnect().await;

    data.refresh().await.unwrap();
    track.sync(&data).unwrap();
    let anomalies = track.check_consistency();
    assert_eq!(anomalies.len(), 1);
    assert_eq!(anomalies[0].kind, AnomalyKind::UnguardedPower);
    assert_eq!(anomalies[0].element, "weline-t0");

    data.shutdown().await;
    harness.stop().await;
}
