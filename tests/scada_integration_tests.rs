/// End-to-end tests of the polling aggregator and the track model against
/// in-process simulated PLCs on ephemeral localhost ports.
use std::collections::HashMap;

use metro_scada_sim::config::ScadaConfig;
use metro_scada_sim::modbus::{FaultMode, PlcSimulator};
use metro_scada_sim::topology::{ElementKind, SignalAspect};
use metro_scada_sim::{ConnectionState, ControllerId, DataManager, LineId, TrackModel};

struct Plant {
    config: ScadaConfig,
    sims: HashMap<ControllerId, PlcSimulator>,
}

impl Plant {
    /// One simulator per metro controller, with the config pointed at them
    async fn start() -> Self {
        Self::start_with(ScadaConfig::metro_default()).await
    }

    async fn start_with(mut config: ScadaConfig) -> Self {
        config.timing.io_timeout_ms = 500;
        let mut sims = HashMap::new();

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
            sims.insert(endpoint.id.clone(), sim);
        }

        Self { config, sims }
    }

    fn sim(&self, id: &str) -> &PlcSimulator {
        &self.sims[&ControllerId::from(id)]
    }

    async fn set_coil(&self, id: &str, index: usize, value: bool) {
        self.sim(id).memory().lock().await.coils[index] = value;
    }

    async fn set_register(&self, id: &str, index: usize, value: u16) {
        self.sim(id).memory().lock().await.registers[index] = value;
    }

    async fn stop(self) {
        for (_, sim) in self.sims {
            sim.shutdown().await;
        }
    }
}

fn plc(id: &str) -> ControllerId {
    ControllerId::from(id)
}

#[tokio::test]
async fn test_refresh_publishes_declared_coil_vector() {
    let plant = Plant::start().await;
    let pattern: Vec<bool> = (0..15).map(|i| i % 3 == 0).collect();
    for (i, v) in pattern.iter().enumerate() {
        plant.set_coil("PLC-00", i, *v).await;
    }

    let data = DataManager::new(plant.config.clone()).unwrap();
    assert_eq!(data.start().await, 3);
    let report = data.refresh().await.unwrap();
    assert!(report.all_refreshed(), "{:?}", report);

    let snapshot = data.snapshot(&plc("PLC-00")).unwrap();
    assert_eq!(snapshot.coils.len(), 15);
    assert_eq!(snapshot.coils, pattern);
    assert_eq!(snapshot.registers.len(), 31);
    assert_eq!(snapshot.cycle, 1);

    data.shutdown().await;
    plant.stop().await;
}

#[tokio::test]
async fn test_write_visible_only_after_next_poll() {
    let plant = Plant::start().await;
    let data = DataManager::new(plant.config.clone()).unwrap();
    data.start().await;
    data.refresh().await.unwrap();

    data.set_coil(&plc("PLC-00"), 3, true).await.unwrap();
    data.set_register(&plc("PLC-06"), 2, 55).await.unwrap();

    // The controller has it, the snapshot does not yet
    assert!(plant.sim("PLC-00").memory().lock().await.coils[3]);
    assert_eq!(data.get_coils(&plc("PLC-00"), 3, 4).unwrap(), vec![false]);
    assert_eq!(data.get_registers(&plc("PLC-06"), 2, 3).unwrap(), vec![0]);

    data.refresh().await.unwrap();
    assert_eq!(data.get_coils(&plc("PLC-00"), 3, 4).unwrap(), vec![true]);
    assert_eq!(data.get_registers(&plc("PLC-06"), 2, 3).unwrap(), vec![55]);

    data.shutdown().await;
    plant.stop().await;
}

#[tokio::test]
async fn test_failed_read_keeps_previous_snapshot() {
    let plant = Plant::start().await;
    plant.set_register("PLC-06", 0, 42).await;

    let data = DataManager::new(plant.config.clone()).unwrap();
    data.start().await;
    data.refresh().await.unwrap();
    let before = data.snapshot(&plc("PLC-06")).unwrap();
    assert_eq!(before.registers[0], 42);

    plant.sim("PLC-06").set_fault(FaultMode::DropConnections);
    plant.set_register("PLC-06", 0, 7).await;

    let report = data.refresh().await.unwrap();
    assert!(report.failed.contains(&plc("PLC-06")));
    assert!(report.refreshed.contains(&plc("PLC-00")));
    assert_eq!(data.snapshot(&plc("PLC-06")).unwrap(), before);
    assert_eq!(data.connection_state(&plc("PLC-06")).unwrap(), ConnectionState::Disconnected);

    // Recovers on the following cycle once the fault clears
    plant.sim("PLC-06").set_fault(FaultMode::None);
    let report = data.refresh().await.unwrap();
    assert!(report.refreshed.contains(&plc("PLC-06")));
    assert_eq!(data.get_registers(&plc("PLC-06"), 0, 1).unwrap(), vec![7]);

    data.shutdown().await;
    plant.stop().await;
}

#[tokio::test]
async fn test_short_coil_reply_discards_cycle() {
    let plant = Plant::start().await;
    let data = DataManager::new(plant.config.clone()).unwrap();
    data.start().await;
    data.refresh().await.unwrap();
    let before = data.snapshot(&plc("PLC-00")).unwrap();

    plant.sim("PLC-00").set_fault(FaultMode::ShortCoilReply);
    plant.set_coil("PLC-00", 14, true).await;

    let report = data.refresh().await.unwrap();
    assert_eq!(report.mismatched.len(), 1);
    assert_eq!(report.mismatched[0].0, plc("PLC-00"));
    assert_eq!(data.snapshot(&plc("PLC-00")).unwrap(), before);
    assert_eq!(report.refreshed, vec![plc("PLC-01"), plc("PLC-06")]);

    plant.sim("PLC-00").set_fault(FaultMode::None);
    let report = data.refresh().await.unwrap();
    assert!(report.all_refreshed());
    assert_eq!(data.get_coils(&plc("PLC-00"), 14, 15).unwrap(), vec![true]);

    data.shutdown().await;
    plant.stop().await;
}

#[tokio::test]
async fn test_device_exception_on_read_marks_disconnected() {
    let mut plant = Plant::start().await;

    // Controller exposes fewer coils than the registry declares
    let full = plant.sims.remove(&plc("PLC-00")).unwrap();
    full.shutdown().await;
    let small = PlcSimulator::bind_named("PLC-00", "127.0.0.1:0", 4, 31).await.unwrap();
    plant.config.set_address(&plc("PLC-00"), small.local_addr().to_string()).unwrap();
    plant.sims.insert(plc("PLC-00"), small);

    let data = DataManager::new(plant.config.clone()).unwrap();
    assert_eq!(data.start().await, 3);

    for _ in 0..3 {
        let report = data.refresh().await.unwrap();
        assert!(report.failed.contains(&plc("PLC-00")));
        assert!(report.mismatched.is_empty());
        assert_eq!(data.connection_state(&plc("PLC-00")).unwrap(), ConnectionState::Disconnected);
    }
    assert!(!data.snapshot(&plc("PLC-00")).unwrap().is_fresh());
    assert_eq!(data.connection_state(&plc("PLC-06")).unwrap(), ConnectionState::Connected);

    data.shutdown().await;
    plant.stop().await;
}

#[tokio::test]
async fn test_reconnect_state_sequence() {
    let mut plant = Plant::start().await;

    // Take PLC-01 offline, keeping its port number for later
    let sim = plant.sims.remove(&plc("PLC-01")).unwrap();
    let addr = sim.local_addr();
    sim.shutdown().await;

    let data = DataManager::new(plant.config.clone()).unwrap();
    assert_eq!(data.start().await, 2);

    let mut states = Vec::new();
    for _ in 0..3 {
        let report = data.refresh().await.unwrap();
        assert_eq!(report.skipped, vec![plc("PLC-01")]);
        states.push(data.connection_state(&plc("PLC-01")).unwrap());
    }

    let revived = PlcSimulator::bind_named("PLC-01", &addr.to_string(), 4, 8).await.unwrap();
    revived.memory().lock().await.registers[5] = 1;
    plant.sims.insert(plc("PLC-01"), revived);

    let report = data.refresh().await.unwrap();
    states.push(data.connection_state(&plc("PLC-01")).unwrap());
    assert_eq!(
        states,
        vec![
            ConnectionState::Disconnected,
            ConnectionState::Disconnected,
            ConnectionState::Disconnected,
            ConnectionState::Connected,
        ]
    );
    assert_eq!(report.connection_changes, vec![(plc("PLC-01"), ConnectionState::Connected)]);
    assert_eq!(data.get_registers(&plc("PLC-01"), 5, 6).unwrap(), vec![1]);

    data.shutdown().await;
    plant.stop().await;
}

#[tokio::test]
async fn test_every_sensor_resolves_to_its_register() {
    let plant = Plant::start().await;
    let data = DataManager::new(plant.config.clone()).unwrap();
    data.start().await;
    let mut track = TrackModel::build(&plant.config).unwrap();

    let sensors: Vec<(LineId, usize)> = track
        .lines()
        .flat_map(|l| l.sensors.iter().map(|s| (s.line.clone(), s.position)))
        .collect();
    assert_eq!(sensors.len(), 39);

    for (line, position) in sensors {
        let addr = track
            .segment_map()
            .resolve(&line, ElementKind::Sensor, position)
            .cloned()
            .unwrap();
        plant.set_register(addr.controller.as_str(), addr.offset, 1).await;
        data.refresh().await.unwrap();
        track.sync(&data).unwrap();

        let occupied: Vec<String> = track
            .lines()
            .flat_map(|l| l.sensors.iter().filter(|s| s.occupied).map(|s| s.id.clone()))
            .collect();
        assert_eq!(occupied, vec![format!("{}-s{}", line, position)]);

        plant.set_register(addr.controller.as_str(), addr.offset, 0).await;
    }

    data.shutdown().await;
    plant.stop().await;
}

#[tokio::test]
async fn test_cross_line_trigger_explains_stop() {
    let plant = Plant::start().await;
    for guard in 10..20 {
        plant.set_coil("PLC-06", guard, true).await;
    }
    // ccline sensor 12 lives on PLC-00 register 17 + 12
    plant.set_register("PLC-00", 29, 1).await;
    plant.set_coil("PLC-00", 0, true).await;
    plant.set_coil("PLC-00", 7, true).await;

    let data = DataManager::new(plant.config.clone()).unwrap();
    data.start().await;
    data.refresh().await.unwrap();
    let mut track = TrackModel::build(&plant.config).unwrap();
    track.sync(&data).unwrap();

    let signals = track.signals(&LineId::from("weline")).unwrap();
    assert_eq!(signals[0].aspect, SignalAspect::Stop);
    assert_eq!(signals[7].aspect, SignalAspect::Stop);
    assert!(track.check_consistency().is_empty(), "{:?}", track.check_consistency());

    // Drop the stop on one of them while the trigger is still occupied
    plant.set_coil("PLC-00", 7, false).await;
    data.refresh().await.unwrap();
    track.sync(&data).unwrap();
    let anomalies = track.check_consistency();
    assert_eq!(anomalies.len(), 1);
    // Coil 7 of the west-east line is the east-end signal
    assert_eq!(anomalies[0].element, "we-1");

    data.shutdown().await;
    plant.stop().await;
}

#[tokio::test]
async fn test_station_controller_feeds_platforms() {
    let plant = Plant::start_with(ScadaConfig::metro_with_stations("127.0.0.1", 5020)).await;
    // Train standing at the third west-east platform, held by its departure signal
    plant.set_register("PLC-03", 2, 1).await;
    plant.set_coil("PLC-03", 2, true).await;
    // Last cross-city platform: register and coil 16 + 5
    plant.set_register("PLC-03", 21, 1).await;

    let data = DataManager::new(plant.config.clone()).unwrap();
    assert_eq!(data.start().await, 4);
    let report = data.refresh().await.unwrap();
    assert!(report.all_refreshed(), "{:?}", report);

    let mut track = TrackModel::build(&plant.config).unwrap();
    track.sync(&data).unwrap();

    let we = track.stations(&LineId::from("weline")).unwrap();
    assert_eq!(we.len(), 10);
    let occupied: Vec<&str> = we.iter().filter(|s| s.occupied).map(|s| s.id.as_str()).collect();
    assert_eq!(occupied, vec!["weline-st2"]);
    assert_eq!(we[2].departure, SignalAspect::Stop);

    let cc = track.stations(&LineId::from("ccline")).unwrap();
    assert!(cc[5].occupied);
    assert_eq!(cc[5].departure, SignalAspect::Clear);
    assert!(track.stations(&LineId::from("nsline")).unwrap().iter().all(|s| !s.occupied));

    data.shutdown().await;
    plant.stop().await;
}
