// Controller registry and track-line bindings
// Loaded once (JSON or built-in metro layout), validated, then read-only

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, ScadaError};
use crate::modbus::frame::{MAX_READ_COILS, MAX_READ_REGISTERS};
use crate::types::{ControllerId, ControllerRole, IndexRange, LineId};

/// One PLC on the field bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerEndpoint {
    /// Controller identity (e.g. "PLC-00")
    pub id: ControllerId,

    /// Network address, `host:port`
    pub address: String,

    /// Modbus unit identifier
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,

    /// Declared coil bank size
    pub coil_count: usize,

    /// Declared holding-register bank size
    pub register_count: usize,

    pub role: ControllerRole,
}

fn default_unit_id() -> u8 {
    1
}

/// Reference to a sensor on a named line, as written in configuration
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TriggerRef {
    pub line: LineId,
    pub sensor: usize,
}

impl TriggerRef {
    pub fn new(line: &str, sensor: usize) -> Self {
        Self {
            line: LineId::from(line),
            sensor,
        }
    }
}

/// Sensors whose occupancy should set / clear one signal
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalTriggers {
    /// Signal name shown to operators (e.g. "we-0"); positional when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub trigger_on: Vec<TriggerRef>,
    #[serde(default)]
    pub trigger_off: Vec<TriggerRef>,
}

/// Sensor bank of a line: one holding register per sensor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorBinding {
    pub controller: ControllerId,
    pub registers: IndexRange,
}

/// Signal bank of a line: one coil per signal (`true` = Stop)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalBinding {
    pub controller: ControllerId,
    pub coils: IndexRange,

    /// One entry per signal, in coil order
    #[serde(default)]
    pub triggers: Vec<SignalTriggers>,
}

/// Train slots of a line on the train controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainBinding {
    pub controller: ControllerId,

    /// Power coils, one per slot
    pub power_coils: IndexRange,

    /// Collision-guard ("front-sensor safe") coils, one per slot
    pub guard_coils: IndexRange,

    /// Speed registers, one per slot
    pub speed_registers: IndexRange,
}

impl TrainBinding {
    pub fn slot_count(&self) -> usize {
        self.power_coils.len()
    }
}

/// Platform occupancy sensors and departure signals of a line, held on a
/// station controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationBinding {
    pub controller: ControllerId,

    /// Platform sensors, one holding register per station
    pub sensors: IndexRange,

    /// Departure signals, one coil per station (`true` = Stop)
    pub signals: IndexRange,
}

impl StationBinding {
    pub fn station_count(&self) -> usize {
        self.sensors.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineConfig {
    pub id: LineId,
    pub sensors: SensorBinding,
    #[serde(default)]
    pub signals: Option<SignalBinding>,
    #[serde(default)]
    pub trains: Option<TrainBinding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stations: Option<StationBinding>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Poll cycle period
    pub update_interval_ms: u64,

    /// Bound on every connect, request and reply
    pub io_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            update_interval_ms: 500,
            io_timeout_ms: 1000,
        }
    }
}

impl TimingConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

/// Complete deployment description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScadaConfig {
    pub controllers: Vec<ControllerEndpoint>,
    pub lines: Vec<LineConfig>,
    #[serde(default)]
    pub timing: TimingConfig,
}

impl ScadaConfig {
    /// Load and validate a JSON configuration file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: ScadaConfig = serde_json::from_str(&raw)
            .map_err(|e| ScadaError::config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| ScadaError::config(e.to_string()))
    }

    pub fn endpoint(&self, id: &ControllerId) -> Option<&ControllerEndpoint> {
        self.controllers.iter().find(|c| &c.id == id)
    }

    pub fn line(&self, id: &LineId) -> Option<&LineConfig> {
        self.lines.iter().find(|l| &l.id == id)
    }

    /// Re-point a controller at another address (ephemeral test ports, NAT'd labs)
    pub fn set_address(&mut self, id: &ControllerId, address: impl Into<String>) -> Result<()> {
        let endpoint = self
            .controllers
            .iter_mut()
            .find(|c| &c.id == id)
            .ok_or_else(|| ScadaError::config(format!("unknown controller {}", id)))?;
        endpoint.address = address.into();
        Ok(())
    }

    /// Check every structural rule once. Nothing downstream re-checks bounds
    /// against the declaration, so this must reject anything out of range.
    pub fn validate(&self) -> Result<()> {
        if self.timing.update_interval_ms == 0 || self.timing.io_timeout_ms == 0 {
            return Err(ScadaError::config("timing values must be non-zero"));
        }

        let mut endpoints: HashMap<&ControllerId, &ControllerEndpoint> = HashMap::new();
        for c in &self.controllers {
            if endpoints.insert(&c.id, c).is_some() {
                return Err(ScadaError::config(format!("duplicate controller {}", c.id)));
            }
            if c.coil_count > MAX_READ_COILS as usize {
                return Err(ScadaError::config(format!(
                    "{} declares {} coils, limit is {}",
                    c.id, c.coil_count, MAX_READ_COILS
                )));
            }
            if c.register_count > MAX_READ_REGISTERS as usize {
                return Err(ScadaError::config(format!(
                    "{} declares {} registers, limit is {}",
                    c.id, c.register_count, MAX_READ_REGISTERS
                )));
            }
        }

        let mut line_ids = HashSet::new();
        for line in &self.lines {
            if !line_ids.insert(&line.id) {
                return Err(ScadaError::config(format!("duplicate line {}", line.id)));
            }
        }

        // (controller, is_coil) -> ranges claimed so far
        let mut claimed: HashMap<(ControllerId, bool), Vec<(IndexRange, String)>> = HashMap::new();
        let mut claim = |controller: &ControllerId, coils: bool, range: IndexRange, what: String| -> Result<()> {
            let endpoint = *endpoints
                .get(controller)
                .ok_or_else(|| ScadaError::config(format!("{} bound to unknown controller {}", what, controller)))?;
            let limit = if coils {
                endpoint.coil_count
            } else {
                endpoint.register_count
            };
            if !range.is_well_formed() || range.end > limit {
                return Err(ScadaError::config(format!(
                    "{} range {} outside {} bounds (0..{})",
                    what, range, controller, limit
                )));
            }
            let key = (endpoint.id.clone(), coils);
            let entry = claimed.entry(key).or_default();
            if let Some((_, other)) = entry.iter().find(|(r, _)| r.overlaps(&range)) {
                return Err(ScadaError::config(format!("{} overlaps {} on {}", what, other, controller)));
            }
            entry.push((range, what));
            Ok(())
        };

        for line in &self.lines {
            claim(
                &line.sensors.controller,
                false,
                line.sensors.registers,
                format!("{} sensors", line.id),
            )?;

            if let Some(signals) = &line.signals {
                claim(&signals.controller, true, signals.coils, format!("{} signals", line.id))?;
                if !signals.triggers.is_empty() && signals.triggers.len() != signals.coils.len() {
                    return Err(ScadaError::config(format!(
                        "{} has {} signals but {} trigger entries",
                        line.id,
                        signals.coils.len(),
                        signals.triggers.len()
                    )));
                }
            }

            if let Some(trains) = &line.trains {
                let slots = trains.slot_count();
                if trains.guard_coils.len() != slots || trains.speed_registers.len() != slots {
                    return Err(ScadaError::config(format!(
                        "{} train ranges disagree on slot count",
                        line.id
                    )));
                }
                claim(&trains.controller, true, trains.power_coils, format!("{} train power", line.id))?;
                claim(&trains.controller, true, trains.guard_coils, format!("{} train guard", line.id))?;
                claim(
                    &trains.controller,
                    false,
                    trains.speed_registers,
                    format!("{} train speed", line.id),
                )?;
            }

            if let Some(stations) = &line.stations {
                if stations.signals.len() != stations.station_count() {
                    return Err(ScadaError::config(format!(
                        "{} has {} station sensors but {} station signals",
                        line.id,
                        stations.station_count(),
                        stations.signals.len()
                    )));
                }
                claim(
                    &stations.controller,
                    false,
                    stations.sensors,
                    format!("{} station sensors", line.id),
                )?;
                claim(
                    &stations.controller,
                    true,
                    stations.signals,
                    format!("{} station signals", line.id),
                )?;
            }
        }

        for line in &self.lines {
            let Some(signals) = &line.signals else { continue };
            for (k, triggers) in signals.triggers.iter().enumerate() {
                for r in triggers.trigger_on.iter().chain(&triggers.trigger_off) {
                    self.check_trigger(r)
                        .map_err(|e| ScadaError::config(format!("{} signal {}: {}", line.id, k, e)))?;
                }
            }
        }

        Ok(())
    }

    fn check_trigger(&self, r: &TriggerRef) -> std::result::Result<(), String> {
        let line = self
            .line(&r.line)
            .ok_or_else(|| format!("trigger references unknown line {}", r.line))?;
        let count = line.sensors.registers.len();
        if r.sensor >= count {
            return Err(format!(
                "trigger sensor {}-s{} out of range (line has {})",
                r.line, r.sensor, count
            ));
        }
        Ok(())
    }

    /// Built-in layout of the metro deployment: two junction-signal PLCs
    /// and one train PLC, on consecutive local ports.
    pub fn metro_default() -> Self {
        Self::metro_on_host("127.0.0.1", 5020)
    }

    pub fn metro_on_host(host: &str, base_port: u16) -> Self {
        let plc00 = ControllerId::from("PLC-00");
        let plc01 = ControllerId::from("PLC-01");
        let plc06 = ControllerId::from("PLC-06");

        let controllers = vec![
            ControllerEndpoint {
                id: plc00.clone(),
                address: format!("{}:{}", host, base_port),
                unit_id: 1,
                coil_count: 15,
                register_count: 31,
                role: ControllerRole::JunctionSignal,
            },
            ControllerEndpoint {
                id: plc01.clone(),
                address: format!("{}:{}", host, base_port + 1),
                unit_id: 1,
                coil_count: 4,
                register_count: 8,
                role: ControllerRole::JunctionSignal,
            },
            ControllerEndpoint {
                id: plc06.clone(),
                address: format!("{}:{}", host, base_port + 6),
                unit_id: 1,
                coil_count: 20,
                register_count: 10,
                role: ControllerRole::Train,
            },
        ];

        let trig = |id: &str, line: &str, on: &[usize], off: &[usize]| SignalTriggers {
            id: Some(id.to_string()),
            trigger_on: on.iter().map(|s| TriggerRef::new(line, *s)).collect(),
            trigger_off: off.iter().map(|s| TriggerRef::new(line, *s)).collect(),
        };

        // Junction signals on the west-east line are driven by cross-city sensors.
        // Coil order runs west to east, names pair up around the junction.
        let weline_triggers = vec![
            trig("we-0", "ccline", &[12], &[13]),
            trig("we-2", "ccline", &[10], &[11]),
            trig("we-4", "ccline", &[8], &[9]),
            trig("we-6", "ccline", &[6], &[7]),
            trig("we-7", "ccline", &[6], &[7]),
            trig("we-5", "ccline", &[8], &[9]),
            trig("we-3", "ccline", &[10], &[11]),
            trig("we-1", "ccline", &[12], &[13]),
        ];
        let ccline_triggers = vec![
            trig("cc-0", "nsline", &[0, 6], &[1, 7]),
            trig("cc-1", "nsline", &[4], &[5]),
            trig("cc-2", "nsline", &[2], &[3]),
            trig("cc-3", "weline", &[7, 9], &[8, 10]),
            trig("cc-4", "weline", &[5, 11], &[6, 12]),
            trig("cc-5", "weline", &[3, 13], &[4, 14]),
            trig("cc-6", "weline", &[1, 15], &[2, 16]),
        ];
        let nsline_triggers = vec![
            trig("ns-0", "ccline", &[0], &[1]),
            trig("ns-1", "ccline", &[0], &[1]),
            trig("ns-2", "ccline", &[2], &[3]),
            trig("ns-3", "ccline", &[4], &[5]),
        ];

        let trains = |start: usize, end: usize| TrainBinding {
            controller: plc06.clone(),
            power_coils: IndexRange::new(start, end),
            guard_coils: IndexRange::new(start + 10, end + 10),
            speed_registers: IndexRange::new(start, end),
        };

        let lines = vec![
            LineConfig {
                id: LineId::from("weline"),
                sensors: SensorBinding {
                    controller: plc00.clone(),
                    registers: IndexRange::new(0, 17),
                },
                signals: Some(SignalBinding {
                    controller: plc00.clone(),
                    coils: IndexRange::new(0, 8),
                    triggers: weline_triggers,
                }),
                trains: Some(trains(0, 4)),
                stations: None,
            },
            LineConfig {
                id: LineId::from("nsline"),
                sensors: SensorBinding {
                    controller: plc01.clone(),
                    registers: IndexRange::new(0, 8),
                },
                signals: Some(SignalBinding {
                    controller: plc01,
                    coils: IndexRange::new(0, 4),
                    triggers: nsline_triggers,
                }),
                trains: Some(trains(4, 7)),
                stations: None,
            },
            LineConfig {
                id: LineId::from("ccline"),
                sensors: SensorBinding {
                    controller: plc00.clone(),
                    registers: IndexRange::new(17, 31),
                },
                signals: Some(SignalBinding {
                    controller: plc00,
                    coils: IndexRange::new(8, 15),
                    triggers: ccline_triggers,
                }),
                trains: Some(trains(7, 10)),
                stations: None,
            },
        ];

        Self {
            controllers,
            lines,
            timing: TimingConfig::default(),
        }
    }

    /// Metro layout plus the station controller PLC-03 (base port + 3):
    /// platform sensors on registers and departure signals on coils,
    /// ten stations on the west-east line and six on each of the others.
    pub fn metro_with_stations(host: &str, base_port: u16) -> Self {
        let mut config = Self::metro_on_host(host, base_port);
        let plc03 = ControllerId::from("PLC-03");
        config.controllers.push(ControllerEndpoint {
            id: plc03.clone(),
            address: format!("{}:{}", host, base_port + 3),
            unit_id: 1,
            coil_count: 22,
            register_count: 22,
            role: ControllerRole::Station,
        });

        for line in &mut config.lines {
            let (start, end) = match line.id.as_str() {
                "weline" => (0, 10),
                "nsline" => (10, 16),
                "ccline" => (16, 22),
                _ => continue,
            };
            line.stations = Some(StationBinding {
                controller: plc03.clone(),
                sensors: IndexRange::new(start, end),
                signals: IndexRange::new(start, end),
            });
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metro_default_is_valid() {
        let config = ScadaConfig::metro_default();
        config.validate().unwrap();

        let plc00 = config.endpoint(&ControllerId::from("PLC-00")).unwrap();
        assert_eq!(plc00.coil_count, 15);
        assert_eq!(plc00.register_count, 31);
        assert_eq!(config.timing.update_interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_range_beyond_declared_count_rejected() {
        let mut config = ScadaConfig::metro_default();
        config.lines[0].sensors.registers = IndexRange::new(0, 40);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ScadaError::Configuration(_)));
    }

    #[test]
    fn test_overlapping_coil_bindings_rejected() {
        let mut config = ScadaConfig::metro_default();
        // Train guard coils collide with the power coils of the next line
        config.lines[0].trains.as_mut().unwrap().guard_coils = IndexRange::new(4, 8);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_trigger_line_rejected() {
        let mut config = ScadaConfig::metro_default();
        config.lines[0].signals.as_mut().unwrap().triggers[0]
            .trigger_on
            .push(TriggerRef::new("airport", 0));
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("airport"), "{}", err);
    }

    #[test]
    fn test_out_of_range_trigger_rejected() {
        let mut config = ScadaConfig::metro_default();
        config.lines[2].signals.as_mut().unwrap().triggers[0].trigger_off = vec![TriggerRef::new("nsline", 8)];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_station_layout_is_valid() {
        let config = ScadaConfig::metro_with_stations("127.0.0.1", 5020);
        config.validate().unwrap();

        let plc03 = config.endpoint(&ControllerId::from("PLC-03")).unwrap();
        assert_eq!(plc03.role, ControllerRole::Station);
        assert_eq!(plc03.address, "127.0.0.1:5023");

        let counts: Vec<usize> = config
            .lines
            .iter()
            .map(|l| l.stations.as_ref().unwrap().station_count())
            .collect();
        assert_eq!(counts, vec![10, 6, 6]);
    }

    #[test]
    fn test_station_ranges_are_claimed() {
        let mut config = ScadaConfig::metro_with_stations("127.0.0.1", 5020);
        config.lines[1].stations.as_mut().unwrap().signals = IndexRange::new(8, 14);
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("overlaps"), "{}", err);

        let mut config = ScadaConfig::metro_with_stations("127.0.0.1", 5020);
        config.lines[2].stations.as_mut().unwrap().signals = IndexRange::new(16, 21);
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("station signals"), "{}", err);
    }

    #[test]
    fn test_signal_names_follow_deployment() {
        let config = ScadaConfig::metro_default();
        let names: Vec<&str> = config.lines[0]
            .signals
            .as_ref()
            .unwrap()
            .triggers
            .iter()
            .filter_map(|t| t.id.as_deref())
            .collect();
        assert_eq!(names, vec!["we-0", "we-2", "we-4", "we-6", "we-7", "we-5", "we-3", "we-1"]);
    }

    #[test]
    fn test_json_round_trip_through_file() {
        let config = ScadaConfig::metro_default();
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), config.to_json_pretty().unwrap()).unwrap();

        let loaded = ScadaConfig::from_json_file(file.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_timing_uses_defaults() {
        let json = r#"{
            "controllers": [
                {"id": "PLC-09", "address": "127.0.0.1:5029", "coil_count": 2,
                 "register_count": 2, "role": "station"}
            ],
            "lines": []
        }"#;
        let config: ScadaConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.timing, TimingConfig::default());
        assert_eq!(config.controllers[0].unit_id, 1);
        config.validate().unwrap();
    }
}
