/// Track topology: sensors, signals, trains and stations derived from controller I/O.
///
/// The graph is static; only element state changes. Each cycle the model
/// pulls its bindings out of the aggregator snapshot (`sync`), and the
/// consistency checker compares signal aspects and train guards against the
/// trigger metadata.
pub mod consistency;
pub mod elements;
pub mod segment_map;

use std::collections::HashMap;
use tracing::{debug, warn};

pub use consistency::{Anomaly, AnomalyKind};
pub use elements::{Sensor, SensorRef, Signal, SignalAspect, Station, Train};
pub use segment_map::{ElementKey, ElementKind, SegmentMap};

use crate::config::{LineConfig, ScadaConfig, TriggerRef};
use crate::data_manager::DataManager;
use crate::error::{Result, ScadaError};
use crate::types::{IoAddress, LineId};

/// State of one track line
#[derive(Debug, Clone)]
pub struct Line {
    pub id: LineId,
    pub sensors: Vec<Sensor>,
    pub signals: Vec<Signal>,
    pub trains: Vec<Train>,
    pub stations: Vec<Station>,
    binding: LineConfig,
}

pub struct TrackModel {
    lines: Vec<Line>,
    index: HashMap<LineId, usize>,
    map: SegmentMap,
}

impl TrackModel {
    /// Build the static graph. Unknown trigger lines and out-of-range
    /// trigger sensors are configuration errors.
    pub fn build(config: &ScadaConfig) -> Result<Self> {
        config.validate()?;
        let map = SegmentMap::from_config(config)?;

        let sensor_counts: HashMap<&LineId, usize> = config
            .lines
            .iter()
            .map(|l| (&l.id, l.sensors.registers.len()))
            .collect();
        let resolve = |r: &TriggerRef| -> Result<SensorRef> {
            match sensor_counts.get(&r.line) {
                Some(count) if r.sensor < *count => Ok(SensorRef {
                    line: r.line.clone(),
                    index: r.sensor,
                }),
                Some(count) => Err(ScadaError::config(format!(
                    "trigger sensor {}-s{} out of range (line has {})",
                    r.line, r.sensor, count
                ))),
                None => Err(ScadaError::config(format!("trigger references unknown line {}", r.line))),
            }
        };

        let lookup = |line: &LineId, kind: ElementKind, index: usize| -> Result<IoAddress> {
            map.resolve(line, kind, index)
                .cloned()
                .ok_or_else(|| ScadaError::config(format!("{} {:?} {} is not bound", line, kind, index)))
        };

        let mut lines = Vec::with_capacity(config.lines.len());
        let mut index = HashMap::new();

        for lc in &config.lines {
            let id = lc.id.clone();

            let sensors = (0..lc.sensors.registers.len())
                .map(|k| {
                    Ok(Sensor {
                        id: format!("{}-s{}", id, k),
                        line: id.clone(),
                        position: k,
                        occupied: false,
                        register: lookup(&id, ElementKind::Sensor, k)?,
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            let mut signals = Vec::new();
            if let Some(sb) = &lc.signals {
                for k in 0..sb.coils.len() {
                    let (trigger_on, trigger_off) = match sb.triggers.get(k) {
                        Some(t) => (
                            t.trigger_on.iter().map(&resolve).collect::<Result<Vec<_>>>()?,
                            t.trigger_off.iter().map(&resolve).collect::<Result<Vec<_>>>()?,
                        ),
                        None => (Vec::new(), Vec::new()),
                    };
                    let name = sb
                        .triggers
                        .get(k)
                        .and_then(|t| t.id.clone())
                        .unwrap_or_else(|| format!("{}-sig{}", id, k));
                    signals.push(Signal {
                        id: name,
                        line: id.clone(),
                        position: k,
                        aspect: SignalAspect::Clear,
                        coil: lookup(&id, ElementKind::Signal, k)?,
                        trigger_on,
                        trigger_off,
                    });
                }
            }

            let mut trains = Vec::new();
            if let Some(tb) = &lc.trains {
                for slot in 0..tb.slot_count() {
                    trains.push(Train {
                        id: format!("{}-t{}", id, slot),
                        line: id.clone(),
                        slot,
                        powered: false,
                        guard_armed: false,
                        speed: 0,
                        power_coil: lookup(&id, ElementKind::TrainPower, slot)?,
                        guard_coil: lookup(&id, ElementKind::TrainGuard, slot)?,
                        speed_register: lookup(&id, ElementKind::TrainSpeed, slot)?,
                    });
                }
            }

            let mut stations = Vec::new();
            if let Some(st) = &lc.stations {
                for k in 0..st.station_count() {
                    stations.push(Station {
                        id: format!("{}-st{}", id, k),
                        line: id.clone(),
                        position: k,
                        occupied: false,
                        departure: SignalAspect::Clear,
                        sensor_register: lookup(&id, ElementKind::StationSensor, k)?,
                        signal_coil: lookup(&id, ElementKind::StationSignal, k)?,
                    });
                }
            }

            index.insert(id.clone(), lines.len());
            lines.push(Line {
                id,
                sensors,
                signals,
                trains,
                stations,
                binding: lc.clone(),
            });
        }

        Ok(Self { lines, index, map })
    }

    pub fn lines(&self) -> impl Iterator<Item = &Line> {
        self.lines.iter()
    }

    pub fn line_ids(&self) -> Vec<LineId> {
        self.lines.iter().map(|l| l.id.clone()).collect()
    }

    pub fn line(&self, id: &LineId) -> Result<&Line> {
        self.index
            .get(id)
            .map(|i| &self.lines[*i])
            .ok_or_else(|| ScadaError::config(format!("unknown line {}", id)))
    }

    fn line_mut(&mut self, id: &LineId) -> Option<&mut Line> {
        match self.index.get(id) {
            Some(i) => self.lines.get_mut(*i),
            None => {
                warn!(line = %id, "update for unknown line ignored");
                None
            }
        }
    }

    pub fn sensors(&self, line: &LineId) -> Result<&[Sensor]> {
        Ok(&self.line(line)?.sensors)
    }

    pub fn signals(&self, line: &LineId) -> Result<&[Signal]> {
        Ok(&self.line(line)?.signals)
    }

    pub fn trains(&self, line: &LineId) -> Result<&[Train]> {
        Ok(&self.line(line)?.trains)
    }

    pub fn stations(&self, line: &LineId) -> Result<&[Station]> {
        Ok(&self.line(line)?.stations)
    }

    pub fn segment_map(&self) -> &SegmentMap {
        &self.map
    }

    pub fn sensor_occupied(&self, r: &SensorRef) -> bool {
        self.index
            .get(&r.line)
            .and_then(|i| self.lines[*i].sensors.get(r.index))
            .is_some_and(|s| s.occupied)
    }

    /// Apply sensor registers (non-zero = occupied). Returns false and
    /// leaves the line untouched if the length is wrong.
    pub fn update_sensors(&mut self, line: &LineId, registers: &[u16]) -> bool {
        let Some(l) = self.line_mut(line) else { return false };
        if registers.len() != l.sensors.len() {
            warn!(line = %line, expected = l.sensors.len(), got = registers.len(), "sensor update length mismatch");
            return false;
        }
        for (sensor, raw) in l.sensors.iter_mut().zip(registers) {
            sensor.occupied = *raw != 0;
        }
        true
    }

    /// Apply signal coils (`true` = Stop)
    pub fn update_signals(&mut self, line: &LineId, coils: &[bool]) -> bool {
        let Some(l) = self.line_mut(line) else { return false };
        if coils.len() != l.signals.len() {
            warn!(line = %line, expected = l.signals.len(), got = coils.len(), "signal update length mismatch");
            return false;
        }
        for (signal, coil) in l.signals.iter_mut().zip(coils) {
            signal.aspect = SignalAspect::from_coil(*coil);
        }
        true
    }

    /// Apply speed registers and power coils, one of each per train slot
    pub fn update_trains(&mut self, line: &LineId, speed_registers: &[u16], power_coils: &[bool]) -> bool {
        let Some(l) = self.line_mut(line) else { return false };
        if speed_registers.len() != l.trains.len() || power_coils.len() != l.trains.len() {
            warn!(
                line = %line,
                expected = l.trains.len(),
                speeds = speed_registers.len(),
                powers = power_coils.len(),
                "train update length mismatch"
            );
            return false;
        }
        for ((train, speed), power) in l.trains.iter_mut().zip(speed_registers).zip(power_coils) {
            train.speed = *speed;
            train.powered = *power;
        }
        true
    }

    /// Apply collision-guard coils (`true` = armed)
    pub fn update_train_guards(&mut self, line: &LineId, guard_coils: &[bool]) -> bool {
        let Some(l) = self.line_mut(line) else { return false };
        if guard_coils.len() != l.trains.len() {
            warn!(line = %line, expected = l.trains.len(), got = guard_coils.len(), "guard update length mismatch");
            return false;
        }
        for (train, guard) in l.trains.iter_mut().zip(guard_coils) {
            train.guard_armed = *guard;
        }
        true
    }

    /// Apply station platform registers (non-zero = train at platform)
    pub fn update_station_sensors(&mut self, line: &LineId, registers: &[u16]) -> bool {
        let Some(l) = self.line_mut(line) else { return false };
        if registers.len() != l.stations.len() {
            warn!(line = %line, expected = l.stations.len(), got = registers.len(), "station sensor update length mismatch");
            return false;
        }
        for (station, raw) in l.stations.iter_mut().zip(registers) {
            station.occupied = *raw != 0;
        }
        true
    }

    /// Apply station departure coils (`true` = Stop)
    pub fn update_station_signals(&mut self, line: &LineId, coils: &[bool]) -> bool {
        let Some(l) = self.line_mut(line) else { return false };
        if coils.len() != l.stations.len() {
            warn!(line = %line, expected = l.stations.len(), got = coils.len(), "station signal update length mismatch");
            return false;
        }
        for (station, coil) in l.stations.iter_mut().zip(coils) {
            station.departure = SignalAspect::from_coil(*coil);
        }
        true
    }

    /// Pull every binding out of the aggregator's current snapshots
    pub fn sync(&mut self, data: &DataManager) -> Result<()> {
        let bindings: Vec<LineConfig> = self.lines.iter().map(|l| l.binding.clone()).collect();

        for b in bindings {
            let sensors = data.get_registers(&b.sensors.controller, b.sensors.registers.start, b.sensors.registers.end)?;
            self.update_sensors(&b.id, &sensors);

            if let Some(sb) = &b.signals {
                let coils = data.get_coils(&sb.controller, sb.coils.start, sb.coils.end)?;
                self.update_signals(&b.id, &coils);
            }

            if let Some(tb) = &b.trains {
                let speeds = data.get_registers(&tb.controller, tb.speed_registers.start, tb.speed_registers.end)?;
                let power = data.get_coils(&tb.controller, tb.power_coils.start, tb.power_coils.end)?;
                let guards = data.get_coils(&tb.controller, tb.guard_coils.start, tb.guard_coils.end)?;
                self.update_trains(&b.id, &speeds, &power);
                self.update_train_guards(&b.id, &guards);
            }

            if let Some(st) = &b.stations {
                let sensors = data.get_registers(&st.controller, st.sensors.start, st.sensors.end)?;
                let coils = data.get_coils(&st.controller, st.signals.start, st.signals.end)?;
                self.update_station_sensors(&b.id, &sensors);
                self.update_station_signals(&b.id, &coils);
            }
        }

        debug!(lines = self.lines.len(), "topology synced");
        Ok(())
    }
}
