// Segment-to-I/O map: (line, element kind, index) <-> controller I/O point
// Built once from configuration, read-only afterwards

use serde::Serialize;
use std::collections::HashMap;

use crate::config::ScadaConfig;
use crate::error::{Result, ScadaError};
use crate::types::{ControllerId, IndexRange, IoAddress, IoTable, LineId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum ElementKind {
    Sensor,
    Signal,
    TrainPower,
    TrainGuard,
    TrainSpeed,
    StationSensor,
    StationSignal,
}

/// Logical element position on a line
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ElementKey {
    pub line: LineId,
    pub kind: ElementKind,
    pub index: usize,
}

#[derive(Debug, Clone, Default)]
pub struct SegmentMap {
    forward: HashMap<ElementKey, IoAddress>,
    reverse: HashMap<IoAddress, ElementKey>,
}

impl SegmentMap {
    pub fn from_config(config: &ScadaConfig) -> Result<Self> {
        let mut map = Self::default();

        for line in &config.lines {
            map.bind_range(
                &line.id,
                ElementKind::Sensor,
                &line.sensors.controller,
                IoTable::HoldingRegisters,
                line.sensors.registers,
            )?;

            if let Some(signals) = &line.signals {
                map.bind_range(&line.id, ElementKind::Signal, &signals.controller, IoTable::Coils, signals.coils)?;
            }

            if let Some(trains) = &line.trains {
                map.bind_range(
                    &line.id,
                    ElementKind::TrainPower,
                    &trains.controller,
                    IoTable::Coils,
                    trains.power_coils,
                )?;
                map.bind_range(
                    &line.id,
                    ElementKind::TrainGuard,
                    &trains.controller,
                    IoTable::Coils,
                    trains.guard_coils,
                )?;
                map.bind_range(
                    &line.id,
                    ElementKind::TrainSpeed,
                    &trains.controller,
                    IoTable::HoldingRegisters,
                    trains.speed_registers,
                )?;
            }

            if let Some(stations) = &line.stations {
                map.bind_range(
                    &line.id,
                    ElementKind::StationSensor,
                    &stations.controller,
                    IoTable::HoldingRegisters,
                    stations.sensors,
                )?;
                map.bind_range(
                    &line.id,
                    ElementKind::StationSignal,
                    &stations.controller,
                    IoTable::Coils,
                    stations.signals,
                )?;
            }
        }

        Ok(map)
    }

    fn bind_range(
        &mut self,
        line: &LineId,
        kind: ElementKind,
        controller: &ControllerId,
        table: IoTable,
        range: IndexRange,
    ) -> Result<()> {
        for (index, offset) in (range.start..range.end).enumerate() {
            let key = ElementKey {
                line: line.clone(),
                kind,
                index,
            };
            let addr = IoAddress {
                controller: controller.clone(),
                table,
                offset,
            };
            if let Some(existing) = self.reverse.get(&addr) {
                return Err(ScadaError::config(format!(
                    "{:?} {} of {} shares {}:{:?}[{}] with {:?} {} of {}",
                    kind, index, line, controller, table, offset, existing.kind, existing.index, existing.line
                )));
            }
            self.reverse.insert(addr.clone(), key.clone());
            self.forward.insert(key, addr);
        }
        Ok(())
    }

    /// Logical element -> I/O point
    pub fn resolve(&self, line: &LineId, kind: ElementKind, index: usize) -> Option<&IoAddress> {
        self.forward.get(&ElementKey {
            line: line.clone(),
            kind,
            index,
        })
    }

    /// I/O point -> logical element
    pub fn locate(&self, addr: &IoAddress) -> Option<&ElementKey> {
        self.reverse.get(addr)
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&ElementKey, &IoAddress)> {
        self.forward.iter()
    }
}
