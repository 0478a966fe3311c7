use serde::Serialize;
use std::fmt;

use crate::types::{IoAddress, LineId};

/// Absolute reference to one sensor: line plus position on that line
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SensorRef {
    pub line: LineId,
    pub index: usize,
}

impl fmt::Display for SensorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-s{}", self.line, self.index)
    }
}

/// Track-occupancy detector bound to one holding register
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Sensor {
    pub id: String,
    pub line: LineId,
    pub position: usize,
    pub occupied: bool,
    pub register: IoAddress,
}

impl Sensor {
    pub fn reference(&self) -> SensorRef {
        SensorRef {
            line: self.line.clone(),
            index: self.position,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SignalAspect {
    Clear,
    Stop,
}

impl SignalAspect {
    /// Signal coils read `true` for Stop
    pub fn from_coil(coil: bool) -> Self {
        if coil { SignalAspect::Stop } else { SignalAspect::Clear }
    }
}

impl fmt::Display for SignalAspect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalAspect::Clear => write!(f, "CLEAR"),
            SignalAspect::Stop => write!(f, "STOP"),
        }
    }
}

/// Junction signal. `aspect` always mirrors the coil last read; the trigger
/// sets are what the ladder logic is expected to follow, nothing more.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Signal {
    pub id: String,
    pub line: LineId,
    pub position: usize,
    pub aspect: SignalAspect,
    pub coil: IoAddress,
    pub trigger_on: Vec<SensorRef>,
    pub trigger_off: Vec<SensorRef>,
}

/// Train slot on the train controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Train {
    pub id: String,
    pub line: LineId,
    pub slot: usize,

    /// Power coil state (`true` = motoring)
    pub powered: bool,

    /// Collision guard armed (`false` = front-sensor interlock bypassed)
    pub guard_armed: bool,

    pub speed: u16,

    pub power_coil: IoAddress,
    pub guard_coil: IoAddress,
    pub speed_register: IoAddress,
}

/// Station platform: occupancy sensor plus departure signal on the
/// station controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Station {
    pub id: String,
    pub line: LineId,
    pub position: usize,

    /// A train is standing at the platform
    pub occupied: bool,

    pub departure: SignalAspect,

    pub sensor_register: IoAddress,
    pub signal_coil: IoAddress,
}
