use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Controller identity (e.g. `PLC-00`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ControllerId(pub String);

impl ControllerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ControllerId {
    fn from(s: &str) -> Self {
        ControllerId(s.to_string())
    }
}

impl fmt::Display for ControllerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Track line identity (e.g. `weline`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LineId(pub String);

impl LineId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for LineId {
    fn from(s: &str) -> Self {
        LineId(s.to_string())
    }
}

impl fmt::Display for LineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Last successfully read coil values of one controller
pub type CoilVector = Vec<bool>;

/// Last successfully read holding-register values of one controller
pub type RegisterVector = Vec<u16>;

/// Per-endpoint link state, owned by that endpoint's transport client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
        }
    }

    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "DISCONNECTED"),
            ConnectionState::Connecting => write!(f, "CONNECTING"),
            ConnectionState::Connected => write!(f, "CONNECTED"),
        }
    }
}

/// Role tag of a controller in the deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ControllerRole {
    JunctionSignal,
    Station,
    Train,
}

impl fmt::Display for ControllerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerRole::JunctionSignal => write!(f, "junction-signal-plc"),
            ControllerRole::Station => write!(f, "station-plc"),
            ControllerRole::Train => write!(f, "train-plc"),
        }
    }
}

/// Half-open index range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexRange {
    pub start: usize,
    pub end: usize,
}

impl IndexRange {
    pub const fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_well_formed(&self) -> bool {
        self.start <= self.end
    }

    pub fn contains(&self, idx: usize) -> bool {
        idx >= self.start && idx < self.end
    }

    pub fn overlaps(&self, other: &IndexRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for IndexRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Which I/O table of a controller a binding refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoTable {
    Coils,
    HoldingRegisters,
}

/// A single I/O point on a specific controller
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IoAddress {
    pub controller: ControllerId,
    pub table: IoTable,
    pub offset: usize,
}

/// One controller's published coil/register snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoSnapshot {
    pub coils: CoilVector,
    pub registers: RegisterVector,
    /// Poll cycle that produced this snapshot (0 = never read)
    pub cycle: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

impl IoSnapshot {
    /// Zero-filled snapshot of the declared size, used before the first read
    pub fn empty(coil_count: usize, register_count: usize) -> Self {
        Self {
            coils: vec![false; coil_count],
            registers: vec![0; register_count],
            cycle: 0,
            updated_at: None,
        }
    }

    pub fn is_fresh(&self) -> bool {
        self.updated_at.is_some()
    }
}
