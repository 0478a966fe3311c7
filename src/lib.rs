pub mod config;
pub mod data_manager;
pub mod error;
pub mod event_log;
pub mod injector;
pub mod interlock;
pub mod logging;
pub mod modbus;
pub mod operator;
pub mod topology;
pub mod transport;
pub mod types;

pub use config::{ControllerEndpoint, LineConfig, ScadaConfig, TimingConfig};
pub use data_manager::{CycleReport, DataManager};
pub use error::{Result, ScadaError};
pub use event_log::{EventJournal, JournalEvent, verify_journal_file};
pub use injector::{CommandInjector, InjectionConfig, InjectionStep, RetryPolicy};
pub use interlock::{InterlockMonitor, MonitorState};
pub use logging::init_logging;
pub use modbus::{FaultMode, PlcSimulator};
pub use operator::TrainOperator;
pub use topology::{Anomaly, AnomalyKind, TrackModel};
pub use transport::{FieldBus, PlcClient};
pub use types::{ConnectionState, ControllerId, IndexRange, IoAddress, IoSnapshot, IoTable, LineId};
