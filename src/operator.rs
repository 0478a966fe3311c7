/// Train operator console: legitimate power and speed commands.
///
/// Commands are resolved through the track model to the train's I/O points
/// and written through the aggregator, the same path the HMI uses. Like any
/// aggregator write, the effect is only visible after the next poll.
use std::sync::Arc;
use tracing::info;

use crate::data_manager::DataManager;
use crate::error::{Result, ScadaError};
use crate::event_log::EventJournal;
use crate::topology::{TrackModel, Train};
use crate::types::LineId;

pub struct TrainOperator {
    data: Arc<DataManager>,
    track: TrackModel,
    journal: Option<EventJournal>,
}

impl TrainOperator {
    pub fn new(data: Arc<DataManager>) -> Result<Self> {
        let track = TrackModel::build(data.config())?;
        Ok(Self {
            data,
            track,
            journal: None,
        })
    }

    pub fn with_journal(mut self, journal: EventJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Static binding of one train slot
    pub fn train(&self, line: &LineId, slot: usize) -> Result<&Train> {
        self.track
            .trains(line)?
            .get(slot)
            .ok_or_else(|| ScadaError::config(format!("{} has no train slot {}", line, slot)))
    }

    pub fn trains(&self) -> impl Iterator<Item = &Train> {
        self.track.lines().flat_map(|l| l.trains.iter())
    }

    /// Switch one train's traction power
    pub async fn set_power(&self, line: &LineId, slot: usize, on: bool) -> Result<()> {
        let train = self.train(line, slot)?;
        let coil = &train.power_coil;
        self.data.set_coil(&coil.controller, coil.offset, on).await?;

        info!(train = %train.id, controller = %coil.controller, offset = coil.offset, on, "train power command");
        if let Some(journal) = &self.journal {
            journal.log_operator_command(&train.id, coil, u16::from(on));
        }
        Ok(())
    }

    /// Set one train's speed register
    pub async fn set_speed(&self, line: &LineId, slot: usize, speed: u16) -> Result<()> {
        let train = self.train(line, slot)?;
        let register = &train.speed_register;
        self.data
            .set_register(&register.controller, register.offset, speed)
            .await?;

        info!(train = %train.id, controller = %register.controller, offset = register.offset, speed, "train speed command");
        if let Some(journal) = &self.journal {
            journal.log_operator_command(&train.id, register, speed);
        }
        Ok(())
    }

    /// Power every configured train on or off. Returns how many commands went out.
    pub async fn power_all(&self, on: bool) -> Result<usize> {
        let slots: Vec<(LineId, usize)> = self.trains().map(|t| (t.line.clone(), t.slot)).collect();
        for (line, slot) in &slots {
            self.set_power(line, *slot, on).await?;
        }
        Ok(slots.len())
    }
}
