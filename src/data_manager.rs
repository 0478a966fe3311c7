// Synchronization aggregator - polls every controller on a fixed cadence and
// publishes one coil/register snapshot per controller
//
// Legitimate writes go through here; the snapshot only changes when a poll
// reads the controller back.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ControllerEndpoint, ScadaConfig};
use crate::error::{Result, ScadaError};
use crate::transport::{FieldBus, PlcClient};
use crate::types::{CoilVector, ConnectionState, ControllerId, IoSnapshot, RegisterVector};

const REPORT_CHANNEL_CAPACITY: usize = 16;

/// Summary of one poll cycle, broadcast to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub cycle: u64,
    pub completed_at: DateTime<Utc>,

    /// Snapshot replaced this cycle
    pub refreshed: Vec<ControllerId>,

    /// Not connected and the connect attempt failed
    pub skipped: Vec<ControllerId>,

    /// Connected but the read failed or came back with the wrong shape
    pub failed: Vec<ControllerId>,

    /// Subset of `failed` whose reply disagreed with the declaration
    pub mismatched: Vec<(ControllerId, String)>,

    /// Controllers whose connection state differs from the previous cycle
    pub connection_changes: Vec<(ControllerId, ConnectionState)>,
}

impl CycleReport {
    pub fn all_refreshed(&self) -> bool {
        self.skipped.is_empty() && self.failed.is_empty()
    }
}

enum PollOutcome {
    Refreshed,
    Unreachable,
    ReadFailed,
    Mismatch(String),
}

struct ControllerSlot {
    endpoint: ControllerEndpoint,
    client: Arc<dyn FieldBus>,
    snapshot: RwLock<Arc<IoSnapshot>>,
    last_state: Mutex<ConnectionState>,
}

impl ControllerSlot {
    fn current(&self) -> Arc<IoSnapshot> {
        Arc::clone(&self.snapshot.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn publish(&self, snapshot: IoSnapshot) {
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(snapshot);
    }

    /// Returns the new state when it differs from the one seen last cycle
    fn note_state(&self) -> Option<ConnectionState> {
        let now = self.client.state();
        let mut last = self.last_state.lock().unwrap_or_else(PoisonError::into_inner);
        if *last == now {
            return None;
        }
        *last = now;
        Some(now)
    }
}

/// Clears the cycle flag even if the cycle future is dropped mid-way
struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct DataManager {
    config: ScadaConfig,
    slots: Vec<Arc<ControllerSlot>>,
    index: HashMap<ControllerId, usize>,
    interval: Duration,
    cycle_active: AtomicBool,
    last_periodic: Mutex<Option<Instant>>,
    cycle: AtomicU64,
    reports: broadcast::Sender<CycleReport>,
}

impl DataManager {
    /// Build one TCP client per configured controller
    pub fn new(config: ScadaConfig) -> Result<Self> {
        let io_timeout = config.timing.io_timeout();
        let transports = config
            .controllers
            .iter()
            .map(|ep| Arc::new(PlcClient::from_endpoint(ep, io_timeout)) as Arc<dyn FieldBus>)
            .collect();
        Self::with_transports(config, transports)
    }

    /// Build over caller-supplied transports, one per configured controller
    pub fn with_transports(config: ScadaConfig, transports: Vec<Arc<dyn FieldBus>>) -> Result<Self> {
        config.validate()?;

        let mut by_id: HashMap<ControllerId, Arc<dyn FieldBus>> = transports
            .into_iter()
            .map(|t| (t.controller().clone(), t))
            .collect();

        let mut slots = Vec::with_capacity(config.controllers.len());
        let mut index = HashMap::new();
        for endpoint in &config.controllers {
            let client = by_id
                .remove(&endpoint.id)
                .ok_or_else(|| ScadaError::config(format!("no transport for controller {}", endpoint.id)))?;
            index.insert(endpoint.id.clone(), slots.len());
            slots.push(Arc::new(ControllerSlot {
                endpoint: endpoint.clone(),
                snapshot: RwLock::new(Arc::new(IoSnapshot::empty(
                    endpoint.coil_count,
                    endpoint.register_count,
                ))),
                last_state: Mutex::new(client.state()),
                client,
            }));
        }
        if let Some(extra) = by_id.keys().next() {
            return Err(ScadaError::config(format!("transport for unconfigured controller {}", extra)));
        }

        let (reports, _) = broadcast::channel(REPORT_CHANNEL_CAPACITY);

        Ok(Self {
            interval: config.timing.update_interval(),
            config,
            slots,
            index,
            cycle_active: AtomicBool::new(false),
            last_periodic: Mutex::new(None),
            cycle: AtomicU64::new(0),
            reports,
        })
    }

    pub fn config(&self) -> &ScadaConfig {
        &self.config
    }

    pub fn controllers(&self) -> impl Iterator<Item = &ControllerEndpoint> {
        self.slots.iter().map(|s| &s.endpoint)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Completed poll cycles
    pub fn cycle_count(&self) -> u64 {
        self.cycle.load(Ordering::Acquire)
    }

    fn slot(&self, controller: &ControllerId) -> Result<&Arc<ControllerSlot>> {
        self.index
            .get(controller)
            .map(|i| &self.slots[*i])
            .ok_or_else(|| ScadaError::config(format!("unknown controller {}", controller)))
    }

    /// First connect attempt to every controller. Unreachable ones are
    /// retried by the poll cycle. Returns how many connected.
    pub async fn start(&self) -> usize {
        let mut tasks = JoinSet::new();
        for slot in &self.slots {
            let slot = Arc::clone(slot);
            tasks.spawn(async move {
                match slot.client.connect().await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(controller = %slot.endpoint.id, address = %slot.endpoint.address, error = %e, "initial connect failed");
                        false
                    }
                }
            });
        }

        let mut connected = 0;
        while let Some(joined) = tasks.join_next().await {
            if matches!(joined, Ok(true)) {
                connected += 1;
            }
        }
        for slot in &self.slots {
            slot.note_state();
        }
        info!(connected, total = self.slots.len(), "aggregator started");
        connected
    }

    /// Run a poll cycle if one is due at `now` and none is running
    pub async fn periodic(&self, now: Instant) -> Option<CycleReport> {
        if self
            .cycle_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        let guard = CycleGuard(&self.cycle_active);

        {
            let mut last = self.last_periodic.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(prev) = *last
                && now.saturating_duration_since(prev) < self.interval
            {
                return None;
            }
            *last = Some(now);
        }

        let report = self.poll_cycle().await;
        drop(guard);
        Some(report)
    }

    /// Force a cycle now, regardless of cadence. `None` if one is already running.
    pub async fn refresh(&self) -> Option<CycleReport> {
        if self
            .cycle_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        let _guard = CycleGuard(&self.cycle_active);
        *self.last_periodic.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
        Some(self.poll_cycle().await)
    }

    async fn poll_cycle(&self) -> CycleReport {
        let cycle = self.cycle.load(Ordering::Acquire) + 1;

        let mut tasks = JoinSet::new();
        for slot in &self.slots {
            let slot = Arc::clone(slot);
            tasks.spawn(async move {
                let outcome = Self::poll_one(&slot, cycle).await;
                (slot.endpoint.id.clone(), outcome, slot.note_state())
            });
        }

        let mut report = CycleReport {
            cycle,
            completed_at: Utc::now(),
            refreshed: Vec::new(),
            skipped: Vec::new(),
            failed: Vec::new(),
            mismatched: Vec::new(),
            connection_changes: Vec::new(),
        };

        while let Some(joined) = tasks.join_next().await {
            let (id, outcome, change) = match joined {
                Ok(result) => result,
                Err(e) => {
                    warn!(cycle, error = %e, "poll task aborted");
                    continue;
                }
            };
            if let Some(state) = change {
                info!(controller = %id, %state, "connection state changed");
                report.connection_changes.push((id.clone(), state));
            }
            match outcome {
                PollOutcome::Refreshed => report.refreshed.push(id),
                PollOutcome::Unreachable => report.skipped.push(id),
                PollOutcome::ReadFailed => report.failed.push(id),
                PollOutcome::Mismatch(detail) => {
                    report.failed.push(id.clone());
                    report.mismatched.push((id, detail));
                }
            }
        }

        // Keep report order stable (configuration order), not completion order
        let order = |id: &ControllerId| self.index.get(id).copied().unwrap_or(usize::MAX);
        report.refreshed.sort_by_key(|id| order(id));
        report.skipped.sort_by_key(|id| order(id));
        report.failed.sort_by_key(|id| order(id));
        report.mismatched.sort_by_key(|(id, _)| order(id));
        report.connection_changes.sort_by_key(|(id, _)| order(id));
        report.completed_at = Utc::now();

        self.cycle.store(cycle, Ordering::Release);
        debug!(
            cycle,
            refreshed = report.refreshed.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "poll cycle complete"
        );
        let _ = self.reports.send(report.clone());
        report
    }

    async fn poll_one(slot: &ControllerSlot, cycle: u64) -> PollOutcome {
        let ep = &slot.endpoint;

        if !slot.client.is_connected()
            && let Err(e) = slot.client.connect().await
        {
            debug!(controller = %ep.id, error = %e, "controller unreachable, keeping last snapshot");
            return PollOutcome::Unreachable;
        }

        let coils = match Self::read_all_coils(slot).await {
            Ok(c) => c,
            Err(e) => return Self::read_failure(slot, e).await,
        };
        let registers = match Self::read_all_registers(slot).await {
            Ok(r) => r,
            Err(e) => return Self::read_failure(slot, e).await,
        };

        if coils.len() != ep.coil_count || registers.len() != ep.register_count {
            let detail = format!(
                "read {} coils / {} registers, declared {} / {}",
                coils.len(),
                registers.len(),
                ep.coil_count,
                ep.register_count
            );
            warn!(controller = %ep.id, cycle, %detail, "length mismatch, discarding this cycle");
            return PollOutcome::Mismatch(detail);
        }

        slot.publish(IoSnapshot {
            coils,
            registers,
            cycle,
            updated_at: Some(Utc::now()),
        });
        PollOutcome::Refreshed
    }

    /// Any failed read leaves the controller Disconnected, even when the
    /// transport itself would keep the link (device exceptions)
    async fn read_failure(slot: &ControllerSlot, e: ScadaError) -> PollOutcome {
        let ep = &slot.endpoint;
        match e {
            ScadaError::ProtocolMismatch { detail, .. } => {
                warn!(controller = %ep.id, %detail, "protocol mismatch, discarding this cycle");
                PollOutcome::Mismatch(detail)
            }
            e => {
                warn!(controller = %ep.id, error = %e, "read failed, keeping last snapshot");
                if slot.client.is_connected() {
                    slot.client.disconnect().await;
                }
                PollOutcome::ReadFailed
            }
        }
    }

    async fn read_all_coils(slot: &ControllerSlot) -> Result<CoilVector> {
        match wire_count(slot.endpoint.coil_count)? {
            0 => Ok(Vec::new()),
            n => slot.client.read_coils(0, n).await,
        }
    }

    async fn read_all_registers(slot: &ControllerSlot) -> Result<RegisterVector> {
        match wire_count(slot.endpoint.register_count)? {
            0 => Ok(Vec::new()),
            n => slot.client.read_registers(0, n).await,
        }
    }

    // ========================================================================
    // Presentation interface
    // ========================================================================

    /// Copy of coils `[start, end)` from the last published snapshot
    pub fn get_coils(&self, controller: &ControllerId, start: usize, end: usize) -> Result<CoilVector> {
        let snapshot = self.slot(controller)?.current();
        check_window(controller, "coil", start, end, snapshot.coils.len())?;
        Ok(snapshot.coils[start..end].to_vec())
    }

    /// Copy of registers `[start, end)` from the last published snapshot
    pub fn get_registers(&self, controller: &ControllerId, start: usize, end: usize) -> Result<RegisterVector> {
        let snapshot = self.slot(controller)?.current();
        check_window(controller, "register", start, end, snapshot.registers.len())?;
        Ok(snapshot.registers[start..end].to_vec())
    }

    pub fn snapshot(&self, controller: &ControllerId) -> Result<Arc<IoSnapshot>> {
        Ok(self.slot(controller)?.current())
    }

    pub fn connection_state(&self, controller: &ControllerId) -> Result<ConnectionState> {
        Ok(self.slot(controller)?.client.state())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CycleReport> {
        self.reports.subscribe()
    }

    /// Write one coil. Only configuration errors come back; transport
    /// failures are logged and show up in the connection state.
    pub async fn set_coil(&self, controller: &ControllerId, index: usize, value: bool) -> Result<()> {
        let slot = self.slot(controller)?;
        check_index(controller, "coil", index, slot.endpoint.coil_count)?;
        if let Err(e) = slot.client.write_coil(wire_index(index)?, value).await {
            warn!(controller = %controller, index, value, error = %e, "coil write failed");
        }
        Ok(())
    }

    /// Write one holding register; same error contract as [`Self::set_coil`]
    pub async fn set_register(&self, controller: &ControllerId, index: usize, value: u16) -> Result<()> {
        let slot = self.slot(controller)?;
        check_index(controller, "register", index, slot.endpoint.register_count)?;
        if let Err(e) = slot.client.write_register(wire_index(index)?, value).await {
            warn!(controller = %controller, index, value, error = %e, "register write failed");
        }
        Ok(())
    }

    /// Drive `periodic` from a tokio interval until cancelled, then close
    /// every connection
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                tick = ticker.tick() => {
                    self.periodic(tick).await;
                }
            }
        }

        self.shutdown().await;
    }

    pub async fn shutdown(&self) {
        for slot in &self.slots {
            slot.client.disconnect().await;
            slot.note_state();
        }
        info!("aggregator stopped, all connections closed");
    }
}

fn check_window(controller: &ControllerId, what: &str, start: usize, end: usize, len: usize) -> Result<()> {
    if start > end || end > len {
        return Err(ScadaError::config(format!(
            "{} {} range [{}, {}) outside 0..{}",
            controller, what, start, end, len
        )));
    }
    Ok(())
}

fn check_index(controller: &ControllerId, what: &str, index: usize, len: usize) -> Result<()> {
    if index >= len {
        return Err(ScadaError::config(format!(
            "{} {} index {} outside 0..{}",
            controller, what, index, len
        )));
    }
    Ok(())
}

fn wire_count(count: usize) -> Result<u16> {
    u16::try_from(count).map_err(|_| ScadaError::config(format!("count {} exceeds the wire limit", count)))
}

fn wire_index(index: usize) -> Result<u16> {
    u16::try_from(index).map_err(|_| ScadaError::config(format!("index {} exceeds the wire limit", index)))
}
