/// Interlock monitor: threshold state machine over consistency anomalies.
///
/// A single cycle with a powered train whose collision guard is disarmed is
/// enough to declare an attack. Signal disagreements can come from ladder
/// logic lagging one poll behind the sensors, so those must persist for
/// several consecutive cycles first.
use colored::*;
use std::fmt;
use tracing::{error, info, warn};

use crate::event_log::EventJournal;
use crate::topology::{Anomaly, AnomalyKind};

/// Consecutive cycles before signal anomalies count as an attack
pub const SIGNAL_ANOMALY_THRESHOLD: u32 = 3;
/// Unguarded power triggers immediately
pub const UNGUARDED_POWER_THRESHOLD: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Normal,
    /// Anomalies seen but below threshold
    Warning,
    /// Threshold exceeded; latched until `reset()`
    UnderAttack,
}

impl MonitorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorState::Normal => "NORMAL",
            MonitorState::Warning => "WARNING",
            MonitorState::UnderAttack => "UNDER_ATTACK",
        }
    }
}

impl fmt::Display for MonitorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorState::Normal => write!(f, "{}", "NORMAL".green().bold()),
            MonitorState::Warning => write!(f, "{}", "WARNING".yellow().bold()),
            MonitorState::UnderAttack => write!(f, "{}", "UNDER ATTACK".red().bold()),
        }
    }
}

#[derive(Debug)]
pub struct InterlockMonitor {
    unexplained_stop_count: u32,
    clear_while_triggered_count: u32,
    unguarded_power_count: u32,
    total_anomalies: u64,
    anomalous_cycles: u64,
    clean_cycles: u64,
    /// Anomaly kind that tripped UnderAttack
    tripped_by: Option<AnomalyKind>,
    state: MonitorState,
    journal: Option<EventJournal>,
}

impl Default for InterlockMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl InterlockMonitor {
    pub fn new() -> Self {
        Self {
            unexplained_stop_count: 0,
            clear_while_triggered_count: 0,
            unguarded_power_count: 0,
            total_anomalies: 0,
            anomalous_cycles: 0,
            clean_cycles: 0,
            tripped_by: None,
            state: MonitorState::Normal,
            journal: None,
        }
    }

    pub fn with_journal(journal: EventJournal) -> Self {
        Self {
            journal: Some(journal),
            ..Self::new()
        }
    }

    fn counter(&mut self, kind: AnomalyKind) -> &mut u32 {
        match kind {
            AnomalyKind::UnexplainedStop => &mut self.unexplained_stop_count,
            AnomalyKind::ClearWhileTriggered => &mut self.clear_while_triggered_count,
            AnomalyKind::UnguardedPower => &mut self.unguarded_power_count,
        }
    }

    fn threshold(kind: AnomalyKind) -> u32 {
        match kind {
            AnomalyKind::UnguardedPower => UNGUARDED_POWER_THRESHOLD,
            _ => SIGNAL_ANOMALY_THRESHOLD,
        }
    }

    /// Feed one cycle's anomalies; returns the resulting state
    pub fn observe(&mut self, anomalies: &[Anomaly]) -> MonitorState {
        if anomalies.is_empty() {
            self.record_clean_cycle();
            return self.state;
        }

        self.anomalous_cycles += 1;
        self.total_anomalies += anomalies.len() as u64;

        const KINDS: [AnomalyKind; 3] = [
            AnomalyKind::UnexplainedStop,
            AnomalyKind::ClearWhileTriggered,
            AnomalyKind::UnguardedPower,
        ];

        let mut tripped = None;
        let mut approaching = None;
        for kind in KINDS {
            let present = anomalies.iter().any(|a| a.kind == kind);
            let count = self.counter(kind);
            if !present {
                *count = 0;
                continue;
            }
            *count += 1;
            let count = *count;

            if count == 1 {
                for a in anomalies.iter().filter(|a| a.kind == kind) {
                    warn!(kind = %a.kind, line = %a.line, element = %a.element, detail = %a.detail, "interlock anomaly");
                    if let Some(journal) = &self.journal {
                        journal.log_anomaly(a);
                    }
                }
            }

            let threshold = Self::threshold(kind);
            if count >= threshold && tripped.is_none() {
                tripped = Some((kind, count, threshold));
            } else if count >= threshold / 2 && approaching.is_none() {
                approaching = Some((kind, count, threshold));
            }
        }

        if let Some((kind, count, threshold)) = tripped {
            self.trigger_attack_mode(kind, count, threshold);
        } else if let Some((kind, count, threshold)) = approaching
            && self.state == MonitorState::Normal
        {
            self.transition(
                MonitorState::Warning,
                format!("{} approaching threshold ({}/{})", kind, count, threshold),
            );
        }

        self.state
    }

    fn record_clean_cycle(&mut self) {
        self.clean_cycles += 1;
        self.unexplained_stop_count = 0;
        self.clear_while_triggered_count = 0;
        self.unguarded_power_count = 0;

        if self.state == MonitorState::Warning {
            info!("interlock anomalies cleared");
            self.transition(MonitorState::Normal, "clean poll cycle".to_string());
        }
    }

    fn trigger_attack_mode(&mut self, kind: AnomalyKind, count: u32, threshold: u32) {
        if self.state == MonitorState::UnderAttack {
            return;
        }
        self.tripped_by = Some(kind);
        error!(%kind, count, threshold, "interlock violation, attack declared");
        self.transition(
            MonitorState::UnderAttack,
            format!("{} for {} consecutive cycle(s), threshold {}", kind, count, threshold),
        );
    }

    fn transition(&mut self, to: MonitorState, trigger: String) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        info!(from = from.as_str(), to = to.as_str(), %trigger, "monitor state changed");
        if let Some(journal) = &self.journal {
            journal.log_state_change(from.as_str().to_string(), to.as_str().to_string(), trigger);
        }
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    pub fn is_under_attack(&self) -> bool {
        self.state == MonitorState::UnderAttack
    }

    pub fn tripped_by(&self) -> Option<AnomalyKind> {
        self.tripped_by
    }

    /// Operator acknowledgement; clears the latch
    pub fn reset(&mut self) {
        info!("interlock monitor reset");
        if let Some(journal) = &self.journal {
            journal.log_reset(format!(
                "operator reset after {} anomalous / {} clean cycles",
                self.anomalous_cycles, self.clean_cycles
            ));
        }
        self.unexplained_stop_count = 0;
        self.clear_while_triggered_count = 0;
        self.unguarded_power_count = 0;
        self.tripped_by = None;
        self.transition(MonitorState::Normal, "reset".to_string());
    }

    pub fn stats(&self) -> MonitorStats {
        MonitorStats {
            unexplained_stop_count: self.unexplained_stop_count,
            clear_while_triggered_count: self.clear_while_triggered_count,
            unguarded_power_count: self.unguarded_power_count,
            total_anomalies: self.total_anomalies,
            anomalous_cycles: self.anomalous_cycles,
            clean_cycles: self.clean_cycles,
            state: self.state,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonitorStats {
    pub unexplained_stop_count: u32,
    pub clear_while_triggered_count: u32,
    pub unguarded_power_count: u32,
    pub total_anomalies: u64,
    pub anomalous_cycles: u64,
    pub clean_cycles: u64,
    pub state: MonitorState,
}

impl fmt::Display for MonitorStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "State: {} | Stop: {}/{} | Clear: {}/{} | Power: {}/{} | Anomalies: {} | Cycles: {} bad / {} clean",
            self.state,
            self.unexplained_stop_count,
            SIGNAL_ANOMALY_THRESHOLD,
            self.clear_while_triggered_count,
            SIGNAL_ANOMALY_THRESHOLD,
            self.unguarded_power_count,
            UNGUARDED_POWER_THRESHOLD,
            self.total_anomalies,
            self.anomalous_cycles,
            self.clean_cycles
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_log::{JournalEvent, verify_journal_file};
    use crate::types::LineId;

    fn anomaly(kind: AnomalyKind) -> Anomaly {
        Anomaly {
            kind,
            line: LineId::from("weline"),
            element: "we-0".to_string(),
            detail: "test".to_string(),
        }
    }

    #[test]
    fn test_unguarded_power_escalates_immediately() {
        let mut monitor = InterlockMonitor::new();
        let state = monitor.observe(&[anomaly(AnomalyKind::UnguardedPower)]);
        assert_eq!(state, MonitorState::UnderAttack);
        assert_eq!(monitor.tripped_by(), Some(AnomalyKind::UnguardedPower));
    }

    #[test]
    fn test_signal_anomaly_escalates_after_three_cycles() {
        let mut monitor = InterlockMonitor::new();
        let a = [anomaly(AnomalyKind::UnexplainedStop)];

        assert_eq!(monitor.observe(&a), MonitorState::Warning);
        assert_eq!(monitor.observe(&a), MonitorState::Warning);
        assert_eq!(monitor.observe(&a), MonitorState::UnderAttack);
    }

    #[test]
    fn test_clean_cycle_returns_warning_to_normal() {
        let mut monitor = InterlockMonitor::new();
        let a = [anomaly(AnomalyKind::ClearWhileTriggered)];

        monitor.observe(&a);
        monitor.observe(&a);
        assert_eq!(monitor.observe(&[]), MonitorState::Normal);
        // Counter restarted: two more cycles are still only a warning
        monitor.observe(&a);
        assert_eq!(monitor.observe(&a), MonitorState::Warning);
    }

    #[test]
    fn test_under_attack_latches_until_reset() {
        let mut monitor = InterlockMonitor::new();
        monitor.observe(&[anomaly(AnomalyKind::UnguardedPower)]);
        assert_eq!(monitor.observe(&[]), MonitorState::UnderAttack);
        assert!(monitor.is_under_attack());

        monitor.reset();
        assert_eq!(monitor.state(), MonitorState::Normal);
        assert_eq!(monitor.tripped_by(), None);
    }

    #[test]
    fn test_alternating_kinds_do_not_accumulate() {
        let mut monitor = InterlockMonitor::new();
        monitor.observe(&[anomaly(AnomalyKind::UnexplainedStop)]);
        monitor.observe(&[anomaly(AnomalyKind::ClearWhileTriggered)]);
        assert_eq!(
            monitor.observe(&[anomaly(AnomalyKind::UnexplainedStop)]),
            MonitorState::Warning
        );
        assert_eq!(monitor.stats().unexplained_stop_count, 1);
    }

    #[test]
    fn test_transitions_are_journaled() {
        let dir = tempfile::TempDir::new().unwrap();
        let journal = EventJournal::create("HMI", Some(dir.path().to_path_buf())).unwrap();
        let path = journal.path().to_path_buf();
        let mut monitor = InterlockMonitor::with_journal(journal);

        monitor.observe(&[anomaly(AnomalyKind::UnguardedPower)]);
        monitor.reset();

        let content = std::fs::read_to_string(&path).unwrap();
        let events: Vec<JournalEvent> = content
            .lines()
            .map(|l| serde_json::from_str::<crate::event_log::JournalEntry>(l).unwrap().event)
            .collect();
        assert!(matches!(events[0], JournalEvent::AnomalyDetected { .. }));
        assert!(matches!(
            &events[1],
            JournalEvent::StateChange { to_state, .. } if to_state == "UNDER_ATTACK"
        ));
        assert!(matches!(events[2], JournalEvent::JournalReset { .. }));
        assert!(verify_journal_file(&path).unwrap().verified);
    }
}
