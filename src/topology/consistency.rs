// Consistency checks between signal aspects, sensor occupancy and train guards
// The coil stays authoritative; these only report disagreement

use serde::Serialize;
use std::fmt;

use super::TrackModel;
use super::elements::SignalAspect;
use crate::types::LineId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum AnomalyKind {
    /// Signal at Stop with no trigger-on sensor occupied
    UnexplainedStop,
    /// Signal at Clear while a trigger-on sensor is occupied and no trigger-off sensor is
    ClearWhileTriggered,
    /// Train powered while its collision guard is disarmed
    UnguardedPower,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyKind::UnexplainedStop => "UNEXPLAINED_STOP",
            AnomalyKind::ClearWhileTriggered => "CLEAR_WHILE_TRIGGERED",
            AnomalyKind::UnguardedPower => "UNGUARDED_POWER",
        }
    }
}

impl fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Anomaly {
    pub kind: AnomalyKind,
    pub line: LineId,
    /// Signal or train identity
    pub element: String,
    pub detail: String,
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.kind, self.element, self.detail)
    }
}

impl TrackModel {
    /// Compare the current state against the configured expectations
    pub fn check_consistency(&self) -> Vec<Anomaly> {
        let mut anomalies = Vec::new();

        for line in self.lines() {
            for signal in &line.signals {
                // Without trigger metadata there is nothing to compare against
                if signal.trigger_on.is_empty() {
                    continue;
                }
                let on_occupied = signal.trigger_on.iter().any(|r| self.sensor_occupied(r));
                let off_occupied = signal.trigger_off.iter().any(|r| self.sensor_occupied(r));

                match signal.aspect {
                    SignalAspect::Stop if !on_occupied => anomalies.push(Anomaly {
                        kind: AnomalyKind::UnexplainedStop,
                        line: signal.line.clone(),
                        element: signal.id.clone(),
                        detail: "stop aspect with no trigger-on sensor occupied".to_string(),
                    }),
                    SignalAspect::Clear if on_occupied && !off_occupied => anomalies.push(Anomaly {
                        kind: AnomalyKind::ClearWhileTriggered,
                        line: signal.line.clone(),
                        element: signal.id.clone(),
                        detail: "clear aspect while trigger-on sensor occupied".to_string(),
                    }),
                    _ => {}
                }
            }

            for train in &line.trains {
                if train.powered && !train.guard_armed {
                    anomalies.push(Anomaly {
                        kind: AnomalyKind::UnguardedPower,
                        line: train.line.clone(),
                        element: train.id.clone(),
                        detail: format!(
                            "power coil {} on while guard coil {} is off",
                            train.power_coil.offset, train.guard_coil.offset
                        ),
                    });
                }
            }
        }

        anomalies
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScadaConfig;

    fn metro() -> TrackModel {
        TrackModel::build(&ScadaConfig::metro_default()).unwrap()
    }

    fn we() -> LineId {
        LineId::from("weline")
    }

    fn cc() -> LineId {
        LineId::from("ccline")
    }

    #[test]
    fn test_idle_network_is_consistent() {
        assert!(metro().check_consistency().is_empty());
    }

    #[test]
    fn test_stop_without_trigger_is_unexplained() {
        let mut model = metro();
        let mut coils = vec![false; 8];
        coils[0] = true;
        assert!(model.update_signals(&we(), &coils));

        let anomalies = model.check_consistency();
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].kind, AnomalyKind::UnexplainedStop);
        assert_eq!(anomalies[0].element, "we-0");
    }

    #[test]
    fn test_stop_explained_by_cross_line_sensor() {
        let mut model = metro();
        // weline signal 0 is triggered by ccline sensor 12
        let mut sensors = vec![0u16; 14];
        sensors[12] = 1;
        model.update_sensors(&cc(), &sensors);
        let mut coils = vec![false; 8];
        coils[0] = true;
        model.update_signals(&we(), &coils);

        assert!(model.check_consistency().is_empty());
    }

    #[test]
    fn test_clear_while_triggered() {
        let mut model = metro();
        let mut sensors = vec![0u16; 14];
        sensors[12] = 1;
        model.update_sensors(&cc(), &sensors);

        let kinds: Vec<_> = model.check_consistency().into_iter().map(|a| a.kind).collect();
        // Signals 0 and 7 of weline share the trigger
        assert_eq!(kinds, vec![AnomalyKind::ClearWhileTriggered; 2]);

        // Train has moved on to the trigger-off sensor
        sensors[13] = 1;
        model.update_sensors(&cc(), &sensors);
        assert!(model.check_consistency().is_empty());
    }

    #[test]
    fn test_unguarded_power() {
        let mut model = metro();
        let mut power = vec![false; 4];
        power[0] = true;
        model.update_trains(&we(), &[0; 4], &power);
        model.update_train_guards(&we(), &[true; 4]);
        assert!(model.check_consistency().is_empty());

        model.update_train_guards(&we(), &[false, true, true, true]);
        let anomalies = model.check_consistency();
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].kind, AnomalyKind::UnguardedPower);
        assert_eq!(anomalies[0].element, "weline-t0");
    }
}
