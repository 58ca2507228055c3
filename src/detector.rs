//! Stateful event detection over consecutive classified snapshots.
//!
//! Level conditions (power drift, modulation instability) are debounced: they
//! must persist for `debounce_samples` consecutive snapshots before the first
//! emission, and an ongoing condition is not re-emitted until it clears and
//! re-occurs or changes severity. Discrete transitions (channel count,
//! aggregate health) are emitted at the transition itself, once.
//!
//! History is bounded: one fixed-capacity power window per (direction,
//! channel_id), pruned when a channel stays absent.

use std::collections::HashMap;
use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use crate::model::{
    Classification, Direction, Event, EventKind, Health, Modulation, RawSnapshot, Severity,
};

#[derive(Debug, Clone, Copy)]
pub struct DetectorTuning {
    /// Consecutive observations a condition needs before its first emission.
    pub debounce_samples: u32,
    /// Samples in the rolling power baseline per channel.
    pub drift_baseline: usize,
    /// Absolute deviation from the baseline mean that counts as drift.
    pub drift_threshold_db: f64,
    /// Uncorrectable error increase between two snapshots that counts as a burst.
    pub error_burst_limit: u64,
}

impl Default for DetectorTuning {
    fn default() -> Self {
        DetectorTuning {
            debounce_samples: 2,
            drift_baseline: 8,
            drift_threshold_db: 2.0,
            error_burst_limit: 1000,
        }
    }
}

/// Debounce plus edge-trigger gate for one persisting condition.
#[derive(Debug, Default)]
struct ConditionGate {
    consecutive: u32,
    active: bool,
    severity: Option<Severity>,
}

impl ConditionGate {
    /// Feed one observation; returns the severity to emit with, if any.
    fn observe(&mut self, firing: Option<Severity>, debounce: u32) -> Option<Severity> {
        let Some(severity) = firing else {
            self.consecutive = 0;
            self.active = false;
            self.severity = None;
            return None;
        };
        self.consecutive = self.consecutive.saturating_add(1);
        if self.consecutive < debounce {
            return None;
        }
        if self.active && self.severity == Some(severity) {
            return None;
        }
        self.active = true;
        self.severity = Some(severity);
        Some(severity)
    }
}

#[derive(Debug)]
struct ChannelTrack {
    powers: VecDeque<f64>,
    modulation: Modulation,
    pending_modulation: Option<(Modulation, u32)>,
    drift: ConditionGate,
    uncorrectable: u64,
    misses: u32,
}

impl ChannelTrack {
    fn seed(power: f64, modulation: Modulation, uncorrectable: u64, capacity: usize) -> Self {
        let mut powers = VecDeque::with_capacity(capacity);
        powers.push_back(power);
        ChannelTrack {
            powers,
            modulation,
            pending_modulation: None,
            drift: ConditionGate::default(),
            uncorrectable,
            misses: 0,
        }
    }

    fn baseline(&self) -> Option<f64> {
        if self.powers.len() < 2 {
            return None;
        }
        Some(self.powers.iter().sum::<f64>() / self.powers.len() as f64)
    }

    fn push_power(&mut self, power: f64, capacity: usize) {
        if self.powers.len() >= capacity.max(1) {
            self.powers.pop_front();
        }
        self.powers.push_back(power);
    }
}

#[derive(Debug, Clone, Copy)]
struct PrevCycle {
    health: Health,
    ds_total: u32,
    us_total: u32,
}

/// Compares each new classified snapshot against bounded recent history and
/// emits anomaly events. Owned by the poll orchestrator; single writer.
pub struct EventDetector {
    tuning: DetectorTuning,
    tracks: HashMap<(Direction, u32), ChannelTrack>,
    prev: Option<PrevCycle>,
}

impl EventDetector {
    pub fn new(tuning: DetectorTuning) -> Self {
        EventDetector {
            tuning,
            tracks: HashMap::new(),
            prev: None,
        }
    }

    /// Process one snapshot; returns the events it gives rise to. The caller
    /// persists them in the same transaction as the snapshot.
    pub fn update(&mut self, raw: &RawSnapshot, classification: &Classification) -> Vec<Event> {
        let now = raw.captured_at;
        let summary = &classification.summary;

        let Some(prev) = self.prev else {
            for ch in &raw.channels {
                self.tracks.insert(
                    (ch.direction, ch.channel_id),
                    ChannelTrack::seed(
                        ch.power_dbmv,
                        ch.modulation.clone(),
                        ch.uncorrectable_errors,
                        self.tuning.drift_baseline,
                    ),
                );
            }
            self.prev = Some(PrevCycle {
                health: classification.aggregate,
                ds_total: summary.ds_total,
                us_total: summary.us_total,
            });
            return vec![Event {
                kind: EventKind::MonitoringStarted,
                severity: Severity::Info,
                channel_id: None,
                direction: None,
                previous_value: None,
                new_value: Some(classification.aggregate.to_string()),
                message: format!("Monitoring started (health: {})", classification.aggregate),
                observed_at: now,
            }];
        };

        let mut events = Vec::new();
        self.check_health(&mut events, now, prev.health, classification.aggregate);
        self.check_count(
            &mut events,
            now,
            Direction::Downstream,
            prev.ds_total,
            summary.ds_total,
        );
        self.check_count(
            &mut events,
            now,
            Direction::Upstream,
            prev.us_total,
            summary.us_total,
        );

        for track in self.tracks.values_mut() {
            track.misses = track.misses.saturating_add(1);
        }
        for ch in &raw.channels {
            let key = (ch.direction, ch.channel_id);
            let tuning = self.tuning;
            let track = self.tracks.entry(key).or_insert_with(|| {
                ChannelTrack::seed(
                    ch.power_dbmv,
                    ch.modulation.clone(),
                    ch.uncorrectable_errors,
                    tuning.drift_baseline,
                )
            });
            if track.misses == 0 {
                // Freshly seeded this cycle; nothing to compare against yet.
                continue;
            }
            track.misses = 0;

            Self::check_modulation(&tuning, track, ch, now, &mut events);
            Self::check_drift(&tuning, track, ch.power_dbmv, ch.channel_id, ch.direction, now, &mut events);
            Self::check_errors(&tuning, track, ch, now, &mut events);
        }

        let stale_after = self.tuning.drift_baseline as u32;
        self.tracks.retain(|_, t| t.misses <= stale_after);

        self.prev = Some(PrevCycle {
            health: classification.aggregate,
            ds_total: summary.ds_total,
            us_total: summary.us_total,
        });
        events
    }

    fn check_health(
        &self,
        events: &mut Vec<Event>,
        now: DateTime<Utc>,
        prev: Health,
        current: Health,
    ) {
        if prev == current {
            return;
        }
        let (severity, message) = if current > prev {
            let severity = if current == Health::Poor {
                Severity::Critical
            } else {
                Severity::Warning
            };
            (severity, format!("Health degraded from {prev} to {current}"))
        } else {
            (
                Severity::Info,
                format!("Health recovered from {prev} to {current}"),
            )
        };
        events.push(Event {
            kind: EventKind::HealthChange,
            severity,
            channel_id: None,
            direction: None,
            previous_value: Some(prev.to_string()),
            new_value: Some(current.to_string()),
            message,
            observed_at: now,
        });
    }

    fn check_count(
        &self,
        events: &mut Vec<Event>,
        now: DateTime<Utc>,
        direction: Direction,
        prev: u32,
        current: u32,
    ) {
        if prev == current {
            return;
        }
        // Losing bonded channels is always significant; gains are informational.
        let severity = if current < prev {
            Severity::Critical
        } else {
            Severity::Info
        };
        events.push(Event {
            kind: EventKind::ChannelCountChange,
            severity,
            channel_id: None,
            direction: Some(direction),
            previous_value: Some(prev.to_string()),
            new_value: Some(current.to_string()),
            message: format!("{direction} channel count changed from {prev} to {current}"),
            observed_at: now,
        });
    }

    fn check_modulation(
        tuning: &DetectorTuning,
        track: &mut ChannelTrack,
        ch: &crate::model::ChannelReading,
        now: DateTime<Utc>,
        events: &mut Vec<Event>,
    ) {
        if ch.modulation == track.modulation {
            track.pending_modulation = None;
            return;
        }
        let count = match &mut track.pending_modulation {
            Some((pending, count)) if *pending == ch.modulation => {
                *count += 1;
                *count
            }
            _ => {
                track.pending_modulation = Some((ch.modulation.clone(), 1));
                1
            }
        };
        if count < tuning.debounce_samples {
            return;
        }

        let severity = if track.modulation.is_downgrade_to(&ch.modulation) {
            Severity::Warning
        } else {
            Severity::Info
        };
        events.push(Event {
            kind: EventKind::ModulationChange,
            severity,
            channel_id: Some(ch.channel_id),
            direction: Some(ch.direction),
            previous_value: Some(track.modulation.to_string()),
            new_value: Some(ch.modulation.to_string()),
            message: format!(
                "Channel {} {} modulation changed from {} to {}",
                ch.channel_id, ch.direction, track.modulation, ch.modulation
            ),
            observed_at: now,
        });
        track.modulation = ch.modulation.clone();
        track.pending_modulation = None;
    }

    fn check_drift(
        tuning: &DetectorTuning,
        track: &mut ChannelTrack,
        power: f64,
        channel_id: u32,
        direction: Direction,
        now: DateTime<Utc>,
        events: &mut Vec<Event>,
    ) {
        let firing = track.baseline().and_then(|mean| {
            let delta = (power - mean).abs();
            if delta <= tuning.drift_threshold_db {
                return None;
            }
            let severity = if delta > 2.0 * tuning.drift_threshold_db {
                Severity::Critical
            } else {
                Severity::Warning
            };
            Some((mean, delta, severity))
        });

        match firing {
            Some((mean, delta, severity)) => {
                if let Some(severity) = track
                    .drift
                    .observe(Some(severity), tuning.debounce_samples)
                {
                    events.push(Event {
                        kind: EventKind::PowerDrift,
                        severity,
                        channel_id: Some(channel_id),
                        direction: Some(direction),
                        previous_value: Some(format!("{mean:.1}")),
                        new_value: Some(format!("{power:.1}")),
                        message: format!(
                            "Channel {channel_id} {direction} power drifted {delta:.1} dB from baseline {mean:.1} dBmV"
                        ),
                        observed_at: now,
                    });
                }
            }
            None => {
                track.drift.observe(None, tuning.debounce_samples);
                // The baseline tracks normal operation only; drifting samples
                // do not drag the mean toward themselves.
                track.push_power(power, tuning.drift_baseline);
            }
        }
    }

    fn check_errors(
        tuning: &DetectorTuning,
        track: &mut ChannelTrack,
        ch: &crate::model::ChannelReading,
        now: DateTime<Utc>,
        events: &mut Vec<Event>,
    ) {
        let current = ch.uncorrectable_errors;
        let previous = track.uncorrectable;
        track.uncorrectable = current;
        if current < previous {
            // Counter reset, typically a modem reboot.
            return;
        }
        let delta = current - previous;
        if delta <= tuning.error_burst_limit {
            return;
        }
        events.push(Event {
            kind: EventKind::ErrorBurst,
            severity: Severity::Warning,
            channel_id: Some(ch.channel_id),
            direction: Some(ch.direction),
            previous_value: Some(previous.to_string()),
            new_value: Some(current.to_string()),
            message: format!(
                "Channel {} {} uncorrectable errors jumped by {delta} (from {previous} to {current})",
                ch.channel_id, ch.direction
            ),
            observed_at: now,
        });
    }
}
