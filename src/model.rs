//! Core data model: raw channel readings, health classification, and events.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Downstream,
    Upstream,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Downstream => "downstream",
            Direction::Upstream => "upstream",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "downstream" => Some(Direction::Downstream),
            "upstream" => Some(Direction::Upstream),
            _ => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocsisVersion {
    #[serde(rename = "3.0")]
    V30,
    #[serde(rename = "3.1")]
    V31,
    #[serde(rename = "4.0")]
    V40,
}

impl fmt::Display for DocsisVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DocsisVersion::V30 => "3.0",
            DocsisVersion::V31 => "3.1",
            DocsisVersion::V40 => "4.0",
        };
        f.write_str(s)
    }
}

/// Modulation profile as reported by the modem ("256QAM", "QAM64", "OFDM", ...).
/// Kept verbatim so snapshots round-trip exactly; ordering is derived on demand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Modulation(pub String);

impl Modulation {
    pub fn new(s: impl Into<String>) -> Self {
        Modulation(s.into())
    }

    /// QAM constellation size, if this is a recognizable QAM profile.
    /// OFDM/OFDMA profiles and unknown strings return None.
    pub fn qam_order(&self) -> Option<u32> {
        let norm: String = self
            .0
            .to_ascii_uppercase()
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '-')
            .collect();
        if !norm.contains("QAM") {
            return None;
        }
        let digits: String = norm.chars().filter(|c| c.is_ascii_digit()).collect();
        digits.parse().ok()
    }

    /// True when `other` carries fewer bits per symbol than `self`.
    pub fn is_downgrade_to(&self, other: &Modulation) -> bool {
        match (self.qam_order(), other.qam_order()) {
            (Some(old), Some(new)) => new < old,
            _ => false,
        }
    }
}

impl fmt::Display for Modulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One physical channel's raw measurement within a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelReading {
    pub channel_id: u32,
    pub direction: Direction,
    pub frequency_hz: u64,
    pub power_dbmv: f64,
    /// Downstream only (SNR or MER depending on DOCSIS version).
    pub snr_db: Option<f64>,
    pub modulation: Modulation,
    pub correctable_errors: u64,
    pub uncorrectable_errors: u64,
    pub docsis_version: DocsisVersion,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub model: String,
    pub firmware: String,
    pub uptime_seconds: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub max_downstream_kbps: u64,
    pub max_upstream_kbps: u64,
    pub connection_type: String,
}

/// Ordered channel readings plus device/connection info, timestamped at
/// acquisition. Immutable once handed to the analyzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSnapshot {
    pub captured_at: DateTime<Utc>,
    pub device: DeviceInfo,
    pub connection: Option<ConnectionInfo>,
    pub channels: Vec<ChannelReading>,
}

impl RawSnapshot {
    pub fn channels_in(&self, direction: Direction) -> impl Iterator<Item = &ChannelReading> {
        self.channels.iter().filter(move |c| c.direction == direction)
    }

    /// First (direction, channel_id) pair that appears twice, if any.
    /// Drivers reject such snapshots as malformed.
    pub fn duplicate_channel(&self) -> Option<(Direction, u32)> {
        let mut seen = HashSet::new();
        for ch in &self.channels {
            if !seen.insert((ch.direction, ch.channel_id)) {
                return Some((ch.direction, ch.channel_id));
            }
        }
        None
    }
}

/// Per-channel / aggregate health tag. Ordering is severity order, so the
/// aggregate is simply the maximum over all channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Good,
    Marginal,
    Poor,
}

impl Health {
    pub fn as_str(&self) -> &'static str {
        match self {
            Health::Good => "good",
            Health::Marginal => "marginal",
            Health::Poor => "poor",
        }
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Machine-readable issue codes attached per violated metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCode {
    PowerLow,
    PowerHigh,
    SnrLow,
    ErrorsHigh,
    NoChannels,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelAssessment {
    pub channel_id: u32,
    pub direction: Direction,
    pub health: Health,
    pub issues: Vec<IssueCode>,
}

/// Summary statistics over one snapshot; feeds trend aggregation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub ds_total: u32,
    pub us_total: u32,
    pub ds_power_min: f64,
    pub ds_power_max: f64,
    pub ds_power_avg: f64,
    pub us_power_min: f64,
    pub us_power_max: f64,
    pub us_power_avg: f64,
    pub ds_snr_min: f64,
    pub ds_snr_avg: f64,
    pub correctable_total: u64,
    pub uncorrectable_total: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub channels: Vec<ChannelAssessment>,
    pub aggregate: Health,
    pub aggregate_issues: Vec<IssueCode>,
    pub summary: Summary,
}

impl Classification {
    pub fn channel(&self, direction: Direction, channel_id: u32) -> Option<&ChannelAssessment> {
        self.channels
            .iter()
            .find(|c| c.direction == direction && c.channel_id == channel_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(Severity::Info),
            "warning" => Some(Severity::Warning),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    MonitoringStarted,
    HealthChange,
    ModulationChange,
    PowerDrift,
    ChannelCountChange,
    ErrorBurst,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::MonitoringStarted => "monitoring_started",
            EventKind::HealthChange => "health_change",
            EventKind::ModulationChange => "modulation_change",
            EventKind::PowerDrift => "power_drift",
            EventKind::ChannelCountChange => "channel_count_change",
            EventKind::ErrorBurst => "error_burst",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "monitoring_started" => Some(EventKind::MonitoringStarted),
            "health_change" => Some(EventKind::HealthChange),
            "modulation_change" => Some(EventKind::ModulationChange),
            "power_drift" => Some(EventKind::PowerDrift),
            "channel_count_change" => Some(EventKind::ChannelCountChange),
            "error_burst" => Some(EventKind::ErrorBurst),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable anomaly fact emitted by the event detector, append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub severity: Severity,
    pub channel_id: Option<u32>,
    pub direction: Option<Direction>,
    pub previous_value: Option<String>,
    pub new_value: Option<String>,
    pub message: String,
    pub observed_at: DateTime<Utc>,
}

/// Snapshot as persisted: raw data + classification + the events derived from
/// it, keyed by the store's row id. Write-once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSnapshot {
    pub id: i64,
    pub captured_at: DateTime<Utc>,
    pub raw: RawSnapshot,
    pub classification: Classification,
    pub events: Vec<Event>,
}

/// Event row as returned by the store's event index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub id: i64,
    pub snapshot_id: i64,
    pub event: Event,
}
