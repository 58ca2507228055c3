//! Channel health thresholds with atomic hot reload.
//!
//! The table is read-mostly: the analyzer receives an immutable snapshot per
//! classification, and file changes swap the whole table atomically so no
//! reader ever observes a half-updated set of bounds.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::SystemTime;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::ConfigError;

/// Band a metric value falls into relative to its thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricBand {
    Good,
    Marginal,
    Critical,
}

/// Bounds for one metric. `None` means unbounded on that side.
/// Invariant: marginal_min <= good_min <= good_max <= marginal_max where set;
/// values outside the marginal bounds are in the critical band.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricThresholds {
    pub good_min: Option<f64>,
    pub good_max: Option<f64>,
    pub marginal_min: Option<f64>,
    pub marginal_max: Option<f64>,
}

impl Default for MetricThresholds {
    fn default() -> Self {
        MetricThresholds {
            good_min: None,
            good_max: None,
            marginal_min: None,
            marginal_max: None,
        }
    }
}

impl MetricThresholds {
    pub fn band_of(&self, value: f64) -> MetricBand {
        let below = |bound: Option<f64>| bound.is_some_and(|b| value < b);
        let above = |bound: Option<f64>| bound.is_some_and(|b| value > b);
        if below(self.marginal_min) || above(self.marginal_max) {
            MetricBand::Critical
        } else if below(self.good_min) || above(self.good_max) {
            MetricBand::Marginal
        } else {
            MetricBand::Good
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdTable {
    pub downstream_power: MetricThresholds,
    pub upstream_power: MetricThresholds,
    pub downstream_snr: MetricThresholds,
    /// Snapshot-wide uncorrectable error budget (aggregate issue only).
    pub uncorrectable_limit: u64,
}

impl Default for ThresholdTable {
    /// EuroDOCSIS 3.0/3.1 operator guideline values.
    fn default() -> Self {
        ThresholdTable {
            downstream_power: MetricThresholds {
                good_min: Some(-4.0),
                good_max: Some(13.0),
                marginal_min: Some(-8.0),
                marginal_max: Some(20.0),
            },
            upstream_power: MetricThresholds {
                good_min: Some(41.0),
                good_max: Some(47.0),
                marginal_min: Some(35.0),
                marginal_max: Some(53.0),
            },
            downstream_snr: MetricThresholds {
                good_min: Some(33.0),
                good_max: None,
                marginal_min: Some(29.0),
                marginal_max: None,
            },
            uncorrectable_limit: 10_000,
        }
    }
}

/// Holds the active threshold table and reloads it from a JSON file when the
/// file changes. Swaps are atomic; readers keep whatever Arc they loaded.
pub struct ThresholdStore {
    path: Option<PathBuf>,
    table: ArcSwap<ThresholdTable>,
    last_modified: Mutex<Option<SystemTime>>,
}

impl ThresholdStore {
    /// Built-in defaults, no backing file.
    pub fn builtin() -> Self {
        ThresholdStore {
            path: None,
            table: ArcSwap::from_pointee(ThresholdTable::default()),
            last_modified: Mutex::new(None),
        }
    }

    /// Load from a JSON file. A missing file falls back to defaults; an
    /// unparseable file is a configuration error.
    pub fn from_file(path: PathBuf) -> Result<Self, ConfigError> {
        let store = ThresholdStore {
            path: Some(path),
            table: ArcSwap::from_pointee(ThresholdTable::default()),
            last_modified: Mutex::new(None),
        };
        store.reload_if_changed()?;
        Ok(store)
    }

    /// The current table. Callers hold this snapshot for the duration of one
    /// classification; later reloads do not affect it.
    pub fn current(&self) -> Arc<ThresholdTable> {
        self.table.load_full()
    }

    /// Re-read the backing file when its mtime moved. Returns true when a new
    /// table was installed. A vanished file keeps the active table.
    pub fn reload_if_changed(&self) -> Result<bool, ConfigError> {
        let Some(path) = &self.path else {
            return Ok(false);
        };
        let meta = match std::fs::metadata(path) {
            Ok(meta) => meta,
            Err(_) => {
                warn!(path = %path.display(), "threshold file not readable, keeping active table");
                return Ok(false);
            }
        };
        let modified = meta.modified().ok();

        {
            let last = self.last_modified.lock().unwrap_or_else(|e| e.into_inner());
            if modified.is_some() && *last == modified {
                return Ok(false);
            }
        }

        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Thresholds {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        let table: ThresholdTable =
            serde_json::from_str(&text).map_err(|e| ConfigError::Thresholds {
                path: path.clone(),
                reason: e.to_string(),
            })?;

        self.table.store(Arc::new(table));
        *self.last_modified.lock().unwrap_or_else(|e| e.into_inner()) = modified;
        info!(path = %path.display(), "threshold table reloaded");
        Ok(true)
    }
}
