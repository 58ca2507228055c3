//! DOCSIS signal monitor for consumer cable modems.
//!
//! Periodically logs into a modem's management interface, reads per-channel
//! signal data, classifies it against operator thresholds, detects anomalies
//! across consecutive snapshots, and keeps a retention-bounded history in
//! SQLite.

pub mod analyzer;
pub mod config;
pub mod detector;
pub mod driver;
pub mod error;
pub mod model;
pub mod poller;
pub mod store;
pub mod thresholds;
