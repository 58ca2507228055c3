//! Command line and environment configuration.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::detector::DetectorTuning;
use crate::driver::{Credentials, Endpoint};
use crate::error::ConfigError;

pub const POLL_MIN_SECS: u64 = 60;
pub const POLL_MAX_SECS: u64 = 14_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModemKind {
    /// AVM FRITZ!Box Cable (challenge-response login)
    Fritz,
    /// ARRIS TG3442DE / Vodafone Station (AES-CCM login)
    Arris,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Monitor DOCSIS signal quality of a cable modem", long_about = None)]
pub struct Settings {
    /// Modem family to talk to
    #[arg(long, env = "MODEM_TYPE", value_enum)]
    pub modem_type: ModemKind,

    /// Base URL of the modem management interface
    #[arg(long, env = "MODEM_URL", default_value = "http://192.168.0.1")]
    pub modem_url: String,

    /// Login user name
    #[arg(long, env = "MODEM_USER", default_value = "admin")]
    pub modem_user: String,

    /// Login password
    #[arg(long, env = "MODEM_PASSWORD", hide_env_values = true)]
    pub modem_password: Option<String>,

    /// Poll interval in seconds
    #[arg(long, env = "POLL_INTERVAL", default_value = "900")]
    pub poll_interval: u64,

    /// Days of history to keep; 0 keeps everything
    #[arg(long, env = "HISTORY_DAYS", default_value = "90")]
    pub history_days: u32,

    /// Directory for the history database
    #[arg(long, env = "DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// JSON file with threshold overrides, reloaded on change
    #[arg(long, env = "THRESHOLDS_FILE")]
    pub thresholds_file: Option<PathBuf>,

    /// Per-request timeout in seconds
    #[arg(long, default_value = "10")]
    pub request_timeout: u64,

    /// Fetch retries per poll cycle before the cycle counts as failed
    #[arg(long, default_value = "2")]
    pub fetch_retries: u32,

    /// Consecutive snapshots before a persisting condition raises an event
    #[arg(long, default_value = "2")]
    pub debounce_samples: u32,

    /// Samples in the per-channel power baseline
    #[arg(long, default_value = "8")]
    pub drift_baseline: usize,

    /// Power deviation from the baseline that counts as drift, in dB
    #[arg(long, default_value = "2.0")]
    pub drift_threshold_db: f64,

    /// Uncorrectable error increase per cycle that counts as a burst
    #[arg(long, default_value = "1000")]
    pub error_burst_limit: u64,
}

impl Settings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.modem_password.as_deref().unwrap_or("").is_empty() {
            return Err(ConfigError::MissingPassword);
        }
        if !self.modem_url.starts_with("http://") && !self.modem_url.starts_with("https://") {
            return Err(ConfigError::InvalidUrl(self.modem_url.clone()));
        }
        if !(POLL_MIN_SECS..=POLL_MAX_SECS).contains(&self.poll_interval) {
            return Err(ConfigError::IntervalOutOfRange(self.poll_interval));
        }
        if self.request_timeout == 0 {
            return Err(ConfigError::InvalidTuning(
                "request timeout must be at least 1 second".into(),
            ));
        }
        if self.debounce_samples == 0 {
            return Err(ConfigError::InvalidTuning(
                "debounce sample count must be at least 1".into(),
            ));
        }
        if self.drift_baseline < 2 {
            return Err(ConfigError::InvalidTuning(
                "drift baseline needs at least 2 samples".into(),
            ));
        }
        if !self.drift_threshold_db.is_finite() || self.drift_threshold_db <= 0.0 {
            return Err(ConfigError::InvalidTuning(
                "drift threshold must be a positive number of dB".into(),
            ));
        }
        Ok(())
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(
            self.modem_url.clone(),
            Duration::from_secs(self.request_timeout),
        )
    }

    pub fn credentials(&self) -> Result<Credentials, ConfigError> {
        let password = self
            .modem_password
            .clone()
            .filter(|p| !p.is_empty())
            .ok_or(ConfigError::MissingPassword)?;
        Ok(Credentials {
            username: self.modem_user.clone(),
            password,
        })
    }

    pub fn tuning(&self) -> DetectorTuning {
        DetectorTuning {
            debounce_samples: self.debounce_samples,
            drift_baseline: self.drift_baseline,
            drift_threshold_db: self.drift_threshold_db,
            error_burst_limit: self.error_burst_limit,
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("cablewatch.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn base_args() -> Vec<&'static str> {
        vec![
            "cablewatch",
            "--modem-type",
            "fritz",
            "--modem-password",
            "secret",
        ]
    }

    fn parse(extra: &[&str]) -> Settings {
        let mut args = base_args();
        args.extend_from_slice(extra);
        Settings::parse_from(args)
    }

    #[test]
    fn defaults_validate() {
        let settings = parse(&[]);
        settings.validate().unwrap();
        assert_eq!(settings.poll_interval, 900);
        assert_eq!(settings.history_days, 90);
        assert_eq!(settings.tuning().debounce_samples, 2);
    }

    #[test]
    fn missing_password_is_rejected() {
        let settings = Settings::parse_from(["cablewatch", "--modem-type", "arris"]);
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::MissingPassword)
        ));
    }

    #[test]
    fn poll_interval_bounds_are_enforced() {
        let settings = parse(&["--poll-interval", "30"]);
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::IntervalOutOfRange(30))
        ));
        let settings = parse(&["--poll-interval", "86400"]);
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::IntervalOutOfRange(86400))
        ));
        parse(&["--poll-interval", "60"]).validate().unwrap();
        parse(&["--poll-interval", "14400"]).validate().unwrap();
    }

    #[test]
    fn non_http_url_is_rejected() {
        let settings = parse(&["--modem-url", "ftp://192.168.0.1"]);
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::InvalidUrl(_))
        ));
    }

    #[test]
    fn zero_debounce_is_rejected() {
        let settings = parse(&["--debounce-samples", "0"]);
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::InvalidTuning(_))
        ));
    }

    #[test]
    fn endpoint_drops_trailing_slash() {
        let settings = parse(&["--modem-url", "http://192.168.0.1/"]);
        assert_eq!(settings.endpoint().base_url, "http://192.168.0.1");
    }
}
