use std::path::PathBuf;

use thiserror::Error;

/// Authentication failures. Never retried with the same session; the poller
/// always re-authenticates from scratch after one of these.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("credentials rejected by modem")]
    CredentialsRejected,

    #[error("authentication handshake failed: {0}")]
    Handshake(String),

    #[error("integrity check failed on encrypted response")]
    IntegrityFailure,

    #[error("refusing to reuse a nonce value")]
    NonceReuse,

    #[error("authentication request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Data retrieval failures after a session was established.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The modem no longer accepts the session handle. The poller interprets
    /// this as "re-authenticate and retry once".
    #[error("session expired or rejected by modem")]
    SessionExpired,

    #[error("fetch request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl FetchError {
    pub fn is_session_expired(&self) -> bool {
        matches!(self, FetchError::SessionExpired)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("modem password is not set (use --modem-password or MODEM_PASSWORD)")]
    MissingPassword,

    #[error("modem url '{0}' is not a http(s) url")]
    InvalidUrl(String),

    #[error("poll interval {0}s outside allowed range {min}..={max}s", min = crate::config::POLL_MIN_SECS, max = crate::config::POLL_MAX_SECS)]
    IntervalOutOfRange(u64),

    #[error("invalid tuning parameter: {0}")]
    InvalidTuning(String),

    #[error("threshold file {path}: {reason}")]
    Thresholds { path: PathBuf, reason: String },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to encode snapshot: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("database io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("store worker is gone")]
    WorkerGone,
}

/// Cycle-level failure surfaced by the poll orchestrator. The orchestrator is
/// the single place deciding retry vs. terminal-failure-for-this-cycle.
#[derive(Debug, Error)]
pub enum PollError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
