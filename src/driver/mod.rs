//! Modem driver abstraction.
//!
//! One implementation per modem family, selected by configuration at startup.
//! Drivers own authentication and raw-data retrieval only; they hold no state
//! between invocations beyond the session handle the orchestrator passes back.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use crate::error::{AuthError, FetchError};
use crate::model::{ConnectionInfo, DeviceInfo, RawSnapshot};

pub mod arris;
pub mod fritz;

pub use arris::ArrisDriver;
pub use fritz::FritzDriver;

/// Where the modem management interface lives.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub base_url: String,
    pub timeout: Duration,
}

impl Endpoint {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Endpoint { base_url, timeout }
    }
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Opaque authentication handle returned by a successful login. Owned by the
/// orchestrator; invalidated whenever a request signals authentication
/// failure, which triggers a re-login.
#[derive(Debug)]
pub enum DriverSession {
    Fritz(fritz::FritzSession),
    Arris(arris::ArrisSession),
    #[cfg(test)]
    Stub,
}

#[async_trait]
pub trait ModemDriver: Send + Sync {
    fn family(&self) -> &'static str;

    async fn authenticate(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
    ) -> Result<DriverSession, AuthError>;

    async fn fetch_channels(
        &self,
        session: &DriverSession,
        endpoint: &Endpoint,
    ) -> Result<RawSnapshot, FetchError>;

    async fn fetch_device_info(
        &self,
        session: &DriverSession,
        endpoint: &Endpoint,
    ) -> Result<DeviceInfo, FetchError>;

    /// Best-effort; `Ok(None)` means the modem does not expose connection
    /// info, which is distinct from a fetch failure.
    async fn fetch_connection_info(
        &self,
        session: &DriverSession,
        endpoint: &Endpoint,
    ) -> Result<Option<ConnectionInfo>, FetchError>;
}

/// Modem endpoints sit on RFC1918 addresses with self-signed certificates.
pub(crate) fn build_client(timeout: Duration, cookie_store: bool) -> Result<Client, reqwest::Error> {
    Client::builder()
        .danger_accept_invalid_certs(true)
        .cookie_store(cookie_store)
        .timeout(timeout)
        .build()
}

/// A session handle from a different driver family. Reported as expired so
/// the orchestrator re-authenticates and obtains the right kind.
pub(crate) fn session_mismatch() -> FetchError {
    FetchError::SessionExpired
}

/// Parse a frequency the firmware may report as Hz, MHz, or a "602~698"
/// OFDM range (first edge taken).
pub(crate) fn parse_frequency_hz(raw: &str) -> Option<u64> {
    let first = raw.split('~').next()?.trim();
    let first = first
        .trim_end_matches("MHz")
        .trim_end_matches("Hz")
        .trim();
    let value: f64 = first.parse().ok()?;
    if value <= 0.0 {
        return None;
    }
    // Values above 10 kHz are already Hz; smaller ones are MHz.
    if value > 10_000.0 {
        Some(value as u64)
    } else {
        Some((value * 1_000_000.0) as u64)
    }
}

/// Parse a power level like "3.2 dBmV / 320 dBuV", "3.2/320", or "3.2".
pub(crate) fn parse_power_dbmv(raw: &str) -> Option<f64> {
    let first = raw.split('/').next()?;
    let cleaned = first.replace("dBmV", "").replace("dBuV", "");
    cleaned.trim().parse().ok()
}

// Firmware JSON is inconsistent about numbers vs. strings; these accept both.

pub(crate) fn json_f64(v: &Value) -> Option<f64> {
    v.as_f64().or_else(|| v.as_str().and_then(parse_power_dbmv))
}

pub(crate) fn json_u64(v: &Value) -> u64 {
    v.as_u64()
        .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
        .unwrap_or(0)
}

pub(crate) fn json_frequency(v: &Value) -> Option<u64> {
    match v {
        Value::String(s) => parse_frequency_hz(s),
        Value::Number(n) => parse_frequency_hz(&n.to_string()),
        _ => None,
    }
}
