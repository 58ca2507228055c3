//! Driver for AVM FRITZ!Box Cable routers.
//!
//! Authentication is a two-step challenge-response against `login_sid.lua`:
//! the box issues a challenge, the client proves knowledge of the password by
//! hashing challenge material and submits the result for a session id. Modern
//! firmware issues a `2$`-prefixed challenge answered with two-stage
//! PBKDF2-HMAC-SHA256; older firmware falls back to MD5 over UTF-16-LE,
//! kept only for compatibility.

use async_trait::async_trait;
use chrono::Utc;
use md5::{Digest, Md5};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use sha2::Sha256;
use tracing::{debug, info};

use crate::error::{AuthError, FetchError};
use crate::model::{
    ChannelReading, ConnectionInfo, DeviceInfo, Direction, DocsisVersion, Modulation, RawSnapshot,
};

use super::{
    build_client, json_f64, json_frequency, json_u64, session_mismatch, Credentials,
    DriverSession, Endpoint, ModemDriver,
};

const NULL_SID: &str = "0000000000000000";

#[derive(Debug)]
pub struct FritzSession {
    client: Client,
    sid: String,
}

#[derive(Default)]
pub struct FritzDriver;

impl FritzDriver {
    pub fn new() -> Self {
        FritzDriver
    }
}

fn extract_tag(text: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = text.find(&open)? + open.len();
    let end = text[start..].find(&close)? + start;
    Some(text[start..end].to_string())
}

/// Compute the login response for a challenge.
///
/// `2$iter1$salt1$iter2$salt2` challenges use the two-stage PBKDF2 scheme and
/// answer with `salt2$hex(hash2)`. Anything else is treated as a legacy MD5
/// challenge answered with `challenge-md5(utf16le(challenge-password))`.
pub fn challenge_reply(challenge: &str, password: &str) -> Result<String, AuthError> {
    if let Some(rest) = challenge.strip_prefix("2$") {
        let parts: Vec<&str> = rest.split('$').collect();
        let [iter1, salt1, iter2, salt2] = parts[..] else {
            return Err(AuthError::Handshake(format!(
                "unexpected challenge format '{challenge}'"
            )));
        };
        let bad = |what: &str| AuthError::Handshake(format!("invalid {what} in challenge"));
        let iter1: u32 = iter1.parse().map_err(|_| bad("iteration count"))?;
        let iter2: u32 = iter2.parse().map_err(|_| bad("iteration count"))?;
        let salt1_bytes = hex::decode(salt1).map_err(|_| bad("salt"))?;
        let salt2_bytes = hex::decode(salt2).map_err(|_| bad("salt"))?;

        let hash1 =
            pbkdf2::pbkdf2_hmac_array::<Sha256, 32>(password.as_bytes(), &salt1_bytes, iter1);
        let hash2 = pbkdf2::pbkdf2_hmac_array::<Sha256, 32>(&hash1, &salt2_bytes, iter2);
        Ok(format!("{salt2}${}", hex::encode(hash2)))
    } else {
        let utf16le: Vec<u8> = format!("{challenge}-{password}")
            .encode_utf16()
            .flat_map(|unit| unit.to_le_bytes())
            .collect();
        let digest = Md5::digest(&utf16le);
        Ok(format!("{challenge}-{}", hex::encode(digest)))
    }
}

impl FritzDriver {
    /// POST one `data.lua` page and return its `data` object.
    async fn page(
        &self,
        session: &FritzSession,
        endpoint: &Endpoint,
        page: &str,
    ) -> Result<Value, FetchError> {
        let form = [
            ("xhr", "1"),
            ("sid", session.sid.as_str()),
            ("lang", "en"),
            ("page", page),
            ("xhrId", "all"),
            ("no_sidrenew", ""),
        ];
        let response = session
            .client
            .post(format!("{}/data.lua", endpoint.base_url))
            .form(&form)
            .send()
            .await?;
        if response.status() == StatusCode::FORBIDDEN {
            return Err(FetchError::SessionExpired);
        }
        let text = response.error_for_status()?.text().await?;

        let mut value: Value = match serde_json::from_str(&text) {
            Ok(value) => value,
            // An invalidated SID gets the login page instead of JSON.
            Err(_) if text.contains("<html") || text.contains("login") => {
                return Err(FetchError::SessionExpired);
            }
            Err(e) => return Err(FetchError::Malformed(format!("page {page}: {e}"))),
        };
        match value.get_mut("data") {
            Some(data) => Ok(data.take()),
            None => Err(FetchError::SessionExpired),
        }
    }
}

fn read_channel(
    ch: &Value,
    direction: Direction,
    version: DocsisVersion,
) -> Result<ChannelReading, FetchError> {
    let malformed = |what: &str| {
        FetchError::Malformed(format!("channel entry missing or invalid field '{what}'"))
    };
    let channel_id = ch
        .get("channelID")
        .map(json_u64)
        .filter(|id| *id > 0)
        .ok_or_else(|| malformed("channelID"))? as u32;
    let frequency_hz = ch
        .get("frequency")
        .and_then(json_frequency)
        .unwrap_or(0);
    let power_dbmv = ch
        .get("powerLevel")
        .and_then(json_f64)
        .ok_or_else(|| malformed("powerLevel"))?;

    // DOCSIS 3.0 reports MSE (negated SNR), 3.1 reports MER.
    let snr_db = match (direction, version) {
        (Direction::Downstream, DocsisVersion::V30) => {
            ch.get("mse").and_then(json_f64).map(f64::abs)
        }
        (Direction::Downstream, _) => ch.get("mer").and_then(json_f64),
        (Direction::Upstream, _) => None,
    };

    let modulation = ch
        .get("modulation")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .or_else(|| ch.get("type").and_then(Value::as_str))
        .unwrap_or_default();

    Ok(ChannelReading {
        channel_id,
        direction,
        frequency_hz,
        power_dbmv,
        snr_db,
        modulation: Modulation::new(modulation),
        correctable_errors: ch.get("corrErrors").map(json_u64).unwrap_or(0),
        uncorrectable_errors: ch.get("nonCorrErrors").map(json_u64).unwrap_or(0),
        docsis_version: version,
    })
}

fn read_group(
    data: &Value,
    key: &str,
    direction: Direction,
    channels: &mut Vec<ChannelReading>,
) -> Result<(), FetchError> {
    let Some(group) = data.get(key) else {
        return Ok(());
    };
    for (sub, version) in [("docsis30", DocsisVersion::V30), ("docsis31", DocsisVersion::V31)] {
        let Some(entries) = group.get(sub).and_then(Value::as_array) else {
            continue;
        };
        for entry in entries {
            channels.push(read_channel(entry, direction, version)?);
        }
    }
    Ok(())
}

#[async_trait]
impl ModemDriver for FritzDriver {
    fn family(&self) -> &'static str {
        "fritz"
    }

    async fn authenticate(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
    ) -> Result<DriverSession, AuthError> {
        let client = build_client(endpoint.timeout, false)?;

        let text = client
            .get(format!(
                "{}/login_sid.lua?version=2&username={}",
                endpoint.base_url, credentials.username
            ))
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        if let Some(block) = extract_tag(&text, "BlockTime") {
            if block.trim().parse::<u32>().unwrap_or(0) > 0 {
                return Err(AuthError::Handshake(format!(
                    "login temporarily blocked for {block}s"
                )));
            }
        }
        let challenge = extract_tag(&text, "Challenge")
            .ok_or_else(|| AuthError::Handshake("no challenge in login response".into()))?;
        debug!(family = "fritz", "received login challenge");

        let reply = challenge_reply(&challenge, &credentials.password)?;
        let text = client
            .get(format!(
                "{}/login_sid.lua?version=2&username={}&response={}",
                endpoint.base_url, credentials.username, reply
            ))
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        let sid = extract_tag(&text, "SID")
            .ok_or_else(|| AuthError::Handshake("no SID in login response".into()))?;
        if sid == NULL_SID {
            return Err(AuthError::CredentialsRejected);
        }
        info!(family = "fritz", "authenticated");
        Ok(DriverSession::Fritz(FritzSession { client, sid }))
    }

    async fn fetch_channels(
        &self,
        session: &DriverSession,
        endpoint: &Endpoint,
    ) -> Result<RawSnapshot, FetchError> {
        let DriverSession::Fritz(session) = session else {
            return Err(session_mismatch());
        };
        let data = self.page(session, endpoint, "docInfo").await?;
        if data.get("channelDs").is_none() && data.get("channelUs").is_none() {
            return Err(FetchError::Malformed(
                "docInfo response carries no channel data".into(),
            ));
        }

        let mut channels = Vec::new();
        read_group(&data, "channelDs", Direction::Downstream, &mut channels)?;
        read_group(&data, "channelUs", Direction::Upstream, &mut channels)?;

        let snapshot = RawSnapshot {
            captured_at: Utc::now(),
            device: DeviceInfo::default(),
            connection: None,
            channels,
        };
        if let Some((direction, id)) = snapshot.duplicate_channel() {
            return Err(FetchError::Malformed(format!(
                "duplicate {direction} channel id {id}"
            )));
        }
        debug!(channels = snapshot.channels.len(), "fetched channel table");
        Ok(snapshot)
    }

    async fn fetch_device_info(
        &self,
        session: &DriverSession,
        endpoint: &Endpoint,
    ) -> Result<DeviceInfo, FetchError> {
        let DriverSession::Fritz(session) = session else {
            return Err(session_mismatch());
        };
        let data = self.page(session, endpoint, "overview").await?;
        let fritzos = data.get("fritzos").cloned().unwrap_or(Value::Null);
        Ok(DeviceInfo {
            model: fritzos
                .get("Productname")
                .and_then(Value::as_str)
                .unwrap_or("FRITZ!Box")
                .to_string(),
            firmware: fritzos
                .get("nspver")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            uptime_seconds: fritzos.get("Uptime").and_then(Value::as_u64),
        })
    }

    async fn fetch_connection_info(
        &self,
        session: &DriverSession,
        endpoint: &Endpoint,
    ) -> Result<Option<ConnectionInfo>, FetchError> {
        let DriverSession::Fritz(session) = session else {
            return Err(session_mismatch());
        };
        let data = self.page(session, endpoint, "netMoni").await?;
        let Some(conn) = data
            .get("connections")
            .and_then(Value::as_array)
            .and_then(|c| c.first())
        else {
            return Ok(None);
        };
        Ok(Some(ConnectionInfo {
            max_downstream_kbps: conn.get("downstream").map(json_u64).unwrap_or(0),
            max_upstream_kbps: conn.get("upstream").map(json_u64).unwrap_or(0),
            connection_type: conn
                .get("medium")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        }))
    }
}
