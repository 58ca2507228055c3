//! Driver for ARRIS TG3442DE-family gateways (Vodafone Station).
//!
//! The login page embeds a per-visit session id, salt, and IV in inline
//! JavaScript. The password is stretched with PBKDF2-HMAC-SHA256 into an
//! AES-128 key and the credential proof travels as an AES-CCM sealed JSON
//! blob. The server's sealed reply yields the CSRF nonce that must accompany
//! every later request.
//!
//! Every sealed message after login gets a fresh counter-derived nonce; the
//! driver refuses to operate once the counter space is exhausted rather than
//! reuse one.

use std::sync::atomic::{AtomicU32, Ordering};

use aes::Aes128;
use async_trait::async_trait;
use ccm::aead::generic_array::GenericArray;
use ccm::aead::{Aead, KeyInit, Payload};
use ccm::consts::{U16, U8};
use ccm::Ccm;
use chrono::Utc;
use regex::Regex;
use reqwest::Client;
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::{debug, info};

use crate::error::{AuthError, FetchError};
use crate::model::{
    ChannelReading, ConnectionInfo, DeviceInfo, Direction, DocsisVersion, Modulation, RawSnapshot,
};

use super::{
    build_client, json_f64, json_frequency, json_u64, session_mismatch, Credentials, DriverSession,
    Endpoint, ModemDriver,
};

/// 16-byte tag, 8-byte nonce, matching the firmware's CCM parameters.
type SessionCipher = Ccm<Aes128, U16, U8>;

const KEY_LEN: usize = 16;
const NONCE_LEN: usize = 8;
const PBKDF2_ROUNDS: u32 = 1000;
const CSRF_NONCE_LEN: usize = 32;

#[derive(Debug)]
pub struct ArrisSession {
    client: Client,
    csrf: String,
    key: [u8; KEY_LEN],
    base_nonce: [u8; NONCE_LEN],
    /// Next sealed-message nonce counter. Never reset for the session
    /// lifetime; login itself used the page IV verbatim.
    counter: AtomicU32,
}

impl ArrisSession {
    /// Derive the next message nonce: IV prefix plus a big-endian counter.
    fn next_nonce(&self) -> Result<[u8; NONCE_LEN], AuthError> {
        let count = self
            .counter
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| c.checked_add(1))
            .map_err(|_| AuthError::NonceReuse)?;
        let mut nonce = self.base_nonce;
        nonce[4..].copy_from_slice(&count.to_be_bytes());
        Ok(nonce)
    }

    /// Seal a payload for the gateway. Returns (nonce, ciphertext) hex.
    fn seal(&self, aad: &[u8], plaintext: &[u8]) -> Result<(String, String), AuthError> {
        let nonce = self.next_nonce()?;
        let sealed = encrypt(&self.key, &nonce, aad, plaintext)?;
        Ok((hex::encode(nonce), hex::encode(sealed)))
    }
}

fn encrypt(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, AuthError> {
    let cipher = SessionCipher::new(GenericArray::from_slice(key));
    cipher
        .encrypt(GenericArray::from_slice(nonce), Payload { msg: plaintext, aad })
        .map_err(|_| AuthError::Handshake("payload encryption failed".into()))
}

/// Decrypt and authenticate a sealed gateway response. A bad tag means the
/// response was tampered with or the key is wrong; we fail closed.
fn decrypt(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, AuthError> {
    let cipher = SessionCipher::new(GenericArray::from_slice(key));
    cipher
        .decrypt(GenericArray::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| AuthError::IntegrityFailure)
}

fn derive_key(password: &str, salt: &[u8]) -> [u8; KEY_LEN] {
    pbkdf2::pbkdf2_hmac_array::<Sha256, KEY_LEN>(password.as_bytes(), salt, PBKDF2_ROUNDS)
}

/// Pull a hex-valued JavaScript variable out of the login page.
fn js_var(body: &str, name: &str) -> Option<String> {
    let pattern = format!(r#"{name}\s*=\s*["']([0-9a-fA-F]+)["']"#);
    let re = Regex::new(&pattern).ok()?;
    Some(re.captures(body)?.get(1)?.as_str().to_string())
}

fn login_material(body: &str, name: &str, len: usize) -> Result<Vec<u8>, AuthError> {
    let raw = js_var(body, name)
        .ok_or_else(|| AuthError::Handshake(format!("login page missing '{name}'")))?;
    let bytes =
        hex::decode(&raw).map_err(|_| AuthError::Handshake(format!("'{name}' is not hex")))?;
    if bytes.len() < len {
        return Err(AuthError::Handshake(format!("'{name}' too short")));
    }
    Ok(bytes)
}

#[derive(Default)]
pub struct ArrisDriver;

impl ArrisDriver {
    pub fn new() -> Self {
        ArrisDriver
    }

    async fn page(
        &self,
        session: &ArrisSession,
        endpoint: &Endpoint,
        path: &str,
    ) -> Result<Value, FetchError> {
        let text = session
            .client
            .get(format!("{}{path}", endpoint.base_url))
            .header("csrfNonce", &session.csrf)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        // An expired session answers with the login page instead of JSON.
        if text.trim_start().starts_with('<') {
            return Err(FetchError::SessionExpired);
        }
        serde_json::from_str(&text).map_err(|e| FetchError::Malformed(format!("{path}: {e}")))
    }
}

/// Channel lists arrive either as plain arrays or as JSON-in-a-string.
fn channel_list(data: &Value, key: &str) -> Result<Vec<Value>, FetchError> {
    match data.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(entries)) => Ok(entries.clone()),
        Some(Value::String(inner)) => serde_json::from_str(inner)
            .map_err(|e| FetchError::Malformed(format!("'{key}' payload: {e}"))),
        Some(_) => Err(FetchError::Malformed(format!("'{key}' has unexpected type"))),
    }
}

fn read_channel(entry: &Value, direction: Direction) -> Result<ChannelReading, FetchError> {
    let malformed = |what: &str| {
        FetchError::Malformed(format!("channel entry missing or invalid field '{what}'"))
    };
    let channel_id = entry
        .get("ChannelID")
        .map(json_u64)
        .filter(|id| *id > 0)
        .ok_or_else(|| malformed("ChannelID"))? as u32;
    let power_dbmv = entry
        .get("PowerLevel")
        .and_then(json_f64)
        .ok_or_else(|| malformed("PowerLevel"))?;

    let channel_type = entry
        .get("ChannelType")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let docsis_version = if channel_type.to_ascii_uppercase().contains("OFDM") {
        DocsisVersion::V31
    } else {
        DocsisVersion::V30
    };
    let modulation = entry
        .get("Modulation")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .unwrap_or(channel_type);

    Ok(ChannelReading {
        channel_id,
        direction,
        frequency_hz: entry.get("Frequency").and_then(json_frequency).unwrap_or(0),
        power_dbmv,
        snr_db: match direction {
            Direction::Downstream => entry.get("SNRLevel").and_then(json_f64),
            Direction::Upstream => None,
        },
        modulation: Modulation::new(modulation),
        correctable_errors: entry.get("CorrectedErrors").map(json_u64).unwrap_or(0),
        uncorrectable_errors: entry.get("UncorrectedErrors").map(json_u64).unwrap_or(0),
        docsis_version,
    })
}

#[async_trait]
impl ModemDriver for ArrisDriver {
    fn family(&self) -> &'static str {
        "arris"
    }

    async fn authenticate(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
    ) -> Result<DriverSession, AuthError> {
        // The firmware tracks the login handshake through cookies.
        let client = build_client(endpoint.timeout, true)?;

        let login_page = client
            .get(format!("{}/", endpoint.base_url))
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        let session_id = js_var(&login_page, "currentSessionId")
            .ok_or_else(|| AuthError::Handshake("login page missing 'currentSessionId'".into()))?;
        let salt = login_material(&login_page, "mySalt", 1)?;
        let iv = login_material(&login_page, "myIv", NONCE_LEN)?;
        let mut login_nonce = [0u8; NONCE_LEN];
        login_nonce.copy_from_slice(&iv[..NONCE_LEN]);
        debug!(family = "arris", "received login material");

        let key = derive_key(&credentials.password, &salt);
        let proof = serde_json::to_vec(&json!({
            "Password": credentials.password,
            "Nonce": session_id,
        }))
        .map_err(|e| AuthError::Handshake(e.to_string()))?;
        let sealed = encrypt(&key, &login_nonce, b"loginPassword", &proof)?;

        let reply: Value = client
            .post(format!("{}/php/ajaxSet_Password.php", endpoint.base_url))
            .json(&json!({
                "EncryptData": hex::encode(sealed),
                "Name": credentials.username,
                "AuthData": "loginPassword",
            }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .map_err(|e| AuthError::Handshake(format!("login reply: {e}")))?;

        match reply.get("p_status").and_then(Value::as_str) {
            Some("AdminMatch") => {}
            Some("Fail") | Some("Miss") => return Err(AuthError::CredentialsRejected),
            Some(other) => {
                return Err(AuthError::Handshake(format!("login status '{other}'")));
            }
            None => return Err(AuthError::Handshake("login reply missing status".into())),
        }

        let sealed_reply = reply
            .get("encryptData")
            .and_then(Value::as_str)
            .ok_or_else(|| AuthError::Handshake("login reply missing encrypted data".into()))?;
        let sealed_reply =
            hex::decode(sealed_reply).map_err(|_| AuthError::IntegrityFailure)?;
        let plain = decrypt(&key, &login_nonce, b"nonce", &sealed_reply)?;
        if plain.len() < CSRF_NONCE_LEN {
            return Err(AuthError::Handshake("decrypted login reply too short".into()));
        }
        let csrf = std::str::from_utf8(&plain[..CSRF_NONCE_LEN])
            .map_err(|_| AuthError::Handshake("csrf nonce is not text".into()))?
            .to_string();

        let session = ArrisSession {
            client,
            csrf,
            key,
            base_nonce: login_nonce,
            counter: AtomicU32::new(1),
        };

        // Finalize the session; the gateway rejects data requests otherwise.
        let (nonce_hex, sealed) = session.seal(b"session", session_id.as_bytes())?;
        session
            .client
            .post(format!("{}/php/ajaxSet_Session.php", endpoint.base_url))
            .header("csrfNonce", &session.csrf)
            .json(&json!({ "EncryptData": sealed, "Nonce": nonce_hex }))
            .send()
            .await?
            .error_for_status()?;

        info!(family = "arris", "authenticated");
        Ok(DriverSession::Arris(session))
    }

    async fn fetch_channels(
        &self,
        session: &DriverSession,
        endpoint: &Endpoint,
    ) -> Result<RawSnapshot, FetchError> {
        let DriverSession::Arris(session) = session else {
            return Err(session_mismatch());
        };
        let data = self.page(session, endpoint, "/php/status_docsis_data.php").await?;
        let ds = channel_list(&data, "dsData")?;
        let us = channel_list(&data, "usData")?;
        if ds.is_empty() && us.is_empty() && data.get("dsData").is_none() {
            return Err(FetchError::Malformed(
                "status response carries no channel data".into(),
            ));
        }

        let mut channels = Vec::with_capacity(ds.len() + us.len());
        for entry in &ds {
            channels.push(read_channel(entry, Direction::Downstream)?);
        }
        for entry in &us {
            channels.push(read_channel(entry, Direction::Upstream)?);
        }

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
        let DriverSession::Arris(session) = session else {
            return Err(session_mismatch());
        };
        let data = self.page(session, endpoint, "/php/status_overview_data.php").await?;
        Ok(DeviceInfo {
            model: data
                .get("ModelName")
                .and_then(Value::as_str)
                .unwrap_or("TG3442DE")
                .to_string(),
            firmware: data
                .get("FirmwareVersion")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            uptime_seconds: data.get("UpTime").and_then(Value::as_u64),
        })
    }

    /// The gateway exposes no tariff/link-rate page.
    async fn fetch_connection_info(
        &self,
        _session: &DriverSession,
        _endpoint: &Endpoint,
    ) -> Result<Option<ConnectionInfo>, FetchError> {
        Ok(None)
    }
}
