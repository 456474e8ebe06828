//! Signed, timestamped webhook tokens.
//!
//! The dispatcher attaches `webhookData` to every outbound send; the
//! gateway echoes it back on the reply callback, where the webhook
//! verifies it before touching the database. Format:
//! `base64url(value):timestamp:base64url(hmac_sha256(secret, payload))`
//! where payload is the first two fields joined by `:`.

use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use textgate_core::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

fn mac_for(secret: &str, payload: &str) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| Error::InvalidSignature)?;
    mac.update(payload.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Sign `value` at time `now`.
pub fn sign_at(value: &str, secret: &str, now: DateTime<Utc>) -> Result<String> {
    let encoded = B64.encode(value.as_bytes());
    let payload = format!("{}:{}", encoded, now.timestamp());
    let signature = B64.encode(mac_for(secret, &payload)?);
    Ok(format!("{payload}:{signature}"))
}

/// Sign `value` with the current time.
pub fn sign(value: &str, secret: &str) -> Result<String> {
    sign_at(value, secret, Utc::now())
}

/// Verify a token against `secret`, rejecting anything older than
/// `max_age_secs` (or from the future). Returns the embedded value.
pub fn verify_at(
    token: &str,
    secret: &str,
    max_age_secs: i64,
    now: DateTime<Utc>,
) -> Result<String> {
    let mut parts = token.rsplitn(2, ':');
    let signature = parts.next().ok_or(Error::InvalidSignature)?;
    let payload = parts.next().ok_or(Error::InvalidSignature)?;

    let expected = B64.encode(mac_for(secret, payload)?);
    // Length differences already fail the comparison; HMAC output is
    // fixed-size so this stays effectively constant-time.
    if expected.as_bytes() != signature.as_bytes() {
        return Err(Error::InvalidSignature);
    }

    let (encoded, timestamp) = payload.split_once(':').ok_or(Error::InvalidSignature)?;
    let timestamp: i64 = timestamp.parse().map_err(|_| Error::InvalidSignature)?;
    let age = now.timestamp() - timestamp;
    if age < 0 || age > max_age_secs {
        return Err(Error::InvalidSignature);
    }

    let value = B64.decode(encoded).map_err(|_| Error::InvalidSignature)?;
    String::from_utf8(value).map_err(|_| Error::InvalidSignature)
}

/// Verify a token against the current time.
pub fn verify(token: &str, secret: &str, max_age_secs: i64) -> Result<String> {
    verify_at(token, secret, max_age_secs, Utc::now())
}
