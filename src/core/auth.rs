//! HMAC-SHA256 client authentication.
//!
//! The unprivileged client proves possession of the shared secret by signing
//! its own pid together with the current unix time. The helper recomputes the
//! MAC and checks the timestamp is within `max_age_secs` of its own clock, in
//! either direction.

use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

use crate::config::SECRET_LEN;

type HmacSha256 = Hmac<Sha256>;

/// Shared secret used to sign authentication requests.
pub type Secret = [u8; SECRET_LEN];

/// Stateless signer/verifier for `(pid, timestamp)` tuples.
pub struct HmacAuthenticator;

impl HmacAuthenticator {
    /// Sign `pid || timestamp` with `secret`. Returns the 32-byte MAC.
    pub fn sign(pid: u32, unix_timestamp_secs: i64, secret: &[u8]) -> Vec<u8> {
        Self::mac(pid, unix_timestamp_secs, secret)
            .finalize()
            .into_bytes()
            .to_vec()
    }

    /// Validate a signature against the current system clock.
    pub fn validate(
        pid: u32,
        unix_timestamp_secs: i64,
        signature: &[u8],
        secret: &[u8],
        max_age_secs: u64,
    ) -> bool {
        Self::validate_at(
            pid,
            unix_timestamp_secs,
            signature,
            secret,
            max_age_secs,
            unix_now(),
        )
    }

    /// Validate a signature as of `now_secs`.
    ///
    /// The timestamp window is inclusive on both sides. The MAC comparison is
    /// constant time.
    pub fn validate_at(
        pid: u32,
        unix_timestamp_secs: i64,
        signature: &[u8],
        secret: &[u8],
        max_age_secs: u64,
        now_secs: i64,
    ) -> bool {
        let skew = i128::from(now_secs) - i128::from(unix_timestamp_secs);
        let fresh = skew.unsigned_abs() <= u128::from(max_age_secs);
        let authentic = Self::mac(pid, unix_timestamp_secs, secret)
            .verify_slice(signature)
            .is_ok();
        fresh & authentic
    }

    /// Generate a fresh random secret from the OS CSPRNG.
    pub fn generate_secret() -> Result<Secret, rand::Error> {
        let mut secret = [0u8; SECRET_LEN];
        loop {
            OsRng.try_fill_bytes(&mut secret)?;
            if secret.iter().any(|&b| b != 0) {
                return Ok(secret);
            }
        }
    }

    fn mac(pid: u32, unix_timestamp_secs: i64, secret: &[u8]) -> HmacSha256 {
        // HMAC accepts keys of any length.
        let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
        mac.update(&pid.to_le_bytes());
        mac.update(&unix_timestamp_secs.to_le_bytes());
        mac
    }
}

/// Current unix time in whole seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
