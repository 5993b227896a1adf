//! Shared secret provisioning.
//!
//! The helper and the unprivileged app share one HMAC key through a small
//! file containing the base64-encoded secret. The helper creates it on first
//! start; the app reads it before authenticating.

use std::fs;
use std::io::Write as _;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;

use crate::config::SECRET_LEN;
use crate::core::auth::{HmacAuthenticator, Secret};

pub struct SecretStore;

impl SecretStore {
    /// Read the secret at `path`, or generate and persist a new one.
    pub fn load_or_create(path: &Path) -> Result<Secret> {
        if path.exists() {
            return Self::load(path);
        }
        let secret = HmacAuthenticator::generate_secret()
            .map_err(|e| anyhow!("failed to generate shared secret: {e}"))?;
        Self::write(path, &secret)?;
        tracing::info!("Generated new shared secret at {}", path.display());
        Ok(secret)
    }

    /// Read and decode an existing secret file.
    pub fn load(path: &Path) -> Result<Secret> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read secret file {}", path.display()))?;
        let bytes = B64
            .decode(text.trim())
            .with_context(|| format!("secret file {} is not valid base64", path.display()))?;
        let secret: Secret = bytes.as_slice().try_into().map_err(|_| {
            anyhow!(
                "secret file {} holds {} bytes, expected {SECRET_LEN}",
                path.display(),
                bytes.len()
            )
        })?;
        if secret.iter().all(|&b| b == 0) {
            return Err(anyhow!("secret file {} holds an all-zero key", path.display()));
        }
        Ok(secret)
    }

    /// Write `secret` to `path`, readable only by the owner on unix.
    pub fn write(path: &Path, secret: &Secret) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options
            .open(path)
            .with_context(|| format!("failed to open secret file {}", path.display()))?;
        writeln!(file, "{}", B64.encode(secret))?;
        Ok(())
    }
}
