//! Ephemeral SSH credentials.
//!
//! This module handles:
//! - Generating a per-endpoint Ed25519 keypair (never written to disk)
//! - Rendering public keys in OpenSSH format and computing fingerprints
//! - Pushing public keys to instances, treating throttling as success
//! - Periodically re-pushing keys for long-lived sessions

use std::path::Path;
use std::time::Duration;

use base64::Engine;
use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::ssh_key::Algorithm;
use russh::keys::{PrivateKey, PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::inventory::{InstanceRecord, KeyPusher, PushOutcome};

/// Generate a fresh Ed25519 keypair.
///
/// Returns the private key and its public half in OpenSSH format.
pub fn generate_keypair() -> Result<(PrivateKey, String)> {
    let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
        .map_err(|e| Error::Key(format!("failed to generate keypair: {e}")))?;
    let public = public_key_to_openssh(key.public_key())?;
    Ok((key, public))
}

/// Load an OpenSSH private key from disk (used for literal network hops).
pub fn load_identity(path: &Path) -> Result<PrivateKey> {
    info!("Loading identity from {}", path.display());
    russh::keys::load_secret_key(path, None)
        .map_err(|e| Error::Key(format!("failed to load {}: {e}", path.display())))
}

/// Convert a public key to the `"<type> <base64>"` form accepted by
/// authorized-keys stores.
pub fn public_key_to_openssh(key: &PublicKey) -> Result<String> {
    key.to_openssh()
        .map_err(|e| Error::Key(format!("failed to encode public key: {e}")))
}

/// Compute the `SHA256:...` fingerprint used by `ssh-keygen -l`.
/// The fingerprint is SHA256 of the raw key bytes in SSH wire format.
pub fn fingerprint(key: &PublicKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.public_key_bytes());
    let hash = hasher.finalize();

    let b64 = base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash);
    format!("SHA256:{}", b64)
}

/// Push `public_key` for `os_user` onto `instance`.
///
/// A throttled push counts as success: the previous push is assumed to
/// still be inside its validity window.
pub async fn push_key(
    pusher: &dyn KeyPusher,
    instance: &InstanceRecord,
    os_user: &str,
    public_key: &str,
) -> Result<()> {
    match pusher.push_public_key(instance, os_user, public_key).await? {
        PushOutcome::Accepted => {
            debug!(
                "Pushed public key for {} to {}",
                os_user, instance.instance_id
            );
        }
        PushOutcome::Throttled => {
            debug!(
                "Key push to {} throttled, assuming previous key is still valid",
                instance.instance_id
            );
        }
    }
    Ok(())
}

/// Re-push keys for every instance-backed endpoint at a fixed period,
/// independent of dials. Failures are logged and retried on the next tick.
pub fn spawn_key_refresh(endpoints: Vec<Endpoint>, period: Duration) -> Option<JoinHandle<()>> {
    let endpoints: Vec<Endpoint> = endpoints
        .into_iter()
        .filter(Endpoint::is_instance)
        .collect();
    if endpoints.is_empty() || period.is_zero() {
        return None;
    }

    info!(
        "Refreshing keys for {} endpoint(s) every {}s",
        endpoints.len(),
        period.as_secs()
    );

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // The first tick completes immediately; dials push on their own.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            for endpoint in &endpoints {
                if let Err(e) = endpoint.ensure_accessible().await {
                    warn!("Key refresh for {} failed: {}", endpoint, e);
                }
            }
        }
    }))
}
