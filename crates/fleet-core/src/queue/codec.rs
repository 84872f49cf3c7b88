//! Message signing and task signatures
//!
//! Wire authenticity uses HMAC-SHA1 over the canonical JSON encoding of
//! `[cmd, data]` with the cluster's shared secret; the same scheme signs
//! cookie-style auth tokens in the request-serving layer. Task
//! signatures are unkeyed SHA-256 digests of the same canonical bytes,
//! used only for in-flight deduplication.

use super::{Envelope, QueueError};
use anyhow::Result;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha1::Sha1;
use sha2::{Digest, Sha256};

type HmacSha1 = Hmac<Sha1>;

/// Canonical bytes covered by both signatures. `serde_json` keeps object
/// keys sorted, so equal payloads always produce equal bytes.
fn canonical(cmd: i32, data: &Value) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&(cmd, data))?)
}

/// Deterministic identity of one unit of work, for duplicate coalescing.
pub fn task_signature(cmd: i32, data: &Value) -> Result<String> {
    let bytes = canonical(cmd, data)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

/// Signs and verifies wire envelopes with a shared secret.
#[derive(Clone)]
pub struct SignedCodec {
    key: Vec<u8>,
}

impl SignedCodec {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self { key: secret.into() }
    }

    fn mac(&self) -> HmacSha1 {
        HmacSha1::new_from_slice(&self.key).expect("HMAC accepts keys of any length")
    }

    pub fn sign(&self, cmd: i32, data: &Value) -> Result<String> {
        let bytes = canonical(cmd, data)?;
        let mut mac = self.mac();
        mac.update(&bytes);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    pub fn encode(&self, cmd: i32, data: Value) -> Result<Envelope> {
        let sign = self.sign(cmd, &data)?;
        Ok(Envelope { cmd, data, sign })
    }

    /// Constant-time verification of an envelope's signature.
    pub fn verify(&self, env: &Envelope) -> Result<(), QueueError> {
        let bytes = canonical(env.cmd, &env.data).map_err(|_| QueueError::BadSignature)?;
        let claimed = hex::decode(&env.sign).map_err(|_| QueueError::BadSignature)?;
        let mut mac = self.mac();
        mac.update(&bytes);
        mac.verify_slice(&claimed)
            .map_err(|_| QueueError::BadSignature)
    }
}
