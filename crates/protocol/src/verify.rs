//! Signature verification for configuration blobs
//!
//! A blob is `hex(signature) ++ hex(payload)`, where the signature is the
//! concatenation of two 32-byte big-endian scalars R and S. The payload is
//! accepted when an ECDSA (secp256k1, SHA-256) signature verifies against any
//! one of the trusted keys, so keys can be rotated without invalidating blobs
//! signed by an older key.

use crate::error::{ProtocolError, Result};
use k256::ecdsa::signature::Verifier;
use k256::ecdsa::{Signature, VerifyingKey};
use tracing::debug;

/// Length of the R||S signature prefix in bytes
pub const SIGNATURE_SIZE: usize = 64;

/// Set of public keys allowed to sign configurations
#[derive(Debug, Clone, Default)]
pub struct TrustedKeys {
    keys: Vec<VerifyingKey>,
}

impl TrustedKeys {
    pub fn new(keys: Vec<VerifyingKey>) -> Self {
        Self { keys }
    }

    /// Parse SEC1-encoded keys given as hex (compressed or uncompressed)
    pub fn from_hex<S: AsRef<str>>(keys: &[S]) -> Result<Self> {
        let keys = keys
            .iter()
            .map(|key| {
                let key = key.as_ref().trim();
                let bytes = hex::decode(key)?;
                VerifyingKey::from_sec1_bytes(&bytes)
                    .map_err(|_| ProtocolError::InvalidKey(key.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { keys })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// True iff any trusted key verifies `signature` over `data`
    pub fn verifies(&self, signature: &[u8], data: &[u8]) -> bool {
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        // Signers are not required to normalize S
        let signature = signature.normalize_s().unwrap_or(signature);

        self.keys
            .iter()
            .any(|key| key.verify(data, &signature).is_ok())
    }
}

/// Verify a hex blob and return the signed payload bytes
pub fn verify_blob(blob: &str, keys: &TrustedKeys) -> Result<Vec<u8>> {
    let blob = blob.trim();
    if blob.len() < SIGNATURE_SIZE * 2 || !blob.is_char_boundary(SIGNATURE_SIZE * 2) {
        return Err(ProtocolError::BadSignature);
    }

    let (signature_hex, payload_hex) = blob.split_at(SIGNATURE_SIZE * 2);
    let signature = hex::decode(signature_hex).map_err(|_| ProtocolError::BadSignature)?;
    let payload = hex::decode(payload_hex).map_err(|_| ProtocolError::BadSignature)?;

    if !keys.verifies(&signature, &payload) {
        debug!(
            "Signature rejected by all {} trusted keys ({} payload bytes)",
            keys.len(),
            payload.len()
        );
        return Err(ProtocolError::BadSignature);
    }

    Ok(payload)
}
