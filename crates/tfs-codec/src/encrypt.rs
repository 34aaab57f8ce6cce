//! Authenticated encryption built from BLAKE3 primitives.
//!
//! Encrypt-then-MAC with a synthetic nonce:
//!
//! ```text
//! nonce      = keyed_hash(nonce_key, len(aad) ‖ aad ‖ payload)[..24]
//! ciphertext = payload XOR xof(enc_key, nonce)
//! tag        = keyed_hash(mac_key, nonce ‖ len(aad) ‖ aad ‖ ciphertext)
//! envelope   = bincode { nonce, ciphertext ‖ tag }
//! ```
//!
//! The nonce depends on the block id and the payload, so identical blocks
//! encode to identical bytes.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Codec, CodecError, Result};

const NONCE_LEN: usize = 24;
const TAG_LEN: usize = blake3::OUT_LEN;

const MASTER_CONTEXT: &str = "tfs 2026-01-01 master key";
const ENC_CONTEXT: &str = "tfs 2026-01-01 block encryption";
const MAC_CONTEXT: &str = "tfs 2026-01-01 block authentication";
const NONCE_CONTEXT: &str = "tfs 2026-01-01 block nonce";

#[derive(Serialize, Deserialize)]
struct EncryptedData {
    nonce: Vec<u8>,
    ciphertext: Vec<u8>,
}

/// Password-keyed authenticating codec.
pub struct EncryptingCodec {
    enc_key: [u8; 32],
    mac_key: [u8; 32],
    nonce_key: [u8; 32],
}

impl EncryptingCodec {
    /// Derive keys from a password and salt.
    ///
    /// `iterations` rounds of keyed hashing stretch the master key.
    pub fn new(password: &[u8], salt: &[u8], iterations: u32) -> Self {
        let mut material = Vec::with_capacity(password.len() + salt.len() + 8);
        material.extend_from_slice(&(password.len() as u64).to_le_bytes());
        material.extend_from_slice(password);
        material.extend_from_slice(salt);

        let mut master = blake3::derive_key(MASTER_CONTEXT, &material);
        for _ in 1..iterations.max(1) {
            master = *blake3::keyed_hash(&master, &material).as_bytes();
        }
        debug!(iterations, "derived block encryption keys");

        Self {
            enc_key: blake3::derive_key(ENC_CONTEXT, &master),
            mac_key: blake3::derive_key(MAC_CONTEXT, &master),
            nonce_key: blake3::derive_key(NONCE_CONTEXT, &master),
        }
    }

    fn nonce_for(&self, data: &[u8], aad: &[u8]) -> [u8; NONCE_LEN] {
        let mut hasher = blake3::Hasher::new_keyed(&self.nonce_key);
        hasher.update(&(aad.len() as u64).to_le_bytes());
        hasher.update(aad);
        hasher.update(data);
        let mut nonce = [0u8; NONCE_LEN];
        hasher.finalize_xof().fill(&mut nonce);
        nonce
    }

    fn apply_keystream(&self, nonce: &[u8], data: &mut [u8]) {
        let mut reader = blake3::Hasher::new_keyed(&self.enc_key)
            .update(nonce)
            .finalize_xof();
        let mut block = [0u8; 64];
        for chunk in data.chunks_mut(block.len()) {
            reader.fill(&mut block[..chunk.len()]);
            for (b, k) in chunk.iter_mut().zip(block.iter()) {
                *b ^= k;
            }
        }
    }

    fn tag(&self, nonce: &[u8], aad: &[u8], ciphertext: &[u8]) -> blake3::Hash {
        let mut hasher = blake3::Hasher::new_keyed(&self.mac_key);
        hasher.update(nonce);
        hasher.update(&(aad.len() as u64).to_le_bytes());
        hasher.update(aad);
        hasher.update(ciphertext);
        hasher.finalize()
    }
}

impl Codec for EncryptingCodec {
    fn encode(&self, data: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.nonce_for(data, aad);
        let mut ciphertext = data.to_vec();
        self.apply_keystream(&nonce, &mut ciphertext);
        let tag = self.tag(&nonce, aad, &ciphertext);
        ciphertext.extend_from_slice(tag.as_bytes());
        let envelope = EncryptedData {
            nonce: nonce.to_vec(),
            ciphertext,
        };
        Ok(bincode::serialize(&envelope)?)
    }

    fn decode(&self, data: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let envelope: EncryptedData = bincode::deserialize(data)?;
        if envelope.nonce.len() != NONCE_LEN || envelope.ciphertext.len() < TAG_LEN {
            return Err(CodecError::Malformed(format!(
                "nonce {} bytes, ciphertext {} bytes",
                envelope.nonce.len(),
                envelope.ciphertext.len()
            )));
        }
        let (ciphertext, tag) = envelope
            .ciphertext
            .split_at(envelope.ciphertext.len() - TAG_LEN);
        let mut tag_bytes = [0u8; TAG_LEN];
        tag_bytes.copy_from_slice(tag);

        // blake3::Hash equality is constant time
        if self.tag(&envelope.nonce, aad, ciphertext) != blake3::Hash::from(tag_bytes) {
            return Err(CodecError::Authentication);
        }
        let mut plain = ciphertext.to_vec();
        self.apply_keystream(&envelope.nonce, &mut plain);
        Ok(plain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> EncryptingCodec {
        EncryptingCodec::new(b"assword", b"salt", 8)
    }

    #[test]
    fn test_roundtrip() {
        let c = codec();
        let data = b"hello encrypted world".repeat(10);
        let enc = c.encode(&data, b"aad").unwrap();
        assert!(!enc.windows(5).any(|w| w == b"hello"));
        assert_eq!(c.decode(&enc, b"aad").unwrap(), data);
    }

    #[test]
    fn test_empty_payload() {
        let c = codec();
        let enc = c.encode(b"", b"id").unwrap();
        assert_eq!(c.decode(&enc, b"id").unwrap(), b"");
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let c = codec();
        let mut enc = c.encode(b"some payload", b"id").unwrap();
        let last = enc.len() - TAG_LEN - 1;
        enc[last] ^= 0x01;
        assert!(matches!(
            c.decode(&enc, b"id"),
            Err(CodecError::Authentication)
        ));
    }

    #[test]
    fn test_wrong_password_fails() {
        let enc = codec().encode(b"secret", b"id").unwrap();
        let other = EncryptingCodec::new(b"password", b"salt", 8);
        assert!(other.decode(&enc, b"id").is_err());
    }

    #[test]
    fn test_deterministic_for_same_aad() {
        let c = codec();
        assert_eq!(c.encode(b"x", b"a").unwrap(), c.encode(b"x", b"a").unwrap());
        assert_ne!(c.encode(b"x", b"a").unwrap(), c.encode(b"x", b"b").unwrap());
    }
}
