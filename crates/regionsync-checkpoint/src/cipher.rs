//! Optional encryption of the resume position.
//!
//! Only the opaque position bytes are encrypted; the rest of the
//! checkpoint stays readable so operators can inspect progress.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};

use crate::error::{CheckpointError, CheckpointResult};

const NONCE_LEN: usize = 12;

pub trait PositionCipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> CheckpointResult<Vec<u8>>;
    fn decrypt(&self, ciphertext: &[u8]) -> CheckpointResult<Vec<u8>>;
}

/// AES-256-GCM with a random nonce prefixed to each ciphertext.
pub struct AesGcmCipher {
    cipher: Aes256Gcm,
}

impl AesGcmCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }
}

impl PositionCipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &[u8]) -> CheckpointResult<Vec<u8>> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| CheckpointError::Cipher(e.to_string()))?;
        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> CheckpointResult<Vec<u8>> {
        if ciphertext.len() < NONCE_LEN {
            return Err(CheckpointError::Cipher("ciphertext shorter than nonce".into()));
        }
        let (nonce, sealed) = ciphertext.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|e| CheckpointError::Cipher(e.to_string()))
    }
}
