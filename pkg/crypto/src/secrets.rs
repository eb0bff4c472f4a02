//! AES-256-GCM secrets engine. The cluster key is derived once from the
//! cluster id and held only in memory for the lifetime of the process; it
//! is never written to disk. Ciphertext is framed as nonce || ciphertext.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::CryptoError;

const NONCE_LEN: usize = 12;

#[derive(Clone)]
pub struct SecretsEngine {
    cipher: Aes256Gcm,
}

impl SecretsEngine {
    /// Derives the cluster's AES key by hashing its id. Callers should treat
    /// the resulting engine as a dependency threaded through from cluster
    /// init, not a global.
    pub fn from_cluster_id(cluster_id: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(cluster_id.as_bytes());
        let key = hasher.finalize();
        let cipher = Aes256Gcm::new_from_slice(&key).expect("sha256 digest is always 32 bytes");
        SecretsEngine { cipher }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::Encrypt)?;

        let mut framed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        framed.extend_from_slice(&nonce_bytes);
        framed.extend_from_slice(&ciphertext);
        Ok(framed)
    }

    pub fn decrypt(&self, framed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if framed.len() < NONCE_LEN {
            return Err(CryptoError::Truncated);
        }
        let (nonce_bytes, ciphertext) = framed.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CryptoError::Decrypt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_encrypt_decrypt() {
        let engine = SecretsEngine::from_cluster_id("test-cluster");
        let ciphertext = engine.encrypt(b"hunter2").unwrap();
        assert_ne!(ciphertext, b"hunter2".to_vec());
        let plaintext = engine.decrypt(&ciphertext).unwrap();
        assert_eq!(plaintext, b"hunter2");
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let a = SecretsEngine::from_cluster_id("cluster-a");
        let b = SecretsEngine::from_cluster_id("cluster-b");
        let ciphertext = a.encrypt(b"secret").unwrap();
        assert!(b.decrypt(&ciphertext).is_err());
    }

    #[test]
    fn truncated_ciphertext_is_rejected() {
        let engine = SecretsEngine::from_cluster_id("test-cluster");
        assert!(engine.decrypt(b"short").is_err());
    }
}
