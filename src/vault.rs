//! Credential Vault: spec §4.7.
//!
//! Symmetric AEAD (AES-256-GCM) over a deployment-wide key derived from
//! `DEPLOYMENT_SECRET`. A record on the wire (and in the Store) is
//! `nonce || ciphertext || tag`, exactly the layout `Aes256Gcm::encrypt`
//! already produces when the nonce is prepended by the caller.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

const NONCE_LEN: usize = 12;

#[derive(Clone)]
pub struct Vault {
    cipher: Aes256Gcm,
}

/// Plaintext credential shape after decryption (spec §3 Credential Record).
/// Each field is a `SecretString`, zeroized on drop, so a decrypted
/// credential never outlives the connect call that needed it.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
pub enum CredentialPlaintext {
    Password {
        password: SecretString,
    },
    PrivateKey {
        #[serde(rename = "privateKey")]
        private_key: SecretString,
        passphrase: Option<SecretString>,
    },
}

impl Vault {
    /// Derives the 256-bit AEAD key from the configured secret. Deterministic:
    /// no key material is stored anywhere beyond `DEPLOYMENT_SECRET` itself.
    pub fn from_deployment_secret(secret: &str) -> Self {
        let derived = blake3::derive_key("sessiongate credential vault v1", secret.as_bytes());
        let key = Key::<Aes256Gcm>::from_slice(&derived);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| GatewayError::Anyhow(anyhow::anyhow!("vault encrypt failed")))?;

        let mut record = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        record.extend_from_slice(&nonce_bytes);
        record.extend_from_slice(&ciphertext);
        Ok(record)
    }

    /// `record` must be `nonce || ciphertext || tag`. Returns the plaintext
    /// by value; callers are responsible for scoping its lifetime to the
    /// connect call and letting it drop immediately after (§9 scoped resource).
    pub fn decrypt(&self, record: &[u8]) -> Result<Vec<u8>> {
        if record.len() < NONCE_LEN {
            return Err(GatewayError::Anyhow(anyhow::anyhow!("vault record too short")));
        }
        let (nonce_bytes, ciphertext) = record.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| GatewayError::Anyhow(anyhow::anyhow!("vault decrypt failed: bad key or tampered record")))?;
        Ok(plaintext)
    }

    pub fn decrypt_credential(&self, record: &[u8]) -> Result<CredentialPlaintext> {
        let plaintext = self.decrypt(record)?;
        let parsed = serde_json::from_slice(&plaintext)
            .map_err(|e| GatewayError::Anyhow(anyhow::anyhow!("credential plaintext malformed: {e}")))?;
        Ok(parsed)
    }

    pub fn expose(secret: &SecretString) -> &str {
        secret.expose_secret()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_round_trips() {
        let vault = Vault::from_deployment_secret("test-secret");
        let record = vault.encrypt(b"super secret password").unwrap();
        let plain = vault.decrypt(&record).unwrap();
        assert_eq!(plain, b"super secret password");
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let a = Vault::from_deployment_secret("secret-a");
        let b = Vault::from_deployment_secret("secret-b");
        let record = a.encrypt(b"payload").unwrap();
        assert!(b.decrypt(&record).is_err());
    }

    #[test]
    fn tampered_record_fails_to_decrypt() {
        let vault = Vault::from_deployment_secret("test-secret");
        let mut record = vault.encrypt(b"payload").unwrap();
        let last = record.len() - 1;
        record[last] ^= 0xFF;
        assert!(vault.decrypt(&record).is_err());
    }

    #[test]
    fn decrypts_password_credential_shape() {
        let vault = Vault::from_deployment_secret("test-secret");
        let plaintext = serde_json::json!({ "password": "hunter2" });
        let record = vault.encrypt(plaintext.to_string().as_bytes()).unwrap();
        let decoded = vault.decrypt_credential(&record).unwrap();
        match decoded {
            CredentialPlaintext::Password { password } => assert_eq!(password.expose_secret(), "hunter2"),
            _ => panic!("expected password variant"),
        }
    }
}
