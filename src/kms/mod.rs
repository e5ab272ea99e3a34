//! Key-decryption seam (A4).
//!
//! The store only ever sees `BedrockKey::ciphertext`; the concrete KMS
//! integration that produced it is an external collaborator this crate does
//! not own. `KeyDecryptor` is the trait the key material cache (C9) drives,
//! with a single concrete implementation suitable for local development and
//! tests — a production deployment supplies its own (AWS KMS, Vault, an
//! HSM) behind the same trait.

use async_trait::async_trait;
use serde::Deserialize;

use crate::errors::KeyMaterialError;

/// Decrypted AWS credentials for a tenant's Bedrock account (§3 BedrockKey,
/// §4.5/§4.9 "decrypt on cache miss").
#[derive(Debug, Clone)]
pub struct BedrockCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

#[async_trait]
pub trait KeyDecryptor: Send + Sync {
    async fn decrypt(&self, ciphertext: &[u8]) -> Result<BedrockCredentials, KeyMaterialError>;
}

/// Envelope stored as `ciphertext` once a real KMS-backed decryptor replaces
/// this one — decrypting yields this shape's JSON.
#[derive(Debug, Deserialize)]
struct CredentialEnvelope {
    access_key_id: String,
    secret_access_key: String,
    #[serde(default)]
    session_token: Option<String>,
}

/// XOR-with-key "decryption" over a JSON credential envelope. Not a
/// production KMS integration — a deployment wires in its own `KeyDecryptor`
/// (AWS KMS `Decrypt`, Vault transit, ...) behind this trait; this
/// implementation exists so the rest of the pipeline (cache, adapter,
/// signing) has something real to exercise in tests.
pub struct StaticKeyDecryptor {
    key: Vec<u8>,
}

impl StaticKeyDecryptor {
    pub fn new(key_material: &str) -> Self {
        Self {
            key: key_material.as_bytes().to_vec(),
        }
    }

    fn xor(&self, data: &[u8]) -> Vec<u8> {
        if self.key.is_empty() {
            return data.to_vec();
        }
        data.iter()
            .enumerate()
            .map(|(i, b)| b ^ self.key[i % self.key.len()])
            .collect()
    }
}

#[async_trait]
impl KeyDecryptor for StaticKeyDecryptor {
    async fn decrypt(&self, ciphertext: &[u8]) -> Result<BedrockCredentials, KeyMaterialError> {
        let plaintext = self.xor(ciphertext);
        let envelope: CredentialEnvelope = serde_json::from_slice(&plaintext)
            .map_err(|e| KeyMaterialError::Decrypt(e.to_string()))?;
        Ok(BedrockCredentials {
            access_key_id: envelope.access_key_id,
            secret_access_key: envelope.secret_access_key,
            session_token: envelope.session_token,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encrypt(key: &str, plaintext: &[u8]) -> Vec<u8> {
        let key_bytes = key.as_bytes();
        plaintext
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ key_bytes[i % key_bytes.len()])
            .collect()
    }

    #[tokio::test]
    async fn round_trips_credential_envelope() {
        let plaintext = serde_json::to_vec(&serde_json::json!({
            "access_key_id": "AKIA_TEST",
            "secret_access_key": "secret",
        }))
        .unwrap();
        let ciphertext = encrypt("passphrase", &plaintext);

        let decryptor = StaticKeyDecryptor::new("passphrase");
        let creds = decryptor.decrypt(&ciphertext).await.unwrap();
        assert_eq!(creds.access_key_id, "AKIA_TEST");
        assert_eq!(creds.secret_access_key, "secret");
        assert!(creds.session_token.is_none());
    }

    #[tokio::test]
    async fn wrong_key_fails_to_parse() {
        let plaintext = serde_json::to_vec(&serde_json::json!({
            "access_key_id": "AKIA_TEST",
            "secret_access_key": "secret",
        }))
        .unwrap();
        let ciphertext = encrypt("passphrase", &plaintext);

        let decryptor = StaticKeyDecryptor::new("wrong-key");
        assert!(decryptor.decrypt(&ciphertext).await.is_err());
    }
}
