//! Credential Materializer.
//!
//! Decrypts a stored [`Credential`] into an ephemeral, in-memory secret.
//! Depends only on the repository-loaded record and the process-wide
//! symmetric key; never touches disk itself (callers that need a helper
//! file, e.g. the Workspace Manager, are responsible for writing and
//! cleaning it up under a guaranteed-release scope).

use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey, NONCE_LEN};
use thiserror::Error;

use crate::domain::{Credential, CredentialKind, CredentialSecret};

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("requested secret field is empty")]
    EmptyField,

    #[error("ciphertext is malformed: {0}")]
    Malformed(String),

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("symmetric key must be exactly 32 bytes, got {0}")]
    InvalidKeyLength(usize),
}

/// Which secret a caller is asking the materializer to decrypt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretField {
    Password,
    PrivateKey,
}

/// Holds the process-wide symmetric key and performs AEAD decryption of
/// credential ciphertext. Ciphertext layout is `nonce (12 bytes) || sealed
/// data`, sealed with AES-256-GCM.
pub struct CredentialMaterializer {
    key: LessSafeKey,
}

impl CredentialMaterializer {
    pub fn new(symmetric_key: &[u8]) -> Result<Self, CredentialError> {
        if symmetric_key.len() != 32 {
            return Err(CredentialError::InvalidKeyLength(symmetric_key.len()));
        }
        let unbound = UnboundKey::new(&aead::AES_256_GCM, symmetric_key)
            .map_err(|_| CredentialError::InvalidKeyLength(symmetric_key.len()))?;
        Ok(Self { key: LessSafeKey::new(unbound) })
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CredentialError> {
        if ciphertext.len() < NONCE_LEN {
            return Err(CredentialError::Malformed("ciphertext shorter than nonce".into()));
        }
        let (nonce_bytes, sealed) = ciphertext.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| CredentialError::Malformed("invalid nonce".into()))?;
        let mut buf = sealed.to_vec();
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut buf)
            .map_err(|_| CredentialError::DecryptionFailed)?;
        Ok(plaintext.to_vec())
    }

    fn decrypt_to_string(&self, ciphertext: &[u8]) -> Result<String, CredentialError> {
        let plaintext = self.decrypt(ciphertext)?;
        String::from_utf8(plaintext).map_err(|e| CredentialError::Malformed(e.to_string()))
    }

    /// Decrypt the secret field a Git operation needs. Returned string is
    /// sensitive: it must go only to Workspace Manager credential-bearing
    /// operations, never into a log line or the container's public argv.
    pub fn materialize(
        &self,
        credential: &Credential,
        field: SecretField,
    ) -> Result<String, CredentialError> {
        match (credential.kind, field) {
            (CredentialKind::Password | CredentialKind::Token, SecretField::Password) => {
                let secret = self.decrypt_to_string(&credential.encrypted_secret)?;
                if secret.is_empty() {
                    return Err(CredentialError::EmptyField);
                }
                Ok(secret)
            }
            (CredentialKind::SshKey, SecretField::PrivateKey) => {
                let secret = self.decrypt_to_string(&credential.encrypted_secret)?;
                if secret.is_empty() {
                    return Err(CredentialError::EmptyField);
                }
                Ok(secret)
            }
            _ => Err(CredentialError::Malformed(
                "requested field does not match credential kind".into(),
            )),
        }
    }

    /// Build the ephemeral, in-memory bundle the Workspace Manager consumes
    /// for a credentialed Git operation.
    pub fn materialize_bundle(
        &self,
        credential: &Credential,
    ) -> Result<CredentialSecret, CredentialError> {
        match credential.kind {
            CredentialKind::Password => Ok(CredentialSecret::UsernamePassword {
                username: credential.username.clone(),
                password: self.materialize(credential, SecretField::Password)?,
            }),
            CredentialKind::Token => Ok(CredentialSecret::UsernameToken {
                username: credential.username.clone(),
                token: self.materialize(credential, SecretField::Password)?,
            }),
            CredentialKind::SshKey => Ok(CredentialSecret::SshKey {
                private_key: self.materialize(credential, SecretField::PrivateKey)?,
                public_key: credential.public_key.clone(),
            }),
        }
    }

    /// Seal plaintext with a fresh random nonce. Only used by tests and by
    /// operator tooling that provisions new `Credential` rows; the running
    /// engine only ever decrypts.
    #[cfg(test)]
    fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        use ring::rand::{SecureRandom, SystemRandom};

        let rng = SystemRandom::new();
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rng.fill(&mut nonce_bytes).expect("system rng available");
        let nonce = Nonce::try_assume_unique_for_key(&nonce_bytes).unwrap();

        let mut buf = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(nonce, Aad::empty(), &mut buf)
            .expect("seal never fails for valid key");

        let mut out = nonce_bytes.to_vec();
        out.extend(buf);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn materializer() -> CredentialMaterializer {
        CredentialMaterializer::new(&[7u8; 32]).unwrap()
    }

    fn credential(kind: CredentialKind, m: &CredentialMaterializer, secret: &str) -> Credential {
        Credential {
            id: "cred-1".into(),
            kind,
            username: "alice".into(),
            encrypted_secret: m.encrypt(secret.as_bytes()),
            public_key: None,
        }
    }

    #[test]
    fn rejects_wrong_key_length() {
        let err = CredentialMaterializer::new(&[1u8; 16]).unwrap_err();
        assert!(matches!(err, CredentialError::InvalidKeyLength(16)));
    }

    #[test]
    fn decrypts_password_credential() {
        let m = materializer();
        let cred = credential(CredentialKind::Password, &m, "hunter2");
        let secret = m.materialize(&cred, SecretField::Password).unwrap();
        assert_eq!(secret, "hunter2");
    }

    #[test]
    fn decrypts_token_credential_as_password_field() {
        let m = materializer();
        let cred = credential(CredentialKind::Token, &m, "ghp_abc123");
        let secret = m.materialize(&cred, SecretField::Password).unwrap();
        assert_eq!(secret, "ghp_abc123");
    }

    #[test]
    fn ssh_key_requires_private_key_field() {
        let m = materializer();
        let cred = credential(CredentialKind::SshKey, &m, "-----BEGIN KEY-----");
        let err = m.materialize(&cred, SecretField::Password).unwrap_err();
        assert!(matches!(err, CredentialError::Malformed(_)));

        let secret = m.materialize(&cred, SecretField::PrivateKey).unwrap();
        assert_eq!(secret, "-----BEGIN KEY-----");
    }

    #[test]
    fn empty_secret_is_rejected() {
        let m = materializer();
        let cred = credential(CredentialKind::Password, &m, "");
        let err = m.materialize(&cred, SecretField::Password).unwrap_err();
        assert!(matches!(err, CredentialError::EmptyField));
    }

    #[test]
    fn tampered_ciphertext_fails_to_decrypt() {
        let m = materializer();
        let mut cred = credential(CredentialKind::Password, &m, "hunter2");
        let last = cred.encrypted_secret.len() - 1;
        cred.encrypted_secret[last] ^= 0xFF;
        let err = m.materialize(&cred, SecretField::Password).unwrap_err();
        assert!(matches!(err, CredentialError::DecryptionFailed));
    }

    #[test]
    fn materialize_bundle_builds_expected_variant() {
        let m = materializer();
        let cred = credential(CredentialKind::SshKey, &m, "key-bytes");
        match m.materialize_bundle(&cred).unwrap() {
            CredentialSecret::SshKey { private_key, .. } => assert_eq!(private_key, "key-bytes"),
            other => panic!("unexpected bundle variant: {other:?}"),
        }
    }
}
