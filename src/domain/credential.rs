use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    Password,
    Token,
    SshKey,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    pub kind: CredentialKind,
    pub username: String,
    /// Opaque ciphertext; only the Credential Materializer may decrypt it.
    pub encrypted_secret: Vec<u8>,
    pub public_key: Option<String>,
}

/// An ephemeral, decrypted credential bundle produced by the Credential
/// Materializer. Never persisted; must not outlive the Git operation it was
/// materialized for.
#[derive(Clone)]
pub enum CredentialSecret {
    UsernamePassword { username: String, password: String },
    UsernameToken { username: String, token: String },
    SshKey { private_key: String, public_key: Option<String> },
}

impl std::fmt::Debug for CredentialSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the secret material itself.
        match self {
            CredentialSecret::UsernamePassword { username, .. } => {
                write!(f, "UsernamePassword {{ username: {username:?}, password: <redacted> }}")
            }
            CredentialSecret::UsernameToken { username, .. } => {
                write!(f, "UsernameToken {{ username: {username:?}, token: <redacted> }}")
            }
            CredentialSecret::SshKey { public_key, .. } => {
                write!(f, "SshKey {{ private_key: <redacted>, public_key: {public_key:?} }}")
            }
        }
    }
}
