//! Token signing keyring persisted at `{data_dir}/keys/keyring.json`.
//!
//! The file is generated with a random 32-byte key on first use. Secrets are
//! stored hex-encoded. Rotation moves the current key into `previous`, so
//! tokens signed before the rotation keep verifying.
//!
//! SECURITY: errors never include key material.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use stepwise_core::token::keyring::MIN_SECRET_LEN;
use stepwise_core::token::{Keyring, SigningKey};
use thiserror::Error;

use crate::filesystem::{write_atomic, write_atomic_new};

/// Length of generated secrets.
const GENERATED_SECRET_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum KeyringError {
    #[error("keyring I/O error at {path}: {message}")]
    Io { path: String, message: String },

    #[error("malformed keyring at {path}: {message}")]
    Malformed { path: String, message: String },
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredKey {
    key_id: String,
    secret: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredKeyring {
    current: StoredKey,
    #[serde(default)]
    previous: Vec<StoredKey>,
}

/// Handle on the keyring file.
#[derive(Debug, Clone)]
pub struct KeyringFile {
    path: PathBuf,
}

impl KeyringFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The keyring file inside a data directory.
    pub fn in_data_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join("keys").join("keyring.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the keyring, or `None` if the file does not exist yet.
    pub async fn load(&self) -> Result<Option<Keyring>, KeyringError> {
        match self.read_stored().await? {
            Some(stored) => Ok(Some(self.to_keyring(stored)?)),
            None => Ok(None),
        }
    }

    /// Load the keyring, generating and persisting one on first use.
    ///
    /// Concurrent first uses agree on a single key: the file is published
    /// without clobbering and the loser reloads the winner's keyring.
    pub async fn load_or_create(&self) -> Result<Keyring, KeyringError> {
        if let Some(keyring) = self.load().await? {
            return Ok(keyring);
        }

        let stored = StoredKeyring {
            current: generate_key(),
            previous: Vec::new(),
        };
        let bytes = self.encode(&stored)?;
        let created = write_atomic_new(&self.path, &bytes).await.map_err(|e| self.io(e))?;
        if created {
            restrict_permissions(&self.path).await;
            tracing::info!(path = %self.path.display(), key_id = %stored.current.key_id, "generated token keyring");
            return self.to_keyring(stored);
        }

        self.load().await?.ok_or_else(|| KeyringError::Malformed {
            path: self.path.display().to_string(),
            message: "keyring vanished after concurrent creation".to_string(),
        })
    }

    /// Generate a new signing key and retire the current one.
    pub async fn rotate(&self) -> Result<Keyring, KeyringError> {
        let mut stored = match self.read_stored().await? {
            Some(stored) => stored,
            None => {
                self.load_or_create().await?;
                self.read_stored().await?.ok_or_else(|| KeyringError::Malformed {
                    path: self.path.display().to_string(),
                    message: "keyring missing after creation".to_string(),
                })?
            }
        };

        let retired = std::mem::replace(&mut stored.current, generate_key());
        stored.previous.insert(0, retired);

        let bytes = self.encode(&stored)?;
        write_atomic(&self.path, &bytes).await.map_err(|e| self.io(e))?;
        restrict_permissions(&self.path).await;
        tracing::info!(
            key_id = %stored.current.key_id,
            previous = stored.previous.len(),
            "rotated token keyring"
        );
        self.to_keyring(stored)
    }

    async fn read_stored(&self) -> Result<Option<StoredKeyring>, KeyringError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(self.io(err)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| self.malformed(e.to_string()))
    }

    fn encode(&self, stored: &StoredKeyring) -> Result<Vec<u8>, KeyringError> {
        serde_json::to_vec_pretty(stored).map_err(|e| self.malformed(e.to_string()))
    }

    fn to_keyring(&self, stored: StoredKeyring) -> Result<Keyring, KeyringError> {
        let current = self.to_signing_key(&stored.current)?;
        let previous = stored
            .previous
            .iter()
            .map(|key| self.to_signing_key(key))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Keyring::new(current).with_previous(previous))
    }

    fn to_signing_key(&self, key: &StoredKey) -> Result<SigningKey, KeyringError> {
        let secret = hex::decode(&key.secret)
            .map_err(|_| self.malformed(format!("secret of key '{}' is not valid hex", key.key_id)))?;
        if secret.len() < MIN_SECRET_LEN {
            return Err(self.malformed(format!(
                "secret of key '{}' is shorter than {MIN_SECRET_LEN} bytes",
                key.key_id
            )));
        }
        Ok(SigningKey::new(key.key_id.clone(), secret))
    }

    fn io(&self, err: std::io::Error) -> KeyringError {
        KeyringError::Io {
            path: self.path.display().to_string(),
            message: err.to_string(),
        }
    }

    fn malformed(&self, message: String) -> KeyringError {
        KeyringError::Malformed {
            path: self.path.display().to_string(),
            message,
        }
    }
}

/// Generate a key from the OS CSPRNG.
fn generate_key() -> StoredKey {
    let mut secret = [0u8; GENERATED_SECRET_LEN];
    OsRng.fill_bytes(&mut secret);
    StoredKey {
        key_id: format!("key_{}", uuid::Uuid::now_v7().simple()),
        secret: hex::encode(secret),
        created_at: Utc::now(),
    }
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(err) = tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await {
        tracing::warn!(path = %path.display(), error = %err, "could not restrict keyring permissions");
    }
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn first_use_generates_and_persists() {
        let dir = tempdir().unwrap();
        let file = KeyringFile::in_data_dir(dir.path());
        assert!(file.load().await.unwrap().is_none());

        let created = file.load_or_create().await.unwrap();
        assert_eq!(created.current().secret().len(), GENERATED_SECRET_LEN);
        assert!(created.previous().is_empty());

        let reloaded = file.load_or_create().await.unwrap();
        assert_eq!(created, reloaded);
        assert!(file.path().ends_with("keys/keyring.json"));
    }

    #[tokio::test]
    async fn rotate_keeps_previous_keys() {
        let dir = tempdir().unwrap();
        let file = KeyringFile::in_data_dir(dir.path());
        let original = file.load_or_create().await.unwrap();

        let rotated = file.rotate().await.unwrap();
        assert_ne!(rotated.current().key_id(), original.current().key_id());
        assert_eq!(rotated.previous().len(), 1);
        assert_eq!(rotated.previous()[0], *original.current());

        assert_eq!(file.load().await.unwrap().unwrap(), rotated);
    }

    #[tokio::test]
    async fn short_secret_is_rejected() {
        let dir = tempdir().unwrap();
        let file = KeyringFile::in_data_dir(dir.path());
        tokio::fs::create_dir_all(file.path().parent().unwrap()).await.unwrap();
        tokio::fs::write(
            file.path(),
            r#"{"current":{"key_id":"k1","secret":"abcd","created_at":"2026-01-01T00:00:00Z"}}"#,
        )
        .await
        .unwrap();

        let err = file.load().await.unwrap_err();
        assert!(matches!(err, KeyringError::Malformed { .. }));
        assert!(!err.to_string().contains("abcd"));
    }
}
