//! In-process AES-256-GCM keyring.
//!
//! Meant for development clusters and tests: keys never leave the process
//! (or the keystore file). Each key has a numeric version; ciphertexts are
//! `nonce(12) || sealed` with the version bound in as AAD.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use zeroize::Zeroizing;

use kube_kms_core::types::{Annotations, ProviderKind, Sealed, version_annotation};
use kube_kms_core::{KmsError, Result};

use crate::provider::KmsBackend;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEYSTORE_FORMAT: u32 = 1;

pub struct LocalBackend {
    keyring: RwLock<Keyring>,
    keyfile: Option<PathBuf>,
    /// Serializes keystore writes so the file never goes backwards.
    persist: Mutex<()>,
}

struct Keyring {
    current: u64,
    keys: BTreeMap<u64, Zeroizing<[u8; 32]>>,
}

#[derive(Serialize, Deserialize)]
struct KeyStoreFile {
    format: u32,
    current: u64,
    /// version -> base64 key bytes
    keys: BTreeMap<u64, String>,
}

impl Keyring {
    fn generate(version: u64) -> Self {
        let mut keys = BTreeMap::new();
        keys.insert(version, random_key());
        Self {
            current: version,
            keys,
        }
    }

    fn to_file(&self) -> KeyStoreFile {
        KeyStoreFile {
            format: KEYSTORE_FORMAT,
            current: self.current,
            keys: self
                .keys
                .iter()
                .map(|(version, key)| (*version, STANDARD.encode(&key[..])))
                .collect(),
        }
    }

    fn from_file(file: KeyStoreFile) -> Result<Self> {
        if file.format != KEYSTORE_FORMAT {
            return Err(KmsError::ConfigInvalid(format!(
                "unsupported keystore format {}",
                file.format
            )));
        }
        let mut keys = BTreeMap::new();
        for (version, encoded) in file.keys {
            let bytes = Zeroizing::new(STANDARD.decode(encoded.as_bytes()).map_err(|e| {
                KmsError::ConfigInvalid(format!("keystore key v{version} is not base64: {e}"))
            })?);
            if bytes.len() != 32 {
                return Err(KmsError::ConfigInvalid(format!(
                    "keystore key v{version}: expected 32 bytes, got {}",
                    bytes.len()
                )));
            }
            let mut key = Zeroizing::new([0u8; 32]);
            key.copy_from_slice(&bytes);
            keys.insert(version, key);
        }
        if !keys.contains_key(&file.current) {
            return Err(KmsError::ConfigInvalid(format!(
                "keystore current version v{} has no key",
                file.current
            )));
        }
        Ok(Self {
            current: file.current,
            keys,
        })
    }
}

fn random_key() -> Zeroizing<[u8; 32]> {
    let mut key = Zeroizing::new([0u8; 32]);
    OsRng.fill_bytes(&mut key[..]);
    key
}

fn aad(version: u64) -> Vec<u8> {
    format!("kube-kms-local:v{version}").into_bytes()
}

impl LocalBackend {
    /// Fresh keyring with a single version 1, never persisted.
    pub fn in_memory() -> Self {
        Self::unpersisted(1)
    }

    /// Unpersisted keyring for a running plugin.
    ///
    /// Its first version is the start time in milliseconds, so a restart
    /// (which loses every key) also changes the reported KeyId.
    pub fn ephemeral() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(1)
            .max(1);
        Self::unpersisted(seed)
    }

    fn unpersisted(version: u64) -> Self {
        Self {
            keyring: RwLock::new(Keyring::generate(version)),
            keyfile: None,
            persist: Mutex::new(()),
        }
    }

    /// Open the keystore at `path`, creating it with one key if absent.
    pub fn open_or_create(path: &Path) -> Result<Self> {
        let keyring = if path.exists() {
            let content = Zeroizing::new(std::fs::read_to_string(path)?);
            let file: KeyStoreFile = serde_json::from_str(&content)?;
            let keyring = Keyring::from_file(file)?;
            tracing::info!(path = %path.display(), current = keyring.current, "Opened local keystore");
            keyring
        } else {
            let keyring = Keyring::generate(1);
            write_keystore(path, &keyring.to_file())?;
            tracing::info!(path = %path.display(), "Created local keystore");
            keyring
        };

        Ok(Self {
            keyring: RwLock::new(keyring),
            keyfile: Some(path.to_path_buf()),
            persist: Mutex::new(()),
        })
    }

    /// Add a new key version and make it current. Returns the new version.
    pub async fn rotate(&self) -> Result<u64> {
        let _persist = self.persist.lock().await;
        let (next, snapshot) = {
            let mut ring = self.keyring.write().await;
            let next = ring.current + 1;
            ring.keys.insert(next, random_key());
            ring.current = next;
            (next, ring.to_file())
        };
        self.persist(snapshot).await?;
        tracing::info!(key_version = next, "Rotated local key");
        Ok(next)
    }

    /// Drop every version below `min_version`. The current version is kept.
    pub async fn retire_below(&self, min_version: u64) -> Result<usize> {
        let _persist = self.persist.lock().await;
        let (floor, removed, snapshot) = {
            let mut ring = self.keyring.write().await;
            let floor = min_version.min(ring.current);
            let before = ring.keys.len();
            ring.keys.retain(|version, _| *version >= floor);
            (floor, before - ring.keys.len(), ring.to_file())
        };
        self.persist(snapshot).await?;
        tracing::info!(min_version = floor, removed, "Retired local key versions");
        Ok(removed)
    }

    pub async fn versions(&self) -> Vec<u64> {
        self.keyring.read().await.keys.keys().copied().collect()
    }

    /// Write `snapshot` off the async workers, outside the keyring lock.
    async fn persist(&self, snapshot: KeyStoreFile) -> Result<()> {
        let Some(path) = self.keyfile.clone() else {
            return Ok(());
        };
        tokio::task::spawn_blocking(move || write_keystore(&path, &snapshot))
            .await
            .map_err(|e| KmsError::Io(std::io::Error::other(e)))?
    }
}

fn write_keystore(path: &Path, snapshot: &KeyStoreFile) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = Zeroizing::new(serde_json::to_string_pretty(snapshot)?);
    let tmp = path.with_extension("tmp");
    {
        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&tmp)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[async_trait]
impl KmsBackend for LocalBackend {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    async fn encrypt(&self, plaintext: &[u8]) -> Result<Sealed> {
        let ring = self.keyring.read().await;
        let version = ring.current;
        let key = ring
            .keys
            .get(&version)
            .ok_or_else(|| KmsError::KeyNotFound(format!("current key v{version} missing")))?;

        let cipher = Aes256Gcm::new_from_slice(&key[..])
            .map_err(|e| KmsError::BackendRejected(format!("invalid key: {e}")))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let aad = aad(version);
        let sealed = cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|e| KmsError::BackendRejected(format!("encryption failed: {e}")))?;

        let mut ciphertext = Vec::with_capacity(NONCE_LEN + sealed.len());
        ciphertext.extend_from_slice(&nonce_bytes);
        ciphertext.extend_from_slice(&sealed);

        Ok(Sealed {
            ciphertext,
            key_version: version,
            annotations: version_annotation(ProviderKind::Local, version),
        })
    }

    async fn decrypt(
        &self,
        ciphertext: &[u8],
        key_version: Option<u64>,
        _annotations: &Annotations,
    ) -> Result<Vec<u8>> {
        let version = key_version.ok_or_else(|| {
            KmsError::InvalidRequest("local ciphertexts require a key version".to_string())
        })?;
        if ciphertext.len() < NONCE_LEN + TAG_LEN {
            return Err(KmsError::InvalidRequest(format!(
                "ciphertext too short: {} bytes",
                ciphertext.len()
            )));
        }

        let ring = self.keyring.read().await;
        let key = ring.keys.get(&version).ok_or_else(|| {
            KmsError::KeyNotFound(format!("key version v{version} is not in the local keyring"))
        })?;

        let cipher = Aes256Gcm::new_from_slice(&key[..])
            .map_err(|e| KmsError::BackendRejected(format!("invalid key: {e}")))?;
        let (nonce, sealed) = ciphertext.split_at(NONCE_LEN);
        let aad = aad(version);

        cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: sealed,
                    aad: &aad,
                },
            )
            .map_err(|_| {
                KmsError::KeyNotFound(format!(
                    "ciphertext does not authenticate under key version v{version}"
                ))
            })
    }

    async fn key_version(&self) -> Result<u64> {
        Ok(self.keyring.read().await.current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube_kms_core::ErrorKind;
    use kube_kms_core::types::annotated_key_version;
    use tempfile::TempDir;

    #[tokio::test]
    async fn encrypt_decrypt_roundtrip() {
        let backend = LocalBackend::in_memory();
        let sealed = backend.encrypt(b"secret data").await.unwrap();
        assert_eq!(sealed.key_version, 1);
        assert_eq!(annotated_key_version(&sealed.annotations).unwrap(), Some(1));

        let plain = backend
            .decrypt(&sealed.ciphertext, Some(1), &sealed.annotations)
            .await
            .unwrap();
        assert_eq!(plain, b"secret data");
    }

    #[tokio::test]
    async fn old_versions_decrypt_after_rotation() {
        let backend = LocalBackend::in_memory();
        let old = backend.encrypt(b"before").await.unwrap();

        assert_eq!(backend.rotate().await.unwrap(), 2);
        assert_eq!(backend.key_version().await.unwrap(), 2);
        let new = backend.encrypt(b"after").await.unwrap();
        assert_eq!(new.key_version, 2);

        let plain = backend
            .decrypt(&old.ciphertext, Some(1), &old.annotations)
            .await
            .unwrap();
        assert_eq!(plain, b"before");
    }

    #[tokio::test]
    async fn retired_version_is_key_not_found() {
        let backend = LocalBackend::in_memory();
        let old = backend.encrypt(b"before").await.unwrap();
        backend.rotate().await.unwrap();
        assert_eq!(backend.retire_below(2).await.unwrap(), 1);

        let err = backend
            .decrypt(&old.ciphertext, Some(1), &old.annotations)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::KeyNotFound);
    }

    #[tokio::test]
    async fn retire_never_drops_current() {
        let backend = LocalBackend::in_memory();
        backend.retire_below(10).await.unwrap();
        assert_eq!(backend.versions().await, vec![1]);
    }

    #[tokio::test]
    async fn wrong_version_does_not_return_garbage() {
        let backend = LocalBackend::in_memory();
        let sealed = backend.encrypt(b"payload").await.unwrap();
        backend.rotate().await.unwrap();

        let err = backend
            .decrypt(&sealed.ciphertext, Some(2), &sealed.annotations)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::KeyNotFound);
    }

    #[tokio::test]
    async fn truncated_ciphertext_is_invalid() {
        let backend = LocalBackend::in_memory();
        let err = backend
            .decrypt(&[0u8; 8], Some(1), &Annotations::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn keystore_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("keys.json");

        let backend = LocalBackend::open_or_create(&path).unwrap();
        let sealed = backend.encrypt(b"persisted").await.unwrap();
        backend.rotate().await.unwrap();
        drop(backend);

        let reopened = LocalBackend::open_or_create(&path).unwrap();
        assert_eq!(reopened.key_version().await.unwrap(), 2);
        let plain = reopened
            .decrypt(&sealed.ciphertext, Some(1), &sealed.annotations)
            .await
            .unwrap();
        assert_eq!(plain, b"persisted");
    }

    #[tokio::test]
    async fn concurrent_rotations_persist_latest_keyring() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("keys.json");
        let backend = std::sync::Arc::new(LocalBackend::open_or_create(&path).unwrap());

        let rotations: Vec<_> = (0..5)
            .map(|_| {
                let backend = std::sync::Arc::clone(&backend);
                tokio::spawn(async move { backend.rotate().await.unwrap() })
            })
            .collect();
        let readers: Vec<_> = (0..5)
            .map(|_| {
                let backend = std::sync::Arc::clone(&backend);
                tokio::spawn(async move { backend.encrypt(b"during rotation").await.unwrap() })
            })
            .collect();
        for task in rotations {
            task.await.unwrap();
        }
        for task in readers {
            task.await.unwrap();
        }

        let reopened = LocalBackend::open_or_create(&path).unwrap();
        assert_eq!(reopened.key_version().await.unwrap(), 6);
        assert_eq!(reopened.versions().await, vec![1, 2, 3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn ephemeral_keyring_changes_version_per_start() {
        let first = LocalBackend::ephemeral();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = LocalBackend::ephemeral();

        let v1 = first.key_version().await.unwrap();
        let v2 = second.key_version().await.unwrap();
        assert!(v1 > 1);
        assert!(v2 > v1);

        let sealed = second.encrypt(b"dev").await.unwrap();
        let plain = second
            .decrypt(&sealed.ciphertext, Some(v2), &sealed.annotations)
            .await
            .unwrap();
        assert_eq!(plain, b"dev");
        assert!(first
            .decrypt(&sealed.ciphertext, Some(v2), &sealed.annotations)
            .await
            .is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn keystore_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("keys.json");
        LocalBackend::open_or_create(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
