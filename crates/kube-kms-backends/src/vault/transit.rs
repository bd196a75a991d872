use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::Method;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use kube_kms_core::types::{Annotations, ProviderKind, Sealed, version_annotation};
use kube_kms_core::{KmsError, Result};

use super::client::VaultClient;
use super::session::VaultSession;
use crate::errors::VaultScope;
use crate::provider::KmsBackend;

#[derive(Deserialize)]
struct DataResponse<T> {
    data: T,
}

#[derive(Deserialize)]
struct EncryptData {
    ciphertext: String,
    #[serde(default)]
    key_version: Option<u64>,
}

#[derive(Deserialize)]
struct DecryptData {
    plaintext: String,
}

#[derive(Deserialize)]
struct KeyData {
    latest_version: u64,
}

/// Version embedded in a Transit ciphertext (`vault:v<N>:<payload>`).
pub fn ciphertext_version(ciphertext: &str) -> Option<u64> {
    let rest = ciphertext.strip_prefix("vault:v")?;
    let (version, payload) = rest.split_once(':')?;
    if payload.is_empty() {
        return None;
    }
    version.parse().ok()
}

/// Vault Transit secrets engine backend.
pub struct VaultTransitBackend {
    client: Arc<VaultClient>,
    session: Arc<VaultSession>,
    mount: String,
    key: String,
}

impl VaultTransitBackend {
    pub fn new(client: Arc<VaultClient>, session: Arc<VaultSession>, mount: &str, key: &str) -> Self {
        Self {
            client,
            session,
            mount: mount.trim_matches('/').to_string(),
            key: key.to_string(),
        }
    }

    pub fn session(&self) -> &Arc<VaultSession> {
        &self.session
    }

    /// Call Transit with the session token; a refused token is invalidated.
    async fn call<T: DeserializeOwned>(
        &self,
        op: &str,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<T> {
        let token = self.session.token().await?;
        match self.client.call(method, path, Some(token.secret()), body).await {
            Ok(value) => Ok(value),
            Err(e) => {
                if e.is_auth_failure() {
                    self.session.invalidate(token.generation()).await;
                }
                Err(e.into_kms(op, VaultScope::Transit))
            }
        }
    }
}

#[async_trait]
impl KmsBackend for VaultTransitBackend {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Vault
    }

    async fn encrypt(&self, plaintext: &[u8]) -> Result<Sealed> {
        let path = format!("{}/encrypt/{}", self.mount, self.key);
        let body = serde_json::json!({ "plaintext": BASE64.encode(plaintext) });
        let response: DataResponse<EncryptData> =
            self.call("transit encrypt", Method::POST, &path, Some(&body)).await?;

        let ciphertext = response.data.ciphertext;
        let key_version = response
            .data
            .key_version
            .or_else(|| ciphertext_version(&ciphertext))
            .ok_or_else(|| {
                KmsError::BackendRejected("transit encrypt: response has no key version".into())
            })?;

        Ok(Sealed {
            ciphertext: ciphertext.into_bytes(),
            key_version,
            annotations: version_annotation(ProviderKind::Vault, key_version),
        })
    }

    async fn decrypt(
        &self,
        ciphertext: &[u8],
        key_version: Option<u64>,
        _annotations: &Annotations,
    ) -> Result<Vec<u8>> {
        let ciphertext = std::str::from_utf8(ciphertext)
            .map_err(|_| KmsError::InvalidRequest("ciphertext is not a Vault ciphertext".into()))?;
        let embedded = ciphertext_version(ciphertext)
            .ok_or_else(|| KmsError::InvalidRequest("ciphertext is not a Vault ciphertext".into()))?;

        if let Some(expected) = key_version.filter(|v| *v != embedded) {
            return Err(KmsError::KeyNotFound(format!(
                "ciphertext was sealed with key version {embedded}, annotation says {expected}"
            )));
        }

        let path = format!("{}/decrypt/{}", self.mount, self.key);
        let body = serde_json::json!({ "ciphertext": ciphertext });
        let response: DataResponse<DecryptData> =
            self.call("transit decrypt", Method::POST, &path, Some(&body)).await?;

        BASE64
            .decode(response.data.plaintext.as_bytes())
            .map_err(|e| KmsError::BackendRejected(format!("transit decrypt: bad plaintext encoding: {e}")))
    }

    async fn key_version(&self) -> Result<u64> {
        let path = format!("{}/keys/{}", self.mount, self.key);
        let response: DataResponse<KeyData> =
            self.call("transit key lookup", Method::GET, &path, None).await?;
        Ok(response.data.latest_version)
    }
}
