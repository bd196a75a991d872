//! Protocol-independent request handling.
//!
//! Both gRPC API versions delegate here. The handler bounds every backend
//! call by the effective deadline, retries only `Status`, keeps the
//! key-version cache current and turns KeyIds into backend routing.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::Instrument;

use kube_kms_backends::KmsBackend;
use kube_kms_core::config::PluginSettings;
use kube_kms_core::types::{
    DecryptRequest, EncryptRequest, EncryptResponse, Status, VersionInfo, annotated_key_version,
    request_uid,
};
use kube_kms_core::{ConfigHash, KeyId, KmsError, Result};

use crate::key_cache::KeyVersionCache;

pub const PROTOCOL_VERSION: &str = "v2";
pub const RUNTIME_NAME: &str = "kube-kms-plugin";
pub const RUNTIME_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone)]
pub struct HandlerOptions {
    pub call_timeout: Duration,
    pub status_retries: u32,
    pub status_backoff: Duration,
}

impl HandlerOptions {
    pub fn from_settings(settings: &PluginSettings) -> Self {
        Self {
            call_timeout: settings.call_timeout(),
            status_retries: settings.status_retries,
            status_backoff: settings.status_backoff(),
        }
    }
}

pub struct KmsHandler {
    backend: Arc<dyn KmsBackend>,
    cache: KeyVersionCache,
    options: HandlerOptions,
}

impl KmsHandler {
    pub fn new(backend: Arc<dyn KmsBackend>, hash: ConfigHash, options: HandlerOptions) -> Self {
        Self {
            backend,
            cache: KeyVersionCache::new(hash),
            options,
        }
    }

    pub fn cache(&self) -> &KeyVersionCache {
        &self.cache
    }

    pub fn call_timeout(&self) -> Duration {
        self.options.call_timeout
    }

    pub fn version(&self) -> VersionInfo {
        VersionInfo {
            protocol_version: PROTOCOL_VERSION.to_string(),
            runtime_name: RUNTIME_NAME.to_string(),
            runtime_version: RUNTIME_VERSION.to_string(),
        }
    }

    /// `min(call_timeout, requested)`.
    pub fn effective_deadline(&self, requested: Option<Duration>) -> Duration {
        match requested {
            Some(requested) => requested.min(self.options.call_timeout),
            None => self.options.call_timeout,
        }
    }

    /// Probe the backend. Never fails; errors end up in the snapshot.
    pub async fn status(&self, requested: Option<Duration>) -> Status {
        let deadline = self.effective_deadline(requested);
        let span = tracing::info_span!("kms", method = "Status");
        let result = self
            .bounded(deadline, self.key_version_with_retries())
            .instrument(span)
            .await;

        match result {
            Ok(version) => {
                self.cache.observe(version);
                Status {
                    healthy: true,
                    message: "ok".to_string(),
                    key_id: self.cache.key_id(),
                    key_version: self.cache.version(),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, kind = e.kind().as_str(), "Backend status check failed");
                Status {
                    healthy: false,
                    message: e.to_string(),
                    key_id: self.cache.key_id(),
                    key_version: self.cache.version(),
                }
            }
        }
    }

    /// Single backend probe used by the background prober.
    pub async fn probe(&self) -> Result<u64> {
        let version = self
            .bounded(self.options.call_timeout, self.backend.key_version())
            .await?;
        Ok(self.cache.observe(version))
    }

    pub async fn encrypt(
        &self,
        request: EncryptRequest,
        requested: Option<Duration>,
    ) -> Result<EncryptResponse> {
        let uid = request_uid(&request.uid);
        let span = tracing::info_span!("kms", method = "Encrypt", uid = %uid);
        async {
            if request.plaintext.is_empty() {
                return Err(KmsError::InvalidRequest("plaintext is empty".into()));
            }

            let deadline = self.effective_deadline(requested);
            let sealed = self
                .bounded(deadline, self.backend.encrypt(&request.plaintext))
                .await
                .inspect_err(|e| tracing::warn!(error = %e, kind = e.kind().as_str(), "Encrypt failed"))?;

            self.cache.observe(sealed.key_version);
            let key_id = KeyId::new(self.cache.hash(), sealed.key_version);
            tracing::debug!(key_id = %key_id, bytes = request.plaintext.len(), "Encrypted");

            Ok(EncryptResponse {
                ciphertext: sealed.ciphertext,
                key_id,
                annotations: sealed.annotations,
            })
        }
        .instrument(span)
        .await
    }

    pub async fn decrypt(
        &self,
        request: DecryptRequest,
        requested: Option<Duration>,
    ) -> Result<Vec<u8>> {
        let uid = request_uid(&request.uid);
        let span = tracing::info_span!("kms", method = "Decrypt", uid = %uid, key_id = %request.key_id);
        async {
            if request.ciphertext.is_empty() {
                return Err(KmsError::InvalidRequest("ciphertext is empty".into()));
            }

            let key_version = self.route(&request)?;
            let deadline = self.effective_deadline(requested);
            let plaintext = self
                .bounded(
                    deadline,
                    self.backend
                        .decrypt(&request.ciphertext, key_version, &request.annotations),
                )
                .await
                .inspect_err(|e| tracing::warn!(error = %e, kind = e.kind().as_str(), "Decrypt failed"))?;

            tracing::debug!(key_version = ?key_version, "Decrypted");
            Ok(plaintext)
        }
        .instrument(span)
        .await
    }

    /// Key version to decrypt with: the annotation, else the KeyId suffix.
    fn route(&self, request: &DecryptRequest) -> Result<Option<u64>> {
        let annotated = annotated_key_version(&request.annotations)?;
        if request.key_id.is_empty() {
            return Ok(annotated);
        }

        let (hash, version) = KeyId::parse(&request.key_id)?;
        if hash != self.cache.hash().as_str() {
            return Err(KmsError::KeyNotFound(format!(
                "key id {} belongs to another key configuration (expected {})",
                request.key_id,
                self.cache.hash()
            )));
        }
        Ok(annotated.or(Some(version)))
    }

    async fn key_version_with_retries(&self) -> Result<u64> {
        let mut backoff = self.options.status_backoff;
        let mut attempt = 0;
        loop {
            match self.backend.key_version().await {
                Ok(version) => return Ok(version),
                Err(e) if e.is_transient() && attempt < self.options.status_retries => {
                    attempt += 1;
                    tracing::debug!(error = %e, attempt, retry_in = ?backoff, "Retrying backend status");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run `fut` under `deadline`; on expiry the future is dropped.
    async fn bounded<T, F>(&self, deadline: Duration, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(deadline, fut).await {
            Ok(result) => result,
            Err(_) => Err(KmsError::DeadlineExceeded(deadline)),
        }
    }
}
