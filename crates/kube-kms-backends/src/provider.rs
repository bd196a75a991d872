use async_trait::async_trait;
use kube_kms_core::Result;
use kube_kms_core::types::{Annotations, ProviderKind, Sealed};

/// Capability interface every key-management backend implements.
///
/// Implementations must translate every failure into a [`kube_kms_core::KmsError`]
/// of the matching kind and must not retry on their own.
#[async_trait]
pub trait KmsBackend: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Encrypt with the active key version.
    async fn encrypt(&self, plaintext: &[u8]) -> Result<Sealed>;

    /// Decrypt a ciphertext produced by [`KmsBackend::encrypt`].
    ///
    /// `key_version` is the version recorded at encryption time, which may be
    /// older than the active one.
    async fn decrypt(
        &self,
        ciphertext: &[u8],
        key_version: Option<u64>,
        annotations: &Annotations,
    ) -> Result<Vec<u8>>;

    /// Current key version. Doubles as the reachability probe.
    async fn key_version(&self) -> Result<u64>;
}
