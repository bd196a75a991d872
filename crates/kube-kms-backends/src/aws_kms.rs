//! AWS KMS backend.
//!
//! Data is encrypted directly under the configured symmetric key. The key ARN
//! KMS reports on Encrypt is kept in the annotations so Decrypt can address
//! the same key even after an alias moves.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use aws_config::retry::RetryConfig;
use aws_config::timeout::TimeoutConfig;
use aws_sdk_kms::Client;
use aws_sdk_kms::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_kms::primitives::Blob;
use aws_sdk_kms::types::{EncryptionAlgorithmSpec, KeyState};

use kube_kms_core::types::{
    ANNOTATION_AWS_KEY_ARN, Annotations, ProviderKind, Sealed, version_annotation,
};
use kube_kms_core::{KmsError, Result};

use crate::errors::classify_aws;
use crate::provider::KmsBackend;

pub struct AwsKmsBackend {
    client: Client,
    key_arn: String,
    /// Last version observed through ListKeyRotations.
    last_version: AtomicU64,
}

impl AwsKmsBackend {
    /// Connect using the default credential chain (env, profile, IRSA, instance role).
    pub async fn new(key_arn: &str, region: &str, call_timeout: Duration) -> Result<Self> {
        let config = aws_config::from_env()
            .region(aws_config::Region::new(region.to_string()))
            .retry_config(RetryConfig::disabled())
            .timeout_config(
                TimeoutConfig::builder()
                    .operation_timeout(call_timeout)
                    .build(),
            )
            .load()
            .await;

        tracing::debug!(key_arn, region, "AWS KMS client configured");
        Ok(Self::from_client(Client::new(&config), key_arn))
    }

    /// Use an already configured client.
    pub fn from_client(client: Client, key_arn: &str) -> Self {
        Self {
            client,
            key_arn: key_arn.to_string(),
            last_version: AtomicU64::new(1),
        }
    }
}

fn classify<E, R>(op: &str, err: SdkError<E, R>) -> KmsError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    let transient = matches!(
        err,
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_)
    );
    let code = err.code().map(str::to_string);
    let message = DisplayErrorContext(&err).to_string();
    classify_aws(op, code.as_deref(), transient, message)
}

#[async_trait]
impl KmsBackend for AwsKmsBackend {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Aws
    }

    async fn encrypt(&self, plaintext: &[u8]) -> Result<Sealed> {
        let output = self
            .client
            .encrypt()
            .key_id(&self.key_arn)
            .encryption_algorithm(EncryptionAlgorithmSpec::SymmetricDefault)
            .plaintext(Blob::new(plaintext.to_vec()))
            .send()
            .await
            .map_err(|e| classify("Encrypt", e))?;

        let ciphertext = output
            .ciphertext_blob()
            .map(|b| b.as_ref().to_vec())
            .ok_or_else(|| KmsError::BackendRejected("Encrypt: no ciphertext returned".into()))?;

        let key_version = self.last_version.load(Ordering::Acquire);
        let mut annotations = version_annotation(ProviderKind::Aws, key_version);
        let arn = output.key_id().unwrap_or(&self.key_arn);
        annotations.insert(ANNOTATION_AWS_KEY_ARN.to_string(), arn.as_bytes().to_vec());

        Ok(Sealed {
            ciphertext,
            key_version,
            annotations,
        })
    }

    async fn decrypt(
        &self,
        ciphertext: &[u8],
        _key_version: Option<u64>,
        annotations: &Annotations,
    ) -> Result<Vec<u8>> {
        let key_id = match annotations.get(ANNOTATION_AWS_KEY_ARN) {
            Some(raw) => std::str::from_utf8(raw).map_err(|_| {
                KmsError::InvalidRequest(format!("{ANNOTATION_AWS_KEY_ARN} is not valid UTF-8"))
            })?,
            None => self.key_arn.as_str(),
        };

        let output = self
            .client
            .decrypt()
            .key_id(key_id)
            .encryption_algorithm(EncryptionAlgorithmSpec::SymmetricDefault)
            .ciphertext_blob(Blob::new(ciphertext.to_vec()))
            .send()
            .await
            .map_err(|e| classify("Decrypt", e))?;

        output
            .plaintext()
            .map(|b| b.as_ref().to_vec())
            .ok_or_else(|| KmsError::BackendRejected("Decrypt: no plaintext returned".into()))
    }

    async fn key_version(&self) -> Result<u64> {
        let described = self
            .client
            .describe_key()
            .key_id(&self.key_arn)
            .send()
            .await
            .map_err(|e| classify("DescribeKey", e))?;

        let state = described.key_metadata().and_then(|m| m.key_state());
        if state != Some(&KeyState::Enabled) {
            return Err(KmsError::BackendRejected(format!(
                "DescribeKey: key {} is not enabled (state {state:?})",
                self.key_arn
            )));
        }

        let mut rotations = self
            .client
            .list_key_rotations()
            .key_id(&self.key_arn)
            .into_paginator()
            .items()
            .send();
        let mut completed = 0u64;
        while let Some(entry) = rotations.next().await {
            if let Err(e) = entry {
                // Older keys and restricted policies cannot list rotations.
                tracing::debug!(error = %DisplayErrorContext(&e), "ListKeyRotations failed, keeping last version");
                return Ok(self.last_version.load(Ordering::Acquire));
            }
            completed += 1;
        }

        self.last_version.fetch_max(completed + 1, Ordering::AcqRel);
        Ok(self.last_version.load(Ordering::Acquire))
    }
}
