use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{KmsError, Result};
use crate::keyid::KeyId;

/// Annotation carrying the backend kind that produced a ciphertext.
pub const ANNOTATION_PROVIDER: &str = "provider.kube-kms.io";
/// Annotation carrying the decimal key version used at encryption time.
pub const ANNOTATION_KEY_VERSION: &str = "key-version.kube-kms.io";
/// Annotation carrying the AWS key ARN returned by KMS Encrypt.
pub const ANNOTATION_AWS_KEY_ARN: &str = "key-arn.aws.kube-kms.io";

/// Opaque per-ciphertext metadata handed back to the API server.
pub type Annotations = BTreeMap<String, Vec<u8>>;

/// Backend kind. Serialized names match the cluster `KMSConfig.type` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderKind {
    #[serde(rename = "AWS")]
    Aws,
    #[serde(rename = "Vault")]
    Vault,
    #[serde(rename = "Local")]
    Local,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Aws => "AWS",
            ProviderKind::Vault => "Vault",
            ProviderKind::Local => "Local",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable descriptor of the backing key lineage.
///
/// Field order and names are part of the key identity: the config hash is
/// computed over the compact JSON encoding of this struct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyConfig {
    #[serde(rename = "type")]
    pub provider: ProviderKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws: Option<AwsKeyConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vault: Option<VaultKeyConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<LocalKeyConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwsKeyConfig {
    #[serde(rename = "keyARN")]
    pub key_arn: String,
    pub region: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultKeyConfig {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default = "default_transit_mount")]
    pub transit_mount: String,
    pub transit_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalKeyConfig {
    /// Keystore file. `None` keeps the keyring in memory only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyfile_path: Option<String>,
}

fn default_transit_mount() -> String {
    "transit".to_string()
}

impl KeyConfig {
    pub fn aws(key_arn: &str, region: &str) -> Self {
        Self {
            provider: ProviderKind::Aws,
            aws: Some(AwsKeyConfig {
                key_arn: key_arn.to_string(),
                region: region.to_string(),
            }),
            vault: None,
            local: None,
        }
    }

    pub fn vault(address: &str, transit_key: &str) -> Self {
        Self {
            provider: ProviderKind::Vault,
            aws: None,
            vault: Some(VaultKeyConfig {
                address: address.to_string(),
                namespace: None,
                transit_mount: default_transit_mount(),
                transit_key: transit_key.to_string(),
            }),
            local: None,
        }
    }

    pub fn local(keyfile_path: Option<&str>) -> Self {
        Self {
            provider: ProviderKind::Local,
            aws: None,
            vault: None,
            local: Some(LocalKeyConfig {
                keyfile_path: keyfile_path.map(str::to_string),
            }),
        }
    }

    /// Check that exactly the block selected by `type` is present and complete.
    pub fn validate(&self) -> Result<()> {
        let blocks = [
            (ProviderKind::Aws, self.aws.is_some()),
            (ProviderKind::Vault, self.vault.is_some()),
            (ProviderKind::Local, self.local.is_some()),
        ];
        for (kind, present) in blocks {
            if kind == self.provider && !present {
                return Err(KmsError::ConfigInvalid(format!(
                    "key type {kind} requires a [key.{}] section",
                    kind.as_str().to_lowercase()
                )));
            }
            if kind != self.provider && present {
                return Err(KmsError::ConfigInvalid(format!(
                    "[key.{}] section given but key type is {}",
                    kind.as_str().to_lowercase(),
                    self.provider
                )));
            }
        }

        match self.provider {
            ProviderKind::Aws => {
                let aws = self.aws.as_ref().ok_or_else(|| missing("aws"))?;
                if !aws.key_arn.starts_with("arn:") {
                    return Err(KmsError::ConfigInvalid(format!(
                        "keyARN must be an ARN, got '{}'",
                        aws.key_arn
                    )));
                }
                require("region", &aws.region)?;
            }
            ProviderKind::Vault => {
                let vault = self.vault.as_ref().ok_or_else(|| missing("vault"))?;
                if !(vault.address.starts_with("http://") || vault.address.starts_with("https://"))
                {
                    return Err(KmsError::ConfigInvalid(format!(
                        "vault address must start with http:// or https://, got '{}'",
                        vault.address
                    )));
                }
                require("transitMount", &vault.transit_mount)?;
                require("transitKey", &vault.transit_key)?;
            }
            ProviderKind::Local => {}
        }
        Ok(())
    }
}

fn missing(section: &str) -> KmsError {
    KmsError::ConfigInvalid(format!("missing [key.{section}] section"))
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(KmsError::ConfigInvalid(format!("{field} must not be empty")));
    }
    Ok(())
}

/// Result of a backend encrypt call, before the KeyId is attached.
#[derive(Clone)]
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub key_version: u64,
    pub annotations: Annotations,
}

impl fmt::Debug for Sealed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sealed")
            .field("ciphertext_len", &self.ciphertext.len())
            .field("key_version", &self.key_version)
            .field("annotations", &self.annotations.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct EncryptRequest {
    pub uid: String,
    pub plaintext: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct EncryptResponse {
    pub ciphertext: Vec<u8>,
    pub key_id: KeyId,
    pub annotations: Annotations,
}

#[derive(Debug, Clone)]
pub struct DecryptRequest {
    pub uid: String,
    pub ciphertext: Vec<u8>,
    pub key_id: String,
    pub annotations: Annotations,
}

/// Liveness/readiness snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Status {
    pub healthy: bool,
    pub message: String,
    pub key_id: KeyId,
    pub key_version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionInfo {
    pub protocol_version: String,
    pub runtime_name: String,
    pub runtime_version: String,
}

/// Generate a request id for calls that arrive without one.
pub fn request_uid(uid: &str) -> String {
    if uid.is_empty() {
        uuid::Uuid::now_v7().to_string()
    } else {
        uid.to_string()
    }
}

/// Read the key version annotation, if present and well formed.
pub fn annotated_key_version(annotations: &Annotations) -> Result<Option<u64>> {
    let Some(raw) = annotations.get(ANNOTATION_KEY_VERSION) else {
        return Ok(None);
    };
    let text = std::str::from_utf8(raw).map_err(|_| {
        KmsError::InvalidRequest(format!("{ANNOTATION_KEY_VERSION} is not valid UTF-8"))
    })?;
    text.parse::<u64>().map(Some).map_err(|_| {
        KmsError::InvalidRequest(format!("{ANNOTATION_KEY_VERSION} is not a number: '{text}'"))
    })
}

pub fn version_annotation(provider: ProviderKind, key_version: u64) -> Annotations {
    let mut annotations = Annotations::new();
    annotations.insert(
        ANNOTATION_PROVIDER.to_string(),
        provider.as_str().as_bytes().to_vec(),
    );
    annotations.insert(
        ANNOTATION_KEY_VERSION.to_string(),
        key_version.to_string().into_bytes(),
    );
    annotations
}
