//! Deterministic key identifiers.
//!
//! A key lineage is identified by the FNV-1a 64-bit hash of the compact JSON
//! encoding of its [`KeyConfig`]. The KeyId reported to the API server adds
//! the backend key version, so it changes whenever the key rotates.

use std::fmt;
use std::hash::Hasher;

use fnv::FnvHasher;
use serde::Serialize;

use crate::error::{KmsError, Result};
use crate::types::KeyConfig;

/// Unix socket endpoint template; one socket directory per key lineage.
pub const ENDPOINT_TEMPLATE: &str = "unix:///var/kube-kms/{hash}/socket.sock";

/// 16 lowercase hex characters identifying a [`KeyConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ConfigHash(String);

impl ConfigHash {
    pub fn of(config: &KeyConfig) -> Result<Self> {
        let encoded = serde_json::to_vec(config).map_err(|e| {
            KmsError::ConfigInvalid(format!("could not generate hash for KMS config: {e}"))
        })?;
        let mut hasher = FnvHasher::default();
        hasher.write(&encoded);
        Ok(Self(format!("{:016x}", hasher.finish())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Default socket endpoint for this lineage.
    pub fn default_endpoint(&self) -> String {
        ENDPOINT_TEMPLATE.replace("{hash}", &self.0)
    }
}

impl fmt::Display for ConfigHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `{config_hash}-v{key_version}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct KeyId(String);

impl KeyId {
    pub fn new(hash: &ConfigHash, key_version: u64) -> Self {
        Self(format!("{}-v{key_version}", hash.as_str()))
    }

    /// Split a KeyId string into its config hash and key version.
    pub fn parse(raw: &str) -> Result<(String, u64)> {
        let (hash, version) = raw
            .rsplit_once("-v")
            .ok_or_else(|| KmsError::InvalidRequest(format!("malformed key id '{raw}'")))?;
        if hash.is_empty() {
            return Err(KmsError::InvalidRequest(format!("malformed key id '{raw}'")));
        }
        let version = version
            .parse::<u64>()
            .map_err(|_| KmsError::InvalidRequest(format!("malformed key id '{raw}'")))?;
        Ok((hash.to_string(), version))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
