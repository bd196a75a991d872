//! Secret values for backend authentication.
//!
//! Every secret may be given inline or as a path to a mounted file. Files are
//! re-read on each resolution so a rotated secret is picked up without a
//! restart. Resolved values live in [`Zeroizing`] buffers.

use std::path::Path;

use zeroize::Zeroizing;

use crate::error::{KmsError, Result};

/// Exactly one of `value` / `file` must be set.
pub fn require_one(name: &str, value: &Option<String>, file: &Option<String>) -> Result<()> {
    match (value, file) {
        (Some(_), Some(_)) => Err(KmsError::ConfigInvalid(format!(
            "set either {name} or {name}_file, not both"
        ))),
        (None, None) => Err(KmsError::ConfigInvalid(format!(
            "{name} or {name}_file is required"
        ))),
        _ => Ok(()),
    }
}

/// Where a secret comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretSource {
    Inline(String),
    File(String),
}

impl SecretSource {
    pub fn from_pair(name: &str, value: &Option<String>, file: &Option<String>) -> Result<Self> {
        match (value, file) {
            (Some(v), None) => Ok(SecretSource::Inline(v.clone())),
            (None, Some(f)) => Ok(SecretSource::File(f.clone())),
            _ => require_one(name, value, file).map(|_| SecretSource::Inline(String::new())),
        }
    }

    /// Read the secret, trimming surrounding whitespace from file contents.
    pub fn resolve(&self) -> Result<Zeroizing<String>> {
        match self {
            SecretSource::Inline(value) => Ok(Zeroizing::new(value.clone())),
            SecretSource::File(path) => {
                let raw = Zeroizing::new(std::fs::read_to_string(Path::new(path)).map_err(|e| {
                    KmsError::ConfigInvalid(format!("cannot read secret file {path}: {e}"))
                })?);
                let trimmed = raw.trim();
                if trimmed.is_empty() {
                    return Err(KmsError::ConfigInvalid(format!("secret file {path} is empty")));
                }
                Ok(Zeroizing::new(trimmed.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn inline_passthrough() {
        let source = SecretSource::from_pair("token", &Some("s.abc".into()), &None).unwrap();
        assert_eq!(source.resolve().unwrap().as_str(), "s.abc");
    }

    #[test]
    fn file_is_trimmed_and_reread() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("secret-id");
        std::fs::write(&path, "first\n").unwrap();
        let source = SecretSource::File(path.display().to_string());
        assert_eq!(source.resolve().unwrap().as_str(), "first");

        std::fs::write(&path, "second\n").unwrap();
        assert_eq!(source.resolve().unwrap().as_str(), "second");
    }

    #[test]
    fn empty_or_missing_file_fails() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("empty");
        std::fs::write(&path, "  \n").unwrap();
        assert!(SecretSource::File(path.display().to_string()).resolve().is_err());
        assert!(SecretSource::File("/nonexistent/secret".into()).resolve().is_err());
    }

    #[test]
    fn both_or_neither_is_rejected() {
        assert!(require_one("token", &Some("a".into()), &Some("b".into())).is_err());
        assert!(require_one("token", &None, &None).is_err());
    }
}
