//! Translation of backend failures into the plugin error taxonomy.

use kube_kms_core::KmsError;

/// Which kind of Vault endpoint produced an error response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VaultScope {
    /// `auth/*` login, lookup and renew calls.
    Auth,
    /// Transit key and crypto calls.
    Transit,
}

/// Map a non-2xx Vault response to a [`KmsError`].
pub fn classify_vault(op: &str, scope: VaultScope, status: u16, errors: &[String]) -> KmsError {
    let detail = if errors.is_empty() {
        format!("{op}: HTTP {status}")
    } else {
        format!("{op}: HTTP {status}: {}", errors.join("; "))
    };

    match status {
        429 | 500..=599 => KmsError::BackendUnavailable(detail),
        401 | 403 => KmsError::BackendRejected(detail),
        404 if scope == VaultScope::Transit => KmsError::KeyNotFound(detail),
        400 if scope == VaultScope::Transit && mentions_retired_version(errors) => {
            KmsError::KeyNotFound(detail)
        }
        _ => KmsError::BackendRejected(detail),
    }
}

fn mentions_retired_version(errors: &[String]) -> bool {
    errors.iter().any(|e| {
        let e = e.to_lowercase();
        e.contains("disallowed by policy")
            || e.contains("too old")
            || e.contains("key version")
            || e.contains("encryption key not found")
            || (e.contains("invalid ciphertext") && e.contains("version"))
    })
}

/// Map an AWS KMS error code to a [`KmsError`].
///
/// `transient` marks dispatch and timeout failures where no service code exists.
pub fn classify_aws(op: &str, code: Option<&str>, transient: bool, message: String) -> KmsError {
    let detail = match code {
        Some(code) => format!("{op}: {code}: {message}"),
        None => format!("{op}: {message}"),
    };

    match code {
        Some(
            "NotFoundException" | "IncorrectKeyException" | "InvalidCiphertextException",
        ) => KmsError::KeyNotFound(detail),
        Some(
            "DisabledException"
            | "AccessDeniedException"
            | "KMSInvalidStateException"
            | "InvalidKeyUsageException"
            | "InvalidGrantTokenException"
            | "UnrecognizedClientException"
            | "ExpiredTokenException",
        ) => KmsError::BackendRejected(detail),
        Some(
            "KMSInternalException"
            | "DependencyTimeoutException"
            | "KeyUnavailableException"
            | "ThrottlingException"
            | "LimitExceededException",
        ) => KmsError::BackendUnavailable(detail),
        _ if transient => KmsError::BackendUnavailable(detail),
        _ => KmsError::BackendRejected(detail),
    }
}
