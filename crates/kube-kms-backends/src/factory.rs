//! Factory for creating the backend selected by the key configuration.

use std::path::Path;
use std::sync::Arc;

use kube_kms_core::config::credentials::SecretSource;
use kube_kms_core::config::{PluginConfig, VaultAuthConfig};
use kube_kms_core::types::ProviderKind;

use crate::local::LocalBackend;
use crate::provider::KmsBackend;
use crate::vault::{
    AppRoleAuthenticator, Authenticator, TokenAuthenticator, VaultClient, VaultSession,
    VaultTransitBackend,
};

/// A constructed backend plus the Vault session driving it, if any.
pub struct BackendHandle {
    pub backend: Arc<dyn KmsBackend>,
    /// Present for Vault so the caller can start token renewal.
    pub session: Option<Arc<VaultSession>>,
}

/// Create the backend for `config.key`.
///
/// Supported types:
/// - `Local`: AES-256-GCM keyring, in memory or in a keystore file
/// - `Vault`: Vault Transit (token or AppRole auth)
/// - `AWS`: AWS KMS (compile with the `aws-kms` feature)
pub async fn create_backend(config: &PluginConfig) -> anyhow::Result<BackendHandle> {
    let key = &config.key;
    match key.provider {
        ProviderKind::Local => {
            let local = key
                .local
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("[key.local] section required for Local keys"))?;
            let backend = match &local.keyfile_path {
                Some(path) => LocalBackend::open_or_create(Path::new(path))?,
                None => {
                    tracing::warn!("Local keyring is in memory only; ciphertexts will not survive a restart");
                    LocalBackend::ephemeral()
                }
            };
            Ok(BackendHandle {
                backend: Arc::new(backend),
                session: None,
            })
        }

        ProviderKind::Vault => {
            let vault = key
                .vault
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("[key.vault] section required for Vault keys"))?;
            let auth = config
                .auth
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("[auth] section required for Vault keys"))?;

            let client = Arc::new(VaultClient::new(
                &vault.address,
                vault.namespace.as_deref(),
                config.plugin.call_timeout(),
                config.plugin.vault_ca_cert.as_deref().map(Path::new),
            )?);
            let authenticator = create_authenticator(Arc::clone(&client), auth)?;
            let session = Arc::new(VaultSession::new(
                authenticator,
                config.plugin.token_refresh_margin(),
            ));
            let backend = VaultTransitBackend::new(
                client,
                Arc::clone(&session),
                &vault.transit_mount,
                &vault.transit_key,
            );

            tracing::info!(
                address = %vault.address,
                mount = %vault.transit_mount,
                key = %vault.transit_key,
                "Vault Transit backend configured"
            );
            Ok(BackendHandle {
                backend: Arc::new(backend),
                session: Some(session),
            })
        }

        #[cfg(feature = "aws-kms")]
        ProviderKind::Aws => {
            let aws = key
                .aws
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("[key.aws] section required for AWS keys"))?;
            let backend = crate::aws_kms::AwsKmsBackend::new(
                &aws.key_arn,
                &aws.region,
                config.plugin.call_timeout(),
            )
            .await?;
            Ok(BackendHandle {
                backend: Arc::new(backend),
                session: None,
            })
        }

        #[cfg(not(feature = "aws-kms"))]
        ProviderKind::Aws => {
            anyhow::bail!("aws-kms feature not enabled. Recompile with --features aws-kms")
        }
    }
}

fn create_authenticator(
    client: Arc<VaultClient>,
    auth: &VaultAuthConfig,
) -> anyhow::Result<Arc<dyn Authenticator>> {
    match auth {
        VaultAuthConfig::Token { token, token_file } => {
            let source = SecretSource::from_pair("token", token, token_file)?;
            Ok(Arc::new(TokenAuthenticator::new(client, source)))
        }
        VaultAuthConfig::Approle {
            mount,
            role_id,
            role_id_file,
            secret_id,
            secret_id_file,
        } => {
            let role_id = SecretSource::from_pair("role_id", role_id, role_id_file)?;
            let secret_id = SecretSource::from_pair("secret_id", secret_id, secret_id_file)?;
            Ok(Arc::new(AppRoleAuthenticator::new(
                client, mount, role_id, secret_id,
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn local_in_memory() {
        let config =
            PluginConfig::from_toml("[key]\ntype = \"Local\"\n\n[key.local]\n").unwrap();
        let handle = create_backend(&config).await.unwrap();
        assert_eq!(handle.backend.kind(), ProviderKind::Local);
        assert!(handle.session.is_none());
        // Unpersisted keyrings start from a time-seeded version.
        assert!(handle.backend.key_version().await.unwrap() > 1);
    }

    #[tokio::test]
    async fn local_keystore_file_is_created() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("keys.json");
        let content = format!(
            "[key]\ntype = \"Local\"\n\n[key.local]\nkeyfilePath = \"{}\"\n",
            path.display()
        );
        let config = PluginConfig::from_toml(&content).unwrap();
        create_backend(&config).await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn vault_has_session() {
        let config = PluginConfig::from_toml(
            r#"
[key]
type = "Vault"

[key.vault]
address = "http://127.0.0.1:8200"
transitKey = "etcd"

[auth]
method = "token"
token = "s.test"
"#,
        )
        .unwrap();
        let handle = create_backend(&config).await.unwrap();
        assert_eq!(handle.backend.kind(), ProviderKind::Vault);
        assert!(handle.session.is_some());
    }

    #[cfg(not(feature = "aws-kms"))]
    #[tokio::test]
    async fn aws_without_feature_fails() {
        let config = PluginConfig::from_toml(
            "[key]\ntype = \"AWS\"\n\n[key.aws]\nkeyARN = \"arn:aws:kms:us-east-2:1:key/abc\"\nregion = \"us-east-2\"\n",
        )
        .unwrap();
        let err = create_backend(&config).await.err().unwrap();
        assert!(err.to_string().contains("aws-kms feature not enabled"));
    }
}
