use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use zeroize::Zeroizing;

use kube_kms_core::Result;
use kube_kms_core::config::credentials::SecretSource;

use super::client::VaultClient;
use super::session::{Authenticator, LoginToken};
use crate::errors::VaultScope;

#[derive(Deserialize)]
struct AuthResponse {
    auth: AuthBlock,
}

#[derive(Deserialize)]
struct AuthBlock {
    client_token: String,
    #[serde(default)]
    lease_duration: u64,
}

#[derive(Deserialize)]
struct LookupResponse {
    data: LookupData,
}

#[derive(Deserialize)]
struct LookupData {
    #[serde(default)]
    ttl: u64,
    #[serde(default)]
    renewable: bool,
}

fn lease(seconds: u64) -> Option<Duration> {
    (seconds > 0).then(|| Duration::from_secs(seconds))
}

/// Static token, optionally read from a mounted file.
///
/// Each login re-reads the token, looks it up and renews it when Vault
/// allows, so the session learns the real remaining lifetime.
pub struct TokenAuthenticator {
    client: Arc<VaultClient>,
    source: SecretSource,
}

impl TokenAuthenticator {
    pub fn new(client: Arc<VaultClient>, source: SecretSource) -> Self {
        Self { client, source }
    }
}

#[async_trait]
impl Authenticator for TokenAuthenticator {
    fn method(&self) -> &'static str {
        "token"
    }

    async fn login(&self) -> Result<LoginToken> {
        let token = self.source.resolve()?;

        let lookup: LookupResponse = self
            .client
            .call(Method::GET, "auth/token/lookup-self", Some(&token), None)
            .await
            .map_err(|e| e.into_kms("token lookup", VaultScope::Auth))?;

        if !lookup.data.renewable || lookup.data.ttl == 0 {
            return Ok(LoginToken {
                secret: token,
                lease: lease(lookup.data.ttl),
            });
        }

        let renewed: AuthResponse = self
            .client
            .call(Method::POST, "auth/token/renew-self", Some(&token), Some(&serde_json::json!({})))
            .await
            .map_err(|e| e.into_kms("token renew", VaultScope::Auth))?;

        tracing::debug!(lease_secs = renewed.auth.lease_duration, "Vault token renewed");
        Ok(LoginToken {
            secret: Zeroizing::new(renewed.auth.client_token),
            lease: lease(renewed.auth.lease_duration),
        })
    }
}

/// AppRole login with a RoleID and SecretID.
pub struct AppRoleAuthenticator {
    client: Arc<VaultClient>,
    mount: String,
    role_id: SecretSource,
    secret_id: SecretSource,
}

impl AppRoleAuthenticator {
    pub fn new(
        client: Arc<VaultClient>,
        mount: &str,
        role_id: SecretSource,
        secret_id: SecretSource,
    ) -> Self {
        Self {
            client,
            mount: mount.trim_matches('/').to_string(),
            role_id,
            secret_id,
        }
    }
}

#[async_trait]
impl Authenticator for AppRoleAuthenticator {
    fn method(&self) -> &'static str {
        "approle"
    }

    async fn login(&self) -> Result<LoginToken> {
        let role_id = self.role_id.resolve()?;
        let secret_id = self.secret_id.resolve()?;
        let body = serde_json::json!({
            "role_id": role_id.as_str(),
            "secret_id": secret_id.as_str(),
        });

        let path = format!("auth/{}/login", self.mount);
        let response: AuthResponse = self
            .client
            .call(Method::POST, &path, None, Some(&body))
            .await
            .map_err(|e| e.into_kms("approle login", VaultScope::Auth))?;

        Ok(LoginToken {
            secret: Zeroizing::new(response.auth.client_token),
            lease: lease(response.auth.lease_duration),
        })
    }
}
