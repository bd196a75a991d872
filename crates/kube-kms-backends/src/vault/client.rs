use std::path::Path;
use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use kube_kms_core::{KmsError, Result};

use crate::errors::{VaultScope, classify_vault};

/// Thin HTTP client for the Vault API.
pub struct VaultClient {
    http: reqwest::Client,
    address: String,
    namespace: Option<String>,
}

/// Failure of a single Vault HTTP call, before classification.
#[derive(Debug)]
pub enum VaultCallError {
    Transport(reqwest::Error),
    Status { status: u16, errors: Vec<String> },
    Decode(String),
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errors: Vec<String>,
}

impl VaultCallError {
    /// The token was refused; the session should log in again.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, VaultCallError::Status { status: 401 | 403, .. })
    }

    pub fn into_kms(self, op: &str, scope: VaultScope) -> KmsError {
        match self {
            VaultCallError::Transport(e) if e.is_timeout() => {
                KmsError::BackendUnavailable(format!("{op}: request timed out: {e}"))
            }
            VaultCallError::Transport(e) => {
                KmsError::BackendUnavailable(format!("{op}: transport error: {e}"))
            }
            VaultCallError::Status { status, errors } => classify_vault(op, scope, status, &errors),
            VaultCallError::Decode(msg) => {
                KmsError::BackendRejected(format!("{op}: unexpected response: {msg}"))
            }
        }
    }
}

impl VaultClient {
    /// `timeout` bounds each HTTP round trip; `ca_cert` adds a trusted PEM bundle.
    pub fn new(
        address: &str,
        namespace: Option<&str>,
        timeout: Duration,
        ca_cert: Option<&Path>,
    ) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout);

        if let Some(path) = ca_cert {
            let pem = std::fs::read(path).map_err(|e| {
                KmsError::ConfigInvalid(format!("cannot read CA bundle {}: {e}", path.display()))
            })?;
            let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                KmsError::ConfigInvalid(format!("invalid CA bundle {}: {e}", path.display()))
            })?;
            builder = builder.add_root_certificate(cert);
        }

        let http = builder
            .build()
            .map_err(|e| KmsError::ConfigInvalid(format!("cannot build HTTP client: {e}")))?;

        Ok(Self {
            http,
            address: address.trim_end_matches('/').to_string(),
            namespace: namespace.map(str::to_string),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Issue `method /v1/{path}` and decode the JSON body.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        token: Option<&str>,
        body: Option<&serde_json::Value>,
    ) -> std::result::Result<T, VaultCallError> {
        let url = format!("{}/v1/{}", self.address, path.trim_start_matches('/'));

        let mut request = self.http.request(method, &url);
        if let Some(token) = token {
            request = request.header("X-Vault-Token", token);
        }
        if let Some(namespace) = &self.namespace {
            request = request.header("X-Vault-Namespace", namespace);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(VaultCallError::Transport)?;
        let status = response.status();

        if !status.is_success() {
            let errors = response
                .json::<ErrorBody>()
                .await
                .map(|b| b.errors)
                .unwrap_or_default();
            return Err(VaultCallError::Status {
                status: status.as_u16(),
                errors,
            });
        }

        if status == StatusCode::NO_CONTENT {
            return serde_json::from_value(serde_json::Value::Null)
                .map_err(|e| VaultCallError::Decode(e.to_string()));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| VaultCallError::Decode(e.to_string()))
    }
}
