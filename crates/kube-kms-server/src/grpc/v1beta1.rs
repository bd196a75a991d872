//! Legacy `v1beta1.KeyManagementService`.
//!
//! v1beta1 carries neither key ids nor annotations, so ciphertexts handed to
//! the API server are a `kubekms.Envelope` wrapping the backend ciphertext
//! with the metadata needed to decrypt it later.

use std::sync::Arc;
use std::time::Instant;

use prost::Message;
use tonic::{Request, Response, Status};

use kube_kms_core::KmsError;
use kube_kms_core::types;

use super::proto::kubekms::Envelope;
use super::proto::v1beta1::key_management_service_server::{
    KeyManagementService, KeyManagementServiceServer,
};
use super::proto::v1beta1::{
    DecryptRequest, DecryptResponse, EncryptRequest, EncryptResponse, VersionRequest,
    VersionResponse,
};
use super::{from_wire, observe, request_deadline, to_status, to_wire};
use crate::handler::KmsHandler;

pub const API_VERSION: &str = "v1beta1";

#[derive(Clone)]
pub struct KmsServiceV1beta1 {
    handler: Arc<KmsHandler>,
}

impl KmsServiceV1beta1 {
    pub fn new(handler: Arc<KmsHandler>) -> Self {
        Self { handler }
    }

    pub fn into_server(self) -> KeyManagementServiceServer<Self> {
        KeyManagementServiceServer::new(self)
    }
}

/// Encrypt and Decrypt tolerate an empty version; Version does not.
fn check_version(version: &str, allow_empty: bool) -> Result<(), Status> {
    if version == API_VERSION || (allow_empty && version.is_empty()) {
        return Ok(());
    }
    Err(to_status(&KmsError::InvalidRequest(format!(
        "unsupported KMS API version '{version}', expected {API_VERSION}"
    ))))
}

#[tonic::async_trait]
impl KeyManagementService for KmsServiceV1beta1 {
    async fn version(
        &self,
        request: Request<VersionRequest>,
    ) -> Result<Response<VersionResponse>, Status> {
        let started = Instant::now();
        let result = check_version(&request.get_ref().version, false).map(|_| {
            let info = self.handler.version();
            Response::new(VersionResponse {
                version: API_VERSION.to_string(),
                runtime_name: info.runtime_name,
                runtime_version: info.runtime_version,
            })
        });
        observe("Version", started, &result);
        result
    }

    async fn decrypt(
        &self,
        request: Request<DecryptRequest>,
    ) -> Result<Response<DecryptResponse>, Status> {
        let started = Instant::now();
        let deadline = request_deadline(&request);
        let request = request.into_inner();

        let result: Result<Response<DecryptResponse>, Status> = async {
            check_version(&request.version, true)?;
            let envelope = Envelope::decode(request.cipher.as_slice()).map_err(|e| {
                to_status(&KmsError::InvalidRequest(format!(
                    "ciphertext is not a kube-kms envelope: {e}"
                )))
            })?;

            let plain = self
                .handler
                .decrypt(
                    types::DecryptRequest {
                        uid: String::new(),
                        ciphertext: envelope.ciphertext,
                        key_id: envelope.key_id,
                        annotations: from_wire(envelope.annotations),
                    },
                    deadline,
                )
                .await
                .map_err(|e| to_status(&e))?;
            Ok(Response::new(DecryptResponse { plain }))
        }
        .await;
        observe("Decrypt", started, &result);
        result
    }

    async fn encrypt(
        &self,
        request: Request<EncryptRequest>,
    ) -> Result<Response<EncryptResponse>, Status> {
        let started = Instant::now();
        let deadline = request_deadline(&request);
        let request = request.into_inner();

        let result: Result<Response<EncryptResponse>, Status> = async {
            check_version(&request.version, true)?;
            let sealed = self
                .handler
                .encrypt(
                    types::EncryptRequest {
                        uid: String::new(),
                        plaintext: request.plain,
                    },
                    deadline,
                )
                .await
                .map_err(|e| to_status(&e))?;

            let envelope = Envelope {
                key_id: sealed.key_id.to_string(),
                annotations: to_wire(sealed.annotations),
                ciphertext: sealed.ciphertext,
            };
            Ok(Response::new(EncryptResponse {
                cipher: envelope.encode_to_vec(),
            }))
        }
        .await;
        observe("Encrypt", started, &result);
        result
    }
}
