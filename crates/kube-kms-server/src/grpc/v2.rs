use std::sync::Arc;
use std::time::Instant;

use tonic::{Request, Response, Status};

use kube_kms_core::types;

use super::proto::v2::key_management_service_server::{
    KeyManagementService, KeyManagementServiceServer,
};
use super::proto::v2::{
    DecryptRequest, DecryptResponse, EncryptRequest, EncryptResponse, StatusRequest,
    StatusResponse,
};
use super::{from_wire, observe, request_deadline, to_status, to_wire};
use crate::handler::{KmsHandler, PROTOCOL_VERSION};

/// `v2.KeyManagementService`.
#[derive(Clone)]
pub struct KmsServiceV2 {
    handler: Arc<KmsHandler>,
}

impl KmsServiceV2 {
    pub fn new(handler: Arc<KmsHandler>) -> Self {
        Self { handler }
    }

    pub fn into_server(self) -> KeyManagementServiceServer<Self> {
        KeyManagementServiceServer::new(self)
    }
}

#[tonic::async_trait]
impl KeyManagementService for KmsServiceV2 {
    async fn status(
        &self,
        request: Request<StatusRequest>,
    ) -> Result<Response<StatusResponse>, Status> {
        let started = Instant::now();
        let snapshot = self.handler.status(request_deadline(&request)).await;
        let healthz = if snapshot.healthy {
            "ok".to_string()
        } else {
            snapshot.message
        };

        let result = Ok(Response::new(StatusResponse {
            version: PROTOCOL_VERSION.to_string(),
            healthz,
            key_id: snapshot.key_id.to_string(),
        }));
        observe("Status", started, &result);
        result
    }

    async fn decrypt(
        &self,
        request: Request<DecryptRequest>,
    ) -> Result<Response<DecryptResponse>, Status> {
        let started = Instant::now();
        let deadline = request_deadline(&request);
        let request = request.into_inner();

        let result = self
            .handler
            .decrypt(
                types::DecryptRequest {
                    uid: request.uid,
                    ciphertext: request.ciphertext,
                    key_id: request.key_id,
                    annotations: from_wire(request.annotations),
                },
                deadline,
            )
            .await
            .map(|plaintext| Response::new(DecryptResponse { plaintext }))
            .map_err(|e| to_status(&e));
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

        let result = self
            .handler
            .encrypt(
                types::EncryptRequest {
                    uid: request.uid,
                    plaintext: request.plaintext,
                },
                deadline,
            )
            .await
            .map(|sealed| {
                Response::new(EncryptResponse {
                    ciphertext: sealed.ciphertext,
                    key_id: sealed.key_id.to_string(),
                    annotations: to_wire(sealed.annotations),
                })
            })
            .map_err(|e| to_status(&e));
        observe("Encrypt", started, &result);
        result
    }
}
