//! End-to-end tests: a real tonic client talking to the plugin over a unix socket.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hyper_util::rt::TokioIo;
use tempfile::TempDir;
use tokio::net::UnixStream;
use tokio::task::JoinHandle;
use tonic::Code;
use tonic::transport::{Channel, Endpoint, Uri};

use kube_kms_backends::{KmsBackend, LocalBackend};
use kube_kms_core::types::{Annotations, KeyConfig, ProviderKind, Sealed};
use kube_kms_core::{ConfigHash, Result};
use kube_kms_server::grpc::proto::{v1beta1, v2};
use kube_kms_server::socket::{SocketGuard, bind_unix, serve};
use kube_kms_server::{HandlerOptions, KmsHandler, Lifecycle};

use v1beta1::key_management_service_client::KeyManagementServiceClient as V1beta1Client;
use v2::key_management_service_client::KeyManagementServiceClient as V2Client;

struct Harness {
    _tmp: TempDir,
    path: PathBuf,
    lifecycle: Arc<Lifecycle>,
    server: JoinHandle<anyhow::Result<()>>,
    guard: Option<SocketGuard>,
}

impl Harness {
    async fn start(backend: Arc<dyn KmsBackend>, call_timeout: Duration) -> Self {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("kms/socket.sock");
        let endpoint = format!("unix://{}", path.display());

        let handler = Arc::new(KmsHandler::new(
            backend,
            ConfigHash::of(&KeyConfig::local(None)).unwrap(),
            HandlerOptions {
                call_timeout,
                status_retries: 1,
                status_backoff: Duration::from_millis(10),
            },
        ));
        let lifecycle = Arc::new(Lifecycle::new());
        let (listener, guard) = bind_unix(&endpoint).unwrap();

        let server = {
            let lifecycle = Arc::clone(&lifecycle);
            tokio::spawn(serve(listener, handler, async move {
                lifecycle.terminated().await
            }))
        };

        Self {
            _tmp: tmp,
            path,
            lifecycle,
            server,
            guard: Some(guard),
        }
    }

    async fn channel(&self) -> Channel {
        connect(&self.path).await
    }

    async fn shutdown(mut self) {
        self.lifecycle.begin_shutdown();
        tokio::time::timeout(Duration::from_secs(5), &mut self.server)
            .await
            .expect("server did not drain")
            .unwrap()
            .unwrap();
        self.guard.take();
        assert!(!self.path.exists(), "socket file left behind");
    }
}

async fn connect(path: &Path) -> Channel {
    let path = path.to_path_buf();
    Endpoint::try_from("http://[::]:50051")
        .unwrap()
        .connect_with_connector(tower::service_fn(move |_: Uri| {
            let path = path.clone();
            async move { Ok::<_, std::io::Error>(TokioIo::new(UnixStream::connect(path).await?)) }
        }))
        .await
        .unwrap()
}

/// Backend that never answers.
struct Hanging;

#[async_trait]
impl KmsBackend for Hanging {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    async fn encrypt(&self, _plaintext: &[u8]) -> Result<Sealed> {
        std::future::pending().await
    }

    async fn decrypt(&self, _: &[u8], _: Option<u64>, _: &Annotations) -> Result<Vec<u8>> {
        std::future::pending().await
    }

    async fn key_version(&self) -> Result<u64> {
        std::future::pending().await
    }
}

/// Local keyring that takes `delay` to encrypt.
struct Slow {
    inner: LocalBackend,
    delay: Duration,
}

#[async_trait]
impl KmsBackend for Slow {
    fn kind(&self) -> ProviderKind {
        self.inner.kind()
    }

    async fn encrypt(&self, plaintext: &[u8]) -> Result<Sealed> {
        tokio::time::sleep(self.delay).await;
        self.inner.encrypt(plaintext).await
    }

    async fn decrypt(
        &self,
        ciphertext: &[u8],
        key_version: Option<u64>,
        annotations: &Annotations,
    ) -> Result<Vec<u8>> {
        self.inner.decrypt(ciphertext, key_version, annotations).await
    }

    async fn key_version(&self) -> Result<u64> {
        self.inner.key_version().await
    }
}

#[tokio::test]
async fn v2_status_encrypt_decrypt() {
    let harness = Harness::start(Arc::new(LocalBackend::in_memory()), Duration::from_secs(3)).await;
    let mut client = V2Client::new(harness.channel().await);

    let status = client
        .status(v2::StatusRequest {})
        .await
        .unwrap()
        .into_inner();
    assert_eq!(status.version, "v2");
    assert_eq!(status.healthz, "ok");
    assert!(status.key_id.ends_with("-v1"));

    let encrypted = client
        .encrypt(v2::EncryptRequest {
            plaintext: b"top secret".to_vec(),
            uid: "e2e-1".into(),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(encrypted.key_id, status.key_id);
    assert_ne!(encrypted.ciphertext, b"top secret");
    assert!(encrypted.annotations.contains_key("key-version.kube-kms.io"));

    let decrypted = client
        .decrypt(v2::DecryptRequest {
            ciphertext: encrypted.ciphertext,
            uid: "e2e-2".into(),
            key_id: encrypted.key_id,
            annotations: encrypted.annotations,
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(decrypted.plaintext, b"top secret");

    harness.shutdown().await;
}

#[tokio::test]
async fn v2_errors_carry_grpc_codes() {
    let harness = Harness::start(Arc::new(LocalBackend::in_memory()), Duration::from_secs(3)).await;
    let mut client = V2Client::new(harness.channel().await);

    let err = client
        .encrypt(v2::EncryptRequest {
            plaintext: Vec::new(),
            uid: String::new(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    let encrypted = client
        .encrypt(v2::EncryptRequest {
            plaintext: b"x".to_vec(),
            uid: String::new(),
        })
        .await
        .unwrap()
        .into_inner();
    let err = client
        .decrypt(v2::DecryptRequest {
            ciphertext: encrypted.ciphertext,
            uid: String::new(),
            key_id: "ffffffffffffffff-v1".into(),
            annotations: encrypted.annotations,
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);

    harness.shutdown().await;
}

#[tokio::test]
async fn hung_backend_returns_deadline_exceeded() {
    let harness = Harness::start(Arc::new(Hanging), Duration::from_millis(150)).await;
    let mut client = V2Client::new(harness.channel().await);

    let started = std::time::Instant::now();
    let err = client
        .encrypt(v2::EncryptRequest {
            plaintext: b"x".to_vec(),
            uid: String::new(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::DeadlineExceeded);
    assert!(started.elapsed() < Duration::from_secs(2));

    // Status still answers, reporting the failure in healthz.
    let status = client
        .status(v2::StatusRequest {})
        .await
        .unwrap()
        .into_inner();
    assert_ne!(status.healthz, "ok");
    assert!(status.key_id.ends_with("-v0"));

    harness.shutdown().await;
}

#[tokio::test]
async fn v1beta1_version_and_envelope_round_trip() {
    let harness = Harness::start(Arc::new(LocalBackend::in_memory()), Duration::from_secs(3)).await;
    let mut client = V1beta1Client::new(harness.channel().await);

    let version = client
        .version(v1beta1::VersionRequest {
            version: "v1beta1".into(),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(version.version, "v1beta1");
    assert_eq!(version.runtime_name, "kube-kms-plugin");

    let err = client
        .version(v1beta1::VersionRequest {
            version: "v1".into(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    let encrypted = client
        .encrypt(v1beta1::EncryptRequest {
            version: "v1beta1".into(),
            plain: b"legacy".to_vec(),
        })
        .await
        .unwrap()
        .into_inner();
    let decrypted = client
        .decrypt(v1beta1::DecryptRequest {
            version: "v1beta1".into(),
            cipher: encrypted.cipher,
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(decrypted.plain, b"legacy");

    let err = client
        .decrypt(v1beta1::DecryptRequest {
            version: "v1beta1".into(),
            cipher: vec![0xff, 0xff, 0xff],
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    harness.shutdown().await;
}

#[tokio::test]
async fn concurrent_requests_are_served() {
    let harness = Harness::start(Arc::new(LocalBackend::in_memory()), Duration::from_secs(3)).await;
    let channel = harness.channel().await;

    let tasks: Vec<_> = (0..16)
        .map(|i| {
            let mut client = V2Client::new(channel.clone());
            tokio::spawn(async move {
                let plaintext = format!("payload-{i}").into_bytes();
                let encrypted = client
                    .encrypt(v2::EncryptRequest {
                        plaintext: plaintext.clone(),
                        uid: format!("req-{i}"),
                    })
                    .await
                    .unwrap()
                    .into_inner();
                let decrypted = client
                    .decrypt(v2::DecryptRequest {
                        ciphertext: encrypted.ciphertext,
                        uid: format!("req-{i}"),
                        key_id: encrypted.key_id,
                        annotations: encrypted.annotations,
                    })
                    .await
                    .unwrap()
                    .into_inner();
                assert_eq!(decrypted.plaintext, plaintext);
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    harness.shutdown().await;
}

#[tokio::test]
async fn shutdown_drains_in_flight_calls() {
    let backend = Slow {
        inner: LocalBackend::in_memory(),
        delay: Duration::from_millis(300),
    };
    let harness = Harness::start(Arc::new(backend), Duration::from_secs(3)).await;
    let mut client = V2Client::new(harness.channel().await);

    let in_flight = tokio::spawn(async move {
        client
            .encrypt(v2::EncryptRequest {
                plaintext: b"draining".to_vec(),
                uid: "drain-1".into(),
            })
            .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(harness.lifecycle.begin_shutdown());
    tokio::time::sleep(Duration::from_millis(10)).await;

    // A connection opened mid-drain is never served.
    let late = tokio::time::timeout(Duration::from_millis(150), async {
        let path = harness.path.clone();
        let channel = Endpoint::try_from("http://[::]:50051")
            .map_err(|e| e.to_string())?
            .connect_with_connector(tower::service_fn(move |_: Uri| {
                let path = path.clone();
                async move {
                    Ok::<_, std::io::Error>(TokioIo::new(UnixStream::connect(path).await?))
                }
            }))
            .await
            .map_err(|e| e.to_string())?;
        V2Client::new(channel)
            .status(v2::StatusRequest {})
            .await
            .map_err(|e| e.to_string())
    })
    .await;
    assert!(!matches!(late, Ok(Ok(_))), "new connection served during drain");

    let response = in_flight.await.unwrap().unwrap().into_inner();
    assert!(response.key_id.ends_with("-v1"));
    assert!(!response.ciphertext.is_empty());

    harness.shutdown().await;
}
