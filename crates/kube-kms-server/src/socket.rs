//! gRPC over a unix domain socket.

use std::future::Future;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;

use kube_kms_core::config::socket_path;
use kube_kms_core::{KmsError, Result};

use crate::grpc::{KmsServiceV1beta1, KmsServiceV2};
use crate::handler::KmsHandler;

/// Removes the socket file when dropped.
#[derive(Debug)]
pub struct SocketGuard {
    path: PathBuf,
}

impl SocketGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SocketGuard {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::info!(path = %self.path.display(), "Removed socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove socket"),
        }
    }
}

/// Bind the socket for `endpoint`, replacing a stale socket file.
///
/// A non-socket file at the path is left alone and reported as a
/// configuration error.
pub fn bind_unix(endpoint: &str) -> Result<(UnixListener, SocketGuard)> {
    let path = socket_path(endpoint)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    match std::fs::symlink_metadata(&path) {
        Ok(meta) if meta.file_type().is_socket() => {
            tracing::info!(path = %path.display(), "Removing stale socket");
            std::fs::remove_file(&path)?;
        }
        Ok(_) => {
            return Err(KmsError::ConfigInvalid(format!(
                "{} exists and is not a socket",
                path.display()
            )));
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let listener = UnixListener::bind(&path)?;
    tracing::info!(endpoint, "Listening for KMS requests");
    Ok((listener, SocketGuard { path }))
}

/// Serve both KMS API versions until `shutdown` resolves, then drain.
pub async fn serve(
    listener: UnixListener,
    handler: Arc<KmsHandler>,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    let incoming = UnixListenerStream::new(listener);

    Server::builder()
        .add_service(KmsServiceV2::new(Arc::clone(&handler)).into_server())
        .add_service(KmsServiceV1beta1::new(handler).into_server())
        .serve_with_incoming_shutdown(incoming, shutdown)
        .await?;

    tracing::info!("KMS socket drained");
    Ok(())
}
