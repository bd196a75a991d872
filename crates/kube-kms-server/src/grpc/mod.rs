//! gRPC adapters for the Kubernetes KMS plugin APIs.

pub mod v1beta1;
pub mod v2;

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::time::Duration;

use kube_kms_core::{ErrorKind, KmsError};

/// Generated protocol types.
pub mod proto {
    pub mod v2 {
        tonic::include_proto!("v2");
    }

    pub mod v1beta1 {
        tonic::include_proto!("v1beta1");
    }

    pub mod kubekms {
        tonic::include_proto!("kubekms");
    }
}

pub use v1beta1::KmsServiceV1beta1;
pub use v2::KmsServiceV2;

/// Translate a [`KmsError`] into the gRPC status returned to the API server.
pub fn to_status(err: &KmsError) -> tonic::Status {
    let code = match err.kind() {
        ErrorKind::ConfigInvalid => tonic::Code::FailedPrecondition,
        ErrorKind::BackendUnavailable => tonic::Code::Unavailable,
        ErrorKind::BackendRejected => tonic::Code::PermissionDenied,
        ErrorKind::KeyNotFound => tonic::Code::NotFound,
        ErrorKind::DeadlineExceeded => tonic::Code::DeadlineExceeded,
        ErrorKind::InvalidRequest => tonic::Code::InvalidArgument,
        ErrorKind::Internal => tonic::Code::Internal,
    };
    tonic::Status::new(code, err.to_string())
}

/// Deadline the caller attached through the `grpc-timeout` header.
pub fn request_deadline<T>(request: &tonic::Request<T>) -> Option<Duration> {
    request
        .metadata()
        .get("grpc-timeout")
        .and_then(|value| value.to_str().ok())
        .and_then(parse_grpc_timeout)
}

/// Parse `TimeoutValue TimeoutUnit` as defined by the gRPC HTTP/2 protocol.
fn parse_grpc_timeout(raw: &str) -> Option<Duration> {
    if raw.len() < 2 || raw.len() > 9 {
        return None;
    }
    let (value, unit) = raw.split_at(raw.len() - 1);
    let value: u64 = value.parse().ok()?;
    let duration = match unit {
        "H" => Duration::from_secs(value.checked_mul(3600)?),
        "M" => Duration::from_secs(value.checked_mul(60)?),
        "S" => Duration::from_secs(value),
        "m" => Duration::from_millis(value),
        "u" => Duration::from_micros(value),
        "n" => Duration::from_nanos(value),
        _ => return None,
    };
    Some(duration)
}

pub(crate) fn from_wire(annotations: HashMap<String, Vec<u8>>) -> BTreeMap<String, Vec<u8>> {
    annotations.into_iter().collect()
}

pub(crate) fn to_wire(annotations: BTreeMap<String, Vec<u8>>) -> HashMap<String, Vec<u8>> {
    annotations.into_iter().collect()
}

/// Record the outcome of one RPC.
#[allow(unused_variables)]
pub(crate) fn observe<T>(
    method: &'static str,
    started: std::time::Instant,
    result: &Result<T, tonic::Status>,
) {
    #[cfg(feature = "metrics")]
    {
        let code = match result {
            Ok(_) => tonic::Code::Ok,
            Err(status) => status.code(),
        };
        crate::metrics::record_request(method, code, started.elapsed());
    }
}
