//! Prometheus metrics endpoint for kube-kms-plugin.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::LazyLock;
use std::time::Duration;

use kube_kms_core::Result;

/// Global metrics registry.
pub struct Metrics {
    pub registry: Registry,
    pub requests_total: IntCounterVec,
    pub request_duration: HistogramVec,
    pub backend_healthy: IntGauge,
    pub key_version: IntGauge,
}

pub static METRICS: LazyLock<Metrics> = LazyLock::new(|| {
    let registry = Registry::new();

    let requests_total = IntCounterVec::new(
        Opts::new("kube_kms_requests_total", "Total KMS RPCs by method and gRPC code"),
        &["method", "code"],
    )
    .unwrap();

    let request_duration = HistogramVec::new(
        HistogramOpts::new(
            "kube_kms_request_duration_seconds",
            "KMS RPC duration in seconds",
        )
        .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
        &["method"],
    )
    .unwrap();

    let backend_healthy = IntGauge::new(
        "kube_kms_backend_healthy",
        "1 when the last backend probe succeeded",
    )
    .unwrap();

    let key_version =
        IntGauge::new("kube_kms_key_version", "Highest backend key version observed").unwrap();

    registry.register(Box::new(requests_total.clone())).unwrap();
    registry
        .register(Box::new(request_duration.clone()))
        .unwrap();
    registry.register(Box::new(backend_healthy.clone())).unwrap();
    registry.register(Box::new(key_version.clone())).unwrap();

    Metrics {
        registry,
        requests_total,
        request_duration,
        backend_healthy,
        key_version,
    }
});

pub(crate) fn record_request(method: &str, code: tonic::Code, elapsed: Duration) {
    METRICS
        .requests_total
        .with_label_values(&[method, &format!("{code:?}")])
        .inc();
    METRICS
        .request_duration
        .with_label_values(&[method])
        .observe(elapsed.as_secs_f64());
}

pub(crate) fn record_probe(result: &Result<u64>) {
    match result {
        Ok(version) => {
            METRICS.backend_healthy.set(1);
            let version = i64::try_from(*version).unwrap_or(i64::MAX);
            if version > METRICS.key_version.get() {
                METRICS.key_version.set(version);
            }
        }
        Err(_) => METRICS.backend_healthy.set(0),
    }
}

fn render_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let metric_families = METRICS.registry.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!("Failed to encode metrics: {e}");
    }
    buffer
}

/// Serve the /metrics endpoint on a separate port.
pub async fn serve_metrics(addr: SocketAddr) {
    use http_body_util::Full;
    use hyper::service::service_fn;
    use hyper::{Request, Response};

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind metrics server on {addr}: {e}");
            return;
        }
    };
    tracing::info!("Metrics on http://{addr}/metrics");

    loop {
        let Ok((stream, _)) = listener.accept().await else {
            continue;
        };

        tokio::spawn(async move {
            let service = service_fn(|_req: Request<hyper::body::Incoming>| async {
                let mut response = Response::new(Full::new(bytes::Bytes::from(render_metrics())));
                response.headers_mut().insert(
                    hyper::header::CONTENT_TYPE,
                    hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
                );
                Ok::<_, hyper::Error>(response)
            });

            let io = hyper_util::rt::TokioIo::new(stream);
            let builder =
                hyper_util::server::conn::auto::Builder::new(hyper_util::rt::TokioExecutor::new());
            let _ = builder.serve_connection(io, service).await;
        });
    }
}
