use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;

use kube_kms_backends::create_backend;
use kube_kms_core::config::{PluginConfig, socket_path};
use kube_kms_server::health::{HealthState, serve_health};
use kube_kms_server::lifecycle::{spawn_prober, stale_after};
use kube_kms_server::socket::{bind_unix, serve};
use kube_kms_server::{HandlerOptions, KmsHandler, Lifecycle};

/// Command-line values that take precedence over the config file.
#[derive(Debug, Default)]
pub struct Overrides {
    pub endpoint: Option<String>,
    pub health_addr: Option<String>,
}

fn apply(config: &mut PluginConfig, overrides: Overrides) -> Result<()> {
    if let Some(endpoint) = overrides.endpoint {
        socket_path(&endpoint)?;
        config.plugin.endpoint = Some(endpoint);
    }
    if let Some(health_addr) = overrides.health_addr {
        config.plugin.health_addr = health_addr;
    }
    Ok(())
}

pub async fn run(mut config: PluginConfig, overrides: Overrides) -> Result<()> {
    apply(&mut config, overrides)?;
    let settings = config.plugin.clone();
    let hash = config.config_hash()?;
    let endpoint = config.endpoint()?;
    let health_addr: SocketAddr = settings
        .health_addr
        .parse()
        .with_context(|| format!("invalid health_addr '{}'", settings.health_addr))?;

    tracing::info!(
        provider = %config.key.provider,
        config_hash = %hash,
        version = env!("CARGO_PKG_VERSION"),
        "Starting kube-kms-plugin"
    );

    let backend = create_backend(&config).await?;
    let renewal = backend.session.as_ref().map(|session| session.spawn_renewal());

    let handler = Arc::new(KmsHandler::new(
        backend.backend,
        hash,
        HandlerOptions::from_settings(&settings),
    ));
    let lifecycle = Arc::new(Lifecycle::new());

    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;

    let (listener, guard) = bind_unix(&endpoint)?;

    let first_probe = handler.probe().await;
    if let Err(e) = &first_probe {
        if settings.require_backend_at_startup {
            anyhow::bail!("backend unreachable at startup: {e}");
        }
        tracing::warn!(error = %e, "Backend unreachable at startup, serving degraded");
    }
    lifecycle.record_probe(&first_probe);

    let prober = spawn_prober(
        Arc::clone(&handler),
        Arc::clone(&lifecycle),
        settings.probe_interval(),
    );

    let health_state = HealthState {
        lifecycle: Arc::clone(&lifecycle),
        handler: Arc::clone(&handler),
        stale_after: stale_after(settings.probe_interval(), settings.call_timeout()),
    };
    tokio::spawn(async move {
        if let Err(e) = serve_health(health_addr, health_state).await {
            tracing::error!("Health server error: {e}");
        }
    });

    #[cfg(feature = "metrics")]
    if let Some(ref metrics_addr) = settings.metrics_addr {
        let addr: SocketAddr = metrics_addr
            .parse()
            .with_context(|| format!("invalid metrics_addr '{metrics_addr}'"))?;
        tracing::info!("Starting metrics server on {addr}");
        tokio::spawn(kube_kms_server::metrics::serve_metrics(addr));
    }

    {
        let lifecycle = Arc::clone(&lifecycle);
        tokio::spawn(async move {
            tokio::select! {
                result = signal::ctrl_c() => match result {
                    Ok(()) => tracing::info!("Received Ctrl+C signal"),
                    Err(e) => tracing::error!("Ctrl+C handler failed: {e}"),
                },
                _ = sigterm.recv() => tracing::info!("Received SIGTERM signal"),
                _ = lifecycle.terminated() => return,
            }
            lifecycle.begin_shutdown();
        });
    }

    let shutdown = {
        let lifecycle = Arc::clone(&lifecycle);
        async move { lifecycle.terminated().await }
    };
    let result = serve(listener, handler, shutdown).await;

    // The server may also exit on a transport error; stop everything else too.
    lifecycle.begin_shutdown();
    if let Err(e) = prober.await {
        tracing::warn!("Prober task failed: {e}");
    }
    if let Some(renewal) = renewal {
        renewal.abort();
    }
    drop(guard);

    tracing::info!("kube-kms-plugin stopped");
    result
}
