//! Serving state machine and the background backend prober.
//!
//! ```text
//! Starting --probe ok--> Ready <--probe--> Degraded
//!     \--probe failed--> Degraded
//! any --shutdown--> Terminating
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use kube_kms_core::Result;

use crate::handler::KmsHandler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServingState {
    Starting,
    Ready,
    Degraded,
    Terminating,
}

impl fmt::Display for ServingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServingState::Starting => "starting",
            ServingState::Ready => "ready",
            ServingState::Degraded => "degraded",
            ServingState::Terminating => "terminating",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub state: ServingState,
    pub last_probe: Option<Instant>,
    pub last_error: Option<String>,
}

pub struct Lifecycle {
    tx: watch::Sender<Snapshot>,
    created: Instant,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Snapshot {
            state: ServingState::Starting,
            last_probe: None,
            last_error: None,
        });
        Self {
            tx,
            created: Instant::now(),
        }
    }

    pub fn state(&self) -> ServingState {
        self.tx.borrow().state
    }

    pub fn snapshot(&self) -> Snapshot {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.tx.subscribe()
    }

    /// Feed a probe outcome into the state machine.
    pub fn record_probe(&self, result: &Result<u64>) {
        let now = Instant::now();
        self.tx.send_modify(|snapshot| {
            snapshot.last_probe = Some(now);
            if snapshot.state == ServingState::Terminating {
                return;
            }

            let next = match result {
                Ok(_) => {
                    snapshot.last_error = None;
                    ServingState::Ready
                }
                Err(e) => {
                    snapshot.last_error = Some(e.to_string());
                    ServingState::Degraded
                }
            };
            if next != snapshot.state {
                match result {
                    Ok(version) => tracing::info!(from = %snapshot.state, to = %next, key_version = *version, "Serving state changed"),
                    Err(e) => tracing::warn!(from = %snapshot.state, to = %next, error = %e, "Serving state changed"),
                }
                snapshot.state = next;
            }
        });

        #[cfg(feature = "metrics")]
        crate::metrics::record_probe(result);
    }

    /// Enter `Terminating`. Returns false if shutdown had already begun.
    pub fn begin_shutdown(&self) -> bool {
        self.tx.send_if_modified(|snapshot| {
            if snapshot.state == ServingState::Terminating {
                return false;
            }
            tracing::info!(from = %snapshot.state, "Shutting down");
            snapshot.state = ServingState::Terminating;
            true
        })
    }

    /// Resolves once shutdown has begun.
    pub async fn terminated(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx
            .wait_for(|snapshot| snapshot.state == ServingState::Terminating)
            .await;
    }

    /// True while the prober has reported within `stale_after`.
    pub fn is_live(&self, stale_after: Duration) -> bool {
        let reference = self.tx.borrow().last_probe.unwrap_or(self.created);
        reference.elapsed() <= stale_after
    }
}

/// Liveness threshold: three missed probes plus one call timeout.
pub fn stale_after(probe_interval: Duration, call_timeout: Duration) -> Duration {
    probe_interval * 3 + call_timeout
}

/// Probe the backend every `interval` until shutdown.
pub fn spawn_prober(
    handler: Arc<KmsHandler>,
    lifecycle: Arc<Lifecycle>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = lifecycle.terminated() => break,
                _ = ticker.tick() => {
                    let result = handler.probe().await;
                    lifecycle.record_probe(&result);
                }
            }
        }
        tracing::debug!("Backend prober stopped");
    })
}
