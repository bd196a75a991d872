//! Vault auth session with single-flight renewal.
//!
//! The session owns the current token. Callers ask for a token with
//! [`VaultSession::token`]; when the cached token is past its refresh point,
//! one login runs as a task owned by the session and every caller waits on
//! its result. A caller that gives up only stops waiting; the login keeps
//! running and its token is cached for the next caller. A background task
//! renews ahead of expiry through the same path.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use zeroize::Zeroizing;

use kube_kms_core::{KmsError, Result};

const RETRY_MIN: Duration = Duration::from_secs(1);
const RETRY_MAX: Duration = Duration::from_secs(30);

/// Token returned by an auth method.
pub struct LoginToken {
    pub secret: Zeroizing<String>,
    /// `None` for tokens that never expire.
    pub lease: Option<Duration>,
}

/// One way of obtaining a Vault token.
#[async_trait]
pub trait Authenticator: Send + Sync {
    fn method(&self) -> &'static str;

    async fn login(&self) -> Result<LoginToken>;
}

/// A token held by the session.
pub struct SessionToken {
    secret: Zeroizing<String>,
    generation: u64,
    refresh_at: Option<Instant>,
}

impl SessionToken {
    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// Increments on every successful login.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn is_fresh(&self, now: Instant) -> bool {
        self.refresh_at.is_none_or(|at| now < at)
    }
}

impl std::fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionToken")
            .field("secret", &"[REDACTED]")
            .field("generation", &self.generation)
            .field("refresh_at", &self.refresh_at)
            .finish()
    }
}

/// Result of one login, shared by every caller waiting on it.
type LoginOutcome = std::result::Result<Arc<SessionToken>, Arc<KmsError>>;

/// `None` while the login is still running.
type LoginWatch = watch::Receiver<Option<LoginOutcome>>;

/// State the login task needs after the caller that started it is gone.
struct SessionState {
    authenticator: Arc<dyn Authenticator>,
    current: RwLock<Option<Arc<SessionToken>>>,
    generation: AtomicU64,
    refresh_margin: Duration,
}

pub struct VaultSession {
    state: Arc<SessionState>,
    inflight: Mutex<Option<LoginWatch>>,
}

impl VaultSession {
    pub fn new(authenticator: Arc<dyn Authenticator>, refresh_margin: Duration) -> Self {
        Self {
            state: Arc::new(SessionState {
                authenticator,
                current: RwLock::new(None),
                generation: AtomicU64::new(0),
                refresh_margin,
            }),
            inflight: Mutex::new(None),
        }
    }

    /// Number of logins performed so far.
    pub fn logins(&self) -> u64 {
        self.state.generation.load(Ordering::SeqCst)
    }

    /// A valid token, logging in at most once across concurrent callers.
    pub async fn token(&self) -> Result<Arc<SessionToken>> {
        if let Some(token) = self.state.fresh().await {
            return Ok(token);
        }

        let mut login = {
            let mut inflight = self.inflight.lock().await;
            // Another caller may have finished a login while we waited.
            if let Some(token) = self.state.fresh().await {
                return Ok(token);
            }
            match inflight.as_ref().filter(|rx| is_running(rx)) {
                Some(rx) => rx.clone(),
                None => {
                    let rx = self.start_login();
                    *inflight = Some(rx.clone());
                    rx
                }
            }
        };

        let outcome = login
            .wait_for(Option::is_some)
            .await
            .map_err(|_| KmsError::BackendUnavailable("vault login task stopped".to_string()))?
            .clone();
        match outcome {
            Some(Ok(token)) => Ok(token),
            Some(Err(e)) => Err(shared_error(&e)),
            None => Err(KmsError::BackendUnavailable(
                "vault login task stopped".to_string(),
            )),
        }
    }

    /// Drop the token of `generation` if it is still the cached one.
    ///
    /// Called after Vault refused the token; the next [`VaultSession::token`]
    /// logs in again.
    pub async fn invalidate(&self, generation: u64) {
        let mut current = self.state.current.write().await;
        if current.as_ref().is_some_and(|t| t.generation == generation) {
            tracing::warn!(generation, "Vault token refused, invalidating session");
            *current = None;
        }
    }

    /// Start the background task that renews the token before it expires.
    pub fn spawn_renewal(self: &Arc<Self>) -> JoinHandle<()> {
        let session = Arc::clone(self);
        tokio::spawn(async move { session.renewal_loop().await })
    }

    async fn renewal_loop(&self) {
        let mut backoff = RETRY_MIN;
        loop {
            let token = match self.token().await {
                Ok(token) => {
                    backoff = RETRY_MIN;
                    token
                }
                Err(e) => {
                    tracing::warn!(error = %e, retry_in = ?backoff, "Vault token renewal failed");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(RETRY_MAX);
                    continue;
                }
            };

            let Some(refresh_at) = token.refresh_at else {
                tracing::debug!("Vault token has no lease, renewal task exiting");
                return;
            };
            tokio::time::sleep_until(refresh_at).await;
        }
    }

    fn start_login(&self) -> LoginWatch {
        let (tx, rx) = watch::channel(None);
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let outcome = state.login().await.map_err(Arc::new);
            tx.send_replace(Some(outcome));
        });
        rx
    }
}

impl SessionState {
    async fn fresh(&self) -> Option<Arc<SessionToken>> {
        let current = self.current.read().await;
        current
            .as_ref()
            .filter(|t| t.is_fresh(Instant::now()))
            .cloned()
    }

    async fn login(&self) -> Result<Arc<SessionToken>> {
        let login = self.authenticator.login().await?;
        let now = Instant::now();
        let refresh_at = login.lease.map(|lease| {
            // Short leases renew after two thirds of their lifetime.
            let margin = self.refresh_margin.min(lease / 3);
            now + lease - margin
        });

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let token = Arc::new(SessionToken {
            secret: login.secret,
            generation,
            refresh_at,
        });
        *self.current.write().await = Some(Arc::clone(&token));

        tracing::info!(
            method = self.authenticator.method(),
            generation,
            lease = ?login.lease,
            "Vault login succeeded"
        );
        Ok(token)
    }
}

/// A login that has neither finished nor lost its task.
fn is_running(rx: &LoginWatch) -> bool {
    rx.borrow().is_none() && rx.has_changed().is_ok()
}

/// Rebuild a login error for one of the callers sharing it.
fn shared_error(e: &KmsError) -> KmsError {
    match e {
        KmsError::ConfigInvalid(m) => KmsError::ConfigInvalid(m.clone()),
        KmsError::BackendUnavailable(m) => KmsError::BackendUnavailable(m.clone()),
        KmsError::BackendRejected(m) => KmsError::BackendRejected(m.clone()),
        KmsError::KeyNotFound(m) => KmsError::KeyNotFound(m.clone()),
        KmsError::DeadlineExceeded(d) => KmsError::DeadlineExceeded(*d),
        KmsError::InvalidRequest(m) => KmsError::InvalidRequest(m.clone()),
        other => KmsError::BackendUnavailable(format!("vault login: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingAuth {
        calls: AtomicUsize,
        delay: Duration,
        lease: Option<Duration>,
        fail: bool,
    }

    impl CountingAuth {
        fn new(delay: Duration, lease: Option<Duration>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay,
                lease,
                fail: false,
            })
        }
    }

    #[async_trait]
    impl Authenticator for CountingAuth {
        fn method(&self) -> &'static str {
            "test"
        }

        async fn login(&self) -> Result<LoginToken> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(KmsError::BackendUnavailable("vault down".into()));
            }
            Ok(LoginToken {
                secret: Zeroizing::new(format!("token-{n}")),
                lease: self.lease,
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_login() {
        let auth = CountingAuth::new(Duration::from_millis(200), Some(Duration::from_secs(3600)));
        let session = Arc::new(VaultSession::new(auth.clone(), Duration::from_secs(60)));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let session = Arc::clone(&session);
                tokio::spawn(async move { session.token().await.unwrap() })
            })
            .collect();

        let mut secrets = Vec::new();
        for handle in handles {
            secrets.push(handle.await.unwrap().secret().to_string());
        }

        assert_eq!(auth.calls.load(Ordering::SeqCst), 1);
        assert!(secrets.iter().all(|s| s == "token-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn caller_timing_out_does_not_restart_login() {
        let auth = CountingAuth::new(Duration::from_millis(200), Some(Duration::from_secs(3600)));
        let session = Arc::new(VaultSession::new(auth.clone(), Duration::from_secs(60)));

        let impatient = {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                tokio::time::timeout(Duration::from_millis(50), session.token()).await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let patient = {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                tokio::time::timeout(Duration::from_secs(3), session.token()).await
            })
        };

        assert!(impatient.await.unwrap().is_err());
        let token = patient.await.unwrap().unwrap().unwrap();
        assert_eq!(token.secret(), "token-1");
        assert_eq!(auth.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_login_still_caches_its_token() {
        let auth = CountingAuth::new(Duration::from_millis(200), None);
        let session = VaultSession::new(auth.clone(), Duration::from_secs(60));

        let abandoned = tokio::time::timeout(Duration::from_millis(50), session.token()).await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(300)).await;
        let token = session.token().await.unwrap();
        assert_eq!(token.secret(), "token-1");
        assert_eq!(auth.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_login_is_retried_by_next_caller() {
        let auth = Arc::new(CountingAuth {
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            lease: None,
            fail: true,
        });
        let session = VaultSession::new(auth.clone(), Duration::from_secs(60));
        assert!(session.token().await.is_err());
        assert!(session.token().await.is_err());
        assert_eq!(auth.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn token_is_renewed_near_expiry() {
        let auth = CountingAuth::new(Duration::ZERO, Some(Duration::from_secs(300)));
        let session = VaultSession::new(auth.clone(), Duration::from_secs(60));

        let first = session.token().await.unwrap();
        tokio::time::advance(Duration::from_secs(200)).await;
        assert_eq!(session.token().await.unwrap().generation(), first.generation());

        tokio::time::advance(Duration::from_secs(50)).await;
        let second = session.token().await.unwrap();
        assert_eq!(second.generation(), first.generation() + 1);
        assert_eq!(auth.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn tokens_without_lease_are_reused() {
        let auth = CountingAuth::new(Duration::ZERO, None);
        let session = VaultSession::new(auth.clone(), Duration::from_secs(60));
        for _ in 0..5 {
            session.token().await.unwrap();
        }
        assert_eq!(auth.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalidate_only_drops_matching_generation() {
        let auth = CountingAuth::new(Duration::ZERO, None);
        let session = VaultSession::new(auth.clone(), Duration::from_secs(60));

        let first = session.token().await.unwrap();
        session.invalidate(first.generation() + 5).await;
        assert_eq!(session.token().await.unwrap().generation(), first.generation());

        session.invalidate(first.generation()).await;
        let second = session.token().await.unwrap();
        assert_eq!(second.generation(), first.generation() + 1);
        assert_eq!(session.logins(), 2);
    }

    #[tokio::test]
    async fn login_failure_is_surfaced() {
        let auth = Arc::new(CountingAuth {
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            lease: None,
            fail: true,
        });
        let session = VaultSession::new(auth, Duration::from_secs(60));
        let err = session.token().await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test(start_paused = true)]
    async fn background_renewal_keeps_token_fresh() {
        let auth = CountingAuth::new(Duration::ZERO, Some(Duration::from_secs(90)));
        let session = Arc::new(VaultSession::new(auth.clone(), Duration::from_secs(30)));
        let task = session.spawn_renewal();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(auth.calls.load(Ordering::SeqCst), 1);

        // refresh point is 60s after each login
        tokio::time::sleep(Duration::from_secs(65)).await;
        assert_eq!(auth.calls.load(Ordering::SeqCst), 2);

        task.abort();
    }
}
