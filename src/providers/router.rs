//! Inference router
//!
//! Walks the fallback chain for each generation request and owns the health
//! table of every configured backend.
//!
//! Policy:
//!
//! - Candidates are tried in configured priority order, with the request's
//!   preferred backend (if any) moved to the front. Recovery from a cooldown
//!   never reorders the chain.
//! - Unavailable and permanent failures count against the backend and move
//!   on to the next candidate. After `failure_threshold` consecutive
//!   failures the backend is skipped until `cooldown` has elapsed, then
//!   probed again on the next request.
//! - A rate-limited backend is parked until its retry-after deadline. When
//!   a later candidate exists the chain moves on immediately; on the last
//!   candidate the router waits in place, at most `max_rate_limit_retries`
//!   times.
//! - When every candidate fails the caller receives one aggregate error
//!   listing each backend's last failure.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::time::Instant;

use crate::config::InferenceConfig;
use crate::error::{BackendError, BackendFailure, PocketclawError, Result};
use crate::metrics::{record_backend_attempt, record_fallback};
use crate::providers::credentials::{ChainCredentials, CredentialProvider};
use crate::providers::{create_backend, Backend, FragmentStream, GenerationRequest, GenerationResult};

/// Tunables for fallback and retry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterSettings {
    /// Consecutive failures before a backend is skipped
    pub failure_threshold: u32,
    /// How long a skipped backend stays skipped
    pub cooldown: Duration,
    /// In-place retries after rate limiting on the last candidate
    pub max_rate_limit_retries: u32,
    /// First backoff step when no retry-after hint is given
    pub retry_base: Duration,
    /// Upper bound on any single rate-limit wait
    pub retry_max: Duration,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self::from(&InferenceConfig::default())
    }
}

impl From<&InferenceConfig> for RouterSettings {
    fn from(config: &InferenceConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            cooldown: Duration::from_secs(config.cooldown_secs),
            max_rate_limit_retries: config.max_rate_limit_retries,
            retry_base: Duration::from_millis(config.retry_base_ms),
            retry_max: Duration::from_millis(config.retry_max_ms),
        }
    }
}

impl RouterSettings {
    fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.retry_base.saturating_mul(factor).min(self.retry_max)
    }
}

/// Health bookkeeping for one backend
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendHealth {
    /// Failures since the last success (rate limits excluded)
    pub consecutive_failures: u32,
    /// Skipped until this instant after crossing the failure threshold
    pub unavailable_until: Option<Instant>,
    /// Parked until this instant after a rate-limit rejection
    pub retry_after: Option<Instant>,
}

impl BackendHealth {
    /// Whether the backend may be tried at `now`
    pub fn is_available(&self, now: Instant) -> bool {
        !self.is_cooling_down(now) && !self.is_parked(now)
    }

    fn is_cooling_down(&self, now: Instant) -> bool {
        self.unavailable_until.is_some_and(|until| until > now)
    }

    fn is_parked(&self, now: Instant) -> bool {
        self.retry_after.is_some_and(|until| until > now)
    }
}

/// Fallback-capable router over the configured backends
pub struct InferenceRouter {
    backends: Vec<Arc<dyn Backend>>,
    health: RwLock<HashMap<String, BackendHealth>>,
    settings: RouterSettings,
}

impl InferenceRouter {
    /// Create a router over `backends`, given in priority order
    ///
    /// # Errors
    ///
    /// Returns `PocketclawError::Config` if no backend is given or two
    /// backends share a name
    pub fn new(backends: Vec<Arc<dyn Backend>>, settings: RouterSettings) -> Result<Self> {
        if backends.is_empty() {
            return Err(PocketclawError::Config("no inference backends configured".into()).into());
        }
        let mut health = HashMap::new();
        for backend in &backends {
            if health
                .insert(backend.name().to_string(), BackendHealth::default())
                .is_some()
            {
                return Err(PocketclawError::Config(format!(
                    "duplicate inference backend '{}'",
                    backend.name()
                ))
                .into());
            }
        }
        Ok(Self {
            backends,
            health: RwLock::new(health),
            settings,
        })
    }

    /// Build the configured chain with credentials from the config and keyring
    pub fn from_config(config: &InferenceConfig) -> Result<Self> {
        let credentials: Arc<dyn CredentialProvider> = Arc::new(ChainCredentials::from_config(config));
        let mut backends = Vec::new();
        for name in config.chain() {
            let backend_config = config.backends.get(&name).ok_or_else(|| {
                PocketclawError::Config(format!("backend '{}' is not declared", name))
            })?;
            backends.push(create_backend(&name, backend_config, Arc::clone(&credentials))?);
        }
        tracing::info!(chain = ?config.chain(), "Inference router ready");
        Self::new(backends, RouterSettings::from(config))
    }

    /// Backend names in priority order
    pub fn backend_names(&self) -> Vec<String> {
        self.backends.iter().map(|b| b.name().to_string()).collect()
    }

    /// Health snapshot for one backend
    pub fn health(&self, name: &str) -> Option<BackendHealth> {
        self.health.read().ok()?.get(name).cloned()
    }

    fn candidates(&self, preference: Option<&str>) -> Vec<Arc<dyn Backend>> {
        let mut ordered: Vec<Arc<dyn Backend>> = self.backends.clone();
        if let Some(preferred) = preference {
            if let Some(pos) = ordered.iter().position(|b| b.name() == preferred) {
                let backend = ordered.remove(pos);
                ordered.insert(0, backend);
            } else {
                tracing::warn!(backend = preferred, "Preferred backend is not configured");
            }
        }
        ordered
    }

    fn eligible(&self, candidates: Vec<Arc<dyn Backend>>, now: Instant) -> Vec<Arc<dyn Backend>> {
        let Ok(health) = self.health.read() else {
            return candidates;
        };
        candidates
            .into_iter()
            .filter(|b| health.get(b.name()).map_or(true, |h| h.is_available(now)))
            .collect()
    }

    /// Earliest parked (not cooling down) candidate whose deadline is near
    fn earliest_parked(
        &self,
        candidates: &[Arc<dyn Backend>],
        now: Instant,
    ) -> Option<(Arc<dyn Backend>, Instant)> {
        let health = self.health.read().ok()?;
        candidates
            .iter()
            .filter_map(|b| {
                let h = health.get(b.name())?;
                if h.is_cooling_down(now) {
                    return None;
                }
                let until = h.retry_after.filter(|until| *until > now)?;
                (until - now <= self.settings.retry_max).then(|| (Arc::clone(b), until))
            })
            .min_by_key(|(_, until)| *until)
    }

    fn record_success(&self, name: &str) {
        if let Ok(mut health) = self.health.write() {
            if let Some(h) = health.get_mut(name) {
                if h.consecutive_failures > 0 || h.unavailable_until.is_some() {
                    tracing::info!(backend = name, "Backend recovered");
                }
                *h = BackendHealth::default();
            }
        }
    }

    fn record_failure(&self, name: &str, now: Instant) {
        if let Ok(mut health) = self.health.write() {
            if let Some(h) = health.get_mut(name) {
                h.consecutive_failures = h.consecutive_failures.saturating_add(1);
                if h.consecutive_failures >= self.settings.failure_threshold {
                    h.unavailable_until = Some(now + self.settings.cooldown);
                    tracing::warn!(
                        backend = name,
                        failures = h.consecutive_failures,
                        cooldown_secs = self.settings.cooldown.as_secs(),
                        "Backend marked unavailable"
                    );
                }
            }
        }
    }

    fn park(&self, name: &str, until: Instant) {
        if let Ok(mut health) = self.health.write() {
            if let Some(h) = health.get_mut(name) {
                h.retry_after = Some(until);
            }
        }
    }

    /// Walk the chain with `op` until one backend succeeds
    async fn route<T, F, Fut>(&self, preference: Option<&str>, op: F) -> Result<T>
    where
        F: Fn(Arc<dyn Backend>) -> Fut,
        Fut: Future<Output = std::result::Result<T, BackendError>>,
    {
        let candidates = self.candidates(preference);
        let mut eligible = self.eligible(candidates.clone(), Instant::now());

        if eligible.is_empty() {
            // Everything is skipped; a backend that is only rate limited for a
            // short while is still worth waiting for
            match self.earliest_parked(&candidates, Instant::now()) {
                Some((backend, until)) => {
                    tracing::info!(
                        backend = backend.name(),
                        delay_ms = until.saturating_duration_since(Instant::now()).as_millis() as u64,
                        "Waiting for rate-limited backend"
                    );
                    tokio::time::sleep_until(until).await;
                    eligible.push(backend);
                }
                None => {
                    tracing::warn!("No inference backend available");
                    return Err(PocketclawError::NoBackendAvailable.into());
                }
            }
        }

        let mut failures = Vec::new();
        let total = eligible.len();
        for (index, backend) in eligible.into_iter().enumerate() {
            let name = backend.name().to_string();
            let is_last = index + 1 == total;
            let mut retries = 0u32;

            let failure = loop {
                tracing::debug!(backend = %name, attempt = retries + 1, "Calling backend");
                match op(Arc::clone(&backend)).await {
                    Ok(value) => {
                        record_backend_attempt(&name, "success");
                        self.record_success(&name);
                        return Ok(value);
                    }
                    Err(BackendError::RateLimited { retry_after }) => {
                        record_backend_attempt(&name, "rate_limited");
                        let delay = retry_after
                            .unwrap_or_else(|| self.settings.backoff(retries))
                            .min(self.settings.retry_max);
                        let error = BackendError::RateLimited { retry_after };
                        if !is_last || retries >= self.settings.max_rate_limit_retries {
                            self.park(&name, Instant::now() + delay);
                            tracing::info!(
                                backend = %name,
                                delay_ms = delay.as_millis() as u64,
                                "Backend rate limited, parked"
                            );
                            break error;
                        }
                        retries += 1;
                        tracing::info!(
                            backend = %name,
                            attempt = retries,
                            delay_ms = delay.as_millis() as u64,
                            "Backend rate limited, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    Err(error) => {
                        let outcome = match error {
                            BackendError::Permanent(_) => "rejected",
                            _ => "unavailable",
                        };
                        record_backend_attempt(&name, outcome);
                        tracing::warn!(backend = %name, error = %error, "Backend failed");
                        self.record_failure(&name, Instant::now());
                        break error;
                    }
                }
            };

            failures.push(BackendFailure {
                backend: name.clone(),
                error: failure,
            });
            if !is_last {
                record_fallback(&name);
            }
        }

        Err(PocketclawError::InferenceExhausted(failures).into())
    }

    /// Obtain a complete result from the first backend that succeeds
    ///
    /// # Errors
    ///
    /// Returns `PocketclawError::InferenceExhausted` when every candidate
    /// failed and `PocketclawError::NoBackendAvailable` when none could be
    /// tried
    pub async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResult> {
        self.route(request.params.backend_preference.as_deref(), |backend| async move {
            backend.generate(request).await
        })
        .await
    }

    /// Obtain a fragment stream from the first backend that accepts the request
    ///
    /// Fallback only applies until a stream has been opened; a failure in
    /// the middle of a stream is yielded to the consumer.
    pub async fn stream(&self, request: &GenerationRequest) -> Result<FragmentStream> {
        self.route(request.params.backend_preference.as_deref(), |backend| async move {
            backend.stream(request).await
        })
        .await
    }
}
