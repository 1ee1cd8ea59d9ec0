//! Scheduled jobs
//!
//! A job is a piece of text that is injected into the canonical event
//! queue once its delay elapses, as if the originating user had sent it.
//! Each pending job owns one sleeping task; cancelling the job or shutting
//! down the scheduler aborts it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::ScheduleToolConfig;
use crate::error::{PocketclawError, Result};
use crate::transport::CanonicalEvent;

/// A pending job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledJob {
    /// Job identifier
    pub id: String,
    /// Surface the event is injected for
    pub surface_id: String,
    /// User the event is injected for
    pub user_id: String,
    /// Text of the injected event
    pub text: String,
    /// When the job fires
    pub due_at: DateTime<Utc>,
}

struct Inner {
    jobs: Mutex<BTreeMap<String, (ScheduledJob, CancellationToken)>>,
    inject: mpsc::Sender<CanonicalEvent>,
    shutdown: CancellationToken,
    max_jobs: usize,
    max_delay: Duration,
}

/// Owner of every pending job
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Create a scheduler injecting into `inject`
    pub fn new(
        config: &ScheduleToolConfig,
        inject: mpsc::Sender<CanonicalEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                jobs: Mutex::new(BTreeMap::new()),
                inject,
                shutdown,
                max_jobs: config.max_jobs,
                max_delay: Duration::from_secs(config.max_delay_secs),
            }),
        }
    }

    /// Longest accepted delay
    pub fn max_delay(&self) -> Duration {
        self.inner.max_delay
    }

    /// Schedule `text` for `surface_id`/`user_id` after `delay`
    ///
    /// # Errors
    ///
    /// Returns `PocketclawError::Internal` when the job limit is reached or
    /// the scheduler has shut down, and `PocketclawError::Config` when the
    /// delay exceeds the configured maximum
    pub async fn schedule(
        &self,
        surface_id: &str,
        user_id: &str,
        text: &str,
        delay: Duration,
    ) -> Result<ScheduledJob> {
        if self.inner.shutdown.is_cancelled() {
            return Err(PocketclawError::Internal("scheduler is shut down".to_string()).into());
        }
        if delay > self.inner.max_delay {
            return Err(PocketclawError::Config(format!(
                "delay of {}s exceeds the maximum of {}s",
                delay.as_secs(),
                self.inner.max_delay.as_secs()
            ))
            .into());
        }

        let mut jobs = self.inner.jobs.lock().await;
        if jobs.len() >= self.inner.max_jobs {
            return Err(PocketclawError::Internal(format!(
                "job limit of {} reached",
                self.inner.max_jobs
            ))
            .into());
        }

        let due_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        let job = ScheduledJob {
            id: ulid::Ulid::new().to_string(),
            surface_id: surface_id.to_string(),
            user_id: user_id.to_string(),
            text: text.to_string(),
            due_at,
        };
        let cancel = self.inner.shutdown.child_token();
        jobs.insert(job.id.clone(), (job.clone(), cancel.clone()));
        drop(jobs);

        let inner = Arc::clone(&self.inner);
        let fired = job.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    inner.jobs.lock().await.remove(&fired.id);
                    tracing::info!(
                        job_id = %fired.id,
                        surface = %fired.surface_id,
                        user_id = %fired.user_id,
                        "Scheduled job fired"
                    );
                    let event = CanonicalEvent::new(&fired.surface_id, &fired.user_id, fired.text);
                    if inner.inject.send(event).await.is_err() {
                        tracing::warn!(job_id = %fired.id, "Event queue closed, scheduled job lost");
                    }
                }
            }
        });

        tracing::debug!(job_id = %job.id, delay_secs = delay.as_secs(), "Job scheduled");
        Ok(job)
    }

    /// Pending jobs ordered by id (which is creation order)
    pub async fn list(&self) -> Vec<ScheduledJob> {
        let jobs = self.inner.jobs.lock().await;
        jobs.values().map(|(job, _)| job.clone()).collect()
    }

    /// Pending jobs created by one conversation
    pub async fn list_for(&self, surface_id: &str, user_id: &str) -> Vec<ScheduledJob> {
        self.list()
            .await
            .into_iter()
            .filter(|job| job.surface_id == surface_id && job.user_id == user_id)
            .collect()
    }

    /// Cancel a pending job; false if it does not exist or already fired
    pub async fn cancel(&self, job_id: &str) -> bool {
        match self.inner.jobs.lock().await.remove(job_id) {
            Some((_, cancel)) => {
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every pending job and refuse new ones
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let mut jobs = self.inner.jobs.lock().await;
        if !jobs.is_empty() {
            tracing::info!(pending = jobs.len(), "Discarding pending scheduled jobs");
        }
        jobs.clear();
    }
}
