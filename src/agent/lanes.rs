//! Per-session lanes
//!
//! Events for the same session are processed strictly in arrival order by
//! one worker task per session key; distinct sessions run concurrently,
//! bounded by a global permit count. Idle workers exit on their own and are
//! re-spawned by the next event for that key.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::agent::core::AgentLoop;
use crate::session::SessionKey;
use crate::transport::CanonicalEvent;

/// Events that may wait in one session's lane
pub const LANE_QUEUE_DEPTH: usize = 32;

/// How long an idle lane worker lingers before exiting
pub const LANE_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

type Lanes = Arc<Mutex<HashMap<SessionKey, mpsc::Sender<CanonicalEvent>>>>;

/// Serializes turns per session and bounds total concurrency
pub struct LaneSet {
    agent: Arc<AgentLoop>,
    lanes: Lanes,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    stop: CancellationToken,
    abort: CancellationToken,
    idle_timeout: Duration,
}

impl LaneSet {
    /// Create a lane set running at most `max_concurrent_turns` turns at once
    pub fn new(agent: Arc<AgentLoop>, max_concurrent_turns: usize) -> Self {
        Self {
            agent,
            lanes: Arc::new(Mutex::new(HashMap::new())),
            permits: Arc::new(Semaphore::new(max_concurrent_turns.max(1))),
            tracker: TaskTracker::new(),
            stop: CancellationToken::new(),
            abort: CancellationToken::new(),
            idle_timeout: LANE_IDLE_TIMEOUT,
        }
    }

    /// Override the idle timeout
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Queue `event` on its session lane
    ///
    /// Returns false when the lane is full or the set is shutting down; the
    /// event is dropped in that case. A sender whose lane is full is told
    /// to try again.
    pub fn submit(&self, event: CanonicalEvent) -> bool {
        if self.stop.is_cancelled() {
            tracing::debug!(surface = %event.surface_id, "Lanes stopped, dropping event");
            return false;
        }
        let key = SessionKey::new(&event.surface_id, &event.user_id);

        let Ok(mut lanes) = self.lanes.lock() else {
            tracing::error!("Lane table lock poisoned");
            return false;
        };

        let mut event = event;
        if let Some(tx) = lanes.get(&key) {
            match tx.try_send(event) {
                Ok(()) => return true,
                Err(mpsc::error::TrySendError::Full(rejected)) => {
                    drop(lanes);
                    tracing::warn!(
                        surface = %key.surface_id,
                        user_id = %key.user_id,
                        "Session lane full, dropping event"
                    );
                    self.agent.reply_busy(&rejected);
                    return false;
                }
                Err(mpsc::error::TrySendError::Closed(returned)) => {
                    // Worker exited between its idle check and removal
                    event = returned;
                    lanes.remove(&key);
                }
            }
        }

        let (tx, rx) = mpsc::channel(LANE_QUEUE_DEPTH);
        if tx.try_send(event).is_err() {
            return false;
        }
        lanes.insert(key.clone(), tx);
        drop(lanes);

        self.tracker.spawn(run_lane(LaneWorker {
            key,
            rx,
            agent: Arc::clone(&self.agent),
            lanes: Arc::clone(&self.lanes),
            permits: Arc::clone(&self.permits),
            stop: self.stop.clone(),
            abort: self.abort.clone(),
            idle_timeout: self.idle_timeout,
        }));
        true
    }

    /// Number of live lanes
    pub fn active_lanes(&self) -> usize {
        self.lanes.lock().map(|lanes| lanes.len()).unwrap_or(0)
    }

    /// Stop accepting events and wait for in-flight turns
    ///
    /// Turns still running after `grace` are aborted.
    pub async fn shutdown(&self, grace: Duration) {
        self.stop.cancel();
        if let Ok(mut lanes) = self.lanes.lock() {
            lanes.clear();
        }
        self.tracker.close();

        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            tracing::warn!(
                remaining = self.tracker.len(),
                "Turns still running after grace period, aborting"
            );
            self.abort.cancel();
            self.tracker.wait().await;
        }
        tracing::debug!("All session lanes stopped");
    }
}

struct LaneWorker {
    key: SessionKey,
    rx: mpsc::Receiver<CanonicalEvent>,
    agent: Arc<AgentLoop>,
    lanes: Lanes,
    permits: Arc<Semaphore>,
    stop: CancellationToken,
    abort: CancellationToken,
    idle_timeout: Duration,
}

async fn run_lane(mut worker: LaneWorker) {
    loop {
        let event = tokio::select! {
            biased;
            _ = worker.stop.cancelled() => break,
            event = worker.rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = tokio::time::sleep(worker.idle_timeout) => {
                match worker.retire() {
                    Some(event) => event,
                    None => break,
                }
            }
        };

        let permit = tokio::select! {
            biased;
            _ = worker.abort.cancelled() => break,
            permit = Arc::clone(&worker.permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let turn = AssertUnwindSafe(worker.agent.process(event.clone())).catch_unwind();
        tokio::select! {
            biased;
            _ = worker.abort.cancelled() => {
                tracing::warn!(
                    surface = %worker.key.surface_id,
                    user_id = %worker.key.user_id,
                    "Turn aborted during shutdown"
                );
                break;
            }
            result = turn => {
                if result.is_err() {
                    tracing::error!(
                        surface = %worker.key.surface_id,
                        user_id = %worker.key.user_id,
                        "Turn panicked"
                    );
                    worker.agent.reply_internal_error(&event);
                }
            }
        }
        drop(permit);
    }
    tracing::trace!(surface = %worker.key.surface_id, user_id = %worker.key.user_id, "Lane exited");
}

impl LaneWorker {
    /// Remove this lane from the table unless an event raced in
    fn retire(&mut self) -> Option<CanonicalEvent> {
        let Ok(mut lanes) = self.lanes.lock() else {
            return None;
        };
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(_) => {
                lanes.remove(&self.key);
                None
            }
        }
    }
}
