//! Per-surface connection worker
//!
//! One worker task per surface drives the adapter through
//! connect → receive/send → loss → backoff → reconnect until the surface is
//! disabled or the runtime shuts down. The worker is the only writer of
//! its [`EndpointState`].

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::TransportConfig;
use crate::metrics;
use crate::transport::{
    normalize, Backoff, CanonicalEvent, ConnectionStatus, EndpointState, OutboundQueue,
    OutboundReply, TransportAdapter,
};

/// Lifecycle parameters shared by every surface worker
#[derive(Debug, Clone)]
pub struct EndpointSettings {
    /// First reconnect delay
    pub backoff_base: Duration,
    /// Longest reconnect delay
    pub backoff_ceiling: Duration,
    /// Upward jitter as a fraction of the delay
    pub jitter_ratio: f64,
    /// Replies kept while disconnected
    pub outbound_queue_depth: usize,
    /// Give up and disable after this many consecutive failures
    pub max_reconnect_attempts: Option<u32>,
}

impl From<&TransportConfig> for EndpointSettings {
    fn from(config: &TransportConfig) -> Self {
        Self {
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_ceiling: Duration::from_millis(config.backoff_ceiling_ms),
            jitter_ratio: config.jitter_ratio,
            outbound_queue_depth: config.outbound_queue_depth,
            max_reconnect_attempts: config.max_reconnect_attempts,
        }
    }
}

/// Shared, read-mostly view of one surface's state
pub type SharedState = Arc<RwLock<EndpointState>>;

/// Send attempts for one reply before it is given up on
pub const MAX_DELIVERY_ATTEMPTS: u32 = 3;

/// Why the connected phase ended
enum Exit {
    Lost(String),
    Stopped,
}

/// Result of handing one reply to the adapter
enum Delivery {
    Sent,
    /// Put back at the front of the queue; the connection is suspect
    Retry(String),
    /// Rejected too often and discarded
    Abandoned,
}

pub(crate) struct SurfaceWorker {
    adapter: Arc<dyn TransportAdapter>,
    settings: EndpointSettings,
    state: SharedState,
    inbound: mpsc::Sender<CanonicalEvent>,
    outbound_rx: mpsc::UnboundedReceiver<OutboundReply>,
    cancel: CancellationToken,
    queue: OutboundQueue,
    /// Consecutive rejections of the reply at the head of the queue
    head_failures: u32,
    /// Set once the current connection has sent or received something
    stable: bool,
}

impl SurfaceWorker {
    pub(crate) fn new(
        adapter: Arc<dyn TransportAdapter>,
        settings: EndpointSettings,
        state: SharedState,
        inbound: mpsc::Sender<CanonicalEvent>,
        outbound_rx: mpsc::UnboundedReceiver<OutboundReply>,
        cancel: CancellationToken,
    ) -> Self {
        let queue = OutboundQueue::new(settings.outbound_queue_depth);
        Self {
            adapter,
            settings,
            state,
            inbound,
            outbound_rx,
            cancel,
            queue,
            head_failures: 0,
            stable: false,
        }
    }

    fn surface(&self) -> &str {
        self.adapter.surface_id()
    }

    fn update(&self, f: impl FnOnce(&mut EndpointState)) {
        if let Ok(mut state) = self.state.write() {
            f(&mut state);
        }
    }

    fn enqueue(&mut self, reply: OutboundReply) {
        if let Some(dropped) = self.queue.push(reply) {
            self.record_drop(&dropped);
        }
        let queued = self.queue.len();
        self.update(|s| s.queued_replies = queued);
    }

    fn requeue(&mut self, reply: OutboundReply) {
        if let Some(dropped) = self.queue.requeue(reply) {
            self.record_drop(&dropped);
        }
        let queued = self.queue.len();
        self.update(|s| s.queued_replies = queued);
    }

    fn record_drop(&self, dropped: &OutboundReply) {
        tracing::warn!(
            surface = %self.surface(),
            user_id = %dropped.user_id,
            depth = self.settings.outbound_queue_depth,
            "Outbound queue full, dropping oldest reply"
        );
        metrics::record_dropped_reply(self.surface());
        self.update(|s| s.dropped_replies += 1);
    }

    /// Run until cancelled or out of reconnect attempts
    ///
    /// The backoff only starts over once a connection has proved itself
    /// by moving a message in either direction, or by staying up for at
    /// least the backoff ceiling. A connection that is accepted and then
    /// immediately lost keeps climbing the backoff.
    pub(crate) async fn run(mut self) {
        let mut backoff = Backoff::new(
            self.settings.backoff_base,
            self.settings.backoff_ceiling,
            self.settings.jitter_ratio,
        );

        loop {
            self.update(|s| s.status = ConnectionStatus::Connecting);
            let connected = match self.connect().await {
                Some(result) => result,
                None => break,
            };

            if let Err(e) = connected {
                let failures = backoff.attempts() + 1;
                tracing::warn!(
                    surface = %self.surface(),
                    attempt = failures,
                    error = %e,
                    "Connection attempt failed"
                );
                if let Some(max) = self.settings.max_reconnect_attempts {
                    if failures >= max {
                        tracing::error!(
                            surface = %self.surface(),
                            attempts = failures,
                            "Giving up on surface after repeated connection failures"
                        );
                        self.update(|s| {
                            s.status = ConnectionStatus::Disabled;
                            s.failed_attempts = failures;
                            s.last_error = Some(e.to_string());
                        });
                        return;
                    }
                }

                self.update(|s| {
                    s.failed_attempts = failures;
                    s.last_error = Some(e.to_string());
                });
                if !self.back_off(&mut backoff).await {
                    break;
                }
                continue;
            }

            self.stable = false;
            self.update(|s| {
                s.status = ConnectionStatus::Connected;
                s.failed_attempts = 0;
            });
            tracing::info!(surface = %self.surface(), "Surface connected");

            let connected_at = tokio::time::Instant::now();
            match self.serve().await {
                Exit::Stopped => break,
                Exit::Lost(reason) => {
                    tracing::warn!(surface = %self.surface(), reason = %reason, "Connection lost");
                    self.update(|s| {
                        s.status = ConnectionStatus::Disconnected;
                        s.last_error = Some(reason);
                    });
                    if self.stable || connected_at.elapsed() >= self.settings.backoff_ceiling {
                        backoff.reset();
                    }
                    if !self.back_off(&mut backoff).await {
                        break;
                    }
                }
            }
        }

        self.shutdown().await;
    }

    /// Wait out the next backoff delay; false when cancelled meanwhile
    async fn back_off(&mut self, backoff: &mut Backoff) -> bool {
        let delay = backoff.next_delay();
        metrics::record_reconnect(self.surface());
        self.update(|s| {
            s.status = ConnectionStatus::BackingOff;
            s.current_backoff = delay;
        });
        tracing::debug!(
            surface = %self.surface(),
            delay_ms = delay.as_millis() as u64,
            "Backing off before reconnect"
        );
        self.wait(delay).await
    }

    /// One connect attempt; `None` when cancelled meanwhile
    async fn connect(&mut self) -> Option<crate::error::Result<()>> {
        let adapter = Arc::clone(&self.adapter);
        let attempt = adapter.connect();
        tokio::pin!(attempt);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                result = &mut attempt => return Some(result),
                Some(reply) = self.outbound_rx.recv() => self.enqueue(reply),
            }
        }
    }

    /// Sleep for `delay` while still queueing replies; false when cancelled
    async fn wait(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                _ = &mut sleep => return true,
                Some(reply) = self.outbound_rx.recv() => self.enqueue(reply),
            }
        }
    }

    async fn deliver(&mut self, reply: OutboundReply) -> Delivery {
        match self
            .adapter
            .send(&reply.user_id, &reply.text, &reply.hints)
            .await
        {
            Ok(()) => {
                self.head_failures = 0;
                self.stable = true;
                Delivery::Sent
            }
            Err(e) => {
                self.head_failures += 1;
                if self.head_failures >= MAX_DELIVERY_ATTEMPTS {
                    self.head_failures = 0;
                    tracing::error!(
                        surface = %self.surface(),
                        user_id = %reply.user_id,
                        attempts = MAX_DELIVERY_ATTEMPTS,
                        error = %e,
                        "Surface keeps rejecting reply, giving up on it"
                    );
                    metrics::record_undeliverable_reply(self.surface());
                    self.update(|s| s.undeliverable_replies += 1);
                    return Delivery::Abandoned;
                }
                self.requeue(reply);
                Delivery::Retry(e.to_string())
            }
        }
    }

    /// Connected phase: flush the queue, then multiplex receive and send
    async fn serve(&mut self) -> Exit {
        while let Some(reply) = self.queue.pop() {
            let queued = self.queue.len();
            self.update(|s| s.queued_replies = queued);
            if let Delivery::Retry(reason) = self.deliver(reply).await {
                return Exit::Lost(reason);
            }
        }

        let adapter = Arc::clone(&self.adapter);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.flush_on_stop().await;
                    return Exit::Stopped;
                }
                Some(reply) = self.outbound_rx.recv() => {
                    if let Delivery::Retry(reason) = self.deliver(reply).await {
                        return Exit::Lost(reason);
                    }
                }
                received = adapter.receive_next() => match received {
                    Ok(Some(raw)) => {
                        self.stable = true;
                        let event = normalize(adapter.surface_id(), raw);
                        tracing::debug!(
                            surface = %event.surface_id,
                            user_id = %event.user_id,
                            "Inbound event"
                        );
                        if self.inbound.send(event).await.is_err() {
                            return Exit::Stopped;
                        }
                    }
                    Ok(None) => return Exit::Lost("connection closed".to_string()),
                    Err(e) => return Exit::Lost(e.to_string()),
                },
            }
        }
    }

    /// Deliver replies that were already handed over before the stop
    async fn flush_on_stop(&mut self) {
        while let Ok(reply) = self.outbound_rx.try_recv() {
            self.enqueue(reply);
        }
        while let Some(reply) = self.queue.pop() {
            if let Delivery::Retry(reason) = self.deliver(reply).await {
                tracing::debug!(surface = %self.surface(), reason = %reason, "Final flush failed");
                break;
            }
        }
    }

    async fn shutdown(&mut self) {
        while let Ok(reply) = self.outbound_rx.try_recv() {
            self.enqueue(reply);
        }
        if let Err(e) = self.adapter.disconnect().await {
            tracing::warn!(surface = %self.surface(), error = %e, "Disconnect failed");
        }
        if !self.queue.is_empty() {
            tracing::warn!(
                surface = %self.surface(),
                pending = self.queue.len(),
                "Discarding undelivered replies at shutdown"
            );
        }
        self.update(|s| {
            if s.status != ConnectionStatus::Disabled {
                s.status = ConnectionStatus::Disconnected;
            }
        });
        tracing::info!(surface = %self.surface(), "Surface stopped");
    }
}
