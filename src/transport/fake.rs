//! In-process transport for tests and embedding
//!
//! [`FakeTransport`] behaves like a real surface: events are injected from
//! the outside, sent replies are recorded, and connection failures can be
//! scripted to exercise the reconnect path.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, Notify};

use crate::error::{PocketclawError, Result};
use crate::transport::{FormattingHints, RawEvent, TransportAdapter};

/// Reply recorded by [`FakeTransport::send`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentReply {
    /// Destination user
    pub user_id: String,
    /// Reply text
    pub text: String,
    /// Hints passed with the reply
    pub hints: FormattingHints,
}

/// Scriptable in-memory surface
pub struct FakeTransport {
    surface_id: String,
    injector: mpsc::UnboundedSender<RawEvent>,
    events: Mutex<mpsc::UnboundedReceiver<RawEvent>>,
    sent: StdMutex<Vec<SentReply>>,
    sent_notify: Notify,
    connect_failures: AtomicU32,
    connect_attempts: AtomicU32,
    disconnects: AtomicU32,
    fail_next_receive: AtomicBool,
    reject_sends: AtomicBool,
    send_attempts: AtomicU32,
}

impl FakeTransport {
    /// Create a surface that connects on the first attempt
    pub fn new(surface_id: &str) -> Self {
        let (injector, events) = mpsc::unbounded_channel();
        Self {
            surface_id: surface_id.to_string(),
            injector,
            events: Mutex::new(events),
            sent: StdMutex::new(Vec::new()),
            sent_notify: Notify::new(),
            connect_failures: AtomicU32::new(0),
            connect_attempts: AtomicU32::new(0),
            disconnects: AtomicU32::new(0),
            fail_next_receive: AtomicBool::new(false),
            reject_sends: AtomicBool::new(false),
            send_attempts: AtomicU32::new(0),
        }
    }

    /// Fail the first `failures` connection attempts
    pub fn with_connect_failures(self, failures: u32) -> Self {
        self.connect_failures.store(failures, Ordering::SeqCst);
        self
    }

    /// Reject every send while the connection itself stays healthy
    pub fn with_rejected_sends(self) -> Self {
        self.reject_sends.store(true, Ordering::SeqCst);
        self
    }

    /// Queue a raw event as if the surface received it
    pub fn inject(&self, event: RawEvent) {
        let _ = self.injector.send(event);
    }

    /// Queue a text event from `user_id`
    pub fn inject_text(&self, user_id: &str, text: &str) {
        self.inject(RawEvent::text(user_id, text));
    }

    /// Make the next receive fail as if the connection dropped, and fail
    /// the following `reconnect_failures` connection attempts
    pub fn drop_connection(&self, reconnect_failures: u32) {
        self.connect_failures
            .store(reconnect_failures, Ordering::SeqCst);
        self.fail_next_receive.store(true, Ordering::SeqCst);
        // Wake a pending receive so it observes the flag.
        self.inject(RawEvent {
            user_id: String::new(),
            parts: Vec::new(),
            timestamp: chrono::Utc::now(),
        });
    }

    /// Every reply sent so far
    pub fn sent(&self) -> Vec<SentReply> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Wait until at least `count` replies were sent or `timeout` elapses
    pub async fn wait_for_sent(&self, count: usize, timeout: Duration) -> Vec<SentReply> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.sent_notify.notified();
            let sent = self.sent();
            if sent.len() >= count {
                return sent;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.sent();
            }
        }
    }

    /// Connection attempts so far, failed or not
    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    /// Send attempts so far, rejected or not
    pub fn send_attempts(&self) -> u32 {
        self.send_attempts.load(Ordering::SeqCst)
    }

    /// Graceful disconnects so far
    pub fn disconnect_count(&self) -> u32 {
        self.disconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportAdapter for FakeTransport {
    fn surface_id(&self) -> &str {
        &self.surface_id
    }

    async fn connect(&self) -> Result<()> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.connect_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.connect_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(PocketclawError::Transport {
                surface: self.surface_id.clone(),
                message: "scripted connection failure".to_string(),
            }
            .into());
        }
        Ok(())
    }

    async fn receive_next(&self) -> Result<Option<RawEvent>> {
        let mut events = self.events.lock().await;
        loop {
            let event = events.recv().await;
            if self.fail_next_receive.swap(false, Ordering::SeqCst) {
                return Err(PocketclawError::Transport {
                    surface: self.surface_id.clone(),
                    message: "scripted connection loss".to_string(),
                }
                .into());
            }
            match event {
                Some(event) if event.parts.is_empty() => continue,
                other => return Ok(other),
            }
        }
    }

    async fn send(&self, user_id: &str, text: &str, hints: &FormattingHints) -> Result<()> {
        self.send_attempts.fetch_add(1, Ordering::SeqCst);
        if self.reject_sends.load(Ordering::SeqCst) {
            return Err(PocketclawError::Transport {
                surface: self.surface_id.clone(),
                message: "message is too long".to_string(),
            }
            .into());
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(SentReply {
                user_id: user_id.to_string(),
                text: text.to_string(),
                hints: hints.clone(),
            });
        }
        self.sent_notify.notify_waiters();
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
