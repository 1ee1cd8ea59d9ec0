//! Transport framework
//!
//! Every messaging surface sits behind [`TransportAdapter`]. The framework
//! runs one worker per surface that owns the connection lifecycle
//! (connect, receive, send, reconnect with backoff), converts surface
//! payloads into [`CanonicalEvent`]s on one shared inbound queue, and
//! delivers outbound replies back to the surface that produced the event.
//!
//! Inbound events flow through an mpsc channel to the agent loop; replies
//! flow back through an [`OutboundSender`], so the two sides never hold a
//! reference to each other.

pub mod backoff;
pub mod console;
pub mod endpoint;
pub mod fake;
pub mod manager;
pub mod outbound;
pub mod telegram;

pub use backoff::Backoff;
pub use endpoint::EndpointSettings;
pub use manager::TransportManager;
pub use outbound::{OutboundQueue, OutboundSender};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::Result;

/// One piece of surface-native content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RawPart {
    /// Plain text
    Text(String),
    /// File, image or other media
    Attachment {
        /// File name or media kind
        name: String,
    },
    /// Interactive button
    Button {
        /// Button caption
        label: String,
    },
}

/// Inbound payload as produced by a surface adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    /// Surface-specific user identifier
    pub user_id: String,
    /// Content parts in surface order
    pub parts: Vec<RawPart>,
    /// When the surface received the event
    pub timestamp: DateTime<Utc>,
}

impl RawEvent {
    /// Text-only event stamped now
    pub fn text(user_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            parts: vec![RawPart::Text(text.into())],
            timestamp: Utc::now(),
        }
    }
}

/// Surface-independent inbound event consumed by the agent loop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    /// Surface the event arrived on
    pub surface_id: String,
    /// User on that surface
    pub user_id: String,
    /// Flattened text content
    pub text: String,
    /// When the surface received the event
    pub timestamp: DateTime<Utc>,
}

impl CanonicalEvent {
    /// Event stamped now
    pub fn new(surface_id: &str, user_id: &str, text: impl Into<String>) -> Self {
        Self {
            surface_id: surface_id.to_string(),
            user_id: user_id.to_string(),
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Convert a raw payload into the canonical shape
///
/// Text parts are joined with newlines, attachments are flattened to a
/// bracketed placeholder, and buttons are dropped.
pub fn normalize(surface_id: &str, raw: RawEvent) -> CanonicalEvent {
    let text = raw
        .parts
        .into_iter()
        .filter_map(|part| match part {
            RawPart::Text(text) => Some(text),
            RawPart::Attachment { name } => Some(format!("[attachment: {}]", name)),
            RawPart::Button { .. } => None,
        })
        .collect::<Vec<_>>()
        .join("\n");

    CanonicalEvent {
        surface_id: surface_id.to_string(),
        user_id: raw.user_id,
        text,
        timestamp: raw.timestamp,
    }
}

/// Presentation hints passed to a surface when sending
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormattingHints {
    /// Text contains markdown the surface may render
    pub markdown: bool,
    /// Surface message id the reply answers, if known
    pub reply_to: Option<String>,
}

/// Reply addressed to one surface/user pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundReply {
    /// Destination surface
    pub surface_id: String,
    /// Destination user
    pub user_id: String,
    /// Reply text
    pub text: String,
    /// Presentation hints
    pub hints: FormattingHints,
}

impl OutboundReply {
    /// Markdown reply with no reply-to reference
    pub fn new(surface_id: &str, user_id: &str, text: impl Into<String>) -> Self {
        Self {
            surface_id: surface_id.to_string(),
            user_id: user_id.to_string(),
            text: text.into(),
            hints: FormattingHints {
                markdown: true,
                reply_to: None,
            },
        }
    }
}

/// Connection status of one surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// Not connected and not trying
    Disconnected,
    /// Connection attempt in progress
    Connecting,
    /// Receiving and sending
    Connected,
    /// Waiting before the next connection attempt
    BackingOff,
    /// Administratively disabled or out of reconnect attempts
    Disabled,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::BackingOff => "backing_off",
            ConnectionStatus::Disabled => "disabled",
        };
        write!(f, "{}", name)
    }
}

/// Snapshot of one surface's connection lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointState {
    /// Current status
    pub status: ConnectionStatus,
    /// Delay of the current or most recent backoff
    pub current_backoff: Duration,
    /// Most recent connection error
    pub last_error: Option<String>,
    /// Failed connection attempts since the last success
    pub failed_attempts: u32,
    /// Replies waiting for a connection
    pub queued_replies: usize,
    /// Replies dropped because the queue was full
    pub dropped_replies: u64,
    /// Replies given up on after repeated send rejections
    pub undeliverable_replies: u64,
}

impl Default for EndpointState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            current_backoff: Duration::ZERO,
            last_error: None,
            failed_attempts: 0,
            queued_replies: 0,
            dropped_replies: 0,
            undeliverable_replies: 0,
        }
    }
}

/// Contract implemented by every messaging surface
///
/// Methods take `&self` so one adapter can receive and send from the same
/// worker. `receive_next` must be cancel-safe: the worker drops it whenever
/// a reply needs sending, and no inbound event may be lost when it does.
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    /// Surface identifier, unique per runtime
    fn surface_id(&self) -> &str;

    /// Establish the connection
    async fn connect(&self) -> Result<()>;

    /// Wait for the next inbound payload; `Ok(None)` means the connection closed
    async fn receive_next(&self) -> Result<Option<RawEvent>>;

    /// Deliver `text` to `user_id`
    async fn send(&self, user_id: &str, text: &str, hints: &FormattingHints) -> Result<()>;

    /// Close the connection gracefully
    async fn disconnect(&self) -> Result<()>;
}
