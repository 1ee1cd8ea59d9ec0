//! Session data model
//!
//! A [`Session`] is the bounded, ordered history of one conversation between
//! a user and the assistant on one surface. Bounds are enforced on every
//! append by evicting the oldest messages first.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use ulid::Ulid;

/// Author of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// End user on a messaging surface
    User,
    /// Generated reply
    Assistant,
    /// Instructions injected by the runtime
    System,
    /// Text result of a capability invocation
    ToolResult,
}

impl Role {
    /// Lowercase name used in logs and prompts
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::ToolResult => "tool_result",
        }
    }
}

/// Immutable conversation message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Author role
    pub role: Role,
    /// Message text
    pub content: String,
    /// Creation time
    pub timestamp: DateTime<Utc>,
    /// Surface the conversation lives on
    pub surface_id: String,
    /// User the conversation belongs to
    pub user_id: String,
    /// Capability that produced a tool-result message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
}

impl Message {
    fn new(role: Role, content: impl Into<String>, surface_id: &str, user_id: &str) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            surface_id: surface_id.to_string(),
            user_id: user_id.to_string(),
            capability: None,
        }
    }

    /// Message written by the user
    pub fn user(content: impl Into<String>, surface_id: &str, user_id: &str) -> Self {
        Self::new(Role::User, content, surface_id, user_id)
    }

    /// Message generated by the assistant
    pub fn assistant(content: impl Into<String>, surface_id: &str, user_id: &str) -> Self {
        Self::new(Role::Assistant, content, surface_id, user_id)
    }

    /// Runtime instruction
    pub fn system(content: impl Into<String>, surface_id: &str, user_id: &str) -> Self {
        Self::new(Role::System, content, surface_id, user_id)
    }

    /// Capability result folded into the conversation
    pub fn tool_result(
        capability: &str,
        content: impl Into<String>,
        surface_id: &str,
        user_id: &str,
    ) -> Self {
        Self {
            capability: Some(capability.to_string()),
            ..Self::new(Role::ToolResult, content, surface_id, user_id)
        }
    }

    /// Override the timestamp
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Bytes counted against the session size limit
    pub fn byte_size(&self) -> usize {
        self.content.len()
    }
}

/// Descriptive data attached to a session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetadata {
    /// Surface name
    pub surface: String,
    /// Free-form labels
    #[serde(default)]
    pub tags: Vec<String>,
    /// Free-form key/value data
    #[serde(default)]
    pub custom: BTreeMap<String, String>,
}

/// Bounds applied to every session history
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    /// Maximum number of messages
    pub max_messages: usize,
    /// Maximum aggregate content bytes
    pub max_bytes: usize,
}

impl From<&crate::config::SessionConfig> for SessionLimits {
    fn from(config: &crate::config::SessionConfig) -> Self {
        Self {
            max_messages: config.max_messages,
            max_bytes: config.max_bytes,
        }
    }
}

/// Identity of a conversation: one user on one surface
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    /// Surface identifier
    pub surface_id: String,
    /// User identifier on that surface
    pub user_id: String,
}

impl SessionKey {
    /// Build a key from borrowed identifiers
    pub fn new(surface_id: &str, user_id: &str) -> Self {
        Self {
            surface_id: surface_id.to_string(),
            user_id: user_id.to_string(),
        }
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.surface_id, self.user_id)
    }
}

/// Per-conversation state
///
/// # Examples
///
/// ```
/// use pocketclaw::session::{Message, Session, SessionLimits};
///
/// let limits = SessionLimits { max_messages: 2, max_bytes: 1024 };
/// let mut session = Session::new("console", "alice");
/// for text in ["one", "two", "three"] {
///     session.append(Message::user(text, "console", "alice"), &limits);
/// }
/// let kept: Vec<_> = session.messages.iter().map(|m| m.content.as_str()).collect();
/// assert_eq!(kept, vec!["two", "three"]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Unique session identifier (ULID)
    pub id: String,
    /// Surface the conversation lives on
    pub surface_id: String,
    /// Owning user
    pub user_id: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Time of the latest committed turn
    pub last_activity_at: DateTime<Utc>,
    /// Ordered, bounded history (oldest first)
    pub messages: VecDeque<Message>,
    /// Descriptive metadata
    pub metadata: SessionMetadata,
}

impl Session {
    /// Create an empty session with a fresh identifier
    pub fn new(surface_id: &str, user_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: new_session_id(),
            surface_id: surface_id.to_string(),
            user_id: user_id.to_string(),
            created_at: now,
            last_activity_at: now,
            messages: VecDeque::new(),
            metadata: SessionMetadata {
                surface: surface_id.to_string(),
                ..SessionMetadata::default()
            },
        }
    }

    /// Key identifying the conversation this session belongs to
    pub fn key(&self) -> SessionKey {
        SessionKey::new(&self.surface_id, &self.user_id)
    }

    /// Aggregate content bytes of the retained history
    pub fn byte_size(&self) -> usize {
        self.messages.iter().map(Message::byte_size).sum()
    }

    /// Append a message and evict the oldest ones until both limits hold
    ///
    /// Returns the number of evicted messages. A single message larger than
    /// `max_bytes` evicts everything, itself included.
    pub fn append(&mut self, message: Message, limits: &SessionLimits) -> usize {
        self.messages.push_back(message);
        let mut bytes = self.byte_size();
        let mut evicted = 0;
        while self.messages.len() > limits.max_messages || bytes > limits.max_bytes {
            match self.messages.pop_front() {
                Some(oldest) => {
                    bytes -= oldest.byte_size();
                    evicted += 1;
                }
                None => break,
            }
        }
        evicted
    }

    /// Most recent `window` messages, oldest first
    pub fn recent(&self, window: usize) -> Vec<Message> {
        let skip = self.messages.len().saturating_sub(window);
        self.messages.iter().skip(skip).cloned().collect()
    }

    /// Update the activity timestamp
    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }
}

/// Generate a new session identifier
pub fn new_session_id() -> String {
    Ulid::new().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(max_messages: usize, max_bytes: usize) -> SessionLimits {
        SessionLimits {
            max_messages,
            max_bytes,
        }
    }

    fn contents(session: &Session) -> Vec<String> {
        session.messages.iter().map(|m| m.content.clone()).collect()
    }

    #[test]
    fn test_append_evicts_oldest_by_count() {
        let mut session = Session::new("console", "alice");
        let limits = limits(2, 1024);
        for text in ["a", "b", "c"] {
            session.append(Message::user(text, "console", "alice"), &limits);
        }
        assert_eq!(contents(&session), vec!["b", "c"]);

        let evicted = session.append(Message::user("d", "console", "alice"), &limits);
        assert_eq!(evicted, 1);
        assert_eq!(contents(&session), vec!["c", "d"]);
    }

    #[test]
    fn test_append_evicts_oldest_by_bytes() {
        let mut session = Session::new("console", "alice");
        let limits = limits(100, 10);
        session.append(Message::user("12345", "console", "alice"), &limits);
        session.append(Message::user("6789", "console", "alice"), &limits);
        session.append(Message::user("abc", "console", "alice"), &limits);

        assert_eq!(contents(&session), vec!["6789", "abc"]);
        assert!(session.byte_size() <= 10);
    }

    #[test]
    fn test_eviction_invariant_holds_for_mixed_sizes() {
        let mut session = Session::new("s", "u");
        let limits = limits(5, 40);
        let mut appended = Vec::new();
        for i in 0..30 {
            let text = "x".repeat((i * 7) % 13 + 1);
            appended.push(text.clone());
            session.append(Message::user(text, "s", "u"), &limits);

            assert!(session.messages.len() <= limits.max_messages);
            assert!(session.byte_size() <= limits.max_bytes);
            let kept = contents(&session);
            assert_eq!(kept.as_slice(), &appended[appended.len() - kept.len()..]);
        }
    }

    #[test]
    fn test_oversized_message_empties_history() {
        let mut session = Session::new("s", "u");
        let limits = limits(10, 4);
        session.append(Message::user("ok", "s", "u"), &limits);
        let evicted = session.append(Message::user("far too long", "s", "u"), &limits);
        assert_eq!(evicted, 2);
        assert!(session.messages.is_empty());
    }

    #[test]
    fn test_recent_returns_tail_oldest_first() {
        let mut session = Session::new("s", "u");
        let limits = limits(10, 1024);
        for text in ["1", "2", "3", "4"] {
            session.append(Message::user(text, "s", "u"), &limits);
        }
        let recent: Vec<_> = session.recent(2).into_iter().map(|m| m.content).collect();
        assert_eq!(recent, vec!["3", "4"]);
        assert_eq!(session.recent(10).len(), 4);
    }

    #[test]
    fn test_session_ids_are_unique() {
        let a = Session::new("s", "u");
        let b = Session::new("s", "u");
        assert_ne!(a.id, b.id);
        assert!(Ulid::from_string(&a.id).is_ok());
    }

    #[test]
    fn test_tool_result_records_capability() {
        let message = Message::tool_result("shell", "exit 0", "s", "u");
        assert_eq!(message.role, Role::ToolResult);
        assert_eq!(message.capability.as_deref(), Some("shell"));
    }

    #[test]
    fn test_role_serializes_snake_case() {
        let json = serde_json::to_string(&Role::ToolResult).unwrap();
        assert_eq!(json, "\"tool_result\"");
    }

    mod properties {
        use super::super::{Message, Session};
        use super::{contents, limits};
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn eviction_keeps_longest_fitting_suffix(
                max_messages in 1usize..12,
                max_bytes in 1usize..400,
                payloads in proptest::collection::vec(".{0,60}", 0..40),
            ) {
                let bounds = limits(max_messages, max_bytes);
                let mut session = Session::new("s", "u");
                let mut history: Vec<String> = Vec::new();

                for (index, payload) in payloads.iter().enumerate() {
                    let content = format!("{}:{}", index, payload);
                    history.push(content.clone());
                    session.append(Message::user(content, "s", "u"), &bounds);

                    prop_assert!(session.messages.len() <= max_messages);
                    prop_assert!(session.byte_size() <= max_bytes);

                    let mut expected: Vec<String> = Vec::new();
                    let mut bytes = 0;
                    for content in history.iter().rev() {
                        if expected.len() == max_messages || bytes + content.len() > max_bytes {
                            break;
                        }
                        bytes += content.len();
                        expected.push(content.clone());
                    }
                    expected.reverse();
                    prop_assert_eq!(contents(&session), expected);
                }
            }
        }
    }
}
