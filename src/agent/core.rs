//! Agent loop
//!
//! Drives one conversational turn to completion:
//! - Resolves the session for the event's (surface, user) pair
//! - Asks the inference router for a result under the turn timeout
//! - Dispatches requested capabilities sequentially, in model order
//! - Optionally runs one follow-up round over the capability results
//! - Commits the turn's messages to the session store in one step
//! - Sends the reply to the originating surface
//!
//! Errors never leave [`AgentLoop::process`]: they are logged with their
//! full detail and replaced by a short plain-text reply.

use std::sync::Arc;
use std::time::Duration;

use tracing::Instrument;

use crate::agent::context::{self, ContextSettings};
use crate::config::AgentConfig;
use crate::error::{PocketclawError, Result};
use crate::metrics::TurnMetrics;
use crate::providers::{GenerationRequest, GenerationResult, InferenceRouter};
use crate::session::{Message, Session, SessionStore};
use crate::tools::{Dispatcher, InvocationContext};
use crate::transport::{CanonicalEvent, OutboundReply, OutboundSender};

/// Reply used when a turn ends without any text to show
const EMPTY_REPLY: &str = "I don't have anything to add.";

/// Settings for the agent loop
#[derive(Debug, Clone, PartialEq)]
pub struct AgentSettings {
    /// Time budget for a whole turn, capability calls included
    pub turn_timeout: Duration,
    /// Run one more generation round after capability results
    pub follow_up_round: bool,
    /// Request shaping
    pub context: ContextSettings,
}

impl From<&AgentConfig> for AgentSettings {
    fn from(config: &AgentConfig) -> Self {
        Self {
            turn_timeout: config.turn_timeout(),
            follow_up_round: config.follow_up_round,
            context: ContextSettings::from(config),
        }
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self::from(&AgentConfig::default())
    }
}

/// How a turn ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStatus {
    /// Reply generated and session updated
    Completed,
    /// Nothing to do (empty input)
    Skipped,
    /// An error reply was sent instead
    Failed,
}

impl TurnStatus {
    /// Label used for metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnStatus::Completed => "ok",
            TurnStatus::Skipped => "skipped",
            TurnStatus::Failed => "failed",
        }
    }
}

/// Result of processing one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOutcome {
    /// Session the event belongs to
    pub session_id: String,
    /// How the turn ended
    pub status: TurnStatus,
    /// Text sent back to the user, if any
    pub reply: Option<String>,
    /// Capability invocations dispatched
    pub invocations: usize,
}

/// Successful turn before it is committed
struct TurnReply {
    text: String,
    staged: Vec<Message>,
    invocations: usize,
}

/// The top-level coordinator
pub struct AgentLoop {
    store: Arc<SessionStore>,
    router: Arc<InferenceRouter>,
    dispatcher: Arc<Dispatcher>,
    outbound: OutboundSender,
    settings: AgentSettings,
}

impl AgentLoop {
    /// Create an agent loop over its collaborators
    pub fn new(
        store: Arc<SessionStore>,
        router: Arc<InferenceRouter>,
        dispatcher: Arc<Dispatcher>,
        outbound: OutboundSender,
        settings: AgentSettings,
    ) -> Self {
        Self {
            store,
            router,
            dispatcher,
            outbound,
            settings,
        }
    }

    /// Session store used by this loop
    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Process one canonical event to completion
    ///
    /// Never fails: errors become a user-visible reply, and the session is
    /// left unchanged by a failed turn.
    pub async fn process(&self, event: CanonicalEvent) -> TurnOutcome {
        let metrics = TurnMetrics::start(&event.surface_id);
        let session = self
            .store
            .get_or_create(&event.surface_id, &event.user_id)
            .await;

        let span = tracing::info_span!(
            "turn",
            session_id = %session.id,
            surface = %event.surface_id,
            user_id = %event.user_id
        );

        let outcome = self.process_in_session(&session, &event).instrument(span).await;
        metrics.finish(outcome.status.as_str());
        outcome
    }

    async fn process_in_session(&self, session: &Session, event: &CanonicalEvent) -> TurnOutcome {
        if event.text.trim().is_empty() {
            tracing::debug!("Empty input, nothing to do");
            return TurnOutcome {
                session_id: session.id.clone(),
                status: TurnStatus::Skipped,
                reply: None,
                invocations: 0,
            };
        }

        let timeout = self.settings.turn_timeout;
        let result = match tokio::time::timeout(timeout, self.run_turn(session, event)).await {
            Ok(result) => result,
            Err(_) => Err(PocketclawError::TurnTimeout(timeout).into()),
        };

        match result {
            Ok(turn) => {
                if let Err(e) = self.store.commit(&session.id, turn.staged).await {
                    tracing::error!(error = %e, "Failed to persist turn");
                }
                self.send_reply(event, &turn.text);
                tracing::info!(invocations = turn.invocations, "Turn completed");
                TurnOutcome {
                    session_id: session.id.clone(),
                    status: TurnStatus::Completed,
                    reply: Some(turn.text),
                    invocations: turn.invocations,
                }
            }
            Err(e) => {
                let reply = user_facing_error(&e);
                tracing::warn!(error = %e, "Turn failed");
                self.send_reply(event, reply);
                TurnOutcome {
                    session_id: session.id.clone(),
                    status: TurnStatus::Failed,
                    reply: Some(reply.to_string()),
                    invocations: 0,
                }
            }
        }
    }

    async fn run_turn(&self, session: &Session, event: &CanonicalEvent) -> Result<TurnReply> {
        let surface = event.surface_id.as_str();
        let user = event.user_id.as_str();
        let ctx = InvocationContext {
            session_id: session.id.clone(),
            surface_id: surface.to_string(),
            user_id: user.to_string(),
        };

        let request = context::initial_request(
            session,
            &event.text,
            self.dispatcher.descriptors(),
            &self.settings.context,
        );
        let first = self.generate(&request).await?;
        let mut staged = vec![Message::user(event.text.clone(), surface, user)];

        if !first.has_invocations() {
            let text = non_empty_or(first.text, EMPTY_REPLY);
            staged.push(Message::assistant(text.clone(), surface, user));
            return Ok(TurnReply {
                text,
                staged,
                invocations: 0,
            });
        }

        if !first.text.trim().is_empty() {
            staged.push(Message::assistant(first.text.clone(), surface, user));
        }

        let mut results = Vec::with_capacity(first.invocations.len());
        let mut notes = Vec::new();
        for call in &first.invocations {
            let result = self.dispatcher.dispatch(call, &ctx).await;
            if let Some(note) = result.user_note() {
                notes.push(note.to_string());
            }
            let content = result.to_message_content();
            staged.push(Message::tool_result(&call.name, content.clone(), surface, user));
            results.push(content);
        }

        let text = if self.settings.follow_up_round {
            let follow_up =
                context::follow_up_request(session, &staged, &self.settings.context);
            let second = self.generate(&follow_up).await?;
            if second.has_invocations() {
                tracing::warn!(
                    ignored = second.invocations.len(),
                    "Follow-up round requested more capabilities; ignoring"
                );
            }
            second.text
        } else if first.text.trim().is_empty() {
            results.join("\n\n")
        } else {
            first.text.clone()
        };

        let mut text = non_empty_or(text, EMPTY_REPLY);
        for note in notes {
            text.push_str("\n\n");
            text.push_str(&note);
        }
        staged.push(Message::assistant(text.clone(), surface, user));

        Ok(TurnReply {
            text,
            staged,
            invocations: first.invocations.len(),
        })
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResult> {
        let result = self.router.generate(request).await?;
        tracing::debug!(
            backend = %result.backend,
            input_units = result.usage.input_units,
            output_units = result.usage.output_units,
            invocations = result.invocations.len(),
            "Generation round finished"
        );
        Ok(result)
    }

    fn send_reply(&self, event: &CanonicalEvent, text: &str) {
        let reply = OutboundReply::new(&event.surface_id, &event.user_id, text);
        if let Err(e) = self.outbound.send(reply) {
            tracing::warn!(error = %e, "Reply could not be routed");
        }
    }

    /// Reply for a turn that panicked
    pub fn reply_internal_error(&self, event: &CanonicalEvent) {
        self.send_reply(event, INTERNAL_ERROR_REPLY);
    }

    /// Reply for a message turned away because its session is backed up
    pub fn reply_busy(&self, event: &CanonicalEvent) {
        self.send_reply(event, BUSY_REPLY);
    }
}

const INTERNAL_ERROR_REPLY: &str = "Sorry, something went wrong while handling your message.";

/// Sent when a session already has a full queue of pending messages
pub const BUSY_REPLY: &str = "I'm still working through your earlier messages. Please try again in a moment.";

fn non_empty_or(text: String, fallback: &str) -> String {
    if text.trim().is_empty() {
        fallback.to_string()
    } else {
        text
    }
}

/// Plain-text explanation shown to the user for a failed turn
pub fn user_facing_error(error: &anyhow::Error) -> &'static str {
    match error.downcast_ref::<PocketclawError>() {
        Some(PocketclawError::TurnTimeout(_)) => {
            "Sorry, that took too long. Please try again."
        }
        Some(PocketclawError::InferenceExhausted(_))
        | Some(PocketclawError::NoBackendAvailable)
        | Some(PocketclawError::Backend(_)) => {
            "Sorry, I can't reach a language model right now. Please try again in a moment."
        }
        Some(PocketclawError::Storage(_)) => {
            "Sorry, I couldn't load this conversation. Please try again."
        }
        _ => INTERNAL_ERROR_REPLY,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ToolsConfig;
    use crate::error::BackendError;
    use crate::providers::fake::ScriptedBackend;
    use crate::session::Role;
    use crate::test_utils::{
        captured_outbound, create_test_file, memory_session_store, scripted_router, temp_dir,
    };
    use crate::tools::registry_builder::CapabilityRegistryBuilder;
    use crate::tools::CapabilityCall;
    use serde_json::json;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    struct Harness {
        agent: AgentLoop,
        replies: mpsc::UnboundedReceiver<OutboundReply>,
        store: Arc<SessionStore>,
        _dir: TempDir,
    }

    fn harness(backend: ScriptedBackend, settings: AgentSettings) -> Harness {
        let dir = temp_dir();
        create_test_file(&dir, "notes.txt", "buy milk");
        let mut tools = ToolsConfig::default();
        tools.sandbox_root = Some(dir.path().to_path_buf());
        let dispatcher = CapabilityRegistryBuilder::new(tools)
            .build_dispatcher()
            .unwrap();

        let store = memory_session_store();
        let (outbound, replies) = captured_outbound("console");

        Harness {
            agent: AgentLoop::new(
                Arc::clone(&store),
                scripted_router(vec![backend]),
                Arc::new(dispatcher),
                outbound,
                settings,
            ),
            replies,
            store,
            _dir: dir,
        }
    }

    fn event(text: &str) -> CanonicalEvent {
        CanonicalEvent::new("console", "local", text)
    }

    #[tokio::test]
    async fn test_simple_turn_replies_and_commits() {
        let mut h = harness(ScriptedBackend::replying("b", "hello there"), AgentSettings::default());

        let outcome = h.agent.process(event("hi")).await;
        assert_eq!(outcome.status, TurnStatus::Completed);
        assert_eq!(outcome.reply.as_deref(), Some("hello there"));

        let reply = h.replies.recv().await.unwrap();
        assert_eq!(reply.user_id, "local");
        assert_eq!(reply.text, "hello there");

        let session = h.store.snapshot(&outcome.session_id).await.unwrap();
        let roles: Vec<Role> = session.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant]);
    }

    #[tokio::test]
    async fn test_capability_round_with_follow_up() {
        let backend = ScriptedBackend::replying("b", "Your note says to buy milk.").then_invoke(
            vec![CapabilityCall::new("read_file", json!({"path": "notes.txt"}))],
            "",
        );
        let mut h = harness(backend, AgentSettings::default());

        let outcome = h.agent.process(event("what's in my notes?")).await;
        assert_eq!(outcome.invocations, 1);
        assert_eq!(h.replies.recv().await.unwrap().text, "Your note says to buy milk.");

        let session = h.store.snapshot(&outcome.session_id).await.unwrap();
        let roles: Vec<Role> = session.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::ToolResult, Role::Assistant]);
        assert_eq!(session.messages[1].content, "buy milk");
        assert_eq!(session.messages[1].capability.as_deref(), Some("read_file"));
    }

    #[tokio::test]
    async fn test_failed_capability_is_folded_into_conversation() {
        let backend = ScriptedBackend::new("b").then_invoke(
            vec![CapabilityCall::new("read_file", json!({"path": "../etc/passwd"}))],
            "",
        );
        let mut settings = AgentSettings::default();
        settings.follow_up_round = false;
        let mut h = harness(backend, settings);

        let outcome = h.agent.process(event("read it")).await;
        assert_eq!(outcome.status, TurnStatus::Completed);
        let reply = h.replies.recv().await.unwrap();
        assert!(reply.text.starts_with("Error: validation rejected"));
    }

    #[tokio::test]
    async fn test_backend_failure_becomes_error_reply_without_mutation() {
        let backend = ScriptedBackend::failing("b", BackendError::Permanent("bad".into()));
        let mut h = harness(backend, AgentSettings::default());

        let outcome = h.agent.process(event("hi")).await;
        assert_eq!(outcome.status, TurnStatus::Failed);
        let reply = h.replies.recv().await.unwrap();
        assert!(reply.text.contains("language model"));
        assert!(!reply.text.contains("bad"));

        let session = h.store.snapshot(&outcome.session_id).await.unwrap();
        assert!(session.messages.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_turn_timeout() {
        let backend = ScriptedBackend::new("slow").with_latency(Duration::from_secs(60));
        let mut settings = AgentSettings::default();
        settings.turn_timeout = Duration::from_secs(1);
        let mut h = harness(backend, settings);

        let outcome = h.agent.process(event("hi")).await;
        assert_eq!(outcome.status, TurnStatus::Failed);
        assert!(h.replies.recv().await.unwrap().text.contains("too long"));
    }

    #[tokio::test]
    async fn test_empty_text_is_a_no_op() {
        let backend = ScriptedBackend::new("b");
        let mut h = harness(backend, AgentSettings::default());

        let outcome = h.agent.process(event("   ")).await;
        assert_eq!(outcome.status, TurnStatus::Skipped);
        assert!(h.replies.try_recv().is_err());
        assert_eq!(h.store.len().await, 1);
    }

    #[test]
    fn test_user_facing_error_hides_detail() {
        let err: anyhow::Error = PocketclawError::Internal("stack detail".into()).into();
        assert_eq!(user_facing_error(&err), INTERNAL_ERROR_REPLY);
        let err: anyhow::Error = PocketclawError::TurnTimeout(Duration::from_secs(1)).into();
        assert!(user_facing_error(&err).contains("too long"));
    }
}
