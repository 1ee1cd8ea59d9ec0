//! Backend contract and generation types
//!
//! This module defines the [`Backend`] trait every inference adapter
//! implements, the request/result values that flow through the router, and
//! the wire message shape shared by the chat-style adapters.

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::error::BackendError;
use crate::session::{Message, Role};
use crate::tools::{CapabilityCall, CapabilityDescriptor};

/// Per-request generation parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    /// Backend tried first for this request, ahead of the configured order
    #[serde(default)]
    pub backend_preference: Option<String>,
    /// Sampling temperature
    pub temperature: f32,
    /// Upper bound on generated output units
    pub max_output_tokens: u32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            backend_preference: None,
            temperature: 0.7,
            max_output_tokens: 1024,
        }
    }
}

/// Request for one generation round
///
/// `history` is already bounded to the context window, oldest first. An
/// empty `input` means the history already ends with the prompt, which is
/// how the follow-up round after capability results is expressed.
#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    /// Instructions prepended ahead of the history
    pub system_prompt: Option<String>,
    /// Most recent session messages, oldest first
    pub history: Vec<Message>,
    /// New user input for this round
    pub input: String,
    /// Capabilities the model may invoke
    pub capabilities: Vec<CapabilityDescriptor>,
    /// Generation parameters
    pub params: GenerationParams,
}

impl GenerationRequest {
    /// Request with only user input
    ///
    /// # Examples
    ///
    /// ```
    /// use pocketclaw::providers::GenerationRequest;
    ///
    /// let request = GenerationRequest::new("What time is it?");
    /// assert!(request.history.is_empty());
    /// assert_eq!(request.input, "What time is it?");
    /// ```
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            ..Self::default()
        }
    }

    /// Names of the advertised capabilities
    pub fn capability_names(&self) -> Vec<&str> {
        self.capabilities.iter().map(|c| c.name.as_str()).collect()
    }
}

/// Resource usage reported by a backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Units consumed by the prompt
    pub input_units: u32,
    /// Units produced by the generation
    pub output_units: u32,
}

impl Usage {
    /// Create a usage record
    pub fn new(input_units: u32, output_units: u32) -> Self {
        Self {
            input_units,
            output_units,
        }
    }

    /// Input plus output units
    pub fn total(&self) -> u32 {
        self.input_units.saturating_add(self.output_units)
    }
}

/// Result of one generation round
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationResult {
    /// Generated text (may be empty when only invocations were requested)
    pub text: String,
    /// Usage counters
    pub usage: Usage,
    /// Capability invocations requested before the reply is final
    pub invocations: Vec<CapabilityCall>,
    /// Backend that produced the result
    pub backend: String,
}

impl GenerationResult {
    /// Text-only result
    pub fn text(backend: &str, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            backend: backend.to_string(),
            ..Self::default()
        }
    }

    /// Returns true when the model asked for capability invocations
    pub fn has_invocations(&self) -> bool {
        !self.invocations.is_empty()
    }
}

/// Lazy, finite, non-restartable sequence of text fragments
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, BackendError>> + Send>>;

/// Inference backend adapter
///
/// Implementations translate a [`GenerationRequest`] into one provider's
/// wire protocol and classify every failure into a [`BackendError`] so the
/// router can decide between retrying, falling back, and giving up.
///
/// # Examples
///
/// ```
/// use async_trait::async_trait;
/// use pocketclaw::error::BackendError;
/// use pocketclaw::providers::{Backend, GenerationRequest, GenerationResult};
///
/// struct Echo;
///
/// #[async_trait]
/// impl Backend for Echo {
///     fn name(&self) -> &str {
///         "echo"
///     }
///
///     async fn generate(
///         &self,
///         request: &GenerationRequest,
///     ) -> Result<GenerationResult, BackendError> {
///         Ok(GenerationResult::text(self.name(), request.input.clone()))
///     }
/// }
/// ```
#[async_trait]
pub trait Backend: Send + Sync {
    /// Configured backend name
    fn name(&self) -> &str;

    /// Produce a complete result
    async fn generate(&self, request: &GenerationRequest)
        -> Result<GenerationResult, BackendError>;

    /// Whether [`Backend::stream`] yields incremental output
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Produce text fragments as they are generated
    ///
    /// The default runs [`Backend::generate`] and yields its text as a
    /// single fragment.
    async fn stream(&self, request: &GenerationRequest) -> Result<FragmentStream, BackendError> {
        let result = self.generate(request).await?;
        Ok(Box::pin(futures::stream::once(async move { Ok(result.text) })))
    }
}

/// Drain a fragment stream and concatenate it
pub async fn collect_stream(mut stream: FragmentStream) -> Result<String, BackendError> {
    let mut text = String::new();
    while let Some(fragment) = stream.next().await {
        text.push_str(&fragment?);
    }
    Ok(text)
}

/// Chat message in the shape shared by the chat-style wire protocols
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// `system`, `user` or `assistant`
    pub role: String,
    /// Message text
    pub content: String,
}

impl ChatMessage {
    fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

/// Flatten a request into chat messages
///
/// Capability results are presented to the model as user-role messages
/// prefixed with the capability name, so every backend understands them
/// regardless of its native tool-calling support.
pub fn render_messages(request: &GenerationRequest) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(request.history.len() + 2);
    if let Some(prompt) = request.system_prompt.as_deref().filter(|p| !p.is_empty()) {
        messages.push(ChatMessage::new("system", prompt));
    }
    for message in &request.history {
        let rendered = match message.role {
            Role::User => ChatMessage::new("user", message.content.clone()),
            Role::Assistant => ChatMessage::new("assistant", message.content.clone()),
            Role::System => ChatMessage::new("system", message.content.clone()),
            Role::ToolResult => ChatMessage::new(
                "user",
                format!(
                    "Result of {}:\n{}",
                    message.capability.as_deref().unwrap_or("capability"),
                    message.content
                ),
            ),
        };
        messages.push(rendered);
    }
    if !request.input.is_empty() {
        messages.push(ChatMessage::new("user", request.input.clone()));
    }
    messages
}

/// Parse capability arguments delivered as a JSON string
///
/// Unparseable arguments are kept as a string value so the capability's
/// own validation rejects them with a typed error.
pub(crate) fn parse_arguments(raw: &str) -> serde_json::Value {
    if raw.trim().is_empty() {
        return serde_json::json!({});
    }
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_messages_orders_and_flattens() {
        let request = GenerationRequest {
            system_prompt: Some("be brief".into()),
            history: vec![
                Message::user("list files", "console", "local"),
                Message::tool_result("list_directory", "a.txt\nb/", "console", "local"),
                Message::assistant("two entries", "console", "local"),
            ],
            input: "thanks".into(),
            ..GenerationRequest::default()
        };

        let messages = render_messages(&request);
        let roles: Vec<&str> = messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "user", "user", "assistant", "user"]);
        assert_eq!(messages[2].content, "Result of list_directory:\na.txt\nb/");
        assert_eq!(messages[4].content, "thanks");
    }

    #[test]
    fn test_empty_input_is_not_rendered() {
        let request = GenerationRequest {
            history: vec![Message::user("hi", "s", "u")],
            ..GenerationRequest::default()
        };
        assert_eq!(render_messages(&request).len(), 1);
    }

    #[test]
    fn test_parse_arguments() {
        assert_eq!(parse_arguments(r#"{"path":"a"}"#), json!({"path": "a"}));
        assert_eq!(parse_arguments(""), json!({}));
        assert_eq!(parse_arguments("{oops"), json!("{oops"));
    }

    struct Fixed;

    #[async_trait]
    impl Backend for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn generate(
            &self,
            _request: &GenerationRequest,
        ) -> Result<GenerationResult, BackendError> {
            Ok(GenerationResult::text("fixed", "whole answer"))
        }
    }

    #[tokio::test]
    async fn test_default_stream_yields_one_fragment() {
        let backend = Fixed;
        assert!(!backend.supports_streaming());
        let stream = backend.stream(&GenerationRequest::new("q")).await.unwrap();
        assert_eq!(collect_stream(stream).await.unwrap(), "whole answer");
    }

    #[test]
    fn test_collect_stream_stops_at_error() {
        let stream: FragmentStream = Box::pin(futures::stream::iter(vec![
            Ok("a".to_string()),
            Err(BackendError::Unavailable("reset".into())),
        ]));
        assert!(tokio_test::block_on(collect_stream(stream)).is_err());
    }
}
