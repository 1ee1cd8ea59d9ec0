//! Chat-completions backend
//!
//! Speaks the OpenAI-style `/chat/completions` protocol, which covers
//! OpenRouter, OpenAI and most self-hosted gateways. Streaming uses
//! server-sent events.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{future, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::BackendConfig;
use crate::error::{BackendError, Result};
use crate::providers::base::{parse_arguments, render_messages, ChatMessage};
use crate::providers::credentials::CredentialProvider;
use crate::providers::http::{line_stream, send_checked};
use crate::providers::{Backend, FragmentStream, GenerationRequest, GenerationResult, Usage};
use crate::tools::{CapabilityCall, CapabilityDescriptor};

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ChatTool>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatTool {
    r#type: &'static str,
    function: ChatFunction,
}

#[derive(Debug, Serialize)]
struct ChatFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

impl From<&CapabilityDescriptor> for ChatTool {
    fn from(descriptor: &CapabilityDescriptor) -> Self {
        Self {
            r#type: "function",
            function: ChatFunction {
                name: descriptor.name.clone(),
                description: descriptor.description.clone(),
                parameters: descriptor.parameters.clone(),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ChatToolCall>,
}

#[derive(Debug, Deserialize)]
struct ChatToolCall {
    #[serde(default)]
    id: Option<String>,
    function: ChatFunctionCall,
}

#[derive(Debug, Deserialize)]
struct ChatFunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Payload of one SSE `data:` line
enum SseEvent {
    Fragment(String),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> SseEvent {
    let Some(data) = line.strip_prefix("data:").map(str::trim) else {
        return SseEvent::Skip;
    };
    if data == "[DONE]" {
        return SseEvent::Done;
    }
    match serde_json::from_str::<ChatChunk>(data) {
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta.content)
            .filter(|content| !content.is_empty())
            .map(SseEvent::Fragment)
            .unwrap_or(SseEvent::Skip),
        Err(e) => {
            tracing::debug!(error = %e, "Ignoring unparseable stream chunk");
            SseEvent::Skip
        }
    }
}

/// Backend for chat-completions style APIs
pub struct OpenAiCompatBackend {
    name: String,
    client: Client,
    base_url: String,
    model: String,
    credentials: Option<Arc<dyn CredentialProvider>>,
}

impl OpenAiCompatBackend {
    /// Create the backend
    ///
    /// `credentials` is `None` for endpoints that need no authorization.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built
    pub fn new(
        name: &str,
        config: &BackendConfig,
        credentials: Option<Arc<dyn CredentialProvider>>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            name: name.to_string(),
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            credentials,
        })
    }

    fn build_request(&self, request: &GenerationRequest, stream: bool) -> ChatRequest {
        ChatRequest {
            model: self.model.clone(),
            messages: render_messages(request),
            temperature: request.params.temperature,
            max_tokens: request.params.max_output_tokens,
            tools: request.capabilities.iter().map(ChatTool::from).collect(),
            stream,
        }
    }

    fn post(&self, body: &ChatRequest) -> std::result::Result<reqwest::RequestBuilder, BackendError> {
        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(body);
        if let Some(credentials) = &self.credentials {
            let token = credentials
                .get_token(&self.name)
                .map_err(|e| BackendError::Permanent(e.to_string()))?;
            builder = builder.bearer_auth(token.expose());
        }
        Ok(builder)
    }
}

#[async_trait]
impl Backend for OpenAiCompatBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> std::result::Result<GenerationResult, BackendError> {
        let body = self.build_request(request, false);
        tracing::debug!(
            backend = %self.name,
            messages = body.messages.len(),
            tools = body.tools.len(),
            "Sending chat completion request"
        );

        let response = send_checked(self.post(&body)?).await?;
        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Unavailable(format!("invalid response body: {}", e)))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::Unavailable("response has no choices".to_string()))?;
        let invocations = choice
            .message
            .tool_calls
            .into_iter()
            .map(|call| {
                let mut invocation =
                    CapabilityCall::new(call.function.name, parse_arguments(&call.function.arguments));
                if let Some(id) = call.id {
                    invocation.id = id;
                }
                invocation
            })
            .collect();
        let usage = parsed
            .usage
            .map(|u| Usage::new(u.prompt_tokens, u.completion_tokens))
            .unwrap_or_default();

        Ok(GenerationResult {
            text: choice.message.content.unwrap_or_default(),
            usage,
            invocations,
            backend: self.name.clone(),
        })
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn stream(
        &self,
        request: &GenerationRequest,
    ) -> std::result::Result<FragmentStream, BackendError> {
        let body = self.build_request(request, true);
        let response = send_checked(self.post(&body)?).await?;
        let fragments = line_stream(response)
            .map(|line| line.map(|l| parse_sse_line(&l)))
            .take_while(|event| future::ready(!matches!(event, Ok(SseEvent::Done))))
            .filter_map(|event| {
                future::ready(match event {
                    Ok(SseEvent::Fragment(text)) => Some(Ok(text)),
                    Ok(_) => None,
                    Err(e) => Some(Err(e)),
                })
            });
        Ok(Box::pin(fragments))
    }
}
