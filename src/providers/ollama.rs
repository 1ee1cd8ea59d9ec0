//! Ollama backend
//!
//! Connects to a local or remote Ollama server through `/api/chat`, with
//! tool calling and newline-delimited JSON streaming.

use std::time::Duration;

use async_trait::async_trait;
use futures::{future, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::BackendConfig;
use crate::error::{BackendError, Result};
use crate::providers::base::{render_messages, ChatMessage};
use crate::providers::http::{line_stream, send_checked};
use crate::providers::{Backend, FragmentStream, GenerationRequest, GenerationResult, Usage};
use crate::tools::CapabilityCall;

/// Request structure for Ollama API
#[derive(Debug, Serialize)]
struct OllamaRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<OllamaTool>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_predict: u32,
}

/// Tool definition for Ollama API
#[derive(Debug, Serialize)]
struct OllamaTool {
    r#type: String,
    function: OllamaFunction,
}

/// Function definition for Ollama tools
#[derive(Debug, Serialize)]
struct OllamaFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

/// Response message from Ollama
#[derive(Debug, Default, Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Vec<OllamaToolCall>,
}

/// Tool call in Ollama format; arguments arrive as an object
#[derive(Debug, Deserialize)]
struct OllamaToolCall {
    function: OllamaFunctionCall,
}

#[derive(Debug, Deserialize)]
struct OllamaFunctionCall {
    name: String,
    #[serde(default)]
    arguments: serde_json::Value,
}

/// Response (or stream chunk) from `/api/chat`
#[derive(Debug, Deserialize)]
struct OllamaResponse {
    #[serde(default)]
    message: OllamaMessage,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    prompt_eval_count: u32,
    #[serde(default)]
    eval_count: u32,
    #[serde(default)]
    error: Option<String>,
}

/// Ollama API backend
///
/// # Examples
///
/// ```no_run
/// use pocketclaw::config::{BackendConfig, BackendKind};
/// use pocketclaw::providers::{Backend, GenerationRequest, OllamaBackend};
///
/// # async fn example() -> pocketclaw::error::Result<()> {
/// let config = BackendConfig {
///     kind: BackendKind::Ollama,
///     base_url: "http://localhost:11434".to_string(),
///     model: "llama3.2:latest".to_string(),
///     api_key: None,
///     api_key_env: None,
///     use_keyring: false,
///     request_timeout_secs: 120,
/// };
/// let backend = OllamaBackend::new("local", &config)?;
/// let result = backend.generate(&GenerationRequest::new("Hello!")).await?;
/// println!("{}", result.text);
/// # Ok(())
/// # }
/// ```
pub struct OllamaBackend {
    name: String,
    client: Client,
    host: String,
    model: String,
}

impl OllamaBackend {
    /// Create the backend
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built
    pub fn new(name: &str, config: &BackendConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            name: name.to_string(),
            client,
            host: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
        })
    }

    fn build_request(&self, request: &GenerationRequest, stream: bool) -> OllamaRequest {
        OllamaRequest {
            model: self.model.clone(),
            messages: render_messages(request),
            tools: request
                .capabilities
                .iter()
                .map(|c| OllamaTool {
                    r#type: "function".to_string(),
                    function: OllamaFunction {
                        name: c.name.clone(),
                        description: c.description.clone(),
                        parameters: c.parameters.clone(),
                    },
                })
                .collect(),
            stream,
            options: OllamaOptions {
                temperature: request.params.temperature,
                num_predict: request.params.max_output_tokens,
            },
        }
    }

    fn post(&self, body: &OllamaRequest) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}/api/chat", self.host))
            .json(body)
    }
}

fn parse_chunk(line: &str) -> Option<std::result::Result<OllamaResponse, BackendError>> {
    if line.trim().is_empty() {
        return None;
    }
    Some(
        serde_json::from_str::<OllamaResponse>(line)
            .map_err(|e| BackendError::Unavailable(format!("invalid stream chunk: {}", e)))
            .and_then(|chunk| match chunk.error {
                Some(error) => Err(BackendError::Unavailable(error)),
                None => Ok(chunk),
            }),
    )
}

#[async_trait]
impl Backend for OllamaBackend {
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
            "Sending Ollama request"
        );

        let response = send_checked(self.post(&body)).await.map_err(|e| {
            tracing::error!(backend = %self.name, error = %e, "Ollama request failed");
            e
        })?;
        let parsed: OllamaResponse = response.json().await.map_err(|e| {
            tracing::error!(backend = %self.name, error = %e, "Failed to parse Ollama response");
            BackendError::Unavailable(format!("invalid response body: {}", e))
        })?;
        if let Some(error) = parsed.error {
            return Err(BackendError::Permanent(error));
        }

        tracing::debug!(
            backend = %self.name,
            done = parsed.done,
            prompt_tokens = parsed.prompt_eval_count,
            completion_tokens = parsed.eval_count,
            "Ollama response"
        );

        let invocations = parsed
            .message
            .tool_calls
            .into_iter()
            .map(|call| {
                let arguments = match call.function.arguments {
                    serde_json::Value::Null => serde_json::json!({}),
                    other => other,
                };
                CapabilityCall::new(call.function.name, arguments)
            })
            .collect();

        Ok(GenerationResult {
            text: parsed.message.content,
            usage: Usage::new(parsed.prompt_eval_count, parsed.eval_count),
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
        let response = send_checked(self.post(&body)).await?;

        // Yield each chunk's text; the chunk flagged `done` ends the stream
        let fragments = line_stream(response)
            .filter_map(|line| {
                future::ready(match line {
                    Ok(line) => parse_chunk(&line),
                    Err(e) => Some(Err(e)),
                })
            })
            .scan(false, |finished, chunk| {
                if *finished {
                    return future::ready(None);
                }
                let item = chunk.map(|c| {
                    *finished = c.done;
                    c.message.content
                });
                if item.is_err() {
                    *finished = true;
                }
                future::ready(Some(item))
            })
            .filter(|item| future::ready(!matches!(item, Ok(text) if text.is_empty())));
        Ok(Box::pin(fragments))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendKind;
    use crate::providers::collect_stream;
    use crate::tools::CapabilityDescriptor;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn backend(server: &MockServer) -> OllamaBackend {
        let config = BackendConfig {
            kind: BackendKind::Ollama,
            base_url: server.uri(),
            model: "llama3.2:latest".into(),
            api_key: None,
            api_key_env: None,
            use_keyring: false,
            request_timeout_secs: 5,
        };
        OllamaBackend::new("local", &config).unwrap()
    }

    #[tokio::test]
    async fn test_generate_with_tool_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_partial_json(json!({
                "model": "llama3.2:latest",
                "stream": false
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "message": {
                    "role": "assistant",
                    "content": "",
                    "tool_calls": [{"function": {"name": "shell", "arguments": {"program": "ls"}}}]
                },
                "done": true,
                "prompt_eval_count": 30,
                "eval_count": 8
            })))
            .mount(&server)
            .await;

        let mut request = GenerationRequest::new("list files");
        request.capabilities = vec![CapabilityDescriptor {
            name: "shell".into(),
            description: "run a program".into(),
            parameters: json!({"type": "object"}),
        }];
        let result = backend(&server).generate(&request).await.unwrap();

        assert_eq!(result.text, "");
        assert_eq!(result.usage.total(), 38);
        assert_eq!(result.invocations[0].name, "shell");
        assert_eq!(result.invocations[0].arguments, json!({"program": "ls"}));
    }

    #[tokio::test]
    async fn test_server_error_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("loading model"))
            .mount(&server)
            .await;

        let err = backend(&server)
            .generate(&GenerationRequest::new("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Unavailable(msg) if msg.contains("503")));
    }

    #[tokio::test]
    async fn test_stream_ndjson() {
        let server = MockServer::start().await;
        let body = concat!(
            "{\"message\":{\"content\":\"Good \"},\"done\":false}\n",
            "{\"message\":{\"content\":\"morning\"},\"done\":false}\n",
            "{\"message\":{\"content\":\"\"},\"done\":true,\"eval_count\":2}\n",
        );
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"stream": true})))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let stream = backend(&server)
            .stream(&GenerationRequest::new("hi"))
            .await
            .unwrap();
        assert_eq!(collect_stream(stream).await.unwrap(), "Good morning");
    }

    #[tokio::test]
    async fn test_stream_error_chunk() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("{\"message\":{\"content\":\"a\"}}\n{\"error\":\"model crashed\"}\n"),
            )
            .mount(&server)
            .await;

        let stream = backend(&server)
            .stream(&GenerationRequest::new("hi"))
            .await
            .unwrap();
        let err = collect_stream(stream).await.unwrap_err();
        assert_eq!(err, BackendError::Unavailable("model crashed".into()));
    }
}
