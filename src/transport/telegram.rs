//! Telegram surface
//!
//! Bot API long polling over HTTP. Updates are buffered as soon as a poll
//! returns and the update offset advances at the same moment, so dropping
//! a pending `receive_next` never loses or repeats an update.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use crate::config::SurfaceConfig;
use crate::error::{PocketclawError, Result};
use crate::transport::{FormattingHints, RawEvent, RawPart, TransportAdapter};

const DEFAULT_API_BASE: &str = "https://api.telegram.org";

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    #[serde(default)]
    message: Option<TgMessage>,
}

#[derive(Debug, Deserialize)]
struct TgMessage {
    chat: TgChat,
    #[serde(default)]
    date: i64,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    caption: Option<String>,
    #[serde(default)]
    document: Option<TgDocument>,
    #[serde(default)]
    photo: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    reply_markup: Option<TgReplyMarkup>,
}

#[derive(Debug, Deserialize)]
struct TgChat {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct TgDocument {
    #[serde(default)]
    file_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgReplyMarkup {
    #[serde(default)]
    inline_keyboard: Vec<Vec<TgButton>>,
}

#[derive(Debug, Deserialize)]
struct TgButton {
    text: String,
}

impl TgMessage {
    fn into_raw(self) -> Option<RawEvent> {
        let mut parts = Vec::new();
        if let Some(text) = self.text {
            parts.push(RawPart::Text(text));
        }
        if let Some(caption) = self.caption {
            parts.push(RawPart::Text(caption));
        }
        if self.photo.is_some() {
            parts.push(RawPart::Attachment {
                name: "photo".to_string(),
            });
        }
        if let Some(document) = self.document {
            parts.push(RawPart::Attachment {
                name: document.file_name.unwrap_or_else(|| "document".to_string()),
            });
        }
        if let Some(markup) = self.reply_markup {
            for button in markup.inline_keyboard.into_iter().flatten() {
                parts.push(RawPart::Button { label: button.text });
            }
        }
        if parts.is_empty() {
            return None;
        }
        Some(RawEvent {
            user_id: self.chat.id.to_string(),
            parts,
            timestamp: Utc
                .timestamp_opt(self.date, 0)
                .single()
                .unwrap_or_else(Utc::now),
        })
    }
}

/// Telegram Bot API surface
pub struct TelegramTransport {
    surface_id: String,
    client: Client,
    api_base: String,
    token: String,
    poll_timeout: Duration,
    offset: Mutex<i64>,
    buffer: Mutex<VecDeque<RawEvent>>,
}

impl TelegramTransport {
    /// Create the surface from its configuration
    ///
    /// # Errors
    ///
    /// Returns `PocketclawError::Config` when no bot token is available
    pub fn new(config: &SurfaceConfig) -> Result<Self> {
        let token = config.resolve_token().ok_or_else(|| {
            PocketclawError::Config(format!("telegram surface '{}' has no token", config.id))
        })?;
        let poll_timeout = Duration::from_secs(config.poll_timeout_secs);
        let client = Client::builder()
            .timeout(poll_timeout + Duration::from_secs(10))
            .build()?;
        Ok(Self {
            surface_id: config.id.clone(),
            client,
            api_base: config
                .api_base
                .clone()
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string())
                .trim_end_matches('/')
                .to_string(),
            token,
            poll_timeout,
            offset: Mutex::new(0),
            buffer: Mutex::new(VecDeque::new()),
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.token, method)
    }

    fn error(&self, message: impl Into<String>) -> PocketclawError {
        PocketclawError::Transport {
            surface: self.surface_id.clone(),
            message: message.into(),
        }
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T> {
        let response = request
            .send()
            .await
            .map_err(|e| self.error(format!("request failed: {}", e)))?;
        let status = response.status();
        let body: ApiResponse<T> = response
            .json()
            .await
            .map_err(|e| self.error(format!("invalid response (HTTP {}): {}", status, e)))?;
        if !body.ok {
            return Err(self
                .error(
                    body.description
                        .unwrap_or_else(|| format!("HTTP {}", status.as_u16())),
                )
                .into());
        }
        body.result
            .ok_or_else(|| self.error("response has no result").into())
    }

    fn pop_buffered(&self) -> Option<RawEvent> {
        self.buffer.lock().ok().and_then(|mut b| b.pop_front())
    }

    fn current_offset(&self) -> i64 {
        self.offset.lock().map(|o| *o).unwrap_or(0)
    }

    /// Buffer a poll result and advance the offset; no await in here
    fn absorb(&self, updates: Vec<Update>) {
        let Some(last) = updates.iter().map(|u| u.update_id).max() else {
            return;
        };
        if let Ok(mut offset) = self.offset.lock() {
            *offset = (*offset).max(last + 1);
        }
        if let Ok(mut buffer) = self.buffer.lock() {
            buffer.extend(
                updates
                    .into_iter()
                    .filter_map(|u| u.message)
                    .filter_map(TgMessage::into_raw),
            );
        }
    }
}

#[async_trait]
impl TransportAdapter for TelegramTransport {
    fn surface_id(&self) -> &str {
        &self.surface_id
    }

    async fn connect(&self) -> Result<()> {
        let _me: serde_json::Value = self.call(self.client.get(self.method_url("getMe"))).await?;
        tracing::debug!(surface = %self.surface_id, "Telegram bot authenticated");
        Ok(())
    }

    async fn receive_next(&self) -> Result<Option<RawEvent>> {
        loop {
            if let Some(event) = self.pop_buffered() {
                return Ok(Some(event));
            }
            let request = self.client.get(self.method_url("getUpdates")).query(&[
                ("offset", self.current_offset().to_string()),
                ("timeout", self.poll_timeout.as_secs().to_string()),
            ]);
            let updates: Vec<Update> = self.call(request).await?;
            self.absorb(updates);
        }
    }

    async fn send(&self, user_id: &str, text: &str, hints: &FormattingHints) -> Result<()> {
        let mut payload = json!({ "chat_id": user_id, "text": text });
        if hints.markdown {
            payload["parse_mode"] = json!("Markdown");
        }
        if let Some(reply_to) = &hints.reply_to {
            payload["reply_to_message_id"] = json!(reply_to);
        }
        let _sent: serde_json::Value = self
            .call(self.client.post(self.method_url("sendMessage")).json(&payload))
            .await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SurfaceKind;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer) -> SurfaceConfig {
        SurfaceConfig {
            id: "telegram".into(),
            kind: SurfaceKind::Telegram,
            enabled: true,
            token: Some("TEST".into()),
            token_env: None,
            api_base: Some(server.uri()),
            poll_timeout_secs: 0,
        }
    }

    #[test]
    fn test_error_response_without_result_decodes() {
        let body = r#"{"ok":false,"description":"Bad Request: chat not found"}"#;
        let resp: ApiResponse<Vec<Update>> = serde_json::from_str(body).unwrap();
        assert!(!resp.ok);
        assert!(resp.result.is_none());
        assert_eq!(
            resp.description.as_deref(),
            Some("Bad Request: chat not found")
        );

        let resp: ApiResponse<TgMessage> = serde_json::from_str(r#"{"ok":true}"#).unwrap();
        assert!(resp.ok);
        assert!(resp.result.is_none());
    }

    #[tokio::test]
    async fn test_connect_checks_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/botTEST/getMe"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "ok": false,
                "description": "Unauthorized"
            })))
            .mount(&server)
            .await;

        let transport = TelegramTransport::new(&config(&server)).unwrap();
        let err = transport.connect().await.unwrap_err();
        assert!(err.to_string().contains("Unauthorized"));
    }

    #[tokio::test]
    async fn test_receive_buffers_updates_and_advances_offset() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/botTEST/getUpdates"))
            .and(query_param("offset", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "result": [
                    {"update_id": 7, "message": {"chat": {"id": 42}, "date": 1700000000, "text": "hi"}},
                    {"update_id": 8, "message": {
                        "chat": {"id": 43},
                        "date": 1700000001,
                        "caption": "see file",
                        "document": {"file_name": "notes.pdf"},
                        "reply_markup": {"inline_keyboard": [[{"text": "OK"}]]}
                    }},
                    {"update_id": 9}
                ]
            })))
            .mount(&server)
            .await;

        let transport = TelegramTransport::new(&config(&server)).unwrap();
        let first = transport.receive_next().await.unwrap().unwrap();
        assert_eq!(first.user_id, "42");
        assert_eq!(first.parts, vec![RawPart::Text("hi".into())]);

        let second = transport.receive_next().await.unwrap().unwrap();
        assert_eq!(second.user_id, "43");
        assert_eq!(
            second.parts,
            vec![
                RawPart::Text("see file".into()),
                RawPart::Attachment {
                    name: "notes.pdf".into()
                },
                RawPart::Button { label: "OK".into() },
            ]
        );
        assert_eq!(transport.current_offset(), 10);
    }

    #[tokio::test]
    async fn test_send_posts_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botTEST/sendMessage"))
            .and(body_partial_json(json!({"chat_id": "42", "text": "hello"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "result": {"message_id": 1}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let transport = TelegramTransport::new(&config(&server)).unwrap();
        transport
            .send("42", "hello", &FormattingHints::default())
            .await
            .unwrap();
    }

    #[test]
    fn test_missing_token_is_config_error() {
        let mut cfg = SurfaceConfig::console("telegram");
        cfg.kind = SurfaceKind::Telegram;
        assert!(TelegramTransport::new(&cfg).is_err());
    }
}
