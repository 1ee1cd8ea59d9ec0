//! Scripted in-process backend
//!
//! [`ScriptedBackend`] answers from a queue of canned outcomes, which lets
//! tests and demos drive the router and the agent loop without any network
//! I/O. Once the script is exhausted it repeats its default outcome.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::BackendError;
use crate::providers::{Backend, FragmentStream, GenerationRequest, GenerationResult, Usage};
use crate::tools::CapabilityCall;

/// One canned outcome
#[derive(Debug, Clone)]
pub enum Scripted {
    /// Reply with the request input (or the last history message)
    Echo,
    /// Reply with fixed text
    Reply(String),
    /// Request capability invocations, with optional accompanying text
    Invoke(Vec<CapabilityCall>, String),
    /// Fail with the given error
    Fail(BackendError),
}

/// Backend that replays a script
pub struct ScriptedBackend {
    name: String,
    script: Mutex<VecDeque<Scripted>>,
    default: Scripted,
    latency: Option<Duration>,
    calls: AtomicUsize,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedBackend {
    /// Backend that echoes its input
    pub fn new(name: &str) -> Self {
        Self::with_default(name, Scripted::Echo)
    }

    /// Backend that always replies with `text`
    pub fn replying(name: &str, text: &str) -> Self {
        Self::with_default(name, Scripted::Reply(text.to_string()))
    }

    /// Backend that always fails with `error`
    pub fn failing(name: &str, error: BackendError) -> Self {
        Self::with_default(name, Scripted::Fail(error))
    }

    fn with_default(name: &str, default: Scripted) -> Self {
        Self {
            name: name.to_string(),
            script: Mutex::new(VecDeque::new()),
            default,
            latency: None,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queue a reply
    pub fn then_reply(self, text: &str) -> Self {
        self.then(Scripted::Reply(text.to_string()))
    }

    /// Queue a failure
    pub fn then_fail(self, error: BackendError) -> Self {
        self.then(Scripted::Fail(error))
    }

    /// Queue a capability request
    pub fn then_invoke(self, calls: Vec<CapabilityCall>, text: &str) -> Self {
        self.then(Scripted::Invoke(calls, text.to_string()))
    }

    /// Queue any outcome
    pub fn then(self, outcome: Scripted) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(outcome);
        }
        self
    }

    /// Wait this long before answering
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Number of generate/stream calls so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every request received, in order
    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn next_outcome(&self) -> Scripted {
        self.script
            .lock()
            .ok()
            .and_then(|mut script| script.pop_front())
            .unwrap_or_else(|| self.default.clone())
    }
}

fn echo_text(request: &GenerationRequest) -> String {
    if !request.input.is_empty() {
        return request.input.clone();
    }
    request
        .history
        .last()
        .map(|m| m.content.clone())
        .unwrap_or_default()
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResult, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let usage = Usage::new(request.input.len() as u32, 0);
        match self.next_outcome() {
            Scripted::Echo => Ok(GenerationResult {
                usage,
                ..GenerationResult::text(&self.name, echo_text(request))
            }),
            Scripted::Reply(text) => Ok(GenerationResult {
                usage,
                ..GenerationResult::text(&self.name, text)
            }),
            Scripted::Invoke(invocations, text) => Ok(GenerationResult {
                text,
                usage,
                invocations,
                backend: self.name.clone(),
            }),
            Scripted::Fail(error) => Err(error),
        }
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn stream(&self, request: &GenerationRequest) -> Result<FragmentStream, BackendError> {
        let result = self.generate(request).await?;
        let fragments: Vec<Result<String, BackendError>> = result
            .text
            .split_inclusive(' ')
            .map(|word| Ok(word.to_string()))
            .collect();
        Ok(Box::pin(futures::stream::iter(fragments)))
    }
}
