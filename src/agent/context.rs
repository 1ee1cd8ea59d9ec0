//! Generation request assembly
//!
//! Builds the [`GenerationRequest`] for each round of a turn from the
//! session snapshot, bounded to the configured context window.

use crate::config::AgentConfig;
use crate::providers::{GenerationParams, GenerationRequest};
use crate::session::{Message, Session};
use crate::tools::CapabilityDescriptor;

/// Request-shaping settings derived from the agent configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ContextSettings {
    /// Most recent history messages sent with each request
    pub context_window: usize,
    /// Optional instructions placed ahead of the history
    pub system_prompt: Option<String>,
    /// Generation parameters
    pub params: GenerationParams,
}

impl From<&AgentConfig> for ContextSettings {
    fn from(config: &AgentConfig) -> Self {
        Self {
            context_window: config.context_window,
            system_prompt: config.system_prompt.clone(),
            params: GenerationParams {
                backend_preference: None,
                temperature: config.temperature,
                max_output_tokens: config.max_output_tokens,
            },
        }
    }
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self::from(&AgentConfig::default())
    }
}

/// First round: recent history plus the new input, with capabilities
pub fn initial_request(
    session: &Session,
    input: &str,
    capabilities: Vec<CapabilityDescriptor>,
    settings: &ContextSettings,
) -> GenerationRequest {
    GenerationRequest {
        system_prompt: settings.system_prompt.clone(),
        history: session.recent(settings.context_window),
        input: input.to_string(),
        capabilities,
        params: settings.params.clone(),
    }
}

/// Follow-up round after capability results
///
/// The messages staged so far in this turn (user input, any interim text,
/// tool results) always go in full; older history fills whatever is left
/// of the window. No capabilities are offered, so the round must end with
/// text.
pub fn follow_up_request(
    session: &Session,
    staged: &[Message],
    settings: &ContextSettings,
) -> GenerationRequest {
    let older = settings.context_window.saturating_sub(staged.len());
    let mut history = session.recent(older);
    history.extend(staged.iter().cloned());
    GenerationRequest {
        system_prompt: settings.system_prompt.clone(),
        history,
        input: String::new(),
        capabilities: Vec::new(),
        params: settings.params.clone(),
    }
}
