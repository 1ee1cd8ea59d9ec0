//! Inference router and backend adapters
//!
//! - [`base`] - the [`Backend`] contract and generation types
//! - [`router`] - fallback chain, retry and health bookkeeping
//! - [`openai`] / [`ollama`] - HTTP backends
//! - [`credentials`] - API key sources
//! - [`fake`] - scripted backend for tests and demos

pub mod base;
pub mod credentials;
pub mod fake;
mod http;
pub mod ollama;
pub mod openai;
pub mod router;

pub use base::{
    collect_stream, render_messages, Backend, ChatMessage, FragmentStream, GenerationParams,
    GenerationRequest, GenerationResult, Usage,
};
pub use credentials::{
    ChainCredentials, ConfigCredentials, CredentialProvider, KeyringCredentials, Token,
};
pub use ollama::OllamaBackend;
pub use openai::OpenAiCompatBackend;
pub use router::{BackendHealth, InferenceRouter, RouterSettings};

use std::sync::Arc;

use crate::config::{BackendConfig, BackendKind};
use crate::error::Result;

/// Create a backend instance from its configuration
///
/// Chat-completions backends only send an authorization header when the
/// configuration names a credential source.
///
/// # Errors
///
/// Returns an error if the backend's HTTP client cannot be built
pub fn create_backend(
    name: &str,
    config: &BackendConfig,
    credentials: Arc<dyn CredentialProvider>,
) -> Result<Arc<dyn Backend>> {
    match config.kind {
        BackendKind::OpenaiCompat => {
            let needs_key =
                config.api_key.is_some() || config.api_key_env.is_some() || config.use_keyring;
            Ok(Arc::new(OpenAiCompatBackend::new(
                name,
                config,
                needs_key.then_some(credentials),
            )?))
        }
        BackendKind::Ollama => Ok(Arc::new(OllamaBackend::new(name, config)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InferenceConfig;

    #[test]
    fn test_create_backend_by_kind() {
        let config = InferenceConfig::default();
        let credentials: Arc<dyn CredentialProvider> = Arc::new(ChainCredentials::new());
        let mut backend_config = config.backends["openrouter"].clone();
        let backend = create_backend("openrouter", &backend_config, Arc::clone(&credentials)).unwrap();
        assert_eq!(backend.name(), "openrouter");
        assert!(backend.supports_streaming());

        backend_config.kind = BackendKind::Ollama;
        let backend = create_backend("local", &backend_config, credentials).unwrap();
        assert_eq!(backend.name(), "local");
    }

    #[test]
    fn test_router_from_default_config() {
        let router = InferenceRouter::from_config(&InferenceConfig::default()).unwrap();
        assert_eq!(router.backend_names(), vec!["openrouter"]);
    }
}
