//! Credential providers
//!
//! Backends ask a [`CredentialProvider`] for a token by backend name and
//! never see where it came from. Refresh is the provider's concern.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::config::InferenceConfig;
use crate::error::{PocketclawError, Result};

/// Keyring service name under which backend keys are stored
pub const KEYRING_SERVICE: &str = "pocketclaw";

/// Opaque bearer token
#[derive(Clone, PartialEq, Eq)]
pub struct Token(String);

impl Token {
    /// Wrap a secret
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// The secret value, for building request headers
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(***)")
    }
}

/// Source of backend credentials
pub trait CredentialProvider: Send + Sync {
    /// Token for `provider`
    ///
    /// # Errors
    ///
    /// Returns `PocketclawError::Config` when no credential is available
    fn get_token(&self, provider: &str) -> Result<Token>;
}

fn missing(provider: &str, source: &str) -> anyhow::Error {
    PocketclawError::Config(format!("no {} credential for backend '{}'", source, provider)).into()
}

#[derive(Debug, Clone, Default)]
struct ConfiguredKey {
    inline: Option<String>,
    env: Option<String>,
}

/// Keys from the configuration file or named environment variables
#[derive(Debug, Clone, Default)]
pub struct ConfigCredentials {
    keys: BTreeMap<String, ConfiguredKey>,
}

impl ConfigCredentials {
    /// Collect the inline keys and variable names of every backend
    pub fn from_config(config: &InferenceConfig) -> Self {
        let keys = config
            .backends
            .iter()
            .map(|(name, backend)| {
                (
                    name.clone(),
                    ConfiguredKey {
                        inline: backend.api_key.clone(),
                        env: backend.api_key_env.clone(),
                    },
                )
            })
            .collect();
        Self { keys }
    }

    /// Register an inline key
    pub fn with_key(mut self, provider: &str, key: &str) -> Self {
        self.keys.entry(provider.to_string()).or_default().inline = Some(key.to_string());
        self
    }
}

impl CredentialProvider for ConfigCredentials {
    fn get_token(&self, provider: &str) -> Result<Token> {
        let key = self
            .keys
            .get(provider)
            .ok_or_else(|| missing(provider, "configured"))?;
        if let Some(inline) = key.inline.as_deref().filter(|k| !k.is_empty()) {
            return Ok(Token::new(inline));
        }
        if let Some(var) = &key.env {
            if let Ok(value) = std::env::var(var) {
                if !value.is_empty() {
                    return Ok(Token::new(value));
                }
            }
        }
        Err(missing(provider, "configured"))
    }
}

/// Keys stored in the OS keyring under [`KEYRING_SERVICE`]
///
/// Only backends that opted in with `use_keyring` are looked up.
#[derive(Debug, Clone)]
pub struct KeyringCredentials {
    service: String,
    providers: BTreeSet<String>,
}

impl KeyringCredentials {
    /// Keyring lookups for the backends that opted in
    pub fn from_config(config: &InferenceConfig) -> Self {
        Self {
            service: KEYRING_SERVICE.to_string(),
            providers: config
                .backends
                .iter()
                .filter(|(_, backend)| backend.use_keyring)
                .map(|(name, _)| name.clone())
                .collect(),
        }
    }
}

impl CredentialProvider for KeyringCredentials {
    fn get_token(&self, provider: &str) -> Result<Token> {
        if !self.providers.contains(provider) {
            return Err(missing(provider, "keyring"));
        }
        let entry = keyring::Entry::new(&self.service, provider)?;
        match entry.get_password() {
            Ok(secret) => Ok(Token::new(secret)),
            Err(keyring::Error::NoEntry) => Err(missing(provider, "keyring")),
            Err(e) => {
                tracing::warn!(backend = provider, error = %e, "Keyring lookup failed");
                Err(e.into())
            }
        }
    }
}

/// Try several providers in order
#[derive(Default)]
pub struct ChainCredentials {
    providers: Vec<Box<dyn CredentialProvider>>,
}

impl ChainCredentials {
    /// Empty chain
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a provider
    pub fn with(mut self, provider: impl CredentialProvider + 'static) -> Self {
        self.providers.push(Box::new(provider));
        self
    }

    /// Configuration first, keyring second
    pub fn from_config(config: &InferenceConfig) -> Self {
        Self::new()
            .with(ConfigCredentials::from_config(config))
            .with(KeyringCredentials::from_config(config))
    }
}

impl CredentialProvider for ChainCredentials {
    fn get_token(&self, provider: &str) -> Result<Token> {
        for source in &self.providers {
            if let Ok(token) = source.get_token(provider) {
                return Ok(token);
            }
        }
        Err(missing(provider, "usable"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_token_debug_is_redacted() {
        let token = Token::new("sk-secret");
        assert_eq!(format!("{:?}", token), "Token(***)");
        assert_eq!(token.expose(), "sk-secret");
    }

    #[test]
    #[serial]
    fn test_config_credentials_inline_then_env() {
        let mut config = InferenceConfig::default();
        std::env::remove_var("OPENROUTER_API_KEY");
        let creds = ConfigCredentials::from_config(&config);
        assert!(creds.get_token("openrouter").is_err());

        std::env::set_var("OPENROUTER_API_KEY", "from-env");
        assert_eq!(
            creds.get_token("openrouter").unwrap().expose(),
            "from-env"
        );

        if let Some(backend) = config.backends.get_mut("openrouter") {
            backend.api_key = Some("inline".into());
        }
        let creds = ConfigCredentials::from_config(&config);
        assert_eq!(creds.get_token("openrouter").unwrap().expose(), "inline");
        std::env::remove_var("OPENROUTER_API_KEY");
    }

    #[test]
    fn test_chain_falls_through() {
        let chain = ChainCredentials::new()
            .with(ConfigCredentials::default())
            .with(ConfigCredentials::default().with_key("local", "k"));
        assert_eq!(chain.get_token("local").unwrap().expose(), "k");
        assert!(chain.get_token("other").is_err());
    }

    #[test]
    fn test_keyring_skips_backends_without_opt_in() {
        let creds = KeyringCredentials::from_config(&InferenceConfig::default());
        let err = creds.get_token("openrouter").unwrap_err();
        assert!(err.to_string().contains("keyring"));
    }
}
