//! Capability dispatcher and capability adapters
//!
//! A capability is a named, sandboxed action the assistant may ask the
//! runtime to perform. Every capability implements [`Capability`]: it
//! validates raw arguments into [`ValidatedArgs`] before any side effect and
//! then executes against a deadline. The [`Dispatcher`] drives that contract
//! and converts every outcome into a [`CapabilityResult`].

pub mod device;
pub mod dispatcher;
pub mod fetch;
pub mod file_ops;
pub mod messaging;
pub mod registry_builder;
pub mod sandbox;
pub mod schedule;
pub mod shell;

pub use dispatcher::{CapabilityResult, Dispatcher};
pub use registry_builder::CapabilityRegistryBuilder;

use crate::error::CapabilityError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;

/// Capability invocation requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityCall {
    /// Backend-assigned call identifier
    pub id: String,
    /// Capability name
    pub name: String,
    /// Raw argument mapping
    pub arguments: serde_json::Value,
}

impl CapabilityCall {
    /// Build a call with a generated identifier
    pub fn new(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            name: name.into(),
            arguments,
        }
    }
}

/// Capability advertised to inference backends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    /// Capability name
    pub name: String,
    /// What the capability does
    pub description: String,
    /// JSON schema for the arguments
    pub parameters: serde_json::Value,
}

/// Conversation a capability is invoked on behalf of
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvocationContext {
    /// Session the turn belongs to
    pub session_id: String,
    /// Originating surface
    pub surface_id: String,
    /// Originating user
    pub user_id: String,
}

/// Arguments that passed a capability's admission checks
///
/// Wraps the capability's own parsed parameter type so `execute` never sees
/// unvalidated input.
pub struct ValidatedArgs {
    capability: String,
    params: Box<dyn Any + Send + Sync>,
}

impl ValidatedArgs {
    /// Wrap parsed parameters for `capability`
    pub fn new<T: Any + Send + Sync>(capability: &str, params: T) -> Self {
        Self {
            capability: capability.to_string(),
            params: Box::new(params),
        }
    }

    /// Capability the arguments were validated for
    pub fn capability(&self) -> &str {
        &self.capability
    }

    /// Recover the parsed parameters
    ///
    /// # Errors
    ///
    /// Returns `CapabilityError::ExecutionFailed` when the arguments were
    /// validated for a different parameter type
    pub fn into_params<T: Any>(self) -> Result<T, CapabilityError> {
        self.params
            .downcast::<T>()
            .map(|boxed| *boxed)
            .map_err(|_| {
                CapabilityError::ExecutionFailed(format!(
                    "arguments for {} have an unexpected type",
                    self.capability
                ))
            })
    }
}

impl fmt::Debug for ValidatedArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidatedArgs")
            .field("capability", &self.capability)
            .finish_non_exhaustive()
    }
}

/// Captured output of a child process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
    /// Exit status code, `None` when terminated by a signal
    pub exit_code: Option<i32>,
    /// Standard output exceeded the capture bound
    pub stdout_truncated: bool,
    /// Standard error exceeded the capture bound
    pub stderr_truncated: bool,
}

/// Successful capability output
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilityOutput {
    /// Text folded into the conversation for the model
    pub text: String,
    /// Process details for command-style capabilities
    pub process: Option<ProcessOutput>,
    /// Optional note shown directly to the user
    pub for_user: Option<String>,
    /// Suppress the user-facing note
    pub silent: bool,
    /// Text was cut to the output bound
    pub truncated: bool,
}

impl CapabilityOutput {
    /// Plain text output
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// Output of a finished process; stdout, stderr and exit status are all kept
    pub fn process(output: ProcessOutput) -> Self {
        let mut text = String::new();
        match output.exit_code {
            Some(code) => text.push_str(&format!("exit status: {}\n", code)),
            None => text.push_str("exit status: terminated by signal\n"),
        }
        text.push_str("--- stdout ---\n");
        text.push_str(&output.stdout);
        if output.stdout_truncated {
            text.push_str("\n... (stdout truncated)");
        }
        if !output.stderr.is_empty() {
            text.push_str("\n--- stderr ---\n");
            text.push_str(&output.stderr);
            if output.stderr_truncated {
                text.push_str("\n... (stderr truncated)");
            }
        }
        Self {
            text,
            truncated: output.stdout_truncated || output.stderr_truncated,
            process: Some(output),
            ..Self::default()
        }
    }

    /// Attach a user-facing note
    pub fn with_user_note(mut self, note: impl Into<String>) -> Self {
        self.for_user = Some(note.into());
        self
    }

    /// Mark the output as silent
    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    /// Cut the text to `max_bytes` on a character boundary
    pub fn truncate_if_needed(mut self, max_bytes: usize) -> Self {
        if self.text.len() > max_bytes {
            truncate_utf8(&mut self.text, max_bytes);
            self.text.push_str("\n... (truncated)");
            self.truncated = true;
        }
        self
    }
}

/// Truncate `text` to at most `max_bytes` without splitting a character
pub fn truncate_utf8(text: &mut String, max_bytes: usize) {
    if text.len() <= max_bytes {
        return;
    }
    let mut cut = max_bytes;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
}

/// Contract implemented by every capability adapter
#[async_trait]
pub trait Capability: Send + Sync {
    /// Unique capability name
    fn name(&self) -> &str;

    /// What the capability does, for the model
    fn description(&self) -> &str;

    /// JSON schema of the arguments
    fn parameters(&self) -> serde_json::Value;

    /// Check argument shape and allow-policy without side effects
    fn validate(
        &self,
        args: &serde_json::Value,
        ctx: &InvocationContext,
    ) -> Result<ValidatedArgs, CapabilityError>;

    /// Perform the action; must not outlive `deadline`
    async fn execute(
        &self,
        args: ValidatedArgs,
        deadline: Instant,
    ) -> Result<CapabilityOutput, CapabilityError>;

    /// Descriptor advertised to backends
    fn descriptor(&self) -> CapabilityDescriptor {
        CapabilityDescriptor {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters(),
        }
    }
}

/// Parse raw arguments into a capability's parameter struct
pub fn parse_args<T: serde::de::DeserializeOwned>(
    capability: &str,
    args: &serde_json::Value,
) -> Result<T, CapabilityError> {
    serde_json::from_value(args.clone()).map_err(|e| {
        CapabilityError::ValidationRejected(format!("invalid arguments for {}: {}", capability, e))
    })
}

/// Registry of available capabilities, ordered by name
#[derive(Default, Clone)]
pub struct CapabilityRegistry {
    capabilities: BTreeMap<String, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a capability under its own name, replacing any previous one
    pub fn register(&mut self, capability: Arc<dyn Capability>) {
        self.capabilities
            .insert(capability.name().to_string(), capability);
    }

    /// Look up a capability
    pub fn get(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.capabilities.get(name).cloned()
    }

    /// Names of all registered capabilities
    pub fn names(&self) -> Vec<String> {
        self.capabilities.keys().cloned().collect()
    }

    /// Descriptors of all registered capabilities
    pub fn descriptors(&self) -> Vec<CapabilityDescriptor> {
        self.capabilities
            .values()
            .map(|capability| capability.descriptor())
            .collect()
    }

    /// Number of registered capabilities
    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    /// True when nothing is registered
    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }
}

impl fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("capabilities", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validated_args_round_trip_params() {
        let args = ValidatedArgs::new("demo", (1u8, "x".to_string()));
        assert_eq!(args.capability(), "demo");
        let (n, s): (u8, String) = args.into_params().unwrap();
        assert_eq!((n, s.as_str()), (1, "x"));
    }

    #[test]
    fn test_validated_args_wrong_type() {
        let args = ValidatedArgs::new("demo", 5u32);
        assert!(matches!(
            args.into_params::<String>(),
            Err(CapabilityError::ExecutionFailed(_))
        ));
    }

    #[test]
    fn test_process_output_keeps_streams_and_status() {
        let output = CapabilityOutput::process(ProcessOutput {
            stdout: "out".into(),
            stderr: "err".into(),
            exit_code: Some(2),
            ..ProcessOutput::default()
        });
        assert!(output.text.contains("exit status: 2"));
        assert!(output.text.contains("out"));
        assert!(output.text.contains("err"));
        assert_eq!(output.process.unwrap().exit_code, Some(2));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let mut text = "héllo".to_string();
        truncate_utf8(&mut text, 2);
        assert_eq!(text, "h");

        let output = CapabilityOutput::text("abcdef").truncate_if_needed(3);
        assert!(output.truncated);
        assert!(output.text.starts_with("abc"));
    }

    #[test]
    fn test_parse_args_rejects_bad_shape() {
        #[derive(Debug, serde::Deserialize)]
        struct Params {
            #[allow(dead_code)]
            path: String,
        }
        let err = parse_args::<Params>("read_file", &serde_json::json!({"path": 3})).unwrap_err();
        assert!(matches!(err, CapabilityError::ValidationRejected(_)));
    }
}
