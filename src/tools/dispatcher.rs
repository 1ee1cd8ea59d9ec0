//! Capability dispatcher
//!
//! Runs one capability invocation through lookup, admission, and
//! time-bounded execution. Every failure becomes a typed
//! [`CapabilityError`] inside the returned [`CapabilityResult`]; nothing
//! here panics or propagates past the caller.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::CapabilityError;
use crate::metrics;
use crate::tools::{
    CapabilityCall, CapabilityDescriptor, CapabilityOutput, CapabilityRegistry, InvocationContext,
};

/// Extra time a capability gets past its deadline to clean up and report
const CANCEL_GRACE: Duration = Duration::from_millis(250);

/// Outcome of one dispatched invocation
#[derive(Debug, Clone)]
pub struct CapabilityResult {
    /// The invocation as requested by the model
    pub call: CapabilityCall,
    /// Output or typed failure
    pub outcome: Result<CapabilityOutput, CapabilityError>,
    /// Wall time spent
    pub elapsed: Duration,
}

impl CapabilityResult {
    /// True when the invocation failed
    pub fn is_error(&self) -> bool {
        self.outcome.is_err()
    }

    /// Text folded into the conversation as a tool-result message
    pub fn to_message_content(&self) -> String {
        match &self.outcome {
            Ok(output) => output.text.clone(),
            Err(error) => format!("Error: {}", error),
        }
    }

    /// Note to show the user directly, unless the output is silent
    pub fn user_note(&self) -> Option<&str> {
        match &self.outcome {
            Ok(output) if !output.silent => output.for_user.as_deref(),
            _ => None,
        }
    }
}

/// Executes capabilities with admission checks and deadlines
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: CapabilityRegistry,
    default_timeout: Duration,
    timeouts: HashMap<String, Duration>,
    max_output_bytes: usize,
}

impl Dispatcher {
    /// Create a dispatcher over `registry`
    pub fn new(
        registry: CapabilityRegistry,
        default_timeout: Duration,
        max_output_bytes: usize,
    ) -> Self {
        Self {
            registry,
            default_timeout,
            timeouts: HashMap::new(),
            max_output_bytes,
        }
    }

    /// Override the timeout of one capability
    pub fn with_timeout(mut self, capability: &str, timeout: Duration) -> Self {
        self.timeouts.insert(capability.to_string(), timeout);
        self
    }

    /// Timeout applied to `capability`
    pub fn timeout_for(&self, capability: &str) -> Duration {
        self.timeouts
            .get(capability)
            .copied()
            .unwrap_or(self.default_timeout)
    }

    /// Names of the available capabilities
    pub fn names(&self) -> Vec<String> {
        self.registry.names()
    }

    /// Descriptors of the available capabilities
    pub fn descriptors(&self) -> Vec<CapabilityDescriptor> {
        self.registry.descriptors()
    }

    /// Run one invocation to completion
    ///
    /// The capability's `validate` runs first; a rejection returns before
    /// any side effect. Execution is bounded by the capability timeout;
    /// when it expires the execution future is dropped, which terminates
    /// any child process or connection it owns.
    pub async fn dispatch(&self, call: &CapabilityCall, ctx: &InvocationContext) -> CapabilityResult {
        let started = Instant::now();
        let outcome = self.run(call, ctx).await;
        let elapsed = started.elapsed();

        let label = match &outcome {
            Ok(_) => "ok",
            Err(error) => error.kind(),
        };
        metrics::record_capability(&call.name, label);

        match &outcome {
            Ok(output) => tracing::info!(
                capability = %call.name,
                session_id = %ctx.session_id,
                elapsed_ms = elapsed.as_millis() as u64,
                truncated = output.truncated,
                "Capability completed"
            ),
            Err(error) => tracing::warn!(
                capability = %call.name,
                session_id = %ctx.session_id,
                elapsed_ms = elapsed.as_millis() as u64,
                error = %error,
                "Capability failed"
            ),
        }

        CapabilityResult {
            call: call.clone(),
            outcome,
            elapsed,
        }
    }

    async fn run(
        &self,
        call: &CapabilityCall,
        ctx: &InvocationContext,
    ) -> Result<CapabilityOutput, CapabilityError> {
        let capability = self
            .registry
            .get(&call.name)
            .ok_or_else(|| CapabilityError::NotFound(call.name.clone()))?;

        let args = capability.validate(&call.arguments, ctx)?;

        let timeout = self.timeout_for(&call.name);
        let deadline = Instant::now() + timeout;
        tracing::debug!(
            capability = %call.name,
            timeout_ms = timeout.as_millis() as u64,
            "Executing capability"
        );

        match tokio::time::timeout_at(deadline + CANCEL_GRACE, capability.execute(args, deadline))
            .await
        {
            Ok(result) => result.map(|output| output.truncate_if_needed(self.max_output_bytes)),
            Err(_) => Err(CapabilityError::TimedOut(timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{Capability, ValidatedArgs};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Echo {
        executions: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Capability for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echo text back"
        }

        fn parameters(&self) -> serde_json::Value {
            json!({"type": "object", "properties": {"text": {"type": "string"}}, "required": ["text"]})
        }

        fn validate(
            &self,
            args: &serde_json::Value,
            _ctx: &InvocationContext,
        ) -> Result<ValidatedArgs, CapabilityError> {
            let text = args
                .get("text")
                .and_then(|v| v.as_str())
                .ok_or_else(|| CapabilityError::ValidationRejected("missing text".into()))?;
            Ok(ValidatedArgs::new("echo", text.to_string()))
        }

        async fn execute(
            &self,
            args: ValidatedArgs,
            _deadline: Instant,
        ) -> Result<CapabilityOutput, CapabilityError> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            let text: String = args.into_params()?;
            Ok(CapabilityOutput::text(text))
        }
    }

    struct Hang;

    #[async_trait]
    impl Capability for Hang {
        fn name(&self) -> &str {
            "hang"
        }

        fn description(&self) -> &str {
            "Never finishes"
        }

        fn parameters(&self) -> serde_json::Value {
            json!({"type": "object"})
        }

        fn validate(
            &self,
            _args: &serde_json::Value,
            _ctx: &InvocationContext,
        ) -> Result<ValidatedArgs, CapabilityError> {
            Ok(ValidatedArgs::new("hang", ()))
        }

        async fn execute(
            &self,
            _args: ValidatedArgs,
            _deadline: Instant,
        ) -> Result<CapabilityOutput, CapabilityError> {
            futures::future::pending().await
        }
    }

    fn dispatcher() -> (Dispatcher, Arc<AtomicUsize>) {
        let executions = Arc::new(AtomicUsize::new(0));
        let mut registry = CapabilityRegistry::new();
        registry.register(Arc::new(Echo {
            executions: Arc::clone(&executions),
        }));
        registry.register(Arc::new(Hang));
        let dispatcher = Dispatcher::new(registry, Duration::from_secs(5), 8)
            .with_timeout("hang", Duration::from_millis(100));
        (dispatcher, executions)
    }

    #[tokio::test]
    async fn test_dispatch_success_truncates_output() {
        let (dispatcher, executions) = dispatcher();
        let call = CapabilityCall::new("echo", json!({"text": "hello world, long"}));
        let result = dispatcher.dispatch(&call, &InvocationContext::default()).await;

        let output = result.outcome.unwrap();
        assert!(output.truncated);
        assert!(output.text.starts_with("hello wo"));
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dispatch_unknown_capability() {
        let (dispatcher, _) = dispatcher();
        let call = CapabilityCall::new("nope", json!({}));
        let result = dispatcher.dispatch(&call, &InvocationContext::default()).await;
        assert_eq!(
            result.outcome.unwrap_err(),
            CapabilityError::NotFound("nope".into())
        );
    }

    #[tokio::test]
    async fn test_dispatch_rejection_skips_execution() {
        let (dispatcher, executions) = dispatcher();
        let call = CapabilityCall::new("echo", json!({"wrong": true}));
        let result = dispatcher.dispatch(&call, &InvocationContext::default()).await;

        assert!(matches!(
            result.outcome,
            Err(CapabilityError::ValidationRejected(_))
        ));
        assert!(result.to_message_content().starts_with("Error:"));
        assert_eq!(executions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_times_out() {
        let (dispatcher, _) = dispatcher();
        let call = CapabilityCall::new("hang", json!({}));
        let result = dispatcher.dispatch(&call, &InvocationContext::default()).await;
        assert_eq!(
            result.outcome.unwrap_err(),
            CapabilityError::TimedOut(Duration::from_millis(100))
        );
    }

    #[test]
    fn test_timeout_override() {
        let (dispatcher, _) = dispatcher();
        assert_eq!(dispatcher.timeout_for("hang"), Duration::from_millis(100));
        assert_eq!(dispatcher.timeout_for("echo"), Duration::from_secs(5));
        assert_eq!(dispatcher.names(), vec!["echo", "hang"]);
    }
}
