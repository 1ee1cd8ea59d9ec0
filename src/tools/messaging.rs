//! Outbound messaging capability
//!
//! `send_message` lets the assistant push a message to the current
//! conversation or to an allow-listed `surface:user` target without
//! waiting for the end of the turn.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::time::Instant;

use crate::error::CapabilityError;
use crate::tools::{parse_args, Capability, CapabilityOutput, InvocationContext, ValidatedArgs};
use crate::transport::{OutboundReply, OutboundSender};

#[derive(Debug, Deserialize)]
struct SendMessageParams {
    text: String,
    #[serde(default)]
    target: Option<String>,
}

/// The `send_message` capability
pub struct SendMessageCapability {
    outbound: OutboundSender,
    allowed_targets: Vec<(String, String)>,
}

impl SendMessageCapability {
    /// Create the capability; `allowed_targets` entries are `surface:user`
    pub fn new(outbound: OutboundSender, allowed_targets: &[String]) -> Self {
        Self {
            outbound,
            allowed_targets: allowed_targets
                .iter()
                .filter_map(|target| parse_target(target))
                .collect(),
        }
    }
}

/// Split `surface:user` at the first colon
pub fn parse_target(target: &str) -> Option<(String, String)> {
    let (surface, user) = target.split_once(':')?;
    if surface.is_empty() || user.is_empty() {
        return None;
    }
    Some((surface.to_string(), user.to_string()))
}

#[async_trait]
impl Capability for SendMessageCapability {
    fn name(&self) -> &str {
        "send_message"
    }

    fn description(&self) -> &str {
        "Send a message right away, to the current conversation or to an allowed \"surface:user\" target."
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "text": {"type": "string", "description": "Message text"},
                "target": {
                    "type": "string",
                    "description": "Optional \"surface:user\" destination; defaults to the current conversation"
                }
            },
            "required": ["text"]
        })
    }

    fn validate(
        &self,
        args: &serde_json::Value,
        ctx: &InvocationContext,
    ) -> Result<ValidatedArgs, CapabilityError> {
        let params: SendMessageParams = parse_args(self.name(), args)?;
        if params.text.trim().is_empty() {
            return Err(CapabilityError::ValidationRejected(
                "message text is empty".to_string(),
            ));
        }

        let (surface_id, user_id) = match params.target.as_deref() {
            None => (ctx.surface_id.clone(), ctx.user_id.clone()),
            Some(target) => {
                let parsed = parse_target(target).ok_or_else(|| {
                    CapabilityError::ValidationRejected(format!(
                        "target '{}' is not of the form surface:user",
                        target
                    ))
                })?;
                let current = parsed.0 == ctx.surface_id && parsed.1 == ctx.user_id;
                if !current && !self.allowed_targets.contains(&parsed) {
                    return Err(CapabilityError::ValidationRejected(format!(
                        "target '{}' is not allowed",
                        target
                    )));
                }
                parsed
            }
        };

        if !self.outbound.has_route(&surface_id) {
            return Err(CapabilityError::ValidationRejected(format!(
                "surface '{}' is not running",
                surface_id
            )));
        }

        Ok(ValidatedArgs::new(
            self.name(),
            OutboundReply::new(&surface_id, &user_id, params.text),
        ))
    }

    async fn execute(
        &self,
        args: ValidatedArgs,
        _deadline: Instant,
    ) -> Result<CapabilityOutput, CapabilityError> {
        let reply: OutboundReply = args.into_params()?;
        let destination = format!("{}:{}", reply.surface_id, reply.user_id);
        self.outbound
            .send(reply)
            .map_err(|e| CapabilityError::ExecutionFailed(e.to_string()))?;
        Ok(CapabilityOutput::text(format!("Message queued for {}", destination)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn ctx() -> InvocationContext {
        InvocationContext {
            session_id: "s1".into(),
            surface_id: "telegram".into(),
            user_id: "42".into(),
        }
    }

    fn setup() -> (SendMessageCapability, mpsc::UnboundedReceiver<OutboundReply>) {
        let outbound = OutboundSender::new();
        let (tx, rx) = mpsc::unbounded_channel();
        outbound.register("telegram", tx);
        let capability = SendMessageCapability::new(outbound, &["telegram:99".to_string()]);
        (capability, rx)
    }

    #[tokio::test]
    async fn test_defaults_to_current_conversation() {
        let (capability, mut rx) = setup();
        let args = capability.validate(&json!({"text": "ping"}), &ctx()).unwrap();
        capability
            .execute(args, Instant::now() + Duration::from_secs(1))
            .await
            .unwrap();

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.user_id, "42");
        assert_eq!(reply.text, "ping");
    }

    #[test]
    fn test_target_policy() {
        let (capability, _rx) = setup();
        let ctx = ctx();
        assert!(capability
            .validate(&json!({"text": "x", "target": "telegram:99"}), &ctx)
            .is_ok());
        assert!(capability
            .validate(&json!({"text": "x", "target": "telegram:7"}), &ctx)
            .is_err());
        assert!(capability
            .validate(&json!({"text": "x", "target": "garbage"}), &ctx)
            .is_err());
        assert!(capability.validate(&json!({"text": "  "}), &ctx).is_err());
    }

    #[test]
    fn test_parse_target() {
        assert_eq!(
            parse_target("console:local"),
            Some(("console".into(), "local".into()))
        );
        assert_eq!(parse_target(":x"), None);
        assert_eq!(parse_target("x"), None);
    }
}
