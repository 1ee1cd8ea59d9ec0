//! Scheduled job capability
//!
//! Lets the assistant create, list, and cancel reminders for the current
//! conversation through the [`Scheduler`].

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::time::Instant;

use crate::error::CapabilityError;
use crate::scheduler::Scheduler;
use crate::tools::{parse_args, Capability, CapabilityOutput, InvocationContext, ValidatedArgs};

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ScheduleParams {
    Create { text: String, delay_secs: u64 },
    List,
    Cancel { id: String },
}

#[derive(Debug)]
struct ScheduleRequest {
    params: ScheduleParams,
    surface_id: String,
    user_id: String,
}

/// The `schedule` capability
pub struct ScheduleCapability {
    scheduler: Scheduler,
}

impl ScheduleCapability {
    /// Create the capability
    pub fn new(scheduler: Scheduler) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl Capability for ScheduleCapability {
    fn name(&self) -> &str {
        "schedule"
    }

    fn description(&self) -> &str {
        "Create, list, or cancel scheduled reminders. A reminder delivers its text back to this conversation when due."
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "action": {"type": "string", "enum": ["create", "list", "cancel"]},
                "text": {"type": "string", "description": "Reminder text (create)"},
                "delay_secs": {"type": "integer", "minimum": 1, "description": "Seconds from now (create)"},
                "id": {"type": "string", "description": "Job id (cancel)"}
            },
            "required": ["action"]
        })
    }

    fn validate(
        &self,
        args: &serde_json::Value,
        ctx: &InvocationContext,
    ) -> Result<ValidatedArgs, CapabilityError> {
        let params: ScheduleParams = parse_args(self.name(), args)?;
        if let ScheduleParams::Create { text, delay_secs } = &params {
            if text.trim().is_empty() {
                return Err(CapabilityError::ValidationRejected(
                    "reminder text is empty".to_string(),
                ));
            }
            let max = self.scheduler.max_delay().as_secs();
            if *delay_secs == 0 || *delay_secs > max {
                return Err(CapabilityError::ValidationRejected(format!(
                    "delay_secs must be between 1 and {}",
                    max
                )));
            }
        }
        Ok(ValidatedArgs::new(
            self.name(),
            ScheduleRequest {
                params,
                surface_id: ctx.surface_id.clone(),
                user_id: ctx.user_id.clone(),
            },
        ))
    }

    async fn execute(
        &self,
        args: ValidatedArgs,
        _deadline: Instant,
    ) -> Result<CapabilityOutput, CapabilityError> {
        let request: ScheduleRequest = args.into_params()?;
        match request.params {
            ScheduleParams::Create { text, delay_secs } => {
                let job = self
                    .scheduler
                    .schedule(
                        &request.surface_id,
                        &request.user_id,
                        &text,
                        Duration::from_secs(delay_secs),
                    )
                    .await
                    .map_err(|e| CapabilityError::ExecutionFailed(e.to_string()))?;
                Ok(CapabilityOutput::text(format!(
                    "Scheduled job {} for {}",
                    job.id,
                    job.due_at.to_rfc3339()
                )))
            }
            ScheduleParams::List => {
                let jobs = self
                    .scheduler
                    .list_for(&request.surface_id, &request.user_id)
                    .await;
                if jobs.is_empty() {
                    return Ok(CapabilityOutput::text("No scheduled jobs"));
                }
                let lines: Vec<String> = jobs
                    .iter()
                    .map(|job| format!("{} at {}: {}", job.id, job.due_at.to_rfc3339(), job.text))
                    .collect();
                Ok(CapabilityOutput::text(lines.join("\n")))
            }
            ScheduleParams::Cancel { id } => {
                let owned = self
                    .scheduler
                    .list_for(&request.surface_id, &request.user_id)
                    .await
                    .iter()
                    .any(|job| job.id == id);
                if !owned || !self.scheduler.cancel(&id).await {
                    return Err(CapabilityError::ExecutionFailed(format!(
                        "no pending job {}",
                        id
                    )));
                }
                Ok(CapabilityOutput::text(format!("Cancelled job {}", id)))
            }
        }
    }
}
