//! Shell command capability
//!
//! Runs one allow-listed program with an argument vector. No shell
//! interpreter is involved: the program is spawned directly with a cleared
//! environment, the sandbox root as working directory, and bounded capture
//! of both output streams.

use std::process::Stdio;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::time::Instant;

use crate::error::{CapabilityError, PocketclawError, Result};
use crate::tools::sandbox::Sandbox;
use crate::tools::{
    parse_args, Capability, CapabilityOutput, InvocationContext, ProcessOutput, ValidatedArgs,
};

/// PATH handed to child processes
const CHILD_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Patterns rejected in every command line, whatever the allow-list says
const BUILTIN_DENYLIST: &[&str] = &[
    r"rm\s+-rf\s+/\s*$",
    r"rm\s+-rf\s+/\*",
    r"dd\s+if=/dev/zero",
    r"dd\s+of=/dev/sd[a-z]",
    r"mkfs\.",
    r"\bsudo\b",
    r"\bsu\b",
    r"\bchmod\s+[0-7]*7[0-7]*",
    r"/etc/passwd",
    r"/etc/shadow",
    r"\.ssh/",
];

#[derive(Debug, Deserialize)]
struct ShellParams {
    program: String,
    #[serde(default)]
    args: Vec<String>,
}

/// Validates commands against the allow-list, denylist and sandbox
///
/// # Examples
///
/// ```
/// use pocketclaw::tools::sandbox::Sandbox;
/// use pocketclaw::tools::shell::CommandValidator;
///
/// let dir = tempfile::tempdir().unwrap();
/// let validator = CommandValidator::new(
///     vec!["ls".to_string()],
///     &[],
///     Sandbox::new(dir.path()).unwrap(),
/// )
/// .unwrap();
///
/// assert!(validator.validate("ls", &["-la".to_string()]).is_ok());
/// assert!(validator.validate("rm", &["-rf".to_string(), "x".to_string()]).is_err());
/// ```
#[derive(Debug, Clone)]
pub struct CommandValidator {
    allowlist: Vec<String>,
    denylist: Vec<Regex>,
    sandbox: Sandbox,
}

impl CommandValidator {
    /// Create a validator
    ///
    /// # Errors
    ///
    /// Returns `PocketclawError::Config` when an extra denylist pattern is
    /// not a valid regex
    pub fn new(allowlist: Vec<String>, extra_denylist: &[String], sandbox: Sandbox) -> Result<Self> {
        let mut denylist = Vec::with_capacity(BUILTIN_DENYLIST.len() + extra_denylist.len());
        for pattern in BUILTIN_DENYLIST
            .iter()
            .copied()
            .chain(extra_denylist.iter().map(String::as_str))
        {
            let regex = Regex::new(pattern).map_err(|e| {
                PocketclawError::Config(format!("invalid shell denylist pattern '{}': {}", pattern, e))
            })?;
            denylist.push(regex);
        }
        Ok(Self {
            allowlist,
            denylist,
            sandbox,
        })
    }

    /// Check a program and its arguments without running anything
    pub fn validate(&self, program: &str, args: &[String]) -> std::result::Result<(), CapabilityError> {
        if program.is_empty() {
            return Err(CapabilityError::ValidationRejected("empty program".to_string()));
        }
        if program.contains('/') || !self.allowlist.iter().any(|allowed| allowed == program) {
            tracing::warn!(program, "Program not in shell allow-list");
            return Err(CapabilityError::ValidationRejected(format!(
                "program '{}' is not allowed",
                program
            )));
        }

        let command_line = std::iter::once(program)
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        if let Some(pattern) = self.denylist.iter().find(|p| p.is_match(&command_line)) {
            tracing::error!(command = %command_line, pattern = %pattern, "Command blocked by denylist");
            return Err(CapabilityError::ValidationRejected(
                "command matches a blocked pattern".to_string(),
            ));
        }

        for arg in args {
            self.sandbox.check_path_like_argument(arg)?;
        }
        Ok(())
    }
}

/// The `shell` capability
pub struct ShellCapability {
    validator: CommandValidator,
    sandbox: Sandbox,
    max_capture_bytes: usize,
}

impl ShellCapability {
    /// Create the capability; output streams are captured up to `max_capture_bytes` each
    pub fn new(validator: CommandValidator, sandbox: Sandbox, max_capture_bytes: usize) -> Self {
        Self {
            validator,
            sandbox,
            max_capture_bytes,
        }
    }
}

#[async_trait]
impl Capability for ShellCapability {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Run an allow-listed program inside the assistant workspace. Pass the program name and its arguments separately; no shell syntax is interpreted."
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "program": {
                    "type": "string",
                    "description": "Program name, for example \"ls\""
                },
                "args": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Arguments passed to the program"
                }
            },
            "required": ["program"]
        })
    }

    fn validate(
        &self,
        args: &serde_json::Value,
        _ctx: &InvocationContext,
    ) -> std::result::Result<ValidatedArgs, CapabilityError> {
        let params: ShellParams = parse_args(self.name(), args)?;
        self.validator.validate(&params.program, &params.args)?;
        Ok(ValidatedArgs::new(self.name(), params))
    }

    async fn execute(
        &self,
        args: ValidatedArgs,
        deadline: Instant,
    ) -> std::result::Result<CapabilityOutput, CapabilityError> {
        let params: ShellParams = args.into_params()?;
        let started = Instant::now();

        let mut child = Command::new(&params.program)
            .args(&params.args)
            .current_dir(self.sandbox.root())
            .env_clear()
            .env("PATH", CHILD_PATH)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                CapabilityError::ExecutionFailed(format!("failed to start {}: {}", params.program, e))
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CapabilityError::ExecutionFailed("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| CapabilityError::ExecutionFailed("stderr not captured".to_string()))?;

        let limit = self.max_capture_bytes;
        let finished = tokio::time::timeout_at(deadline, async {
            tokio::join!(
                read_bounded(stdout, limit),
                read_bounded(stderr, limit),
                child.wait()
            )
        })
        .await;

        let (stdout, stderr, status) = match finished {
            Ok(parts) => parts,
            Err(_) => {
                let _ = child.start_kill();
                tracing::warn!(program = %params.program, "Shell command killed at deadline");
                return Err(CapabilityError::TimedOut(
                    deadline.saturating_duration_since(started),
                ));
            }
        };

        let status = status.map_err(|e| CapabilityError::ExecutionFailed(e.to_string()))?;
        let (stdout, stdout_truncated) =
            stdout.map_err(|e| CapabilityError::ExecutionFailed(e.to_string()))?;
        let (stderr, stderr_truncated) =
            stderr.map_err(|e| CapabilityError::ExecutionFailed(e.to_string()))?;

        Ok(CapabilityOutput::process(ProcessOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code: status.code(),
            stdout_truncated,
            stderr_truncated,
        }))
    }
}

/// Drain `reader` to the end, keeping at most `limit` bytes
async fn read_bounded<R>(mut reader: R, limit: usize) -> std::io::Result<(Vec<u8>, bool)>
where
    R: AsyncRead + Unpin,
{
    let mut kept = Vec::new();
    let mut truncated = false;
    let mut buf = [0u8; 4096];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let room = limit.saturating_sub(kept.len());
        if n > room {
            truncated = true;
        }
        kept.extend_from_slice(&buf[..n.min(room)]);
    }
    Ok((kept, truncated))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn capability(dir: &TempDir, allow: &[&str], capture: usize) -> ShellCapability {
        let sandbox = Sandbox::new(dir.path()).unwrap();
        let validator = CommandValidator::new(
            allow.iter().map(|s| s.to_string()).collect(),
            &[],
            sandbox.clone(),
        )
        .unwrap();
        ShellCapability::new(validator, sandbox, capture)
    }

    #[test]
    fn test_program_outside_allowlist_is_rejected() {
        let dir = TempDir::new().unwrap();
        let shell = capability(&dir, &["ls", "cat"], 1024);
        let result = shell.validate(
            &json!({"program": "rm", "args": ["-rf", "notes"]}),
            &InvocationContext::default(),
        );
        assert!(matches!(
            result,
            Err(CapabilityError::ValidationRejected(_))
        ));
        assert!(dir.path().read_dir().unwrap().next().is_none());
    }

    #[test]
    fn test_program_path_is_rejected_even_if_basename_allowed() {
        let dir = TempDir::new().unwrap();
        let shell = capability(&dir, &["ls"], 1024);
        let result = shell.validate(&json!({"program": "/bin/ls"}), &InvocationContext::default());
        assert!(result.is_err());
    }

    #[test]
    fn test_path_arguments_must_stay_in_sandbox() {
        let dir = TempDir::new().unwrap();
        let shell = capability(&dir, &["cat"], 1024);
        let ctx = InvocationContext::default();
        assert!(shell
            .validate(&json!({"program": "cat", "args": ["../outside.txt"]}), &ctx)
            .is_err());
        assert!(shell
            .validate(&json!({"program": "cat", "args": ["/etc/hosts"]}), &ctx)
            .is_err());
        assert!(shell
            .validate(&json!({"program": "cat", "args": ["./notes.txt"]}), &ctx)
            .is_ok());
    }

    #[test]
    fn test_attached_flag_paths_must_stay_in_sandbox() {
        let dir = TempDir::new().unwrap();
        let shell = capability(&dir, &["grep", "sort"], 1024);
        let ctx = InvocationContext::default();
        assert!(shell
            .validate(
                &json!({"program": "grep", "args": ["-f/etc/hosts", "notes.txt"]}),
                &ctx
            )
            .is_err());
        assert!(shell
            .validate(&json!({"program": "sort", "args": ["-o../x", "notes.txt"]}), &ctx)
            .is_err());
        assert!(shell
            .validate(&json!({"program": "grep", "args": ["-n", "todo", "notes.txt"]}), &ctx)
            .is_ok());
    }

    #[test]
    fn test_denylist_applies_to_allowed_programs() {
        let dir = TempDir::new().unwrap();
        let sandbox = Sandbox::new(dir.path()).unwrap();
        let validator =
            CommandValidator::new(vec!["echo".into()], &["secret".into()], sandbox).unwrap();
        assert!(validator.validate("echo", &["secret".into()]).is_err());
        assert!(validator.validate("echo", &["hello".into()]).is_ok());
    }

    #[test]
    fn test_invalid_denylist_pattern_is_config_error() {
        let dir = TempDir::new().unwrap();
        let sandbox = Sandbox::new(dir.path()).unwrap();
        assert!(CommandValidator::new(vec![], &["(".into()], sandbox).is_err());
    }

    #[tokio::test]
    async fn test_execute_captures_stdout_and_status() {
        let dir = TempDir::new().unwrap();
        let shell = capability(&dir, &["echo"], 1024);
        let args = shell
            .validate(
                &json!({"program": "echo", "args": ["hello"]}),
                &InvocationContext::default(),
            )
            .unwrap();
        let output = shell
            .execute(args, Instant::now() + Duration::from_secs(5))
            .await
            .unwrap();

        let process = output.process.unwrap();
        assert_eq!(process.exit_code, Some(0));
        assert_eq!(process.stdout, "hello\n");
        assert!(!process.stdout_truncated);
    }

    #[tokio::test]
    async fn test_execute_bounds_capture() {
        let dir = TempDir::new().unwrap();
        let shell = capability(&dir, &["echo"], 4);
        let args = shell
            .validate(
                &json!({"program": "echo", "args": ["abcdefghij"]}),
                &InvocationContext::default(),
            )
            .unwrap();
        let output = shell
            .execute(args, Instant::now() + Duration::from_secs(5))
            .await
            .unwrap();

        let process = output.process.unwrap();
        assert_eq!(process.stdout, "abcd");
        assert!(process.stdout_truncated);
        assert!(output.truncated);
    }

    #[tokio::test]
    async fn test_execute_kills_at_deadline() {
        let dir = TempDir::new().unwrap();
        let shell = capability(&dir, &["sleep"], 1024);
        let args = shell
            .validate(
                &json!({"program": "sleep", "args": ["5"]}),
                &InvocationContext::default(),
            )
            .unwrap();
        let started = std::time::Instant::now();
        let result = shell
            .execute(args, Instant::now() + Duration::from_millis(100))
            .await;

        assert!(matches!(result, Err(CapabilityError::TimedOut(_))));
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
