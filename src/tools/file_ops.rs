//! Sandboxed filesystem capabilities
//!
//! `read_file`, `write_file` and `list_directory`. Every path argument is
//! resolved through the [`Sandbox`] during validation, so nothing outside
//! the sandbox root is ever opened.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::time::Instant;

use crate::error::CapabilityError;
use crate::tools::sandbox::{check_file_size, Sandbox};
use crate::tools::{parse_args, Capability, CapabilityOutput, InvocationContext, ValidatedArgs};

#[derive(Debug, Deserialize)]
struct PathParams {
    path: String,
}

#[derive(Debug, Deserialize)]
struct WriteFileParams {
    path: String,
    content: String,
}

#[derive(Debug)]
struct ResolvedWrite {
    path: PathBuf,
    display: String,
    content: String,
}

fn io_failure(error: std::io::Error) -> CapabilityError {
    CapabilityError::ExecutionFailed(error.to_string())
}

/// Read a UTF-8 text file inside the sandbox
pub struct ReadFileCapability {
    sandbox: Sandbox,
    max_file_bytes: u64,
}

impl ReadFileCapability {
    /// Create the capability
    pub fn new(sandbox: Sandbox, max_file_bytes: u64) -> Self {
        Self {
            sandbox,
            max_file_bytes,
        }
    }
}

#[async_trait]
impl Capability for ReadFileCapability {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file from the assistant workspace."
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path relative to the workspace root"
                }
            },
            "required": ["path"]
        })
    }

    fn validate(
        &self,
        args: &serde_json::Value,
        _ctx: &InvocationContext,
    ) -> Result<ValidatedArgs, CapabilityError> {
        let params: PathParams = parse_args(self.name(), args)?;
        let path = self.sandbox.resolve(&params.path)?;
        Ok(ValidatedArgs::new(self.name(), path))
    }

    async fn execute(
        &self,
        args: ValidatedArgs,
        _deadline: Instant,
    ) -> Result<CapabilityOutput, CapabilityError> {
        let path: PathBuf = args.into_params()?;
        if path.is_dir() {
            return Err(CapabilityError::ExecutionFailed(
                "path is a directory, not a file".to_string(),
            ));
        }
        check_file_size(&path, self.max_file_bytes).await?;
        let bytes = tokio::fs::read(&path).await.map_err(io_failure)?;
        let text = String::from_utf8(bytes).map_err(|_| {
            CapabilityError::ExecutionFailed("file is not valid UTF-8 text".to_string())
        })?;
        Ok(CapabilityOutput::text(text))
    }
}

/// Create or overwrite a file inside the sandbox
pub struct WriteFileCapability {
    sandbox: Sandbox,
    max_file_bytes: u64,
}

impl WriteFileCapability {
    /// Create the capability
    pub fn new(sandbox: Sandbox, max_file_bytes: u64) -> Self {
        Self {
            sandbox,
            max_file_bytes,
        }
    }
}

#[async_trait]
impl Capability for WriteFileCapability {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file in the assistant workspace. Creates parent directories and overwrites existing files."
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path relative to the workspace root"
                },
                "content": {
                    "type": "string",
                    "description": "Content to write"
                }
            },
            "required": ["path", "content"]
        })
    }

    fn validate(
        &self,
        args: &serde_json::Value,
        _ctx: &InvocationContext,
    ) -> Result<ValidatedArgs, CapabilityError> {
        let params: WriteFileParams = parse_args(self.name(), args)?;
        if params.content.len() as u64 > self.max_file_bytes {
            return Err(CapabilityError::ValidationRejected(format!(
                "content size {} bytes exceeds maximum {} bytes",
                params.content.len(),
                self.max_file_bytes
            )));
        }
        let path = self.sandbox.resolve(&params.path)?;
        if path.is_dir() {
            return Err(CapabilityError::ValidationRejected(format!(
                "path is a directory, not a file: {}",
                params.path
            )));
        }
        Ok(ValidatedArgs::new(
            self.name(),
            ResolvedWrite {
                path,
                display: params.path,
                content: params.content,
            },
        ))
    }

    async fn execute(
        &self,
        args: ValidatedArgs,
        _deadline: Instant,
    ) -> Result<CapabilityOutput, CapabilityError> {
        let write: ResolvedWrite = args.into_params()?;
        if let Some(parent) = write.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_failure)?;
        }
        tokio::fs::write(&write.path, &write.content)
            .await
            .map_err(io_failure)?;
        Ok(CapabilityOutput::text(format!(
            "File written successfully: {} ({} bytes)",
            write.display,
            write.content.len()
        )))
    }
}

/// List the entries of a directory inside the sandbox
pub struct ListDirectoryCapability {
    sandbox: Sandbox,
}

impl ListDirectoryCapability {
    /// Create the capability
    pub fn new(sandbox: Sandbox) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Capability for ListDirectoryCapability {
    fn name(&self) -> &str {
        "list_directory"
    }

    fn description(&self) -> &str {
        "List files and directories in the assistant workspace. Use \".\" for the root."
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory relative to the workspace root"
                }
            },
            "required": ["path"]
        })
    }

    fn validate(
        &self,
        args: &serde_json::Value,
        _ctx: &InvocationContext,
    ) -> Result<ValidatedArgs, CapabilityError> {
        let params: PathParams = parse_args(self.name(), args)?;
        let trimmed = params.path.trim();
        let path = if trimmed.is_empty() || trimmed == "." || trimmed == "./" {
            self.sandbox.root().to_path_buf()
        } else {
            self.sandbox.resolve(trimmed)?
        };
        Ok(ValidatedArgs::new(self.name(), path))
    }

    async fn execute(
        &self,
        args: ValidatedArgs,
        _deadline: Instant,
    ) -> Result<CapabilityOutput, CapabilityError> {
        let path: PathBuf = args.into_params()?;
        let mut reader = tokio::fs::read_dir(&path).await.map_err(io_failure)?;
        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await.map_err(io_failure)? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_dir = entry
                .file_type()
                .await
                .map(|kind| kind.is_dir())
                .unwrap_or(false);
            entries.push(if is_dir { format!("{}/", name) } else { name });
        }
        entries.sort();
        if entries.is_empty() {
            return Ok(CapabilityOutput::text("(empty directory)"));
        }
        Ok(CapabilityOutput::text(entries.join("\n")))
    }
}
