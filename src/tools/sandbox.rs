//! Filesystem sandbox
//!
//! Every filesystem path a capability touches is resolved through
//! [`Sandbox::resolve`], which guarantees the final location (after
//! following symlinks) lies under the configured sandbox root.

use std::path::{Component, Path, PathBuf};
use thiserror::Error;

use crate::error::CapabilityError;

/// Error type for sandbox path resolution
#[derive(Error, Debug)]
pub enum PathError {
    /// Path traversal attempt detected (contains .. or ~ patterns)
    #[error("Path traversal attempt detected: {0}")]
    PathTraversal(String),

    /// Absolute path not allowed
    #[error("Absolute path not allowed: {0}")]
    AbsolutePath(String),

    /// Path resolves outside the sandbox root
    #[error("Path outside sandbox: {0}")]
    OutsideSandbox(String),

    /// File size exceeds maximum allowed
    #[error("File size {0} bytes exceeds maximum {1} bytes")]
    FileTooLarge(u64, u64),

    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<PathError> for CapabilityError {
    fn from(error: PathError) -> Self {
        match error {
            PathError::Io(e) => CapabilityError::ExecutionFailed(e.to_string()),
            other => CapabilityError::ValidationRejected(other.to_string()),
        }
    }
}

/// Root directory that filesystem and shell capabilities are confined to
///
/// # Examples
///
/// ```
/// use pocketclaw::tools::sandbox::Sandbox;
///
/// let dir = tempfile::tempdir().unwrap();
/// let sandbox = Sandbox::new(dir.path()).unwrap();
/// assert!(sandbox.resolve("notes/todo.txt").is_ok());
/// assert!(sandbox.resolve("../escape.txt").is_err());
/// assert!(sandbox.resolve("/etc/passwd").is_err());
/// ```
#[derive(Debug, Clone)]
pub struct Sandbox {
    root: PathBuf,
}

impl Sandbox {
    /// Create a sandbox rooted at `root`
    ///
    /// # Errors
    ///
    /// Returns `PathError::Io` if the root cannot be canonicalized
    pub fn new(root: impl AsRef<Path>) -> Result<Self, PathError> {
        Ok(Self {
            root: root.as_ref().canonicalize()?,
        })
    }

    /// Canonical sandbox root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a relative path to an absolute location inside the root
    ///
    /// Existing paths are canonicalized so symlinks are followed. For paths
    /// that do not exist yet, the nearest existing ancestor is canonicalized
    /// and checked instead.
    ///
    /// # Errors
    ///
    /// Returns an error for absolute paths, `~` or `..` components, and for
    /// any path whose resolved location leaves the root.
    pub fn resolve(&self, target: &str) -> Result<PathBuf, PathError> {
        let path = Path::new(target);

        if target.trim().is_empty() {
            return Err(PathError::PathTraversal("empty path".to_string()));
        }
        if path.is_absolute() {
            return Err(PathError::AbsolutePath(target.to_string()));
        }
        if target.starts_with('~') {
            return Err(PathError::PathTraversal(
                "Home directory paths not allowed".to_string(),
            ));
        }
        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(PathError::PathTraversal(format!(
                "Parent directory traversal not allowed: {}",
                target
            )));
        }

        let full_path = self.root.join(path);

        if full_path.exists() {
            let canonical = full_path.canonicalize()?;
            if !canonical.starts_with(&self.root) {
                return Err(PathError::OutsideSandbox(target.to_string()));
            }
            return Ok(canonical);
        }

        let mut ancestor = full_path.parent();
        while let Some(dir) = ancestor {
            if dir.exists() {
                let canonical = dir.canonicalize()?;
                if !canonical.starts_with(&self.root) {
                    return Err(PathError::OutsideSandbox(target.to_string()));
                }
                break;
            }
            ancestor = dir.parent();
        }

        Ok(full_path)
    }

    /// Heuristic used by the shell capability: arguments that look like
    /// paths must resolve inside the root
    ///
    /// Flags are checked too when a value is attached: `--file=/x`,
    /// `-f/x` and `-xvf../x` all name a path.
    pub fn check_path_like_argument(&self, arg: &str) -> Result<(), PathError> {
        path_candidates(arg)
            .into_iter()
            .try_for_each(|candidate| self.check_candidate(candidate))
    }

    fn check_candidate(&self, candidate: &str) -> Result<(), PathError> {
        let looks_like_path = candidate.contains('/')
            || candidate.starts_with('.')
            || candidate.starts_with('~');
        if !looks_like_path || candidate == "." || candidate == "./" {
            return Ok(());
        }
        self.resolve(candidate.trim_start_matches("./")).map(|_| ())
    }
}

/// Parts of one shell argument that may name a path
///
/// The value after `=` is always a candidate. A flag contributes the text
/// from its first path character on; any other argument is a candidate
/// as a whole.
fn path_candidates(arg: &str) -> Vec<&str> {
    let (head, value) = match arg.split_once('=') {
        Some((head, value)) => (head, Some(value)),
        None => (arg, None),
    };

    let mut candidates = Vec::with_capacity(2);
    match head.strip_prefix('-') {
        Some(flags) => {
            if let Some(start) = flags.find(|c| matches!(c, '/' | '.' | '~')) {
                candidates.push(&flags[start..]);
            }
        }
        None => candidates.push(head),
    }
    candidates.extend(value);
    candidates
}

/// Reject files larger than `max_size` bytes
pub async fn check_file_size(path: &Path, max_size: u64) -> Result<u64, PathError> {
    let size = tokio::fs::metadata(path).await?.len();
    if size > max_size {
        return Err(PathError::FileTooLarge(size, max_size));
    }
    Ok(size)
}
