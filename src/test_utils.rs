//! Test utilities for Pocketclaw
//!
//! Temporary directories, in-memory stores and scripted routers shared by
//! the unit tests of several modules.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::providers::fake::ScriptedBackend;
use crate::providers::{Backend, InferenceRouter, RouterSettings};
use crate::session::{MemoryStore, SessionLimits, SessionStore, StoreSettings};
use crate::transport::{OutboundReply, OutboundSender};

/// Create a temporary directory for testing
pub fn temp_dir() -> TempDir {
    TempDir::new().expect("Failed to create temporary directory")
}

/// Create a test file with the given content
///
/// # Panics
///
/// Panics if file creation or writing fails
pub fn create_test_file(dir: &TempDir, name: &str, content: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, content).expect("Failed to write test file");
    path
}

/// Assert that an error's message contains `expected`
///
/// # Panics
///
/// Panics if the result is Ok or the message does not match
pub fn assert_error_contains<T>(result: Result<T>, expected: &str) {
    match result {
        Ok(_) => panic!("Expected error containing '{}' but got Ok", expected),
        Err(e) => {
            let error_msg = e.to_string();
            assert!(
                error_msg.contains(expected),
                "Error message '{}' does not contain '{}'",
                error_msg,
                expected
            );
        }
    }
}

/// Session store backed by memory, with roomy limits and a one-hour expiry
pub fn memory_session_store() -> Arc<SessionStore> {
    Arc::new(
        SessionStore::open(
            Arc::new(MemoryStore::new()),
            StoreSettings {
                limits: SessionLimits {
                    max_messages: 50,
                    max_bytes: 65_536,
                },
                expiry: Duration::from_secs(3600),
                memory_budget_bytes: 1 << 20,
            },
        )
        .expect("Failed to open in-memory session store"),
    )
}

/// Router over scripted backends, in chain order
pub fn scripted_router(backends: Vec<ScriptedBackend>) -> Arc<InferenceRouter> {
    let backends = backends
        .into_iter()
        .map(|backend| Arc::new(backend) as Arc<dyn Backend>)
        .collect();
    Arc::new(
        InferenceRouter::new(backends, RouterSettings::default())
            .expect("Failed to build scripted router"),
    )
}

/// Outbound sender with one route whose replies land in the returned receiver
pub fn captured_outbound(surface_id: &str) -> (OutboundSender, mpsc::UnboundedReceiver<OutboundReply>) {
    let outbound = OutboundSender::new();
    let (tx, rx) = mpsc::unbounded_channel();
    outbound.register(surface_id, tx);
    (outbound, rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PocketclawError;

    #[test]
    fn test_create_test_file() {
        let dir = temp_dir();
        let path = create_test_file(&dir, "test.txt", "content");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "content");
    }

    #[test]
    fn test_assert_error_contains_success() {
        let result: Result<()> = Err(PocketclawError::Config("test error message".into()).into());
        assert_error_contains(result, "test error");
    }

    #[test]
    #[should_panic(expected = "Expected error containing")]
    fn test_assert_error_contains_ok() {
        assert_error_contains(Ok(()), "error");
    }

    #[tokio::test]
    async fn test_captured_outbound_routes_replies() {
        let (outbound, mut rx) = captured_outbound("console");
        outbound
            .send(OutboundReply::new("console", "local", "hi"))
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().text, "hi");
        assert!(outbound.send(OutboundReply::new("other", "x", "y")).is_err());
    }
}
