//! Session & memory store
//!
//! Per-conversation state: bounded message history, metadata and durable
//! persistence.
//!
//! - [`types`] - messages, sessions and the eviction policy
//! - [`store`] - the shared registry with single-creation and expiry
//! - [`persistence`] - durable store adapters (`sled`, in-memory)

pub mod persistence;
pub mod store;
pub mod types;

pub use persistence::{decode_session, encode_session, DurableStore, MemoryStore, SledStore};
pub use store::{SessionStore, SessionSummary, StoreSettings};
pub use types::{
    new_session_id, Message, Role, Session, SessionKey, SessionLimits, SessionMetadata,
};

use crate::config::{SessionConfig, StorageKind};
use crate::error::Result;
use std::sync::Arc;

/// Build the durable store selected by configuration
///
/// # Errors
///
/// Returns an error if the sled database cannot be opened
pub fn open_durable_store(config: &SessionConfig) -> Result<Arc<dyn DurableStore>> {
    match config.storage {
        StorageKind::Sled => {
            let dir = config.storage_dir();
            if let Some(parent) = dir.parent() {
                std::fs::create_dir_all(parent)?;
            }
            tracing::debug!(path = %dir.display(), "Opening sled session store");
            Ok(Arc::new(SledStore::new(dir)?))
        }
        StorageKind::Memory => Ok(Arc::new(MemoryStore::new())),
    }
}
