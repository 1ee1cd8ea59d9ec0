//! Durable storage adapters for sessions
//!
//! The session store writes serialized sessions through the narrow
//! [`DurableStore`] contract. Two implementations ship with the crate: an
//! embedded `sled` database for real deployments and a process-local map
//! for tests and ephemeral runs.

use crate::error::{PocketclawError, Result};
use crate::session::Session;
use sled::Db;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

/// Byte-oriented persistence contract consumed by the session store
#[cfg_attr(test, mockall::automock)]
pub trait DurableStore: Send + Sync {
    /// Store `bytes` under `session_id`, replacing any previous value
    fn write(&self, session_id: &str, bytes: &[u8]) -> Result<()>;

    /// Fetch the bytes stored under `session_id`
    fn read(&self, session_id: &str) -> Result<Option<Vec<u8>>>;

    /// Every stored identifier
    fn list_ids(&self) -> Result<Vec<String>>;

    /// Remove `session_id`; removing a missing id is not an error
    fn delete(&self, session_id: &str) -> Result<()>;
}

/// Serialize a session into its durable record
pub fn encode_session(session: &Session) -> Result<Vec<u8>> {
    serde_json::to_vec(session).map_err(|e| {
        PocketclawError::Storage(format!("Failed to serialize session {}: {}", session.id, e))
            .into()
    })
}

/// Deserialize a durable record
pub fn decode_session(bytes: &[u8]) -> Result<Session> {
    serde_json::from_slice(bytes).map_err(|e| {
        PocketclawError::Storage(format!("Failed to deserialize session: {}", e)).into()
    })
}

/// Session persistence backed by an embedded `sled` database
///
/// # Examples
///
/// ```
/// use pocketclaw::session::{DurableStore, SledStore};
///
/// # fn main() -> pocketclaw::error::Result<()> {
/// let dir = tempfile::tempdir()?;
/// let store = SledStore::new(dir.path().join("sessions.db"))?;
/// store.write("01J0000000000000000000000", b"{}")?;
/// assert_eq!(store.list_ids()?.len(), 1);
/// # Ok(())
/// # }
/// ```
pub struct SledStore {
    db: Db,
}

impl SledStore {
    /// Open or create a sled database at `path`
    ///
    /// # Errors
    ///
    /// Returns `PocketclawError::Storage` if the database cannot be opened
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)
            .map_err(|e| PocketclawError::Storage(format!("Failed to open database: {}", e)))?;
        Ok(Self { db })
    }
}

impl DurableStore for SledStore {
    fn write(&self, session_id: &str, bytes: &[u8]) -> Result<()> {
        self.db
            .insert(session_id.as_bytes(), bytes)
            .map_err(|e| PocketclawError::Storage(format!("Failed to insert session: {}", e)))?;
        self.db
            .flush()
            .map_err(|e| PocketclawError::Storage(format!("Failed to flush database: {}", e)))?;
        Ok(())
    }

    fn read(&self, session_id: &str) -> Result<Option<Vec<u8>>> {
        let value = self
            .db
            .get(session_id.as_bytes())
            .map_err(|e| PocketclawError::Storage(format!("Failed to read session: {}", e)))?;
        Ok(value.map(|ivec| ivec.to_vec()))
    }

    fn list_ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for item in self.db.iter().keys() {
            let key = item
                .map_err(|e| PocketclawError::Storage(format!("Failed to iterate keys: {}", e)))?;
            ids.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(ids)
    }

    fn delete(&self, session_id: &str) -> Result<()> {
        self.db
            .remove(session_id.as_bytes())
            .map_err(|e| PocketclawError::Storage(format!("Failed to delete session: {}", e)))?;
        self.db
            .flush()
            .map_err(|e| PocketclawError::Storage(format!("Failed to flush database: {}", e)))?;
        Ok(())
    }
}

/// Process-local session persistence
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>>> {
        self.records
            .lock()
            .map_err(|_| PocketclawError::Storage("memory store lock poisoned".to_string()).into())
    }
}

impl DurableStore for MemoryStore {
    fn write(&self, session_id: &str, bytes: &[u8]) -> Result<()> {
        self.records()?
            .insert(session_id.to_string(), bytes.to_vec());
        Ok(())
    }

    fn read(&self, session_id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.records()?.get(session_id).cloned())
    }

    fn list_ids(&self) -> Result<Vec<String>> {
        Ok(self.records()?.keys().cloned().collect())
    }

    fn delete(&self, session_id: &str) -> Result<()> {
        self.records()?.remove(session_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Message, SessionLimits};
    use tempfile::TempDir;

    fn sample_session() -> Session {
        let limits = SessionLimits {
            max_messages: 10,
            max_bytes: 4096,
        };
        let mut session = Session::new("telegram", "42");
        session.metadata.tags.push("vip".to_string());
        session
            .metadata
            .custom
            .insert("locale".to_string(), "de-DE".to_string());
        session.append(Message::user("hello", "telegram", "42"), &limits);
        session.append(Message::assistant("hi there", "telegram", "42"), &limits);
        session.append(
            Message::tool_result("fetch", "200 OK", "telegram", "42"),
            &limits,
        );
        session
    }

    #[test]
    fn test_encode_decode_preserves_every_field() {
        let session = sample_session();
        let decoded = decode_session(&encode_session(&session).unwrap()).unwrap();
        assert_eq!(decoded, session);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = decode_session(b"not json").unwrap_err();
        assert!(err.to_string().contains("Storage error"));
    }

    #[test]
    fn test_sled_store_write_read_delete() {
        let dir = TempDir::new().unwrap();
        let store = SledStore::new(dir.path().join("db")).unwrap();

        store.write("a", b"first").unwrap();
        store.write("b", b"second").unwrap();
        store.write("a", b"replaced").unwrap();

        assert_eq!(store.read("a").unwrap(), Some(b"replaced".to_vec()));
        let mut ids = store.list_ids().unwrap();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);

        store.delete("a").unwrap();
        store.delete("missing").unwrap();
        assert_eq!(store.read("a").unwrap(), None);
        assert_eq!(store.list_ids().unwrap(), vec!["b"]);
    }

    #[test]
    fn test_sled_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db");
        let session = sample_session();
        {
            let store = SledStore::new(&path).unwrap();
            store
                .write(&session.id, &encode_session(&session).unwrap())
                .unwrap();
        }
        let store = SledStore::new(&path).unwrap();
        let bytes = store.read(&session.id).unwrap().unwrap();
        assert_eq!(decode_session(&bytes).unwrap(), session);
    }

    #[test]
    fn test_memory_store_contract() {
        let store = MemoryStore::new();
        assert!(store.list_ids().unwrap().is_empty());
        store.write("x", b"1").unwrap();
        assert_eq!(store.read("x").unwrap(), Some(b"1".to_vec()));
        store.delete("x").unwrap();
        assert_eq!(store.read("x").unwrap(), None);
    }

    mod properties {
        use super::super::{decode_session, encode_session, DurableStore, MemoryStore};
        use crate::session::{Message, Session, SessionStore, StoreSettings, SessionLimits};
        use chrono::{DateTime, Utc};
        use proptest::collection::{btree_map, vec};
        use proptest::prelude::*;
        use std::sync::Arc;
        use std::time::Duration;

        fn instant(secs: i64, nanos: u32) -> DateTime<Utc> {
            DateTime::<Utc>::from_timestamp(secs, nanos).unwrap()
        }

        fn message(role: u8, content: &str, at: DateTime<Utc>, session: &Session) -> Message {
            let (surface, user) = (session.surface_id.as_str(), session.user_id.as_str());
            let message = match role {
                0 => Message::user(content, surface, user),
                1 => Message::assistant(content, surface, user),
                2 => Message::system(content, surface, user),
                _ => Message::tool_result("fetch", content, surface, user),
            };
            message.at(at)
        }

        proptest! {
            #[test]
            fn persisted_session_loads_back_unchanged(
                surface in "[a-z]{1,8}",
                user in "[a-zA-Z0-9_]{1,12}",
                created in (0i64..4_000_000_000, 0u32..1_000_000_000),
                idle_secs in 0i64..1_000_000,
                entries in vec((0u8..4, ".{0,40}", 0i64..1_000_000, 0u32..1_000_000_000), 0..12),
                tags in vec("[a-z]{1,6}", 0..4),
                custom in btree_map("[a-z]{1,6}", ".{0,12}", 0..4),
            ) {
                let mut session = Session::new(&surface, &user);
                session.created_at = instant(created.0, created.1);
                session.last_activity_at = instant(created.0 + idle_secs, created.1);
                for (role, content, offset, nanos) in &entries {
                    let at = instant(created.0 + offset, *nanos);
                    let message = message(*role, content, at, &session);
                    session.messages.push_back(message);
                }
                session.metadata.tags = tags;
                session.metadata.custom = custom;

                let bytes = encode_session(&session).unwrap();
                prop_assert_eq!(&decode_session(&bytes).unwrap(), &session);

                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .unwrap();
                let backend = Arc::new(MemoryStore::new());
                let store = SessionStore::open(
                    backend.clone(),
                    StoreSettings {
                        limits: SessionLimits { max_messages: 64, max_bytes: 1 << 16 },
                        expiry: Duration::from_secs(3600),
                        memory_budget_bytes: 1 << 20,
                    },
                )
                .unwrap();
                let loaded = runtime.block_on(async {
                    store.persist(&session).await.unwrap();
                    store.load(&session.id).await.unwrap()
                });
                prop_assert_eq!(loaded.as_ref(), Some(&session));
                prop_assert_eq!(backend.list_ids().unwrap(), vec![session.id.clone()]);
            }
        }
    }
}
