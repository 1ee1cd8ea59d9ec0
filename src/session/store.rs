//! Session & memory store
//!
//! [`SessionStore`] owns every session of the process. It keeps a registry
//! mapping each (surface, user) pair to exactly one session id, caches
//! session bodies in memory within a byte budget, and writes every
//! mutation through to a [`DurableStore`].
//!
//! Durable I/O runs on the blocking pool and never while the registry lock
//! is held. A per-session I/O lock keeps the writes of one session in the
//! order their snapshots were taken, and a per-session generation lets a
//! reload that raced with a newer write be discarded.

use crate::config::SessionConfig;
use crate::error::{PocketclawError, Result};
use crate::session::persistence::{decode_session, encode_session, DurableStore};
use crate::session::{Message, Session, SessionKey, SessionLimits};
use anyhow::Context;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard, OwnedMutexGuard};

/// Tunables for a [`SessionStore`]
#[derive(Debug, Clone, Copy)]
pub struct StoreSettings {
    /// Per-session history bounds
    pub limits: SessionLimits,
    /// Idle time after which a session expires
    pub expiry: Duration,
    /// Budget for cached session bodies
    pub memory_budget_bytes: usize,
}

impl From<&SessionConfig> for StoreSettings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            limits: SessionLimits::from(config),
            expiry: Duration::from_secs(config.expiry_secs),
            memory_budget_bytes: config.memory_limit_mb.saturating_mul(1024 * 1024),
        }
    }
}

/// Registry view of one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    /// Session identifier
    pub id: String,
    /// Conversation the session belongs to
    pub key: SessionKey,
    /// Latest activity
    pub last_activity_at: DateTime<Utc>,
    /// Whether the body is currently held in memory
    pub cached: bool,
}

type IoLock = Arc<Mutex<()>>;

struct Entry {
    key: SessionKey,
    last_activity_at: DateTime<Utc>,
    cached: Option<Session>,
    /// Set when the cached body has not reached durable storage
    dirty: bool,
    /// Held while a snapshot of this session is taken and written
    io: IoLock,
    /// Bumped whenever the cached body changes
    generation: u64,
}

#[derive(Default)]
struct Registry {
    by_key: HashMap<SessionKey, String>,
    entries: HashMap<String, Entry>,
}

impl Registry {
    fn insert(&mut self, session: Session, dirty: bool, io: IoLock) {
        let id = session.id.clone();
        let key = session.key();
        let generation = self
            .entries
            .get(&id)
            .map_or(0, |entry| entry.generation + 1);
        self.by_key.insert(key.clone(), id.clone());
        self.entries.insert(
            id,
            Entry {
                key,
                last_activity_at: session.last_activity_at,
                cached: Some(session),
                dirty,
                io,
                generation,
            },
        );
    }

    fn remove(&mut self, id: &str) -> Option<Entry> {
        let entry = self.entries.remove(id)?;
        if self.by_key.get(&entry.key).map(String::as_str) == Some(id) {
            self.by_key.remove(&entry.key);
        }
        Some(entry)
    }

    fn io_lock(&self, id: &str) -> Option<IoLock> {
        self.entries.get(id).map(|entry| Arc::clone(&entry.io))
    }

    fn set_dirty(&mut self, id: &str, dirty: bool) {
        if let Some(entry) = self.entries.get_mut(id) {
            entry.dirty = dirty;
        }
    }

    fn cached_bytes(&self) -> usize {
        self.entries
            .values()
            .filter_map(|entry| entry.cached.as_ref())
            .map(Session::byte_size)
            .sum()
    }
}

/// Bounded, durable store of per-conversation state
pub struct SessionStore {
    registry: Mutex<Registry>,
    backend: Arc<dyn DurableStore>,
    settings: StoreSettings,
}

impl SessionStore {
    /// Open a store over `backend`, rebuilding the conversation index
    ///
    /// Records that cannot be read or decoded are skipped with a warning;
    /// records already past expiry are deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored ids cannot be listed
    pub fn open(backend: Arc<dyn DurableStore>, settings: StoreSettings) -> Result<Self> {
        let mut registry = Registry::default();
        let cutoff = expiry_cutoff(Utc::now(), settings.expiry);

        for id in backend.list_ids()? {
            let session = match backend.read(&id).and_then(|bytes| match bytes {
                Some(bytes) => decode_session(&bytes).map(Some),
                None => Ok(None),
            }) {
                Ok(Some(session)) => session,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(session_id = %id, error = %e, "Skipping unreadable session record");
                    continue;
                }
            };

            if session.last_activity_at < cutoff {
                if let Err(e) = backend.delete(&id) {
                    tracing::warn!(session_id = %id, error = %e, "Failed to delete expired session");
                }
                continue;
            }

            let key = session.key();
            if let Some(existing) = registry.by_key.get(&key) {
                let newer = registry
                    .entries
                    .get(existing)
                    .map(|entry| entry.last_activity_at < session.last_activity_at)
                    .unwrap_or(true);
                if !newer {
                    continue;
                }
                let existing = existing.clone();
                registry.remove(&existing);
            }

            registry.by_key.insert(key.clone(), session.id.clone());
            registry.entries.insert(
                session.id.clone(),
                Entry {
                    key,
                    last_activity_at: session.last_activity_at,
                    cached: None,
                    dirty: false,
                    io: IoLock::default(),
                    generation: 0,
                },
            );
        }

        tracing::info!(sessions = registry.entries.len(), "Session store opened");
        Ok(Self {
            registry: Mutex::new(registry),
            backend,
            settings,
        })
    }

    /// Store settings
    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    /// Return the session for (surface, user), creating it on first contact
    ///
    /// Concurrent calls for the same pair observe the same session. Every
    /// call counts as activity, so a session in use is not swept while its
    /// turn runs. When the stored body cannot be read, a fresh session
    /// replaces it rather than failing the caller.
    pub async fn get_or_create(&self, surface_id: &str, user_id: &str) -> Session {
        let key = SessionKey::new(surface_id, user_id);
        let mut unreadable = None;

        let session = loop {
            let existing = self.registry.lock().await.by_key.get(&key).cloned();
            if let Some(id) = existing {
                match self.lock_cached(&id).await {
                    Ok(mut registry) => {
                        if let Some(entry) = registry.entries.get_mut(&id) {
                            entry.last_activity_at = Utc::now();
                            if let Some(session) = &entry.cached {
                                return session.clone();
                            }
                        }
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!(
                            session_id = %id,
                            error = %e,
                            "Failed to load session, starting a new one"
                        );
                        self.registry.lock().await.remove(&id);
                        unreadable = Some(id);
                        continue;
                    }
                }
            }

            let mut registry = self.registry.lock().await;
            if registry.by_key.contains_key(&key) {
                // Another caller created it first
                continue;
            }
            let session = Session::new(surface_id, user_id);
            let io = IoLock::default();
            let guard = Arc::clone(&io).lock_owned().await;
            registry.insert(session.clone(), true, io);
            break (session, guard);
        };
        let (session, _io) = session;
        tracing::debug!(session_id = %session.id, surface = surface_id, "Created session");

        if let Some(id) = unreadable {
            let stale = id.clone();
            if let Err(e) = self.blocking(move |backend| backend.delete(&stale)).await {
                tracing::debug!(session_id = %id, error = %e, "Failed to delete unreadable session");
            }
        }

        let result = self.write(session.clone()).await;
        if let Err(e) = &result {
            tracing::error!(session_id = %session.id, error = %e, "Failed to persist new session");
        }
        self.registry
            .lock()
            .await
            .set_dirty(&session.id, result.is_err());
        session
    }

    /// Lock the registry with the body of `id` in the cache
    ///
    /// A released body is read back with the registry unlocked; the read is
    /// thrown away and repeated if the session changed in the meantime.
    async fn lock_cached(&self, id: &str) -> Result<MutexGuard<'_, Registry>> {
        loop {
            let generation = {
                let registry = self.registry.lock().await;
                let (cached, generation) = match registry.entries.get(id) {
                    Some(entry) => (entry.cached.is_some(), entry.generation),
                    None => return Err(unknown_session(id)),
                };
                if cached {
                    return Ok(registry);
                }
                generation
            };

            let loaded = self.read(id).await?.ok_or_else(|| {
                PocketclawError::Storage(format!("Session {} missing from store", id))
            })?;

            let mut registry = self.registry.lock().await;
            let cached = match registry.entries.get_mut(id) {
                Some(entry) => {
                    if entry.cached.is_none() && entry.generation == generation {
                        entry.cached = Some(loaded);
                    }
                    entry.cached.is_some()
                }
                None => return Err(unknown_session(id)),
            };
            if cached {
                return Ok(registry);
            }
        }
    }

    /// Take the I/O lock of a known session
    async fn lock_io(&self, session_id: &str) -> Result<OwnedMutexGuard<()>> {
        let io = self
            .registry
            .lock()
            .await
            .io_lock(session_id)
            .ok_or_else(|| unknown_session(session_id))?;
        Ok(io.lock_owned().await)
    }

    /// Clone of the current state of a session
    pub async fn snapshot(&self, session_id: &str) -> Result<Session> {
        let mut registry = self.lock_cached(session_id).await?;
        Ok(cached_mut(&mut registry, session_id)?.clone())
    }

    /// Append one message, apply the eviction policy and persist
    ///
    /// Returns the number of evicted messages.
    pub async fn append(&self, session_id: &str, message: Message) -> Result<usize> {
        self.commit(session_id, vec![message]).await
    }

    /// Append a turn's messages in order, then persist once
    ///
    /// Returns the number of evicted messages.
    ///
    /// # Errors
    ///
    /// Returns `PocketclawError::Storage` if the session is unknown or the
    /// write fails. On write failure the in-memory state keeps the new
    /// messages and is retried on the next commit.
    pub async fn commit(&self, session_id: &str, messages: Vec<Message>) -> Result<usize> {
        let _io = self.lock_io(session_id).await?;
        let limits = self.settings.limits;

        let (snapshot, evicted) = {
            let mut registry = self.lock_cached(session_id).await?;
            let session = cached_mut(&mut registry, session_id)?;
            let evicted: usize = messages
                .into_iter()
                .map(|message| session.append(message, &limits))
                .sum();
            session.touch();
            let snapshot = session.clone();
            if let Some(entry) = registry.entries.get_mut(session_id) {
                entry.last_activity_at = snapshot.last_activity_at;
                entry.dirty = true;
                entry.generation += 1;
            }
            (snapshot, evicted)
        };

        if evicted > 0 {
            tracing::debug!(session_id, evicted, "Evicted oldest messages");
        }

        let result = self.write(snapshot).await;
        let mut registry = self.registry.lock().await;
        registry.set_dirty(session_id, result.is_err());
        self.enforce_budget(&mut registry, session_id);
        result.map(|()| evicted)
    }

    /// Write a session through to durable storage and refresh the cache
    pub async fn persist(&self, session: &Session) -> Result<()> {
        let io = self
            .registry
            .lock()
            .await
            .io_lock(&session.id)
            .unwrap_or_default();
        let _io = Arc::clone(&io).lock_owned().await;

        {
            let mut registry = self.registry.lock().await;
            let key = session.key();
            if let Some(previous) = registry.by_key.get(&key).cloned() {
                if previous != session.id {
                    registry.remove(&previous);
                }
            }
            registry.insert(session.clone(), true, io);
        }

        let result = self.write(session.clone()).await;
        let mut registry = self.registry.lock().await;
        registry.set_dirty(&session.id, result.is_err());
        self.enforce_budget(&mut registry, &session.id);
        result
    }

    /// Read a session straight from durable storage
    pub async fn load(&self, session_id: &str) -> Result<Option<Session>> {
        self.read(session_id).await
    }

    /// Remove sessions idle for longer than the configured expiry
    ///
    /// Returns how many sessions were removed. Running it again without
    /// intervening activity removes nothing.
    pub async fn expire_sweep(&self) -> Result<usize> {
        self.expire_sweep_at(Utc::now()).await
    }

    /// [`expire_sweep`](Self::expire_sweep) against an explicit clock reading
    ///
    /// Sessions with a write in flight are left for the next sweep.
    pub async fn expire_sweep_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = expiry_cutoff(now, self.settings.expiry);

        let expired: Vec<String> = {
            let mut registry = self.registry.lock().await;
            let expired: Vec<String> = registry
                .entries
                .iter()
                .filter(|(_, entry)| entry.last_activity_at < cutoff && entry.io.try_lock().is_ok())
                .map(|(id, _)| id.clone())
                .collect();
            for id in &expired {
                registry.remove(id);
            }
            expired
        };

        for id in &expired {
            let target = id.clone();
            if let Err(e) = self.blocking(move |backend| backend.delete(&target)).await {
                tracing::warn!(session_id = %id, error = %e, "Failed to delete expired session");
            }
        }

        if !expired.is_empty() {
            tracing::info!(removed = expired.len(), "Expired idle sessions");
        }
        Ok(expired.len())
    }

    /// Registry summaries ordered by most recent activity
    pub async fn summaries(&self) -> Vec<SessionSummary> {
        let registry = self.registry.lock().await;
        let mut summaries: Vec<_> = registry
            .entries
            .iter()
            .map(|(id, entry)| SessionSummary {
                id: id.clone(),
                key: entry.key.clone(),
                last_activity_at: entry.last_activity_at,
                cached: entry.cached.is_some(),
            })
            .collect();
        summaries.sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at));
        summaries
    }

    /// Number of live sessions
    pub async fn len(&self) -> usize {
        self.registry.lock().await.entries.len()
    }

    /// True when no session exists
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Run one durable store call on the blocking pool
    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn DurableStore) -> Result<T> + Send + 'static,
    {
        let backend = Arc::clone(&self.backend);
        tokio::task::spawn_blocking(move || op(&*backend))
            .await
            .context("Session storage task failed")?
    }

    async fn write(&self, session: Session) -> Result<()> {
        self.blocking(move |backend| {
            let bytes = encode_session(&session)?;
            backend.write(&session.id, &bytes)
        })
        .await
    }

    async fn read(&self, session_id: &str) -> Result<Option<Session>> {
        let id = session_id.to_string();
        self.blocking(move |backend| match backend.read(&id)? {
            Some(bytes) => decode_session(&bytes).map(Some),
            None => Ok(None),
        })
        .await
    }

    /// Drop cached bodies of the least recently active clean sessions until
    /// the cache fits the budget. `keep` is never released.
    fn enforce_budget(&self, registry: &mut Registry, keep: &str) {
        let mut cached = registry.cached_bytes();
        if cached <= self.settings.memory_budget_bytes {
            return;
        }

        let mut candidates: Vec<(DateTime<Utc>, String)> = registry
            .entries
            .iter()
            .filter(|(id, entry)| id.as_str() != keep && entry.cached.is_some() && !entry.dirty)
            .map(|(id, entry)| (entry.last_activity_at, id.clone()))
            .collect();
        candidates.sort();

        for (_, id) in candidates {
            if cached <= self.settings.memory_budget_bytes {
                break;
            }
            if let Some(entry) = registry.entries.get_mut(&id) {
                if let Some(session) = entry.cached.take() {
                    cached -= session.byte_size();
                    tracing::debug!(session_id = %id, "Released cached session body");
                }
            }
        }
    }
}

fn unknown_session(id: &str) -> anyhow::Error {
    PocketclawError::Storage(format!("Unknown session: {}", id)).into()
}

fn cached_mut<'a>(registry: &'a mut Registry, id: &str) -> Result<&'a mut Session> {
    registry
        .entries
        .get_mut(id)
        .and_then(|entry| entry.cached.as_mut())
        .ok_or_else(|| PocketclawError::Internal("session cache empty after load".into()).into())
}

fn expiry_cutoff(now: DateTime<Utc>, expiry: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(expiry)
        .ok()
        .and_then(|expiry| now.checked_sub_signed(expiry))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
