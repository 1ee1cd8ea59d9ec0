//! Transport manager
//!
//! Spawns one [`SurfaceWorker`] per adapter, owns their cancellation
//! tokens and join handles, and exposes administrative control
//! (disable, state snapshots, shutdown).

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{PocketclawError, Result};
use crate::transport::endpoint::{SharedState, SurfaceWorker};
use crate::transport::{
    CanonicalEvent, ConnectionStatus, EndpointSettings, EndpointState, OutboundSender,
    TransportAdapter,
};

struct Endpoint {
    state: SharedState,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

/// Owner of every running surface worker
pub struct TransportManager {
    endpoints: Mutex<BTreeMap<String, Endpoint>>,
    outbound: OutboundSender,
}

impl TransportManager {
    /// Start a worker for each adapter
    ///
    /// Inbound events from every surface go to `inbound`; `outbound` gains
    /// one route per surface. Workers stop when `shutdown` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns `PocketclawError::Config` when two adapters share a surface id
    pub fn start(
        adapters: Vec<Arc<dyn TransportAdapter>>,
        settings: EndpointSettings,
        inbound: mpsc::Sender<CanonicalEvent>,
        outbound: OutboundSender,
        shutdown: &CancellationToken,
    ) -> Result<Self> {
        let mut endpoints = BTreeMap::new();
        for adapter in adapters {
            let surface = adapter.surface_id().to_string();
            if endpoints.contains_key(&surface) {
                return Err(
                    PocketclawError::Config(format!("duplicate surface id '{}'", surface)).into(),
                );
            }

            let state: SharedState = Arc::new(RwLock::new(EndpointState::default()));
            let cancel = shutdown.child_token();
            let (tx, rx) = mpsc::unbounded_channel();
            outbound.register(&surface, tx);

            let worker = SurfaceWorker::new(
                adapter,
                settings.clone(),
                Arc::clone(&state),
                inbound.clone(),
                rx,
                cancel.clone(),
            );
            tracing::info!(surface = %surface, "Starting surface worker");
            let task = tokio::spawn(worker.run());

            endpoints.insert(
                surface,
                Endpoint {
                    state,
                    cancel,
                    task: Some(task),
                },
            );
        }

        Ok(Self {
            endpoints: Mutex::new(endpoints),
            outbound,
        })
    }

    /// Sender that routes replies to these surfaces
    pub fn outbound(&self) -> OutboundSender {
        self.outbound.clone()
    }

    /// Stop one surface; other surfaces are unaffected
    ///
    /// # Errors
    ///
    /// Returns `PocketclawError::Transport` for an unknown surface
    pub async fn disable(&self, surface_id: &str) -> Result<()> {
        let task = {
            let mut endpoints = self.endpoints.lock().await;
            let endpoint = endpoints
                .get_mut(surface_id)
                .ok_or_else(|| PocketclawError::Transport {
                    surface: surface_id.to_string(),
                    message: "no such surface".to_string(),
                })?;
            endpoint.cancel.cancel();
            self.outbound.unregister(surface_id);
            endpoint.task.take()
        };

        if let Some(task) = task {
            let _ = task.await;
        }
        let endpoints = self.endpoints.lock().await;
        if let Some(endpoint) = endpoints.get(surface_id) {
            if let Ok(mut state) = endpoint.state.write() {
                state.status = ConnectionStatus::Disabled;
            }
        }
        tracing::info!(surface = %surface_id, "Surface disabled");
        Ok(())
    }

    /// Snapshot of every surface's state, ordered by surface id
    pub async fn states(&self) -> Vec<(String, EndpointState)> {
        let endpoints = self.endpoints.lock().await;
        endpoints
            .iter()
            .filter_map(|(surface, endpoint)| {
                endpoint
                    .state
                    .read()
                    .ok()
                    .map(|state| (surface.clone(), state.clone()))
            })
            .collect()
    }

    /// State of one surface
    pub async fn state(&self, surface_id: &str) -> Option<EndpointState> {
        let endpoints = self.endpoints.lock().await;
        endpoints
            .get(surface_id)
            .and_then(|endpoint| endpoint.state.read().ok().map(|s| s.clone()))
    }

    /// Stop every worker, waiting up to `timeout` for graceful disconnects
    pub async fn shutdown(&self, timeout: Duration) {
        let tasks: Vec<(String, JoinHandle<()>)> = {
            let mut endpoints = self.endpoints.lock().await;
            endpoints
                .iter_mut()
                .filter_map(|(surface, endpoint)| {
                    endpoint.cancel.cancel();
                    self.outbound.unregister(surface);
                    endpoint.task.take().map(|task| (surface.clone(), task))
                })
                .collect()
        };

        for (surface, mut task) in tasks {
            if tokio::time::timeout(timeout, &mut task).await.is_err() {
                tracing::warn!(surface = %surface, "Surface did not stop in time, aborting");
                task.abort();
            }
        }
    }
}
