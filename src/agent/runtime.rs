//! Runtime assembly and lifecycle
//!
//! [`Runtime`] wires the session store, inference router, capability
//! dispatcher, scheduler and transports together, then owns the background
//! tasks that move events between them:
//!
//! ```text
//! transports ──▶ inbound queue ──▶ intake ──▶ session lanes ──▶ agent loop
//!      ▲                                                          │
//!      └──────────────────── outbound sender ◀────────────────────┘
//! ```
//!
//! Shutdown runs in reverse: intake stops first, in-flight turns get a grace
//! period, then surfaces flush their queued replies and disconnect.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::agent::core::{AgentLoop, AgentSettings};
use crate::agent::lanes::LaneSet;
use crate::config::{Config, SurfaceKind};
use crate::error::{PocketclawError, Result};
use crate::providers::InferenceRouter;
use crate::scheduler::Scheduler;
use crate::session::{open_durable_store, DurableStore, SessionStore, StoreSettings};
use crate::tools::device::BusDriver;
use crate::tools::CapabilityRegistryBuilder;
use crate::transport::console::ConsoleTransport;
use crate::transport::telegram::TelegramTransport;
use crate::transport::{
    CanonicalEvent, EndpointSettings, OutboundSender, TransportAdapter, TransportManager,
};

/// Builder for [`Runtime`]
///
/// Every component defaults to what the configuration describes; the
/// `with_*` methods substitute in-process implementations, which is how
/// tests and embedders drive the runtime without network access.
pub struct RuntimeBuilder {
    config: Config,
    router: Option<Arc<InferenceRouter>>,
    durable: Option<Arc<dyn DurableStore>>,
    transports: Option<Vec<Arc<dyn TransportAdapter>>>,
    bus: Option<Arc<dyn BusDriver>>,
    console_eof_shutdown: bool,
}

impl RuntimeBuilder {
    /// Use `router` instead of building one from `inference`
    pub fn with_router(mut self, router: Arc<InferenceRouter>) -> Self {
        self.router = Some(router);
        self
    }

    /// Use `store` as the durable session backend
    pub fn with_durable_store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.durable = Some(store);
        self
    }

    /// Use these adapters instead of the configured surfaces
    pub fn with_transports(mut self, transports: Vec<Arc<dyn TransportAdapter>>) -> Self {
        self.transports = Some(transports);
        self
    }

    /// Use `driver` for device access
    pub fn with_bus_driver(mut self, driver: Arc<dyn BusDriver>) -> Self {
        self.bus = Some(driver);
        self
    }

    /// Request shutdown when the console surface reaches end of input
    pub fn shutdown_on_console_eof(mut self, enabled: bool) -> Self {
        self.console_eof_shutdown = enabled;
        self
    }

    /// Build every component and start the background tasks
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `PocketclawError::Config` (or the underlying storage error)
    /// when a component cannot be constructed
    pub fn start(self) -> Result<Runtime> {
        let config = self.config;
        let requested = CancellationToken::new();

        let durable = match self.durable {
            Some(store) => store,
            None => open_durable_store(&config.session)?,
        };
        let store = Arc::new(SessionStore::open(
            durable,
            StoreSettings::from(&config.session),
        )?);

        let router = match self.router {
            Some(router) => router,
            None => Arc::new(InferenceRouter::from_config(&config.inference)?),
        };

        let (inbound_tx, inbound_rx) =
            mpsc::channel::<CanonicalEvent>(config.transport.inbound_queue_depth.max(1));
        let outbound = OutboundSender::new();

        let scheduler = config.tools.schedule.enabled.then(|| {
            Scheduler::new(
                &config.tools.schedule,
                inbound_tx.clone(),
                CancellationToken::new(),
            )
        });

        let mut registry = CapabilityRegistryBuilder::new(config.tools.clone())
            .with_outbound(outbound.clone());
        if let Some(scheduler) = &scheduler {
            registry = registry.with_scheduler(scheduler.clone());
        }
        if let Some(bus) = self.bus {
            registry = registry.with_bus_driver(bus);
        }
        let dispatcher = Arc::new(registry.build_dispatcher()?);

        let agent = Arc::new(AgentLoop::new(
            Arc::clone(&store),
            Arc::clone(&router),
            dispatcher,
            outbound.clone(),
            AgentSettings::from(&config.agent),
        ));
        let lanes = Arc::new(LaneSet::new(agent, config.agent.max_concurrent_turns));

        let adapters = match self.transports {
            Some(adapters) => adapters,
            None => configured_adapters(&config, self.console_eof_shutdown.then_some(&requested))?,
        };
        if adapters.is_empty() {
            tracing::warn!("No messaging surfaces configured");
        }

        let transport_token = CancellationToken::new();
        let transports = TransportManager::start(
            adapters,
            EndpointSettings::from(&config.transport),
            inbound_tx.clone(),
            outbound.clone(),
            &transport_token,
        )?;

        let intake = CancellationToken::new();
        let tasks = TaskTracker::new();
        tasks.spawn(run_intake(inbound_rx, Arc::clone(&lanes), intake.clone()));
        tasks.spawn(run_sweeper(
            Arc::clone(&store),
            Duration::from_secs(config.session.sweep_interval_secs.max(1)),
            intake.clone(),
        ));

        tracing::info!(
            backends = ?router.backend_names(),
            max_concurrent_turns = config.agent.max_concurrent_turns,
            "Runtime started"
        );

        Ok(Runtime {
            config,
            store,
            router,
            lanes,
            transports,
            outbound,
            scheduler,
            inbound: inbound_tx,
            intake,
            transport_token,
            requested,
            tasks,
        })
    }
}

fn configured_adapters(
    config: &Config,
    eof_token: Option<&CancellationToken>,
) -> Result<Vec<Arc<dyn TransportAdapter>>> {
    let mut adapters: Vec<Arc<dyn TransportAdapter>> = Vec::new();
    for surface in config.transport.surfaces.iter().filter(|s| s.enabled) {
        match surface.kind {
            SurfaceKind::Console => {
                let mut console = ConsoleTransport::new(&surface.id);
                if let Some(token) = eof_token {
                    console = console.with_shutdown_on_eof(token.clone());
                }
                adapters.push(Arc::new(console));
            }
            SurfaceKind::Telegram => adapters.push(Arc::new(TelegramTransport::new(surface)?)),
        }
    }
    Ok(adapters)
}

async fn run_intake(
    mut inbound: mpsc::Receiver<CanonicalEvent>,
    lanes: Arc<LaneSet>,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            event = inbound.recv() => match event {
                Some(event) => {
                    lanes.submit(event);
                }
                None => break,
            },
        }
    }
    tracing::debug!("Intake stopped");
}

async fn run_sweeper(store: Arc<SessionStore>, every: Duration, stop: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await;
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = interval.tick() => {
                match store.expire_sweep().await {
                    Ok(0) => {}
                    Ok(expired) => tracing::info!(expired, "Expired idle sessions"),
                    Err(e) => tracing::warn!(error = %e, "Session sweep failed"),
                }
            }
        }
    }
}

/// A running agent runtime
pub struct Runtime {
    config: Config,
    store: Arc<SessionStore>,
    router: Arc<InferenceRouter>,
    lanes: Arc<LaneSet>,
    transports: TransportManager,
    outbound: OutboundSender,
    scheduler: Option<Scheduler>,
    inbound: mpsc::Sender<CanonicalEvent>,
    intake: CancellationToken,
    transport_token: CancellationToken,
    requested: CancellationToken,
    tasks: TaskTracker,
}

impl Runtime {
    /// Start building a runtime over `config`
    pub fn builder(config: Config) -> RuntimeBuilder {
        RuntimeBuilder {
            config,
            router: None,
            durable: None,
            transports: None,
            bus: None,
            console_eof_shutdown: false,
        }
    }

    /// Configuration the runtime was built from
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Session store
    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Inference router
    pub fn router(&self) -> &Arc<InferenceRouter> {
        &self.router
    }

    /// Surface workers
    pub fn transports(&self) -> &TransportManager {
        &self.transports
    }

    /// Reply router
    pub fn outbound(&self) -> &OutboundSender {
        &self.outbound
    }

    /// Token that, when cancelled, makes [`Runtime::run`] return
    pub fn shutdown_token(&self) -> CancellationToken {
        self.requested.clone()
    }

    /// Inject an event as if a surface had received it
    ///
    /// # Errors
    ///
    /// Returns `PocketclawError::Internal` once intake has stopped
    pub async fn submit(&self, event: CanonicalEvent) -> Result<()> {
        self.inbound
            .send(event)
            .await
            .map_err(|_| PocketclawError::Internal("inbound queue closed".to_string()).into())
    }

    /// Serve until Ctrl-C or [`Runtime::shutdown_token`] fires, then shut down
    pub async fn run(&self) {
        tokio::select! {
            _ = self.requested.cancelled() => {
                tracing::info!("Shutdown requested");
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
                    self.requested.cancelled().await;
                } else {
                    tracing::info!("Interrupt received");
                }
            }
        }
        self.shutdown().await;
    }

    /// Stop intake, finish in-flight turns, flush replies and disconnect
    pub async fn shutdown(&self) {
        let grace = self.config.agent.shutdown_timeout();
        tracing::info!(grace_ms = grace.as_millis() as u64, "Shutting down runtime");

        self.requested.cancel();
        self.intake.cancel();
        if let Some(scheduler) = &self.scheduler {
            scheduler.shutdown().await;
        }

        self.lanes.shutdown(grace).await;
        self.transports.shutdown(grace).await;
        self.transport_token.cancel();

        self.tasks.close();
        self.tasks.wait().await;
        tracing::info!("Runtime stopped");
    }
}
