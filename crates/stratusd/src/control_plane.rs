//! Control plane: wires every subsystem onto one bus.
//!
//! On start the daemon:
//! 1. Opens the application store and a separate in-memory ledger store
//! 2. Subscribes the instance ledger to heartbeats and node status
//! 3. Subscribes the health signal respondent to its four command subjects
//! 4. Subscribes the autoscale trigger to scale-up signals
//! 5. Broadcasts a node locate so compute nodes announce themselves
//! 6. Runs the stats sweep and the resource self-check in the background
//!
//! `run_control_plane` picks the transport from `daemon.bus`: a TCP bus
//! server for remote peers, a connection to another process's bus server,
//! or a purely in-process bus.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use stratus_autoscale::{AutoscaleTrigger, ScalePolicy};
use stratus_bus::{Bus, BusServer, InMemoryBus, TcpBus};
use stratus_cluster::{InstanceLedger, NodeRegistry, StatsSweep};
use stratus_core::{
    Application, ApplicationDiff, ApplicationUpdate, BusTransport, Clock, ControlPlaneConfig,
    DaemonConfig, SystemClock,
};
use stratus_health::HealthSignalClient;
use stratus_scheduler::{
    BusArtifactQueue, BusEventRecorder, BusRunBackend, DispatchDeps, DispatchObserver,
    HealthSignalRespondent, RunBackend, StagingOrchestrator,
};
use stratus_state::StateStore;

/// Point-in-time resource counts logged by the self-check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelfCheck {
    pub live_nodes: usize,
    pub ledger_keys: usize,
    pub applications: usize,
}

/// A running control plane and the handles to its background tasks.
pub struct ControlPlane {
    pub store: StateStore,
    pub ledger: InstanceLedger,
    pub health: HealthSignalClient,
    pub dispatch: Arc<DispatchObserver>,
    pub respondent: Arc<HealthSignalRespondent>,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl ControlPlane {
    /// Wire the subsystems and start every subscription and periodic task.
    pub async fn start(
        config: &ControlPlaneConfig,
        store: StateStore,
        bus: Arc<dyn Bus>,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::new();

        // ── Instance ledger ──────────────────────────────────────────
        let ledger_store = StateStore::open_in_memory()?;
        let nodes = NodeRegistry::new(ledger_store.clone(), bus.clone(), clock.clone(), &config.ledger);
        let ledger = InstanceLedger::new(ledger_store, nodes, clock.clone(), &config.ledger);
        handles.extend(ledger.subscribe(bus.as_ref(), shutdown_rx.clone()).await?);
        info!(ttl_secs = config.ledger.ttl_secs, "instance ledger subscribed");

        // ── Scheduler ────────────────────────────────────────────────
        let backend: Arc<dyn RunBackend> = Arc::new(BusRunBackend::new(bus.clone(), &config.staging));
        let events = Arc::new(BusEventRecorder::new(bus.clone()));
        let health = HealthSignalClient::new(bus.clone(), &config.health);
        let dispatch = Arc::new(DispatchObserver::new(DispatchDeps {
            store: store.clone(),
            bus: bus.clone(),
            backend: backend.clone(),
            artifacts: Arc::new(BusArtifactQueue::new(bus.clone())),
            events: events.clone(),
            health: health.clone(),
            staging: StagingOrchestrator::new(backend.clone(), store.clone(), &config.staging),
        }));

        let respondent = Arc::new(HealthSignalRespondent::new(
            store.clone(),
            backend,
            dispatch.clone(),
            events,
            health.clone(),
        ));
        handles.extend(
            respondent
                .clone()
                .subscribe_all(bus.as_ref(), shutdown_rx.clone())
                .await?,
        );

        // ── Autoscaler ───────────────────────────────────────────────
        let policy = config.autoscale.enabled.then(|| {
            Arc::new(ScalePolicy::new(
                store.clone(),
                dispatch.clone(),
                clock.clone(),
                &config.autoscale,
            ))
        });
        let trigger = Arc::new(AutoscaleTrigger::new(policy));
        handles.push(trigger.subscribe(bus.as_ref(), shutdown_rx.clone()).await?);

        // ── Discovery and periodic tasks ─────────────────────────────
        ledger.nodes().locate().await;

        let sweep = StatsSweep::new(ledger.clone(), bus.clone(), &config.ledger);
        let sweep_shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            sweep.run(sweep_shutdown).await;
        }));

        let mut plane = Self {
            store,
            ledger,
            health,
            dispatch,
            respondent,
            shutdown_tx,
            handles,
        };
        let check_interval = Duration::from_secs(config.daemon.self_check_interval_secs);
        let check = plane.self_check_task(check_interval, shutdown_rx);
        plane.handles.push(check);

        info!(node_id = %config.daemon.node_id, "control plane started");
        Ok(plane)
    }

    // ── Lifecycle entry points ───────────────────────────────────────

    /// Store a new application and dispatch its creation.
    pub async fn create_application(&self, app: Application) -> anyhow::Result<Application> {
        if self.store.get_application(&app.id)?.is_some() {
            anyhow::bail!("application already exists: {}", app.id);
        }
        self.store.put_application(&app)?;
        self.dispatch.observe(&ApplicationDiff::created(app.clone())).await;
        Ok(app)
    }

    /// Apply an update under the row lock and dispatch the result.
    ///
    /// Bound violations reject the update without writing anything.
    pub async fn update_application(
        &self,
        app_id: &str,
        update: ApplicationUpdate,
    ) -> anyhow::Result<Application> {
        let (diff, ()) = self
            .store
            .update_application(app_id, |app| app.apply(update))?
            .with_context(|| format!("application not found: {app_id}"))?;
        self.dispatch.observe(&diff).await;
        diff.after
            .with_context(|| format!("application vanished: {app_id}"))
    }

    /// Delete an application, stopping it and queueing its artifacts for deletion.
    pub async fn delete_application(&self, app_id: &str) -> anyhow::Result<bool> {
        let Some(before) = self.store.delete_application(app_id)? else {
            return Ok(false);
        };
        self.dispatch.observe(&ApplicationDiff::deleted(before)).await;
        Ok(true)
    }

    // ── Introspection ────────────────────────────────────────────────

    pub fn self_check(&self) -> SelfCheck {
        check_resources(&self.store, &self.ledger)
    }

    fn self_check_task(
        &self,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let store = self.store.clone();
        let ledger = self.ledger.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        let check = check_resources(&store, &ledger);
                        info!(
                            live_nodes = check.live_nodes,
                            ledger_keys = check.ledger_keys,
                            applications = check.applications,
                            "resource self-check"
                        );
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    /// Signal every background task and wait for them to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }
        info!("control plane stopped");
    }
}

fn check_resources(store: &StateStore, ledger: &InstanceLedger) -> SelfCheck {
    let live_nodes = ledger.nodes().live_nodes().map(|n| n.len()).unwrap_or_else(|e| {
        debug!(error = %e, "node registry unavailable");
        0
    });
    let applications = store.list_applications().map(|a| a.len()).unwrap_or_else(|e| {
        warn!(error = %e, "application store unavailable");
        0
    });
    SelfCheck {
        live_nodes,
        ledger_keys: ledger.known_records().len(),
        applications,
    }
}

/// Open the bus `daemon.bus` asks for. A listening transport also returns
/// the bound server, which the caller must serve.
pub async fn open_bus(daemon: &DaemonConfig) -> anyhow::Result<(Arc<dyn Bus>, Option<BusServer>)> {
    match daemon.bus {
        BusTransport::Local => {
            warn!("bus is in-process only, no remote peer can reach this daemon");
            Ok((Arc::new(InMemoryBus::new()), None))
        }
        BusTransport::Listen => {
            let bus = InMemoryBus::new();
            let server = BusServer::bind(bus.clone(), &daemon.bus_addr)
                .await
                .with_context(|| format!("bind bus server on {}", daemon.bus_addr))?;
            Ok((Arc::new(bus), Some(server)))
        }
        BusTransport::Connect => {
            let bus = TcpBus::connect(&daemon.bus_addr)
                .await
                .with_context(|| format!("connect to bus server at {}", daemon.bus_addr))?;
            Ok((Arc::new(bus), None))
        }
    }
}

/// Run the control plane until Ctrl-C.
pub async fn run_control_plane(config: ControlPlaneConfig) -> anyhow::Result<()> {
    info!("Stratus control plane starting");
    config.validate()?;

    let data_dir = &config.daemon.data_dir;
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("create data dir {}", data_dir.display()))?;
    let db_path = data_dir.join("stratus.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "application store opened");

    let (bus, server) = open_bus(&config.daemon).await?;
    let (server_tx, server_rx) = watch::channel(false);
    let server_task = server.map(|server| tokio::spawn(server.serve(server_rx)));

    let plane = ControlPlane::start(&config, store, bus, Arc::new(SystemClock)).await?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to install Ctrl-C handler")?;
    info!("shutdown signal received");

    plane.shutdown().await;
    let _ = server_tx.send(true);
    if let Some(task) = server_task
        && let Err(e) = task.await
    {
        warn!(error = %e, "bus server ended abnormally");
    }
    Ok(())
}
