//! Recording collaborators for unit tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use stratus_bus::{ArtifactKind, InMemoryBus};
use stratus_core::{Application, ControlPlaneConfig, StagingResponse};
use stratus_health::HealthSignalClient;
use stratus_state::StateStore;

use crate::backend::{ArtifactQueue, RunBackend};
use crate::dispatch::{DispatchDeps, DispatchObserver};
use crate::error::StagingError;
use crate::events::{AppEvent, EventRecorder};
use crate::respondent::HealthSignalRespondent;
use crate::staging::StagingOrchestrator;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Start { app_id: String, version: String },
    StartIndices { app_id: String, indices: Vec<u32> },
    Stop { app_id: String },
    StopInstances { app_id: String, instance_ids: Vec<String> },
    Scale { app_id: String, instances: u32 },
    UpdateRoutes { app_id: String },
    Stage { app_id: String },
}

/// Backend that records every call and replays scripted staging results.
#[derive(Default)]
pub struct RecordingBackend {
    calls: Mutex<Vec<Call>>,
    stage_results: Mutex<VecDeque<Result<StagingResponse, StagingError>>>,
}

impl RecordingBackend {
    pub fn with_stage_results(
        results: impl IntoIterator<Item = Result<StagingResponse, StagingError>>,
    ) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            stage_results: Mutex::new(results.into_iter().collect()),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn stage_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Stage { .. }))
            .count()
    }

    fn push(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl RunBackend for RecordingBackend {
    async fn start(&self, app: &Application) -> anyhow::Result<()> {
        self.push(Call::Start {
            app_id: app.id.clone(),
            version: app.version.clone(),
        });
        Ok(())
    }

    async fn start_indices(&self, app: &Application, indices: &[u32]) -> anyhow::Result<()> {
        self.push(Call::StartIndices {
            app_id: app.id.clone(),
            indices: indices.to_vec(),
        });
        Ok(())
    }

    async fn stop(&self, app: &Application) -> anyhow::Result<()> {
        self.push(Call::Stop {
            app_id: app.id.clone(),
        });
        Ok(())
    }

    async fn stop_instances(&self, app_id: &str, instance_ids: &[String]) -> anyhow::Result<()> {
        self.push(Call::StopInstances {
            app_id: app_id.to_string(),
            instance_ids: instance_ids.to_vec(),
        });
        Ok(())
    }

    async fn scale(&self, app: &Application) -> anyhow::Result<()> {
        self.push(Call::Scale {
            app_id: app.id.clone(),
            instances: app.instances,
        });
        Ok(())
    }

    async fn update_routes(&self, app: &Application) -> anyhow::Result<()> {
        self.push(Call::UpdateRoutes {
            app_id: app.id.clone(),
        });
        Ok(())
    }

    async fn stage(&self, app: &Application) -> Result<StagingResponse, StagingError> {
        self.push(Call::Stage {
            app_id: app.id.clone(),
        });
        self.stage_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(StagingResponse::default()))
    }
}

#[derive(Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<AppEvent>>,
}

impl RecordingEvents {
    pub fn events(&self) -> Vec<AppEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventRecorder for RecordingEvents {
    async fn record(&self, event: AppEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[derive(Default)]
pub struct RecordingArtifacts {
    deletions: Mutex<Vec<(ArtifactKind, String)>>,
}

impl RecordingArtifacts {
    pub fn deletions(&self) -> Vec<(ArtifactKind, String)> {
        self.deletions.lock().unwrap().clone()
    }
}

#[async_trait]
impl ArtifactQueue for RecordingArtifacts {
    async fn enqueue_deletion(&self, kind: ArtifactKind, app_id: &str) {
        self.deletions.lock().unwrap().push((kind, app_id.to_string()));
    }
}

/// Everything a dispatch or respondent test needs, wired together.
pub struct Harness {
    pub store: StateStore,
    pub bus: InMemoryBus,
    pub backend: Arc<RecordingBackend>,
    pub events: Arc<RecordingEvents>,
    pub artifacts: Arc<RecordingArtifacts>,
    pub dispatch: Arc<DispatchObserver>,
    config: ControlPlaneConfig,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_backend(RecordingBackend::default())
    }

    pub fn with_backend(backend: RecordingBackend) -> Self {
        let mut config = ControlPlaneConfig::default();
        config.staging.retry_delay_ms = 1;
        config.health.query_timeout_ms = 20;

        let store = StateStore::open_in_memory().unwrap();
        let bus = InMemoryBus::new();
        let backend = Arc::new(backend);
        let events = Arc::new(RecordingEvents::default());
        let artifacts = Arc::new(RecordingArtifacts::default());
        let staging = StagingOrchestrator::new(backend.clone(), store.clone(), &config.staging);
        let dispatch = Arc::new(DispatchObserver::new(DispatchDeps {
            store: store.clone(),
            bus: Arc::new(bus.clone()),
            backend: backend.clone(),
            artifacts: artifacts.clone(),
            events: events.clone(),
            health: HealthSignalClient::new(Arc::new(bus.clone()), &config.health),
            staging,
        }));

        Self {
            store,
            bus,
            backend,
            events,
            artifacts,
            dispatch,
            config,
        }
    }

    pub fn respondent(&self) -> HealthSignalRespondent {
        HealthSignalRespondent::new(
            self.store.clone(),
            self.backend.clone(),
            self.dispatch.clone(),
            self.events.clone(),
            HealthSignalClient::new(Arc::new(self.bus.clone()), &self.config.health),
        )
    }

    /// Persist a started application with bits uploaded.
    pub fn started_app(&self, id: &str, instances: u32) -> Application {
        let mut app = Application::new(id, id);
        app.instances = instances;
        app.package_hash = Some(format!("{id}-bits"));
        app.start().unwrap();
        self.store.put_application(&app).unwrap();
        app
    }
}
