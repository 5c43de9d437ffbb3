//! Collaborators the scheduler drives: the run/stage backend and the
//! artifact deletion queue, plus their bus-backed implementations.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use stratus_bus::{
    ArtifactDeletion, ArtifactKind, Bus, RequestOptions, RouteUpdate, RunCommand, StageReply,
    StageRequest, StopCommand, from_payload, subjects, to_payload,
};
use stratus_core::{Application, StagingConfig, StagingResponse};

use crate::error::StagingError;

/// Starts, stops, and stages application instances.
#[async_trait]
pub trait RunBackend: Send + Sync {
    /// Start the application's current generation.
    async fn start(&self, app: &Application) -> anyhow::Result<()>;

    /// Start specific indices of the current generation.
    async fn start_indices(&self, app: &Application, indices: &[u32]) -> anyhow::Result<()>;

    /// Stop every instance of the application.
    async fn stop(&self, app: &Application) -> anyhow::Result<()>;

    /// Stop specific instances. Works for applications that no longer exist.
    async fn stop_instances(&self, app_id: &str, instance_ids: &[String]) -> anyhow::Result<()>;

    /// Converge the running instance count to `app.instances`.
    async fn scale(&self, app: &Application) -> anyhow::Result<()>;

    async fn update_routes(&self, app: &Application) -> anyhow::Result<()>;

    /// Stage the application's package into a droplet.
    async fn stage(&self, app: &Application) -> Result<StagingResponse, StagingError>;
}

/// Fire-and-forget deletion of stored artifacts.
#[async_trait]
pub trait ArtifactQueue: Send + Sync {
    async fn enqueue_deletion(&self, kind: ArtifactKind, app_id: &str);
}

/// [`RunBackend`] over the bus: run commands are published, staging is a
/// request with a timeout.
#[derive(Clone)]
pub struct BusRunBackend {
    bus: Arc<dyn Bus>,
    stage_timeout: Duration,
}

impl BusRunBackend {
    pub fn new(bus: Arc<dyn Bus>, config: &StagingConfig) -> Self {
        Self {
            bus,
            stage_timeout: config.stage_timeout(),
        }
    }

    async fn publish<T: Serialize + Sync>(&self, subject: &str, message: &T) -> anyhow::Result<()> {
        let payload = to_payload(subject, message)?;
        self.bus.publish(subject, payload).await?;
        Ok(())
    }
}

#[async_trait]
impl RunBackend for BusRunBackend {
    async fn start(&self, app: &Application) -> anyhow::Result<()> {
        debug!(app_id = %app.id, version = %app.version, instances = app.instances, "start");
        self.publish(subjects::NODE_START, &RunCommand::for_app(app)).await
    }

    async fn start_indices(&self, app: &Application, indices: &[u32]) -> anyhow::Result<()> {
        debug!(app_id = %app.id, ?indices, "start indices");
        let command = RunCommand {
            indices: indices.to_vec(),
            ..RunCommand::for_app(app)
        };
        self.publish(subjects::NODE_START, &command).await
    }

    async fn stop(&self, app: &Application) -> anyhow::Result<()> {
        debug!(app_id = %app.id, "stop");
        let command = StopCommand {
            app_id: app.id.clone(),
            instance_ids: Vec::new(),
        };
        self.publish(subjects::NODE_STOP, &command).await
    }

    async fn stop_instances(&self, app_id: &str, instance_ids: &[String]) -> anyhow::Result<()> {
        debug!(%app_id, count = instance_ids.len(), "stop instances");
        let command = StopCommand {
            app_id: app_id.to_string(),
            instance_ids: instance_ids.to_vec(),
        };
        self.publish(subjects::NODE_STOP, &command).await
    }

    async fn scale(&self, app: &Application) -> anyhow::Result<()> {
        debug!(app_id = %app.id, instances = app.instances, "scale");
        self.publish(subjects::NODE_SCALE, &RunCommand::for_app(app)).await
    }

    async fn update_routes(&self, app: &Application) -> anyhow::Result<()> {
        let update = RouteUpdate {
            app_id: app.id.clone(),
            routes: app.routes.clone(),
        };
        self.publish(subjects::ROUTER_UPDATE, &update).await
    }

    async fn stage(&self, app: &Application) -> Result<StagingResponse, StagingError> {
        let payload = to_payload(subjects::STAGER_STAGE, &StageRequest::for_app(app))
            .map_err(|e| StagingError::Failed(e.to_string()))?;

        let replies = self
            .bus
            .request(
                subjects::STAGER_STAGE,
                payload,
                RequestOptions::single(self.stage_timeout),
            )
            .await
            .map_err(|e| StagingError::Unavailable(e.to_string()))?;

        let reply = replies
            .first()
            .ok_or(StagingError::TimedOut(self.stage_timeout))?;
        match from_payload::<StageReply>(reply) {
            Ok(StageReply::Staged(response)) => Ok(response),
            Ok(StageReply::NoCapacity { message }) => Err(StagingError::NoCapacity(message)),
            Ok(StageReply::Failed { message }) => Err(StagingError::Failed(message)),
            Err(e) => Err(StagingError::Failed(format!("malformed stager reply: {e}"))),
        }
    }
}

/// [`ArtifactQueue`] publishing deletion jobs for the blobstore.
#[derive(Clone)]
pub struct BusArtifactQueue {
    bus: Arc<dyn Bus>,
}

impl BusArtifactQueue {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl ArtifactQueue for BusArtifactQueue {
    async fn enqueue_deletion(&self, kind: ArtifactKind, app_id: &str) {
        let job = ArtifactDeletion {
            kind,
            app_id: app_id.to_string(),
        };
        let result = match to_payload(subjects::BLOBSTORE_DELETE, &job) {
            Ok(payload) => self.bus.publish(subjects::BLOBSTORE_DELETE, payload).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(%app_id, ?kind, error = %e, "artifact deletion not enqueued");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stratus_bus::InMemoryBus;

    fn test_backend(bus: &InMemoryBus) -> BusRunBackend {
        BusRunBackend::new(
            Arc::new(bus.clone()),
            &StagingConfig {
                stage_timeout_secs: 1,
                ..StagingConfig::default()
            },
        )
    }

    fn test_app() -> Application {
        let mut app = Application::new("app-1", "web");
        app.start().unwrap();
        app
    }

    async fn reply_to_stage_once(bus: &InMemoryBus, reply: serde_json::Value) {
        let mut sub = bus.subscribe(subjects::STAGER_STAGE).await.unwrap();
        let responder = bus.clone();
        tokio::spawn(async move {
            let envelope = sub.next().await.unwrap();
            responder.respond(&envelope, reply).await.unwrap();
        });
    }

    #[tokio::test]
    async fn stage_maps_replies_to_outcomes() {
        let bus = InMemoryBus::new();
        let backend = test_backend(&bus);

        reply_to_stage_once(
            &bus,
            json!({"status": "staged", "instances_started": 1, "droplet_hash": "d1"}),
        )
        .await;
        let response = backend.stage(&test_app()).await.unwrap();
        assert_eq!(response.droplet_hash.as_deref(), Some("d1"));

        reply_to_stage_once(&bus, json!({"status": "no_capacity", "message": "full"})).await;
        let err = backend.stage(&test_app()).await.unwrap_err();
        assert!(err.is_retryable());

        reply_to_stage_once(&bus, json!({"status": "failed", "message": "compile"})).await;
        let err = backend.stage(&test_app()).await.unwrap_err();
        assert_eq!(err, StagingError::Failed("compile".to_string()));
    }

    #[tokio::test]
    async fn start_indices_publishes_run_command() {
        let bus = InMemoryBus::new();
        let mut starts = bus.subscribe(subjects::NODE_START).await.unwrap();
        let app = test_app();

        test_backend(&bus).start_indices(&app, &[1, 3]).await.unwrap();

        let command: RunCommand = from_payload(&starts.next().await.unwrap().payload).unwrap();
        assert_eq!(command.indices, vec![1, 3]);
        assert_eq!(command.version, app.version);
    }

    #[tokio::test]
    async fn artifact_queue_publishes_deletion() {
        let bus = InMemoryBus::new();
        let mut deletes = bus.subscribe(subjects::BLOBSTORE_DELETE).await.unwrap();

        BusArtifactQueue::new(Arc::new(bus.clone()))
            .enqueue_deletion(ArtifactKind::BuildpackCache, "app-1")
            .await;

        let job: ArtifactDeletion = from_payload(&deletes.next().await.unwrap().payload).unwrap();
        assert_eq!(job.kind, ArtifactKind::BuildpackCache);
    }
}
