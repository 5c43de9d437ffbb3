//! Dispatch observer: turns one application mutation into run commands.
//!
//! Each persisted mutation's before/after pair is classified into at most
//! one [`Reaction`], checked in priority order:
//!
//! ```text
//! deleted                               → Delete   (stop, then enqueue artifact deletion)
//! desired_state changed                 → Start | Stop
//! instances changed while started       → Scale    (+ app.updated broadcast)
//! version or package changed, started   → Rollout  (stage, notify live version, start; no stop)
//! autoscaling fields changed            → UpdateAutoscaling
//! ```
//!
//! A pending route update is pushed independently of the reaction.
//! Reactions never roll back the mutation that caused them; their failures
//! are logged here and not returned.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use stratus_bus::{AppUpdated, ArtifactKind, Bus, subjects, to_payload};
use stratus_core::{Application, ApplicationDiff};
use stratus_health::HealthSignalClient;
use stratus_state::StateStore;

use crate::backend::{ArtifactQueue, RunBackend};
use crate::error::SchedulerResult;
use crate::events::{AppEvent, AppEventKind, EventRecorder};
use crate::staging::{StagingOrchestrator, StagingOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaction {
    Stop,
    Start,
    Scale,
    Rollout,
    Delete,
    UpdateAutoscaling,
}

/// Pick the single reaction a mutation calls for.
pub fn classify(diff: &ApplicationDiff) -> Option<Reaction> {
    let Some(after) = &diff.after else {
        return diff.is_deletion().then_some(Reaction::Delete);
    };

    if diff.desired_state_changed() {
        return Some(if after.is_started() {
            Reaction::Start
        } else {
            Reaction::Stop
        });
    }
    if after.is_started() && diff.instances_changed() {
        return Some(Reaction::Scale);
    }
    if after.is_started() && (diff.version_changed() || diff.package_changed()) {
        return Some(Reaction::Rollout);
    }
    if diff.autoscaling_changed() {
        return Some(Reaction::UpdateAutoscaling);
    }
    None
}

/// Collaborators of the [`DispatchObserver`].
pub struct DispatchDeps {
    pub store: StateStore,
    pub bus: Arc<dyn Bus>,
    pub backend: Arc<dyn RunBackend>,
    pub artifacts: Arc<dyn ArtifactQueue>,
    pub events: Arc<dyn EventRecorder>,
    pub health: HealthSignalClient,
    pub staging: StagingOrchestrator,
}

pub struct DispatchObserver {
    deps: DispatchDeps,
}

impl DispatchObserver {
    pub fn new(deps: DispatchDeps) -> Self {
        Self { deps }
    }

    pub fn store(&self) -> &StateStore {
        &self.deps.store
    }

    /// React to one persisted mutation. Returns the reaction that fired.
    pub async fn observe(&self, diff: &ApplicationDiff) -> Option<Reaction> {
        let reaction = classify(diff);
        let mut follow_up = self.dispatch_one(diff, reaction).await;
        // Mutations persisted by a reaction itself, such as a staging failure.
        while let Some(next) = follow_up.take() {
            follow_up = self.dispatch_one(&next, classify(&next)).await;
        }
        reaction
    }

    async fn dispatch_one(
        &self,
        diff: &ApplicationDiff,
        reaction: Option<Reaction>,
    ) -> Option<ApplicationDiff> {
        let mut follow_up = None;
        if let Some(reaction) = reaction {
            debug!(app_id = %diff.app_id(), ?reaction, "dispatching");
            match self.react(reaction, diff).await {
                Ok(next) => follow_up = next,
                Err(e) => {
                    error!(app_id = %diff.app_id(), ?reaction, error = %e, "dispatch reaction failed")
                }
            }
        }

        if let Some(after) = &diff.after
            && after.pending_route_update
        {
            self.push_routes(after).await;
        }
        follow_up
    }

    async fn react(
        &self,
        reaction: Reaction,
        diff: &ApplicationDiff,
    ) -> SchedulerResult<Option<ApplicationDiff>> {
        match (reaction, &diff.before, &diff.after) {
            (Reaction::Delete, Some(before), None) => {
                self.delete(before).await;
                Ok(None)
            }
            (Reaction::Stop, _, Some(after)) => {
                self.deps.backend.stop(after).await?;
                info!(app_id = %after.id, "stopped");
                Ok(None)
            }
            (Reaction::Start, _, Some(after)) => self.stage_and_start(after, false).await,
            (Reaction::Scale, _, Some(after)) => {
                self.deps.backend.scale(after).await?;
                self.broadcast_updated(after).await?;
                Ok(None)
            }
            // The old generation keeps running until the new one is up.
            (Reaction::Rollout, _, Some(after)) => self.stage_and_start(after, true).await,
            (Reaction::UpdateAutoscaling, _, Some(after)) => {
                self.deps.health.update_autoscaling_fields(after).await;
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    /// Stage if needed, then start. With `announce`, the health subsystem
    /// learns the live version as persisted after staging, since staging
    /// may assign the first droplet and open a new generation.
    ///
    /// A terminal staging failure is recorded as an event, and the
    /// persisted failure is handed back for dispatch.
    async fn stage_and_start(
        &self,
        app: &Application,
        announce: bool,
    ) -> SchedulerResult<Option<ApplicationDiff>> {
        let backend = &self.deps.backend;
        let health = &self.deps.health;
        let outcome = self
            .deps
            .staging
            .stage_if_needed(app, |started, staged| async move {
                if announce {
                    health.notify_new_live_version(&staged).await;
                }
                start_remaining(backend.as_ref(), &staged, started).await
            })
            .await?;

        let StagingOutcome::Failed { error, recorded } = outcome else {
            return Ok(None);
        };
        error!(app_id = %app.id, error = %error, "staging failed, not starting");
        self.deps
            .events
            .record(AppEvent::new(&app.id, AppEventKind::StagingFailed, error.to_string()))
            .await;
        Ok(recorded)
    }

    async fn delete(&self, app: &Application) {
        if let Err(e) = self.deps.backend.stop(app).await {
            warn!(app_id = %app.id, error = %e, "stop before delete failed");
        }
        // Artifacts go regardless of staging state.
        for kind in [ArtifactKind::Package, ArtifactKind::BuildpackCache] {
            self.deps.artifacts.enqueue_deletion(kind, &app.id).await;
        }
        info!(app_id = %app.id, "deleted");
    }

    async fn broadcast_updated(&self, app: &Application) -> SchedulerResult<()> {
        let message = AppUpdated {
            app_id: app.id.clone(),
            instances: app.instances,
            version: app.version.clone(),
        };
        let payload = to_payload(subjects::APP_UPDATED, &message)?;
        self.deps.bus.publish(subjects::APP_UPDATED, payload).await?;
        Ok(())
    }

    async fn push_routes(&self, app: &Application) {
        if let Err(e) = self.deps.backend.update_routes(app).await {
            warn!(app_id = %app.id, error = %e, "route update failed");
            return;
        }
        let cleared = self.deps.store.update_application(&app.id, |stored| {
            stored.clear_pending_route_update();
            Ok(())
        });
        if let Err(e) = cleared {
            warn!(app_id = %app.id, error = %e, "failed to clear pending route update");
        }
    }
}

/// Start whatever the stager did not already start.
async fn start_remaining(
    backend: &dyn RunBackend,
    app: &Application,
    started: u32,
) -> anyhow::Result<()> {
    if started == 0 {
        return backend.start(app).await;
    }
    let remaining: Vec<u32> = (started..app.instances).collect();
    if remaining.is_empty() {
        debug!(app_id = %app.id, started, "stager started every instance");
        return Ok(());
    }
    backend.start_indices(app, &remaining).await
}
