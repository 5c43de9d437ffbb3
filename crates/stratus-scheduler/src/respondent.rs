//! Health signal respondent: acts on commands from the health-signal
//! subsystem.
//!
//! Four subjects are served, each by its own handler loop, so a failure
//! on one never stalls the others. Payloads are decoded once into an
//! [`InboundCommand`]; anything malformed is dropped with a warning and
//! an error event against the application it named.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use stratus_bus::{
    AdjustInstances, Bus, BusResult, InboundCommand, StartInstances, StopInstances,
    boxed_handler, spawn_handler, subjects,
};
use stratus_core::ApplicationUpdate;
use stratus_health::HealthSignalClient;
use stratus_state::StateStore;

use crate::backend::RunBackend;
use crate::dispatch::DispatchObserver;
use crate::error::SchedulerResult;
use crate::events::{AppEvent, AppEventKind, EventRecorder};

/// What happened to a start or stop command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Forwarded,
    Ignored,
    /// The stop would have taken a started generation below its floor.
    Refused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdjustOutcome {
    Missing,
    AlreadySatisfied,
    Updated { instances: u32 },
}

pub struct HealthSignalRespondent {
    store: StateStore,
    backend: Arc<dyn RunBackend>,
    dispatch: Arc<DispatchObserver>,
    events: Arc<dyn EventRecorder>,
    health: HealthSignalClient,
}

impl HealthSignalRespondent {
    pub fn new(
        store: StateStore,
        backend: Arc<dyn RunBackend>,
        dispatch: Arc<DispatchObserver>,
        events: Arc<dyn EventRecorder>,
        health: HealthSignalClient,
    ) -> Self {
        Self {
            store,
            backend,
            dispatch,
            events,
            health,
        }
    }

    /// Subscribe to every command subject. One handler loop per subject.
    pub async fn subscribe_all(
        self: Arc<Self>,
        bus: &dyn Bus,
        shutdown: watch::Receiver<bool>,
    ) -> BusResult<Vec<JoinHandle<()>>> {
        let mut handles = Vec::new();
        for subject in [
            subjects::HM_START,
            subjects::HM_STOP,
            subjects::HM_ADJUST,
            subjects::HM_AUTOSCALING_REQUEST,
        ] {
            let subscription = bus.subscribe(subject).await?;
            let respondent = self.clone();
            let handler = boxed_handler(move |envelope| {
                let respondent = respondent.clone();
                async move {
                    respondent.handle(&envelope.subject, &envelope.payload).await;
                }
            });
            handles.push(spawn_handler(subscription, handler, shutdown.clone()));
        }
        info!("health signal respondent subscribed");
        Ok(handles)
    }

    /// Decode and act on one inbound payload. Never fails.
    pub async fn handle(&self, subject: &str, payload: &Value) {
        let command = match InboundCommand::decode(subject, payload) {
            Ok(command) => command,
            Err(malformed) => {
                warn!(%subject, droplet = ?malformed.droplet, reason = %malformed.reason, "dropping malformed message");
                if let Some(droplet) = &malformed.droplet {
                    self.events
                        .record(AppEvent::new(
                            droplet.as_str(),
                            AppEventKind::Error,
                            malformed.to_string(),
                        ))
                        .await;
                }
                return;
            }
        };

        let app_id = command.app_id().to_string();
        let result = match command {
            InboundCommand::Start(start) => self.process_start(&start).await.map(drop),
            InboundCommand::Stop(stop) => self.process_stop(&stop).await.map(drop),
            InboundCommand::Adjust { app_id, counts } => {
                self.adjust_instances(&app_id, counts).await.map(drop)
            }
            InboundCommand::QueryAutoscaling { app_id } => {
                self.process_request_autoscaling_settings(&app_id).await
            }
        };
        if let Err(e) = result {
            error!(%subject, %app_id, error = %e, "command failed");
        }
    }

    /// Start the requested indices if the generation is still short.
    pub async fn process_start(&self, start: &StartInstances) -> SchedulerResult<CommandOutcome> {
        let app_id = start.droplet.as_str();
        let Some(app) = self.store.get_application(app_id)? else {
            debug!(%app_id, "start for unknown application ignored");
            return Ok(CommandOutcome::Ignored);
        };
        if !app.is_started() {
            debug!(%app_id, "start for stopped application ignored");
            return Ok(CommandOutcome::Ignored);
        }
        if !app.bits_uploaded() || app.staging_failed() {
            debug!(%app_id, "start for application without a runnable package ignored");
            return Ok(CommandOutcome::Ignored);
        }
        if app.version != start.version {
            debug!(%app_id, requested = %start.version, current = %app.version, "stale start ignored");
            return Ok(CommandOutcome::Ignored);
        }

        let running = start.running.get(&start.version).copied().unwrap_or(0);
        if running >= app.instances {
            debug!(%app_id, running, desired = app.instances, "generation already at desired count");
            return Ok(CommandOutcome::Ignored);
        }

        let indices: Vec<u32> = start
            .indices
            .iter()
            .copied()
            .filter(|index| *index < app.instances)
            .collect();
        if indices.is_empty() {
            debug!(%app_id, requested = ?start.indices, "no requested index within desired range");
            return Ok(CommandOutcome::Ignored);
        }

        self.backend.start_indices(&app, &indices).await?;
        info!(%app_id, ?indices, "starting missing instances");
        Ok(CommandOutcome::Forwarded)
    }

    /// Stop the requested instances unless that would leave the current
    /// generation of a started application short.
    pub async fn process_stop(&self, stop: &StopInstances) -> SchedulerResult<CommandOutcome> {
        let app_id = stop.droplet.as_str();
        let instance_ids: Vec<String> = stop.instances.keys().cloned().collect();

        let Some(app) = self.store.get_application(app_id)? else {
            info!(%app_id, count = instance_ids.len(), "stopping runaway instances");
            self.backend.stop_instances(app_id, &instance_ids).await?;
            return Ok(CommandOutcome::Forwarded);
        };

        if app.is_started() {
            let stopping = stop
                .instances
                .values()
                .filter(|version| **version == app.version)
                .count() as u32;
            let running = stop.running.get(&app.version).copied().unwrap_or(0);
            if stopping > 0 && running.saturating_sub(stopping) < app.instances {
                let message = format!(
                    "refusing to stop {stopping} of {running} running instances, {} desired",
                    app.instances
                );
                warn!(%app_id, stopping, running, desired = app.instances, "stop refused");
                self.events
                    .record(AppEvent::new(app_id, AppEventKind::StopRefused, message))
                    .await;
                return Ok(CommandOutcome::Refused);
            }
        }

        self.backend.stop_instances(app_id, &instance_ids).await?;
        debug!(%app_id, count = instance_ids.len(), "stopping instances");
        Ok(CommandOutcome::Forwarded)
    }

    /// Move the desired count from `before` to `after`, unless the current
    /// count already sits on the requested side of `after`.
    pub async fn adjust_instances(
        &self,
        app_id: &str,
        counts: AdjustInstances,
    ) -> SchedulerResult<AdjustOutcome> {
        let result = self.store.update_application(app_id, |app| {
            if direction_satisfied(counts, app.instances) {
                return Ok(false);
            }
            app.apply(ApplicationUpdate::instances(counts.after))?;
            Ok(true)
        })?;

        let Some((diff, applied)) = result else {
            debug!(%app_id, "adjust for unknown application ignored");
            return Ok(AdjustOutcome::Missing);
        };
        let Some(after) = diff.after.as_ref().filter(|_| applied && diff.instances_changed())
        else {
            debug!(%app_id, before = counts.before, after = counts.after, "adjust already satisfied");
            return Ok(AdjustOutcome::AlreadySatisfied);
        };

        info!(%app_id, from = counts.before, to = after.instances, "instances adjusted");
        if after.pending_route_update {
            self.dispatch.observe(&diff).await;
        }
        Ok(AdjustOutcome::Updated {
            instances: after.instances,
        })
    }

    /// Publish the application's autoscaling fields. Unknown apps are ignored.
    pub async fn process_request_autoscaling_settings(&self, app_id: &str) -> SchedulerResult<()> {
        match self.store.get_application(app_id)? {
            Some(app) => self.health.update_autoscaling_fields(&app).await,
            None => debug!(%app_id, "autoscaling query for unknown application ignored"),
        }
        Ok(())
    }
}

fn direction_satisfied(counts: AdjustInstances, current: u32) -> bool {
    let AdjustInstances { before, after } = counts;
    (after > before && current >= after) || (after < before && current <= after) || after == before
}
