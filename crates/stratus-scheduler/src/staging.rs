//! Staging orchestrator: bounded retry around the stager.
//!
//! Only "no capacity" failures are retried, after a fixed delay, for at
//! most `max_retries` extra attempts. The outcome is persisted on the
//! application: a success marks the package staged, a terminal failure
//! records the reason. A package that already failed is not staged again
//! until it is explicitly marked for restaging.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use stratus_core::{Application, ApplicationDiff, StagingConfig, StagingResponse};
use stratus_state::StateStore;

use crate::backend::RunBackend;
use crate::error::{SchedulerError, SchedulerResult, StagingError};

/// How a call to [`StagingOrchestrator::stage_if_needed`] ended.
#[derive(Debug)]
pub enum StagingOutcome {
    /// Staging succeeded or was not needed, and `on_success` ran.
    Started,
    /// Staging failed terminally. `recorded` is the persisted failure, if
    /// one was written.
    Failed {
        error: StagingError,
        recorded: Option<ApplicationDiff>,
    },
}

#[derive(Clone)]
pub struct StagingOrchestrator {
    backend: Arc<dyn RunBackend>,
    store: StateStore,
    max_retries: u32,
    retry_delay: Duration,
}

impl StagingOrchestrator {
    pub fn new(backend: Arc<dyn RunBackend>, store: StateStore, config: &StagingConfig) -> Self {
        Self {
            backend,
            store,
            max_retries: config.max_retries,
            retry_delay: config.retry_delay(),
        }
    }

    /// Stage `app` if it needs it, then call `on_success` once.
    ///
    /// `on_success` gets the number of instances the stager started itself
    /// (0 when no staging was needed) and the application as persisted
    /// after staging. It is not called when staging fails or when the
    /// staging result could not be recorded.
    pub async fn stage_if_needed<F, Fut>(
        &self,
        app: &Application,
        on_success: F,
    ) -> SchedulerResult<StagingOutcome>
    where
        F: FnOnce(u32, Application) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        if !app.needs_staging() {
            debug!(app_id = %app.id, "no staging needed");
            on_success(0, app.clone()).await?;
            return Ok(StagingOutcome::Started);
        }

        if app.staging_failed() {
            let reason = app.staging_failed_reason.clone().unwrap_or_default();
            debug!(app_id = %app.id, %reason, "package failed earlier, not restaging");
            return Ok(StagingOutcome::Failed {
                error: StagingError::NotRestaged(reason),
                recorded: None,
            });
        }

        match self.stage_with_retry(app).await {
            Ok(response) => {
                let started = response.instances_started;
                let staged = self.persist_staged(app, response)?;
                on_success(started, staged).await?;
                Ok(StagingOutcome::Started)
            }
            Err(error) => {
                let recorded = self.persist_failed(app, &error);
                Ok(StagingOutcome::Failed { error, recorded })
            }
        }
    }

    /// Call the stager, retrying resource exhaustion.
    pub async fn stage_with_retry(
        &self,
        app: &Application,
    ) -> Result<StagingResponse, StagingError> {
        let attempts = self.max_retries + 1;
        let mut attempt = 1;
        loop {
            match self.backend.stage(app).await {
                Ok(response) => {
                    info!(app_id = %app.id, attempt, "staged");
                    return Ok(response);
                }
                Err(e) if e.is_retryable() && attempt < attempts => {
                    warn!(
                        app_id = %app.id,
                        attempt,
                        attempts,
                        error = %e,
                        "staging out of capacity, retrying"
                    );
                    tokio::time::sleep(self.retry_delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(app_id = %app.id, attempt, error = %e, "staging failed");
                    return Err(e);
                }
            }
        }
    }

    /// Record a successful staging. Instances must not start unless this succeeds.
    fn persist_staged(
        &self,
        app: &Application,
        response: StagingResponse,
    ) -> SchedulerResult<Application> {
        let recorded = self
            .store
            .update_application(&app.id, |stored| stored.mark_as_staged(response))
            .inspect_err(|e| warn!(app_id = %app.id, error = %e, "staging result not recorded"))?;
        let Some((diff, ())) = recorded else {
            warn!(app_id = %app.id, "application vanished while staging");
            return Err(SchedulerError::ApplicationGone(app.id.clone()));
        };
        diff.after
            .ok_or_else(|| SchedulerError::ApplicationGone(app.id.clone()))
    }

    fn persist_failed(&self, app: &Application, error: &StagingError) -> Option<ApplicationDiff> {
        let reason = error.to_string();
        match self
            .store
            .update_application(&app.id, |stored| stored.mark_as_failed_to_stage(reason))
        {
            Ok(recorded) => recorded.map(|(diff, ())| diff),
            Err(e) => {
                warn!(app_id = %app.id, error = %e, "failed to record staging failure");
                None
            }
        }
    }
}
