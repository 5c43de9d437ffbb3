//! Autoscale trigger loop.
//!
//! Listens for scale-up signals and hands each to the [`ScalePolicy`] if
//! one is configured. Failures are logged; the subscription stays up.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use stratus_bus::{Bus, BusResult, ScaleUpSignal, boxed_handler, from_payload, spawn_handler, subjects};

use crate::policy::{ScaleDecision, ScalePolicy};

pub struct AutoscaleTrigger {
    policy: Option<Arc<ScalePolicy>>,
}

impl AutoscaleTrigger {
    /// `None` means autoscaling is not configured and signals are dropped.
    pub fn new(policy: Option<Arc<ScalePolicy>>) -> Self {
        Self { policy }
    }

    pub async fn subscribe(
        self: Arc<Self>,
        bus: &dyn Bus,
        shutdown: watch::Receiver<bool>,
    ) -> BusResult<JoinHandle<()>> {
        let subscription = bus.subscribe(subjects::AUTOSCALE_SCALE_UP).await?;
        let configured = self.policy.is_some();
        let handler = boxed_handler(move |envelope| {
            let trigger = self.clone();
            async move {
                trigger.handle(&envelope.payload).await;
            }
        });
        info!(configured, "autoscale trigger subscribed");
        Ok(spawn_handler(subscription, handler, shutdown))
    }

    /// Act on one scale-up signal. Returns the decision, if one was made.
    pub async fn handle(&self, payload: &Value) -> Option<ScaleDecision> {
        let Some(policy) = &self.policy else {
            debug!("autoscaling not configured, ignoring scale-up signal");
            return None;
        };
        let signal: ScaleUpSignal = match from_payload(payload) {
            Ok(signal) => signal,
            Err(e) => {
                warn!(error = %e, "malformed scale-up signal");
                return None;
            }
        };

        match policy.scale_up(&signal.app_id, signal.cpu_percent).await {
            Ok(decision) => {
                debug!(app_id = %signal.app_id, ?decision, "scale-up evaluated");
                Some(decision)
            }
            Err(e) => {
                warn!(app_id = %signal.app_id, error = %e, "scale-up failed");
                None
            }
        }
    }
}
