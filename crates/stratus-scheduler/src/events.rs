//! Application-scoped events.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use stratus_bus::{Bus, subjects, to_payload};
use stratus_core::{AppId, epoch_secs};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppEventKind {
    /// A message about the application could not be processed.
    Error,
    StagingFailed,
    /// A stop request was refused to protect the desired instance floor.
    StopRefused,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppEvent {
    pub app_id: AppId,
    pub kind: AppEventKind,
    pub message: String,
    pub timestamp: u64,
}

impl AppEvent {
    pub fn new(app_id: impl Into<AppId>, kind: AppEventKind, message: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            kind,
            message: message.into(),
            timestamp: epoch_secs(),
        }
    }
}

/// Sink for application events.
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn record(&self, event: AppEvent);
}

/// Publishes events on `app.event`.
#[derive(Clone)]
pub struct BusEventRecorder {
    bus: Arc<dyn Bus>,
}

impl BusEventRecorder {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl EventRecorder for BusEventRecorder {
    async fn record(&self, event: AppEvent) {
        let result = match to_payload(subjects::APP_EVENT, &event) {
            Ok(payload) => self.bus.publish(subjects::APP_EVENT, payload).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(app_id = %event.app_id, kind = ?event.kind, error = %e, "app event not published");
        }
    }
}
