//! Health signal client.
//!
//! Every query carries a timeout and resolves to whatever arrived in time.
//! Nothing here returns an error: a timeout, a bus failure, or a malformed
//! reply all degrade to an empty or zero answer, logged at debug. The
//! client never retries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use stratus_bus::{
    AutoscalingSettings, Bus, CrashedInstance, CrashesReply, DropletVersion, FlappingIndex,
    FlappingReply, HealthQuery, HealthReply, LiveVersion, RequestOptions, StatusQuery,
    from_payload, subjects, to_payload,
};
use stratus_core::{AppId, Application, HealthClientConfig, InstanceState};

#[derive(Clone)]
pub struct HealthSignalClient {
    bus: Arc<dyn Bus>,
    timeout: Duration,
}

impl HealthSignalClient {
    pub fn new(bus: Arc<dyn Bus>, config: &HealthClientConfig) -> Self {
        Self {
            bus,
            timeout: config.query_timeout(),
        }
    }

    /// Override the query timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send a request and return the replies that arrived before
    /// `expected` of them did or the timeout elapsed. Possibly empty.
    pub async fn send(
        &self,
        subject: &str,
        payload: Value,
        expected: Option<usize>,
        timeout: Option<Duration>,
    ) -> Vec<Value> {
        let options = RequestOptions {
            expected,
            timeout: timeout.unwrap_or(self.timeout),
        };
        match self.bus.request(subject, payload, options).await {
            Ok(replies) => replies,
            Err(e) => {
                debug!(%subject, error = %e, "health query failed");
                Vec::new()
            }
        }
    }

    /// Healthy instance count of each application's current generation.
    ///
    /// One batched query; applications nobody answered for count as 0.
    pub async fn healthy_instances(&self, apps: &[Application]) -> HashMap<AppId, u32> {
        let mut counts: HashMap<AppId, u32> = apps.iter().map(|a| (a.id.clone(), 0)).collect();
        if apps.is_empty() {
            return counts;
        }

        let query = HealthQuery {
            droplets: apps
                .iter()
                .map(|a| DropletVersion {
                    droplet: a.id.clone(),
                    version: a.version.clone(),
                })
                .collect(),
        };
        let Some(payload) = encode(subjects::HM_HEALTH, &query) else {
            return counts;
        };

        let replies = self
            .send(subjects::HM_HEALTH, payload, Some(apps.len()), None)
            .await;
        for reply in replies {
            let Some(reply) = decode::<HealthReply>(subjects::HM_HEALTH, &reply) else {
                continue;
            };
            let current = apps
                .iter()
                .any(|a| a.id == reply.droplet && a.version == reply.version);
            if current {
                counts.insert(reply.droplet, reply.healthy);
            } else {
                debug!(droplet = %reply.droplet, version = %reply.version, "ignoring stale health reply");
            }
        }
        counts
    }

    /// Crashed instances of the application's current generation.
    pub async fn find_crashes(&self, app: &Application) -> Vec<CrashedInstance> {
        self.status_query::<CrashesReply>(app, InstanceState::Crashed)
            .await
            .map(|reply| reply.instances)
            .unwrap_or_default()
    }

    /// Indices the health-signal subsystem considers flapping.
    pub async fn find_flapping_indices(&self, app: &Application) -> Vec<FlappingIndex> {
        self.status_query::<FlappingReply>(app, InstanceState::Flapping)
            .await
            .map(|reply| reply.indices)
            .unwrap_or_default()
    }

    /// Publish the application's current autoscaling fields. At most once.
    pub async fn update_autoscaling_fields(&self, app: &Application) {
        self.notify(subjects::HM_AUTOSCALING_UPDATE, &AutoscalingSettings::for_app(app))
            .await;
    }

    /// Tell the health-signal subsystem a new generation is live. At most once.
    pub async fn notify_new_live_version(&self, app: &Application) {
        let message = LiveVersion {
            app_id: app.id.clone(),
            version: app.version.clone(),
        };
        self.notify(subjects::HM_LIVE_VERSION, &message).await;
    }

    async fn status_query<T: DeserializeOwned>(
        &self,
        app: &Application,
        state: InstanceState,
    ) -> Option<T> {
        let query = StatusQuery {
            droplet: app.id.clone(),
            version: Some(app.version.clone()),
            state,
        };
        let payload = encode(subjects::HM_STATUS, &query)?;
        let replies = self.send(subjects::HM_STATUS, payload, Some(1), None).await;
        let reply = replies.first()?;
        decode(subjects::HM_STATUS, reply)
    }

    async fn notify<T: Serialize>(&self, subject: &str, message: &T) {
        let Some(payload) = encode(subject, message) else {
            return;
        };
        if let Err(e) = self.bus.publish(subject, payload).await {
            warn!(%subject, error = %e, "health notification not sent");
        }
    }
}

fn encode<T: Serialize>(subject: &str, message: &T) -> Option<Value> {
    to_payload(subject, message)
        .map_err(|e| warn!(error = %e, "failed to encode health message"))
        .ok()
}

fn decode<T: DeserializeOwned>(subject: &str, reply: &Value) -> Option<T> {
    from_payload(reply)
        .map_err(|e| debug!(%subject, error = %e, "malformed health reply"))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stratus_bus::InMemoryBus;

    fn test_client(bus: &InMemoryBus) -> HealthSignalClient {
        HealthSignalClient::new(Arc::new(bus.clone()), &HealthClientConfig::default())
            .with_timeout(Duration::from_millis(50))
    }

    fn test_app(id: &str) -> Application {
        let mut app = Application::new(id, id);
        app.start().unwrap();
        app
    }

    /// Answer each health query with one reply per listed droplet.
    async fn spawn_health_responder(bus: &InMemoryBus, healthy: HashMap<String, u32>) {
        let mut sub = bus.subscribe(subjects::HM_HEALTH).await.unwrap();
        let bus = bus.clone();
        tokio::spawn(async move {
            while let Some(envelope) = sub.next().await {
                let query: HealthQuery = from_payload(&envelope.payload).unwrap();
                for droplet in query.droplets {
                    if let Some(count) = healthy.get(&droplet.droplet) {
                        let reply = HealthReply {
                            droplet: droplet.droplet,
                            version: droplet.version,
                            healthy: *count,
                        };
                        bus.respond(&envelope, serde_json::to_value(reply).unwrap())
                            .await
                            .unwrap();
                    }
                }
            }
        });
    }

    #[tokio::test]
    async fn healthy_instances_defaults_unanswered_to_zero() {
        let bus = InMemoryBus::new();
        spawn_health_responder(&bus, HashMap::from([("app-1".to_string(), 3)])).await;
        let client = test_client(&bus);

        let counts = client
            .healthy_instances(&[test_app("app-1"), test_app("app-2")])
            .await;

        assert_eq!(counts["app-1"], 3);
        assert_eq!(counts["app-2"], 0);
    }

    #[tokio::test]
    async fn healthy_instances_ignores_other_generations() {
        let bus = InMemoryBus::new();
        let mut sub = bus.subscribe(subjects::HM_HEALTH).await.unwrap();
        let responder = bus.clone();
        tokio::spawn(async move {
            let envelope = sub.next().await.unwrap();
            let reply = json!({"droplet": "app-1", "version": "old", "healthy": 9});
            responder.respond(&envelope, reply).await.unwrap();
        });

        let counts = test_client(&bus).healthy_instances(&[test_app("app-1")]).await;
        assert_eq!(counts["app-1"], 0);
    }

    #[tokio::test]
    async fn queries_without_responder_are_empty() {
        let bus = InMemoryBus::new();
        let client = test_client(&bus);
        let app = test_app("app-1");

        assert!(client.find_crashes(&app).await.is_empty());
        assert!(client.find_flapping_indices(&app).await.is_empty());
        assert!(client.send("hm.anything", json!({}), None, None).await.is_empty());
    }

    #[tokio::test]
    async fn find_flapping_indices_filters_by_state() {
        let bus = InMemoryBus::new();
        let mut sub = bus.subscribe(subjects::HM_STATUS).await.unwrap();
        let responder = bus.clone();
        tokio::spawn(async move {
            let envelope = sub.next().await.unwrap();
            let query: StatusQuery = from_payload(&envelope.payload).unwrap();
            assert_eq!(query.state, InstanceState::Flapping);
            let reply = json!({"indices": [{"index": 2, "since": 1700000000}]});
            responder.respond(&envelope, reply).await.unwrap();
        });

        let indices = test_client(&bus)
            .find_flapping_indices(&test_app("app-1"))
            .await;
        assert_eq!(indices, vec![FlappingIndex { index: 2, since: 1_700_000_000 }]);
    }

    #[tokio::test]
    async fn notifications_are_fire_and_forget() {
        let bus = InMemoryBus::new();
        let mut live = bus.subscribe(subjects::HM_LIVE_VERSION).await.unwrap();
        let client = test_client(&bus);
        let app = test_app("app-1");

        client.notify_new_live_version(&app).await;
        // Nobody listens here; still fine.
        client.update_autoscaling_fields(&app).await;

        let envelope = live.next().await.unwrap();
        assert_eq!(envelope.payload["version"], json!(app.version));
    }
}
