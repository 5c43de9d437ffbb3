//! CPU-threshold scale-up policy.
//!
//! When an application's observed CPU exceeds its `max_cpu_threshold`,
//! the desired count grows in proportion to the overshoot, by at least
//! one instance, and never past `max_instances`. A cooldown window per
//! application keeps repeated signals from stacking scale-ups.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use tracing::{debug, info};

use stratus_core::{AppId, Application, ApplicationUpdate, AutoscaleConfig, Clock};
use stratus_scheduler::DispatchObserver;
use stratus_state::StateStore;

/// Used when an application enables autoscaling without a CPU ceiling.
pub const DEFAULT_MAX_CPU_THRESHOLD: u32 = 80;

/// A scaling decision for a single application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScaleDecision {
    /// Scale to the specified instance count.
    ScaleTo(u32),
    NoChange,
}

pub struct ScalePolicy {
    store: StateStore,
    dispatch: Arc<DispatchObserver>,
    clock: Arc<dyn Clock>,
    cooldown_secs: u64,
    /// Last scale-up per application, in clock seconds.
    last_scale_up: Mutex<HashMap<AppId, u64>>,
}

impl ScalePolicy {
    pub fn new(
        store: StateStore,
        dispatch: Arc<DispatchObserver>,
        clock: Arc<dyn Clock>,
        config: &AutoscaleConfig,
    ) -> Self {
        Self {
            store,
            dispatch,
            clock,
            cooldown_secs: config.cooldown_secs,
            last_scale_up: Mutex::new(HashMap::new()),
        }
    }

    /// Decide whether `app` should grow given its observed CPU percentage.
    pub fn evaluate(&self, app: &Application, cpu_percent: f64) -> ScaleDecision {
        let scaling = &app.scaling;
        if !scaling.enabled || !app.is_started() || app.instances == 0 {
            return ScaleDecision::NoChange;
        }

        let threshold = scaling
            .max_cpu_threshold
            .unwrap_or(DEFAULT_MAX_CPU_THRESHOLD)
            .max(1);
        if cpu_percent <= f64::from(threshold) {
            return ScaleDecision::NoChange;
        }

        let now = self.clock.now_secs();
        if let Some(last) = self.last_scale_up(&app.id)
            && now.saturating_sub(last) < self.cooldown_secs
        {
            debug!(app_id = %app.id, last, now, "scale-up cooling down");
            return ScaleDecision::NoChange;
        }

        let ratio = cpu_percent / f64::from(threshold);
        let desired = ((f64::from(app.instances)) * ratio).ceil() as u32;
        let desired = desired.max(app.instances.saturating_add(1));
        let clamped = match scaling.max_instances {
            Some(max) => desired.min(max),
            None => desired,
        };

        if clamped > app.instances {
            ScaleDecision::ScaleTo(clamped)
        } else {
            debug!(app_id = %app.id, instances = app.instances, "already at max instances");
            ScaleDecision::NoChange
        }
    }

    /// Evaluate the stored application and apply a scale-up through the
    /// store and the dispatch observer.
    pub async fn scale_up(&self, app_id: &str, cpu_percent: f64) -> anyhow::Result<ScaleDecision> {
        let app = self
            .store
            .get_application(app_id)?
            .with_context(|| format!("application not found: {app_id}"))?;

        let decision = self.evaluate(&app, cpu_percent);
        let ScaleDecision::ScaleTo(target) = decision else {
            return Ok(decision);
        };

        let Some((diff, ())) = self
            .store
            .update_application(app_id, |stored| stored.apply(ApplicationUpdate::instances(target)))?
        else {
            anyhow::bail!("application vanished while scaling: {app_id}");
        };

        self.record_scale_up(app_id);
        info!(%app_id, from = app.instances, to = target, cpu_percent, "scaling up");
        self.dispatch.observe(&diff).await;
        Ok(decision)
    }

    fn last_scale_up(&self, app_id: &str) -> Option<u64> {
        self.last_scale_up
            .lock()
            .ok()
            .and_then(|map| map.get(app_id).copied())
    }

    fn record_scale_up(&self, app_id: &str) {
        let now = self.clock.now_secs();
        if let Ok(mut map) = self.last_scale_up.lock() {
            map.insert(app_id.to_string(), now);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use stratus_bus::{Bus, InMemoryBus, subjects};
    use stratus_core::{ControlPlaneConfig, ManualClock};
    use stratus_health::HealthSignalClient;
    use stratus_scheduler::{
        BusArtifactQueue, BusEventRecorder, BusRunBackend, DispatchDeps, RunBackend,
        StagingOrchestrator,
    };

    pub(crate) struct Fixture {
        pub store: StateStore,
        pub bus: InMemoryBus,
        pub clock: ManualClock,
        pub policy: Arc<ScalePolicy>,
    }

    pub(crate) fn fixture() -> Fixture {
        let config = ControlPlaneConfig::default();
        let store = StateStore::open_in_memory().unwrap();
        let bus = InMemoryBus::new();
        let shared: Arc<dyn Bus> = Arc::new(bus.clone());
        let backend: Arc<dyn RunBackend> =
            Arc::new(BusRunBackend::new(shared.clone(), &config.staging));
        let dispatch = Arc::new(DispatchObserver::new(DispatchDeps {
            store: store.clone(),
            bus: shared.clone(),
            backend: backend.clone(),
            artifacts: Arc::new(BusArtifactQueue::new(shared.clone())),
            events: Arc::new(BusEventRecorder::new(shared.clone())),
            health: HealthSignalClient::new(shared.clone(), &config.health),
            staging: StagingOrchestrator::new(backend, store.clone(), &config.staging),
        }));
        let clock = ManualClock::new(1_000);
        let policy = Arc::new(ScalePolicy::new(
            store.clone(),
            dispatch,
            Arc::new(clock.clone()),
            &config.autoscale,
        ));
        Fixture {
            store,
            bus,
            clock,
            policy,
        }
    }

    /// Started, staged-enough app with autoscaling between 1 and 5.
    pub(crate) fn autoscaled_app(store: &StateStore, instances: u32) -> Application {
        let mut app = Application::new("app-1", "web");
        app.apply(ApplicationUpdate {
            instances: Some(instances),
            package_hash: Some("bits".to_string()),
            min_instances: Some(1),
            max_instances: Some(5),
            max_cpu_threshold: Some(80),
            autoscale_enabled: Some(true),
            ..Default::default()
        })
        .unwrap();
        app.start().unwrap();
        store.put_application(&app).unwrap();
        app
    }

    #[test]
    fn below_threshold_is_no_change() {
        let f = fixture();
        let app = autoscaled_app(&f.store, 2);
        assert_eq!(f.policy.evaluate(&app, 80.0), ScaleDecision::NoChange);
    }

    #[test]
    fn grows_in_proportion_and_clamps_to_max() {
        let f = fixture();
        let app = autoscaled_app(&f.store, 2);
        assert_eq!(f.policy.evaluate(&app, 100.0), ScaleDecision::ScaleTo(3));
        assert_eq!(f.policy.evaluate(&app, 400.0), ScaleDecision::ScaleTo(5));
        // A marginal overshoot still adds one.
        assert_eq!(f.policy.evaluate(&app, 81.0), ScaleDecision::ScaleTo(3));
    }

    #[test]
    fn unbounded_app_at_the_count_ceiling_stays_put() {
        let f = fixture();
        let mut app = autoscaled_app(&f.store, 2);
        app.scaling.max_instances = None;
        app.instances = u32::MAX;
        assert_eq!(f.policy.evaluate(&app, 99.0), ScaleDecision::NoChange);
    }

    #[test]
    fn disabled_or_stopped_is_no_change() {
        let f = fixture();
        let mut app = autoscaled_app(&f.store, 2);
        app.scaling.enabled = false;
        assert_eq!(f.policy.evaluate(&app, 200.0), ScaleDecision::NoChange);

        let mut stopped = autoscaled_app(&f.store, 2);
        stopped.stop().unwrap();
        assert_eq!(f.policy.evaluate(&stopped, 200.0), ScaleDecision::NoChange);
    }

    #[tokio::test]
    async fn scale_up_persists_dispatches_and_cools_down() {
        let f = fixture();
        autoscaled_app(&f.store, 2);
        let mut scales = f.bus.subscribe(subjects::NODE_SCALE).await.unwrap();

        let first = f.policy.scale_up("app-1", 100.0).await.unwrap();
        assert_eq!(first, ScaleDecision::ScaleTo(3));
        assert_eq!(f.store.get_application("app-1").unwrap().unwrap().instances, 3);
        assert_eq!(scales.next().await.unwrap().payload["instances"], 3);

        let cooling = f.policy.scale_up("app-1", 100.0).await.unwrap();
        assert_eq!(cooling, ScaleDecision::NoChange);

        f.clock.advance(61);
        let second = f.policy.scale_up("app-1", 100.0).await.unwrap();
        assert_eq!(second, ScaleDecision::ScaleTo(4));
    }

    #[tokio::test]
    async fn unknown_app_is_an_error() {
        let f = fixture();
        assert!(f.policy.scale_up("ghost", 100.0).await.is_err());
    }
}
