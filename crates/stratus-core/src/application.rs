//! Application: the lifecycle state machine for a deployed application.
//!
//! Every mutation runs through one pipeline: the change is applied to a
//! candidate copy, the candidate is validated (CPU thresholds, instance
//! bounds), instances are clamped into the autoscaling bounds, and the
//! version token is recomputed if the change starts a new generation. Only
//! a candidate that survives the whole pipeline replaces `self`, so a
//! rejected mutation never leaves a half-applied entity behind.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{Bound, LifecycleError, LifecycleResult};
use crate::types::*;

/// Autoscaling bounds and thresholds attached to an application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AutoscalingBounds {
    pub min_instances: Option<u32>,
    pub max_instances: Option<u32>,
    /// Lower CPU threshold, percent (0–100).
    pub min_cpu_threshold: Option<u32>,
    /// Upper CPU threshold, percent (0–100).
    pub max_cpu_threshold: Option<u32>,
    pub enabled: bool,
}

/// A deployed application and its declared desired state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub id: AppId,
    pub name: String,
    pub desired_state: DesiredState,
    /// Desired instance count.
    pub instances: u32,
    pub memory_mb: u32,
    pub disk_mb: u32,
    pub health_check_type: HealthCheckType,
    /// Hash of the uploaded application bits, if any were uploaded.
    pub package_hash: Option<String>,
    /// Hash of the staged droplet.
    pub droplet_hash: Option<String>,
    pub package_state: PackageState,
    pub staging_failed_reason: Option<String>,
    pub last_staging_response: Option<StagingResponse>,
    /// Current generation token.
    pub version: Version,
    /// Monotonic counter the version token is derived from.
    pub generation: u64,
    pub scaling: AutoscalingBounds,
    pub routes: Vec<String>,
    /// Set when bound routes changed and the router has not been told yet.
    pub pending_route_update: bool,
    /// Unix timestamp (seconds) of the last persisted mutation.
    pub updated_at: u64,
}

/// Externally requested change to an application. `None` leaves a field as is.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ApplicationUpdate {
    pub state: Option<DesiredState>,
    pub instances: Option<u32>,
    pub memory_mb: Option<u32>,
    pub disk_mb: Option<u32>,
    pub health_check_type: Option<HealthCheckType>,
    pub package_hash: Option<String>,
    pub droplet_hash: Option<String>,
    pub min_instances: Option<u32>,
    pub max_instances: Option<u32>,
    pub min_cpu_threshold: Option<u32>,
    pub max_cpu_threshold: Option<u32>,
    pub autoscale_enabled: Option<bool>,
    pub routes: Option<Vec<String>>,
}

impl ApplicationUpdate {
    /// Update that only changes the desired instance count.
    pub fn instances(count: u32) -> Self {
        Self {
            instances: Some(count),
            ..Self::default()
        }
    }

    fn bound_edits(&self) -> BoundEdits {
        BoundEdits {
            min: self.min_instances.is_some(),
            max: self.max_instances.is_some(),
        }
    }
}

/// Which instance bounds the caller explicitly set in this mutation.
#[derive(Debug, Clone, Copy, Default)]
struct BoundEdits {
    min: bool,
    max: bool,
}

impl Application {
    /// Create a freshly deployed, stopped application with no bits uploaded.
    pub fn new(id: impl Into<AppId>, name: impl Into<String>) -> Self {
        let id = id.into();
        let version = version_token(&id, 0);
        Self {
            id,
            name: name.into(),
            desired_state: DesiredState::Stopped,
            instances: 1,
            memory_mb: 256,
            disk_mb: 1024,
            health_check_type: HealthCheckType::Port,
            package_hash: None,
            droplet_hash: None,
            package_state: PackageState::Pending,
            staging_failed_reason: None,
            last_staging_response: None,
            version,
            generation: 0,
            scaling: AutoscalingBounds::default(),
            routes: Vec::new(),
            pending_route_update: false,
            updated_at: 0,
        }
    }

    // ── Predicates ─────────────────────────────────────────────────

    pub fn is_started(&self) -> bool {
        self.desired_state == DesiredState::Started
    }

    pub fn is_stopped(&self) -> bool {
        self.desired_state == DesiredState::Stopped
    }

    pub fn is_pending(&self) -> bool {
        self.package_state == PackageState::Pending
    }

    pub fn is_staged(&self) -> bool {
        self.package_state == PackageState::Staged
    }

    pub fn staging_failed(&self) -> bool {
        self.package_state == PackageState::Failed
    }

    /// Whether bits were ever uploaded for this application.
    pub fn bits_uploaded(&self) -> bool {
        self.package_hash.is_some()
    }

    /// A package is present, not yet staged, and the app wants running instances.
    pub fn needs_staging(&self) -> bool {
        self.bits_uploaded() && !self.is_staged() && self.is_started() && self.instances > 0
    }

    // ── Mutations ──────────────────────────────────────────────────

    /// Apply an external update through the full validation pipeline.
    pub fn apply(&mut self, update: ApplicationUpdate) -> LifecycleResult<()> {
        let edits = update.bound_edits();
        self.mutate(edits, move |app| {
            app.assign(update);
            Ok(())
        })
    }

    pub fn start(&mut self) -> LifecycleResult<()> {
        self.mutate(BoundEdits::default(), |app| {
            app.desired_state = DesiredState::Started;
            Ok(())
        })
    }

    pub fn stop(&mut self) -> LifecycleResult<()> {
        self.mutate(BoundEdits::default(), |app| {
            app.desired_state = DesiredState::Stopped;
            Ok(())
        })
    }

    /// Explicitly return the package to `Pending` so it gets staged again.
    pub fn mark_for_restaging(&mut self) -> LifecycleResult<()> {
        self.mutate(BoundEdits::default(), |app| {
            app.reset_package_state();
            Ok(())
        })
    }

    /// Stop, mark for restaging, and start again as one atomic change.
    pub fn restage(&mut self) -> LifecycleResult<()> {
        let mut candidate = self.clone();
        candidate.stop()?;
        candidate.mark_for_restaging()?;
        candidate.start()?;
        *self = candidate;
        Ok(())
    }

    /// Record a successful staging. Only valid while the package is pending.
    pub fn mark_as_staged(&mut self, response: StagingResponse) -> LifecycleResult<()> {
        self.mutate(BoundEdits::default(), move |app| {
            app.ensure_pending(PackageState::Staged)?;
            app.package_state = PackageState::Staged;
            app.staging_failed_reason = None;
            if let Some(hash) = &response.droplet_hash {
                app.droplet_hash = Some(hash.clone());
            }
            app.last_staging_response = Some(response);
            Ok(())
        })
    }

    /// Record a terminal staging failure. Only valid while the package is pending.
    pub fn mark_as_failed_to_stage(&mut self, reason: impl Into<String>) -> LifecycleResult<()> {
        let reason = reason.into();
        self.mutate(BoundEdits::default(), move |app| {
            app.ensure_pending(PackageState::Failed)?;
            app.package_state = PackageState::Failed;
            app.staging_failed_reason = Some(reason);
            Ok(())
        })
    }

    pub fn bind_route(&mut self, route: impl Into<String>) {
        let route = route.into();
        if !self.routes.contains(&route) {
            self.routes.push(route);
            self.pending_route_update = true;
        }
    }

    pub fn unbind_route(&mut self, route: &str) {
        let before = self.routes.len();
        self.routes.retain(|r| r != route);
        if self.routes.len() != before {
            self.pending_route_update = true;
        }
    }

    /// Acknowledge that the router has been told about the current routes.
    pub fn clear_pending_route_update(&mut self) {
        self.pending_route_update = false;
    }

    // ── Pipeline ───────────────────────────────────────────────────

    fn mutate<F>(&mut self, edits: BoundEdits, change: F) -> LifecycleResult<()>
    where
        F: FnOnce(&mut Application) -> LifecycleResult<()>,
    {
        let mut candidate = self.clone();
        change(&mut candidate)?;
        candidate.validate_cpu_thresholds(self)?;
        candidate.reconcile_instance_bounds(edits)?;
        candidate.clamp_instances(self);
        candidate.refresh_version(self);
        *self = candidate;
        Ok(())
    }

    fn assign(&mut self, update: ApplicationUpdate) {
        if let Some(state) = update.state {
            self.desired_state = state;
        }
        if let Some(instances) = update.instances {
            self.instances = instances;
        }
        if let Some(memory) = update.memory_mb {
            self.memory_mb = memory;
        }
        if let Some(disk) = update.disk_mb {
            self.disk_mb = disk;
        }
        if let Some(hc) = update.health_check_type {
            self.health_check_type = hc;
        }
        if let Some(hash) = update.package_hash
            && self.package_hash.as_deref() != Some(hash.as_str())
        {
            // New bits always need a fresh staging.
            self.package_hash = Some(hash);
            self.reset_package_state();
        }
        if let Some(hash) = update.droplet_hash {
            self.droplet_hash = Some(hash);
        }
        if let Some(min) = update.min_instances {
            self.scaling.min_instances = Some(min);
        }
        if let Some(max) = update.max_instances {
            self.scaling.max_instances = Some(max);
        }
        if let Some(min) = update.min_cpu_threshold {
            self.scaling.min_cpu_threshold = Some(min);
        }
        if let Some(max) = update.max_cpu_threshold {
            self.scaling.max_cpu_threshold = Some(max);
        }
        if let Some(enabled) = update.autoscale_enabled {
            self.scaling.enabled = enabled;
        }
        if let Some(routes) = update.routes
            && routes != self.routes
        {
            self.routes = routes;
            self.pending_route_update = true;
        }
    }

    fn reset_package_state(&mut self) {
        self.package_state = PackageState::Pending;
        self.staging_failed_reason = None;
    }

    fn ensure_pending(&self, to: PackageState) -> LifecycleResult<()> {
        if self.package_state != PackageState::Pending {
            return Err(LifecycleError::InvalidPackageTransition {
                from: self.package_state,
                to,
            });
        }
        Ok(())
    }

    fn validate_cpu_thresholds(&self, prior: &Application) -> LifecycleResult<()> {
        let min = self.scaling.min_cpu_threshold;
        let max = self.scaling.max_cpu_threshold;

        for (bound, value) in [(Bound::MinCpuThreshold, min), (Bound::MaxCpuThreshold, max)] {
            if let Some(value) = value
                && value > 100
            {
                return Err(LifecycleError::CpuThresholdOutOfRange { bound, value });
            }
        }

        if let (Some(min), Some(max)) = (min, max)
            && min > max
        {
            let bound = if Some(max) != prior.scaling.max_cpu_threshold
                && Some(min) == prior.scaling.min_cpu_threshold
            {
                Bound::MaxCpuThreshold
            } else {
                Bound::MinCpuThreshold
            };
            return Err(LifecycleError::InvertedCpuThresholds { bound, min, max });
        }
        Ok(())
    }

    fn reconcile_instance_bounds(&mut self, edits: BoundEdits) -> LifecycleResult<()> {
        for (bound, value) in [
            (Bound::MinInstances, self.scaling.min_instances),
            (Bound::MaxInstances, self.scaling.max_instances),
        ] {
            if value == Some(0) {
                return Err(LifecycleError::BoundBelowOne { bound });
            }
        }

        // A lone bound mirrors into the missing one.
        if edits.min && !edits.max && self.scaling.max_instances.is_none() {
            self.scaling.max_instances = self.scaling.min_instances;
        }
        if edits.max && !edits.min && self.scaling.min_instances.is_none() {
            self.scaling.min_instances = self.scaling.max_instances;
        }

        if let (Some(min), Some(max)) = (self.scaling.min_instances, self.scaling.max_instances)
            && min > max
        {
            let bound = if edits.max && !edits.min {
                Bound::MaxInstances
            } else {
                Bound::MinInstances
            };
            return Err(LifecycleError::InvertedInstanceBounds { bound, min, max });
        }
        Ok(())
    }

    fn clamp_instances(&mut self, prior: &Application) {
        if !self.scaling.enabled {
            return;
        }
        let touched = self.instances != prior.instances
            || self.scaling.min_instances != prior.scaling.min_instances
            || self.scaling.max_instances != prior.scaling.max_instances
            || self.scaling.enabled != prior.scaling.enabled;
        if !touched {
            return;
        }

        if let Some(min) = self.scaling.min_instances
            && self.instances < min
        {
            debug!(app_id = %self.id, from = self.instances, to = min, "clamping instances up to min");
            self.instances = min;
        } else if let Some(max) = self.scaling.max_instances
            && self.instances > max
        {
            debug!(app_id = %self.id, from = self.instances, to = max, "clamping instances down to max");
            self.instances = max;
        }
    }

    fn refresh_version(&mut self, prior: &Application) {
        if !self.is_started() {
            return;
        }
        let became_started = !prior.is_started();
        let memory_changed = self.memory_mb != prior.memory_mb;
        let health_check_changed = self.health_check_type != prior.health_check_type;
        let droplet_assigned = prior.droplet_hash.is_none() && self.droplet_hash.is_some();

        if became_started || memory_changed || health_check_changed || droplet_assigned {
            self.generation += 1;
            self.version = version_token(&self.id, self.generation);
            debug!(app_id = %self.id, version = %self.version, "new generation");
        }
    }
}

/// Derive the opaque version token for a generation.
fn version_token(id: &str, generation: u64) -> Version {
    let mut hasher = Sha256::new();
    hasher.update(id.as_bytes());
    hasher.update(b":");
    hasher.update(generation.to_be_bytes());
    hex::encode(&hasher.finalize()[..12])
}

/// The before/after pair of a single application mutation.
///
/// `after == None` describes a deletion; `before == None` a creation.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplicationDiff {
    pub before: Option<Application>,
    pub after: Option<Application>,
}

impl ApplicationDiff {
    pub fn created(after: Application) -> Self {
        Self {
            before: None,
            after: Some(after),
        }
    }

    pub fn updated(before: Application, after: Application) -> Self {
        Self {
            before: Some(before),
            after: Some(after),
        }
    }

    pub fn deleted(before: Application) -> Self {
        Self {
            before: Some(before),
            after: None,
        }
    }

    pub fn app_id(&self) -> &str {
        self.after
            .as_ref()
            .or(self.before.as_ref())
            .map(|a| a.id.as_str())
            .unwrap_or_default()
    }

    pub fn is_deletion(&self) -> bool {
        self.before.is_some() && self.after.is_none()
    }

    pub fn desired_state_changed(&self) -> bool {
        match (&self.before, &self.after) {
            (Some(b), Some(a)) => b.desired_state != a.desired_state,
            (None, Some(a)) => a.is_started(),
            _ => false,
        }
    }

    pub fn instances_changed(&self) -> bool {
        self.both().is_some_and(|(b, a)| b.instances != a.instances)
    }

    pub fn version_changed(&self) -> bool {
        self.both().is_some_and(|(b, a)| b.version != a.version)
    }

    /// Either the uploaded bits or the staged droplet changed.
    pub fn package_changed(&self) -> bool {
        self.both().is_some_and(|(b, a)| {
            b.package_hash != a.package_hash || b.droplet_hash != a.droplet_hash
        })
    }

    pub fn autoscaling_changed(&self) -> bool {
        self.both().is_some_and(|(b, a)| b.scaling != a.scaling)
    }

    fn both(&self) -> Option<(&Application, &Application)> {
        match (&self.before, &self.after) {
            (Some(b), Some(a)) => Some((b, a)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started_app() -> Application {
        let mut app = Application::new("app-1", "web");
        app.apply(ApplicationUpdate {
            package_hash: Some("bits-1".to_string()),
            ..Default::default()
        })
        .unwrap();
        app.start().unwrap();
        app
    }

    fn autoscaled_app(instances: u32, min: u32, max: u32) -> Application {
        let mut app = started_app();
        app.apply(ApplicationUpdate {
            instances: Some(instances),
            min_instances: Some(min),
            max_instances: Some(max),
            autoscale_enabled: Some(true),
            ..Default::default()
        })
        .unwrap();
        app
    }

    // ── Versioning ─────────────────────────────────────────────────

    #[test]
    fn new_app_is_stopped_and_pending() {
        let app = Application::new("app-1", "web");
        assert!(app.is_stopped());
        assert!(app.is_pending());
        assert!(!app.needs_staging());
        assert_eq!(app.generation, 0);
    }

    #[test]
    fn start_bumps_version() {
        let mut app = Application::new("app-1", "web");
        let before = app.version.clone();
        app.start().unwrap();
        assert_ne!(app.version, before);
    }

    #[test]
    fn version_bumps_on_generation_changes_while_started() {
        let changes = [
            ApplicationUpdate {
                memory_mb: Some(512),
                ..Default::default()
            },
            ApplicationUpdate {
                health_check_type: Some(HealthCheckType::Http),
                ..Default::default()
            },
            ApplicationUpdate {
                droplet_hash: Some("droplet-1".to_string()),
                ..Default::default()
            },
        ];

        for change in changes {
            let mut app = started_app();
            let before = app.version.clone();
            app.apply(change.clone()).unwrap();
            assert_ne!(app.version, before, "expected a new version for {change:?}");
        }
    }

    #[test]
    fn version_unchanged_for_unrelated_mutations() {
        let changes = [
            ApplicationUpdate::instances(4),
            ApplicationUpdate {
                disk_mb: Some(2048),
                ..Default::default()
            },
            ApplicationUpdate {
                routes: Some(vec!["web.example.com".to_string()]),
                ..Default::default()
            },
            ApplicationUpdate {
                min_cpu_threshold: Some(20),
                max_cpu_threshold: Some(80),
                ..Default::default()
            },
        ];

        for change in changes {
            let mut app = started_app();
            let before = app.version.clone();
            app.apply(change.clone()).unwrap();
            assert_eq!(app.version, before, "unexpected new version for {change:?}");
        }
    }

    #[test]
    fn version_unchanged_when_stopped() {
        let mut app = Application::new("app-1", "web");
        let before = app.version.clone();
        app.apply(ApplicationUpdate {
            memory_mb: Some(1024),
            health_check_type: Some(HealthCheckType::Process),
            droplet_hash: Some("droplet-1".to_string()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(app.version, before);
    }

    #[test]
    fn replacing_an_existing_droplet_does_not_bump_version() {
        let mut app = started_app();
        app.apply(ApplicationUpdate {
            droplet_hash: Some("droplet-1".to_string()),
            ..Default::default()
        })
        .unwrap();
        let before = app.version.clone();
        app.apply(ApplicationUpdate {
            droplet_hash: Some("droplet-2".to_string()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(app.version, before);
    }

    // ── Package state ──────────────────────────────────────────────

    #[test]
    fn needs_staging_requires_bits_started_and_instances() {
        let mut app = started_app();
        assert!(app.needs_staging());

        app.apply(ApplicationUpdate::instances(0)).unwrap();
        assert!(!app.needs_staging());

        let mut no_bits = Application::new("app-2", "worker");
        no_bits.start().unwrap();
        assert!(!no_bits.needs_staging());
    }

    #[test]
    fn mark_as_staged_records_droplet() {
        let mut app = started_app();
        app.mark_as_staged(StagingResponse {
            instances_started: 1,
            droplet_hash: Some("droplet-1".to_string()),
            detected_buildpack: Some("rust".to_string()),
        })
        .unwrap();

        assert!(app.is_staged());
        assert!(!app.needs_staging());
        assert_eq!(app.droplet_hash.as_deref(), Some("droplet-1"));
        assert_eq!(app.last_staging_response.unwrap().instances_started, 1);
    }

    #[test]
    fn package_state_leaves_pending_only_once() {
        let mut app = started_app();
        app.mark_as_failed_to_stage("buildpack compile failed").unwrap();
        assert!(app.staging_failed());
        assert_eq!(app.staging_failed_reason.as_deref(), Some("buildpack compile failed"));

        let err = app.mark_as_staged(StagingResponse::default()).unwrap_err();
        assert_eq!(
            err,
            LifecycleError::InvalidPackageTransition {
                from: PackageState::Failed,
                to: PackageState::Staged,
            }
        );
        assert!(app.staging_failed());
    }

    #[test]
    fn mark_for_restaging_returns_to_pending() {
        let mut app = started_app();
        app.mark_as_failed_to_stage("no buildpack").unwrap();
        app.mark_for_restaging().unwrap();
        assert!(app.is_pending());
        assert!(app.staging_failed_reason.is_none());
        assert!(app.needs_staging());
    }

    #[test]
    fn new_bits_reset_package_state() {
        let mut app = started_app();
        app.mark_as_staged(StagingResponse::default()).unwrap();
        app.apply(ApplicationUpdate {
            package_hash: Some("bits-2".to_string()),
            ..Default::default()
        })
        .unwrap();
        assert!(app.is_pending());
    }

    #[test]
    fn restage_starts_a_new_pending_generation() {
        let mut app = started_app();
        app.mark_as_staged(StagingResponse::default()).unwrap();
        let before = app.version.clone();

        app.restage().unwrap();

        assert!(app.is_started());
        assert!(app.is_pending());
        assert_ne!(app.version, before);
    }

    // ── Bounds and clamping ────────────────────────────────────────

    #[test]
    fn clamps_instances_down_to_max() {
        let mut app = autoscaled_app(2, 1, 5);
        app.apply(ApplicationUpdate::instances(10)).unwrap();
        assert_eq!(app.instances, 5);
    }

    #[test]
    fn clamps_instances_up_to_min() {
        let mut app = autoscaled_app(3, 2, 5);
        app.apply(ApplicationUpdate::instances(1)).unwrap();
        assert_eq!(app.instances, 2);
    }

    #[test]
    fn enabling_autoscale_clamps_existing_count() {
        let mut app = started_app();
        app.apply(ApplicationUpdate {
            instances: Some(8),
            min_instances: Some(1),
            max_instances: Some(4),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(app.instances, 8);

        app.apply(ApplicationUpdate {
            autoscale_enabled: Some(true),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(app.instances, 4);
    }

    #[test]
    fn no_clamp_without_autoscale() {
        let mut app = started_app();
        app.apply(ApplicationUpdate {
            min_instances: Some(1),
            max_instances: Some(3),
            ..Default::default()
        })
        .unwrap();
        app.apply(ApplicationUpdate::instances(10)).unwrap();
        assert_eq!(app.instances, 10);
    }

    #[test]
    fn lone_bound_mirrors_into_missing_bound() {
        let mut app = started_app();
        app.apply(ApplicationUpdate {
            min_instances: Some(3),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(app.scaling.max_instances, Some(3));

        let mut other = started_app();
        other
            .apply(ApplicationUpdate {
                max_instances: Some(7),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(other.scaling.min_instances, Some(7));
    }

    #[test]
    fn rejects_inverted_bounds_naming_offending_bound() {
        let mut app = autoscaled_app(2, 1, 5);
        let snapshot = app.clone();

        let err = app
            .apply(ApplicationUpdate {
                min_instances: Some(6),
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err.bound(), Some(Bound::MinInstances));

        let err = app
            .apply(ApplicationUpdate {
                max_instances: Some(0),
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err, LifecycleError::BoundBelowOne { bound: Bound::MaxInstances });

        let mut raised = autoscaled_app(2, 3, 5);
        let err = raised
            .apply(ApplicationUpdate {
                max_instances: Some(2),
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err.bound(), Some(Bound::MaxInstances));

        assert_eq!(app, snapshot, "rejected mutation must not change the app");
    }

    #[test]
    fn rejects_cpu_thresholds_out_of_range() {
        let mut app = started_app();
        let err = app
            .apply(ApplicationUpdate {
                max_cpu_threshold: Some(150),
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(
            err,
            LifecycleError::CpuThresholdOutOfRange {
                bound: Bound::MaxCpuThreshold,
                value: 150,
            }
        );

        app.apply(ApplicationUpdate {
            min_cpu_threshold: Some(30),
            max_cpu_threshold: Some(70),
            ..Default::default()
        })
        .unwrap();
        let err = app
            .apply(ApplicationUpdate {
                min_cpu_threshold: Some(90),
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err.bound(), Some(Bound::MinCpuThreshold));

        let err = app
            .apply(ApplicationUpdate {
                max_cpu_threshold: Some(10),
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(
            err,
            LifecycleError::InvertedCpuThresholds {
                bound: Bound::MaxCpuThreshold,
                min: 30,
                max: 10,
            }
        );
    }

    #[test]
    fn clamp_invariant_holds_across_mutations() {
        let updates = [
            ApplicationUpdate::instances(0),
            ApplicationUpdate::instances(100),
            ApplicationUpdate {
                min_instances: Some(4),
                ..Default::default()
            },
            ApplicationUpdate {
                max_instances: Some(4),
                ..Default::default()
            },
            ApplicationUpdate {
                autoscale_enabled: Some(true),
                ..Default::default()
            },
        ];

        for update in updates {
            let mut app = autoscaled_app(3, 2, 6);
            if app.apply(update).is_ok() {
                let min = app.scaling.min_instances.unwrap();
                let max = app.scaling.max_instances.unwrap();
                assert!(min <= app.instances && app.instances <= max);
            }
        }
    }

    // ── Routes and diffs ───────────────────────────────────────────

    #[test]
    fn route_changes_flag_pending_update() {
        let mut app = started_app();
        app.bind_route("web.example.com");
        assert!(app.pending_route_update);
        app.clear_pending_route_update();
        app.bind_route("web.example.com");
        assert!(!app.pending_route_update);
        app.unbind_route("web.example.com");
        assert!(app.pending_route_update);
    }

    #[test]
    fn diff_reports_changed_fields() {
        let before = started_app();
        let mut after = before.clone();
        after.apply(ApplicationUpdate::instances(3)).unwrap();

        let diff = ApplicationDiff::updated(before.clone(), after);
        assert!(diff.instances_changed());
        assert!(!diff.version_changed());
        assert!(!diff.desired_state_changed());
        assert_eq!(diff.app_id(), "app-1");

        let deleted = ApplicationDiff::deleted(before);
        assert!(deleted.is_deletion());
        assert!(!deleted.instances_changed());
    }
}
