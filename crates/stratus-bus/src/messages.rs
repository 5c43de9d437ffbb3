//! Wire messages exchanged over the bus.
//!
//! Everything travels as JSON. Outbound messages are plain serde structs.
//! Inbound commands from the health-signal subsystem are decoded exactly
//! once into [`InboundCommand`]: the payload is first read into a lenient
//! raw form, then checked for required fields, so a missing field surfaces
//! as a [`MalformedMessage`] naming the application it was about.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use stratus_core::{AppId, Application, InstanceState, NodeId, ResourceUsage, StagingResponse, Version};

use crate::error::{BusError, BusResult, MalformedMessage};
use crate::subjects;

/// Serialize a message into a bus payload.
pub fn to_payload<T: Serialize>(subject: &str, message: &T) -> BusResult<Value> {
    serde_json::to_value(message).map_err(|source| BusError::Encode {
        subject: subject.to_string(),
        source,
    })
}

/// Deserialize a bus payload into a message.
pub fn from_payload<T: DeserializeOwned>(payload: &Value) -> Result<T, serde_json::Error> {
    T::deserialize(payload)
}

// ── Compute nodes ──────────────────────────────────────────────────

/// Periodic unsolicited report of what a node is running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub node_id: NodeId,
    #[serde(default)]
    pub instances: Vec<HeartbeatInstance>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatInstance {
    pub app_id: AppId,
    pub version: Version,
    pub index: u32,
    pub instance_id: String,
    pub state: InstanceState,
}

/// A node identifying itself, either unprompted or as a reply to a "who are you" request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub address: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsRequest {
    pub app_id: AppId,
    pub index: u32,
    pub instance_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsReply {
    pub app_id: AppId,
    pub index: u32,
    pub state: InstanceState,
    pub usage: ResourceUsage,
}

/// Fire-and-forget run command sent to compute nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCommand {
    pub app_id: AppId,
    pub version: Version,
    /// Desired instance count of the generation.
    pub instances: u32,
    pub memory_mb: u32,
    pub droplet_hash: Option<String>,
    /// Specific indices to start; empty means "all missing ones".
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub indices: Vec<u32>,
}

impl RunCommand {
    pub fn for_app(app: &Application) -> Self {
        Self {
            app_id: app.id.clone(),
            version: app.version.clone(),
            instances: app.instances,
            memory_mb: app.memory_mb,
            droplet_hash: app.droplet_hash.clone(),
            indices: Vec::new(),
        }
    }
}

/// Fire-and-forget stop command sent to compute nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopCommand {
    pub app_id: AppId,
    /// Specific instances to stop; empty means every instance of the app.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instance_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteUpdate {
    pub app_id: AppId,
    pub routes: Vec<String>,
}

// ── Staging and artifacts ──────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRequest {
    pub app_id: AppId,
    pub version: Version,
    pub package_hash: Option<String>,
    pub memory_mb: u32,
    pub disk_mb: u32,
}

impl StageRequest {
    pub fn for_app(app: &Application) -> Self {
        Self {
            app_id: app.id.clone(),
            version: app.version.clone(),
            package_hash: app.package_hash.clone(),
            memory_mb: app.memory_mb,
            disk_mb: app.disk_mb,
        }
    }
}

/// Stager reply, tagged by outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageReply {
    Staged(StagingResponse),
    /// No stager had the memory or disk to take the job.
    NoCapacity { message: String },
    Failed { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Package,
    BuildpackCache,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDeletion {
    pub kind: ArtifactKind,
    pub app_id: AppId,
}

// ── Health-signal subsystem ────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropletVersion {
    pub droplet: AppId,
    pub version: Version,
}

/// Batched "how many healthy instances" query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthQuery {
    pub droplets: Vec<DropletVersion>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReply {
    pub droplet: AppId,
    pub version: Version,
    pub healthy: u32,
}

/// State-filtered query about one application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusQuery {
    pub droplet: AppId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
    pub state: InstanceState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashedInstance {
    pub instance: String,
    pub index: u32,
    pub since: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CrashesReply {
    #[serde(default)]
    pub instances: Vec<CrashedInstance>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlappingIndex {
    pub index: u32,
    pub since: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FlappingReply {
    #[serde(default)]
    pub indices: Vec<FlappingIndex>,
}

/// Current autoscaling fields of an application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoscalingSettings {
    pub app_id: AppId,
    pub min_instances: Option<u32>,
    pub max_instances: Option<u32>,
    pub min_cpu_threshold: Option<u32>,
    pub max_cpu_threshold: Option<u32>,
    pub enabled: bool,
}

impl AutoscalingSettings {
    pub fn for_app(app: &Application) -> Self {
        let scaling = &app.scaling;
        Self {
            app_id: app.id.clone(),
            min_instances: scaling.min_instances,
            max_instances: scaling.max_instances,
            min_cpu_threshold: scaling.min_cpu_threshold,
            max_cpu_threshold: scaling.max_cpu_threshold,
            enabled: scaling.enabled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveVersion {
    pub app_id: AppId,
    pub version: Version,
}

// ── Broadcasts and signals ─────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppUpdated {
    pub app_id: AppId,
    pub instances: u32,
    pub version: Version,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleUpSignal {
    pub app_id: AppId,
    pub cpu_percent: f64,
}

// ── Inbound commands ───────────────────────────────────────────────

/// Request to start specific indices of one generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartInstances {
    pub droplet: AppId,
    pub version: Version,
    pub indices: Vec<u32>,
    /// Running instance count per generation, as seen by the sender.
    pub running: BTreeMap<Version, u32>,
}

/// Request to stop specific instances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopInstances {
    pub droplet: AppId,
    /// Instance id to the generation it belongs to.
    pub instances: BTreeMap<String, Version>,
    pub running: BTreeMap<Version, u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdjustInstances {
    pub before: u32,
    pub after: u32,
}

/// A command from the health-signal subsystem, decoded once at the boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundCommand {
    Start(StartInstances),
    Stop(StopInstances),
    Adjust { app_id: AppId, counts: AdjustInstances },
    QueryAutoscaling { app_id: AppId },
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawStart {
    droplet: Option<String>,
    version: Option<String>,
    indices: Option<Vec<u32>>,
    running: Option<BTreeMap<String, u32>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawStop {
    droplet: Option<String>,
    instances: Option<BTreeMap<String, String>>,
    running: Option<BTreeMap<String, u32>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawAdjust {
    app_id: Option<String>,
    instances: Option<Vec<u32>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawAppQuery {
    app_id: Option<String>,
}

impl InboundCommand {
    /// Decode a payload received on one of the `hm.*` command subjects.
    pub fn decode(subject: &str, payload: &Value) -> Result<Self, MalformedMessage> {
        let hint = droplet_hint(payload);
        let missing = |field: &str| {
            MalformedMessage::new(subject, hint.clone(), format!("missing field `{field}`"))
        };

        match subject {
            subjects::HM_START => {
                let raw: RawStart = decode_raw(subject, payload, &hint)?;
                Ok(InboundCommand::Start(StartInstances {
                    droplet: raw.droplet.ok_or_else(|| missing("droplet"))?,
                    version: raw.version.ok_or_else(|| missing("version"))?,
                    indices: raw.indices.ok_or_else(|| missing("indices"))?,
                    running: raw.running.unwrap_or_default(),
                }))
            }
            subjects::HM_STOP => {
                let raw: RawStop = decode_raw(subject, payload, &hint)?;
                Ok(InboundCommand::Stop(StopInstances {
                    droplet: raw.droplet.ok_or_else(|| missing("droplet"))?,
                    instances: raw.instances.ok_or_else(|| missing("instances"))?,
                    running: raw.running.unwrap_or_default(),
                }))
            }
            subjects::HM_ADJUST => {
                let raw: RawAdjust = decode_raw(subject, payload, &hint)?;
                let app_id = raw.app_id.ok_or_else(|| missing("app_id"))?;
                match raw.instances.as_deref() {
                    Some(&[before, after]) => Ok(InboundCommand::Adjust {
                        app_id,
                        counts: AdjustInstances { before, after },
                    }),
                    Some(_) => Err(MalformedMessage::new(
                        subject,
                        Some(app_id),
                        "`instances` must be [before, after]",
                    )),
                    None => Err(missing("instances")),
                }
            }
            subjects::HM_AUTOSCALING_REQUEST => {
                let raw: RawAppQuery = decode_raw(subject, payload, &hint)?;
                Ok(InboundCommand::QueryAutoscaling {
                    app_id: raw.app_id.ok_or_else(|| missing("app_id"))?,
                })
            }
            other => Err(MalformedMessage::new(other, hint, "not a command subject")),
        }
    }

    /// The application this command is about.
    pub fn app_id(&self) -> &str {
        match self {
            InboundCommand::Start(start) => &start.droplet,
            InboundCommand::Stop(stop) => &stop.droplet,
            InboundCommand::Adjust { app_id, .. } | InboundCommand::QueryAutoscaling { app_id } => {
                app_id
            }
        }
    }
}

fn decode_raw<T: DeserializeOwned>(
    subject: &str,
    payload: &Value,
    hint: &Option<String>,
) -> Result<T, MalformedMessage> {
    from_payload(payload).map_err(|e| MalformedMessage::new(subject, hint.clone(), e.to_string()))
}

/// Best-effort application id from a payload that may not decode.
fn droplet_hint(payload: &Value) -> Option<String> {
    payload
        .get("droplet")
        .or_else(|| payload.get("app_id"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_start_with_defaulted_running() {
        let payload = json!({"droplet": "app-1", "version": "v1", "indices": [0, 2]});
        let command = InboundCommand::decode(subjects::HM_START, &payload).unwrap();

        let InboundCommand::Start(start) = command else {
            panic!("expected start");
        };
        assert_eq!(start.indices, vec![0, 2]);
        assert!(start.running.is_empty());
    }

    #[test]
    fn missing_version_names_the_droplet() {
        let payload = json!({"droplet": "app-1", "indices": [0]});
        let err = InboundCommand::decode(subjects::HM_START, &payload).unwrap_err();

        assert_eq!(err.droplet.as_deref(), Some("app-1"));
        assert!(err.reason.contains("version"));
    }

    #[test]
    fn wrong_type_is_malformed_not_a_panic() {
        let payload = json!({"droplet": "app-1", "version": "v1", "indices": "zero"});
        let err = InboundCommand::decode(subjects::HM_START, &payload).unwrap_err();
        assert_eq!(err.droplet.as_deref(), Some("app-1"));

        let err = InboundCommand::decode(subjects::HM_STOP, &json!("not an object")).unwrap_err();
        assert_eq!(err.droplet, None);
    }

    #[test]
    fn adjust_requires_exactly_two_counts() {
        let ok = InboundCommand::decode(
            subjects::HM_ADJUST,
            &json!({"app_id": "app-1", "instances": [3, 5]}),
        )
        .unwrap();
        assert_eq!(
            ok,
            InboundCommand::Adjust {
                app_id: "app-1".to_string(),
                counts: AdjustInstances { before: 3, after: 5 },
            }
        );

        let err = InboundCommand::decode(
            subjects::HM_ADJUST,
            &json!({"app_id": "app-1", "instances": [3]}),
        )
        .unwrap_err();
        assert_eq!(err.droplet.as_deref(), Some("app-1"));
    }

    #[test]
    fn stop_decodes_instance_versions() {
        let payload = json!({
            "droplet": "app-1",
            "instances": {"inst-a": "v1", "inst-b": "v2"},
            "running": {"v1": 2},
        });
        let command = InboundCommand::decode(subjects::HM_STOP, &payload).unwrap();
        assert_eq!(command.app_id(), "app-1");

        let InboundCommand::Stop(stop) = command else {
            panic!("expected stop");
        };
        assert_eq!(stop.instances.get("inst-b").map(String::as_str), Some("v2"));
        assert_eq!(stop.running.get("v1"), Some(&2));
    }

    #[test]
    fn stage_reply_is_tagged_by_status() {
        let reply: StageReply =
            from_payload(&json!({"status": "no_capacity", "message": "no stager with 1024MB"}))
                .unwrap();
        assert!(matches!(reply, StageReply::NoCapacity { .. }));

        let staged = to_payload(
            subjects::STAGER_STAGE,
            &StageReply::Staged(StagingResponse {
                instances_started: 2,
                ..Default::default()
            }),
        )
        .unwrap();
        assert_eq!(staged["status"], "staged");
        assert_eq!(staged["instances_started"], 2);
    }
}
