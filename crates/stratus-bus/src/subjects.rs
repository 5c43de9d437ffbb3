//! Subject names used on the bus.

// Inbound from compute nodes.
pub const NODE_HEARTBEAT: &str = "node.heartbeat";
pub const NODE_STATUS_RESPONSE: &str = "node.status.response";

// Outbound to compute nodes.
pub const NODE_LOCATE: &str = "node.locate";
pub const NODE_START: &str = "node.start";
pub const NODE_STOP: &str = "node.stop";
pub const NODE_SCALE: &str = "node.scale";

/// Point-to-point "who are you" request for one node.
pub fn node_status(node_id: &str) -> String {
    format!("node.status.{node_id}")
}

/// Point-to-point stats query for one node.
pub fn node_stats(node_id: &str) -> String {
    format!("node.stats.{node_id}")
}

// Health-signal subsystem: queries and notifications.
pub const HM_HEALTH: &str = "hm.health";
pub const HM_STATUS: &str = "hm.status";
pub const HM_AUTOSCALING_UPDATE: &str = "hm.autoscaling.update";
pub const HM_LIVE_VERSION: &str = "hm.live_version";

// Health-signal subsystem: inbound commands.
pub const HM_START: &str = "hm.start";
pub const HM_STOP: &str = "hm.stop";
pub const HM_ADJUST: &str = "hm.adjust";
pub const HM_AUTOSCALING_REQUEST: &str = "hm.autoscaling.request";

// Application broadcasts.
pub const APP_UPDATED: &str = "app.updated";
pub const APP_EVENT: &str = "app.event";

pub const AUTOSCALE_SCALE_UP: &str = "autoscale.scale_up";

pub const STAGER_STAGE: &str = "stager.stage";
pub const ROUTER_UPDATE: &str = "router.update";
pub const BLOBSTORE_DELETE: &str = "blobstore.delete";

/// Prefix of the private reply subjects created for each request.
pub const INBOX_PREFIX: &str = "_INBOX";
