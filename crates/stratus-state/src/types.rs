//! Persisted ledger and node records.
//!
//! Neither record is ever deleted: both carry their own TTL and read as
//! expired once `ttl_secs` pass without a refresh.

use serde::{Deserialize, Serialize};

use stratus_core::{AppId, InstanceState, NodeId, ResourceUsage, Version};

// ── Ledger ─────────────────────────────────────────────────────────

/// Last-known liveness and usage of one (application, instance index) slot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerRecord {
    pub app_id: AppId,
    pub index: u32,
    /// Generation the reporting node is running for this slot.
    pub version: Version,
    pub instance_id: String,
    /// Compute node the instance lives on.
    pub node_id: NodeId,
    pub state: InstanceState,
    /// Latest usage snapshot from a stats query, if any arrived yet.
    pub usage: Option<ResourceUsage>,
    /// Unix timestamp of the last heartbeat or stats refresh.
    pub refreshed_at: u64,
    pub ttl_secs: u64,
}

impl LedgerRecord {
    /// Build the composite key for the ledger table.
    pub fn key(app_id: &str, index: u32) -> String {
        format!("{app_id}:{index}")
    }

    pub fn table_key(&self) -> String {
        Self::key(&self.app_id, self.index)
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now.saturating_sub(self.refreshed_at) > self.ttl_secs
    }

    /// State as seen at `now`: anything past its TTL reads as `Down`.
    pub fn effective_state(&self, now: u64) -> InstanceState {
        if self.is_expired(now) {
            InstanceState::Down
        } else {
            self.state
        }
    }
}

// ── Node ───────────────────────────────────────────────────────────

/// What the control plane knows about a compute node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeRecord {
    pub id: NodeId,
    /// Reported address; `None` until the node answers a "who are you" request.
    pub address: Option<String>,
    /// Reported software version.
    pub version: Option<String>,
    /// Unix timestamp of the last heartbeat or status report.
    pub last_seen: u64,
    pub ttl_secs: u64,
}

impl NodeRecord {
    pub fn is_expired(&self, now: u64) -> bool {
        now.saturating_sub(self.last_seen) > self.ttl_secs
    }

    /// Whether the node has identified itself yet.
    pub fn is_identified(&self) -> bool {
        self.address.is_some()
    }
}
