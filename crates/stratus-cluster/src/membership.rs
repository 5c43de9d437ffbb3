//! Node registry: what the control plane knows about compute nodes.
//!
//! Nodes are never registered explicitly. A node becomes known the first
//! time it heartbeats; the registry then sends it a point-to-point
//! "who are you" request to learn its address and version. Records are
//! never deleted and read as expired once the ledger TTL passes.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, info, warn};

use stratus_bus::{Bus, NodeStatus, RequestOptions, from_payload, subjects};
use stratus_core::{Clock, LedgerConfig};
use stratus_state::{NodeRecord, StateResult, StateStore};

/// Tracks compute nodes in the state store.
#[derive(Clone)]
pub struct NodeRegistry {
    store: StateStore,
    bus: Arc<dyn Bus>,
    clock: Arc<dyn Clock>,
    ttl_secs: u64,
    identify_timeout: Duration,
}

impl NodeRegistry {
    pub fn new(
        store: StateStore,
        bus: Arc<dyn Bus>,
        clock: Arc<dyn Clock>,
        config: &LedgerConfig,
    ) -> Self {
        Self {
            store,
            bus,
            clock,
            ttl_secs: config.ttl_secs,
            identify_timeout: config.identify_timeout(),
        }
    }

    /// Refresh a node's last-seen time.
    ///
    /// Returns `true` when the node was not known before.
    pub fn touch(&self, node_id: &str) -> StateResult<bool> {
        let now = self.clock.now_secs();
        let mut unseen = false;
        self.store.upsert_node(node_id, |current| match current {
            Some(mut node) => {
                node.last_seen = now;
                node.ttl_secs = self.ttl_secs;
                node
            }
            None => {
                unseen = true;
                NodeRecord {
                    id: node_id.to_string(),
                    address: None,
                    version: None,
                    last_seen: now,
                    ttl_secs: self.ttl_secs,
                }
            }
        })?;
        Ok(unseen)
    }

    /// Record a node's self-description.
    pub fn ingest_node_status(&self, status: &NodeStatus) -> StateResult<NodeRecord> {
        let now = self.clock.now_secs();
        let record = self.store.upsert_node(&status.node_id, |_| NodeRecord {
            id: status.node_id.clone(),
            address: Some(status.address.clone()),
            version: Some(status.version.clone()),
            last_seen: now,
            ttl_secs: self.ttl_secs,
        })?;
        debug!(node_id = %status.node_id, address = %status.address, "node identified");
        Ok(record)
    }

    /// Ask one node who it is. Returns whether it answered in time.
    pub async fn identify(&self, node_id: &str) -> bool {
        let replies = match self
            .bus
            .request(
                &subjects::node_status(node_id),
                json!({}),
                RequestOptions::single(self.identify_timeout),
            )
            .await
        {
            Ok(replies) => replies,
            Err(e) => {
                warn!(%node_id, error = %e, "node identify request failed");
                return false;
            }
        };

        let Some(reply) = replies.first() else {
            debug!(%node_id, "node identify request unanswered");
            return false;
        };
        match from_payload::<NodeStatus>(reply) {
            Ok(status) => match self.ingest_node_status(&status) {
                Ok(_) => true,
                Err(e) => {
                    debug!(%node_id, error = %e, "failed to record node status");
                    false
                }
            },
            Err(e) => {
                warn!(%node_id, error = %e, "malformed node status reply");
                false
            }
        }
    }

    /// Ask every node to announce itself on `node.status.response`.
    pub async fn locate(&self) {
        match self.bus.publish(subjects::NODE_LOCATE, json!({})).await {
            Ok(()) => info!("node locate broadcast sent"),
            Err(e) => warn!(error = %e, "node locate broadcast failed"),
        }
    }

    pub fn get(&self, node_id: &str) -> StateResult<Option<NodeRecord>> {
        self.store.get_node(node_id)
    }

    /// Nodes heard from within the TTL.
    pub fn live_nodes(&self) -> StateResult<Vec<NodeRecord>> {
        let now = self.clock.now_secs();
        let nodes = self.store.list_nodes()?;
        Ok(nodes.into_iter().filter(|n| !n.is_expired(now)).collect())
    }
}
