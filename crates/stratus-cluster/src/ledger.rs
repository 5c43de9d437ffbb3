//! Instance ledger: last-known liveness and usage per instance slot.
//!
//! Fed by compute-node heartbeats and by the stats sweep. Records are keyed
//! by (application, index), refreshed last-write-wins, and never deleted;
//! a record past its TTL reads as `DOWN`. Store failures on this path
//! degrade to "no data" instead of surfacing to callers.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use stratus_bus::{
    Bus, BusResult, Envelope, Heartbeat, NodeStatus, StatsReply, boxed_handler, from_payload,
    spawn_handler, subjects,
};
use stratus_core::{Application, Clock, InstanceState, LedgerConfig, NodeId, ResourceUsage};
use stratus_state::{LedgerRecord, StateStore};

use crate::membership::NodeRegistry;

/// One desired instance slot as seen by the ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceSlot {
    pub state: InstanceState,
    pub usage: Option<ResourceUsage>,
    pub instance_id: Option<String>,
    pub node_id: Option<NodeId>,
}

impl InstanceSlot {
    fn down() -> Self {
        Self {
            state: InstanceState::Down,
            usage: None,
            instance_id: None,
            node_id: None,
        }
    }
}

/// Accounting store for instance liveness.
#[derive(Clone)]
pub struct InstanceLedger {
    store: StateStore,
    nodes: NodeRegistry,
    clock: Arc<dyn Clock>,
    ttl_secs: u64,
}

impl InstanceLedger {
    pub fn new(
        store: StateStore,
        nodes: NodeRegistry,
        clock: Arc<dyn Clock>,
        config: &LedgerConfig,
    ) -> Self {
        Self {
            store,
            nodes,
            clock,
            ttl_secs: config.ttl_secs,
        }
    }

    pub fn nodes(&self) -> &NodeRegistry {
        &self.nodes
    }

    /// Record every instance a node reports and refresh its TTL.
    ///
    /// An unseen node gets a background "who are you" request. Returns the
    /// number of records written.
    pub fn ingest_heartbeat(&self, heartbeat: &Heartbeat) -> usize {
        let node_id = &heartbeat.node_id;
        match self.nodes.touch(node_id) {
            Ok(true) => {
                debug!(%node_id, "heartbeat from unseen node, probing");
                let nodes = self.nodes.clone();
                let node_id = node_id.clone();
                tokio::spawn(async move {
                    nodes.identify(&node_id).await;
                });
            }
            Ok(false) => {}
            Err(e) => debug!(%node_id, error = %e, "failed to record node"),
        }

        let now = self.clock.now_secs();
        let mut written = 0;
        for instance in &heartbeat.instances {
            let key = LedgerRecord::key(&instance.app_id, instance.index);
            let result = self.store.upsert_ledger_record(&key, |current| {
                // Usage only carries over while the same instance holds the slot.
                let usage = current
                    .filter(|r| r.instance_id == instance.instance_id)
                    .and_then(|r| r.usage);
                LedgerRecord {
                    app_id: instance.app_id.clone(),
                    index: instance.index,
                    version: instance.version.clone(),
                    instance_id: instance.instance_id.clone(),
                    node_id: node_id.clone(),
                    state: instance.state,
                    usage,
                    refreshed_at: now,
                    ttl_secs: self.ttl_secs,
                }
            });
            match result {
                Ok(_) => written += 1,
                Err(e) => debug!(%key, error = %e, "failed to record heartbeat instance"),
            }
        }
        debug!(%node_id, instances = written, "heartbeat ingested");
        written
    }

    /// Merge a stats reply into the record it was requested for.
    pub fn merge_stats(&self, requested: &LedgerRecord, reply: &StatsReply) -> Option<LedgerRecord> {
        if reply.app_id != requested.app_id || reply.index != requested.index {
            warn!(
                app_id = %requested.app_id,
                index = requested.index,
                reply_app_id = %reply.app_id,
                reply_index = reply.index,
                "stats reply for a different instance"
            );
            return None;
        }

        let now = self.clock.now_secs();
        let result = self
            .store
            .upsert_ledger_record(&requested.table_key(), |current| {
                let mut record = current.unwrap_or_else(|| requested.clone());
                record.state = reply.state;
                record.usage = Some(reply.usage);
                record.refreshed_at = now;
                record.ttl_secs = self.ttl_secs;
                record
            });
        match result {
            Ok(record) => Some(record),
            Err(e) => {
                debug!(key = %requested.table_key(), error = %e, "failed to merge stats");
                None
            }
        }
    }

    /// Every record the ledger knows, expired or not.
    pub fn known_records(&self) -> Vec<LedgerRecord> {
        self.store.list_ledger_records().unwrap_or_else(|e| {
            debug!(error = %e, "ledger unavailable, treating as empty");
            Vec::new()
        })
    }

    /// Records still within their TTL. Expired keys from dead nodes or
    /// deleted applications stay in the ledger but are not worth querying.
    pub fn live_records(&self) -> Vec<LedgerRecord> {
        let now = self.clock.now_secs();
        let mut records = self.known_records();
        records.retain(|record| !record.is_expired(now));
        records
    }

    /// One slot per desired index `0..instances`.
    ///
    /// Indices with no live record read as `DOWN`; records outside the
    /// desired range are ignored.
    pub fn get_instance_states(&self, app: &Application) -> BTreeMap<u32, InstanceSlot> {
        let mut slots: BTreeMap<u32, InstanceSlot> =
            (0..app.instances).map(|i| (i, InstanceSlot::down())).collect();

        let records = match self.store.list_ledger_for_app(&app.id) {
            Ok(records) => records,
            Err(e) => {
                debug!(app_id = %app.id, error = %e, "ledger unavailable, reporting all down");
                return slots;
            }
        };

        let now = self.clock.now_secs();
        for record in records {
            let Some(slot) = slots.get_mut(&record.index) else {
                continue;
            };
            if record.is_expired(now) {
                continue;
            }
            *slot = InstanceSlot {
                state: record.state,
                usage: record.usage,
                instance_id: Some(record.instance_id),
                node_id: Some(record.node_id),
            };
        }
        slots
    }

    /// Subscribe to heartbeats and node status announcements.
    pub async fn subscribe(
        &self,
        bus: &dyn Bus,
        shutdown: watch::Receiver<bool>,
    ) -> BusResult<Vec<JoinHandle<()>>> {
        let ledger = self.clone();
        let heartbeats = spawn_handler(
            bus.subscribe(subjects::NODE_HEARTBEAT).await?,
            boxed_handler(move |envelope: Envelope| {
                let ledger = ledger.clone();
                async move {
                    match from_payload::<Heartbeat>(&envelope.payload) {
                        Ok(heartbeat) => {
                            ledger.ingest_heartbeat(&heartbeat);
                        }
                        Err(e) => warn!(error = %e, "dropping malformed heartbeat"),
                    }
                }
            }),
            shutdown.clone(),
        );

        let nodes = self.nodes.clone();
        let statuses = spawn_handler(
            bus.subscribe(subjects::NODE_STATUS_RESPONSE).await?,
            boxed_handler(move |envelope: Envelope| {
                let nodes = nodes.clone();
                async move {
                    match from_payload::<NodeStatus>(&envelope.payload) {
                        Ok(status) => {
                            if let Err(e) = nodes.ingest_node_status(&status) {
                                debug!(node_id = %status.node_id, error = %e, "failed to record node status");
                            }
                        }
                        Err(e) => warn!(error = %e, "dropping malformed node status"),
                    }
                }
            }),
            shutdown,
        );

        Ok(vec![heartbeats, statuses])
    }
}
