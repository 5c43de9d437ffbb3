//! Stats sweep: periodic usage refresh for every known instance.
//!
//! Each cycle sends one point-to-point stats query per live ledger key to
//! the node holding it, all concurrently, each with its own timeout. A node
//! that does not answer is simply skipped until the next cycle; once its
//! records expire they are no longer queried.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use stratus_bus::{Bus, RequestOptions, StatsReply, StatsRequest, from_payload, subjects, to_payload};
use stratus_core::LedgerConfig;
use stratus_state::LedgerRecord;

use crate::ledger::InstanceLedger;

/// Outcome of one sweep cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub queried: usize,
    pub refreshed: usize,
}

pub struct StatsSweep {
    ledger: InstanceLedger,
    bus: Arc<dyn Bus>,
    interval: Duration,
    timeout: Duration,
}

impl StatsSweep {
    pub fn new(ledger: InstanceLedger, bus: Arc<dyn Bus>, config: &LedgerConfig) -> Self {
        Self {
            ledger,
            bus,
            interval: config.sweep_interval(),
            timeout: config.stats_timeout(),
        }
    }

    /// Query every live instance once and merge what comes back.
    pub async fn sweep_once(&self) -> SweepReport {
        let records = self.ledger.live_records();
        let mut report = SweepReport {
            queried: records.len(),
            refreshed: 0,
        };

        let mut queries = JoinSet::new();
        for record in records {
            let bus = self.bus.clone();
            let timeout = self.timeout;
            queries.spawn(async move {
                let reply = query_stats(bus.as_ref(), &record, timeout).await;
                (record, reply)
            });
        }

        while let Some(joined) = queries.join_next().await {
            match joined {
                Ok((record, Some(reply))) => {
                    if self.ledger.merge_stats(&record, &reply).is_some() {
                        report.refreshed += 1;
                    }
                }
                Ok((_, None)) => {}
                Err(e) => warn!(error = %e, "stats query task failed"),
            }
        }

        debug!(queried = report.queried, refreshed = report.refreshed, "stats sweep finished");
        report
    }

    /// Sweep on a fixed interval until shutdown. Cycles never overlap.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "stats sweep started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    self.sweep_once().await;
                }
                _ = shutdown.changed() => {
                    info!("stats sweep shutting down");
                    break;
                }
            }
        }
    }
}

async fn query_stats(bus: &dyn Bus, record: &LedgerRecord, timeout: Duration) -> Option<StatsReply> {
    let subject = subjects::node_stats(&record.node_id);
    let request = StatsRequest {
        app_id: record.app_id.clone(),
        index: record.index,
        instance_id: record.instance_id.clone(),
    };
    let payload = match to_payload(&subject, &request) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "failed to encode stats request");
            return None;
        }
    };

    let replies = match bus.request(&subject, payload, RequestOptions::single(timeout)).await {
        Ok(replies) => replies,
        Err(e) => {
            debug!(node_id = %record.node_id, error = %e, "stats query failed");
            return None;
        }
    };

    let reply = replies.first()?;
    match from_payload::<StatsReply>(reply) {
        Ok(stats) => Some(stats),
        Err(e) => {
            warn!(node_id = %record.node_id, error = %e, "malformed stats reply");
            None
        }
    }
}
