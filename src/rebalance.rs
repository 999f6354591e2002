//! Rebalance workers: one transient task per shard on the move.
//!
//! A worker drives the three-party handoff protocol: `BeginHandOff` to
//! every known region and proxy (each forgets the shard location, so new
//! traffic buffers), then `HandOff` to the owner (its shard drains and
//! stops). Both phases are bounded by the handoff timeout; the coordinator
//! hears `RebalanceDone` in every case and deallocates only on success.

use crate::coordinator::CoordinatorMsg;
use crate::error::HandoffError;
use crate::region::{HandoffReply, RegionMsg, RegionRef};
use crate::types::{RegionId, ShardId};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc;

/// Everything a worker needs to relocate one shard.
pub(crate) struct RebalancePlan {
    pub shard: ShardId,
    /// Current owner, target of the `HandOff`.
    pub from: RegionRef,
    /// Every registered region and proxy, owner included.
    pub regions: Vec<RegionRef>,
    pub timeout: Duration,
}

/// Spawn a worker for one shard. Reports back to the coordinator and
/// terminates; it holds no state worth supervising.
pub(crate) fn spawn_worker(plan: RebalancePlan, done: mpsc::UnboundedSender<CoordinatorMsg>) {
    tokio::spawn(async move {
        let shard = plan.shard.clone();
        let result = run(plan).await;
        let ok = match result {
            Ok(()) => {
                tracing::info!(shard_id = %shard, "Shard handed off");
                true
            }
            Err(e) => {
                tracing::warn!(shard_id = %shard, error = %e, "Rebalance failed, will retry later");
                false
            }
        };
        let _ = done.send(CoordinatorMsg::RebalanceDone { shard, ok });
    });
}

async fn run(plan: RebalancePlan) -> Result<(), HandoffError> {
    let deadline = tokio::time::Instant::now() + plan.timeout;

    // Phase one: every reachable region forgets the shard location.
    let (ack_tx, mut ack_rx) = mpsc::unbounded_channel();
    let mut awaiting: HashSet<RegionId> = HashSet::new();
    for region in &plan.regions {
        let sent = region.send(RegionMsg::BeginHandOff {
            shard: plan.shard.clone(),
            reply: ack_tx.clone(),
        });
        // A region that died since registration can never ack; the
        // coordinator is about to learn of it independently.
        if sent {
            awaiting.insert(region.id());
        }
    }
    while !awaiting.is_empty() {
        match tokio::time::timeout_at(deadline, ack_rx.recv()).await {
            Ok(Some(HandoffReply::BeginAck { region })) => {
                awaiting.remove(&region);
            }
            Ok(Some(HandoffReply::Stopped)) | Ok(None) => {}
            Err(_) => return Err(HandoffError::BeginTimeout(plan.shard.clone())),
        }
    }

    // Phase two: the owner drains and stops its shard.
    let (stop_tx, mut stop_rx) = mpsc::unbounded_channel();
    if !plan.from.send(RegionMsg::HandOff {
        shard: plan.shard.clone(),
        reply: stop_tx,
    }) {
        return Err(HandoffError::StopTimeout(plan.shard.clone()));
    }
    loop {
        match tokio::time::timeout_at(deadline, stop_rx.recv()).await {
            Ok(Some(HandoffReply::Stopped)) => return Ok(()),
            Ok(Some(HandoffReply::BeginAck { .. })) => {}
            Ok(None) | Err(_) => return Err(HandoffError::StopTimeout(plan.shard.clone())),
        }
    }
}
