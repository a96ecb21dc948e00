//! Decides which subscriptions are due for an update and enqueues one work
//! item per due subscription.
//!
//! The engine only reads from the store. It never advances a subscription
//! or touches actor state, and it never retries: a missed trigger is
//! picked up by the next one.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::actor::ActorId;
use crate::error::{FlowError, Result};
use crate::queue::{WorkItem, WorkQueue};
use crate::store::FlowStore;
use crate::types::UpdateFrequency;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// `build_id` was published to `channel_id`.
    NewBuild { build_id: u64, channel_id: u64 },
    /// Periodic sweep of every subscription with `frequency`, considering
    /// builds produced up to `at`.
    Sweep {
        at: DateTime<Utc>,
        frequency: UpdateFrequency,
    },
}

/// One subscription that should receive `build_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DueUpdate {
    pub subscription_id: Uuid,
    pub actor_id: ActorId,
    pub build_id: u64,
}

pub struct TriggerEngine {
    store: Arc<FlowStore>,
}

impl TriggerEngine {
    pub fn new(store: Arc<FlowStore>) -> Self {
        Self { store }
    }

    pub fn evaluate_due_subscriptions(&self, trigger: &Trigger) -> Result<Vec<DueUpdate>> {
        match trigger {
            Trigger::NewBuild {
                build_id,
                channel_id,
            } => self.due_for_new_build(*build_id, *channel_id),
            Trigger::Sweep { at, frequency } => self.due_for_sweep(*at, *frequency),
        }
    }

    /// Evaluate `trigger` and enqueue one work item per due subscription.
    pub fn fire(&self, trigger: &Trigger, queue: &WorkQueue) -> Result<Vec<DueUpdate>> {
        let due = self.evaluate_due_subscriptions(trigger)?;
        for update in &due {
            let item = WorkItem::subscription_update(&update.actor_id, update.build_id)?;
            let id = queue.enqueue(item)?;
            info!(
                queue_id = id,
                actor = %update.actor_id,
                build_id = update.build_id,
                "enqueued subscription update"
            );
        }
        Ok(due)
    }

    fn due_for_new_build(&self, build_id: u64, channel_id: u64) -> Result<Vec<DueUpdate>> {
        let build = self.store.get_build(build_id)?;
        self.store.get_channel(channel_id)?;
        if !self.store.is_build_on_channel(build_id, channel_id)? {
            return Err(FlowError::InvalidTrigger(format!(
                "build {build_id} is not assigned to channel {channel_id}"
            )));
        }
        if !build.has_shipping_assets() {
            debug!(build_id, "build has no shipping assets; nothing to trigger");
            return Ok(Vec::new());
        }

        let due = self
            .store
            .list_subscriptions()?
            .into_iter()
            .filter(|s| {
                s.enabled
                    && s.channel_id == channel_id
                    && s.source_repository == build.repository
                    && s.policy.update_frequency == UpdateFrequency::EveryBuild
            })
            .map(|s| DueUpdate {
                subscription_id: s.id,
                actor_id: s.actor_id(),
                build_id,
            })
            .collect();
        Ok(due)
    }

    fn due_for_sweep(&self, at: DateTime<Utc>, frequency: UpdateFrequency) -> Result<Vec<DueUpdate>> {
        if !frequency.is_periodic() {
            return Err(FlowError::InvalidTrigger(format!(
                "'{frequency}' is not a periodic update frequency"
            )));
        }

        let mut due = Vec::new();
        for sub in self.store.list_subscriptions()? {
            if !sub.enabled || sub.policy.update_frequency != frequency {
                continue;
            }
            let applied_at = match sub.last_applied_build_id {
                Some(id) => Some(self.store.get_build(id)?.produced_at),
                None => None,
            };
            let latest = self.store.latest_eligible_build(
                sub.channel_id,
                &sub.source_repository,
                applied_at,
                at,
            )?;
            if let Some(build) = latest {
                due.push(DueUpdate {
                    subscription_id: sub.id,
                    actor_id: sub.actor_id(),
                    build_id: build.id,
                });
            }
        }
        Ok(due)
    }
}

/// Fire a `Sweep` for `frequency` every `period` until cancelled. The first
/// sweep runs immediately.
pub async fn run_periodic_sweeps(
    engine: Arc<TriggerEngine>,
    queue: Arc<WorkQueue>,
    frequency: UpdateFrequency,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    info!(%frequency, period_secs = period.as_secs(), "periodic sweep started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(%frequency, "periodic sweep shutting down");
                break;
            }
            _ = ticker.tick() => {
                let trigger = Trigger::Sweep { at: Utc::now(), frequency };
                let engine = engine.clone();
                let queue = queue.clone();
                let fired =
                    tokio::task::spawn_blocking(move || engine.fire(&trigger, &queue)).await;
                match fired {
                    Ok(Ok(due)) => info!(%frequency, enqueued = due.len(), "sweep completed"),
                    Ok(Err(e)) => warn!(%frequency, error = %e, "sweep failed"),
                    Err(e) => warn!(%frequency, error = %e, "sweep task panicked"),
                }
            }
        }
    }
}
