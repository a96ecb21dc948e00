//! Durable at-least-once work item queue, stored in its own redb database.
//!
//! # Table design
//!
//! `ITEMS` is keyed by a monotonically increasing `u64` id, so key order is
//! enqueue order. Each value is a JSON `QueuedItem` carrying the envelope,
//! delivery attempts and, while a consumer holds it, an in-flight claim with
//! a receipt and a visibility deadline.
//!
//! Dequeue hands out the oldest deliverable item whose actor id has no
//! earlier item still in flight or delayed. Items for one actor id therefore
//! leave the queue in FIFO order, one at a time, even with many consumers.
//! An in-flight claim whose deadline passes is redelivered; nothing is
//! removed until `ack`.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::actor::ActorId;
use crate::error::{FlowError, Result};

const ITEMS: TableDefinition<u64, &[u8]> = TableDefinition::new("queue_items");
const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("queue_counters");

const NEXT_ID: &str = "next_id";
const TOTAL_ENQUEUED: &str = "total_enqueued";
const TOTAL_ACKED: &str = "total_acked";

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemType {
    /// Apply a build to the subscription's target branch.
    SubscriptionUpdate,
    /// Re-run the merge policy check on the actor's open PR.
    PullRequestCheck,
}

/// Wire envelope consumed by the dispatcher. `payload` is opaque here and
/// decoded by the actor according to `work_item_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    #[serde(rename = "actorId")]
    pub actor_id: String,
    #[serde(rename = "workItemType")]
    pub work_item_type: WorkItemType,
    #[serde(rename = "payload")]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionUpdate {
    pub subscription_id: Uuid,
    pub build_id: u64,
}

impl WorkItem {
    pub fn subscription_update(actor: &ActorId, build_id: u64) -> Result<Self> {
        let payload = SubscriptionUpdate {
            subscription_id: actor.subscription_id,
            build_id,
        };
        Ok(Self {
            actor_id: actor.to_string(),
            work_item_type: WorkItemType::SubscriptionUpdate,
            payload: serde_json::to_value(&payload)?,
        })
    }

    pub fn pull_request_check(actor: &ActorId) -> Self {
        Self {
            actor_id: actor.to_string(),
            work_item_type: WorkItemType::PullRequestCheck,
            payload: serde_json::json!({}),
        }
    }

    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

// ---------------------------------------------------------------------------
// Stored records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Claim {
    receipt: String,
    consumer: String,
    deadline: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueuedItem {
    id: u64,
    item: WorkItem,
    enqueued_at: DateTime<Utc>,
    attempts: u32,
    visible_at: DateTime<Utc>,
    #[serde(default)]
    claim: Option<Claim>,
}

impl QueuedItem {
    fn in_flight(&self, now: DateTime<Utc>) -> bool {
        self.claim.as_ref().is_some_and(|c| c.deadline > now)
    }

    fn deliverable(&self, now: DateTime<Utc>) -> bool {
        !self.in_flight(now) && self.visible_at <= now
    }
}

/// One handed-out item. `receipt` is the ack/nack handle.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub id: u64,
    pub item: WorkItem,
    pub receipt: String,
    /// 1 on first delivery, incremented on every redelivery.
    pub attempt: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub ready: u64,
    pub in_flight: u64,
    pub delayed: u64,
    pub total_enqueued: u64,
    pub total_acked: u64,
}

// ---------------------------------------------------------------------------
// WorkQueue
// ---------------------------------------------------------------------------

pub struct WorkQueue {
    db: Database,
}

impl WorkQueue {
    /// Open or create the queue database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;
        let wt = db.begin_write()?;
        wt.open_table(ITEMS)?;
        wt.open_table(COUNTERS)?;
        wt.commit()?;
        Ok(Self { db })
    }

    pub fn enqueue(&self, item: WorkItem) -> Result<u64> {
        let now = Utc::now();
        let wt = self.db.begin_write()?;
        let id = {
            let mut counters = wt.open_table(COUNTERS)?;
            let id = counters.get(NEXT_ID)?.map(|g| g.value()).unwrap_or(1);
            counters.insert(NEXT_ID, id + 1)?;
            let total = counters.get(TOTAL_ENQUEUED)?.map(|g| g.value()).unwrap_or(0);
            counters.insert(TOTAL_ENQUEUED, total + 1)?;

            let record = QueuedItem {
                id,
                item,
                enqueued_at: now,
                attempts: 0,
                visible_at: now,
                claim: None,
            };
            let value = serde_json::to_vec(&record)?;
            let mut items = wt.open_table(ITEMS)?;
            items.insert(id, value.as_slice())?;
            debug!(id, actor = %record.item.actor_id, "enqueued work item");
            id
        };
        wt.commit()?;
        Ok(id)
    }

    /// Claim the next deliverable item for `consumer` for `visibility`.
    pub fn dequeue(&self, consumer: &str, visibility: Duration) -> Result<Option<Delivery>> {
        let now = Utc::now();
        let visibility = chrono::Duration::from_std(visibility)
            .map_err(|e| FlowError::Store(format!("visibility timeout out of range: {e}")))?;

        let wt = self.db.begin_write()?;
        let delivery = {
            let mut items = wt.open_table(ITEMS)?;
            let all = load_all(&items)?;

            let mut blocked: HashSet<String> = HashSet::new();
            let mut chosen = None;
            for queued in all {
                if blocked.contains(&queued.item.actor_id) {
                    continue;
                }
                if queued.deliverable(now) {
                    chosen = Some(queued);
                    break;
                }
                blocked.insert(queued.item.actor_id.clone());
            }

            match chosen {
                None => None,
                Some(mut queued) => {
                    if queued.claim.is_some() {
                        info!(id = queued.id, actor = %queued.item.actor_id, "redelivering expired work item");
                    }
                    let receipt = Uuid::new_v4().to_string();
                    queued.attempts += 1;
                    queued.claim = Some(Claim {
                        receipt: receipt.clone(),
                        consumer: consumer.to_string(),
                        deadline: now + visibility,
                    });
                    let value = serde_json::to_vec(&queued)?;
                    items.insert(queued.id, value.as_slice())?;
                    Some(Delivery {
                        id: queued.id,
                        item: queued.item,
                        receipt,
                        attempt: queued.attempts,
                    })
                }
            }
        };
        wt.commit()?;
        Ok(delivery)
    }

    /// Remove a delivered item. Fails if the claim expired and the item was
    /// handed to someone else in the meantime.
    pub fn ack(&self, receipt: &str) -> Result<()> {
        let wt = self.db.begin_write()?;
        {
            let mut items = wt.open_table(ITEMS)?;
            let queued = find_by_receipt(&items, receipt)?
                .ok_or_else(|| FlowError::StaleReceipt(receipt.to_string()))?;
            items.remove(queued.id)?;

            let mut counters = wt.open_table(COUNTERS)?;
            let total = counters.get(TOTAL_ACKED)?.map(|g| g.value()).unwrap_or(0);
            counters.insert(TOTAL_ACKED, total + 1)?;
        }
        wt.commit()?;
        Ok(())
    }

    /// Return a delivered item to the queue, optionally hidden for `delay`.
    pub fn nack(&self, receipt: &str, delay: Option<Duration>) -> Result<()> {
        let now = Utc::now();
        let delay = match delay {
            Some(d) => chrono::Duration::from_std(d)
                .map_err(|e| FlowError::Store(format!("nack delay out of range: {e}")))?,
            None => chrono::Duration::zero(),
        };
        let wt = self.db.begin_write()?;
        {
            let mut items = wt.open_table(ITEMS)?;
            let mut queued = find_by_receipt(&items, receipt)?
                .ok_or_else(|| FlowError::StaleReceipt(receipt.to_string()))?;
            queued.claim = None;
            queued.visible_at = now + delay;
            let value = serde_json::to_vec(&queued)?;
            items.insert(queued.id, value.as_slice())?;
        }
        wt.commit()?;
        Ok(())
    }

    pub fn stats(&self) -> Result<QueueStats> {
        let now = Utc::now();
        let rt = self.db.begin_read()?;
        let items = rt.open_table(ITEMS)?;
        let counters = rt.open_table(COUNTERS)?;

        let mut stats = QueueStats {
            total_enqueued: counters.get(TOTAL_ENQUEUED)?.map(|g| g.value()).unwrap_or(0),
            total_acked: counters.get(TOTAL_ACKED)?.map(|g| g.value()).unwrap_or(0),
            ..Default::default()
        };
        for queued in load_all(&items)? {
            if queued.in_flight(now) {
                stats.in_flight += 1;
            } else if queued.visible_at > now {
                stats.delayed += 1;
            } else {
                stats.ready += 1;
            }
        }
        Ok(stats)
    }

    /// Every item still in the queue, in enqueue order.
    pub fn pending(&self) -> Result<Vec<WorkItem>> {
        let rt = self.db.begin_read()?;
        let items = rt.open_table(ITEMS)?;
        Ok(load_all(&items)?.into_iter().map(|q| q.item).collect())
    }
}

fn load_all(table: &impl ReadableTable<u64, &'static [u8]>) -> Result<Vec<QueuedItem>> {
    let mut result = Vec::new();
    for entry in table.iter()? {
        let (_, v) = entry?;
        result.push(serde_json::from_slice(v.value())?);
    }
    Ok(result)
}

fn find_by_receipt(
    table: &impl ReadableTable<u64, &'static [u8]>,
    receipt: &str,
) -> Result<Option<QueuedItem>> {
    Ok(load_all(table)?
        .into_iter()
        .find(|q| q.claim.as_ref().is_some_and(|c| c.receipt == receipt)))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
