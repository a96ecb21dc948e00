//! Queue consumers: pull work items, resolve their actor, and run it under
//! the actor's lease.
//!
//! Two layers keep a single actor from running twice at once. The queue
//! never hands out a second item for an actor id while an earlier one is
//! in flight, and the store lease covers the case where a claim expired
//! and the queue redelivered the item to another worker while the first
//! one is still running.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::actor::{ActorId, ActorOutcome, ActorSettings, PullRequestActor};
use crate::error::{FlowError, Result};
use crate::history::{HistoryDraft, HistoryRecorder, ACTION_DISPATCH};
use crate::host::SourceControlHost;
use crate::queue::{Delivery, WorkQueue};
use crate::store::{blocking, FlowStore};

// ---------------------------------------------------------------------------
// ActorFactory
// ---------------------------------------------------------------------------

/// Maps a parsed actor id to a ready-to-run actor.
#[derive(Clone)]
pub struct ActorFactory {
    store: Arc<FlowStore>,
    host: Arc<dyn SourceControlHost>,
    settings: ActorSettings,
}

impl ActorFactory {
    pub fn new(
        store: Arc<FlowStore>,
        host: Arc<dyn SourceControlHost>,
        settings: ActorSettings,
    ) -> Self {
        Self {
            store,
            host,
            settings,
        }
    }

    pub fn create(&self, id: ActorId) -> PullRequestActor {
        PullRequestActor::new(
            id,
            self.store.clone(),
            self.host.clone(),
            self.settings.clone(),
        )
    }

    pub fn settings(&self) -> &ActorSettings {
        &self.settings
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    pub workers: usize,
    pub poll_interval: Duration,
    pub visibility_timeout: Duration,
    pub lease_ttl: Duration,
    pub nack_delay: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval: Duration::from_millis(500),
            visibility_timeout: Duration::from_secs(300),
            lease_ttl: Duration::from_secs(600),
            nack_delay: Duration::from_secs(2),
        }
    }
}

/// What one `process_next` call did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Dispatched {
    /// Nothing deliverable.
    Idle,
    Processed { actor: ActorId, outcome: ActorOutcome },
    /// Another worker holds the actor's lease; the item was put back.
    Deferred { actor: ActorId },
    /// The actor id did not parse; recorded and dropped.
    Rejected { actor_id: String },
}

pub struct Dispatcher {
    store: Arc<FlowStore>,
    queue: Arc<WorkQueue>,
    factory: ActorFactory,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        store: Arc<FlowStore>,
        queue: Arc<WorkQueue>,
        factory: ActorFactory,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            queue,
            factory,
            config,
        }
    }

    /// Dequeue and fully handle at most one item as `consumer`.
    pub async fn process_next(
        &self,
        consumer: &str,
        cancel: &CancellationToken,
    ) -> Result<Dispatched> {
        let queue = self.queue.clone();
        let (name, visibility) = (consumer.to_string(), self.config.visibility_timeout);
        let Some(delivery) = blocking(move || queue.dequeue(&name, visibility)).await? else {
            return Ok(Dispatched::Idle);
        };

        let actor: ActorId = match delivery.item.actor_id.parse() {
            Ok(id) => id,
            Err(e) => return self.reject(&delivery, e).await,
        };
        debug!(consumer, actor = %actor, attempt = delivery.attempt, "dispatching work item");

        let store = self.store.clone();
        let (key, owner, ttl) = (
            delivery.item.actor_id.clone(),
            consumer.to_string(),
            self.config.lease_ttl,
        );
        let acquired = blocking(move || store.try_acquire_lease(&key, &owner, ttl)).await;
        let lease = match acquired {
            Ok(lease) => lease,
            Err(FlowError::LeaseHeld { owner, .. }) => {
                warn!(actor = %actor, %owner, "actor busy; deferring work item");
                self.nack(&delivery).await?;
                return Ok(Dispatched::Deferred { actor });
            }
            Err(e) => {
                self.nack(&delivery).await?;
                return Err(e);
            }
        };

        let result = self
            .factory
            .create(actor.clone())
            .process(&lease, &delivery.item, cancel)
            .await;
        let store = self.store.clone();
        if let Err(e) = blocking(move || store.release_lease(&lease)).await {
            warn!(actor = %actor, error = %e, "failed to release lease; it will expire");
        }

        match result {
            Ok(outcome) => {
                self.ack(&delivery).await?;
                Ok(Dispatched::Processed { actor, outcome })
            }
            Err(e) => {
                error!(actor = %actor, error = %e, "work item outcome not recorded; returning to queue");
                self.nack(&delivery).await?;
                Err(e)
            }
        }
    }

    /// Start `config.workers` consumer loops. They stop when `cancel` fires.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        (0..self.config.workers)
            .map(|i| {
                let dispatcher = self.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    dispatcher.run_worker(format!("worker-{i}"), cancel).await;
                })
            })
            .collect()
    }

    async fn run_worker(&self, consumer: String, cancel: CancellationToken) {
        info!(%consumer, "worker started");
        while !cancel.is_cancelled() {
            let idle = match self.process_next(&consumer, &cancel).await {
                Ok(Dispatched::Idle) | Ok(Dispatched::Deferred { .. }) => true,
                Ok(_) => false,
                Err(e) => {
                    warn!(%consumer, error = %e, "dispatch failed");
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }
        info!(%consumer, "worker stopped");
    }

    async fn nack(&self, delivery: &Delivery) -> Result<()> {
        let queue = self.queue.clone();
        let (receipt, delay) = (delivery.receipt.clone(), self.config.nack_delay);
        blocking(move || queue.nack(&receipt, Some(delay))).await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let queue = self.queue.clone();
        let receipt = delivery.receipt.clone();
        match blocking(move || queue.ack(&receipt)).await {
            Err(FlowError::StaleReceipt(_)) => {
                // The claim expired mid-run; the redelivered copy will
                // coalesce into a no-op.
                warn!(id = delivery.id, "claim expired before ack; item will be redelivered");
                Ok(())
            }
            other => other,
        }
    }

    async fn reject(&self, delivery: &Delivery, cause: FlowError) -> Result<Dispatched> {
        warn!(actor_id = %delivery.item.actor_id, error = %cause, "dropping work item with malformed actor id");
        let record = HistoryDraft {
            subscription_id: None,
            repository: String::new(),
            branch: String::new(),
            action: ACTION_DISPATCH,
        }
        .failure(
            &self.factory.settings().public_url,
            cause.kind(),
            cause.to_string(),
            None,
        );
        let store = self.store.clone();
        blocking(move || store.record(&record)).await?;
        self.ack(delivery).await?;
        Ok(Dispatched::Rejected {
            actor_id: delivery.item.actor_id.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
