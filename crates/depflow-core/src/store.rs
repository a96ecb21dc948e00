//! Durable store for channels, builds, subscriptions, actor state, leases
//! and history, backed by redb.
//!
//! # Table design
//!
//! Entities live in one table each, keyed by their id, with JSON values.
//! Two tables use composite big-endian keys so that byte order is the scan
//! order the queries need:
//!
//! ```text
//! BUILD_CHANNELS  [ channel_id: u64 BE | build_id: u64 BE ]      (16 bytes)
//! HISTORY         [ timestamp_ms: u64 BE | record uuid: 16 bytes ] (24 bytes)
//! ```
//!
//! A range over one channel prefix lists every build assigned to it; a
//! reverse iteration over `HISTORY` yields newest first.
//!
//! Actor state is written only under a lease. Every fenced write checks that
//! the caller's token is still the one stored for that actor, inside the
//! same write transaction as the mutation.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::actor::{PrActorState, StateChange};
use crate::error::{FlowError, Result};
use crate::history::{HistoryQuery, HistoryRecord, HistoryRecorder};
use crate::model::{Build, BuildChannel, Channel, RepositoryInstallation, Subscription};

// ---------------------------------------------------------------------------
// Table definitions
// ---------------------------------------------------------------------------

/// Id counters.
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");
const CHANNELS: TableDefinition<u64, &[u8]> = TableDefinition::new("channels");
const BUILDS: TableDefinition<u64, &[u8]> = TableDefinition::new("builds");
const BUILD_CHANNELS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("build_channels");
/// Key: subscription uuid as u128.
const SUBSCRIPTIONS: TableDefinition<u128, &[u8]> = TableDefinition::new("subscriptions");
/// Key: target repository name.
const INSTALLATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("installations");
/// Key: actor id string.
const PR_STATES: TableDefinition<&str, &[u8]> = TableDefinition::new("pr_states");
/// Key: actor id string.
const LEASES: TableDefinition<&str, &[u8]> = TableDefinition::new("leases");
const HISTORY: TableDefinition<&[u8], &[u8]> = TableDefinition::new("history");

const NEXT_CHANNEL: &str = "channel";
const NEXT_BUILD: &str = "build";
const NEXT_LEASE_TOKEN: &str = "lease_token";

// ---------------------------------------------------------------------------
// Key helpers
// ---------------------------------------------------------------------------

fn build_channel_key(channel_id: u64, build_id: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&channel_id.to_be_bytes());
    key[8..].copy_from_slice(&build_id.to_be_bytes());
    key
}

fn history_key(ts: DateTime<Utc>, id: Uuid) -> [u8; 24] {
    let mut key = [0u8; 24];
    let ms = ts.timestamp_millis().max(0) as u64;
    key[..8].copy_from_slice(&ms.to_be_bytes());
    key[8..].copy_from_slice(id.as_bytes());
    key
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

fn next_counter(meta: &mut redb::Table<'_, &'static str, u64>, name: &str) -> Result<u64> {
    let next = meta.get(name)?.map(|g| g.value()).unwrap_or(0) + 1;
    meta.insert(name, next)?;
    Ok(next)
}

fn to_chrono(d: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(d).map_err(|e| FlowError::Store(format!("duration out of range: {e}")))
}

/// Run synchronous store or queue work on tokio's blocking pool.
///
/// Every redb write commits with an fsync, so async callers must not make
/// these calls on a runtime worker thread.
pub async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| FlowError::Store(format!("blocking task join error: {e}")))?
}

// ---------------------------------------------------------------------------
// Lease
// ---------------------------------------------------------------------------

/// Single-owner claim on one actor id.
///
/// `token` increases on every acquisition across the whole store, so a
/// holder whose lease expired and was taken over can never pass the fence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub actor_id: String,
    pub owner: String,
    pub token: u64,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

fn check_fence(
    leases: &impl ReadableTable<&'static str, &'static [u8]>,
    lease: &Lease,
) -> Result<()> {
    let current: Option<Lease> = match leases.get(lease.actor_id.as_str())? {
        Some(v) => Some(decode(v.value())?),
        None => None,
    };
    match current {
        Some(c) if c.token == lease.token => Ok(()),
        _ => Err(FlowError::LeaseLost {
            actor: lease.actor_id.clone(),
            token: lease.token,
        }),
    }
}

/// Subscription advance requested by a successful merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Advance {
    pub subscription_id: Uuid,
    pub build_id: u64,
}

// ---------------------------------------------------------------------------
// FlowStore
// ---------------------------------------------------------------------------

pub struct FlowStore {
    db: Database,
}

impl FlowStore {
    /// Open or create the store at `path`, creating every table.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;
        let wt = db.begin_write()?;
        wt.open_table(META)?;
        wt.open_table(CHANNELS)?;
        wt.open_table(BUILDS)?;
        wt.open_table(BUILD_CHANNELS)?;
        wt.open_table(SUBSCRIPTIONS)?;
        wt.open_table(INSTALLATIONS)?;
        wt.open_table(PR_STATES)?;
        wt.open_table(LEASES)?;
        wt.open_table(HISTORY)?;
        wt.commit()?;
        Ok(Self { db })
    }

    // -- channels ----------------------------------------------------------

    pub fn add_channel(&self, mut channel: Channel) -> Result<Channel> {
        let wt = self.db.begin_write()?;
        {
            let mut meta = wt.open_table(META)?;
            channel.id = next_counter(&mut meta, NEXT_CHANNEL)?;
            let value = serde_json::to_vec(&channel)?;
            let mut table = wt.open_table(CHANNELS)?;
            table.insert(channel.id, value.as_slice())?;
        }
        wt.commit()?;
        Ok(channel)
    }

    pub fn get_channel(&self, id: u64) -> Result<Channel> {
        let rt = self.db.begin_read()?;
        let table = rt.open_table(CHANNELS)?;
        let guard = table.get(id)?.ok_or(FlowError::ChannelNotFound(id))?;
        decode(guard.value())
    }

    pub fn list_channels(&self) -> Result<Vec<Channel>> {
        let rt = self.db.begin_read()?;
        let table = rt.open_table(CHANNELS)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (_, v) = entry?;
            result.push(decode(v.value())?);
        }
        Ok(result)
    }

    // -- builds ------------------------------------------------------------

    pub fn add_build(&self, mut build: Build) -> Result<Build> {
        let wt = self.db.begin_write()?;
        {
            let mut meta = wt.open_table(META)?;
            build.id = next_counter(&mut meta, NEXT_BUILD)?;
            let value = serde_json::to_vec(&build)?;
            let mut table = wt.open_table(BUILDS)?;
            table.insert(build.id, value.as_slice())?;
        }
        wt.commit()?;
        debug!(build_id = build.id, repo = %build.repository, "stored build");
        Ok(build)
    }

    pub fn get_build(&self, id: u64) -> Result<Build> {
        let rt = self.db.begin_read()?;
        let table = rt.open_table(BUILDS)?;
        let guard = table.get(id)?.ok_or(FlowError::BuildNotFound(id))?;
        decode(guard.value())
    }

    pub fn list_builds(&self) -> Result<Vec<Build>> {
        let rt = self.db.begin_read()?;
        let table = rt.open_table(BUILDS)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (_, v) = entry?;
            result.push(decode(v.value())?);
        }
        Ok(result)
    }

    /// Record that `build_id` was published to `channel_id`. Re-assigning is
    /// a no-op that returns the original association.
    pub fn assign_build_to_channel(&self, build_id: u64, channel_id: u64) -> Result<BuildChannel> {
        let key = build_channel_key(channel_id, build_id);
        let wt = self.db.begin_write()?;
        let assignment = {
            if wt.open_table(BUILDS)?.get(build_id)?.is_none() {
                return Err(FlowError::BuildNotFound(build_id));
            }
            if wt.open_table(CHANNELS)?.get(channel_id)?.is_none() {
                return Err(FlowError::ChannelNotFound(channel_id));
            }
            let mut table = wt.open_table(BUILD_CHANNELS)?;
            let existing: Option<BuildChannel> = match table.get(key.as_slice())? {
                Some(v) => Some(decode(v.value())?),
                None => None,
            };
            match existing {
                Some(bc) => bc,
                None => {
                    let bc = BuildChannel {
                        build_id,
                        channel_id,
                        assigned_at: Utc::now(),
                    };
                    let value = serde_json::to_vec(&bc)?;
                    table.insert(key.as_slice(), value.as_slice())?;
                    bc
                }
            }
        };
        wt.commit()?;
        Ok(assignment)
    }

    pub fn is_build_on_channel(&self, build_id: u64, channel_id: u64) -> Result<bool> {
        let key = build_channel_key(channel_id, build_id);
        let rt = self.db.begin_read()?;
        let table = rt.open_table(BUILD_CHANNELS)?;
        Ok(table.get(key.as_slice())?.is_some())
    }

    /// Most recent build of `repository` on `channel_id` with at least one
    /// shipping asset, produced strictly after `newer_than` and no later than
    /// `up_to`.
    pub fn latest_eligible_build(
        &self,
        channel_id: u64,
        repository: &str,
        newer_than: Option<DateTime<Utc>>,
        up_to: DateTime<Utc>,
    ) -> Result<Option<Build>> {
        let lower = build_channel_key(channel_id, 0);
        let upper = build_channel_key(channel_id, u64::MAX);
        let rt = self.db.begin_read()?;
        let assignments = rt.open_table(BUILD_CHANNELS)?;
        let builds = rt.open_table(BUILDS)?;

        let mut best: Option<Build> = None;
        for entry in assignments.range(lower.as_slice()..=upper.as_slice())? {
            let (_, v) = entry?;
            let bc: BuildChannel = decode(v.value())?;
            let Some(guard) = builds.get(bc.build_id)? else {
                continue;
            };
            let build: Build = decode(guard.value())?;
            if build.repository != repository || !build.has_shipping_assets() {
                continue;
            }
            if build.produced_at > up_to {
                continue;
            }
            if let Some(floor) = newer_than {
                if build.produced_at <= floor {
                    continue;
                }
            }
            let newer = match &best {
                None => true,
                Some(b) => (build.produced_at, build.id) > (b.produced_at, b.id),
            };
            if newer {
                best = Some(build);
            }
        }
        Ok(best)
    }

    // -- subscriptions -----------------------------------------------------

    pub fn add_subscription(&self, sub: Subscription) -> Result<Subscription> {
        let wt = self.db.begin_write()?;
        {
            if wt.open_table(CHANNELS)?.get(sub.channel_id)?.is_none() {
                return Err(FlowError::ChannelNotFound(sub.channel_id));
            }
            let value = serde_json::to_vec(&sub)?;
            let mut table = wt.open_table(SUBSCRIPTIONS)?;
            table.insert(sub.id.as_u128(), value.as_slice())?;
        }
        wt.commit()?;
        info!(subscription = %sub.id, target = %sub.target_repository, branch = %sub.target_branch, "added subscription");
        Ok(sub)
    }

    pub fn get_subscription(&self, id: Uuid) -> Result<Subscription> {
        let rt = self.db.begin_read()?;
        let table = rt.open_table(SUBSCRIPTIONS)?;
        let guard = table
            .get(id.as_u128())?
            .ok_or_else(|| FlowError::SubscriptionNotFound(id.to_string()))?;
        decode(guard.value())
    }

    /// `None` when the subscription has been deleted.
    pub fn find_subscription(&self, id: Uuid) -> Result<Option<Subscription>> {
        match self.get_subscription(id) {
            Ok(sub) => Ok(Some(sub)),
            Err(FlowError::SubscriptionNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn list_subscriptions(&self) -> Result<Vec<Subscription>> {
        let rt = self.db.begin_read()?;
        let table = rt.open_table(SUBSCRIPTIONS)?;
        let mut result: Vec<Subscription> = Vec::new();
        for entry in table.iter()? {
            let (_, v) = entry?;
            result.push(decode(v.value())?);
        }
        result.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(result)
    }

    pub fn set_subscription_enabled(&self, id: Uuid, enabled: bool) -> Result<Subscription> {
        let wt = self.db.begin_write()?;
        let sub = {
            let mut table = wt.open_table(SUBSCRIPTIONS)?;
            let mut sub: Subscription = match table.get(id.as_u128())? {
                Some(v) => decode(v.value())?,
                None => return Err(FlowError::SubscriptionNotFound(id.to_string())),
            };
            sub.enabled = enabled;
            let value = serde_json::to_vec(&sub)?;
            table.insert(id.as_u128(), value.as_slice())?;
            sub
        };
        wt.commit()?;
        Ok(sub)
    }

    pub fn delete_subscription(&self, id: Uuid) -> Result<()> {
        let wt = self.db.begin_write()?;
        {
            let mut table = wt.open_table(SUBSCRIPTIONS)?;
            if table.remove(id.as_u128())?.is_none() {
                return Err(FlowError::SubscriptionNotFound(id.to_string()));
            }
        }
        wt.commit()?;
        Ok(())
    }

    // -- installations -----------------------------------------------------

    pub fn put_installation(&self, installation: &RepositoryInstallation) -> Result<()> {
        let value = serde_json::to_vec(installation)?;
        let wt = self.db.begin_write()?;
        {
            let mut table = wt.open_table(INSTALLATIONS)?;
            table.insert(installation.repository_name.as_str(), value.as_slice())?;
        }
        wt.commit()?;
        Ok(())
    }

    pub fn get_installation(&self, repository: &str) -> Result<Option<RepositoryInstallation>> {
        let rt = self.db.begin_read()?;
        let table = rt.open_table(INSTALLATIONS)?;
        match table.get(repository)? {
            Some(v) => Ok(Some(decode(v.value())?)),
            None => Ok(None),
        }
    }

    pub fn list_installations(&self) -> Result<Vec<RepositoryInstallation>> {
        let rt = self.db.begin_read()?;
        let table = rt.open_table(INSTALLATIONS)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (_, v) = entry?;
            result.push(decode(v.value())?);
        }
        Ok(result)
    }

    // -- leases ------------------------------------------------------------

    /// Claim `actor_id` for `owner` until `ttl` from now. Fails with
    /// `LeaseHeld` while another unexpired lease exists.
    pub fn try_acquire_lease(&self, actor_id: &str, owner: &str, ttl: Duration) -> Result<Lease> {
        let now = Utc::now();
        let ttl = to_chrono(ttl)?;
        let wt = self.db.begin_write()?;
        let lease = {
            let mut leases = wt.open_table(LEASES)?;
            let current: Option<Lease> = match leases.get(actor_id)? {
                Some(v) => Some(decode(v.value())?),
                None => None,
            };
            if let Some(held) = current {
                if !held.is_expired(now) {
                    return Err(FlowError::LeaseHeld {
                        actor: actor_id.to_string(),
                        owner: held.owner,
                    });
                }
                warn!(actor = %actor_id, previous_owner = %held.owner, "taking over expired lease");
            }
            let mut meta = wt.open_table(META)?;
            let lease = Lease {
                actor_id: actor_id.to_string(),
                owner: owner.to_string(),
                token: next_counter(&mut meta, NEXT_LEASE_TOKEN)?,
                expires_at: now + ttl,
            };
            let value = serde_json::to_vec(&lease)?;
            leases.insert(actor_id, value.as_slice())?;
            lease
        };
        wt.commit()?;
        Ok(lease)
    }

    /// Drop the lease if it is still ours. Releasing a superseded lease is a
    /// no-op.
    pub fn release_lease(&self, lease: &Lease) -> Result<()> {
        let wt = self.db.begin_write()?;
        {
            let mut leases = wt.open_table(LEASES)?;
            if check_fence(&leases, lease).is_ok() {
                leases.remove(lease.actor_id.as_str())?;
            } else {
                debug!(actor = %lease.actor_id, token = lease.token, "lease already superseded");
            }
        }
        wt.commit()?;
        Ok(())
    }

    pub fn current_lease(&self, actor_id: &str) -> Result<Option<Lease>> {
        let rt = self.db.begin_read()?;
        let table = rt.open_table(LEASES)?;
        match table.get(actor_id)? {
            Some(v) => Ok(Some(decode(v.value())?)),
            None => Ok(None),
        }
    }

    // -- actor state -------------------------------------------------------

    pub fn get_pr_state(&self, actor_id: &str) -> Result<Option<PrActorState>> {
        let rt = self.db.begin_read()?;
        let table = rt.open_table(PR_STATES)?;
        match table.get(actor_id)? {
            Some(v) => Ok(Some(decode(v.value())?)),
            None => Ok(None),
        }
    }

    pub fn list_pr_states(&self) -> Result<Vec<PrActorState>> {
        let rt = self.db.begin_read()?;
        let table = rt.open_table(PR_STATES)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (_, v) = entry?;
            result.push(decode(v.value())?);
        }
        Ok(result)
    }

    /// Persist an intermediate state while holding `lease`.
    pub fn save_pr_state(&self, lease: &Lease, state: &PrActorState) -> Result<()> {
        let value = serde_json::to_vec(state)?;
        let wt = self.db.begin_write()?;
        {
            let leases = wt.open_table(LEASES)?;
            check_fence(&leases, lease)?;
            let mut table = wt.open_table(PR_STATES)?;
            table.insert(lease.actor_id.as_str(), value.as_slice())?;
        }
        wt.commit()?;
        Ok(())
    }

    /// Apply the terminal writes of one work item atomically: the actor
    /// state change, the optional subscription advance and its history
    /// record.
    ///
    /// The advance only happens if the candidate build is at least as new
    /// as the current last-applied build. Returns whether it happened.
    pub fn commit_outcome(
        &self,
        lease: &Lease,
        change: StateChange,
        advance: Option<Advance>,
        record: &HistoryRecord,
    ) -> Result<bool> {
        let wt = self.db.begin_write()?;
        let advanced = {
            let leases = wt.open_table(LEASES)?;
            check_fence(&leases, lease)?;

            let mut states = wt.open_table(PR_STATES)?;
            match change {
                StateChange::Keep => {}
                StateChange::Put(state) => {
                    let value = serde_json::to_vec(&state)?;
                    states.insert(lease.actor_id.as_str(), value.as_slice())?;
                }
                StateChange::Clear => {
                    states.remove(lease.actor_id.as_str())?;
                }
            }

            let advanced = match advance {
                Some(a) => advance_subscription(&wt, a)?,
                None => false,
            };

            let mut history = wt.open_table(HISTORY)?;
            let key = history_key(record.item.timestamp(), record.id);
            let value = serde_json::to_vec(record)?;
            history.insert(key.as_slice(), value.as_slice())?;
            advanced
        };
        wt.commit()?;
        Ok(advanced)
    }

    /// Move actors stuck mid-run without a live lease to `Failed`.
    ///
    /// Their work item is still unacked in the queue and will be redelivered.
    /// Returns the number of actors recovered.
    pub fn recover_stuck_actors(&self) -> Result<u32> {
        let now = Utc::now();
        let wt = self.db.begin_write()?;
        let count = {
            let leases = wt.open_table(LEASES)?;
            let mut states = wt.open_table(PR_STATES)?;

            let mut stuck = Vec::new();
            for entry in states.iter()? {
                let (_, v) = entry?;
                let state: PrActorState = decode(v.value())?;
                if state.status.is_in_flight() {
                    stuck.push(state);
                }
            }

            let mut count = 0u32;
            for mut state in stuck {
                let live = match leases.get(state.actor_id.as_str())? {
                    Some(v) => !decode::<Lease>(v.value())?.is_expired(now),
                    None => false,
                };
                if live {
                    continue;
                }
                let was = state.status;
                state.fail(format!("recovered from restart while {was}"));
                let value = serde_json::to_vec(&state)?;
                states.insert(state.actor_id.as_str(), value.as_slice())?;
                info!(actor = %state.actor_id, status = %was, "recovered stuck actor");
                count += 1;
            }
            count
        };
        wt.commit()?;
        Ok(count)
    }

    // -- history -----------------------------------------------------------

    /// Matching records, newest first.
    pub fn list_history(&self, query: &HistoryQuery) -> Result<Vec<HistoryRecord>> {
        let rt = self.db.begin_read()?;
        let table = rt.open_table(HISTORY)?;
        let limit = query.limit.unwrap_or(usize::MAX);
        let mut result = Vec::new();
        for entry in table.iter()?.rev() {
            if result.len() >= limit {
                break;
            }
            let (_, v) = entry?;
            let record: HistoryRecord = decode(v.value())?;
            if query.matches(&record) {
                result.push(record);
            }
        }
        Ok(result)
    }

    pub fn get_history(&self, id: Uuid) -> Result<HistoryRecord> {
        let rt = self.db.begin_read()?;
        let table = rt.open_table(HISTORY)?;
        for entry in table.iter()? {
            let (k, v) = entry?;
            if k.value().len() == 24 && k.value()[8..] == *id.as_bytes() {
                return decode(v.value());
            }
        }
        Err(FlowError::HistoryNotFound(id.to_string()))
    }
}

fn advance_subscription(wt: &redb::WriteTransaction, advance: Advance) -> Result<bool> {
    let builds = wt.open_table(BUILDS)?;
    let candidate: Build = match builds.get(advance.build_id)? {
        Some(v) => decode(v.value())?,
        None => return Err(FlowError::BuildNotFound(advance.build_id)),
    };

    let mut subs = wt.open_table(SUBSCRIPTIONS)?;
    let mut sub: Subscription = match subs.get(advance.subscription_id.as_u128())? {
        Some(v) => decode(v.value())?,
        // Deleted while the PR was in flight; nothing left to advance.
        None => return Ok(false),
    };

    if let Some(current_id) = sub.last_applied_build_id {
        if current_id == candidate.id {
            return Ok(false);
        }
        if let Some(v) = builds.get(current_id)? {
            let current: Build = decode(v.value())?;
            if candidate.produced_at < current.produced_at {
                warn!(
                    subscription = %sub.id,
                    current = current.id,
                    candidate = candidate.id,
                    "refusing to move last-applied build backwards"
                );
                return Ok(false);
            }
        }
    }

    sub.last_applied_build_id = Some(candidate.id);
    let value = serde_json::to_vec(&sub)?;
    subs.insert(advance.subscription_id.as_u128(), value.as_slice())?;
    Ok(true)
}

impl HistoryRecorder for FlowStore {
    fn record(&self, record: &HistoryRecord) -> Result<()> {
        let key = history_key(record.item.timestamp(), record.id);
        let value = serde_json::to_vec(record)?;
        let wt = self.db.begin_write()?;
        {
            let mut table = wt.open_table(HISTORY)?;
            table.insert(key.as_slice(), value.as_slice())?;
        }
        wt.commit()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{ActorId, ActorStatus};
    use crate::history::{HistoryDraft, ACTION_UPDATE_ASSETS};
    use crate::model::{Asset, SubscriptionPolicy};
    use crate::types::UpdateFrequency;
    use chrono::Duration as CDur;
    use tempfile::TempDir;

    fn open_tmp() -> (TempDir, FlowStore) {
        let dir = TempDir::new().unwrap();
        let store = FlowStore::open(&dir.path().join("flow.redb")).unwrap();
        (dir, store)
    }

    fn build_at(store: &FlowStore, channel: u64, ts: DateTime<Utc>, shipping: bool) -> Build {
        let asset = if shipping {
            Asset::shipping("Pkg.A", "1.0.0")
        } else {
            Asset::non_shipping("Pkg.A", "1.0.0")
        };
        let build = store
            .add_build(Build::new("source.repo", "main", "1", "sha", ts).with_asset(asset))
            .unwrap();
        store.assign_build_to_channel(build.id, channel).unwrap();
        build
    }

    fn subscription(store: &FlowStore, channel: u64) -> Subscription {
        store
            .add_subscription(Subscription::new(
                channel,
                "source.repo",
                "target.repo",
                "main",
                SubscriptionPolicy::new(UpdateFrequency::EveryDay),
            ))
            .unwrap()
    }

    fn record() -> HistoryRecord {
        HistoryDraft {
            subscription_id: None,
            repository: "target.repo".into(),
            branch: "main".into(),
            action: ACTION_UPDATE_ASSETS,
        }
        .success(None)
    }

    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn ids_are_assigned_sequentially() {
        let (_dir, store) = open_tmp();
        let a = store.add_channel(Channel::new("a", "product")).unwrap();
        let b = store.add_channel(Channel::new("b", "product")).unwrap();
        assert_eq!((a.id, b.id), (1, 2));
        assert_eq!(store.get_channel(2).unwrap().name, "b");
        assert!(matches!(
            store.get_channel(9),
            Err(FlowError::ChannelNotFound(9))
        ));
    }

    #[test]
    fn assignment_requires_existing_build_and_channel() {
        let (_dir, store) = open_tmp();
        let ch = store.add_channel(Channel::new("c", "product")).unwrap();
        assert!(matches!(
            store.assign_build_to_channel(42, ch.id),
            Err(FlowError::BuildNotFound(42))
        ));
    }

    #[test]
    fn latest_eligible_build_skips_non_shipping_and_old_builds() {
        let (_dir, store) = open_tmp();
        let ch = store.add_channel(Channel::new("c", "product")).unwrap();
        let now = Utc::now();
        let old = build_at(&store, ch.id, now - CDur::hours(3), true);
        let shipping = build_at(&store, ch.id, now - CDur::hours(2), true);
        let _non_shipping = build_at(&store, ch.id, now - CDur::hours(1), false);

        let latest = store
            .latest_eligible_build(ch.id, "source.repo", None, now)
            .unwrap()
            .unwrap();
        assert_eq!(latest.id, shipping.id);

        let none = store
            .latest_eligible_build(ch.id, "source.repo", Some(shipping.produced_at), now)
            .unwrap();
        assert!(none.is_none());

        let older = store
            .latest_eligible_build(ch.id, "source.repo", None, old.produced_at)
            .unwrap()
            .unwrap();
        assert_eq!(older.id, old.id);
    }

    #[test]
    fn latest_eligible_build_ignores_other_channels_and_repos() {
        let (_dir, store) = open_tmp();
        let ch = store.add_channel(Channel::new("c", "product")).unwrap();
        let other = store.add_channel(Channel::new("d", "product")).unwrap();
        build_at(&store, other.id, Utc::now(), true);
        assert!(store
            .latest_eligible_build(ch.id, "source.repo", None, Utc::now())
            .unwrap()
            .is_none());
        assert!(store
            .latest_eligible_build(other.id, "elsewhere", None, Utc::now())
            .unwrap()
            .is_none());
    }

    #[test]
    fn lease_is_exclusive_until_released() {
        let (_dir, store) = open_tmp();
        let lease = store.try_acquire_lease("actor", "w1", TTL).unwrap();
        let err = store.try_acquire_lease("actor", "w2", TTL).unwrap_err();
        assert!(matches!(err, FlowError::LeaseHeld { ref owner, .. } if owner == "w1"));

        store.release_lease(&lease).unwrap();
        let next = store.try_acquire_lease("actor", "w2", TTL).unwrap();
        assert!(next.token > lease.token);
    }

    #[test]
    fn expired_lease_is_taken_over_and_old_holder_is_fenced() {
        let (_dir, store) = open_tmp();
        let id = ActorId::new(Uuid::new_v4(), "main");
        let stale = store
            .try_acquire_lease(&id.to_string(), "w1", Duration::from_millis(1))
            .unwrap();
        std::thread::sleep(Duration::from_millis(10));
        let fresh = store.try_acquire_lease(&id.to_string(), "w2", TTL).unwrap();
        assert!(fresh.token > stale.token);

        let err = store
            .save_pr_state(&stale, &PrActorState::new(&id))
            .unwrap_err();
        assert!(matches!(err, FlowError::LeaseLost { .. }));
        store.save_pr_state(&fresh, &PrActorState::new(&id)).unwrap();

        // Releasing the superseded lease leaves the new one in place.
        store.release_lease(&stale).unwrap();
        assert_eq!(
            store.current_lease(&id.to_string()).unwrap().unwrap().token,
            fresh.token
        );
    }

    #[test]
    fn commit_outcome_advances_only_forward() {
        let (_dir, store) = open_tmp();
        let ch = store.add_channel(Channel::new("c", "product")).unwrap();
        let now = Utc::now();
        let older = build_at(&store, ch.id, now - CDur::hours(2), true);
        let newer = build_at(&store, ch.id, now - CDur::hours(1), true);
        let sub = subscription(&store, ch.id);
        let lease = store
            .try_acquire_lease(&sub.actor_id().to_string(), "w1", TTL)
            .unwrap();

        let advanced = store
            .commit_outcome(
                &lease,
                StateChange::Clear,
                Some(Advance { subscription_id: sub.id, build_id: newer.id }),
                &record(),
            )
            .unwrap();
        assert!(advanced);

        let advanced = store
            .commit_outcome(
                &lease,
                StateChange::Clear,
                Some(Advance { subscription_id: sub.id, build_id: older.id }),
                &record(),
            )
            .unwrap();
        assert!(!advanced);
        assert_eq!(
            store.get_subscription(sub.id).unwrap().last_applied_build_id,
            Some(newer.id)
        );
        assert_eq!(store.list_history(&HistoryQuery::default()).unwrap().len(), 2);
    }

    #[test]
    fn fenced_commit_writes_nothing() {
        let (_dir, store) = open_tmp();
        let id = ActorId::new(Uuid::new_v4(), "main");
        let lease = store.try_acquire_lease(&id.to_string(), "w1", TTL).unwrap();
        store.release_lease(&lease).unwrap();

        let err = store
            .commit_outcome(
                &lease,
                StateChange::Put(PrActorState::new(&id)),
                None,
                &record(),
            )
            .unwrap_err();
        assert!(matches!(err, FlowError::LeaseLost { .. }));
        assert!(store.get_pr_state(&id.to_string()).unwrap().is_none());
        assert!(store.list_history(&HistoryQuery::default()).unwrap().is_empty());
    }

    #[test]
    fn recover_stuck_actors_fails_in_flight_without_lease() {
        let (_dir, store) = open_tmp();
        let id = ActorId::new(Uuid::new_v4(), "main");
        let lease = store
            .try_acquire_lease(&id.to_string(), "w1", Duration::from_millis(1))
            .unwrap();
        let mut state = PrActorState::new(&id);
        state.transition(ActorStatus::Updating);
        store.save_pr_state(&lease, &state).unwrap();
        std::thread::sleep(Duration::from_millis(10));

        assert_eq!(store.recover_stuck_actors().unwrap(), 1);
        let state = store.get_pr_state(&id.to_string()).unwrap().unwrap();
        assert_eq!(state.status, ActorStatus::Failed);
        assert!(state.last_error.unwrap().contains("recovered"));
        assert_eq!(store.recover_stuck_actors().unwrap(), 0);
    }

    #[test]
    fn recover_stuck_actors_leaves_live_lease_alone() {
        let (_dir, store) = open_tmp();
        let id = ActorId::new(Uuid::new_v4(), "main");
        let lease = store.try_acquire_lease(&id.to_string(), "w1", TTL).unwrap();
        let mut state = PrActorState::new(&id);
        state.transition(ActorStatus::PolicyCheck);
        store.save_pr_state(&lease, &state).unwrap();
        assert_eq!(store.recover_stuck_actors().unwrap(), 0);
    }

    #[test]
    fn history_is_newest_first_and_limited() {
        let (_dir, store) = open_tmp();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let r = record();
            ids.push(r.id);
            store.record(&r).unwrap();
            std::thread::sleep(Duration::from_millis(2));
        }
        let q = HistoryQuery {
            limit: Some(2),
            ..Default::default()
        };
        let listed = store.list_history(&q).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, ids[2]);
        assert_eq!(listed[1].id, ids[1]);

        assert_eq!(store.get_history(ids[0]).unwrap().id, ids[0]);
        assert!(matches!(
            store.get_history(Uuid::new_v4()),
            Err(FlowError::HistoryNotFound(_))
        ));
    }

    #[test]
    fn subscription_enable_toggle_and_delete() {
        let (_dir, store) = open_tmp();
        let ch = store.add_channel(Channel::new("c", "product")).unwrap();
        let sub = subscription(&store, ch.id);
        assert!(!store.set_subscription_enabled(sub.id, false).unwrap().enabled);
        store.delete_subscription(sub.id).unwrap();
        assert!(store.find_subscription(sub.id).unwrap().is_none());
        assert!(matches!(
            store.delete_subscription(sub.id),
            Err(FlowError::SubscriptionNotFound(_))
        ));
    }
}
