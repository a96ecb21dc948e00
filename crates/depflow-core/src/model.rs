//! Stored entities: channels, builds, assets, subscriptions, installations.
//!
//! Relationships are id-based foreign keys (`channel_id`, `build_id`,
//! `last_applied_build_id`); nothing here holds another entity in memory.

use crate::actor::ActorId;
use crate::policy::MergePolicy;
use crate::types::{LocationType, UpdateFrequency};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    /// Assigned by the store on insert.
    pub id: u64,
    pub name: String,
    pub classification: String,
}

impl Channel {
    pub fn new(name: impl Into<String>, classification: impl Into<String>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            classification: classification.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Build / Asset
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetLocation {
    pub location: String,
    #[serde(rename = "type")]
    pub location_type: LocationType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub non_shipping: bool,
    #[serde(default)]
    pub locations: Vec<AssetLocation>,
}

impl Asset {
    pub fn shipping(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            non_shipping: false,
            locations: Vec::new(),
        }
    }

    pub fn non_shipping(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            non_shipping: true,
            ..Self::shipping(name, version)
        }
    }

    pub fn with_location(mut self, location: impl Into<String>, ty: LocationType) -> Self {
        self.locations.push(AssetLocation {
            location: location.into(),
            location_type: ty,
        });
        self
    }
}

/// Immutable snapshot of one CI run. Never rewritten after insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    /// Assigned by the store on insert.
    pub id: u64,
    pub repository: String,
    pub branch: String,
    pub build_number: String,
    pub commit: String,
    pub produced_at: DateTime<Utc>,
    #[serde(default)]
    pub assets: Vec<Asset>,
}

impl Build {
    pub fn new(
        repository: impl Into<String>,
        branch: impl Into<String>,
        build_number: impl Into<String>,
        commit: impl Into<String>,
        produced_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: 0,
            repository: repository.into(),
            branch: branch.into(),
            build_number: build_number.into(),
            commit: commit.into(),
            produced_at,
            assets: Vec::new(),
        }
    }

    pub fn with_asset(mut self, asset: Asset) -> Self {
        self.assets.push(asset);
        self
    }

    /// A build only takes part in triggering if it ships something.
    pub fn has_shipping_assets(&self) -> bool {
        self.assets.iter().any(|a| !a.non_shipping)
    }

    pub fn shipping_assets(&self) -> impl Iterator<Item = &Asset> {
        self.assets.iter().filter(|a| !a.non_shipping)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildChannel {
    pub build_id: u64,
    pub channel_id: u64,
    pub assigned_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionPolicy {
    pub update_frequency: UpdateFrequency,
    /// Empty means "no policies configured".
    #[serde(default)]
    pub merge_policies: Vec<MergePolicy>,
}

impl SubscriptionPolicy {
    pub fn new(update_frequency: UpdateFrequency) -> Self {
        Self {
            update_frequency,
            merge_policies: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub channel_id: u64,
    pub source_repository: String,
    pub target_repository: String,
    pub target_branch: String,
    pub enabled: bool,
    pub policy: SubscriptionPolicy,
    /// Only advanced by a successful merge, and only forward in time.
    #[serde(default)]
    pub last_applied_build_id: Option<u64>,
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    pub fn new(
        channel_id: u64,
        source_repository: impl Into<String>,
        target_repository: impl Into<String>,
        target_branch: impl Into<String>,
        policy: SubscriptionPolicy,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel_id,
            source_repository: source_repository.into(),
            target_repository: target_repository.into(),
            target_branch: target_branch.into(),
            enabled: true,
            policy,
            last_applied_build_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn actor_id(&self) -> ActorId {
        ActorId::new(self.id, self.target_branch.clone())
    }
}

// ---------------------------------------------------------------------------
// RepositoryInstallation
// ---------------------------------------------------------------------------

/// Credential handle the host needs to act on a target repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryInstallation {
    pub repository_name: String,
    pub installation_id: u64,
}
