use crate::error::FlowError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

// ---------------------------------------------------------------------------
// UpdateFrequency
// ---------------------------------------------------------------------------

/// How often a subscription wants new builds applied.
///
/// `None` is the disabling sentinel: neither trigger path ever selects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateFrequency {
    None,
    EveryBuild,
    EveryDay,
    TwiceDaily,
    EveryWeek,
}

impl UpdateFrequency {
    pub fn all() -> &'static [UpdateFrequency] {
        &[
            UpdateFrequency::None,
            UpdateFrequency::EveryBuild,
            UpdateFrequency::EveryDay,
            UpdateFrequency::TwiceDaily,
            UpdateFrequency::EveryWeek,
        ]
    }

    /// Frequencies served by the periodic sweep rather than by new builds.
    pub fn periodic() -> &'static [UpdateFrequency] {
        &[
            UpdateFrequency::EveryDay,
            UpdateFrequency::TwiceDaily,
            UpdateFrequency::EveryWeek,
        ]
    }

    pub fn is_periodic(self) -> bool {
        Self::periodic().contains(&self)
    }

    /// Default sweep period for a periodic frequency.
    pub fn default_period(self) -> Option<Duration> {
        match self {
            UpdateFrequency::EveryDay => Some(Duration::from_secs(24 * 60 * 60)),
            UpdateFrequency::TwiceDaily => Some(Duration::from_secs(12 * 60 * 60)),
            UpdateFrequency::EveryWeek => Some(Duration::from_secs(7 * 24 * 60 * 60)),
            UpdateFrequency::None | UpdateFrequency::EveryBuild => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UpdateFrequency::None => "none",
            UpdateFrequency::EveryBuild => "every_build",
            UpdateFrequency::EveryDay => "every_day",
            UpdateFrequency::TwiceDaily => "twice_daily",
            UpdateFrequency::EveryWeek => "every_week",
        }
    }
}

impl fmt::Display for UpdateFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for UpdateFrequency {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(UpdateFrequency::None),
            "every_build" => Ok(UpdateFrequency::EveryBuild),
            "every_day" => Ok(UpdateFrequency::EveryDay),
            "twice_daily" => Ok(UpdateFrequency::TwiceDaily),
            "every_week" => Ok(UpdateFrequency::EveryWeek),
            _ => Err(FlowError::InvalidFrequency(format!(
                "'{s}': must be none, every_build, every_day, twice_daily, or every_week"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// LocationType
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationType {
    None,
    NugetFeed,
    Container,
}

impl LocationType {
    pub fn as_str(self) -> &'static str {
        match self {
            LocationType::None => "none",
            LocationType::NugetFeed => "nuget_feed",
            LocationType::Container => "container",
        }
    }
}

impl fmt::Display for LocationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
