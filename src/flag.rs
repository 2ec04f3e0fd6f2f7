use std::collections::{BTreeSet, HashMap};

use log::{debug, warn};
use serde::{Deserialize, Deserializer, Serialize};
use serde_with::{serde_as, DefaultOnError};
use thiserror::Error;

use crate::segment::Segment;
use crate::util::{clamp_percentage, deserialize_percentage};

/// The rule family used to decide whether a flag is enabled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
#[serde(rename_all = "camelCase")]
pub enum RolloutStrategy {
    /// Disabled for everyone.
    Off,
    /// Enabled for everyone.
    On,
    /// Enabled for a stable share of sessions, see [FlagDefinition::rollout_percentage].
    Percentage,
    /// Enabled when the active segment is listed in [FlagDefinition::allowed_segments].
    #[serde(rename = "userSegment", alias = "segment")]
    Segment,
    /// Stored data named a strategy this engine does not know. Such flags are never enabled.
    #[default]
    #[serde(other)]
    Unrecognized,
}

/// FlagDefinition describes a single named flag.
///
/// The serialized form matches the persisted flag document, so field names are camelCase and the
/// allowed segments are stored under `userSegments`.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagDefinition {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,

    #[serde(default)]
    #[serde_as(deserialize_as = "DefaultOnError")]
    pub rollout_strategy: RolloutStrategy,
    #[serde(default, deserialize_with = "deserialize_percentage")]
    pub rollout_percentage: u8,
    #[serde(
        default,
        rename = "userSegments",
        alias = "allowedSegments",
        deserialize_with = "deserialize_segments"
    )]
    pub allowed_segments: BTreeSet<Segment>,
}

impl FlagDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        rollout_strategy: RolloutStrategy,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            rollout_strategy,
            rollout_percentage: 0,
            allowed_segments: BTreeSet::new(),
        }
    }

    /// Sets the rollout percentage, clamped into `[0, 100]`.
    pub fn with_percentage(mut self, percentage: i64) -> Self {
        self.rollout_percentage = clamp_percentage(percentage);
        self
    }

    /// Sets the allowed segments. [Segment::All] is dropped since it cannot restrict a flag.
    pub fn with_segments(mut self, segments: impl IntoIterator<Item = Segment>) -> Self {
        self.allowed_segments = segments.into_iter().filter(|s| !s.is_wildcard()).collect();
        self
    }

    /// Returns a copy of this definition with `patch` merged in. Fields absent from the patch keep
    /// their current value.
    ///
    /// The percentage is clamped rather than rejected. A patch that would store an unrecognized
    /// strategy or use [Segment::All] as a restriction is rejected and nothing is merged.
    pub fn apply(&self, patch: &FlagPatch) -> Result<FlagDefinition, UpdateError> {
        let mut updated = self.clone();

        if let Some(strategy) = patch.rollout_strategy {
            if strategy == RolloutStrategy::Unrecognized {
                return Err(UpdateError::UnrecognizedStrategy);
            }
            updated.rollout_strategy = strategy;
        }

        if let Some(segments) = &patch.allowed_segments {
            if segments.iter().any(Segment::is_wildcard) {
                return Err(UpdateError::WildcardSegment);
            }
            updated.allowed_segments = segments.clone();
        }

        if let Some(percentage) = patch.rollout_percentage {
            updated.rollout_percentage = clamp_percentage(percentage);
            if i64::from(updated.rollout_percentage) != percentage {
                debug!(
                    "clamped rollout percentage {} to {} for flag {}",
                    percentage, updated.rollout_percentage, self.name
                );
            }
        }

        if let Some(description) = &patch.description {
            updated.description = description.clone();
        }

        Ok(updated)
    }
}

/// A partial update for a [FlagDefinition]. Every field is optional; the flag's name cannot be
/// changed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FlagPatch {
    pub description: Option<String>,
    pub rollout_strategy: Option<RolloutStrategy>,
    pub rollout_percentage: Option<i64>,
    #[serde(alias = "userSegments")]
    pub allowed_segments: Option<BTreeSet<Segment>>,
}

impl FlagPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn rollout_strategy(mut self, strategy: RolloutStrategy) -> Self {
        self.rollout_strategy = Some(strategy);
        self
    }

    pub fn rollout_percentage(mut self, percentage: i64) -> Self {
        self.rollout_percentage = Some(percentage);
        self
    }

    pub fn allowed_segments(mut self, segments: impl IntoIterator<Item = Segment>) -> Self {
        self.allowed_segments = Some(segments.into_iter().collect());
        self
    }

    /// Returns true if applying this patch would change nothing.
    pub fn is_empty(&self) -> bool {
        self == &FlagPatch::default()
    }
}

/// Reasons a [FlagPatch] can be refused.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum UpdateError {
    /// The patch named a flag that does not exist. Flags are never created by updates.
    #[error("flag '{0}' does not exist")]
    FlagNotFound(String),
    #[error("rollout strategy must be one of off, on, percentage or userSegment")]
    UnrecognizedStrategy,
    #[error("segment 'all' is a wildcard and cannot restrict a flag")]
    WildcardSegment,
}

/// The flags every store starts with before any persisted state is applied.
pub fn default_flags() -> HashMap<String, FlagDefinition> {
    use Segment::*;

    let flags = vec![
        FlagDefinition::new(
            "hero_v2",
            "Enhanced hero section with rich media and animations",
            RolloutStrategy::Off,
        )
        .with_segments([Premium, Beta]),
        FlagDefinition::new(
            "dashboard_v2",
            "Enhanced dashboard with budget breakdown and visual charts",
            RolloutStrategy::Off,
        )
        .with_segments([Premium, Beta]),
        FlagDefinition::new(
            "showVirtualCard",
            "Virtual card widget for premium and verified users",
            RolloutStrategy::Segment,
        )
        .with_segments([Premium]),
        FlagDefinition::new(
            "smartSearch",
            "AI-powered smart search for transactions",
            RolloutStrategy::Percentage,
        )
        .with_percentage(50)
        .with_segments([Premium, Beta, Guest]),
        FlagDefinition::new(
            "supportChat",
            "Live chat support widget",
            RolloutStrategy::Off,
        )
        .with_segments([Premium, Beta]),
    ];

    flags.into_iter().map(|f| (f.name.clone(), f)).collect()
}

// Stored segment lists may contain labels written by other versions or by hand. Unknown labels and
// the wildcard are dropped instead of failing the whole document.
fn deserialize_segments<'de, D>(deserializer: D) -> Result<BTreeSet<Segment>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    let items = match value {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Null => return Ok(BTreeSet::new()),
        other => {
            warn!("ignoring malformed segment list {}", other);
            return Ok(BTreeSet::new());
        }
    };

    let mut segments = BTreeSet::new();
    for item in items {
        match item.as_str().map(Segment::try_from) {
            Some(Ok(segment)) if !segment.is_wildcard() => {
                segments.insert(segment);
            }
            _ => warn!("dropping invalid segment restriction {}", item),
        }
    }
    Ok(segments)
}
