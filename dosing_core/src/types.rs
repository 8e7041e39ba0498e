//! Core domain types for the event-log storage subsystem.
//!
//! This module defines:
//! - The `Event` / `TimedEvent` traits every persisted stream implements
//! - Concrete clinical events (temporary glucose targets, carbohydrate entries)
//! - Collection identities and their lifecycle states
//! - Glucose unit conversion used at the producer boundary

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Origin tag stamped on events entered by hand on this device
pub const MANUAL_ORIGIN: &str = "freeaps-x";

/// Multiplier from mmol/L to mg/dL
pub const MMOL_TO_MGDL: f64 = 18.0;

// ============================================================================
// Event Traits
// ============================================================================

/// A timestamped clinical event that can live in an event log.
///
/// `created_at` is both the ordering key and the dedup key: a collection never
/// holds two events with the same `created_at` after a merge.
pub trait Event: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    fn id(&self) -> &str;

    fn created_at(&self) -> DateTime<Utc>;

    fn entered_by(&self) -> Option<&str>;

    /// Copy of this event stamped with a new `created_at`; every other field,
    /// including the id, is preserved.
    fn restamped(&self, created_at: DateTime<Utc>) -> Self;

    /// Whether the origin tag marks this event as manually entered
    fn is_manual(&self, manual_tag: &str) -> bool {
        self.entered_by()
            .map(|origin| origin.contains(manual_tag))
            .unwrap_or(false)
    }
}

/// An event that is in effect for a bounded interval after `created_at`
pub trait TimedEvent: Event {
    fn duration(&self) -> Duration;

    /// End of the interval the event is in effect for. An interval running
    /// past the representable range ends at `DateTime::<Utc>::MAX_UTC`.
    fn ends_at(&self) -> DateTime<Utc> {
        self.created_at()
            .checked_add_signed(self.duration())
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

fn new_event_id() -> String {
    Uuid::new_v4().to_string()
}

// ============================================================================
// Temporary Targets
// ============================================================================

/// A temporary glucose target override.
///
/// A cancel is not a deletion: it is a new target with zero bounds and zero
/// duration that supersedes whatever was active.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TempTarget {
    #[serde(rename = "_id", default = "new_event_id")]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(rename = "targetTop", default)]
    pub target_top: Option<f64>,
    #[serde(rename = "targetBottom", default)]
    pub target_bottom: Option<f64>,
    /// Minutes
    pub duration: f64,
    #[serde(rename = "enteredBy", default)]
    pub entered_by: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl TempTarget {
    /// Display fallback for targets without a name or reason
    pub const CUSTOM: &'static str = "Temp target";

    /// Name and reason carried by cancel events
    pub const CANCEL: &'static str = "Cancel";

    /// Longest duration a producer may enter: one week
    pub const MAX_DURATION_MINUTES: f64 = 7.0 * 24.0 * 60.0;

    /// Build a manually entered target. Bounds are mg/dL and `high` is raised
    /// to `low` when given in the wrong order.
    pub fn manual(
        name: Option<String>,
        low: f64,
        high: f64,
        duration_minutes: f64,
        created_at: DateTime<Utc>,
    ) -> Self {
        let name = name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| Self::CUSTOM.to_string());
        Self {
            id: new_event_id(),
            name: Some(name.clone()),
            created_at,
            target_top: Some(high.max(low)),
            target_bottom: Some(low),
            duration: duration_minutes,
            entered_by: Some(MANUAL_ORIGIN.to_string()),
            reason: Some(name),
        }
    }

    /// Sentinel event that ends any active target at `now`
    pub fn cancel(now: DateTime<Utc>) -> Self {
        Self {
            id: new_event_id(),
            name: Some(Self::CANCEL.to_string()),
            created_at: now,
            target_top: Some(0.0),
            target_bottom: Some(0.0),
            duration: 0.0,
            entered_by: Some(MANUAL_ORIGIN.to_string()),
            reason: Some(Self::CANCEL.to_string()),
        }
    }

    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .or(self.reason.as_deref())
            .unwrap_or(Self::CUSTOM)
    }

    pub fn is_cancel(&self) -> bool {
        self.duration <= 0.0
    }
}

impl Event for TempTarget {
    fn id(&self) -> &str {
        &self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn entered_by(&self) -> Option<&str> {
        self.entered_by.as_deref()
    }

    fn restamped(&self, created_at: DateTime<Utc>) -> Self {
        Self {
            created_at,
            ..self.clone()
        }
    }
}

impl TimedEvent for TempTarget {
    fn duration(&self) -> Duration {
        if self.duration.is_nan() || self.duration <= 0.0 {
            return Duration::zero();
        }
        // Sub-millisecond precision is irrelevant for minute-scale targets;
        // the float to int cast saturates
        let millis = (self.duration * 60_000.0).round() as i64;
        Duration::try_milliseconds(millis).unwrap_or(Duration::MAX)
    }
}

// ============================================================================
// Carbohydrate Entries
// ============================================================================

/// A carbohydrate intake record
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CarbsEntry {
    #[serde(rename = "_id", default = "new_event_id")]
    pub id: String,
    pub created_at: DateTime<Utc>,
    /// Grams
    pub carbs: f64,
    #[serde(rename = "enteredBy", default)]
    pub entered_by: Option<String>,
}

impl CarbsEntry {
    pub fn manual(carbs: f64, created_at: DateTime<Utc>) -> Self {
        Self {
            id: new_event_id(),
            created_at,
            carbs,
            entered_by: Some(MANUAL_ORIGIN.to_string()),
        }
    }
}

impl Event for CarbsEntry {
    fn id(&self) -> &str {
        &self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn entered_by(&self) -> Option<&str> {
        self.entered_by.as_deref()
    }

    fn restamped(&self, created_at: DateTime<Utc>) -> Self {
        Self {
            created_at,
            ..self.clone()
        }
    }
}

// ============================================================================
// Collections
// ============================================================================

/// Every observable persisted collection
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CollectionKind {
    TempTargets,
    TempTargetPresets,
    Carbs,
}

impl CollectionKind {
    /// Store key the collection is persisted under
    pub fn key(self) -> &'static str {
        match self {
            CollectionKind::TempTargets => "settings/temptargets.json",
            CollectionKind::TempTargetPresets => "freeaps/temptargets_presets.json",
            CollectionKind::Carbs => "monitor/carbhistory.json",
        }
    }
}

impl fmt::Display for CollectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CollectionKind::TempTargets => "temp_targets",
            CollectionKind::TempTargetPresets => "temp_target_presets",
            CollectionKind::Carbs => "carbs",
        };
        f.write_str(name)
    }
}

/// Store key of the shadow collection of temp targets already uploaded
pub const UPLOADED_TEMP_TARGETS_KEY: &str = "upload/uploaded-temptargets.json";

/// Lifecycle of a persisted collection as seen by callers.
///
/// A blob that fails to decode reports `Empty`; there is no corrupted state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CollectionState {
    Uninitialized,
    Empty,
    Populated,
}

// ============================================================================
// Units
// ============================================================================

/// Glucose units a producer may enter target bounds in
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum GlucoseUnits {
    #[default]
    MgdL,
    Mmol,
}

impl GlucoseUnits {
    /// Convert a value in these units to mg/dL, the unit stored in the log
    pub fn to_mgdl(self, value: f64) -> f64 {
        match self {
            GlucoseUnits::MgdL => value,
            GlucoseUnits::Mmol => value * MMOL_TO_MGDL,
        }
    }
}

impl FromStr for GlucoseUnits {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_lowercase().replace(['/', ' '], "").as_str() {
            "mgdl" => Ok(GlucoseUnits::MgdL),
            "mmol" | "mmoll" => Ok(GlucoseUnits::Mmol),
            other => Err(crate::Error::Config(format!(
                "unknown glucose units: {}",
                other
            ))),
        }
    }
}
