//! "Calculation complete" notifications for downstream observability.

use crate::models::lighting::{Boundaries, SceneId, ZoneId};
use crate::services::aggregator::{BoostBreakdown, SkipReason};
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Serialize;

/// What caused a calculation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Periodic,
    AdjustBrightness,
    AdjustWarmth,
    ApplyScene,
    Reset,
    EnableZone,
    LockExpired,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ZoneOutcome {
    Pushed {
        boundaries: Boundaries,
        breakdown: BoostBreakdown,
    },
    Skipped {
        reason: SkipReason,
    },
    Failed {
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZoneCalculation {
    pub zone_id: ZoneId,
    #[serde(flatten)]
    pub outcome: ZoneOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalculationEvent {
    pub trigger: Trigger,
    pub at: DateTime<Utc>,
    pub brightness_delta: i32,
    pub warmth_delta: i32,
    pub scene: SceneId,
    pub zones: Vec<ZoneCalculation>,
}

impl CalculationEvent {
    pub fn zone(&self, id: &ZoneId) -> Option<&ZoneOutcome> {
        self.zones.iter().find(|z| z.zone_id == *id).map(|z| &z.outcome)
    }
}

pub trait Notifier: Send + Sync {
    fn calculation_complete(&self, event: &CalculationEvent);
}

/// Writes each event as a single JSON line under the `calculation` log target.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn calculation_complete(&self, event: &CalculationEvent) {
        match serde_json::to_string(event) {
            Ok(line) => info!(target: "calculation", "{}", line),
            Err(e) => warn!("Serializing calculation event failed: {}", e),
        }
    }
}
