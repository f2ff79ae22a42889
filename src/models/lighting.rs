//! Domain types shared by the registry, the aggregator and the coordinator.
//!
//! Notes
//! - Brightness values are percentages (0-100); warmth values are Kelvin.
//! - Arithmetic on adjustments is done in `i32`; boundaries are stored in the
//!   narrower types the external layer accepts.

use serde::{Deserialize, Serialize};
use std::fmt;

// =====================
// Scalar ID newtype wrappers
// =====================

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ZoneId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LightId(pub String);

/// Entity reference on the external lighting layer (e.g. `switch.adaptive_lighting_kitchen`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SceneId(pub String);

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for LightId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for SceneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl SceneId {
    /// Id of the distinguished "all lights" scene that clears every scene offset.
    pub const AUTO: &'static str = "auto";

    pub fn auto() -> Self {
        SceneId(Self::AUTO.to_string())
    }

    pub fn is_auto(&self) -> bool {
        self.0 == Self::AUTO
    }
}

// =====================
// Adjustment ranges
// =====================

pub const BRIGHTNESS_DELTA_LIMIT: i32 = 100;
pub const WARMTH_DELTA_LIMIT: i32 = 2500;

/// Kelvin per brightness point when scaling capping thresholds to warmth.
pub const WARMTH_SCALE: i32 = 25;

/// Narrowest boundary width the capping rule guarantees (brightness points).
pub const MIN_BOUNDARY_WIDTH: i32 = 5;

// =====================
// Zone configuration
// =====================

/// Static per-session configuration of one zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneConfig {
    pub id: ZoneId,
    /// Adaptive-lighting control entity that owns this zone's boundaries.
    pub control_entity: EntityId,
    pub lights: Vec<LightId>,
    pub min_brightness: u8,
    pub max_brightness: u8,
    pub min_color_temp: u16,
    pub max_color_temp: u16,
    #[serde(default = "enabled_by_default")]
    pub environmental_enabled: bool,
    #[serde(default = "enabled_by_default")]
    pub sunset_enabled: bool,
    #[serde(default)]
    pub wake_enabled: bool,
    /// Replaces the global manual timeout for this zone.
    #[serde(default)]
    pub manual_timeout_secs: Option<u64>,
}

fn enabled_by_default() -> bool {
    true
}

impl ZoneConfig {
    pub fn brightness_range(&self) -> i32 {
        i32::from(self.max_brightness) - i32::from(self.min_brightness)
    }

    pub fn warmth_range(&self) -> i32 {
        i32::from(self.max_color_temp) - i32::from(self.min_color_temp)
    }
}

/// Brightness/warmth window handed to the external layer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Boundaries {
    pub min_brightness: u8,
    pub max_brightness: u8,
    pub min_color_temp: u16,
    pub max_color_temp: u16,
}

// =====================
// Manual lock
// =====================

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockReason {
    #[default]
    None,
    UserAdjust,
    Scene,
    Wake,
}

// =====================
// Scenes
// =====================

/// Per-zone scene contribution; absent entries mean `(0, 0)`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SceneOffset {
    pub brightness: i32,
    pub warmth: i32,
}

/// Literal light command forwarded to the external layer as part of a scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum LightAction {
    TurnOn {
        lights: Vec<LightId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        brightness_pct: Option<u8>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        color_temp_kelvin: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transition: Option<f32>,
    },
    TurnOff {
        lights: Vec<LightId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transition: Option<f32>,
    },
}

impl LightAction {
    pub fn lights(&self) -> &[LightId] {
        match self {
            LightAction::TurnOn { lights, .. } | LightAction::TurnOff { lights, .. } => lights,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    pub id: SceneId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub brightness_offset: i32,
    #[serde(default)]
    pub warmth_offset: i32,
    #[serde(default)]
    pub actions: Vec<LightAction>,
}

impl Scene {
    pub fn offset(&self) -> SceneOffset {
        SceneOffset {
            brightness: self.brightness_offset,
            warmth: self.warmth_offset,
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id.0)
    }
}

// =====================
// Global adjustment state
// =====================

/// User-driven deltas shared by every zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GlobalAdjustmentState {
    pub brightness_delta: i32,
    pub warmth_delta: i32,
    pub current_scene: SceneId,
}

impl Default for GlobalAdjustmentState {
    fn default() -> Self {
        GlobalAdjustmentState {
            brightness_delta: 0,
            warmth_delta: 0,
            current_scene: SceneId::auto(),
        }
    }
}

impl GlobalAdjustmentState {
    pub fn add_brightness(&mut self, delta: i32) {
        self.brightness_delta = self
            .brightness_delta
            .saturating_add(delta)
            .clamp(-BRIGHTNESS_DELTA_LIMIT, BRIGHTNESS_DELTA_LIMIT);
    }

    pub fn add_warmth(&mut self, delta: i32) {
        self.warmth_delta = self
            .warmth_delta
            .saturating_add(delta)
            .clamp(-WARMTH_DELTA_LIMIT, WARMTH_DELTA_LIMIT);
    }
}
