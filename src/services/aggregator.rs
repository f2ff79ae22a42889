//! Combines manual deltas, scene offsets and boosts into one boundary window per zone.
//!
//! A positive net adjustment only raises the lower boundary and a negative one
//! only lowers the upper boundary, so the external layer keeps sweeping the
//! side that was not adjusted. Every adjustment is capped first so the window
//! never narrows below [`MIN_BOUNDARY_WIDTH`].

use crate::boosts::{BoostSource, SunsetBoost};
use crate::models::lighting::{
    Boundaries, GlobalAdjustmentState, LockReason, MIN_BOUNDARY_WIDTH, SceneOffset, WARMTH_SCALE, ZoneConfig,
};
use log::warn;
use serde::Serialize;

/// Who is asking for the computation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CycleKind {
    /// Periodic or event-triggered sweep; defers to user and scene locks.
    Periodic,
    /// The operation that just acquired or released the zone's lock.
    LockOwner,
}

/// Per-zone state the computation depends on.
#[derive(Debug, Clone, Copy)]
pub struct ZoneInputs<'a> {
    pub config: &'a ZoneConfig,
    pub enabled: bool,
    pub lock: LockReason,
    pub wake_active: bool,
    /// Environmental boost read once for the whole operation; gated per zone here.
    pub environmental: i32,
    /// Wake ramp value already read this cycle (0 when the zone has no wake ramp).
    pub wake_boost: i32,
    pub scene_offset: SceneOffset,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Disabled,
    HeldByUser,
    HeldByScene,
}

/// Every contribution that went into a zone's boundaries.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize)]
pub struct BoostBreakdown {
    pub manual_brightness: i32,
    pub manual_warmth: i32,
    pub environmental: i32,
    pub sunset: SunsetBoost,
    pub wake: i32,
    pub scene: SceneOffset,
    pub raw_brightness: i32,
    pub raw_warmth: i32,
    pub applied_brightness: i32,
    pub applied_warmth: i32,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Computation {
    Push {
        boundaries: Boundaries,
        breakdown: BoostBreakdown,
    },
    Skip(SkipReason),
}

pub fn compute_boundaries(
    zone: &ZoneInputs<'_>,
    global: &GlobalAdjustmentState,
    boosts: &dyn BoostSource,
    kind: CycleKind,
) -> Computation {
    let config = zone.config;
    if !zone.enabled {
        return Computation::Skip(SkipReason::Disabled);
    }
    if kind == CycleKind::Periodic && !zone.wake_active {
        match zone.lock {
            LockReason::UserAdjust => return Computation::Skip(SkipReason::HeldByUser),
            LockReason::Scene => return Computation::Skip(SkipReason::HeldByScene),
            LockReason::None | LockReason::Wake => {}
        }
    }

    let environmental = if zone.wake_active || !config.environmental_enabled {
        0
    } else {
        zone.environmental
    };
    let sunset = if config.sunset_enabled {
        boosts.sunset_boost(config)
    } else {
        SunsetBoost::default()
    };
    let wake = if config.wake_enabled { zone.wake_boost } else { 0 };
    let scene = zone.scene_offset;

    let raw_brightness = global.brightness_delta + environmental + sunset.brightness + wake + scene.brightness;
    let raw_warmth = global.warmth_delta + scene.warmth + sunset.warmth;

    let brightness_range = config.brightness_range();
    let applied_brightness = cap_adjustment(raw_brightness, brightness_range, 1);
    if applied_brightness != raw_brightness {
        warn!(
            "Zone {}: brightness adjustment {:+} capped to {:+} (range {})",
            config.id, raw_brightness, applied_brightness, brightness_range
        );
    }
    let warmth_range = config.warmth_range();
    let applied_warmth = cap_adjustment(raw_warmth, warmth_range, WARMTH_SCALE);
    if applied_warmth != raw_warmth {
        warn!(
            "Zone {}: warmth adjustment {:+}K capped to {:+}K (range {}K)",
            config.id, raw_warmth, applied_warmth, warmth_range
        );
    }

    let (min_b, max_b) = asymmetric_clamp(
        i32::from(config.min_brightness),
        i32::from(config.max_brightness),
        applied_brightness,
    );
    let (min_w, max_w) = asymmetric_clamp(
        i32::from(config.min_color_temp),
        i32::from(config.max_color_temp),
        applied_warmth,
    );

    // both windows stay within the configured base, so the narrowing casts are lossless
    let boundaries = Boundaries {
        min_brightness: min_b as u8,
        max_brightness: max_b as u8,
        min_color_temp: min_w as u16,
        max_color_temp: max_w as u16,
    };

    Computation::Push {
        boundaries,
        breakdown: BoostBreakdown {
            manual_brightness: global.brightness_delta,
            manual_warmth: global.warmth_delta,
            environmental,
            sunset,
            wake,
            scene,
            raw_brightness,
            raw_warmth,
            applied_brightness,
            applied_warmth,
        },
    }
}

/// Largest adjustment magnitude a window of width `range` tolerates.
///
/// Thresholds are expressed in brightness points and multiplied by `scale`
/// for other units (Kelvin uses [`WARMTH_SCALE`]).
pub fn adjustment_cap(range: i32, scale: i32) -> i32 {
    let min_width = MIN_BOUNDARY_WIDTH * scale;
    let tier = if range < 35 * scale {
        30 * scale
    } else if range < 45 * scale {
        range - min_width
    } else {
        50 * scale
    };
    tier.min(range - min_width).max(0)
}

pub fn cap_adjustment(raw: i32, range: i32, scale: i32) -> i32 {
    let cap = adjustment_cap(range, scale);
    raw.clamp(-cap, cap)
}

/// Move only the boundary on the side of the adjustment.
pub fn asymmetric_clamp(base_min: i32, base_max: i32, adjustment: i32) -> (i32, i32) {
    if adjustment > 0 {
        ((base_min + adjustment).clamp(base_min, base_max), base_max)
    } else if adjustment < 0 {
        (base_min, (base_max + adjustment).clamp(base_min, base_max))
    } else {
        (base_min, base_max)
    }
}
