use crate::config::{ConfigError, ZonesFile};
use crate::models::lighting::{
    LightAction, LightId, MIN_BOUNDARY_WIDTH, Scene, SceneId, WARMTH_SCALE, ZoneConfig, ZoneId,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Validated, immutable zone and scene definitions for one session.
///
/// Holds a reverse index from light to owning zone so scene choreography can
/// be mapped to zones without inspecting action payloads at runtime.
#[derive(Debug, Clone)]
pub struct ZoneRegistry {
    zones: BTreeMap<ZoneId, ZoneConfig>,
    light_index: HashMap<LightId, ZoneId>,
    scenes: BTreeMap<SceneId, Scene>,
}

/// Zones named by a set of light actions, plus any lights no zone owns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SceneTargets {
    pub zones: BTreeSet<ZoneId>,
    pub unmapped: Vec<LightId>,
}

impl ZoneRegistry {
    pub fn new(zones: Vec<ZoneConfig>, scenes: Vec<Scene>) -> Result<Self, ConfigError> {
        if zones.is_empty() {
            return Err(ConfigError::NoZones);
        }

        let mut by_id = BTreeMap::new();
        let mut light_index: HashMap<LightId, ZoneId> = HashMap::new();
        for zone in zones {
            validate_zone(&zone)?;
            if by_id.contains_key(&zone.id) {
                return Err(ConfigError::DuplicateZone(zone.id));
            }
            for light in &zone.lights {
                if let Some(first) = light_index.get(light) {
                    if *first == zone.id {
                        return Err(ConfigError::InvalidZone {
                            zone: zone.id.clone(),
                            message: format!("light {} listed twice", light),
                        });
                    }
                    return Err(ConfigError::SharedLight {
                        light: light.clone(),
                        first: first.clone(),
                        second: zone.id.clone(),
                    });
                }
                light_index.insert(light.clone(), zone.id.clone());
            }
            by_id.insert(zone.id.clone(), zone);
        }

        let mut scenes_by_id = BTreeMap::new();
        for scene in scenes {
            if scene.id.is_auto() {
                return Err(ConfigError::InvalidScene {
                    scene: scene.id,
                    message: format!("id {:?} is reserved", SceneId::AUTO),
                });
            }
            if scene.id.0.trim().is_empty() {
                return Err(ConfigError::InvalidScene {
                    scene: scene.id,
                    message: "id must not be empty".to_string(),
                });
            }
            if scenes_by_id.contains_key(&scene.id) {
                return Err(ConfigError::InvalidScene {
                    scene: scene.id,
                    message: "defined more than once".to_string(),
                });
            }
            scenes_by_id.insert(scene.id.clone(), scene);
        }

        Ok(ZoneRegistry {
            zones: by_id,
            light_index,
            scenes: scenes_by_id,
        })
    }

    pub fn from_file(file: ZonesFile) -> Result<Self, ConfigError> {
        Self::new(file.zones, file.scenes)
    }

    pub fn zone(&self, id: &ZoneId) -> Option<&ZoneConfig> {
        self.zones.get(id)
    }

    pub fn zones(&self) -> impl Iterator<Item = &ZoneConfig> {
        self.zones.values()
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn zone_for_light(&self, light: &LightId) -> Option<&ZoneId> {
        self.light_index.get(light)
    }

    pub fn scene(&self, id: &SceneId) -> Option<&Scene> {
        self.scenes.get(id)
    }

    pub fn scenes(&self) -> impl Iterator<Item = &Scene> {
        self.scenes.values()
    }

    /// Map every light named by `actions` back to its zone.
    pub fn targets_of(&self, actions: &[LightAction]) -> SceneTargets {
        let mut targets = SceneTargets::default();
        for light in actions.iter().flat_map(|a| a.lights()) {
            match self.zone_for_light(light) {
                Some(zone) => {
                    targets.zones.insert(zone.clone());
                }
                None => {
                    if !targets.unmapped.contains(light) {
                        targets.unmapped.push(light.clone());
                    }
                }
            }
        }
        targets
    }
}

fn validate_zone(zone: &ZoneConfig) -> Result<(), ConfigError> {
    let invalid = |message: String| ConfigError::InvalidZone {
        zone: zone.id.clone(),
        message,
    };

    if zone.id.0.trim().is_empty() {
        return Err(invalid("id must not be empty".to_string()));
    }
    if zone.control_entity.0.trim().is_empty() {
        return Err(invalid("control_entity must not be empty".to_string()));
    }
    if zone.lights.is_empty() {
        return Err(invalid("at least one light is required".to_string()));
    }
    if zone.max_brightness > 100 {
        return Err(invalid(format!("max_brightness {} exceeds 100", zone.max_brightness)));
    }
    if zone.min_brightness >= zone.max_brightness {
        return Err(invalid(format!(
            "min_brightness {} must be below max_brightness {}",
            zone.min_brightness, zone.max_brightness
        )));
    }
    if zone.min_color_temp >= zone.max_color_temp {
        return Err(invalid(format!(
            "min_color_temp {} must be below max_color_temp {}",
            zone.min_color_temp, zone.max_color_temp
        )));
    }
    if zone.brightness_range() < MIN_BOUNDARY_WIDTH {
        return Err(invalid(format!(
            "brightness range {} is narrower than {}",
            zone.brightness_range(),
            MIN_BOUNDARY_WIDTH
        )));
    }
    let min_warmth_width = MIN_BOUNDARY_WIDTH * WARMTH_SCALE;
    if zone.warmth_range() < min_warmth_width {
        return Err(invalid(format!(
            "color temperature range {}K is narrower than {}K",
            zone.warmth_range(),
            min_warmth_width
        )));
    }
    if zone.manual_timeout_secs == Some(0) {
        return Err(invalid("manual_timeout_secs must be greater than zero".to_string()));
    }
    Ok(())
}
