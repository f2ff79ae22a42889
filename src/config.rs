//! Runtime configuration.
//! Process environment (optionally seeded from a `.env` file) carries the
//! connection and policy settings; zones and scenes come from a JSON file.

use crate::models::lighting::{EntityId, LightId, Scene, SceneId, ZoneConfig, ZoneId};
use chrono::NaiveTime;
use serde::Deserialize;
use std::fmt::{self, Display, Formatter};
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use std::{error::Error, fs};

pub const DEFAULT_HA_URL: &str = "http://localhost:8123";
pub const DEFAULT_ZONES_FILE: &str = "zones.json";
pub const DEFAULT_CYCLE_SECS: u64 = 60;
pub const DEFAULT_MANUAL_TIMEOUT_SECS: u64 = 7200;
pub const DEFAULT_SCENE_TIMEOUT_SECS: u64 = 7200;
pub const DEFAULT_SLEEP_WINDOW: &str = "22:00-06:00";
pub const DEFAULT_DIM_THRESHOLD_PCT: u8 = 30;
pub const DEFAULT_MAX_REQUEST_RETRIES: u32 = 3;
pub const DEFAULT_SUN_ENTITY: &str = "sun.sun";
pub const DEFAULT_WAKE_DURATION_MINS: i64 = 15;
pub const DEFAULT_WAKE_MAX_BOOST: i32 = 20;

#[derive(Debug)]
pub enum ConfigError {
    /// An environment variable is missing or unparsable.
    Env { var: &'static str, message: String },
    Io { path: PathBuf, message: String },
    /// The zones file is not valid JSON for the expected shape.
    Json {
        path: PathBuf,
        json_path: String,
        source: serde_json::Error,
    },
    NoZones,
    DuplicateZone(ZoneId),
    InvalidZone { zone: ZoneId, message: String },
    /// A light is listed in more than one zone.
    SharedLight { light: LightId, first: ZoneId, second: ZoneId },
    InvalidScene { scene: SceneId, message: String },
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Env { var, message } => write!(f, "{}: {}", var, message),
            ConfigError::Io { path, message } => write!(f, "{}: {}", path.display(), message),
            ConfigError::Json { path, json_path, source } => {
                write!(f, "{} at {}: {}", path.display(), json_path, source)
            }
            ConfigError::NoZones => write!(f, "no zones configured"),
            ConfigError::DuplicateZone(z) => write!(f, "zone {} defined more than once", z),
            ConfigError::InvalidZone { zone, message } => write!(f, "zone {}: {}", zone, message),
            ConfigError::SharedLight { light, first, second } => {
                write!(f, "light {} belongs to both zone {} and zone {}", light, first, second)
            }
            ConfigError::InvalidScene { scene, message } => write!(f, "scene {}: {}", scene, message),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ConfigError::Json { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Local-time window during which manual locks last longer. May wrap midnight.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SleepWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl SleepWindow {
    pub fn contains(&self, t: NaiveTime) -> bool {
        if self.start <= self.end {
            t >= self.start && t < self.end
        } else {
            t >= self.start || t < self.end
        }
    }
}

impl FromStr for SleepWindow {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s
            .split_once('-')
            .ok_or_else(|| "expected HH:MM-HH:MM".to_string())?;
        let parse = |part: &str| {
            NaiveTime::parse_from_str(part.trim(), "%H:%M").map_err(|_| format!("invalid time of day: {}", part.trim()))
        };
        Ok(SleepWindow {
            start: parse(start)?,
            end: parse(end)?,
        })
    }
}

impl Display for SleepWindow {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start.format("%H:%M"), self.end.format("%H:%M"))
    }
}

/// Inputs of the smart lock timeout.
#[derive(Debug, Clone, PartialEq)]
pub struct LockPolicy {
    pub manual_timeout: Duration,
    pub scene_timeout: Duration,
    pub sleep_window: Option<SleepWindow>,
    /// Zones whose target brightness is below this get a longer lock.
    pub dim_threshold_pct: u8,
}

impl Default for LockPolicy {
    fn default() -> Self {
        LockPolicy {
            manual_timeout: Duration::from_secs(DEFAULT_MANUAL_TIMEOUT_SECS),
            scene_timeout: Duration::from_secs(DEFAULT_SCENE_TIMEOUT_SECS),
            sleep_window: None,
            dim_threshold_pct: DEFAULT_DIM_THRESHOLD_PCT,
        }
    }
}

/// Sensor entities feeding the boost calculators. Any of them may be absent.
#[derive(Debug, Clone, PartialEq)]
pub struct BoostSettings {
    pub lux_sensor: Option<EntityId>,
    pub weather_entity: Option<EntityId>,
    pub sun_entity: Option<EntityId>,
    pub wake_alarm_entity: Option<EntityId>,
    pub wake_duration: chrono::Duration,
    pub wake_max_boost: i32,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub ha_url: String,
    /// Long-lived Home Assistant access token.
    pub ha_token: String,
    pub zones_file: PathBuf,
    /// Periodic update cadence.
    pub cycle_interval: Duration,
    pub lock_policy: LockPolicy,
    pub boosts: BoostSettings,
    pub max_request_retries: NonZeroU32,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the config from any variable source (the process environment in production).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let ha_url = var("HA_URL").unwrap_or_else(|| DEFAULT_HA_URL.to_string());
        // Prefer env var; fallback to token.txt in working directory
        let ha_token = match var("HA_TOKEN") {
            Some(v) => v,
            None => match fs::read_to_string(Path::new("token.txt")) {
                Ok(s) if !s.trim().is_empty() => s.trim().to_string(),
                _ => {
                    return Err(ConfigError::Env {
                        var: "HA_TOKEN",
                        message: "missing access token: set HA_TOKEN or provide token.txt in working directory"
                            .to_string(),
                    });
                }
            },
        };

        let zones_file = PathBuf::from(var("ZONES_FILE").unwrap_or_else(|| DEFAULT_ZONES_FILE.to_string()));
        let cycle_secs: u64 = parse_var(&var, "CYCLE_INTERVAL_SECS", DEFAULT_CYCLE_SECS)?;
        if cycle_secs == 0 {
            return Err(ConfigError::Env {
                var: "CYCLE_INTERVAL_SECS",
                message: "must be greater than zero".to_string(),
            });
        }

        let sleep_window = match var("SLEEP_WINDOW").as_deref() {
            Some("off") | Some("none") => None,
            Some(s) => Some(parse_with("SLEEP_WINDOW", s)?),
            None => Some(parse_with("SLEEP_WINDOW", DEFAULT_SLEEP_WINDOW)?),
        };
        let lock_policy = LockPolicy {
            manual_timeout: Duration::from_secs(parse_var(&var, "MANUAL_TIMEOUT_SECS", DEFAULT_MANUAL_TIMEOUT_SECS)?),
            scene_timeout: Duration::from_secs(parse_var(&var, "SCENE_TIMEOUT_SECS", DEFAULT_SCENE_TIMEOUT_SECS)?),
            sleep_window,
            dim_threshold_pct: parse_var(&var, "DIM_THRESHOLD_PCT", DEFAULT_DIM_THRESHOLD_PCT)?,
        };

        let wake_mins: i64 = parse_var(&var, "WAKE_DURATION_MINS", DEFAULT_WAKE_DURATION_MINS)?;
        if wake_mins <= 0 {
            return Err(ConfigError::Env {
                var: "WAKE_DURATION_MINS",
                message: "must be greater than zero".to_string(),
            });
        }
        let boosts = BoostSettings {
            lux_sensor: var("LUX_SENSOR").map(EntityId),
            weather_entity: var("WEATHER_ENTITY").map(EntityId),
            sun_entity: Some(EntityId(var("SUN_ENTITY").unwrap_or_else(|| DEFAULT_SUN_ENTITY.to_string()))),
            wake_alarm_entity: var("WAKE_ALARM_ENTITY").map(EntityId),
            wake_duration: chrono::Duration::minutes(wake_mins),
            wake_max_boost: parse_var(&var, "WAKE_MAX_BOOST", DEFAULT_WAKE_MAX_BOOST)?,
        };

        let retries: u32 = parse_var(&var, "MAX_REQUEST_RETRIES", DEFAULT_MAX_REQUEST_RETRIES)?;
        let max_request_retries = NonZeroU32::new(retries).ok_or_else(|| ConfigError::Env {
            var: "MAX_REQUEST_RETRIES",
            message: "must be greater than zero".to_string(),
        })?;

        Ok(Config {
            ha_url: ha_url.trim_end_matches('/').to_string(),
            ha_token,
            zones_file,
            cycle_interval: Duration::from_secs(cycle_secs),
            lock_policy,
            boosts,
            max_request_retries,
        })
    }
}

fn parse_var<T, F>(var: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    match var(name) {
        Some(s) => parse_with(name, &s),
        None => Ok(default),
    }
}

fn parse_with<T>(name: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    raw.parse::<T>().map_err(|e| ConfigError::Env {
        var: name,
        message: format!("invalid value {:?}: {}", raw, e),
    })
}

/// Contents of the zones file before validation.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ZonesFile {
    pub zones: Vec<ZoneConfig>,
    #[serde(default)]
    pub scenes: Vec<Scene>,
}

impl ZonesFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::parse(&raw, path)
    }

    pub fn parse(raw: &str, origin: &Path) -> Result<Self, ConfigError> {
        let de = &mut serde_json::Deserializer::from_str(raw);
        serde_path_to_error::deserialize(de).map_err(|e| ConfigError::Json {
            path: origin.to_path_buf(),
            json_path: e.path().to_string(),
            source: e.into_inner(),
        })
    }
}
