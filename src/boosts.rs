//! Boost calculators: environmental (lux/weather), sunset and wake ramp.
//!
//! The arithmetic lives in plain functions; [`HomeAssistantBoosts`] only reads
//! the sensors and feeds them in. A missing or unavailable sensor yields a
//! zero boost and is never reported as an error.

use crate::client::{EntityState, StateReader};
use crate::config::BoostSettings;
use crate::models::lighting::{EntityId, ZoneConfig};
use chrono::{DateTime, Duration, Local, NaiveDateTime, NaiveTime, TimeZone, Utc};
use log::debug;
use serde::Serialize;
use std::sync::Arc;

pub const ENVIRONMENTAL_BOOST_CAP: i32 = 25;
pub const SUNSET_ELEVATION_WINDOW: f64 = 4.0;
pub const SUNSET_MAX_BRIGHTNESS: i32 = 25;
pub const SUNSET_MAX_WARMTH_SHIFT: i32 = -500;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize)]
pub struct SunsetBoost {
    pub brightness: i32,
    pub warmth: i32,
}

/// Source of the three independent boost values.
pub trait BoostSource: Send + Sync {
    fn environmental_boost(&self) -> i32;
    fn sunset_boost(&self, zone: &ZoneConfig) -> SunsetBoost;
    fn wake_boost(&self, zone: &ZoneConfig) -> i32;
}

pub fn lux_boost(lux: f64) -> i32 {
    match lux {
        l if l < 10.0 => 25,
        l if l < 50.0 => 20,
        l if l < 100.0 => 15,
        l if l < 200.0 => 10,
        l if l < 500.0 => 5,
        _ => 0,
    }
}

/// Boost for a Home Assistant weather condition string.
pub fn weather_boost(condition: &str) -> i32 {
    match condition {
        "fog" => 15,
        "pouring" | "rainy" | "snowy" | "snowy-rainy" | "hail" | "lightning" | "lightning-rainy" => 10,
        "cloudy" => 5,
        _ => 0,
    }
}

pub fn environmental_boost_from(lux: Option<f64>, condition: Option<&str>) -> i32 {
    let from_lux = lux.map(lux_boost).unwrap_or(0);
    let from_weather = condition.map(weather_boost).unwrap_or(0);
    from_lux.max(from_weather).min(ENVIRONMENTAL_BOOST_CAP)
}

/// Linear ramp while the sun crosses the horizon band.
pub fn sunset_boost_from(elevation: f64) -> SunsetBoost {
    if !(-SUNSET_ELEVATION_WINDOW..=SUNSET_ELEVATION_WINDOW).contains(&elevation) {
        return SunsetBoost::default();
    }
    let fraction = (SUNSET_ELEVATION_WINDOW - elevation) / (2.0 * SUNSET_ELEVATION_WINDOW);
    SunsetBoost {
        brightness: (f64::from(SUNSET_MAX_BRIGHTNESS) * fraction).round() as i32,
        warmth: (f64::from(SUNSET_MAX_WARMTH_SHIFT) * fraction).round() as i32,
    }
}

/// Wake ramp value at `now` for an alarm at `alarm`.
///
/// Non-zero only inside `[alarm - duration, alarm)`, rising from 1 at the start
/// to `max_boost` at the alarm.
pub fn wake_boost_at(now: DateTime<Utc>, alarm: DateTime<Utc>, duration: Duration, max_boost: i32) -> i32 {
    let start = alarm - duration;
    if now < start || now >= alarm || max_boost <= 0 || duration <= Duration::zero() {
        return 0;
    }
    let elapsed = (now - start).num_milliseconds() as f64;
    let total = duration.num_milliseconds() as f64;
    let boost = (f64::from(max_boost) * elapsed / total).ceil() as i32;
    boost.clamp(1, max_boost)
}

/// Next alarm time from a `sensor.next_alarm` or `input_datetime` entity.
pub fn parse_alarm(state: &EntityState, now: DateTime<Local>) -> Option<DateTime<Utc>> {
    if !state.is_available() {
        return None;
    }
    let raw = state.state.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Local.from_local_datetime(&naive).single().map(|dt| dt.with_timezone(&Utc));
    }
    // time-only input_datetime: next occurrence, counting an alarm that already passed today as tomorrow's
    let time = NaiveTime::parse_from_str(raw, "%H:%M:%S").ok()?;
    let today = now.date_naive().and_time(time);
    let mut alarm = Local.from_local_datetime(&today).single()?;
    if alarm <= now {
        alarm = Local.from_local_datetime(&(today + Duration::days(1))).single()?;
    }
    Some(alarm.with_timezone(&Utc))
}

/// Boost source backed by Home Assistant sensor entities.
pub struct HomeAssistantBoosts<R> {
    reader: Arc<R>,
    settings: BoostSettings,
}

impl<R: StateReader> HomeAssistantBoosts<R> {
    pub fn new(reader: Arc<R>, settings: BoostSettings) -> Self {
        HomeAssistantBoosts { reader, settings }
    }

    fn read(&self, entity: Option<&EntityId>) -> Option<EntityState> {
        let entity = entity?;
        match self.reader.get_state(entity) {
            Ok(Some(state)) if state.is_available() => Some(state),
            Ok(Some(_)) => {
                debug!("Boost: sensor {} unavailable", entity);
                None
            }
            Ok(None) => {
                debug!("Boost: sensor {} not found", entity);
                None
            }
            Err(e) => {
                debug!("Boost: reading sensor {} failed: {}", entity, e);
                None
            }
        }
    }
}

impl<R: StateReader> BoostSource for HomeAssistantBoosts<R> {
    fn environmental_boost(&self) -> i32 {
        let lux = self
            .read(self.settings.lux_sensor.as_ref())
            .and_then(|s| s.numeric_state());
        let weather = self.read(self.settings.weather_entity.as_ref());
        environmental_boost_from(lux, weather.as_ref().map(|w| w.state.as_str()))
    }

    fn sunset_boost(&self, _zone: &ZoneConfig) -> SunsetBoost {
        self.read(self.settings.sun_entity.as_ref())
            .and_then(|s| s.numeric_attribute("elevation"))
            .map(sunset_boost_from)
            .unwrap_or_default()
    }

    fn wake_boost(&self, zone: &ZoneConfig) -> i32 {
        if !zone.wake_enabled {
            return 0;
        }
        let Some(alarm) = self
            .read(self.settings.wake_alarm_entity.as_ref())
            .and_then(|s| parse_alarm(&s, Local::now()))
        else {
            return 0;
        };
        wake_boost_at(
            Utc::now(),
            alarm,
            self.settings.wake_duration,
            self.settings.wake_max_boost,
        )
    }
}
