//! Blocking Home Assistant client for the adaptive-lighting control layer.
//!
//! - Blocking client using `ureq` (no async); every call returns once the
//!   service call has completed, which is what lock-before-push ordering relies on.
//! - Covers the three calls the coordinator makes (boundaries, manual lock,
//!   light commands) plus entity state reads for the boost sensors.
//!
//! Authentication
//! - Long-lived access token sent as a bearer token on every request.

use crate::models::lighting::{Boundaries, EntityId, LightAction, LightId};
use log::debug;
use rand::Rng;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::num::NonZeroU32;
use std::thread;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const BASE_BACKOFF_MS: u64 = 250;
const MAX_JITTER_MS: u64 = 250;

#[derive(Debug)]
pub enum LightingError {
    Transport(String),
    Http { status: u16, context: String },
    Json(serde_json::Error),
}

impl core::fmt::Display for LightingError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            LightingError::Transport(s) => write!(f, "transport error: {}", s),
            LightingError::Http { status, context } => write!(f, "http {}: {}", status, context),
            LightingError::Json(e) => write!(f, "json error: {}", e),
        }
    }
}

impl std::error::Error for LightingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LightingError::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for LightingError {
    fn from(value: serde_json::Error) -> Self {
        LightingError::Json(value)
    }
}

impl LightingError {
    fn from_ureq(err: ureq::Error, context: &str) -> Self {
        match err {
            ureq::Error::StatusCode(status) => LightingError::Http {
                status,
                context: context.to_string(),
            },
            ureq::Error::Json(e) => LightingError::Json(e),
            other => LightingError::Transport(format!("{}: {}", context, other)),
        }
    }

    /// Transport failures and server-side errors are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            LightingError::Transport(_) => true,
            LightingError::Http { status, .. } => *status >= 500,
            LightingError::Json(_) => false,
        }
    }
}

/// The external adaptive-lighting layer as the coordinator sees it.
pub trait LightingLayer: Send + Sync {
    /// Replace the zone's brightness/color-temperature window. When `lights` is
    /// given, those lights are adapted into the new window immediately.
    fn set_boundaries(
        &self,
        control_entity: &EntityId,
        boundaries: &Boundaries,
        lights: Option<&[LightId]>,
    ) -> Result<(), LightingError>;

    /// Set or clear the manual-control flag for `lights` on the zone's control entity.
    fn set_lock(&self, control_entity: &EntityId, lights: &[LightId], locked: bool) -> Result<(), LightingError>;

    /// Forward one literal scene command.
    fn run_action(&self, action: &LightAction) -> Result<(), LightingError>;
}

/// Snapshot of one entity as returned by `GET /api/states/<entity_id>`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EntityState {
    pub entity_id: EntityId,
    pub state: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl EntityState {
    pub fn is_available(&self) -> bool {
        !matches!(self.state.as_str(), "unavailable" | "unknown" | "")
    }

    pub fn numeric_state(&self) -> Option<f64> {
        if !self.is_available() {
            return None;
        }
        self.state.trim().parse::<f64>().ok().filter(|v| v.is_finite())
    }

    pub fn numeric_attribute(&self, key: &str) -> Option<f64> {
        self.attributes.get(key).and_then(Value::as_f64)
    }
}

/// Read access to entity states, used by the boost calculators.
pub trait StateReader: Send + Sync {
    /// `Ok(None)` when the entity does not exist.
    fn get_state(&self, entity: &EntityId) -> Result<Option<EntityState>, LightingError>;
}

pub struct HomeAssistantClient {
    agent: ureq::Agent,
    base_url: String,
    auth_header: String,
    max_retries: NonZeroU32,
}

impl HomeAssistantClient {
    pub fn new(base_url: impl Into<String>, token: &str, max_retries: NonZeroU32) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(REQUEST_TIMEOUT))
            .build();
        HomeAssistantClient {
            agent: ureq::Agent::new_with_config(config),
            base_url: base_url.into(),
            auth_header: format!("Bearer {}", token),
            max_retries,
        }
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    /// Confirm the API is reachable and the token is accepted.
    pub fn ping(&self) -> Result<(), LightingError> {
        let url = self.url("/api/");
        self.with_retries("ping", || {
            self.agent
                .get(&url)
                .header("Authorization", self.auth_header.as_str())
                .call()
                .map(|_| ())
                .map_err(|e| LightingError::from_ureq(e, "GET /api/"))
        })
    }

    /// Invoke `domain.service` and wait for Home Assistant to finish executing it.
    pub fn call_service(&self, domain: &str, service: &str, data: &Value) -> Result<(), LightingError> {
        let path = format!("/api/services/{}/{}", domain, service);
        let url = self.url(&path);
        self.with_retries(&path, || {
            self.agent
                .post(&url)
                .header("Authorization", self.auth_header.as_str())
                .send_json(data)
                .map(|_| ())
                .map_err(|e| LightingError::from_ureq(e, &path))
        })
    }

    fn with_retries<T>(&self, what: &str, mut op: impl FnMut() -> Result<T, LightingError>) -> Result<T, LightingError> {
        let mut attempt: u32 = 0;
        loop {
            match op() {
                Err(e) if e.is_retryable() && attempt < self.max_retries.get() => {
                    attempt += 1;
                    let backoff = BASE_BACKOFF_MS.saturating_mul(1u64 << (attempt - 1).min(6))
                        + rand::rng().random_range(0..=MAX_JITTER_MS);
                    debug!("{} failed ({}); retry {} in {}ms", what, e, attempt, backoff);
                    thread::sleep(Duration::from_millis(backoff));
                }
                other => return other,
            }
        }
    }
}

impl LightingLayer for HomeAssistantClient {
    fn set_boundaries(
        &self,
        control_entity: &EntityId,
        boundaries: &Boundaries,
        lights: Option<&[LightId]>,
    ) -> Result<(), LightingError> {
        self.call_service(
            "adaptive_lighting",
            "change_switch_settings",
            &boundaries_payload(control_entity, boundaries),
        )?;
        if let Some(lights) = lights.filter(|l| !l.is_empty()) {
            self.call_service("adaptive_lighting", "apply", &apply_payload(control_entity, lights))?;
        }
        Ok(())
    }

    fn set_lock(&self, control_entity: &EntityId, lights: &[LightId], locked: bool) -> Result<(), LightingError> {
        self.call_service(
            "adaptive_lighting",
            "set_manual_control",
            &lock_payload(control_entity, lights, locked),
        )
    }

    fn run_action(&self, action: &LightAction) -> Result<(), LightingError> {
        let (service, data) = action_request(action);
        self.call_service("light", service, &data)
    }
}

impl StateReader for HomeAssistantClient {
    fn get_state(&self, entity: &EntityId) -> Result<Option<EntityState>, LightingError> {
        let path = format!("/api/states/{}", entity.0);
        let url = self.url(&path);
        let result = self.with_retries(&path, || {
            let mut resp: http::Response<ureq::Body> = self
                .agent
                .get(&url)
                .header("Authorization", self.auth_header.as_str())
                .call()
                .map_err(|e| LightingError::from_ureq(e, &path))?;
            resp.body_mut()
                .read_json::<EntityState>()
                .map_err(|e| LightingError::from_ureq(e, &path))
        });
        match result {
            Ok(state) => Ok(Some(state)),
            Err(LightingError::Http { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn boundaries_payload(control_entity: &EntityId, b: &Boundaries) -> Value {
    json!({
        "entity_id": control_entity.0,
        "min_brightness": b.min_brightness,
        "max_brightness": b.max_brightness,
        "min_color_temp": b.min_color_temp,
        "max_color_temp": b.max_color_temp,
        "use_defaults": "current",
    })
}

fn apply_payload(control_entity: &EntityId, lights: &[LightId]) -> Value {
    json!({
        "entity_id": control_entity.0,
        "lights": lights.iter().map(|l| l.0.as_str()).collect::<Vec<_>>(),
        "turn_on_lights": false,
        "adapt_brightness": true,
        "adapt_color": true,
    })
}

fn lock_payload(control_entity: &EntityId, lights: &[LightId], locked: bool) -> Value {
    json!({
        "entity_id": control_entity.0,
        "lights": lights.iter().map(|l| l.0.as_str()).collect::<Vec<_>>(),
        "manual_control": locked,
    })
}

fn action_request(action: &LightAction) -> (&'static str, Value) {
    let entity_ids: Vec<&str> = action.lights().iter().map(|l| l.0.as_str()).collect();
    match action {
        LightAction::TurnOn {
            brightness_pct,
            color_temp_kelvin,
            transition,
            ..
        } => {
            let mut data = Map::new();
            data.insert("entity_id".into(), json!(entity_ids));
            if let Some(pct) = brightness_pct {
                data.insert("brightness_pct".into(), json!(pct));
            }
            if let Some(kelvin) = color_temp_kelvin {
                data.insert("color_temp_kelvin".into(), json!(kelvin));
            }
            if let Some(t) = transition {
                data.insert("transition".into(), json!(t));
            }
            ("turn_on", Value::Object(data))
        }
        LightAction::TurnOff { transition, .. } => {
            let mut data = Map::new();
            data.insert("entity_id".into(), json!(entity_ids));
            if let Some(t) = transition {
                data.insert("transition".into(), json!(t));
            }
            ("turn_off", Value::Object(data))
        }
    }
}
