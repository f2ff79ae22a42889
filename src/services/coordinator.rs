//! Orchestrates lock ownership and boundary pushes for every zone.
//!
//! Each zone has its own mutex; any work touching a zone's lock or boundaries
//! (periodic sweep, button press, scene, timer expiry) runs while holding it.
//! Zones are updated on scoped worker threads so one slow or failing zone does
//! not hold up the others. Lock order is zone slot, then global state; the
//! global state mutex is never held while waiting for a zone.

use crate::boosts::BoostSource;
use crate::client::{LightingError, LightingLayer};
use crate::config::LockPolicy;
use crate::models::lighting::{
    Boundaries, GlobalAdjustmentState, LockReason, SceneId, SceneOffset, ZoneConfig, ZoneId,
};
use crate::notify::{CalculationEvent, Notifier, Trigger, ZoneCalculation, ZoneOutcome};
use crate::registry::ZoneRegistry;
use crate::services::aggregator::{Computation, CycleKind, SkipReason, ZoneInputs, compute_boundaries};
use crate::services::locks::{LockTimers, ZoneLockState, smart_timeout};
use crate::utils::lock_label;
use chrono::{DateTime, Local, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    UnknownZone(ZoneId),
    UnknownScene(SceneId),
}

impl Display for CoordinatorError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            CoordinatorError::UnknownZone(z) => write!(f, "unknown zone {}", z),
            CoordinatorError::UnknownScene(s) => write!(f, "unknown scene {}", s),
        }
    }
}

impl std::error::Error for CoordinatorError {}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZoneStatus {
    pub zone_id: ZoneId,
    pub enabled: bool,
    pub locked: bool,
    pub lock_reason: LockReason,
    pub expires_at: Option<DateTime<Utc>>,
    pub current_boundaries: Option<Boundaries>,
    pub wake_active: bool,
    pub scene_offset: Option<SceneOffset>,
    pub last_error: Option<String>,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Mutable per-zone state, guarded by the zone's mutex.
#[derive(Debug)]
struct ZoneSlot {
    enabled: bool,
    lock: ZoneLockState,
    wake_active: bool,
    scene_offset: Option<SceneOffset>,
    /// The external lock-false call failed and must be retried.
    pending_unlock: bool,
    boundaries: Option<Boundaries>,
    last_error: Option<String>,
    last_updated: Option<DateTime<Utc>>,
}

impl ZoneSlot {
    fn new() -> Self {
        ZoneSlot {
            enabled: true,
            lock: ZoneLockState::default(),
            wake_active: false,
            scene_offset: None,
            pending_unlock: false,
            boundaries: None,
            last_error: None,
            last_updated: None,
        }
    }
}

pub struct Coordinator {
    registry: ZoneRegistry,
    layer: Arc<dyn LightingLayer>,
    boosts: Arc<dyn BoostSource>,
    notifier: Arc<dyn Notifier>,
    policy: LockPolicy,
    global: Mutex<GlobalAdjustmentState>,
    slots: BTreeMap<ZoneId, Mutex<ZoneSlot>>,
    timers: LockTimers,
}

impl Coordinator {
    /// Build the coordinator and start its lock timer thread.
    pub fn new(
        registry: ZoneRegistry,
        layer: Arc<dyn LightingLayer>,
        boosts: Arc<dyn BoostSource>,
        notifier: Arc<dyn Notifier>,
        policy: LockPolicy,
    ) -> std::io::Result<Arc<Self>> {
        let slots = registry
            .zones()
            .map(|z| (z.id.clone(), Mutex::new(ZoneSlot::new())))
            .collect();
        let coordinator = Arc::new(Coordinator {
            registry,
            layer,
            boosts,
            notifier,
            policy,
            global: Mutex::new(GlobalAdjustmentState::default()),
            slots,
            timers: LockTimers::new(),
        });
        let weak = Arc::downgrade(&coordinator);
        coordinator.timers.spawn(move |zone, epoch| {
            if let Some(c) = weak.upgrade() {
                c.on_lock_expired(&zone, epoch);
            }
        })?;
        Ok(coordinator)
    }

    pub fn global_state(&self) -> GlobalAdjustmentState {
        self.global().clone()
    }

    // =====================
    // Public control surface
    // =====================

    pub fn adjust_brightness(&self, delta: i32) {
        let total = {
            let mut g = self.global();
            g.add_brightness(delta);
            g.brightness_delta
        };
        info!("Brightness adjusted by {:+} (total {:+})", delta, total);
        self.apply_user_adjustment(Trigger::AdjustBrightness);
    }

    pub fn adjust_warmth(&self, delta: i32) {
        let total = {
            let mut g = self.global();
            g.add_warmth(delta);
            g.warmth_delta
        };
        info!("Warmth adjusted by {:+}K (total {:+}K)", delta, total);
        self.apply_user_adjustment(Trigger::AdjustWarmth);
    }

    pub fn apply_scene(&self, scene_id: &SceneId) -> Result<(), CoordinatorError> {
        if scene_id.is_auto() {
            self.apply_auto_scene();
            return Ok(());
        }
        let scene = self
            .registry
            .scene(scene_id)
            .ok_or_else(|| CoordinatorError::UnknownScene(scene_id.clone()))?;
        info!("Applying scene {}", scene.display_name());

        for action in &scene.actions {
            if let Err(e) = self.layer.run_action(action) {
                warn!("Scene {}: light action {:?} failed: {}", scene.id, action, e);
            }
        }

        let targets = self.registry.targets_of(&scene.actions);
        for light in &targets.unmapped {
            warn!("Scene {}: light {} belongs to no zone; ignored", scene.id, light);
        }
        self.global().current_scene = scene.id.clone();

        let zones: Vec<&ZoneConfig> = targets.zones.iter().filter_map(|id| self.registry.zone(id)).collect();
        let offset = scene.offset();
        let environmental = self.environmental_reading(&zones);
        let outcomes = self.for_each_zone(&zones, |zone| {
            let mut slot = self.slot(&zone.id);
            slot.scene_offset = Some(offset);
            if !slot.enabled {
                return ZoneOutcome::Skipped {
                    reason: SkipReason::Disabled,
                };
            }
            if let Err(e) = self.acquire(zone, &mut slot, LockReason::Scene, Some(self.policy.scene_timeout)) {
                return self.fail(zone, &mut slot, "scene lock", e);
            }
            self.push(zone, &mut slot, CycleKind::LockOwner, false, environmental)
        });
        self.notify(Trigger::ApplyScene, outcomes);
        Ok(())
    }

    pub fn reset(&self) {
        *self.global() = GlobalAdjustmentState::default();
        info!("Adjustments reset");
        let zones: Vec<&ZoneConfig> = self.registry.zones().collect();
        let environmental = self.environmental_reading(&zones);
        let outcomes = self.for_each_zone(&zones, |zone| {
            let mut slot = self.slot(&zone.id);
            slot.scene_offset = None;
            match slot.lock.reason() {
                LockReason::UserAdjust | LockReason::Scene if slot.enabled => {
                    self.release_and_restore(zone, &mut slot, environmental)
                }
                _ => self.update_zone(zone, &mut slot, environmental),
            }
        });
        self.notify(Trigger::Reset, outcomes);
    }

    pub fn enable_zone(&self, zone_id: &ZoneId, enabled: bool) -> Result<(), CoordinatorError> {
        let zone = self
            .registry
            .zone(zone_id)
            .ok_or_else(|| CoordinatorError::UnknownZone(zone_id.clone()))?;
        let environmental = if enabled { self.environmental_reading(&[zone]) } else { 0 };
        let outcome = {
            let mut slot = self.slot(zone_id);
            slot.enabled = enabled;
            if enabled {
                info!("Zone {} enabled", zone_id);
                self.update_zone(zone, &mut slot, environmental)
            } else {
                info!("Zone {} disabled", zone_id);
                slot.wake_active = false;
                match self.release(zone, &mut slot) {
                    Ok(()) => ZoneOutcome::Skipped {
                        reason: SkipReason::Disabled,
                    },
                    Err(e) => self.fail(zone, &mut slot, "unlock", e),
                }
            }
        };
        self.notify(
            Trigger::EnableZone,
            vec![ZoneCalculation {
                zone_id: zone_id.clone(),
                outcome,
            }],
        );
        Ok(())
    }

    pub fn get_zone_status(&self, zone_id: &ZoneId) -> Result<ZoneStatus, CoordinatorError> {
        let slot = self
            .slots
            .get(zone_id)
            .ok_or_else(|| CoordinatorError::UnknownZone(zone_id.clone()))?
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(ZoneStatus {
            zone_id: zone_id.clone(),
            enabled: slot.enabled,
            locked: slot.lock.is_locked(),
            lock_reason: slot.lock.reason(),
            expires_at: slot.lock.expires_at(),
            current_boundaries: slot.boundaries,
            wake_active: slot.wake_active,
            scene_offset: slot.scene_offset,
            last_error: slot.last_error.clone(),
            last_updated: slot.last_updated,
        })
    }

    /// Periodic sweep over every zone.
    pub fn run_cycle(&self) {
        let zones: Vec<&ZoneConfig> = self.registry.zones().collect();
        let environmental = self.environmental_reading(&zones);
        let outcomes = self.for_each_zone(&zones, |zone| {
            let mut slot = self.slot(&zone.id);
            self.update_zone(zone, &mut slot, environmental)
        });
        self.notify(Trigger::Periodic, outcomes);
    }

    /// Timer callback; a no-op unless `epoch` still owns the zone's lock.
    pub(crate) fn on_lock_expired(&self, zone_id: &ZoneId, epoch: u64) {
        let Some(zone) = self.registry.zone(zone_id) else {
            return;
        };
        let environmental = self.environmental_reading(&[zone]);
        let outcome = {
            let mut slot = self.slot(zone_id);
            if !slot.lock.is_locked() || slot.lock.epoch() != epoch {
                debug!("Zone {}: stale lock timer (epoch {}) ignored", zone_id, epoch);
                return;
            }
            info!("Zone {}: {} lock expired", zone_id, lock_label(slot.lock.reason()));
            self.release_and_restore(zone, &mut slot, environmental)
        };
        self.notify(
            Trigger::LockExpired,
            vec![ZoneCalculation {
                zone_id: zone_id.clone(),
                outcome,
            }],
        );
    }

    // =====================
    // Per-zone operations (caller holds the zone's slot)
    // =====================

    fn apply_user_adjustment(&self, trigger: Trigger) {
        let zones: Vec<&ZoneConfig> = self.registry.zones().collect();
        let environmental = self.environmental_reading(&zones);
        let outcomes = self.for_each_zone(&zones, |zone| {
            let mut slot = self.slot(&zone.id);
            if !slot.enabled {
                return ZoneOutcome::Skipped {
                    reason: SkipReason::Disabled,
                };
            }
            let target = slot.boundaries.map(|b| b.min_brightness).unwrap_or(zone.min_brightness);
            let duration = smart_timeout(&self.policy, zone, Local::now().time(), target);
            if let Err(e) = self.acquire(zone, &mut slot, LockReason::UserAdjust, Some(duration)) {
                return self.fail(zone, &mut slot, "manual lock", e);
            }
            self.push(zone, &mut slot, CycleKind::LockOwner, false, environmental)
        });
        self.notify(trigger, outcomes);
    }

    fn apply_auto_scene(&self) {
        self.global().current_scene = SceneId::auto();
        info!("Applying scene {}", SceneId::AUTO);
        let zones: Vec<&ZoneConfig> = self.registry.zones().collect();
        let environmental = self.environmental_reading(&zones);
        let outcomes = self.for_each_zone(&zones, |zone| {
            let mut slot = self.slot(&zone.id);
            slot.scene_offset = None;
            if slot.lock.reason() == LockReason::Scene && slot.enabled {
                self.release_and_restore(zone, &mut slot, environmental)
            } else {
                self.update_zone(zone, &mut slot, environmental)
            }
        });
        self.notify(Trigger::ApplyScene, outcomes);
    }

    /// Regular update: retry a failed unlock, track the wake ramp, then push.
    fn update_zone(&self, zone: &ZoneConfig, slot: &mut ZoneSlot, environmental: i32) -> ZoneOutcome {
        if slot.pending_unlock && !slot.lock.is_locked() {
            if let Err(e) = self.layer.set_lock(&zone.control_entity, &zone.lights, false) {
                return self.fail(zone, slot, "unlock retry", e);
            }
            slot.pending_unlock = false;
            info!("Zone {}: deferred unlock delivered", zone.id);
        }
        if !slot.enabled {
            return ZoneOutcome::Skipped {
                reason: SkipReason::Disabled,
            };
        }

        let wake_boost = if zone.wake_enabled { self.boosts.wake_boost(zone) } else { 0 };
        let ramping = wake_boost > 0;
        // a ramp whose lock was lost (released by another owner, or a failed acquire) takes it back
        if ramping && (!slot.wake_active || !slot.lock.is_locked()) {
            if let Err(e) = self.acquire(zone, slot, LockReason::Wake, None) {
                return self.fail(zone, slot, "wake lock", e);
            }
            if slot.wake_active {
                info!("Zone {}: wake lock restored mid-ramp", zone.id);
            } else {
                slot.wake_active = true;
                info!("Zone {}: wake ramp started", zone.id);
            }
        } else if !ramping && slot.wake_active {
            slot.wake_active = false;
            info!("Zone {}: wake ramp finished", zone.id);
            if let Err(e) = self.release(zone, slot) {
                return self.fail(zone, slot, "wake unlock", e);
            }
        }

        let wake_boost = if slot.wake_active { wake_boost } else { 0 };
        self.push_with_wake(zone, slot, CycleKind::Periodic, false, environmental, wake_boost)
    }

    /// Environmental boost for one operation. It is global, so it is read once
    /// before the per-zone workers start, and not at all when no zone uses it.
    fn environmental_reading(&self, zones: &[&ZoneConfig]) -> i32 {
        if zones.iter().any(|z| z.environmental_enabled) {
            self.boosts.environmental_boost()
        } else {
            0
        }
    }

    /// Wake contribution counts only while the zone is in the wake-active set.
    fn wake_reading(&self, zone: &ZoneConfig, slot: &ZoneSlot) -> i32 {
        if slot.wake_active && zone.wake_enabled {
            self.boosts.wake_boost(zone)
        } else {
            0
        }
    }

    /// Set the external lock and record the hold. The external call completes
    /// before this returns, so any later push in the same operation is ordered after it.
    fn acquire(
        &self,
        zone: &ZoneConfig,
        slot: &mut ZoneSlot,
        reason: LockReason,
        duration: Option<Duration>,
    ) -> Result<(), LightingError> {
        self.layer.set_lock(&zone.control_entity, &zone.lights, true)?;
        slot.pending_unlock = false;

        let previous = slot.lock.reason();
        let expires_at = duration.and_then(expiry_after);
        let epoch = slot.lock.hold(reason, expires_at);
        match duration {
            Some(d) => self.timers.schedule(zone.id.clone(), epoch, d),
            None => self.timers.cancel(&zone.id),
        }

        if previous == reason {
            debug!("Zone {}: {} lock extended", zone.id, lock_label(reason));
        } else {
            info!(
                "Zone {}: locked for {} (was {}, timeout {})",
                zone.id,
                lock_label(reason),
                lock_label(previous),
                duration
                    .map(|d| format!("{}s", d.as_secs()))
                    .unwrap_or_else(|| "none".to_string())
            );
        }
        Ok(())
    }

    /// Drop the hold and clear the external lock. A failed lock-false call is
    /// retried by later updates.
    fn release(&self, zone: &ZoneConfig, slot: &mut ZoneSlot) -> Result<(), LightingError> {
        self.timers.cancel(&zone.id);
        let Some(hold) = slot.lock.clear() else {
            return Ok(());
        };
        info!("Zone {}: {} lock released", zone.id, lock_label(hold.reason));
        match self.layer.set_lock(&zone.control_entity, &zone.lights, false) {
            Ok(()) => {
                slot.pending_unlock = false;
                Ok(())
            }
            Err(e) => {
                slot.pending_unlock = true;
                Err(e)
            }
        }
    }

    /// Release, then push current boundaries naming the member lights so they
    /// return to the adaptive window immediately. A wake ramp still in progress
    /// takes its lock back before the push.
    fn release_and_restore(&self, zone: &ZoneConfig, slot: &mut ZoneSlot, environmental: i32) -> ZoneOutcome {
        if let Err(e) = self.release(zone, slot) {
            return self.fail(zone, slot, "unlock", e);
        }
        if slot.wake_active {
            if let Err(e) = self.acquire(zone, slot, LockReason::Wake, None) {
                return self.fail(zone, slot, "wake lock", e);
            }
        }
        self.push(zone, slot, CycleKind::LockOwner, true, environmental)
    }

    fn push(
        &self,
        zone: &ZoneConfig,
        slot: &mut ZoneSlot,
        kind: CycleKind,
        name_lights: bool,
        environmental: i32,
    ) -> ZoneOutcome {
        let wake_boost = self.wake_reading(zone, slot);
        self.push_with_wake(zone, slot, kind, name_lights, environmental, wake_boost)
    }

    fn push_with_wake(
        &self,
        zone: &ZoneConfig,
        slot: &mut ZoneSlot,
        kind: CycleKind,
        name_lights: bool,
        environmental: i32,
        wake_boost: i32,
    ) -> ZoneOutcome {
        let global = self.global_state();
        let inputs = ZoneInputs {
            config: zone,
            enabled: slot.enabled,
            lock: slot.lock.reason(),
            wake_active: slot.wake_active,
            environmental,
            wake_boost,
            scene_offset: slot.scene_offset.unwrap_or_default(),
        };
        match compute_boundaries(&inputs, &global, self.boosts.as_ref(), kind) {
            Computation::Skip(reason) => {
                debug!("Zone {}: skipped ({:?})", zone.id, reason);
                ZoneOutcome::Skipped { reason }
            }
            Computation::Push { boundaries, breakdown } => {
                let lights = name_lights.then_some(zone.lights.as_slice());
                match self.layer.set_boundaries(&zone.control_entity, &boundaries, lights) {
                    Ok(()) => {
                        if slot.boundaries != Some(boundaries) {
                            debug!(
                                "Zone {}: boundaries brightness {}-{}%, color temp {}-{}K",
                                zone.id,
                                boundaries.min_brightness,
                                boundaries.max_brightness,
                                boundaries.min_color_temp,
                                boundaries.max_color_temp
                            );
                        }
                        slot.boundaries = Some(boundaries);
                        slot.last_error = None;
                        slot.last_updated = Some(Utc::now());
                        ZoneOutcome::Pushed { boundaries, breakdown }
                    }
                    Err(e) => self.fail(zone, slot, "boundary push", e),
                }
            }
        }
    }

    fn fail(&self, zone: &ZoneConfig, slot: &mut ZoneSlot, what: &str, err: LightingError) -> ZoneOutcome {
        warn!("Zone {}: {} failed: {}", zone.id, what, err);
        let error = format!("{} failed: {}", what, err);
        slot.last_error = Some(error.clone());
        ZoneOutcome::Failed { error }
    }

    // =====================
    // Plumbing
    // =====================

    fn global(&self) -> MutexGuard<'_, GlobalAdjustmentState> {
        self.global.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, zone: &ZoneId) -> MutexGuard<'_, ZoneSlot> {
        // slots are created for every registry zone, and callers only pass registry ids
        self.slots[zone].lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` for each zone on its own scoped thread and collect the outcomes.
    fn for_each_zone<F>(&self, zones: &[&ZoneConfig], f: F) -> Vec<ZoneCalculation>
    where
        F: Fn(&ZoneConfig) -> ZoneOutcome + Sync,
    {
        let f = &f;
        thread::scope(|s| {
            let handles: Vec<_> = zones
                .iter()
                .map(|&zone| (zone.id.clone(), s.spawn(move || f(zone))))
                .collect();
            handles
                .into_iter()
                .map(|(zone_id, handle)| {
                    let outcome = handle.join().unwrap_or_else(|_| {
                        warn!("Zone {}: update panicked", zone_id);
                        ZoneOutcome::Failed {
                            error: "update panicked".to_string(),
                        }
                    });
                    ZoneCalculation { zone_id, outcome }
                })
                .collect()
        })
    }

    fn notify(&self, trigger: Trigger, zones: Vec<ZoneCalculation>) {
        let global = self.global_state();
        self.notifier.calculation_complete(&CalculationEvent {
            trigger,
            at: Utc::now(),
            brightness_delta: global.brightness_delta,
            warmth_delta: global.warmth_delta,
            scene: global.current_scene,
            zones,
        });
    }
}

fn expiry_after(d: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| Utc::now().checked_add_signed(d))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boosts::SunsetBoost;
    use crate::config::ZonesFile;
    use crate::models::lighting::{EntityId, LightAction, LightId};
    use crate::registry::tests::zone;
    use std::collections::{HashMap, HashSet};
    use std::path::Path;
    use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Lock { entity: String, locked: bool },
        Boundaries { entity: String, boundaries: Boundaries, named_lights: bool },
        Action(Vec<LightId>),
    }

    #[derive(Default)]
    struct FakeLayer {
        calls: Mutex<Vec<Call>>,
        failing: Mutex<HashSet<String>>,
        failing_locks: Mutex<HashSet<String>>,
    }

    impl FakeLayer {
        fn calls_for(&self, entity: &str) -> Vec<Call> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| match c {
                    Call::Lock { entity: e, .. } | Call::Boundaries { entity: e, .. } => e == entity,
                    Call::Action(_) => false,
                })
                .cloned()
                .collect()
        }

        fn actions(&self) -> Vec<Vec<LightId>> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter_map(|c| match c {
                    Call::Action(lights) => Some(lights.clone()),
                    _ => None,
                })
                .collect()
        }

        fn clear(&self) {
            self.calls.lock().unwrap().clear();
        }

        fn set_failing(&self, entity: &str, failing: bool) {
            let mut set = self.failing.lock().unwrap();
            if failing {
                set.insert(entity.to_string());
            } else {
                set.remove(entity);
            }
        }

        fn set_locks_failing(&self, entity: &str, failing: bool) {
            let mut set = self.failing_locks.lock().unwrap();
            if failing {
                set.insert(entity.to_string());
            } else {
                set.remove(entity);
            }
        }

        fn check(&self, entity: &EntityId) -> Result<(), LightingError> {
            if self.failing.lock().unwrap().contains(&entity.0) {
                return Err(LightingError::Http {
                    status: 503,
                    context: "unavailable".into(),
                });
            }
            Ok(())
        }
    }

    impl LightingLayer for FakeLayer {
        fn set_boundaries(
            &self,
            control_entity: &EntityId,
            boundaries: &Boundaries,
            lights: Option<&[LightId]>,
        ) -> Result<(), LightingError> {
            self.check(control_entity)?;
            self.calls.lock().unwrap().push(Call::Boundaries {
                entity: control_entity.0.clone(),
                boundaries: *boundaries,
                named_lights: lights.is_some(),
            });
            Ok(())
        }

        fn set_lock(&self, control_entity: &EntityId, _lights: &[LightId], locked: bool) -> Result<(), LightingError> {
            self.check(control_entity)?;
            if self.failing_locks.lock().unwrap().contains(&control_entity.0) {
                return Err(LightingError::Transport("manual control service timed out".into()));
            }
            self.calls.lock().unwrap().push(Call::Lock {
                entity: control_entity.0.clone(),
                locked,
            });
            Ok(())
        }

        fn run_action(&self, action: &LightAction) -> Result<(), LightingError> {
            self.calls.lock().unwrap().push(Call::Action(action.lights().to_vec()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeBoosts {
        environmental: AtomicI32,
        environmental_reads: AtomicUsize,
        wake: Mutex<HashMap<String, i32>>,
    }

    impl FakeBoosts {
        fn set_wake(&self, zone: &str, value: i32) {
            self.wake.lock().unwrap().insert(zone.to_string(), value);
        }
    }

    impl BoostSource for FakeBoosts {
        fn environmental_boost(&self) -> i32 {
            self.environmental_reads.fetch_add(1, Ordering::SeqCst);
            self.environmental.load(Ordering::SeqCst)
        }

        fn sunset_boost(&self, _zone: &ZoneConfig) -> SunsetBoost {
            SunsetBoost::default()
        }

        fn wake_boost(&self, zone: &ZoneConfig) -> i32 {
            self.wake.lock().unwrap().get(&zone.id.0).copied().unwrap_or(0)
        }
    }

    #[derive(Default)]
    struct RecordingNotifier(Mutex<Vec<CalculationEvent>>);

    impl RecordingNotifier {
        fn last(&self) -> CalculationEvent {
            self.0.lock().unwrap().last().cloned().expect("an event was emitted")
        }

        fn count(&self) -> usize {
            self.0.lock().unwrap().len()
        }
    }

    impl Notifier for RecordingNotifier {
        fn calculation_complete(&self, event: &CalculationEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    struct Harness {
        coordinator: Arc<Coordinator>,
        layer: Arc<FakeLayer>,
        boosts: Arc<FakeBoosts>,
        notifier: Arc<RecordingNotifier>,
    }

    fn policy() -> LockPolicy {
        LockPolicy {
            manual_timeout: Duration::from_secs(7200),
            scene_timeout: Duration::from_secs(3600),
            sleep_window: None,
            dim_threshold_pct: 30,
        }
    }

    fn harness(registry: ZoneRegistry) -> Harness {
        let layer = Arc::new(FakeLayer::default());
        let boosts = Arc::new(FakeBoosts::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let coordinator = Coordinator::new(
            registry,
            layer.clone(),
            boosts.clone(),
            notifier.clone(),
            policy(),
        )
        .expect("coordinator");
        Harness {
            coordinator,
            layer,
            boosts,
            notifier,
        }
    }

    fn fixture() -> Harness {
        let file = ZonesFile::load(Path::new("tests/data/zones.json")).expect("fixture present");
        harness(ZoneRegistry::from_file(file).expect("registry"))
    }

    fn id(s: &str) -> ZoneId {
        ZoneId(s.to_string())
    }

    const LIVING: &str = "switch.adaptive_lighting_living_room";
    const BEDROOM: &str = "switch.adaptive_lighting_bedroom";

    fn boundaries(min_b: u8, max_b: u8, min_w: u16, max_w: u16) -> Boundaries {
        Boundaries {
            min_brightness: min_b,
            max_brightness: max_b,
            min_color_temp: min_w,
            max_color_temp: max_w,
        }
    }

    #[test]
    fn brightness_press_locks_before_pushing() {
        let h = fixture();
        let before = Utc::now();
        h.coordinator.adjust_brightness(20);

        assert_eq!(
            h.layer.calls_for(LIVING),
            vec![
                Call::Lock {
                    entity: LIVING.into(),
                    locked: true
                },
                Call::Boundaries {
                    entity: LIVING.into(),
                    boundaries: boundaries(60, 100, 2200, 5500),
                    named_lights: false
                },
            ]
        );

        let status = h.coordinator.get_zone_status(&id("living_room")).expect("status");
        assert!(status.locked);
        assert_eq!(status.lock_reason, LockReason::UserAdjust);
        assert_eq!(status.current_boundaries, Some(boundaries(60, 100, 2200, 5500)));
        let expires = status.expires_at.expect("timed lock");
        let secs = (expires - before).num_seconds();
        assert!((7199..=7201).contains(&secs), "expiry {}s", secs);

        // bedroom: override 3600s, dim (base min 10 < 30) so 1.3x
        let bedroom = h.coordinator.get_zone_status(&id("bedroom")).expect("status");
        let secs = (bedroom.expires_at.expect("timed lock") - before).num_seconds();
        assert!((4679..=4681).contains(&secs), "expiry {}s", secs);
    }

    #[test]
    fn periodic_cycle_leaves_user_locked_zones_alone() {
        let h = fixture();
        h.coordinator.adjust_brightness(20);
        h.layer.clear();
        h.coordinator.run_cycle();

        assert!(h.layer.calls_for(LIVING).is_empty());
        assert!(h.layer.calls_for(BEDROOM).is_empty());
        let event = h.notifier.last();
        assert_eq!(event.trigger, Trigger::Periodic);
        assert_eq!(
            event.zone(&id("living_room")),
            Some(&ZoneOutcome::Skipped {
                reason: SkipReason::HeldByUser
            })
        );
    }

    #[test]
    fn narrow_zone_request_is_capped() {
        let registry =
            ZoneRegistry::new(vec![zone("hall", &["light.hall"], (45, 80), (2200, 5500))], vec![]).expect("registry");
        let h = harness(registry);
        h.coordinator.adjust_brightness(60);
        let status = h.coordinator.get_zone_status(&id("hall")).expect("status");
        assert_eq!(status.current_boundaries, Some(boundaries(75, 80, 2200, 5500)));
    }

    #[test]
    fn scene_only_touches_zones_it_names() {
        let h = fixture();
        let bedroom_before = h.coordinator.get_zone_status(&id("bedroom")).expect("status");

        h.coordinator
            .apply_scene(&SceneId("evening_comfort".into()))
            .expect("known scene");

        assert_eq!(h.layer.actions().len(), 2);
        assert_eq!(
            h.layer.calls_for(LIVING),
            vec![
                Call::Lock {
                    entity: LIVING.into(),
                    locked: true
                },
                Call::Boundaries {
                    entity: LIVING.into(),
                    boundaries: boundaries(40, 85, 2200, 5000),
                    named_lights: false
                },
            ]
        );
        let living = h.coordinator.get_zone_status(&id("living_room")).expect("status");
        assert_eq!(living.lock_reason, LockReason::Scene);
        assert_eq!(
            living.scene_offset,
            Some(SceneOffset {
                brightness: -15,
                warmth: -500
            })
        );

        assert!(h.layer.calls_for(BEDROOM).is_empty());
        let bedroom_after = h.coordinator.get_zone_status(&id("bedroom")).expect("status");
        assert_eq!(bedroom_before, bedroom_after);
        assert_eq!(bedroom_after.scene_offset, None);
        assert_eq!(
            h.coordinator.global_state().current_scene,
            SceneId("evening_comfort".into())
        );
    }

    #[test]
    fn auto_scene_releases_scene_locks_and_restores() {
        let h = fixture();
        h.coordinator
            .apply_scene(&SceneId("evening_comfort".into()))
            .expect("known scene");
        h.layer.clear();

        h.coordinator.apply_scene(&SceneId::auto()).expect("auto");

        assert_eq!(
            h.layer.calls_for(LIVING),
            vec![
                Call::Lock {
                    entity: LIVING.into(),
                    locked: false
                },
                Call::Boundaries {
                    entity: LIVING.into(),
                    boundaries: boundaries(40, 100, 2200, 5500),
                    named_lights: true
                },
            ]
        );
        let living = h.coordinator.get_zone_status(&id("living_room")).expect("status");
        assert!(!living.locked);
        assert_eq!(living.scene_offset, None);
        assert!(h.coordinator.global_state().current_scene.is_auto());

        // the untouched bedroom just gets a regular update
        assert_eq!(
            h.layer.calls_for(BEDROOM),
            vec![Call::Boundaries {
                entity: BEDROOM.into(),
                boundaries: boundaries(10, 70, 2000, 4000),
                named_lights: false
            }]
        );
    }

    #[test]
    fn wake_ramp_holds_lock_for_its_duration() {
        let mut bedroom = zone("bedroom", &["light.bedside"], (10, 70), (2000, 4000));
        bedroom.wake_enabled = true;
        let registry = ZoneRegistry::new(vec![bedroom], vec![]).expect("registry");
        let h = harness(registry);
        h.boosts.environmental.store(25, Ordering::SeqCst);
        let entity = "switch.adaptive_lighting_bedroom";

        h.boosts.set_wake("bedroom", 20);
        h.coordinator.run_cycle();
        assert_eq!(
            h.layer.calls_for(entity),
            vec![
                Call::Lock {
                    entity: entity.into(),
                    locked: true
                },
                Call::Boundaries {
                    entity: entity.into(),
                    boundaries: boundaries(30, 70, 2000, 4000),
                    named_lights: false
                },
            ]
        );
        let status = h.coordinator.get_zone_status(&id("bedroom")).expect("status");
        assert_eq!(status.lock_reason, LockReason::Wake);
        assert_eq!(status.expires_at, None);
        assert!(status.wake_active);
        match h.notifier.last().zone(&id("bedroom")) {
            Some(ZoneOutcome::Pushed { breakdown, .. }) => {
                assert_eq!(breakdown.environmental, 0);
                assert_eq!(breakdown.wake, 20);
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        // mid-ramp cycles keep pushing without re-locking
        h.layer.clear();
        h.boosts.set_wake("bedroom", 25);
        h.coordinator.run_cycle();
        assert_eq!(
            h.layer.calls_for(entity),
            vec![Call::Boundaries {
                entity: entity.into(),
                boundaries: boundaries(35, 70, 2000, 4000),
                named_lights: false
            }]
        );

        // ramp over: unlock, environmental boost returns in the same cycle
        h.layer.clear();
        h.boosts.set_wake("bedroom", 0);
        h.coordinator.run_cycle();
        assert_eq!(
            h.layer.calls_for(entity),
            vec![
                Call::Lock {
                    entity: entity.into(),
                    locked: false
                },
                Call::Boundaries {
                    entity: entity.into(),
                    boundaries: boundaries(35, 70, 2000, 4000),
                    named_lights: false
                },
            ]
        );
        let status = h.coordinator.get_zone_status(&id("bedroom")).expect("status");
        assert!(!status.locked);
        assert!(!status.wake_active);
    }

    const BEDSIDE: &str = "switch.adaptive_lighting_bedroom";

    /// Single wake-enabled bedroom, ramp running at 20, sunny enough for an environmental 25.
    fn ramping_bedroom() -> Harness {
        let mut bedroom = zone("bedroom", &["light.bedside"], (10, 70), (2000, 4000));
        bedroom.wake_enabled = true;
        let h = harness(ZoneRegistry::new(vec![bedroom], vec![]).expect("registry"));
        h.boosts.environmental.store(25, Ordering::SeqCst);
        h.boosts.set_wake("bedroom", 20);
        h.coordinator.run_cycle();
        assert_eq!(
            h.coordinator.get_zone_status(&id("bedroom")).expect("status").lock_reason,
            LockReason::Wake
        );
        h
    }

    #[test]
    fn wake_lock_returns_when_user_lock_expires_mid_ramp() {
        let h = ramping_bedroom();
        h.coordinator.adjust_brightness(10);
        let status = h.coordinator.get_zone_status(&id("bedroom")).expect("status");
        assert_eq!(status.lock_reason, LockReason::UserAdjust);
        let epoch = h.coordinator.slot(&id("bedroom")).lock.epoch();
        h.layer.clear();

        h.coordinator.on_lock_expired(&id("bedroom"), epoch);
        assert_eq!(
            h.layer.calls_for(BEDSIDE),
            vec![
                Call::Lock {
                    entity: BEDSIDE.into(),
                    locked: false
                },
                Call::Lock {
                    entity: BEDSIDE.into(),
                    locked: true
                },
                Call::Boundaries {
                    entity: BEDSIDE.into(),
                    boundaries: boundaries(40, 70, 2000, 4000),
                    named_lights: true
                },
            ]
        );
        let status = h.coordinator.get_zone_status(&id("bedroom")).expect("status");
        assert!(status.locked);
        assert_eq!(status.lock_reason, LockReason::Wake);
        assert_eq!(status.expires_at, None);
        assert_eq!(h.coordinator.timers.pending_epoch(&id("bedroom")), None);

        // the rest of the ramp runs under the wake lock
        h.layer.clear();
        h.boosts.set_wake("bedroom", 15);
        h.coordinator.run_cycle();
        assert_eq!(
            h.layer.calls_for(BEDSIDE),
            vec![Call::Boundaries {
                entity: BEDSIDE.into(),
                boundaries: boundaries(35, 70, 2000, 4000),
                named_lights: false
            }]
        );
        assert_eq!(
            h.coordinator.get_zone_status(&id("bedroom")).expect("status").lock_reason,
            LockReason::Wake
        );
    }

    #[test]
    fn reset_mid_ramp_keeps_wake_lock() {
        let h = ramping_bedroom();
        h.coordinator.adjust_brightness(10);
        h.layer.clear();

        h.coordinator.reset();
        assert_eq!(
            h.layer.calls_for(BEDSIDE),
            vec![
                Call::Lock {
                    entity: BEDSIDE.into(),
                    locked: false
                },
                Call::Lock {
                    entity: BEDSIDE.into(),
                    locked: true
                },
                Call::Boundaries {
                    entity: BEDSIDE.into(),
                    boundaries: boundaries(30, 70, 2000, 4000),
                    named_lights: true
                },
            ]
        );

        h.layer.clear();
        h.boosts.set_wake("bedroom", 15);
        h.coordinator.run_cycle();
        let status = h.coordinator.get_zone_status(&id("bedroom")).expect("status");
        assert!(status.locked);
        assert_eq!(status.lock_reason, LockReason::Wake);
        assert_eq!(status.current_boundaries, Some(boundaries(25, 70, 2000, 4000)));
    }

    #[test]
    fn ramp_relocks_after_a_lost_wake_lock() {
        let h = ramping_bedroom();
        h.coordinator.slot(&id("bedroom")).lock.clear();
        h.layer.clear();

        h.coordinator.run_cycle();
        assert_eq!(
            h.layer.calls_for(BEDSIDE).first(),
            Some(&Call::Lock {
                entity: BEDSIDE.into(),
                locked: true
            })
        );
        assert_eq!(
            h.coordinator.get_zone_status(&id("bedroom")).expect("status").lock_reason,
            LockReason::Wake
        );
    }

    #[test]
    fn failed_wake_unlock_abandons_the_cycle() {
        let h = ramping_bedroom();
        h.layer.set_locks_failing(BEDSIDE, true);
        h.layer.clear();

        h.boosts.set_wake("bedroom", 0);
        h.coordinator.run_cycle();
        assert!(h.layer.calls_for(BEDSIDE).is_empty());
        let status = h.coordinator.get_zone_status(&id("bedroom")).expect("status");
        assert!(!status.locked);
        assert!(!status.wake_active);
        assert!(status.last_error.as_deref().is_some_and(|e| e.starts_with("wake unlock")));
        assert!(matches!(
            h.notifier.last().zone(&id("bedroom")),
            Some(ZoneOutcome::Failed { .. })
        ));

        h.layer.set_locks_failing(BEDSIDE, false);
        h.coordinator.run_cycle();
        assert_eq!(
            h.layer.calls_for(BEDSIDE),
            vec![
                Call::Lock {
                    entity: BEDSIDE.into(),
                    locked: false
                },
                Call::Boundaries {
                    entity: BEDSIDE.into(),
                    boundaries: boundaries(35, 70, 2000, 4000),
                    named_lights: false
                },
            ]
        );
        assert_eq!(h.coordinator.get_zone_status(&id("bedroom")).expect("status").last_error, None);
    }

    #[test]
    fn environmental_boost_is_read_once_per_operation() {
        let registry = ZoneRegistry::new(
            vec![
                zone("kitchen", &["light.kitchen"], (40, 100), (2200, 5500)),
                zone("hall", &["light.hall"], (20, 90), (2200, 5500)),
                zone("study", &["light.desk"], (30, 100), (2700, 6500)),
            ],
            vec![],
        )
        .expect("registry");
        let h = harness(registry);
        h.boosts.environmental.store(10, Ordering::SeqCst);

        h.coordinator.run_cycle();
        assert_eq!(h.boosts.environmental_reads.load(Ordering::SeqCst), 1);
        for zone in ["kitchen", "hall", "study"] {
            match h.notifier.last().zone(&id(zone)) {
                Some(ZoneOutcome::Pushed { breakdown, .. }) => assert_eq!(breakdown.environmental, 10),
                other => panic!("unexpected outcome {:?}", other),
            }
        }

        h.coordinator.adjust_brightness(5);
        assert_eq!(h.boosts.environmental_reads.load(Ordering::SeqCst), 2);

        // no zone wants it: no read at all
        let mut dark = zone("cellar", &["light.cellar"], (10, 60), (2200, 4000));
        dark.environmental_enabled = false;
        let h = harness(ZoneRegistry::new(vec![dark], vec![]).expect("registry"));
        h.coordinator.run_cycle();
        assert_eq!(h.boosts.environmental_reads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn stale_timer_is_ignored() {
        let h = fixture();
        h.coordinator.adjust_brightness(10);
        let first = h.coordinator.slot(&id("living_room")).lock.epoch();
        h.coordinator.adjust_brightness(10);
        let second = h.coordinator.slot(&id("living_room")).lock.epoch();
        assert_ne!(first, second);
        assert_eq!(h.coordinator.timers.pending_epoch(&id("living_room")), Some(second));
        h.layer.clear();

        h.coordinator.on_lock_expired(&id("living_room"), first);
        assert!(h.layer.calls_for(LIVING).is_empty());
        assert!(h.coordinator.get_zone_status(&id("living_room")).expect("status").locked);

        h.coordinator.on_lock_expired(&id("living_room"), second);
        assert_eq!(
            h.layer.calls_for(LIVING),
            vec![
                Call::Lock {
                    entity: LIVING.into(),
                    locked: false
                },
                Call::Boundaries {
                    entity: LIVING.into(),
                    boundaries: boundaries(60, 100, 2200, 5500),
                    named_lights: true
                },
            ]
        );
        assert!(!h.coordinator.get_zone_status(&id("living_room")).expect("status").locked);
        assert_eq!(h.notifier.last().trigger, Trigger::LockExpired);
    }

    #[test]
    fn reset_clears_deltas_and_locks() {
        let h = fixture();
        h.coordinator.adjust_brightness(20);
        h.coordinator.adjust_warmth(-800);
        h.layer.clear();

        h.coordinator.reset();

        let global = h.coordinator.global_state();
        assert_eq!(global, GlobalAdjustmentState::default());
        for zone in ["living_room", "bedroom"] {
            let status = h.coordinator.get_zone_status(&id(zone)).expect("status");
            assert!(!status.locked);
            assert_eq!(h.coordinator.timers.pending_epoch(&id(zone)), None);
        }
        assert_eq!(
            h.layer.calls_for(LIVING).last(),
            Some(&Call::Boundaries {
                entity: LIVING.into(),
                boundaries: boundaries(40, 100, 2200, 5500),
                named_lights: true
            })
        );
    }

    #[test]
    fn failing_zone_does_not_block_others() {
        let h = fixture();
        h.layer.set_failing(LIVING, true);
        h.coordinator.adjust_brightness(20);

        assert!(h.layer.calls_for(LIVING).is_empty());
        let living = h.coordinator.get_zone_status(&id("living_room")).expect("status");
        assert!(!living.locked);
        assert!(living.last_error.is_some());
        assert!(matches!(
            h.notifier.last().zone(&id("living_room")),
            Some(ZoneOutcome::Failed { .. })
        ));

        let bedroom = h.coordinator.get_zone_status(&id("bedroom")).expect("status");
        assert!(bedroom.locked);
        assert_eq!(bedroom.current_boundaries, Some(boundaries(30, 70, 2000, 4000)));
    }

    #[test]
    fn failed_unlock_is_retried_next_cycle() {
        let h = fixture();
        h.coordinator.adjust_brightness(20);
        let epoch = h.coordinator.slot(&id("living_room")).lock.epoch();

        h.layer.set_failing(LIVING, true);
        h.coordinator.on_lock_expired(&id("living_room"), epoch);
        let status = h.coordinator.get_zone_status(&id("living_room")).expect("status");
        assert!(!status.locked);
        assert!(status.last_error.is_some());

        h.layer.set_failing(LIVING, false);
        h.layer.clear();
        h.coordinator.run_cycle();
        assert_eq!(
            h.layer.calls_for(LIVING),
            vec![
                Call::Lock {
                    entity: LIVING.into(),
                    locked: false
                },
                Call::Boundaries {
                    entity: LIVING.into(),
                    boundaries: boundaries(60, 100, 2200, 5500),
                    named_lights: false
                },
            ]
        );
        assert_eq!(
            h.coordinator.get_zone_status(&id("living_room")).expect("status").last_error,
            None
        );
    }

    #[test]
    fn disabling_releases_and_enabling_repushes() {
        let h = fixture();
        h.coordinator.adjust_brightness(20);
        h.layer.clear();

        h.coordinator.enable_zone(&id("living_room"), false).expect("known zone");
        assert_eq!(
            h.layer.calls_for(LIVING),
            vec![Call::Lock {
                entity: LIVING.into(),
                locked: false
            }]
        );
        h.coordinator.run_cycle();
        assert_eq!(h.layer.calls_for(LIVING).len(), 1);
        assert!(matches!(
            h.notifier.last().zone(&id("living_room")),
            Some(ZoneOutcome::Skipped {
                reason: SkipReason::Disabled
            })
        ));

        h.coordinator.adjust_brightness(5);
        assert_eq!(h.layer.calls_for(LIVING).len(), 1);

        h.coordinator.enable_zone(&id("living_room"), true).expect("known zone");
        assert_eq!(
            h.layer.calls_for(LIVING).last(),
            Some(&Call::Boundaries {
                entity: LIVING.into(),
                boundaries: boundaries(65, 100, 2200, 5500),
                named_lights: false
            })
        );
    }

    #[test]
    fn every_mutating_call_notifies() {
        let h = fixture();
        h.coordinator.adjust_brightness(10);
        h.coordinator.adjust_warmth(300);
        h.coordinator.apply_scene(&SceneId("ultra_dim".into())).expect("known scene");
        h.coordinator.reset();
        h.coordinator.enable_zone(&id("bedroom"), false).expect("known zone");
        assert_eq!(h.notifier.count(), 5);

        let event = h.notifier.last();
        assert_eq!(event.trigger, Trigger::EnableZone);
        assert_eq!(event.zones.len(), 1);
    }

    #[test]
    fn unknown_ids_are_rejected() {
        let h = fixture();
        assert_eq!(
            h.coordinator.apply_scene(&SceneId("disco".into())),
            Err(CoordinatorError::UnknownScene(SceneId("disco".into())))
        );
        assert_eq!(
            h.coordinator.enable_zone(&id("attic"), true),
            Err(CoordinatorError::UnknownZone(id("attic")))
        );
        assert!(h.coordinator.get_zone_status(&id("attic")).is_err());
        assert_eq!(h.notifier.count(), 0);
    }
}
