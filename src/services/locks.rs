//! Manual-lock bookkeeping: per-zone hold state, the smart timeout policy and
//! the expiry timer thread.
//!
//! Every change to a zone's hold bumps its epoch. Timers carry the epoch they
//! were scheduled for, and the expiry handler only acts when that epoch is
//! still current, so a timer that lost a race against a re-acquire or release
//! does nothing.

use crate::config::LockPolicy;
use crate::models::lighting::{LockReason, ZoneConfig, ZoneId};
use chrono::{DateTime, NaiveTime, Utc};
use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// Upper bound for any timed lock.
pub const MAX_LOCK_DURATION: Duration = Duration::from_secs(7200);
pub const NIGHT_MULTIPLIER: f64 = 1.5;
pub const DIM_MULTIPLIER: f64 = 1.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockHold {
    pub reason: LockReason,
    /// `None` for holds that only a lifecycle transition releases (wake).
    pub expires_at: Option<DateTime<Utc>>,
}

/// Lock state of one zone. Unlocked means no reason and no expiry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ZoneLockState {
    hold: Option<LockHold>,
    epoch: u64,
}

impl ZoneLockState {
    pub fn is_locked(&self) -> bool {
        self.hold.is_some()
    }

    pub fn reason(&self) -> LockReason {
        self.hold.map(|h| h.reason).unwrap_or(LockReason::None)
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.hold.and_then(|h| h.expires_at)
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Replace any existing hold (last writer wins) and return the new epoch.
    pub fn hold(&mut self, reason: LockReason, expires_at: Option<DateTime<Utc>>) -> u64 {
        debug_assert!(reason != LockReason::None, "a hold needs a reason");
        self.epoch += 1;
        self.hold = Some(LockHold { reason, expires_at });
        self.epoch
    }

    pub fn clear(&mut self) -> Option<LockHold> {
        self.epoch += 1;
        self.hold.take()
    }
}

/// Manual lock duration for `zone`, stretched at night and for dim zones.
pub fn smart_timeout(policy: &LockPolicy, zone: &ZoneConfig, local_time: NaiveTime, target_brightness: u8) -> Duration {
    let base = zone
        .manual_timeout_secs
        .map(Duration::from_secs)
        .unwrap_or(policy.manual_timeout);
    let night = match policy.sleep_window {
        Some(window) if window.contains(local_time) => NIGHT_MULTIPLIER,
        _ => 1.0,
    };
    let dim = if target_brightness < policy.dim_threshold_pct {
        DIM_MULTIPLIER
    } else {
        1.0
    };
    Duration::from_secs((base.as_secs_f64() * night * dim).round() as u64).min(MAX_LOCK_DURATION)
}

type ExpiryHandler = Box<dyn Fn(ZoneId, u64) + Send + 'static>;

#[derive(Default)]
struct TimerState {
    pending: HashMap<ZoneId, (u64, Instant)>,
    shutdown: bool,
}

struct TimerShared {
    state: Mutex<TimerState>,
    changed: Condvar,
}

impl TimerShared {
    fn lock(&self) -> MutexGuard<'_, TimerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One-shot expiry timers, at most one per zone, served by a single thread.
pub struct LockTimers {
    shared: Arc<TimerShared>,
}

impl Default for LockTimers {
    fn default() -> Self {
        Self::new()
    }
}

impl LockTimers {
    pub fn new() -> Self {
        LockTimers {
            shared: Arc::new(TimerShared {
                state: Mutex::new(TimerState::default()),
                changed: Condvar::new(),
            }),
        }
    }

    /// Start the timer thread. `on_expiry` runs on that thread without any timer state held.
    pub fn spawn<F>(&self, on_expiry: F) -> std::io::Result<()>
    where
        F: Fn(ZoneId, u64) + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        let handler: ExpiryHandler = Box::new(on_expiry);
        thread::Builder::new()
            .name("lock-timers".to_string())
            .spawn(move || run_timers(&shared, &handler))
            .map(|_| ())
    }

    /// Arm (or re-arm) the zone's timer for `epoch`. A deadline past what
    /// `Instant` can represent never fires.
    pub fn schedule(&self, zone: ZoneId, epoch: u64, after: Duration) {
        let mut state = self.shared.lock();
        match Instant::now().checked_add(after) {
            Some(deadline) => {
                state.pending.insert(zone, (epoch, deadline));
            }
            None => {
                state.pending.remove(&zone);
            }
        }
        self.shared.changed.notify_all();
    }

    pub fn cancel(&self, zone: &ZoneId) {
        let mut state = self.shared.lock();
        if state.pending.remove(zone).is_some() {
            self.shared.changed.notify_all();
        }
    }

    /// Epoch of the zone's armed timer, if any.
    pub fn pending_epoch(&self, zone: &ZoneId) -> Option<u64> {
        self.shared.lock().pending.get(zone).map(|(epoch, _)| *epoch)
    }
}

impl Drop for LockTimers {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.shutdown = true;
        self.shared.changed.notify_all();
    }
}

fn run_timers(shared: &TimerShared, on_expiry: &ExpiryHandler) {
    let mut state = shared.lock();
    loop {
        if state.shutdown {
            debug!("Lock timer thread stopping");
            return;
        }
        let now = Instant::now();
        let due: Vec<(ZoneId, u64)> = state
            .pending
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(zone, (epoch, _))| (zone.clone(), *epoch))
            .collect();
        if !due.is_empty() {
            for (zone, _) in &due {
                state.pending.remove(zone);
            }
            drop(state);
            for (zone, epoch) in due {
                on_expiry(zone, epoch);
            }
            state = shared.lock();
            continue;
        }

        let next = state.pending.values().map(|(_, deadline)| *deadline).min();
        state = match next {
            Some(deadline) => {
                shared
                    .changed
                    .wait_timeout(state, deadline.saturating_duration_since(now))
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
            None => shared.changed.wait(state).unwrap_or_else(PoisonError::into_inner),
        };
    }
}
