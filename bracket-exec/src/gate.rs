//! Mutation gate: per-category locks and cooldowns.
//!
//! Every actor that mutates protective orders goes through the gate:
//!
//! ```text
//! category              lock   cooldown   conflicts with
//! entry                 yes    -          protective-placement
//! stop-update           yes    5s         protective-placement
//! protective-placement  yes    -          entry, stop-update
//! watchdog (throttle)   no     60s        -
//! trailing (throttle)   no     10s        -
//! ```
//!
//! Acquisition never blocks: a busy or cooling category is skipped, not
//! queued. A successful acquisition arms the cooldown immediately, so a
//! burst of callers cannot all start work. Locks are released when the
//! [`GateGuard`] drops, on every exit path.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Lock categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationCategory {
    Entry,
    StopUpdate,
    ProtectivePlacement,
}

impl MutationCategory {
    pub const ALL: [MutationCategory; 3] = [
        MutationCategory::Entry,
        MutationCategory::StopUpdate,
        MutationCategory::ProtectivePlacement,
    ];

    /// Categories that may not be held at the same time as this one.
    pub fn conflicts_with(&self, other: MutationCategory) -> bool {
        use MutationCategory::*;
        matches!(
            (self, other),
            (Entry, ProtectivePlacement)
                | (ProtectivePlacement, Entry)
                | (StopUpdate, ProtectivePlacement)
                | (ProtectivePlacement, StopUpdate)
        )
    }

    fn cooldown_key(&self) -> Option<CooldownKey> {
        match self {
            MutationCategory::StopUpdate => Some(CooldownKey::StopUpdate),
            MutationCategory::Entry | MutationCategory::ProtectivePlacement => None,
        }
    }
}

impl fmt::Display for MutationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationCategory::Entry => write!(f, "entry"),
            MutationCategory::StopUpdate => write!(f, "stop-update"),
            MutationCategory::ProtectivePlacement => write!(f, "protective-placement"),
        }
    }
}

/// Cooldown-only throttles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Throttle {
    Watchdog,
    Trailing,
}

impl Throttle {
    fn cooldown_key(&self) -> CooldownKey {
        match self {
            Throttle::Watchdog => CooldownKey::Watchdog,
            Throttle::Trailing => CooldownKey::Trailing,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum CooldownKey {
    Watchdog,
    Trailing,
    StopUpdate,
}

#[derive(Debug, Clone)]
pub struct GateConfig {
    pub watchdog_cooldown: Duration,
    pub trailing_cooldown: Duration,
    pub stop_update_cooldown: Duration,
}

impl GateConfig {
    /// No cooldowns; locks still apply.
    pub fn without_cooldowns() -> Self {
        Self {
            watchdog_cooldown: Duration::ZERO,
            trailing_cooldown: Duration::ZERO,
            stop_update_cooldown: Duration::ZERO,
        }
    }

    fn cooldown(&self, key: CooldownKey) -> Duration {
        match key {
            CooldownKey::Watchdog => self.watchdog_cooldown,
            CooldownKey::Trailing => self.trailing_cooldown,
            CooldownKey::StopUpdate => self.stop_update_cooldown,
        }
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            watchdog_cooldown: Duration::from_secs(60),
            trailing_cooldown: Duration::from_secs(10),
            stop_update_cooldown: Duration::from_secs(5),
        }
    }
}

#[derive(Default)]
struct GateState {
    owners: HashMap<MutationCategory, &'static str>,
    armed_at: HashMap<CooldownKey, Instant>,
}

impl GateState {
    fn cooling(&self, config: &GateConfig, key: CooldownKey) -> bool {
        self.armed_at
            .get(&key)
            .is_some_and(|armed| armed.elapsed() < config.cooldown(key))
    }
}

/// Held lock on a category. Dropping it releases the category.
#[must_use = "the category is released as soon as the guard is dropped"]
pub struct GateGuard {
    gate: Arc<MutationGate>,
    category: MutationCategory,
}

impl GateGuard {
    pub fn category(&self) -> MutationCategory {
        self.category
    }

    /// Release explicitly.
    pub fn release(self) {}
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        let owner = self.gate.state().owners.remove(&self.category);
        trace!(category = %self.category, ?owner, "Gate released");
    }
}

impl fmt::Debug for GateGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GateGuard").field("category", &self.category).finish()
    }
}

/// Held categories, for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct GateSnapshot {
    pub held: Vec<(MutationCategory, &'static str)>,
}

/// The single place all protective-order serialization is decided.
pub struct MutationGate {
    config: GateConfig,
    state: Mutex<GateState>,
}

impl MutationGate {
    pub fn new(config: GateConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(GateState::default()),
        })
    }

    fn state(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Try to take `category` for `owner`.
    ///
    /// Fails when the category or a conflicting one is held, or when the
    /// category is cooling down. On success the cooldown is armed.
    pub fn try_enter(self: &Arc<Self>, category: MutationCategory, owner: &'static str) -> Option<GateGuard> {
        let mut state = self.state();

        if let Some(holder) = state.owners.get(&category) {
            debug!(%category, owner, %holder, "Gate busy");
            return None;
        }
        if let Some((other, holder)) = state.owners.iter().find(|(held, _)| category.conflicts_with(**held)) {
            debug!(%category, owner, conflicting = %other, %holder, "Gate conflict");
            return None;
        }
        if let Some(key) = category.cooldown_key() {
            if state.cooling(&self.config, key) {
                debug!(%category, owner, "Gate cooling down");
                return None;
            }
            state.armed_at.insert(key, Instant::now());
        }

        state.owners.insert(category, owner);
        trace!(%category, owner, "Gate entered");
        Some(GateGuard {
            gate: Arc::clone(self),
            category,
        })
    }

    /// Whether `try_enter(category)` would currently succeed. Advisory.
    pub fn can_enter(&self, category: MutationCategory) -> bool {
        let state = self.state();
        !state.owners.contains_key(&category)
            && !state.owners.keys().any(|held| category.conflicts_with(*held))
            && category
                .cooldown_key()
                .map_or(true, |key| !state.cooling(&self.config, key))
    }

    /// Check and arm a throttle in one step. `false` means skip this time.
    pub fn try_throttle(&self, throttle: Throttle) -> bool {
        let key = throttle.cooldown_key();
        let mut state = self.state();
        if state.cooling(&self.config, key) {
            return false;
        }
        state.armed_at.insert(key, Instant::now());
        true
    }

    pub fn is_held(&self, category: MutationCategory) -> bool {
        self.state().owners.contains_key(&category)
    }

    /// Time left before `throttle` may fire again.
    pub fn throttle_remaining(&self, throttle: Throttle) -> Duration {
        self.remaining(throttle.cooldown_key())
    }

    /// Time left on `category`'s cooldown; zero for categories without one.
    pub fn cooldown_remaining(&self, category: MutationCategory) -> Duration {
        category.cooldown_key().map_or(Duration::ZERO, |key| self.remaining(key))
    }

    fn remaining(&self, key: CooldownKey) -> Duration {
        self.state()
            .armed_at
            .get(&key)
            .map(|armed| self.config.cooldown(key).saturating_sub(armed.elapsed()))
            .unwrap_or(Duration::ZERO)
    }

    pub fn snapshot(&self) -> GateSnapshot {
        let state = self.state();
        let mut held: Vec<_> = state.owners.iter().map(|(c, o)| (*c, *o)).collect();
        held.sort_by_key(|(c, _)| MutationCategory::ALL.iter().position(|x| x == c));
        GateSnapshot { held }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_is_exclusive_and_released_on_drop() {
        let gate = MutationGate::new(GateConfig::without_cooldowns());

        let guard = gate.try_enter(MutationCategory::Entry, "entry").unwrap();
        assert!(gate.try_enter(MutationCategory::Entry, "other").is_none());
        assert!(gate.is_held(MutationCategory::Entry));

        drop(guard);
        assert!(!gate.is_held(MutationCategory::Entry));
        assert!(gate.try_enter(MutationCategory::Entry, "other").is_some());
    }

    #[test]
    fn test_conflicts() {
        let gate = MutationGate::new(GateConfig::without_cooldowns());

        let placement = gate.try_enter(MutationCategory::ProtectivePlacement, "watchdog").unwrap();
        assert!(gate.try_enter(MutationCategory::Entry, "entry").is_none());
        assert!(gate.try_enter(MutationCategory::StopUpdate, "trailing").is_none());
        placement.release();

        let stop_update = gate.try_enter(MutationCategory::StopUpdate, "trailing").unwrap();
        assert!(gate.try_enter(MutationCategory::ProtectivePlacement, "watchdog").is_none());
        // Entry and stop-update are independent
        assert!(gate.try_enter(MutationCategory::Entry, "entry").is_some());
        drop(stop_update);
    }

    #[test]
    fn test_guard_released_on_early_return() {
        let gate = MutationGate::new(GateConfig::without_cooldowns());

        fn failing_mutation(gate: &Arc<MutationGate>) -> Result<(), &'static str> {
            let _guard = gate.try_enter(MutationCategory::StopUpdate, "break-even").ok_or("busy")?;
            Err("broker rejected")
        }

        assert_eq!(failing_mutation(&gate), Err("broker rejected"));
        assert!(!gate.is_held(MutationCategory::StopUpdate));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_update_cooldown_armed_on_entry() {
        let gate = MutationGate::new(GateConfig::default());

        let guard = gate.try_enter(MutationCategory::StopUpdate, "trailing").unwrap();
        drop(guard);
        assert!(!gate.can_enter(MutationCategory::StopUpdate));
        assert!(gate.try_enter(MutationCategory::StopUpdate, "trailing").is_none());
        assert_eq!(gate.cooldown_remaining(MutationCategory::StopUpdate), Duration::from_secs(5));
        assert_eq!(gate.cooldown_remaining(MutationCategory::Entry), Duration::ZERO);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(gate.try_enter(MutationCategory::StopUpdate, "trailing").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_skips_within_cooldown() {
        let gate = MutationGate::new(GateConfig::default());

        assert!(gate.try_throttle(Throttle::Watchdog));
        assert!(!gate.try_throttle(Throttle::Watchdog));
        assert!(gate.try_throttle(Throttle::Trailing));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(gate.throttle_remaining(Throttle::Watchdog), Duration::from_secs(30));
        assert!(!gate.try_throttle(Throttle::Watchdog));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(gate.try_throttle(Throttle::Watchdog));
    }
}
