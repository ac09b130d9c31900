//! Circuit breaker: pauses new entries after a losing streak.
//!
//! ```text
//!            loss, loss (streak reached)
//!   Armed ─────────────────────────────► Tripped(until)
//!     ▲                                        │
//!     └──────────── until elapsed ─────────────┘
//! ```
//!
//! Outcomes are keyed by trade identity so the same close reported by
//! several detection paths counts once. The breaker only gates entries;
//! protective-order maintenance never consults it.
//!
//! Daily guards (trade count, realized loss, and the open-P&L loss latch)
//! roll over at midnight in the configured exchange timezone, together with
//! the set of recorded trade ids.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{info, warn};

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive losses that trip the breaker
    pub loss_streak: u32,
    /// How long entries stay blocked once tripped
    pub cooldown: Duration,
    /// Timezone whose calendar day is the trading day
    pub timezone: Tz,
    /// Entries allowed per trading day
    pub max_trades_per_day: Option<u32>,
    /// Realized loss per trading day (positive amount) that blocks entries
    pub daily_loss_limit: Option<Decimal>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            loss_streak: 2,
            cooldown: Duration::minutes(90),
            timezone: chrono_tz::America::Chicago,
            max_trades_per_day: None,
            daily_loss_limit: None,
        }
    }
}

// =============================================================================
// Types
// =============================================================================

/// Breaker state at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BreakerState {
    Armed,
    Tripped { until: DateTime<Utc> },
}

/// Why an entry is blocked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryBlock {
    CooldownActive { until: DateTime<Utc> },
    MaxTradesReached { trades: u32 },
    DailyLossLimit { realized: Decimal },
}

impl fmt::Display for EntryBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryBlock::CooldownActive { until } => write!(f, "cooldown active until {}", until),
            EntryBlock::MaxTradesReached { trades } => write!(f, "{} trades taken today", trades),
            EntryBlock::DailyLossLimit { realized } => write!(f, "daily realized P&L {}", realized),
        }
    }
}

/// Result of [`CircuitBreaker::record_outcome`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeRecord {
    /// Trade already recorded
    Duplicate,
    /// Zero P&L: neither a loss nor a win
    Ignored,
    Counted {
        consecutive_losses: u32,
        /// Set when this outcome tripped the breaker
        tripped_until: Option<DateTime<Utc>>,
    },
}

/// Serializable view for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    pub state: BreakerState,
    pub consecutive_losses: u32,
    pub remaining_cooldown_secs: i64,
    pub trades_today: u32,
    pub realized_today: Decimal,
    pub daily_limit_hit: bool,
}

// =============================================================================
// Circuit Breaker
// =============================================================================

struct BreakerInner {
    consecutive_losses: u32,
    tripped_until: Option<DateTime<Utc>>,
    trading_day: Option<NaiveDate>,
    trades_today: u32,
    realized_today: Decimal,
    /// Realized plus open P&L crossed the daily limit
    daily_limit_hit: bool,
    seen: HashSet<String>,
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                consecutive_losses: 0,
                tripped_until: None,
                trading_day: None,
                trades_today: 0,
                realized_today: Decimal::ZERO,
                daily_limit_hit: false,
                seen: HashSet::new(),
            }),
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Lock and bring the state up to `now`: expire an elapsed cooldown and
    /// roll the daily counters on a new trading day.
    fn inner_at(&self, now: DateTime<Utc>) -> MutexGuard<'_, BreakerInner> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        if inner.tripped_until.is_some_and(|until| now >= until) {
            info!("Circuit breaker cooldown elapsed, re-armed");
            inner.tripped_until = None;
            inner.consecutive_losses = 0;
        }

        let today = now.with_timezone(&self.config.timezone).date_naive();
        if inner.trading_day != Some(today) {
            if inner.trading_day.is_some() {
                info!(%today, "New trading day, resetting daily counters");
            }
            inner.trading_day = Some(today);
            inner.consecutive_losses = 0;
            inner.trades_today = 0;
            inner.realized_today = Decimal::ZERO;
            inner.daily_limit_hit = false;
            inner.seen.clear();
        }
        inner
    }

    /// Record a closed trade. Idempotent per `trade_id`.
    pub fn record_outcome(&self, trade_id: &str, pnl: Decimal, now: DateTime<Utc>) -> OutcomeRecord {
        let mut inner = self.inner_at(now);

        if !inner.seen.insert(trade_id.to_string()) {
            info!(trade_id, "Outcome already recorded, ignoring");
            return OutcomeRecord::Duplicate;
        }
        inner.realized_today += pnl;

        if pnl.is_zero() {
            return OutcomeRecord::Ignored;
        }
        if pnl > Decimal::ZERO {
            inner.consecutive_losses = 0;
            return OutcomeRecord::Counted {
                consecutive_losses: 0,
                tripped_until: None,
            };
        }

        inner.consecutive_losses += 1;
        let losses = inner.consecutive_losses;
        let mut tripped_until = None;
        if losses >= self.config.loss_streak && inner.tripped_until.is_none() {
            let until = now + self.config.cooldown;
            inner.tripped_until = Some(until);
            tripped_until = Some(until);
            warn!(trade_id, consecutive_losses = losses, %until, "Circuit breaker tripped");
        } else {
            info!(trade_id, %pnl, consecutive_losses = losses, "Loss recorded");
        }

        OutcomeRecord::Counted {
            consecutive_losses: losses,
            tripped_until,
        }
    }

    /// Latch the daily loss limit once today's realized P&L plus `open_pnl`
    /// reaches it. Returns the combined P&L on the call that latches; `None`
    /// before the limit and on every later call that day.
    pub fn check_daily_loss(&self, open_pnl: Decimal, now: DateTime<Utc>) -> Option<Decimal> {
        let limit = self.config.daily_loss_limit?;
        let mut inner = self.inner_at(now);
        if inner.daily_limit_hit {
            return None;
        }
        let total = inner.realized_today + open_pnl;
        if total > -limit {
            return None;
        }
        inner.daily_limit_hit = true;
        warn!(%total, %limit, "Daily loss limit hit, entries blocked for the day");
        Some(total)
    }

    /// Count an executed entry against the daily trade limit.
    pub fn record_entry(&self, now: DateTime<Utc>) {
        self.inner_at(now).trades_today += 1;
    }

    /// Whether a new entry may be taken, and if not, why.
    pub fn entry_permission(&self, now: DateTime<Utc>) -> Result<(), EntryBlock> {
        let inner = self.inner_at(now);

        if let Some(until) = inner.tripped_until {
            return Err(EntryBlock::CooldownActive { until });
        }
        if let Some(max) = self.config.max_trades_per_day {
            if inner.trades_today >= max {
                return Err(EntryBlock::MaxTradesReached {
                    trades: inner.trades_today,
                });
            }
        }
        if let Some(limit) = self.config.daily_loss_limit {
            if inner.daily_limit_hit || inner.realized_today <= -limit {
                return Err(EntryBlock::DailyLossLimit {
                    realized: inner.realized_today,
                });
            }
        }
        Ok(())
    }

    pub fn should_allow_entry(&self, now: DateTime<Utc>) -> bool {
        self.entry_permission(now).is_ok()
    }

    /// Time left until the breaker re-arms; zero when armed.
    pub fn remaining_cooldown(&self, now: DateTime<Utc>) -> Duration {
        match self.inner_at(now).tripped_until {
            Some(until) => (until - now).max(Duration::zero()),
            None => Duration::zero(),
        }
    }

    pub fn state(&self, now: DateTime<Utc>) -> BreakerState {
        match self.inner_at(now).tripped_until {
            Some(until) => BreakerState::Tripped { until },
            None => BreakerState::Armed,
        }
    }

    pub fn consecutive_losses(&self, now: DateTime<Utc>) -> u32 {
        self.inner_at(now).consecutive_losses
    }

    pub fn status(&self, now: DateTime<Utc>) -> BreakerStatus {
        let inner = self.inner_at(now);
        let remaining = inner
            .tripped_until
            .map(|until| (until - now).max(Duration::zero()))
            .unwrap_or_else(Duration::zero);
        BreakerStatus {
            state: match inner.tripped_until {
                Some(until) => BreakerState::Tripped { until },
                None => BreakerState::Armed,
            },
            consecutive_losses: inner.consecutive_losses,
            remaining_cooldown_secs: remaining.num_seconds(),
            trades_today: inner.trades_today,
            realized_today: inner.realized_today,
            daily_limit_hit: inner.daily_limit_hit,
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

// =============================================================================
// Tests
// =============================================================================
