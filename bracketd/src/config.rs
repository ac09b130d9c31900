//! Daemon configuration.
//!
//! Loads configuration from environment variables (after `.env`) with
//! defaults suited to micro gold futures on TopstepX.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use bracket_connectors::projectx::DEFAULT_BASE_URL;
use bracket_connectors::ProjectXConfig;
use bracket_domain::{Contracts, Instrument};
use bracket_engine::RiskSettings;
use bracket_exec::{GateConfig, VerifierConfig};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::circuit_breaker::BreakerConfig;
use crate::error::{DaemonError, DaemonResult};

/// Shortest verifier delay accepted outside tests.
const MIN_VERIFY_DELAY: Duration = Duration::from_millis(500);

// =============================================================================
// Configuration
// =============================================================================

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// API server configuration
    pub api: ApiConfig,
    /// Instrument, sizing and polling
    pub trading: TradingConfig,
    /// Order verification polling
    pub verifier: VerifierConfig,
    /// Mutation gate cooldowns
    pub gate: GateConfig,
    /// Break-even, partial exit and trailing thresholds
    pub risk: RiskSettings,
    /// Loss-streak and daily guards
    pub breaker: BreakerConfig,
    /// Broker connection (unused in the test environment)
    pub broker: ProjectXConfig,
    /// Environment (test, development, production)
    pub environment: Environment,
    /// Emit logs as JSON lines
    pub log_json: bool,
}

/// API server configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Host to bind to
    pub host: String,
    /// Port to bind to
    pub port: u16,
}

/// What is traded and how often the broker is polled.
#[derive(Debug, Clone)]
pub struct TradingConfig {
    pub instrument: Instrument,
    /// Contracts per entry
    pub position_size: Contracts,
    /// Status poll / reconcile interval
    pub poll_interval: Duration,
    /// Position polls while waiting for an entry fill
    pub entry_fill_attempts: u32,
    /// Delay between entry fill polls
    pub entry_fill_delay: Duration,
    /// Bracket distances for positions adopted without protective orders
    pub fallback_stop_ticks: u32,
    pub fallback_target_ticks: u32,
}

/// Environment type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    /// Test environment (uses the stub broker)
    Test,
    /// Development environment
    Development,
    /// Production environment
    Production,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> DaemonResult<Self> {
        // Load .env file if present (ignore errors)
        let _ = dotenvy::dotenv();

        let config = Self {
            api: Self::load_api_config()?,
            trading: Self::load_trading_config()?,
            verifier: VerifierConfig {
                delay: Duration::from_millis(Self::load_parsed_env("BRACKET_VERIFY_DELAY_MS", 500u64)?),
                max_attempts: Self::load_parsed_env("BRACKET_VERIFY_ATTEMPTS", 5u32)?,
            },
            gate: GateConfig {
                watchdog_cooldown: Duration::from_secs(Self::load_parsed_env("BRACKET_WATCHDOG_COOLDOWN_SECS", 60u64)?),
                trailing_cooldown: Duration::from_secs(Self::load_parsed_env("BRACKET_TRAILING_COOLDOWN_SECS", 10u64)?),
                stop_update_cooldown: Duration::from_secs(Self::load_parsed_env(
                    "BRACKET_STOP_UPDATE_COOLDOWN_SECS",
                    5u64,
                )?),
            },
            risk: Self::load_risk_settings()?,
            breaker: Self::load_breaker_config()?,
            broker: ProjectXConfig {
                base_url: env::var("BRACKET_PROJECTX_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
                username: env::var("BRACKET_PROJECTX_USERNAME").unwrap_or_default(),
                api_key: env::var("BRACKET_PROJECTX_API_KEY").unwrap_or_default(),
                account_id: Self::load_optional_env("BRACKET_PROJECTX_ACCOUNT_ID")?,
                ..ProjectXConfig::default()
            },
            environment: Self::load_environment()?,
            log_json: env::var("BRACKET_LOG_JSON").is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true")),
        };

        config.validate()?;
        Ok(config)
    }

    /// Create test configuration: no cooldowns, millisecond verifier delay.
    pub fn test() -> Self {
        Self {
            api: ApiConfig {
                host: "127.0.0.1".to_string(),
                port: 0, // Let OS assign port
            },
            trading: TradingConfig {
                entry_fill_attempts: 3,
                entry_fill_delay: Duration::from_millis(1),
                ..TradingConfig::default()
            },
            verifier: VerifierConfig {
                delay: Duration::from_millis(1),
                max_attempts: 5,
            },
            gate: GateConfig::without_cooldowns(),
            risk: RiskSettings::default(),
            breaker: BreakerConfig::default(),
            broker: ProjectXConfig::default(),
            environment: Environment::Test,
            log_json: false,
        }
    }

    /// Check ranges that would make the engine misbehave.
    pub fn validate(&self) -> DaemonResult<()> {
        self.risk.validate()?;

        if self.environment != Environment::Test && self.verifier.delay < MIN_VERIFY_DELAY {
            return Err(DaemonError::Config(format!(
                "BRACKET_VERIFY_DELAY_MS must be at least {} ms",
                MIN_VERIFY_DELAY.as_millis()
            )));
        }
        if self.verifier.max_attempts == 0 {
            return Err(DaemonError::Config("BRACKET_VERIFY_ATTEMPTS must be positive".to_string()));
        }
        if self.trading.poll_interval.is_zero() {
            return Err(DaemonError::Config("BRACKET_POLL_INTERVAL_SECS must be positive".to_string()));
        }
        if self.breaker.loss_streak == 0 {
            return Err(DaemonError::Config("BRACKET_LOSS_STREAK must be positive".to_string()));
        }
        if self.environment != Environment::Test {
            self.broker
                .validate()
                .map_err(|e| DaemonError::Config(e.to_string()))?;
        }
        Ok(())
    }

    fn load_environment() -> DaemonResult<Environment> {
        let env_str = env::var("BRACKET_ENV").unwrap_or_else(|_| "development".to_string());

        match env_str.to_lowercase().as_str() {
            "test" => Ok(Environment::Test),
            "development" | "dev" => Ok(Environment::Development),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(DaemonError::Config(format!(
                "Invalid BRACKET_ENV: {}. Expected: test, development, production",
                other
            ))),
        }
    }

    fn load_api_config() -> DaemonResult<ApiConfig> {
        let host = env::var("BRACKET_API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = Self::load_parsed_env("BRACKET_API_PORT", 8080u16)?;
        Ok(ApiConfig { host, port })
    }

    fn load_trading_config() -> DaemonResult<TradingConfig> {
        let defaults = TradingConfig::default();
        let contract_id =
            env::var("BRACKET_INSTRUMENT").unwrap_or_else(|_| defaults.instrument.contract_id.clone());
        let tick_size = Self::load_decimal_env("BRACKET_TICK_SIZE", defaults.instrument.tick_size)?;
        let tick_value = Self::load_decimal_env("BRACKET_TICK_VALUE", defaults.instrument.tick_value)?;
        let position_size = Self::load_parsed_env("BRACKET_POSITION_SIZE", defaults.position_size.get())?;

        Ok(TradingConfig {
            instrument: Instrument::new(contract_id, tick_size, tick_value)?,
            position_size: Contracts::new(position_size)?,
            poll_interval: Duration::from_secs(Self::load_parsed_env(
                "BRACKET_POLL_INTERVAL_SECS",
                defaults.poll_interval.as_secs(),
            )?),
            fallback_stop_ticks: Self::load_parsed_env("BRACKET_FALLBACK_STOP_TICKS", defaults.fallback_stop_ticks)?,
            fallback_target_ticks: Self::load_parsed_env(
                "BRACKET_FALLBACK_TARGET_TICKS",
                defaults.fallback_target_ticks,
            )?,
            ..defaults
        })
    }

    fn load_risk_settings() -> DaemonResult<RiskSettings> {
        let d = RiskSettings::default();
        let early_ticks = Self::load_parsed_env("BRACKET_EARLY_BREAK_EVEN_TICKS", d.early_break_even_ticks.unwrap_or(0))?;

        Ok(RiskSettings {
            break_even_enabled: Self::load_bool_env("BRACKET_BREAK_EVEN_ENABLED", d.break_even_enabled)?,
            break_even_trigger_r: Self::load_decimal_env("BRACKET_BREAK_EVEN_R", d.break_even_trigger_r)?,
            early_break_even_ticks: (early_ticks > 0).then_some(early_ticks),
            partial_exit_enabled: Self::load_bool_env("BRACKET_PARTIAL_EXIT_ENABLED", d.partial_exit_enabled)?,
            partial_exit_r: Self::load_decimal_env("BRACKET_PARTIAL_EXIT_R", d.partial_exit_r)?,
            partial_exit_fraction: Self::load_decimal_env("BRACKET_PARTIAL_EXIT_FRACTION", d.partial_exit_fraction)?,
            post_partial_lock_r: Self::load_decimal_env("BRACKET_POST_PARTIAL_LOCK_R", d.post_partial_lock_r)?,
            trailing_enabled: Self::load_bool_env("BRACKET_TRAILING_ENABLED", d.trailing_enabled)?,
            trailing_activation_r: Self::load_decimal_env("BRACKET_TRAILING_ACTIVATION_R", d.trailing_activation_r)?,
            trailing_distance_r: Self::load_decimal_env("BRACKET_TRAILING_DISTANCE_R", d.trailing_distance_r)?,
        })
    }

    fn load_breaker_config() -> DaemonResult<BreakerConfig> {
        let d = BreakerConfig::default();
        let timezone = match env::var("BRACKET_TIMEZONE") {
            Ok(name) => Tz::from_str(&name)
                .map_err(|_| DaemonError::Config(format!("Invalid BRACKET_TIMEZONE: {}", name)))?,
            Err(_) => d.timezone,
        };
        let cooldown_mins = Self::load_parsed_env("BRACKET_BREAKER_COOLDOWN_MINS", d.cooldown.num_minutes())?;

        Ok(BreakerConfig {
            loss_streak: Self::load_parsed_env("BRACKET_LOSS_STREAK", d.loss_streak)?,
            cooldown: chrono::Duration::minutes(cooldown_mins),
            timezone,
            max_trades_per_day: Self::load_optional_env("BRACKET_MAX_TRADES_PER_DAY")?,
            daily_loss_limit: Self::load_optional_env("BRACKET_DAILY_LOSS_LIMIT")?,
        })
    }

    fn load_decimal_env(key: &str, default: Decimal) -> DaemonResult<Decimal> {
        Self::load_parsed_env(key, default)
    }

    fn load_bool_env(key: &str, default: bool) -> DaemonResult<bool> {
        match env::var(key) {
            Ok(val) => match val.to_lowercase().as_str() {
                "1" | "true" | "yes" => Ok(true),
                "0" | "false" | "no" => Ok(false),
                _ => Err(DaemonError::Config(format!("Invalid {} value: {}", key, val))),
            },
            Err(_) => Ok(default),
        }
    }

    fn load_parsed_env<T: FromStr>(key: &str, default: T) -> DaemonResult<T> {
        match env::var(key) {
            Ok(val) => val
                .trim()
                .parse::<T>()
                .map_err(|_| DaemonError::Config(format!("Invalid {} value: {}", key, val))),
            Err(_) => Ok(default),
        }
    }

    fn load_optional_env<T: FromStr>(key: &str) -> DaemonResult<Option<T>> {
        match env::var(key) {
            Ok(val) if !val.trim().is_empty() => val
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|_| DaemonError::Config(format!("Invalid {} value: {}", key, val))),
            _ => Ok(None),
        }
    }
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            instrument: Instrument {
                contract_id: "CON.F.US.MGC.Z25".to_string(),
                tick_size: dec!(0.1),
                tick_value: dec!(1),
            },
            position_size: Contracts::ONE,
            poll_interval: Duration::from_secs(10),
            entry_fill_attempts: 10,
            entry_fill_delay: Duration::from_millis(500),
            fallback_stop_ticks: 50,
            fallback_target_ticks: 100,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api: ApiConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            trading: TradingConfig::default(),
            verifier: VerifierConfig::default(),
            gate: GateConfig::default(),
            risk: RiskSettings::default(),
            breaker: BreakerConfig::default(),
            broker: ProjectXConfig::default(),
            environment: Environment::Development,
            log_json: false,
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Environment::Test => write!(f, "test"),
            Environment::Development => write!(f, "development"),
            Environment::Production => write!(f, "production"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
