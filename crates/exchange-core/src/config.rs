//! Configuration management for the trading agent.
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! `AGENT__SECTION__KEY` environment variables. Per-user trading settings live
//! in their own JSON documents (see [`crate::types::Settings`]).

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Environment, File};
use serde::Deserialize;

use crate::{Error, Result};

/// Application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub exchange: ExchangeConfig,
    pub cache: CacheConfig,
    pub engine: EngineConfig,
    pub users: Vec<UserConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    pub rest_url: String,
    pub ws_url: String,
    /// Authenticated calls allowed per credential set per window.
    pub requests_per_window: u32,
    pub rate_window_secs: u64,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub recv_window_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            rest_url: "https://fapi.binance.com".to_string(),
            ws_url: "wss://fstream.binance.com/ws".to_string(),
            requests_per_window: 1200,
            rate_window_secs: 60,
            retry_attempts: 3,
            retry_delay_ms: 1000,
            recv_window_ms: 5000,
            request_timeout_secs: 10,
        }
    }
}

impl ExchangeConfig {
    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate_window_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: u64,
    pub capacity: usize,
    pub sentiment_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 3600,
            capacity: 1000,
            sentiment_ttl_secs: 900,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sentiment_ttl(&self) -> Duration {
        Duration::from_secs(self.sentiment_ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub scan_interval_secs: u64,
    pub monitor_interval_secs: u64,
    pub report_interval_secs: u64,
    /// Delay before re-checking an account that was short of funds.
    pub funds_cooldown_secs: u64,
    /// Symbols whose maximum leverage is below this are never traded.
    pub min_symbol_leverage: u32,
    /// Symbols to scan. Empty means every perpetual the exchange lists.
    pub universe: Vec<String>,
    pub blacklist: Vec<String>,
    pub candle_limit: usize,
    pub price_staleness_secs: u64,
    /// Adverse move that triggers a hedge.
    pub hedge_trigger_pct: f64,
    pub event_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: 300,
            monitor_interval_secs: 5,
            report_interval_secs: 86_400,
            funds_cooldown_secs: 300,
            min_symbol_leverage: 25,
            universe: Vec::new(),
            blacklist: [
                "CRVUSDT", "MKRUSDT", "RSRUSDT", "CETUSUSDT", "BNXUSDT", "CKBUSDT",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            candle_limit: 100,
            price_staleness_secs: 10,
            hedge_trigger_pct: 0.10,
            event_buffer: 1000,
        }
    }
}

impl EngineConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
    }

    pub fn funds_cooldown(&self) -> Duration {
        Duration::from_secs(self.funds_cooldown_secs)
    }

    pub fn price_staleness(&self) -> Duration {
        Duration::from_secs(self.price_staleness_secs)
    }

    pub fn is_blacklisted(&self, symbol: &str) -> bool {
        self.blacklist.iter().any(|s| s == symbol)
    }
}

/// A trading account registered at startup.
#[derive(Clone, Deserialize)]
pub struct UserConfig {
    pub id: String,
    pub api_key: String,
    pub secret_key: String,
    /// JSON settings document; created with defaults if missing.
    pub settings_file: Option<PathBuf>,
}

impl std::fmt::Debug for UserConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserConfig")
            .field("id", &self.id)
            .field("api_key", &self.api_key)
            .field("secret_key", &"<redacted>")
            .field("settings_file", &self.settings_file)
            .finish()
    }
}

impl AppConfig {
    /// Load configuration from an optional file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        } else {
            builder = builder.add_source(File::with_name("agent").required(false));
        }
        let mut cfg: AppConfig = builder
            .add_source(
                Environment::with_prefix("AGENT")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("engine.universe")
                    .with_list_parse_key("engine.blacklist")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        if cfg.users.is_empty() {
            if let Some(user) = Self::user_from_env() {
                cfg.users.push(user);
            }
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Single-account setup straight from `BINANCE_API_KEY` / `BINANCE_SECRET_KEY`.
    fn user_from_env() -> Option<UserConfig> {
        let api_key = env::var("BINANCE_API_KEY").ok()?;
        let secret_key = env::var("BINANCE_SECRET_KEY").ok()?;
        Some(UserConfig {
            id: env::var("AGENT_USER_ID").unwrap_or_else(|_| "default".to_string()),
            api_key,
            secret_key,
            settings_file: env::var("AGENT_SETTINGS_FILE").ok().map(PathBuf::from),
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.exchange.requests_per_window == 0 {
            return Err(Error::Config {
                message: "exchange.requests_per_window must be positive".to_string(),
            });
        }
        if self.exchange.retry_attempts == 0 {
            return Err(Error::Config {
                message: "exchange.retry_attempts must be at least 1".to_string(),
            });
        }
        if self.engine.monitor_interval_secs == 0 || self.engine.scan_interval_secs == 0 {
            return Err(Error::Config {
                message: "engine intervals must be positive".to_string(),
            });
        }
        let mut ids: Vec<&str> = self.users.iter().map(|u| u.id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != self.users.len() {
            return Err(Error::Config {
                message: "user ids must be unique".to_string(),
            });
        }
        Ok(())
    }

    /// Load configuration for testing (with defaults).
    pub fn test_config() -> Self {
        Self {
            engine: EngineConfig {
                universe: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
                ..Default::default()
            },
            ..Default::default()
        }
    }
}
