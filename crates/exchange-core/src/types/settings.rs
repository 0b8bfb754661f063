//! Per-user trading settings.
//!
//! Settings persist as a flat JSON object of string values so that a user can
//! edit one key at a time. Every mutation goes through [`Settings::set`],
//! which parses the value, validates the whole set and only then commits.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::candle::Timeframe;
use crate::{Error, Result};

/// Exchange-wide ceiling on leverage.
pub const MAX_EXCHANGE_LEVERAGE: u32 = 125;

pub const SETTING_KEYS: &[&str] = &[
    "min_leverage",
    "max_leverage",
    "position_size_fraction",
    "stop_loss_pct",
    "take_profit1_pct",
    "take_profit2_pct",
    "trailing_take_profit_pct",
    "timeframe",
    "sentiment_threshold",
    "max_positions",
    "hedging_enabled",
    "reentry_threshold_pct",
    "stagnation_minutes",
    "stagnation_move_pct",
    "min_available_fraction",
    "entry_score_threshold",
    "favorite_symbols",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub min_leverage: u32,
    pub max_leverage: u32,
    /// Base fraction of available balance committed as margin per position.
    pub position_size_fraction: Decimal,
    pub stop_loss_pct: Decimal,
    pub take_profit1_pct: Decimal,
    pub take_profit2_pct: Decimal,
    pub trailing_take_profit_pct: Decimal,
    pub timeframe: Timeframe,
    /// Maximum tolerated sentiment against the trade direction.
    pub sentiment_threshold: f64,
    pub max_positions: usize,
    pub hedging_enabled: bool,
    /// Exit within this distance of entry triggers a same-direction re-entry.
    pub reentry_threshold_pct: Decimal,
    pub stagnation_minutes: i64,
    pub stagnation_move_pct: Decimal,
    pub min_available_fraction: Decimal,
    pub entry_score_threshold: f64,
    /// Allowlist; empty means every eligible symbol.
    pub favorite_symbols: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            min_leverage: 25,
            max_leverage: MAX_EXCHANGE_LEVERAGE,
            position_size_fraction: Decimal::new(5, 2),    // 5%
            stop_loss_pct: Decimal::new(2, 2),             // 2%
            take_profit1_pct: Decimal::new(3, 2),          // 3%
            take_profit2_pct: Decimal::new(6, 2),          // 6%
            trailing_take_profit_pct: Decimal::new(10, 2), // 10%
            timeframe: Timeframe::H1,
            sentiment_threshold: 0.5,
            max_positions: 5,
            hedging_enabled: false,
            reentry_threshold_pct: Decimal::new(5, 3), // 0.5%
            stagnation_minutes: 240,
            stagnation_move_pct: Decimal::new(1, 2), // 1%
            min_available_fraction: Decimal::new(5, 1), // 50%
            entry_score_threshold: 0.5,
            favorite_symbols: Vec::new(),
        }
    }
}

fn invalid(key: &str, message: impl Into<String>) -> Error {
    Error::InvalidSetting {
        key: key.to_string(),
        message: message.into(),
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| invalid(key, format!("cannot parse '{value}'")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "on" | "yes" | "1" => Ok(true),
        "false" | "off" | "no" | "0" => Ok(false),
        _ => Err(invalid(key, format!("expected on/off, got '{value}'"))),
    }
}

fn fraction_in(key: &str, value: Decimal, allow_zero: bool) -> Result<()> {
    let lower_ok = if allow_zero {
        value >= Decimal::ZERO
    } else {
        value > Decimal::ZERO
    };
    if !lower_ok || value > Decimal::ONE {
        return Err(invalid(key, format!("{value} is outside (0, 1]")));
    }
    Ok(())
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if self.min_leverage == 0 || self.min_leverage > self.max_leverage {
            return Err(invalid(
                "min_leverage",
                format!("must be between 1 and max_leverage ({})", self.max_leverage),
            ));
        }
        if self.max_leverage > MAX_EXCHANGE_LEVERAGE {
            return Err(invalid(
                "max_leverage",
                format!("must not exceed {MAX_EXCHANGE_LEVERAGE}"),
            ));
        }
        fraction_in("position_size_fraction", self.position_size_fraction, false)?;
        fraction_in("stop_loss_pct", self.stop_loss_pct, false)?;
        fraction_in("take_profit1_pct", self.take_profit1_pct, false)?;
        fraction_in("take_profit2_pct", self.take_profit2_pct, false)?;
        fraction_in("trailing_take_profit_pct", self.trailing_take_profit_pct, false)?;
        if self.take_profit2_pct <= self.take_profit1_pct {
            return Err(invalid(
                "take_profit2_pct",
                "must be greater than take_profit1_pct",
            ));
        }
        if !(0.0..=1.0).contains(&self.sentiment_threshold) {
            return Err(invalid("sentiment_threshold", "must be within [0, 1]"));
        }
        if self.max_positions == 0 {
            return Err(invalid("max_positions", "must be at least 1"));
        }
        fraction_in("reentry_threshold_pct", self.reentry_threshold_pct, true)?;
        if self.stagnation_minutes <= 0 {
            return Err(invalid("stagnation_minutes", "must be positive"));
        }
        fraction_in("stagnation_move_pct", self.stagnation_move_pct, false)?;
        fraction_in("min_available_fraction", self.min_available_fraction, true)?;
        if !(0.0..=1.0).contains(&self.entry_score_threshold) {
            return Err(invalid("entry_score_threshold", "must be within [0, 1]"));
        }
        Ok(())
    }

    /// Parse and apply one key. The settings are unchanged on error.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let mut next = self.clone();
        next.apply(key, value)?;
        next.validate()?;
        *self = next;
        Ok(())
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        let next = self;
        match key {
            "min_leverage" => next.min_leverage = parse(key, value)?,
            "max_leverage" => next.max_leverage = parse(key, value)?,
            "position_size_fraction" => next.position_size_fraction = parse(key, value)?,
            "stop_loss_pct" => next.stop_loss_pct = parse(key, value)?,
            "take_profit1_pct" => next.take_profit1_pct = parse(key, value)?,
            "take_profit2_pct" => next.take_profit2_pct = parse(key, value)?,
            "trailing_take_profit_pct" => next.trailing_take_profit_pct = parse(key, value)?,
            "timeframe" => {
                next.timeframe = value
                    .trim()
                    .parse()
                    .map_err(|e: Error| invalid(key, e.to_string()))?
            }
            "sentiment_threshold" => next.sentiment_threshold = parse(key, value)?,
            "max_positions" => next.max_positions = parse(key, value)?,
            "hedging_enabled" => next.hedging_enabled = parse_bool(key, value)?,
            "reentry_threshold_pct" => next.reentry_threshold_pct = parse(key, value)?,
            "stagnation_minutes" => next.stagnation_minutes = parse(key, value)?,
            "stagnation_move_pct" => next.stagnation_move_pct = parse(key, value)?,
            "min_available_fraction" => next.min_available_fraction = parse(key, value)?,
            "entry_score_threshold" => next.entry_score_threshold = parse(key, value)?,
            "favorite_symbols" => {
                next.favorite_symbols = value
                    .split(',')
                    .map(|s| s.trim().to_ascii_uppercase())
                    .filter(|s| !s.is_empty())
                    .collect()
            }
            other => return Err(Error::UnknownSetting(other.to_string())),
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<String> {
        let value = match key {
            "min_leverage" => self.min_leverage.to_string(),
            "max_leverage" => self.max_leverage.to_string(),
            "position_size_fraction" => self.position_size_fraction.to_string(),
            "stop_loss_pct" => self.stop_loss_pct.to_string(),
            "take_profit1_pct" => self.take_profit1_pct.to_string(),
            "take_profit2_pct" => self.take_profit2_pct.to_string(),
            "trailing_take_profit_pct" => self.trailing_take_profit_pct.to_string(),
            "timeframe" => self.timeframe.to_string(),
            "sentiment_threshold" => self.sentiment_threshold.to_string(),
            "max_positions" => self.max_positions.to_string(),
            "hedging_enabled" => (if self.hedging_enabled { "on" } else { "off" }).to_string(),
            "reentry_threshold_pct" => self.reentry_threshold_pct.to_string(),
            "stagnation_minutes" => self.stagnation_minutes.to_string(),
            "stagnation_move_pct" => self.stagnation_move_pct.to_string(),
            "min_available_fraction" => self.min_available_fraction.to_string(),
            "entry_score_threshold" => self.entry_score_threshold.to_string(),
            "favorite_symbols" => self.favorite_symbols.join(","),
            other => return Err(Error::UnknownSetting(other.to_string())),
        };
        Ok(value)
    }

    pub fn to_document(&self) -> BTreeMap<String, String> {
        SETTING_KEYS
            .iter()
            .filter_map(|k| self.get(k).ok().map(|v| (k.to_string(), v)))
            .collect()
    }

    /// Build settings from a stored document. Missing keys keep defaults.
    pub fn from_document(doc: &BTreeMap<String, String>) -> Result<Self> {
        let mut settings = Settings::default();
        for (key, value) in doc {
            settings.apply(key, value)?;
        }
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let doc: BTreeMap<String, String> = serde_json::from_str(&raw)?;
        Self::from_document(&doc)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let raw = serde_json::to_string_pretty(&self.to_document())?;
        std::fs::write(path, raw)?;
        Ok(())
    }

    pub fn is_favorite(&self, symbol: &str) -> bool {
        self.favorite_symbols.is_empty() || self.favorite_symbols.iter().any(|s| s == symbol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(Settings::default().validate().is_ok());
    }

    #[test]
    fn test_unknown_key() {
        let mut settings = Settings::default();
        let err = settings.set("moon_mode", "on").unwrap_err();
        assert!(matches!(err, Error::UnknownSetting(k) if k == "moon_mode"));
    }

    #[test]
    fn test_invalid_value_leaves_settings_untouched() {
        let mut settings = Settings::default();
        let before = settings.clone();

        assert!(matches!(
            settings.set("stop_loss_pct", "abc"),
            Err(Error::InvalidSetting { .. })
        ));
        assert!(matches!(
            settings.set("min_leverage", "200"),
            Err(Error::InvalidSetting { .. })
        ));
        assert!(matches!(
            settings.set("take_profit1_pct", "0.09"),
            Err(Error::InvalidSetting { .. })
        ));
        assert_eq!(settings, before);
    }

    #[test]
    fn test_set_and_document_roundtrip() {
        let mut settings = Settings::default();
        settings.set("hedging_enabled", "on").unwrap();
        settings.set("favorite_symbols", "btcusdt, ethusdt,").unwrap();
        settings.set("timeframe", "4h").unwrap();

        assert!(settings.hedging_enabled);
        assert_eq!(settings.favorite_symbols, vec!["BTCUSDT", "ETHUSDT"]);
        assert!(settings.is_favorite("ETHUSDT"));
        assert!(!settings.is_favorite("SOLUSDT"));

        let doc = settings.to_document();
        assert_eq!(doc.len(), SETTING_KEYS.len());
        assert_eq!(Settings::from_document(&doc).unwrap(), settings);
    }

    #[test]
    fn test_load_and_save() {
        let path = std::env::temp_dir().join(format!("settings-{}.json", uuid::Uuid::new_v4()));
        let mut settings = Settings::default();
        settings.set("max_positions", "3").unwrap();
        settings.save(&path).unwrap();

        let loaded = Settings::load(&path).unwrap();
        assert_eq!(loaded.max_positions, 3);
        let _ = std::fs::remove_file(&path);
    }
}
