//! Portfolio allocation: which opportunities to take and how big.

use exchange_core::config::EngineConfig;
use exchange_core::types::{AccountSnapshot, Balance, Settings, Side, SymbolInfo};
use exchange_core::{Error, Result};
use risk_manager::{leverage_for_score, SizingInput};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;

use crate::scorer::Opportunity;

/// Enough free margin to open anything at all.
pub fn funds_ok(balance: &Balance, settings: &Settings) -> bool {
    balance.available >= balance.total * settings.min_available_fraction
}

/// Checks that need no exchange metadata.
pub fn is_candidate(
    symbol: &str,
    account: &AccountSnapshot,
    settings: &Settings,
    config: &EngineConfig,
) -> bool {
    !account.holds(symbol) && !config.is_blacklisted(symbol) && settings.is_favorite(symbol)
}

pub fn leverage_eligible(info: &SymbolInfo, config: &EngineConfig) -> bool {
    info.max_leverage >= config.min_symbol_leverage
}

pub fn free_slots(account: &AccountSnapshot, settings: &Settings) -> usize {
    settings.max_positions.saturating_sub(account.open_symbols())
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntryPlan {
    pub symbol: String,
    pub side: Side,
    pub leverage: u32,
    pub quantity: Decimal,
    pub price: Decimal,
}

/// Size an opportunity against the account's available balance.
///
/// Fails with a validation error when the sized quantity floors below the
/// symbol's minimum.
pub fn plan_entry(
    opportunity: &Opportunity,
    info: &SymbolInfo,
    settings: &Settings,
    available: Decimal,
    performance_ratio: f64,
) -> Result<EntryPlan> {
    let price = Decimal::from_f64(opportunity.close)
        .filter(|p| *p > Decimal::ZERO)
        .ok_or_else(|| {
            Error::validation(format!("{}: unusable price {}", opportunity.symbol, opportunity.close))
        })?;

    let leverage = leverage_for_score(
        opportunity.score,
        settings.min_leverage,
        settings.max_leverage,
        info.max_leverage,
    );
    let sizing = SizingInput {
        available,
        base_fraction: settings.position_size_fraction,
        performance_ratio,
        atr_ratio: opportunity.atr_ratio,
        leverage,
        price,
    };
    let quantity = info.tradeable_quantity(sizing.raw_quantity())?;

    Ok(EntryPlan {
        symbol: opportunity.symbol.clone(),
        side: opportunity.side,
        leverage,
        quantity,
        price,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scorer::ScoreBreakdown;
    use chrono::Utc;
    use exchange_core::types::{ExchangePosition, PositionSide};
    use market_signals::EntryRule;

    fn info(max_leverage: u32) -> SymbolInfo {
        SymbolInfo {
            symbol: "SOLUSDT".to_string(),
            tick_size: Decimal::new(1, 2),
            step_size: Decimal::new(1, 1),
            min_qty: Decimal::new(1, 1),
            max_leverage,
        }
    }

    fn opportunity(score: f64, atr_ratio: f64) -> Opportunity {
        Opportunity {
            symbol: "SOLUSDT".to_string(),
            side: Side::Long,
            rule: EntryRule::LongAtSupport,
            score,
            breakdown: ScoreBreakdown::default(),
            close: 100.0,
            atr_ratio,
            sentiment: 0.0,
        }
    }

    fn account(total: i64, available: i64, held: &[&str]) -> AccountSnapshot {
        AccountSnapshot {
            balance: Balance {
                asset: "USDT".to_string(),
                total: Decimal::from(total),
                available: Decimal::from(available),
                cross_unrealized_pnl: Decimal::ZERO,
            },
            positions: held
                .iter()
                .map(|s| ExchangePosition {
                    symbol: s.to_string(),
                    side: Side::Long,
                    position_side: PositionSide::Both,
                    quantity: Decimal::ONE,
                    entry_price: Decimal::ONE,
                    mark_price: Decimal::ONE,
                    leverage: 25,
                    unrealized_pnl: Decimal::ZERO,
                    liquidation_price: Decimal::ZERO,
                })
                .collect(),
            fetched_at: Utc::now(),
        }
    }

    #[test]
    fn test_funds_threshold() {
        let settings = Settings::default();
        assert!(funds_ok(&account(1000, 500, &[]).balance, &settings));
        assert!(!funds_ok(&account(1000, 499, &[]).balance, &settings));
    }

    #[test]
    fn test_candidate_filters() {
        let config = EngineConfig::default();
        let mut settings = Settings::default();
        let acct = account(1000, 1000, &["BTCUSDT"]);

        assert!(is_candidate("ETHUSDT", &acct, &settings, &config));
        assert!(!is_candidate("BTCUSDT", &acct, &settings, &config));
        assert!(!is_candidate("CRVUSDT", &acct, &settings, &config));

        settings.favorite_symbols = vec!["SOLUSDT".to_string()];
        assert!(!is_candidate("ETHUSDT", &acct, &settings, &config));
        assert!(is_candidate("SOLUSDT", &acct, &settings, &config));

        assert!(!leverage_eligible(&info(20), &config));
        assert!(leverage_eligible(&info(25), &config));
    }

    #[test]
    fn test_free_slots() {
        let settings = Settings::default();
        assert_eq!(free_slots(&account(1, 1, &["A", "B"]), &settings), 3);
        assert_eq!(
            free_slots(&account(1, 1, &["A", "B", "C", "D", "E", "F"]), &settings),
            0
        );
    }

    #[test]
    fn test_plan_entry_sizing() {
        let settings = Settings::default();
        // score 0.5 -> 25 + 100 * 0.25 = 50x; neutral ratio and volatility.
        let plan = plan_entry(&opportunity(0.5, 0.02), &info(125), &settings, Decimal::from(1000), 1.0)
            .unwrap();
        assert_eq!(plan.leverage, 50);
        // margin 1000 * 0.05 = 50, notional 2500, quantity 25
        assert_eq!(plan.quantity, Decimal::from(25));
        assert_eq!(plan.side, Side::Long);
    }

    #[test]
    fn test_plan_entry_respects_symbol_cap_and_min_qty() {
        let settings = Settings::default();
        let plan = plan_entry(&opportunity(1.0, 0.02), &info(30), &settings, Decimal::from(1000), 1.0)
            .unwrap();
        assert_eq!(plan.leverage, 30);

        let err = plan_entry(&opportunity(0.5, 0.02), &info(125), &settings, Decimal::new(1, 2), 1.0)
            .unwrap_err();
        assert_eq!(err.kind(), exchange_core::ErrorKind::Validation);
    }
}
