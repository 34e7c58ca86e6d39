//! Currency conversion helpers. Rates are injected; this module never
//! fetches them.

use crate::{
    config::RateEntry,
    error::{BillingError, BillingResult},
    types::Money,
};
use rust_decimal::Decimal;
use std::collections::HashMap;

/// Fallback rates used when no configured rate exists for a pair.
/// (from, to, rate) where `amount_in_to = amount_in_from * rate`.
pub const DEFAULT_RATES: &[(&str, &str, &str)] = &[
    ("USD", "VES", "36.50"),
    ("EUR", "USD", "1.08"),
    ("USD", "COP", "3900"),
];

pub trait CurrencyRateProvider: Send + Sync {
    /// Multiplier converting one unit of `from` into `to`.
    fn rate(&self, from: &str, to: &str) -> BillingResult<Decimal>;
}

/// Configured rates with inverse lookup and the `DEFAULT_RATES` fallback.
#[derive(Debug, Clone, Default)]
pub struct RateTable {
    rates: HashMap<(String, String), Decimal>,
}

impl RateTable {
    pub fn new(entries: &[RateEntry]) -> Self {
        let rates = entries
            .iter()
            .map(|e| ((e.from.to_uppercase(), e.to.to_uppercase()), e.rate))
            .collect();
        Self { rates }
    }

    pub fn with_rate(mut self, from: &str, to: &str, rate: Decimal) -> Self {
        self.rates
            .insert((from.to_uppercase(), to.to_uppercase()), rate);
        self
    }

    fn lookup(map: &HashMap<(String, String), Decimal>, from: &str, to: &str) -> Option<Decimal> {
        if let Some(rate) = map.get(&(from.to_string(), to.to_string())) {
            return Some(*rate);
        }
        map.get(&(to.to_string(), from.to_string()))
            .filter(|r| !r.is_zero())
            .map(|r| Decimal::ONE / *r)
    }

    fn defaults() -> HashMap<(String, String), Decimal> {
        DEFAULT_RATES
            .iter()
            .filter_map(|(f, t, r)| {
                r.parse::<Decimal>()
                    .ok()
                    .map(|rate| ((f.to_string(), t.to_string()), rate))
            })
            .collect()
    }
}

impl CurrencyRateProvider for RateTable {
    fn rate(&self, from: &str, to: &str) -> BillingResult<Decimal> {
        let from = from.to_uppercase();
        let to = to.to_uppercase();
        if from == to {
            return Ok(Decimal::ONE);
        }
        if let Some(rate) = Self::lookup(&self.rates, &from, &to) {
            return Ok(rate);
        }
        if let Some(rate) = Self::lookup(&Self::defaults(), &from, &to) {
            log::debug!("using fallback rate {from}->{to} = {rate}");
            return Ok(rate);
        }
        Err(BillingError::UnknownCurrencyRate { from, to })
    }
}

/// Convert `amount` from one currency to another, rounded to `scale`.
/// Returns the converted amount and the rate used.
pub fn convert(
    rates: &dyn CurrencyRateProvider,
    amount: Money,
    from: &str,
    to: &str,
    scale: u32,
) -> BillingResult<(Money, Decimal)> {
    let rate = rates.rate(from, to)?;
    let converted = (amount * rate)
        .round_dp_with_strategy(scale, rust_decimal::RoundingStrategy::MidpointAwayFromZero);
    Ok((converted, rate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn identity_rate_is_one() {
        let table = RateTable::default();
        assert_eq!(table.rate("usd", "USD").unwrap(), Decimal::ONE);
    }

    #[test]
    fn configured_rate_beats_fallback() {
        let table = RateTable::default().with_rate("USD", "VES", dec!(40));
        assert_eq!(table.rate("USD", "VES").unwrap(), dec!(40));
    }

    #[test]
    fn inverse_rate_is_derived() {
        let table = RateTable::default().with_rate("USD", "VES", dec!(40));
        let (usd, rate) = convert(&table, dec!(400), "VES", "USD", 2).unwrap();
        assert_eq!(usd, dec!(10.00));
        assert_eq!(rate, dec!(1) / dec!(40));
    }

    #[test]
    fn fallback_table_is_used() {
        let table = RateTable::default();
        assert_eq!(table.rate("USD", "VES").unwrap(), dec!(36.50));
    }

    #[test]
    fn unknown_pair_is_an_error() {
        let err = RateTable::default().rate("GBP", "JPY").unwrap_err();
        assert_eq!(err.code(), "UNKNOWN_CURRENCY_RATE");
    }
}
