//! Jurisdiction-specific tax add-ons on payments.

use crate::{config::TaxConfig, types::Money};
use rust_decimal::{Decimal, RoundingStrategy};

/// Levy charged on top of one payment part, in the part's own currency.
#[derive(Debug, Clone, PartialEq)]
pub struct LevyCharge {
    pub name: String,
    pub rate: Decimal,
    pub amount: Money,
}

/// Every levy that applies to a part paid in `currency` through `method`.
/// A levy with an empty method list applies to every method.
pub fn levies_for(
    tax: &TaxConfig,
    amount: Money,
    currency: &str,
    method: &str,
    scale: u32,
) -> Vec<LevyCharge> {
    tax.levies
        .iter()
        .filter(|l| l.currencies.iter().any(|c| c.eq_ignore_ascii_case(currency)))
        .filter(|l| l.methods.is_empty() || l.methods.iter().any(|m| m.eq_ignore_ascii_case(method)))
        .map(|l| LevyCharge {
            name: l.name.clone(),
            rate: l.rate,
            amount: (amount * l.rate)
                .round_dp_with_strategy(scale, RoundingStrategy::MidpointAwayFromZero),
        })
        .collect()
}

pub fn total_levy(
    tax: &TaxConfig,
    amount: Money,
    currency: &str,
    method: &str,
    scale: u32,
) -> Money {
    levies_for(tax, amount, currency, method, scale)
        .iter()
        .map(|c| c.amount)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LevyConfig;
    use rust_decimal_macros::dec;

    fn igtf() -> TaxConfig {
        TaxConfig {
            levies: vec![LevyConfig {
                name: "IGTF".into(),
                rate: dec!(0.03),
                currencies: vec!["USD".into()],
                methods: vec![],
            }],
        }
    }

    #[test]
    fn levy_applies_only_to_listed_currency() {
        assert_eq!(total_levy(&igtf(), dec!(100), "USD", "cash", 2), dec!(3.00));
        assert_eq!(total_levy(&igtf(), dec!(100), "VES", "cash", 2), Decimal::ZERO);
    }

    #[test]
    fn method_filter_narrows_levy() {
        let mut tax = igtf();
        tax.levies[0].methods = vec!["cash".into()];
        assert_eq!(total_levy(&tax, dec!(10), "usd", "CASH", 2), dec!(0.30));
        assert!(levies_for(&tax, dec!(10), "USD", "transfer", 2).is_empty());
    }
}
