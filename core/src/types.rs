//! Shared primitive types used across the whole billing core.

use chrono::{Datelike, NaiveDate};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Money in a single currency. Always a `Decimal`, never a float.
pub type Money = Decimal;

/// Stable identifier for any persisted entity.
pub type EntityId = String;

/// The canonical cycle-run identifier.
pub type RunId = String;

/// ISO-4217-ish currency code ("USD", "VES", ...).
pub type CurrencyCode = String;

/// A billing period: one calendar month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Period {
    pub year: i32,
    pub month: u32,
}

impl Period {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        (1..=12).contains(&month).then_some(Self { year, month })
    }

    pub fn of(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn first_day(&self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1)
            .unwrap_or(NaiveDate::MIN)
    }

    pub fn days_in_month(&self) -> u32 {
        let (y, m) = if self.month == 12 {
            (self.year + 1, 1)
        } else {
            (self.year, self.month + 1)
        };
        NaiveDate::from_ymd_opt(y, m, 1)
            .and_then(|next| next.pred_opt())
            .map(|last| last.day())
            .unwrap_or(28)
    }

    /// The given day of this month, clamped to the month's length.
    pub fn clamped_day(&self, day: u32) -> NaiveDate {
        let day = day.clamp(1, self.days_in_month());
        NaiveDate::from_ymd_opt(self.year, self.month, day).unwrap_or_else(|| self.first_day())
    }

    /// Storage key, e.g. "2026-03".
    pub fn key(&self) -> String {
        format!("{:04}-{:02}", self.year, self.month)
    }

    pub fn parse(key: &str) -> Option<Self> {
        let (y, m) = key.split_once('-')?;
        Self::new(y.parse().ok()?, m.parse().ok()?)
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn february_is_clamped() {
        let p = Period::new(2026, 2).unwrap();
        assert_eq!(p.days_in_month(), 28);
        assert_eq!(p.clamped_day(31), NaiveDate::from_ymd_opt(2026, 2, 28).unwrap());
        assert_eq!(Period::new(2028, 2).unwrap().days_in_month(), 29);
    }

    #[test]
    fn key_parses_back() {
        let p = Period::new(2026, 12).unwrap();
        assert_eq!(p.key(), "2026-12");
        assert_eq!(Period::parse("2026-12"), Some(p));
        assert_eq!(Period::parse("2026-13"), None);
    }
}
