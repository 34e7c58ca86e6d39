use crate::types::{CurrencyCode, Money};
use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ── Billing calendar ──────────────────────────────────────────────

/// Fallback calendar for subscribers whose router and zone define none.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarConfig {
    pub default_billing_day: u32,
    pub default_grace_period_days: u32,
}

// ── Proration ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProrationConfig {
    /// Unforced runs do nothing before this day of the month.
    pub start_day: u32,
    /// Days at the start of the month during which no discount applies.
    pub grace_days: u32,
}

// ── Payments ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentPolicyConfig {
    pub duplicate_window_minutes: i64,
}

// ── Taxes ─────────────────────────────────────────────────────────

/// A financial-transaction levy charged on top of payments made in
/// specific currencies (and optionally only through specific methods).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LevyConfig {
    pub name: String,
    pub rate: Decimal,
    pub currencies: Vec<CurrencyCode>,
    #[serde(default)]
    pub methods: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaxConfig {
    pub levies: Vec<LevyConfig>,
}

// ── Suspension freeze ─────────────────────────────────────────────

/// Global switch that suppresses suspensions (never restorations).
/// Open-ended on either side when `from`/`until` are absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FreezeWindow {
    pub enabled: bool,
    #[serde(default)]
    pub from: Option<NaiveDateTime>,
    #[serde(default)]
    pub until: Option<NaiveDateTime>,
}

impl FreezeWindow {
    pub fn is_active(&self, now: NaiveDateTime) -> bool {
        self.enabled
            && self.from.map_or(true, |from| now >= from)
            && self.until.map_or(true, |until| now < until)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SuspensionConfig {
    #[serde(default)]
    pub freeze: FreezeWindow,
}

// ── Currency ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateEntry {
    pub from: CurrencyCode,
    pub to: CurrencyCode,
    pub rate: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
struct RatesFile {
    rates: Vec<RateEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct BillingFile {
    ledger_currency: CurrencyCode,
    reporting_currency: CurrencyCode,
    #[serde(default = "default_money_scale")]
    money_scale: u32,
    calendar: CalendarConfig,
    proration: ProrationConfig,
    payments: PaymentPolicyConfig,
    #[serde(default)]
    tax: TaxConfig,
    #[serde(default)]
    suspension: SuspensionConfig,
}

fn default_money_scale() -> u32 {
    2
}

#[derive(Debug, Clone)]
pub struct BillingConfig {
    /// Currency invoices and balances are kept in.
    pub ledger_currency: CurrencyCode,
    /// Currency `Payment.base_amount` is reported in.
    pub reporting_currency: CurrencyCode,
    /// Decimal places money is rounded to after conversion.
    pub money_scale: u32,
    pub calendar: CalendarConfig,
    pub proration: ProrationConfig,
    pub payments: PaymentPolicyConfig,
    pub tax: TaxConfig,
    pub suspension: SuspensionConfig,
    pub rates: Vec<RateEntry>,
}

impl BillingConfig {
    /// Load from the data/ directory.
    /// In tests, use BillingConfig::default_test().
    pub fn load(data_dir: &str) -> anyhow::Result<Self> {
        let billing_path = format!("{data_dir}/billing/billing_config.json");
        let billing_content = std::fs::read_to_string(&billing_path)
            .map_err(|e| anyhow::anyhow!("Cannot read {billing_path}: {e}"))?;
        let file: BillingFile = serde_json::from_str(&billing_content)?;

        let rates_path = format!("{data_dir}/currency/rates.json");
        let rates = match std::fs::read_to_string(&rates_path) {
            Ok(content) => serde_json::from_str::<RatesFile>(&content)?.rates,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::warn!("{rates_path} not found; using fallback rate table only");
                Vec::new()
            }
            Err(e) => return Err(anyhow::anyhow!("Cannot read {rates_path}: {e}")),
        };

        let config = Self {
            ledger_currency: file.ledger_currency,
            reporting_currency: file.reporting_currency,
            money_scale: file.money_scale,
            calendar: file.calendar,
            proration: file.proration,
            payments: file.payments,
            tax: file.tax,
            suspension: file.suspension,
            rates,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if !(1..=31).contains(&self.calendar.default_billing_day) {
            anyhow::bail!(
                "calendar.default_billing_day must be 1..=31, got {}",
                self.calendar.default_billing_day
            );
        }
        if self.proration.grace_days >= 28 {
            anyhow::bail!(
                "proration.grace_days must leave a non-empty discount window, got {}",
                self.proration.grace_days
            );
        }
        if self.payments.duplicate_window_minutes < 0 {
            anyhow::bail!("payments.duplicate_window_minutes must not be negative");
        }
        for entry in &self.rates {
            if entry.rate <= Decimal::ZERO {
                anyhow::bail!("rate {} -> {} must be positive", entry.from, entry.to);
            }
        }
        Ok(())
    }

    /// Config with hardcoded defaults for use in tests.
    pub fn default_test() -> Self {
        Self {
            ledger_currency: "USD".into(),
            reporting_currency: "VES".into(),
            money_scale: 2,
            calendar: CalendarConfig {
                default_billing_day: 1,
                default_grace_period_days: 5,
            },
            proration: ProrationConfig {
                start_day: 6,
                grace_days: 5,
            },
            payments: PaymentPolicyConfig {
                duplicate_window_minutes: 10,
            },
            tax: TaxConfig {
                levies: vec![LevyConfig {
                    name: "IGTF".into(),
                    rate: Decimal::new(3, 2),
                    currencies: vec!["USD".into()],
                    methods: Vec::new(),
                }],
            },
            suspension: SuspensionConfig::default(),
            rates: vec![RateEntry {
                from: "USD".into(),
                to: "VES".into(),
                rate: Decimal::new(3650, 2),
            }],
        }
    }

    /// Round a converted amount to the configured money scale.
    pub fn round_money(&self, amount: Money) -> Money {
        amount.round_dp_with_strategy(
            self.money_scale,
            rust_decimal::RoundingStrategy::MidpointAwayFromZero,
        )
    }
}
