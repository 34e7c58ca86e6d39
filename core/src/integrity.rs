//! Tamper-evidence checksum over the financial fields of a payment.
//!
//! This is an unkeyed SHA-256 digest: it detects accidental or manual edits
//! to a stored row, it does not authenticate anyone.

use crate::types::Money;
use chrono::NaiveDate;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy)]
pub struct IntegrityFields<'a> {
    pub amount: Money,
    pub currency: &'a str,
    pub payment_date: NaiveDate,
    pub subscriber_id: &'a str,
    pub method: &'a str,
}

impl IntegrityFields<'_> {
    /// Canonical, order-fixed rendering. `100` and `100.00` hash the same.
    fn canonical(&self) -> String {
        format!(
            "amount={}|currency={}|date={}|party={}|method={}",
            self.amount.normalize(),
            self.currency.to_uppercase(),
            self.payment_date.format("%Y-%m-%d"),
            self.subscriber_id,
            self.method.to_lowercase(),
        )
    }
}

pub fn fingerprint(fields: &IntegrityFields<'_>) -> String {
    let digest = Sha256::digest(fields.canonical().as_bytes());
    hex::encode(digest)
}

pub fn verify(fields: &IntegrityFields<'_>, stored: &str) -> bool {
    fingerprint(fields).eq_ignore_ascii_case(stored)
}
