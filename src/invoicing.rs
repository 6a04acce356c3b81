//! Pending-payments summary — the rounded financial aggregate the
//! invoice screen emits over a patient's outstanding items.
//!
//! `summarize` is a pure function over a caller-filtered item list; the
//! one database touch lives in `pending_summary_for_patient`, which
//! assembles the items from the outstanding-payments query.

use chrono::NaiveDate;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::db::{self, DatabaseError};

/// Tolerated drift per aggregate: floating-point currency arithmetic,
/// never treated as fatal below a cent.
const DRIFT_TOLERANCE: f64 = 0.01;

/// Round to cents. The epsilon keeps values sitting just under a cent
/// boundary (float truncation across many small line items) from
/// rounding down.
pub fn round2(value: f64) -> f64 {
    ((value + 1e-9) * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DateRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

/// One outstanding line item. For ledger-backed summaries the amount is
/// the payment's remaining balance — the invoice bills what is owed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingItem {
    pub payment_id: Uuid,
    pub payment_date: NaiveDate,
    pub amount: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum DiscountConfig {
    None,
    /// Percent of the subtotal.
    Percentage(f64),
    /// Flat amount, capped at the subtotal.
    Flat(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TaxConfig {
    pub enabled: bool,
    /// Percent of the post-discount amount.
    pub rate: f64,
}

impl TaxConfig {
    pub fn none() -> Self {
        Self {
            enabled: false,
            rate: 0.0,
        }
    }

    pub fn percentage(rate: f64) -> Self {
        Self {
            enabled: true,
            rate,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingSummary {
    pub range: DateRange,
    pub item_count: usize,
    pub subtotal: f64,
    pub discount: f64,
    pub tax: f64,
    pub total: f64,
}

/// subtotal = Σ amounts; discount capped at the subtotal so the total
/// can never go negative; tax applies to the post-discount amount.
/// Every aggregate is cent-rounded.
pub fn summarize(
    items: &[PendingItem],
    discount: DiscountConfig,
    tax: TaxConfig,
    range: DateRange,
) -> PendingSummary {
    let subtotal = round2(items.iter().map(|item| item.amount).sum());

    let discount_amount = match discount {
        DiscountConfig::None => 0.0,
        DiscountConfig::Percentage(pct) => round2((subtotal * pct / 100.0).min(subtotal)),
        DiscountConfig::Flat(flat) => round2(flat.min(subtotal)),
    };

    let post_discount = subtotal - discount_amount;
    let tax_amount = if tax.enabled {
        round2(post_discount * tax.rate / 100.0)
    } else {
        0.0
    };

    PendingSummary {
        range,
        item_count: items.len(),
        subtotal,
        discount: discount_amount,
        tax: tax_amount,
        total: round2(post_discount + tax_amount),
    }
}

/// Self-check before invoice emission: recompute the subtotal from the
/// items and the total from the stored subtotal/discount/tax; drift
/// beyond 0.01 on either fails the summary. Logs and returns false,
/// never panics — the caller blocks emission.
pub fn validate(summary: &PendingSummary, items: &[PendingItem]) -> bool {
    let subtotal = round2(items.iter().map(|item| item.amount).sum());
    if (subtotal - summary.subtotal).abs() > DRIFT_TOLERANCE {
        warn!(
            stored = summary.subtotal,
            recomputed = subtotal,
            "pending summary subtotal drift"
        );
        return false;
    }

    let total = round2(summary.subtotal - summary.discount + summary.tax);
    if (total - summary.total).abs() > DRIFT_TOLERANCE {
        warn!(
            stored = summary.total,
            recomputed = total,
            "pending summary total drift"
        );
        return false;
    }

    true
}

/// Assemble the outstanding items for one patient in a date range and
/// summarize them. Outstanding = non-completed payments; the billed
/// amount per item is the remaining balance.
pub fn pending_summary_for_patient(
    conn: &Connection,
    patient_id: &Uuid,
    range: DateRange,
    discount: DiscountConfig,
    tax: TaxConfig,
) -> Result<PendingSummary, DatabaseError> {
    let payments = db::outstanding_payments(conn, patient_id, range.from, range.to)?;
    let items: Vec<PendingItem> = payments
        .iter()
        .map(|payment| PendingItem {
            payment_id: payment.id,
            payment_date: payment.payment_date,
            amount: payment.remaining_balance,
        })
        .collect();
    Ok(summarize(&items, discount, tax, range))
}
