//! Payment/appointment reconciliation engine.
//!
//! Every payment row carries derived fields (`total_amount_due`,
//! `amount_paid`, `remaining_balance`, `status`) that must stay
//! consistent with the linked appointment/treatment cost. Any write —
//! recording, updating or deleting a payment, or changing a cost —
//! re-walks all payments for the affected link in chronological order
//! and rewrites the running totals, inside one transaction. That keeps
//! the invariant intact even for backdated entries and retroactive
//! price changes.

use chrono::Utc;
use rusqlite::Connection;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::db::{self, DatabaseError};
use crate::invoicing::round2;
use crate::models::*;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Payment amount must be non-negative, got {0}")]
    NegativeAmount(f64),

    #[error("Cost must be non-negative, got {0}")]
    NegativeCost(f64),
}

/// Record a payment and reconcile its link.
///
/// For linked payments the authoritative due is the caller's
/// `total_amount_due` override when supplied (quoted price differing
/// from the face cost), else the linked record's current cost. General
/// payments default the due to their own amount.
pub fn record_payment(conn: &Connection, new: &NewPayment) -> Result<Payment, LedgerError> {
    if new.amount < 0.0 {
        return Err(LedgerError::NegativeAmount(new.amount));
    }
    if let Some(due) = new.total_amount_due {
        if due < 0.0 {
            return Err(LedgerError::NegativeAmount(due));
        }
    }

    let tx = conn.unchecked_transaction().map_err(DatabaseError::from)?;

    // Fail fast before any write
    if db::get_patient(&tx, &new.patient_id)?.is_none() {
        return Err(not_found("patient", &new.patient_id));
    }

    let now = Utc::now().naive_utc();
    let payment = Payment {
        id: Uuid::new_v4(),
        patient_id: new.patient_id,
        link: new.link.clone(),
        amount: round2(new.amount),
        method: new.method.clone(),
        payment_date: new.payment_date,
        status: PaymentStatus::Pending,
        discount_amount: 0.0,
        tax_amount: 0.0,
        total_amount: round2(new.amount),
        total_amount_due: 0.0,
        amount_paid: 0.0,
        remaining_balance: 0.0,
        notes: new.notes.clone(),
        created_at: now,
        updated_at: now,
    };

    match &new.link {
        PaymentLink::Appointment(id) => {
            let appointment =
                db::get_appointment(&tx, id)?.ok_or_else(|| not_found("appointment", id))?;
            db::insert_payment_row(&tx, &payment)?;
            let due = new.total_amount_due.unwrap_or(appointment.cost);
            rewalk(&tx, &new.link, due)?;
        }
        PaymentLink::Treatment(id) => {
            let treatment =
                db::get_treatment(&tx, id)?.ok_or_else(|| not_found("tooth_treatment", id))?;
            db::insert_payment_row(&tx, &payment)?;
            let due = new.total_amount_due.unwrap_or(treatment.cost);
            rewalk(&tx, &new.link, due)?;
        }
        PaymentLink::General => {
            db::insert_payment_row(&tx, &payment)?;
            let due = new.total_amount_due.unwrap_or(payment.amount);
            settle_general(&tx, &payment.id, due, payment.amount)?;
        }
    }

    let stored = db::get_payment(&tx, &payment.id)?.ok_or_else(|| not_found("payment", &payment.id))?;
    tx.commit().map_err(DatabaseError::from)?;
    Ok(stored)
}

/// Apply field changes to an existing payment and reconcile its link.
/// Re-linking is not supported; delete and re-record instead.
pub fn update_payment(
    conn: &Connection,
    id: &Uuid,
    update: &PaymentUpdate,
) -> Result<Payment, LedgerError> {
    if let Some(amount) = update.amount {
        if amount < 0.0 {
            return Err(LedgerError::NegativeAmount(amount));
        }
    }
    if let Some(due) = update.total_amount_due {
        if due < 0.0 {
            return Err(LedgerError::NegativeAmount(due));
        }
    }

    let tx = conn.unchecked_transaction().map_err(DatabaseError::from)?;

    let mut payment = db::get_payment(&tx, id)?.ok_or_else(|| not_found("payment", id))?;
    if let Some(amount) = update.amount {
        payment.amount = round2(amount);
        payment.total_amount = round2(payment.amount - payment.discount_amount + payment.tax_amount);
    }
    if let Some(method) = &update.method {
        payment.method = method.clone();
    }
    if let Some(date) = update.payment_date {
        payment.payment_date = date;
    }
    if let Some(notes) = &update.notes {
        payment.notes = notes.clone();
    }
    db::update_payment_fields(&tx, &payment)?;

    match &payment.link {
        PaymentLink::Appointment(appointment_id) => {
            let appointment = db::get_appointment(&tx, appointment_id)?
                .ok_or_else(|| not_found("appointment", appointment_id))?;
            let due = update.total_amount_due.unwrap_or(appointment.cost);
            rewalk(&tx, &payment.link, due)?;
        }
        PaymentLink::Treatment(treatment_id) => {
            let treatment = db::get_treatment(&tx, treatment_id)?
                .ok_or_else(|| not_found("tooth_treatment", treatment_id))?;
            let due = update.total_amount_due.unwrap_or(treatment.cost);
            rewalk(&tx, &payment.link, due)?;
        }
        PaymentLink::General => {
            // A stored due survives amount edits; only an explicit
            // override replaces it.
            let due = update.total_amount_due.unwrap_or(payment.total_amount_due);
            settle_general(&tx, &payment.id, due, payment.amount)?;
        }
    }

    let stored = db::get_payment(&tx, id)?.ok_or_else(|| not_found("payment", id))?;
    tx.commit().map_err(DatabaseError::from)?;
    Ok(stored)
}

/// Delete a payment and reconcile the remaining siblings against the
/// link's current cost.
pub fn delete_payment(conn: &Connection, id: &Uuid) -> Result<(), LedgerError> {
    let tx = conn.unchecked_transaction().map_err(DatabaseError::from)?;

    let payment = db::get_payment(&tx, id)?.ok_or_else(|| not_found("payment", id))?;
    db::delete_payment_row(&tx, id)?;

    match &payment.link {
        PaymentLink::Appointment(appointment_id) => {
            if let Some(appointment) = db::get_appointment(&tx, appointment_id)? {
                rewalk(&tx, &payment.link, appointment.cost)?;
            }
        }
        PaymentLink::Treatment(treatment_id) => {
            if let Some(treatment) = db::get_treatment(&tx, treatment_id)? {
                rewalk(&tx, &payment.link, treatment.cost)?;
            }
        }
        PaymentLink::General => {}
    }

    tx.commit().map_err(DatabaseError::from)?;
    Ok(())
}

/// Change an appointment's cost and re-derive every linked payment's
/// paid/remaining/status from the new due — a retroactive price change
/// must never leave the ledger stale.
pub fn update_appointment_cost(
    conn: &Connection,
    id: &Uuid,
    new_cost: f64,
) -> Result<(), LedgerError> {
    if new_cost < 0.0 {
        return Err(LedgerError::NegativeCost(new_cost));
    }

    let tx = conn.unchecked_transaction().map_err(DatabaseError::from)?;
    db::set_appointment_cost(&tx, id, round2(new_cost))?;
    rewalk(&tx, &PaymentLink::Appointment(*id), new_cost)?;
    tx.commit().map_err(DatabaseError::from)?;
    Ok(())
}

/// Treatment counterpart of `update_appointment_cost`.
pub fn update_treatment_cost(conn: &Connection, id: &Uuid, new_cost: f64) -> Result<(), LedgerError> {
    if new_cost < 0.0 {
        return Err(LedgerError::NegativeCost(new_cost));
    }

    let tx = conn.unchecked_transaction().map_err(DatabaseError::from)?;
    db::set_treatment_cost(&tx, id, round2(new_cost))?;
    rewalk(&tx, &PaymentLink::Treatment(*id), new_cost)?;
    tx.commit().map_err(DatabaseError::from)?;
    Ok(())
}

/// Forced re-walk from the appointment's current cost. Repair hook for
/// restored backups and rows written by pre-ledger builds.
pub fn recalculate_appointment_payments(conn: &Connection, id: &Uuid) -> Result<(), LedgerError> {
    let tx = conn.unchecked_transaction().map_err(DatabaseError::from)?;
    let appointment = db::get_appointment(&tx, id)?.ok_or_else(|| not_found("appointment", id))?;
    rewalk(&tx, &PaymentLink::Appointment(*id), appointment.cost)?;
    tx.commit().map_err(DatabaseError::from)?;
    Ok(())
}

/// Rewrite the derived fields of every payment on the link to a
/// consistent running total, in ledger order (payment_date, then
/// insertion order). Cent-rounded so float dust cannot hold a settled
/// balance at `partial`.
fn rewalk(conn: &Connection, link: &PaymentLink, total_due: f64) -> Result<(), DatabaseError> {
    let siblings = match link {
        PaymentLink::Appointment(id) => db::payments_for_appointment(conn, id)?,
        PaymentLink::Treatment(id) => db::payments_for_treatment(conn, id)?,
        PaymentLink::General => return Ok(()),
    };

    let due = round2(total_due);
    let mut running = 0.0;
    for sibling in &siblings {
        running += sibling.amount;
        let paid = round2(running);
        let remaining = round2((due - paid).max(0.0));
        let status = derive_status(paid, remaining);
        db::update_ledger_fields(conn, &sibling.id, due, paid, remaining, &status)?;
    }

    debug!(?link, due, payments = siblings.len(), "ledger re-walk");
    Ok(())
}

/// General payments reconcile against their own due only; no
/// cross-payment aggregation.
fn settle_general(conn: &Connection, id: &Uuid, due: f64, amount: f64) -> Result<(), DatabaseError> {
    let due = round2(due);
    let paid = round2(amount);
    let remaining = round2((due - paid).max(0.0));
    let status = derive_status(paid, remaining);
    db::update_ledger_fields(conn, id, due, paid, remaining, &status)
}

/// Completed is checked first so zero-due records complete immediately,
/// even at amount 0.
fn derive_status(amount_paid: f64, remaining_balance: f64) -> PaymentStatus {
    if remaining_balance <= 0.0 {
        PaymentStatus::Completed
    } else if amount_paid > 0.0 {
        PaymentStatus::Partial
    } else {
        PaymentStatus::Pending
    }
}

fn not_found(entity_type: &str, id: &Uuid) -> LedgerError {
    LedgerError::Database(DatabaseError::NotFound {
        entity_type: entity_type.into(),
        id: id.to_string(),
    })
}
