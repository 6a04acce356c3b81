use chrono::{NaiveDate, Utc};
use rusqlite::{params, Connection};
use std::str::FromStr;
use uuid::Uuid;

use crate::db::DatabaseError;
use crate::models::*;

use super::{parse_date, parse_datetime, parse_uuid, DATE_FMT, DATETIME_FMT};

const PAYMENT_COLUMNS: &str = "id, patient_id, appointment_id, tooth_treatment_id, amount, \
     payment_method, payment_date, status, discount_amount, tax_amount, total_amount, \
     total_amount_due, amount_paid, remaining_balance, notes, created_at, updated_at";

/// Insert a full payment row. Crate-private: recording a payment must
/// go through `ledger::record_payment` so derived fields stay consistent.
pub(crate) fn insert_payment_row(conn: &Connection, payment: &Payment) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO payments (id, patient_id, appointment_id, tooth_treatment_id, amount,
         payment_method, payment_date, status, discount_amount, tax_amount, total_amount,
         total_amount_due, amount_paid, remaining_balance, notes, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        params![
            payment.id.to_string(),
            payment.patient_id.to_string(),
            payment.link.appointment_id().map(|id| id.to_string()),
            payment.link.treatment_id().map(|id| id.to_string()),
            payment.amount,
            payment.method.as_str(),
            payment.payment_date.format(DATE_FMT).to_string(),
            payment.status.as_str(),
            payment.discount_amount,
            payment.tax_amount,
            payment.total_amount,
            payment.total_amount_due,
            payment.amount_paid,
            payment.remaining_balance,
            payment.notes,
            payment.created_at.format(DATETIME_FMT).to_string(),
            payment.updated_at.format(DATETIME_FMT).to_string(),
        ],
    )?;
    Ok(())
}

pub fn get_payment(conn: &Connection, id: &Uuid) -> Result<Option<Payment>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = ?1"
    ))?;

    let result = stmt.query_row(params![id.to_string()], payment_row);
    match result {
        Ok(row) => Ok(Some(payment_from_row(row)?)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Filtered listing for report/dashboard consumers, newest first.
pub fn list_payments(conn: &Connection, filter: &PaymentFilter) -> Result<Vec<Payment>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PAYMENT_COLUMNS} FROM payments
         WHERE (?1 IS NULL OR patient_id = ?1)
           AND (?2 IS NULL OR status = ?2)
           AND (?3 IS NULL OR payment_method = ?3)
           AND (?4 IS NULL OR payment_date >= ?4)
           AND (?5 IS NULL OR payment_date <= ?5)
         ORDER BY payment_date DESC, created_at DESC"
    ))?;

    let rows = stmt.query_map(
        params![
            filter.patient_id.map(|id| id.to_string()),
            filter.status.as_ref().map(|s| s.as_str()),
            filter.method.as_ref().map(|m| m.as_str()),
            filter.date_from.map(|d| d.format(DATE_FMT).to_string()),
            filter.date_to.map(|d| d.format(DATE_FMT).to_string()),
        ],
        payment_row,
    )?;

    collect_payments(rows)
}

/// Payments for one appointment in ledger order: chronological by
/// payment_date, insertion order breaking ties.
pub fn payments_for_appointment(
    conn: &Connection,
    appointment_id: &Uuid,
) -> Result<Vec<Payment>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PAYMENT_COLUMNS} FROM payments
         WHERE appointment_id = ?1
         ORDER BY payment_date ASC, created_at ASC, rowid ASC"
    ))?;

    let rows = stmt.query_map(params![appointment_id.to_string()], payment_row)?;
    collect_payments(rows)
}

/// Payments for one treatment in ledger order.
pub fn payments_for_treatment(
    conn: &Connection,
    treatment_id: &Uuid,
) -> Result<Vec<Payment>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PAYMENT_COLUMNS} FROM payments
         WHERE tooth_treatment_id = ?1
         ORDER BY payment_date ASC, created_at ASC, rowid ASC"
    ))?;

    let rows = stmt.query_map(params![treatment_id.to_string()], payment_row)?;
    collect_payments(rows)
}

/// Non-completed payments for a patient within a date range — the
/// invoice screen's source of outstanding items.
pub fn outstanding_payments(
    conn: &Connection,
    patient_id: &Uuid,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<Vec<Payment>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PAYMENT_COLUMNS} FROM payments
         WHERE patient_id = ?1 AND status != 'completed'
           AND payment_date >= ?2 AND payment_date <= ?3
         ORDER BY payment_date ASC, created_at ASC, rowid ASC"
    ))?;

    let rows = stmt.query_map(
        params![
            patient_id.to_string(),
            from.format(DATE_FMT).to_string(),
            to.format(DATE_FMT).to_string(),
        ],
        payment_row,
    )?;
    collect_payments(rows)
}

/// Rewrite the caller-owned fields of a payment (amount, method, date,
/// notes). Derived ledger fields are written separately by the re-walk.
pub(crate) fn update_payment_fields(conn: &Connection, payment: &Payment) -> Result<(), DatabaseError> {
    let affected = conn.execute(
        "UPDATE payments SET amount = ?2, payment_method = ?3, payment_date = ?4, notes = ?5,
         total_amount = ?6, updated_at = ?7
         WHERE id = ?1",
        params![
            payment.id.to_string(),
            payment.amount,
            payment.method.as_str(),
            payment.payment_date.format(DATE_FMT).to_string(),
            payment.notes,
            payment.total_amount,
            Utc::now().naive_utc().format(DATETIME_FMT).to_string(),
        ],
    )?;
    if affected == 0 {
        return Err(DatabaseError::NotFound {
            entity_type: "payment".into(),
            id: payment.id.to_string(),
        });
    }
    Ok(())
}

/// Rewrite one row's derived ledger fields during a re-walk.
pub(crate) fn update_ledger_fields(
    conn: &Connection,
    id: &Uuid,
    total_amount_due: f64,
    amount_paid: f64,
    remaining_balance: f64,
    status: &PaymentStatus,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE payments SET total_amount_due = ?2, amount_paid = ?3, remaining_balance = ?4,
         status = ?5, updated_at = ?6
         WHERE id = ?1",
        params![
            id.to_string(),
            total_amount_due,
            amount_paid,
            remaining_balance,
            status.as_str(),
            Utc::now().naive_utc().format(DATETIME_FMT).to_string(),
        ],
    )?;
    Ok(())
}

pub(crate) fn delete_payment_row(conn: &Connection, id: &Uuid) -> Result<(), DatabaseError> {
    let affected = conn.execute("DELETE FROM payments WHERE id = ?1", params![id.to_string()])?;
    if affected == 0 {
        return Err(DatabaseError::NotFound {
            entity_type: "payment".into(),
            id: id.to_string(),
        });
    }
    Ok(())
}

struct PaymentRow {
    id: String,
    patient_id: String,
    appointment_id: Option<String>,
    tooth_treatment_id: Option<String>,
    amount: f64,
    payment_method: String,
    payment_date: String,
    status: String,
    discount_amount: f64,
    tax_amount: f64,
    total_amount: f64,
    total_amount_due: f64,
    amount_paid: f64,
    remaining_balance: f64,
    notes: Option<String>,
    created_at: String,
    updated_at: String,
}

fn payment_row(row: &rusqlite::Row) -> rusqlite::Result<PaymentRow> {
    Ok(PaymentRow {
        id: row.get(0)?,
        patient_id: row.get(1)?,
        appointment_id: row.get(2)?,
        tooth_treatment_id: row.get(3)?,
        amount: row.get(4)?,
        payment_method: row.get(5)?,
        payment_date: row.get(6)?,
        status: row.get(7)?,
        discount_amount: row.get(8)?,
        tax_amount: row.get(9)?,
        total_amount: row.get(10)?,
        total_amount_due: row.get(11)?,
        amount_paid: row.get(12)?,
        remaining_balance: row.get(13)?,
        notes: row.get(14)?,
        created_at: row.get(15)?,
        updated_at: row.get(16)?,
    })
}

fn payment_from_row(row: PaymentRow) -> Result<Payment, DatabaseError> {
    Ok(Payment {
        id: parse_uuid(&row.id)?,
        patient_id: parse_uuid(&row.patient_id)?,
        link: PaymentLink::from_columns(row.appointment_id, row.tooth_treatment_id)?,
        amount: row.amount,
        method: PaymentMethod::from_str(&row.payment_method)?,
        payment_date: parse_date(&row.payment_date)?,
        status: PaymentStatus::from_str(&row.status)?,
        discount_amount: row.discount_amount,
        tax_amount: row.tax_amount,
        total_amount: row.total_amount,
        total_amount_due: row.total_amount_due,
        amount_paid: row.amount_paid,
        remaining_balance: row.remaining_balance,
        notes: row.notes,
        created_at: parse_datetime(&row.created_at)?,
        updated_at: parse_datetime(&row.updated_at)?,
    })
}

fn collect_payments<I>(rows: I) -> Result<Vec<Payment>, DatabaseError>
where
    I: Iterator<Item = rusqlite::Result<PaymentRow>>,
{
    let mut payments = Vec::new();
    for row in rows {
        payments.push(payment_from_row(row?)?);
    }
    Ok(payments)
}
