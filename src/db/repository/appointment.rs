use chrono::Utc;
use rusqlite::{params, Connection};
use std::str::FromStr;
use uuid::Uuid;

use crate::db::DatabaseError;
use crate::models::*;

use super::{parse_datetime, parse_uuid, DATETIME_FMT, DATE_FMT};

const APPOINTMENT_COLUMNS: &str =
    "id, patient_id, title, start_time, end_time, cost, status, notes, created_at, updated_at";

pub fn insert_appointment(conn: &Connection, appt: &Appointment) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO appointments (id, patient_id, title, start_time, end_time, cost, status,
         notes, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            appt.id.to_string(),
            appt.patient_id.to_string(),
            appt.title,
            appt.start_time.format(DATETIME_FMT).to_string(),
            appt.end_time.format(DATETIME_FMT).to_string(),
            appt.cost,
            appt.status.as_str(),
            appt.notes,
            appt.created_at.format(DATETIME_FMT).to_string(),
            appt.updated_at.format(DATETIME_FMT).to_string(),
        ],
    )?;
    Ok(())
}

pub fn get_appointment(conn: &Connection, id: &Uuid) -> Result<Option<Appointment>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {APPOINTMENT_COLUMNS} FROM appointments WHERE id = ?1"
    ))?;

    let result = stmt.query_row(params![id.to_string()], appointment_row);
    match result {
        Ok(row) => Ok(Some(appointment_from_row(row)?)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub fn get_appointments_for_patient(
    conn: &Connection,
    patient_id: &Uuid,
) -> Result<Vec<Appointment>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {APPOINTMENT_COLUMNS} FROM appointments
         WHERE patient_id = ?1 ORDER BY start_time DESC"
    ))?;

    let rows = stmt.query_map(params![patient_id.to_string()], appointment_row)?;
    let mut appointments = Vec::new();
    for row in rows {
        appointments.push(appointment_from_row(row?)?);
    }
    Ok(appointments)
}

pub fn list_appointments(
    conn: &Connection,
    filter: &AppointmentFilter,
) -> Result<Vec<Appointment>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {APPOINTMENT_COLUMNS} FROM appointments
         WHERE (?1 IS NULL OR patient_id = ?1)
           AND (?2 IS NULL OR date(start_time) >= ?2)
           AND (?3 IS NULL OR date(start_time) <= ?3)
         ORDER BY start_time DESC"
    ))?;

    let rows = stmt.query_map(
        params![
            filter.patient_id.map(|id| id.to_string()),
            filter.date_from.map(|d| d.format(DATE_FMT).to_string()),
            filter.date_to.map(|d| d.format(DATE_FMT).to_string()),
        ],
        appointment_row,
    )?;

    let mut appointments = Vec::new();
    for row in rows {
        appointments.push(appointment_from_row(row?)?);
    }
    Ok(appointments)
}

/// Update everything except `cost`. Cost changes re-derive the linked
/// payment ledger and must go through `ledger::update_appointment_cost`.
pub fn update_appointment_details(
    conn: &Connection,
    appt: &Appointment,
) -> Result<(), DatabaseError> {
    let affected = conn.execute(
        "UPDATE appointments SET title = ?2, start_time = ?3, end_time = ?4, status = ?5,
         notes = ?6, updated_at = ?7
         WHERE id = ?1",
        params![
            appt.id.to_string(),
            appt.title,
            appt.start_time.format(DATETIME_FMT).to_string(),
            appt.end_time.format(DATETIME_FMT).to_string(),
            appt.status.as_str(),
            appt.notes,
            Utc::now().naive_utc().format(DATETIME_FMT).to_string(),
        ],
    )?;
    if affected == 0 {
        return Err(DatabaseError::NotFound {
            entity_type: "appointment".into(),
            id: appt.id.to_string(),
        });
    }
    Ok(())
}

/// Raw cost write, ledger-only. Callers must re-walk linked payments.
pub(crate) fn set_appointment_cost(
    conn: &Connection,
    id: &Uuid,
    cost: f64,
) -> Result<(), DatabaseError> {
    let affected = conn.execute(
        "UPDATE appointments SET cost = ?2, updated_at = ?3 WHERE id = ?1",
        params![
            id.to_string(),
            cost,
            Utc::now().naive_utc().format(DATETIME_FMT).to_string(),
        ],
    )?;
    if affected == 0 {
        return Err(DatabaseError::NotFound {
            entity_type: "appointment".into(),
            id: id.to_string(),
        });
    }
    Ok(())
}

struct AppointmentRow {
    id: String,
    patient_id: String,
    title: String,
    start_time: String,
    end_time: String,
    cost: f64,
    status: String,
    notes: Option<String>,
    created_at: String,
    updated_at: String,
}

fn appointment_row(row: &rusqlite::Row) -> rusqlite::Result<AppointmentRow> {
    Ok(AppointmentRow {
        id: row.get(0)?,
        patient_id: row.get(1)?,
        title: row.get(2)?,
        start_time: row.get(3)?,
        end_time: row.get(4)?,
        cost: row.get(5)?,
        status: row.get(6)?,
        notes: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

fn appointment_from_row(row: AppointmentRow) -> Result<Appointment, DatabaseError> {
    Ok(Appointment {
        id: parse_uuid(&row.id)?,
        patient_id: parse_uuid(&row.patient_id)?,
        title: row.title,
        start_time: parse_datetime(&row.start_time)?,
        end_time: parse_datetime(&row.end_time)?,
        cost: row.cost,
        status: AppointmentStatus::from_str(&row.status)?,
        notes: row.notes,
        created_at: parse_datetime(&row.created_at)?,
        updated_at: parse_datetime(&row.updated_at)?,
    })
}
