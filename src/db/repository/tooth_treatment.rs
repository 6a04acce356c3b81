use chrono::Utc;
use rusqlite::{params, Connection};
use std::str::FromStr;
use uuid::Uuid;

use crate::db::DatabaseError;
use crate::models::*;

use super::{parse_datetime, parse_uuid, DATETIME_FMT};

const TREATMENT_COLUMNS: &str = "id, patient_id, appointment_id, tooth_number, treatment_type, \
     cost, status, notes, created_at, updated_at";

pub fn insert_treatment(conn: &Connection, treatment: &ToothTreatment) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO tooth_treatments (id, patient_id, appointment_id, tooth_number,
         treatment_type, cost, status, notes, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            treatment.id.to_string(),
            treatment.patient_id.to_string(),
            treatment.appointment_id.map(|id| id.to_string()),
            treatment.tooth_number,
            treatment.treatment_type,
            treatment.cost,
            treatment.status.as_str(),
            treatment.notes,
            treatment.created_at.format(DATETIME_FMT).to_string(),
            treatment.updated_at.format(DATETIME_FMT).to_string(),
        ],
    )?;
    Ok(())
}

pub fn get_treatment(conn: &Connection, id: &Uuid) -> Result<Option<ToothTreatment>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {TREATMENT_COLUMNS} FROM tooth_treatments WHERE id = ?1"
    ))?;

    let result = stmt.query_row(params![id.to_string()], treatment_row);
    match result {
        Ok(row) => Ok(Some(treatment_from_row(row)?)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub fn get_treatments_for_patient(
    conn: &Connection,
    patient_id: &Uuid,
) -> Result<Vec<ToothTreatment>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {TREATMENT_COLUMNS} FROM tooth_treatments
         WHERE patient_id = ?1 ORDER BY created_at DESC"
    ))?;

    let rows = stmt.query_map(params![patient_id.to_string()], treatment_row)?;
    let mut treatments = Vec::new();
    for row in rows {
        treatments.push(treatment_from_row(row?)?);
    }
    Ok(treatments)
}

/// Raw cost write, ledger-only. Callers must re-walk linked payments.
pub(crate) fn set_treatment_cost(
    conn: &Connection,
    id: &Uuid,
    cost: f64,
) -> Result<(), DatabaseError> {
    let affected = conn.execute(
        "UPDATE tooth_treatments SET cost = ?2, updated_at = ?3 WHERE id = ?1",
        params![
            id.to_string(),
            cost,
            Utc::now().naive_utc().format(DATETIME_FMT).to_string(),
        ],
    )?;
    if affected == 0 {
        return Err(DatabaseError::NotFound {
            entity_type: "tooth_treatment".into(),
            id: id.to_string(),
        });
    }
    Ok(())
}

struct TreatmentRow {
    id: String,
    patient_id: String,
    appointment_id: Option<String>,
    tooth_number: i32,
    treatment_type: String,
    cost: f64,
    status: String,
    notes: Option<String>,
    created_at: String,
    updated_at: String,
}

fn treatment_row(row: &rusqlite::Row) -> rusqlite::Result<TreatmentRow> {
    Ok(TreatmentRow {
        id: row.get(0)?,
        patient_id: row.get(1)?,
        appointment_id: row.get(2)?,
        tooth_number: row.get(3)?,
        treatment_type: row.get(4)?,
        cost: row.get(5)?,
        status: row.get(6)?,
        notes: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

fn treatment_from_row(row: TreatmentRow) -> Result<ToothTreatment, DatabaseError> {
    Ok(ToothTreatment {
        id: parse_uuid(&row.id)?,
        patient_id: parse_uuid(&row.patient_id)?,
        appointment_id: row.appointment_id.as_deref().map(parse_uuid).transpose()?,
        tooth_number: row.tooth_number,
        treatment_type: row.treatment_type,
        cost: row.cost,
        status: TreatmentStatus::from_str(&row.status)?,
        notes: row.notes,
        created_at: parse_datetime(&row.created_at)?,
        updated_at: parse_datetime(&row.updated_at)?,
    })
}
