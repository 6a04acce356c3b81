use rusqlite::{params, Connection};
use uuid::Uuid;

use crate::db::DatabaseError;
use crate::models::*;

use super::{parse_date, parse_datetime, parse_uuid};

pub fn insert_patient(conn: &Connection, patient: &Patient) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO patients (id, first_name, last_name, date_of_birth, phone, email, notes,
         created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            patient.id.to_string(),
            patient.first_name,
            patient.last_name,
            patient.date_of_birth.map(|d| d.to_string()),
            patient.phone,
            patient.email,
            patient.notes,
            patient.created_at.format(super::DATETIME_FMT).to_string(),
            patient.updated_at.format(super::DATETIME_FMT).to_string(),
        ],
    )?;
    Ok(())
}

pub fn get_patient(conn: &Connection, id: &Uuid) -> Result<Option<Patient>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, first_name, last_name, date_of_birth, phone, email, notes,
         created_at, updated_at
         FROM patients WHERE id = ?1",
    )?;

    let result = stmt.query_row(params![id.to_string()], |row| {
        Ok(PatientRow {
            id: row.get::<_, String>(0)?,
            first_name: row.get::<_, String>(1)?,
            last_name: row.get::<_, String>(2)?,
            date_of_birth: row.get::<_, Option<String>>(3)?,
            phone: row.get::<_, Option<String>>(4)?,
            email: row.get::<_, Option<String>>(5)?,
            notes: row.get::<_, Option<String>>(6)?,
            created_at: row.get::<_, String>(7)?,
            updated_at: row.get::<_, String>(8)?,
        })
    });

    match result {
        Ok(row) => Ok(Some(patient_from_row(row)?)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub fn get_all_patients(conn: &Connection) -> Result<Vec<Patient>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, first_name, last_name, date_of_birth, phone, email, notes,
         created_at, updated_at
         FROM patients ORDER BY last_name, first_name",
    )?;

    let rows = stmt.query_map([], |row| {
        Ok(PatientRow {
            id: row.get::<_, String>(0)?,
            first_name: row.get::<_, String>(1)?,
            last_name: row.get::<_, String>(2)?,
            date_of_birth: row.get::<_, Option<String>>(3)?,
            phone: row.get::<_, Option<String>>(4)?,
            email: row.get::<_, Option<String>>(5)?,
            notes: row.get::<_, Option<String>>(6)?,
            created_at: row.get::<_, String>(7)?,
            updated_at: row.get::<_, String>(8)?,
        })
    })?;

    let mut patients = Vec::new();
    for row in rows {
        patients.push(patient_from_row(row?)?);
    }
    Ok(patients)
}

/// Delete a patient and everything referencing them. Appointments,
/// treatments, and payments all carry ON DELETE CASCADE, so one delete
/// suffices; the explicit transaction keeps the row count check and the
/// delete atomic.
pub fn delete_patient_cascade(conn: &Connection, id: &Uuid) -> Result<(), DatabaseError> {
    let tx = conn.unchecked_transaction()?;
    let affected = tx.execute("DELETE FROM patients WHERE id = ?1", params![id.to_string()])?;
    if affected == 0 {
        return Err(DatabaseError::NotFound {
            entity_type: "patient".into(),
            id: id.to_string(),
        });
    }
    tx.commit()?;
    Ok(())
}

struct PatientRow {
    id: String,
    first_name: String,
    last_name: String,
    date_of_birth: Option<String>,
    phone: Option<String>,
    email: Option<String>,
    notes: Option<String>,
    created_at: String,
    updated_at: String,
}

fn patient_from_row(row: PatientRow) -> Result<Patient, DatabaseError> {
    Ok(Patient {
        id: parse_uuid(&row.id)?,
        first_name: row.first_name,
        last_name: row.last_name,
        date_of_birth: row.date_of_birth.as_deref().map(parse_date).transpose()?,
        phone: row.phone,
        email: row.email,
        notes: row.notes,
        created_at: parse_datetime(&row.created_at)?,
        updated_at: parse_datetime(&row.updated_at)?,
    })
}
