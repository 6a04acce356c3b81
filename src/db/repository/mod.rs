//! Repository layer — entity-scoped database operations.
//!
//! Readers (reports, invoices, dashboards) get public query functions.
//! Writes to payments' derived ledger fields are crate-private: they
//! flow through `crate::ledger` only.

mod appointment;
mod patient;
mod payment;
mod tooth_treatment;

pub use appointment::*;
pub use patient::*;
pub use payment::*;
pub use tooth_treatment::*;

use chrono::{NaiveDate, NaiveDateTime};
use uuid::Uuid;

use super::DatabaseError;

pub(crate) const DATETIME_FMT: &str = "%Y-%m-%d %H:%M:%S";
pub(crate) const DATE_FMT: &str = "%Y-%m-%d";

pub(crate) fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::ConstraintViolation(e.to_string()))
}

pub(crate) fn parse_datetime(s: &str) -> Result<NaiveDateTime, DatabaseError> {
    NaiveDateTime::parse_from_str(s, DATETIME_FMT)
        .map_err(|e| DatabaseError::ConstraintViolation(format!("bad datetime '{s}': {e}")))
}

pub(crate) fn parse_date(s: &str) -> Result<NaiveDate, DatabaseError> {
    NaiveDate::parse_from_str(s, DATE_FMT)
        .map_err(|e| DatabaseError::ConstraintViolation(format!("bad date '{s}': {e}")))
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, NaiveDateTime};
    use rusqlite::Connection;
    use uuid::Uuid;

    use super::*;
    use crate::db::sqlite::open_memory_database;
    use crate::models::*;

    fn test_db() -> Connection {
        open_memory_database().unwrap()
    }

    fn now() -> NaiveDateTime {
        NaiveDateTime::parse_from_str("2024-03-01 10:00:00", DATETIME_FMT).unwrap()
    }

    fn make_patient(conn: &Connection) -> Uuid {
        let id = Uuid::new_v4();
        insert_patient(
            conn,
            &Patient {
                id,
                first_name: "Maria".into(),
                last_name: "Kovacs".into(),
                date_of_birth: Some(NaiveDate::from_ymd_opt(1985, 6, 12).unwrap()),
                phone: Some("555-0101".into()),
                email: None,
                notes: None,
                created_at: now(),
                updated_at: now(),
            },
        )
        .unwrap();
        id
    }

    fn make_appointment(conn: &Connection, patient_id: Uuid, cost: f64) -> Uuid {
        let id = Uuid::new_v4();
        insert_appointment(
            conn,
            &Appointment {
                id,
                patient_id,
                title: "Cleaning".into(),
                start_time: now(),
                end_time: now() + chrono::Duration::hours(1),
                cost,
                status: AppointmentStatus::Scheduled,
                notes: None,
                created_at: now(),
                updated_at: now(),
            },
        )
        .unwrap();
        id
    }

    fn make_treatment(conn: &Connection, patient_id: Uuid, tooth: i32, cost: f64) -> Uuid {
        let id = Uuid::new_v4();
        insert_treatment(
            conn,
            &ToothTreatment {
                id,
                patient_id,
                appointment_id: None,
                tooth_number: tooth,
                treatment_type: "filling".into(),
                cost,
                status: TreatmentStatus::Planned,
                notes: None,
                created_at: now(),
                updated_at: now(),
            },
        )
        .unwrap();
        id
    }

    fn make_payment(conn: &Connection, patient_id: Uuid, link: PaymentLink, amount: f64) -> Uuid {
        let id = Uuid::new_v4();
        insert_payment_row(
            conn,
            &Payment {
                id,
                patient_id,
                link,
                amount,
                method: PaymentMethod::Cash,
                payment_date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
                status: PaymentStatus::Pending,
                discount_amount: 0.0,
                tax_amount: 0.0,
                total_amount: amount,
                total_amount_due: 0.0,
                amount_paid: 0.0,
                remaining_balance: 0.0,
                notes: None,
                created_at: now(),
                updated_at: now(),
            },
        )
        .unwrap();
        id
    }

    #[test]
    fn patient_insert_and_retrieve() {
        let conn = test_db();
        let id = make_patient(&conn);
        let patient = get_patient(&conn, &id).unwrap().unwrap();
        assert_eq!(patient.first_name, "Maria");
        assert_eq!(
            patient.date_of_birth,
            Some(NaiveDate::from_ymd_opt(1985, 6, 12).unwrap())
        );
    }

    #[test]
    fn missing_patient_is_none() {
        let conn = test_db();
        assert!(get_patient(&conn, &Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn appointment_insert_and_list() {
        let conn = test_db();
        let pid = make_patient(&conn);
        make_appointment(&conn, pid, 200.0);
        make_appointment(&conn, pid, 80.0);

        let appts = get_appointments_for_patient(&conn, &pid).unwrap();
        assert_eq!(appts.len(), 2);
    }

    #[test]
    fn appointment_requires_existing_patient() {
        let conn = test_db();
        let result = insert_appointment(
            &conn,
            &Appointment {
                id: Uuid::new_v4(),
                patient_id: Uuid::new_v4(), // nonexistent
                title: "Orphan".into(),
                start_time: now(),
                end_time: now(),
                cost: 0.0,
                status: AppointmentStatus::Scheduled,
                notes: None,
                created_at: now(),
                updated_at: now(),
            },
        );
        assert!(result.is_err());
    }

    #[test]
    fn treatment_insert_and_retrieve() {
        let conn = test_db();
        let pid = make_patient(&conn);
        let tid = make_treatment(&conn, pid, 85, 120.0);
        let treatment = get_treatment(&conn, &tid).unwrap().unwrap();
        assert_eq!(treatment.tooth_number, 85);
        assert_eq!(treatment.status, TreatmentStatus::Planned);
    }

    #[test]
    fn payment_round_trip_with_links() {
        let conn = test_db();
        let pid = make_patient(&conn);
        let aid = make_appointment(&conn, pid, 200.0);
        let tid = make_treatment(&conn, pid, 11, 80.0);

        let general = make_payment(&conn, pid, PaymentLink::General, 25.0);
        let linked = make_payment(&conn, pid, PaymentLink::Appointment(aid), 100.0);
        let treatment = make_payment(&conn, pid, PaymentLink::Treatment(tid), 40.0);

        assert_eq!(
            get_payment(&conn, &general).unwrap().unwrap().link,
            PaymentLink::General
        );
        assert_eq!(
            get_payment(&conn, &linked).unwrap().unwrap().link,
            PaymentLink::Appointment(aid)
        );
        assert_eq!(
            get_payment(&conn, &treatment).unwrap().unwrap().link,
            PaymentLink::Treatment(tid)
        );
    }

    #[test]
    fn payments_for_appointment_ordered_by_date_then_insertion() {
        let conn = test_db();
        let pid = make_patient(&conn);
        let aid = make_appointment(&conn, pid, 300.0);

        // Inserted out of chronological order
        let late = Uuid::new_v4();
        insert_payment_row(
            &conn,
            &Payment {
                id: late,
                patient_id: pid,
                link: PaymentLink::Appointment(aid),
                amount: 50.0,
                method: PaymentMethod::Cash,
                payment_date: NaiveDate::from_ymd_opt(2024, 3, 10).unwrap(),
                status: PaymentStatus::Pending,
                discount_amount: 0.0,
                tax_amount: 0.0,
                total_amount: 50.0,
                total_amount_due: 0.0,
                amount_paid: 0.0,
                remaining_balance: 0.0,
                notes: None,
                created_at: now(),
                updated_at: now(),
            },
        )
        .unwrap();
        let early = Uuid::new_v4();
        insert_payment_row(
            &conn,
            &Payment {
                id: early,
                patient_id: pid,
                link: PaymentLink::Appointment(aid),
                amount: 100.0,
                method: PaymentMethod::Cash,
                payment_date: NaiveDate::from_ymd_opt(2024, 3, 2).unwrap(),
                status: PaymentStatus::Pending,
                discount_amount: 0.0,
                tax_amount: 0.0,
                total_amount: 100.0,
                total_amount_due: 0.0,
                amount_paid: 0.0,
                remaining_balance: 0.0,
                notes: None,
                created_at: now(),
                updated_at: now(),
            },
        )
        .unwrap();

        let rows = payments_for_appointment(&conn, &aid).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, early);
        assert_eq!(rows[1].id, late);
    }

    #[test]
    fn list_payments_filters_by_status_and_range() {
        let conn = test_db();
        let pid = make_patient(&conn);
        make_payment(&conn, pid, PaymentLink::General, 20.0);
        let other = make_patient(&conn);
        make_payment(&conn, other, PaymentLink::General, 30.0);

        let mine = list_payments(
            &conn,
            &PaymentFilter {
                patient_id: Some(pid),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].patient_id, pid);

        let completed = list_payments(
            &conn,
            &PaymentFilter {
                status: Some(PaymentStatus::Completed),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(completed.is_empty());

        let out_of_range = list_payments(
            &conn,
            &PaymentFilter {
                date_from: Some(NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(out_of_range.is_empty());
    }

    #[test]
    fn list_appointments_filters_by_patient_and_range() {
        let conn = test_db();
        let pid = make_patient(&conn);
        let aid = make_appointment(&conn, pid, 100.0);
        let other = make_patient(&conn);
        make_appointment(&conn, other, 80.0);

        let mine = list_appointments(
            &conn,
            &AppointmentFilter {
                patient_id: Some(pid),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].id, aid);

        let in_range = list_appointments(
            &conn,
            &AppointmentFilter {
                date_from: Some(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()),
                date_to: Some(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(in_range.len(), 2);

        let out_of_range = list_appointments(
            &conn,
            &AppointmentFilter {
                date_to: Some(NaiveDate::from_ymd_opt(2024, 2, 1).unwrap()),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(out_of_range.is_empty());
    }

    #[test]
    fn patient_delete_cascades_to_children() {
        let conn = test_db();
        let pid = make_patient(&conn);
        let aid = make_appointment(&conn, pid, 150.0);
        let tid = make_treatment(&conn, pid, 21, 60.0);
        make_payment(&conn, pid, PaymentLink::Appointment(aid), 50.0);
        make_payment(&conn, pid, PaymentLink::Treatment(tid), 10.0);

        delete_patient_cascade(&conn, &pid).unwrap();

        assert!(get_patient(&conn, &pid).unwrap().is_none());
        assert!(get_appointment(&conn, &aid).unwrap().is_none());
        assert!(get_treatment(&conn, &tid).unwrap().is_none());
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM payments", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn delete_missing_patient_is_not_found() {
        let conn = test_db();
        let err = delete_patient_cascade(&conn, &Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }
}
