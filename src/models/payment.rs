use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::DatabaseError;

use super::enums::{PaymentMethod, PaymentStatus};

/// What a payment settles against. Exactly one reconciliation rule
/// applies per variant: appointment- and treatment-linked payments are
/// re-walked against the linked record's cost together with their
/// siblings; general payments carry a self-contained due amount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentLink {
    General,
    Appointment(Uuid),
    Treatment(Uuid),
}

impl PaymentLink {
    pub fn appointment_id(&self) -> Option<Uuid> {
        match self {
            Self::Appointment(id) => Some(*id),
            _ => None,
        }
    }

    pub fn treatment_id(&self) -> Option<Uuid> {
        match self {
            Self::Treatment(id) => Some(*id),
            _ => None,
        }
    }

    /// Reconstruct the link from the two nullable FK columns.
    pub fn from_columns(
        appointment_id: Option<String>,
        treatment_id: Option<String>,
    ) -> Result<Self, DatabaseError> {
        match (appointment_id, treatment_id) {
            (None, None) => Ok(Self::General),
            (Some(a), None) => Ok(Self::Appointment(parse_uuid(&a)?)),
            (None, Some(t)) => Ok(Self::Treatment(parse_uuid(&t)?)),
            (Some(a), Some(_)) => Err(DatabaseError::ConstraintViolation(format!(
                "payment linked to both appointment {a} and a treatment"
            ))),
        }
    }
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::ConstraintViolation(e.to_string()))
}

/// A payment transaction. `amount` is the increment paid in this
/// transaction; `total_amount_due`, `amount_paid`, `remaining_balance`
/// and `status` are derived by the ledger engine and rewritten on every
/// reconciliation — consumers read them, never write them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub link: PaymentLink,
    pub amount: f64,
    pub method: PaymentMethod,
    pub payment_date: NaiveDate,
    pub status: PaymentStatus,
    pub discount_amount: f64,
    pub tax_amount: f64,
    pub total_amount: f64,
    pub total_amount_due: f64,
    pub amount_paid: f64,
    pub remaining_balance: f64,
    pub notes: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Input for `ledger::record_payment`.
///
/// `total_amount_due` overrides the linked record's cost for this
/// reconciliation (used when a quote differs from the face cost); for
/// general payments it defaults to the payment amount itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPayment {
    pub patient_id: Uuid,
    pub link: PaymentLink,
    pub amount: f64,
    pub method: PaymentMethod,
    pub payment_date: NaiveDate,
    pub total_amount_due: Option<f64>,
    pub notes: Option<String>,
}

/// Field-wise update for `ledger::update_payment`. `None` leaves the
/// stored value untouched. Re-linking is not supported; delete and
/// re-record to move a payment between appointments.
///
/// `notes` is doubly optional: `Some(None)` clears the stored note.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaymentUpdate {
    pub amount: Option<f64>,
    pub method: Option<PaymentMethod>,
    pub payment_date: Option<NaiveDate>,
    pub total_amount_due: Option<f64>,
    pub notes: Option<Option<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_from_columns() {
        let id = Uuid::new_v4();
        assert_eq!(
            PaymentLink::from_columns(None, None).unwrap(),
            PaymentLink::General
        );
        assert_eq!(
            PaymentLink::from_columns(Some(id.to_string()), None).unwrap(),
            PaymentLink::Appointment(id)
        );
        assert_eq!(
            PaymentLink::from_columns(None, Some(id.to_string())).unwrap(),
            PaymentLink::Treatment(id)
        );
    }

    #[test]
    fn link_to_both_rejected() {
        let a = Uuid::new_v4().to_string();
        let t = Uuid::new_v4().to_string();
        assert!(PaymentLink::from_columns(Some(a), Some(t)).is_err());
    }
}
