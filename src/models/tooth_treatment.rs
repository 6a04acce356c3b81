use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::TreatmentStatus;

/// A per-tooth treatment record. `tooth_number` accepts universal
/// numbering (1–32) and two-digit FDI notation including primary
/// teeth (up to 85); the widened range arrived in schema version 4.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToothTreatment {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub appointment_id: Option<Uuid>,
    pub tooth_number: i32,
    pub treatment_type: String,
    pub cost: f64,
    pub status: TreatmentStatus,
    pub notes: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}
