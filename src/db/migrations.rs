//! Versioned schema migrations with a success-tracking ledger.
//!
//! Each migration is a Rust function over a transaction, guarded by
//! live-schema introspection (`has_table` / `has_column`) so it stays
//! idempotent against databases upgraded ad hoc before versioning
//! existed. A post-pass invariant validator re-checks the live schema
//! of critical tables and re-applies a migration whose shape is missing
//! even when the ledger claims it ran — ledger and schema can diverge
//! on databases touched by pre-versioning builds.

use std::collections::HashSet;

use chrono::Utc;
use rusqlite::{params, Connection, Transaction};
use tracing::{info, warn};

use super::DatabaseError;

/// Whether a failed migration may be skipped until the next startup.
///
/// `Required` failures roll back, are recorded with `success = 0`, and
/// propagate — startup must not continue on a schema later versions
/// build on. `Optional` failures roll back, are recorded and logged,
/// and the pass continues; they retry on the next run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Criticality {
    Required,
    Optional,
}

pub struct Migration {
    pub version: i64,
    pub description: &'static str,
    pub criticality: Criticality,
    apply: fn(&Transaction) -> Result<(), DatabaseError>,
}

/// What a migration pass did, for startup logging and tests.
#[derive(Debug, Default)]
pub struct MigrationReport {
    pub applied: Vec<i64>,
    pub failed_optional: Vec<i64>,
    pub invariant_fixes: Vec<i64>,
}

const TOOTH_TREATMENTS_DDL_LEGACY: &str = "
    CREATE TABLE tooth_treatments (
        id TEXT PRIMARY KEY,
        patient_id TEXT NOT NULL REFERENCES patients(id) ON DELETE CASCADE,
        appointment_id TEXT REFERENCES appointments(id) ON DELETE SET NULL,
        tooth_number INTEGER NOT NULL CHECK (tooth_number BETWEEN 1 AND 32),
        treatment_type TEXT NOT NULL,
        cost REAL NOT NULL DEFAULT 0 CHECK (cost >= 0),
        status TEXT NOT NULL DEFAULT 'planned'
            CHECK (status IN ('planned', 'in_progress', 'completed')),
        notes TEXT,
        created_at TEXT NOT NULL DEFAULT (datetime('now')),
        updated_at TEXT NOT NULL DEFAULT (datetime('now'))
    );
    CREATE INDEX idx_tooth_treatments_patient ON tooth_treatments(patient_id);
";

// Identical to the legacy table except for the tooth_number CHECK:
// universal numbering (1-32) plus two-digit FDI notation, primary
// teeth included (up to 85).
const TOOTH_TREATMENTS_DDL: &str = "
    CREATE TABLE tooth_treatments (
        id TEXT PRIMARY KEY,
        patient_id TEXT NOT NULL REFERENCES patients(id) ON DELETE CASCADE,
        appointment_id TEXT REFERENCES appointments(id) ON DELETE SET NULL,
        tooth_number INTEGER NOT NULL CHECK (tooth_number BETWEEN 1 AND 85),
        treatment_type TEXT NOT NULL,
        cost REAL NOT NULL DEFAULT 0 CHECK (cost >= 0),
        status TEXT NOT NULL DEFAULT 'planned'
            CHECK (status IN ('planned', 'in_progress', 'completed')),
        notes TEXT,
        created_at TEXT NOT NULL DEFAULT (datetime('now')),
        updated_at TEXT NOT NULL DEFAULT (datetime('now'))
    );
    CREATE INDEX idx_tooth_treatments_patient ON tooth_treatments(patient_id);
";

const LEGACY_TOOTH_CHECK: &str = "BETWEEN 1 AND 32";

fn known_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "baseline clinic schema",
            criticality: Criticality::Required,
            apply: baseline_schema,
        },
        Migration {
            version: 2,
            description: "payment running-balance columns",
            criticality: Criticality::Required,
            apply: payment_ledger_columns,
        },
        Migration {
            version: 3,
            description: "tooth treatments and treatment-linked payments",
            criticality: Criticality::Required,
            apply: tooth_treatments_schema,
        },
        Migration {
            version: 4,
            description: "widen tooth_number CHECK for FDI notation",
            criticality: Criticality::Optional,
            apply: widen_tooth_numbers,
        },
        Migration {
            version: 5,
            description: "per-receipt discount/tax/total columns",
            criticality: Criticality::Optional,
            apply: receipt_total_columns,
        },
    ]
}

/// Bring the on-disk schema up to the latest known version.
///
/// Runs once per process start, before any ledger operation. Each
/// migration executes in its own transaction and every attempt is
/// recorded in `schema_migrations`; only `success = 1` counts as
/// applied, so failures retry on the next run.
pub fn apply_pending_migrations(conn: &Connection) -> Result<MigrationReport, DatabaseError> {
    ensure_migration_ledger(conn)?;
    let done = successful_versions(conn)?;
    let mut report = MigrationReport::default();

    // Table rebuilds drop and recreate tables that payments reference;
    // suspend enforcement for the pass and verify before re-enabling.
    conn.execute_batch("PRAGMA foreign_keys=OFF;")?;
    let outcome = run_pass(conn, &known_migrations(), &done, &mut report);

    let violations = foreign_key_violations(conn)?;
    if violations > 0 {
        warn!(violations, "foreign_key_check reported violations after migration pass");
    }
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    outcome?;

    if !report.applied.is_empty() {
        info!(applied = ?report.applied, "schema migrations applied");
    }
    Ok(report)
}

fn run_pass(
    conn: &Connection,
    migrations: &[Migration],
    done: &HashSet<i64>,
    report: &mut MigrationReport,
) -> Result<(), DatabaseError> {
    for migration in migrations {
        if done.contains(&migration.version) {
            continue;
        }
        match apply_one(conn, migration) {
            Ok(()) => {
                info!(version = migration.version, migration.description, "migration applied");
                report.applied.push(migration.version);
            }
            Err(e) => match migration.criticality {
                Criticality::Required => return Err(e),
                Criticality::Optional => {
                    warn!(
                        version = migration.version,
                        error = %e,
                        "optional migration failed; will retry on next startup"
                    );
                    report.failed_optional.push(migration.version);
                }
            },
        }
    }
    enforce_schema_invariants(conn, migrations, report)
}

/// Run one migration in its own transaction and record the attempt.
/// The record is written outside the transaction so a rollback cannot
/// erase the failure row.
fn apply_one(conn: &Connection, migration: &Migration) -> Result<(), DatabaseError> {
    let tx = conn.unchecked_transaction()?;
    let outcome = (migration.apply)(&tx);
    match &outcome {
        Ok(()) => tx.commit()?,
        Err(_) => tx.rollback()?,
    }
    record_attempt(conn, migration, outcome.is_ok())?;
    outcome.map_err(|e| DatabaseError::MigrationFailed {
        version: migration.version,
        reason: e.to_string(),
    })
}

/// Re-inspect the live schema of critical tables after the numbered
/// pass and force-reapply a migration whose shape is absent, even when
/// the ledger claims it ran. The ledger itself is left untouched.
fn enforce_schema_invariants(
    conn: &Connection,
    migrations: &[Migration],
    report: &mut MigrationReport,
) -> Result<(), DatabaseError> {
    type Check = fn(&Connection) -> Result<bool, DatabaseError>;
    let checks: [(i64, Check); 4] = [
        (2, |c| {
            Ok(has_column(c, "payments", "total_amount_due")?
                && has_column(c, "payments", "amount_paid")?
                && has_column(c, "payments", "remaining_balance")?)
        }),
        // Checked before 4: recreating a dropped tooth_treatments table
        // leaves the legacy CHECK, which the version 4 re-apply widens.
        (3, |c| {
            Ok(has_table(c, "tooth_treatments")?
                && has_column(c, "payments", "tooth_treatment_id")?)
        }),
        (4, |c| {
            Ok(match table_ddl(c, "tooth_treatments")? {
                Some(ddl) => !ddl.contains(LEGACY_TOOTH_CHECK),
                None => false,
            })
        }),
        (5, |c| {
            Ok(has_column(c, "payments", "discount_amount")?
                && has_column(c, "payments", "tax_amount")?
                && has_column(c, "payments", "total_amount")?)
        }),
    ];

    for (version, satisfied) in checks {
        if satisfied(conn)? {
            continue;
        }
        let Some(migration) = migrations.iter().find(|m| m.version == version) else {
            continue;
        };
        warn!(version, "live schema does not match migration ledger; re-applying");
        let tx = conn.unchecked_transaction()?;
        (migration.apply)(&tx).map_err(|e| DatabaseError::MigrationFailed {
            version,
            reason: format!("invariant re-apply: {e}"),
        })?;
        tx.commit()?;
        // A re-apply whose guards all skipped leaves the shape absent;
        // counting it as a fix would hide the divergence forever.
        if !satisfied(conn)? {
            return Err(DatabaseError::MigrationFailed {
                version,
                reason: "schema shape still absent after invariant re-apply".into(),
            });
        }
        report.invariant_fixes.push(version);
    }
    Ok(())
}

// ─── Migration ledger ───────────────────────────────────────────────────────

fn ensure_migration_ledger(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL,
            success INTEGER NOT NULL
        );",
    )?;
    Ok(())
}

fn successful_versions(conn: &Connection) -> Result<HashSet<i64>, DatabaseError> {
    let mut stmt = conn.prepare("SELECT version FROM schema_migrations WHERE success = 1")?;
    let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
    let mut versions = HashSet::new();
    for row in rows {
        versions.insert(row?);
    }
    Ok(versions)
}

fn record_attempt(
    conn: &Connection,
    migration: &Migration,
    success: bool,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO schema_migrations (version, description, applied_at, success)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(version) DO UPDATE SET
            description = excluded.description,
            applied_at = excluded.applied_at,
            success = excluded.success",
        params![
            migration.version,
            migration.description,
            Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            success as i32,
        ],
    )?;
    Ok(())
}

/// Highest successfully applied version (0 on a fresh database).
pub fn schema_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let version: Option<i64> = conn.query_row(
        "SELECT MAX(version) FROM schema_migrations WHERE success = 1",
        [],
        |row| row.get(0),
    )?;
    Ok(version.unwrap_or(0))
}

// ─── Schema introspection ───────────────────────────────────────────────────

pub fn has_table(conn: &Connection, table: &str) -> Result<bool, DatabaseError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name = ?1",
        params![table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool, DatabaseError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

fn table_ddl(conn: &Connection, table: &str) -> Result<Option<String>, DatabaseError> {
    let result = conn.query_row(
        "SELECT sql FROM sqlite_master WHERE type='table' AND name = ?1",
        params![table],
        |row| row.get::<_, String>(0),
    );
    match result {
        Ok(ddl) => Ok(Some(ddl)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn foreign_key_violations(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut stmt = conn.prepare("PRAGMA foreign_key_check")?;
    let mut rows = stmt.query([])?;
    let mut count = 0;
    while rows.next()?.is_some() {
        count += 1;
    }
    Ok(count)
}

// ─── Migration bodies (v1..v5) ──────────────────────────────────────────────

fn baseline_schema(tx: &Transaction) -> Result<(), DatabaseError> {
    tx.execute_batch(include_str!("../../resources/migrations/0001_initial.sql"))?;
    Ok(())
}

fn payment_ledger_columns(tx: &Transaction) -> Result<(), DatabaseError> {
    let columns = [
        (
            "total_amount_due",
            "ALTER TABLE payments ADD COLUMN total_amount_due REAL NOT NULL DEFAULT 0",
        ),
        (
            "amount_paid",
            "ALTER TABLE payments ADD COLUMN amount_paid REAL NOT NULL DEFAULT 0",
        ),
        (
            "remaining_balance",
            "ALTER TABLE payments ADD COLUMN remaining_balance REAL NOT NULL DEFAULT 0",
        ),
    ];
    for (column, ddl) in columns {
        if !has_column(tx, "payments", column)? {
            tx.execute(ddl, [])?;
        }
    }

    // Settled-receipt backfill: rows predating the ledger columns carry
    // the column defaults (due = paid = 0). Treat them as settled
    // standalone receipts; linked rows are re-derived the next time any
    // ledger operation touches their appointment or treatment.
    tx.execute(
        "UPDATE payments
         SET total_amount_due = amount, amount_paid = amount,
             remaining_balance = 0, status = 'completed'
         WHERE total_amount_due = 0 AND amount_paid = 0",
        [],
    )?;
    Ok(())
}

fn tooth_treatments_schema(tx: &Transaction) -> Result<(), DatabaseError> {
    if !has_table(tx, "tooth_treatments")? {
        tx.execute_batch(TOOTH_TREATMENTS_DDL_LEGACY)?;
    }
    if !has_column(tx, "payments", "tooth_treatment_id")? {
        tx.execute(
            "ALTER TABLE payments ADD COLUMN tooth_treatment_id TEXT
             REFERENCES tooth_treatments(id) ON DELETE CASCADE",
            [],
        )?;
    }
    Ok(())
}

/// SQLite cannot ALTER a CHECK constraint: copy rows to a shadow table,
/// drop the original, recreate with the widened constraint, re-insert
/// rows that satisfy the required columns, drop the shadow.
fn widen_tooth_numbers(tx: &Transaction) -> Result<(), DatabaseError> {
    match table_ddl(tx, "tooth_treatments")? {
        Some(ddl) if ddl.contains(LEGACY_TOOTH_CHECK) => {}
        _ => return Ok(()),
    }

    tx.execute_batch(
        "CREATE TABLE tooth_treatments_backup AS SELECT * FROM tooth_treatments;
         DROP TABLE tooth_treatments;",
    )?;
    tx.execute_batch(TOOTH_TREATMENTS_DDL)?;
    tx.execute(
        "INSERT INTO tooth_treatments
            (id, patient_id, appointment_id, tooth_number, treatment_type,
             cost, status, notes, created_at, updated_at)
         SELECT id, patient_id, appointment_id, tooth_number, treatment_type,
                cost, status, notes, created_at, updated_at
         FROM tooth_treatments_backup
         WHERE id IS NOT NULL AND patient_id IS NOT NULL
           AND treatment_type IS NOT NULL
           AND tooth_number BETWEEN 1 AND 85",
        [],
    )?;
    tx.execute("DROP TABLE tooth_treatments_backup", [])?;
    Ok(())
}

fn receipt_total_columns(tx: &Transaction) -> Result<(), DatabaseError> {
    let columns = [
        (
            "discount_amount",
            "ALTER TABLE payments ADD COLUMN discount_amount REAL NOT NULL DEFAULT 0",
        ),
        (
            "tax_amount",
            "ALTER TABLE payments ADD COLUMN tax_amount REAL NOT NULL DEFAULT 0",
        ),
        (
            "total_amount",
            "ALTER TABLE payments ADD COLUMN total_amount REAL NOT NULL DEFAULT 0",
        ),
    ];
    for (column, ddl) in columns {
        if !has_column(tx, "payments", column)? {
            tx.execute(ddl, [])?;
        }
    }
    tx.execute(
        "UPDATE payments SET total_amount = amount WHERE total_amount = 0",
        [],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys=ON;").unwrap();
        conn
    }

    fn ledger_rows(conn: &Connection) -> Vec<(i64, i64)> {
        let mut stmt = conn
            .prepare("SELECT version, success FROM schema_migrations ORDER BY version")
            .unwrap();
        stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
    }

    #[test]
    fn fresh_database_applies_all_versions() {
        let conn = raw_db();
        let report = apply_pending_migrations(&conn).unwrap();
        assert_eq!(report.applied, vec![1, 2, 3, 4, 5]);
        assert!(report.failed_optional.is_empty());
        assert!(report.invariant_fixes.is_empty());
        assert_eq!(schema_version(&conn).unwrap(), 5);
        assert!(has_table(&conn, "tooth_treatments").unwrap());
        assert!(has_column(&conn, "payments", "remaining_balance").unwrap());
    }

    #[test]
    fn second_run_is_a_no_op() {
        let conn = raw_db();
        apply_pending_migrations(&conn).unwrap();
        let before = ledger_rows(&conn);

        let report = apply_pending_migrations(&conn).unwrap();
        assert!(report.applied.is_empty());
        assert!(report.invariant_fixes.is_empty());
        assert_eq!(ledger_rows(&conn), before);
    }

    #[test]
    fn fdi_tooth_numbers_accepted_after_upgrade() {
        let conn = raw_db();
        apply_pending_migrations(&conn).unwrap();
        conn.execute(
            "INSERT INTO patients (id, first_name, last_name) VALUES ('p1', 'A', 'B')",
            [],
        )
        .unwrap();
        // FDI primary tooth 85 would violate the legacy 1-32 CHECK
        conn.execute(
            "INSERT INTO tooth_treatments (id, patient_id, tooth_number, treatment_type)
             VALUES ('t1', 'p1', 85, 'extraction')",
            [],
        )
        .unwrap();
        let out_of_range = conn.execute(
            "INSERT INTO tooth_treatments (id, patient_id, tooth_number, treatment_type)
             VALUES ('t2', 'p1', 86, 'extraction')",
            [],
        );
        assert!(out_of_range.is_err());
    }

    /// A database shipped before versioning existed: baseline tables
    /// present with live rows, no schema_migrations table. The runner
    /// must adopt it without touching existing data beyond the
    /// settled-receipt backfill.
    #[test]
    fn legacy_database_converges() {
        let conn = raw_db();
        conn.execute_batch(include_str!("../../resources/migrations/0001_initial.sql"))
            .unwrap();
        conn.execute(
            "INSERT INTO patients (id, first_name, last_name) VALUES ('p1', 'A', 'B')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO payments (id, patient_id, amount, payment_date, status)
             VALUES ('pay1', 'p1', 50.0, '2024-03-01', 'pending')",
            [],
        )
        .unwrap();

        let report = apply_pending_migrations(&conn).unwrap();
        assert_eq!(report.applied, vec![1, 2, 3, 4, 5]);

        let (due, paid, remaining, status, total): (f64, f64, f64, String, f64) = conn
            .query_row(
                "SELECT total_amount_due, amount_paid, remaining_balance, status, total_amount
                 FROM payments WHERE id = 'pay1'",
                [],
                |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
                },
            )
            .unwrap();
        assert_eq!(due, 50.0);
        assert_eq!(paid, 50.0);
        assert_eq!(remaining, 0.0);
        assert_eq!(status, "completed");
        assert_eq!(total, 50.0);
    }

    /// Ledger says v2/v4 applied but the live schema shows the old
    /// shape — the invariant validator must force the fix.
    #[test]
    fn schema_drift_detected_and_fixed() {
        let conn = raw_db();
        apply_pending_migrations(&conn).unwrap();

        conn.execute_batch(
            "ALTER TABLE payments DROP COLUMN remaining_balance;
             DROP TABLE tooth_treatments;",
        )
        .unwrap();
        conn.execute_batch(TOOTH_TREATMENTS_DDL_LEGACY).unwrap();

        let report = apply_pending_migrations(&conn).unwrap();
        assert!(report.applied.is_empty());
        assert_eq!(report.invariant_fixes, vec![2, 4]);
        assert!(has_column(&conn, "payments", "remaining_balance").unwrap());
        let ddl = table_ddl(&conn, "tooth_treatments").unwrap().unwrap();
        assert!(!ddl.contains(LEGACY_TOOTH_CHECK));
    }

    /// A table dropped outright (not just downgraded) must come back:
    /// the version 3 re-apply recreates it and version 4 re-widens it.
    #[test]
    fn dropped_table_is_recreated_and_widened() {
        let conn = raw_db();
        apply_pending_migrations(&conn).unwrap();

        conn.execute_batch(
            "PRAGMA foreign_keys=OFF;
             DROP TABLE tooth_treatments;
             PRAGMA foreign_keys=ON;",
        )
        .unwrap();

        let report = apply_pending_migrations(&conn).unwrap();
        assert_eq!(report.invariant_fixes, vec![3, 4]);
        assert!(has_table(&conn, "tooth_treatments").unwrap());
        let ddl = table_ddl(&conn, "tooth_treatments").unwrap().unwrap();
        assert!(!ddl.contains(LEGACY_TOOTH_CHECK));

        let report = apply_pending_migrations(&conn).unwrap();
        assert!(report.invariant_fixes.is_empty());
    }

    fn failing_migration(tx: &Transaction) -> Result<(), DatabaseError> {
        tx.execute("ALTER TABLE patients ADD COLUMN will_vanish TEXT", [])?;
        Err(DatabaseError::ConstraintViolation("injected failure".into()))
    }

    #[test]
    fn failed_migration_rolls_back_and_is_recorded() {
        let conn = raw_db();
        apply_pending_migrations(&conn).unwrap();

        let migration = Migration {
            version: 99,
            description: "injected failure",
            criticality: Criticality::Required,
            apply: failing_migration,
        };
        let err = apply_one(&conn, &migration).unwrap_err();
        assert!(matches!(err, DatabaseError::MigrationFailed { version: 99, .. }));

        // Rolled back: the half-applied column must not persist
        assert!(!has_column(&conn, "patients", "will_vanish").unwrap());
        // Recorded with success = 0, eligible for retry
        assert!(ledger_rows(&conn).contains(&(99, 0)));
        assert!(!successful_versions(&conn).unwrap().contains(&99));
    }

    #[test]
    fn optional_failure_skipped_required_failure_propagates() {
        let conn = raw_db();
        apply_pending_migrations(&conn).unwrap();

        let optional = vec![Migration {
            version: 98,
            description: "injected optional failure",
            criticality: Criticality::Optional,
            apply: failing_migration,
        }];
        let mut report = MigrationReport::default();
        run_pass(&conn, &optional, &HashSet::new(), &mut report).unwrap();
        assert_eq!(report.failed_optional, vec![98]);

        let required = vec![Migration {
            version: 97,
            description: "injected required failure",
            criticality: Criticality::Required,
            apply: failing_migration,
        }];
        let mut report = MigrationReport::default();
        let err = run_pass(&conn, &required, &HashSet::new(), &mut report).unwrap_err();
        assert!(matches!(err, DatabaseError::MigrationFailed { version: 97, .. }));
    }

    #[test]
    fn failed_version_retried_on_next_run() {
        let conn = raw_db();
        apply_pending_migrations(&conn).unwrap();
        // Mark v5 as failed, then re-run: it must be re-attempted
        conn.execute("UPDATE schema_migrations SET success = 0 WHERE version = 5", [])
            .unwrap();
        let report = apply_pending_migrations(&conn).unwrap();
        assert_eq!(report.applied, vec![5]);
        assert!(successful_versions(&conn).unwrap().contains(&5));
    }
}
