//! SQLite-backed store for parlours, compliance records, comments and settings.
//!
//! One `MaskDb` wraps one connection. Every mutation auto-commits except the
//! bulk paths (CSV import, report ingestion), which run inside a single
//! transaction and roll back on the first error.

use std::path::Path;

use chrono::{Datelike, NaiveDate, NaiveDateTime, Utc};
use rusqlite::types::ToSql;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{info, warn};

use crate::{
    apply_report, AliasTable, AttendanceUpdate, CategoryCounts, ChartRange, Comment,
    ComplianceRates, ComplianceRecord, ImportedRecord, IngestReport, IngestRun, MaskError,
    NewStore, Outcome, RecordEdit, RecordEntry, RecordId, RecordStore, ReportFormat, Result,
    Store, StoreId, StoreKind, StoreRegistry, UnresolvedRecord, UpsertOutcome,
};

// ── RecordFilter ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub(crate) struct RecordFilter {
    pub(crate) store: Option<String>,
    pub(crate) area: Option<String>,
    pub(crate) kind: Option<StoreKind>,
    pub(crate) unresolved_only: bool,
    /// Oldest first (trend order) instead of newest first (listing order).
    pub(crate) ascending: bool,
}

// ═════════════════════════════════════════════════════════════════════════
// MaskDb: SQLite backend
// ═════════════════════════════════════════════════════════════════════════

pub(crate) struct MaskDb {
    conn: Connection,
}

// ── Schema SQL ───────────────────────────────────────────────────────────

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS store (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    store_name TEXT NOT NULL UNIQUE,
    area TEXT NOT NULL,
    type TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS mask_status (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    store_id INTEGER NOT NULL REFERENCES store (id) ON DELETE CASCADE,
    date TEXT NOT NULL,
    year INTEGER NOT NULL,
    month INTEGER NOT NULL,
    pachinko_no_mask INTEGER NOT NULL,
    slot_no_mask INTEGER NOT NULL,
    total_no_mask INTEGER NOT NULL,
    pachinko_active INTEGER,
    slot_active INTEGER,
    total_active INTEGER,
    pachinko_mask_rate REAL,
    slot_mask_rate REAL,
    total_mask_rate REAL
);

CREATE INDEX IF NOT EXISTS idx_mask_status_store_date ON mask_status(store_id, date);

CREATE TABLE IF NOT EXISTS comments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    year INTEGER,
    month INTEGER,
    comment TEXT,
    created_at TEXT
);

CREATE TABLE IF NOT EXISTS config (
    key TEXT PRIMARY KEY,
    value REAL
);

CREATE TABLE IF NOT EXISTS ingest_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    digest TEXT NOT NULL,
    submitted_at INTEGER NOT NULL,
    updated INTEGER NOT NULL,
    missing INTEGER NOT NULL,
    outcomes TEXT NOT NULL DEFAULT '[]'
);

CREATE INDEX IF NOT EXISTS idx_ingest_runs_digest ON ingest_runs(digest);
";

const RECORD_SELECT: &str = "ms.id, ms.store_id, s.store_name, ms.date,
    ms.pachinko_no_mask, ms.slot_no_mask, ms.pachinko_active, ms.slot_active,
    ms.pachinko_mask_rate, ms.slot_mask_rate, ms.total_mask_rate";

// ── Core implementation ──────────────────────────────────────────────────

impl MaskDb {
    /// Open an existing database. Errors if the file doesn't exist.
    pub(crate) fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(MaskError::InvalidInput(format!(
                "database not found: {} (run `maskboard init` first)",
                path.display()
            )));
        }
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.apply_pragmas()?;
        db.init_schema()?;
        Ok(db)
    }

    /// Open or create a database file with full schema.
    pub(crate) fn open_or_create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.apply_pragmas()?;
        db.init_schema()?;
        Ok(db)
    }

    #[cfg(test)]
    pub(crate) fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let db = Self { conn };
        db.init_schema()?;
        Ok(db)
    }

    fn apply_pragmas(&self) -> Result<()> {
        self.conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;",
        )?;
        Ok(())
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    // ── Store registry ───────────────────────────────────────────────

    pub(crate) fn add_store(&self, store: &NewStore) -> Result<StoreId> {
        let name = store.name.trim();
        if name.is_empty() {
            return Err(MaskError::InvalidInput("store name is empty".to_string()));
        }
        let area = store.area.trim();
        if area.is_empty() {
            return Err(MaskError::InvalidInput(format!("area is empty for {name}")));
        }
        let result = self.conn.execute(
            "INSERT INTO store (store_name, area, type) VALUES (?1, ?2, ?3)",
            params![name, area, store.kind.as_str()],
        );
        match result {
            Ok(_) => {
                let id = self.conn.last_insert_rowid();
                info!(store = name, id, "store registered");
                Ok(id)
            }
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(MaskError::DuplicateStore(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Insert every row or none of them.
    pub(crate) fn import_stores(&self, stores: &[NewStore]) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        for store in stores {
            self.add_store(store)?;
        }
        tx.commit()?;
        Ok(stores.len())
    }

    pub(crate) fn store_by_id(&self, id: StoreId) -> Result<Option<Store>> {
        let store = self
            .conn
            .query_row(
                "SELECT id, store_name, area, type FROM store WHERE id = ?",
                params![id],
                Self::row_to_store,
            )
            .optional()?;
        Ok(store)
    }

    /// Deletes the store together with its records.
    pub(crate) fn delete_store(&self, id: StoreId) -> Result<Store> {
        let store = self
            .store_by_id(id)?
            .ok_or_else(|| MaskError::StoreNotFound(format!("id {id}")))?;
        self.conn
            .execute("DELETE FROM store WHERE id = ?", params![id])?;
        info!(store = %store.name, id, "store deleted");
        Ok(store)
    }

    pub(crate) fn areas(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT area FROM store ORDER BY area")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ── Compliance records ───────────────────────────────────────────

    /// Insert or overwrite the record for (store, date).
    pub(crate) fn upsert_record(&self, entry: &RecordEntry) -> Result<UpsertOutcome> {
        let store = self
            .find_store_by_name(&entry.store)?
            .ok_or_else(|| MaskError::StoreNotFound(entry.store.clone()))?;
        let date = entry.date.format("%Y-%m-%d").to_string();
        let rates = entry
            .active
            .map(|active| ComplianceRates::compute(active, entry.no_mask))
            .unwrap_or_default();

        let existing: Option<RecordId> = self
            .conn
            .query_row(
                "SELECT id FROM mask_status
                 WHERE store_id = ?1 AND replace(date, '/', '-') = ?2
                 ORDER BY id DESC LIMIT 1",
                params![store.id, date],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(id) = existing {
            self.write_record(id, entry.no_mask, entry.active, rates)?;
            info!(store = %store.name, %date, id, "record overwritten");
            return Ok(UpsertOutcome::Updated(id));
        }

        self.conn.execute(
            "INSERT INTO mask_status (
                store_id, date, year, month,
                pachinko_no_mask, slot_no_mask, total_no_mask,
                pachinko_active, slot_active, total_active,
                pachinko_mask_rate, slot_mask_rate, total_mask_rate
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                store.id,
                date,
                entry.date.year(),
                entry.date.month(),
                entry.no_mask.pachinko,
                entry.no_mask.slot,
                entry.no_mask.total(),
                entry.active.map(|a| a.pachinko),
                entry.active.map(|a| a.slot),
                entry.active.map(|a| a.total()),
                rates.pachinko,
                rates.slot,
                rates.total,
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        info!(store = %store.name, %date, id, "record created");
        Ok(UpsertOutcome::Inserted(id))
    }

    /// Manual correction. Totals and rates are recomputed from the merged counts.
    pub(crate) fn edit_record(&self, id: RecordId, edit: &RecordEdit) -> Result<ComplianceRecord> {
        let current = self.record_by_id(id)?.ok_or(MaskError::RecordNotFound(id))?;

        let no_mask = CategoryCounts::new(
            edit.pachinko_no_mask.unwrap_or(current.no_mask.pachinko),
            edit.slot_no_mask.unwrap_or(current.no_mask.slot),
        );
        let active = match (current.active, edit.pachinko_active, edit.slot_active) {
            (None, None, None) => None,
            (base, p, s) => {
                let base = base.unwrap_or_default();
                Some(CategoryCounts::new(
                    p.unwrap_or(base.pachinko),
                    s.unwrap_or(base.slot),
                ))
            }
        };
        let rates = active
            .map(|a| ComplianceRates::compute(a, no_mask))
            .unwrap_or_default();

        self.write_record(id, no_mask, active, rates)?;
        info!(id, "record edited");
        self.record_by_id(id)?.ok_or(MaskError::RecordNotFound(id))
    }

    fn write_record(
        &self,
        id: RecordId,
        no_mask: CategoryCounts,
        active: Option<CategoryCounts>,
        rates: ComplianceRates,
    ) -> Result<()> {
        let rows = self.conn.execute(
            "UPDATE mask_status
             SET pachinko_no_mask = ?1, slot_no_mask = ?2, total_no_mask = ?3,
                 pachinko_active = ?4, slot_active = ?5, total_active = ?6,
                 pachinko_mask_rate = ?7, slot_mask_rate = ?8, total_mask_rate = ?9
             WHERE id = ?10",
            params![
                no_mask.pachinko,
                no_mask.slot,
                no_mask.total(),
                active.map(|a| a.pachinko),
                active.map(|a| a.slot),
                active.map(|a| a.total()),
                rates.pachinko,
                rates.slot,
                rates.total,
                id,
            ],
        )?;
        if rows == 0 {
            return Err(MaskError::RecordNotFound(id));
        }
        Ok(())
    }

    pub(crate) fn delete_record(&self, id: RecordId) -> Result<()> {
        let rows = self
            .conn
            .execute("DELETE FROM mask_status WHERE id = ?", params![id])?;
        if rows == 0 {
            return Err(MaskError::RecordNotFound(id));
        }
        info!(id, "record deleted");
        Ok(())
    }

    /// Rows come straight from a spreadsheet export; only the store reference is checked.
    pub(crate) fn import_records(&self, rows: &[ImportedRecord]) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        for row in rows {
            if self.store_by_id(row.store_id)?.is_none() {
                return Err(MaskError::Csv {
                    line: row.line,
                    reason: format!("unknown store_id {}", row.store_id),
                });
            }
            self.conn.execute(
                "INSERT INTO mask_status (
                    store_id, date, year, month,
                    pachinko_no_mask, slot_no_mask, total_no_mask,
                    pachinko_active, slot_active, total_active,
                    pachinko_mask_rate, slot_mask_rate, total_mask_rate
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    row.store_id,
                    row.date.format("%Y-%m-%d").to_string(),
                    row.year,
                    row.month,
                    row.no_mask.pachinko,
                    row.no_mask.slot,
                    row.total_no_mask,
                    row.pachinko_active,
                    row.slot_active,
                    row.total_active,
                    row.rates.pachinko,
                    row.rates.slot,
                    row.rates.total,
                ],
            )?;
        }
        tx.commit()?;
        info!(rows = rows.len(), "records imported");
        Ok(rows.len())
    }

    pub(crate) fn record_by_id(&self, id: RecordId) -> Result<Option<ComplianceRecord>> {
        let sql = format!(
            "SELECT {RECORD_SELECT} FROM mask_status ms JOIN store s ON ms.store_id = s.id
             WHERE ms.id = ?"
        );
        let record = self
            .conn
            .query_row(&sql, params![id], Self::row_to_record)
            .optional()?;
        Ok(record)
    }

    pub(crate) fn query_records(&self, filter: &RecordFilter) -> Result<Vec<ComplianceRecord>> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut bind: Vec<Box<dyn ToSql>> = Vec::new();
        if let Some(store) = &filter.store {
            clauses.push("s.store_name = ?");
            bind.push(Box::new(store.clone()));
        }
        if let Some(area) = &filter.area {
            clauses.push("s.area = ?");
            bind.push(Box::new(area.clone()));
        }
        if let Some(kind) = filter.kind {
            clauses.push("s.type = ?");
            bind.push(Box::new(kind.as_str()));
        }
        if filter.unresolved_only {
            clauses.push(
                "(ms.pachinko_active IS NULL OR ms.pachinko_active = 0 OR ms.slot_active IS NULL)",
            );
        }
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let order = if filter.ascending {
            "replace(ms.date, '/', '-') ASC, ms.store_id, ms.id"
        } else {
            "replace(ms.date, '/', '-') DESC, ms.store_id, ms.id DESC"
        };
        let sql = format!(
            "SELECT {RECORD_SELECT} FROM mask_status ms JOIN store s ON ms.store_id = s.id
             {where_sql} ORDER BY {order}"
        );
        let bind_refs: Vec<&dyn ToSql> = bind.iter().map(|b| b.as_ref()).collect();
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(bind_refs.as_slice(), Self::row_to_record)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ── Comments ─────────────────────────────────────────────────────

    pub(crate) fn add_comment(&self, text: &str, now: NaiveDateTime) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO comments (year, month, comment, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                now.year(),
                now.month(),
                text,
                now.format("%Y-%m-%d %H:%M:%S").to_string()
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        info!(id, "comment added");
        Ok(id)
    }

    pub(crate) fn edit_comment(&self, id: i64, text: &str) -> Result<()> {
        let rows = self.conn.execute(
            "UPDATE comments SET comment = ?1 WHERE id = ?2",
            params![text, id],
        )?;
        if rows == 0 {
            return Err(MaskError::CommentNotFound(id));
        }
        Ok(())
    }

    pub(crate) fn list_comments(&self) -> Result<Vec<Comment>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, year, month, comment, created_at FROM comments
             ORDER BY created_at DESC, id DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Comment {
                id: row.get(0)?,
                year: row.get::<_, Option<i32>>(1)?.unwrap_or_default(),
                month: row.get::<_, Option<u32>>(2)?.unwrap_or_default(),
                comment: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                created_at: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ── Config operations ────────────────────────────────────────────

    pub(crate) fn config_get(&self, key: &str) -> Result<Option<f64>> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM config WHERE key = ?",
                params![key],
                |row| row.get::<_, Option<f64>>(0),
            )
            .optional()?;
        Ok(value.flatten())
    }

    pub(crate) fn config_set(&self, key: &str, value: f64) -> Result<()> {
        self.conn.execute(
            "INSERT INTO config (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub(crate) fn chart_range(&self) -> Result<ChartRange> {
        let defaults = ChartRange::default();
        Ok(ChartRange {
            y_min: self.config_get("y_min")?.unwrap_or(defaults.y_min),
            y_max: self.config_get("y_max")?.unwrap_or(defaults.y_max),
        })
    }

    pub(crate) fn set_chart_range(&self, range: ChartRange) -> Result<()> {
        range.validate()?;
        let tx = self.conn.unchecked_transaction()?;
        self.config_set("y_min", range.y_min)?;
        self.config_set("y_max", range.y_max)?;
        tx.commit()?;
        Ok(())
    }

    // ── Report ingestion ─────────────────────────────────────────────

    /// Parse a pasted attendance report and resolve matching records.
    ///
    /// The run is one transaction: either every block is applied and the run
    /// is logged, or nothing is written.
    pub(crate) fn ingest_report(
        &self,
        text: &str,
        aliases: &AliasTable,
        format: &ReportFormat,
    ) -> Result<IngestReport> {
        if text.trim().is_empty() {
            return Err(MaskError::EmptyReport);
        }
        let digest = blake3::hash(text.as_bytes()).to_hex().to_string();

        let tx = self.conn.unchecked_transaction()?;
        let previous_run = self.ingest_run_by_digest(&digest)?;
        if let Some(prev) = &previous_run {
            warn!(run = prev.id, submitted_at = prev.submitted_at, "identical report was already submitted");
        }
        let outcomes = apply_report(self, text, aliases, format)?;
        let run_id = self.log_ingest_run(&digest, &outcomes)?;
        tx.commit()?;

        let updated = outcomes.iter().filter(|o| o.is_updated()).count();
        info!(run = run_id, blocks = outcomes.len(), updated, "report ingested");
        Ok(IngestReport {
            run_id,
            digest,
            previous_run,
            outcomes,
        })
    }

    fn log_ingest_run(&self, digest: &str, outcomes: &[Outcome]) -> Result<i64> {
        let updated = outcomes.iter().filter(|o| o.is_updated()).count();
        let missing = outcomes.len() - updated;
        let outcomes_json = serde_json::to_string(outcomes)?;
        self.conn.execute(
            "INSERT INTO ingest_runs (digest, submitted_at, updated, missing, outcomes)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                digest,
                Utc::now().timestamp(),
                updated as i64,
                missing as i64,
                outcomes_json
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub(crate) fn ingest_run_by_digest(&self, digest: &str) -> Result<Option<IngestRun>> {
        let run = self
            .conn
            .query_row(
                "SELECT id, digest, submitted_at, updated, missing FROM ingest_runs
                 WHERE digest = ? ORDER BY id DESC LIMIT 1",
                params![digest],
                Self::row_to_ingest_run,
            )
            .optional()?;
        Ok(run)
    }

    pub(crate) fn recent_ingest_runs(&self, limit: usize) -> Result<Vec<IngestRun>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, digest, submitted_at, updated, missing FROM ingest_runs
             ORDER BY id DESC LIMIT ?",
        )?;
        let rows = stmt.query_map(params![limit as i64], Self::row_to_ingest_run)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ── Helpers ──────────────────────────────────────────────────────

    fn row_to_store(row: &rusqlite::Row) -> rusqlite::Result<Store> {
        Ok(Store {
            id: row.get(0)?,
            name: row.get(1)?,
            area: row.get(2)?,
            kind: StoreKind::from_db_str(&row.get::<_, String>(3)?),
        })
    }

    fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<ComplianceRecord> {
        let date_text: String = row.get(3)?;
        let date = parse_stored_date(&date_text).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?;
        // Half-filled attendance reads as absent, matching the unresolved filter.
        let active = match (row.get::<_, Option<u32>>(6)?, row.get::<_, Option<u32>>(7)?) {
            (Some(p), Some(s)) => Some(CategoryCounts::new(p, s)),
            _ => None,
        };
        Ok(ComplianceRecord {
            id: row.get(0)?,
            store_id: row.get(1)?,
            store_name: row.get(2)?,
            date,
            no_mask: CategoryCounts::new(row.get(4)?, row.get(5)?),
            active,
            rates: ComplianceRates {
                pachinko: row.get(8)?,
                slot: row.get(9)?,
                total: row.get(10)?,
            },
        })
    }

    fn row_to_ingest_run(row: &rusqlite::Row) -> rusqlite::Result<IngestRun> {
        Ok(IngestRun {
            id: row.get(0)?,
            digest: row.get(1)?,
            submitted_at: row.get(2)?,
            updated: row.get::<_, i64>(3)? as usize,
            missing: row.get::<_, i64>(4)? as usize,
        })
    }
}

/// Older rows were written with `/` separators.
fn parse_stored_date(text: &str) -> std::result::Result<NaiveDate, chrono::ParseError> {
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(text, "%Y/%m/%d"))
}

// ── Collaborator traits ──────────────────────────────────────────────────

impl StoreRegistry for MaskDb {
    fn find_store_by_name(&self, name: &str) -> Result<Option<Store>> {
        let store = self
            .conn
            .query_row(
                "SELECT id, store_name, area, type FROM store WHERE store_name = ?",
                params![name.trim()],
                Self::row_to_store,
            )
            .optional()?;
        Ok(store)
    }

    fn list_stores(&self) -> Result<Vec<Store>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, store_name, area, type FROM store ORDER BY id")?;
        let rows = stmt.query_map([], Self::row_to_store)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

impl RecordStore for MaskDb {
    fn find_latest_unresolved(&self, store_name: &str) -> Result<Option<UnresolvedRecord>> {
        let record = self
            .conn
            .query_row(
                "SELECT ms.id, s.store_name, ms.date, ms.pachinko_no_mask, ms.slot_no_mask
                 FROM mask_status ms
                 JOIN store s ON ms.store_id = s.id
                 WHERE s.store_name = ?1
                   AND (ms.pachinko_active IS NULL OR ms.pachinko_active = 0
                        OR ms.slot_active IS NULL)
                 ORDER BY replace(ms.date, '/', '-') DESC, ms.id DESC
                 LIMIT 1",
                params![store_name],
                |row| {
                    let date_text: String = row.get(2)?;
                    let date = parse_stored_date(&date_text).map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(
                            2,
                            rusqlite::types::Type::Text,
                            Box::new(e),
                        )
                    })?;
                    Ok(UnresolvedRecord {
                        id: row.get(0)?,
                        store_name: row.get(1)?,
                        date,
                        no_mask: CategoryCounts::new(row.get(3)?, row.get(4)?),
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    fn update_attendance_and_rates(
        &self,
        record_id: RecordId,
        update: &AttendanceUpdate,
    ) -> Result<()> {
        let rows = self.conn.execute(
            "UPDATE mask_status
             SET pachinko_active = ?1, slot_active = ?2, total_active = ?3,
                 pachinko_mask_rate = ?4, slot_mask_rate = ?5, total_mask_rate = ?6
             WHERE id = ?7",
            params![
                update.active.pachinko,
                update.active.slot,
                update.active.total(),
                update.rates.pachinko,
                update.rates.slot,
                update.rates.total,
                record_id,
            ],
        )?;
        if rows == 0 {
            return Err(MaskError::RecordNotFound(record_id));
        }
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_db_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("maskboard_test");
        std::fs::create_dir_all(&dir).unwrap();
        dir.join(format!("test_{}_{name}.sqlite", std::process::id()))
    }

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn seeded() -> MaskDb {
        let db = MaskDb::open_in_memory().unwrap();
        db.add_store(&NewStore {
            name: "延岡店".to_string(),
            area: "延岡地区".to_string(),
            kind: StoreKind::Own,
        })
        .unwrap();
        db.add_store(&NewStore {
            name: "門川".to_string(),
            area: "日向地区".to_string(),
            kind: StoreKind::Own,
        })
        .unwrap();
        db
    }

    fn unresolved(store: &str, day: &str, p: u32, s: u32) -> RecordEntry {
        RecordEntry {
            store: store.to_string(),
            date: date(day),
            no_mask: CategoryCounts::new(p, s),
            active: None,
        }
    }

    #[test]
    fn test_open_or_create() {
        let path = temp_db_path("open_create");
        let _ = std::fs::remove_file(&path);
        let db = MaskDb::open_or_create(&path).unwrap();
        assert!(db.list_stores().unwrap().is_empty());
        drop(db);
        assert!(MaskDb::open(&path).is_ok());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_open_missing_file() {
        let path = temp_db_path("missing");
        let _ = std::fs::remove_file(&path);
        assert!(matches!(MaskDb::open(&path), Err(MaskError::InvalidInput(_))));
    }

    #[test]
    fn test_duplicate_store_rejected() {
        let db = seeded();
        let err = db
            .add_store(&NewStore {
                name: "延岡店".to_string(),
                area: "延岡地区".to_string(),
                kind: StoreKind::Competitor,
            })
            .unwrap_err();
        assert!(matches!(err, MaskError::DuplicateStore(name) if name == "延岡店"));
    }

    #[test]
    fn test_find_store_by_name() {
        let db = seeded();
        let store = db.find_store_by_name("門川").unwrap().unwrap();
        assert_eq!(store.area, "日向地区");
        assert_eq!(store.kind, StoreKind::Own);
        assert!(db.find_store_by_name("川南").unwrap().is_none());
    }

    #[test]
    fn test_upsert_overwrites_same_day() {
        let db = seeded();
        let first = db.upsert_record(&unresolved("延岡店", "2024-01-01", 1, 1)).unwrap();
        let second = db.upsert_record(&unresolved("延岡店", "2024-01-01", 3, 2)).unwrap();
        let UpsertOutcome::Inserted(id) = first else {
            panic!("expected insert");
        };
        assert_eq!(second, UpsertOutcome::Updated(id));
        let record = db.record_by_id(id).unwrap().unwrap();
        assert_eq!(record.no_mask, CategoryCounts::new(3, 2));
        assert!(!record.is_resolved());
    }

    #[test]
    fn test_upsert_unknown_store() {
        let db = seeded();
        let err = db.upsert_record(&unresolved("川南", "2024-01-01", 1, 1)).unwrap_err();
        assert!(matches!(err, MaskError::StoreNotFound(_)));
    }

    #[test]
    fn test_latest_unresolved_tie_breaks_on_id() {
        let db = seeded();
        db.upsert_record(&unresolved("延岡店", "2024-01-01", 1, 1)).unwrap();
        // Same date inserted through import bypasses the upsert and creates a twin.
        let store = db.find_store_by_name("延岡店").unwrap().unwrap();
        db.import_records(&[ImportedRecord {
            line: 2,
            store_id: store.id,
            date: date("2024-01-01"),
            year: 2024,
            month: 1,
            no_mask: CategoryCounts::new(4, 4),
            total_no_mask: 8,
            pachinko_active: None,
            slot_active: None,
            total_active: None,
            rates: ComplianceRates::default(),
        }])
        .unwrap();
        let latest = db.find_latest_unresolved("延岡店").unwrap().unwrap();
        assert_eq!(latest.no_mask, CategoryCounts::new(4, 4));
    }

    #[test]
    fn test_ingest_end_to_end() {
        let db = seeded();
        let UpsertOutcome::Inserted(id) =
            db.upsert_record(&unresolved("延岡店", "2024-01-01", 1, 1)).unwrap()
        else {
            panic!("expected insert");
        };

        let text = "西の丸延岡店\nP  計   5\nS  計   3\n";
        let report = db
            .ingest_report(text, &AliasTable::builtin(), &ReportFormat::default())
            .unwrap();
        assert!(report.previous_run.is_none());
        assert_eq!(report.outcomes.len(), 1);
        assert!(report.outcomes[0].is_updated());

        let record = db.record_by_id(id).unwrap().unwrap();
        assert_eq!(record.active, Some(CategoryCounts::new(5, 3)));
        assert_eq!(record.rates.pachinko, Some(0.8));
        assert!((record.rates.slot.unwrap() - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(record.rates.total, Some(0.75));
        assert!(record.is_resolved());

        let again = db
            .ingest_report(text, &AliasTable::builtin(), &ReportFormat::default())
            .unwrap();
        assert_eq!(again.previous_run.as_ref().map(|r| r.id), Some(report.run_id));
        assert_eq!(
            again.outcomes,
            vec![Outcome::NoUnresolvedRecord {
                store: "延岡店".to_string()
            }]
        );
        assert_eq!(db.recent_ingest_runs(10).unwrap().len(), 2);
    }

    #[test]
    fn test_ingest_without_record_mutates_nothing() {
        let db = seeded();
        let text = "西の丸延岡店\nP  計   5\nS  計   3\n";
        let report = db
            .ingest_report(text, &AliasTable::builtin(), &ReportFormat::default())
            .unwrap();
        assert!(!report.outcomes[0].is_updated());
        let filter = RecordFilter::default();
        assert!(db.query_records(&filter).unwrap().is_empty());
    }

    #[test]
    fn test_ingest_empty_report() {
        let db = seeded();
        let err = db
            .ingest_report("  \n\n", &AliasTable::builtin(), &ReportFormat::default())
            .unwrap_err();
        assert!(matches!(err, MaskError::EmptyReport));
        assert!(db.recent_ingest_runs(10).unwrap().is_empty());
    }

    #[test]
    fn test_edit_record_recomputes_rates() {
        let db = seeded();
        let UpsertOutcome::Inserted(id) =
            db.upsert_record(&unresolved("門川", "2024-02-01", 2, 1)).unwrap()
        else {
            panic!("expected insert");
        };
        let edited = db
            .edit_record(
                id,
                &RecordEdit {
                    pachinko_active: Some(10),
                    slot_active: Some(4),
                    ..RecordEdit::default()
                },
            )
            .unwrap();
        assert_eq!(edited.active, Some(CategoryCounts::new(10, 4)));
        assert_eq!(edited.rates.pachinko, Some(0.8));
        assert_eq!(edited.rates.slot, Some(0.75));

        let edited = db
            .edit_record(
                id,
                &RecordEdit {
                    pachinko_no_mask: Some(12),
                    ..RecordEdit::default()
                },
            )
            .unwrap();
        assert_eq!(edited.rates.pachinko, Some(-0.2));
        assert!(matches!(
            db.edit_record(999, &RecordEdit::default()),
            Err(MaskError::RecordNotFound(999))
        ));
    }

    #[test]
    fn test_delete_store_cascades() {
        let db = seeded();
        db.upsert_record(&unresolved("延岡店", "2024-01-01", 1, 1)).unwrap();
        db.upsert_record(&unresolved("門川", "2024-01-01", 1, 1)).unwrap();
        let store = db.find_store_by_name("延岡店").unwrap().unwrap();
        db.delete_store(store.id).unwrap();
        let remaining = db.query_records(&RecordFilter::default()).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].store_name, "門川");
        assert!(matches!(db.delete_store(store.id), Err(MaskError::StoreNotFound(_))));
    }

    #[test]
    fn test_query_records_filters() {
        let db = seeded();
        db.upsert_record(&unresolved("延岡店", "2024-01-01", 1, 1)).unwrap();
        db.upsert_record(&RecordEntry {
            active: Some(CategoryCounts::new(10, 10)),
            ..unresolved("延岡店", "2024-01-02", 1, 1)
        })
        .unwrap();
        db.upsert_record(&unresolved("門川", "2024-01-03", 0, 0)).unwrap();

        let all = db.query_records(&RecordFilter::default()).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].date, date("2024-01-03"));

        let unresolved_only = db
            .query_records(&RecordFilter {
                store: Some("延岡店".to_string()),
                unresolved_only: true,
                ..RecordFilter::default()
            })
            .unwrap();
        assert_eq!(unresolved_only.len(), 1);
        assert_eq!(unresolved_only[0].date, date("2024-01-01"));

        let area = db
            .query_records(&RecordFilter {
                area: Some("延岡地区".to_string()),
                ascending: true,
                ..RecordFilter::default()
            })
            .unwrap();
        assert_eq!(area.len(), 2);
        assert_eq!(area[0].date, date("2024-01-01"));
    }

    #[test]
    fn test_comments() {
        let db = seeded();
        let now = date("2024-03-05").and_hms_opt(9, 30, 0).unwrap();
        let id = db.add_comment("着用率改善", now).unwrap();
        let later = date("2024-04-01").and_hms_opt(8, 0, 0).unwrap();
        db.add_comment("声掛け強化", later).unwrap();
        db.edit_comment(id, "着用率改善傾向").unwrap();

        let comments = db.list_comments().unwrap();
        assert_eq!(comments.len(), 2);
        assert_eq!(comments[0].comment, "声掛け強化");
        assert_eq!(comments[1].comment, "着用率改善傾向");
        assert_eq!((comments[1].year, comments[1].month), (2024, 3));
        assert!(matches!(db.edit_comment(42, "x"), Err(MaskError::CommentNotFound(42))));
    }

    #[test]
    fn test_chart_range() {
        let db = seeded();
        assert_eq!(db.chart_range().unwrap(), ChartRange::default());
        db.set_chart_range(ChartRange { y_min: 60.0, y_max: 100.0 }).unwrap();
        assert_eq!(db.chart_range().unwrap().y_min, 60.0);
        assert!(db.set_chart_range(ChartRange { y_min: 90.0, y_max: 10.0 }).is_err());
        assert_eq!(db.chart_range().unwrap().y_min, 60.0);
    }

    #[test]
    fn test_stored_date_formats() {
        assert_eq!(parse_stored_date("2024/01/05").unwrap(), date("2024-01-05"));
        assert_eq!(parse_stored_date("2024-01-05").unwrap(), date("2024-01-05"));
        assert!(parse_stored_date("05.01.2024").is_err());
    }

    #[test]
    fn test_slash_dated_rows_order_by_calendar_date() {
        let db = seeded();
        let store = db.find_store_by_name("延岡店").unwrap().unwrap();
        db.conn
            .execute(
                "INSERT INTO mask_status (store_id, date, year, month,
                    pachinko_no_mask, slot_no_mask, total_no_mask)
                 VALUES (?1, '2024/01/05', 2024, 1, 7, 7, 14)",
                params![store.id],
            )
            .unwrap();
        db.upsert_record(&unresolved("延岡店", "2024-01-03", 1, 1)).unwrap();

        let latest = db.find_latest_unresolved("延岡店").unwrap().unwrap();
        assert_eq!(latest.date, date("2024-01-05"));
        assert_eq!(latest.no_mask, CategoryCounts::new(7, 7));

        let listed = db.query_records(&RecordFilter::default()).unwrap();
        assert_eq!(listed[0].date, date("2024-01-05"));
        let ascending = db
            .query_records(&RecordFilter {
                ascending: true,
                ..RecordFilter::default()
            })
            .unwrap();
        assert_eq!(ascending[0].date, date("2024-01-03"));

        let outcome = db.upsert_record(&unresolved("延岡店", "2024-01-05", 2, 2)).unwrap();
        assert_eq!(outcome, UpsertOutcome::Updated(latest.id));
    }

    #[test]
    fn test_half_filled_attendance_reads_as_unresolved() {
        let db = seeded();
        let UpsertOutcome::Inserted(id) =
            db.upsert_record(&unresolved("門川", "2024-02-01", 2, 1)).unwrap()
        else {
            panic!("expected insert");
        };
        db.conn
            .execute("UPDATE mask_status SET pachinko_active = 9 WHERE id = ?", params![id])
            .unwrap();
        let record = db.record_by_id(id).unwrap().unwrap();
        assert_eq!(record.active, None);
        assert!(!record.is_resolved());
        assert_eq!(db.find_latest_unresolved("門川").unwrap().unwrap().id, id);
    }

    #[test]
    fn test_import_stores_is_all_or_nothing() {
        let db = seeded();
        let stores = [
            NewStore {
                name: "川南".to_string(),
                area: "東児湯地区".to_string(),
                kind: StoreKind::Own,
            },
            NewStore {
                name: "延岡店".to_string(),
                area: "延岡地区".to_string(),
                kind: StoreKind::Own,
            },
        ];
        assert!(matches!(db.import_stores(&stores), Err(MaskError::DuplicateStore(_))));
        assert!(db.find_store_by_name("川南").unwrap().is_none());

        assert_eq!(db.import_stores(&stores[..1]).unwrap(), 1);
        assert_eq!(db.areas().unwrap(), vec!["延岡地区", "日向地区", "東児湯地区"]);
    }
}
