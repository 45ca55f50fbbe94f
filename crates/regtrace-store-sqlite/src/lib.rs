use std::path::Path;

use regtrace_core::{
    ChangeKind, EngineError, EngineResult, HistoryEntry, HistoryFilter, Regulation,
    RegulationDraft, RegulationId, RequirementId, RequirementRecord, SourceSystem,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS regulations (
  regulation_id TEXT NOT NULL,
  version INTEGER NOT NULL CHECK (version >= 1),
  country TEXT NOT NULL,
  source TEXT NOT NULL CHECK (source IN ('federal_register','eur_lex','manual')),
  title TEXT NOT NULL,
  published_at TEXT NOT NULL,
  created_at TEXT NOT NULL,
  fingerprint TEXT NOT NULL,
  body TEXT NOT NULL,
  url TEXT,
  PRIMARY KEY (regulation_id, version)
);

CREATE TABLE IF NOT EXISTS regulation_heads (
  regulation_id TEXT PRIMARY KEY,
  latest_version INTEGER NOT NULL,
  FOREIGN KEY (regulation_id, latest_version) REFERENCES regulations(regulation_id, version)
);

CREATE TABLE IF NOT EXISTS requirements (
  requirement_id TEXT PRIMARY KEY,
  regulation_id TEXT NOT NULL,
  regulation_version INTEGER NOT NULL,
  seq INTEGER NOT NULL,
  text_raw TEXT NOT NULL,
  text_engineering TEXT NOT NULL,
  created_at TEXT NOT NULL,
  UNIQUE (regulation_id, regulation_version, seq),
  FOREIGN KEY (regulation_id, regulation_version) REFERENCES regulations(regulation_id, version)
);

CREATE TABLE IF NOT EXISTS extractions (
  regulation_id TEXT NOT NULL,
  regulation_version INTEGER NOT NULL,
  record_count INTEGER NOT NULL,
  extracted_at TEXT NOT NULL,
  PRIMARY KEY (regulation_id, regulation_version),
  FOREIGN KEY (regulation_id, regulation_version) REFERENCES regulations(regulation_id, version)
);

CREATE TABLE IF NOT EXISTS history (
  sequence INTEGER PRIMARY KEY AUTOINCREMENT,
  recorded_at TEXT NOT NULL,
  subject_id TEXT NOT NULL,
  subject_version INTEGER NOT NULL,
  change_type TEXT NOT NULL CHECK (change_type IN ('imported','re-versioned','extracted','re-extracted')),
  summary TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_requirements_regulation ON requirements(regulation_id, regulation_version);
CREATE INDEX IF NOT EXISTS idx_history_subject ON history(subject_id);
CREATE INDEX IF NOT EXISTS idx_history_recorded_at ON history(recorded_at);
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

/// Outcome of materializing one extraction run for a `(regulation, version)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStatus {
    /// First materialization for this version.
    Initial,
    /// Freshly computed set is content-equal to the stored one; nothing written.
    Unchanged,
    /// Stored set replaced because the computed content differs.
    Replaced,
}

impl SqliteStore {
    /// Open a SQLite-backed store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot
    /// be applied.
    pub fn open(path: &Path) -> EngineResult<Self> {
        let conn = Connection::open(path).map_err(|err| {
            EngineError::Internal(format!(
                "failed to open sqlite database at {}: {err}",
                path.display()
            ))
        })?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(db_err)?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> EngineResult<SchemaStatus> {
        self.conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL).map_err(db_err)?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> EngineResult<()> {
        self.conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL).map_err(db_err)?;

        if current_schema_version(&self.conn)? < 1 {
            let tx = self
                .conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(db_err)?;
            tx.execute_batch(MIGRATION_001_SQL).map_err(db_err)?;
            tx.execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![1_i64, rfc3339(OffsetDateTime::now_utc())?],
            )
            .map_err(db_err)?;
            tx.commit().map_err(db_err)?;
        }

        Ok(())
    }

    /// Commit one draft: version 1 for an unknown identifier, a fingerprint
    /// no-op for unchanged text, a strictly incremented version for drifted
    /// text. The matching ledger row lands in the same transaction, so a
    /// failed append rolls the whole ingest back.
    ///
    /// Returns the committed (or already current) regulation and whether a
    /// new version was created.
    ///
    /// # Errors
    /// Returns [`EngineError::Busy`] when the database write lock cannot be
    /// obtained in time and [`EngineError::Conflict`] when a concurrent
    /// writer already created the version this ingest computed.
    pub fn ingest(&mut self, draft: &RegulationDraft) -> EngineResult<(Regulation, bool)> {
        draft.validate()?;
        let fingerprint = draft.fingerprint();
        let now = OffsetDateTime::now_utc();

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        // Head re-read under the write lock: the loser of a concurrent race
        // observes the winner's committed head and falls into the no-op or
        // new-version path instead of double-creating version 1.
        let head: Option<u32> = tx
            .query_row(
                "SELECT latest_version FROM regulation_heads WHERE regulation_id = ?1",
                params![draft.id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;

        let result = match head {
            None => {
                let regulation = regulation_from_draft(draft, 1, &fingerprint, now);
                insert_regulation(&tx, &regulation)?;
                tx.execute(
                    "INSERT INTO regulation_heads(regulation_id, latest_version) VALUES (?1, 1)",
                    params![draft.id.as_str()],
                )
                .map_err(db_err)?;
                append_history(
                    &tx,
                    draft.id.as_str(),
                    1,
                    ChangeKind::Imported,
                    &format!("imported from {} as version 1", draft.source.as_str()),
                    now,
                )?;
                tracing::info!(regulation = %draft.id, "imported regulation as version 1");
                (regulation, true)
            }
            Some(latest) => {
                let current = load_regulation(&tx, &draft.id, latest)?;
                if current.fingerprint == fingerprint {
                    (current, false)
                } else {
                    let version = latest + 1;
                    let regulation = regulation_from_draft(draft, version, &fingerprint, now);
                    insert_regulation(&tx, &regulation)?;
                    tx.execute(
                        "UPDATE regulation_heads SET latest_version = ?2 WHERE regulation_id = ?1",
                        params![draft.id.as_str(), version],
                    )
                    .map_err(db_err)?;
                    append_history(
                        &tx,
                        draft.id.as_str(),
                        version,
                        ChangeKind::ReVersioned,
                        &format!(
                            "text drift detected: version {version} supersedes version {latest}"
                        ),
                        now,
                    )?;
                    tracing::info!(
                        regulation = %draft.id,
                        version,
                        "re-versioned regulation after text drift"
                    );
                    (regulation, true)
                }
            }
        };

        tx.commit().map_err(db_err)?;
        Ok(result)
    }

    /// Fetch the latest version of one regulation.
    ///
    /// # Errors
    /// Returns [`EngineError::NotFound`] when the identifier is unknown.
    pub fn get(&self, id: &RegulationId) -> EngineResult<Regulation> {
        let latest = self.latest_version(id)?;
        load_regulation(&self.conn, id, latest)
    }

    /// Fetch one specific committed version.
    ///
    /// # Errors
    /// Returns [`EngineError::NotFound`] when the pair is unknown.
    pub fn get_version(&self, id: &RegulationId, version: u32) -> EngineResult<Regulation> {
        load_regulation(&self.conn, id, version)
    }

    /// Latest version number for one identifier.
    ///
    /// # Errors
    /// Returns [`EngineError::NotFound`] when the identifier is unknown.
    pub fn latest_version(&self, id: &RegulationId) -> EngineResult<u32> {
        self.conn
            .query_row(
                "SELECT latest_version FROM regulation_heads WHERE regulation_id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| EngineError::NotFound(format!("regulation {id} does not exist")))
    }

    /// Latest version of every regulation, ordered by identifier — stable
    /// across repeated calls with no intervening writes.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list(&self) -> EngineResult<Vec<Regulation>> {
        self.list_filtered(None, None, None)
    }

    /// `list` narrowed by country, source system, and a free-text needle over
    /// title and body.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_filtered(
        &self,
        country: Option<&str>,
        source: Option<SourceSystem>,
        q: Option<&str>,
    ) -> EngineResult<Vec<Regulation>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT r.regulation_id, r.version, r.country, r.source, r.title,
                        r.published_at, r.created_at, r.fingerprint, r.body, r.url
                 FROM regulations r
                 JOIN regulation_heads h
                   ON r.regulation_id = h.regulation_id AND r.version = h.latest_version
                 WHERE (?1 IS NULL OR LOWER(r.country) = LOWER(?1))
                   AND (?2 IS NULL OR r.source = ?2)
                   AND (?3 IS NULL OR INSTR(LOWER(r.title), LOWER(?3)) > 0
                                   OR INSTR(LOWER(r.body), LOWER(?3)) > 0)
                 ORDER BY r.regulation_id ASC",
            )
            .map_err(db_err)?;

        let mut rows = stmt
            .query(params![country, source.map(SourceSystem::as_str), q])
            .map_err(db_err)?;
        let mut regulations = Vec::new();
        while let Some(row) = rows.next().map_err(db_err)? {
            regulations.push(regulation_from_row(row)?);
        }
        Ok(regulations)
    }

    /// Materialize one extraction run. Content-compares the freshly computed
    /// records against any stored set for the same version inside the write
    /// transaction; appends `extracted` on first materialization and
    /// `re-extracted` only when the stored content actually changed.
    ///
    /// # Errors
    /// Returns [`EngineError::NotFound`] when the regulation version is
    /// unknown, plus the usual `Busy`/`Conflict` write-lock mappings.
    pub fn store_extraction(
        &mut self,
        regulation: &Regulation,
        records: &[RequirementRecord],
    ) -> EngineResult<ExtractionStatus> {
        let now = OffsetDateTime::now_utc();
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        // the version must already be committed
        load_regulation(&tx, &regulation.id, regulation.version)?;

        let prior_run: Option<i64> = tx
            .query_row(
                "SELECT record_count FROM extractions
                 WHERE regulation_id = ?1 AND regulation_version = ?2",
                params![regulation.id.as_str(), regulation.version],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;

        let status = match prior_run {
            None => {
                insert_requirements(&tx, records)?;
                tx.execute(
                    "INSERT INTO extractions(regulation_id, regulation_version, record_count, extracted_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        regulation.id.as_str(),
                        regulation.version,
                        i64::try_from(records.len()).map_err(EngineError::internal)?,
                        rfc3339(now)?
                    ],
                )
                .map_err(db_err)?;
                append_history(
                    &tx,
                    regulation.id.as_str(),
                    regulation.version,
                    ChangeKind::Extracted,
                    &format!("extracted {} requirements from version {}", records.len(), regulation.version),
                    now,
                )?;
                ExtractionStatus::Initial
            }
            Some(_) => {
                let existing =
                    load_requirements(&tx, &regulation.id, regulation.version)?;
                if regtrace_core::requirement_sets_equal(&existing, records) {
                    ExtractionStatus::Unchanged
                } else {
                    tx.execute(
                        "DELETE FROM requirements
                         WHERE regulation_id = ?1 AND regulation_version = ?2",
                        params![regulation.id.as_str(), regulation.version],
                    )
                    .map_err(db_err)?;
                    insert_requirements(&tx, records)?;
                    tx.execute(
                        "UPDATE extractions SET record_count = ?3, extracted_at = ?4
                         WHERE regulation_id = ?1 AND regulation_version = ?2",
                        params![
                            regulation.id.as_str(),
                            regulation.version,
                            i64::try_from(records.len()).map_err(EngineError::internal)?,
                            rfc3339(now)?
                        ],
                    )
                    .map_err(db_err)?;
                    append_history(
                        &tx,
                        regulation.id.as_str(),
                        regulation.version,
                        ChangeKind::ReExtracted,
                        &format!(
                            "re-extracted version {}: requirement set changed ({} -> {})",
                            regulation.version,
                            existing.len(),
                            records.len()
                        ),
                        now,
                    )?;
                    ExtractionStatus::Replaced
                }
            }
        };

        tx.commit().map_err(db_err)?;
        tracing::info!(
            regulation = %regulation.id,
            version = regulation.version,
            records = records.len(),
            status = ?status,
            "stored extraction run"
        );
        Ok(status)
    }

    /// Requirement records derived from one regulation version, in extraction
    /// order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn requirements_for_version(
        &self,
        id: &RegulationId,
        version: u32,
    ) -> EngineResult<Vec<RequirementRecord>> {
        load_requirements(&self.conn, id, version)
    }

    /// Fetch one requirement record by identifier.
    ///
    /// # Errors
    /// Returns [`EngineError::NotFound`] when the identifier is unknown.
    pub fn get_requirement(&self, id: &RequirementId) -> EngineResult<RequirementRecord> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT requirement_id, regulation_id, regulation_version, seq,
                        text_raw, text_engineering, created_at
                 FROM requirements WHERE requirement_id = ?1",
            )
            .map_err(db_err)?;

        let record = stmt
            .query_row(params![id.as_str()], requirement_row)
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| EngineError::NotFound(format!("requirement {id} does not exist")))?;
        requirement_from_raw(record)
    }

    /// Ledger query: entries matching the filter, ordered by
    /// `(recorded_at, sequence)` ascending. Appends are monotonic in time, so
    /// the sequence order is exactly that total order. Repeated identical
    /// queries with no intervening writes yield identical rows.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn history(&self, filter: &HistoryFilter) -> EngineResult<Vec<HistoryEntry>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT sequence, recorded_at, subject_id, subject_version, change_type, summary
                 FROM history
                 WHERE (?1 IS NULL OR subject_id = ?1)
                 ORDER BY sequence ASC",
            )
            .map_err(db_err)?;

        let mut rows = stmt.query(params![filter.subject_id]).map_err(db_err)?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next().map_err(db_err)? {
            let entry = history_entry_from_row(row)?;
            if let Some(since) = filter.since {
                if entry.recorded_at < since {
                    continue;
                }
            }
            if let Some(until) = filter.until {
                if entry.recorded_at > until {
                    continue;
                }
            }
            entries.push(entry);
        }
        Ok(entries)
    }
}

/// Append one ledger row. Internal only: every caller is a mutating store
/// operation and the append shares that operation's transaction.
fn append_history(
    conn: &Connection,
    subject_id: &str,
    subject_version: u32,
    change: ChangeKind,
    summary: &str,
    recorded_at: OffsetDateTime,
) -> EngineResult<()> {
    conn.execute(
        "INSERT INTO history(recorded_at, subject_id, subject_version, change_type, summary)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![rfc3339(recorded_at)?, subject_id, subject_version, change.as_str(), summary],
    )
    .map_err(db_err)?;
    Ok(())
}

fn insert_regulation(conn: &Connection, regulation: &Regulation) -> EngineResult<()> {
    regulation.validate()?;
    conn.execute(
        "INSERT INTO regulations(
            regulation_id, version, country, source, title,
            published_at, created_at, fingerprint, body, url
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            regulation.id.as_str(),
            regulation.version,
            regulation.country,
            regulation.source.as_str(),
            regulation.title,
            rfc3339(regulation.published_at)?,
            rfc3339(regulation.created_at)?,
            regulation.fingerprint,
            regulation.text,
            regulation.url,
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

fn insert_requirements(conn: &Connection, records: &[RequirementRecord]) -> EngineResult<()> {
    for record in records {
        conn.execute(
            "INSERT INTO requirements(
                requirement_id, regulation_id, regulation_version, seq,
                text_raw, text_engineering, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.id.as_str(),
                record.regulation_id.as_str(),
                record.regulation_version,
                record.seq,
                record.text_raw,
                record.text_engineering,
                rfc3339(record.created_at)?,
            ],
        )
        .map_err(db_err)?;
    }
    Ok(())
}

fn regulation_from_draft(
    draft: &RegulationDraft,
    version: u32,
    fingerprint: &str,
    created_at: OffsetDateTime,
) -> Regulation {
    Regulation {
        id: draft.id.clone(),
        version,
        country: draft.country.clone(),
        source: draft.source,
        title: draft.title.clone(),
        published_at: draft.published_at,
        created_at,
        fingerprint: fingerprint.to_string(),
        text: draft.text.clone(),
        url: draft.url.clone(),
    }
}

struct RegulationRow {
    regulation_id: String,
    version: u32,
    country: String,
    source: String,
    title: String,
    published_at: String,
    created_at: String,
    fingerprint: String,
    body: String,
    url: Option<String>,
}

fn regulation_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RegulationRow> {
    Ok(RegulationRow {
        regulation_id: row.get(0)?,
        version: row.get(1)?,
        country: row.get(2)?,
        source: row.get(3)?,
        title: row.get(4)?,
        published_at: row.get(5)?,
        created_at: row.get(6)?,
        fingerprint: row.get(7)?,
        body: row.get(8)?,
        url: row.get(9)?,
    })
}

fn regulation_from_row(row: &rusqlite::Row<'_>) -> EngineResult<Regulation> {
    let raw = regulation_row(row).map_err(db_err)?;
    let source = SourceSystem::parse(&raw.source)
        .ok_or_else(|| EngineError::Internal(format!("unknown source system: {}", raw.source)))?;

    Ok(Regulation {
        id: RegulationId::new(raw.regulation_id),
        version: raw.version,
        country: raw.country,
        source,
        title: raw.title,
        published_at: parse_rfc3339(&raw.published_at)?,
        created_at: parse_rfc3339(&raw.created_at)?,
        fingerprint: raw.fingerprint,
        text: raw.body,
        url: raw.url,
    })
}

fn load_regulation(
    conn: &Connection,
    id: &RegulationId,
    version: u32,
) -> EngineResult<Regulation> {
    let mut stmt = conn
        .prepare(
            "SELECT regulation_id, version, country, source, title,
                    published_at, created_at, fingerprint, body, url
             FROM regulations WHERE regulation_id = ?1 AND version = ?2",
        )
        .map_err(db_err)?;

    let mut rows = stmt.query(params![id.as_str(), version]).map_err(db_err)?;
    match rows.next().map_err(db_err)? {
        Some(row) => regulation_from_row(row),
        None => Err(EngineError::NotFound(format!(
            "regulation {id} version {version} does not exist"
        ))),
    }
}

struct RequirementRow {
    requirement_id: String,
    regulation_id: String,
    regulation_version: u32,
    seq: u32,
    text_raw: String,
    text_engineering: String,
    created_at: String,
}

fn requirement_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RequirementRow> {
    Ok(RequirementRow {
        requirement_id: row.get(0)?,
        regulation_id: row.get(1)?,
        regulation_version: row.get(2)?,
        seq: row.get(3)?,
        text_raw: row.get(4)?,
        text_engineering: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn requirement_from_raw(raw: RequirementRow) -> EngineResult<RequirementRecord> {
    Ok(RequirementRecord {
        id: RequirementId::new(raw.requirement_id),
        regulation_id: RegulationId::new(raw.regulation_id),
        regulation_version: raw.regulation_version,
        seq: raw.seq,
        text_raw: raw.text_raw,
        text_engineering: raw.text_engineering,
        created_at: parse_rfc3339(&raw.created_at)?,
    })
}

fn load_requirements(
    conn: &Connection,
    id: &RegulationId,
    version: u32,
) -> EngineResult<Vec<RequirementRecord>> {
    let mut stmt = conn
        .prepare(
            "SELECT requirement_id, regulation_id, regulation_version, seq,
                    text_raw, text_engineering, created_at
             FROM requirements
             WHERE regulation_id = ?1 AND regulation_version = ?2
             ORDER BY seq ASC",
        )
        .map_err(db_err)?;

    let mut rows = stmt.query(params![id.as_str(), version]).map_err(db_err)?;
    let mut records = Vec::new();
    while let Some(row) = rows.next().map_err(db_err)? {
        records.push(requirement_from_raw(requirement_row(row).map_err(db_err)?)?);
    }
    Ok(records)
}

fn history_entry_from_row(row: &rusqlite::Row<'_>) -> EngineResult<HistoryEntry> {
    let sequence: i64 = row.get(0).map_err(db_err)?;
    let recorded_at: String = row.get(1).map_err(db_err)?;
    let subject_id: String = row.get(2).map_err(db_err)?;
    let subject_version: u32 = row.get(3).map_err(db_err)?;
    let change_type: String = row.get(4).map_err(db_err)?;
    let summary: String = row.get(5).map_err(db_err)?;

    Ok(HistoryEntry {
        sequence: u64::try_from(sequence).map_err(EngineError::internal)?,
        recorded_at: parse_rfc3339(&recorded_at)?,
        subject_id,
        subject_version,
        change: ChangeKind::parse(&change_type)
            .ok_or_else(|| EngineError::Internal(format!("unknown change type: {change_type}")))?,
        summary,
    })
}

fn current_schema_version(conn: &Connection) -> EngineResult<i64> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )
    .map_err(db_err)
}

fn rfc3339(value: OffsetDateTime) -> EngineResult<String> {
    value.format(&Rfc3339).map_err(EngineError::internal)
}

fn parse_rfc3339(value: &str) -> EngineResult<OffsetDateTime> {
    OffsetDateTime::parse(value, &Rfc3339).map_err(EngineError::internal)
}

fn db_err(err: rusqlite::Error) -> EngineError {
    if let rusqlite::Error::SqliteFailure(failure, _) = &err {
        match failure.code {
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked => {
                return EngineError::Busy(format!("database write lock unavailable: {err}"));
            }
            rusqlite::ErrorCode::ConstraintViolation => {
                return EngineError::Conflict(format!("concurrent write already landed: {err}"));
            }
            _ => {}
        }
    }
    EngineError::internal(err)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use regtrace_core::{
        extract_requirements, ChangeKind, ErrorKind, SentenceSegmenter, SourceSystem,
    };

    use super::*;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("regtrace-store-{}.sqlite3", ulid::Ulid::new()))
    }

    fn open_store(path: &Path) -> SqliteStore {
        let mut store = match SqliteStore::open(path) {
            Ok(store) => store,
            Err(err) => panic!("store should open: {err}"),
        };
        if let Err(err) = store.migrate() {
            panic!("migration should succeed: {err}");
        }
        store
    }

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + time::Duration::seconds(1_700_000_000)
    }

    fn mk_draft(id: &str, text: &str) -> RegulationDraft {
        RegulationDraft {
            id: RegulationId::new(id),
            country: "EU".to_string(),
            source: SourceSystem::Manual,
            title: format!("Regulation {id}"),
            published_at: fixture_time(),
            text: text.to_string(),
            url: None,
        }
    }

    fn ingest(store: &mut SqliteStore, draft: &RegulationDraft) -> (Regulation, bool) {
        match store.ingest(draft) {
            Ok(result) => result,
            Err(err) => panic!("ingest should succeed: {err}"),
        }
    }

    fn history_all(store: &SqliteStore) -> Vec<HistoryEntry> {
        match store.history(&HistoryFilter::default()) {
            Ok(entries) => entries,
            Err(err) => panic!("history query should succeed: {err}"),
        }
    }

    #[test]
    fn initial_ingest_creates_version_one_with_imported_entry() {
        let db_path = unique_temp_db_path();
        let mut store = open_store(&db_path);

        let draft = mk_draft("EU-BATT-2023", "Batteries must be traceable by QR code.");
        let (regulation, is_new_version) = ingest(&mut store, &draft);

        assert!(is_new_version);
        assert_eq!(regulation.version, 1);
        assert_eq!(regulation.fingerprint, draft.fingerprint());

        let entries = history_all(&store);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].change, ChangeKind::Imported);
        assert_eq!(entries[0].subject_id, "EU-BATT-2023");
        assert_eq!(entries[0].subject_version, 1);

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn reingest_of_identical_text_is_a_no_op() {
        let db_path = unique_temp_db_path();
        let mut store = open_store(&db_path);

        let draft = mk_draft("EU-BATT-2023", "Batteries must be traceable by QR code.");
        ingest(&mut store, &draft);
        let (regulation, is_new_version) = ingest(&mut store, &draft);

        assert!(!is_new_version);
        assert_eq!(regulation.version, 1);
        assert_eq!(history_all(&store).len(), 1);

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn text_drift_creates_version_two_and_keeps_version_one_immutable() {
        let db_path = unique_temp_db_path();
        let mut store = open_store(&db_path);

        let original_text = "Batteries must be traceable by QR code.";
        ingest(&mut store, &mk_draft("EU-BATT-2023", original_text));
        let (regulation, is_new_version) = ingest(
            &mut store,
            &mk_draft(
                "EU-BATT-2023",
                "Batteries must be traceable by QR code and carbon footprint disclosed.",
            ),
        );

        assert!(is_new_version);
        assert_eq!(regulation.version, 2);

        let entries = history_all(&store);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].change, ChangeKind::ReVersioned);
        assert_eq!(entries[1].subject_version, 2);

        let first = match store.get_version(&RegulationId::new("EU-BATT-2023"), 1) {
            Ok(regulation) => regulation,
            Err(err) => panic!("version 1 should still exist: {err}"),
        };
        assert_eq!(first.text, original_text);

        let latest = match store.get(&RegulationId::new("EU-BATT-2023")) {
            Ok(regulation) => regulation,
            Err(err) => panic!("latest lookup should succeed: {err}"),
        };
        assert_eq!(latest.version, 2);

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn version_numbers_increase_strictly_with_no_gaps() {
        let db_path = unique_temp_db_path();
        let mut store = open_store(&db_path);

        let id = RegulationId::new("UN-R155");
        for (index, text) in [
            "A cybersecurity management system shall be established.",
            "A cybersecurity management system shall be established and audited.",
            "A cybersecurity management system shall be established, audited, and monitored.",
        ]
        .iter()
        .enumerate()
        {
            let (regulation, is_new_version) = ingest(&mut store, &mk_draft("UN-R155", text));
            assert!(is_new_version);
            let expected = u32::try_from(index).map_or(u32::MAX, |index| index + 1);
            assert_eq!(regulation.version, expected);
        }

        for version in 1..=3 {
            let regulation = match store.get_version(&id, version) {
                Ok(regulation) => regulation,
                Err(err) => panic!("version {version} should exist: {err}"),
            };
            assert_eq!(regulation.version, version);
        }
        assert_eq!(
            store.get_version(&id, 4).map(|r| r.version).err().map(|err| err.kind()),
            Some(ErrorKind::NotFound)
        );

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn list_returns_latest_versions_in_stable_order() {
        let db_path = unique_temp_db_path();
        let mut store = open_store(&db_path);

        ingest(&mut store, &mk_draft("UN-R156", "Software updates must remain traceable."));
        ingest(&mut store, &mk_draft("EU-BATT-2023", "Batteries must be traceable by QR code."));
        ingest(
            &mut store,
            &mk_draft("EU-BATT-2023", "Batteries must be traceable by QR code and recycled."),
        );

        let first = match store.list() {
            Ok(list) => list,
            Err(err) => panic!("list should succeed: {err}"),
        };
        let second = match store.list() {
            Ok(list) => list,
            Err(err) => panic!("list should succeed: {err}"),
        };

        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].id.as_str(), "EU-BATT-2023");
        assert_eq!(first[0].version, 2);
        assert_eq!(first[1].id.as_str(), "UN-R156");

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn list_filtered_narrows_by_country_and_needle() {
        let db_path = unique_temp_db_path();
        let mut store = open_store(&db_path);

        ingest(&mut store, &mk_draft("EU-BATT-2023", "Batteries must be traceable by QR code."));
        let mut us_draft = mk_draft("US-FR-2023-1", "Electric shock protection must be ensured.");
        us_draft.country = "USA".to_string();
        ingest(&mut store, &us_draft);

        let by_country = match store.list_filtered(Some("usa"), None, None) {
            Ok(list) => list,
            Err(err) => panic!("filtered list should succeed: {err}"),
        };
        assert_eq!(by_country.len(), 1);
        assert_eq!(by_country[0].id.as_str(), "US-FR-2023-1");

        let by_needle = match store.list_filtered(None, None, Some("qr code")) {
            Ok(list) => list,
            Err(err) => panic!("filtered list should succeed: {err}"),
        };
        assert_eq!(by_needle.len(), 1);
        assert_eq!(by_needle[0].id.as_str(), "EU-BATT-2023");

        let by_source = match store.list_filtered(None, Some(SourceSystem::EurLex), None) {
            Ok(list) => list,
            Err(err) => panic!("filtered list should succeed: {err}"),
        };
        assert!(by_source.is_empty());

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn extraction_runs_are_idempotent_per_version() {
        let db_path = unique_temp_db_path();
        let mut store = open_store(&db_path);

        let draft = mk_draft(
            "EU-BATT-2023",
            "Batteries must be traceable by QR code. Manufacturers shall disclose the carbon footprint.",
        );
        let (regulation, _) = ingest(&mut store, &draft);
        let records = match extract_requirements(&regulation, &SentenceSegmenter, fixture_time()) {
            Ok(records) => records,
            Err(err) => panic!("extraction should succeed: {err}"),
        };
        assert_eq!(records.len(), 2);

        let status = match store.store_extraction(&regulation, &records) {
            Ok(status) => status,
            Err(err) => panic!("first extraction run should store: {err}"),
        };
        assert_eq!(status, ExtractionStatus::Initial);

        let status = match store.store_extraction(&regulation, &records) {
            Ok(status) => status,
            Err(err) => panic!("second extraction run should store: {err}"),
        };
        assert_eq!(status, ExtractionStatus::Unchanged);

        let entries = history_all(&store);
        let extraction_entries = entries
            .iter()
            .filter(|entry| entry.change == ChangeKind::Extracted)
            .count();
        assert_eq!(extraction_entries, 1);
        assert!(!entries.iter().any(|entry| entry.change == ChangeKind::ReExtracted));

        let stored = match store
            .requirements_for_version(&regulation.id, regulation.version)
        {
            Ok(stored) => stored,
            Err(err) => panic!("requirement load should succeed: {err}"),
        };
        assert_eq!(stored, records);

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn changed_extraction_content_replaces_records_and_appends_once() {
        let db_path = unique_temp_db_path();
        let mut store = open_store(&db_path);

        let (regulation, _) = ingest(
            &mut store,
            &mk_draft("EU-BATT-2023", "Batteries must be traceable by QR code."),
        );
        let records = match extract_requirements(&regulation, &SentenceSegmenter, fixture_time()) {
            Ok(records) => records,
            Err(err) => panic!("extraction should succeed: {err}"),
        };
        if let Err(err) = store.store_extraction(&regulation, &records) {
            panic!("first run should store: {err}");
        }

        // a revised heuristic producing different engineering text
        let mut revised = records.clone();
        revised[0].text_engineering = "Battery units must carry a scannable QR code.".to_string();

        let status = match store.store_extraction(&regulation, &revised) {
            Ok(status) => status,
            Err(err) => panic!("replacement run should store: {err}"),
        };
        assert_eq!(status, ExtractionStatus::Replaced);

        let stored = match store
            .requirements_for_version(&regulation.id, regulation.version)
        {
            Ok(stored) => stored,
            Err(err) => panic!("requirement load should succeed: {err}"),
        };
        assert_eq!(stored, revised);

        let re_extracted = history_all(&store)
            .iter()
            .filter(|entry| entry.change == ChangeKind::ReExtracted)
            .count();
        assert_eq!(re_extracted, 1);

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn empty_extraction_is_materialized_once() {
        let db_path = unique_temp_db_path();
        let mut store = open_store(&db_path);

        let (regulation, _) = ingest(
            &mut store,
            &mk_draft("EU-PREAMBLE-1", "This regulation lays down definitions."),
        );

        let status = match store.store_extraction(&regulation, &[]) {
            Ok(status) => status,
            Err(err) => panic!("empty run should store: {err}"),
        };
        assert_eq!(status, ExtractionStatus::Initial);

        let status = match store.store_extraction(&regulation, &[]) {
            Ok(status) => status,
            Err(err) => panic!("repeat empty run should store: {err}"),
        };
        assert_eq!(status, ExtractionStatus::Unchanged);

        let extracted_entries = history_all(&store)
            .iter()
            .filter(|entry| entry.change == ChangeKind::Extracted)
            .count();
        assert_eq!(extracted_entries, 1);

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn extraction_for_unknown_version_is_not_found() {
        let db_path = unique_temp_db_path();
        let mut store = open_store(&db_path);

        let (mut regulation, _) = ingest(
            &mut store,
            &mk_draft("EU-BATT-2023", "Batteries must be traceable by QR code."),
        );
        regulation.version = 7;

        let err = match store.store_extraction(&regulation, &[]) {
            Ok(status) => panic!("unknown version should fail, got {status:?}"),
            Err(err) => err,
        };
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn history_is_ordered_filterable_and_restartable() {
        let db_path = unique_temp_db_path();
        let mut store = open_store(&db_path);

        ingest(&mut store, &mk_draft("EU-BATT-2023", "Batteries must be traceable by QR code."));
        ingest(&mut store, &mk_draft("UN-R155", "A CSMS shall be established."));
        ingest(
            &mut store,
            &mk_draft("EU-BATT-2023", "Batteries must be traceable and carbon disclosed."),
        );

        let all = history_all(&store);
        assert_eq!(all.len(), 3);
        for pair in all.windows(2) {
            assert!(pair[0].sequence < pair[1].sequence);
            assert!(pair[0].recorded_at <= pair[1].recorded_at);
        }

        let filter = HistoryFilter {
            subject_id: Some("EU-BATT-2023".to_string()),
            ..HistoryFilter::default()
        };
        let filtered = match store.history(&filter) {
            Ok(entries) => entries,
            Err(err) => panic!("filtered history should succeed: {err}"),
        };
        assert_eq!(filtered.len(), 2);
        assert!(filtered.iter().all(|entry| entry.subject_id == "EU-BATT-2023"));

        let replay = match store.history(&filter) {
            Ok(entries) => entries,
            Err(err) => panic!("filtered history should succeed: {err}"),
        };
        assert_eq!(filtered, replay);

        let future_only = HistoryFilter {
            since: Some(OffsetDateTime::now_utc() + time::Duration::days(1)),
            ..HistoryFilter::default()
        };
        let empty = match store.history(&future_only) {
            Ok(entries) => entries,
            Err(err) => panic!("since-filtered history should succeed: {err}"),
        };
        assert!(empty.is_empty());

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn unknown_requirement_lookup_is_not_found() {
        let db_path = unique_temp_db_path();
        let store = open_store(&db_path);

        let err = match store.get_requirement(&RequirementId::new("EU-BATT-2023-v1-R001")) {
            Ok(record) => panic!("lookup should fail, got {}", record.id),
            Err(err) => err,
        };
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn blank_draft_is_rejected_before_any_write() {
        let db_path = unique_temp_db_path();
        let mut store = open_store(&db_path);

        let mut draft = mk_draft("EU-BLANK-1", "content pending");
        draft.text = "   ".to_string();

        assert!(store.ingest(&draft).is_err());
        assert!(history_all(&store).is_empty());

        let _ = std::fs::remove_file(&db_path);
    }
}
