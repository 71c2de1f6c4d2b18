use crate::error::AppResult;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::functions::FunctionFlags;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

/// Fresh stable identity for any row
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Timestamps are stored as fixed-width RFC 3339 text so they sort lexically
pub fn to_db_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn now_db_time() -> String {
    to_db_time(Utc::now())
}

pub fn parse_db_time(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Row mapping for a timestamp column; unparsable text is a conversion failure
pub(crate) fn time_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_db_time(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("invalid timestamp: {}", raw).into(),
        )
    })
}

pub(crate) fn opt_time_column(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    Ok(raw.as_deref().and_then(parse_db_time))
}

/// Step log entry. Multi-step operations that cannot share one transaction
/// (object store + database) append one event per step.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: new_id(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

/// `unicode_lower(text)`: full Unicode lowercase, since SQLite's LIKE only
/// folds ASCII. NULL stays NULL.
pub fn register_functions(conn: &Connection) -> AppResult<()> {
    conn.create_scalar_function(
        "unicode_lower",
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let value: Option<String> = ctx.get(0)?;
            Ok(value.map(|v| v.to_lowercase()))
        },
    )?;
    Ok(())
}

pub fn setup_database(conn: &Connection) -> AppResult<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    register_functions(conn)?;

    // ==========================================================================
    // Profiles & sessions
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS profiles (
            id TEXT PRIMARY KEY,
            email TEXT UNIQUE NOT NULL,
            full_name TEXT NOT NULL DEFAULT '',
            company_name TEXT NOT NULL DEFAULT '',
            role TEXT NOT NULL DEFAULT 'client',
            password_hash TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sessions (
            token TEXT PRIMARY KEY,
            user_id TEXT NOT NULL REFERENCES profiles(id) ON DELETE CASCADE,
            created_at TEXT NOT NULL,
            expires_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Client relationships (invitations)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS client_relationships (
            id TEXT PRIMARY KEY,
            accountant_id TEXT NOT NULL REFERENCES profiles(id) ON DELETE CASCADE,
            client_id TEXT REFERENCES profiles(id) ON DELETE SET NULL,
            invited_email TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            invite_token TEXT UNIQUE,
            invited_at TEXT NOT NULL,
            expires_at TEXT NOT NULL,
            accepted_at TEXT
        )",
        [],
    )?;

    // ==========================================================================
    // Files & records
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS files (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL REFERENCES profiles(id) ON DELETE CASCADE,
            file_name TEXT NOT NULL,
            storage_path TEXT UNIQUE NOT NULL,
            file_size INTEGER NOT NULL,
            file_type TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'uploaded',
            record_count INTEGER NOT NULL DEFAULT 0,
            error_message TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            processed_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS records (
            id TEXT PRIMARY KEY,
            file_id TEXT NOT NULL REFERENCES files(id) ON DELETE CASCADE,
            owner_id TEXT NOT NULL,
            row_number INTEGER NOT NULL,
            nalog TEXT,
            data TEXT,
            valuta TEXT,
            m_ddv TEXT,
            opis TEXT,
            zatvoranje TEXT,
            zabeleska TEXT,
            dolguja TEXT,
            pobaruva TEXT,
            invoice_number TEXT,
            edin TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Merge jobs
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS merge_jobs (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL REFERENCES profiles(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            output_file_id TEXT REFERENCES files(id) ON DELETE SET NULL,
            error_message TEXT,
            created_at TEXT NOT NULL,
            completed_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS merge_job_files (
            merge_job_id TEXT NOT NULL REFERENCES merge_jobs(id) ON DELETE CASCADE,
            file_id TEXT NOT NULL REFERENCES files(id) ON DELETE CASCADE,
            order_index INTEGER NOT NULL,
            PRIMARY KEY (merge_job_id, file_id)
        )",
        [],
    )?;

    // ==========================================================================
    // Events Table (step log / audit trail)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_records_file ON records(file_id);
         CREATE INDEX IF NOT EXISTS idx_records_owner_data ON records(owner_id, data);
         CREATE INDEX IF NOT EXISTS idx_files_owner ON files(owner_id, created_at);
         CREATE INDEX IF NOT EXISTS idx_relationships_accountant ON client_relationships(accountant_id, invited_at);
         CREATE INDEX IF NOT EXISTS idx_merge_jobs_owner ON merge_jobs(owner_id, created_at);
         CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id);",
    )?;

    log::debug!("Database schema ready");
    Ok(())
}

/// Insert event into the step log
pub fn insert_event(conn: &Connection, event: &Event) -> AppResult<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            to_db_time(event.timestamp),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

/// Append a step to the log without failing the surrounding operation
pub(crate) fn log_step(
    conn: &Connection,
    event_type: &str,
    entity_type: &str,
    entity_id: &str,
    data: serde_json::Value,
    actor: &str,
) {
    let event = Event::new(event_type, entity_type, entity_id, data, actor);
    if let Err(e) = insert_event(conn, &event) {
        log::warn!("Failed to record {} step for {}: {}", event_type, entity_id, e);
    }
}

/// Get events for a specific entity, oldest first
pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> AppResult<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY id ASC",
    )?;

    let events = stmt
        .query_map(params![entity_type, entity_id], |row| {
            let data_json: String = row.get(5)?;

            Ok(Event {
                event_id: row.get(0)?,
                timestamp: time_column(row, 1)?,
                event_type: row.get(2)?,
                entity_type: row.get(3)?,
                entity_id: row.get(4)?,
                data: serde_json::from_str(&data_json).unwrap_or(serde_json::Value::Null),
                actor: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        setup_database(&conn).unwrap();

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
                 AND name IN ('profiles', 'sessions', 'client_relationships', 'files',
                              'records', 'merge_jobs', 'merge_job_files', 'events')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 8);
    }

    #[test]
    fn test_unicode_lower() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        let lowered: String = conn
            .query_row("SELECT unicode_lower('Плаќање ФАКТУРА')", [], |row| row.get(0))
            .unwrap();
        assert_eq!(lowered, "плаќање фактура");

        let null: Option<String> = conn
            .query_row("SELECT unicode_lower(NULL)", [], |row| row.get(0))
            .unwrap();
        assert_eq!(null, None);
    }

    #[test]
    fn test_event_log() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        let event = Event::new(
            "object_written",
            "file",
            "file_123",
            serde_json::json!({"path": "u/1_a.csv"}),
            "user_1",
        );
        insert_event(&conn, &event).unwrap();
        log_step(&conn, "row_inserted", "file", "file_123", serde_json::json!({}), "user_1");

        let events = get_events_for_entity(&conn, "file", "file_123").unwrap();

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "object_written");
        assert_eq!(events[0].data["path"], "u/1_a.csv");
        assert_eq!(events[1].event_type, "row_inserted");
    }

    #[test]
    fn test_db_time_round_trip_sorts_lexically() {
        let earlier = parse_db_time("2026-01-01T00:00:00.000Z").unwrap();
        let later = earlier + chrono::Duration::seconds(1);

        assert!(to_db_time(earlier) < to_db_time(later));
        assert_eq!(parse_db_time(&to_db_time(later)), Some(later));
    }
}
