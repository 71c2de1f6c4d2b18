// 📁 Files - upload gate, storage keys, file rows
//
// Upload is two steps that cannot share a transaction:
//   1. write bytes to the object store (no overwrite)
//   2. insert the `files` row
// If step 2 fails the object is removed again. Every step lands in the
// events log, so an object orphaned by a crash between the steps can be found.

use crate::auth::Session;
use crate::db::{log_step, new_id, now_db_time, opt_time_column, time_column};
use crate::error::{not_found_on_empty, AppError, AppResult};
use crate::storage::{ObjectStore, SIGNED_URL_TTL_SECS, UPLOADS_BUCKET};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ToSql};
use serde::{Deserialize, Serialize};

pub const MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;
pub const ALLOWED_TYPES: [&str; 4] = ["xlsx", "xls", "csv", "pdf"];

// ============================================================================
// FILE STATUS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Uploaded,
    Processing,
    Processed,
    Error,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Uploaded => "uploaded",
            FileStatus::Processing => "processing",
            FileStatus::Processed => "processed",
            FileStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<FileStatus> {
        match value {
            "uploaded" => Some(FileStatus::Uploaded),
            "processing" => Some(FileStatus::Processing),
            "processed" => Some(FileStatus::Processed),
            "error" => Some(FileStatus::Error),
            _ => None,
        }
    }
}

// ============================================================================
// FILE ROW
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRow {
    pub id: String,
    pub owner_id: String,
    pub file_name: String,
    pub storage_path: String,
    pub file_size: i64,
    pub file_type: String,
    pub status: FileStatus,
    pub record_count: i64,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

pub(crate) const FILE_COLUMNS: &str = "id, owner_id, file_name, storage_path, file_size, file_type, \
     status, record_count, error_message, created_at, updated_at, processed_at";

pub(crate) fn file_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileRow> {
    let status: String = row.get(6)?;
    Ok(FileRow {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        file_name: row.get(2)?,
        storage_path: row.get(3)?,
        file_size: row.get(4)?,
        file_type: row.get(5)?,
        status: FileStatus::parse(&status).unwrap_or(FileStatus::Error),
        record_count: row.get(7)?,
        error_message: row.get(8)?,
        created_at: time_column(row, 9)?,
        updated_at: time_column(row, 10)?,
        processed_at: opt_time_column(row, 11)?,
    })
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileFilters {
    #[serde(default)]
    pub status: Option<FileStatus>,
    #[serde(default)]
    pub file_type: Option<String>,
}

// ============================================================================
// VALIDATION & STORAGE KEYS
// ============================================================================

/// Text after the last '.', lowercased. A name without dots is its own "extension".
pub fn file_extension(name: &str) -> Option<String> {
    name.rsplit('.')
        .next()
        .filter(|ext| !ext.is_empty())
        .map(|ext| ext.to_lowercase())
}

/// Check size and type; every violation is reported, not just the first
pub fn validate_file(name: &str, size: u64) -> AppResult<()> {
    let mut errors = Vec::new();

    if size > MAX_FILE_SIZE {
        errors.push("File size exceeds 10MB limit");
    }

    let allowed = file_extension(name)
        .map(|ext| ALLOWED_TYPES.contains(&ext.as_str()))
        .unwrap_or(false);
    if !allowed {
        errors.push("Only Excel (.xlsx, .xls), CSV, and PDF files are allowed");
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(AppError::validation(errors))
    }
}

/// Filesystem-safe ASCII name: base sanitized, extension kept (lowercased)
pub fn sanitize_filename(filename: &str) -> String {
    // A dot at index 0 marks a hidden file, not an extension
    let (name, ext) = match filename.rfind('.') {
        Some(dot) if dot > 0 => (&filename[..dot], &filename[dot..]),
        _ => (filename, ""),
    };

    let mut sanitized = String::with_capacity(name.len());
    for c in name.chars() {
        let keep = c.is_ascii_alphanumeric() || c == '_' || c == '-';
        let mapped = if keep { c } else { '_' };
        if mapped == '_' && sanitized.ends_with('_') {
            continue;
        }
        sanitized.push(mapped);
    }

    let trimmed = sanitized
        .strip_prefix('_')
        .unwrap_or(&sanitized);
    let trimmed = trimmed.strip_suffix('_').unwrap_or(trimmed);

    let base = if trimmed.is_empty() { "file" } else { trimmed };
    format!("{}{}", base, ext.to_lowercase())
}

/// `{owner}/{millis}_{sanitized name}`
pub fn storage_path(owner_id: &str, timestamp_millis: i64, filename: &str) -> String {
    format!(
        "{}/{}_{}",
        owner_id,
        timestamp_millis,
        sanitize_filename(filename)
    )
}

// ============================================================================
// OPERATIONS
// ============================================================================

pub fn upload_file(
    conn: &Connection,
    store: &dyn ObjectStore,
    session: &Session,
    file_name: &str,
    bytes: &[u8],
) -> AppResult<FileRow> {
    validate_file(file_name, bytes.len() as u64)?;

    let owner_id = session.user_id();
    let file_type = file_extension(file_name).unwrap_or_default();
    let path = storage_path(owner_id, Utc::now().timestamp_millis(), file_name);
    let id = new_id();

    store.upload(UPLOADS_BUCKET, &path, bytes)?;
    log_step(
        conn,
        "object_written",
        "file",
        &id,
        serde_json::json!({ "bucket": UPLOADS_BUCKET, "path": path }),
        owner_id,
    );

    let now = now_db_time();
    let inserted = conn.execute(
        "INSERT INTO files (id, owner_id, file_name, storage_path, file_size, file_type,
                            status, record_count, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'uploaded', 0, ?7, ?7)",
        params![id, owner_id, file_name, path, bytes.len() as i64, file_type, now],
    );

    if let Err(db_error) = inserted {
        log::warn!("File row insert failed for {}, removing object: {}", path, db_error);
        match store.remove(UPLOADS_BUCKET, &[path.as_str()]) {
            Ok(()) => log_step(
                conn,
                "object_removed",
                "file",
                &id,
                serde_json::json!({ "bucket": UPLOADS_BUCKET, "path": path }),
                owner_id,
            ),
            Err(e) => log::error!("Orphaned object {}/{}: {}", UPLOADS_BUCKET, path, e),
        }
        return Err(db_error.into());
    }

    log_step(conn, "row_inserted", "file", &id, serde_json::json!({}), owner_id);
    log::info!("Uploaded {} as {}", file_name, path);
    get_file(conn, session, &id)
}

pub fn list_files(
    conn: &Connection,
    session: &Session,
    filters: &FileFilters,
) -> AppResult<Vec<FileRow>> {
    let mut sql = format!("SELECT {} FROM files WHERE owner_id = ?", FILE_COLUMNS);
    let owner_id = session.user_id().to_string();
    let status = filters.status.map(|s| s.as_str().to_string());
    let mut args: Vec<&dyn ToSql> = vec![&owner_id];

    if let Some(status) = status.as_ref() {
        sql.push_str(" AND status = ?");
        args.push(status);
    }
    if let Some(file_type) = filters.file_type.as_ref() {
        sql.push_str(" AND file_type = ?");
        args.push(file_type);
    }
    sql.push_str(" ORDER BY created_at DESC");

    let mut stmt = conn.prepare(&sql)?;
    let files = stmt
        .query_map(args.as_slice(), file_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(files)
}

/// Load a row without any ownership check
pub(crate) fn load_file(conn: &Connection, file_id: &str) -> AppResult<FileRow> {
    conn.query_row(
        &format!("SELECT {} FROM files WHERE id = ?1", FILE_COLUMNS),
        [file_id],
        file_from_row,
    )
    .map_err(|e| not_found_on_empty(e, &format!("file {}", file_id)))
}

pub fn get_file(conn: &Connection, session: &Session, file_id: &str) -> AppResult<FileRow> {
    let file = load_file(conn, file_id)?;
    session.require_owner(&file.owner_id)?;
    Ok(file)
}

/// Delete the stored object, then the row (records cascade)
pub fn delete_file(
    conn: &Connection,
    store: &dyn ObjectStore,
    session: &Session,
    file_id: &str,
) -> AppResult<()> {
    let file = get_file(conn, session, file_id)?;

    store.remove(bucket_for(&file), &[file.storage_path.as_str()])?;
    conn.execute("DELETE FROM files WHERE id = ?1", [file_id])?;

    log::info!("Deleted file {} ({})", file.file_name, file.id);
    Ok(())
}

pub fn file_download_url(
    conn: &Connection,
    store: &dyn ObjectStore,
    session: &Session,
    file_id: &str,
) -> AppResult<String> {
    let file = get_file(conn, session, file_id)?;
    store.signed_url(bucket_for(&file), &file.storage_path, SIGNED_URL_TTL_SECS)
}

/// Exports live in their own bucket under `{owner}/exports/`
pub(crate) fn bucket_for(file: &FileRow) -> &'static str {
    if file.storage_path.contains("/exports/") {
        crate::storage::EXPORTS_BUCKET
    } else {
        UPLOADS_BUCKET
    }
}

/// Set status; `processed_at` is stamped when the file becomes `processed`
pub fn update_file_status(
    conn: &Connection,
    file_id: &str,
    status: FileStatus,
    record_count: Option<i64>,
    error_message: Option<&str>,
) -> AppResult<FileRow> {
    let now = now_db_time();
    let processed_at = (status == FileStatus::Processed).then(|| now.clone());

    let updated = conn.execute(
        "UPDATE files
         SET status = ?1,
             record_count = COALESCE(?2, record_count),
             error_message = ?3,
             processed_at = COALESCE(?4, processed_at),
             updated_at = ?5
         WHERE id = ?6",
        params![status.as_str(), record_count, error_message, processed_at, now, file_id],
    )?;
    if updated == 0 {
        return Err(AppError::NotFound(format!("file {}", file_id)));
    }

    log::debug!("File {} is now {}", file_id, status.as_str());
    load_file(conn, file_id)
}
