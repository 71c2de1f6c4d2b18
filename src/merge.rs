// 🔀 Merge Jobs - combine records of several files into one ledger view
//
// A job references at least two distinct files owned by the accountant.
// The merged view is every record of those files, sorted by date, with
// per-source totals and invoice numbers that appear more than once.

use crate::auth::{Role, Session};
use crate::csv_export::{write_csv, MERGE_HEADERS};
use crate::db::{log_step, new_id, now_db_time, opt_time_column, time_column};
use crate::error::{not_found_on_empty, AppError, AppResult};
use crate::files::{get_file, load_file, sanitize_filename, FileRow, FileStatus};
use crate::ledger::{parse_amount, SourceTotals};
use crate::records::{record_from_row, Record, RECORD_COLUMNS};
use crate::storage::{ObjectStore, EXPORTS_BUCKET};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

pub const MIN_MERGE_FILES: usize = 2;
pub const UNKNOWN_SOURCE: &str = "Unknown";

// ============================================================================
// JOB TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeJobStatus {
    Pending,
    Completed,
    Failed,
}

impl MergeJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeJobStatus::Pending => "pending",
            MergeJobStatus::Completed => "completed",
            MergeJobStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<MergeJobStatus> {
        match value {
            "pending" => Some(MergeJobStatus::Pending),
            "completed" => Some(MergeJobStatus::Completed),
            "failed" => Some(MergeJobStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeJob {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub status: MergeJobStatus,
    pub output_file_id: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A file referenced by a job, in merge order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MergeJobFile {
    pub file_id: String,
    pub order_index: i64,
    pub file_name: Option<String>,
    pub record_count: i64,
    pub status: Option<FileStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeJobDetail {
    #[serde(flatten)]
    pub job: MergeJob,
    pub files: Vec<MergeJobFile>,
    pub output_file: Option<FileRow>,
}

/// Record of a merge result, tagged with its source file name
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MergedRecord {
    #[serde(flatten)]
    pub record: Record,
    pub file_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeStats {
    pub total_records: usize,
    pub total_dolguja: f64,
    pub total_pobaruva: f64,
    pub balance: f64,
    /// Keyed by source display name; files sharing a name share an entry
    pub by_source: BTreeMap<String, SourceTotals>,
    pub overlap_count: usize,
    pub overlapping_invoices: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeResult {
    pub job: MergeJobDetail,
    pub records: Vec<MergedRecord>,
    pub stats: MergeStats,
}

const JOB_COLUMNS: &str =
    "id, owner_id, name, status, output_file_id, error_message, created_at, completed_at";

fn job_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MergeJob> {
    let status: String = row.get(3)?;
    Ok(MergeJob {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        name: row.get(2)?,
        status: MergeJobStatus::parse(&status).unwrap_or(MergeJobStatus::Failed),
        output_file_id: row.get(4)?,
        error_message: row.get(5)?,
        created_at: time_column(row, 6)?,
        completed_at: opt_time_column(row, 7)?,
    })
}

// ============================================================================
// STATISTICS
// ============================================================================

/// Aggregate a merged record set. Never fails: unparsable amounts count as zero.
pub fn calculate_merge_stats(records: &[MergedRecord], job_files: &[MergeJobFile]) -> MergeStats {
    let names: HashMap<&str, &str> = job_files
        .iter()
        .filter_map(|f| f.file_name.as_deref().map(|n| (f.file_id.as_str(), n)))
        .collect();

    let mut stats = MergeStats::default();
    let mut invoice_counts: HashMap<&str, usize> = HashMap::new();
    let mut first_seen: Vec<&str> = Vec::new();

    for merged in records {
        let dolguja = merged.record.debit();
        let pobaruva = merged.record.credit();

        stats.total_records += 1;
        stats.total_dolguja += dolguja;
        stats.total_pobaruva += pobaruva;

        let source = merged
            .file_name
            .as_deref()
            .or_else(|| names.get(merged.record.file_id.as_str()).copied())
            .unwrap_or(UNKNOWN_SOURCE);
        stats
            .by_source
            .entry(source.to_string())
            .or_default()
            .add(dolguja, pobaruva);

        if let Some(invoice) = merged.record.invoice_number.as_deref() {
            if !invoice.is_empty() {
                let count = invoice_counts.entry(invoice).or_insert(0);
                if *count == 0 {
                    first_seen.push(invoice);
                }
                *count += 1;
            }
        }
    }

    stats.balance = stats.total_pobaruva - stats.total_dolguja;
    stats.overlapping_invoices = first_seen
        .into_iter()
        .filter(|invoice| invoice_counts.get(invoice).copied().unwrap_or(0) > 1)
        .map(|invoice| invoice.to_string())
        .collect();
    stats.overlap_count = stats.overlapping_invoices.len();

    stats
}

// ============================================================================
// JOB OPERATIONS
// ============================================================================

pub fn default_job_name(now: DateTime<Utc>) -> String {
    format!("Merge {}", now.format("%d.%m.%Y"))
}

fn validate_file_ids(file_ids: &[String]) -> AppResult<()> {
    let mut problems = Vec::new();
    if file_ids.len() < MIN_MERGE_FILES {
        problems.push(format!("Select at least {} files to merge", MIN_MERGE_FILES));
    }
    let unique: HashSet<&str> = file_ids.iter().map(|s| s.as_str()).collect();
    if unique.len() != file_ids.len() {
        problems.push("Each file can only be selected once".to_string());
    }
    if problems.is_empty() {
        Ok(())
    } else {
        Err(AppError::validation(problems))
    }
}

/// Create a job over `file_ids` (merge order = slice order).
/// Job and join rows are written in one transaction.
pub fn create_merge_job(
    conn: &mut Connection,
    session: &Session,
    name: Option<&str>,
    file_ids: &[String],
) -> AppResult<MergeJobDetail> {
    session.require_role(Role::Accountant)?;
    validate_file_ids(file_ids)?;
    for file_id in file_ids {
        get_file(conn, session, file_id)?;
    }

    let name = match name.map(str::trim) {
        Some(n) if !n.is_empty() => n.to_string(),
        _ => default_job_name(Utc::now()),
    };
    let id = new_id();

    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO merge_jobs (id, owner_id, name, status, created_at)
         VALUES (?1, ?2, ?3, 'pending', ?4)",
        params![id, session.user_id(), name, now_db_time()],
    )?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO merge_job_files (merge_job_id, file_id, order_index) VALUES (?1, ?2, ?3)",
        )?;
        for (index, file_id) in file_ids.iter().enumerate() {
            stmt.execute(params![id, file_id, index as i64])?;
        }
    }
    tx.commit()?;

    log::info!("Created merge job {} over {} files", id, file_ids.len());
    load_job_detail(conn, &id)
}

fn load_job(conn: &Connection, job_id: &str) -> AppResult<MergeJob> {
    conn.query_row(
        &format!("SELECT {} FROM merge_jobs WHERE id = ?1", JOB_COLUMNS),
        [job_id],
        job_from_row,
    )
    .map_err(|e| not_found_on_empty(e, &format!("merge job {}", job_id)))
}

fn owned_job(conn: &Connection, session: &Session, job_id: &str) -> AppResult<MergeJob> {
    session.require_role(Role::Accountant)?;
    let job = load_job(conn, job_id)?;
    session.require_owner(&job.owner_id)?;
    Ok(job)
}

fn load_job_files(conn: &Connection, job_id: &str) -> AppResult<Vec<MergeJobFile>> {
    let mut stmt = conn.prepare(
        "SELECT mjf.file_id, mjf.order_index, f.file_name, COALESCE(f.record_count, 0), f.status
         FROM merge_job_files mjf
         LEFT JOIN files f ON f.id = mjf.file_id
         WHERE mjf.merge_job_id = ?1
         ORDER BY mjf.order_index ASC",
    )?;
    let files = stmt
        .query_map([job_id], |row| {
            let status: Option<String> = row.get(4)?;
            Ok(MergeJobFile {
                file_id: row.get(0)?,
                order_index: row.get(1)?,
                file_name: row.get(2)?,
                record_count: row.get(3)?,
                status: status.as_deref().and_then(FileStatus::parse),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(files)
}

fn with_details(conn: &Connection, job: MergeJob) -> AppResult<MergeJobDetail> {
    let files = load_job_files(conn, &job.id)?;
    let output_file = match job.output_file_id.as_deref() {
        Some(file_id) => match load_file(conn, file_id) {
            Ok(file) => Some(file),
            Err(AppError::NotFound(_)) => None,
            Err(e) => return Err(e),
        },
        None => None,
    };
    Ok(MergeJobDetail {
        job,
        files,
        output_file,
    })
}

fn load_job_detail(conn: &Connection, job_id: &str) -> AppResult<MergeJobDetail> {
    let job = load_job(conn, job_id)?;
    with_details(conn, job)
}

/// Jobs of the calling accountant, newest first
pub fn list_merge_jobs(conn: &Connection, session: &Session) -> AppResult<Vec<MergeJobDetail>> {
    session.require_role(Role::Accountant)?;

    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM merge_jobs WHERE owner_id = ?1 ORDER BY created_at DESC",
        JOB_COLUMNS
    ))?;
    let jobs = stmt
        .query_map([session.user_id()], job_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    jobs.into_iter().map(|job| with_details(conn, job)).collect()
}

pub fn get_merge_job(conn: &Connection, session: &Session, job_id: &str) -> AppResult<MergeJobDetail> {
    let job = owned_job(conn, session, job_id)?;
    with_details(conn, job)
}

fn set_job_status(
    conn: &Connection,
    job_id: &str,
    status: MergeJobStatus,
    output_file_id: Option<&str>,
    error_message: Option<&str>,
) -> AppResult<()> {
    let completed_at = (status == MergeJobStatus::Completed).then(now_db_time);
    conn.execute(
        "UPDATE merge_jobs
         SET status = ?1,
             output_file_id = COALESCE(?2, output_file_id),
             error_message = ?3,
             completed_at = COALESCE(?4, completed_at)
         WHERE id = ?5",
        params![status.as_str(), output_file_id, error_message, completed_at, job_id],
    )?;
    log::debug!("Merge job {} is now {}", job_id, status.as_str());
    Ok(())
}

/// Set status; `completed_at` is stamped when the job becomes `completed`
pub fn update_merge_job_status(
    conn: &Connection,
    session: &Session,
    job_id: &str,
    status: MergeJobStatus,
) -> AppResult<MergeJobDetail> {
    owned_job(conn, session, job_id)?;
    set_job_status(conn, job_id, status, None, None)?;
    load_job_detail(conn, job_id)
}

/// Delete the job and its file references; the merged files stay
pub fn delete_merge_job(conn: &Connection, session: &Session, job_id: &str) -> AppResult<()> {
    owned_job(conn, session, job_id)?;
    conn.execute("DELETE FROM merge_jobs WHERE id = ?1", [job_id])?;
    log::info!("Deleted merge job {}", job_id);
    Ok(())
}

// ============================================================================
// RESULT & EXPORT
// ============================================================================

/// All records of the job's files, sorted by date, then file order, then row
pub fn get_merge_result(conn: &Connection, session: &Session, job_id: &str) -> AppResult<MergeResult> {
    let job = get_merge_job(conn, session, job_id)?;

    let mut stmt = conn.prepare(&format!(
        "SELECT {}, f.file_name
         FROM merge_job_files mjf
         JOIN records r ON r.file_id = mjf.file_id
         LEFT JOIN files f ON f.id = mjf.file_id
         WHERE mjf.merge_job_id = ?1
         ORDER BY r.data IS NULL, r.data ASC, mjf.order_index ASC, r.row_number ASC",
        RECORD_COLUMNS
    ))?;
    let records = stmt
        .query_map([job_id], |row| {
            Ok(MergedRecord {
                record: record_from_row(row)?,
                file_name: row.get(16)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let stats = calculate_merge_stats(&records, &job.files);
    Ok(MergeResult {
        job,
        records,
        stats,
    })
}

pub fn export_merge_to_csv(records: &[MergedRecord]) -> AppResult<String> {
    write_csv(
        &MERGE_HEADERS,
        records.iter().map(|m| {
            let r = &m.record;
            [
                m.file_name.as_deref(),
                r.nalog.as_deref(),
                r.data.as_deref(),
                r.valuta.as_deref(),
                r.m_ddv.as_deref(),
                r.opis.as_deref(),
                r.zatvoranje.as_deref(),
                r.zabeleska.as_deref(),
                r.dolguja.as_deref(),
                r.pobaruva.as_deref(),
            ]
        }),
    )
}

/// `{owner}/exports/{millis}_{sanitized name}`
pub fn export_path(owner_id: &str, timestamp_millis: i64, file_name: &str) -> String {
    format!(
        "{}/exports/{}_{}",
        owner_id,
        timestamp_millis,
        sanitize_filename(file_name)
    )
}

/// Write the merged CSV to the exports bucket, register it as a file and
/// complete the job. Any failure marks the job `failed`.
pub fn export_merge_to_file(
    conn: &mut Connection,
    store: &dyn ObjectStore,
    session: &Session,
    job_id: &str,
) -> AppResult<MergeJobDetail> {
    let result = get_merge_result(conn, session, job_id)?;

    if let Err(e) = write_export(conn, store, session, &result) {
        log::warn!("Export of merge job {} failed: {}", job_id, e);
        set_job_status(conn, job_id, MergeJobStatus::Failed, None, Some(&e.to_string()))?;
        return Err(e);
    }

    load_job_detail(conn, job_id)
}

fn write_export(
    conn: &mut Connection,
    store: &dyn ObjectStore,
    session: &Session,
    result: &MergeResult,
) -> AppResult<()> {
    let owner_id = session.user_id();
    let job_id = result.job.job.id.as_str();
    let csv = export_merge_to_csv(&result.records)?;
    let file_name = format!("{}.csv", result.job.job.name);
    let path = export_path(owner_id, Utc::now().timestamp_millis(), &file_name);
    let file_id = new_id();

    store.upload(EXPORTS_BUCKET, &path, csv.as_bytes())?;
    log_step(
        conn,
        "object_written",
        "merge_job",
        job_id,
        serde_json::json!({ "bucket": EXPORTS_BUCKET, "path": path }),
        owner_id,
    );

    let registered = register_export(
        conn,
        &file_id,
        owner_id,
        &file_name,
        &path,
        csv.len() as i64,
        result.records.len() as i64,
        job_id,
    );
    if let Err(db_error) = registered {
        if let Err(e) = store.remove(EXPORTS_BUCKET, &[path.as_str()]) {
            log::error!("Orphaned object {}/{}: {}", EXPORTS_BUCKET, path, e);
        }
        return Err(db_error);
    }

    log_step(
        conn,
        "export_registered",
        "merge_job",
        job_id,
        serde_json::json!({ "file_id": file_id }),
        owner_id,
    );
    log::info!("Exported merge job {} to {}", job_id, path);
    Ok(())
}

/// File row and job completion in one transaction
#[allow(clippy::too_many_arguments)]
fn register_export(
    conn: &mut Connection,
    file_id: &str,
    owner_id: &str,
    file_name: &str,
    path: &str,
    size: i64,
    record_count: i64,
    job_id: &str,
) -> AppResult<()> {
    let now = now_db_time();
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO files (id, owner_id, file_name, storage_path, file_size, file_type,
                            status, record_count, created_at, updated_at, processed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 'csv', 'processed', ?6, ?7, ?7, ?7)",
        params![file_id, owner_id, file_name, path, size, record_count, now],
    )?;
    set_job_status(&tx, job_id, MergeJobStatus::Completed, Some(file_id), None)?;
    tx.commit()?;
    Ok(())
}
