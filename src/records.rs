// 📒 Records - ledger lines produced by file processing
// Listing with filters/pagination, per-file statistics, CSV export

use crate::auth::Session;
use crate::csv_export::{write_csv, RECORD_HEADERS};
use crate::db::{new_id, now_db_time, time_column};
use crate::error::AppResult;
use crate::files::get_file;
use crate::ledger::{parse_amount, SourceTotals};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ToSql};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 1000;

// ============================================================================
// RECORD
// ============================================================================

/// One ledger line. Immutable once created by processing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
    pub id: String,
    pub file_id: String,
    pub owner_id: String,
    pub row_number: i64,
    /// Order / document number
    pub nalog: Option<String>,
    /// Transaction date as delivered by processing (sortable text)
    pub data: Option<String>,
    /// Currency
    pub valuta: Option<String>,
    /// VAT marker
    pub m_ddv: Option<String>,
    /// Description
    pub opis: Option<String>,
    /// Closing reference
    pub zatvoranje: Option<String>,
    /// Note
    pub zabeleska: Option<String>,
    /// Debit amount (text)
    pub dolguja: Option<String>,
    /// Credit amount (text)
    pub pobaruva: Option<String>,
    pub invoice_number: Option<String>,
    /// Unit
    pub edin: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Record {
    pub fn debit(&self) -> f64 {
        parse_amount(self.dolguja.as_deref())
    }

    pub fn credit(&self) -> f64 {
        parse_amount(self.pobaruva.as_deref())
    }

    /// Fields in export column order
    fn export_fields(&self) -> [Option<&str>; 10] {
        [
            self.nalog.as_deref(),
            self.data.as_deref(),
            self.valuta.as_deref(),
            self.m_ddv.as_deref(),
            self.opis.as_deref(),
            self.zatvoranje.as_deref(),
            self.zabeleska.as_deref(),
            self.dolguja.as_deref(),
            self.pobaruva.as_deref(),
            self.edin.as_deref(),
        ]
    }
}

/// A record together with the display name of its file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordWithSource {
    #[serde(flatten)]
    pub record: Record,
    pub file_name: Option<String>,
}

/// Row shape returned by the processing function.
/// Amounts and free-text columns may arrive as JSON numbers.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NewRecord {
    #[serde(default)]
    pub row_number: Option<i64>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub nalog: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub data: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub valuta: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub m_ddv: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub opis: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub zatvoranje: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub zabeleska: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub dolguja: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub pobaruva: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub invoice_number: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub edin: Option<String>,
}

fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

pub(crate) const RECORD_COLUMNS: &str = "r.id, r.file_id, r.owner_id, r.row_number, r.nalog, r.data, \
     r.valuta, r.m_ddv, r.opis, r.zatvoranje, r.zabeleska, r.dolguja, r.pobaruva, \
     r.invoice_number, r.edin, r.created_at";

/// Map the first 16 columns (RECORD_COLUMNS order)
pub(crate) fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Record> {
    Ok(Record {
        id: row.get(0)?,
        file_id: row.get(1)?,
        owner_id: row.get(2)?,
        row_number: row.get(3)?,
        nalog: row.get(4)?,
        data: row.get(5)?,
        valuta: row.get(6)?,
        m_ddv: row.get(7)?,
        opis: row.get(8)?,
        zatvoranje: row.get(9)?,
        zabeleska: row.get(10)?,
        dolguja: row.get(11)?,
        pobaruva: row.get(12)?,
        invoice_number: row.get(13)?,
        edin: row.get(14)?,
        created_at: time_column(row, 15)?,
    })
}

// ============================================================================
// LISTING
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    Data,
    Nalog,
    RowNumber,
    Dolguja,
    Pobaruva,
    CreatedAt,
}

impl SortField {
    fn order_expr(&self) -> &'static str {
        match self {
            SortField::Data => "r.data",
            SortField::Nalog => "r.nalog",
            SortField::RowNumber => "r.row_number",
            SortField::Dolguja => "CAST(r.dolguja AS REAL)",
            SortField::Pobaruva => "CAST(r.pobaruva AS REAL)",
            SortField::CreatedAt => "r.created_at",
        }
    }
}

impl Default for SortField {
    fn default() -> Self {
        SortField::Data
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListOptions {
    #[serde(default)]
    pub file_id: Option<String>,
    /// Case-insensitive substring of nalog or opis
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub date_from: Option<String>,
    #[serde(default)]
    pub date_to: Option<String>,
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub sort_by: SortField,
    #[serde(default = "default_sort_desc")]
    pub sort_desc: bool,
}

fn default_page() -> u32 {
    1
}

fn default_limit() -> u32 {
    DEFAULT_PAGE_SIZE
}

fn default_sort_desc() -> bool {
    true
}

impl Default for ListOptions {
    fn default() -> Self {
        ListOptions {
            file_id: None,
            search: None,
            date_from: None,
            date_to: None,
            page: default_page(),
            limit: default_limit(),
            sort_by: SortField::default(),
            sort_desc: default_sort_desc(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordPage {
    pub records: Vec<RecordWithSource>,
    pub total: i64,
    pub page: u32,
    pub limit: u32,
    pub total_pages: i64,
}

fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len() + 2);
    escaped.push('%');
    for c in value.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

pub fn list_records(
    conn: &Connection,
    session: &Session,
    options: &ListOptions,
) -> AppResult<RecordPage> {
    let page = options.page.max(1);
    let limit = options.limit.clamp(1, MAX_PAGE_SIZE);

    let owner_id = session.user_id().to_string();
    let offset = i64::from(page - 1).saturating_mul(i64::from(limit));
    let limit_i = i64::from(limit);
    let search = options
        .search
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(|s| escape_like(&s.to_lowercase()));

    let mut filter = String::from(" WHERE r.owner_id = ?");
    let mut args: Vec<&dyn ToSql> = vec![&owner_id];

    if let Some(file_id) = options.file_id.as_ref() {
        filter.push_str(" AND r.file_id = ?");
        args.push(file_id);
    }
    if let Some(pattern) = search.as_ref() {
        filter.push_str(
            " AND (unicode_lower(r.nalog) LIKE ? ESCAPE '\\' \
             OR unicode_lower(r.opis) LIKE ? ESCAPE '\\')",
        );
        args.push(pattern);
        args.push(pattern);
    }
    if let Some(from) = options.date_from.as_ref() {
        filter.push_str(" AND r.data >= ?");
        args.push(from);
    }
    if let Some(to) = options.date_to.as_ref() {
        filter.push_str(" AND r.data <= ?");
        args.push(to);
    }

    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM records r{}", filter),
        args.as_slice(),
        |row| row.get(0),
    )?;

    let sql = format!(
        "SELECT {}, f.file_name FROM records r JOIN files f ON f.id = r.file_id{}
         ORDER BY {} {}, r.row_number ASC LIMIT ? OFFSET ?",
        RECORD_COLUMNS,
        filter,
        options.sort_by.order_expr(),
        if options.sort_desc { "DESC" } else { "ASC" },
    );
    args.push(&limit_i);
    args.push(&offset);

    let mut stmt = conn.prepare(&sql)?;
    let records = stmt
        .query_map(args.as_slice(), |row| {
            Ok(RecordWithSource {
                record: record_from_row(row)?,
                file_name: row.get(16)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    log::debug!("Listed {} of {} records (page {})", records.len(), total, page);
    Ok(RecordPage {
        records,
        total,
        page,
        limit,
        total_pages: (total + limit_i - 1) / limit_i,
    })
}

pub fn records_by_file(conn: &Connection, session: &Session, file_id: &str) -> AppResult<Vec<Record>> {
    get_file(conn, session, file_id)?;

    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM records r WHERE r.file_id = ?1 ORDER BY r.row_number ASC",
        RECORD_COLUMNS
    ))?;
    let records = stmt
        .query_map([file_id], record_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(records)
}

/// Replace a file's records with the processed rows in one transaction;
/// returns the count. Reprocessing a file never leaves the old rows behind.
pub fn insert_records(
    conn: &mut Connection,
    file_id: &str,
    owner_id: &str,
    rows: &[NewRecord],
) -> AppResult<usize> {
    let tx = conn.transaction()?;
    let now = now_db_time();
    let replaced = tx.execute("DELETE FROM records WHERE file_id = ?1", [file_id])?;
    if replaced > 0 {
        log::info!("Replacing {} existing records of file {}", replaced, file_id);
    }
    {
        let mut stmt = tx.prepare(
            "INSERT INTO records (id, file_id, owner_id, row_number, nalog, data, valuta, m_ddv,
                                  opis, zatvoranje, zabeleska, dolguja, pobaruva, invoice_number,
                                  edin, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        )?;
        for (index, row) in rows.iter().enumerate() {
            let row_number = row.row_number.unwrap_or(index as i64 + 1);
            stmt.execute(params![
                new_id(),
                file_id,
                owner_id,
                row_number,
                row.nalog,
                row.data,
                row.valuta,
                row.m_ddv,
                row.opis,
                row.zatvoranje,
                row.zabeleska,
                row.dolguja,
                row.pobaruva,
                row.invoice_number,
                row.edin,
                now,
            ])?;
        }
    }
    tx.commit()?;
    Ok(rows.len())
}

// ============================================================================
// STATISTICS
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordStats {
    pub total_records: usize,
    pub total_dolguja: f64,
    pub total_pobaruva: f64,
    pub balance: f64,
    /// Keyed by file id
    pub by_file: BTreeMap<String, SourceTotals>,
}

/// Totals over the caller's records, optionally restricted to one file
pub fn record_stats(
    conn: &Connection,
    session: &Session,
    file_id: Option<&str>,
) -> AppResult<RecordStats> {
    if let Some(file_id) = file_id {
        get_file(conn, session, file_id)?;
    }

    let mut stmt = conn.prepare(
        "SELECT dolguja, pobaruva, file_id FROM records
         WHERE owner_id = ?1 AND (?2 IS NULL OR file_id = ?2)",
    )?;
    let mut rows = stmt.query(params![session.user_id(), file_id])?;

    let mut stats = RecordStats::default();
    while let Some(row) = rows.next()? {
        let dolguja = parse_amount(row.get::<_, Option<String>>(0)?.as_deref());
        let pobaruva = parse_amount(row.get::<_, Option<String>>(1)?.as_deref());
        let file_id: String = row.get(2)?;

        stats.total_records += 1;
        stats.total_dolguja += dolguja;
        stats.total_pobaruva += pobaruva;
        stats.by_file.entry(file_id).or_default().add(dolguja, pobaruva);
    }
    stats.balance = stats.total_pobaruva - stats.total_dolguja;

    Ok(stats)
}

// ============================================================================
// EXPORT
// ============================================================================

pub fn export_to_csv(records: &[Record]) -> AppResult<String> {
    write_csv(&RECORD_HEADERS, records.iter().map(|r| r.export_fields()))
}

/// CSV of one file's records (row order) or of all the caller's records (date order)
pub fn export_records(conn: &Connection, session: &Session, file_id: Option<&str>) -> AppResult<String> {
    let records = match file_id {
        Some(file_id) => records_by_file(conn, session, file_id)?,
        None => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM records r WHERE r.owner_id = ?1
                 ORDER BY r.data IS NULL, r.data ASC, r.file_id ASC, r.row_number ASC",
                RECORD_COLUMNS
            ))?;
            let rows = stmt
                .query_map([session.user_id()], record_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
    };
    export_to_csv(&records)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::auth::tests::signed_up;
    use crate::auth::Role;
    use crate::db::setup_database;
    use crate::files::upload_file;
    use crate::storage::LocalObjectStore;

    pub(crate) fn new_record(
        nalog: &str,
        data: &str,
        dolguja: &str,
        pobaruva: &str,
        invoice: Option<&str>,
    ) -> NewRecord {
        NewRecord {
            nalog: Some(nalog.to_string()),
            data: Some(data.to_string()),
            valuta: Some("MKD".to_string()),
            opis: Some(format!("Opis {}", nalog)),
            dolguja: Some(dolguja.to_string()),
            pobaruva: Some(pobaruva.to_string()),
            invoice_number: invoice.map(|s| s.to_string()),
            ..NewRecord::default()
        }
    }

    fn record(opis: &str, dolguja: Option<&str>) -> Record {
        Record {
            id: "r1".to_string(),
            file_id: "f1".to_string(),
            owner_id: "u1".to_string(),
            row_number: 1,
            nalog: Some("100".to_string()),
            data: Some("2024-01-05".to_string()),
            valuta: None,
            m_ddv: None,
            opis: Some(opis.to_string()),
            zatvoranje: None,
            zabeleska: None,
            dolguja: dolguja.map(|s| s.to_string()),
            pobaruva: Some("0".to_string()),
            invoice_number: None,
            edin: Some("kg".to_string()),
            created_at: Utc::now(),
        }
    }

    struct Fixture {
        conn: Connection,
        _dir: tempfile::TempDir,
        session: Session,
        file_a: String,
        file_b: String,
    }

    fn fixture() -> Fixture {
        let mut conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path(), "http://localhost", "secret");
        let session = signed_up(&conn, "acc@example.com", Role::Accountant);

        let file_a = upload_file(&conn, &store, &session, "a.csv", b"a").unwrap().id;
        let file_b = upload_file(&conn, &store, &session, "b.csv", b"b").unwrap().id;

        insert_records(
            &mut conn,
            &file_a,
            session.user_id(),
            &[
                new_record("1", "2024-01-03", "100", "", None),
                new_record("2", "2024-01-01", "", "50.5", None),
                new_record("3", "2024-02-10", "abc", "10", None),
            ],
        )
        .unwrap();
        insert_records(
            &mut conn,
            &file_b,
            session.user_id(),
            &[new_record("77", "2024-01-02", "20", "0", None)],
        )
        .unwrap();

        Fixture {
            conn,
            _dir: dir,
            session,
            file_a,
            file_b,
        }
    }

    #[test]
    fn test_new_record_accepts_numbers() {
        let row: NewRecord = serde_json::from_str(
            r#"{"row_number": 4, "nalog": 12, "dolguja": 1500.5, "pobaruva": "0", "opis": null}"#,
        )
        .unwrap();

        assert_eq!(row.row_number, Some(4));
        assert_eq!(row.nalog.as_deref(), Some("12"));
        assert_eq!(row.dolguja.as_deref(), Some("1500.5"));
        assert_eq!(row.pobaruva.as_deref(), Some("0"));
        assert_eq!(row.opis, None);
        assert_eq!(row.edin, None);
    }

    #[test]
    fn test_list_paginates_and_sorts() {
        let f = fixture();

        let options = ListOptions {
            limit: 3,
            sort_desc: false,
            ..ListOptions::default()
        };
        let first = list_records(&f.conn, &f.session, &options).unwrap();
        assert_eq!(first.total, 4);
        assert_eq!(first.total_pages, 2);
        let dates: Vec<&str> = first
            .records
            .iter()
            .map(|r| r.record.data.as_deref().unwrap())
            .collect();
        assert_eq!(dates, vec!["2024-01-01", "2024-01-02", "2024-01-03"]);
        assert_eq!(first.records[1].file_name.as_deref(), Some("b.csv"));

        let second = list_records(&f.conn, &f.session, &ListOptions { page: 2, ..options }).unwrap();
        assert_eq!(second.records.len(), 1);
        assert_eq!(second.records[0].record.data.as_deref(), Some("2024-02-10"));
    }

    #[test]
    fn test_list_filters() {
        let f = fixture();

        let by_file = list_records(
            &f.conn,
            &f.session,
            &ListOptions {
                file_id: Some(f.file_b.clone()),
                ..ListOptions::default()
            },
        )
        .unwrap();
        assert_eq!(by_file.total, 1);

        let search = list_records(
            &f.conn,
            &f.session,
            &ListOptions {
                search: Some("OPIS 7".to_string()),
                ..ListOptions::default()
            },
        )
        .unwrap();
        assert_eq!(search.total, 1);
        assert_eq!(search.records[0].record.nalog.as_deref(), Some("77"));

        let range = list_records(
            &f.conn,
            &f.session,
            &ListOptions {
                date_from: Some("2024-01-02".to_string()),
                date_to: Some("2024-01-31".to_string()),
                ..ListOptions::default()
            },
        )
        .unwrap();
        assert_eq!(range.total, 2);

        let wildcard = list_records(
            &f.conn,
            &f.session,
            &ListOptions {
                search: Some("%".to_string()),
                ..ListOptions::default()
            },
        )
        .unwrap();
        assert_eq!(wildcard.total, 0);
    }

    #[test]
    fn test_search_folds_cyrillic_case() {
        let mut f = fixture();
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path(), "http://localhost", "secret");
        let file_c = upload_file(&f.conn, &store, &f.session, "c.csv", b"c").unwrap().id;
        let mut row = new_record("90", "2024-03-01", "10", "0", None);
        row.opis = Some("Плаќање Фактура".to_string());
        insert_records(&mut f.conn, &file_c, f.session.user_id(), &[row]).unwrap();

        for term in ["фактура", "ФАКТУРА", "Плаќање ф"] {
            let found = list_records(
                &f.conn,
                &f.session,
                &ListOptions {
                    search: Some(term.to_string()),
                    ..ListOptions::default()
                },
            )
            .unwrap();
            assert_eq!(found.total, 1, "search {}", term);
            assert_eq!(found.records[0].record.nalog.as_deref(), Some("90"));
        }
    }

    #[test]
    fn test_extreme_paging_is_clamped() {
        let f = fixture();

        let page = list_records(
            &f.conn,
            &f.session,
            &ListOptions {
                page: u32::MAX,
                limit: u32::MAX,
                ..ListOptions::default()
            },
        )
        .unwrap();

        assert_eq!(page.limit, MAX_PAGE_SIZE);
        assert_eq!(page.total, 4);
        assert_eq!(page.total_pages, 1);
        assert!(page.records.is_empty());
    }

    #[test]
    fn test_records_are_private() {
        let f = fixture();
        let other = signed_up(&f.conn, "other@example.com", Role::Client);

        let page = list_records(&f.conn, &other, &ListOptions::default()).unwrap();
        assert_eq!(page.total, 0);
        assert_eq!(page.total_pages, 0);
        assert!(records_by_file(&f.conn, &other, &f.file_a).is_err());
    }

    #[test]
    fn test_records_by_file_in_row_order() {
        let f = fixture();
        let records = records_by_file(&f.conn, &f.session, &f.file_a).unwrap();

        let rows: Vec<i64> = records.iter().map(|r| r.row_number).collect();
        assert_eq!(rows, vec![1, 2, 3]);
    }

    #[test]
    fn test_record_stats_by_file() {
        let f = fixture();

        let all = record_stats(&f.conn, &f.session, None).unwrap();
        assert_eq!(all.total_records, 4);
        assert_eq!(all.total_dolguja, 120.0);
        assert_eq!(all.total_pobaruva, 60.5);
        assert_eq!(all.balance, all.total_pobaruva - all.total_dolguja);
        assert_eq!(all.by_file[&f.file_a].count, 3);
        assert_eq!(all.by_file[&f.file_b].dolguja, 20.0);

        let one = record_stats(&f.conn, &f.session, Some(&f.file_b)).unwrap();
        assert_eq!(one.total_records, 1);
        assert_eq!(one.by_file.len(), 1);
    }

    #[test]
    fn test_export_to_csv() {
        let csv = export_to_csv(&[
            record("He said, \"hi\"", Some("1500")),
            record("plain", None),
        ])
        .unwrap();

        let lines: Vec<&str> = csv.split('\n').collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], RECORD_HEADERS.join(","));
        assert_eq!(lines[1], "100,2024-01-05,,,\"He said, \"\"hi\"\"\",,,1500,0,kg");
        assert_eq!(lines[2], "100,2024-01-05,,,plain,,,,0,kg");
    }

    #[test]
    fn test_export_records_all_and_by_file() {
        let f = fixture();

        let all = export_records(&f.conn, &f.session, None).unwrap();
        let nalogs: Vec<&str> = all
            .lines()
            .skip(1)
            .map(|line| line.split(',').next().unwrap())
            .collect();
        assert_eq!(nalogs, vec!["2", "77", "1", "3"]);

        let one = export_records(&f.conn, &f.session, Some(&f.file_b)).unwrap();
        assert_eq!(one.lines().count(), 2);
    }
}
