// 📤 CSV Export - fixed Macedonian headers, quoting only where needed
//
// Rows are joined with '\n' and there is no trailing newline.

use crate::error::{AppError, AppResult};

/// Headers for a plain record listing
pub const RECORD_HEADERS: [&str; 10] = [
    "Налог",
    "Дата",
    "Валута",
    "М ДДВ",
    "Опис",
    "Затворање",
    "Забелешка",
    "Долгува",
    "Побарува",
    "Единица",
];

/// Headers for a merge result; the first column is the source file name
pub const MERGE_HEADERS: [&str; 10] = [
    "Извор",
    "Налог",
    "Дата",
    "Валута",
    "М ДДВ",
    "Опис",
    "Затворање",
    "Забелешка",
    "Долгува",
    "Побарува",
];

/// Serialize a header row plus data rows.
/// `None` fields are written as empty strings.
pub fn write_csv<'a, I, R>(headers: &[&str], rows: I) -> AppResult<String>
where
    I: IntoIterator<Item = R>,
    R: IntoIterator<Item = Option<&'a str>>,
{
    let mut writer = csv::WriterBuilder::new()
        .quote_style(csv::QuoteStyle::Necessary)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());

    writer.write_record(headers).map_err(csv_error)?;
    for row in rows {
        let fields: Vec<&str> = row.into_iter().map(|f| f.unwrap_or("")).collect();
        writer.write_record(&fields).map_err(csv_error)?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| AppError::Storage(format!("CSV flush failed: {}", e)))?;
    let mut text = String::from_utf8(bytes)
        .map_err(|e| AppError::Storage(format!("CSV is not UTF-8: {}", e)))?;
    if text.ends_with('\n') {
        text.pop();
    }
    Ok(text)
}

fn csv_error(err: csv::Error) -> AppError {
    AppError::Storage(format!("CSV write failed: {}", err))
}
