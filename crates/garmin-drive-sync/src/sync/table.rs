//! Daily rows and the CSV history table they are persisted in.

use chrono::NaiveDate;
use serde_json::{Map, Value};
use std::collections::HashSet;

use crate::error::{Result, SyncError};
use crate::sync::flatten::to_json_text;

/// Identity column of every row
pub const DATE_COLUMN: &str = "Date";

/// Column holding the day's activity list as JSON text
pub const ACTIVITIES_COLUMN: &str = "All_Activities_Raw";

const DATE_FORMAT: &str = "%Y-%m-%d";

/// One flattened row of fitness data for a single calendar date.
///
/// Field order is insertion order and becomes column order for new columns.
#[derive(Debug, Clone, PartialEq)]
pub struct DailyRecord {
    date: NaiveDate,
    fields: Map<String, Value>,
}

impl DailyRecord {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            fields: Map::new(),
        }
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Set a field. The date column is owned by the record and never
    /// overwritten by data.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        if key != DATE_COLUMN {
            self.fields.insert(key, value);
        }
    }

    pub fn extend(&mut self, fields: Map<String, Value>) {
        for (key, value) in fields {
            self.set(key, value);
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.set(key, value);
        self
    }
}

/// Outcome of reading downloaded table bytes
#[derive(Debug)]
pub enum ParsedTable {
    Table(HistoryTable),
    /// Not a delimited table at all; the reason is kept for logging
    Unreadable(String),
}

/// The full persisted history, at most one row per date once merged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryTable {
    /// Column order of the table as it was read, `Date` excluded
    columns: Vec<String>,
    rows: Vec<DailyRecord>,
}

impl HistoryTable {
    pub fn new(columns: Vec<String>, rows: Vec<DailyRecord>) -> Self {
        Self { columns, rows }
    }

    pub fn rows(&self) -> &[DailyRecord] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub(crate) fn into_parts(self) -> (Vec<String>, Vec<DailyRecord>) {
        (self.columns, self.rows)
    }

    /// Parse CSV bytes.
    ///
    /// Syntactically broken or blank content is [`ParsedTable::Unreadable`],
    /// as is a row with more cells than the header. Short rows are history
    /// with trailing cells left empty. A well-formed table that cannot be
    /// keyed by date is an error: it may still hold real history and must
    /// not be replaced.
    pub fn parse(bytes: &[u8]) -> Result<ParsedTable> {
        let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF".as_slice()).unwrap_or(bytes);
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(bytes);

        let headers = match reader.headers() {
            Ok(h) => h.clone(),
            Err(e) => return Ok(ParsedTable::Unreadable(e.to_string())),
        };
        if headers.iter().all(|h| h.trim().is_empty()) {
            return Ok(ParsedTable::Unreadable("no columns".to_string()));
        }

        let date_idx = headers
            .iter()
            .position(|h| h == DATE_COLUMN)
            .ok_or_else(|| SyncError::invalid_table(format!("no '{}' column", DATE_COLUMN)))?;

        let columns: Vec<String> = headers
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != date_idx)
            .map(|(_, h)| h.to_string())
            .collect();

        let mut rows = Vec::new();
        for (line, record) in reader.records().enumerate() {
            let record = match record {
                Ok(r) => r,
                Err(e) => return Ok(ParsedTable::Unreadable(e.to_string())),
            };
            if record.len() > headers.len() {
                return Ok(ParsedTable::Unreadable(format!(
                    "row {} has {} cells but the header has {}",
                    line + 1,
                    record.len(),
                    headers.len()
                )));
            }
            let raw_date = record.get(date_idx).unwrap_or_default();
            let date = parse_date(raw_date).ok_or_else(|| {
                SyncError::invalid_table(format!(
                    "row {} has unusable {} '{}'",
                    line + 1,
                    DATE_COLUMN,
                    raw_date
                ))
            })?;

            let mut row = DailyRecord::new(date);
            for (i, name) in headers.iter().enumerate() {
                if i == date_idx {
                    continue;
                }
                let value = match record.get(i) {
                    Some(cell) if !cell.is_empty() => Value::String(cell.to_string()),
                    _ => Value::Null,
                };
                row.set(name, value);
            }
            rows.push(row);
        }

        Ok(ParsedTable::Table(Self { columns, rows }))
    }

    /// Header for writing: `Date`, the columns read from the existing
    /// table, then any new columns in first-seen order.
    pub fn header(&self) -> Vec<String> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut header = vec![DATE_COLUMN.to_string()];
        seen.insert(DATE_COLUMN);

        let row_keys = self.rows.iter().flat_map(|r| r.fields.keys());
        for column in self.columns.iter().chain(row_keys) {
            if seen.insert(column.as_str()) {
                header.push(column.clone());
            }
        }
        header
    }

    /// Serialize as CSV; absent fields render as empty cells.
    pub fn to_csv(&self) -> Result<Vec<u8>> {
        let header = self.header();
        let mut writer = csv::WriterBuilder::new()
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(Vec::new());

        writer.write_record(&header)?;
        for row in &self.rows {
            let mut cells = Vec::with_capacity(header.len());
            cells.push(row.date.format(DATE_FORMAT).to_string());
            for column in &header[1..] {
                cells.push(render_cell(row.fields.get(column))?);
            }
            writer.write_record(&cells)?;
        }

        writer.into_inner().map_err(|e| SyncError::Io(e.into_error()))
    }
}

fn render_cell(value: Option<&Value>) -> Result<String> {
    Ok(match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(true)) => "True".to_string(),
        Some(Value::Bool(false)) => "False".to_string(),
        Some(nested) => to_json_text(nested)?,
    })
}

/// Parse a calendar date, tolerating missing zero padding and a trailing
/// time part (`2024-9-1`, `2024-09-01 00:00:00`, `2024-09-01T00:00:00`).
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let day_part = raw.trim().split([' ', 'T']).next()?;
    let mut parts = day_part.split('-');
    let year: i32 = parts.next()?.parse().ok()?;
    let month: u32 = parts.next()?.parse().ok()?;
    let day: u32 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    NaiveDate::from_ymd_opt(year, month, day)
}
