// 📄 Upload Parsers - CSV and Excel into a uniform table
//
// The filename extension picks the parser; each parser turns raw bytes into
// a `Table` of headers plus typed cells. Layout detection happens later, in
// reconciliation.rs, and never looks at the file format.

use crate::error::ImportError;
use calamine::{open_workbook_auto_from_rs, Data, Reader};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Cursor;
use tracing::debug;

/// Spellings that spreadsheet tools write for a missing value
const NULL_MARKERS: &[&str] = &["NA", "N/A", "NaN", "nan", "null", "NULL", "None", "#N/A"];

// ============================================================================
// CORE TYPES
// ============================================================================

/// Which parser an upload goes through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileKind {
    Csv,
    Excel,
}

impl FileKind {
    /// Pick the file kind from the upload's filename.
    ///
    /// `.csv` → Csv, `.xlsx`/`.xls` → Excel (case-insensitive). Anything else
    /// is rejected before the payload is touched.
    pub fn from_filename(filename: &str) -> Result<Self, ImportError> {
        let lower = filename.trim().to_lowercase();

        if lower.ends_with(".csv") {
            Ok(FileKind::Csv)
        } else if lower.ends_with(".xlsx") || lower.ends_with(".xls") {
            Ok(FileKind::Excel)
        } else {
            Err(ImportError::UnsupportedFileType(filename.to_string()))
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FileKind::Csv => "CSV",
            FileKind::Excel => "Excel",
        }
    }
}

/// A single spreadsheet cell after null normalization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Cell {
    Empty,
    Number(f64),
    Text(String),
    Bool(bool),
    /// Spreadsheet error value such as `#DIV/0!`
    Error(String),
}

impl Cell {
    /// Classify a raw text cell: blanks and null markers become `Empty`
    pub fn from_text(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() || NULL_MARKERS.contains(&trimmed) {
            Cell::Empty
        } else {
            Cell::Text(raw.to_string())
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Cell::Empty)
    }

    /// Trimmed textual form, `None` for empty cells
    pub fn as_name(&self) -> Option<String> {
        match self {
            Cell::Empty => None,
            other => {
                let name = other.to_string().trim().to_string();
                if name.is_empty() {
                    None
                } else {
                    Some(name)
                }
            }
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Empty => Ok(()),
            // f64 Display already drops the ".0" of integral values
            Cell::Number(n) => write!(f, "{}", n),
            Cell::Text(s) => write!(f, "{}", s),
            Cell::Bool(b) => write!(f, "{}", b),
            Cell::Error(code) => write!(f, "{}", code),
        }
    }
}

/// Parsed upload: header row plus data rows, every row as wide as the header
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl Table {
    pub fn new(headers: Vec<String>) -> Self {
        Table {
            headers,
            rows: Vec::new(),
        }
    }

    /// Append a row, padding short rows with empty cells
    pub fn push_row(&mut self, mut row: Vec<Cell>) -> Result<(), ImportError> {
        if row.len() > self.headers.len() {
            return Err(ImportError::malformed(format!(
                "row {} has {} fields but the header has {}",
                self.rows.len() + 2,
                row.len(),
                self.headers.len()
            )));
        }
        row.resize(self.headers.len(), Cell::Empty);
        self.rows.push(row);
        Ok(())
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

fn clean_header(raw: &str) -> String {
    raw.trim_start_matches('\u{feff}').trim().to_string()
}

// ============================================================================
// PARSER TRAIT
// ============================================================================

/// TableParser - turns an uploaded payload into a `Table`
pub trait TableParser: Send + Sync {
    fn parse(&self, bytes: &[u8]) -> Result<Table, ImportError>;

    fn kind(&self) -> FileKind;
}

/// Factory: one parser per file kind
pub fn get_parser(kind: FileKind) -> Box<dyn TableParser> {
    match kind {
        FileKind::Csv => Box::new(CsvTableParser::new()),
        FileKind::Excel => Box::new(ExcelTableParser::new()),
    }
}

/// Detect the file kind from the name, then parse the payload
pub fn parse_upload(filename: &str, bytes: &[u8]) -> Result<Table, ImportError> {
    let kind = FileKind::from_filename(filename)?;
    let parser = get_parser(kind);
    debug!(filename, format = parser.kind().name(), bytes = bytes.len(), "parsing upload");
    parser.parse(bytes)
}

// ============================================================================
// CSV
// ============================================================================

pub struct CsvTableParser;

impl CsvTableParser {
    pub fn new() -> Self {
        CsvTableParser
    }
}

impl Default for CsvTableParser {
    fn default() -> Self {
        Self::new()
    }
}

impl TableParser for CsvTableParser {
    fn parse(&self, bytes: &[u8]) -> Result<Table, ImportError> {
        use csv::ReaderBuilder;

        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(bytes);

        let headers = reader.headers().map_err(ImportError::malformed)?;
        let headers: Vec<String> = headers.iter().map(clean_header).collect();
        if headers.is_empty() || headers.iter().all(|h| h.is_empty()) {
            return Err(ImportError::malformed("no columns to parse from file"));
        }

        let mut table = Table::new(headers);
        for result in reader.records() {
            let record = result.map_err(ImportError::malformed)?;

            // Fully blank lines carry no data
            if record.iter().all(|field| field.trim().is_empty()) {
                continue;
            }

            table.push_row(record.iter().map(Cell::from_text).collect())?;
        }

        Ok(table)
    }

    fn kind(&self) -> FileKind {
        FileKind::Csv
    }
}

// ============================================================================
// EXCEL (.xlsx / .xls, first worksheet)
// ============================================================================

pub struct ExcelTableParser;

impl ExcelTableParser {
    pub fn new() -> Self {
        ExcelTableParser
    }
}

impl Default for ExcelTableParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Map a calamine cell onto our cell model
pub fn cell_from_data(data: &Data) -> Cell {
    match data {
        Data::Empty => Cell::Empty,
        // #N/A is a missing value; every other error code is kept
        Data::Error(err) => match Cell::from_text(&err.to_string()) {
            Cell::Empty => Cell::Empty,
            _ => Cell::Error(err.to_string()),
        },
        Data::Int(i) => Cell::Number(*i as f64),
        Data::Float(f) => Cell::Number(*f),
        Data::Bool(b) => Cell::Bool(*b),
        Data::String(s) => Cell::from_text(s),
        other => Cell::from_text(&other.to_string()),
    }
}

impl TableParser for ExcelTableParser {
    fn parse(&self, bytes: &[u8]) -> Result<Table, ImportError> {
        let mut workbook =
            open_workbook_auto_from_rs(Cursor::new(bytes.to_vec())).map_err(ImportError::malformed)?;

        let range = workbook
            .worksheet_range_at(0)
            .ok_or_else(|| ImportError::malformed("workbook contains no worksheets"))?
            .map_err(ImportError::malformed)?;

        let mut rows = range.rows();
        let header_row = rows
            .next()
            .ok_or_else(|| ImportError::malformed("no columns to parse from file"))?;
        let headers: Vec<String> = header_row
            .iter()
            .map(|cell| clean_header(&cell.to_string()))
            .collect();

        let mut table = Table::new(headers);
        for row in rows {
            let cells: Vec<Cell> = row.iter().map(cell_from_data).collect();
            if cells.iter().all(Cell::is_empty) {
                continue;
            }
            table.push_row(cells)?;
        }

        Ok(table)
    }

    fn kind(&self) -> FileKind {
        FileKind::Excel
    }
}
