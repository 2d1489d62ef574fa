// ⚖️ Upload Reconciliation - layout detection, normalization, upsert
//
// Two layouts are accepted:
//   long:  student_name, subject, score      (one row per triple)
//   wide:  student_name, <subject>, ...      (one row per student)
//
// Every upload is normalized to (student, subject, score) triples first and
// only then applied to the store, inside a single transaction.

use crate::db::{self, UploadEvent};
use crate::error::ImportError;
use crate::parser::{self, Cell, Table};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::{debug, info};

const STUDENT_COLUMN: &str = "student_name";
const SUBJECT_COLUMN: &str = "subject";
const SCORE_COLUMN: &str = "score";

// ============================================================================
// LAYOUT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Layout {
    /// Column indexes of the three required columns
    Long {
        student: usize,
        subject: usize,
        score: usize,
    },

    /// Student column plus (index, trimmed name) of every subject column
    Wide {
        student: usize,
        subjects: Vec<(usize, String)>,
    },
}

impl Layout {
    pub fn name(&self) -> &'static str {
        match self {
            Layout::Long { .. } => "long",
            Layout::Wide { .. } => "wide",
        }
    }

    pub fn subjects_detected(&self) -> Option<usize> {
        match self {
            Layout::Long { .. } => None,
            Layout::Wide { subjects, .. } => Some(subjects.len()),
        }
    }
}

/// Case-insensitive column lookup; first matching column wins
fn find_column(headers: &[String], wanted: &str) -> Option<usize> {
    headers
        .iter()
        .position(|header| header.trim().eq_ignore_ascii_case(wanted))
}

/// Decide between long and wide layout from the header row.
///
/// Long needs all three of `student_name`, `subject` and `score`. A partial
/// subset falls through to wide, where every other column is a subject.
/// Blank headers become `Unnamed: <index>`, as spreadsheet tools label them.
pub fn detect_layout(headers: &[String]) -> Result<Layout, ImportError> {
    let student = find_column(headers, STUDENT_COLUMN);
    let subject = find_column(headers, SUBJECT_COLUMN);
    let score = find_column(headers, SCORE_COLUMN);

    if let (Some(student), Some(subject), Some(score)) = (student, subject, score) {
        return Ok(Layout::Long {
            student,
            subject,
            score,
        });
    }

    let student = student.ok_or_else(|| {
        ImportError::InvalidSchema("wide format must include a 'student_name' column".to_string())
    })?;

    let subjects: Vec<(usize, String)> = headers
        .iter()
        .enumerate()
        .filter(|(idx, _)| *idx != student)
        .map(|(idx, header)| match header.trim() {
            "" => (idx, format!("Unnamed: {}", idx)),
            name => (idx, name.to_string()),
        })
        .collect();

    if subjects.is_empty() {
        return Err(ImportError::InvalidSchema(
            "no subject columns found".to_string(),
        ));
    }

    Ok(Layout::Wide { student, subjects })
}

// ============================================================================
// NORMALIZATION
// ============================================================================

/// One normalized (student, subject, score) observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreTriple {
    pub student: String,
    pub subject: String,
    pub score: f64,
}

/// Output of normalization, ready to be applied to the store
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedUpload {
    pub layout: Layout,
    pub triples: Vec<ScoreTriple>,
    /// Rows that survived null-dropping (students, for wide uploads)
    pub rows_imported: usize,
}

/// Coerce a score cell to f64. `line` is the 1-based file line, header = 1.
fn coerce_score(cell: &Cell, line: usize, column: &str) -> Result<f64, ImportError> {
    let value = match cell {
        Cell::Number(n) => *n,
        Cell::Text(text) => text.trim().parse::<f64>().map_err(|_| {
            ImportError::malformed(format!(
                "could not convert '{}' to a score (row {}, column '{}')",
                text.trim(),
                line,
                column
            ))
        })?,
        Cell::Bool(b) => {
            return Err(ImportError::malformed(format!(
                "could not convert '{}' to a score (row {}, column '{}')",
                b, line, column
            )))
        }
        Cell::Error(code) => {
            return Err(ImportError::malformed(format!(
                "spreadsheet error {} in score cell (row {}, column '{}')",
                code, line, column
            )))
        }
        Cell::Empty => {
            return Err(ImportError::malformed(format!(
                "missing score (row {}, column '{}')",
                line, column
            )))
        }
    };

    if !value.is_finite() {
        return Err(ImportError::malformed(format!(
            "score must be a finite number (row {}, column '{}')",
            line, column
        )));
    }

    Ok(value)
}

/// Turn table rows into triples according to the layout.
///
/// Fails on the first non-numeric score; nothing is written to the store
/// before this returns.
pub fn normalize(table: &Table, layout: &Layout) -> Result<NormalizedUpload, ImportError> {
    let mut triples = Vec::new();
    let mut rows_imported = 0;

    match layout {
        Layout::Long {
            student,
            subject,
            score,
        } => {
            for (idx, row) in table.rows.iter().enumerate() {
                let (Some(student_name), Some(subject_name)) =
                    (row[*student].as_name(), row[*subject].as_name())
                else {
                    continue;
                };
                if row[*score].is_empty() {
                    continue;
                }

                let value = coerce_score(&row[*score], idx + 2, &table.headers[*score])?;
                triples.push(ScoreTriple {
                    student: student_name,
                    subject: subject_name,
                    score: value,
                });
                rows_imported += 1;
            }
        }
        Layout::Wide { student, subjects } => {
            for (idx, row) in table.rows.iter().enumerate() {
                let Some(student_name) = row[*student].as_name() else {
                    continue;
                };
                rows_imported += 1;

                for (col, subject_name) in subjects {
                    let cell = &row[*col];
                    if cell.is_empty() {
                        continue;
                    }

                    let value = coerce_score(cell, idx + 2, subject_name)?;
                    triples.push(ScoreTriple {
                        student: student_name.clone(),
                        subject: subject_name.clone(),
                        score: value,
                    });
                }
            }
        }
    }

    Ok(NormalizedUpload {
        layout: layout.clone(),
        triples,
        rows_imported,
    })
}

// ============================================================================
// IMPORT
// ============================================================================

/// What an upload reports back to the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportReport {
    pub status: String,
    pub rows_imported: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subjects_detected: Option<usize>,
}

/// Apply normalized triples in row order. Later rows for the same pair win.
///
/// Returns the number of score upserts performed.
pub fn apply_triples(conn: &Connection, triples: &[ScoreTriple]) -> Result<usize, ImportError> {
    let mut student_ids: HashMap<&str, i64> = HashMap::new();
    let mut subject_ids: HashMap<&str, i64> = HashMap::new();
    let mut applied = 0;

    for triple in triples {
        let student_id = match student_ids.get(triple.student.as_str()) {
            Some(id) => *id,
            None => {
                let student = db::find_or_create_student(conn, &triple.student)?;
                student_ids.insert(&triple.student, student.id);
                student.id
            }
        };

        let subject_id = match subject_ids.get(triple.subject.as_str()) {
            Some(id) => *id,
            None => {
                let subject = db::find_or_create_subject(conn, &triple.subject)?;
                subject_ids.insert(&triple.subject, subject.id);
                subject.id
            }
        };

        db::upsert_score(conn, student_id, subject_id, triple.score)?;
        applied += 1;
    }

    Ok(applied)
}

pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Parse, normalize and apply one upload atomically.
///
/// Either every triple (plus the audit event) is committed, or nothing is.
pub fn import_upload(
    conn: &mut Connection,
    filename: &str,
    bytes: &[u8],
) -> Result<ImportReport, ImportError> {
    let table = parser::parse_upload(filename, bytes)?;
    let layout = detect_layout(&table.headers)?;
    debug!(
        filename,
        layout = layout.name(),
        rows = table.row_count(),
        "detected upload layout"
    );

    let normalized = normalize(&table, &layout)?;

    let tx = conn.transaction()?;
    let applied = apply_triples(&tx, &normalized.triples)?;

    let event = UploadEvent::new(
        filename,
        &content_hash(bytes),
        layout.name(),
        normalized.rows_imported,
        layout.subjects_detected(),
    );
    db::insert_upload_event(&tx, &event)?;
    tx.commit()?;

    info!(
        filename,
        upload_id = %event.upload_id,
        layout = layout.name(),
        rows_imported = normalized.rows_imported,
        scores_upserted = applied,
        "upload committed"
    );

    Ok(ImportReport {
        status: "ok".to_string(),
        rows_imported: normalized.rows_imported,
        subjects_detected: layout.subjects_detected(),
    })
}
